//! Op-placeholder kinds
//!
//! A placeholder is a synthetic frame inserted under the CPU call path of a
//! GPU operation so that GPU time shows up beneath a recognizable pseudo-frame.

use super::ids::{ModuleId, NodeId, NormalizedIp};
use super::ParseKindError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of placeholder kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PlaceholderKind {
    Copy = 0,
    CopyIn = 1,
    CopyOut = 2,
    Alloc = 3,
    Delete = 4,
    Kernel = 5,
    Memset = 6,
    Sync = 7,
    Trace = 8,
}

impl PlaceholderKind {
    pub const COUNT: usize = 9;

    pub const ALL: [PlaceholderKind; Self::COUNT] = [
        PlaceholderKind::Copy,
        PlaceholderKind::CopyIn,
        PlaceholderKind::CopyOut,
        PlaceholderKind::Alloc,
        PlaceholderKind::Delete,
        PlaceholderKind::Kernel,
        PlaceholderKind::Memset,
        PlaceholderKind::Sync,
        PlaceholderKind::Trace,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            PlaceholderKind::Copy => "copy",
            PlaceholderKind::CopyIn => "copyin",
            PlaceholderKind::CopyOut => "copyout",
            PlaceholderKind::Alloc => "alloc",
            PlaceholderKind::Delete => "delete",
            PlaceholderKind::Kernel => "kernel",
            PlaceholderKind::Memset => "memset",
            PlaceholderKind::Sync => "sync",
            PlaceholderKind::Trace => "trace",
        }
    }

    /// Synthetic ip of the placeholder frame
    pub fn ip(self) -> NormalizedIp {
        NormalizedIp::new(ModuleId::PLACEHOLDER, self.index() as u64)
    }

    /// Inverse of [`PlaceholderKind::ip`]
    pub fn from_ip(ip: NormalizedIp) -> Option<Self> {
        if ip.module != ModuleId::PLACEHOLDER {
            return None;
        }
        Self::ALL.get(ip.offset as usize).copied()
    }
}

impl fmt::Display for PlaceholderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlaceholderKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlaceholderKind::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseKindError::new("placeholder kind", s))
    }
}

/// Bit set of placeholder kinds, one bit per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceholderFlags(u32);

impl PlaceholderFlags {
    pub const EMPTY: PlaceholderFlags = PlaceholderFlags(0);

    pub fn all() -> Self {
        PlaceholderFlags((1 << PlaceholderKind::COUNT) - 1)
    }

    pub fn with(mut self, kind: PlaceholderKind) -> Self {
        self.set(kind);
        self
    }

    pub fn set(&mut self, kind: PlaceholderKind) {
        self.0 |= 1 << kind.index();
    }

    pub fn is_set(&self, kind: PlaceholderKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = PlaceholderKind> + '_ {
        PlaceholderKind::ALL.into_iter().filter(|k| self.is_set(*k))
    }
}

impl FromIterator<PlaceholderKind> for PlaceholderFlags {
    fn from_iter<I: IntoIterator<Item = PlaceholderKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(PlaceholderFlags::EMPTY, |flags, kind| flags.with(kind))
    }
}

/// Placeholder nodes inserted for one submission, indexed by kind.
///
/// A slot is `Some` iff its kind was requested when the placeholders were inserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuOpCcts {
    ccts: [Option<NodeId>; PlaceholderKind::COUNT],
}

impl GpuOpCcts {
    pub fn get(&self, kind: PlaceholderKind) -> Option<NodeId> {
        self.ccts[kind.index()]
    }

    pub fn set(&mut self, kind: PlaceholderKind, node: NodeId) {
        self.ccts[kind.index()] = Some(node);
    }

    /// Flags describing which slots are populated
    pub fn flags(&self) -> PlaceholderFlags {
        PlaceholderKind::ALL
            .into_iter()
            .filter(|k| self.ccts[k.index()].is_some())
            .collect()
    }
}
