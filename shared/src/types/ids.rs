//! Identifier types
//!
//! Correlation ids tie the CPU-side submission of a GPU operation to the
//! completion record that arrives later on another thread. Ids produced by the
//! thread-embedded scheme carry the submitting thread in their high bits:
//!
//! ```text
//!  63            48 47                                              0
//! +----------------+-------------------------------------------------+
//! |  app thread id |                per-thread sequence              |
//! +----------------+-------------------------------------------------+
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of high bits holding the application thread id
pub const THREAD_ID_BITS: u32 = 16;

/// Number of low bits holding the per-thread sequence number
pub const SEQUENCE_BITS: u32 = 64 - THREAD_ID_BITS;

/// Mask selecting the sequence field
pub const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Numeric id of an application thread that issues GPU operations.
///
/// Assigned on first use, starting at 1. Zero never names a real thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppThreadId(pub u16);

impl AppThreadId {
    pub const NONE: AppThreadId = AppThreadId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for AppThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Opaque 64-bit correlation identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Reported by vendors that could not supply an id
    pub const SENTINEL: CorrelationId = CorrelationId(0);

    /// Pack a thread id and a sequence number into one id.
    ///
    /// Sequence bits above [`SEQUENCE_BITS`] are discarded.
    pub fn pack(thread: AppThreadId, sequence: u64) -> Self {
        CorrelationId(((thread.0 as u64) << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK))
    }

    /// Thread id embedded in the high bits.
    ///
    /// Only meaningful for ids produced by the thread-embedded scheme.
    pub fn thread_id(self) -> AppThreadId {
        AppThreadId((self.0 >> SEQUENCE_BITS) as u16)
    }

    pub fn sequence(self) -> u64 {
        self.0 & SEQUENCE_MASK
    }

    pub fn is_sentinel(self) -> bool {
        self.0 == 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(v: u64) -> Self {
        CorrelationId(v)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Load module identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u16);

impl ModuleId {
    /// Reserved module holding synthetic placeholder frames
    pub const PLACEHOLDER: ModuleId = ModuleId(u16::MAX);

    /// Module of the null ip
    pub const NULL: ModuleId = ModuleId(0);
}

/// Instruction pointer expressed relative to its load module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NormalizedIp {
    pub module: ModuleId,
    pub offset: u64,
}

impl NormalizedIp {
    pub const NULL: NormalizedIp = NormalizedIp {
        module: ModuleId::NULL,
        offset: 0,
    };

    pub fn new(module: ModuleId, offset: u64) -> Self {
        Self { module, offset }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for NormalizedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.module.0, self.offset)
    }
}

/// Handle of a node owned by the calling-context tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);
