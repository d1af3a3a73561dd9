//! GPU activity records
//!
//! One record describes one completed GPU occurrence reported by a vendor
//! runtime. Records are produced on vendor callback threads, travel through an
//! operation channel to the monitor thread, get resolved to a CCT node and are
//! finally consumed by metric attribution.

use super::ids::{CorrelationId, NodeId, NormalizedIp};
use super::ParseKindError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Device-clock interval in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn duration_ns(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_invalid(&self) -> bool {
        self.end < self.start
    }
}

/// Device / context / stream triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
}

macro_rules! named_kind {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal { $($variant:ident => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            #[default]
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl FromStr for $name {
            type Err = ParseKindError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|k| k.name().eq_ignore_ascii_case(s))
                    .ok_or_else(|| ParseKindError::new($what, s))
            }
        }
    };
}

named_kind! {
    /// Direction of a memory copy
    MemcpyKind, "memcpy kind" {
        Unknown => "unknown",
        HtoD => "htod",
        DtoH => "dtoh",
        HtoA => "htoa",
        AtoH => "atoh",
        AtoA => "atoa",
        AtoD => "atod",
        DtoA => "dtoa",
        DtoD => "dtod",
        HtoH => "htoh",
        PtoP => "ptop",
    }
}

named_kind! {
    /// Kind of memory touched by a memset or allocation
    MemoryKind, "memory kind" {
        Unknown => "unknown",
        Pageable => "pageable",
        Pinned => "pinned",
        Device => "device",
        Array => "array",
        Managed => "managed",
        DeviceStatic => "device_static",
        ManagedStatic => "managed_static",
    }
}

named_kind! {
    /// Synchronization flavor
    SyncKind, "sync kind" {
        Unknown => "unknown",
        Event => "event",
        StreamEventWait => "stream_event_wait",
        Stream => "stream",
        Context => "context",
    }
}

named_kind! {
    /// Stall reason attached to a PC sample
    StallReason, "stall reason" {
        Invalid => "invalid",
        None => "none",
        InstFetch => "inst_fetch",
        ExecDependency => "exec_dependency",
        MemDependency => "mem_dependency",
        Texture => "texture",
        Sync => "sync",
        ConstMemDependency => "const_mem_dependency",
        PipeBusy => "pipe_busy",
        MemThrottle => "mem_throttle",
        NotSelected => "not_selected",
        Other => "other",
        Sleeping => "sleeping",
    }
}

named_kind! {
    /// Global memory access flavor
    GlobalAccessType, "global access type" {
        LoadCached => "load_cached",
        LoadUncached => "load_uncached",
        Store => "store",
    }
}

named_kind! {
    /// Shared/local memory access flavor
    LocalAccessType, "local access type" {
        Load => "load",
        Store => "store",
    }
}

/// Allocation or release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryOp {
    Alloc,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    pub correlation_id: CorrelationId,
    pub interval: Interval,
    pub stream: StreamRef,
    /// First pc of the kernel function, `NULL` when the vendor does not report it
    pub kernel_first_pc: NormalizedIp,
    pub static_shared_memory: u32,
    pub dynamic_shared_memory: u32,
    pub local_memory_total: u32,
    pub active_warps_per_sm: u32,
    pub max_active_warps_per_sm: u32,
    pub thread_registers: u32,
    pub block_threads: u32,
    pub block_shared_memory: u32,
}

/// Basic-block execution record from binary instrumentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelBlock {
    pub correlation_id: CorrelationId,
    pub pc: NormalizedIp,
    pub execution_count: u64,
    pub latency: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memcpy {
    pub correlation_id: CorrelationId,
    pub interval: Interval,
    pub stream: StreamRef,
    pub copy_kind: MemcpyKind,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memset {
    pub correlation_id: CorrelationId,
    pub interval: Interval,
    pub stream: StreamRef,
    pub memory_kind: MemoryKind,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub correlation_id: CorrelationId,
    pub interval: Interval,
    pub device_id: u32,
    pub memory_kind: MemoryKind,
    pub op: MemoryOp,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronization {
    pub correlation_id: CorrelationId,
    pub interval: Interval,
    pub context_id: u32,
    pub stream_id: u32,
    pub event_id: u32,
    pub sync_kind: SyncKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalAccess {
    pub correlation_id: CorrelationId,
    pub pc: NormalizedIp,
    pub access: GlobalAccessType,
    pub l2_transactions: u64,
    pub theoretical_l2_transactions: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAccess {
    pub correlation_id: CorrelationId,
    pub pc: NormalizedIp,
    pub access: LocalAccessType,
    pub shared_transactions: u64,
    pub theoretical_shared_transactions: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub correlation_id: CorrelationId,
    pub pc: NormalizedIp,
    pub diverged: u32,
    pub executed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcSampling {
    pub correlation_id: CorrelationId,
    pub pc: NormalizedIp,
    pub samples: u32,
    pub latency_samples: u32,
    pub stall_reason: StallReason,
}

/// Summary emitted after the last PC sample of a kernel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcSamplingInfo {
    pub correlation_id: CorrelationId,
    pub total_samples: u64,
    pub dropped_samples: u64,
    pub full_sm_samples: u64,
    pub sampling_period_in_cycles: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub correlation_id: CorrelationId,
    pub cycles: u64,
    pub l2_cache_hit: u64,
    pub l2_cache_miss: u64,
}

/// Idleness blamed on the kernel the CPU was waiting for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameShift {
    pub correlation_id: CorrelationId,
    pub cpu_idle_ns: u64,
    pub gpu_idle_ns: u64,
}

/// Execution-unit utilization sampled while a kernel ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utilization {
    pub correlation_id: CorrelationId,
    pub interval: Interval,
    pub active: u64,
    pub stalled: u64,
    pub idle: u64,
}

/// Maps a vendor-native correlation id to the host id that was pushed
/// through the vendor's external-correlation side channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCorrelation {
    pub native_id: u64,
    pub host_id: CorrelationId,
}

/// Completion flag shared between a flush requester and whoever consumes
/// the flush record
#[derive(Debug, Default)]
pub struct FlushSignal {
    done: AtomicBool,
}

impl FlushSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Kind-specific payload of a record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivityDetails {
    Kernel(Kernel),
    KernelBlock(KernelBlock),
    Memcpy(Memcpy),
    Memset(Memset),
    Memory(Memory),
    Synchronization(Synchronization),
    GlobalAccess(GlobalAccess),
    LocalAccess(LocalAccess),
    Branch(Branch),
    PcSampling(PcSampling),
    PcSamplingInfo(PcSamplingInfo),
    Counter(Counter),
    BlameShift(BlameShift),
    Utilization(Utilization),
    ExternalCorrelation(ExternalCorrelation),
    #[serde(skip)]
    Flush(Arc<FlushSignal>),
}

/// Fieldless tag of [`ActivityDetails`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Kernel,
    KernelBlock,
    Memcpy,
    Memset,
    Memory,
    Synchronization,
    GlobalAccess,
    LocalAccess,
    Branch,
    PcSampling,
    PcSamplingInfo,
    Counter,
    BlameShift,
    Utilization,
    ExternalCorrelation,
    Flush,
}

impl ActivityKind {
    pub fn name(self) -> &'static str {
        match self {
            ActivityKind::Kernel => "kernel",
            ActivityKind::KernelBlock => "kernel_block",
            ActivityKind::Memcpy => "memcpy",
            ActivityKind::Memset => "memset",
            ActivityKind::Memory => "memory",
            ActivityKind::Synchronization => "synchronization",
            ActivityKind::GlobalAccess => "global_access",
            ActivityKind::LocalAccess => "local_access",
            ActivityKind::Branch => "branch",
            ActivityKind::PcSampling => "pc_sampling",
            ActivityKind::PcSamplingInfo => "pc_sampling_info",
            ActivityKind::Counter => "counter",
            ActivityKind::BlameShift => "blame_shift",
            ActivityKind::Utilization => "utilization",
            ActivityKind::ExternalCorrelation => "external_correlation",
            ActivityKind::Flush => "flush",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A completed GPU activity plus the CCT node it resolves to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuActivity {
    pub details: ActivityDetails,

    /// Set once the record has been resolved against its submission
    pub cct_node: Option<NodeId>,
}

impl GpuActivity {
    pub fn new(details: ActivityDetails) -> Self {
        Self {
            details,
            cct_node: None,
        }
    }

    /// Barrier record; returns the record and the signal its consumer sets
    pub fn flush() -> (Self, Arc<FlushSignal>) {
        let signal = FlushSignal::new();
        (Self::new(ActivityDetails::Flush(signal.clone())), signal)
    }

    pub fn kind(&self) -> ActivityKind {
        match &self.details {
            ActivityDetails::Kernel(_) => ActivityKind::Kernel,
            ActivityDetails::KernelBlock(_) => ActivityKind::KernelBlock,
            ActivityDetails::Memcpy(_) => ActivityKind::Memcpy,
            ActivityDetails::Memset(_) => ActivityKind::Memset,
            ActivityDetails::Memory(_) => ActivityKind::Memory,
            ActivityDetails::Synchronization(_) => ActivityKind::Synchronization,
            ActivityDetails::GlobalAccess(_) => ActivityKind::GlobalAccess,
            ActivityDetails::LocalAccess(_) => ActivityKind::LocalAccess,
            ActivityDetails::Branch(_) => ActivityKind::Branch,
            ActivityDetails::PcSampling(_) => ActivityKind::PcSampling,
            ActivityDetails::PcSamplingInfo(_) => ActivityKind::PcSamplingInfo,
            ActivityDetails::Counter(_) => ActivityKind::Counter,
            ActivityDetails::BlameShift(_) => ActivityKind::BlameShift,
            ActivityDetails::Utilization(_) => ActivityKind::Utilization,
            ActivityDetails::ExternalCorrelation(_) => ActivityKind::ExternalCorrelation,
            ActivityDetails::Flush(_) => ActivityKind::Flush,
        }
    }

    /// Correlation id the record is keyed by.
    ///
    /// `None` for flush markers. External-correlation records report their
    /// host id.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        let id = match &self.details {
            ActivityDetails::Kernel(k) => k.correlation_id,
            ActivityDetails::KernelBlock(b) => b.correlation_id,
            ActivityDetails::Memcpy(m) => m.correlation_id,
            ActivityDetails::Memset(m) => m.correlation_id,
            ActivityDetails::Memory(m) => m.correlation_id,
            ActivityDetails::Synchronization(s) => s.correlation_id,
            ActivityDetails::GlobalAccess(g) => g.correlation_id,
            ActivityDetails::LocalAccess(l) => l.correlation_id,
            ActivityDetails::Branch(b) => b.correlation_id,
            ActivityDetails::PcSampling(s) => s.correlation_id,
            ActivityDetails::PcSamplingInfo(s) => s.correlation_id,
            ActivityDetails::Counter(c) => c.correlation_id,
            ActivityDetails::BlameShift(b) => b.correlation_id,
            ActivityDetails::Utilization(u) => u.correlation_id,
            ActivityDetails::ExternalCorrelation(e) => e.host_id,
            ActivityDetails::Flush(_) => return None,
        };
        Some(id)
    }

    /// Rewrite the correlation id, used when translating vendor-native ids
    pub fn set_correlation_id(&mut self, id: CorrelationId) {
        match &mut self.details {
            ActivityDetails::Kernel(k) => k.correlation_id = id,
            ActivityDetails::KernelBlock(b) => b.correlation_id = id,
            ActivityDetails::Memcpy(m) => m.correlation_id = id,
            ActivityDetails::Memset(m) => m.correlation_id = id,
            ActivityDetails::Memory(m) => m.correlation_id = id,
            ActivityDetails::Synchronization(s) => s.correlation_id = id,
            ActivityDetails::GlobalAccess(g) => g.correlation_id = id,
            ActivityDetails::LocalAccess(l) => l.correlation_id = id,
            ActivityDetails::Branch(b) => b.correlation_id = id,
            ActivityDetails::PcSampling(s) => s.correlation_id = id,
            ActivityDetails::PcSamplingInfo(s) => s.correlation_id = id,
            ActivityDetails::Counter(c) => c.correlation_id = id,
            ActivityDetails::BlameShift(b) => b.correlation_id = id,
            ActivityDetails::Utilization(u) => u.correlation_id = id,
            ActivityDetails::ExternalCorrelation(e) => e.host_id = id,
            ActivityDetails::Flush(_) => {}
        }
    }

    /// Device interval for kinds that have one
    pub fn interval(&self) -> Option<Interval> {
        match &self.details {
            ActivityDetails::Kernel(k) => Some(k.interval),
            ActivityDetails::Memcpy(m) => Some(m.interval),
            ActivityDetails::Memset(m) => Some(m.interval),
            ActivityDetails::Memory(m) => Some(m.interval),
            ActivityDetails::Synchronization(s) => Some(s.interval),
            ActivityDetails::Utilization(u) => Some(u.interval),
            _ => None,
        }
    }
}

impl From<ActivityDetails> for GpuActivity {
    fn from(details: ActivityDetails) -> Self {
        GpuActivity::new(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval() {
        let i = Interval::new(100, 350);
        assert_eq!(i.duration_ns(), 250);
        assert!(!i.is_invalid());
        assert!(Interval::new(10, 5).is_invalid());
        assert_eq!(Interval::new(10, 5).duration_ns(), 0);
        assert!(!Interval::new(7, 7).is_invalid());
    }

    #[test]
    fn test_kind_and_correlation_id() {
        let mut a = GpuActivity::new(ActivityDetails::Memcpy(Memcpy {
            correlation_id: CorrelationId(9),
            interval: Interval::new(1, 2),
            copy_kind: MemcpyKind::HtoD,
            bytes: 64,
            ..Default::default()
        }));
        assert_eq!(a.kind(), ActivityKind::Memcpy);
        assert_eq!(a.correlation_id(), Some(CorrelationId(9)));
        assert_eq!(a.interval(), Some(Interval::new(1, 2)));

        a.set_correlation_id(CorrelationId(11));
        assert_eq!(a.correlation_id(), Some(CorrelationId(11)));
    }

    #[test]
    fn test_flush_record() {
        let (record, signal) = GpuActivity::flush();
        assert_eq!(record.kind(), ActivityKind::Flush);
        assert_eq!(record.correlation_id(), None);
        assert!(!signal.is_signaled());
        if let ActivityDetails::Flush(s) = &record.details {
            s.signal();
        }
        assert!(signal.is_signaled());
    }

    #[test]
    fn test_named_kinds_parse() {
        assert_eq!("dtoh".parse::<MemcpyKind>(), Ok(MemcpyKind::DtoH));
        assert_eq!("Mem_Dependency".parse::<StallReason>(), Ok(StallReason::MemDependency));
        assert!("sideways".parse::<SyncKind>().is_err());
        assert_eq!(MemcpyKind::default(), MemcpyKind::Unknown);
    }

    #[test]
    fn test_activity_json_serialization() {
        let a = GpuActivity::new(ActivityDetails::Counter(Counter {
            correlation_id: CorrelationId(3),
            cycles: 1000,
            ..Default::default()
        }));
        let json = serde_json::to_string(&a).unwrap();
        let back: GpuActivity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), ActivityKind::Counter);
        assert_eq!(back.correlation_id(), Some(CorrelationId(3)));
    }
}
