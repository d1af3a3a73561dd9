//! GPU metric definitions
//!
//! Every metric is accumulated additively on a CCT node, except the sampling
//! period which is overwritten because the sampling cycle may change while the
//! program runs.

use super::activity::{GlobalAccessType, LocalAccessType, MemcpyKind, MemoryKind, StallReason, SyncKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

/// Device nanoseconds per unit of the time metrics (microseconds)
pub const TIME_SCALE_NS: f64 = 1_000.0;

/// Convert a device-clock duration to the time-metric unit
pub fn scale_time(duration_ns: u64) -> f64 {
    duration_ns as f64 / TIME_SCALE_NS
}

/// Metric identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricId {
    // Kernel execution
    KernelTime,
    KernelCount,
    KernelStaticSharedMemory,
    KernelDynamicSharedMemory,
    KernelLocalMemory,
    KernelActiveWarps,
    KernelMaxActiveWarps,
    KernelRegisters,
    KernelBlockThreads,
    KernelBlockSharedMemory,

    // Data movement and memory management
    CopyTime,
    CopyBytes(MemcpyKind),
    MemsetTime,
    MemsetBytes(MemoryKind),
    MemoryTime,
    AllocBytes(MemoryKind),
    DeleteBytes(MemoryKind),

    // Synchronization
    SyncTime,
    SyncKindTime(SyncKind),

    // PC sampling
    InstructionSamples,
    StallAll,
    Stall(StallReason),
    SamplePeriod,
    SamplesTotal,
    SamplesExpected,
    SamplesDropped,

    // Instruction-level memory and control flow
    GlobalL2Transactions(GlobalAccessType),
    GlobalL2TheoreticalTransactions(GlobalAccessType),
    GlobalBytes(GlobalAccessType),
    LocalTransactions(LocalAccessType),
    LocalTheoreticalTransactions(LocalAccessType),
    LocalBytes(LocalAccessType),
    BranchDiverged,
    BranchExecuted,

    // Hardware counters and instrumentation
    CounterCycles,
    CounterL2Hit,
    CounterL2Miss,
    BlockExecutions,
    BlockLatency,

    // Blame shifting and utilization
    BlameCpuIdle,
    BlameGpuIdle,
    UtilizationActive,
    UtilizationStalled,
    UtilizationIdle,
}

impl MetricId {
    /// Whether the metric holds a real (time) value
    pub fn is_real(&self) -> bool {
        matches!(
            self,
            MetricId::KernelTime
                | MetricId::CopyTime
                | MetricId::MemsetTime
                | MetricId::MemoryTime
                | MetricId::SyncTime
                | MetricId::SyncKindTime(_)
                | MetricId::BlameCpuIdle
                | MetricId::BlameGpuIdle
        )
    }

    /// Human readable metric name
    pub fn name(&self) -> String {
        match self {
            MetricId::KernelTime => "gpu.kernel.time_us".to_string(),
            MetricId::KernelCount => "gpu.kernel.count".to_string(),
            MetricId::KernelStaticSharedMemory => "gpu.kernel.static_smem".to_string(),
            MetricId::KernelDynamicSharedMemory => "gpu.kernel.dynamic_smem".to_string(),
            MetricId::KernelLocalMemory => "gpu.kernel.local_mem".to_string(),
            MetricId::KernelActiveWarps => "gpu.kernel.active_warps".to_string(),
            MetricId::KernelMaxActiveWarps => "gpu.kernel.max_active_warps".to_string(),
            MetricId::KernelRegisters => "gpu.kernel.registers".to_string(),
            MetricId::KernelBlockThreads => "gpu.kernel.block_threads".to_string(),
            MetricId::KernelBlockSharedMemory => "gpu.kernel.block_smem".to_string(),
            MetricId::CopyTime => "gpu.copy.time_us".to_string(),
            MetricId::CopyBytes(k) => format!("gpu.copy.bytes.{}", k),
            MetricId::MemsetTime => "gpu.memset.time_us".to_string(),
            MetricId::MemsetBytes(k) => format!("gpu.memset.bytes.{}", k),
            MetricId::MemoryTime => "gpu.memory.time_us".to_string(),
            MetricId::AllocBytes(k) => format!("gpu.alloc.bytes.{}", k),
            MetricId::DeleteBytes(k) => format!("gpu.delete.bytes.{}", k),
            MetricId::SyncTime => "gpu.sync.time_us".to_string(),
            MetricId::SyncKindTime(k) => format!("gpu.sync.time_us.{}", k),
            MetricId::InstructionSamples => "gpu.inst.samples".to_string(),
            MetricId::StallAll => "gpu.stall.all".to_string(),
            MetricId::Stall(r) => format!("gpu.stall.{}", r),
            MetricId::SamplePeriod => "gpu.sampling.period".to_string(),
            MetricId::SamplesTotal => "gpu.sampling.total".to_string(),
            MetricId::SamplesExpected => "gpu.sampling.expected".to_string(),
            MetricId::SamplesDropped => "gpu.sampling.dropped".to_string(),
            MetricId::GlobalL2Transactions(t) => format!("gpu.gmem.l2_trans.{}", t),
            MetricId::GlobalL2TheoreticalTransactions(t) => {
                format!("gpu.gmem.l2_trans_theor.{}", t)
            }
            MetricId::GlobalBytes(t) => format!("gpu.gmem.bytes.{}", t),
            MetricId::LocalTransactions(t) => format!("gpu.lmem.trans.{}", t),
            MetricId::LocalTheoreticalTransactions(t) => format!("gpu.lmem.trans_theor.{}", t),
            MetricId::LocalBytes(t) => format!("gpu.lmem.bytes.{}", t),
            MetricId::BranchDiverged => "gpu.branch.diverged".to_string(),
            MetricId::BranchExecuted => "gpu.branch.executed".to_string(),
            MetricId::CounterCycles => "gpu.counter.cycles".to_string(),
            MetricId::CounterL2Hit => "gpu.counter.l2_hit".to_string(),
            MetricId::CounterL2Miss => "gpu.counter.l2_miss".to_string(),
            MetricId::BlockExecutions => "gpu.block.executions".to_string(),
            MetricId::BlockLatency => "gpu.block.latency".to_string(),
            MetricId::BlameCpuIdle => "gpu.blame.cpu_idle_us".to_string(),
            MetricId::BlameGpuIdle => "gpu.blame.gpu_idle_us".to_string(),
            MetricId::UtilizationActive => "gpu.util.active".to_string(),
            MetricId::UtilizationStalled => "gpu.util.stalled".to_string(),
            MetricId::UtilizationIdle => "gpu.util.idle".to_string(),
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Value of one metric on one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(u64),
    Real(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Real(v) => v,
        }
    }

    /// Integer view; real values are truncated
    pub fn as_u64(&self) -> u64 {
        match *self {
            MetricValue::Int(v) => v,
            MetricValue::Real(v) => v as u64,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            MetricValue::Int(v) => v == 0,
            MetricValue::Real(v) => v == 0.0,
        }
    }
}

impl AddAssign for MetricValue {
    fn add_assign(&mut self, rhs: MetricValue) {
        *self = match (*self, rhs) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a.saturating_add(b)),
            (a, b) => MetricValue::Real(a.as_f64() + b.as_f64()),
        };
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Real(v) => write!(f, "{:.3}", v),
        }
    }
}
