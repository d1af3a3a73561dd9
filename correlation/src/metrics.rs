//! GPU metric attribution
//!
//! Turns a resolved activity record into metric increments on its CCT node.
//! Durations are device nanoseconds scaled to microseconds; bytes and counts
//! are summed as integers.

use crate::cct::MetricSink;
use gpucorr_shared::{scale_time, ActivityDetails, GpuActivity, MemoryOp, MetricId, MetricValue, NodeId};

fn add_int(sink: &dyn MetricSink, node: NodeId, metric: MetricId, value: u64) {
    if value != 0 {
        sink.attribute_metric(node, metric, MetricValue::Int(value));
    }
}

fn add_time(sink: &dyn MetricSink, node: NodeId, metric: MetricId, duration_ns: u64) {
    sink.attribute_metric(node, metric, MetricValue::Real(scale_time(duration_ns)));
}

/// Apply `activity`'s metrics to its resolved node.
///
/// Returns false when the record has no node or carries no metrics.
pub fn attribute(sink: &dyn MetricSink, activity: &GpuActivity, pc_sample_period: u32) -> bool {
    let Some(node) = activity.cct_node else {
        return false;
    };
    let period = pc_sample_period.max(1) as u64;

    match &activity.details {
        ActivityDetails::Kernel(k) => {
            add_time(sink, node, MetricId::KernelTime, k.interval.duration_ns());
            add_int(sink, node, MetricId::KernelCount, 1);
            add_int(sink, node, MetricId::KernelStaticSharedMemory, k.static_shared_memory as u64);
            add_int(sink, node, MetricId::KernelDynamicSharedMemory, k.dynamic_shared_memory as u64);
            add_int(sink, node, MetricId::KernelLocalMemory, k.local_memory_total as u64);
            add_int(sink, node, MetricId::KernelActiveWarps, k.active_warps_per_sm as u64);
            add_int(sink, node, MetricId::KernelMaxActiveWarps, k.max_active_warps_per_sm as u64);
            add_int(sink, node, MetricId::KernelRegisters, k.thread_registers as u64);
            add_int(sink, node, MetricId::KernelBlockThreads, k.block_threads as u64);
            add_int(sink, node, MetricId::KernelBlockSharedMemory, k.block_shared_memory as u64);
        }
        ActivityDetails::Memcpy(m) => {
            add_time(sink, node, MetricId::CopyTime, m.interval.duration_ns());
            add_int(sink, node, MetricId::CopyBytes(m.copy_kind), m.bytes);
        }
        ActivityDetails::Memset(m) => {
            add_time(sink, node, MetricId::MemsetTime, m.interval.duration_ns());
            add_int(sink, node, MetricId::MemsetBytes(m.memory_kind), m.bytes);
        }
        ActivityDetails::Memory(m) => {
            add_time(sink, node, MetricId::MemoryTime, m.interval.duration_ns());
            let metric = match m.op {
                MemoryOp::Alloc => MetricId::AllocBytes(m.memory_kind),
                MemoryOp::Delete => MetricId::DeleteBytes(m.memory_kind),
            };
            add_int(sink, node, metric, m.bytes);
        }
        ActivityDetails::Synchronization(s) => {
            let ns = s.interval.duration_ns();
            add_time(sink, node, MetricId::SyncTime, ns);
            add_time(sink, node, MetricId::SyncKindTime(s.sync_kind), ns);
        }
        ActivityDetails::PcSampling(s) => {
            add_int(sink, node, MetricId::InstructionSamples, s.samples as u64 * period);
            let stalled = s.latency_samples as u64 * period;
            add_int(sink, node, MetricId::StallAll, stalled);
            add_int(sink, node, MetricId::Stall(s.stall_reason), stalled);
        }
        ActivityDetails::PcSamplingInfo(info) => {
            // The sampling cycle can change between kernels; keep the latest
            sink.set_metric(
                node,
                MetricId::SamplePeriod,
                MetricValue::Int(info.sampling_period_in_cycles),
            );
            add_int(sink, node, MetricId::SamplesTotal, info.total_samples);
            add_int(sink, node, MetricId::SamplesExpected, info.full_sm_samples);
            add_int(sink, node, MetricId::SamplesDropped, info.dropped_samples);
        }
        ActivityDetails::GlobalAccess(g) => {
            add_int(sink, node, MetricId::GlobalL2Transactions(g.access), g.l2_transactions);
            add_int(
                sink,
                node,
                MetricId::GlobalL2TheoreticalTransactions(g.access),
                g.theoretical_l2_transactions,
            );
            add_int(sink, node, MetricId::GlobalBytes(g.access), g.bytes);
        }
        ActivityDetails::LocalAccess(l) => {
            add_int(sink, node, MetricId::LocalTransactions(l.access), l.shared_transactions);
            add_int(
                sink,
                node,
                MetricId::LocalTheoreticalTransactions(l.access),
                l.theoretical_shared_transactions,
            );
            add_int(sink, node, MetricId::LocalBytes(l.access), l.bytes);
        }
        ActivityDetails::Branch(b) => {
            add_int(sink, node, MetricId::BranchDiverged, b.diverged as u64);
            add_int(sink, node, MetricId::BranchExecuted, b.executed as u64);
        }
        ActivityDetails::Counter(c) => {
            add_int(sink, node, MetricId::CounterCycles, c.cycles);
            add_int(sink, node, MetricId::CounterL2Hit, c.l2_cache_hit);
            add_int(sink, node, MetricId::CounterL2Miss, c.l2_cache_miss);
        }
        ActivityDetails::KernelBlock(b) => {
            add_int(sink, node, MetricId::BlockExecutions, b.execution_count);
            add_int(sink, node, MetricId::BlockLatency, b.latency);
        }
        ActivityDetails::BlameShift(b) => {
            add_time(sink, node, MetricId::BlameCpuIdle, b.cpu_idle_ns);
            add_time(sink, node, MetricId::BlameGpuIdle, b.gpu_idle_ns);
        }
        ActivityDetails::Utilization(u) => {
            add_int(sink, node, MetricId::UtilizationActive, u.active);
            add_int(sink, node, MetricId::UtilizationStalled, u.stalled);
            add_int(sink, node, MetricId::UtilizationIdle, u.idle);
        }
        ActivityDetails::ExternalCorrelation(_) | ActivityDetails::Flush(_) => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::{CallingContextTree, ContextTree};
    use gpucorr_shared::{
        CorrelationId, Interval, Kernel, Memcpy, MemcpyKind, Memory, MemoryKind, ModuleId, NormalizedIp,
        PcSampling, PcSamplingInfo, StallReason, SyncKind, Synchronization,
    };

    fn resolved(tree: &ContextTree, details: ActivityDetails) -> GpuActivity {
        let node = tree.insert_child(tree.root(), NormalizedIp::new(ModuleId(1), 1), true);
        let mut a = GpuActivity::new(details);
        a.cct_node = Some(node);
        a
    }

    #[test]
    fn test_kernel_time_and_count_accumulate() {
        let tree = ContextTree::new();
        let a = resolved(
            &tree,
            ActivityDetails::Kernel(Kernel {
                correlation_id: CorrelationId(1),
                interval: Interval::new(1_000, 3_500),
                block_threads: 128,
                ..Default::default()
            }),
        );
        assert!(attribute(&tree, &a, 1));
        assert!(attribute(&tree, &a, 1));

        let node = a.cct_node.unwrap();
        assert_eq!(tree.metric(node, MetricId::KernelCount), Some(MetricValue::Int(2)));
        assert_eq!(tree.metric(node, MetricId::KernelTime), Some(MetricValue::Real(5.0)));
        assert_eq!(tree.metric(node, MetricId::KernelBlockThreads), Some(MetricValue::Int(256)));
        // Zero-valued fields are not recorded
        assert_eq!(tree.metric(node, MetricId::KernelRegisters), None);
    }

    #[test]
    fn test_copy_bytes_by_kind() {
        let tree = ContextTree::new();
        let a = resolved(
            &tree,
            ActivityDetails::Memcpy(Memcpy {
                correlation_id: CorrelationId(1),
                interval: Interval::new(0, 2_000),
                copy_kind: MemcpyKind::DtoH,
                bytes: 4096,
                ..Default::default()
            }),
        );
        attribute(&tree, &a, 1);
        let node = a.cct_node.unwrap();
        assert_eq!(
            tree.metric(node, MetricId::CopyBytes(MemcpyKind::DtoH)),
            Some(MetricValue::Int(4096))
        );
        assert_eq!(tree.metric(node, MetricId::CopyTime), Some(MetricValue::Real(2.0)));
    }

    #[test]
    fn test_memory_and_sync() {
        let tree = ContextTree::new();
        let alloc = resolved(
            &tree,
            ActivityDetails::Memory(Memory {
                correlation_id: CorrelationId(1),
                interval: Interval::new(0, 1_000),
                device_id: 0,
                memory_kind: MemoryKind::Device,
                op: MemoryOp::Alloc,
                bytes: 1 << 20,
            }),
        );
        attribute(&tree, &alloc, 1);
        let node = alloc.cct_node.unwrap();
        assert_eq!(
            tree.metric(node, MetricId::AllocBytes(MemoryKind::Device)),
            Some(MetricValue::Int(1 << 20))
        );

        let sync = resolved(
            &tree,
            ActivityDetails::Synchronization(Synchronization {
                correlation_id: CorrelationId(2),
                interval: Interval::new(0, 500),
                sync_kind: SyncKind::Stream,
                ..Default::default()
            }),
        );
        attribute(&tree, &sync, 1);
        assert_eq!(
            tree.metric(node, MetricId::SyncKindTime(SyncKind::Stream)),
            Some(MetricValue::Real(0.5))
        );
    }

    #[test]
    fn test_pc_samples_scaled_by_period() {
        let tree = ContextTree::new();
        let a = resolved(
            &tree,
            ActivityDetails::PcSampling(PcSampling {
                correlation_id: CorrelationId(1),
                pc: NormalizedIp::new(ModuleId(2), 0x10),
                samples: 5,
                latency_samples: 2,
                stall_reason: StallReason::PipeBusy,
            }),
        );
        attribute(&tree, &a, 4);
        let node = a.cct_node.unwrap();
        assert_eq!(tree.metric(node, MetricId::InstructionSamples), Some(MetricValue::Int(20)));
        assert_eq!(tree.metric(node, MetricId::StallAll), Some(MetricValue::Int(8)));
        assert_eq!(
            tree.metric(node, MetricId::Stall(StallReason::PipeBusy)),
            Some(MetricValue::Int(8))
        );
    }

    #[test]
    fn test_sample_period_is_overwritten() {
        let tree = ContextTree::new();
        for period in [64, 256] {
            let a = resolved(
                &tree,
                ActivityDetails::PcSamplingInfo(PcSamplingInfo {
                    correlation_id: CorrelationId(1),
                    total_samples: 10,
                    sampling_period_in_cycles: period,
                    ..Default::default()
                }),
            );
            attribute(&tree, &a, 1);
        }
        let node = tree.first_child(tree.root()).unwrap();
        assert_eq!(tree.metric(node, MetricId::SamplePeriod), Some(MetricValue::Int(256)));
        assert_eq!(tree.metric(node, MetricId::SamplesTotal), Some(MetricValue::Int(20)));
    }

    #[test]
    fn test_unresolved_record_is_ignored() {
        let tree = ContextTree::new();
        let a = GpuActivity::new(ActivityDetails::Kernel(Kernel::default()));
        assert!(!attribute(&tree, &a, 1));
        assert_eq!(tree.len(), 1);
    }
}
