//! Activity resolution
//!
//! Runs on the monitor thread. A completed record is matched against its
//! host-correlation entry, the CCT node it belongs to is chosen (inserting
//! instruction-level children where needed), and the entry's lifetime is
//! advanced. Metric values are applied later, when the initiator's activity
//! channel is drained (see [`crate::metrics`]).

use crate::activity_channel::ActivityChannel;
use crate::cct::CallingContextTree;
use crate::host_map::{HostCorrelationEntry, HostCorrelationMap, VendorCorrelationMap};
use crate::placeholders::kernel_function_node;
use crate::stats::DropReason;
use gpucorr_shared::{
    ActivityDetails, ActivityKind, CorrelationId, GpuActivity, GpuOpCcts, MemcpyKind, MemoryOp,
    NodeId, NormalizedIp, PlaceholderKind,
};
use std::sync::Arc;
use tracing::trace;

/// Outcome of resolving one record
#[derive(Debug)]
pub enum Resolution {
    /// Record carries its CCT node and should be pushed to `channel`
    Resolved {
        channel: Arc<ActivityChannel>,
        activity: GpuActivity,
    },
    /// Record only updated pipeline state
    Consumed,
    Dropped(DropReason),
}

/// Whether a record is the operation's own completion, which consumes the
/// host entry, or a secondary record that only reads it
pub fn is_primary(kind: ActivityKind) -> bool {
    matches!(
        kind,
        ActivityKind::Kernel
            | ActivityKind::Memcpy
            | ActivityKind::Memset
            | ActivityKind::Memory
            | ActivityKind::Synchronization
    )
}

/// Resolves completed records against host-correlation entries
pub struct Resolver {
    cct: Arc<dyn CallingContextTree>,
    host_map: Arc<HostCorrelationMap>,
    vendor_map: Option<Arc<VendorCorrelationMap>>,
}

impl Resolver {
    pub fn new(
        cct: Arc<dyn CallingContextTree>,
        host_map: Arc<HostCorrelationMap>,
        vendor_map: Option<Arc<VendorCorrelationMap>>,
    ) -> Self {
        Self {
            cct,
            host_map,
            vendor_map,
        }
    }

    pub fn resolve(&self, initiator: Option<Arc<ActivityChannel>>, mut activity: GpuActivity) -> Resolution {
        match &activity.details {
            ActivityDetails::ExternalCorrelation(ext) => {
                if let Some(vendor) = &self.vendor_map {
                    vendor.insert(ext.native_id, ext.host_id);
                }
                return Resolution::Consumed;
            }
            ActivityDetails::Flush(signal) => {
                return match initiator {
                    Some(channel) => Resolution::Resolved { channel, activity },
                    None => {
                        signal.signal();
                        Resolution::Consumed
                    }
                };
            }
            _ => {}
        }

        let Some(mut id) = activity.correlation_id() else {
            return Resolution::Consumed;
        };
        if id.is_sentinel() {
            return Resolution::Dropped(DropReason::Sentinel);
        }
        if activity.interval().is_some_and(|i| i.is_invalid()) {
            trace!(%id, kind = %activity.kind(), "invalid interval");
            return Resolution::Dropped(DropReason::InvalidInterval);
        }

        let native_id = match &self.vendor_map {
            Some(vendor) => {
                let Some(host_id) = vendor.translate(id.0) else {
                    trace!(native = id.0, "no external correlation for vendor id");
                    return Resolution::Dropped(DropReason::UnknownCorrelation);
                };
                activity.set_correlation_id(host_id);
                let native = id.0;
                id = host_id;
                Some(native)
            }
            None => None,
        };

        let kind = activity.kind();
        let entry = if is_primary(kind) {
            self.host_map.claim(id)
        } else {
            self.host_map.lookup(id)
        };
        let Some(entry) = entry else {
            trace!(%id, %kind, "no host correlation entry");
            if let (Some(vendor), Some(native)) = (&self.vendor_map, native_id) {
                vendor.remove(native);
            }
            return Resolution::Dropped(DropReason::UnknownCorrelation);
        };

        let live = self.advance_entry(id, &entry, &activity);
        if !live {
            if let (Some(vendor), Some(native)) = (&self.vendor_map, native_id) {
                vendor.remove(native);
            }
        }

        let Some(node) = self.select_node(&entry, &activity) else {
            trace!(%id, %kind, "submission has no placeholder for record");
            return Resolution::Dropped(DropReason::NoPlaceholder);
        };

        let Some(channel) = initiator.or_else(|| entry.channel()) else {
            trace!(%id, "initiating thread is gone");
            return Resolution::Dropped(DropReason::ChannelGone);
        };

        activity.cct_node = Some(node);
        Resolution::Resolved { channel, activity }
    }

    /// Sample bookkeeping; returns whether the entry is still live
    fn advance_entry(&self, id: CorrelationId, entry: &HostCorrelationEntry, activity: &GpuActivity) -> bool {
        match &activity.details {
            ActivityDetails::PcSampling(s) => self.host_map.samples_increase(id, s.samples as u64),
            ActivityDetails::PcSamplingInfo(info) => {
                self.host_map.total_samples_update(id, info.total_samples)
            }
            _ if is_primary(activity.kind()) => entry.expects_samples,
            _ => true,
        }
    }

    /// CCT node a record's metrics belong to
    pub fn select_node(&self, entry: &HostCorrelationEntry, activity: &GpuActivity) -> Option<NodeId> {
        let ccts = &entry.op_ccts;
        let launched = entry.kernel_ip;
        match &activity.details {
            ActivityDetails::Memcpy(m) => {
                let specific = match m.copy_kind {
                    MemcpyKind::HtoD | MemcpyKind::HtoA => Some(PlaceholderKind::CopyIn),
                    MemcpyKind::DtoH | MemcpyKind::AtoH => Some(PlaceholderKind::CopyOut),
                    _ => None,
                };
                specific
                    .and_then(|k| ccts.get(k))
                    .or_else(|| ccts.get(PlaceholderKind::Copy))
            }
            ActivityDetails::Memset(_) => ccts.get(PlaceholderKind::Memset),
            ActivityDetails::Memory(m) => ccts.get(match m.op {
                MemoryOp::Alloc => PlaceholderKind::Alloc,
                MemoryOp::Delete => PlaceholderKind::Delete,
            }),
            ActivityDetails::Synchronization(_) => ccts.get(PlaceholderKind::Sync),
            ActivityDetails::Kernel(k) => self.kernel_node(ccts, Some(k.kernel_first_pc), launched),
            ActivityDetails::Counter(_)
            | ActivityDetails::BlameShift(_)
            | ActivityDetails::Utilization(_)
            | ActivityDetails::PcSamplingInfo(_) => self.kernel_node(ccts, None, launched),
            ActivityDetails::PcSampling(s) => self.instruction_node(ccts, launched, s.pc),
            ActivityDetails::GlobalAccess(g) => self.instruction_node(ccts, launched, g.pc),
            ActivityDetails::LocalAccess(l) => self.instruction_node(ccts, launched, l.pc),
            ActivityDetails::Branch(b) => self.instruction_node(ccts, launched, b.pc),
            ActivityDetails::KernelBlock(b) => self.instruction_node(ccts, launched, b.pc),
            ActivityDetails::ExternalCorrelation(_) | ActivityDetails::Flush(_) => None,
        }
    }

    /// Kernel function node under the `kernel` placeholder.
    ///
    /// The function is the one the record reports, else the one launched at
    /// submission, else the first function seen under the `trace`
    /// placeholder. A reported function pc is also recorded under `trace`,
    /// which is retained for trace output.
    fn kernel_node(
        &self,
        ccts: &GpuOpCcts,
        first_pc: Option<NormalizedIp>,
        launched: Option<NormalizedIp>,
    ) -> Option<NodeId> {
        let kernel_ph = ccts.get(PlaceholderKind::Kernel)?;
        let trace_ph = ccts.get(PlaceholderKind::Trace);
        let reported = first_pc.filter(|ip| !ip.is_null());

        if let (Some(trace_ph), Some(ip)) = (trace_ph, reported) {
            let node = self.cct.insert_child(trace_ph, ip, true);
            self.cct.retain(node);
        }

        let function_ip = reported.or(launched).or_else(|| {
            trace_ph
                .and_then(|t| self.cct.first_child(t))
                .and_then(|n| self.cct.addr(n))
        });
        Some(kernel_function_node(self.cct.as_ref(), kernel_ph, function_ip))
    }

    fn instruction_node(
        &self,
        ccts: &GpuOpCcts,
        launched: Option<NormalizedIp>,
        pc: NormalizedIp,
    ) -> Option<NodeId> {
        let function = self.kernel_node(ccts, None, launched)?;
        if pc.is_null() {
            return Some(function);
        }
        Some(self.cct.insert_child(function, pc, true))
    }
}
