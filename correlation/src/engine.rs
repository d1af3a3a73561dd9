//! Correlation engine
//!
//! Ties the pipeline together. Application threads call
//! [`CorrelationEngine::submit`] before handing an operation to the vendor
//! runtime; vendor threads call [`CorrelationEngine::complete`] with each
//! completion record. The monitor thread resolves records against the
//! host-correlation map and routes them to the submitting thread's activity
//! channel, where metrics are applied either by the monitor or by the owning
//! thread depending on [`AttributionSite`].

use crate::activity_channel::{self, ActivityChannel};
use crate::app_thread;
use crate::attribution::{Resolution, Resolver};
use crate::cct::{CallingContextTree, ContextCapture, ContextTree, MetricSink, ModuleIgnoreSet, ThreadStackCapture};
use crate::config::{AttributionSite, Config, IdScheme};
use crate::correlation_id::IdGenerator;
use crate::error::{CorrelationError, Result};
use crate::host_map::{HostCorrelationEntry, HostCorrelationMap, VendorCorrelationMap};
use crate::metrics;
use crate::multiplexer::{OperationHandler, OperationItem, OperationMultiplexer};
use crate::placeholders::{insert_kernel_ip, insert_op_placeholders, retain_op_ccts};
use crate::stats::{DropReason, PipelineStats, StatsSnapshot};
use crossbeam::utils::Backoff;
use gpucorr_shared::utils::time::monotonic_nanos;
use gpucorr_shared::{
    ActivityDetails, ActivityKind, AppThreadId, CorrelationId, GpuActivity, GpuOpCcts, NormalizedIp,
    PlaceholderFlags, PlaceholderKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const MONITOR_THREAD_NAME: &str = "gpucorr-monitor";

/// Sleep between barrier polls once spinning has stopped paying off
const BARRIER_POLL: Duration = Duration::from_micros(50);

/// Result of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Id to hand to the vendor runtime
    pub id: CorrelationId,
    pub op_ccts: GpuOpCcts,
}

/// Apply one drained record
fn consume(sink: &dyn MetricSink, stats: &PipelineStats, pc_sample_period: u32, record: GpuActivity) {
    match &record.details {
        ActivityDetails::Flush(signal) => {
            signal.signal();
            return;
        }
        ActivityDetails::PcSamplingInfo(info) => {
            stats.record_samples(info.total_samples, info.dropped_samples);
        }
        _ => {}
    }
    if metrics::attribute(sink, &record, pc_sample_period) {
        stats.record_attributed(record.kind());
    }
}

/// Monitor-side consumer of operation items
struct MonitorHandler {
    resolver: Resolver,
    sink: Arc<dyn MetricSink>,
    stats: Arc<PipelineStats>,
    site: AttributionSite,
    pc_sample_period: u32,
    /// Channels that received records during the current sweep
    touched: HashMap<AppThreadId, Arc<ActivityChannel>>,
}

impl OperationHandler for MonitorHandler {
    fn handle(&mut self, item: OperationItem) {
        match self.resolver.resolve(item.initiator, item.activity) {
            Resolution::Resolved { channel, activity } => {
                channel.push(activity);
                if self.site == AttributionSite::Monitor {
                    self.touched.entry(channel.owner()).or_insert(channel);
                }
            }
            Resolution::Consumed => {}
            Resolution::Dropped(reason) => {
                debug!(reason = reason.as_str(), "dropped GPU activity");
                self.stats.record_dropped(reason);
            }
        }
    }

    fn end_of_pass(&mut self) {
        for (_, channel) in self.touched.drain() {
            channel.drain_all(|record| {
                consume(self.sink.as_ref(), &self.stats, self.pc_sample_period, record)
            });
        }
    }
}

/// GPU operation correlation and attribution pipeline
pub struct CorrelationEngine {
    config: Config,
    cct: Arc<dyn CallingContextTree>,
    sink: Arc<dyn MetricSink>,
    capture: Arc<dyn ContextCapture>,
    host_map: Arc<HostCorrelationMap>,
    vendor_map: Option<Arc<VendorCorrelationMap>>,
    ids: IdGenerator,
    stats: Arc<PipelineStats>,
    /// Completions pushed but not yet handled by the monitor
    queued: Arc<AtomicUsize>,
    multiplexer: OperationMultiplexer,
}

impl CorrelationEngine {
    /// Validate `config` and start the monitor thread
    pub fn new(
        config: Config,
        cct: Arc<dyn CallingContextTree>,
        sink: Arc<dyn MetricSink>,
        capture: Arc<dyn ContextCapture>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CorrelationError::InvalidConfig(e.to_string()))?;

        let host_map = Arc::new(HostCorrelationMap::from_config(&config));
        let vendor_map = config
            .backend
            .translates_vendor_ids()
            .then(|| Arc::new(VendorCorrelationMap::new()));
        let stats = Arc::new(PipelineStats::new());

        let handler = MonitorHandler {
            resolver: Resolver::new(cct.clone(), host_map.clone(), vendor_map.clone()),
            sink: sink.clone(),
            stats: stats.clone(),
            site: config.attribution_site,
            pc_sample_period: config.pc_sample_period,
            touched: HashMap::new(),
        };
        let multiplexer =
            OperationMultiplexer::start(MONITOR_THREAD_NAME, config.monitor_idle_wait(), handler)?;

        info!(
            backend = %config.backend,
            id_scheme = ?config.id_scheme(),
            regime = ?config.map_regime(),
            site = ?config.attribution_site,
            "correlation engine started"
        );

        Ok(Self {
            ids: IdGenerator::new(config.id_scheme()),
            config,
            cct,
            sink,
            capture,
            host_map,
            vendor_map,
            stats,
            queued: Arc::new(AtomicUsize::new(0)),
            multiplexer,
        })
    }

    /// Engine backed by an in-memory tree and the thread-stack capture
    pub fn with_tree(config: Config, tree: Arc<ContextTree>) -> Result<Self> {
        Self::new(config, tree.clone(), tree, Arc::new(ThreadStackCapture::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a GPU operation about to be handed to the vendor runtime.
    ///
    /// Captures the calling context, inserts one placeholder per kind in
    /// `flags` and binds a fresh correlation id to them. `kernel_ip` names
    /// the launched kernel function for kernel submissions.
    pub fn submit(&self, flags: PlaceholderFlags, kernel_ip: Option<NormalizedIp>) -> Result<Submission> {
        if self.config.attribution_site == AttributionSite::ApplicationThread {
            self.process_local_activities()?;
        }

        let thread = app_thread::current()?;
        let channel = activity_channel::current()?;
        let id = self.ids.next_id(thread);

        let cct = self.cct.as_ref();
        let context = self.capture.capture(cct, ModuleIgnoreSet::global());
        let op_ccts = insert_op_placeholders(cct, context, flags);
        if let Some(ip) = kernel_ip {
            insert_kernel_ip(cct, &op_ccts, ip);
        }
        retain_op_ccts(cct, &op_ccts);

        let mut entry = HostCorrelationEntry::new(op_ccts, monotonic_nanos(), &channel);
        if let Some(ip) = kernel_ip {
            entry = entry.with_kernel_ip(ip);
        }
        if self.config.pc_sampling && flags.is_set(PlaceholderKind::Kernel) {
            entry = entry.expecting_samples();
        }
        self.host_map.insert(id, entry)?;
        self.stats.record_submitted();

        trace!(%id, thread = %thread, "submitted GPU operation");
        Ok(Submission { id, op_ccts })
    }

    /// Hand a completion record to the monitor thread.
    ///
    /// Records with the sentinel id are counted and dropped here without
    /// touching any pipeline state.
    pub fn complete(&self, activity: GpuActivity) -> Result<()> {
        if activity.correlation_id().is_some_and(|id| id.is_sentinel()) {
            trace!(kind = %activity.kind(), "completion without correlation id");
            self.stats.record_dropped(DropReason::Sentinel);
            return Ok(());
        }

        let initiator = self.initiator_of(&activity);
        self.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self
            .multiplexer
            .push(initiator, Some(self.queued.clone()), activity)
        {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        self.stats.record_completed();
        Ok(())
    }

    /// Channel of the thread that submitted `activity`, recovered from the id
    /// alone when the id embeds its thread
    fn initiator_of(&self, activity: &GpuActivity) -> Option<Arc<ActivityChannel>> {
        if self.vendor_map.is_some() || self.ids.scheme() != IdScheme::ThreadEmbedded {
            return None;
        }
        if activity.kind() == ActivityKind::ExternalCorrelation {
            return None;
        }
        let id = activity.correlation_id()?;
        self.ids
            .extract_thread_id(id)
            .and_then(activity_channel::lookup_by_thread_id)
    }

    /// Wait until every record completed before this call has had its
    /// metrics applied to the calling thread's channel.
    pub fn flush_and_wait(&self) -> Result<()> {
        let channel = activity_channel::current()?;
        let (record, signal) = GpuActivity::flush();
        self.multiplexer.push(Some(channel.clone()), None, record)?;
        self.multiplexer.wake();

        let timeout = self.config.flush_timeout();
        let started = Instant::now();
        let backoff = Backoff::new();
        loop {
            if self.config.attribution_site == AttributionSite::ApplicationThread {
                self.drain(&channel);
            }
            if signal.is_signaled() {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                warn!(?timeout, "flush barrier timed out");
                return Err(CorrelationError::FlushTimeout(timeout));
            }
            self.pause(&backoff);
        }
    }

    /// Wait until every operation the calling thread submitted has had its
    /// host entry consumed.
    ///
    /// Metrics of the final records may still sit in the channel afterwards;
    /// follow with [`CorrelationEngine::flush_and_wait`] to apply them.
    pub fn wait_for_pending(&self) -> Result<()> {
        let Some(channel) = activity_channel::try_current() else {
            return Ok(());
        };

        let timeout = self.config.pending_timeout();
        let started = Instant::now();
        let backoff = Backoff::new();
        loop {
            if self.config.attribution_site == AttributionSite::ApplicationThread {
                self.drain(&channel);
            }
            let remaining = channel.pending_count();
            if remaining == 0 {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                warn!(remaining, ?timeout, "operations still in flight");
                return Err(CorrelationError::PendingTimeout { remaining, timeout });
            }
            self.pause(&backoff);
        }
    }

    fn pause(&self, backoff: &Backoff) {
        if backoff.is_completed() {
            self.multiplexer.wake();
            thread::sleep(BARRIER_POLL);
        } else {
            backoff.snooze();
        }
    }

    /// Apply metrics for records already routed to the calling thread.
    ///
    /// Returns the number of records drained.
    pub fn process_local_activities(&self) -> Result<usize> {
        Ok(activity_channel::try_current()
            .map(|channel| self.drain(&channel))
            .unwrap_or(0))
    }

    fn drain(&self, channel: &ActivityChannel) -> usize {
        let sink = self.sink.as_ref();
        let period = self.config.pc_sample_period;
        channel.drain_all(|record| consume(sink, &self.stats, period, record))
    }

    /// Stop the monitor after it has handled everything queued. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.multiplexer.fini()?;
        if self.config.attribution_site == AttributionSite::ApplicationThread {
            self.process_local_activities()?;
        }
        let live = self.host_map.len();
        if live > 0 {
            warn!(live, "host correlation entries never completed");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.multiplexer.is_running()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn host_map(&self) -> &HostCorrelationMap {
        &self.host_map
    }

    pub fn vendor_map(&self) -> Option<&VendorCorrelationMap> {
        self.vendor_map.as_deref()
    }

    /// Completions not yet handled by the monitor
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn operation_channels(&self) -> usize {
        self.multiplexer.channel_count()
    }
}

impl Drop for CorrelationEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("correlation engine shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use gpucorr_shared::{Interval, Kernel, Memcpy, MemcpyKind, MetricId, MetricValue, ModuleId};

    fn engine(backend: Backend, site: AttributionSite) -> (CorrelationEngine, Arc<ContextTree>) {
        let mut config = Config::for_backend(backend);
        config.attribution_site = site;
        config.flush_timeout_ms = 5_000;
        config.pending_timeout_ms = 5_000;
        let tree = Arc::new(ContextTree::new());
        let engine = CorrelationEngine::with_tree(config, tree.clone()).unwrap();
        (engine, tree)
    }

    fn kernel_flags() -> PlaceholderFlags {
        PlaceholderFlags::EMPTY
            .with(PlaceholderKind::Kernel)
            .with(PlaceholderKind::Trace)
    }

    fn kernel(id: CorrelationId) -> GpuActivity {
        GpuActivity::new(ActivityDetails::Kernel(Kernel {
            correlation_id: id,
            interval: Interval::new(0, 1_000),
            ..Default::default()
        }))
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::for_backend(Backend::Rocm);
        config.pc_sample_period = 0;
        let tree = Arc::new(ContextTree::new());
        let err = CorrelationEngine::with_tree(config, tree).err().unwrap();
        assert!(matches!(err, CorrelationError::InvalidConfig(_)));
    }

    #[test]
    fn test_submit_inserts_placeholders_and_entry() {
        let (engine, tree) = engine(Backend::Rocm, AttributionSite::Monitor);
        thread::spawn(move || {
            let ip = NormalizedIp::new(ModuleId(3), 0x40);
            let sub = engine.submit(kernel_flags(), Some(ip)).unwrap();

            let kernel_ph = sub.op_ccts.get(PlaceholderKind::Kernel).unwrap();
            assert!(tree.is_retained(kernel_ph));
            assert!(tree.child(kernel_ph, ip).is_some());
            assert!(sub.op_ccts.get(PlaceholderKind::Copy).is_none());
            assert!(engine.host_map().contains(sub.id));
            assert_eq!(engine.stats().submitted, 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_completion_is_attributed_once() {
        let (engine, tree) = engine(Backend::Rocm, AttributionSite::Monitor);
        let engine = Arc::new(engine);
        let worker = engine.clone();
        let node = thread::spawn(move || {
            let sub = worker.submit(kernel_flags(), None).unwrap();
            worker.complete(kernel(sub.id)).unwrap();
            worker.complete(kernel(sub.id)).unwrap();
            worker.wait_for_pending().unwrap();
            worker.flush_and_wait().unwrap();
            sub.op_ccts.get(PlaceholderKind::Kernel).unwrap()
        })
        .join()
        .unwrap();

        engine.shutdown().unwrap();
        assert_eq!(tree.metric(node, MetricId::KernelCount), Some(MetricValue::Int(1)));
        let stats = engine.stats();
        assert_eq!(stats.attributed, 1);
        assert_eq!(stats.dropped_unknown_correlation, 1);
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn test_application_thread_applies_metrics_on_flush() {
        let (engine, tree) = engine(Backend::Level0, AttributionSite::ApplicationThread);
        let engine = Arc::new(engine);
        let worker = engine.clone();
        let node = thread::spawn(move || {
            let flags = PlaceholderFlags::EMPTY.with(PlaceholderKind::CopyIn);
            let sub = worker.submit(flags, None).unwrap();
            worker
                .complete(GpuActivity::new(ActivityDetails::Memcpy(Memcpy {
                    correlation_id: sub.id,
                    interval: Interval::new(0, 3_000),
                    copy_kind: MemcpyKind::HtoD,
                    bytes: 512,
                    ..Default::default()
                })))
                .unwrap();
            worker.flush_and_wait().unwrap();
            sub.op_ccts.get(PlaceholderKind::CopyIn).unwrap()
        })
        .join()
        .unwrap();

        assert_eq!(
            tree.metric(node, MetricId::CopyBytes(MemcpyKind::HtoD)),
            Some(MetricValue::Int(512))
        );
        assert_eq!(tree.metric(node, MetricId::CopyTime), Some(MetricValue::Real(3.0)));
    }

    #[test]
    fn test_sentinel_is_dropped_before_the_monitor() {
        let (engine, _tree) = engine(Backend::Rocm, AttributionSite::Monitor);
        engine.complete(kernel(CorrelationId::SENTINEL)).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.dropped_sentinel, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn test_complete_after_shutdown_fails() {
        let (engine, _tree) = engine(Backend::OpenCl, AttributionSite::Monitor);
        engine.shutdown().unwrap();
        engine.shutdown().unwrap();
        assert!(!engine.is_running());
        let err = engine.complete(kernel(CorrelationId(5))).err().unwrap();
        assert!(matches!(err, CorrelationError::MultiplexerStopped));
        assert_eq!(engine.queued(), 0);
    }

    #[test]
    fn test_pending_timeout_reports_remaining() {
        let mut config = Config::for_backend(Backend::Rocm);
        config.pending_timeout_ms = 20;
        let tree = Arc::new(ContextTree::new());
        let engine = CorrelationEngine::with_tree(config, tree).unwrap();
        thread::spawn(move || {
            engine.submit(kernel_flags(), None).unwrap();
            match engine.wait_for_pending() {
                Err(CorrelationError::PendingTimeout { remaining, .. }) => assert_eq!(remaining, 1),
                other => panic!("unexpected result: {:?}", other),
            }
        })
        .join()
        .unwrap();
    }
}
