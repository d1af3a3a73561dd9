//! Pipeline statistics
//!
//! Process-wide prometheus counters, plus a per-engine [`PipelineStats`] that
//! mirrors the same events so one engine's totals can be read back exactly.

use gpucorr_shared::ActivityKind;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// ── Attribution ──────────────────────────────────────────────────────────────

pub static ACTIVITIES_ATTRIBUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gpucorr_activities_attributed_total",
        "GPU activity records whose metrics were applied to a CCT node",
        &["kind"]
    )
    .unwrap()
});

pub static ACTIVITIES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gpucorr_activities_dropped_total",
        "GPU activity records dropped without attribution",
        &["reason"]
    )
    .unwrap()
});

// ── PC sampling ──────────────────────────────────────────────────────────────

pub static GPU_SAMPLES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gpucorr_gpu_samples_total",
        "PC samples reported by sampling summaries"
    )
    .unwrap()
});

pub static GPU_SAMPLES_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gpucorr_gpu_samples_dropped_total",
        "PC samples the device reported as dropped"
    )
    .unwrap()
});

// ── Multiplexer ──────────────────────────────────────────────────────────────

pub static OPERATION_CHANNELS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gpucorr_operation_channels",
        "Operation channels currently registered with a multiplexer"
    )
    .unwrap()
});

pub static OPERATIONS_ENQUEUED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gpucorr_operations_enqueued_total",
        "Items pushed onto operation channels"
    )
    .unwrap()
});

/// Why a record was not attributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Vendor could not supply a correlation id
    Sentinel,
    /// Id absent from the host map (already consumed or never tracked)
    UnknownCorrelation,
    /// Interval end precedes its start
    InvalidInterval,
    /// The submission did not request a placeholder for this kind
    NoPlaceholder,
    /// The initiating thread's activity channel no longer exists
    ChannelGone,
}

impl DropReason {
    pub const ALL: [DropReason; 5] = [
        DropReason::Sentinel,
        DropReason::UnknownCorrelation,
        DropReason::InvalidInterval,
        DropReason::NoPlaceholder,
        DropReason::ChannelGone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Sentinel => "sentinel",
            DropReason::UnknownCorrelation => "unknown_correlation",
            DropReason::InvalidInterval => "invalid_interval",
            DropReason::NoPlaceholder => "no_placeholder",
            DropReason::ChannelGone => "channel_gone",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-engine counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    attributed: AtomicU64,
    dropped: [AtomicU64; 5],
    samples_total: AtomicU64,
    samples_dropped: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        OPERATIONS_ENQUEUED.inc();
    }

    pub fn record_attributed(&self, kind: ActivityKind) {
        self.attributed.fetch_add(1, Ordering::Relaxed);
        ACTIVITIES_ATTRIBUTED.with_label_values(&[kind.name()]).inc();
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
        ACTIVITIES_DROPPED.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn record_samples(&self, total: u64, dropped: u64) {
        self.samples_total.fetch_add(total, Ordering::Relaxed);
        self.samples_dropped.fetch_add(dropped, Ordering::Relaxed);
        GPU_SAMPLES_TOTAL.inc_by(total);
        GPU_SAMPLES_DROPPED.inc_by(dropped);
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            attributed: self.attributed.load(Ordering::Relaxed),
            dropped_sentinel: self.dropped(DropReason::Sentinel),
            dropped_unknown_correlation: self.dropped(DropReason::UnknownCorrelation),
            dropped_invalid_interval: self.dropped(DropReason::InvalidInterval),
            dropped_no_placeholder: self.dropped(DropReason::NoPlaceholder),
            dropped_channel_gone: self.dropped(DropReason::ChannelGone),
            samples_total: self.samples_total.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub attributed: u64,
    pub dropped_sentinel: u64,
    pub dropped_unknown_correlation: u64,
    pub dropped_invalid_interval: u64,
    pub dropped_no_placeholder: u64,
    pub dropped_channel_gone: u64,
    pub samples_total: u64,
    pub samples_dropped: u64,
}

impl StatsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_sentinel
            + self.dropped_unknown_correlation
            + self.dropped_invalid_interval
            + self.dropped_no_placeholder
            + self.dropped_channel_gone
    }
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_stats() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
