//! GPU activity correlation library
//!
//! Binds each GPU operation submitted by an application thread to the calling
//! context it was submitted from, and attributes the operation's completion
//! records, delivered later on vendor threads, back to that context.

pub mod activity_channel;
pub mod app_thread;
pub mod attribution;
pub mod cct;
pub mod config;
pub mod correlation_id;
pub mod engine;
pub mod error;
pub mod host_map;
pub mod metrics;
pub mod multiplexer;
pub mod placeholders;
pub mod stats;

pub use cct::{CallingContextTree, ContextCapture, ContextTree, MetricSink, ModuleIgnoreSet, ThreadStackCapture};
pub use config::{AttributionSite, Backend, Config, IdScheme, MapRegime};
pub use engine::{CorrelationEngine, Submission};
pub use error::{CorrelationError, Result};
pub use stats::{encode_stats, DropReason, StatsSnapshot};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panicking holder cannot leave these structures half-updated, so poisoned
// locks are taken over rather than propagated.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
