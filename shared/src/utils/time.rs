//! Time-related utilities

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic clock reading in nanoseconds since the first call in this process.
///
/// Used to stamp CPU-side submission times so they can be compared with each
/// other across threads.
pub fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
