//! Error types for the correlation pipeline

use gpucorr_shared::CorrelationId;
use std::time::Duration;

/// Errors surfaced by the correlation engine.
///
/// Benign drops (sentinel ids, already-consumed ids) are not errors; they are
/// logged and counted in [`crate::stats`]. Everything here is either a
/// programming error in the submission wrapper or an exhausted resource, and
/// callers are expected to end the profiling session on it.
#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("correlation id {0} is already live in the host correlation map")]
    DuplicateCorrelationId(CorrelationId),

    #[error("application thread ids exhausted after {0} threads")]
    ThreadIdExhausted(u32),

    #[error("failed to spawn monitor thread")]
    MonitorSpawn(#[source] std::io::Error),

    #[error("monitor thread panicked")]
    MonitorPanicked,

    #[error("operation multiplexer has been shut down")]
    MultiplexerStopped,

    #[error("flush barrier not reached within {0:?}")]
    FlushTimeout(Duration),

    #[error("{remaining} GPU operations still in flight after {timeout:?}")]
    PendingTimeout { remaining: usize, timeout: Duration },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CorrelationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CorrelationError::DuplicateCorrelationId(CorrelationId(0x10));
        assert_eq!(
            err.to_string(),
            "correlation id 0x10 is already live in the host correlation map"
        );

        let err = CorrelationError::PendingTimeout {
            remaining: 3,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.to_string(), "3 GPU operations still in flight after 1s");
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::Other, "no threads");
        let err = CorrelationError::MonitorSpawn(io);
        assert!(err.source().is_some());
    }
}
