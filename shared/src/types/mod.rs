//! Data model for GPU activity correlation

pub mod activity;
pub mod ids;
pub mod metric;
pub mod placeholder;

/// Error returned when parsing one of the closed kind enums from a string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseKindError {
    pub what: &'static str,
    pub value: String,
}

impl ParseKindError {
    pub(crate) fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}
