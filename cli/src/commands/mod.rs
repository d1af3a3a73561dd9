//! CLI command implementations

pub mod simulate;
