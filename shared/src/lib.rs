//! Shared types and utilities for gpucorr
//!
//! This crate contains the plain data model used across the correlation
//! engine and the command-line driver: identifiers, GPU activity records,
//! placeholder kinds and metric definitions.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{activity::*, ids::*, metric::*, placeholder::*};
