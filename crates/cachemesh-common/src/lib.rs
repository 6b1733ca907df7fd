//! cachemesh Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used across all cachemesh components:
//! - Error taxonomy for discovery, payload encoding and remote calls
//! - Utility functions

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{CacheMeshError, Result};
pub use utils::{current_time_millis, local_ip};
