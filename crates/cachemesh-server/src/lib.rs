//! cachemesh server
//!
//! Runs one replicated cache node as a standalone process.

pub mod model;
pub mod startup;
