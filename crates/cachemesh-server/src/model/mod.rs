//! Server data models
//!
//! - `config` - command line and layered configuration loading

pub mod config;

pub use config::{Cli, ServerConfiguration};
