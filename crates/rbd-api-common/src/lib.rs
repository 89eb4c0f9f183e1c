//! RBD API Common - Shared types and configuration
//!
//! This crate provides the data transfer types exchanged over HTTP, the
//! GB/byte unit conversion, and the layered server configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClusterBackend, ClusterConfig, Config, ServerConfig};
pub use error::{ConfigError, Result};
pub use types::*;
