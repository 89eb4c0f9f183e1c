//! RBD API cluster client
//!
//! This crate is the only place that talks to the storage cluster. The HTTP
//! layer sees the cluster through three object-safe traits that mirror the
//! shape of the RBD client library:
//!
//! ```text
//! ┌───────────────┐  open_io_context(pool)  ┌─────────────┐  open_image(..)  ┌─────────────┐
//! │    Cluster    │ ──────────────────────▶ │  IoContext  │ ───────────────▶ │ ImageHandle │
//! └───────────────┘                         └─────────────┘                  └─────────────┘
//!   process-wide,                             per request,                     per request,
//!   shared read-only                          released on drop                 closed on drop
//! ```
//!
//! # Backends
//!
//! - [`MemoryCluster`]: in-process emulation of pools, images, metadata,
//!   snapshots and clones.
//! - `RadosCluster` (feature `librbd`): librados/librbd through FFI.

pub mod client;
pub mod error;
#[cfg(feature = "librbd")]
pub mod librados;
pub mod memory;
pub mod qos;

pub use client::{Cluster, ImageHandle, IoContext};
pub use error::{ClusterError, ClusterResult};
#[cfg(feature = "librbd")]
pub use librados::RadosCluster;
pub use memory::MemoryCluster;
pub use qos::{ImageQos, QOS_BPS_LIMIT_KEY, QOS_IOPS_LIMIT_KEY};
