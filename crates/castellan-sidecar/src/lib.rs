//! # `Castellan` Sidecar
//!
//! Per-node process wiring for the `castellan-core` primitives.
//!
//! At start the sidecar claims exactly one credential bundle for its
//! instance, hands it to an optional installer, then schedules ACL
//! reconciliation: periodically with jitter on seed nodes, once on all
//! other nodes.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Sidecar configuration
pub mod config;
/// Error types
pub mod error;
mod sidecar;

pub use config::{ConfigError, ReconcileConfig, SidecarConfig, DEFAULT_PORTS};
pub use error::SidecarError;
pub use sidecar::{Sidecar, SidecarBuilder, SidecarHandle};
