//! peerindex-core — error taxonomy, wire formats for the control and bulk
//! planes, and configuration. All other peerindex crates depend on this one.

pub mod config;
pub mod error;
pub mod wire;

pub use error::IndexError;
pub use wire::{BulkHandshake, BulkOp, BulkStatus, Reply, Request};
