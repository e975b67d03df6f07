//! # quilt-sync
//!
//! The replication engine: records every local mutation as an immutable,
//! strictly-sequenced patch, folds local and remote patches into the
//! materialised tables, detects and refills sequence gaps, and keeps
//! bounded history. Single-owner core (`Replicator`) plus a dedicated
//! service thread (`ReplicationService`) for embedders that want a
//! channel-based handle.

pub mod apply;
pub mod engine;
pub mod gaps;
pub mod heartbeat;
pub mod metrics;
pub mod service;
pub mod session;

pub use engine::Replicator;
pub use service::{ReplicationService, ReplicatorHandle};
pub use session::SessionToken;
