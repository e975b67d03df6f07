//! # quilt-core
//!
//! Core types for the quilt replication engine: hybrid logical clock,
//! wire messages, per-peer sequence stats, configuration, and errors.
//! No I/O lives here — `quilt-storage` owns SQLite, `quilt-sync` owns
//! the replication pipeline.

pub mod config;
pub mod errors;
pub mod hlc;
pub mod message;
pub mod peer;
pub mod stats;
pub mod telemetry;
pub mod traits;

pub use config::ReplicationConfig;
pub use errors::{ReplicationError, ReplicationResult};
pub use hlc::{Hlc, HlcClock};
pub use message::{Message, MissingPatchRequest, Patch};
pub use peer::PeerId;
pub use stats::PeerStats;
