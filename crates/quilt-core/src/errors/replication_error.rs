//! Top-level errors for the replication engine.
//! All subsystem errors convert into this via `From` impls.

use super::StorageError;

/// Errors surfaced by the replication core to callers.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("unknown table: {table}")]
    UnknownTable { table: String },

    #[error("migrations have not been run (database version is 0)")]
    MigrationsNotRun,

    #[error("replication is not initialised (no sequence restored yet)")]
    NotInitialised,

    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("unsupported message type: {kind}")]
    UnsupportedMessageType { kind: u64 },

    #[error("invalid session token")]
    InvalidSessionToken,

    #[error("timed out waiting for sequence {seq} from peer {peer}")]
    ConsistencyTimeout { peer: i64, seq: i64 },

    #[error("socket send failed for peer {peer}: {reason}")]
    SocketSend { peer: i64, reason: String },

    #[error("replication service is not running")]
    ServiceStopped,
}

/// Convenience type alias.
pub type ReplicationResult<T> = Result<T, ReplicationError>;
