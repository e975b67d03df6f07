//! Storage-layer errors for SQLite operations.

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {message}")]
    SqliteError { message: String },

    #[error("migration failed at version {version}: {message}")]
    MigrationFailed { version: u32, message: String },

    #[error("shadow table {shadow} is malformed: {reason}")]
    MalformedShadowTable { shadow: String, reason: String },

    #[error("no statement plan for table: {table}")]
    UnplannedTable { table: String },
}
