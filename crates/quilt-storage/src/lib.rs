//! # quilt-storage
//!
//! SQLite persistence layer for the quilt replication engine.
//! WAL mode, single write connection, per-table shadow stores, a
//! schema-versioned pending staging area, compiled statement plans, and
//! the `keep_last` LWW aggregate.

pub mod aggregate;
pub mod catalog;
pub mod connection;
pub mod migrations;
pub mod patch_store;
pub mod planner;

pub use catalog::TableSchema;
pub use migrations::{Migration, MigrationReport};
pub use planner::{GapInfo, Planner};

use quilt_core::errors::StorageError;

/// Helper to convert an error message into a `StorageError`.
pub fn to_storage_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::SqliteError {
        message: e.to_string(),
    }
}
