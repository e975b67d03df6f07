//! Connection setup: pragmas, the LWW aggregate, infra tables.
//!
//! The replication core owns its connection exclusively; no external writer
//! may touch replicated tables. WAL + NORMAL sync is the supported mode.

use std::path::Path;

use rusqlite::Connection;

use quilt_core::errors::StorageError;

use crate::{aggregate, migrations, to_storage_err};

/// Open a file-backed database ready for replication: pragmas applied,
/// `keep_last` registered, infra tables present.
pub fn open(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path).map_err(to_storage_err)?;
    prepare(conn)
}

/// Open an in-memory database (for testing).
pub fn open_in_memory() -> Result<Connection, StorageError> {
    let conn = Connection::open_in_memory().map_err(to_storage_err)?;
    prepare(conn)
}

fn prepare(conn: Connection) -> Result<Connection, StorageError> {
    apply_pragmas(&conn)?;
    aggregate::register_keep_last(&conn)?;
    migrations::ensure_infra_tables(&conn)?;
    Ok(conn)
}

/// WAL journal, NORMAL sync, busy timeout.
pub fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(to_storage_err)
}
