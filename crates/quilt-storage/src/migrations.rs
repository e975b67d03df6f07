//! Migration coordinator.
//!
//! Application migrations are an ordered list of `(up, down)` SQL pairs;
//! the position in the list (1-based) is the schema version. `migrate`
//! diffs the target list against what the `migrations` table records and
//! runs the surplus `down`s in reverse or the new `up`s forward, all inside
//! one transaction — a failed batch leaves the catalog untouched.

use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use quilt_core::errors::StorageError;

use crate::to_storage_err;

/// One versioned schema change.
#[derive(Debug, Clone)]
pub struct Migration {
    pub up: String,
    pub down: String,
}

/// Versions before and after a `migrate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub current_version: u32,
    pub previous_version: u32,
}

/// Create the two infra tables if absent. User tables are the embedding
/// application's responsibility, declared through its migration list.
pub fn ensure_infra_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
             id INTEGER PRIMARY KEY,
             up TEXT NOT NULL,
             down TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS pending_patches (
             \"_patchedAt\" INTEGER NOT NULL,
             \"_peerId\" INTEGER NOT NULL,
             \"_sequenceId\" INTEGER NOT NULL,
             patchVersion INTEGER NOT NULL,
             tableName TEXT NOT NULL,
             delta BLOB
         );
         CREATE INDEX IF NOT EXISTS pending_patches_patched_at
             ON pending_patches (\"_patchedAt\");",
    )
    .map_err(to_storage_err)
}

/// Highest applied migration id, 0 when none.
pub fn last_applied_id(conn: &Connection) -> Result<u32, StorageError> {
    conn.query_row("SELECT COALESCE(MAX(id), 0) FROM migrations", [], |row| {
        row.get(0)
    })
    .map_err(to_storage_err)
}

/// Bring the catalog to the version implied by `app_migrations.len()`.
///
/// Downgrades replay the stored `down` SQL of surplus rows in reverse id
/// order; upgrades run the new `up`s forward and record them. The database
/// version reported for an empty list is 1, matching the convention that
/// version 0 means "migrate was never called".
pub fn migrate(
    conn: &Connection,
    app_migrations: &[Migration],
) -> Result<MigrationReport, StorageError> {
    ensure_infra_tables(conn)?;

    let last_applied = last_applied_id(conn)?;
    let target = app_migrations.len() as u32;

    if target == last_applied {
        debug!(version = target, "catalog is up to date");
        return Ok(MigrationReport {
            current_version: target.max(1),
            previous_version: last_applied,
        });
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(to_storage_err)?;

    let result = if target < last_applied {
        info!(from = last_applied, to = target, "downgrading catalog");
        run_downs(conn, target, last_applied)
    } else {
        info!(from = last_applied, to = target, "upgrading catalog");
        run_ups(conn, app_migrations, last_applied)
    };

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT").map_err(to_storage_err)?;
            Ok(MigrationReport {
                current_version: target.max(1),
                previous_version: last_applied,
            })
        }
        Err(e) => {
            warn!(error = %e, "migration batch failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn run_downs(conn: &Connection, target: u32, last_applied: u32) -> Result<(), StorageError> {
    for id in (target + 1..=last_applied).rev() {
        let down: String = conn
            .query_row("SELECT down FROM migrations WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|e| StorageError::MigrationFailed {
                version: id,
                message: format!("missing down migration: {e}"),
            })?;
        conn.execute_batch(&down)
            .map_err(|e| StorageError::MigrationFailed {
                version: id,
                message: e.to_string(),
            })?;
        conn.execute("DELETE FROM migrations WHERE id = ?1", [id])
            .map_err(to_storage_err)?;
        debug!(id, "reverted migration");
    }
    Ok(())
}

fn run_ups(
    conn: &Connection,
    app_migrations: &[Migration],
    last_applied: u32,
) -> Result<(), StorageError> {
    for (index, migration) in app_migrations.iter().enumerate() {
        let id = index as u32 + 1;
        if id <= last_applied {
            continue;
        }
        conn.execute_batch(&migration.up)
            .map_err(|e| StorageError::MigrationFailed {
                version: id,
                message: e.to_string(),
            })?;
        conn.execute(
            "INSERT INTO migrations (id, up, down) VALUES (?1, ?2, ?3)",
            params![id, migration.up, migration.down],
        )
        .map_err(to_storage_err)?;
        debug!(id, "applied migration");
    }
    Ok(())
}
