//! Patch persistence.
//!
//! Routes inbound patches to their shadow store, or to the
//! `pending_patches` staging area when the patch's schema version does not
//! match the local one (rolling migrations must never drop data). Ping
//! snapshots live in the staging area too, under the reserved table `_`.
//! Rows are append-only; only the retention sweep deletes them.

use rusqlite::{params, Connection};
use serde_json::Map;
use tracing::warn;

use quilt_core::errors::StorageError;
use quilt_core::hlc::Hlc;
use quilt_core::message::{Patch, PING_TABLE};
use quilt_core::peer::PeerId;

use crate::planner::Planner;
use crate::to_storage_err;

/// Where a patch ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to its table's shadow store.
    Shadow,
    /// Staged in `pending_patches` (version mismatch or ping snapshot).
    Staged,
    /// Version matched but the table is unknown — sender bug, dropped.
    UnknownTable,
}

/// Persist one patch according to its version and table.
pub fn save_patch(
    conn: &Connection,
    planner: &Planner,
    db_version: u32,
    patch: &Patch,
) -> Result<SaveOutcome, StorageError> {
    if patch.is_ping() || patch.ver != db_version {
        insert_pending(conn, patch)?;
        return Ok(SaveOutcome::Staged);
    }
    if !planner.is_known(&patch.tab) {
        warn!(table = %patch.tab, peer = patch.peer, "patch for unknown table at matching version, dropping");
        return Ok(SaveOutcome::UnknownTable);
    }
    planner.save_patch(conn, patch)?;
    Ok(SaveOutcome::Shadow)
}

/// Stage a patch in `pending_patches`, delta stored as JSON text.
pub fn insert_pending(conn: &Connection, patch: &Patch) -> Result<(), StorageError> {
    let delta = serde_json::Value::Object(patch.delta.clone()).to_string();
    conn.prepare_cached(
        "INSERT INTO pending_patches
         (\"_patchedAt\", \"_peerId\", \"_sequenceId\", patchVersion, tableName, delta)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .map_err(to_storage_err)?
    .execute(params![
        patch.at.0,
        patch.peer,
        patch.seq,
        patch.ver,
        patch.tab,
        delta
    ])
    .map_err(to_storage_err)?;
    Ok(())
}

/// Staged patches (excluding ping snapshots) whose version now matches,
/// ordered by `(peer, seq)`. Rows are removed from the staging area — the
/// caller replays them through the normal save path.
pub fn take_pending_for_version(
    conn: &Connection,
    version: u32,
) -> Result<Vec<Patch>, StorageError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT \"_patchedAt\", \"_peerId\", \"_sequenceId\", patchVersion, tableName, delta
             FROM pending_patches
             WHERE patchVersion = ?1 AND tableName != ?2
             ORDER BY \"_peerId\", \"_sequenceId\"",
        )
        .map_err(to_storage_err)?;
    let rows = stmt
        .query_map(params![version, PING_TABLE], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(to_storage_err)?;

    let mut patches = Vec::new();
    for row in rows {
        let (at, peer, seq, ver, tab, delta_text) = row.map_err(to_storage_err)?;
        let delta: Map<String, serde_json::Value> = match serde_json::from_str(&delta_text) {
            Ok(map) => map,
            Err(e) => {
                warn!(peer, seq, table = %tab, error = %e, "unparseable staged delta, skipping");
                continue;
            }
        };
        patches.push(Patch {
            at: Hlc(at),
            peer,
            seq,
            ver,
            tab,
            delta,
        });
    }

    conn.prepare_cached("DELETE FROM pending_patches WHERE patchVersion = ?1 AND tableName != ?2")
        .map_err(to_storage_err)?
        .execute(params![version, PING_TABLE])
        .map_err(to_storage_err)?;
    Ok(patches)
}

/// Staged patches a producer wrote in `[min_seq..max_seq]`, for serving
/// retransmission requests. Rows stay staged.
pub fn pending_in_range(
    conn: &Connection,
    peer: PeerId,
    min_seq: i64,
    max_seq: i64,
) -> Result<Vec<Patch>, StorageError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT \"_patchedAt\", \"_sequenceId\", patchVersion, tableName, delta
             FROM pending_patches
             WHERE \"_peerId\" = ?1 AND \"_sequenceId\" BETWEEN ?2 AND ?3
             ORDER BY \"_sequenceId\"",
        )
        .map_err(to_storage_err)?;
    let rows = stmt
        .query_map(params![peer, min_seq, max_seq], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(to_storage_err)?;

    let mut patches = Vec::new();
    for row in rows {
        let (at, seq, ver, tab, delta_text) = row.map_err(to_storage_err)?;
        let delta = serde_json::from_str(&delta_text).unwrap_or_default();
        patches.push(Patch {
            at: Hlc(at),
            peer,
            seq,
            ver,
            tab,
            delta,
        });
    }
    Ok(patches)
}

/// Retention sweep: drop shadow and staged rows older than `cutoff`.
/// Returns the number of rows deleted.
pub fn sweep(conn: &Connection, planner: &Planner, cutoff: Hlc) -> Result<usize, StorageError> {
    let mut swept = planner.delete_old_patches(conn, cutoff)?;
    swept += conn
        .prepare_cached("DELETE FROM pending_patches WHERE \"_patchedAt\" < ?1")
        .map_err(to_storage_err)?
        .execute([cutoff.0])
        .map_err(to_storage_err)?;
    Ok(swept)
}
