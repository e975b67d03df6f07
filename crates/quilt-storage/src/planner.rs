//! Statement planner.
//!
//! Compiled once per catalog shape (after every migration): per-table SQL
//! for saving, merging, serving and expiring patches, plus global plans
//! that union every shadow store and the pending staging area. Inbound
//! deltas are projected through the planned column set — unknown keys are
//! dropped, missing keys stay null ("not touched").

use std::collections::HashMap;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};

use quilt_core::errors::StorageError;
use quilt_core::hlc::Hlc;
use quilt_core::message::Patch;
use quilt_core::peer::PeerId;
use quilt_core::ReplicationConfig;

use crate::catalog::{
    self, quote_ident, TableSchema, PATCHED_AT_COL, PEER_ID_COL, PENDING_TABLE, SEQUENCE_ID_COL,
};
use crate::to_storage_err;

/// One hole in a peer's sequence axis, as reported by the global scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapInfo {
    pub peer: PeerId,
    /// Last sequence id before the hole.
    pub seq: i64,
    /// HLC of that patch.
    pub at: Hlc,
    /// Number of consecutive missing sequence ids after `seq`.
    pub nb_missing: i64,
}

/// Compiled statements for one replicated table.
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub schema: TableSchema,
    save_sql: String,
    apply_sql: String,
    delete_old_sql: String,
    range_sql: String,
}

/// All compiled plans for the current catalog shape.
#[derive(Debug, Default)]
pub struct Planner {
    tables: HashMap<String, TablePlan>,
    list_missing_sql: String,
    last_info_sql: String,
    /// Number of unioned stores in the global plans (shadows + pending).
    union_branches: usize,
}

impl Planner {
    /// Introspect the catalog and compile every plan.
    pub fn build(conn: &Connection, config: &ReplicationConfig) -> Result<Self, StorageError> {
        let schemas = catalog::introspect(conn)?;
        let mut tables = HashMap::new();
        for schema in schemas {
            let plan = TablePlan::compile(schema, config);
            tables.insert(plan.schema.table.clone(), plan);
        }

        let mut planner = Self {
            list_missing_sql: String::new(),
            last_info_sql: String::new(),
            union_branches: tables.len() + 1,
            tables,
        };
        planner.list_missing_sql = planner.build_list_missing_sql();
        planner.last_info_sql = planner.build_last_info_sql();
        Ok(planner)
    }

    pub fn table(&self, name: &str) -> Option<&TablePlan> {
        self.tables.get(name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TablePlan> {
        self.tables.values()
    }

    /// Insert a patch into its table's shadow store. The delta is projected
    /// through the planned column set.
    pub fn save_patch(&self, conn: &Connection, patch: &Patch) -> Result<(), StorageError> {
        let plan = self
            .table(&patch.tab)
            .ok_or_else(|| StorageError::UnplannedTable {
                table: patch.tab.clone(),
            })?;

        let mut params: Vec<SqlValue> = vec![
            SqlValue::Integer(patch.at.0),
            SqlValue::Integer(patch.seq),
            SqlValue::Integer(patch.peer),
        ];
        for column in plan.schema.user_columns() {
            params.push(match patch.delta.get(column) {
                Some(value) => json_to_sql(value),
                None => SqlValue::Null,
            });
        }

        conn.prepare_cached(&plan.save_sql)
            .map_err(to_storage_err)?
            .execute(params_from_iter(params))
            .map_err(to_storage_err)?;
        Ok(())
    }

    /// Fold shadow rows at or after `from` into the materialised table.
    pub fn apply_patches(
        &self,
        conn: &Connection,
        table: &str,
        from: Hlc,
    ) -> Result<usize, StorageError> {
        let plan = self
            .table(table)
            .ok_or_else(|| StorageError::UnplannedTable {
                table: table.to_string(),
            })?;
        conn.prepare_cached(&plan.apply_sql)
            .map_err(to_storage_err)?
            .execute([from.0])
            .map_err(to_storage_err)
    }

    /// Delete shadow rows older than `cutoff` across every table. Returns
    /// the number of rows swept.
    pub fn delete_old_patches(&self, conn: &Connection, cutoff: Hlc) -> Result<usize, StorageError> {
        let mut swept = 0;
        for plan in self.tables.values() {
            swept += conn
                .prepare_cached(&plan.delete_old_sql)
                .map_err(to_storage_err)?
                .execute([cutoff.0])
                .map_err(to_storage_err)?;
        }
        Ok(swept)
    }

    /// Reconstruct the patches a producer wrote in `[min_seq..max_seq]`,
    /// ordered by sequence id, from every shadow store. Shadow rows carry no
    /// schema version, so envelopes are stamped with `ver`.
    pub fn patches_in_range(
        &self,
        conn: &Connection,
        peer: PeerId,
        min_seq: i64,
        max_seq: i64,
        ver: u32,
    ) -> Result<Vec<Patch>, StorageError> {
        let mut patches = Vec::new();
        for plan in self.tables.values() {
            let mut stmt = conn.prepare_cached(&plan.range_sql).map_err(to_storage_err)?;
            let columns: Vec<String> = plan.schema.user_columns().cloned().collect();
            let table = plan.schema.table.clone();
            let rows = stmt
                .query_map([peer, min_seq, max_seq], |row| {
                    let at: i64 = row.get(0)?;
                    let seq: i64 = row.get(1)?;
                    let mut delta = Map::new();
                    for (i, column) in columns.iter().enumerate() {
                        let value = sql_to_json(row.get_ref(i + 2)?);
                        if !value.is_null() {
                            delta.insert(column.clone(), value);
                        }
                    }
                    Ok(Patch {
                        at: Hlc(at),
                        peer,
                        seq,
                        ver,
                        tab: table.clone(),
                        delta,
                    })
                })
                .map_err(to_storage_err)?;
            for row in rows {
                patches.push(row.map_err(to_storage_err)?);
            }
        }
        patches.sort_by_key(|p| p.seq);
        Ok(patches)
    }

    /// Every hole in every peer's sequence axis, over patches at or after
    /// `from`, ordered by `(peer, seq)`.
    pub fn list_missing(&self, conn: &Connection, from: Hlc) -> Result<Vec<GapInfo>, StorageError> {
        let params = vec![from.0; self.union_branches];
        let mut stmt = conn
            .prepare_cached(&self.list_missing_sql)
            .map_err(to_storage_err)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(GapInfo {
                    peer: row.get(0)?,
                    seq: row.get(1)?,
                    at: Hlc(row.get(2)?),
                    nb_missing: row.get(3)?,
                })
            })
            .map_err(to_storage_err)?;
        rows.collect::<Result<_, _>>().map_err(to_storage_err)
    }

    /// `(MAX at, MAX seq)` over patches the given peer produced, at or
    /// after `from`. `None` when the peer has no stored patches — used to
    /// restore the local sequence counters after migration.
    pub fn last_patch_info(
        &self,
        conn: &Connection,
        peer: PeerId,
        from: Hlc,
    ) -> Result<Option<(Hlc, i64)>, StorageError> {
        let mut params = Vec::with_capacity(self.union_branches * 2);
        for _ in 0..self.union_branches {
            params.push(peer);
            params.push(from.0);
        }
        let mut stmt = conn
            .prepare_cached(&self.last_info_sql)
            .map_err(to_storage_err)?;
        let row: (Option<i64>, Option<i64>) = stmt
            .query_row(params_from_iter(params), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(to_storage_err)?;
        match row {
            (Some(at), Some(seq)) => Ok(Some((Hlc(at), seq))),
            _ => Ok(None),
        }
    }

    fn union_branch_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .tables
            .values()
            .map(|plan| quote_ident(&plan.schema.shadow))
            .collect();
        sources.sort();
        sources.push(quote_ident(PENDING_TABLE));
        sources
    }

    fn build_list_missing_sql(&self) -> String {
        let branches: Vec<String> = self
            .union_branch_sources()
            .iter()
            .map(|source| {
                format!(
                    "SELECT {peer} AS peer, {seq} AS seq, {at} AS at FROM {source} WHERE {at} >= ?",
                    peer = quote_ident(PEER_ID_COL),
                    seq = quote_ident(SEQUENCE_ID_COL),
                    at = quote_ident(PATCHED_AT_COL),
                )
            })
            .collect();
        format!(
            "WITH all_patches(peer, seq, at) AS ({union_all}),
                  ordered AS (
                    SELECT peer, seq, at,
                           lead(seq) OVER (PARTITION BY peer ORDER BY seq) AS next_seq
                    FROM all_patches
                  )
             SELECT peer, seq, at, next_seq - seq - 1 AS nb_missing
             FROM ordered
             WHERE next_seq - seq > 1
             ORDER BY peer, seq",
            union_all = branches.join(" UNION ALL "),
        )
    }

    fn build_last_info_sql(&self) -> String {
        let branches: Vec<String> = self
            .union_branch_sources()
            .iter()
            .map(|source| {
                format!(
                    "SELECT {at} AS at, {seq} AS seq FROM {source} WHERE {peer} = ? AND {at} >= ?",
                    peer = quote_ident(PEER_ID_COL),
                    seq = quote_ident(SEQUENCE_ID_COL),
                    at = quote_ident(PATCHED_AT_COL),
                )
            })
            .collect();
        format!(
            "SELECT MAX(at), MAX(seq) FROM ({})",
            branches.join(" UNION ALL ")
        )
    }
}

impl TablePlan {
    fn compile(schema: TableSchema, config: &ReplicationConfig) -> Self {
        let shadow = quote_ident(&schema.shadow);
        let table = quote_ident(&schema.table);

        // savePatch: provenance triple plus every user column; absent delta
        // keys bind null.
        let mut insert_cols = vec![
            quote_ident(PATCHED_AT_COL),
            quote_ident(SEQUENCE_ID_COL),
            quote_ident(PEER_ID_COL),
        ];
        let mut placeholders = vec![
            config.placeholder(&schema.shadow, PATCHED_AT_COL),
            config.placeholder(&schema.shadow, SEQUENCE_ID_COL),
            config.placeholder(&schema.shadow, PEER_ID_COL),
        ];
        for column in schema.user_columns() {
            insert_cols.push(quote_ident(column));
            placeholders.push(config.placeholder(&schema.shadow, column));
        }
        let save_sql = format!(
            "INSERT INTO {shadow} ({}) VALUES ({})",
            insert_cols.join(", "),
            placeholders.join(", "),
        );

        // applyPatches: group shadow rows by key, LWW-fold every non-key
        // column, upsert into the materialised table. `coalesce` on conflict
        // keeps nulls from overwriting existing values.
        let pk_list: Vec<String> = schema.pk_columns.iter().map(|c| quote_ident(c)).collect();
        let mut select_items = pk_list.clone();
        for column in &schema.data_columns {
            select_items.push(format!(
                "keep_last({col}, {at}, {peer}, {seq}) AS {col}",
                col = quote_ident(column),
                at = quote_ident(PATCHED_AT_COL),
                peer = quote_ident(PEER_ID_COL),
                seq = quote_ident(SEQUENCE_ID_COL),
            ));
        }
        let all_cols: Vec<String> = schema.user_columns().map(|c| quote_ident(c)).collect();
        let conflict_action = if schema.data_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let updates: Vec<String> = schema
                .data_columns
                .iter()
                .map(|column| {
                    let col = quote_ident(column);
                    format!("{col} = coalesce(excluded.{col}, {table}.{col})")
                })
                .collect();
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let apply_sql = format!(
            "INSERT INTO {table} ({cols})
             SELECT {select} FROM {shadow}
             WHERE {at} >= {ph}
             GROUP BY {pks}
             ON CONFLICT({pks}) {conflict_action}",
            cols = all_cols.join(", "),
            select = select_items.join(", "),
            at = quote_ident(PATCHED_AT_COL),
            ph = config.placeholder(&schema.shadow, PATCHED_AT_COL),
            pks = pk_list.join(", "),
        );

        let delete_old_sql = format!(
            "DELETE FROM {shadow} WHERE {at} < {ph}",
            at = quote_ident(PATCHED_AT_COL),
            ph = config.placeholder(&schema.shadow, PATCHED_AT_COL),
        );

        let range_sql = format!(
            "SELECT {at}, {seq}, {cols} FROM {shadow}
             WHERE {peer} = {p1} AND {seq} BETWEEN {p2} AND {p3}
             ORDER BY {seq}",
            at = quote_ident(PATCHED_AT_COL),
            seq = quote_ident(SEQUENCE_ID_COL),
            peer = quote_ident(PEER_ID_COL),
            cols = all_cols.join(", "),
            p1 = config.placeholder(&schema.shadow, PEER_ID_COL),
            p2 = config.placeholder(&schema.shadow, SEQUENCE_ID_COL),
            p3 = config.placeholder(&schema.shadow, SEQUENCE_ID_COL),
        );

        Self {
            schema,
            save_sql,
            apply_sql,
            delete_old_sql,
            range_sql,
        }
    }
}

/// JSON delta value → SQLite value. Nested structures are stored as JSON
/// text.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// SQLite value → JSON delta value.
pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}
