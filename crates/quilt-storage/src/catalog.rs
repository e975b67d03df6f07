//! Schema introspection.
//!
//! Every replicated table `T` must be declared alongside a shadow table
//! `T_patches` whose columns are `_patchedAt, _sequenceId, _peerId` plus
//! the union of `T`'s columns. The catalog walk discovers these pairs and
//! derives the key/non-key split the planner compiles against.

use rusqlite::Connection;
use tracing::warn;

use quilt_core::errors::StorageError;

use crate::to_storage_err;

/// Suffix marking a shadow table.
pub const SHADOW_SUFFIX: &str = "_patches";

/// The staging store is infra, not a shadow table.
pub const PENDING_TABLE: &str = "pending_patches";

pub const PATCHED_AT_COL: &str = "_patchedAt";
pub const SEQUENCE_ID_COL: &str = "_sequenceId";
pub const PEER_ID_COL: &str = "_peerId";

/// One replicated table and its shadow.
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Base (materialised) table name.
    pub table: String,
    /// Shadow table name (`<table>_patches`).
    pub shadow: String,
    /// Primary-key columns, in key order.
    pub pk_columns: Vec<String>,
    /// Non-key user columns.
    pub data_columns: Vec<String>,
}

impl TableSchema {
    /// All user columns, key columns first.
    pub fn user_columns(&self) -> impl Iterator<Item = &String> {
        self.pk_columns.iter().chain(self.data_columns.iter())
    }

    /// Whether a delta key maps onto this table.
    pub fn has_column(&self, name: &str) -> bool {
        self.user_columns().any(|c| c == name)
    }
}

/// Quote an identifier for SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Walk `sqlite_master` for `*_patches` tables and derive the schema of
/// each replicated pair. Shadow tables without a base table, and base
/// tables without a primary key, are skipped with a warning — the schema
/// contract requires both.
pub fn introspect(conn: &Connection) -> Result<Vec<TableSchema>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name LIKE '%\\_patches' ESCAPE '\\'
             ORDER BY name",
        )
        .map_err(to_storage_err)?;
    let shadow_names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(to_storage_err)?
        .collect::<Result<_, _>>()
        .map_err(to_storage_err)?;

    let mut schemas = Vec::new();
    for shadow in shadow_names {
        if shadow == PENDING_TABLE {
            continue;
        }
        let table = shadow[..shadow.len() - SHADOW_SUFFIX.len()].to_string();
        if table.is_empty() {
            continue;
        }

        let base_columns = table_columns(conn, &table)?;
        if base_columns.is_empty() {
            warn!(shadow, "shadow table has no base table, skipping");
            continue;
        }

        let mut pk: Vec<(i64, String)> = Vec::new();
        let mut data = Vec::new();
        for (name, pk_order) in base_columns {
            if pk_order > 0 {
                pk.push((pk_order, name));
            } else {
                data.push(name);
            }
        }
        if pk.is_empty() {
            warn!(table, "replicated table has no primary key, skipping");
            continue;
        }
        pk.sort_by_key(|(order, _)| *order);
        let schema = TableSchema {
            table,
            shadow,
            pk_columns: pk.into_iter().map(|(_, name)| name).collect(),
            data_columns: data,
        };

        validate_shadow(conn, &schema)?;
        check_patched_at_index(conn, &schema.shadow)?;
        schemas.push(schema);
    }
    Ok(schemas)
}

/// `(name, pk_order)` for every column of a table; empty if the table does
/// not exist.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, i64)>, StorageError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .map_err(to_storage_err)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?)))
        .map_err(to_storage_err)?;
    rows.collect::<Result<_, _>>().map_err(to_storage_err)
}

/// The shadow must carry the three provenance columns plus every base
/// column; anything less breaks the compiled statements.
fn validate_shadow(conn: &Connection, schema: &TableSchema) -> Result<(), StorageError> {
    let shadow_cols: Vec<String> = table_columns(conn, &schema.shadow)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let mut required: Vec<&str> = vec![PATCHED_AT_COL, SEQUENCE_ID_COL, PEER_ID_COL];
    required.extend(schema.user_columns().map(String::as_str));
    for col in required {
        if !shadow_cols.iter().any(|c| c == col) {
            return Err(StorageError::MalformedShadowTable {
                shadow: schema.shadow.clone(),
                reason: format!("missing column {col}"),
            });
        }
    }
    Ok(())
}

/// An index on `_patchedAt` keeps merge and retention scans cheap; absence
/// is tolerated but logged.
fn check_patched_at_index(conn: &Connection, shadow: &str) -> Result<(), StorageError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", quote_ident(shadow)))
        .map_err(to_storage_err)?;
    let index_names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(to_storage_err)?
        .collect::<Result<_, _>>()
        .map_err(to_storage_err)?;

    for index in index_names {
        let mut info = conn
            .prepare(&format!("PRAGMA index_info({})", quote_ident(&index)))
            .map_err(to_storage_err)?;
        let first_col: Option<String> = info
            .query_map([], |row| row.get::<_, String>(2))
            .map_err(to_storage_err)?
            .next()
            .transpose()
            .map_err(to_storage_err)?;
        if first_col.as_deref() == Some(PATCHED_AT_COL) {
            return Ok(());
        }
    }
    warn!(shadow, "no index on _patchedAt; merge scans will be slow");
    Ok(())
}
