//! The `keep_last` LWW aggregate.
//!
//! `keep_last(value, patched_at, peer_id, sequence_id)` returns the value
//! of the row with the greatest `(patched_at, peer_id, sequence_id)` triple,
//! skipping null values unless the very first row seen is null. Null means
//! "column not touched by this patch", so a null can never displace a real
//! write. Registered in both aggregate and window form; the window form
//! recomputes per frame (the inverse step is a no-op).

use rusqlite::functions::{Aggregate, Context, FunctionFlags, WindowAggregate};
use rusqlite::types::Value;
use rusqlite::Connection;

use quilt_core::errors::StorageError;

use crate::to_storage_err;

/// Fold state: the winning triple and its value.
#[derive(Debug)]
pub struct KeepLastState {
    seen: bool,
    triple: (i64, i64, i64),
    value: Value,
}

struct KeepLast;

impl Aggregate<KeepLastState, Value> for KeepLast {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<KeepLastState> {
        Ok(KeepLastState {
            seen: false,
            triple: (0, 0, 0),
            value: Value::Null,
        })
    }

    fn step(&self, ctx: &mut Context<'_>, state: &mut KeepLastState) -> rusqlite::Result<()> {
        let value: Value = ctx.get(0)?;
        let triple: (i64, i64, i64) = (ctx.get(1)?, ctx.get(2)?, ctx.get(3)?);

        if !state.seen {
            // First row initialises state regardless of nullness.
            state.seen = true;
            state.triple = triple;
            state.value = value;
        } else if !matches!(value, Value::Null) && triple > state.triple {
            state.triple = triple;
            state.value = value;
        }
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        state: Option<KeepLastState>,
    ) -> rusqlite::Result<Value> {
        Ok(state.map(|s| s.value).unwrap_or(Value::Null))
    }
}

impl WindowAggregate<KeepLastState, Value> for KeepLast {
    fn value(&self, state: Option<&mut KeepLastState>) -> rusqlite::Result<Value> {
        Ok(state.map(|s| s.value.clone()).unwrap_or(Value::Null))
    }

    fn inverse(&self, _ctx: &mut Context<'_>, _state: &mut KeepLastState) -> rusqlite::Result<()> {
        // Frames recompute from scratch.
        Ok(())
    }
}

/// Register `keep_last` on a connection, aggregate and window form.
pub fn register_keep_last(conn: &Connection) -> Result<(), StorageError> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_window_function("keep_last", 4, flags, KeepLast)
        .map_err(to_storage_err)
}
