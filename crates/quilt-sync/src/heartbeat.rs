//! Heartbeat: retention sweep, peer-stat pings, missing-patch scan.
//!
//! Driven by `tick(now_ms)` — the service thread calls it on its timer,
//! embedders driving the engine directly call it themselves. Each tick
//! runs at most one of {retention sweep + persistent ping, plain ping} and
//! at most one missing-patch scan.

use std::time::Instant;

use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use quilt_core::hlc::Hlc;
use quilt_core::message::{Message, Patch, PING_TABLE};
use quilt_storage::patch_store;

use crate::engine::Replicator;

/// Retention sweeps run hourly, give or take the jitter.
const SWEEP_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Sweep jitter band: ±5 minutes.
const SWEEP_JITTER_MS: i64 = 5 * 60 * 1000;

/// Timer bookkeeping for the heartbeat loop.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    last_sweep_ms: i64,
    last_ping_ms: i64,
    last_scan_ms: i64,
    sweep_jitter_ms: i64,
    started: bool,
}

impl HeartbeatState {
    /// Earliest wall-clock ms at which any heartbeat action is due.
    pub fn next_due_ms(&self, interval_ms: u64) -> Option<i64> {
        if interval_ms == 0 {
            return None;
        }
        if !self.started {
            return Some(0);
        }
        let interval = interval_ms as i64;
        let ping = self.last_ping_ms + interval;
        let scan = self.last_scan_ms + interval;
        let sweep = self.last_sweep_ms + SWEEP_INTERVAL_MS + self.sweep_jitter_ms;
        Some(ping.min(scan).min(sweep))
    }
}

impl Replicator {
    /// Run every heartbeat action that is due at `now_ms`.
    pub fn tick(&mut self, now_ms: i64) {
        if self.db_version == 0 {
            return;
        }
        if !self.heartbeat.started {
            // First tick only arms the timers; sweeps and pings start one
            // interval later.
            self.heartbeat.started = true;
            self.heartbeat.last_sweep_ms = now_ms;
            self.heartbeat.last_ping_ms = now_ms;
            self.heartbeat.last_scan_ms = now_ms;
            self.heartbeat.sweep_jitter_ms = sweep_jitter();
            return;
        }
        let interval = self.config.heartbeat_interval_ms as i64;

        let sweep_due = self.heartbeat.last_sweep_ms
            + SWEEP_INTERVAL_MS
            + self.heartbeat.sweep_jitter_ms;
        if now_ms >= sweep_due {
            self.run_retention_sweep(now_ms);
            self.heartbeat.last_sweep_ms = now_ms;
            self.heartbeat.last_ping_ms = now_ms;
            self.heartbeat.sweep_jitter_ms = sweep_jitter();
        } else if interval > 0 && now_ms - self.heartbeat.last_ping_ms >= interval {
            self.broadcast_stats_ping();
            self.heartbeat.last_ping_ms = now_ms;
        }

        if interval > 0 && now_ms - self.heartbeat.last_scan_ms >= interval {
            if let Err(e) = self.detect_and_request_missing() {
                warn!(error = %e, "missing-patch scan failed");
            }
            self.heartbeat.last_scan_ms = now_ms;
        }
    }

    /// Drop expired history everywhere, then tell every peer where we
    /// stand with a persistent ping, so the post-GC snapshot itself
    /// replicates.
    fn run_retention_sweep(&mut self, now_ms: i64) {
        let started = Instant::now();
        let cutoff = Hlc::from_parts(now_ms - self.config.max_patch_retention_ms, 0);
        match patch_store::sweep(&self.conn, &self.planner, cutoff) {
            Ok(swept) => debug!(swept, "retention sweep complete"),
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
        if let Err(e) = self.broadcast_persistent_ping(now_ms) {
            warn!(error = %e, "persistent ping failed");
        }
        self.metrics.maintenance_seconds += started.elapsed().as_secs_f64();
    }

    /// A persistent ping is a real patch on the reserved table: it takes a
    /// fresh sequence id and is stored, so it participates in gap
    /// detection like any other patch.
    pub(crate) fn broadcast_persistent_ping(
        &mut self,
        now_ms: i64,
    ) -> quilt_core::ReplicationResult<()> {
        let at = self.clock.create(now_ms);
        let patch = Patch {
            at,
            peer: self.peer_id,
            seq: self.last_sequence_id + 1,
            ver: self.db_version,
            tab: PING_TABLE.to_string(),
            delta: self.stats_delta(),
        };
        patch_store::insert_pending(&self.conn, &patch)?;
        self.last_sequence_id = patch.seq;
        self.last_patch_at = at;
        self.broadcast(&Message::Patch(patch));
        Ok(())
    }

    /// A non-persistent ping repeats the current high-water mark without
    /// allocating a sequence id and is never stored.
    pub(crate) fn broadcast_stats_ping(&mut self) {
        let ping = Patch {
            at: self.last_patch_at,
            peer: self.peer_id,
            seq: self.last_sequence_id,
            ver: self.db_version,
            tab: PING_TABLE.to_string(),
            delta: self.stats_delta(),
        };
        self.broadcast(&Message::Ping(ping));
    }

    /// The full peer-stat map, keyed by peer id.
    fn stats_delta(&self) -> Map<String, Value> {
        self.peers
            .iter()
            .map(|(peer, state)| {
                (
                    peer.to_string(),
                    serde_json::to_value(state.stats).unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

fn sweep_jitter() -> i64 {
    rand::thread_rng().gen_range(-SWEEP_JITTER_MS..=SWEEP_JITTER_MS)
}
