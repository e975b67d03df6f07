//! Debounced merge scheduling.
//!
//! Local writes merge synchronously; remote traffic is coalesced per
//! table. The applier tracks the minimum `_patchedAt` among patches that
//! arrived since the last flush, so a burst of N inbound patches between
//! two yield points produces exactly one merge pass whose lower bound is
//! the minimum among them.

use std::collections::HashMap;

use quilt_core::hlc::Hlc;

/// Per-table debounce state for remote merge passes.
#[derive(Debug, Default)]
pub struct MergeApplier {
    /// Minimum `_patchedAt` per table since the last flush.
    pending: HashMap<String, Hlc>,
    /// Wall-clock ms at which the next flush is due.
    deadline_ms: Option<i64>,
}

impl MergeApplier {
    /// Note one inbound shadow write. The first note after a flush arms the
    /// timer; later notes only lower the per-table bound.
    pub fn note_remote(&mut self, table: &str, at: Hlc, now_ms: i64, delay_ms: u64) {
        self.pending
            .entry(table.to_string())
            .and_modify(|lowest| *lowest = (*lowest).min(at))
            .or_insert(at);
        if self.deadline_ms.is_none() {
            self.deadline_ms = Some(now_ms + delay_ms as i64);
        }
    }

    /// When the next flush is due, if anything is pending.
    pub fn next_deadline_ms(&self) -> Option<i64> {
        self.deadline_ms
    }

    /// Drain the batch if the deadline has passed.
    pub fn take_due(&mut self, now_ms: i64) -> Option<Vec<(String, Hlc)>> {
        match self.deadline_ms {
            Some(deadline) if deadline <= now_ms => Some(self.drain()),
            _ => None,
        }
    }

    /// Drain the batch unconditionally.
    pub fn take_all(&mut self) -> Vec<(String, Hlc)> {
        self.drain()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn drain(&mut self) -> Vec<(String, Hlc)> {
        self.deadline_ms = None;
        self.pending.drain().collect()
    }
}
