//! Per-peer sequence tracking.
//!
//! Each remote peer is summarised by a fixed five-element vector. The
//! guaranteed-contiguous pair only advances on gap-free progress, so
//! `guaranteed_seq == last_seq` means every patch the peer ever produced
//! (that we know of) has been received — the peer is "synced" from the
//! local point of view.

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;

/// Index of the HLC of the highest-seq patch ever seen.
pub const LAST_PATCH_AT_TIMESTAMP: usize = 0;
/// Index of the highest sequence id ever seen.
pub const LAST_SEQUENCE_ID: usize = 1;
/// Index of the HLC through which the local prefix is gap-free.
pub const GUARANTEED_CONTIGUOUS_PATCH_AT_TIMESTAMP: usize = 2;
/// Index of the highest sequence id through which the prefix is gap-free.
pub const GUARANTEED_CONTIGUOUS_SEQUENCE_ID: usize = 3;
/// Index of the wall-clock ms of the last received message (liveness).
pub const LAST_MESSAGE_TIMESTAMP: usize = 4;

/// Outcome of folding one inbound message into the stats vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsUpdate {
    /// The contiguous prefix advanced by exactly one.
    Advanced,
    /// A hole opened: the message skipped `gap - 1` sequence ids.
    GapDetected { gap: i64 },
    /// Sequence already inside the guaranteed prefix; liveness refreshed.
    Duplicate,
}

/// The five-tuple of counters for one remote peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerStats(pub [i64; 5]);

impl PeerStats {
    pub fn last_patch_at(&self) -> Hlc {
        Hlc(self.0[LAST_PATCH_AT_TIMESTAMP])
    }

    pub fn last_seq(&self) -> i64 {
        self.0[LAST_SEQUENCE_ID]
    }

    pub fn guaranteed_at(&self) -> Hlc {
        Hlc(self.0[GUARANTEED_CONTIGUOUS_PATCH_AT_TIMESTAMP])
    }

    pub fn guaranteed_seq(&self) -> i64 {
        self.0[GUARANTEED_CONTIGUOUS_SEQUENCE_ID]
    }

    pub fn last_message_ts(&self) -> i64 {
        self.0[LAST_MESSAGE_TIMESTAMP]
    }

    /// Contiguous prefix covers everything seen.
    pub fn is_synced(&self) -> bool {
        self.guaranteed_seq() == self.last_seq()
    }

    /// Fold one inbound PATCH or PING into the vector.
    pub fn observe(&mut self, at: Hlc, seq: i64, now_unix_ms: i64) -> StatsUpdate {
        self.0[LAST_MESSAGE_TIMESTAMP] = now_unix_ms;

        let gap = seq - self.guaranteed_seq();
        let outcome = if gap == 1 {
            self.0[GUARANTEED_CONTIGUOUS_SEQUENCE_ID] = seq;
            self.0[GUARANTEED_CONTIGUOUS_PATCH_AT_TIMESTAMP] = at.0;
            StatsUpdate::Advanced
        } else if gap > 1 {
            // The hole resolves only once the missing range arrives and the
            // next heartbeat scan re-walks the stores.
            StatsUpdate::GapDetected { gap }
        } else {
            StatsUpdate::Duplicate
        };

        if seq > self.last_seq() {
            self.0[LAST_SEQUENCE_ID] = seq;
            self.0[LAST_PATCH_AT_TIMESTAMP] = at.0;
        }
        outcome
    }

    /// Raise the guaranteed prefix to a known-safe bound found by the gap
    /// scan. Never lowers it.
    pub fn bound_guaranteed(&mut self, seq: i64, at: Hlc) {
        if seq > self.guaranteed_seq() {
            self.0[GUARANTEED_CONTIGUOUS_SEQUENCE_ID] = seq;
            self.0[GUARANTEED_CONTIGUOUS_PATCH_AT_TIMESTAMP] = at.0;
        }
    }

    /// Declare the peer fully caught up: the gap scan found no holes.
    pub fn mark_caught_up(&mut self) {
        self.0[GUARANTEED_CONTIGUOUS_SEQUENCE_ID] = self.0[LAST_SEQUENCE_ID];
        self.0[GUARANTEED_CONTIGUOUS_PATCH_AT_TIMESTAMP] = self.0[LAST_PATCH_AT_TIMESTAMP];
    }
}
