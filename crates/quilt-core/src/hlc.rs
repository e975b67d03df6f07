//! Hybrid logical clock.
//!
//! A 53-bit value: the high 40 bits are milliseconds since 2025-01-01 UTC,
//! the low 13 bits a causality counter 0..8191. Values produced locally are
//! non-decreasing, and any value minted after a `receive` is strictly
//! greater than the received one. Repeated `create` calls within one wall
//! millisecond (with no intervening receive) return the same value: local
//! order inside a millisecond is carried by the per-peer sequence id, not
//! by the clock.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Milliseconds of 2025-01-01T00:00:00Z — the clock epoch.
pub const HLC_EPOCH_MS: i64 = 1_735_689_600_000;

/// Counter width in bits.
pub const COUNTER_BITS: u32 = 13;

/// Largest counter value representable (8191).
pub const COUNTER_MAX: i64 = (1 << COUNTER_BITS) - 1;

/// A hybrid logical timestamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Hlc(pub i64);

impl Hlc {
    /// Build a timestamp from unix milliseconds and a counter.
    pub fn from_parts(unix_ms: i64, counter: i64) -> Self {
        Self(((unix_ms - HLC_EPOCH_MS) << COUNTER_BITS) | (counter & COUNTER_MAX))
    }

    /// The causality counter (low 13 bits).
    pub fn counter(self) -> i64 {
        self.0 & COUNTER_MAX
    }

    /// Milliseconds since the clock epoch (high 40 bits).
    pub fn timestamp(self) -> i64 {
        self.0 >> COUNTER_BITS
    }

    /// Wall-clock unix milliseconds of the timestamp component.
    pub fn unix_ms(self) -> i64 {
        self.timestamp() + HLC_EPOCH_MS
    }
}

/// Clock state for one peer. Single-owner: all minting and merging happens
/// on the replication task.
#[derive(Debug, Default)]
pub struct HlcClock {
    highest_remote: Hlc,
    counter: i64,
    drift: i64,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a timestamp for a local write. `now_unix_ms` is injected so the
    /// engine owns the wall-clock source.
    pub fn create(&mut self, now_unix_ms: i64) -> Hlc {
        let now = Hlc::from_parts(now_unix_ms, 0);
        if now > self.highest_remote {
            self.counter = 0;
            return now;
        }
        self.counter += 1;
        self.drift = self.highest_remote.0 - now.0;
        if self.counter > COUNTER_MAX {
            // Never fatal: the value is emitted anyway and ordering degrades
            // to the sequence id within this millisecond.
            warn!(counter = self.counter, "hlc counter overflow");
        }
        Hlc(self.highest_remote.0 + self.counter)
    }

    /// Merge a remote timestamp. The counter resets only when the remote's
    /// millisecond component advances past everything seen so far.
    pub fn receive(&mut self, remote: Hlc) {
        if remote > self.highest_remote {
            if remote.timestamp() > self.highest_remote.timestamp() {
                self.counter = 0;
            }
            self.highest_remote = remote;
        }
    }

    /// Highest remote timestamp merged so far.
    pub fn highest_remote(&self) -> Hlc {
        self.highest_remote
    }

    /// Observed clock drift behind the remote frontier, in milliseconds.
    pub fn drift_ms(&self) -> i64 {
        self.drift >> COUNTER_BITS
    }
}
