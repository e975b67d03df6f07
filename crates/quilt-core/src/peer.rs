//! Peer identity.

use rand::Rng;

use crate::hlc::{COUNTER_BITS, HLC_EPOCH_MS};

/// A peer id: a 53-bit integer, either user-supplied or generated.
/// Uniqueness is probabilistic; a collision breaks convergence.
pub type PeerId = i64;

/// Generate a peer id from the wall clock and a random low word:
/// `((wall_ms - epoch) << 13) | rand(0..8090)`.
pub fn generate_peer_id(now_unix_ms: i64) -> PeerId {
    let low: i64 = rand::thread_rng().gen_range(0..8090);
    ((now_unix_ms - HLC_EPOCH_MS) << COUNTER_BITS) | low
}
