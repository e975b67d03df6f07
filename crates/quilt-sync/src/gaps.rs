//! Gap detection and retransmission.
//!
//! The heartbeat scan walks every shadow store (and the staging area) for
//! holes in each peer's sequence axis, asks the producing peer for the
//! missing ranges, and answers the same requests from other peers out of
//! local history. Requests are never re-broadcast.

use std::collections::HashSet;

use tracing::{debug, warn};

use quilt_core::errors::{ReplicationResult, StorageError};
use quilt_core::hlc::Hlc;
use quilt_core::message::{Message, MissingPatchRequest, Patch};
use quilt_core::peer::PeerId;
use quilt_storage::patch_store;

use crate::engine::Replicator;

impl Replicator {
    /// Heartbeat entry point: if any peer is lagging, walk the stores from
    /// the oldest guaranteed point and request what is missing.
    pub fn detect_and_request_missing(&mut self) -> ReplicationResult<()> {
        if self.db_version == 0 {
            return Ok(());
        }
        let from = self
            .peers
            .values()
            .filter(|state| state.stats.last_seq() > state.stats.guaranteed_seq())
            .map(|state| state.stats.guaranteed_at())
            .min();
        match from {
            Some(from) => self.request_missing(from),
            None => Ok(()),
        }
    }

    /// Scan for holes at or after `from` and emit `MISSING_PATCH` requests
    /// to the producing peers, bounded by the per-sweep ceiling. Peers the
    /// scan found no holes for are marked fully contiguous.
    pub fn request_missing(&mut self, from: Hlc) -> ReplicationResult<()> {
        let gaps = self.planner.list_missing(&self.conn, from)?;

        let mut bounded: HashSet<PeerId> = HashSet::new();
        let mut sent = 0usize;
        for gap in &gaps {
            if gap.peer == self.peer_id {
                // Local sequences are dense by construction; a hole here
                // means retention outran a slow reader, nothing to request.
                continue;
            }
            if bounded.insert(gap.peer) {
                // The first hole per peer bounds its safe prefix.
                if let Some(state) = self.peers.get_mut(&gap.peer) {
                    state.stats.bound_guaranteed(gap.seq, gap.at);
                }
            }
            if sent >= self.config.max_request_for_missing_patches {
                self.metrics.retransmission_requests_deferred += 1;
                continue;
            }
            let Some(state) = self.peers.get(&gap.peer) else {
                debug!(peer = gap.peer, "hole from unregistered peer, skipping");
                continue;
            };
            let Some(socket) = &state.socket else {
                // No socket for the producer: skip this round, the next
                // sweep retries.
                debug!(peer = gap.peer, "no socket for producer, deferring");
                continue;
            };
            let request = Message::MissingPatch(MissingPatchRequest {
                peer: gap.peer,
                min_seq: gap.seq + 1,
                max_seq: gap.seq + gap.nb_missing,
                for_peer: self.peer_id,
            });
            let frame = request.to_frame(self.config.socket_string_mode);
            if let Err(e) = socket.send(frame) {
                debug!(peer = gap.peer, error = %e, "missing-patch request send failed");
            }
            self.metrics.messages_out += 1;
            self.metrics.retransmission_requests_out += 1;
            sent += 1;
        }

        let caught_up: Vec<PeerId> = self
            .peers
            .iter_mut()
            .filter_map(|(peer, state)| {
                if !bounded.contains(peer) && state.stats.last_seq() > 0 {
                    state.stats.mark_caught_up();
                    Some(*peer)
                } else {
                    None
                }
            })
            .collect();
        for peer in caught_up {
            self.maybe_fire_synced(peer);
        }
        Ok(())
    }

    /// Answer a `MISSING_PATCH` request: replay matching rows from shadow
    /// and staging stores, in sequence order, to the requester's socket.
    /// Missing entries are silently skipped; an unknown requester is a
    /// no-op.
    pub(crate) fn serve_missing(&mut self, request: &MissingPatchRequest) {
        if request.max_seq < request.min_seq {
            return;
        }
        let patches = match self.collect_range(request) {
            Ok(patches) => patches,
            Err(e) => {
                warn!(error = %e, "failed to read history for retransmission");
                return;
            }
        };
        let Some(state) = self.peers.get(&request.for_peer) else {
            debug!(peer = request.for_peer, "retransmission for unknown requester, dropping");
            return;
        };
        let Some(socket) = &state.socket else {
            debug!(peer = request.for_peer, "no socket for requester, dropping");
            return;
        };

        let mode = self.config.socket_string_mode;
        let mut served = 0u64;
        for patch in patches {
            let frame = Message::Patch(patch).to_frame(mode);
            if socket.send(frame).is_ok() {
                served += 1;
            }
        }
        debug!(
            producer = request.peer,
            requester = request.for_peer,
            served,
            "answered missing-patch request"
        );
        self.metrics.messages_out += served;
    }

    fn collect_range(&self, request: &MissingPatchRequest) -> Result<Vec<Patch>, StorageError> {
        let mut patches = self.planner.patches_in_range(
            &self.conn,
            request.peer,
            request.min_seq,
            request.max_seq,
            self.db_version,
        )?;
        patches.extend(patch_store::pending_in_range(
            &self.conn,
            request.peer,
            request.min_seq,
            request.max_seq,
        )?);
        patches.sort_by_key(|patch| patch.seq);
        Ok(patches)
    }
}
