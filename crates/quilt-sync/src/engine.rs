//! The replication core.
//!
//! `Replicator` is the single owner of the database handle, the clock, the
//! peer map, and the sequence counters. Every mutation path — local upsert,
//! inbound message, heartbeat tick — takes `&mut self`, so the core needs
//! no locks; embedders either drive it from one thread or wrap it in
//! `ReplicationService`.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use quilt_core::config::ReplicationConfig;
use quilt_core::errors::{ReplicationError, ReplicationResult};
use quilt_core::hlc::{Hlc, HlcClock};
use quilt_core::message::{Message, Patch, WireFrame};
use quilt_core::peer::{self, PeerId};
use quilt_core::stats::PeerStats;
use quilt_core::traits::transport::{PeerSocket, SyncedHook};
use quilt_storage::patch_store::{self, SaveOutcome};
use quilt_storage::{connection, migrations, Migration, MigrationReport, Planner};

use crate::apply::MergeApplier;
use crate::heartbeat::HeartbeatState;
use crate::metrics::{self, Metrics, PeerLag};
use crate::session::{parse_session_token, SessionToken};

/// Everything the engine tracks about one remote peer.
pub(crate) struct PeerState {
    pub stats: PeerStats,
    pub socket: Option<Box<dyn PeerSocket>>,
    pub synced_fired: bool,
}

/// The replication engine. See the crate docs for the data flow.
pub struct Replicator {
    pub(crate) conn: Connection,
    pub(crate) config: ReplicationConfig,
    pub(crate) peer_id: PeerId,
    pub(crate) db_version: u32,
    /// -1 until the first successful `migrate`.
    pub(crate) last_sequence_id: i64,
    pub(crate) last_patch_at: Hlc,
    pub(crate) clock: HlcClock,
    pub(crate) planner: Planner,
    pub(crate) peers: HashMap<PeerId, PeerState>,
    pub(crate) applier: MergeApplier,
    pub(crate) heartbeat: HeartbeatState,
    pub(crate) metrics: Metrics,
    pub(crate) synced_hook: Option<SyncedHook>,
    wall_clock: Box<dyn FnMut() -> i64 + Send>,
}

impl Replicator {
    /// Open a file-backed replicator. The connection is prepared for
    /// replication (pragmas, `keep_last`, infra tables) and owned
    /// exclusively by the engine.
    pub fn open(
        path: &Path,
        peer_id: Option<PeerId>,
        config: ReplicationConfig,
    ) -> ReplicationResult<Self> {
        Ok(Self::from_connection(connection::open(path)?, peer_id, config))
    }

    /// Open an in-memory replicator (for testing).
    pub fn open_in_memory(
        peer_id: Option<PeerId>,
        config: ReplicationConfig,
    ) -> ReplicationResult<Self> {
        Ok(Self::from_connection(
            connection::open_in_memory()?,
            peer_id,
            config,
        ))
    }

    /// Wrap an already-prepared connection.
    pub fn from_connection(
        conn: Connection,
        peer_id: Option<PeerId>,
        config: ReplicationConfig,
    ) -> Self {
        let peer_id =
            peer_id.unwrap_or_else(|| peer::generate_peer_id(chrono::Utc::now().timestamp_millis()));
        info!(peer_id, "replicator created");
        Self {
            conn,
            config,
            peer_id,
            db_version: 0,
            last_sequence_id: -1,
            last_patch_at: Hlc(0),
            clock: HlcClock::new(),
            planner: Planner::default(),
            peers: HashMap::new(),
            applier: MergeApplier::default(),
            heartbeat: HeartbeatState::default(),
            metrics: Metrics::default(),
            synced_hook: None,
            wall_clock: Box::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replace the wall-clock source (tests drive skew through this).
    pub fn set_wall_clock(&mut self, clock: Box<dyn FnMut() -> i64 + Send>) {
        self.wall_clock = clock;
    }

    /// Register the `synced` hook, fired exactly once per peer.
    pub fn on_synced(&mut self, hook: SyncedHook) {
        self.synced_hook = Some(hook);
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn db_version(&self) -> u32 {
        self.db_version
    }

    pub fn last_sequence_id(&self) -> i64 {
        self.last_sequence_id
    }

    /// Read access to the underlying connection. The engine is the only
    /// writer; callers must not mutate replicated tables.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn now_ms(&mut self) -> i64 {
        (self.wall_clock)()
    }

    // ── migration ───────────────────────────────────────────────────────

    /// Bring the catalog to the given migration list, then re-plan
    /// statements, restore the local sequence counters, and replay staged
    /// patches whose version now matches.
    pub fn migrate(
        &mut self,
        app_migrations: &[Migration],
    ) -> ReplicationResult<MigrationReport> {
        let report = migrations::migrate(&self.conn, app_migrations)?;
        self.db_version = report.current_version;
        self.planner = Planner::build(&self.conn, &self.config)?;

        match self
            .planner
            .last_patch_info(&self.conn, self.peer_id, Hlc(0))?
        {
            Some((at, seq)) => {
                self.last_sequence_id = seq;
                self.last_patch_at = at;
            }
            None => {
                self.last_sequence_id = 0;
                self.last_patch_at = Hlc(0);
            }
        }
        info!(
            version = self.db_version,
            seq = self.last_sequence_id,
            "catalog migrated, sequence restored"
        );

        self.apply_pending_patches()?;
        Ok(report)
    }

    /// Replay staged patches that match the current schema version.
    fn apply_pending_patches(&mut self) -> ReplicationResult<()> {
        let staged = patch_store::take_pending_for_version(&self.conn, self.db_version)?;
        if staged.is_empty() {
            return Ok(());
        }
        let mut touched: HashMap<String, Hlc> = HashMap::new();
        for patch in &staged {
            if !self.planner.is_known(&patch.tab) {
                warn!(table = %patch.tab, "staged patch for unknown table, dropping");
                continue;
            }
            self.planner.save_patch(&self.conn, patch)?;
            touched
                .entry(patch.tab.clone())
                .and_modify(|lowest| *lowest = (*lowest).min(patch.at))
                .or_insert(patch.at);
        }
        for (table, from) in touched {
            self.planner.apply_patches(&self.conn, &table, from)?;
        }
        debug!(count = staged.len(), "replayed staged patches");
        Ok(())
    }

    // ── local writes ────────────────────────────────────────────────────

    /// Record a local mutation: mint an HLC, persist the patch to the
    /// shadow store, fold it into the materialised row, broadcast it, and
    /// return the session token. Returns only after the write is visible
    /// in the materialised table.
    pub fn upsert(
        &mut self,
        table: &str,
        row: Map<String, Value>,
    ) -> ReplicationResult<SessionToken> {
        if self.db_version == 0 {
            return Err(ReplicationError::MigrationsNotRun);
        }
        if self.last_sequence_id < 0 {
            return Err(ReplicationError::NotInitialised);
        }
        let Some(plan) = self.planner.table(table) else {
            return Err(ReplicationError::UnknownTable {
                table: table.to_string(),
            });
        };

        // Project the row through the planned column set: unknown keys are
        // dropped here so storage and broadcast agree.
        let delta: Map<String, Value> = row
            .into_iter()
            .filter(|(key, _)| plan.schema.has_column(key))
            .collect();

        let now = self.now_ms();
        let at = self.clock.create(now);
        let patch = Patch {
            at,
            peer: self.peer_id,
            seq: self.last_sequence_id + 1,
            ver: self.db_version,
            tab: table.to_string(),
            delta,
        };

        self.planner.save_patch(&self.conn, &patch)?;
        // The counters only advance once the shadow write is durable.
        self.last_sequence_id = patch.seq;
        self.last_patch_at = at;

        self.planner.apply_patches(&self.conn, table, at)?;
        let token = SessionToken {
            peer: self.peer_id,
            seq: patch.seq,
        };
        self.broadcast(&Message::Patch(patch));
        Ok(token)
    }

    // ── peer registry ───────────────────────────────────────────────────

    /// Register (or replace) the socket for a remote peer. Stats are
    /// zero-initialised only when the peer is new.
    pub fn add_remote_peer(&mut self, peer: PeerId, socket: Box<dyn PeerSocket>) {
        let state = self.peers.entry(peer).or_insert_with(|| PeerState {
            stats: PeerStats::default(),
            socket: None,
            synced_fired: false,
        });
        state.socket = Some(socket);
        debug!(peer, "remote peer registered");
    }

    /// Drop the socket but keep the stats.
    pub fn pause_remote_peer(&mut self, peer: PeerId) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.socket = None;
        }
    }

    /// Drop socket and stats.
    pub fn close_remote_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    // ── inbound pipeline ────────────────────────────────────────────────

    /// Decode and dispatch one inbound frame. Malformed or unknown-typed
    /// frames are logged and dropped.
    pub fn handle_frame(&mut self, frame: &WireFrame) {
        match Message::from_frame(frame) {
            Ok(message) => self.handle_message(message),
            Err(e) => debug!(error = %e, "dropping undecodable frame"),
        }
    }

    /// Dispatch one decoded message.
    pub fn handle_message(&mut self, message: Message) {
        self.metrics.messages_in += 1;
        match message {
            Message::Patch(patch) => self.handle_patch(patch),
            Message::Ping(ping) => self.handle_ping(ping),
            Message::MissingPatch(request) => {
                self.metrics.retransmission_requests_in += 1;
                self.serve_missing(&request);
            }
        }
    }

    fn handle_patch(&mut self, patch: Patch) {
        // Peer graphs can cycle; our own patches come back and must not
        // re-enter the pipeline.
        if patch.peer == self.peer_id {
            return;
        }
        let Some(update) = self.observe_message(patch.peer, patch.at, patch.seq) else {
            return;
        };
        if update == quilt_core::stats::StatsUpdate::Duplicate {
            // Already inside the guaranteed prefix: liveness was refreshed,
            // nothing to store.
            self.maybe_fire_synced(patch.peer);
            return;
        }

        let now = self.now_ms();
        match patch_store::save_patch(&self.conn, &self.planner, self.db_version, &patch) {
            Ok(SaveOutcome::Shadow) => {
                self.applier
                    .note_remote(&patch.tab, patch.at, now, self.config.patch_apply_delay_ms);
            }
            Ok(SaveOutcome::Staged) | Ok(SaveOutcome::UnknownTable) => {}
            Err(e) => warn!(error = %e, peer = patch.peer, seq = patch.seq, "failed to persist patch"),
        }
        self.maybe_fire_synced(patch.peer);
    }

    fn handle_ping(&mut self, ping: Patch) {
        if ping.peer == self.peer_id {
            return;
        }
        // Pings carry the sender's stat vector, not a row; they update our
        // view of the sender and are never stored.
        if self.observe_message(ping.peer, ping.at, ping.seq).is_some() {
            self.maybe_fire_synced(ping.peer);
        }
    }

    /// Steps shared by every inbound PATCH/PING: clock merge, unknown-peer
    /// filter, stats fold. Returns `None` when the peer is unknown.
    fn observe_message(
        &mut self,
        from: PeerId,
        at: Hlc,
        seq: i64,
    ) -> Option<quilt_core::stats::StatsUpdate> {
        self.clock.receive(at);
        self.metrics.max_drift_ms = self.metrics.max_drift_ms.max(self.clock.drift_ms());
        let now = self.now_ms();
        let Some(state) = self.peers.get_mut(&from) else {
            debug!(peer = from, "message from unknown peer, dropping");
            return None;
        };
        Some(state.stats.observe(at, seq, now))
    }

    /// Fire the `synced` hook if the peer just became contiguous and has
    /// not fired before.
    pub(crate) fn maybe_fire_synced(&mut self, peer: PeerId) {
        let fire = match self.peers.get_mut(&peer) {
            Some(state)
                if state.stats.last_seq() > 0
                    && state.stats.is_synced()
                    && !state.synced_fired =>
            {
                state.synced_fired = true;
                true
            }
            _ => false,
        };
        if fire {
            info!(peer, "peer synced");
            if let Some(hook) = &mut self.synced_hook {
                hook(peer);
            }
        }
    }

    // ── outbound ────────────────────────────────────────────────────────

    /// Send a message to every registered socket.
    pub(crate) fn broadcast(&mut self, message: &Message) {
        let frame = message.to_frame(self.config.socket_string_mode);
        for (peer, state) in &self.peers {
            if let Some(socket) = &state.socket {
                self.metrics.messages_out += 1;
                if let Err(e) = socket.send(frame.clone()) {
                    debug!(peer, error = %e, "broadcast send failed, dropping");
                }
            }
        }
    }

    // ── merge scheduling ────────────────────────────────────────────────

    /// Flush the debounced merge batch if its deadline has passed.
    pub fn flush_due_merges(&mut self, now_ms: i64) {
        if let Some(batch) = self.applier.take_due(now_ms) {
            self.run_merge_batch(batch);
        }
    }

    /// Flush the debounced merge batch unconditionally (the "next tick"
    /// boundary for embedders driving the engine directly).
    pub fn flush_pending_merges(&mut self) {
        let batch = self.applier.take_all();
        self.run_merge_batch(batch);
    }

    fn run_merge_batch(&mut self, batch: Vec<(String, Hlc)>) {
        for (table, from) in batch {
            if let Err(e) = self.planner.apply_patches(&self.conn, &table, from) {
                warn!(table = %table, error = %e, "merge pass failed");
            }
        }
    }

    /// Earliest wall-clock ms at which the engine wants to run again:
    /// the merge debounce deadline or the next heartbeat action.
    pub fn next_deadline_ms(&self) -> Option<i64> {
        let mut deadline = self.applier.next_deadline_ms();
        if self.db_version > 0 {
            if let Some(hb) = self.heartbeat.next_due_ms(self.config.heartbeat_interval_ms) {
                deadline = Some(deadline.map_or(hb, |d| d.min(hb)));
            }
        }
        deadline
    }

    // ── read-your-writes ────────────────────────────────────────────────

    /// Whether the producing peer's contiguous prefix covers `seq`. Our own
    /// writes are always consistent; an unknown peer is treated as
    /// consistent (best effort).
    pub fn is_consistent(&self, peer: PeerId, seq: i64) -> bool {
        if peer == self.peer_id {
            return self.last_sequence_id >= seq;
        }
        self.peers
            .get(&peer)
            .map_or(true, |state| state.stats.guaranteed_seq() >= seq)
    }

    /// Token-level variant: malformed tokens mean "no token" and pass.
    pub fn is_consistent_from_token(&self, token: &str) -> bool {
        match parse_session_token(token) {
            Some(token) => self.is_consistent(token.peer, token.seq),
            None => true,
        }
    }

    pub(crate) fn note_consistency_timeout(&mut self) {
        self.metrics.read_your_write_timeouts += 1;
    }

    // ── metrics ─────────────────────────────────────────────────────────

    /// Render the text exposition.
    pub fn metrics_text(&self) -> String {
        let connected = self
            .peers
            .values()
            .filter(|state| state.socket.is_some())
            .count();
        let lags: Vec<PeerLag> = self
            .peers
            .iter()
            .filter(|(_, state)| {
                state.stats.last_message_ts() > 0 && state.stats.guaranteed_at().0 > 0
            })
            .map(|(peer, state)| {
                let lag_ms = self.clock.drift_ms() + state.stats.last_message_ts()
                    - state.stats.guaranteed_at().unix_ms();
                PeerLag {
                    peer: *peer,
                    lag_seconds: lag_ms as f64 / 1000.0,
                }
            })
            .collect();
        metrics::render(&self.metrics, connected, &lags)
    }
}
