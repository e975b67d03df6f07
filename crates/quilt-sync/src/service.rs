//! Channel-fronted service runtime.
//!
//! The replicator is single-owner, so the service moves it onto a
//! dedicated thread draining a bounded command channel. `recv_timeout`
//! doubles as the timer: the wait is cut to the next merge-debounce or
//! heartbeat deadline, so the engine wakes exactly when it has work.
//! Inbound socket callbacks, upserts, and admin calls all post commands
//! through a cloneable `ReplicatorHandle`.

use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use serde_json::{Map, Value};
use tracing::debug;

use quilt_core::errors::{ReplicationError, ReplicationResult};
use quilt_core::message::WireFrame;
use quilt_core::peer::PeerId;
use quilt_core::traits::transport::PeerSocket;
use quilt_storage::{Migration, MigrationReport};

use crate::engine::Replicator;
use crate::session::{parse_session_token, SessionToken};

const CHANNEL_BOUND: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_millis(250);

enum Command {
    Upsert {
        table: String,
        row: Map<String, Value>,
        reply: SyncSender<ReplicationResult<SessionToken>>,
    },
    Migrate {
        migrations: Vec<Migration>,
        reply: SyncSender<ReplicationResult<MigrationReport>>,
    },
    Inbound(WireFrame),
    AddPeer {
        peer: PeerId,
        socket: Box<dyn PeerSocket>,
    },
    PausePeer(PeerId),
    ClosePeer(PeerId),
    IsConsistent {
        peer: PeerId,
        seq: i64,
        reply: SyncSender<bool>,
    },
    Metrics {
        reply: SyncSender<String>,
    },
    NoteConsistencyTimeout,
    Shutdown,
}

/// Owns the service thread.
pub struct ReplicationService {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
    consistency_deadline_ms: u64,
    consistency_backoff_ms: u64,
}

/// Cloneable front door to the service thread.
#[derive(Clone)]
pub struct ReplicatorHandle {
    tx: Sender<Command>,
    consistency_deadline_ms: u64,
    consistency_backoff_ms: u64,
}

impl ReplicationService {
    /// Move the replicator onto its service thread.
    pub fn spawn(replicator: Replicator) -> Self {
        let consistency_deadline_ms = replicator.config.consistency_deadline_ms;
        let consistency_backoff_ms = replicator.config.consistency_backoff_ms;
        let (tx, rx) = bounded(CHANNEL_BOUND);
        let handle = thread::Builder::new()
            .name("quilt-replicator".to_string())
            .spawn(move || service_loop(replicator, rx))
            .expect("failed to spawn replication service thread");
        Self {
            tx,
            handle: Some(handle),
            consistency_deadline_ms,
            consistency_backoff_ms,
        }
    }

    pub fn handle(&self) -> ReplicatorHandle {
        ReplicatorHandle {
            tx: self.tx.clone(),
            consistency_deadline_ms: self.consistency_deadline_ms,
            consistency_backoff_ms: self.consistency_backoff_ms,
        }
    }

    /// Stop the service thread and wait for it to drain.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplicationService {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

impl ReplicatorHandle {
    fn send(&self, command: Command) -> ReplicationResult<()> {
        self.tx
            .send(command)
            .map_err(|_| ReplicationError::ServiceStopped)
    }

    pub fn upsert(
        &self,
        table: &str,
        row: Map<String, Value>,
    ) -> ReplicationResult<SessionToken> {
        let (reply, rx) = sync_channel(1);
        self.send(Command::Upsert {
            table: table.to_string(),
            row,
            reply,
        })?;
        rx.recv().map_err(|_| ReplicationError::ServiceStopped)?
    }

    pub fn migrate(&self, migrations: Vec<Migration>) -> ReplicationResult<MigrationReport> {
        let (reply, rx) = sync_channel(1);
        self.send(Command::Migrate { migrations, reply })?;
        rx.recv().map_err(|_| ReplicationError::ServiceStopped)?
    }

    /// Feed one inbound frame from a socket callback.
    pub fn inbound(&self, frame: WireFrame) -> ReplicationResult<()> {
        self.send(Command::Inbound(frame))
    }

    pub fn add_remote_peer(
        &self,
        peer: PeerId,
        socket: Box<dyn PeerSocket>,
    ) -> ReplicationResult<()> {
        self.send(Command::AddPeer { peer, socket })
    }

    pub fn pause_remote_peer(&self, peer: PeerId) -> ReplicationResult<()> {
        self.send(Command::PausePeer(peer))
    }

    pub fn close_remote_peer(&self, peer: PeerId) -> ReplicationResult<()> {
        self.send(Command::ClosePeer(peer))
    }

    pub fn is_consistent(&self, peer: PeerId, seq: i64) -> ReplicationResult<bool> {
        let (reply, rx) = sync_channel(1);
        self.send(Command::IsConsistent { peer, seq, reply })?;
        rx.recv().map_err(|_| ReplicationError::ServiceStopped)
    }

    pub fn metrics(&self) -> ReplicationResult<String> {
        let (reply, rx) = sync_channel(1);
        self.send(Command::Metrics { reply })?;
        rx.recv().map_err(|_| ReplicationError::ServiceStopped)
    }

    /// Block until the write behind `token` is readable locally, polling
    /// with exponential backoff (0, d, 2d, 4d, …) under the configured
    /// deadline. A malformed token means "no token" and passes.
    pub fn wait_consistent(&self, token: &str) -> ReplicationResult<()> {
        let Some(token) = parse_session_token(token) else {
            return Ok(());
        };
        let deadline = Instant::now() + Duration::from_millis(self.consistency_deadline_ms);
        let mut delay_ms = 0u64;
        loop {
            if self.is_consistent(token.peer, token.seq)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let _ = self.send(Command::NoteConsistencyTimeout);
                return Err(ReplicationError::ConsistencyTimeout {
                    peer: token.peer,
                    seq: token.seq,
                });
            }
            let remaining = deadline.duration_since(now);
            thread::sleep(Duration::from_millis(delay_ms).min(remaining));
            delay_ms = if delay_ms == 0 {
                self.consistency_backoff_ms
            } else {
                delay_ms.saturating_mul(2)
            };
        }
    }
}

fn service_loop(mut replicator: Replicator, rx: Receiver<Command>) {
    loop {
        let timeout = next_timeout(&mut replicator);
        match rx.recv_timeout(timeout) {
            Ok(Command::Shutdown) => {
                replicator.flush_pending_merges();
                break;
            }
            Ok(command) => {
                dispatch(&mut replicator, command);
                run_timers(&mut replicator);
            }
            Err(RecvTimeoutError::Timeout) => run_timers(&mut replicator),
            Err(RecvTimeoutError::Disconnected) => {
                replicator.flush_pending_merges();
                break;
            }
        }
    }
    debug!("replication service stopped");
}

fn dispatch(replicator: &mut Replicator, command: Command) {
    match command {
        Command::Upsert { table, row, reply } => {
            let _ = reply.send(replicator.upsert(&table, row));
        }
        Command::Migrate { migrations, reply } => {
            let _ = reply.send(replicator.migrate(&migrations));
        }
        Command::Inbound(frame) => replicator.handle_frame(&frame),
        Command::AddPeer { peer, socket } => replicator.add_remote_peer(peer, socket),
        Command::PausePeer(peer) => replicator.pause_remote_peer(peer),
        Command::ClosePeer(peer) => replicator.close_remote_peer(peer),
        Command::IsConsistent { peer, seq, reply } => {
            let _ = reply.send(replicator.is_consistent(peer, seq));
        }
        Command::Metrics { reply } => {
            let _ = reply.send(replicator.metrics_text());
        }
        Command::NoteConsistencyTimeout => replicator.note_consistency_timeout(),
        Command::Shutdown => unreachable!("handled by the loop"),
    }
}

fn run_timers(replicator: &mut Replicator) {
    let now = replicator.now_ms();
    replicator.flush_due_merges(now);
    if replicator.config.heartbeat_interval_ms > 0 {
        replicator.tick(now);
    }
}

fn next_timeout(replicator: &mut Replicator) -> Duration {
    let now = replicator.now_ms();
    match replicator.next_deadline_ms() {
        Some(deadline) => {
            // Small jitter keeps a fleet of peers from ticking in lockstep.
            let jitter: u64 = rand::thread_rng().gen_range(0..=25);
            Duration::from_millis((deadline - now).max(0) as u64 + jitter)
        }
        None => IDLE_TIMEOUT,
    }
}
