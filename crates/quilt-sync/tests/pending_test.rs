//! Schema-version staging tests: mismatched patches park in
//! `pending_patches` and replay after the migration that understands them.

use serde_json::{json, Map, Value};

use quilt_core::hlc::Hlc;
use quilt_core::message::{Message, Patch};
use quilt_core::ReplicationConfig;
use quilt_storage::Migration;
use quilt_sync::Replicator;

use std::sync::{Arc, Mutex};

use quilt_core::errors::ReplicationError;
use quilt_core::message::WireFrame;
use quilt_core::traits::transport::PeerSocket;

#[derive(Clone, Default)]
struct MockSocket {
    sent: Arc<Mutex<Vec<WireFrame>>>,
}

impl PeerSocket for MockSocket {
    fn send(&self, frame: WireFrame) -> Result<(), ReplicationError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }
}

fn migration_v1() -> Migration {
    Migration {
        up: "CREATE TABLE testA (
                 id INTEGER NOT NULL,
                 tenantId INTEGER NOT NULL,
                 name TEXT,
                 deletedAt INTEGER,
                 createdAt INTEGER,
                 PRIMARY KEY (id, tenantId)
             );
             CREATE TABLE testA_patches (
                 \"_patchedAt\" INTEGER,
                 \"_sequenceId\" INTEGER,
                 \"_peerId\" INTEGER,
                 id INTEGER,
                 tenantId INTEGER,
                 name TEXT,
                 deletedAt INTEGER,
                 createdAt INTEGER
             );
             CREATE INDEX testA_patches_at ON testA_patches (\"_patchedAt\");"
            .to_string(),
        down: "DROP TABLE testA_patches; DROP TABLE testA;".to_string(),
    }
}

fn migration_v2() -> Migration {
    Migration {
        up: "ALTER TABLE testA ADD COLUMN note TEXT;
             ALTER TABLE testA_patches ADD COLUMN note TEXT;"
            .to_string(),
        down: "ALTER TABLE testA_patches DROP COLUMN note;
               ALTER TABLE testA DROP COLUMN note;"
            .to_string(),
    }
}

fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn versioned_patch(peer: i64, seq: i64, at: i64, ver: u32, delta: Map<String, Value>) -> Message {
    Message::Patch(Patch {
        at: Hlc(at),
        peer,
        seq,
        ver,
        tab: "testA".to_string(),
        delta,
    })
}

fn staged_count(rep: &Replicator) -> i64 {
    rep.connection()
        .query_row("SELECT COUNT(*) FROM pending_patches", [], |r| r.get(0))
        .unwrap()
}

#[test]
fn future_versions_stage_and_replay_after_their_migration() {
    let mut rep =
        Replicator::open_in_memory(Some(1800), ReplicationConfig::default()).unwrap();
    rep.migrate(&[migration_v1()]).unwrap();
    rep.add_remote_peer(50, Box::new(MockSocket::default()));

    // Version 2 and version 3 patches arrive while we run version 1.
    rep.handle_message(versioned_patch(
        50,
        1,
        100,
        2,
        row(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("name", json!("from-v2")),
            ("note", json!("new-column")),
        ]),
    ));
    rep.handle_message(versioned_patch(
        50,
        2,
        200,
        3,
        row(&[
            ("id", json!(2)),
            ("tenantId", json!(1)),
            ("name", json!("from-v3")),
        ]),
    ));

    // Both staged, neither in the shadow nor materialised.
    assert_eq!(staged_count(&rep), 2);
    let shadow: i64 = rep
        .connection()
        .query_row("SELECT COUNT(*) FROM testA_patches", [], |r| r.get(0))
        .unwrap();
    assert_eq!(shadow, 0);

    // Gap detection still sees the staged sequences.
    assert!(rep.is_consistent(50, 2));

    // Migrating to version 2 replays the matching patch and leaves the
    // version-3 one staged.
    let report = rep.migrate(&[migration_v1(), migration_v2()]).unwrap();
    assert_eq!(report.current_version, 2);
    assert_eq!(staged_count(&rep), 1);

    let (name, note): (String, String) = rep
        .connection()
        .query_row(
            "SELECT name, note FROM testA WHERE id = 1 AND tenantId = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!((name.as_str(), note.as_str()), ("from-v2", "new-column"));

    // Re-ingesting the already-applied patch is harmless.
    rep.handle_message(versioned_patch(
        50,
        1,
        100,
        2,
        row(&[("id", json!(1)), ("tenantId", json!(1))]),
    ));
    assert_eq!(staged_count(&rep), 1);
}

#[test]
fn persistent_ping_snapshots_stage_under_the_reserved_table() {
    let mut rep =
        Replicator::open_in_memory(Some(1800), ReplicationConfig::default()).unwrap();
    rep.migrate(&[migration_v1()]).unwrap();
    rep.add_remote_peer(50, Box::new(MockSocket::default()));

    // A remote persistent ping: a PATCH on "_" with a stat-map delta.
    let mut delta = Map::new();
    delta.insert("1800".to_string(), json!([100, 1, 100, 1, 42]));
    rep.handle_message(Message::Patch(Patch {
        at: Hlc(500),
        peer: 50,
        seq: 1,
        ver: 1,
        tab: "_".to_string(),
        delta,
    }));

    let (count, table): (i64, String) = rep
        .connection()
        .query_row(
            "SELECT COUNT(*), MAX(tableName) FROM pending_patches",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!((count, table.as_str()), (1, "_"));

    // Snapshots survive matching-version migrations untouched.
    rep.migrate(&[migration_v1()]).unwrap();
    assert_eq!(staged_count(&rep), 1);
}

#[test]
fn staged_patches_for_dropped_tables_are_discarded_on_replay() {
    let mut rep =
        Replicator::open_in_memory(Some(1800), ReplicationConfig::default()).unwrap();
    rep.migrate(&[migration_v1()]).unwrap();
    rep.add_remote_peer(50, Box::new(MockSocket::default()));

    rep.handle_message(Message::Patch(Patch {
        at: Hlc(100),
        peer: 50,
        seq: 1,
        ver: 2,
        tab: "ghost".to_string(),
        delta: row(&[("id", json!(1))]),
    }));
    assert_eq!(staged_count(&rep), 1);

    // Version 2 arrives but never declares `ghost`: the patch is dropped
    // during replay rather than staged forever.
    rep.migrate(&[migration_v1(), migration_v2()]).unwrap();
    assert_eq!(staged_count(&rep), 0);
}
