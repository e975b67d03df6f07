//! LWW merge tests: the `keep_last` aggregate and the apply-patches fold.

use serde_json::{json, Map, Value};

use quilt_core::hlc::Hlc;
use quilt_core::message::Patch;
use quilt_core::ReplicationConfig;
use quilt_storage::{connection, migrations, Migration, Planner};

fn setup() -> (rusqlite::Connection, Planner) {
    let conn = connection::open_in_memory().unwrap();
    migrations::migrate(
        &conn,
        &[Migration {
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
        }],
    )
    .unwrap();
    let planner = Planner::build(&conn, &ReplicationConfig::default()).unwrap();
    (conn, planner)
}

fn delta(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn ingest(conn: &rusqlite::Connection, planner: &Planner, seq: i64, at: i64, d: Map<String, Value>) {
    planner
        .save_patch(
            conn,
            &Patch {
                at: Hlc(at),
                peer: 20,
                seq,
                ver: 1,
                tab: "testA".to_string(),
                delta: d,
            },
        )
        .unwrap();
}

// ---- keep_last in isolation ----

#[test]
fn keep_last_picks_the_greatest_triple() {
    let conn = connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE t (v, at INTEGER, peer INTEGER, seq INTEGER);
         INSERT INTO t VALUES ('first', 100, 1, 1);
         INSERT INTO t VALUES ('winner', 300, 1, 3);
         INSERT INTO t VALUES ('middle', 200, 9, 9);",
    )
    .unwrap();
    let v: String = conn
        .query_row("SELECT keep_last(v, at, peer, seq) FROM t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, "winner");
}

#[test]
fn keep_last_breaks_timestamp_ties_by_peer_then_seq() {
    let conn = connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE t (v, at INTEGER, peer INTEGER, seq INTEGER);
         INSERT INTO t VALUES ('low-peer', 100, 1, 9);
         INSERT INTO t VALUES ('high-peer', 100, 2, 1);",
    )
    .unwrap();
    let v: String = conn
        .query_row("SELECT keep_last(v, at, peer, seq) FROM t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, "high-peer");
}

#[test]
fn keep_last_ignores_null_values_after_the_first_row() {
    let conn = connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE t (v, at INTEGER, peer INTEGER, seq INTEGER);
         INSERT INTO t VALUES ('kept', 100, 1, 1);
         INSERT INTO t VALUES (NULL, 900, 1, 9);",
    )
    .unwrap();
    let v: String = conn
        .query_row("SELECT keep_last(v, at, peer, seq) FROM t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, "kept");
}

#[test]
fn keep_last_of_only_nulls_is_null() {
    let conn = connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE t (v, at INTEGER, peer INTEGER, seq INTEGER);
         INSERT INTO t VALUES (NULL, 100, 1, 1);",
    )
    .unwrap();
    let v: Option<String> = conn
        .query_row("SELECT keep_last(v, at, peer, seq) FROM t", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, None);
}

// ---- apply-patches fold ----

#[test]
fn seven_patches_two_rows_merge_to_lww_state() {
    let (conn, planner) = setup();

    ingest(
        &conn,
        &planner,
        1,
        100,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("name", json!("a")),
            ("createdAt", json!(100)),
        ]),
    );
    ingest(
        &conn,
        &planner,
        2,
        200,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("name", json!("b")),
        ]),
    );
    ingest(
        &conn,
        &planner,
        3,
        150,
        delta(&[
            ("id", json!(2)),
            ("tenantId", json!(1)),
            ("name", json!("x")),
            ("createdAt", json!(150)),
        ]),
    );
    // Touches only deletedAt: the untouched name must survive.
    ingest(
        &conn,
        &planner,
        4,
        300,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("deletedAt", json!(300)),
        ]),
    );
    ingest(
        &conn,
        &planner,
        5,
        250,
        delta(&[
            ("id", json!(2)),
            ("tenantId", json!(1)),
            ("name", json!("y")),
        ]),
    );
    // Higher seq but older timestamp: loses to seq 5 on the at component.
    ingest(
        &conn,
        &planner,
        6,
        240,
        delta(&[
            ("id", json!(2)),
            ("tenantId", json!(1)),
            ("name", json!("z")),
        ]),
    );
    // Explicit null is "not touched", never an erase.
    ingest(
        &conn,
        &planner,
        7,
        400,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("name", Value::Null),
        ]),
    );

    planner.apply_patches(&conn, "testA", Hlc(0)).unwrap();

    let rows: Vec<(i64, Option<String>, Option<i64>, Option<i64>)> = conn
        .prepare("SELECT id, name, deletedAt, createdAt FROM testA ORDER BY id")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(
        rows,
        vec![
            (1, Some("b".to_string()), Some(300), Some(100)),
            (2, Some("y".to_string()), None, Some(150)),
        ]
    );
}

#[test]
fn reapplying_a_suffix_never_erases_older_columns() {
    let (conn, planner) = setup();
    ingest(
        &conn,
        &planner,
        1,
        100,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("name", json!("keep-me")),
            ("createdAt", json!(100)),
        ]),
    );
    planner.apply_patches(&conn, "testA", Hlc(0)).unwrap();

    ingest(
        &conn,
        &planner,
        2,
        500,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("deletedAt", json!(500)),
        ]),
    );
    // Fold only the new suffix: the grouped rows have a null name, and the
    // conflict clause must coalesce it away instead of clobbering.
    planner.apply_patches(&conn, "testA", Hlc(500)).unwrap();

    let (name, deleted_at, created_at): (String, i64, i64) = conn
        .query_row(
            "SELECT name, deletedAt, createdAt FROM testA WHERE id = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(name, "keep-me");
    assert_eq!(deleted_at, 500);
    assert_eq!(created_at, 100);
}

#[test]
fn merge_is_idempotent_across_repeated_applies() {
    let (conn, planner) = setup();
    ingest(
        &conn,
        &planner,
        1,
        100,
        delta(&[
            ("id", json!(1)),
            ("tenantId", json!(1)),
            ("name", json!("stable")),
        ]),
    );
    planner.apply_patches(&conn, "testA", Hlc(0)).unwrap();
    planner.apply_patches(&conn, "testA", Hlc(0)).unwrap();
    planner.apply_patches(&conn, "testA", Hlc(0)).unwrap();

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM testA", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
    let name: String = conn
        .query_row("SELECT name FROM testA WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(name, "stable");
}
