// ABOUTME: End-to-end sync runs between two SQLite databases over in-process sockets
// ABOUTME: Covers convergence, idempotence, filtering, schema checks and abort safety

use std::collections::HashSet;
use std::os::unix::net::UnixStream;
use std::thread;

use rusqlite::Connection;
use tempfile::TempDir;

use kitchen_sync::sqlite::SqliteClient;
use kitchen_sync::sync::from::run_sync_from;
use kitchen_sync::sync::to::{run_sync_to, SyncToOptions};

fn create_database(dir: &TempDir, name: &str, sql: &str) -> String {
    let path = dir.path().join(name).to_string_lossy().to_string();
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(sql).unwrap();
    path
}

/// Small block size so multi-row tables actually exercise subdivision.
fn test_options() -> SyncToOptions {
    SyncToOptions {
        snapshot: false,
        target_block_size: 512,
        ..SyncToOptions::default()
    }
}

/// Runs one worker pair over a socketpair: the From side on its own thread,
/// the To side on this one.
fn run_pair(
    source: &str,
    destination: &str,
    options: &SyncToOptions,
) -> kitchen_sync::Result<()> {
    let (to_end, from_end) = UnixStream::pair().unwrap();

    let from_client = SqliteClient::connect(source)?;
    let from_thread = thread::spawn(move || {
        let input = from_end.try_clone().unwrap();
        run_sync_from(from_client, input, from_end)
    });

    let to_client = SqliteClient::connect(destination)?;
    let to_input = to_end.try_clone().unwrap();
    let result = run_sync_to(vec![(to_client, to_input, to_end)], options);

    let from_result = from_thread.join().unwrap();
    // the From side only fails on its own when the To side tore down early
    if result.is_ok() {
        from_result?;
    }
    result
}

fn dump(path: &str, table: &str) -> Vec<Vec<String>> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", table)).unwrap();
    let column_count = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value: rusqlite::types::Value = row.get(i)?;
                values.push(format!("{:?}", value));
            }
            Ok(values)
        })
        .unwrap();
    let mut result: Vec<Vec<String>> = rows.map(|r| r.unwrap()).collect();
    result.sort();
    result
}

fn assert_tables_identical(source: &str, destination: &str, table: &str) {
    assert_eq!(
        dump(source, table),
        dump(destination, table),
        "table {} differs between source and destination",
        table
    );
}

fn data_version(path: &str) -> (Connection, i64) {
    let conn = Connection::open(path).unwrap();
    let version: i64 = conn
        .query_row("PRAGMA data_version", [], |row| row.get(0))
        .unwrap();
    (conn, version)
}

const WIDGETS: &str = "CREATE TABLE widgets (id INTEGER NOT NULL PRIMARY KEY, label TEXT);";

#[test]
fn empty_source_and_destination_converge_without_writes() {
    let dir = TempDir::new().unwrap();
    let source = create_database(&dir, "source.db", WIDGETS);
    let destination = create_database(&dir, "destination.db", WIDGETS);

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn identical_tables_are_left_untouched() {
    let dir = TempDir::new().unwrap();
    let rows = "INSERT INTO widgets VALUES (1, 'a');";
    let source = create_database(&dir, "source.db", &format!("{}{}", WIDGETS, rows));
    let destination = create_database(&dir, "destination.db", &format!("{}{}", WIDGETS, rows));

    let (observer, before) = data_version(&destination);
    run_pair(&source, &destination, &test_options()).unwrap();
    let after: i64 = observer
        .query_row("PRAGMA data_version", [], |row| row.get(0))
        .unwrap();

    assert_eq!(before, after, "an identical table must not be written to");
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn missing_row_is_inserted() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a'),(2,'b'),(3,'c');", WIDGETS),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a'),(3,'c');", WIDGETS),
    );

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn extra_row_is_deleted() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a'),(2,'b'),(4,'d');", WIDGETS),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!(
            "{}INSERT INTO widgets VALUES (1,'a'),(2,'b'),(3,'c'),(4,'d');",
            WIDGETS
        ),
    );

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn divergent_non_key_column_is_updated() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a');", WIDGETS),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!("{}INSERT INTO widgets VALUES (1,'b');", WIDGETS),
    );

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn large_skewed_divergence_converges() {
    let dir = TempDir::new().unwrap();
    let mut source_sql = String::from(WIDGETS);
    let mut destination_sql = String::from(WIDGETS);
    // source holds 1..=300 with gaps; destination holds a shifted, partly
    // divergent set so inserts, deletes and updates all occur
    for i in 1..=300 {
        if i % 7 != 0 {
            source_sql.push_str(&format!("INSERT INTO widgets VALUES ({}, 'v{}');", i, i));
        }
        if i % 5 != 0 {
            let label = if i % 11 == 0 {
                "stale".to_string()
            } else {
                format!("v{}", i)
            };
            destination_sql.push_str(&format!("INSERT INTO widgets VALUES ({}, '{}');", i, label));
        }
    }
    let source = create_database(&dir, "source.db", &source_sql);
    let destination = create_database(&dir, "destination.db", &destination_sql);

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn second_run_is_idempotent_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a'),(2,'b'),(5,'e');", WIDGETS),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!("{}INSERT INTO widgets VALUES (2,'x'),(3,'c');", WIDGETS),
    );

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "widgets");

    let (observer, before) = data_version(&destination);
    run_pair(&source, &destination, &test_options()).unwrap();
    let after: i64 = observer
        .query_row("PRAGMA data_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(before, after, "a second run must not write anything");
}

#[test]
fn composite_keys_nulls_and_blobs_converge() {
    let schema = "CREATE TABLE parts (
        widget_id INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        body BLOB,
        note TEXT,
        PRIMARY KEY (widget_id, seq)
    );";
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!(
            "{}INSERT INTO parts VALUES
                 (1, 1, x'00ff', 'keep'),
                 (1, 2, NULL, NULL),
                 (2, 1, x'', 'empty blob'),
                 (3, 9, x'deadbeef', 'end');",
            schema
        ),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!(
            "{}INSERT INTO parts VALUES
                 (1, 2, x'55', 'divergent'),
                 (2, 1, x'', 'empty blob'),
                 (2, 7, NULL, 'doomed');",
            schema
        ),
    );

    run_pair(&source, &destination, &test_options()).unwrap();
    assert_tables_identical(&source, &destination, "parts");
}

#[test]
fn multiple_tables_drain_in_catalog_order() {
    let schema = "CREATE TABLE a (id INTEGER PRIMARY KEY, v TEXT);
                  CREATE TABLE b (id INTEGER PRIMARY KEY, v TEXT);
                  CREATE TABLE c (id INTEGER PRIMARY KEY, v TEXT);";
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!(
            "{}INSERT INTO a VALUES (1,'a');
              INSERT INTO b VALUES (1,'b'),(2,'bb');
              INSERT INTO c VALUES (9,'c');",
            schema
        ),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!("{}INSERT INTO b VALUES (3,'zzz');", schema),
    );

    run_pair(&source, &destination, &test_options()).unwrap();
    for table in ["a", "b", "c"] {
        assert_tables_identical(&source, &destination, table);
    }
}

#[test]
fn ignored_tables_are_skipped() {
    let schema = "CREATE TABLE kept (id INTEGER PRIMARY KEY, v TEXT);
                  CREATE TABLE skipped (id INTEGER PRIMARY KEY, v TEXT);";
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!(
            "{}INSERT INTO kept VALUES (1,'s');
              INSERT INTO skipped VALUES (1,'s');",
            schema
        ),
    );
    let destination = create_database(
        &dir,
        "destination.db",
        &format!("{}INSERT INTO skipped VALUES (7,'untouched');", schema),
    );

    let mut options = test_options();
    options.ignore = HashSet::from(["skipped".to_string()]);
    run_pair(&source, &destination, &options).unwrap();

    assert_tables_identical(&source, &destination, "kept");
    assert_eq!(dump(&destination, "skipped"), vec![vec![
        "Integer(7)".to_string(),
        "Text(\"untouched\")".to_string(),
    ]]);
}

#[test]
fn only_filter_restricts_the_sync() {
    let schema = "CREATE TABLE wanted (id INTEGER PRIMARY KEY, v TEXT);
                  CREATE TABLE other (id INTEGER PRIMARY KEY, v TEXT);";
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!(
            "{}INSERT INTO wanted VALUES (1,'w');
              INSERT INTO other VALUES (1,'o');",
            schema
        ),
    );
    let destination = create_database(&dir, "destination.db", schema);

    let mut options = test_options();
    options.only = HashSet::from(["wanted".to_string()]);
    run_pair(&source, &destination, &options).unwrap();

    assert_tables_identical(&source, &destination, "wanted");
    assert!(dump(&destination, "other").is_empty());
}

#[test]
fn schema_mismatch_fails_before_any_data_moves() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!(
            "{}CREATE TABLE extra (id INTEGER PRIMARY KEY);
              INSERT INTO widgets VALUES (1,'a');",
            WIDGETS
        ),
    );
    let destination = create_database(&dir, "destination.db", WIDGETS);

    let result = run_pair(&source, &destination, &test_options());
    assert!(result.is_err());
    assert!(dump(&destination, "widgets").is_empty());
}

#[test]
fn schema_mismatch_is_excused_by_ignore() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!(
            "{}CREATE TABLE extra (id INTEGER PRIMARY KEY);
              INSERT INTO widgets VALUES (1,'a');",
            WIDGETS
        ),
    );
    let destination = create_database(&dir, "destination.db", WIDGETS);

    let mut options = test_options();
    options.ignore = HashSet::from(["extra".to_string()]);
    run_pair(&source, &destination, &options).unwrap();
    assert_tables_identical(&source, &destination, "widgets");
}

#[test]
fn rollback_after_leaves_the_destination_unchanged() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a'),(2,'b');", WIDGETS),
    );
    let destination = create_database(&dir, "destination.db", WIDGETS);

    let mut options = test_options();
    options.rollback_after = true;
    run_pair(&source, &destination, &options).unwrap();
    assert!(dump(&destination, "widgets").is_empty());
}

#[test]
fn torn_down_peer_aborts_the_run_without_partial_writes() {
    let dir = TempDir::new().unwrap();
    let destination = create_database(
        &dir,
        "destination.db",
        &format!("{}INSERT INTO widgets VALUES (1,'old');", WIDGETS),
    );

    // the "From side" closes its end as soon as it connects, so the worker
    // sees EOF during protocol negotiation
    let (to_end, from_end) = UnixStream::pair().unwrap();
    drop(from_end);

    let to_client = SqliteClient::connect(&destination).unwrap();
    let to_input = to_end.try_clone().unwrap();
    let result = run_sync_to(vec![(to_client, to_input, to_end)], &test_options());

    assert!(result.is_err());
    assert_eq!(dump(&destination, "widgets"), vec![vec![
        "Integer(1)".to_string(),
        "Text(\"old\")".to_string(),
    ]]);
}

#[test]
fn failing_worker_aborts_its_siblings() {
    let dir = TempDir::new().unwrap();
    let source = create_database(
        &dir,
        "source.db",
        &format!("{}INSERT INTO widgets VALUES (1,'a'),(2,'b');", WIDGETS),
    );
    let destination = create_database(&dir, "destination.db", WIDGETS);

    // two workers against an SQLite destination: the second cannot begin a
    // write transaction while the first holds the file's write lock, so it
    // fails and the first must unwind without committing anything
    let mut from_threads = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..2 {
        let (to_end, from_end) = UnixStream::pair().unwrap();
        let from_client = SqliteClient::connect(&source).unwrap();
        from_threads.push(thread::spawn(move || {
            let input = from_end.try_clone().unwrap();
            run_sync_from(from_client, input, from_end)
        }));
        let to_client = SqliteClient::connect(&destination).unwrap();
        let to_input = to_end.try_clone().unwrap();
        connections.push((to_client, to_input, to_end));
    }

    let result = run_sync_to(connections, &test_options());
    for from_thread in from_threads {
        let _ = from_thread.join().unwrap();
    }

    assert!(result.is_err());
    assert!(dump(&destination, "widgets").is_empty());
}
