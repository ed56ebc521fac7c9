use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use rowtrace_cli::execute_cli;
use rowtrace_core::Action;
use rowtrace_sqlite::CaptureStore;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_db_path(tag: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let unique = NEXT.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "rowtrace-cli-{tag}-{}-{unique}.sqlite3",
        std::process::id()
    ))
}

fn cli(args: &[&str]) -> Result<()> {
    execute_cli(args.iter().map(ToString::to_string).collect())
}

#[test]
fn cli_drives_full_capture_flow() {
    let db_path = temp_db_path("flow");
    let db = db_path.to_string_lossy().to_string();

    must(cli(&["rowtrace", "--db", &db, "init"]));
    must(cli(&[
        "rowtrace",
        "--db",
        &db,
        "setup",
        "--sql",
        "CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT)",
    ]));
    must(cli(&["rowtrace", "--db", &db, "tables"]));
    must(cli(&["rowtrace", "--db", &db, "install"]));

    must(cli(&[
        "rowtrace",
        "--db",
        &db,
        "exec",
        "--sql",
        "INSERT INTO foo(id, bar) VALUES (1, 'x')",
        "--sql",
        "UPDATE foo SET bar = 'y' WHERE id = 1",
    ]));

    // An aborted unit of work leaves nothing behind.
    must(cli(&[
        "rowtrace",
        "--db",
        &db,
        "exec",
        "--abort",
        "--sql",
        "INSERT INTO foo(id, bar) VALUES (2, 'z')",
    ]));

    must(cli(&["rowtrace", "--db", &db, "events"]));
    must(cli(&[
        "rowtrace",
        "--db",
        &db,
        "events",
        "--action",
        "update",
    ]));

    let store = must(CaptureStore::open(&db_path));
    let events = must(store.list_events());
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|event| event.row_id == 1));
    assert_eq!(
        events
            .iter()
            .filter(|event| event.action == Action::Update)
            .count(),
        1
    );

    let tx_ids: BTreeSet<i64> = events.iter().map(|event| event.tx_id).collect();
    assert_eq!(tx_ids.len(), 1);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn exec_statement_error_rolls_back_the_unit() {
    let db_path = temp_db_path("error");
    let db = db_path.to_string_lossy().to_string();

    must(cli(&["rowtrace", "--db", &db, "init"]));
    must(cli(&[
        "rowtrace",
        "--db",
        &db,
        "setup",
        "--sql",
        "CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT)",
    ]));
    must(cli(&["rowtrace", "--db", &db, "install"]));

    let result = cli(&[
        "rowtrace",
        "--db",
        &db,
        "exec",
        "--sql",
        "INSERT INTO foo(id, bar) VALUES (1, 'x')",
        "--sql",
        "INSERT INTO nowhere(id) VALUES (1)",
    ]);
    assert!(result.is_err());

    let store = must(CaptureStore::open(&db_path));
    assert!(must(store.list_events()).is_empty());

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn install_without_row_identity_fails_loudly() {
    let db_path = temp_db_path("noid");
    let db = db_path.to_string_lossy().to_string();

    must(cli(&["rowtrace", "--db", &db, "init"]));
    must(cli(&[
        "rowtrace",
        "--db",
        &db,
        "setup",
        "--sql",
        "CREATE TABLE orphan (payload TEXT)",
    ]));

    let result = cli(&["rowtrace", "--db", &db, "install"]);
    let err = match result {
        Ok(()) => panic!("install should fail for a table without an id column"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("orphan"));

    let _ = std::fs::remove_file(&db_path);
}
