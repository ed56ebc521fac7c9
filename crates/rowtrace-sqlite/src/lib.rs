#![allow(clippy::missing_errors_doc)]

//! SQLite-backed change capture: schema introspection, atomic trigger
//! installation and transaction-correlated units of work.
//!
//! A [`CaptureStore`] owns one connection. [`CaptureStore::install_capture`]
//! instruments every user table with the triggers synthesized by
//! `rowtrace-core`; [`CaptureStore::unit_of_work`] hands out the lazy
//! transaction wrapper whose identity those triggers read while they append
//! to the event log.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rowtrace_core::{
    capture_statements, format_rfc3339, now_utc, Action, CapturedEvent, Column, Table,
    EVENT_LOG_TABLE, TX_ID_FUNCTION,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, InterruptHandle, Row, TransactionBehavior};

const CAPTURE_MIGRATION_VERSION: i64 = 1;
const TX_SEQUENCE_TABLE: &str = "tx_sequence";
const MIGRATIONS_TABLE: &str = "schema_migrations";

const SCHEMA_CAPTURE_V1: &str = "
CREATE TABLE IF NOT EXISTS events (
  tx_id INTEGER NOT NULL,
  table_id INTEGER NOT NULL,
  column_id INTEGER NOT NULL,
  row_id INTEGER NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('insert', 'update', 'delete')),
  value TEXT
);

CREATE TRIGGER IF NOT EXISTS trg_events_no_update
BEFORE UPDATE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_events_no_delete
BEFORE DELETE ON events
BEGIN
  SELECT RAISE(FAIL, 'events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_events_tx ON events(tx_id);
CREATE INDEX IF NOT EXISTS idx_events_table_row ON events(table_id, row_id);

CREATE TABLE IF NOT EXISTS tx_sequence (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  next_value INTEGER NOT NULL
);

INSERT OR IGNORE INTO tx_sequence(id, next_value) VALUES (1, 0);
";

/// Summary of one capture installation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct InstallReport {
    pub tables: usize,
    pub statements: usize,
}

/// One connection to an instrumented (or to-be-instrumented) database.
pub struct CaptureStore {
    conn: Connection,
    published_tx_id: Arc<AtomicI64>,
}

impl CaptureStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let published_tx_id = Arc::new(AtomicI64::new(0));
        register_tx_id_function(&conn, Arc::clone(&published_tx_id))?;

        Ok(Self {
            conn,
            published_tx_id,
        })
    }

    /// Creates the event log, the transaction identity sequence and the
    /// migration bookkeeping. Idempotent.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CAPTURE_V1)
            .context("failed to apply capture schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CAPTURE_MIGRATION_VERSION, now],
            )
            .context("failed to register capture schema migration")?;

        Ok(())
    }

    /// Discovers the instrumented table set: every ordinary user table,
    /// excluding sqlite internals and rowtrace's own bookkeeping. Tables are
    /// ordered by name and assigned dense identifiers in that order; columns
    /// carry their positional catalog identifier. An empty schema yields an
    /// empty sequence.
    pub fn introspect(&self) -> Result<Vec<Table>> {
        introspect_with(&self.conn)
    }

    /// Installs capture triggers for every introspected table inside one
    /// schema-modification transaction. Either the whole trigger set is
    /// installed or none of it is; a failing rollback is surfaced as its own
    /// loud error because it leaves the schema state indeterminate.
    pub fn install_capture(&mut self) -> Result<InstallReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start install transaction")?;

        match run_install(&tx) {
            Ok(report) => {
                tx.commit().context("failed to commit capture installation")?;
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    return Err(anyhow!(
                        "capture installation rollback failed, schema state is indeterminate: \
                         {rollback_err} (installation error: {err})"
                    ));
                }
                Err(err)
            }
        }
    }

    /// Hands out the lazy transaction wrapper. The mutable borrow keeps it
    /// exclusive: one unit of work per connection at a time.
    pub fn unit_of_work(&mut self, read_only: bool) -> UnitOfWork<'_> {
        UnitOfWork {
            conn: &self.conn,
            published_tx_id: &self.published_tx_id,
            read_only,
            state: UnitState::Unstarted,
            tx_id: None,
        }
    }

    /// Runs raw statements outside any unit of work, for schema setup.
    /// Row writes to instrumented tables fail here because no transaction
    /// identifier is published.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .with_context(|| format!("failed to execute batch: {sql}"))
    }

    pub fn list_events(&self) -> Result<Vec<CapturedEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT tx_id, table_id, column_id, row_id, action, value
             FROM events
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map([], parse_event_row)?;
        collect_rows(rows)
    }

    pub fn list_events_for_tx(&self, tx_id: i64) -> Result<Vec<CapturedEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT tx_id, table_id, column_id, row_id, action, value
             FROM events
             WHERE tx_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![tx_id], parse_event_row)?;
        collect_rows(rows)
    }

    /// Handle for aborting a statement in flight from another thread. An
    /// interrupted operation fails with an error; the owner still finalizes
    /// the unit of work with `success = false`.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn.get_interrupt_handle()
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum UnitState {
    Unstarted,
    Active,
    Committed,
    RolledBack,
}

/// An on-demand transaction with a trigger-visible identity.
///
/// The underlying transaction starts at the first [`query`](Self::query) or
/// [`exec`](Self::exec) call; begin allocates a fresh identifier from the
/// shared sequence and publishes it for capture triggers before any caller
/// statement runs. The commit/rollback decision is a separate, single
/// [`finalize`](Self::finalize) step owned by whoever owns the unit of work.
///
/// Not safe for concurrent use; one sequential unit of work per instance.
pub struct UnitOfWork<'conn> {
    conn: &'conn Connection,
    published_tx_id: &'conn AtomicI64,
    read_only: bool,
    state: UnitState,
    tx_id: Option<i64>,
}

impl UnitOfWork<'_> {
    fn begin(&mut self) -> Result<()> {
        match self.state {
            UnitState::Active => {
                // The database can roll the transaction back behind our
                // back (ON CONFLICT ROLLBACK, an interrupt). Running the
                // next statement in autocommit with a stale identity would
                // commit its events immediately, so refuse it.
                if self.conn.is_autocommit() {
                    self.published_tx_id.store(0, Ordering::SeqCst);
                    self.tx_id = None;
                    bail!("transaction was rolled back by the database, finalize the unit of work");
                }
                return Ok(());
            }
            UnitState::Unstarted => {}
            UnitState::Committed | UnitState::RolledBack => {
                bail!("unit of work was already finalized and cannot be reused")
            }
        }

        if self.read_only {
            self.conn
                .execute_batch("BEGIN")
                .context("failed to begin read-only transaction")?;
            self.state = UnitState::Active;
            return Ok(());
        }

        // The identity is allocated in autocommit, as a statement of its
        // own, before the unit's transaction starts: a later rollback
        // discards the identifier without rewinding the sequence, so it can
        // never be reissued to another unit of work.
        let tx_id = self
            .conn
            .query_row(
                "UPDATE tx_sequence SET next_value = next_value + 1 WHERE id = 1 RETURNING next_value",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to allocate transaction identifier")?;

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("failed to begin transaction")?;

        self.published_tx_id.store(tx_id, Ordering::SeqCst);
        self.tx_id = Some(tx_id);
        self.state = UnitState::Active;
        Ok(())
    }

    /// Runs a query in the transaction, mapping result rows with `map`.
    /// Starts the transaction if this is the first statement.
    pub fn query<T, P, F>(&mut self, sql: &str, query_params: P, map: F) -> Result<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.begin()?;
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare query: {sql}"))?;
        let rows = stmt
            .query_map(query_params, map)
            .with_context(|| format!("failed to run query: {sql}"))?;
        collect_rows(rows)
    }

    /// Runs a statement with no result rows expected, returning the number
    /// of affected rows. Starts the transaction if this is the first
    /// statement.
    pub fn exec<P: rusqlite::Params>(&mut self, sql: &str, exec_params: P) -> Result<usize> {
        self.begin()?;
        self.conn
            .execute(sql, exec_params)
            .with_context(|| format!("failed to execute statement: {sql}"))
    }

    /// The identity shared by every event this unit of work produces.
    /// `Some` only while the transaction is active on a writable unit.
    #[must_use]
    pub fn tx_id(&self) -> Option<i64> {
        if self.state == UnitState::Active {
            self.tx_id
        } else {
            None
        }
    }

    /// Commits on `success`, rolls back otherwise. A no-op if the
    /// transaction never started; read-only units end without a commit
    /// decision. If the database already rolled the transaction back on its
    /// own, `finalize(false)` succeeds and `finalize(true)` errors. Must be
    /// called exactly once; afterwards the instance rejects further
    /// statements.
    pub fn finalize(&mut self, success: bool) -> Result<()> {
        match self.state {
            UnitState::Committed | UnitState::RolledBack => {
                bail!("unit of work was already finalized")
            }
            UnitState::Unstarted => {
                self.state = UnitState::RolledBack;
                return Ok(());
            }
            UnitState::Active => {}
        }

        self.published_tx_id.store(0, Ordering::SeqCst);

        // A database-initiated rollback already ended the transaction;
        // there is nothing left to commit.
        if self.conn.is_autocommit() {
            self.state = UnitState::RolledBack;
            if success {
                bail!("cannot commit: the database already rolled the transaction back");
            }
            return Ok(());
        }

        if self.read_only {
            self.conn
                .execute_batch("ROLLBACK")
                .context("failed to end read-only transaction")?;
            self.state = UnitState::RolledBack;
            return Ok(());
        }

        if success {
            if let Err(commit_err) = self.conn.execute_batch("COMMIT") {
                if !self.conn.is_autocommit() {
                    if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                        return Err(anyhow!(
                            "commit failed and so did the rollback after it, transaction \
                             state is indeterminate: {rollback_err} (commit error: {commit_err})"
                        ));
                    }
                }
                self.state = UnitState::RolledBack;
                return Err(
                    anyhow::Error::from(commit_err).context("failed to commit unit of work")
                );
            }
            self.state = UnitState::Committed;
            Ok(())
        } else {
            self.conn
                .execute_batch("ROLLBACK")
                .context("rollback of unit of work failed, transaction state is indeterminate")?;
            self.state = UnitState::RolledBack;
            Ok(())
        }
    }
}

fn register_tx_id_function(conn: &Connection, slot: Arc<AtomicI64>) -> Result<()> {
    conn.create_scalar_function(TX_ID_FUNCTION, 0, FunctionFlags::SQLITE_UTF8, move |_ctx| {
        let value = slot.load(Ordering::SeqCst);
        if value == 0 {
            return Err(rusqlite::Error::UserFunctionError(
                "no active unit of work publishes a transaction identifier".into(),
            ));
        }
        Ok(value)
    })
    .with_context(|| format!("failed to register {TX_ID_FUNCTION} function"))
}

fn run_install(conn: &Connection) -> Result<InstallReport> {
    let tables = introspect_with(conn)?;
    let statements = capture_statements(&tables)?;
    for statement in &statements {
        conn.execute_batch(statement)
            .with_context(|| format!("failed to execute capture statement:\n{statement}"))?;
    }
    Ok(InstallReport {
        tables: tables.len(),
        statements: statements.len(),
    })
}

fn introspect_with(conn: &Connection) -> Result<Vec<Table>> {
    let list_sql = format!(
        "SELECT name FROM sqlite_master
         WHERE type = 'table'
           AND name NOT LIKE 'sqlite_%'
           AND name NOT IN ('{EVENT_LOG_TABLE}', '{TX_SEQUENCE_TABLE}', '{MIGRATIONS_TABLE}')
         ORDER BY name ASC"
    );
    let mut stmt = conn
        .prepare(&list_sql)
        .context("failed to query sqlite_master")?;
    let mut rows = stmt.query([])?;

    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get::<_, String>(0)?);
    }

    let mut tables = Vec::new();
    for name in names {
        let id = i64::try_from(tables.len() + 1).context("table identifier overflow")?;
        let columns = table_columns(conn, &name)?;
        tables.push(Table { id, name, columns });
    }
    Ok(tables)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<Column>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(Column {
            id: row.get::<_, i64>(0)?,
            name: row.get::<_, String>(1)?,
        });
    }
    Ok(columns)
}

fn parse_event_row(row: &Row<'_>) -> rusqlite::Result<CapturedEvent> {
    let action_raw: String = row.get(4)?;
    let action = Action::parse(&action_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid action: {action_raw}"),
            )),
        )
    })?;

    let value_raw: Option<String> = row.get(5)?;
    let value = match value_raw {
        None => serde_json::Value::Null,
        Some(raw) => serde_json::from_str(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid event value encoding: {err}"),
                )),
            )
        })?,
    };

    Ok(CapturedEvent {
        tx_id: row.get(0)?,
        table_id: row.get(1)?,
        column_id: row.get(2)?,
        row_id: row.get(3)?,
        action,
        value,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
