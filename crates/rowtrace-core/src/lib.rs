//! Domain model and SQL synthesis for trigger-based change capture.
//!
//! Everything in this crate is pure: introspected tables go in, capture
//! trigger DDL comes out. Executing that DDL (and correlating the events it
//! produces with transactions) lives in `rowtrace-sqlite`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Name of the append-only event log table written by capture triggers.
pub const EVENT_LOG_TABLE: &str = "events";

/// Reserved SQL function every generated trigger body calls to read the
/// identity of the enclosing unit of work. Registered per connection by the
/// sqlite layer; trigger bodies cannot receive caller-supplied arguments, so
/// the identity travels through this session-local channel instead.
pub const TX_ID_FUNCTION: &str = "capture_tx_id";

/// Column that identifies the affected row on every instrumented table.
pub const ROW_IDENTITY_COLUMN: &str = "id";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CaptureError {
    #[error("precondition violation: {0}")]
    Precondition(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One column of an instrumented table. The identifier is the positional
/// `cid` reported by the catalog, unique within its owning table only.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Column {
    pub id: i64,
    pub name: String,
}

/// Read-only snapshot of one instrumented table, produced by introspection
/// and consumed immediately by generation. Columns are ordered by their
/// positional identifier, ascending.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Table {
    pub id: i64,
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    /// Checks the structural preconditions generation relies on: plain
    /// (quote-free) identifiers everywhere and, for non-empty tables, a row
    /// identity column. Violations that would otherwise only surface as
    /// trigger errors at fire time fail here instead.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !is_plain_identifier(&self.name) {
            return Err(CaptureError::Validation(format!(
                "table name {:?} requires quoting and is not supported",
                self.name
            )));
        }
        for column in &self.columns {
            if !is_plain_identifier(&column.name) {
                return Err(CaptureError::Validation(format!(
                    "column name {:?} on table {} requires quoting and is not supported",
                    column.name, self.name
                )));
            }
        }
        if self.columns.is_empty() {
            return Ok(());
        }
        if !self
            .columns
            .iter()
            .any(|column| column.name == ROW_IDENTITY_COLUMN)
        {
            return Err(CaptureError::Precondition(format!(
                "table {} has no {ROW_IDENTITY_COLUMN} column to identify affected rows",
                self.name
            )));
        }
        Ok(())
    }
}

/// One row of the event log: a single column's new (or old, for deletes)
/// value plus action, row and transaction identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CapturedEvent {
    pub tx_id: i64,
    pub table_id: i64,
    pub column_id: i64,
    pub row_id: i64,
    pub action: Action,
    pub value: Value,
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|item| item.is_ascii_alphanumeric() || item == '_')
}

/// Deterministic trigger name for `(action, table[, column])`. Insert and
/// delete triggers are per table, update triggers per column.
#[must_use]
pub fn trigger_name(action: Action, table: &str, column: Option<&str>) -> String {
    match column {
        Some(column) => format!("{}_{table}_{column}", action.as_str()),
        None => format!("{}_{table}", action.as_str()),
    }
}

fn event_insert_sql(table_id: i64, column_id: i64, row: &str, action: Action, column: &str) -> String {
    format!(
        "  INSERT INTO {EVENT_LOG_TABLE}(tx_id, table_id, column_id, row_id, action, value)\n  \
         VALUES ({TX_ID_FUNCTION}(), {table_id}, {column_id}, {row}.{ROW_IDENTITY_COLUMN}, '{}', json_quote({row}.{column}));\n",
        action.as_str()
    )
}

/// Insert capture trigger: appends one event per column from the inserted
/// row's new values.
#[must_use]
pub fn insert_capture_sql(table: &Table) -> String {
    let mut body = String::new();
    for column in &table.columns {
        body.push_str(&event_insert_sql(
            table.id,
            column.id,
            "new",
            Action::Insert,
            &column.name,
        ));
    }
    format!(
        "CREATE TRIGGER {}\nAFTER INSERT ON {}\nFOR EACH ROW\nBEGIN\n{body}END",
        trigger_name(Action::Insert, &table.name, None),
        table.name
    )
}

/// Update capture trigger for one column, scoped so it fires only when that
/// column is the one being updated. An update touching k of n columns fires
/// exactly k of these, never n.
#[must_use]
pub fn update_capture_sql(table: &Table, column: &Column) -> String {
    let body = event_insert_sql(table.id, column.id, "new", Action::Update, &column.name);
    format!(
        "CREATE TRIGGER {}\nAFTER UPDATE OF {} ON {}\nFOR EACH ROW\nBEGIN\n{body}END",
        trigger_name(Action::Update, &table.name, Some(&column.name)),
        column.name,
        table.name
    )
}

/// Delete capture trigger: appends one event per column from the deleted
/// row's old values.
#[must_use]
pub fn delete_capture_sql(table: &Table) -> String {
    let mut body = String::new();
    for column in &table.columns {
        body.push_str(&event_insert_sql(
            table.id,
            column.id,
            "old",
            Action::Delete,
            &column.name,
        ));
    }
    format!(
        "CREATE TRIGGER {}\nAFTER DELETE ON {}\nFOR EACH ROW\nBEGIN\n{body}END",
        trigger_name(Action::Delete, &table.name, None),
        table.name
    )
}

/// All capture statements for one table, in installation order: insert
/// trigger, one update trigger per column, delete trigger. Table and column
/// identifiers are embedded as literals and stay valid for the lifetime of
/// the installed triggers.
///
/// A table with no columns yields no statements. Structural precondition
/// violations fail here, before any DDL is produced.
pub fn table_statements(table: &Table) -> Result<Vec<String>, CaptureError> {
    table.validate()?;
    if table.columns.is_empty() {
        return Ok(Vec::new());
    }
    let mut statements = Vec::with_capacity(table.columns.len() + 2);
    statements.push(insert_capture_sql(table));
    for column in &table.columns {
        statements.push(update_capture_sql(table, column));
    }
    statements.push(delete_capture_sql(table));
    Ok(statements)
}

/// Capture statements for a whole introspected schema, table order preserved.
pub fn capture_statements(tables: &[Table]) -> Result<Vec<String>, CaptureError> {
    let mut statements = Vec::new();
    for table in tables {
        statements.extend(table_statements(table)?);
    }
    Ok(statements)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CaptureError> {
    value
        .format(&Rfc3339)
        .map_err(|err| CaptureError::Validation(format!("timestamp formatting failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo_table() -> Table {
        Table {
            id: 1,
            name: "foo".to_string(),
            columns: vec![
                Column {
                    id: 0,
                    name: "id".to_string(),
                },
                Column {
                    id: 1,
                    name: "bar".to_string(),
                },
            ],
        }
    }

    fn must<T>(result: Result<T, CaptureError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn action_names_round_trip() {
        for action in [Action::Insert, Action::Update, Action::Delete] {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::parse("truncate"), None);
    }

    #[test]
    fn trigger_names_follow_fixed_pattern() {
        assert_eq!(trigger_name(Action::Insert, "foo", None), "insert_foo");
        assert_eq!(trigger_name(Action::Delete, "foo", None), "delete_foo");
        assert_eq!(
            trigger_name(Action::Update, "foo", Some("bar")),
            "update_foo_bar"
        );
    }

    #[test]
    fn insert_trigger_appends_one_event_per_column() {
        let sql = insert_capture_sql(&foo_table());
        assert!(sql.starts_with("CREATE TRIGGER insert_foo\nAFTER INSERT ON foo\n"));
        assert_eq!(sql.matches("INSERT INTO events").count(), 2);
        assert!(sql.contains("VALUES (capture_tx_id(), 1, 0, new.id, 'insert', json_quote(new.id));"));
        assert!(sql.contains("VALUES (capture_tx_id(), 1, 1, new.id, 'insert', json_quote(new.bar));"));
    }

    #[test]
    fn update_trigger_is_column_scoped_and_single_event() {
        let table = foo_table();
        let sql = update_capture_sql(&table, &table.columns[1]);
        assert!(sql.starts_with("CREATE TRIGGER update_foo_bar\nAFTER UPDATE OF bar ON foo\n"));
        assert_eq!(sql.matches("INSERT INTO events").count(), 1);
        assert!(sql.contains("VALUES (capture_tx_id(), 1, 1, new.id, 'update', json_quote(new.bar));"));
    }

    #[test]
    fn delete_trigger_reads_old_values() {
        let sql = delete_capture_sql(&foo_table());
        assert!(sql.starts_with("CREATE TRIGGER delete_foo\nAFTER DELETE ON foo\n"));
        assert_eq!(sql.matches("INSERT INTO events").count(), 2);
        assert!(sql.contains("old.id, 'delete', json_quote(old.id)"));
        assert!(sql.contains("old.id, 'delete', json_quote(old.bar)"));
        assert!(!sql.contains("new."));
    }

    #[test]
    fn table_statements_cover_every_action_in_order() {
        let statements = must(table_statements(&foo_table()));
        assert_eq!(statements.len(), 4);
        assert!(statements[0].contains("insert_foo"));
        assert!(statements[1].contains("update_foo_id"));
        assert!(statements[2].contains("update_foo_bar"));
        assert!(statements[3].contains("delete_foo"));
    }

    #[test]
    fn empty_schema_yields_zero_statements() {
        assert!(must(capture_statements(&[])).is_empty());
    }

    #[test]
    fn empty_column_list_yields_no_statements_without_panicking() {
        let table = Table {
            id: 7,
            name: "bare".to_string(),
            columns: Vec::new(),
        };
        assert!(must(table_statements(&table)).is_empty());
    }

    #[test]
    fn table_without_row_identity_fails_generation_early() {
        let table = Table {
            id: 2,
            name: "noid".to_string(),
            columns: vec![Column {
                id: 0,
                name: "payload".to_string(),
            }],
        };
        let err = match table_statements(&table) {
            Ok(_) => panic!("generation should fail without an id column"),
            Err(err) => err,
        };
        assert!(matches!(err, CaptureError::Precondition(_)));
        assert!(err.to_string().contains("noid"));
    }

    #[test]
    fn quoted_identifiers_are_rejected() {
        let table = Table {
            id: 3,
            name: "needs quoting".to_string(),
            columns: Vec::new(),
        };
        assert!(matches!(
            table_statements(&table),
            Err(CaptureError::Validation(_))
        ));

        let table = Table {
            id: 4,
            name: "ok".to_string(),
            columns: vec![
                Column {
                    id: 0,
                    name: "id".to_string(),
                },
                Column {
                    id: 1,
                    name: "weird-name".to_string(),
                },
            ],
        };
        assert!(matches!(
            table_statements(&table),
            Err(CaptureError::Validation(_))
        ));
    }

    #[test]
    fn generated_statements_count_scales_with_columns() {
        let mut table = foo_table();
        for index in 2..6 {
            table.columns.push(Column {
                id: index,
                name: format!("col{index}"),
            });
        }
        let statements = must(table_statements(&table));
        assert_eq!(statements.len(), table.columns.len() + 2);
    }
}
