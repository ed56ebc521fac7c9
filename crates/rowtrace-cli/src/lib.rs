//! Command surface for installing and inspecting change capture.
//!
//! All commands print JSON to stdout. [`execute_cli`] exists so integration
//! tests can drive the full surface in-process.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rowtrace_core::Action;
use rowtrace_sqlite::CaptureStore;

#[derive(Debug, Parser)]
#[command(name = "rowtrace")]
#[command(about = "Trigger-based change capture for SQLite schemas")]
pub struct Cli {
    #[arg(long, default_value = "./rowtrace.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the event log and transaction identity sequence.
    Init,
    /// Print the instrumented table set discovered by introspection.
    Tables,
    /// Install capture triggers for every user table, atomically.
    Install,
    /// Run raw SQL outside capture, for schema setup.
    Setup(SetupArgs),
    /// Run statements inside one unit of work.
    Exec(ExecArgs),
    /// Print captured events.
    Events(EventsArgs),
}

#[derive(Debug, Args)]
pub struct SetupArgs {
    #[arg(long = "sql", required = true)]
    statements: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    #[arg(long = "sql", required = true)]
    statements: Vec<String>,
    /// Finalize with failure instead of committing.
    #[arg(long)]
    abort: bool,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long)]
    tx_id: Option<i64>,
    #[arg(long)]
    action: Option<ActionArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionArg {
    Insert,
    Update,
    Delete,
}

impl ActionArg {
    fn to_action(self) -> Action {
        match self {
            Self::Insert => Action::Insert,
            Self::Update => Action::Update,
            Self::Delete => Action::Delete,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ExecReport {
    tx_id: Option<i64>,
    statements: usize,
    committed: bool,
}

pub fn execute_cli(args: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(args).context("failed to parse command line")?;
    run_cli(cli)
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = CaptureStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Init => print_json(&serde_json::json!({ "initialized": true })),
        Command::Tables => {
            let tables = store.introspect()?;
            print_json(&tables)
        }
        Command::Install => {
            let report = store.install_capture()?;
            print_json(&report)
        }
        Command::Setup(args) => {
            for statement in &args.statements {
                store.execute_batch(statement)?;
            }
            print_json(&serde_json::json!({ "statements": args.statements.len() }))
        }
        Command::Exec(args) => run_exec(&mut store, &args),
        Command::Events(args) => {
            let mut events = match args.tx_id {
                Some(tx_id) => store.list_events_for_tx(tx_id)?,
                None => store.list_events()?,
            };
            if let Some(action) = args.action {
                let action = action.to_action();
                events.retain(|event| event.action == action);
            }
            print_json(&events)
        }
    }
}

fn run_exec(store: &mut CaptureStore, args: &ExecArgs) -> Result<()> {
    let mut unit = store.unit_of_work(false);
    let mut executed = 0_usize;
    for statement in &args.statements {
        if let Err(err) = unit.exec(statement, []) {
            if let Err(rollback_err) = unit.finalize(false) {
                return Err(anyhow!("{rollback_err:#} (statement error: {err:#})"));
            }
            return Err(err);
        }
        executed += 1;
    }

    let tx_id = unit.tx_id();
    let committed = !args.abort;
    unit.finalize(committed)?;

    print_json(&ExecReport {
        tx_id,
        statements: executed,
        committed,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}
