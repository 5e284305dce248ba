use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use eud_split_core::SchemaLayout;
use eud_split_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "EUDCTL_LOG";
const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "eudctl")]
#[command(about = "Split shared EUD references and enforce one-to-one ownership")]
struct Cli {
    #[arg(long, default_value = "./eud.sqlite3")]
    db: PathBuf,

    /// YAML file describing the endpoint table and its referencing relations.
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Log filter directive; falls back to `EUDCTL_LOG`, then `warn`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Plan,
    Migrate(DbMigrateArgs),
    Downgrade,
    Backup(DbBackupArgs),
    IntegrityCheck,
}

impl DbCommand {
    /// Commands that only inspect the store; they never create or alter the database.
    fn is_read_only(&self) -> bool {
        match self {
            Self::SchemaVersion | Self::Plan | Self::Backup(_) | Self::IntegrityCheck => true,
            Self::Migrate(args) => args.dry_run,
            Self::Downgrade => false,
        }
    }
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Write a SQLite backup here before any change is applied.
    #[arg(long)]
    backup: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid log level directive: {directive}"))?,
        None => EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

fn load_layout(path: Option<&Path>) -> Result<SchemaLayout> {
    let Some(path) = path else {
        return Ok(SchemaLayout::default());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read layout file {}", path.display()))?;
    let layout: SchemaLayout = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse layout file {}", path.display()))?;
    layout.validate()?;
    Ok(layout)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let layout = load_layout(cli.layout.as_deref())?;
    match cli.command {
        Command::Db { command } => {
            let mut store = if command.is_read_only() {
                SqliteStore::open_existing(&cli.db, layout)?
            } else {
                SqliteStore::open_with_layout(&cli.db, layout)?
            };
            run_db(*command, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Plan => run_db_plan(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Downgrade => run_db_downgrade(store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_plan(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    if status.current_version < 1 {
        return Err(anyhow!("database has no EUD schema yet; run `db migrate` first"));
    }

    let plans = store.plan()?;
    let clones_planned: usize = plans.iter().map(eud_split_core::RelationPlan::reassignments).sum();
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "clones_planned": clones_planned,
        "relations": serde_json::to_value(&plans)?
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        let plans = if before.current_version >= 1 { store.plan()? } else { Vec::new() };
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy,
            "relations": serde_json::to_value(&plans)?
        }))?;
        return Ok(());
    }

    if let Some(backup) = args.backup.as_ref() {
        store.backup_database(backup)?;
        info!(path = %backup.display(), "pre-migration backup written");
    }

    let summary = store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": summary.applied_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty(),
        "backup": args.backup.as_ref().map(|path| path.display().to_string()),
        "reconcile": serde_json::to_value(&summary.reconcile)?
    }))
}

fn run_db_downgrade(store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    let summary = store.downgrade()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "before_version": before.current_version,
        "reverted_versions": summary.reverted_versions,
        "after_version": after.current_version,
        "revert": serde_json::to_value(&summary.revert)?
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &SqliteStore) -> Result<()> {
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out.display().to_string()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(report)?)
}
