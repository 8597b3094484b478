use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use machina_storage::{
    check_session_integrity, compact_sessions, read_session_records,
    resolve_storage_paths, run_migrations, session_log, InitializeOutcome, MigrationEngine,
    MigrationOptions, SchemaStateStore, StorageEnv, StoragePaths,
};
use machina_storage_core::StorageError;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "MACHINA_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";
const UNHEALTHY_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "machina")]
#[command(about = "Machina session storage CLI")]
struct Cli {
    /// Storage root; overrides MACHINA_STORAGE_ROOT and the home default.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Storage {
        #[command(subcommand)]
        command: StorageCommand,
    },
}

#[derive(Debug, Subcommand)]
enum StorageCommand {
    /// Create the storage root, schema state, and empty session log if absent.
    Init,
    /// Print resolved paths without touching the filesystem.
    Paths,
    Status,
    Migrate(MigrateArgs),
    /// Validate the session log; exits 2 when issues are found.
    Integrity,
    Compact,
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long)]
    target: Option<u32>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RecordsCommand {
    /// Latest live record per session id.
    List,
}

#[derive(Debug, Serialize)]
struct InitOutput {
    paths: StoragePaths,
    #[serde(flatten)]
    outcome: InitializeOutcome,
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

fn emit_json(value: impl Serialize) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to encode command output")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn error_envelope(err: &anyhow::Error) -> Value {
    let (code, message) = match err.downcast_ref::<StorageError>() {
        Some(storage) => (storage.code(), storage.to_string()),
        None => ("CLI_FAILED", format!("{err:#}")),
    };
    serde_json::json!({
        "contract_version": CLI_CONTRACT_VERSION,
        "error": { "code": code, "message": message }
    })
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let envelope = error_envelope(&err);
            match serde_json::to_string_pretty(&envelope) {
                Ok(text) => eprintln!("{text}"),
                Err(_) => eprintln!("{err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let env = StorageEnv::from_process();
    match cli.command {
        Command::Storage { command } => run_storage(command, cli.root.as_deref(), &env).await,
    }
}

async fn run_storage(
    command: StorageCommand,
    root: Option<&Path>,
    env: &StorageEnv,
) -> Result<ExitCode> {
    match command {
        StorageCommand::Init => run_storage_init(root, env).await?,
        StorageCommand::Paths => emit_json(resolve_storage_paths(root, env)?)?,
        StorageCommand::Status => {
            let engine = MigrationEngine::new(resolve_storage_paths(root, env)?);
            emit_json(engine.schema_status().await?)?;
        }
        StorageCommand::Migrate(args) => run_storage_migrate(&args, root, env).await?,
        StorageCommand::Integrity => return run_storage_integrity(root, env).await,
        StorageCommand::Compact => emit_json(compact_sessions(root, env).await?)?,
        StorageCommand::Records { command: RecordsCommand::List } => {
            run_records_list(root, env).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_storage_init(root: Option<&Path>, env: &StorageEnv) -> Result<()> {
    let paths = resolve_storage_paths(root, env)?;
    let outcome = SchemaStateStore::new(paths.clone()).initialize_if_missing().await?;
    debug!(root = %paths.root.display(), ?outcome, "storage init");
    emit_json(InitOutput { paths, outcome })
}

async fn run_storage_migrate(
    args: &MigrateArgs,
    root: Option<&Path>,
    env: &StorageEnv,
) -> Result<()> {
    if args.dry_run {
        let engine = MigrationEngine::new(resolve_storage_paths(root, env)?);
        let plan = engine.plan(args.target).await?;
        let mut value = serde_json::to_value(plan)?;
        if let Value::Object(object) = &mut value {
            object.insert("dry_run".to_string(), Value::Bool(true));
        }
        return emit_json(value);
    }

    let options =
        MigrationOptions { root_override: root.map(Path::to_path_buf), target_version: args.target };
    let result = run_migrations(&options, env).await?;
    let mut value = serde_json::to_value(result)?;
    if let Value::Object(object) = &mut value {
        object.insert("dry_run".to_string(), Value::Bool(false));
    }
    emit_json(value)
}

async fn run_storage_integrity(root: Option<&Path>, env: &StorageEnv) -> Result<ExitCode> {
    let report = check_session_integrity(root, env).await?;
    let healthy = report.healthy;
    emit_json(report)?;
    if healthy {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(UNHEALTHY_EXIT))
    }
}

async fn run_records_list(root: Option<&Path>, env: &StorageEnv) -> Result<()> {
    let paths = resolve_storage_paths(root, env)?;
    let records = session_log::latest_by_id(read_session_records(&paths.sessions).await?)
        .into_iter()
        .filter(|record| !record.is_tombstone())
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "count": records.len(),
        "records": records
    }))
}
