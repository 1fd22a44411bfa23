//! Execport node
//!
//! - `run`: export and cleanup iterators against the shared job store
//! - `submit`: queue a new export request
//! - `status` / `list` / `metrics`: inspect the queue

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use execport::local::{
    local_collaborators, LocalBlobStorage, SnapshotLogClients, SnapshotSource,
    StaticAccountStatus, TracingNotificationDispatch,
};
use execport::processors::RefreshingLogStore;
use execport::{CleanupHandler, ExportConfig, ExportHandler, Scheduler, METRICS};
use execport_ids::{AccountId, ExecutionId, ExportJobId, UserGroupId, UserId};
use execport_logging::{init_logging, LogConfig};
use execport_store::{
    ExecutionKind, ExecutionQuery, ExportStatus, JobStore, NewExportJob, NotifyTarget,
    OutputFormat, Requester, SqliteJobStore,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "execport", about = "Execution history export node")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "EXECPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the export and cleanup iterators until Ctrl+C
    Run {
        /// JSON snapshot serving execution history
        #[arg(long, env = "EXECPORT_SNAPSHOT")]
        snapshot: PathBuf,

        /// Accounts whose jobs are deferred (repeatable)
        #[arg(long = "inactive-account")]
        inactive_accounts: Vec<String>,
    },

    /// Queue an export request
    Submit {
        #[arg(long)]
        account: String,

        /// Id of the requesting user
        #[arg(long)]
        requester: String,

        /// Display name of the requesting user
        #[arg(long)]
        requester_name: Option<String>,

        /// Summary format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,

        /// Filter by application id (repeatable)
        #[arg(long = "application")]
        applications: Vec<String>,

        /// Filter by execution kind (workflow, pipeline)
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Filter by execution status (repeatable)
        #[arg(long = "status")]
        statuses: Vec<String>,

        /// Only executions created at or after this time (ms since epoch)
        #[arg(long)]
        created_after: Option<i64>,

        /// Only executions created before this time (ms since epoch)
        #[arg(long)]
        created_before: Option<i64>,

        /// Only executions triggered by this user
        #[arg(long)]
        triggered_by: Option<String>,

        /// Explicit execution ids (repeatable)
        #[arg(long = "execution")]
        executions: Vec<String>,

        /// Notify the requesting user when done
        #[arg(long, conflicts_with = "notify_groups")]
        notify_user: bool,

        /// Notify these user groups when done (repeatable)
        #[arg(long = "notify-group")]
        notify_groups: Vec<String>,
    },

    /// Show one export job
    Status { id: String },

    /// List export jobs, newest first
    List {
        /// Filter by status (queued, ready, failed, expired)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Print queue statistics and counters
    Metrics,
}

fn load_config(path: Option<&Path>) -> Result<ExportConfig> {
    match path {
        Some(path) => ExportConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => Ok(ExportConfig::default()),
    }
}

fn parse_kind(raw: &str) -> Result<ExecutionKind> {
    match raw.to_ascii_lowercase().as_str() {
        "workflow" => Ok(ExecutionKind::Workflow),
        "pipeline" => Ok(ExecutionKind::Pipeline),
        other => bail!("Unknown execution kind: {}", other),
    }
}

async fn run_node(config: ExportConfig, snapshot: &Path, inactive: Vec<String>) -> Result<()> {
    std::fs::create_dir_all(&config.staging_dir).with_context(|| {
        format!("Failed to create staging dir: {}", config.staging_dir.display())
    })?;

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open job store: {}", config.database_path.display()))?,
    );
    let source = Arc::new(SnapshotSource::load(snapshot)?);
    let blobs = Arc::new(LocalBlobStorage::new(config.blob_dir.clone()));
    let accounts = Arc::new(StaticAccountStatus::new(
        inactive.into_iter().map(AccountId::from),
    ));
    let mut collaborators = local_collaborators(
        source.clone(),
        blobs.clone(),
        accounts.clone(),
        Arc::new(TracingNotificationDispatch::new()),
    );
    let supports_in_query = !source.snapshot().single_key_logs;
    collaborators.logs = Arc::new(RefreshingLogStore::new(
        Arc::new(SnapshotLogClients::new(source, config.log_client_ttl())),
        config.log_refresh_margin(),
        supports_in_query,
    ));

    let config = Arc::new(config);
    let export = Scheduler::new(
        store.clone(),
        accounts.clone(),
        Arc::new(ExportHandler::new(
            store.clone(),
            collaborators,
            config.clone(),
        )),
        config.node_id.clone(),
        config.export.clone(),
    );
    let cleanup = Scheduler::new(
        store.clone(),
        accounts,
        Arc::new(CleanupHandler::new(
            store.clone(),
            blobs,
            config.node_id.clone(),
            config.cleanup.interval(),
        )),
        config.node_id.clone(),
        config.cleanup.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let export_task = tokio::spawn(export.run(shutdown_rx.clone()));
    let cleanup_task = tokio::spawn(cleanup.run(shutdown_rx));
    info!(node_id = %config.node_id, "Execport node running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, draining in-flight jobs...");
    let _ = shutdown_tx.send(true);

    export_task.await.context("Export iterator panicked")?;
    cleanup_task.await.context("Cleanup iterator panicked")?;
    info!("Shutdown complete");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            snapshot,
            inactive_accounts,
        } => {
            let mut log = LogConfig::new("execport");
            log.node_id = Some(config.node_id.as_str());
            log.verbose = cli.verbose;
            let log_file = init_logging(log)?;
            info!(log_file = %log_file.display(), "Logging initialized");

            run_node(config, &snapshot, inactive_accounts).await
        }

        Commands::Submit {
            account,
            requester,
            requester_name,
            format,
            applications,
            kinds,
            statuses,
            created_after,
            created_before,
            triggered_by,
            executions,
            notify_user,
            notify_groups,
        } => {
            let output_format = OutputFormat::parse(&format)
                .with_context(|| format!("Unknown output format: {}", format))?;
            let requester_id = UserId::parse(&requester)?;
            let notify_target = if notify_user {
                NotifyTarget::TriggeringUser {
                    user_id: requester_id.clone(),
                }
            } else if !notify_groups.is_empty() {
                NotifyTarget::UserGroups {
                    group_ids: notify_groups.into_iter().map(UserGroupId::from).collect(),
                }
            } else {
                NotifyTarget::None
            };
            let query = ExecutionQuery {
                application_ids: applications,
                kinds: kinds.iter().map(|k| parse_kind(k)).collect::<Result<_>>()?,
                statuses,
                created_after,
                created_before,
                triggered_by,
                execution_ids: executions.into_iter().map(ExecutionId::from).collect(),
            };

            let store = SqliteJobStore::open(&config.database_path).await?;
            let job = store
                .insert(NewExportJob {
                    account_id: AccountId::parse(&account)?,
                    query,
                    output_format,
                    notify_target,
                    requested_by: Requester {
                        name: requester_name.unwrap_or_else(|| requester.clone()),
                        id: requester_id,
                        email: None,
                    },
                })
                .await
                .context("Failed to queue export")?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            store.close().await;
            Ok(())
        }

        Commands::Status { id } => {
            let id = ExportJobId::parse(&id)?;
            let store = SqliteJobStore::open(&config.database_path).await?;
            let job = store.get(&id).await?;
            store.close().await;
            match job {
                Some(job) => {
                    println!("{}", serde_json::to_string_pretty(&job)?);
                    Ok(())
                }
                None => bail!("Export job not found: {}", id),
            }
        }

        Commands::List { status, limit } => {
            let status = match status {
                Some(raw) => Some(
                    ExportStatus::parse(&raw.to_ascii_uppercase())
                        .with_context(|| format!("Unknown status: {}", raw))?,
                ),
                None => None,
            };
            let store = SqliteJobStore::open(&config.database_path).await?;
            let jobs = store.list(status, limit).await?;
            store.close().await;

            println!("{:<38} {:<10} {:<20} {:>6} {:>8}", "ID", "STATUS", "ACCOUNT", "TRIES", "ROWS");
            for job in jobs {
                println!(
                    "{:<38} {:<10} {:<20} {:>6} {:>8}",
                    job.id,
                    job.status,
                    job.account_id,
                    job.attempts,
                    job.total_executions.map(|n| n.to_string()).unwrap_or_default()
                );
            }
            Ok(())
        }

        Commands::Metrics => {
            let store = SqliteJobStore::open(&config.database_path).await?;
            let stats = store.stats().await?;
            store.close().await;

            println!("# TYPE execport_jobs gauge");
            println!("execport_jobs{{status=\"queued\"}} {}", stats.queued);
            println!("execport_jobs{{status=\"ready\"}} {}", stats.ready);
            println!("execport_jobs{{status=\"failed\"}} {}", stats.failed);
            println!("execport_jobs{{status=\"expired\"}} {}", stats.expired);
            println!("execport_jobs_leased {}", stats.leased);
            print!("{}", METRICS.prometheus_format());
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
