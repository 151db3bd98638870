//! missionctl: the Mission Control notification delivery daemon and ops CLI.

use missionctl::config::Config;
use missionctl::daemon::{self, DaemonPaths, IpcCommand, IpcResponse};
use missionctl::db::Db;
use missionctl::delivery::gateway::HttpGateway;
use missionctl::delivery::log::AttemptLog;
use missionctl::delivery::worker::{DeliveryStats, DeliveryWorker};
use missionctl::messages::{MessageStore, NewMessage};
use missionctl::notify::store::NotificationStore;
use missionctl::roster::Roster;
use missionctl::tasks::store::{CreateTaskInput, TaskStore};
use missionctl::tasks::types::TaskPriority;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "missionctl", version, about = "Mission Control notification delivery daemon")]
struct Cli {
    /// Path to config.toml (defaults to the instance directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the delivery daemon.
    Start {
        /// Stay attached to the terminal instead of daemonizing.
        #[arg(long)]
        foreground: bool,
        /// Enable debug-level logging.
        #[arg(long)]
        debug: bool,
    },
    /// Stop a running daemon.
    Stop,
    /// Show daemon status and delivery counters.
    Status,
    /// Task operations.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Post a message on a task. Triggers notification fan-out.
    Post {
        /// Task id to post on.
        #[arg(long)]
        task: String,
        /// Posting agent id.
        #[arg(long)]
        from: String,
        /// Explicit mention (repeatable).
        #[arg(long = "mention")]
        mentions: Vec<String>,
        /// Message text.
        content: String,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a new task.
    New {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Initial assignee (repeatable). Assignees seed the subscriber set.
        #[arg(long = "assign")]
        assignees: Vec<String>,
        /// Creating agent id.
        #[arg(long)]
        created_by: String,
        #[arg(long, default_value = "medium")]
        priority: TaskPriority,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Start { foreground, debug } => run_start(config, foreground, debug),
        command => tokio::runtime::Runtime::new()
            .context("failed to start tokio runtime")?
            .block_on(run_client_command(config, command)),
    }
}

/// `start` needs special handling: daemonization forks, and forking must
/// happen before the tokio runtime exists.
fn run_start(config: Config, foreground: bool, debug: bool) -> anyhow::Result<()> {
    let paths = DaemonPaths::new(&config.data_dir());

    if let Some(pid) = daemon::is_running(&paths) {
        anyhow::bail!("missionctl daemon is already running (pid {pid})");
    }

    if !foreground {
        daemon::daemonize(&paths)?;
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run_daemon(config, paths, foreground, debug))
}

async fn run_daemon(
    config: Config,
    paths: DaemonPaths,
    foreground: bool,
    debug: bool,
) -> anyhow::Result<()> {
    if foreground {
        daemon::init_foreground_tracing(debug);
    } else {
        daemon::init_background_tracing(&paths, debug);
    }

    tracing::info!(
        data_dir = %config.data_dir().display(),
        agents = config.agents.len(),
        poll_interval_secs = config.daemon.poll_interval_secs,
        "missionctl daemon starting"
    );

    let db = Db::connect(&config.data_dir()).await?;
    let roster = Roster::from_entries(config.agents.clone());
    if roster.is_empty() {
        tracing::warn!("agent roster is empty, nothing will be delivered");
    }

    let stats = Arc::new(DeliveryStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ipc_handle = daemon::start_ipc_server(&paths, shutdown_tx.clone(), stats.clone()).await?;
    spawn_signal_handler(shutdown_tx);

    let attempt_log = Arc::new(AttemptLog::open(&config.delivery_log_path())?);
    let gateway = HttpGateway::new(&config.gateway);
    let store = NotificationStore::new(db.pool.clone());
    let worker = DeliveryWorker::new(
        store,
        roster,
        gateway,
        attempt_log,
        Duration::from_secs(config.daemon.poll_interval_secs.max(1)),
        stats,
    );

    // Runs until shutdown is requested via IPC or signal.
    worker.run(shutdown_rx).await;

    ipc_handle.abort();
    daemon::cleanup(&paths);
    db.close().await;
    tracing::info!("missionctl daemon stopped");

    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(signal) => signal,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        shutdown_tx.send(true).ok();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received ctrl-c, shutting down");
            shutdown_tx.send(true).ok();
        }
    });
}

async fn run_client_command(config: Config, command: Command) -> anyhow::Result<()> {
    let paths = DaemonPaths::new(&config.data_dir());

    match command {
        Command::Start { .. } => unreachable!("start is handled before the runtime"),
        Command::Stop => {
            let Some(pid) = daemon::is_running(&paths) else {
                println!("missionctl daemon is not running");
                return Ok(());
            };
            match daemon::send_command(&paths, IpcCommand::Shutdown).await? {
                IpcResponse::Ok => {
                    if daemon::wait_for_exit(pid) {
                        println!("missionctl daemon stopped (pid {pid})");
                    } else {
                        println!("shutdown sent but pid {pid} is still running");
                    }
                }
                IpcResponse::Error { message } => anyhow::bail!("daemon error: {message}"),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
            Ok(())
        }
        Command::Status => {
            if daemon::is_running(&paths).is_none() {
                println!("missionctl daemon is not running");
                return Ok(());
            }
            match daemon::send_command(&paths, IpcCommand::Status).await? {
                IpcResponse::Status {
                    pid,
                    uptime_seconds,
                    cycles,
                    delivered,
                    failures,
                } => {
                    println!("missionctl daemon running (pid {pid})");
                    println!("  uptime:    {uptime_seconds}s");
                    println!("  cycles:    {cycles}");
                    println!("  delivered: {delivered}");
                    println!("  failures:  {failures}");
                }
                IpcResponse::Error { message } => anyhow::bail!("daemon error: {message}"),
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
            Ok(())
        }
        Command::Task { command } => match command {
            TaskCommand::New {
                title,
                description,
                assignees,
                created_by,
                priority,
            } => {
                let db = Db::connect(&config.data_dir()).await?;
                let store = TaskStore::new(db.pool.clone());
                let task = store
                    .create(CreateTaskInput {
                        title,
                        description,
                        assignee_ids: assignees,
                        created_by,
                        priority,
                        tags: Vec::new(),
                    })
                    .await?;
                println!("created task {} ({})", task.id, task.title);
                db.close().await;
                Ok(())
            }
        },
        Command::Post {
            task,
            from,
            mentions,
            content,
        } => {
            let db = Db::connect(&config.data_dir()).await?;
            let store = MessageStore::new(db.pool.clone());
            let posted = store
                .post(NewMessage {
                    task_id: task,
                    from_agent_id: from,
                    content,
                    mentions,
                    attachment_ids: Vec::new(),
                })
                .await?;
            if posted.notified.is_empty() {
                println!("posted message {} (no one to notify)", posted.message_id);
            } else {
                println!(
                    "posted message {}, notifying: {}",
                    posted.message_id,
                    posted.notified.join(", ")
                );
            }
            db.close().await;
            Ok(())
        }
    }
}
