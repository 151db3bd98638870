//! Process daemonization and IPC for background operation.

use crate::delivery::worker::DeliveryStats;

use anyhow::{Context as _, anyhow};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Commands sent from the CLI client to the running daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum IpcCommand {
    Shutdown,
    Status,
}

/// Responses from the daemon back to the CLI client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok,
    Status {
        pid: u32,
        uptime_seconds: u64,
        cycles: u64,
        delivered: u64,
        failures: u64,
    },
    Error {
        message: String,
    },
}

/// Paths for daemon runtime files, all derived from the instance directory.
pub struct DaemonPaths {
    pub pid_file: PathBuf,
    pub socket: PathBuf,
    pub log_dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(instance_dir: &std::path::Path) -> Self {
        Self {
            pid_file: instance_dir.join("missionctl.pid"),
            socket: instance_dir.join("missionctl.sock"),
            log_dir: instance_dir.join("logs"),
        }
    }
}

/// Check whether a daemon is already running by testing PID file liveness
/// and socket connectivity.
#[cfg(unix)]
pub fn is_running(paths: &DaemonPaths) -> Option<u32> {
    let pid = read_pid_file(&paths.pid_file)?;

    if !is_process_alive(pid) {
        cleanup_stale_files(paths);
        return None;
    }

    if paths.socket.exists() {
        if let Ok(stream) = std::os::unix::net::UnixStream::connect(&paths.socket) {
            drop(stream);
            return Some(pid);
        }
        // Socket exists but can't connect — stale
        cleanup_stale_files(paths);
        return None;
    }

    // PID alive but no socket — process may be starting up or crashed
    // without cleanup. Trust the PID.
    Some(pid)
}

#[cfg(not(unix))]
pub fn is_running(paths: &DaemonPaths) -> Option<u32> {
    let pid = read_pid_file(&paths.pid_file)?;

    if !is_process_alive(pid) {
        cleanup_stale_files(paths);
        return None;
    }

    Some(pid)
}

/// Daemonize the current process. Returns in the child; the parent exits.
/// Must run before the tokio runtime starts; forking a live runtime is
/// undefined behavior territory.
#[cfg(unix)]
pub fn daemonize(paths: &DaemonPaths) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.log_dir).with_context(|| {
        format!(
            "failed to create log directory: {}",
            paths.log_dir.display()
        )
    })?;

    let stdout = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_dir.join("missionctl.out"))
        .context("failed to open stdout log")?;

    let stderr = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_dir.join("missionctl.err"))
        .context("failed to open stderr log")?;

    let daemonize = daemonize::Daemonize::new()
        .pid_file(&paths.pid_file)
        .chown_pid_file(true)
        .stdout(stdout)
        .stderr(stderr);

    daemonize
        .start()
        .map_err(|error| anyhow!("failed to daemonize: {error}"))?;

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize(_paths: &DaemonPaths) -> anyhow::Result<()> {
    Err(anyhow!("background daemon mode is not supported on this target"))
}

/// Initialize tracing for background (daemon) mode: daily-rolling file logs.
pub fn init_background_tracing(paths: &DaemonPaths, debug: bool) {
    let file_appender = tracing_appender::rolling::daily(&paths.log_dir, "missionctl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard so the non-blocking writer lives for the entire process.
    // The process owns this — it's cleaned up on exit.
    std::mem::forget(guard);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

/// Initialize tracing for foreground (terminal) mode.
pub fn init_foreground_tracing(debug: bool) {
    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

/// Start the IPC server. Shutdown requests flip the provided watch channel,
/// which the delivery worker selects on.
#[cfg(unix)]
pub async fn start_ipc_server(
    paths: &DaemonPaths,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<DeliveryStats>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    // Ensure the instance directory exists (e.g. on first run)
    if let Some(parent) = paths.socket.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create instance directory: {}", parent.display())
        })?;
    }

    // Clean up any stale socket file
    if paths.socket.exists() {
        std::fs::remove_file(&paths.socket).with_context(|| {
            format!("failed to remove stale socket: {}", paths.socket.display())
        })?;
    }

    write_pid_file(&paths.pid_file)?;

    let listener = UnixListener::bind(&paths.socket)
        .with_context(|| format!("failed to bind IPC socket: {}", paths.socket.display()))?;

    let start_time = Instant::now();

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _address)) => {
                    let shutdown_tx = shutdown_tx.clone();
                    let stats = stats.clone();
                    let uptime = start_time.elapsed();
                    tokio::spawn(async move {
                        if let Err(error) =
                            handle_ipc_stream(stream, &shutdown_tx, &stats, uptime).await
                        {
                            tracing::warn!(%error, "IPC connection handler failed");
                        }
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to accept IPC connection");
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(not(unix))]
pub async fn start_ipc_server(
    _paths: &DaemonPaths,
    _shutdown_tx: watch::Sender<bool>,
    _stats: Arc<DeliveryStats>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    Err(anyhow!("daemon IPC is not supported on this target"))
}

/// Send a command to the running daemon and return the response.
#[cfg(unix)]
pub async fn send_command(paths: &DaemonPaths, command: IpcCommand) -> anyhow::Result<IpcResponse> {
    let stream = UnixStream::connect(&paths.socket)
        .await
        .with_context(|| "failed to connect to missionctl daemon. is it running?")?;
    send_command_over_stream(stream, command).await
}

#[cfg(not(unix))]
pub async fn send_command(
    _paths: &DaemonPaths,
    _command: IpcCommand,
) -> anyhow::Result<IpcResponse> {
    Err(anyhow!("daemon IPC is not supported on this target"))
}

async fn handle_ipc_stream<S>(
    stream: S,
    shutdown_tx: &watch::Sender<bool>,
    stats: &DeliveryStats,
    uptime: std::time::Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = tokio::io::BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let command: IpcCommand =
        serde_json::from_str(line.trim()).map_err(|error| anyhow!("invalid IPC command: {error}"))?;

    let response = match command {
        IpcCommand::Shutdown => {
            tracing::info!("shutdown requested via IPC");
            shutdown_tx.send(true).ok();
            IpcResponse::Ok
        }
        IpcCommand::Status => {
            let snapshot = stats.snapshot();
            IpcResponse::Status {
                pid: std::process::id(),
                uptime_seconds: uptime.as_secs(),
                cycles: snapshot.cycles,
                delivered: snapshot.delivered,
                failures: snapshot.failures,
            }
        }
    };

    let mut response_bytes = serde_json::to_vec(&response)?;
    response_bytes.push(b'\n');
    writer.write_all(&response_bytes).await?;
    writer.flush().await?;

    Ok(())
}

async fn send_command_over_stream<S>(stream: S, command: IpcCommand) -> anyhow::Result<IpcResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut command_bytes = serde_json::to_vec(&command)?;
    command_bytes.push(b'\n');
    writer.write_all(&command_bytes).await?;
    writer.flush().await?;

    let mut reader = tokio::io::BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    serde_json::from_str(line.trim()).map_err(|error| anyhow!("invalid IPC response: {error}"))
}

/// Clean up PID and socket files on shutdown.
pub fn cleanup(paths: &DaemonPaths) {
    if let Err(error) = std::fs::remove_file(&paths.pid_file)
        && error.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(%error, "failed to remove PID file");
    }
    if let Err(error) = std::fs::remove_file(&paths.socket)
        && error.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(%error, "failed to remove socket file");
    }
}

fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok()
}

fn write_pid_file(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create PID directory: {}", parent.display())
        })?;
    }

    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write PID file: {}", path.display()))
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // kill(pid, 0) checks if the process exists without sending a signal
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    false
}

fn cleanup_stale_files(paths: &DaemonPaths) {
    let _ = std::fs::remove_file(&paths.pid_file);
    let _ = std::fs::remove_file(&paths.socket);
}

/// Wait for the daemon process to exit after sending a shutdown command.
/// Polls the PID with a short interval, times out after 10 seconds.
pub fn wait_for_exit(pid: u32) -> bool {
    for _ in 0..100 {
        if !is_process_alive(pid) {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let path = dir.path().join("missionctl.pid");

        write_pid_file(&path).expect("pid file should write");
        assert_eq!(read_pid_file(&path), Some(std::process::id()));
    }

    #[test]
    fn read_pid_file_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let path = dir.path().join("missionctl.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();

        assert_eq!(read_pid_file(&path), None);
        assert_eq!(read_pid_file(&dir.path().join("missing.pid")), None);
    }

    #[test]
    fn ipc_commands_use_tagged_json() {
        let raw = serde_json::to_string(&IpcCommand::Status).unwrap();
        assert_eq!(raw, r#"{"command":"status"}"#);

        let parsed: IpcCommand = serde_json::from_str(r#"{"command":"shutdown"}"#).unwrap();
        assert!(matches!(parsed, IpcCommand::Shutdown));
    }

    #[tokio::test]
    async fn status_reply_carries_delivery_counters() {
        let stats = DeliveryStats::default();
        stats.cycles.fetch_add(3, std::sync::atomic::Ordering::Relaxed);
        stats
            .delivered
            .fetch_add(2, std::sync::atomic::Ordering::Relaxed);

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (client, server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            handle_ipc_stream(
                server,
                &shutdown_tx,
                &stats,
                std::time::Duration::from_secs(42),
            )
            .await
        });

        let response = send_command_over_stream(client, IpcCommand::Status)
            .await
            .expect("status round trip should succeed");
        server_task.await.unwrap().unwrap();

        match response {
            IpcResponse::Status {
                uptime_seconds,
                cycles,
                delivered,
                failures,
                ..
            } => {
                assert_eq!(uptime_seconds, 42);
                assert_eq!(cycles, 3);
                assert_eq!(delivered, 2);
                assert_eq!(failures, 0);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_command_flips_the_watch_channel() {
        let stats = DeliveryStats::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (client, server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            handle_ipc_stream(
                server,
                &shutdown_tx,
                &stats,
                std::time::Duration::from_secs(1),
            )
            .await
        });

        let response = send_command_over_stream(client, IpcCommand::Shutdown)
            .await
            .expect("shutdown round trip should succeed");
        server_task.await.unwrap().unwrap();

        assert!(matches!(response, IpcResponse::Ok));
        assert!(*shutdown_rx.borrow());
    }
}
