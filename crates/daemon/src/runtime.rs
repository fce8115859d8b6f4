// Daemon lifecycle: open storage, start the engine and its closure
// scheduler, serve RPC until shutdown, then clean up runtime files.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use emendare_common::protocol::jsonrpc::{Request, RequestId, Response};
use emendare_common::protocol::rpc_methods;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{DaemonConfig, StorageBackend};
use crate::engine::scheduler::start_closure_scheduler;
use crate::engine::{Engine, EngineSettings};
use crate::notify::BroadcastPublisher;
use crate::rpc::methods::RpcServerState;
use crate::rpc::unix::serve_unix_until_shutdown;
use crate::rpc::ws::{self, HttpState};
use crate::startup::{
    bind_socket, is_daemon_running, remove_pid_file, write_pid_file, DaemonPaths,
};
use crate::store::{MemoryStore, SqliteStore, Store};

const STOP_WAIT_RETRIES: usize = 40;
const STOP_WAIT_DELAY: Duration = Duration::from_millis(50);
const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running daemon. Dropping the handle requests shutdown.
pub struct DaemonHandle {
    shutdown_tx: broadcast::Sender<()>,
    engine: Engine,
    http_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Bound address of the HTTP / WebSocket server, when enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits until the daemon stops, either through [`Self::shutdown`]
    /// or a `daemon.shutdown` request.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "daemon supervisor task ended abnormally");
            }
        }
    }

    pub async fn stop(self) {
        self.shutdown();
        self.join().await;
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub async fn run_standalone() -> Result<()> {
    let paths = DaemonPaths::resolve()?;
    let config = load_config(&paths)?;
    run_standalone_with(paths, config).await
}

pub async fn run_standalone_with(paths: DaemonPaths, config: DaemonConfig) -> Result<()> {
    let handle = start(paths, config).await?;

    let ctrl_c_tx = handle.shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = ctrl_c_tx.send(());
        }
    });

    handle.join().await;
    info!("daemon stopped");
    Ok(())
}

/// Config from `<base_dir>/config.toml`, or defaults when it is absent.
pub fn load_config(paths: &DaemonPaths) -> Result<DaemonConfig> {
    let path = paths.config_path();
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    DaemonConfig::load_from(&path).with_context(|| format!("failed to load `{}`", path.display()))
}

pub async fn start(paths: DaemonPaths, config: DaemonConfig) -> Result<DaemonHandle> {
    config.validate()?;

    let store = open_store(&paths, &config)?;
    let publisher = BroadcastPublisher::default();
    let engine =
        Engine::new(store, Arc::new(publisher.clone()), EngineSettings::from(&config.voting));

    let listener = bind_socket(&paths.socket_path).await?;
    write_pid_file(&paths.pid_path)?;

    let (shutdown_tx, unix_shutdown_rx) = broadcast::channel(4);
    let rpc_state = RpcServerState::new(engine.clone()).with_shutdown_notifier(shutdown_tx.clone());

    let (http_addr, http_task) = if config.server.ws_enabled {
        let http_listener = TcpListener::bind(config.server.ws_addr)
            .await
            .with_context(|| format!("failed to bind http server on {}", config.server.ws_addr))?;
        let http_addr = http_listener.local_addr().context("failed to read http address")?;
        let state = HttpState::new(rpc_state.clone(), publisher);
        let http_shutdown_rx = shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            if let Err(error) = ws::serve_until_shutdown(http_listener, state, http_shutdown_rx).await
            {
                warn!(?error, "http server terminated unexpectedly");
            }
        });
        info!(%http_addr, "http server listening");
        (Some(http_addr), Some(task))
    } else {
        (None, None)
    };

    let scheduler = start_closure_scheduler(engine.clone(), config.scheduler.tick_interval());

    info!(
        socket_path = %paths.socket_path.display(),
        backend = ?config.storage.backend,
        delay_min_sec = config.voting.delay_min_sec,
        delay_max_sec = config.voting.delay_max_sec,
        "daemon started"
    );

    let task = tokio::spawn(async move {
        if let Err(error) = serve_unix_until_shutdown(listener, rpc_state, unix_shutdown_rx).await {
            warn!(?error, "unix rpc server terminated unexpectedly");
        }
        scheduler.shutdown().await;
        if let Some(http_task) = http_task {
            if tokio::time::timeout(HTTP_DRAIN_TIMEOUT, http_task).await.is_err() {
                warn!("http connections still open at shutdown");
            }
        }
        cleanup_paths(&paths);
    });

    Ok(DaemonHandle { shutdown_tx, engine, http_addr, task: Some(task) })
}

fn open_store(paths: &DaemonPaths, config: &DaemonConfig) -> Result<Arc<dyn Store>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("using in-memory storage; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let path = config.storage.resolved_database_path(&paths.base_dir);
            let store = SqliteStore::open(&path)
                .with_context(|| format!("failed to open database `{}`", path.display()))?;
            info!(path = %path.display(), "database opened");
            Ok(Arc::new(store))
        }
    }
}

/// Asks the daemon on `socket_path` to exit and waits until it stops
/// accepting connections. Does nothing when no daemon is running.
pub async fn stop_running_daemon(socket_path: &Path) -> Result<()> {
    if !is_daemon_running(socket_path).await {
        return Ok(());
    }

    request_daemon_shutdown(socket_path).await?;
    for _ in 0..STOP_WAIT_RETRIES {
        if !is_daemon_running(socket_path).await {
            return Ok(());
        }
        tokio::time::sleep(STOP_WAIT_DELAY).await;
    }

    Err(anyhow!("daemon at `{}` did not exit after shutdown request", socket_path.display()))
}

async fn request_daemon_shutdown(socket_path: &Path) -> Result<()> {
    let request = Request::new(rpc_methods::DAEMON_SHUTDOWN, None, RequestId::Number(1));
    let mut encoded =
        serde_json::to_vec(&request).context("failed to serialize daemon shutdown request")?;
    encoded.push(b'\n');

    let mut stream =
        UnixStream::connect(socket_path).await.context("failed to connect to running daemon")?;
    stream.write_all(&encoded).await.context("failed to send daemon shutdown request")?;
    stream.flush().await.context("failed to flush daemon shutdown request")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let bytes_read =
        reader.read_line(&mut line).await.context("failed to read daemon shutdown response")?;
    if bytes_read == 0 {
        return Ok(());
    }

    let response: Response =
        serde_json::from_str(line.trim()).context("failed to decode daemon shutdown response")?;
    if let Some(error) = response.error {
        return Err(anyhow!("daemon refused shutdown request: {}", error.message));
    }
    Ok(())
}

fn cleanup_paths(paths: &DaemonPaths) {
    remove_pid_file(&paths.pid_path);
    if let Err(error) = std::fs::remove_file(&paths.socket_path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(%error, "failed to remove socket file");
        }
    }
}
