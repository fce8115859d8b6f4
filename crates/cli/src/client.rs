use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use emendare_common::protocol::jsonrpc::{Request, RequestId, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::exit_code::RpcFailure;

const SOCKET_RELATIVE_PATH: &str = ".emendare/daemon.sock";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// The daemon socket is missing or refuses connections.
#[derive(Debug)]
pub struct DaemonUnavailable {
    socket_path: PathBuf,
    source: io::Error,
}

impl fmt::Display for DaemonUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemon is not running (socket `{}`)", self.socket_path.display())
    }
}

impl std::error::Error for DaemonUnavailable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
    next_request_id: AtomicI64,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            next_request_id: AtomicI64::new(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Calls `method`, retrying once when the connection drops before a
    /// response arrives. Errors answered by the daemon are never retried.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).context("failed to serialize rpc params")?;
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(method, Some(params), RequestId::Number(id));

        let response = match self.exchange(&request).await {
            Ok(response) => response,
            Err(first_error) if is_retryable_transport_error(&first_error) => {
                self.exchange(&request).await.map_err(|second_error| {
                    second_error.context(format!(
                        "json-rpc call failed after retry; first error: {first_error:#}"
                    ))
                })?
            }
            Err(error) => return Err(error),
        };

        let value = response.into_result().map_err(|error| anyhow!(RpcFailure::from(error)))?;
        serde_json::from_value(value)
            .with_context(|| format!("failed to decode `{method}` result"))
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let mut payload =
            serde_json::to_vec(request).context("failed to serialize json-rpc request")?;
        payload.push(b'\n');

        let stream = timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("timed out connecting to daemon socket")?
            .map_err(|error| {
                if is_daemon_unavailable_kind(error.kind()) {
                    anyhow!(DaemonUnavailable { socket_path: self.socket_path.clone(), source: error })
                } else {
                    anyhow!(error).context(format!(
                        "failed to connect to daemon socket `{}`",
                        self.socket_path.display()
                    ))
                }
            })?;

        let (read_half, mut write_half) = stream.into_split();
        timeout(self.timeout, write_half.write_all(&payload))
            .await
            .context("timed out writing json-rpc request")?
            .context("failed writing json-rpc request to daemon socket")?;
        timeout(self.timeout, write_half.flush())
            .await
            .context("timed out flushing json-rpc request")?
            .context("failed flushing json-rpc request to daemon socket")?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = Vec::new();
        timeout(self.timeout, reader.read_until(b'\n', &mut response_line))
            .await
            .context("timed out waiting for json-rpc response")?
            .context("failed reading json-rpc response from daemon socket")?;

        if response_line.is_empty() {
            return Err(anyhow!(ConnectionDropped));
        }
        serde_json::from_slice(&response_line).context("failed to decode daemon json-rpc response")
    }
}

#[derive(Debug)]
struct ConnectionDropped;

impl fmt::Display for ConnectionDropped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("daemon closed the connection without responding")
    }
}

impl std::error::Error for ConnectionDropped {}

fn is_retryable_transport_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.is::<ConnectionDropped>()
            || cause.downcast_ref::<io::Error>().is_some_and(|io_error| {
                matches!(io_error.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
            })
    })
}

pub fn is_daemon_unavailable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<DaemonUnavailable>())
}

/// `$EMENDARE_HOME/daemon.sock`, else `~/.emendare/daemon.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Some(home) = std::env::var_os("EMENDARE_HOME") {
        return PathBuf::from(home).join("daemon.sock");
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(SOCKET_RELATIVE_PATH)
}

fn is_daemon_unavailable_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused)
}
