// Starts `emendared` on demand when its socket is missing.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tracing::debug;

const CONNECT_RETRIES: usize = 20;
const RETRY_DELAY_MS: u64 = 100;

pub async fn ensure_daemon_running(socket_path: &Path) -> Result<()> {
    match try_connect(socket_path).await {
        Ok(()) => Ok(()),
        Err(err) if should_attempt_launch(err.kind()) && autostart_enabled() => {
            spawn_daemon_process(socket_path)?;
            wait_for_daemon_socket(socket_path).await
        }
        // Left for the RPC call to report as daemon-unavailable.
        Err(err) if should_attempt_launch(err.kind()) => Ok(()),
        Err(err) => Err(err).with_context(|| {
            format!("failed to connect to daemon socket at `{}`", socket_path.display())
        }),
    }
}

fn autostart_enabled() -> bool {
    std::env::var_os("EMENDARE_NO_AUTOSTART").is_none()
}

fn should_attempt_launch(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound)
}

fn daemon_candidates() -> Vec<OsString> {
    match std::env::var_os("EMENDARE_DAEMON_BIN") {
        Some(explicit_binary) => vec![explicit_binary],
        None => vec![OsString::from("emendared")],
    }
}

/// The daemon keeps its socket directly under `--home`.
fn home_for_socket(socket_path: &Path) -> Option<&Path> {
    let is_default_name = socket_path.file_name().is_some_and(|name| name == "daemon.sock");
    is_default_name.then(|| socket_path.parent()).flatten()
}

fn spawn_daemon_process(socket_path: &Path) -> Result<()> {
    let home = home_for_socket(socket_path).ok_or_else(|| {
        anyhow!("cannot start a daemon for socket `{}`; start emendared manually", socket_path.display())
    })?;
    let mut not_found_candidates = Vec::new();

    for candidate in daemon_candidates() {
        let mut command = Command::new(&candidate);
        command.arg("--home").arg(home);
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        match command.spawn() {
            Ok(child) => {
                debug!(pid = child.id(), home = %home.display(), "spawned daemon");
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                not_found_candidates.push(candidate);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to spawn daemon process with binary `{candidate:?}`")
                });
            }
        }
    }

    Err(anyhow!(
        "unable to find daemon binary (tried: {})",
        not_found_candidates
            .iter()
            .map(|name| name.to_string_lossy())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

async fn try_connect(socket_path: &Path) -> io::Result<()> {
    UnixStream::connect(socket_path).await.map(|_| ())
}

async fn wait_for_daemon_socket(socket_path: &Path) -> Result<()> {
    let mut last_error: Option<io::Error> = None;

    for _ in 0..CONNECT_RETRIES {
        match try_connect(socket_path).await {
            Ok(()) => return Ok(()),
            Err(err) if should_attempt_launch(err.kind()) => {
                last_error = Some(err);
                sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "daemon started but socket connection failed at `{}`",
                        socket_path.display()
                    )
                });
            }
        }
    }

    Err(anyhow!(
        "daemon socket did not become available at `{}` after {} retries; last error: {}",
        socket_path.display(),
        CONNECT_RETRIES,
        last_error.map(|err| err.to_string()).unwrap_or_else(|| "unknown".to_string())
    ))
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn launches_when_socket_missing_or_refused() {
        assert!(should_attempt_launch(ErrorKind::NotFound));
        assert!(should_attempt_launch(ErrorKind::ConnectionRefused));
        assert!(!should_attempt_launch(ErrorKind::PermissionDenied));
    }

    #[test]
    fn home_is_the_socket_directory() {
        let socket = PathBuf::from("/tmp/emendare-home/daemon.sock");
        assert_eq!(home_for_socket(&socket), Some(Path::new("/tmp/emendare-home")));
        assert_eq!(home_for_socket(Path::new("/tmp/custom.sock")), None);
    }
}
