// Process startup: runtime directory, PID file, Unix socket binding.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::config;

const SOCKET_NAME: &str = "daemon.sock";
/// Diagnostics only; liveness is decided by connecting to the socket.
const PID_FILE_NAME: &str = "daemon.pid";

/// Resolved paths for daemon runtime files.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub base_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
}

impl DaemonPaths {
    /// Resolve (and create) `~/.emendare/`.
    pub fn resolve() -> Result<Self> {
        let base_dir = config::global_dir().context("could not determine home directory")?;
        Self::under(base_dir)
    }

    /// Runtime paths rooted at an explicit directory, which is created
    /// owner-only if missing.
    pub fn under(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create `{}`", base_dir.display()))?;
        ensure_owner_only_dir(&base_dir)?;
        Ok(Self {
            socket_path: base_dir.join(SOCKET_NAME),
            pid_path: base_dir.join(PID_FILE_NAME),
            base_dir,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.toml")
    }
}

pub fn write_pid_file(path: &Path) -> Result<()> {
    let pid = std::process::id();
    let mut file = fs::File::create(path).context("failed to create PID file")?;
    write!(file, "{pid}").context("failed to write PID")?;
    ensure_owner_only_file(path)?;
    info!(pid, path = %path.display(), "wrote PID file");
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "failed to remove PID file");
        }
    }
}

/// Bind the RPC socket, replacing a stale socket file left by a crash.
///
/// Fails if another daemon is still accepting on the path.
pub async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if is_daemon_running(path).await {
            anyhow::bail!("a daemon is already listening on `{}`", path.display());
        }
        fs::remove_file(path).context("failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(path).context("failed to bind Unix socket")?;
    ensure_owner_only_file(path)?;
    info!(path = %path.display(), "daemon socket ready");
    Ok(listener)
}

/// True when something accepts connections on `socket_path`.
pub async fn is_daemon_running(socket_path: &Path) -> bool {
    tokio::net::UnixStream::connect(socket_path).await.is_ok()
}

pub fn ensure_owner_only_file(path: &Path) -> Result<()> {
    restrict_mode(path, 0o600)
}

pub fn ensure_owner_only_dir(path: &Path) -> Result<()> {
    restrict_mode(path, 0o700)
}

fn restrict_mode(path: &Path, wanted: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if !path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read metadata for `{}`", path.display()))?;
        if metadata.permissions().mode() & 0o777 != wanted {
            fs::set_permissions(path, fs::Permissions::from_mode(wanted))
                .with_context(|| format!("failed to set owner-only mode on `{}`", path.display()))?;
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (path, wanted);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_paths(tmp: &TempDir) -> DaemonPaths {
        DaemonPaths::under(tmp.path().join("home")).unwrap()
    }

    #[test]
    fn under_creates_base_dir() {
        let tmp = TempDir::new().unwrap();
        let paths = setup_test_paths(&tmp);
        assert!(paths.base_dir.is_dir());
        assert!(paths.socket_path.ends_with("daemon.sock"));
        assert!(paths.pid_path.ends_with("daemon.pid"));
        assert!(paths.config_path().ends_with("config.toml"));
    }

    #[cfg(unix)]
    #[test]
    fn base_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let paths = setup_test_paths(&tmp);
        let mode = fs::metadata(&paths.base_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn write_and_remove_pid_file() {
        let tmp = TempDir::new().unwrap();
        let paths = setup_test_paths(&tmp);

        write_pid_file(&paths.pid_path).unwrap();
        let pid: u32 = fs::read_to_string(&paths.pid_path).unwrap().parse().unwrap();
        assert_eq!(pid, std::process::id());

        remove_pid_file(&paths.pid_path);
        assert!(!paths.pid_path.exists());
        // Second removal is silent.
        remove_pid_file(&paths.pid_path);
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let paths = setup_test_paths(&tmp);

        let first = bind_socket(&paths.socket_path).await.unwrap();
        drop(first);
        assert!(paths.socket_path.exists());

        let _second = bind_socket(&paths.socket_path).await.unwrap();
        assert!(is_daemon_running(&paths.socket_path).await);
    }

    #[tokio::test]
    async fn bind_refuses_live_socket() {
        let tmp = TempDir::new().unwrap();
        let paths = setup_test_paths(&tmp);

        let _live = bind_socket(&paths.socket_path).await.unwrap();
        let error = bind_socket(&paths.socket_path).await.expect_err("second bind should fail");
        assert!(error.to_string().contains("already listening"));
    }

    #[tokio::test]
    async fn is_daemon_running_false_without_socket() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_daemon_running(&tmp.path().join("nonexistent.sock")).await);
    }
}
