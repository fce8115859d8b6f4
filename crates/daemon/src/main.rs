// emendared: standalone daemon entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use emendare_daemon::config::DaemonConfig;
use emendare_daemon::runtime;
use emendare_daemon::startup::DaemonPaths;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "emendared", version, about = "Emendare amendment voting daemon")]
struct Args {
    /// Runtime directory for the socket, PID file and database.
    #[arg(long, env = "EMENDARE_HOME")]
    home: Option<PathBuf>,

    /// Config file; defaults to `<home>/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let paths = match args.home {
        Some(home) => DaemonPaths::under(home)?,
        None => DaemonPaths::resolve()?,
    };
    let config = match args.config {
        Some(path) => DaemonConfig::load_from(&path)
            .with_context(|| format!("failed to load `{}`", path.display()))?,
        None => runtime::load_config(&paths)?,
    };

    info!(home = %paths.base_dir.display(), "starting emendare daemon");
    runtime::run_standalone_with(paths, config)
        .await
        .context("daemon terminated unexpectedly")
}
