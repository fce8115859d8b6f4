// emendare CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode as ProcessExitCode;

use clap::Parser;

mod client;
mod commands;
mod daemon_launcher;
mod exit_code;
mod output;

use client::DaemonClient;
use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "emendare", version, about = "Propose and vote on amendments to shared documents")]
struct Cli {
    /// Daemon socket; defaults to `~/.emendare/daemon.sock`.
    #[arg(long, global = true, env = "EMENDARE_SOCKET")]
    socket: Option<PathBuf>,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> ProcessExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.json);
    let client = cli.socket.map(DaemonClient::new).unwrap_or_default();

    match commands::run(cli.command, client, format) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => ExitCode::from_error(&error).into(),
    }
}
