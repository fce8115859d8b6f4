// CLI subcommand dispatch.

use std::future::Future;

use anyhow::Context;
use clap::Subcommand;
use serde::Serialize;

use crate::client::DaemonClient;
use crate::daemon_launcher::ensure_daemon_running;
use crate::output::{self, OutputFormat};

pub mod amendment;
pub mod document;
pub mod follow;
pub mod propose;
pub mod user;
pub mod vote;

#[derive(Subcommand)]
pub enum Command {
    /// Propose an amendment from an edited copy of a document
    Propose(propose::ProposeArgs),
    /// Vote up, down, or retract a vote on an open amendment
    Vote(vote::VoteArgs),
    /// Show an amendment, its tally, and optionally its diff
    Amendment(amendment::AmendmentArgs),
    /// Create, show, or list amendments of a document
    #[command(subcommand)]
    Document(document::DocumentCommand),
    /// Follow a document, becoming eligible to vote on it
    Follow(follow::FollowArgs),
    /// Stop following a document
    Unfollow(follow::FollowArgs),
    /// Create or delete users
    #[command(subcommand)]
    User(user::UserCommand),
}

pub fn run(cmd: Command, client: DaemonClient, format: OutputFormat) -> anyhow::Result<()> {
    if let Err(error) = block_on(ensure_daemon_running(client.socket_path()))? {
        output::print_anyhow_error(format, &error);
        return Err(error);
    }
    match cmd {
        Command::Propose(args) => propose::run(args, &client, format),
        Command::Vote(args) => vote::run(args, &client, format),
        Command::Amendment(args) => amendment::run(args, &client, format),
        Command::Document(cmd) => document::run(cmd, &client, format),
        Command::Follow(args) => follow::run(args, &client, format, true),
        Command::Unfollow(args) => follow::run(args, &client, format, false),
        Command::User(cmd) => user::run(cmd, &client, format),
    }
}

/// Runs `future` on a fresh current-thread runtime.
pub(crate) fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}

/// Prints `result` in `format`; failures go to stderr and are returned.
pub(crate) fn finish<T, F>(format: OutputFormat, result: anyhow::Result<T>, human_fn: F) -> anyhow::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match result {
        Ok(value) => {
            output::print_output(format, &value, human_fn)?;
            Ok(())
        }
        Err(error) => {
            output::print_anyhow_error(format, &error);
            Err(error)
        }
    }
}

/// Drives one RPC workflow to completion and prints its outcome.
pub(crate) fn execute<T, Fut, F>(format: OutputFormat, future: Fut, human_fn: F) -> anyhow::Result<()>
where
    T: Serialize,
    Fut: Future<Output = anyhow::Result<T>>,
    F: FnOnce(&T) -> String,
{
    let result = block_on(future).and_then(|outcome| outcome);
    finish(format, result, human_fn)
}
