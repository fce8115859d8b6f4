// `emendare user`: create or delete participants.

use clap::{Args, Subcommand};
use emendare_common::protocol::rpc_methods;
use emendare_common::types::{User, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::execute;
use crate::client::DaemonClient;
use crate::output::OutputFormat;

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    /// Register a new user and print its id
    Create(CreateArgs),
    /// Delete a user, retracting their open votes and follows
    Delete(DeleteArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    pub name: String,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
struct Deleted {
    ok: bool,
}

pub fn run(cmd: UserCommand, client: &DaemonClient, format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        UserCommand::Create(args) => execute(
            format,
            client.call::<_, User>(rpc_methods::USER_CREATE, json!({ "name": args.name })),
            format_created,
        ),
        UserCommand::Delete(args) => execute(
            format,
            client.call::<_, Deleted>(rpc_methods::USER_DELETE, json!({ "user_id": args.user_id })),
            |_| format!("Deleted user {}", args.user_id),
        ),
    }
}

fn format_created(user: &User) -> String {
    format!("Created user {} ({})", user.name, user.id)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn created_user_shows_name_and_id() {
        let user = User::new("ada", Utc::now());
        let line = format_created(&user);
        assert!(line.contains("ada"));
        assert!(line.contains(&user.id.to_string()));
    }
}
