// `emendare follow` / `emendare unfollow`: manage voting eligibility.

use clap::Args;
use emendare_common::protocol::rpc_methods;
use emendare_common::types::{DocumentId, DocumentSummary, UserId};
use serde_json::json;

use super::execute;
use crate::client::DaemonClient;
use crate::output::OutputFormat;

#[derive(Debug, Args)]
pub struct FollowArgs {
    pub document_id: DocumentId,

    /// Acting user.
    #[arg(long = "user", env = "EMENDARE_USER")]
    pub user_id: UserId,
}

pub fn run(
    args: FollowArgs,
    client: &DaemonClient,
    format: OutputFormat,
    follow: bool,
) -> anyhow::Result<()> {
    let method = if follow { rpc_methods::DOC_FOLLOW } else { rpc_methods::DOC_UNFOLLOW };
    let params = json!({ "user_id": args.user_id, "document_id": args.document_id });
    execute(format, client.call::<_, DocumentSummary>(method, params), |document| {
        format_following(document, follow)
    })
}

fn format_following(document: &DocumentSummary, follow: bool) -> String {
    let verb = if follow { "Following" } else { "No longer following" };
    format!("{verb} \"{}\" ({} followers)", document.title, document.followers_count)
}
