// `emendare propose`: diff an edited copy of a document against a base
// version and submit the result as an amendment.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Args;
use emendare_common::diff::{self, Patch};
use emendare_common::protocol::rpc_methods;
use emendare_common::types::{Amendment, DocumentId, DocumentSummary, UserId};
use serde_json::json;

use super::document::body_at;
use super::execute;
use crate::client::DaemonClient;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ProposeArgs {
    pub document_id: DocumentId,

    /// Edited copy of the document body.
    #[arg(long)]
    file: PathBuf,

    #[arg(long)]
    name: String,

    #[arg(long, default_value = "")]
    description: String,

    /// Version the edit was made against; defaults to the current one.
    #[arg(long)]
    base_version: Option<usize>,

    /// Seconds before an absolute majority may close the vote.
    #[arg(long)]
    delay_min: Option<u64>,

    /// Seconds after which the relative majority decides.
    #[arg(long)]
    delay_max: Option<u64>,

    #[arg(long = "user", env = "EMENDARE_USER")]
    user_id: UserId,
}

pub fn run(args: ProposeArgs, client: &DaemonClient, format: OutputFormat) -> anyhow::Result<()> {
    execute(format, propose(client, args, format), format_proposed)
}

async fn propose(
    client: &DaemonClient,
    args: ProposeArgs,
    format: OutputFormat,
) -> anyhow::Result<Amendment> {
    let edited = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read `{}`", args.file.display()))?;

    let document: DocumentSummary =
        client.call(rpc_methods::DOC_GET, json!({ "document_id": args.document_id })).await?;
    let base_version = args.base_version.unwrap_or(document.version);
    let base_body = if base_version == document.version {
        document.body
    } else {
        body_at(client, args.document_id, base_version).await?.body
    };

    if base_version < document.version {
        output::print_warning(
            format,
            "BEHIND_CURRENT",
            &format!(
                "base v{base_version} is behind current v{}; the patch will be fuzzily rebased at merge time",
                document.version
            ),
        );
    }

    let patch = patch_for(&base_body, &edited)?;
    client
        .call(
            rpc_methods::AMEND_PROPOSE,
            json!({
                "document_id": args.document_id,
                "author_id": args.user_id,
                "name": args.name,
                "description": args.description,
                "base_version": base_version,
                "patch": patch,
                "delay_min_sec": args.delay_min,
                "delay_max_sec": args.delay_max,
            }),
        )
        .await
}

fn patch_for(base_body: &str, edited: &str) -> anyhow::Result<Patch> {
    let patch = diff::diff(base_body, edited);
    if patch.is_empty() {
        bail!("edited file is identical to the base version; nothing to propose");
    }
    Ok(patch)
}

fn format_proposed(amendment: &Amendment) -> String {
    format!(
        "Proposed \"{}\" ({} hunks against v{})\nid: {}\nvoting closes by {}",
        amendment.name,
        amendment.patch.len(),
        amendment.base_version,
        amendment.id,
        amendment.deadline().to_rfc3339()
    )
}
