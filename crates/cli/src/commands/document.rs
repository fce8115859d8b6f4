// `emendare document`: create documents, read them at any version, and
// list their amendments.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand, ValueEnum};
use emendare_common::protocol::rpc_methods;
use emendare_common::types::{Amendment, AmendmentStatus, DocumentId, DocumentSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::execute;
use crate::client::DaemonClient;
use crate::output::OutputFormat;

#[derive(Debug, Subcommand)]
pub enum DocumentCommand {
    /// Create a document, optionally seeded from a file
    Create(CreateArgs),
    /// Show a document, or its body at an earlier version
    Show(ShowArgs),
    /// List a document's amendments, oldest first
    Amendments(AmendmentsArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    pub title: String,

    #[arg(long, default_value = "")]
    description: String,

    /// Initial body; empty when omitted.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    pub document_id: DocumentId,

    /// Print the body as it was at this version.
    #[arg(long)]
    at: Option<usize>,
}

#[derive(Debug, Args)]
pub struct AmendmentsArgs {
    pub document_id: DocumentId,

    #[arg(long, value_enum)]
    status: Option<StatusFilter>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusFilter {
    Open,
    Accepted,
    Rejected,
    Conflicted,
}

impl From<StatusFilter> for AmendmentStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Open => Self::Open,
            StatusFilter::Accepted => Self::Accepted,
            StatusFilter::Rejected => Self::Rejected,
            StatusFilter::Conflicted => Self::Conflicted,
        }
    }
}

/// Body of a document at one version, as returned by `doc.at_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedBody {
    pub document_id: DocumentId,
    pub version: usize,
    pub body: String,
}

pub fn run(cmd: DocumentCommand, client: &DaemonClient, format: OutputFormat) -> anyhow::Result<()> {
    match cmd {
        DocumentCommand::Create(args) => execute(format, create(client, args), format_summary),
        DocumentCommand::Show(ShowArgs { document_id, at: None }) => execute(
            format,
            client.call::<_, DocumentSummary>(
                rpc_methods::DOC_GET,
                json!({ "document_id": document_id }),
            ),
            format_summary,
        ),
        DocumentCommand::Show(ShowArgs { document_id, at: Some(version) }) => {
            execute(format, body_at(client, document_id, version), format_versioned)
        }
        DocumentCommand::Amendments(args) => {
            let mut params = json!({ "document_id": args.document_id });
            if let Some(status) = args.status {
                params["status"] = json!(AmendmentStatus::from(status));
            }
            execute(
                format,
                client.call::<_, Vec<Amendment>>(rpc_methods::DOC_AMENDMENTS, params),
                |amendments| format_amendment_list(amendments),
            )
        }
    }
}

async fn create(client: &DaemonClient, args: CreateArgs) -> anyhow::Result<DocumentSummary> {
    let body = match &args.file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read `{}`", path.display()))?,
        None => String::new(),
    };
    client
        .call(
            rpc_methods::DOC_CREATE,
            json!({ "title": args.title, "description": args.description, "body": body }),
        )
        .await
}

pub(crate) async fn body_at(
    client: &DaemonClient,
    document_id: DocumentId,
    version: usize,
) -> anyhow::Result<VersionedBody> {
    client
        .call(rpc_methods::DOC_AT_VERSION, json!({ "document_id": document_id, "version": version }))
        .await
}

fn format_summary(document: &DocumentSummary) -> String {
    let mut lines = vec![
        format!("# {} (v{})", document.title, document.version),
        format!("id: {}", document.id),
        format!("followers: {}", document.followers_count),
    ];
    if !document.description.is_empty() {
        lines.push(format!("description: {}", document.description));
    }
    lines.push(String::new());
    lines.push(document.body.clone());
    lines.join("\n")
}

fn format_versioned(body: &VersionedBody) -> String {
    format!("# {} at v{}\n\n{}", body.document_id, body.version, body.body)
}

fn format_amendment_list(amendments: &[Amendment]) -> String {
    if amendments.is_empty() {
        return "No amendments.".to_string();
    }
    amendments
        .iter()
        .map(|amendment| {
            format!(
                "{}  {:<10}  +{} -{}  base v{}  {}",
                amendment.id,
                amendment.status().as_str(),
                amendment.up_votes_count,
                amendment.down_votes_count,
                amendment.base_version,
                amendment.name
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
