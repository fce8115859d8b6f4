// `emendare amendment`: show an amendment's state and, optionally, the
// change it proposes.

use clap::Args;
use emendare_common::diff::DiffOp;
use emendare_common::protocol::rpc_methods;
use emendare_common::types::{Amendment, AmendmentId};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::execute;
use crate::client::DaemonClient;
use crate::output::OutputFormat;

#[derive(Debug, Args)]
pub struct AmendmentArgs {
    pub amendment_id: AmendmentId,

    /// Also show the proposed change against its base version.
    #[arg(long)]
    preview: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub amendment_id: AmendmentId,
    pub base_version: usize,
    pub base_body: String,
    pub proposed_body: String,
    pub clean: bool,
    pub ops: Vec<DiffOp>,
}

#[derive(Debug, Serialize)]
struct AmendmentView {
    amendment: Amendment,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview: Option<Preview>,
}

pub fn run(args: AmendmentArgs, client: &DaemonClient, format: OutputFormat) -> anyhow::Result<()> {
    execute(format, fetch(client, args.amendment_id, args.preview), format_view)
}

async fn fetch(
    client: &DaemonClient,
    amendment_id: AmendmentId,
    preview: bool,
) -> anyhow::Result<AmendmentView> {
    let params = json!({ "amendment_id": amendment_id });
    let amendment = client.call(rpc_methods::AMEND_GET, params.clone()).await?;
    let preview = if preview { Some(client.call(rpc_methods::AMEND_PREVIEW, params).await?) } else { None };
    Ok(AmendmentView { amendment, preview })
}

fn format_view(view: &AmendmentView) -> String {
    let amendment = &view.amendment;
    let mut lines = vec![
        format!("{} [{}]", amendment.name, amendment.status().as_str()),
        format!("id:        {}", amendment.id),
        format!("document:  {} (base v{})", amendment.document_id, amendment.base_version),
        format!("votes:     up {}  down {}", amendment.up_votes_count, amendment.down_votes_count),
    ];
    if let Some(electorate) = amendment.total_eligible_voters {
        lines.push(format!("electorate: {electorate}"));
    }
    match (amendment.closed_at, amendment.version) {
        (None, _) => lines.push(format!("closes by: {}", amendment.deadline().to_rfc3339())),
        (Some(closed_at), Some(version)) => {
            lines.push(format!("merged:    {} as v{}", closed_at.to_rfc3339(), version + 1));
        }
        (Some(closed_at), None) => lines.push(format!("closed:    {}", closed_at.to_rfc3339())),
    }
    if !amendment.description.is_empty() {
        lines.push(String::new());
        lines.push(amendment.description.clone());
    }
    if let Some(preview) = &view.preview {
        lines.push(String::new());
        if !preview.clean {
            lines.push("(patch does not apply cleanly to its base version)".to_string());
        }
        lines.push(render_ops(&preview.ops));
    }
    lines.join("\n")
}

/// Inline diff: `[-removed-]` and `{+added+}`.
fn render_ops(ops: &[DiffOp]) -> String {
    ops.iter()
        .map(|op| match op {
            DiffOp::Equal(text) => text.clone(),
            DiffOp::Delete(text) => format!("[-{text}-]"),
            DiffOp::Insert(text) => format!("{{+{text}+}}"),
        })
        .collect()
}
