// `emendare vote`: cast, switch, or retract a vote.

use clap::{Args, ValueEnum};
use emendare_common::protocol::rpc_methods;
use emendare_common::types::{Amendment, AmendmentId, UserId, VoteStance};
use serde_json::json;

use super::execute;
use crate::client::DaemonClient;
use crate::output::OutputFormat;

#[derive(Debug, Args)]
pub struct VoteArgs {
    pub amendment_id: AmendmentId,

    #[arg(value_enum)]
    pub stance: Stance,

    /// Acting user; must follow the amendment's document.
    #[arg(long = "user", env = "EMENDARE_USER")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stance {
    Up,
    Down,
    Retract,
}

impl From<Stance> for VoteStance {
    fn from(stance: Stance) -> Self {
        match stance {
            Stance::Up => Self::Up,
            Stance::Down => Self::Down,
            Stance::Retract => Self::Retract,
        }
    }
}

pub fn run(args: VoteArgs, client: &DaemonClient, format: OutputFormat) -> anyhow::Result<()> {
    let params = json!({
        "amendment_id": args.amendment_id,
        "user_id": args.user_id,
        "stance": VoteStance::from(args.stance),
    });
    execute(format, client.call::<_, Amendment>(rpc_methods::AMEND_VOTE, params), format_vote)
}

fn format_vote(amendment: &Amendment) -> String {
    format!(
        "{}  {}  up {}  down {}",
        amendment.id,
        amendment.status().as_str(),
        amendment.up_votes_count,
        amendment.down_votes_count
    )
}
