// Closure decision: pure function of the tally and the clock.

use chrono::Duration;
use emendare_common::types::Amendment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyInput {
    pub up: u32,
    pub down: u32,
    pub eligible_voters: u32,
    pub elapsed: Duration,
    pub delay_min: Duration,
    pub delay_max: Duration,
}

impl PolicyInput {
    pub fn for_amendment(
        amendment: &Amendment,
        live_followers: u32,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            up: amendment.up_votes_count,
            down: amendment.down_votes_count,
            eligible_voters: amendment.eligible_voters(live_followers),
            elapsed: amendment.elapsed(now),
            delay_min: amendment.delay_min(),
            delay_max: amendment.delay_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRule {
    /// More than half of the electorate agreed, after `delay_min`.
    AbsoluteMajority,
    /// `delay_max` elapsed; decided by up versus down.
    RelativeMajority,
}

impl DecisionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AbsoluteMajority => "absolute",
            Self::RelativeMajority => "relative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureDecision {
    StillOpen,
    Close { accepted: bool, rule: DecisionRule },
}

pub fn absolute_threshold(eligible_voters: u32) -> u32 {
    eligible_voters / 2 + 1
}

pub fn evaluate(input: &PolicyInput) -> ClosureDecision {
    let threshold = absolute_threshold(input.eligible_voters);

    if input.elapsed >= input.delay_min {
        if input.up >= threshold {
            return ClosureDecision::Close { accepted: true, rule: DecisionRule::AbsoluteMajority };
        }
        if input.down >= threshold {
            return ClosureDecision::Close {
                accepted: false,
                rule: DecisionRule::AbsoluteMajority,
            };
        }
    }

    if input.elapsed >= input.delay_max {
        return ClosureDecision::Close {
            accepted: input.up > input.down,
            rule: DecisionRule::RelativeMajority,
        };
    }

    ClosureDecision::StillOpen
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn input(up: u32, down: u32, eligible: u32, elapsed_sec: i64) -> PolicyInput {
        PolicyInput {
            up,
            down,
            eligible_voters: eligible,
            elapsed: Duration::seconds(elapsed_sec),
            delay_min: Duration::seconds(60),
            delay_max: Duration::seconds(600),
        }
    }

    #[test]
    fn threshold_is_strict_majority() {
        assert_eq!(absolute_threshold(0), 1);
        assert_eq!(absolute_threshold(1), 1);
        assert_eq!(absolute_threshold(4), 3);
        assert_eq!(absolute_threshold(5), 3);
    }

    #[test]
    fn absolute_majority_waits_for_delay_min() {
        assert_eq!(evaluate(&input(3, 0, 4, 59)), ClosureDecision::StillOpen);
        assert_eq!(
            evaluate(&input(3, 0, 4, 60)),
            ClosureDecision::Close { accepted: true, rule: DecisionRule::AbsoluteMajority }
        );
    }

    #[test]
    fn absolute_down_majority_rejects() {
        assert_eq!(
            evaluate(&input(0, 3, 4, 120)),
            ClosureDecision::Close { accepted: false, rule: DecisionRule::AbsoluteMajority }
        );
    }

    #[test]
    fn two_of_four_is_not_absolute() {
        assert_eq!(evaluate(&input(2, 0, 4, 300)), ClosureDecision::StillOpen);
    }

    #[test]
    fn relative_majority_at_delay_max() {
        assert_eq!(
            evaluate(&input(2, 1, 10, 600)),
            ClosureDecision::Close { accepted: true, rule: DecisionRule::RelativeMajority }
        );
        assert_eq!(
            evaluate(&input(1, 1, 10, 600)),
            ClosureDecision::Close { accepted: false, rule: DecisionRule::RelativeMajority }
        );
    }

    #[test]
    fn no_votes_at_delay_max_rejects() {
        assert_eq!(
            evaluate(&input(0, 0, 4, 601)),
            ClosureDecision::Close { accepted: false, rule: DecisionRule::RelativeMajority }
        );
    }

    #[test]
    fn empty_electorate_single_vote_is_absolute() {
        assert_eq!(
            evaluate(&input(1, 0, 0, 60)),
            ClosureDecision::Close { accepted: true, rule: DecisionRule::AbsoluteMajority }
        );
    }

    proptest! {
        #[test]
        fn decision_is_deterministic_and_closes_by_delay_max(
            up in 0u32..50,
            down in 0u32..50,
            eligible in 0u32..100,
            elapsed in 0i64..1_000,
        ) {
            let sample = input(up, down, eligible, elapsed);
            let decision = evaluate(&sample);
            prop_assert_eq!(decision, evaluate(&sample));
            if elapsed >= 600 {
                prop_assert!(matches!(decision, ClosureDecision::Close { .. }), "expected Close, got {:?}", decision);
            }
            if elapsed < 60 {
                prop_assert_eq!(decision, ClosureDecision::StillOpen);
            }
        }
    }
}
