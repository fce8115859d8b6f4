// Vote bookkeeping on an (amendment, user) pair.
//
// Counters on the amendment and membership sets on the user move together:
// for every amendment, `up_votes_count` equals the number of users whose
// `up_votes` contains it (and likewise for down).

use emendare_common::types::{Amendment, User, VoteStance};

use super::error::EngineError;

/// What a vote did: the stance held before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteChange {
    pub previous: Option<VoteStance>,
    pub current: Option<VoteStance>,
}

impl VoteChange {
    pub fn is_noop(&self) -> bool {
        self.previous == self.current
    }
}

/// Applies `stance` from `user` to an open amendment of a followed document.
pub fn cast(
    amendment: &mut Amendment,
    user: &mut User,
    stance: VoteStance,
) -> Result<VoteChange, EngineError> {
    if amendment.closed {
        return Err(EngineError::AlreadyClosed(amendment.id));
    }
    if !user.follows(amendment.document_id) {
        return Err(EngineError::NotEligible {
            user_id: user.id,
            document_id: amendment.document_id,
        });
    }
    apply_vote(amendment, user, stance)
}

/// Withdraws a vote while removing the user; skips the eligibility gate.
/// Closed amendments keep their frozen tally.
pub fn retract_for_removal(amendment: &mut Amendment, user: &mut User) -> VoteChange {
    let previous = user.stance_on(amendment.id);
    if amendment.closed {
        return VoteChange { previous, current: previous };
    }
    withdraw(amendment, user, previous);
    VoteChange { previous, current: None }
}

fn apply_vote(
    amendment: &mut Amendment,
    user: &mut User,
    stance: VoteStance,
) -> Result<VoteChange, EngineError> {
    let previous = user.stance_on(amendment.id);
    let current = match stance {
        VoteStance::Retract => None,
        held => Some(held),
    };

    if current.is_some() && previous == current {
        return Err(EngineError::AlreadyVoted { amendment_id: amendment.id, stance });
    }
    if previous == current {
        return Ok(VoteChange { previous, current });
    }

    withdraw(amendment, user, previous);
    match current {
        Some(VoteStance::Up) => {
            user.up_votes.insert(amendment.id);
            amendment.up_votes_count = amendment.up_votes_count.saturating_add(1);
        }
        Some(VoteStance::Down) => {
            user.down_votes.insert(amendment.id);
            amendment.down_votes_count = amendment.down_votes_count.saturating_add(1);
        }
        Some(VoteStance::Retract) | None => {}
    }

    Ok(VoteChange { previous, current })
}

fn withdraw(amendment: &mut Amendment, user: &mut User, previous: Option<VoteStance>) {
    match previous {
        Some(VoteStance::Up) => {
            user.up_votes.remove(&amendment.id);
            amendment.up_votes_count = amendment.up_votes_count.saturating_sub(1);
        }
        Some(VoteStance::Down) => {
            user.down_votes.remove(&amendment.id);
            amendment.down_votes_count = amendment.down_votes_count.saturating_sub(1);
        }
        Some(VoteStance::Retract) | None => {}
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use emendare_common::diff::Patch;
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;

    fn open_amendment() -> Amendment {
        Amendment {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            name: "tweak".to_string(),
            description: String::new(),
            base_version: 0,
            patch: Patch::default(),
            created_at: Utc::now(),
            delay_min_sec: 60,
            delay_max_sec: 600,
            closed: false,
            accepted: false,
            conflicted: false,
            version: None,
            up_votes_count: 0,
            down_votes_count: 0,
            total_eligible_voters: None,
            closed_at: None,
            revision: 0,
        }
    }

    fn follower_of(amendment: &Amendment) -> User {
        let mut user = User::new("voter", Utc::now());
        user.followed_documents.insert(amendment.document_id);
        user
    }

    #[test]
    fn switching_stance_moves_the_vote() {
        let mut amendment = open_amendment();
        let mut user = follower_of(&amendment);

        cast(&mut amendment, &mut user, VoteStance::Up).unwrap();
        assert_eq!((amendment.up_votes_count, amendment.down_votes_count), (1, 0));

        let change = cast(&mut amendment, &mut user, VoteStance::Down).unwrap();
        assert_eq!(change.previous, Some(VoteStance::Up));
        assert_eq!(change.current, Some(VoteStance::Down));
        assert_eq!((amendment.up_votes_count, amendment.down_votes_count), (0, 1));
        assert!(!user.up_votes.contains(&amendment.id));
        assert!(user.down_votes.contains(&amendment.id));
    }

    #[test]
    fn same_stance_twice_is_rejected() {
        let mut amendment = open_amendment();
        let mut user = follower_of(&amendment);
        cast(&mut amendment, &mut user, VoteStance::Up).unwrap();

        let error = cast(&mut amendment, &mut user, VoteStance::Up).unwrap_err();
        assert!(matches!(error, EngineError::AlreadyVoted { stance: VoteStance::Up, .. }));
        assert_eq!(amendment.up_votes_count, 1);
    }

    #[test]
    fn retract_clears_and_repeats_as_noop() {
        let mut amendment = open_amendment();
        let mut user = follower_of(&amendment);
        cast(&mut amendment, &mut user, VoteStance::Up).unwrap();

        let change = cast(&mut amendment, &mut user, VoteStance::Retract).unwrap();
        assert!(!change.is_noop());
        assert_eq!(amendment.up_votes_count, 0);
        assert!(user.voted_amendments().is_empty());

        let again = cast(&mut amendment, &mut user, VoteStance::Retract).unwrap();
        assert!(again.is_noop());
        assert_eq!(amendment.up_votes_count, 0);
    }

    #[test]
    fn non_follower_is_not_eligible() {
        let mut amendment = open_amendment();
        let mut user = User::new("outsider", Utc::now());
        let error = cast(&mut amendment, &mut user, VoteStance::Up).unwrap_err();
        assert!(matches!(error, EngineError::NotEligible { .. }));
        assert_eq!(amendment.up_votes_count, 0);
    }

    #[test]
    fn closed_amendment_refuses_votes() {
        let mut amendment = open_amendment();
        let mut user = follower_of(&amendment);
        amendment.closed = true;
        let error = cast(&mut amendment, &mut user, VoteStance::Down).unwrap_err();
        assert!(matches!(error, EngineError::AlreadyClosed(_)));
        assert!(user.voted_amendments().is_empty());
    }

    #[test]
    fn removal_retract_skips_eligibility_but_respects_closure() {
        let mut amendment = open_amendment();
        let mut user = follower_of(&amendment);
        cast(&mut amendment, &mut user, VoteStance::Down).unwrap();
        user.followed_documents.clear();

        retract_for_removal(&mut amendment, &mut user);
        assert_eq!(amendment.down_votes_count, 0);

        let mut closed = open_amendment();
        let mut voter = follower_of(&closed);
        cast(&mut closed, &mut voter, VoteStance::Up).unwrap();
        closed.closed = true;
        let change = retract_for_removal(&mut closed, &mut voter);
        assert!(change.is_noop());
        assert_eq!(closed.up_votes_count, 1);
    }

    fn stance_strategy() -> impl Strategy<Value = VoteStance> {
        prop_oneof![Just(VoteStance::Up), Just(VoteStance::Down), Just(VoteStance::Retract)]
    }

    proptest! {
        #[test]
        fn counters_match_memberships(
            moves in proptest::collection::vec((0usize..4, stance_strategy()), 0..64)
        ) {
            let mut amendment = open_amendment();
            let mut users: Vec<User> = (0..4).map(|_| follower_of(&amendment)).collect();

            for (voter, stance) in moves {
                let _ = cast(&mut amendment, &mut users[voter], stance);

                let ups = users.iter().filter(|u| u.up_votes.contains(&amendment.id)).count();
                let downs = users.iter().filter(|u| u.down_votes.contains(&amendment.id)).count();
                prop_assert_eq!(amendment.up_votes_count as usize, ups);
                prop_assert_eq!(amendment.down_votes_count as usize, downs);
                for user in &users {
                    prop_assert!(
                        !(user.up_votes.contains(&amendment.id)
                            && user.down_votes.contains(&amendment.id))
                    );
                }
            }
        }
    }
}
