//! Paxos ballot numbers: a totally ordered `(round, proposer_id)` pair.

use serde_derive::{Deserialize, Serialize};

/// A ballot number. Ballots are compared lexicographically on `(round,
/// proposer_id)`, so ties on `round` are broken by `proposer_id`, which keeps
/// every ballot in the system globally unique as long as `proposer_id`s are
/// unique. Field declaration order matters: it is what makes the derived
/// `Ord` implementation lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u64,
    pub proposer_id: u64,
}

impl Ballot {
    /// The first ballot a proposer ever uses.
    pub fn initial(proposer_id: u64) -> Self {
        Ballot { round: 1, proposer_id }
    }

    /// A ballot strictly greater than both `self` and `other_round`, owned by
    /// the same proposer. Used when escalating after a NACK or a timeout.
    pub fn escalate(self, other_round: u64) -> Self {
        Ballot {
            round: self.round.max(other_round) + 1,
            proposer_id: self.proposer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_dominates_proposer_id() {
        let low_round_high_id = Ballot { round: 1, proposer_id: 99 };
        let high_round_low_id = Ballot { round: 2, proposer_id: 1 };
        assert!(high_round_low_id > low_round_high_id);
    }

    #[test]
    fn proposer_id_breaks_round_ties() {
        let a = Ballot { round: 5, proposer_id: 1 };
        let b = Ballot { round: 5, proposer_id: 2 };
        assert!(b > a);
    }

    #[test]
    fn escalate_is_strictly_greater_than_both_inputs() {
        let b = Ballot { round: 3, proposer_id: 7 };
        let escalated = b.escalate(10);
        assert!(escalated > b);
        assert_eq!(escalated.round, 11);
        assert_eq!(escalated.proposer_id, 7);
    }

    #[test]
    fn escalate_against_lower_round_still_advances() {
        let b = Ballot { round: 3, proposer_id: 7 };
        let escalated = b.escalate(0);
        assert_eq!(escalated.round, 4);
    }
}
