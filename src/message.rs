//! The wire message schema exchanged between roles.
//!
//! Every message is one `bincode`-encoded `Message` value per UDP datagram:
//! one self-delimited, self-describing unit per message, framed by the
//! datagram boundary rather than a line terminator, so arbitrary value bytes
//! never need text escaping.

use serde_derive::{Deserialize, Serialize};

use crate::ballot::Ballot;
use crate::value::{SubmissionId, Value};

/// A position in the decided log. Slot 0 is the first decision.
pub type Slot = u64;

/// Which phase a NACK is rejecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackPhase {
    Prepare,
    Accept,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Phase 1a: proposer -> acceptor.
    Prepare { slot: Slot, ballot: Ballot },

    /// Phase 1b: acceptor -> proposer, reply to `Prepare`.
    Promise {
        slot: Slot,
        ballot: Ballot,
        /// The acceptor's `(accepted_ballot, accepted_value)`, if any.
        accepted: Option<(Ballot, Value)>,
    },

    /// Reply to a `Prepare` or `Accept` that lost to a higher ballot.
    Nack { slot: Slot, promised: Ballot, phase: NackPhase },

    /// Phase 2a: proposer -> acceptor.
    Accept { slot: Slot, ballot: Ballot, value: Value },

    /// Phase 2b: acceptor -> learners (broadcast) and -> the proposer that
    /// sent the corresponding `Accept` (unicast), so the proposer can observe
    /// its own outcome without needing a separate notification channel.
    Accepted { slot: Slot, ballot: Ballot, value: Value, acceptor_id: u64 },

    /// Client -> every proposer.
    Submit { id: SubmissionId, value: Vec<u8> },

    /// Learner -> one peer learner, requesting every decision from `from_slot` on.
    CatchupRequest { from_slot: Slot },

    /// Peer learner -> requesting learner, one message per known decided slot.
    CatchupReply { slot: Slot, value: Value },
}
