//! Client-submitted values, tagged so proposers can deduplicate retransmissions.

use std::borrow::Cow;

use serde_derive::{Deserialize, Serialize};

/// Identifies a single client submission. Two submissions with the same
/// `(client_id, seq)` are the same submission, possibly retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId {
    pub client_id: u64,
    pub seq: u64,
}

/// An opaque value originating from a client, carrying its submission id.
/// Acceptors and learners treat `bytes` as opaque; only the proposer
/// inspects `id` to deduplicate its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub id: SubmissionId,
    pub bytes: Vec<u8>,
}

impl Value {
    pub fn new(id: SubmissionId, bytes: Vec<u8>) -> Self {
        Value { id, bytes }
    }

    /// Lossy text view, used only for logging and for the learner's output
    /// stream (which is defined over text lines).
    pub fn as_text(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.bytes)
    }
}
