//! The learner role: derives the decided log from ACCEPTED messages, emits
//! it in order, and helps peer learners catch up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ballot::Ballot;
use crate::client::SharedDecisionFeed;
use crate::config::Endpoint;
use crate::error::safety_violation;
use crate::message::{Message, Slot};
use crate::transport::UdpTransport;
use crate::value::Value;

/// How long a learner waits for a `CatchupReply` before retrying against the
/// next peer.
const CATCHUP_TIMEOUT: Duration = Duration::from_millis(500);

/// How often the event loop wakes up even with no traffic, to check whether
/// a catch-up request is due.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Learner<W: Write> {
    id: u64,
    transport: UdpTransport,
    quorum: usize,
    peers: Vec<Endpoint>,
    output: W,

    decisions: BTreeMap<Slot, Value>,
    accepts: HashMap<(Slot, Ballot), (HashSet<u64>, Value)>,
    next_to_emit: Slot,

    catchup_peer_index: usize,
    catchup_inflight_since: Option<Instant>,
    /// Well-formed messages this learner had no handler for (e.g. a stray
    /// `Prepare`), distinct from `malformed_datagram_count`.
    malformed_message_count: u64,
    /// Datagrams dropped by the transport because they didn't decode as a
    /// `Message` at all.
    malformed_datagram_count: u64,

    /// Lets an in-process harness (the `simulate` subcommand, or a test)
    /// observe which submissions this learner has decided, so a `Client`
    /// driven by the same harness can detect completion. `None` for a
    /// standalone learner process, which has no such harness to report to.
    decision_sink: Option<SharedDecisionFeed>,
}

impl<W: Write> Learner<W> {
    pub fn new(id: u64, transport: UdpTransport, quorum: usize, peers: Vec<Endpoint>, output: W) -> Self {
        Learner {
            id,
            transport,
            quorum,
            peers,
            output,
            decisions: BTreeMap::new(),
            accepts: HashMap::new(),
            next_to_emit: 0,
            catchup_peer_index: 0,
            catchup_inflight_since: None,
            malformed_message_count: 0,
            malformed_datagram_count: 0,
            decision_sink: None,
        }
    }

    pub fn with_decision_sink(mut self, sink: SharedDecisionFeed) -> Self {
        self.decision_sink = Some(sink);
        self
    }

    pub fn run(&mut self) -> ! {
        info!("learner {} listening", self.id);
        self.start_catchup_if_behind();
        loop {
            match self.transport.recv_timeout(POLL_INTERVAL) {
                Ok(Some((message, src, dropped))) => {
                    if dropped > 0 {
                        self.malformed_datagram_count += dropped;
                        debug!(
                            "learner {} dropped {} malformed datagram(s) (total={})",
                            self.id, dropped, self.malformed_datagram_count
                        );
                    }
                    self.handle(message, src);
                }
                Ok(None) => {}
                Err(e) => warn!("learner {} recv error: {}", self.id, e),
            }
            self.tick();
        }
    }

    fn handle(&mut self, message: Message, src: SocketAddr) {
        match message {
            Message::Accepted { slot, ballot, value, acceptor_id } => {
                self.on_accepted(slot, ballot, value, acceptor_id)
            }
            Message::CatchupRequest { from_slot } => self.on_catchup_request(from_slot, src),
            Message::CatchupReply { slot, value } => self.on_catchup_reply(slot, value),
            other => {
                self.malformed_message_count += 1;
                debug!(
                    "learner {} ignoring unexpected message {:?} (count={})",
                    self.id, other, self.malformed_message_count
                );
            }
        }
    }

    fn on_accepted(&mut self, slot: Slot, ballot: Ballot, value: Value, acceptor_id: u64) {
        if self.decisions.contains_key(&slot) {
            // Already decided (possibly via catch-up); nothing new to learn,
            // but a mismatching value here would be a genuine safety
            // violation, so still check it.
            self.check_matches_decision(slot, &value);
            return;
        }

        let entry = self
            .accepts
            .entry((slot, ballot))
            .or_insert_with(|| (HashSet::new(), value.clone()));

        if entry.1 != value {
            safety_violation(&format!(
                "learner {}: acceptors disagree on value for (slot={}, ballot={:?})",
                self.id, slot, ballot
            ));
        }

        entry.0.insert(acceptor_id); // idempotent: HashSet ignores duplicates

        if entry.0.len() >= self.quorum {
            self.record_decision(slot, value);
        }
    }

    fn on_catchup_request(&mut self, from_slot: Slot, src: SocketAddr) {
        for (&slot, value) in self.decisions.range(from_slot..) {
            let reply = Message::CatchupReply { slot, value: value.clone() };
            if let Err(e) = self.transport.send(&reply, src) {
                warn!("learner {} failed to send catch-up reply to {}: {}", self.id, src, e);
                break;
            }
        }
    }

    fn on_catchup_reply(&mut self, slot: Slot, value: Value) {
        self.catchup_inflight_since = None;
        self.record_decision(slot, value);
    }

    fn record_decision(&mut self, slot: Slot, value: Value) {
        self.check_matches_decision(slot, &value);
        let id = value.id;
        if self.decisions.insert(slot, value).is_none() {
            debug!("learner {} decided slot {}", self.id, slot);
            if let Some(sink) = &self.decision_sink {
                sink.0.lock().unwrap().insert(id);
            }
        }
        self.emit_ready();
    }

    fn check_matches_decision(&self, slot: Slot, value: &Value) {
        if let Some(existing) = self.decisions.get(&slot) {
            if existing != value {
                safety_violation(&format!(
                    "learner {}: conflicting decisions for slot {}: {:?} vs {:?}",
                    self.id, slot, existing, value
                ));
            }
        }
    }

    /// Invariant L2: emit in contiguous slot order, stalling at any gap.
    fn emit_ready(&mut self) {
        while let Some(value) = self.decisions.get(&self.next_to_emit) {
            writeln!(self.output, "{}", value.as_text()).expect("write to learner output");
            self.output.flush().expect("flush learner output");
            self.next_to_emit += 1;
        }
    }

    /// Periodic housekeeping: (re)issue a catch-up request when the learner
    /// is known to be behind and no request is currently outstanding.
    fn tick(&mut self) {
        if let Some(since) = self.catchup_inflight_since {
            if since.elapsed() < CATCHUP_TIMEOUT {
                return;
            }
            // Timed out waiting on the current peer; round-robin to the next.
            self.catchup_peer_index = (self.catchup_peer_index + 1) % self.peers.len().max(1);
            self.catchup_inflight_since = None;
        }
        self.start_catchup_if_behind();
    }

    fn highest_known_slot(&self) -> Option<Slot> {
        self.decisions.keys().next_back().copied()
    }

    fn start_catchup_if_behind(&mut self) {
        if self.peers.is_empty() || self.catchup_inflight_since.is_some() {
            return;
        }

        let behind = match self.highest_known_slot() {
            // A fresh learner with no accept traffic yet may still be behind
            // an established cluster; probe slot 0.
            None => true,
            Some(highest) => self.next_to_emit <= highest,
        };

        if !behind {
            return;
        }

        let peer = self.peers[self.catchup_peer_index % self.peers.len()];
        let request = Message::CatchupRequest { from_slot: self.next_to_emit };
        match self.transport.send(&request, peer.addr) {
            Ok(()) => self.catchup_inflight_since = Some(Instant::now()),
            Err(e) => warn!("learner {} failed to send catch-up request to {}: {}", self.id, peer.addr, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SubmissionId;
    use std::sync::{Arc, Mutex};

    fn value(seq: u64, text: &str) -> Value {
        Value::new(SubmissionId { client_id: 1, seq }, text.as_bytes().to_vec())
    }

    fn ballot() -> Ballot {
        Ballot { round: 1, proposer_id: 1 }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);
    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // A learner over the in-process decision bookkeeping, with no transport,
    // to unit-test the pure accept/emit/safety logic directly.
    struct BareLearner {
        quorum: usize,
        decisions: BTreeMap<Slot, Value>,
        accepts: HashMap<(Slot, Ballot), (HashSet<u64>, Value)>,
        next_to_emit: Slot,
        output: SharedBuf,
    }

    impl BareLearner {
        fn new(quorum: usize) -> Self {
            BareLearner {
                quorum,
                decisions: BTreeMap::new(),
                accepts: HashMap::new(),
                next_to_emit: 0,
                output: SharedBuf::default(),
            }
        }

        fn accept(&mut self, slot: Slot, ballot: Ballot, value: Value, acceptor_id: u64) {
            if self.decisions.contains_key(&slot) {
                return;
            }
            let entry = self.accepts.entry((slot, ballot)).or_insert_with(|| (HashSet::new(), value));
            entry.0.insert(acceptor_id);
            if entry.0.len() >= self.quorum {
                let value = entry.1.clone();
                self.decisions.insert(slot, value);
                self.emit_ready();
            }
        }

        fn emit_ready(&mut self) {
            while let Some(v) = self.decisions.get(&self.next_to_emit) {
                writeln!(self.output, "{}", v.as_text()).unwrap();
                self.next_to_emit += 1;
            }
        }

        fn output_text(&self) -> String {
            String::from_utf8(self.output.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn decides_on_quorum_and_emits() {
        let mut l = BareLearner::new(2);
        l.accept(0, ballot(), value(0, "a"), 1);
        assert_eq!(l.output_text(), "");
        l.accept(0, ballot(), value(0, "a"), 2);
        assert_eq!(l.output_text(), "a\n");
    }

    #[test]
    fn duplicate_accept_from_same_acceptor_is_idempotent() {
        let mut l = BareLearner::new(2);
        l.accept(0, ballot(), value(0, "a"), 1);
        l.accept(0, ballot(), value(0, "a"), 1);
        l.accept(0, ballot(), value(0, "a"), 1);
        assert_eq!(l.output_text(), "", "one acceptor can never reach quorum alone");
    }

    #[test]
    fn emission_stalls_on_gap_then_catches_up() {
        let mut l = BareLearner::new(2);
        l.accept(1, ballot(), value(1, "b"), 1);
        l.accept(1, ballot(), value(1, "b"), 2);
        assert_eq!(l.output_text(), "", "slot 0 missing, emission must stall");

        l.accept(0, ballot(), value(0, "a"), 1);
        l.accept(0, ballot(), value(0, "a"), 2);
        assert_eq!(l.output_text(), "a\nb\n");
    }

    #[test]
    fn emits_in_order_regardless_of_arrival_order() {
        let mut l = BareLearner::new(2);
        l.accept(2, ballot(), value(2, "c"), 1);
        l.accept(2, ballot(), value(2, "c"), 2);
        l.accept(0, ballot(), value(0, "a"), 1);
        l.accept(1, ballot(), value(1, "b"), 1);
        l.accept(0, ballot(), value(0, "a"), 2);
        l.accept(1, ballot(), value(1, "b"), 2);
        assert_eq!(l.output_text(), "a\nb\nc\n");
    }
}
