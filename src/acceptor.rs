//! The acceptor role: passive single-decree Paxos safety per slot. An
//! acceptor never initiates anything; it only replies to proposers.

use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, info, warn};

use crate::ballot::Ballot;
use crate::config::Endpoint;
use crate::message::{Message, NackPhase, Slot};
use crate::transport::UdpTransport;
use crate::value::Value;

/// Per-slot acceptor state. Both fields default to "undefined"; slots are
/// created lazily on the first message that refers to them.
#[derive(Debug, Default, Clone)]
struct SlotState {
    promised_ballot: Option<Ballot>,
    accepted: Option<(Ballot, Value)>,
}

pub struct Acceptor {
    id: u64,
    transport: UdpTransport,
    learners: Vec<Endpoint>,
    slots: HashMap<Slot, SlotState>,
    /// Well-formed messages this acceptor had no handler for (e.g. a stray
    /// `Submit`), distinct from `malformed_datagram_count`.
    malformed_message_count: u64,
    /// Datagrams dropped by the transport because they didn't decode as a
    /// `Message` at all.
    malformed_datagram_count: u64,
}

impl Acceptor {
    pub fn new(id: u64, transport: UdpTransport, learners: Vec<Endpoint>) -> Self {
        Acceptor {
            id,
            transport,
            learners,
            slots: HashMap::new(),
            malformed_message_count: 0,
            malformed_datagram_count: 0,
        }
    }

    /// Runs forever, handling one datagram at a time. Never returns; process
    /// termination is the only way to stop an acceptor.
    pub fn run(&mut self) -> ! {
        info!("acceptor {} listening", self.id);
        loop {
            match self.transport.recv() {
                Ok((message, src, dropped)) => {
                    if dropped > 0 {
                        self.malformed_datagram_count += dropped;
                        debug!(
                            "acceptor {} dropped {} malformed datagram(s) (total={})",
                            self.id, dropped, self.malformed_datagram_count
                        );
                    }
                    self.handle(message, src);
                }
                Err(e) => warn!("acceptor {} recv error: {}", self.id, e),
            }
        }
    }

    fn handle(&mut self, message: Message, src: SocketAddr) {
        match message {
            Message::Prepare { slot, ballot } => self.on_prepare(slot, ballot, src),
            Message::Accept { slot, ballot, value } => self.on_accept(slot, ballot, value, src),
            other => {
                self.malformed_message_count += 1;
                debug!(
                    "acceptor {} ignoring unexpected message {:?} (count={})",
                    self.id, other, self.malformed_message_count
                );
            }
        }
    }

    /// Promises not to accept any ballot lower than `ballot`, replying with
    /// whatever value (if any) it has already accepted for this slot.
    fn on_prepare(&mut self, slot: Slot, ballot: Ballot, src: SocketAddr) {
        let state = self.slots.entry(slot).or_default();

        if state.promised_ballot.map_or(true, |promised| ballot > promised) {
            state.promised_ballot = Some(ballot);
            debug_assert!(invariant_a1(state), "accepted_ballot must never exceed promised_ballot");

            let reply = Message::Promise { slot, ballot, accepted: state.accepted.clone() };
            self.send(&reply, src);
        } else {
            let promised = state.promised_ballot.expect("checked above");
            self.send(&Message::Nack { slot, promised, phase: NackPhase::Prepare }, src);
        }
    }

    /// Accepts `value` under `ballot` unless it has already promised a
    /// strictly higher ballot.
    fn on_accept(&mut self, slot: Slot, ballot: Ballot, value: Value, src: SocketAddr) {
        let state = self.slots.entry(slot).or_default();

        if state.promised_ballot.map_or(true, |promised| ballot >= promised) {
            state.promised_ballot = Some(ballot);
            state.accepted = Some((ballot, value.clone()));
            debug_assert!(invariant_a1(state));
            debug_assert!(invariant_a2(state));

            let accepted = Message::Accepted { slot, ballot, value, acceptor_id: self.id };

            // Unicast back to the requesting proposer so it can observe its
            // own outcome, and broadcast to every learner so late joiners
            // can relay-reconstruct the log.
            self.send(&accepted, src);
            for learner in &self.learners {
                if learner.addr != src {
                    self.send(&accepted, learner.addr);
                }
            }
        } else {
            let promised = state.promised_ballot.expect("checked above");
            self.send(&Message::Nack { slot, promised, phase: NackPhase::Accept }, src);
        }
    }

    fn send(&self, message: &Message, to: SocketAddr) {
        if let Err(e) = self.transport.send(message, to) {
            warn!("acceptor {} failed to send to {}: {}", self.id, to, e);
        }
    }
}

fn invariant_a1(state: &SlotState) -> bool {
    match (state.accepted.as_ref(), state.promised_ballot) {
        (Some((accepted_ballot, _)), Some(promised)) => *accepted_ballot <= promised,
        _ => true,
    }
}

fn invariant_a2(state: &SlotState) -> bool {
    // accepted_ballot and accepted_value are set together by construction.
    state.accepted.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SubmissionId;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    fn value(seq: u64, text: &str) -> Value {
        Value::new(SubmissionId { client_id: 1, seq }, text.as_bytes().to_vec())
    }

    fn ballot(round: u64, proposer_id: u64) -> Ballot {
        Ballot { round, proposer_id }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    struct TestAcceptor {
        slots: HashMap<Slot, SlotState>,
    }

    // Exercises the pure state-transition rules without a real socket, by
    // replicating the tiny branch of `Acceptor` that has no I/O dependency.
    impl TestAcceptor {
        fn new() -> Self {
            TestAcceptor { slots: HashMap::new() }
        }

        fn prepare(&mut self, slot: Slot, ballot: Ballot) -> Message {
            let state = self.slots.entry(slot).or_default();
            if state.promised_ballot.map_or(true, |p| ballot > p) {
                state.promised_ballot = Some(ballot);
                Message::Promise { slot, ballot, accepted: state.accepted.clone() }
            } else {
                Message::Nack { slot, promised: state.promised_ballot.unwrap(), phase: NackPhase::Prepare }
            }
        }

        fn accept(&mut self, slot: Slot, ballot: Ballot, value: Value) -> Message {
            let state = self.slots.entry(slot).or_default();
            if state.promised_ballot.map_or(true, |p| ballot >= p) {
                state.promised_ballot = Some(ballot);
                state.accepted = Some((ballot, value.clone()));
                Message::Accepted { slot, ballot, value, acceptor_id: 0 }
            } else {
                Message::Nack { slot, promised: state.promised_ballot.unwrap(), phase: NackPhase::Accept }
            }
        }
    }

    #[test]
    fn first_prepare_is_always_promised() {
        let mut a = TestAcceptor::new();
        let reply = a.prepare(0, ballot(1, 1));
        assert!(matches!(reply, Message::Promise { accepted: None, .. }));
    }

    #[test]
    fn repeated_prepare_with_identical_ballot_is_not_greater() {
        let mut a = TestAcceptor::new();
        a.prepare(0, ballot(5, 1));
        let reply = a.prepare(0, ballot(5, 1));
        assert!(matches!(reply, Message::Nack { phase: NackPhase::Prepare, .. }));
    }

    #[test]
    fn lower_ballot_prepare_is_nacked() {
        let mut a = TestAcceptor::new();
        a.prepare(0, ballot(5, 1));
        let reply = a.prepare(0, ballot(3, 9));
        match reply {
            Message::Nack { promised, phase: NackPhase::Prepare, .. } => {
                assert_eq!(promised, ballot(5, 1))
            }
            other => panic!("expected Nack, got {:?}", other),
        }
    }

    #[test]
    fn promise_carries_previously_accepted_value() {
        let mut a = TestAcceptor::new();
        a.accept(0, ballot(1, 1), value(0, "a"));
        let reply = a.prepare(0, ballot(2, 1));
        match reply {
            Message::Promise { accepted: Some((b, v)), .. } => {
                assert_eq!(b, ballot(1, 1));
                assert_eq!(v.as_text(), "a");
            }
            other => panic!("expected Promise with accepted value, got {:?}", other),
        }
    }

    #[test]
    fn accept_equal_to_promised_ballot_succeeds() {
        let mut a = TestAcceptor::new();
        a.prepare(0, ballot(5, 1));
        let reply = a.accept(0, ballot(5, 1), value(0, "a"));
        assert!(matches!(reply, Message::Accepted { .. }));
    }

    #[test]
    fn accept_below_promised_ballot_is_nacked() {
        let mut a = TestAcceptor::new();
        a.prepare(0, ballot(5, 1));
        let reply = a.accept(0, ballot(4, 9), value(0, "a"));
        assert!(matches!(reply, Message::Nack { phase: NackPhase::Accept, .. }));
    }

    #[test]
    fn slots_are_independent() {
        let mut a = TestAcceptor::new();
        a.prepare(0, ballot(5, 1));
        let reply = a.prepare(1, ballot(1, 1));
        assert!(matches!(reply, Message::Promise { accepted: None, .. }));
    }

    #[test]
    fn accepted_reaches_a_shared_proposer_learner_address_exactly_once() {
        // Drives the real `on_accept`, with the requesting proposer's
        // address also configured as a learner. The dedup-by-address branch
        // in `on_accept` must send exactly one `Accepted` there, not two.
        let shared = UdpTransport::bind(addr(0)).unwrap();
        let shared_addr = shared.local_addr().unwrap();

        let transport = UdpTransport::bind(addr(0)).unwrap();
        let mut acceptor = Acceptor::new(0, transport, vec![Endpoint { id: 0, addr: shared_addr }]);

        acceptor.on_accept(0, ballot(1, 1), value(0, "a"), shared_addr);

        let (first, _, _) = shared
            .recv_timeout(Duration::from_millis(200))
            .unwrap()
            .expect("expected one Accepted to arrive");
        assert!(matches!(first, Message::Accepted { .. }));

        let second = shared.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(second.is_none(), "shared address must receive exactly one Accepted, got a second");
    }

    #[test]
    fn accepted_reaches_proposer_and_a_distinct_learner_separately() {
        let proposer_sink = UdpTransport::bind(addr(0)).unwrap();
        let proposer_addr = proposer_sink.local_addr().unwrap();

        let learner_sink = UdpTransport::bind(addr(0)).unwrap();
        let learner_addr = learner_sink.local_addr().unwrap();

        let transport = UdpTransport::bind(addr(0)).unwrap();
        let mut acceptor = Acceptor::new(0, transport, vec![Endpoint { id: 0, addr: learner_addr }]);

        acceptor.on_accept(0, ballot(1, 1), value(0, "a"), proposer_addr);

        let (at_proposer, _, _) = proposer_sink
            .recv_timeout(Duration::from_millis(200))
            .unwrap()
            .expect("proposer must receive its Accepted");
        assert!(matches!(at_proposer, Message::Accepted { .. }));

        let (at_learner, _, _) = learner_sink
            .recv_timeout(Duration::from_millis(200))
            .unwrap()
            .expect("learner must also receive the Accepted broadcast");
        assert!(matches!(at_learner, Message::Accepted { .. }));
    }
}
