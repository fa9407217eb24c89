//! The proposer role: drives client-submitted values to decision, one Paxos
//! instance (slot) at a time, with a retry-and-escalate policy on conflict
//! and a FIFO per-proposer submission queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use crate::ballot::Ballot;
use crate::config::Endpoint;
use crate::message::{Message, NackPhase, Slot};
use crate::transport::UdpTransport;
use crate::value::{SubmissionId, Value};

/// Proposer PREPARE/ACCEPT retransmit interval.
const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(300);
/// Retransmits to unresponsive acceptors before escalating to a higher ballot.
const MAX_RETRANSMITS: u32 = 3;
/// Escalation backoff base: doubles per escalation, capped at `BACKOFF_CAP`.
const BACKOFF_BASE: Duration = Duration::from_millis(50);
/// Escalation backoff cap.
const BACKOFF_CAP: Duration = Duration::from_millis(2_000);
/// How often the event loop wakes up with no traffic, to service timers.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preparing,
    Accepting,
}

struct Attempt {
    slot: Slot,
    ballot: Ballot,
    phase: Phase,
    promises: HashMap<u64, Option<(Ballot, Value)>>,
    accepts: HashSet<u64>,
    /// The value sent in this attempt's ACCEPT phase, set only once `phase`
    /// transitions to `Accepting` (either the queue head or a picked-up
    /// already-accepted value).
    proposed_value_storage: Option<Value>,
    /// `None` until this ballot/phase has actually been sent; used to apply
    /// escalation backoff before the first send rather than only between
    /// retransmits.
    last_sent: Option<Instant>,
    retransmits: u32,
    escalations: u32,
    backoff_until: Option<Instant>,
}

impl Attempt {
    fn new(slot: Slot, ballot: Ballot) -> Self {
        Attempt {
            slot,
            ballot,
            phase: Phase::Preparing,
            promises: HashMap::new(),
            accepts: HashSet::new(),
            proposed_value_storage: None,
            last_sent: None,
            retransmits: 0,
            escalations: 0,
            backoff_until: None,
        }
    }
}

pub struct Proposer {
    id: u64,
    transport: UdpTransport,
    acceptors: Vec<Endpoint>,
    quorum: usize,

    next_slot: Slot,
    /// The proposer-wide ballot round: starts at 1 and only ever increases,
    /// shared across every slot this proposer attempts, never reset per slot.
    ballot: Ballot,
    active: Option<Attempt>,

    queue: VecDeque<Value>,
    queued_ids: HashSet<SubmissionId>,
    decided_ids: HashSet<SubmissionId>,

    /// Well-formed messages this proposer had no handler for (e.g. a stray
    /// `Accept`), distinct from `malformed_datagram_count`.
    malformed_message_count: u64,
    /// Datagrams dropped by the transport because they didn't decode as a
    /// `Message` at all.
    malformed_datagram_count: u64,
}

impl Proposer {
    pub fn new(id: u64, transport: UdpTransport, acceptors: Vec<Endpoint>, quorum: usize) -> Self {
        Proposer {
            id,
            transport,
            acceptors,
            quorum,
            next_slot: 0,
            ballot: Ballot::initial(id),
            active: None,
            queue: VecDeque::new(),
            queued_ids: HashSet::new(),
            decided_ids: HashSet::new(),
            malformed_message_count: 0,
            malformed_datagram_count: 0,
        }
    }

    pub fn run(&mut self) -> ! {
        info!("proposer {} listening", self.id);
        loop {
            self.drive();
            match self.transport.recv_timeout(POLL_INTERVAL) {
                Ok(Some((message, src, dropped))) => {
                    if dropped > 0 {
                        self.malformed_datagram_count += dropped;
                        debug!(
                            "proposer {} dropped {} malformed datagram(s) (total={})",
                            self.id, dropped, self.malformed_datagram_count
                        );
                    }
                    self.handle(message, src);
                }
                Ok(None) => {}
                Err(e) => warn!("proposer {} recv error: {}", self.id, e),
            }
        }
    }

    fn handle(&mut self, message: Message, src: SocketAddr) {
        match message {
            Message::Submit { id, value } => self.on_submit(id, value),
            Message::Promise { slot, ballot, accepted } => self.on_promise(slot, ballot, accepted, src),
            Message::Nack { slot, promised, phase } => self.on_nack(slot, promised, phase),
            Message::Accepted { slot, ballot, value, acceptor_id } => {
                self.on_accepted(slot, ballot, value, acceptor_id)
            }
            other => {
                self.malformed_message_count += 1;
                debug!(
                    "proposer {} ignoring unexpected message {:?} (count={})",
                    self.id, other, self.malformed_message_count
                );
            }
        }
    }

    /// Stores a client submission at the tail of the FIFO queue, deduplicated
    /// by `(client_id, seq)`.
    fn on_submit(&mut self, id: SubmissionId, bytes: Vec<u8>) {
        if self.decided_ids.contains(&id) || self.queued_ids.contains(&id) {
            return;
        }
        self.queued_ids.insert(id);
        self.queue.push_back(Value::new(id, bytes));
    }

    /// Starts a new slot attempt if idle and there is something to propose,
    /// then services the active attempt's retransmit/backoff timers.
    fn drive(&mut self) {
        if self.active.is_none() && !self.queue.is_empty() {
            let slot = self.next_slot;
            let ballot = self.ballot;
            debug!("proposer {} starting slot {} at {:?}", self.id, slot, ballot);
            self.active = Some(Attempt::new(slot, ballot));
        }
        self.service_active();
    }

    fn service_active(&mut self) {
        let now = Instant::now();

        let (should_send_prepare, should_send_accept, retransmit_exhausted) = {
            let attempt = match self.active.as_mut() {
                Some(a) => a,
                None => return,
            };

            if let Some(backoff_until) = attempt.backoff_until {
                if now < backoff_until {
                    return;
                }
                attempt.backoff_until = None;
            }

            let due = match attempt.last_sent {
                None => true,
                Some(sent_at) => now.duration_since(sent_at) >= RETRANSMIT_INTERVAL,
            };

            if !due {
                return;
            }

            if attempt.last_sent.is_some() {
                if attempt.retransmits >= MAX_RETRANSMITS {
                    (false, false, true)
                } else {
                    attempt.retransmits += 1;
                    (attempt.phase == Phase::Preparing, attempt.phase == Phase::Accepting, false)
                }
            } else {
                (attempt.phase == Phase::Preparing, attempt.phase == Phase::Accepting, false)
            }
        };

        if retransmit_exhausted {
            let round = self.active.as_ref().unwrap().ballot.round;
            self.escalate(round);
            return;
        }

        if should_send_prepare {
            self.send_prepare_to_outstanding();
        } else if should_send_accept {
            self.send_accept_to_outstanding();
        }
    }

    fn send_prepare_to_outstanding(&mut self) {
        let (slot, ballot, responded) = {
            let attempt = self.active.as_ref().unwrap();
            let responded: HashSet<u64> = attempt.promises.keys().copied().collect();
            (attempt.slot, attempt.ballot, responded)
        };

        for acceptor in self.acceptors.clone() {
            if !responded.contains(&acceptor.id) {
                self.send(&Message::Prepare { slot, ballot }, acceptor.addr);
            }
        }

        self.active.as_mut().unwrap().last_sent = Some(Instant::now());
    }

    fn send_accept_to_outstanding(&mut self) {
        let (slot, ballot, value, responded) = {
            let attempt = self.active.as_ref().unwrap();
            let value = attempt.proposed_value().expect("Accepting phase always has a value").clone();
            let responded = attempt.accepts.clone();
            (attempt.slot, attempt.ballot, value, responded)
        };

        for acceptor in self.acceptors.clone() {
            if !responded.contains(&acceptor.id) {
                self.send(&Message::Accept { slot, ballot, value: value.clone() }, acceptor.addr);
            }
        }

        self.active.as_mut().unwrap().last_sent = Some(Instant::now());
    }

    fn on_promise(&mut self, slot: Slot, ballot: Ballot, accepted: Option<(Ballot, Value)>, src: SocketAddr) {
        let acceptor_id = match self.acceptor_id(src) {
            Some(id) => id,
            None => return,
        };

        let transition = {
            let attempt = match self.active.as_mut() {
                Some(a) if a.slot == slot && a.ballot == ballot && a.phase == Phase::Preparing => a,
                _ => return, // stale or unrelated reply
            };

            attempt.promises.insert(acceptor_id, accepted);
            attempt.promises.len() >= self.quorum
        };

        if transition {
            self.begin_accepting();
        }
    }

    fn begin_accepting(&mut self) {
        let queue_head = self.queue.front().cloned();

        let (slot, ballot, value) = {
            let attempt = self.active.as_mut().unwrap();

            let pickup = attempt
                .promises
                .values()
                .filter_map(|p| p.clone())
                .max_by_key(|(b, _)| *b);

            let value = match pickup {
                Some((_, v)) => Some(v),
                None => queue_head,
            };

            match value {
                Some(v) => (attempt.slot, attempt.ballot, v),
                None => {
                    // Nothing to propose and nothing to pick up: release the
                    // slot until a new submission arrives.
                    let slot = attempt.slot;
                    self.active = None;
                    debug!("proposer {} released slot {} (empty queue, no pickup)", self.id, slot);
                    return;
                }
            }
        };

        let attempt = self.active.as_mut().unwrap();
        attempt.phase = Phase::Accepting;
        attempt.set_proposed_value(value);
        attempt.last_sent = None;
        attempt.retransmits = 0;
        attempt.accepts.clear();
        debug!("proposer {} slot {} entering ACCEPTING at {:?}", self.id, slot, ballot);
    }

    fn on_nack(&mut self, slot: Slot, promised: Ballot, _phase: NackPhase) {
        let should_escalate = matches!(
            self.active.as_ref(),
            Some(a) if a.slot == slot && promised > a.ballot
        );
        if should_escalate {
            self.escalate(promised.round);
        }
    }

    fn on_accepted(&mut self, slot: Slot, ballot: Ballot, value: Value, acceptor_id: u64) {
        let decided = {
            let attempt = match self.active.as_mut() {
                Some(a) if a.slot == slot && a.ballot == ballot && a.phase == Phase::Accepting => a,
                _ => return,
            };
            attempt.accepts.insert(acceptor_id);
            attempt.accepts.len() >= self.quorum
        };

        if decided {
            self.decide(slot, value);
        }
    }

    /// A decided slot is abandoned for good, regardless of whose value won.
    fn decide(&mut self, slot: Slot, value: Value) {
        info!("proposer {} observed slot {} decided: {:?}", self.id, slot, value.as_text());

        // Pop the queue only when the proposer's own value is the one that
        // decided, wherever it sits in the queue (another proposer may have
        // raced it into an earlier slot, since clients submit to every
        // proposer).
        if self.queued_ids.remove(&value.id) {
            self.queue.retain(|v| v.id != value.id);
        }
        self.decided_ids.insert(value.id);

        self.next_slot = slot + 1;
        self.active = None;
    }

    fn escalate(&mut self, observed_round: u64) {
        let new_ballot = self.ballot.escalate(observed_round);
        self.ballot = new_ballot;

        let attempt = self.active.as_mut().unwrap();
        attempt.ballot = new_ballot;
        attempt.phase = Phase::Preparing;
        attempt.promises.clear();
        attempt.accepts.clear();
        attempt.set_no_value();
        attempt.last_sent = None;
        attempt.retransmits = 0;
        attempt.escalations += 1;

        let backoff = escalation_backoff(attempt.escalations, self.id);
        attempt.backoff_until = Some(Instant::now() + backoff);

        debug!(
            "proposer {} escalated slot {} to {:?}, backing off {:?}",
            self.id, attempt.slot, new_ballot, backoff
        );
    }

    fn acceptor_id(&self, addr: SocketAddr) -> Option<u64> {
        self.acceptors.iter().find(|a| a.addr == addr).map(|a| a.id)
    }

    fn send(&self, message: &Message, to: SocketAddr) {
        if let Err(e) = self.transport.send(message, to) {
            warn!("proposer {} failed to send to {}: {}", self.id, to, e);
        }
    }
}

/// Exponential backoff with jitter, seeded so the jitter window itself
/// differs by proposer id, preventing dueling proposers from escalating in
/// lockstep forever.
fn escalation_backoff(escalations: u32, proposer_id: u64) -> Duration {
    let shift = escalations.min(5);
    let base_ms = (BACKOFF_BASE.as_millis() as u64)
        .saturating_mul(1u64 << shift)
        .min(BACKOFF_CAP.as_millis() as u64);

    let symmetry_break_ms = proposer_id % BACKOFF_BASE.as_millis() as u64;
    let jitter_ms = rand::thread_rng().gen_range(0, base_ms.max(1));

    Duration::from_millis(base_ms / 2 + jitter_ms + symmetry_break_ms)
}

// `proposed_value` needs its own slot on `Attempt` separate from the
// `Option<(Ballot, Value)>` promise bookkeeping; kept as an inherent impl to
// avoid a public field that callers could set inconsistently with `phase`.
impl Attempt {
    fn proposed_value(&self) -> Option<&Value> {
        self.proposed_value_storage.as_ref()
    }

    fn set_proposed_value(&mut self, value: Value) {
        self.proposed_value_storage = Some(value);
    }

    fn set_no_value(&mut self) {
        self.proposed_value_storage = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_backoff_differs_by_proposer_id_at_zero_escalations() {
        // Two proposers at the first escalation should not be forced into
        // the exact same backoff window; the symmetry-break term must differ.
        let a = escalation_backoff(1, 1).as_millis() as i64;
        let b = escalation_backoff(1, 2).as_millis() as i64;
        // Can't assert a != b deterministically (both include randomness),
        // but the deterministic floor must differ by exactly 1ms.
        let floor_a = BACKOFF_BASE.as_millis() as u64 / 2 + 1 % BACKOFF_BASE.as_millis() as u64;
        let floor_b = BACKOFF_BASE.as_millis() as u64 / 2 + 2 % BACKOFF_BASE.as_millis() as u64;
        assert_ne!(floor_a, floor_b);
        assert!(a >= 0 && b >= 0);
    }

    #[test]
    fn escalation_backoff_is_capped() {
        let d = escalation_backoff(20, 1);
        assert!(d <= BACKOFF_CAP + Duration::from_millis(BACKOFF_BASE.as_millis() as u64));
    }

    #[test]
    fn ballot_escalation_is_proposer_wide_not_per_slot() {
        // Escalating while working slot N must also raise the ballot used
        // for slot N+1, since the round counter lives on the proposer, not
        // on any one attempt.
        let initial = Ballot::initial(3);
        let escalated = initial.escalate(7);
        assert!(escalated > initial);
        assert_eq!(escalated.proposer_id, 3);
    }
}
