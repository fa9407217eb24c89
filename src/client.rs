//! The client role: feeds values into the proposer pool and detects
//! completion.
//!
//! A standalone client process has no built-in way to know when every value
//! it submitted has actually been decided — that requires watching learner
//! output, which lives in a different process. The `DecisionFeed` trait is
//! this crate's seam for that: the real binary wires in `NoDecisionFeed`
//! (the client submits and retransmits for liveness, then blocks until
//! killed externally), while the in-process `simulate` harness and tests
//! wire in `SharedDecisionFeed`, which can actually observe decisions
//! because everything runs in one process.

use std::collections::HashSet;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Endpoint;
use crate::message::Message;
use crate::transport::UdpTransport;
use crate::value::SubmissionId;

/// How often outstanding submissions are retransmitted, for liveness only;
/// a client that never retransmits is still safe, just possibly slower to
/// get a dropped submission decided.
const RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);
/// How long to sleep between decision-feed polls once input is exhausted,
/// so waiting for the harness's side channel doesn't spin the CPU.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait DecisionFeed {
    /// Returns the submission ids that became decided since the last call.
    fn poll_decided(&mut self) -> Vec<SubmissionId>;
}

/// The real-process default: no side channel, so nothing is ever reported
/// decided from in here.
pub struct NoDecisionFeed;

impl DecisionFeed for NoDecisionFeed {
    fn poll_decided(&mut self) -> Vec<SubmissionId> {
        Vec::new()
    }
}

/// An in-process feed, backed by a set that something else (a learner, in
/// `simulate` mode or a test) inserts into directly.
#[derive(Clone, Default)]
pub struct SharedDecisionFeed(pub Arc<Mutex<HashSet<SubmissionId>>>);

impl DecisionFeed for SharedDecisionFeed {
    fn poll_decided(&mut self) -> Vec<SubmissionId> {
        self.0.lock().unwrap().drain().collect()
    }
}

pub struct Client {
    client_id: u64,
    transport: UdpTransport,
    proposers: Vec<Endpoint>,

    next_seq: u64,
    pending: Vec<(SubmissionId, Vec<u8>)>,
    input_exhausted: bool,
    last_retransmit: Instant,
}

impl Client {
    pub fn new(client_id: u64, transport: UdpTransport, proposers: Vec<Endpoint>) -> Self {
        Client {
            client_id,
            transport,
            proposers,
            next_seq: 0,
            pending: Vec::new(),
            input_exhausted: false,
            last_retransmit: Instant::now(),
        }
    }

    /// Reads lines from `input` until EOF, submitting each to every
    /// configured proposer, and returns once every submission has been
    /// reported decided by `feed` (or never, if `feed` never reports
    /// anything — see the module-level docs).
    pub fn run(&mut self, mut input: impl BufRead, feed: &mut impl DecisionFeed) -> std::io::Result<()> {
        loop {
            if !self.input_exhausted {
                let mut line = String::new();
                match input.read_line(&mut line)? {
                    0 => {
                        self.input_exhausted = true;
                        info!("client {} reached end of input", self.client_id);
                    }
                    _ => {
                        let text = line.strip_suffix('\n').unwrap_or(&line);
                        let text = text.strip_suffix('\r').unwrap_or(text);
                        self.submit(text.as_bytes().to_vec());
                        continue;
                    }
                }
            }

            for id in feed.poll_decided() {
                self.pending.retain(|(pending_id, _)| *pending_id != id);
            }

            if self.input_exhausted && self.pending.is_empty() {
                info!("client {} DONE: all submissions decided", self.client_id);
                println!("DONE");
                return Ok(());
            }

            if self.last_retransmit.elapsed() >= RETRANSMIT_INTERVAL {
                self.retransmit_pending();
            }

            if self.input_exhausted {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn submit(&mut self, value: Vec<u8>) {
        let id = SubmissionId { client_id: self.client_id, seq: self.next_seq };
        self.next_seq += 1;
        self.send_to_all(id, &value);
        self.pending.push((id, value));
    }

    fn retransmit_pending(&mut self) {
        let pending: Vec<(SubmissionId, Vec<u8>)> = self.pending.clone();
        for (id, value) in pending {
            self.send_to_all(id, &value);
        }
        self.last_retransmit = Instant::now();
    }

    fn send_to_all(&self, id: SubmissionId, value: &[u8]) {
        let message = Message::Submit { id, value: value.to_vec() };
        for proposer in &self.proposers {
            self.send(&message, proposer.addr);
        }
    }

    fn send(&self, message: &Message, to: SocketAddr) {
        if let Err(e) = self.transport.send(message, to) {
            warn!("client {} failed to send to {}: {}", self.client_id, to, e);
        }
    }
}
