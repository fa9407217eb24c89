//! In-process cluster bootstrap for the `simulate` subcommand: spawns every
//! configured role instance as its own OS thread bound to its configured
//! loopback address, each thread the sole owner of its role's state, held
//! behind a `Barrier` until every socket is bound before traffic starts.

use std::io::Cursor;
use std::sync::{Arc, Barrier};
use std::thread;

use log::info;

use crate::acceptor::Acceptor;
use crate::client::{Client, SharedDecisionFeed};
use crate::config::ClusterConfig;
use crate::learner::Learner;
use crate::proposer::Proposer;
use crate::transport::UdpTransport;

/// Runs every role instance named in `config` as a thread on this process,
/// each client fed a round-robin share of `values`. Like every role's
/// `run()`, this never returns in practice: it blocks until the process is
/// killed (Ctrl-C).
pub fn run_simulation(config: &ClusterConfig, values: Vec<String>) -> std::io::Result<()> {
    let total_threads = config.clients.len() + config.proposers.len() + config.acceptors.len() + config.learners.len();
    let barrier = Arc::new(Barrier::new(total_threads.max(1)));
    let mut threads = Vec::with_capacity(total_threads);

    // Every learner in the simulation reports its decisions into this one
    // shared set, so a client blocks only until *some* learner has decided
    // its submissions, not a specific one.
    let decision_feed = SharedDecisionFeed::default();

    for acceptor_ep in config.acceptors.clone() {
        let transport = UdpTransport::bind(acceptor_ep.addr)?;
        let learners = config.learners.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            let mut acceptor = Acceptor::new(acceptor_ep.id, transport, learners);
            barrier.wait();
            acceptor.run();
        }));
    }

    for proposer_ep in config.proposers.clone() {
        let transport = UdpTransport::bind(proposer_ep.addr)?;
        let acceptors = config.acceptors.clone();
        let quorum = config.quorum();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            let mut proposer = Proposer::new(proposer_ep.id, transport, acceptors, quorum);
            barrier.wait();
            proposer.run();
        }));
    }

    for learner_ep in config.learners.clone() {
        let transport = UdpTransport::bind(learner_ep.addr)?;
        let quorum = config.quorum();
        let peers = config.peer_learners(learner_ep.id);
        let barrier = barrier.clone();
        let decision_feed = decision_feed.clone();
        threads.push(thread::spawn(move || {
            let mut learner = Learner::new(learner_ep.id, transport, quorum, peers, std::io::stdout())
                .with_decision_sink(decision_feed);
            barrier.wait();
            learner.run();
        }));
    }

    let client_count = config.clients.len().max(1);
    for (i, client_ep) in config.clients.clone().into_iter().enumerate() {
        let transport = UdpTransport::bind(client_ep.addr)?;
        let proposers = config.proposers.clone();
        let barrier = barrier.clone();
        let mut feed = decision_feed.clone();
        let share: Vec<String> = values.iter().skip(i).step_by(client_count).cloned().collect();
        threads.push(thread::spawn(move || {
            let mut client = Client::new(client_ep.id, transport, proposers);
            let input = Cursor::new(share.join("\n").into_bytes());
            barrier.wait();
            let _ = client.run(input, &mut feed);
        }));
    }

    info!("simulation started: {} threads", threads.len());

    for thread_handle in threads {
        thread_handle.join().expect("role thread panicked");
    }

    Ok(())
}
