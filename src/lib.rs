//! A multi-decree Paxos implementation replicating a total order of
//! client-submitted values across proposer, acceptor, and learner roles.

pub mod acceptor;
pub mod ballot;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod learner;
pub mod message;
pub mod proposer;
pub mod transport;
pub mod value;
