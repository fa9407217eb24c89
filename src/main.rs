//! Single-binary dispatch over the four Paxos roles: one executable that
//! selects its role from a command-line subcommand.

use clap::{Parser, Subcommand};

use paxos_replica::client::{Client, NoDecisionFeed};
use paxos_replica::cluster;
use paxos_replica::config::ClusterConfig;
use paxos_replica::proposer::Proposer;
use paxos_replica::acceptor::Acceptor;
use paxos_replica::learner::Learner;
use paxos_replica::transport::UdpTransport;

#[derive(Parser)]
#[command(name = "paxos-node", about = "A multi-decree Paxos role instance")]
struct Cli {
    /// Path to the static cluster configuration (TOML).
    #[arg(short, long, default_value = "Config.toml")]
    config: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Runs a proposer instance.
    Proposer { #[arg(long)] id: u64 },
    /// Runs an acceptor instance.
    Acceptor { #[arg(long)] id: u64 },
    /// Runs a learner instance.
    Learner { #[arg(long)] id: u64 },
    /// Runs a client instance, reading values from stdin.
    Client { #[arg(long)] id: u64 },
    /// Runs an entire cluster in this one process, for local experimentation.
    Simulate {
        /// Values to submit, split round-robin across the configured clients.
        #[arg(long, value_delimiter = ',', default_value = "a,b,c")]
        values: Vec<String>,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let config = ClusterConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("configuration error: {}", e);
        std::process::exit(1);
    });

    let result = match cli.role {
        Role::Proposer { id } => run_proposer(&config, id),
        Role::Acceptor { id } => run_acceptor(&config, id),
        Role::Learner { id } => run_learner(&config, id),
        Role::Client { id } => run_client(&config, id),
        Role::Simulate { values } => cluster::run_simulation(&config, values),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run_proposer(config: &ClusterConfig, id: u64) -> std::io::Result<()> {
    let endpoint = require_endpoint(config.proposer(id), "proposers", id)?;
    let transport = UdpTransport::bind(endpoint.addr)?;
    let mut proposer = Proposer::new(id, transport, config.acceptors.clone(), config.quorum());
    proposer.run()
}

fn run_acceptor(config: &ClusterConfig, id: u64) -> std::io::Result<()> {
    let endpoint = require_endpoint(config.acceptor(id), "acceptors", id)?;
    let transport = UdpTransport::bind(endpoint.addr)?;
    let mut acceptor = Acceptor::new(id, transport, config.learners.clone());
    acceptor.run()
}

fn run_learner(config: &ClusterConfig, id: u64) -> std::io::Result<()> {
    let endpoint = require_endpoint(config.learner(id), "learners", id)?;
    let transport = UdpTransport::bind(endpoint.addr)?;
    let peers = config.peer_learners(id);
    let mut learner = Learner::new(id, transport, config.quorum(), peers, std::io::stdout());
    learner.run()
}

fn run_client(config: &ClusterConfig, id: u64) -> std::io::Result<()> {
    let endpoint = require_endpoint(config.client(id), "clients", id)?;
    let transport = UdpTransport::bind(endpoint.addr)?;
    let mut client = Client::new(id, transport, config.proposers.clone());
    let stdin = std::io::stdin();
    let mut feed = NoDecisionFeed;
    client.run(stdin.lock(), &mut feed)
}

fn require_endpoint<'a>(
    found: Option<&'a paxos_replica::config::Endpoint>,
    table: &'static str,
    id: u64,
) -> std::io::Result<&'a paxos_replica::config::Endpoint> {
    found.ok_or_else(|| {
        let err = paxos_replica::error::ConfigError::UnknownId { table, id };
        std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string())
    })
}
