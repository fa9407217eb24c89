//! Static cluster configuration.
//!
//! A single TOML file names every role instance and its network endpoint.
//! All processes read the same file at startup; membership is closed once
//! startup completes, with no dynamic reconfiguration.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use config::{Config, File};
use serde_derive::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
struct RawEndpoint {
    id: u64,
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct RawClusterConfig {
    #[serde(default)]
    clients: Vec<RawEndpoint>,
    #[serde(default)]
    proposers: Vec<RawEndpoint>,
    #[serde(default)]
    acceptors: Vec<RawEndpoint>,
    #[serde(default)]
    learners: Vec<RawEndpoint>,
}

/// A named role instance's network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub id: u64,
    pub addr: SocketAddr,
}

/// The parsed, validated contents of the configuration file: every role
/// instance in the cluster and its endpoint.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub clients: Vec<Endpoint>,
    pub proposers: Vec<Endpoint>,
    pub acceptors: Vec<Endpoint>,
    pub learners: Vec<Endpoint>,
}

impl ClusterConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut raw_settings = Config::default();
        raw_settings
            .merge(File::with_name(path))
            .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;

        let raw: RawClusterConfig = raw_settings
            .try_into()
            .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;

        Ok(ClusterConfig {
            clients: resolve("clients", raw.clients)?,
            proposers: resolve("proposers", raw.proposers)?,
            acceptors: resolve("acceptors", raw.acceptors)?,
            learners: resolve("learners", raw.learners)?,
        })
    }

    /// A majority of the static acceptor set: `floor(N / 2) + 1`.
    pub fn quorum(&self) -> usize {
        self.acceptors.len() / 2 + 1
    }

    pub fn acceptor(&self, id: u64) -> Option<&Endpoint> {
        self.acceptors.iter().find(|e| e.id == id)
    }

    pub fn proposer(&self, id: u64) -> Option<&Endpoint> {
        self.proposers.iter().find(|e| e.id == id)
    }

    pub fn learner(&self, id: u64) -> Option<&Endpoint> {
        self.learners.iter().find(|e| e.id == id)
    }

    pub fn client(&self, id: u64) -> Option<&Endpoint> {
        self.clients.iter().find(|e| e.id == id)
    }

    /// All configured learners other than `id`, for the catch-up protocol.
    pub fn peer_learners(&self, id: u64) -> Vec<Endpoint> {
        self.learners.iter().filter(|e| e.id != id).copied().collect()
    }
}

fn resolve(table: &'static str, raw: Vec<RawEndpoint>) -> Result<Vec<Endpoint>, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::Empty { table });
    }

    let mut seen = HashSet::new();
    let mut endpoints = Vec::with_capacity(raw.len());

    for entry in raw {
        if !seen.insert(entry.id) {
            return Err(ConfigError::DuplicateId { table, id: entry.id });
        }

        let ip = IpAddr::from_str(&entry.host)
            .map_err(|source| ConfigError::InvalidEndpoint { table, id: entry.id, source })?;

        endpoints.push(Endpoint { id: entry.id, addr: SocketAddr::new(ip, entry.port) });
    }

    Ok(endpoints)
}
