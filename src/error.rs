//! Error taxonomy.
//!
//! Configuration errors are fatal at startup and reported as `ConfigError`.
//! Transient network errors and protocol conflicts (NACKs, lost quorums) are
//! not modeled as `Result` errors at all: they are normal control flow,
//! handled by the role state machines and logged at low severity. Safety
//! violations are not recoverable; `safety_violation` logs full context and
//! aborts the process.

use log::error;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read configuration file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid network endpoint for `{table}` id {id}: {source}")]
    InvalidEndpoint {
        table: &'static str,
        id: u64,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("`{table}` table has a duplicate instance id {id}")]
    DuplicateId { table: &'static str, id: u64 },

    #[error("`{table}` table has no entry for instance id {id}")]
    UnknownId { table: &'static str, id: u64 },

    #[error("`{table}` table must name at least one instance")]
    Empty { table: &'static str },
}

/// Logs a safety violation with full context and aborts the process. This is
/// an invariant check, not a recoverable error: a correct implementation
/// never reaches this.
pub fn safety_violation(context: &str) -> ! {
    error!("SAFETY VIOLATION: {}", context);
    panic!("safety violation: {}", context);
}
