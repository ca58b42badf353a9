//! Crate-wide error type and result alias.

use std::io;

use thiserror::Error;

use crate::model::{NodeId, QueryId};

/// Result alias used by every fallible tessera surface.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for configuration, protocol, storage and cluster faults.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Underlying I/O failure while reading or writing shard files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Job or process configuration is unusable; fatal before serving starts.
    #[error("config error: {0}")]
    Config(String),
    /// A caller handed an operation something it cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Shard data contradicts its declared shape or checksum; fatal at load.
    #[error("shard integrity: {0}")]
    ShardIntegrity(String),
    /// The query id was never issued, or was cancelled.
    #[error("unknown query {0}")]
    UnknownQuery(QueryId),
    /// The query id was already resolved once.
    #[error("query {0} already resolved")]
    AlreadyResolved(QueryId),
    /// The id maps to no shard of this job.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    /// A graph pull was issued against a server with no samplers registered.
    #[error("no samplers registered on the attached server")]
    NoSamplers,
    /// The resolved reply was not of the kind the caller asked for.
    #[error("reply kind mismatch: expected {expected}, got {got}")]
    ReplyKind {
        /// Kind the caller converted into.
        expected: &'static str,
        /// Kind the query actually produced.
        got: &'static str,
    },
    /// A cross-shard fetch kept failing after its retry budget.
    #[error("remote fetch from shard {owner} failed after {attempts} attempts: {last}")]
    RemoteFetch {
        /// Shard rank the fetch targeted.
        owner: usize,
        /// Attempts made before giving up.
        attempts: u32,
        /// Message of the last underlying failure.
        last: String,
    },
    /// A timed barrier wait elapsed before every participant arrived.
    #[error("barrier timed out: {arrived}/{expected} participants arrived")]
    ParticipantTimeout {
        /// Participants that had arrived when the wait gave up.
        arrived: usize,
        /// Participants the barrier requires.
        expected: usize,
    },
    /// The operation raced teardown of its server or client.
    #[error("shutting down")]
    Shutdown,
}
