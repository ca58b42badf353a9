//! Transport seams between workers, servers, and peer shards.
//!
//! The crate ships no sockets; it defines the traits a transport must
//! implement and an in-process reference wiring in [`crate::cluster`].
//! Everything above these seams, the whole query protocol included, is
//! transport-agnostic.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::batch::GraphBatch;
use crate::error::{Result, TesseraError};
use crate::meta::JobMeta;
use crate::model::{NodeId, NodePack, SamplerKind};

/// Fetches node data from the shard that owns it.
pub trait FetchBackend: Send + Sync {
    /// Returns data for `ids`, all of which shard `owner` must own.
    fn fetch_remote(&self, owner: usize, ids: &[NodeId]) -> Result<NodePack>;
}

/// Surface a serving shard exposes to attached clients and peer shards.
pub trait ServiceEndpoint: Send + Sync {
    /// Job metadata.
    fn meta(&self) -> Arc<JobMeta>;

    /// Sampler kinds this server advertises.
    fn sampler_kinds(&self) -> Vec<SamplerKind>;

    /// Next ready batch of `kind`, waiting up to `timeout` for one.
    /// `Ok(None)` means the wait elapsed with nothing ready; an error
    /// carries either a transport fault or a failure the sampler hit
    /// while producing.
    fn next_batch(&self, kind: SamplerKind, timeout: Duration) -> Result<Option<GraphBatch>>;

    /// Resolves arbitrary ids: shard-local ones straight from the store,
    /// the rest through the server's cache.
    fn fetch_nodes(&self, ids: &[NodeId]) -> Result<NodePack>;

    /// Resolves ids this server's shard owns; any other id is an error.
    fn fetch_owned(&self, ids: &[NodeId]) -> Result<NodePack>;
}

/// Retry budget for cross-shard fetches.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubles for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(10),
        }
    }
}

/// Runs `op` under `policy`, reporting exhaustion as
/// [`TesseraError::RemoteFetch`] against shard `owner`.
pub(crate) fn fetch_with_retry<T>(
    policy: RetryPolicy,
    owner: usize,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    let mut last = String::new();
    for attempt in 1..=attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!(owner, attempt, error = %e, "net.fetch.retry");
                last = e.to_string();
                if attempt < attempts {
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
    Err(TesseraError::RemoteFetch {
        owner,
        attempts,
        last,
    })
}

/// Backend for standalone jobs, which have no peer shard to reach.
pub struct NoRemote;

impl FetchBackend for NoRemote {
    fn fetch_remote(&self, owner: usize, _ids: &[NodeId]) -> Result<NodePack> {
        Err(TesseraError::Config(format!(
            "no transport to shard {owner}: standalone job has a single shard"
        )))
    }
}
