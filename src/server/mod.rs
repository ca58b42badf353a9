//! The server role: one shard resident in memory, sampler pools feeding
//! bounded queues, and the fetch surface peers and workers call into.
//!
//! A server is configured in two phases. [`ServerProcess`] collects the
//! cache and sampler declarations; [`ServerProcess::ready`] freezes them
//! into a [`RunningServer`], whose sampler threads start only when
//! [`RunningServer::start_samplers`] runs. The split exists because pools
//! may fetch from other shards on their first batch, so every server must
//! be registered with the transport before any pool thread runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use tracing::{debug, info};

use crate::batch::GraphBatch;
use crate::cache::{CacheCapacity, CacheStats, EvictionPolicy, NodeCache};
use crate::error::{Result, TesseraError};
use crate::meta::JobMeta;
use crate::model::{NodeId, NodePack, SamplerConfig, SamplerKind};
use crate::net::{FetchBackend, RetryPolicy, ServiceEndpoint};
use crate::sampler::{NodeSource, SampleContext, SamplePool, DEFAULT_QUEUE_DEPTH};
use crate::store::PartitionStore;

/// Tunables for one server process.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Batches each sampler pool buffers before its producers block.
    pub queue_depth: usize,
    /// Fixed seed for sampler RNGs; `None` seeds from the OS.
    pub sampler_seed: Option<u64>,
    /// Retry schedule for this server's own cross-shard fetches.
    pub fetch_retry: RetryPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            sampler_seed: None,
            fetch_retry: RetryPolicy::default(),
        }
    }
}

/// A server under construction. Declare the cache and samplers, then call
/// [`ServerProcess::ready`].
pub struct ServerProcess {
    store: Arc<PartitionStore>,
    backend: Arc<dyn FetchBackend>,
    opts: ServerOptions,
    cache: Option<Arc<NodeCache>>,
    pools: Vec<SamplePool>,
}

impl ServerProcess {
    /// Wraps a loaded shard and a transport to the other shards.
    pub fn new(
        store: Arc<PartitionStore>,
        backend: Arc<dyn FetchBackend>,
        opts: ServerOptions,
    ) -> ServerProcess {
        ServerProcess {
            store,
            backend,
            opts,
            cache: None,
            pools: Vec::new(),
        }
    }

    /// The shard this server owns.
    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    /// Sets up the remote-node cache. At most one call; servers that never
    /// call it run with caching disabled.
    pub fn init_cache(&mut self, capacity: CacheCapacity, policy: EvictionPolicy) -> Result<()> {
        if self.cache.is_some() {
            return Err(TesseraError::InvalidArgument(
                "cache is already initialized".into(),
            ));
        }
        let resolved = capacity.resolve(self.store.len())?;
        info!(
            shard = self.store.shard(),
            capacity = resolved,
            policy = ?policy,
            "server.cache.init"
        );
        self.cache = Some(Arc::new(NodeCache::new(resolved, policy)));
        Ok(())
    }

    /// Registers a sampler family backed by `threads` producer threads.
    pub fn add_sampler(&mut self, config: SamplerConfig, threads: usize) -> Result<()> {
        config.validate()?;
        if threads == 0 {
            return Err(TesseraError::InvalidArgument(
                "sampler pool needs at least one thread".into(),
            ));
        }
        let kind = config.kind();
        if self.pools.iter().any(|p| p.kind() == kind) {
            return Err(TesseraError::InvalidArgument(format!(
                "sampler {kind} is already registered"
            )));
        }
        if kind == SamplerKind::FanOut && self.store.train_nodes().is_empty() {
            return Err(TesseraError::Config(format!(
                "shard {} holds no training nodes to seed the fan-out sampler",
                self.store.shard()
            )));
        }
        // Each kind gets its own seed stream so pools of equal size do not
        // replay one another's draws.
        let seed = self
            .opts
            .sampler_seed
            .map(|s| s.wrapping_add((kind as u64 + 1).wrapping_mul(0xff51afd7ed558ccd)));
        self.pools
            .push(SamplePool::prepare(config, threads, self.opts.queue_depth, seed));
        debug!(kind = %kind, threads, "server.sampler.add");
        Ok(())
    }

    /// Freezes the configuration. Sampler threads stay parked until
    /// [`RunningServer::start_samplers`].
    pub fn ready(self) -> Arc<RunningServer> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(NodeCache::disabled()));
        let context = Arc::new(SampleContext::new(
            Arc::clone(&self.store),
            Arc::clone(&cache),
            self.backend,
        ));
        let batches = self.pools.iter().map(|_| AtomicU64::new(0)).collect();
        info!(
            shard = self.store.shard(),
            samplers = self.pools.len(),
            "server.ready"
        );
        Arc::new(RunningServer {
            store: self.store,
            cache,
            context,
            pools: self.pools,
            batches,
            node_fetches: AtomicU64::new(0),
            peer_fetches: AtomicU64::new(0),
        })
    }
}

/// A live server: accepts batch and node-fetch requests until shut down.
pub struct RunningServer {
    store: Arc<PartitionStore>,
    cache: Arc<NodeCache>,
    context: Arc<SampleContext>,
    pools: Vec<SamplePool>,
    batches: Vec<AtomicU64>,
    node_fetches: AtomicU64,
    peer_fetches: AtomicU64,
}

impl RunningServer {
    /// The shard rank this server owns.
    pub fn shard(&self) -> usize {
        self.store.shard()
    }

    /// Launches every sampler pool's producer threads.
    pub fn start_samplers(&self) -> Result<()> {
        for pool in &self.pools {
            pool.start(&self.context)?;
        }
        info!(
            shard = self.store.shard(),
            pools = self.pools.len(),
            "server.samplers.start"
        );
        Ok(())
    }

    /// Stops and joins every sampler thread. Safe to call twice.
    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.stop();
        }
        info!(shard = self.store.shard(), "server.shutdown");
    }

    /// Point-in-time serving counters.
    pub fn perf(&self) -> ServerStats {
        let samplers = self
            .pools
            .iter()
            .zip(&self.batches)
            .map(|(pool, count)| SamplerCount {
                kind: pool.kind(),
                batches: count.load(Ordering::Relaxed),
            })
            .collect();
        ServerStats {
            shard: self.store.shard(),
            resident_nodes: self.store.len(),
            resident_edges: self.store.edge_count(),
            cache_capacity: self.cache.capacity(),
            cache_policy: self.cache.policy(),
            cache: self.cache.stats(),
            samplers,
            node_fetches: self.node_fetches.load(Ordering::Relaxed),
            peer_fetches: self.peer_fetches.load(Ordering::Relaxed),
        }
    }
}

impl ServiceEndpoint for RunningServer {
    fn meta(&self) -> Arc<JobMeta> {
        Arc::clone(self.store.meta())
    }

    fn sampler_kinds(&self) -> Vec<SamplerKind> {
        self.pools.iter().map(SamplePool::kind).collect()
    }

    fn next_batch(&self, kind: SamplerKind, timeout: Duration) -> Result<Option<GraphBatch>> {
        let idx = self
            .pools
            .iter()
            .position(|p| p.kind() == kind)
            .ok_or_else(|| {
                TesseraError::InvalidArgument(format!(
                    "server {} runs no {kind} sampler",
                    self.store.shard()
                ))
            })?;
        match self.pools[idx].receiver().recv_timeout(timeout) {
            Ok(Ok(batch)) => {
                self.batches[idx].fetch_add(1, Ordering::Relaxed);
                Ok(Some(batch))
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TesseraError::Shutdown),
        }
    }

    fn fetch_nodes(&self, ids: &[NodeId]) -> Result<NodePack> {
        let mut pack = NodePack::default();
        for &id in ids {
            match self.context.resolve(id)? {
                NodeSource::Local(local) => {
                    pack.insert(id, Arc::new(self.store.node_data(local)));
                }
                NodeSource::Remote(data) => {
                    pack.insert(id, data);
                }
            }
        }
        self.node_fetches
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(pack)
    }

    fn fetch_owned(&self, ids: &[NodeId]) -> Result<NodePack> {
        let mut pack = NodePack::default();
        for &id in ids {
            let local = self
                .store
                .local_of(id)
                .ok_or(TesseraError::UnknownNode(id))?;
            pack.insert(id, Arc::new(self.store.node_data(local)));
        }
        self.peer_fetches
            .fetch_add(ids.len() as u64, Ordering::Relaxed);
        Ok(pack)
    }
}

/// Batches produced by one sampler family since startup.
#[derive(Clone, Debug, Serialize)]
pub struct SamplerCount {
    /// Sampler family.
    pub kind: SamplerKind,
    /// Batches handed to consumers.
    pub batches: u64,
}

/// Snapshot of a server's serving counters.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStats {
    /// Shard rank.
    pub shard: usize,
    /// Nodes resident in the shard.
    pub resident_nodes: usize,
    /// Edges resident in the shard.
    pub resident_edges: usize,
    /// Remote-node cache capacity, zero when disabled.
    pub cache_capacity: usize,
    /// Eviction policy of the remote-node cache.
    pub cache_policy: EvictionPolicy,
    /// Cache hit and miss counters.
    pub cache: CacheStats,
    /// Per-sampler batch counts.
    pub samplers: Vec<SamplerCount>,
    /// Nodes served to workers through ad-hoc fetches.
    pub node_fetches: u64,
    /// Nodes served to peer shards.
    pub peer_fetches: u64,
}
