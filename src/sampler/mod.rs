//! Background samplers turning shard state into ready-to-ship minibatches.
//!
//! Every configured sampler runs on its own pool of OS threads. Each thread
//! loops `produce -> send` into a bounded channel shared by the pool; a full
//! channel blocks the producers, which is the only admission control the
//! serving path has. Consumers pop whole batches off the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::batch::{EdgeList, GraphBatch};
use crate::cache::NodeCache;
use crate::error::{Result, TesseraError};
use crate::meta::JobMeta;
use crate::model::{NodeData, NodeId, SamplerConfig, SamplerKind};
use crate::net::FetchBackend;
use crate::store::PartitionStore;

mod fanout;
mod global;
mod local;
mod walk;

use fanout::FanOutSampler;
use global::GlobalNodeSampler;
use local::LocalNodeSampler;
use walk::RandomWalkSampler;

/// Batches a pool buffers before its producers block.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

const SEND_POLL: Duration = Duration::from_millis(50);

/// Shared read surface samplers draw from: the local shard, the eviction
/// cache, and the transport used to fill cache misses.
pub struct SampleContext {
    pub(crate) store: Arc<PartitionStore>,
    pub(crate) cache: Arc<NodeCache>,
    pub(crate) backend: Arc<dyn FetchBackend>,
}

/// Where a batch row's data lives.
#[derive(Clone)]
pub(crate) enum NodeSource {
    /// Row is shard-local, addressed by local index.
    Local(usize),
    /// Row was fetched from another shard.
    Remote(Arc<NodeData>),
}

impl SampleContext {
    pub(crate) fn new(
        store: Arc<PartitionStore>,
        cache: Arc<NodeCache>,
        backend: Arc<dyn FetchBackend>,
    ) -> SampleContext {
        SampleContext {
            store,
            cache,
            backend,
        }
    }

    pub(crate) fn meta(&self) -> &Arc<JobMeta> {
        self.store.meta()
    }

    /// Resolves `id` to its data, going through the cache when the id lives
    /// on another shard. Local reads never touch the cache.
    pub(crate) fn resolve(&self, id: NodeId) -> Result<NodeSource> {
        if let Some(local) = self.store.local_of(id) {
            return Ok(NodeSource::Local(local));
        }
        let owner = self
            .meta()
            .owner_of(id)
            .ok_or(TesseraError::UnknownNode(id))?;
        let data = self.cache.get_or_fetch(id, || {
            let pack = self.backend.fetch_remote(owner, std::slice::from_ref(&id))?;
            pack.get(&id).map(Arc::clone).ok_or_else(|| {
                TesseraError::ShardIntegrity(format!(
                    "shard {owner} returned no data for node {id} it owns"
                ))
            })
        })?;
        Ok(NodeSource::Remote(data))
    }
}

/// Insertion-ordered set of batch rows under construction.
///
/// The first insertion of an id fixes its row and its layer tag; later
/// insertions of the same id are no-ops. `finish` materializes feature
/// buffers and emits exactly the edges running between members.
pub(crate) struct NodeSet {
    index: FxHashMap<NodeId, u32>,
    ids: Vec<NodeId>,
    sources: Vec<NodeSource>,
    layers: Vec<i32>,
}

impl NodeSet {
    pub(crate) fn new() -> NodeSet {
        NodeSet::with_capacity(0)
    }

    pub(crate) fn with_capacity(cap: usize) -> NodeSet {
        NodeSet {
            index: FxHashMap::default(),
            ids: Vec::with_capacity(cap),
            sources: Vec::with_capacity(cap),
            layers: Vec::with_capacity(cap),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Adds `id` if unseen; returns its row and whether it was new.
    pub(crate) fn insert(&mut self, id: NodeId, source: NodeSource, layer: i32) -> (u32, bool) {
        if let Some(&row) = self.index.get(&id) {
            return (row, false);
        }
        let row = self.ids.len() as u32;
        self.index.insert(id, row);
        self.ids.push(id);
        self.sources.push(source);
        self.layers.push(layer);
        (row, true)
    }

    /// Out-neighbors of the node at `row`, wherever its data lives.
    pub(crate) fn neighbors_at<'a>(
        &'a self,
        ctx: &'a SampleContext,
        row: usize,
    ) -> &'a [NodeId] {
        match &self.sources[row] {
            NodeSource::Local(local) => ctx.store.neighbors_of(*local),
            NodeSource::Remote(data) => &data.neighbors,
        }
    }

    /// Builds the batch: row-aligned feature copies plus every edge whose
    /// endpoints are both members.
    pub(crate) fn finish(
        self,
        ctx: &SampleContext,
        kind: SamplerKind,
        with_layers: bool,
    ) -> Result<GraphBatch> {
        let n = self.ids.len();
        let fw = ctx.meta().feature_width;
        let iw = ctx.meta().int_width;
        let mut features = Vec::with_capacity(n * fw);
        let mut ints = Vec::with_capacity(n * iw);
        for source in &self.sources {
            match source {
                NodeSource::Local(local) => {
                    features.extend_from_slice(ctx.store.features_of(*local));
                    ints.extend_from_slice(ctx.store.ints_of(*local));
                }
                NodeSource::Remote(data) => {
                    features.extend_from_slice(&data.features);
                    ints.extend_from_slice(&data.ints);
                }
            }
        }
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for row in 0..n {
            for g in self.neighbors_at(ctx, row) {
                if let Some(&v) = self.index.get(g) {
                    src.push(row as u32);
                    dst.push(v);
                }
            }
        }
        let extra = if with_layers { self.layers } else { Vec::new() };
        GraphBatch::new(
            kind,
            self.ids,
            fw,
            features,
            iw,
            ints,
            extra,
            EdgeList::Coo { src, dst },
        )
    }
}

/// A batch producer. One instance runs per pool thread, owning its RNG.
pub trait Sampler: Send {
    /// Family tag stamped on produced batches.
    fn kind(&self) -> SamplerKind;
    /// Produces the next batch against `ctx`.
    fn produce(&mut self, ctx: &SampleContext) -> Result<GraphBatch>;
}

pub(crate) fn build_sampler(config: SamplerConfig, rng: ChaCha8Rng) -> Box<dyn Sampler> {
    match config {
        SamplerConfig::LocalNode { batch_size } => Box::new(LocalNodeSampler::new(batch_size, rng)),
        SamplerConfig::GlobalNode { batch_size } => {
            Box::new(GlobalNodeSampler::new(batch_size, rng))
        }
        SamplerConfig::RandomWalk { heads, length } => {
            Box::new(RandomWalkSampler::new(heads, length, rng))
        }
        SamplerConfig::FanOut {
            batch_size,
            depth,
            width,
        } => Box::new(FanOutSampler::new(batch_size, depth, width, rng)),
    }
}

fn thread_rng_for(seed: Option<u64>, thread: usize) -> ChaCha8Rng {
    match seed {
        Some(s) => {
            ChaCha8Rng::seed_from_u64(s.wrapping_add((thread as u64).wrapping_mul(0x9e3779b97f4a7c15)))
        }
        None => ChaCha8Rng::from_entropy(),
    }
}

/// One sampler's thread pool and its bounded output channel.
///
/// `prepare` creates the channel so consumers can attach before any thread
/// runs; `start` spawns the producers. The split lets a server register on
/// the cluster before its samplers begin issuing cross-shard fetches.
pub(crate) struct SamplePool {
    kind: SamplerKind,
    config: SamplerConfig,
    threads: usize,
    seed: Option<u64>,
    receiver: Receiver<Result<GraphBatch>>,
    sender: Mutex<Option<Sender<Result<GraphBatch>>>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SamplePool {
    pub(crate) fn prepare(
        config: SamplerConfig,
        threads: usize,
        queue_depth: usize,
        seed: Option<u64>,
    ) -> SamplePool {
        let (tx, rx) = bounded(queue_depth);
        SamplePool {
            kind: config.kind(),
            config,
            threads,
            seed,
            receiver: rx,
            sender: Mutex::new(Some(tx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn kind(&self) -> SamplerKind {
        self.kind
    }

    pub(crate) fn receiver(&self) -> &Receiver<Result<GraphBatch>> {
        &self.receiver
    }

    /// Spawns the pool's producer threads. A second call is a no-op.
    pub(crate) fn start(&self, ctx: &Arc<SampleContext>) -> Result<()> {
        let Some(tx) = self.sender.lock().take() else {
            return Ok(());
        };
        let mut handles = self.handles.lock();
        for t in 0..self.threads {
            let worker = SampleWorker {
                sampler: build_sampler(self.config, thread_rng_for(self.seed, t)),
                ctx: Arc::clone(ctx),
                tx: tx.clone(),
                shutdown: Arc::clone(&self.shutdown),
            };
            let handle = thread::Builder::new()
                .name(format!("tessera-sample-{}-{t}", self.kind))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        Ok(())
    }

    /// Stops and joins every producer thread.
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!(kind = %self.kind, "sampler.pool.stopped");
    }
}

struct SampleWorker {
    sampler: Box<dyn Sampler>,
    ctx: Arc<SampleContext>,
    tx: Sender<Result<GraphBatch>>,
    shutdown: Arc<AtomicBool>,
}

impl SampleWorker {
    fn run(mut self) {
        debug!(kind = %self.sampler.kind(), "sampler.worker.start");
        'produce: while !self.shutdown.load(Ordering::SeqCst) {
            let mut item = self.sampler.produce(&self.ctx);
            if let Err(e) = &item {
                warn!(kind = %self.sampler.kind(), error = %e, "sampler.produce.error");
            }
            loop {
                match self.tx.send_timeout(item, SEND_POLL) {
                    Ok(()) => continue 'produce,
                    Err(SendTimeoutError::Timeout(back)) => {
                        if self.shutdown.load(Ordering::SeqCst) {
                            break 'produce;
                        }
                        item = back;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => break 'produce,
                }
            }
        }
        debug!(kind = %self.sampler.kind(), "sampler.worker.exit");
    }
}
