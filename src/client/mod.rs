//! Worker-facing service surfaces.
//!
//! [`GraphService`] is the protocol a training loop programs against.
//! [`DistClient`] is the multi-process implementation handed out by
//! [`crate::cluster::init`]; [`LocalClient`] runs a whole single-shard job
//! inside one process, for notebooks, tests, and the demo binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cluster::ClusterBus;
use crate::error::{Result, TesseraError};
use crate::meta::JobMeta;
use crate::model::{NodeId, QueryId, SamplerKind};
use crate::net::{NoRemote, ServiceEndpoint};
use crate::router::{QueryRouter, Reply};
use crate::server::{RunningServer, ServerOptions, ServerProcess, ServerStats};
use crate::store::PartitionStore;

/// The query protocol a training loop drives.
///
/// Pulls return a ticket immediately; [`GraphService::resolve`] blocks
/// until the reply lands and surrenders it exactly once.
pub trait GraphService {
    /// Job metadata.
    fn meta(&self) -> Arc<JobMeta>;

    /// Requests one minibatch; an empty selector accepts any advertised
    /// sampler kind.
    fn pull_graph(&self, selector: &[SamplerKind]) -> Result<QueryId>;

    /// Requests feature data for arbitrary nodes.
    fn pull_node(&self, ids: &[NodeId]) -> Result<QueryId>;

    /// Blocks for and surrenders the reply of `query`.
    fn resolve(&self, query: QueryId) -> Result<Reply>;

    /// Abandons an unresolved query.
    fn cancel(&self, query: QueryId) -> Result<()>;
}

/// A worker attached to its server within a running job.
pub struct DistClient {
    rank: usize,
    bus: Arc<ClusterBus>,
    endpoint: Arc<dyn ServiceEndpoint>,
    router: QueryRouter,
}

impl DistClient {
    pub(crate) fn new(
        rank: usize,
        bus: Arc<ClusterBus>,
        endpoint: Arc<dyn ServiceEndpoint>,
    ) -> Result<DistClient> {
        let router = QueryRouter::new(Arc::clone(&endpoint))?;
        Ok(DistClient {
            rank,
            bus,
            endpoint,
            router,
        })
    }

    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Declared worker count of the job.
    pub fn num_workers(&self) -> usize {
        self.bus.num_workers()
    }

    /// Declared server count of the job.
    pub fn num_servers(&self) -> usize {
        self.bus.num_servers()
    }

    /// Sampler kinds the attached server advertises.
    pub fn sampler_kinds(&self) -> Vec<SamplerKind> {
        self.router.advertised().to_vec()
    }

    /// Rendezvous of every worker. Blocks until all of them call it.
    pub fn barrier(&self) {
        self.bus.workers_barrier().wait();
    }

    /// Timed variant of [`DistClient::barrier`].
    pub fn barrier_within(&self, timeout: Duration) -> Result<()> {
        self.bus.workers_barrier().wait_within(timeout)
    }

    /// Rendezvous of every worker and server process. Server-side code
    /// must arrive at the matching point; see
    /// [`ClusterBus::barrier_all`].
    pub fn barrier_all(&self) {
        self.bus.barrier_all();
    }

    /// Timed variant of [`DistClient::barrier_all`].
    pub fn barrier_all_within(&self, timeout: Duration) -> Result<()> {
        self.bus.barrier_all_within(timeout)
    }

    /// Leaves the job: drains this worker's queries and waits for the
    /// other workers to finalize too.
    pub fn finalize(self) {
        self.router.close();
        self.bus.workers_barrier().wait();
        info!(rank = self.rank, "client.finalize");
    }
}

impl GraphService for DistClient {
    fn meta(&self) -> Arc<JobMeta> {
        self.endpoint.meta()
    }

    fn pull_graph(&self, selector: &[SamplerKind]) -> Result<QueryId> {
        self.router.pull_graph(selector)
    }

    fn pull_node(&self, ids: &[NodeId]) -> Result<QueryId> {
        self.router.pull_node(ids)
    }

    fn resolve(&self, query: QueryId) -> Result<Reply> {
        self.router.resolve(query)
    }

    fn cancel(&self, query: QueryId) -> Result<()> {
        self.router.cancel(query)
    }
}

/// A whole single-shard job in one process: server, samplers, and client
/// rolled together.
pub struct LocalClient {
    server: Arc<RunningServer>,
    router: QueryRouter,
}

impl LocalClient {
    /// Loads the single-partition dataset under `data_dir` and brings up
    /// an embedded server. `setup` declares the cache and samplers.
    pub fn open<F>(data_dir: &Path, opts: ServerOptions, setup: F) -> Result<LocalClient>
    where
        F: FnOnce(&mut ServerProcess) -> Result<()>,
    {
        let meta = JobMeta::load(data_dir)?;
        if meta.partitions != 1 {
            return Err(TesseraError::Config(format!(
                "dataset has {} partitions; a standalone client serves exactly one",
                meta.partitions
            )));
        }
        let store = Arc::new(PartitionStore::load_with_meta(data_dir, 0, Arc::new(meta))?);
        let mut proc = ServerProcess::new(store, Arc::new(NoRemote), opts);
        setup(&mut proc)?;
        let server = proc.ready();
        server.start_samplers()?;
        let router = QueryRouter::new(Arc::clone(&server) as Arc<dyn ServiceEndpoint>)?;
        info!(path = %data_dir.display(), "client.local.open");
        Ok(LocalClient { server, router })
    }

    /// Serving counters of the embedded server.
    pub fn perf(&self) -> ServerStats {
        self.server.perf()
    }

    /// Sampler kinds the embedded server advertises.
    pub fn sampler_kinds(&self) -> Vec<SamplerKind> {
        self.router.advertised().to_vec()
    }

    /// Stops the router lanes and the embedded server. Runs on drop as
    /// well; calling it twice is safe.
    pub fn close(&self) {
        self.router.close();
        self.server.shutdown();
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl GraphService for LocalClient {
    fn meta(&self) -> Arc<JobMeta> {
        ServiceEndpoint::meta(&*self.server)
    }

    fn pull_graph(&self, selector: &[SamplerKind]) -> Result<QueryId> {
        self.router.pull_graph(selector)
    }

    fn pull_node(&self, ids: &[NodeId]) -> Result<QueryId> {
        self.router.pull_node(ids)
    }

    fn resolve(&self, query: QueryId) -> Result<Reply> {
        self.router.resolve(query)
    }

    fn cancel(&self, query: QueryId) -> Result<()> {
        self.router.cancel(query)
    }
}
