//! Job topology and the in-process reference transport.
//!
//! A job is a fixed set of processes: `num_workers` training workers,
//! `num_servers` shard servers, and one scheduler. [`ClusterBus`] carries
//! the shared state they rendezvous through: registered server endpoints,
//! the startup handshake, and the barrier groups. [`init`] is the one
//! lifecycle entry point; it blocks until the whole job has joined and
//! returns a role-specific handle.
//!
//! The bus is an in-process stand-in for a real transport. Deployments
//! that cross machine boundaries implement [`ServiceEndpoint`] and
//! [`FetchBackend`] over their own wire and reuse everything above those
//! seams unchanged.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::client::DistClient;
use crate::error::{Result, TesseraError};
use crate::model::{NodeId, NodePack, Role};
use crate::net::{fetch_with_retry, FetchBackend, RetryPolicy, ServiceEndpoint};
use crate::server::{RunningServer, ServerOptions, ServerProcess};
use crate::store::PartitionStore;

mod barrier;

pub use barrier::BarrierGroup;

/// Identity and inputs of one process joining a job.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Role this process plays.
    pub role: Role,
    /// Rank within the role, starting at zero.
    pub rank: usize,
    /// Dataset root holding `meta.toml` and the shard directories.
    /// Workers and the scheduler ignore it.
    pub data_dir: PathBuf,
    /// Server tunables; ignored by the other roles.
    pub server: ServerOptions,
}

/// Shared rendezvous state of one job.
pub struct ClusterBus {
    num_workers: usize,
    num_servers: usize,
    endpoints: RwLock<Vec<Option<Arc<dyn ServiceEndpoint>>>>,
    handshake: BarrierGroup,
    all: BarrierGroup,
    workers: BarrierGroup,
}

impl ClusterBus {
    /// Creates the bus for a job of `num_workers` workers, `num_servers`
    /// servers, and one scheduler.
    pub fn new(num_workers: usize, num_servers: usize) -> Result<Arc<ClusterBus>> {
        if num_workers == 0 || num_servers == 0 {
            return Err(TesseraError::Config(
                "a job needs at least one worker and one server".into(),
            ));
        }
        Ok(Arc::new(ClusterBus {
            num_workers,
            num_servers,
            endpoints: RwLock::new(vec![None; num_servers]),
            handshake: BarrierGroup::new(num_workers + num_servers + 1),
            all: BarrierGroup::new(num_workers + num_servers),
            workers: BarrierGroup::new(num_workers),
        }))
    }

    /// Declared worker count.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Declared server count.
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// Rendezvous of every worker and server process. Each process must
    /// call it at the same program point; the scheduler sits out.
    pub fn barrier_all(&self) {
        self.all.wait();
    }

    /// Timed variant of [`ClusterBus::barrier_all`].
    pub fn barrier_all_within(&self, timeout: Duration) -> Result<()> {
        self.all.wait_within(timeout)
    }

    /// Server shard a worker pulls from: contiguous blocks of workers
    /// share a server.
    pub fn attachment_of(&self, worker_rank: usize) -> usize {
        worker_rank * self.num_servers / self.num_workers
    }

    pub(crate) fn workers_barrier(&self) -> &BarrierGroup {
        &self.workers
    }

    fn register_endpoint(&self, rank: usize, endpoint: Arc<dyn ServiceEndpoint>) -> Result<()> {
        let mut slots = self.endpoints.write();
        let Some(slot) = slots.get_mut(rank) else {
            return Err(TesseraError::InvalidArgument(format!(
                "server rank {rank} outside a {}-server job",
                self.num_servers
            )));
        };
        if slot.is_some() {
            return Err(TesseraError::InvalidArgument(format!(
                "server {rank} is already registered"
            )));
        }
        *slot = Some(endpoint);
        Ok(())
    }

    pub(crate) fn endpoint(&self, rank: usize) -> Result<Arc<dyn ServiceEndpoint>> {
        self.endpoints
            .read()
            .get(rank)
            .and_then(|slot| slot.as_ref().map(Arc::clone))
            .ok_or_else(|| {
                TesseraError::Config(format!("server {rank} is not registered on the bus"))
            })
    }
}

/// Cross-shard fetches routed over the bus, with retries.
struct BusFetch {
    bus: Arc<ClusterBus>,
    policy: RetryPolicy,
}

impl FetchBackend for BusFetch {
    fn fetch_remote(&self, owner: usize, ids: &[NodeId]) -> Result<NodePack> {
        fetch_with_retry(self.policy, owner, || {
            self.bus.endpoint(owner)?.fetch_owned(ids)
        })
    }
}

/// Role-specific result of [`init`].
pub enum Handle {
    /// A server ready to be configured; see [`ServerBoot`].
    Server(ServerBoot),
    /// A worker attached to its server.
    Worker(DistClient),
    /// The scheduler.
    Scheduler(SchedulerHandle),
}

impl Handle {
    /// Role this handle was initialized as.
    pub fn role(&self) -> Role {
        match self {
            Handle::Server(_) => Role::Server,
            Handle::Worker(_) => Role::Worker,
            Handle::Scheduler(_) => Role::Scheduler,
        }
    }

    /// Unwraps the server handle.
    pub fn into_server(self) -> Result<ServerBoot> {
        match self {
            Handle::Server(boot) => Ok(boot),
            other => Err(other.wrong_role(Role::Server)),
        }
    }

    /// Unwraps the worker handle.
    pub fn into_worker(self) -> Result<DistClient> {
        match self {
            Handle::Worker(client) => Ok(client),
            other => Err(other.wrong_role(Role::Worker)),
        }
    }

    /// Unwraps the scheduler handle.
    pub fn into_scheduler(self) -> Result<SchedulerHandle> {
        match self {
            Handle::Scheduler(handle) => Ok(handle),
            other => Err(other.wrong_role(Role::Scheduler)),
        }
    }

    fn wrong_role(&self, wanted: Role) -> TesseraError {
        TesseraError::InvalidArgument(format!(
            "process was initialized as a {}, not a {wanted}",
            self.role()
        ))
    }
}

/// Joins a process to the job and blocks until every declared process has
/// joined.
///
/// Servers return first as an unregistered [`ServerBoot`]; their arrival
/// at the handshake happens inside [`ServerBoot::ready`], after the cache
/// and samplers are declared. Workers and the scheduler arrive here.
pub fn init(bus: &Arc<ClusterBus>, config: ProcessConfig) -> Result<Handle> {
    match config.role {
        Role::Server => {
            if config.rank >= bus.num_servers {
                return Err(TesseraError::InvalidArgument(format!(
                    "server rank {} outside a {}-server job",
                    config.rank, bus.num_servers
                )));
            }
            let store = Arc::new(PartitionStore::load(&config.data_dir, config.rank)?);
            if store.meta().partitions != bus.num_servers {
                return Err(TesseraError::Config(format!(
                    "dataset has {} partitions but the job declares {} servers",
                    store.meta().partitions,
                    bus.num_servers
                )));
            }
            let backend = Arc::new(BusFetch {
                bus: Arc::clone(bus),
                policy: config.server.fetch_retry,
            });
            let proc = ServerProcess::new(store, backend, config.server);
            info!(rank = config.rank, role = %Role::Server, "cluster.init");
            Ok(Handle::Server(ServerBoot {
                bus: Arc::clone(bus),
                rank: config.rank,
                proc,
            }))
        }
        Role::Worker => {
            if config.rank >= bus.num_workers {
                return Err(TesseraError::InvalidArgument(format!(
                    "worker rank {} outside a {}-worker job",
                    config.rank, bus.num_workers
                )));
            }
            info!(rank = config.rank, role = %Role::Worker, "cluster.init");
            bus.handshake.wait();
            let attach = bus.attachment_of(config.rank);
            let endpoint = bus.endpoint(attach)?;
            debug!(rank = config.rank, server = attach, "cluster.worker.attach");
            let client = DistClient::new(config.rank, Arc::clone(bus), endpoint)?;
            Ok(Handle::Worker(client))
        }
        Role::Scheduler => {
            info!(role = %Role::Scheduler, "cluster.init");
            bus.handshake.wait();
            Ok(Handle::Scheduler(SchedulerHandle {
                bus: Arc::clone(bus),
            }))
        }
    }
}

/// A server process between [`init`] and service start.
///
/// Cache and sampler declarations happen here; [`ServerBoot::ready`]
/// registers the server on the bus, joins the handshake, and only then
/// starts the sampler threads, so no sampler can fetch from a shard that
/// has not finished loading.
pub struct ServerBoot {
    bus: Arc<ClusterBus>,
    rank: usize,
    proc: ServerProcess,
}

impl ServerBoot {
    /// Shard rank this server owns.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// See [`ServerProcess::init_cache`].
    pub fn init_cache(
        &mut self,
        capacity: crate::cache::CacheCapacity,
        policy: crate::cache::EvictionPolicy,
    ) -> Result<()> {
        self.proc.init_cache(capacity, policy)
    }

    /// See [`ServerProcess::add_sampler`].
    pub fn add_sampler(&mut self, config: crate::model::SamplerConfig, threads: usize) -> Result<()> {
        self.proc.add_sampler(config, threads)
    }

    /// Registers on the bus, joins the startup handshake, and starts the
    /// sampler threads. Blocks until every declared process has joined.
    pub fn ready(self) -> Result<Arc<RunningServer>> {
        let server = self.proc.ready();
        self.bus
            .register_endpoint(self.rank, Arc::clone(&server) as Arc<dyn ServiceEndpoint>)?;
        debug!(rank = self.rank, "cluster.server.registered");
        self.bus.handshake.wait();
        server.start_samplers()?;
        Ok(server)
    }
}

/// The scheduler's view of the job. It holds no graph state; it exists so
/// the handshake counts a coordinator, mirroring deployments where a
/// scheduler process assigns ranks.
pub struct SchedulerHandle {
    bus: Arc<ClusterBus>,
}

impl SchedulerHandle {
    /// Declared worker count.
    pub fn num_workers(&self) -> usize {
        self.bus.num_workers()
    }

    /// Declared server count.
    pub fn num_servers(&self) -> usize {
        self.bus.num_servers()
    }
}

/// Whole job in one OS process: servers and the scheduler on background
/// threads, workers created by the caller.
///
/// [`LocalCluster::launch`] returns before the handshake completes. The
/// caller must then create every declared worker via
/// [`LocalCluster::worker`]; until the last one joins, server boots stay
/// blocked in the handshake, and [`LocalCluster::shutdown`] would block
/// with them. Workers beyond the first must be created from their own
/// threads, since each `worker` call blocks until the job is up.
pub struct LocalCluster {
    bus: Arc<ClusterBus>,
    data_dir: PathBuf,
    boots: Mutex<Vec<thread::JoinHandle<Result<Arc<RunningServer>>>>>,
    servers: Mutex<Vec<Arc<RunningServer>>>,
    scheduler: Mutex<Option<thread::JoinHandle<Result<()>>>>,
}

impl LocalCluster {
    /// Spawns `num_servers` server threads plus the scheduler against the
    /// dataset under `data_dir`. `setup` configures each server's cache
    /// and samplers before it goes ready.
    pub fn launch<F>(
        data_dir: &std::path::Path,
        num_workers: usize,
        num_servers: usize,
        opts: ServerOptions,
        setup: F,
    ) -> Result<LocalCluster>
    where
        F: Fn(&mut ServerBoot) -> Result<()> + Send + Sync + 'static,
    {
        let bus = ClusterBus::new(num_workers, num_servers)?;
        let setup = Arc::new(setup);
        let mut boots = Vec::with_capacity(num_servers);
        for rank in 0..num_servers {
            let bus = Arc::clone(&bus);
            let dir = data_dir.to_path_buf();
            let opts = opts.clone();
            let setup = Arc::clone(&setup);
            let handle = thread::Builder::new()
                .name(format!("tessera-server-{rank}"))
                .spawn(move || {
                    let config = ProcessConfig {
                        role: Role::Server,
                        rank,
                        data_dir: dir,
                        server: opts,
                    };
                    let mut boot = init(&bus, config)?.into_server()?;
                    setup(&mut boot)?;
                    boot.ready()
                })?;
            boots.push(handle);
        }
        let scheduler = {
            let bus = Arc::clone(&bus);
            thread::Builder::new()
                .name("tessera-scheduler".into())
                .spawn(move || -> Result<()> {
                    let config = ProcessConfig {
                        role: Role::Scheduler,
                        rank: 0,
                        data_dir: PathBuf::new(),
                        server: ServerOptions::default(),
                    };
                    init(&bus, config)?.into_scheduler()?;
                    Ok(())
                })?
        };
        Ok(LocalCluster {
            bus,
            data_dir: data_dir.to_path_buf(),
            boots: Mutex::new(boots),
            servers: Mutex::new(Vec::new()),
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    /// The job's bus, for barrier calls from test and demo code.
    pub fn bus(&self) -> &Arc<ClusterBus> {
        &self.bus
    }

    /// Joins worker `rank` to the job. Blocks until every declared
    /// process has joined.
    pub fn worker(&self, rank: usize) -> Result<DistClient> {
        let config = ProcessConfig {
            role: Role::Worker,
            rank,
            data_dir: self.data_dir.clone(),
            server: ServerOptions::default(),
        };
        init(&self.bus, config)?.into_worker()
    }

    /// The running servers, in rank order. Blocks until the handshake
    /// completes, so every declared worker must already have joined.
    pub fn servers(&self) -> Result<Vec<Arc<RunningServer>>> {
        let mut boots = self.boots.lock();
        let mut servers = self.servers.lock();
        for handle in boots.drain(..) {
            match handle.join() {
                Ok(result) => servers.push(result?),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        Ok(servers.clone())
    }

    /// Stops every server's samplers and joins the background threads.
    pub fn shutdown(&self) -> Result<()> {
        let servers = self.servers()?;
        if let Some(handle) = self.scheduler.lock().take() {
            match handle.join() {
                Ok(result) => result?,
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        for server in &servers {
            server.shutdown();
        }
        info!(servers = servers.len(), "cluster.shutdown");
        Ok(())
    }
}
