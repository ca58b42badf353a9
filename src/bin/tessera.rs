//! Command-line front end: generate, inspect, and demo partitioned graph
//! datasets.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use tessera::cache::{CacheCapacity, EvictionPolicy};
use tessera::client::{GraphService, LocalClient};
use tessera::cluster::LocalCluster;
use tessera::datagen::{self, DatasetSpec};
use tessera::meta::JobMeta;
use tessera::server::{ServerOptions, ServerStats};
use tessera::store::PartitionStore;
use tessera::{NodeId, SamplerConfig};

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Sharded in-memory graph-feature server toolkit",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PolicyArg {
    Lru,
    Lfu,
    LfuDecay,
}

impl From<PolicyArg> for EvictionPolicy {
    fn from(value: PolicyArg) -> EvictionPolicy {
        match value {
            PolicyArg::Lru => EvictionPolicy::Lru,
            PolicyArg::Lfu => EvictionPolicy::Lfu,
            PolicyArg::LfuDecay => EvictionPolicy::LfuDecay,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Generate a synthetic partitioned dataset")]
    Gen {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, default_value_t = 1000, help = "Total node count")]
        nodes: u64,

        #[arg(long, default_value_t = 2, help = "Number of shards")]
        partitions: usize,

        #[arg(long, default_value_t = 16, help = "f32 feature columns")]
        feature_width: usize,

        #[arg(long, default_value_t = 7, help = "Distinct class labels")]
        classes: i32,

        #[arg(long, default_value_t = 4, help = "Target out-degree per node")]
        avg_degree: usize,

        #[arg(long, default_value_t = 0.1, help = "Fraction of training nodes")]
        train_fraction: f64,

        #[arg(long, default_value_t = 7, help = "Generator seed")]
        seed: u64,
    },

    #[command(about = "Load every shard and print the dataset layout")]
    Inspect {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    #[command(about = "Serve a dataset in-process and pull a few batches")]
    Demo {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, default_value_t = 8, help = "Batches to pull per worker")]
        pulls: usize,

        #[arg(long, default_value_t = 16, help = "Seeds per batch")]
        batch_size: usize,

        #[arg(
            long,
            default_value_t = 256,
            help = "Remote-node cache capacity per server (0 disables)"
        )]
        cache_nodes: usize,

        #[arg(long, value_enum, default_value_t = PolicyArg::Lru, help = "Cache eviction policy")]
        policy: PolicyArg,

        #[arg(long, help = "Fixed sampler seed for reproducible demos")]
        seed: Option<u64>,
    },
}

#[derive(Serialize)]
struct ShardReport {
    shard: usize,
    nodes: usize,
    edges: usize,
    train: usize,
    isolated: usize,
}

#[derive(Serialize)]
struct InspectReport {
    meta: JobMeta,
    shards: Vec<ShardReport>,
}

#[derive(Serialize)]
struct WorkerReport {
    rank: usize,
    batches: usize,
    nodes: usize,
    edges: usize,
}

#[derive(Serialize)]
struct DemoReport {
    partitions: usize,
    workers: Vec<WorkerReport>,
    servers: Vec<ServerStats>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Gen {
            dir,
            nodes,
            partitions,
            feature_width,
            classes,
            avg_degree,
            train_fraction,
            seed,
        } => {
            let spec = DatasetSpec {
                nodes,
                partitions,
                feature_width,
                classes,
                avg_degree,
                train_fraction,
                seed,
                ..DatasetSpec::default()
            };
            let meta = datagen::generate(&dir, &spec)?;
            emit(cli.format, &meta, |m| {
                println!(
                    "wrote {} nodes / {} edges across {} shards into {}",
                    m.nodes,
                    m.edges,
                    m.partitions,
                    dir.display()
                );
                println!(
                    "splits: train={} eval={} test={}",
                    m.train, m.eval, m.test
                );
            })?;
        }
        Command::Inspect { dir } => {
            let report = inspect(&dir)?;
            emit(cli.format, &report, |r| {
                println!(
                    "dataset: {} nodes, {} edges, {} shards, feature_width={}, classes={}",
                    r.meta.nodes,
                    r.meta.edges,
                    r.meta.partitions,
                    r.meta.feature_width,
                    r.meta.classes
                );
                for shard in &r.shards {
                    println!(
                        "  shard {}: nodes={} edges={} train={} isolated={}",
                        shard.shard, shard.nodes, shard.edges, shard.train, shard.isolated
                    );
                }
            })?;
        }
        Command::Demo {
            dir,
            pulls,
            batch_size,
            cache_nodes,
            policy,
            seed,
        } => {
            let report = demo(&dir, pulls, batch_size, cache_nodes, policy.into(), seed)?;
            emit(cli.format, &report, |r| {
                for worker in &r.workers {
                    println!(
                        "worker {}: {} batches, {} nodes, {} edges",
                        worker.rank, worker.batches, worker.nodes, worker.edges
                    );
                }
                for server in &r.servers {
                    println!(
                        "server {}: batches={} node_fetches={} cache hits={} misses={}",
                        server.shard,
                        server.samplers.iter().map(|s| s.batches).sum::<u64>(),
                        server.node_fetches,
                        server.cache.hits,
                        server.cache.misses
                    );
                }
            })?;
        }
    }
    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(&T),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn inspect(dir: &Path) -> tessera::Result<InspectReport> {
    let meta = JobMeta::load(dir)?;
    let mut shards = Vec::with_capacity(meta.partitions);
    for rank in 0..meta.partitions {
        let store = PartitionStore::load(dir, rank)?;
        let isolated = (0..store.len()).filter(|&i| store.degree(i) == 0).count();
        shards.push(ShardReport {
            shard: rank,
            nodes: store.len(),
            edges: store.edge_count(),
            train: store.train_nodes().len(),
            isolated,
        });
    }
    Ok(InspectReport { meta, shards })
}

fn demo(
    dir: &Path,
    pulls: usize,
    batch_size: usize,
    cache_nodes: usize,
    policy: EvictionPolicy,
    seed: Option<u64>,
) -> tessera::Result<DemoReport> {
    let meta = JobMeta::load(dir)?;
    let opts = ServerOptions {
        sampler_seed: seed,
        ..ServerOptions::default()
    };
    if meta.partitions == 1 {
        demo_local(dir, pulls, batch_size, cache_nodes, policy, opts)
    } else {
        demo_cluster(dir, meta.partitions, pulls, batch_size, cache_nodes, policy, opts)
    }
}

fn demo_local(
    dir: &Path,
    pulls: usize,
    batch_size: usize,
    cache_nodes: usize,
    policy: EvictionPolicy,
    opts: ServerOptions,
) -> tessera::Result<DemoReport> {
    let client = LocalClient::open(dir, opts, |proc| {
        if cache_nodes > 0 {
            proc.init_cache(CacheCapacity::Nodes(cache_nodes), policy)?;
        }
        proc.add_sampler(SamplerConfig::LocalNode { batch_size }, 1)?;
        proc.add_sampler(SamplerConfig::RandomWalk { heads: batch_size, length: 3 }, 1)
    })?;
    let mut report = WorkerReport {
        rank: 0,
        batches: 0,
        nodes: 0,
        edges: 0,
    };
    for _ in 0..pulls {
        let q = client.pull_graph(&[])?;
        let batch = client.resolve(q)?.into_graph()?;
        report.batches += 1;
        report.nodes += batch.node_count();
        report.edges += batch.edge_count();
    }
    let q = client.pull_node(&[NodeId(0), NodeId(1)])?;
    client.resolve(q)?.into_nodes()?;
    let servers = vec![client.perf()];
    client.close();
    Ok(DemoReport {
        partitions: 1,
        workers: vec![report],
        servers,
    })
}

fn demo_cluster(
    dir: &Path,
    partitions: usize,
    pulls: usize,
    batch_size: usize,
    cache_nodes: usize,
    policy: EvictionPolicy,
    opts: ServerOptions,
) -> tessera::Result<DemoReport> {
    let cluster = LocalCluster::launch(dir, partitions, partitions, opts, move |boot| {
        if cache_nodes > 0 {
            boot.init_cache(CacheCapacity::Nodes(cache_nodes), policy)?;
        }
        boot.add_sampler(SamplerConfig::LocalNode { batch_size }, 1)?;
        boot.add_sampler(SamplerConfig::GlobalNode { batch_size }, 1)
    })?;
    let workers = thread::scope(|scope| -> tessera::Result<Vec<WorkerReport>> {
        let mut joins = Vec::with_capacity(partitions);
        for rank in 0..partitions {
            let cluster = &cluster;
            joins.push(scope.spawn(move || -> tessera::Result<WorkerReport> {
                let client = cluster.worker(rank)?;
                let mut report = WorkerReport {
                    rank,
                    batches: 0,
                    nodes: 0,
                    edges: 0,
                };
                for _ in 0..pulls {
                    let q = client.pull_graph(&[])?;
                    let batch = client.resolve(q)?.into_graph()?;
                    report.batches += 1;
                    report.nodes += batch.node_count();
                    report.edges += batch.edge_count();
                }
                if rank == 0 {
                    let q = client.pull_node(&[NodeId(0), NodeId(1), NodeId(2)])?;
                    client.resolve(q)?.into_nodes()?;
                }
                client.finalize();
                Ok(report)
            }));
        }
        let mut out = Vec::with_capacity(partitions);
        for join in joins {
            match join.join() {
                Ok(result) => out.push(result?),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        Ok(out)
    })?;
    let servers = cluster
        .servers()?
        .iter()
        .map(|server| server.perf())
        .collect();
    cluster.shutdown()?;
    Ok(DemoReport {
        partitions,
        workers,
        servers,
    })
}
