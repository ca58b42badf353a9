#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;
use tessera::client::{GraphService, LocalClient};
use tessera::datagen::{self, DatasetSpec};
use tessera::server::ServerOptions;
use tessera::{SamplerConfig, SamplerKind};

const NODE_COUNT: u64 = 20_000;
const FEATURE_WIDTH: usize = 64;

struct PullHarness {
    _tmpdir: TempDir,
    client: LocalClient,
}

impl PullHarness {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let spec = DatasetSpec {
            nodes: NODE_COUNT,
            feature_width: FEATURE_WIDTH,
            partitions: 1,
            avg_degree: 8,
            ..DatasetSpec::default()
        };
        datagen::generate(tmpdir.path(), &spec).expect("dataset");
        let opts = ServerOptions {
            sampler_seed: Some(0xDEADBEEF),
            ..ServerOptions::default()
        };
        let client = LocalClient::open(tmpdir.path(), opts, |proc| {
            proc.add_sampler(SamplerConfig::LocalNode { batch_size: 512 }, 2)?;
            proc.add_sampler(
                SamplerConfig::RandomWalk {
                    heads: 128,
                    length: 4,
                },
                2,
            )?;
            proc.add_sampler(
                SamplerConfig::FanOut {
                    batch_size: 128,
                    depth: 2,
                    width: 10,
                },
                2,
            )
        })
        .expect("client");
        Self {
            _tmpdir: tmpdir,
            client,
        }
    }

    fn pull(&self, kind: SamplerKind) -> usize {
        let q = self.client.pull_graph(&[kind]).expect("pull");
        let batch = self
            .client
            .resolve(q)
            .expect("resolve")
            .into_graph()
            .expect("graph");
        batch.node_count()
    }
}

fn micro_sampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/sampler");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    let harness = PullHarness::new();
    for kind in [
        SamplerKind::LocalNode,
        SamplerKind::RandomWalk,
        SamplerKind::FanOut,
    ] {
        group.bench_with_input(
            BenchmarkId::new("pull_resolve", format!("{kind}")),
            &kind,
            |b, kind| {
                b.iter(|| black_box(harness.pull(*kind)));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, micro_sampler);
criterion_main!(benches);
