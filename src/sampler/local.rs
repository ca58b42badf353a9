//! Shard-local seed sampling.

use rand::seq::index;
use rand_chacha::ChaCha8Rng;

use crate::batch::GraphBatch;
use crate::error::Result;
use crate::model::SamplerKind;

use super::{NodeSet, NodeSource, SampleContext, Sampler};

/// Uniform local seeds plus their shard-local 1-hop neighborhood.
///
/// Never reaches outside the shard: neighbors stored on other shards are
/// left out of the batch, so producing one touches neither cache nor
/// transport.
pub(crate) struct LocalNodeSampler {
    batch_size: usize,
    rng: ChaCha8Rng,
}

impl LocalNodeSampler {
    pub(crate) fn new(batch_size: usize, rng: ChaCha8Rng) -> LocalNodeSampler {
        LocalNodeSampler { batch_size, rng }
    }
}

impl Sampler for LocalNodeSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::LocalNode
    }

    fn produce(&mut self, ctx: &SampleContext) -> Result<GraphBatch> {
        let n = ctx.store.len();
        let k = self.batch_size.min(n);
        let mut set = NodeSet::with_capacity(k * 2);
        let mut seed_locals = Vec::with_capacity(k);
        for local in index::sample(&mut self.rng, n, k) {
            set.insert(ctx.store.global_of(local), NodeSource::Local(local), 0);
            seed_locals.push(local);
        }
        for &local in &seed_locals {
            for &g in ctx.store.neighbors_of(local) {
                if let Some(neighbor_local) = ctx.store.local_of(g) {
                    set.insert(g, NodeSource::Local(neighbor_local), 0);
                }
            }
        }
        set.finish(ctx, SamplerKind::LocalNode, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::DatasetSpec;
    use crate::sampler::testutil;

    #[test]
    fn batch_holds_seeds_and_local_neighbors() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = DatasetSpec {
            nodes: 100,
            partitions: 1,
            avg_degree: 4,
            ..DatasetSpec::default()
        };
        let ctx = testutil::standalone_context(dir.path(), &spec)?;
        let mut sampler = LocalNodeSampler::new(16, testutil::rng(3));
        let batch = sampler.produce(&ctx)?;
        assert!(batch.node_count() >= 16);
        for &id in batch.nodes() {
            assert!(ctx.store.contains(id), "row {id} is not shard-local");
        }
        assert!(batch.extra().is_empty());
        Ok(())
    }

    #[test]
    fn batch_size_clamps_to_shard() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = DatasetSpec {
            nodes: 12,
            partitions: 1,
            ..DatasetSpec::default()
        };
        let ctx = testutil::standalone_context(dir.path(), &spec)?;
        let mut sampler = LocalNodeSampler::new(64, testutil::rng(5));
        let batch = sampler.produce(&ctx)?;
        assert_eq!(batch.node_count(), 12);
        Ok(())
    }

    #[test]
    fn same_seed_reproduces_batches() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let spec = DatasetSpec {
            nodes: 80,
            partitions: 1,
            ..DatasetSpec::default()
        };
        let ctx = testutil::standalone_context(dir.path(), &spec)?;
        let a = LocalNodeSampler::new(8, testutil::rng(42)).produce(&ctx)?;
        let b = LocalNodeSampler::new(8, testutil::rng(42)).produce(&ctx)?;
        assert_eq!(a.nodes(), b.nodes());
        Ok(())
    }
}
