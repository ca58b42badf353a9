//! Depth-bounded fan-out sampling over training seeds.

use rand::seq::index;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

use crate::batch::GraphBatch;
use crate::error::Result;
use crate::model::{NodeId, SamplerKind};

use super::{NodeSet, SampleContext, Sampler};

/// GraphSage-style layered expansion.
///
/// Seeds come uniformly from the shard's training nodes. Each of `depth`
/// rounds expands the previous round's new arrivals: a frontier node with
/// degree at least `width` contributes `width` distinct neighbors, a lower
/// degree one contributes `width` draws with replacement, and an isolated
/// one contributes nothing. The batch's `extra` column records each row's
/// first-seen layer, seeds at 0, so a trainer can mask its loss to seeds.
pub(crate) struct FanOutSampler {
    batch_size: usize,
    depth: usize,
    width: usize,
    rng: ChaCha8Rng,
}

impl FanOutSampler {
    pub(crate) fn new(
        batch_size: usize,
        depth: usize,
        width: usize,
        rng: ChaCha8Rng,
    ) -> FanOutSampler {
        FanOutSampler {
            batch_size,
            depth,
            width,
            rng,
        }
    }
}

impl Sampler for FanOutSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::FanOut
    }

    fn produce(&mut self, ctx: &SampleContext) -> Result<GraphBatch> {
        let train = ctx.store.train_nodes();
        let k = self.batch_size.min(train.len());
        let mut set = NodeSet::with_capacity(k * (self.width + 1));
        let mut frontier: Vec<u32> = Vec::with_capacity(k);
        for pick in index::sample(&mut self.rng, train.len(), k) {
            let local = train[pick] as usize;
            let (row, fresh) = set.insert(ctx.store.global_of(local), super::NodeSource::Local(local), 0);
            if fresh {
                frontier.push(row);
            }
        }
        for layer in 1..=self.depth {
            let mut next: Vec<u32> = Vec::new();
            for &row in &frontier {
                let mut chosen: SmallVec<[NodeId; 8]> = SmallVec::new();
                {
                    let neighbors = set.neighbors_at(ctx, row as usize);
                    let deg = neighbors.len();
                    if deg == 0 {
                        continue;
                    }
                    if deg >= self.width {
                        for idx in index::sample(&mut self.rng, deg, self.width) {
                            chosen.push(neighbors[idx]);
                        }
                    } else {
                        for _ in 0..self.width {
                            chosen.push(neighbors[self.rng.gen_range(0..deg)]);
                        }
                    }
                }
                for id in chosen {
                    let source = ctx.resolve(id)?;
                    let (new_row, fresh) = set.insert(id, source, layer as i32);
                    if fresh {
                        next.push(new_row);
                    }
                }
            }
            frontier = next;
        }
        set.finish(ctx, SamplerKind::FanOut, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::DatasetSpec;
    use crate::model::{INT_COL_SPLIT, SPLIT_TRAIN};
    use crate::sampler::testutil;

    fn ctx_with_train(
        dir: &std::path::Path,
        nodes: u64,
    ) -> Result<super::super::SampleContext> {
        let spec = DatasetSpec {
            nodes,
            partitions: 1,
            avg_degree: 4,
            train_fraction: 0.4,
            ..DatasetSpec::default()
        };
        testutil::standalone_context(dir, &spec)
    }

    #[test]
    fn seeds_are_training_nodes_at_layer_zero() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = ctx_with_train(dir.path(), 100)?;
        let mut sampler = FanOutSampler::new(8, 2, 3, testutil::rng(31));
        let batch = sampler.produce(&ctx)?;
        assert_eq!(batch.extra().len(), batch.node_count());
        let mut seeds = 0;
        for (row, &layer) in batch.extra().iter().enumerate() {
            assert!((0..=2).contains(&layer));
            if layer == 0 {
                seeds += 1;
                let local = ctx
                    .store
                    .local_of(batch.nodes()[row])
                    .expect("seed rows are local");
                assert_eq!(ctx.store.ints_of(local)[INT_COL_SPLIT], SPLIT_TRAIN);
            }
        }
        assert!(seeds > 0 && seeds <= 8);
        Ok(())
    }

    #[test]
    fn expansion_respects_width_and_depth() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = ctx_with_train(dir.path(), 200)?;
        let (batch_size, depth, width) = (4usize, 3usize, 2usize);
        let mut sampler = FanOutSampler::new(batch_size, depth, width, testutil::rng(77));
        let batch = sampler.produce(&ctx)?;
        // Geometric bound on the expansion tree.
        let mut bound = 0usize;
        let mut layer_cap = batch_size;
        bound += layer_cap;
        for _ in 0..depth {
            layer_cap *= width;
            bound += layer_cap;
        }
        assert!(batch.node_count() <= bound);
        for &layer in batch.extra() {
            assert!((layer as usize) <= depth);
        }
        Ok(())
    }

    #[test]
    fn revisited_nodes_keep_first_layer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = ctx_with_train(dir.path(), 40)?;
        let mut sampler = FanOutSampler::new(6, 4, 4, testutil::rng(5));
        let batch = sampler.produce(&ctx)?;
        // Dense expansion on a small graph revisits nodes; extra still
        // holds one layer per row, each within bounds.
        assert_eq!(batch.extra().len(), batch.node_count());
        let seed_rows = batch.extra().iter().filter(|&&l| l == 0).count();
        assert!(seed_rows <= 6);
        Ok(())
    }
}
