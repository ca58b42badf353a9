//! Whole-graph uniform sampling.

use rand::seq::index;
use rand_chacha::ChaCha8Rng;

use crate::batch::GraphBatch;
use crate::error::Result;
use crate::model::{NodeId, SamplerKind};

use super::{NodeSet, SampleContext, Sampler};

/// Uniform sample over the entire id space, without replacement.
///
/// Ids outside the local shard resolve through the eviction cache, fetching
/// from their owners on a miss; this sampler is what keeps the cache warm
/// on jobs whose training reads are spread across shards.
pub(crate) struct GlobalNodeSampler {
    batch_size: usize,
    rng: ChaCha8Rng,
}

impl GlobalNodeSampler {
    pub(crate) fn new(batch_size: usize, rng: ChaCha8Rng) -> GlobalNodeSampler {
        GlobalNodeSampler { batch_size, rng }
    }
}

impl Sampler for GlobalNodeSampler {
    fn kind(&self) -> SamplerKind {
        SamplerKind::GlobalNode
    }

    fn produce(&mut self, ctx: &SampleContext) -> Result<GraphBatch> {
        let total = ctx.meta().nodes as usize;
        let k = self.batch_size.min(total);
        let mut set = NodeSet::with_capacity(k);
        for pick in index::sample(&mut self.rng, total, k) {
            let id = NodeId(pick as u64);
            let source = ctx.resolve(id)?;
            set.insert(id, source, 0);
        }
        set.finish(ctx, SamplerKind::GlobalNode, false)
    }
}
