//! Core identifiers and shared data types.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Global node identifier, unique across every shard of a job.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Ticket for one in-flight pull; resolves to exactly one reply.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct QueryId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Integer-feature column holding the class label.
pub const INT_COL_LABEL: usize = 0;
/// Integer-feature column holding the split flag.
pub const INT_COL_SPLIT: usize = 1;

/// Split flag marking a training node.
pub const SPLIT_TRAIN: i32 = 1;
/// Split flag marking an evaluation node.
pub const SPLIT_EVAL: i32 = 2;
/// Split flag marking a test node.
pub const SPLIT_TEST: i32 = 3;

/// Role a process plays in the job topology.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Runs the training loop and pulls batches.
    Worker,
    /// Owns one shard and produces batches.
    Server,
    /// Coordinates startup; holds no graph state.
    Scheduler,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Worker => "worker",
            Role::Server => "server",
            Role::Scheduler => "scheduler",
        };
        f.write_str(name)
    }
}

/// The sampler families a server can run.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Uniform local seeds plus their shard-local neighborhood.
    LocalNode,
    /// Uniform sample over the whole id space, cross-shard.
    GlobalNode,
    /// Union of fixed-length random walks from local seeds.
    RandomWalk,
    /// Depth-bounded neighbor expansion from local training seeds.
    FanOut,
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplerKind::LocalNode => "local_node",
            SamplerKind::GlobalNode => "global_node",
            SamplerKind::RandomWalk => "random_walk",
            SamplerKind::FanOut => "fan_out",
        };
        f.write_str(name)
    }
}

/// Full parameterization of one sampler instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerConfig {
    /// Local seeds and their shard-local 1-hop neighborhood.
    LocalNode {
        /// Seeds per batch, clamped to the shard size.
        batch_size: usize,
    },
    /// Uniform draw over every node of the job.
    GlobalNode {
        /// Nodes per batch, clamped to the job size.
        batch_size: usize,
    },
    /// Random walks from uniformly chosen local seeds.
    RandomWalk {
        /// Walks started per batch.
        heads: usize,
        /// Steps attempted per walk; dead ends cut a walk short.
        length: usize,
    },
    /// GraphSage-style layered expansion from local training seeds.
    FanOut {
        /// Seeds per batch, clamped to the shard's training-node count.
        batch_size: usize,
        /// Expansion rounds.
        depth: usize,
        /// Neighbors sampled per frontier node and round.
        width: usize,
    },
}

impl SamplerConfig {
    /// The family this configuration instantiates.
    pub fn kind(&self) -> SamplerKind {
        match self {
            SamplerConfig::LocalNode { .. } => SamplerKind::LocalNode,
            SamplerConfig::GlobalNode { .. } => SamplerKind::GlobalNode,
            SamplerConfig::RandomWalk { .. } => SamplerKind::RandomWalk,
            SamplerConfig::FanOut { .. } => SamplerKind::FanOut,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let ok = match *self {
            SamplerConfig::LocalNode { batch_size } => batch_size > 0,
            SamplerConfig::GlobalNode { batch_size } => batch_size > 0,
            SamplerConfig::RandomWalk { heads, length } => heads > 0 && length > 0,
            SamplerConfig::FanOut {
                batch_size,
                depth,
                width,
            } => batch_size > 0 && depth > 0 && width > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(TesseraError::Config(format!(
                "sampler {} has a zero-valued parameter",
                self.kind()
            )))
        }
    }
}

/// One node's attributes as shipped between shards and into batches.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeData {
    /// Dense f32 feature row.
    pub features: Vec<f32>,
    /// Integer feature row; columns 0 and 1 are label and split flag.
    pub ints: Vec<i32>,
    /// Ordered out-neighbors, global ids.
    pub neighbors: Vec<NodeId>,
}

/// Sparse result of an ad-hoc node fetch, keyed by global id.
pub type NodePack = FxHashMap<NodeId, Arc<NodeData>>;
