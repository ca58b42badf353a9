//! One shard of the partitioned graph, loaded once and served read-only.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::{Result, TesseraError};
use crate::meta::JobMeta;
use crate::model::{NodeData, NodeId, INT_COL_SPLIT, SPLIT_TRAIN};

pub mod files;

/// File name of a shard's packed CSR adjacency.
pub const ADJACENCY_FILE: &str = "adjacency.bin";
/// File name of a shard's f32 feature matrix.
pub const FEATURES_FILE: &str = "features.bin";
/// File name of a shard's i32 feature matrix.
pub const INTS_FILE: &str = "ints.bin";

/// In-memory image of one shard: CSR adjacency over local nodes plus the
/// two feature matrices, addressed by local index.
///
/// Local index `i` corresponds to global id `base + i`; the mapping is
/// positional, so translation in either direction is arithmetic. Adjacency
/// targets are global ids and may point into other shards. The store never
/// changes after [`PartitionStore::load`], so readers share it without locks.
#[derive(Debug)]
pub struct PartitionStore {
    shard: usize,
    meta: Arc<JobMeta>,
    base: u64,
    len: usize,
    indptr: Vec<u64>,
    targets: Vec<NodeId>,
    features: Vec<f32>,
    ints: Vec<i32>,
    train_local: Vec<u32>,
}

impl PartitionStore {
    /// Loads shard `shard` from a dataset rooted at `root`.
    pub fn load(root: &Path, shard: usize) -> Result<PartitionStore> {
        let meta = Arc::new(JobMeta::load(root)?);
        Self::load_with_meta(root, shard, meta)
    }

    /// Loads shard `shard` against an already-parsed metadata table.
    pub fn load_with_meta(root: &Path, shard: usize, meta: Arc<JobMeta>) -> Result<PartitionStore> {
        if shard >= meta.partitions {
            return Err(TesseraError::Config(format!(
                "shard {shard} out of range, job has {} partitions",
                meta.partitions
            )));
        }
        let dir = JobMeta::shard_dir(root, shard);
        let len = meta.shard_len(shard);
        let base = meta.offsets[shard];

        let adjacency = files::read_u64(&dir.join(ADJACENCY_FILE))?;
        if adjacency.len() < len + 1 {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: adjacency holds {} words, need at least {} for the index",
                adjacency.len(),
                len + 1
            )));
        }
        let (indptr_raw, targets_raw) = adjacency.split_at(len + 1);
        let indptr = indptr_raw.to_vec();
        if indptr[0] != 0 {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: adjacency index starts at {}, not 0",
                indptr[0]
            )));
        }
        if indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: adjacency index is not non-decreasing"
            )));
        }
        if indptr[len] as usize != targets_raw.len() {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: adjacency index ends at {}, but {} targets are stored",
                indptr[len],
                targets_raw.len()
            )));
        }
        if let Some(&bad) = targets_raw.iter().find(|&&t| t >= meta.nodes) {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: edge target {bad} is outside the job's {} nodes",
                meta.nodes
            )));
        }
        let targets: Vec<NodeId> = targets_raw.iter().map(|&t| NodeId(t)).collect();

        let (frows, fcols, features) = files::read_f32(&dir.join(FEATURES_FILE))?;
        if frows != len || fcols != meta.feature_width {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: features are {frows}x{fcols}, meta declares {len}x{}",
                meta.feature_width
            )));
        }
        let (irows, icols, ints) = files::read_i32(&dir.join(INTS_FILE))?;
        if irows != len || icols != meta.int_width {
            return Err(TesseraError::ShardIntegrity(format!(
                "shard {shard}: int features are {irows}x{icols}, meta declares {len}x{}",
                meta.int_width
            )));
        }

        let iw = meta.int_width;
        let train_local: Vec<u32> = (0..len)
            .filter(|&i| ints[i * iw + INT_COL_SPLIT] == SPLIT_TRAIN)
            .map(|i| i as u32)
            .collect();

        info!(
            shard,
            nodes = len,
            edges = targets.len(),
            train = train_local.len(),
            "store.load"
        );
        Ok(PartitionStore {
            shard,
            meta,
            base,
            len,
            indptr,
            targets,
            features,
            ints,
            train_local,
        })
    }

    /// Shard rank this store holds.
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Job metadata shared by every shard.
    pub fn meta(&self) -> &Arc<JobMeta> {
        &self.meta
    }

    /// Local node count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the shard owns no nodes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Locally stored edge count.
    pub fn edge_count(&self) -> usize {
        self.targets.len()
    }

    /// First global id owned by this shard.
    pub fn base(&self) -> NodeId {
        NodeId(self.base)
    }

    /// True when `id` falls inside this shard's range.
    pub fn contains(&self, id: NodeId) -> bool {
        id.0 >= self.base && id.0 < self.base + self.len as u64
    }

    /// Local index of `id`, or `None` when another shard owns it.
    pub fn local_of(&self, id: NodeId) -> Option<usize> {
        if self.contains(id) {
            Some((id.0 - self.base) as usize)
        } else {
            None
        }
    }

    /// Global id of local index `local`.
    pub fn global_of(&self, local: usize) -> NodeId {
        debug_assert!(local < self.len);
        NodeId(self.base + local as u64)
    }

    /// Feature row of local index `local`.
    pub fn features_of(&self, local: usize) -> &[f32] {
        let w = self.meta.feature_width;
        &self.features[local * w..(local + 1) * w]
    }

    /// Integer feature row of local index `local`.
    pub fn ints_of(&self, local: usize) -> &[i32] {
        let w = self.meta.int_width;
        &self.ints[local * w..(local + 1) * w]
    }

    /// Out-neighbors of local index `local`; empty for isolated nodes.
    pub fn neighbors_of(&self, local: usize) -> &[NodeId] {
        let lo = self.indptr[local] as usize;
        let hi = self.indptr[local + 1] as usize;
        &self.targets[lo..hi]
    }

    /// Out-degree of local index `local`.
    pub fn degree(&self, local: usize) -> usize {
        (self.indptr[local + 1] - self.indptr[local]) as usize
    }

    /// Local indices whose split flag marks them as training nodes.
    pub fn train_nodes(&self) -> &[u32] {
        &self.train_local
    }

    /// Copies local index `local` out as a self-contained [`NodeData`].
    pub fn node_data(&self, local: usize) -> NodeData {
        NodeData {
            features: self.features_of(local).to_vec(),
            ints: self.ints_of(local).to_vec(),
            neighbors: self.neighbors_of(local).to_vec(),
        }
    }
}
