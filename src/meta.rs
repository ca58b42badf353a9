//! Partition metadata: the `meta.toml` file describing a sharded job.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::model::NodeId;

/// Name of the metadata file at the dataset root.
pub const META_FILE: &str = "meta.toml";

/// Job-wide graph metadata plus the contiguous-range partition table.
///
/// Node ownership is positional: shard `r` owns the global id range
/// `[offsets[r], offsets[r + 1])`. The table is written once by the
/// partitioner and never changes for the lifetime of a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Total node count across all shards.
    pub nodes: u64,
    /// Total directed edge count across all shards.
    pub edges: u64,
    /// Dense f32 feature columns per node.
    pub feature_width: usize,
    /// Integer feature columns per node; at least label and split flag.
    pub int_width: usize,
    /// Number of class labels.
    pub classes: i32,
    /// Shard count; one server process per shard.
    pub partitions: usize,
    /// Global count of training nodes.
    pub train: u64,
    /// Global count of evaluation nodes.
    pub eval: u64,
    /// Global count of test nodes.
    pub test: u64,
    /// Partition boundaries, length `partitions + 1`, first 0, last `nodes`.
    pub offsets: Vec<u64>,
    /// Nodes per shard, length `partitions`.
    pub shard_nodes: Vec<u64>,
    /// Locally stored edges per shard, length `partitions`.
    pub shard_edges: Vec<u64>,
}

impl JobMeta {
    /// Reads and validates `meta.toml` under `root`.
    pub fn load(root: &Path) -> Result<JobMeta> {
        let path = root.join(META_FILE);
        let text = fs::read_to_string(&path)?;
        let meta: JobMeta = toml::from_str(&text)
            .map_err(|e| TesseraError::Config(format!("{}: {e}", path.display())))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Writes `meta.toml` under `root`.
    pub fn save(&self, root: &Path) -> Result<()> {
        self.validate()?;
        let text = toml::to_string_pretty(self)
            .map_err(|e| TesseraError::Config(format!("meta serialization: {e}")))?;
        fs::write(root.join(META_FILE), text)?;
        Ok(())
    }

    /// Checks the partition table for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.int_width < 2 {
            return Err(TesseraError::Config(format!(
                "int_width {} leaves no room for label and split columns",
                self.int_width
            )));
        }
        if self.partitions == 0 {
            return Err(TesseraError::Config("partitions must be positive".into()));
        }
        if self.offsets.len() != self.partitions + 1 {
            return Err(TesseraError::Config(format!(
                "offsets has {} entries, want partitions + 1 = {}",
                self.offsets.len(),
                self.partitions + 1
            )));
        }
        if self.offsets[0] != 0 || self.offsets[self.partitions] != self.nodes {
            return Err(TesseraError::Config(format!(
                "offsets must start at 0 and end at {}, got {:?}",
                self.nodes, self.offsets
            )));
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(TesseraError::Config(format!(
                "offsets must be non-decreasing, got {:?}",
                self.offsets
            )));
        }
        if self.shard_nodes.len() != self.partitions || self.shard_edges.len() != self.partitions {
            return Err(TesseraError::Config(
                "shard_nodes and shard_edges must have one entry per partition".into(),
            ));
        }
        for r in 0..self.partitions {
            if self.shard_nodes[r] != self.offsets[r + 1] - self.offsets[r] {
                return Err(TesseraError::Config(format!(
                    "shard {r} declares {} nodes but its offset range holds {}",
                    self.shard_nodes[r],
                    self.offsets[r + 1] - self.offsets[r]
                )));
            }
        }
        Ok(())
    }

    /// Shard owning `id`, or `None` if the id is past the last boundary.
    pub fn owner_of(&self, id: NodeId) -> Option<usize> {
        if id.0 >= self.nodes {
            return None;
        }
        // offsets is non-decreasing; the owner is the last boundary <= id.
        Some(self.offsets.partition_point(|&o| o <= id.0) - 1)
    }

    /// Node count of shard `r`.
    pub fn shard_len(&self, r: usize) -> usize {
        (self.offsets[r + 1] - self.offsets[r]) as usize
    }

    /// First global id of shard `r`.
    pub fn shard_base(&self, r: usize) -> NodeId {
        NodeId(self.offsets[r])
    }

    /// Subdirectory holding shard `r`'s array files.
    pub fn shard_dir(root: &Path, r: usize) -> std::path::PathBuf {
        root.join(format!("part{r}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobMeta {
        JobMeta {
            nodes: 10,
            edges: 20,
            feature_width: 4,
            int_width: 2,
            classes: 3,
            partitions: 3,
            train: 4,
            eval: 2,
            test: 2,
            offsets: vec![0, 4, 7, 10],
            shard_nodes: vec![4, 3, 3],
            shard_edges: vec![8, 6, 6],
        }
    }

    #[test]
    fn owner_of_respects_boundaries() {
        let meta = sample();
        assert_eq!(meta.owner_of(NodeId(0)), Some(0));
        assert_eq!(meta.owner_of(NodeId(3)), Some(0));
        assert_eq!(meta.owner_of(NodeId(4)), Some(1));
        assert_eq!(meta.owner_of(NodeId(6)), Some(1));
        assert_eq!(meta.owner_of(NodeId(7)), Some(2));
        assert_eq!(meta.owner_of(NodeId(9)), Some(2));
        assert_eq!(meta.owner_of(NodeId(10)), None);
        assert_eq!(meta.owner_of(NodeId(u64::MAX)), None);
    }

    #[test]
    fn owner_of_handles_empty_shards() {
        let mut meta = sample();
        meta.offsets = vec![0, 4, 4, 10];
        meta.shard_nodes = vec![4, 0, 6];
        meta.validate().unwrap();
        // Shard 1 is empty; ids 4..10 all land in shard 2.
        assert_eq!(meta.owner_of(NodeId(4)), Some(2));
        assert_eq!(meta.owner_of(NodeId(9)), Some(2));
    }

    #[test]
    fn validate_rejects_bad_tables() {
        let mut meta = sample();
        meta.offsets = vec![0, 5, 4, 10];
        assert!(meta.validate().is_err());

        let mut meta = sample();
        meta.offsets = vec![0, 4, 10];
        assert!(meta.validate().is_err());

        let mut meta = sample();
        meta.offsets = vec![1, 4, 7, 10];
        assert!(meta.validate().is_err());

        let mut meta = sample();
        meta.int_width = 1;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let meta = sample();
        let text = toml::to_string_pretty(&meta).unwrap();
        let back: JobMeta = toml::from_str(&text).unwrap();
        assert_eq!(meta, back);
    }
}
