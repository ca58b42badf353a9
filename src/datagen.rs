//! Synthetic partitioned datasets for tests, benches, and the demo binary.
//!
//! Generated graphs are a directed ring (so every node has at least one
//! out-edge and the graph is connected) plus seeded random extra edges,
//! partitioned into contiguous ranges. Float features follow a closed-form
//! function of id and column, so any process can verify a row it did not
//! generate; labels, splits, and edges come from the seeded RNG.

use std::fs;
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::error::{Result, TesseraError};
use crate::meta::JobMeta;
use crate::model::{NodeId, SPLIT_EVAL, SPLIT_TEST, SPLIT_TRAIN};
use crate::store::{files, ADJACENCY_FILE, FEATURES_FILE, INTS_FILE};

/// Shape and seed of a generated dataset.
#[derive(Clone, Debug)]
pub struct DatasetSpec {
    /// Total node count.
    pub nodes: u64,
    /// f32 feature columns per node.
    pub feature_width: usize,
    /// i32 feature columns per node, at least 2.
    pub int_width: usize,
    /// Distinct class labels.
    pub classes: i32,
    /// Contiguous-range shards to split into.
    pub partitions: usize,
    /// Target out-degree per node, ring edge included.
    pub avg_degree: usize,
    /// Fraction of nodes flagged for training.
    pub train_fraction: f64,
    /// Fraction of nodes flagged for evaluation.
    pub eval_fraction: f64,
    /// Fraction of nodes flagged for test.
    pub test_fraction: f64,
    /// RNG seed; equal specs generate byte-identical datasets.
    pub seed: u64,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        DatasetSpec {
            nodes: 1_000,
            feature_width: 16,
            int_width: 2,
            classes: 7,
            partitions: 2,
            avg_degree: 4,
            train_fraction: 0.1,
            eval_fraction: 0.2,
            test_fraction: 0.2,
            seed: 7,
        }
    }
}

/// Closed-form f32 feature of `(id, col)`; what [`generate`] writes.
pub fn feature_value(id: NodeId, col: usize) -> f32 {
    ((id.0.wrapping_mul(31).wrapping_add(col as u64 * 17)) % 97) as f32 / 97.0
}

/// Closed-form class label of `id`; what [`generate`] writes in column 0.
pub fn label_value(id: NodeId, classes: i32) -> i32 {
    (id.0 % classes.max(1) as u64) as i32
}

/// Writes a partitioned dataset under `root` and returns its metadata.
pub fn generate(root: &Path, spec: &DatasetSpec) -> Result<JobMeta> {
    validate(spec)?;
    let n = spec.nodes;
    let parts = spec.partitions;
    let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);

    // Adjacency for the whole graph, then sliced per shard.
    let mut adjacency: Vec<Vec<u64>> = Vec::with_capacity(n as usize);
    for u in 0..n {
        let mut targets: Vec<u64> = Vec::with_capacity(spec.avg_degree);
        if n > 1 {
            targets.push((u + 1) % n);
        }
        for _ in 1..spec.avg_degree {
            let t = rng.gen_range(0..n);
            if t != u && !targets.contains(&t) {
                targets.push(t);
            }
        }
        adjacency.push(targets);
    }

    let mut splits: Vec<i32> = Vec::with_capacity(n as usize);
    let (mut train, mut eval, mut test) = (0u64, 0u64, 0u64);
    for _ in 0..n {
        let r: f64 = rng.gen();
        let flag = if r < spec.train_fraction {
            train += 1;
            SPLIT_TRAIN
        } else if r < spec.train_fraction + spec.eval_fraction {
            eval += 1;
            SPLIT_EVAL
        } else if r < spec.train_fraction + spec.eval_fraction + spec.test_fraction {
            test += 1;
            SPLIT_TEST
        } else {
            0
        };
        splits.push(flag);
    }

    let base = n / parts as u64;
    let rem = (n % parts as u64) as usize;
    let mut offsets = Vec::with_capacity(parts + 1);
    offsets.push(0u64);
    for r in 0..parts {
        let len = base + u64::from(r < rem);
        offsets.push(offsets[r] + len);
    }

    let mut shard_nodes = Vec::with_capacity(parts);
    let mut shard_edges = Vec::with_capacity(parts);
    let mut total_edges = 0u64;
    for r in 0..parts {
        let lo = offsets[r];
        let hi = offsets[r + 1];
        let len = (hi - lo) as usize;
        let dir = JobMeta::shard_dir(root, r);
        fs::create_dir_all(&dir)?;

        let mut indptr: Vec<u64> = Vec::with_capacity(len + 1);
        let mut flat: Vec<u64> = Vec::new();
        indptr.push(0);
        for u in lo..hi {
            flat.extend_from_slice(&adjacency[u as usize]);
            indptr.push(flat.len() as u64);
        }
        let edges = flat.len() as u64;
        let mut words = indptr;
        words.extend_from_slice(&flat);
        files::write_u64(&dir.join(ADJACENCY_FILE), &words)?;

        let mut features = Vec::with_capacity(len * spec.feature_width);
        for u in lo..hi {
            for c in 0..spec.feature_width {
                features.push(feature_value(NodeId(u), c));
            }
        }
        files::write_f32(&dir.join(FEATURES_FILE), len, spec.feature_width, &features)?;

        let mut ints = Vec::with_capacity(len * spec.int_width);
        for u in lo..hi {
            ints.push(label_value(NodeId(u), spec.classes));
            ints.push(splits[u as usize]);
            for _ in 2..spec.int_width {
                ints.push(0);
            }
        }
        files::write_i32(&dir.join(INTS_FILE), len, spec.int_width, &ints)?;

        shard_nodes.push(hi - lo);
        shard_edges.push(edges);
        total_edges += edges;
    }

    let meta = JobMeta {
        nodes: n,
        edges: total_edges,
        feature_width: spec.feature_width,
        int_width: spec.int_width,
        classes: spec.classes,
        partitions: parts,
        train,
        eval,
        test,
        offsets,
        shard_nodes,
        shard_edges,
    };
    meta.save(root)?;
    info!(
        nodes = n,
        edges = total_edges,
        partitions = parts,
        train,
        "datagen.complete"
    );
    Ok(meta)
}

fn validate(spec: &DatasetSpec) -> Result<()> {
    if spec.nodes == 0 {
        return Err(TesseraError::Config("dataset needs at least one node".into()));
    }
    if spec.partitions == 0 || spec.partitions as u64 > spec.nodes {
        return Err(TesseraError::Config(format!(
            "{} partitions cannot split {} nodes",
            spec.partitions, spec.nodes
        )));
    }
    if spec.int_width < 2 {
        return Err(TesseraError::Config(
            "int_width below 2 leaves no room for label and split columns".into(),
        ));
    }
    if spec.classes <= 0 {
        return Err(TesseraError::Config("classes must be positive".into()));
    }
    if spec.avg_degree == 0 {
        return Err(TesseraError::Config("avg_degree must be positive".into()));
    }
    let fractions = spec.train_fraction + spec.eval_fraction + spec.test_fraction;
    if !(0.0..=1.0).contains(&fractions) {
        return Err(TesseraError::Config(format!(
            "split fractions sum to {fractions}, want within [0, 1]"
        )));
    }
    Ok(())
}
