//! Minibatch subgraphs shipped from samplers to training workers.

use crate::error::{Result, TesseraError};
use crate::model::{NodeId, SamplerKind};

/// Edge list of a batch, in either of the two interchangeable layouts.
///
/// Row indices are batch-local: `0..node_count`, aligned with
/// [`GraphBatch::nodes`]. Conversion between the layouts preserves the edge
/// multiset exactly; CSR is canonical (rows in order), COO keeps whatever
/// order the conversion or the sampler produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EdgeList {
    /// Coordinate pairs: edge `i` runs `src[i] -> dst[i]`.
    Coo {
        /// Source row per edge.
        src: Vec<u32>,
        /// Destination row per edge.
        dst: Vec<u32>,
    },
    /// Compressed sparse rows: row `r` owns `targets[offsets[r]..offsets[r+1]]`.
    Csr {
        /// Per-row boundaries, length `node_count + 1`.
        offsets: Vec<u32>,
        /// Destination rows, grouped by source row.
        targets: Vec<u32>,
    },
}

impl EdgeList {
    /// An empty COO list.
    pub fn empty() -> EdgeList {
        EdgeList::Coo {
            src: Vec::new(),
            dst: Vec::new(),
        }
    }

    /// Edge count.
    pub fn len(&self) -> usize {
        match self {
            EdgeList::Coo { src, .. } => src.len(),
            EdgeList::Csr { targets, .. } => targets.len(),
        }
    }

    /// True when the batch has no edges.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for the coordinate layout.
    pub fn is_coo(&self) -> bool {
        matches!(self, EdgeList::Coo { .. })
    }

    /// True for the compressed-row layout.
    pub fn is_csr(&self) -> bool {
        matches!(self, EdgeList::Csr { .. })
    }
}

/// One sampled subgraph: node rows, their feature slices, and an edge list.
///
/// Row `i` of every buffer belongs to global id `nodes[i]`. The `extra`
/// column is sampler-defined; fan-out sampling records each row's expansion
/// layer there, with seeds at 0.
#[derive(Debug)]
pub struct GraphBatch {
    kind: SamplerKind,
    nodes: Vec<NodeId>,
    feature_width: usize,
    features: Vec<f32>,
    int_width: usize,
    ints: Vec<i32>,
    extra: Vec<i32>,
    edges: EdgeList,
}

impl GraphBatch {
    /// Builds a batch, validating every buffer against the node count.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SamplerKind,
        nodes: Vec<NodeId>,
        feature_width: usize,
        features: Vec<f32>,
        int_width: usize,
        ints: Vec<i32>,
        extra: Vec<i32>,
        edges: EdgeList,
    ) -> Result<GraphBatch> {
        let n = nodes.len();
        if features.len() != n * feature_width {
            return Err(TesseraError::InvalidArgument(format!(
                "batch features hold {} values, want {n} x {feature_width}",
                features.len()
            )));
        }
        if ints.len() != n * int_width {
            return Err(TesseraError::InvalidArgument(format!(
                "batch ints hold {} values, want {n} x {int_width}",
                ints.len()
            )));
        }
        if !extra.is_empty() && extra.len() != n {
            return Err(TesseraError::InvalidArgument(format!(
                "batch extra holds {} values for {n} rows",
                extra.len()
            )));
        }
        validate_edges(&edges, n)?;
        Ok(GraphBatch {
            kind,
            nodes,
            feature_width,
            features,
            int_width,
            ints,
            extra,
            edges,
        })
    }

    /// Sampler family that produced this batch.
    pub fn kind(&self) -> SamplerKind {
        self.kind
    }

    /// Rows in the batch.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges in the batch.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Global id per row.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Row of `id`, scanning the node list.
    pub fn row_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|&n| n == id)
    }

    /// Sampler-defined per-row column; empty when the sampler sets none.
    pub fn extra(&self) -> &[i32] {
        &self.extra
    }

    /// f32 feature columns per row.
    pub fn feature_width(&self) -> usize {
        self.feature_width
    }

    /// i32 feature columns per row.
    pub fn int_width(&self) -> usize {
        self.int_width
    }

    /// Whole f32 feature buffer, row-major.
    pub fn features(&self) -> &[f32] {
        &self.features
    }

    /// Whole i32 feature buffer, row-major.
    pub fn ints(&self) -> &[i32] {
        &self.ints
    }

    /// f32 feature row `row`.
    pub fn features_row(&self, row: usize) -> &[f32] {
        &self.features[row * self.feature_width..(row + 1) * self.feature_width]
    }

    /// i32 feature row `row`.
    pub fn ints_row(&self, row: usize) -> &[i32] {
        &self.ints[row * self.int_width..(row + 1) * self.int_width]
    }

    /// Current edge representation.
    pub fn edges(&self) -> &EdgeList {
        &self.edges
    }

    /// Converts the edge list to coordinate layout; a no-op if already there.
    pub fn to_coo(&mut self) {
        let n = self.nodes.len();
        let edges = std::mem::replace(&mut self.edges, EdgeList::empty());
        self.edges = match edges {
            coo @ EdgeList::Coo { .. } => coo,
            EdgeList::Csr { offsets, targets } => {
                let mut src = Vec::with_capacity(targets.len());
                for r in 0..n {
                    for _ in offsets[r]..offsets[r + 1] {
                        src.push(r as u32);
                    }
                }
                EdgeList::Coo { src, dst: targets }
            }
        };
    }

    /// Converts the edge list to compressed rows; a no-op if already there.
    pub fn to_csr(&mut self) {
        let n = self.nodes.len();
        let edges = std::mem::replace(&mut self.edges, EdgeList::empty());
        self.edges = match edges {
            csr @ EdgeList::Csr { .. } => csr,
            EdgeList::Coo { src, dst } => {
                // Counting sort on the source row.
                let mut offsets = vec![0u32; n + 1];
                for &s in &src {
                    offsets[s as usize + 1] += 1;
                }
                for r in 0..n {
                    offsets[r + 1] += offsets[r];
                }
                let mut cursor: Vec<u32> = offsets[..n].to_vec();
                let mut targets = vec![0u32; src.len()];
                for (&s, &d) in src.iter().zip(dst.iter()) {
                    let slot = cursor[s as usize] as usize;
                    targets[slot] = d;
                    cursor[s as usize] += 1;
                }
                EdgeList::Csr { offsets, targets }
            }
        };
    }

    /// Gives every row exactly one self loop, leaving rows that already
    /// carry one untouched. Keeps the current edge layout.
    pub fn add_self_loops(&mut self) {
        let was_csr = self.edges.is_csr();
        self.to_coo();
        if let EdgeList::Coo { src, dst } = &mut self.edges {
            let n = self.nodes.len();
            let mut has_loop = vec![false; n];
            for (&s, &d) in src.iter().zip(dst.iter()) {
                if s == d {
                    has_loop[s as usize] = true;
                }
            }
            for v in 0..n {
                if !has_loop[v] {
                    src.push(v as u32);
                    dst.push(v as u32);
                }
            }
        }
        if was_csr {
            self.to_csr();
        }
    }

    /// Drops every self loop. Keeps the current edge layout.
    pub fn remove_self_loops(&mut self) {
        let was_csr = self.edges.is_csr();
        self.to_coo();
        if let EdgeList::Coo { src, dst } = &mut self.edges {
            let mut keep_src = Vec::with_capacity(src.len());
            let mut keep_dst = Vec::with_capacity(dst.len());
            for (&s, &d) in src.iter().zip(dst.iter()) {
                if s != d {
                    keep_src.push(s);
                    keep_dst.push(d);
                }
            }
            *src = keep_src;
            *dst = keep_dst;
        }
        if was_csr {
            self.to_csr();
        }
    }

    /// Out-degree per row, in either layout.
    pub fn degrees(&self) -> Vec<u32> {
        let n = self.nodes.len();
        match &self.edges {
            EdgeList::Csr { offsets, .. } => {
                (0..n).map(|r| offsets[r + 1] - offsets[r]).collect()
            }
            EdgeList::Coo { src, .. } => {
                let mut deg = vec![0u32; n];
                for &s in src {
                    deg[s as usize] += 1;
                }
                deg
            }
        }
    }

    /// Edge count over the squared node count; 0 for an empty batch.
    pub fn density(&self) -> f64 {
        let n = self.nodes.len();
        if n == 0 {
            return 0.0;
        }
        self.edges.len() as f64 / (n * n) as f64
    }

    /// Per-edge GCN normalization weights, aligned with the current edge
    /// order. `symmetric` gives `1 / sqrt(outdeg(src) * indeg(dst))`,
    /// otherwise `1 / indeg(dst)`. Both factors count the edge itself, so
    /// no weight divides by zero.
    pub fn edge_norm(&self, symmetric: bool) -> Vec<f32> {
        let n = self.nodes.len();
        let mut out_deg = vec![0u32; n];
        let mut in_deg = vec![0u32; n];
        self.for_each_edge(|s, d| {
            out_deg[s as usize] += 1;
            in_deg[d as usize] += 1;
        });
        let mut weights = Vec::with_capacity(self.edges.len());
        self.for_each_edge(|s, d| {
            let w = if symmetric {
                1.0 / ((out_deg[s as usize] as f32) * (in_deg[d as usize] as f32)).sqrt()
            } else {
                1.0 / in_deg[d as usize] as f32
            };
            weights.push(w);
        });
        weights
    }

    fn for_each_edge(&self, mut f: impl FnMut(u32, u32)) {
        match &self.edges {
            EdgeList::Coo { src, dst } => {
                for (&s, &d) in src.iter().zip(dst.iter()) {
                    f(s, d);
                }
            }
            EdgeList::Csr { offsets, targets } => {
                for r in 0..self.nodes.len() {
                    for i in offsets[r] as usize..offsets[r + 1] as usize {
                        f(r as u32, targets[i]);
                    }
                }
            }
        }
    }
}

fn validate_edges(edges: &EdgeList, n: usize) -> Result<()> {
    match edges {
        EdgeList::Coo { src, dst } => {
            if src.len() != dst.len() {
                return Err(TesseraError::InvalidArgument(format!(
                    "coo arrays disagree: {} sources, {} destinations",
                    src.len(),
                    dst.len()
                )));
            }
            if src
                .iter()
                .chain(dst.iter())
                .any(|&v| v as usize >= n)
            {
                return Err(TesseraError::InvalidArgument(format!(
                    "edge endpoint outside the batch's {n} rows"
                )));
            }
        }
        EdgeList::Csr { offsets, targets } => {
            if offsets.len() != n + 1 {
                return Err(TesseraError::InvalidArgument(format!(
                    "csr offsets hold {} entries, want {}",
                    offsets.len(),
                    n + 1
                )));
            }
            if offsets[0] != 0 || offsets.windows(2).any(|w| w[0] > w[1]) {
                return Err(TesseraError::InvalidArgument(
                    "csr offsets must be non-decreasing from 0".into(),
                ));
            }
            if offsets[n] as usize != targets.len() {
                return Err(TesseraError::InvalidArgument(format!(
                    "csr offsets end at {}, but {} targets are stored",
                    offsets[n],
                    targets.len()
                )));
            }
            if targets.iter().any(|&v| v as usize >= n) {
                return Err(TesseraError::InvalidArgument(format!(
                    "edge endpoint outside the batch's {n} rows"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize, src: Vec<u32>, dst: Vec<u32>) -> GraphBatch {
        let nodes = (0..n as u64).map(NodeId).collect();
        GraphBatch::new(
            SamplerKind::LocalNode,
            nodes,
            1,
            vec![0.0; n],
            2,
            vec![0; n * 2],
            Vec::new(),
            EdgeList::Coo { src, dst },
        )
        .unwrap()
    }

    fn edge_pairs(b: &GraphBatch) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();
        b.for_each_edge(|s, d| pairs.push((s, d)));
        pairs.sort_unstable();
        pairs
    }

    #[test]
    fn coo_csr_round_trip_preserves_multiset() {
        // Duplicate edge and an isolated node (row 3).
        let mut b = batch(4, vec![2, 0, 1, 0, 0], vec![1, 2, 0, 2, 0]);
        let before = edge_pairs(&b);
        b.to_csr();
        assert!(b.edges().is_csr());
        assert_eq!(edge_pairs(&b), before);
        b.to_coo();
        assert!(b.edges().is_coo());
        assert_eq!(edge_pairs(&b), before);
    }

    #[test]
    fn conversions_are_idempotent() {
        let mut b = batch(3, vec![0, 1, 2], vec![1, 2, 0]);
        b.to_csr();
        let snapshot = b.edges().clone();
        b.to_csr();
        assert_eq!(b.edges(), &snapshot);
        b.to_coo();
        let snapshot = b.edges().clone();
        b.to_coo();
        assert_eq!(b.edges(), &snapshot);
    }

    #[test]
    fn csr_groups_rows_in_order() {
        let mut b = batch(3, vec![2, 0, 2, 1], vec![0, 1, 1, 2]);
        b.to_csr();
        match b.edges() {
            EdgeList::Csr { offsets, targets } => {
                assert_eq!(offsets, &[0, 1, 2, 4]);
                assert_eq!(&targets[0..1], &[1]);
                assert_eq!(&targets[1..2], &[2]);
                let mut row2 = targets[2..4].to_vec();
                row2.sort_unstable();
                assert_eq!(row2, vec![0, 1]);
            }
            EdgeList::Coo { .. } => panic!("expected csr"),
        }
    }

    #[test]
    fn add_self_loops_is_idempotent() {
        let mut b = batch(3, vec![0, 1], vec![1, 1]);
        b.add_self_loops();
        let after_one = edge_pairs(&b);
        assert!(after_one.contains(&(0, 0)));
        assert!(after_one.contains(&(2, 2)));
        // Row 1 already had its loop; nothing was added for it twice.
        assert_eq!(after_one.iter().filter(|&&(s, d)| s == 1 && d == 1).count(), 1);
        b.add_self_loops();
        assert_eq!(edge_pairs(&b), after_one);
    }

    #[test]
    fn add_self_loops_keeps_layout() {
        let mut b = batch(2, vec![0], vec![1]);
        b.to_csr();
        b.add_self_loops();
        assert!(b.edges().is_csr());
        assert_eq!(b.edge_count(), 3);
    }

    #[test]
    fn remove_self_loops_drops_all_loops() {
        let mut b = batch(3, vec![0, 0, 1, 2], vec![0, 1, 2, 2]);
        b.remove_self_loops();
        assert_eq!(edge_pairs(&b), vec![(0, 1), (1, 2)]);
        b.remove_self_loops();
        assert_eq!(edge_pairs(&b), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn degrees_agree_across_layouts() {
        let mut b = batch(4, vec![0, 0, 2, 3], vec![1, 2, 3, 3]);
        let coo_deg = b.degrees();
        b.to_csr();
        assert_eq!(b.degrees(), coo_deg);
        assert_eq!(coo_deg, vec![2, 0, 1, 1]);
    }

    #[test]
    fn density_counts_all_ordered_pairs() {
        let b = batch(4, vec![0, 1], vec![1, 2]);
        assert!((b.density() - 2.0 / 16.0).abs() < 1e-12);
        let empty = batch(0, Vec::new(), Vec::new());
        assert_eq!(empty.density(), 0.0);
    }

    #[test]
    fn edge_norm_right_normalizes_by_in_degree() {
        // Two edges into row 1, one into row 2.
        let b = batch(3, vec![0, 2, 0], vec![1, 1, 2]);
        let w = b.edge_norm(false);
        assert_eq!(w.len(), 3);
        assert!((w[0] - 0.5).abs() < 1e-6);
        assert!((w[1] - 0.5).abs() < 1e-6);
        assert!((w[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn edge_norm_symmetric_uses_both_degrees() {
        let mut b = batch(2, vec![0], vec![1]);
        b.add_self_loops();
        // After loops: 0->1, 0->0, 1->1. outdeg(0)=2, indeg(1)=2.
        let w = b.edge_norm(true);
        let pairs = edge_pairs(&b);
        assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 1)]);
        for weight in w {
            assert!(weight > 0.0 && weight <= 1.0);
        }
    }

    #[test]
    fn new_rejects_bad_shapes() {
        let nodes = vec![NodeId(0), NodeId(1)];
        let err = GraphBatch::new(
            SamplerKind::GlobalNode,
            nodes.clone(),
            2,
            vec![0.0; 3],
            2,
            vec![0; 4],
            Vec::new(),
            EdgeList::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidArgument(_)));

        let err = GraphBatch::new(
            SamplerKind::GlobalNode,
            nodes,
            2,
            vec![0.0; 4],
            2,
            vec![0; 4],
            Vec::new(),
            EdgeList::Coo {
                src: vec![0],
                dst: vec![5],
            },
        )
        .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidArgument(_)));
    }
}
