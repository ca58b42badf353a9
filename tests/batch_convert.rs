//! Layout conversions and edge transforms on batches produced by samplers.

use std::path::Path;

use tessera::batch::{EdgeList, GraphBatch};
use tessera::client::{GraphService, LocalClient};
use tessera::datagen::{self, DatasetSpec};
use tessera::server::ServerOptions;
use tessera::{Result, SamplerConfig, SamplerKind};

fn open_job(dir: &Path) -> Result<LocalClient> {
    let spec = DatasetSpec {
        nodes: 400,
        partitions: 1,
        avg_degree: 5,
        ..DatasetSpec::default()
    };
    datagen::generate(dir, &spec)?;
    let opts = ServerOptions {
        sampler_seed: Some(11),
        ..ServerOptions::default()
    };
    LocalClient::open(dir, opts, |proc| {
        proc.add_sampler(SamplerConfig::LocalNode { batch_size: 48 }, 1)
    })
}

fn pull_batch(client: &LocalClient) -> Result<GraphBatch> {
    let q = client.pull_graph(&[SamplerKind::LocalNode])?;
    client.resolve(q)?.into_graph()
}

fn edge_pairs(batch: &GraphBatch) -> Vec<(u32, u32)> {
    let mut pairs = Vec::new();
    match batch.edges() {
        EdgeList::Coo { src, dst } => {
            for (&s, &d) in src.iter().zip(dst.iter()) {
                pairs.push((s, d));
            }
        }
        EdgeList::Csr { offsets, targets } => {
            for r in 0..batch.node_count() {
                for i in offsets[r] as usize..offsets[r + 1] as usize {
                    pairs.push((r as u32, targets[i]));
                }
            }
        }
    }
    pairs.sort_unstable();
    pairs
}

#[test]
fn pulled_batches_convert_between_layouts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let mut batch = pull_batch(&client)?;
    assert!(batch.edge_count() > 0, "local sampling found no edges");

    let before = edge_pairs(&batch);
    batch.to_csr();
    assert!(batch.edges().is_csr());
    assert_eq!(edge_pairs(&batch), before);
    let total: u32 = batch.degrees().iter().sum();
    assert_eq!(total as usize, batch.edge_count());

    batch.to_coo();
    assert!(batch.edges().is_coo());
    assert_eq!(edge_pairs(&batch), before);
    client.close();
    Ok(())
}

#[test]
fn self_loop_cycle_preserves_the_plain_edges() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let mut batch = pull_batch(&client)?;

    batch.remove_self_loops();
    let plain = edge_pairs(&batch);

    batch.add_self_loops();
    assert_eq!(
        batch.edge_count(),
        plain.len() + batch.node_count(),
        "every row gains exactly one loop"
    );
    let with_loops = edge_pairs(&batch);
    batch.add_self_loops();
    assert_eq!(edge_pairs(&batch), with_loops);

    batch.remove_self_loops();
    assert_eq!(edge_pairs(&batch), plain);
    client.close();
    Ok(())
}

#[test]
fn loop_insertion_respects_the_current_layout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let mut batch = pull_batch(&client)?;
    batch.to_csr();
    batch.add_self_loops();
    assert!(batch.edges().is_csr());
    // In CSR form every row's slice now contains its own index.
    if let EdgeList::Csr { offsets, targets } = batch.edges() {
        for r in 0..batch.node_count() {
            let row = &targets[offsets[r] as usize..offsets[r + 1] as usize];
            assert!(row.contains(&(r as u32)), "row {r} lost its loop");
        }
    }
    client.close();
    Ok(())
}

#[test]
fn right_norm_weights_sum_to_one_per_destination() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let mut batch = pull_batch(&client)?;
    batch.add_self_loops();
    batch.to_coo();

    let weights = batch.edge_norm(false);
    assert_eq!(weights.len(), batch.edge_count());
    let mut per_dst = vec![0.0f32; batch.node_count()];
    if let EdgeList::Coo { dst, .. } = batch.edges() {
        for (&d, &w) in dst.iter().zip(weights.iter()) {
            per_dst[d as usize] += w;
        }
    }
    // With a loop on every row, every node receives at least one edge and
    // its incoming weights form a convex combination.
    for (row, sum) in per_dst.iter().enumerate() {
        assert!((sum - 1.0).abs() < 1e-4, "row {row} sums to {sum}");
    }
    client.close();
    Ok(())
}

#[test]
fn density_tracks_added_loops() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let mut batch = pull_batch(&client)?;
    batch.remove_self_loops();
    let n = batch.node_count() as f64;
    let base = batch.density();
    batch.add_self_loops();
    let grown = batch.density();
    assert!((grown - base - 1.0 / n).abs() < 1e-9);
    client.close();
    Ok(())
}
