//! Ad-hoc node fetches through the async query surface.

use std::path::Path;

use tessera::client::{GraphService, LocalClient};
use tessera::datagen::{self, DatasetSpec};
use tessera::server::ServerOptions;
use tessera::store::PartitionStore;
use tessera::{NodeId, Result, SamplerConfig, TesseraError};

const JOB_NODES: u64 = 120;

fn open_job(dir: &Path) -> Result<LocalClient> {
    let spec = DatasetSpec {
        nodes: JOB_NODES,
        partitions: 1,
        ..DatasetSpec::default()
    };
    datagen::generate(dir, &spec)?;
    LocalClient::open(dir, ServerOptions::default(), |proc| {
        proc.add_sampler(SamplerConfig::LocalNode { batch_size: 8 }, 1)
    })
}

#[test]
fn fetched_rows_match_the_stored_shard() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let ids = [NodeId(0), NodeId(17), NodeId(JOB_NODES - 1)];

    let q = client.pull_node(&ids)?;
    let pack = client.resolve(q)?.into_nodes()?;
    assert_eq!(pack.len(), ids.len());

    let store = PartitionStore::load(dir.path(), 0)?;
    for id in ids {
        let data = pack.get(&id).unwrap();
        let local = store.local_of(id).unwrap();
        assert_eq!(data.features, store.features_of(local));
        assert_eq!(data.ints, store.ints_of(local));
        assert_eq!(data.neighbors, store.neighbors_of(local));
    }
    client.close();
    Ok(())
}

#[test]
fn empty_request_resolves_to_an_empty_pack() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let q = client.pull_node(&[])?;
    let pack = client.resolve(q)?.into_nodes()?;
    assert!(pack.is_empty());
    client.close();
    Ok(())
}

#[test]
fn out_of_range_id_surfaces_at_resolve() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let q = client.pull_node(&[NodeId(5), NodeId(JOB_NODES + 1)])?;
    let err = client.resolve(q).unwrap_err();
    assert!(matches!(err, TesseraError::UnknownNode(id) if id == NodeId(JOB_NODES + 1)));
    client.close();
    Ok(())
}

#[test]
fn a_query_resolves_at_most_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let q = client.pull_node(&[NodeId(3)])?;
    client.resolve(q)?.into_nodes()?;
    let err = client.resolve(q).unwrap_err();
    assert!(matches!(err, TesseraError::AlreadyResolved(id) if id == q));
    client.close();
    Ok(())
}

#[test]
fn cancelled_queries_are_forgotten() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let client = open_job(dir.path())?;
    let q = client.pull_node(&[NodeId(1)])?;
    client.cancel(q)?;
    let err = client.resolve(q).unwrap_err();
    assert!(matches!(err, TesseraError::UnknownQuery(id) if id == q));
    // The id is gone for cancel as well.
    let err = client.cancel(q).unwrap_err();
    assert!(matches!(err, TesseraError::UnknownQuery(_)));
    client.close();
    Ok(())
}
