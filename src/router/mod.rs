//! Asynchronous query protocol between a worker and its server.
//!
//! `pull_*` calls return a [`QueryId`] immediately; a lane thread per
//! sampler kind (plus one for node fetches) works the queue off in
//! submission order, so replies of one kind complete in the order they
//! were pulled. Nothing orders replies across kinds. [`QueryRouter::resolve`]
//! blocks until the reply lands and surrenders it exactly once.
//!
//! Lane threads only call into the server while a query demands a batch.
//! Batches therefore stay in the server's bounded queues until pulled,
//! which keeps the producers' backpressure intact.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::batch::GraphBatch;
use crate::error::{Result, TesseraError};
use crate::model::{NodeId, NodePack, QueryId, SamplerKind};
use crate::net::ServiceEndpoint;

const LANE_POLL: Duration = Duration::from_millis(50);

/// Payload a resolved query surrenders.
#[derive(Debug)]
pub enum Reply {
    /// Minibatch subgraph from a sampler.
    Graph(GraphBatch),
    /// Ad-hoc node data keyed by id.
    Nodes(NodePack),
}

impl Reply {
    fn kind_name(&self) -> &'static str {
        match self {
            Reply::Graph(_) => "graph",
            Reply::Nodes(_) => "nodes",
        }
    }

    /// Unwraps a graph reply.
    pub fn into_graph(self) -> Result<GraphBatch> {
        match self {
            Reply::Graph(batch) => Ok(batch),
            other => Err(TesseraError::ReplyKind {
                expected: "graph",
                got: other.kind_name(),
            }),
        }
    }

    /// Unwraps a node-pack reply.
    pub fn into_nodes(self) -> Result<NodePack> {
        match self {
            Reply::Nodes(pack) => Ok(pack),
            other => Err(TesseraError::ReplyKind {
                expected: "nodes",
                got: other.kind_name(),
            }),
        }
    }
}

enum QueryState {
    /// Accepted, queued for a lane.
    Submitted,
    /// A lane thread is working on it.
    Dispatched,
    /// Reply (or failure) landed, waiting for resolve.
    Completed(Result<Reply>),
    /// Resolve already surrendered the payload.
    Resolved,
}

struct RouterShared {
    queries: Mutex<FxHashMap<QueryId, QueryState>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl RouterShared {
    /// Parks `result` for `id` unless the query was cancelled meanwhile.
    fn complete(&self, id: QueryId, result: Result<Reply>) {
        let mut queries = self.queries.lock();
        match queries.get_mut(&id) {
            Some(state) if !matches!(state, QueryState::Resolved) => {
                *state = QueryState::Completed(result);
                debug!(query = %id, "router.query.complete");
                self.cv.notify_all();
            }
            _ => debug!(query = %id, "router.result.discard"),
        }
    }

    /// Claims `id` for a lane; false when the query was cancelled.
    fn dispatch(&self, id: QueryId) -> bool {
        let mut queries = self.queries.lock();
        match queries.get_mut(&id) {
            Some(state) => {
                *state = QueryState::Dispatched;
                true
            }
            None => false,
        }
    }
}

/// Client-side state machine for in-flight queries.
pub struct QueryRouter {
    kinds: Vec<SamplerKind>,
    shared: Arc<RouterShared>,
    graph_txs: Vec<Sender<QueryId>>,
    fetch_tx: Sender<(QueryId, Vec<NodeId>)>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    rr: AtomicUsize,
    next_id: AtomicU64,
}

impl QueryRouter {
    /// Spawns one lane per sampler kind `endpoint` advertises, plus the
    /// node-fetch lane.
    pub fn new(endpoint: Arc<dyn ServiceEndpoint>) -> Result<QueryRouter> {
        let kinds = endpoint.sampler_kinds();
        let shared = Arc::new(RouterShared {
            queries: Mutex::new(FxHashMap::default()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut graph_txs = Vec::with_capacity(kinds.len());
        let mut handles = Vec::with_capacity(kinds.len() + 1);
        for &kind in &kinds {
            let (tx, rx) = unbounded();
            let lane = GraphLane {
                kind,
                rx,
                endpoint: Arc::clone(&endpoint),
                shared: Arc::clone(&shared),
            };
            handles.push(
                thread::Builder::new()
                    .name(format!("tessera-route-{kind}"))
                    .spawn(move || lane.run())?,
            );
            graph_txs.push(tx);
        }
        let (fetch_tx, fetch_rx) = unbounded();
        let fetch = FetchLane {
            rx: fetch_rx,
            endpoint,
            shared: Arc::clone(&shared),
        };
        handles.push(
            thread::Builder::new()
                .name("tessera-route-fetch".into())
                .spawn(move || fetch.run())?,
        );
        Ok(QueryRouter {
            kinds,
            shared,
            graph_txs,
            fetch_tx,
            handles: Mutex::new(handles),
            rr: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        })
    }

    /// Sampler kinds this router can pull from.
    pub fn advertised(&self) -> &[SamplerKind] {
        &self.kinds
    }

    /// Submits a batch pull. An empty selector means any advertised kind;
    /// a non-empty one restricts the round-robin to the kinds it names.
    pub fn pull_graph(&self, selector: &[SamplerKind]) -> Result<QueryId> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(TesseraError::Shutdown);
        }
        if self.kinds.is_empty() {
            return Err(TesseraError::NoSamplers);
        }
        let eligible: &[SamplerKind] = if selector.is_empty() {
            &self.kinds
        } else {
            for kind in selector {
                if !self.kinds.contains(kind) {
                    return Err(TesseraError::InvalidArgument(format!(
                        "sampler {kind} is not advertised by the attached server"
                    )));
                }
            }
            selector
        };
        let kind = eligible[self.rr.fetch_add(1, Ordering::Relaxed) % eligible.len()];
        let lane = self
            .kinds
            .iter()
            .position(|&k| k == kind)
            .ok_or(TesseraError::NoSamplers)?;
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .queries
            .lock()
            .insert(id, QueryState::Submitted);
        if self.graph_txs[lane].send(id).is_err() {
            self.shared.queries.lock().remove(&id);
            return Err(TesseraError::Shutdown);
        }
        debug!(query = %id, kind = %kind, "router.pull.submit");
        Ok(id)
    }

    /// Submits an ad-hoc node fetch.
    pub fn pull_node(&self, ids: &[NodeId]) -> Result<QueryId> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(TesseraError::Shutdown);
        }
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .queries
            .lock()
            .insert(id, QueryState::Submitted);
        if self.fetch_tx.send((id, ids.to_vec())).is_err() {
            self.shared.queries.lock().remove(&id);
            return Err(TesseraError::Shutdown);
        }
        debug!(query = %id, nodes = ids.len(), "router.pull.submit");
        Ok(id)
    }

    /// Blocks until the reply for `id` lands and surrenders it. A second
    /// resolve of the same query fails with
    /// [`TesseraError::AlreadyResolved`].
    pub fn resolve(&self, id: QueryId) -> Result<Reply> {
        let mut queries = self.shared.queries.lock();
        loop {
            match queries.get(&id) {
                None => return Err(TesseraError::UnknownQuery(id)),
                Some(QueryState::Resolved) => return Err(TesseraError::AlreadyResolved(id)),
                Some(QueryState::Completed(_)) => {}
                Some(_) => {
                    if self.shared.shutdown.load(Ordering::SeqCst) {
                        return Err(TesseraError::Shutdown);
                    }
                    self.shared.cv.wait(&mut queries);
                    continue;
                }
            }
            if let Some(QueryState::Completed(result)) = queries.remove(&id) {
                queries.insert(id, QueryState::Resolved);
                debug!(query = %id, "router.query.resolve");
                return result;
            }
        }
    }

    /// Abandons an unresolved query. A reply already in flight is
    /// discarded when it lands.
    pub fn cancel(&self, id: QueryId) -> Result<()> {
        let mut queries = self.shared.queries.lock();
        match queries.get(&id) {
            None => Err(TesseraError::UnknownQuery(id)),
            Some(QueryState::Resolved) => Err(TesseraError::AlreadyResolved(id)),
            Some(_) => {
                queries.remove(&id);
                debug!(query = %id, "router.query.cancel");
                Ok(())
            }
        }
    }

    /// Stops the lane threads and wakes blocked resolvers with
    /// [`TesseraError::Shutdown`]. Safe to call twice.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            // Notify under the lock so a resolver between its shutdown
            // check and cv.wait cannot miss the wakeup.
            let _queries = self.shared.queries.lock();
            self.shared.cv.notify_all();
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("router.closed");
    }
}

impl Drop for QueryRouter {
    fn drop(&mut self) {
        self.close();
    }
}

struct GraphLane {
    kind: SamplerKind,
    rx: Receiver<QueryId>,
    endpoint: Arc<dyn ServiceEndpoint>,
    shared: Arc<RouterShared>,
}

impl GraphLane {
    fn run(self) {
        while !self.shared.shutdown.load(Ordering::SeqCst) {
            let id = match self.rx.recv_timeout(LANE_POLL) {
                Ok(id) => id,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.shared.dispatch(id) {
                debug!(query = %id, "router.query.skip_cancelled");
                continue;
            }
            let result = loop {
                match self.endpoint.next_batch(self.kind, LANE_POLL) {
                    Ok(Some(batch)) => break Ok(Reply::Graph(batch)),
                    Ok(None) => {
                        if self.shared.shutdown.load(Ordering::SeqCst) {
                            break Err(TesseraError::Shutdown);
                        }
                    }
                    Err(e) => break Err(e),
                }
            };
            self.shared.complete(id, result);
        }
    }
}

struct FetchLane {
    rx: Receiver<(QueryId, Vec<NodeId>)>,
    endpoint: Arc<dyn ServiceEndpoint>,
    shared: Arc<RouterShared>,
}

impl FetchLane {
    fn run(self) {
        while !self.shared.shutdown.load(Ordering::SeqCst) {
            let (id, ids) = match self.rx.recv_timeout(LANE_POLL) {
                Ok(work) => work,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.shared.dispatch(id) {
                debug!(query = %id, "router.query.skip_cancelled");
                continue;
            }
            let result = self.endpoint.fetch_nodes(&ids).map(Reply::Nodes);
            self.shared.complete(id, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::EdgeList;
    use crate::meta::JobMeta;
    use crate::model::NodeData;

    /// Endpoint whose batches carry a sequence number, so tests can see
    /// completion order.
    struct ScriptedEndpoint {
        meta: Arc<JobMeta>,
        kinds: Vec<SamplerKind>,
        counter: AtomicU64,
        fail_first: bool,
    }

    impl ScriptedEndpoint {
        fn new(kinds: Vec<SamplerKind>, fail_first: bool) -> Arc<ScriptedEndpoint> {
            Arc::new(ScriptedEndpoint {
                meta: Arc::new(JobMeta {
                    nodes: 100,
                    edges: 0,
                    feature_width: 1,
                    int_width: 2,
                    classes: 2,
                    partitions: 1,
                    train: 0,
                    eval: 0,
                    test: 0,
                    offsets: vec![0, 100],
                    shard_nodes: vec![100],
                    shard_edges: vec![0],
                }),
                kinds,
                counter: AtomicU64::new(0),
                fail_first,
            })
        }
    }

    impl ServiceEndpoint for ScriptedEndpoint {
        fn meta(&self) -> Arc<JobMeta> {
            Arc::clone(&self.meta)
        }

        fn sampler_kinds(&self) -> Vec<SamplerKind> {
            self.kinds.clone()
        }

        fn next_batch(&self, kind: SamplerKind, _timeout: Duration) -> Result<Option<GraphBatch>> {
            let seq = self.counter.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && seq == 0 {
                return Err(TesseraError::Config("sampler exploded".into()));
            }
            let batch = GraphBatch::new(
                kind,
                vec![NodeId(seq)],
                1,
                vec![seq as f32],
                2,
                vec![0, 0],
                Vec::new(),
                EdgeList::Coo {
                    src: Vec::new(),
                    dst: Vec::new(),
                },
            )?;
            Ok(Some(batch))
        }

        fn fetch_nodes(&self, ids: &[NodeId]) -> Result<NodePack> {
            let mut pack = NodePack::default();
            for &id in ids {
                pack.insert(
                    id,
                    Arc::new(NodeData {
                        features: vec![id.0 as f32],
                        ints: vec![0, 0],
                        neighbors: Vec::new(),
                    }),
                );
            }
            Ok(pack)
        }

        fn fetch_owned(&self, ids: &[NodeId]) -> Result<NodePack> {
            self.fetch_nodes(ids)
        }
    }

    fn seq_of(reply: Reply) -> Result<u64> {
        Ok(reply.into_graph()?.nodes()[0].0)
    }

    #[test]
    fn same_kind_replies_complete_in_pull_order() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        let q0 = router.pull_graph(&[])?;
        let q1 = router.pull_graph(&[])?;
        let q2 = router.pull_graph(&[])?;
        // Resolution order must not matter.
        assert_eq!(seq_of(router.resolve(q2)?)?, 2);
        assert_eq!(seq_of(router.resolve(q0)?)?, 0);
        assert_eq!(seq_of(router.resolve(q1)?)?, 1);
        router.close();
        Ok(())
    }

    #[test]
    fn resolve_is_at_most_once() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        let q = router.pull_graph(&[])?;
        router.resolve(q)?;
        assert!(matches!(
            router.resolve(q),
            Err(TesseraError::AlreadyResolved(_))
        ));
        assert!(matches!(
            router.cancel(q),
            Err(TesseraError::AlreadyResolved(_))
        ));
        router.close();
        Ok(())
    }

    #[test]
    fn unknown_query_is_rejected() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        assert!(matches!(
            router.resolve(QueryId(999)),
            Err(TesseraError::UnknownQuery(_))
        ));
        assert!(matches!(
            router.cancel(QueryId(999)),
            Err(TesseraError::UnknownQuery(_))
        ));
        router.close();
        Ok(())
    }

    #[test]
    fn cancelled_query_forgets_its_id() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        let q = router.pull_graph(&[])?;
        router.cancel(q)?;
        assert!(matches!(
            router.resolve(q),
            Err(TesseraError::UnknownQuery(_))
        ));
        router.close();
        Ok(())
    }

    #[test]
    fn selector_restricted_to_advertised_kinds() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        assert!(matches!(
            router.pull_graph(&[SamplerKind::FanOut]),
            Err(TesseraError::InvalidArgument(_))
        ));
        let empty = QueryRouter::new(ScriptedEndpoint::new(Vec::new(), false))?;
        assert!(matches!(empty.pull_graph(&[]), Err(TesseraError::NoSamplers)));
        empty.close();
        router.close();
        Ok(())
    }

    #[test]
    fn producer_failure_reaches_the_resolver() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], true))?;
        let q0 = router.pull_graph(&[])?;
        let q1 = router.pull_graph(&[])?;
        assert!(matches!(router.resolve(q0), Err(TesseraError::Config(_))));
        // The lane keeps going after a failed query.
        assert_eq!(seq_of(router.resolve(q1)?)?, 1);
        router.close();
        Ok(())
    }

    #[test]
    fn node_pull_round_trips_and_kind_checks() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        let q = router.pull_node(&[NodeId(4), NodeId(9)])?;
        let reply = router.resolve(q)?;
        let pack = reply.into_nodes()?;
        assert_eq!(pack.len(), 2);
        assert_eq!(pack[&NodeId(9)].features, vec![9.0]);

        let q = router.pull_node(&[NodeId(1)])?;
        assert!(matches!(
            router.resolve(q)?.into_graph(),
            Err(TesseraError::ReplyKind {
                expected: "graph",
                got: "nodes"
            })
        ));
        router.close();
        Ok(())
    }

    #[test]
    fn closed_router_rejects_new_pulls() -> Result<()> {
        let router = QueryRouter::new(ScriptedEndpoint::new(vec![SamplerKind::LocalNode], false))?;
        router.close();
        assert!(matches!(router.pull_graph(&[]), Err(TesseraError::Shutdown)));
        assert!(matches!(
            router.pull_node(&[NodeId(1)]),
            Err(TesseraError::Shutdown)
        ));
        Ok(())
    }

    #[test]
    fn round_robin_rotates_across_kinds() -> Result<()> {
        let endpoint = ScriptedEndpoint::new(
            vec![SamplerKind::LocalNode, SamplerKind::RandomWalk],
            false,
        );
        let router = QueryRouter::new(endpoint)?;
        let mut kinds = Vec::new();
        for _ in 0..4 {
            let q = router.pull_graph(&[])?;
            kinds.push(router.resolve(q)?.into_graph()?.kind());
        }
        assert_eq!(
            kinds,
            vec![
                SamplerKind::LocalNode,
                SamplerKind::RandomWalk,
                SamplerKind::LocalNode,
                SamplerKind::RandomWalk
            ]
        );
        router.close();
        Ok(())
    }
}
