//! Frequency-ordered eviction stores backing the LFU cache policies.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::model::{NodeData, NodeId};

struct LfuEntry {
    freq: u64,
    seq: u64,
    value: Arc<NodeData>,
}

/// Least-frequently-used store with insertion-order tie breaking.
///
/// Entries are ordered by `(frequency, insertion sequence)`; eviction takes
/// the smallest, so among equally cold entries the oldest one goes first.
/// With a decay interval set, every frequency is halved once per interval of
/// operations, letting entries that were hot in an earlier epoch age out.
pub(crate) struct LfuCache {
    capacity: usize,
    entries: FxHashMap<NodeId, LfuEntry>,
    order: BTreeSet<(u64, u64, NodeId)>,
    next_seq: u64,
    decay_every: Option<u64>,
    ops: u64,
}

impl LfuCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::with_decay(capacity, None)
    }

    pub(crate) fn with_decay(capacity: usize, decay_every: Option<u64>) -> Self {
        LfuCache {
            capacity,
            entries: FxHashMap::default(),
            order: BTreeSet::new(),
            next_seq: 0,
            decay_every,
            ops: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&mut self, id: NodeId) -> Option<Arc<NodeData>> {
        self.tick();
        let entry = self.entries.get_mut(&id)?;
        self.order.remove(&(entry.freq, entry.seq, id));
        entry.freq += 1;
        self.order.insert((entry.freq, entry.seq, id));
        Some(Arc::clone(&entry.value))
    }

    pub(crate) fn peek(&self, id: NodeId) -> Option<Arc<NodeData>> {
        self.entries.get(&id).map(|e| Arc::clone(&e.value))
    }

    pub(crate) fn insert(&mut self, id: NodeId, value: Arc<NodeData>) {
        self.tick();
        if self.capacity == 0 {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            self.order.remove(&(entry.freq, entry.seq, id));
            entry.freq += 1;
            entry.value = value;
            self.order.insert((entry.freq, entry.seq, id));
            return;
        }
        if self.entries.len() == self.capacity {
            if let Some(victim) = self.order.pop_first() {
                self.entries.remove(&victim.2);
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            id,
            LfuEntry {
                freq: 1,
                seq,
                value,
            },
        );
        self.order.insert((1, seq, id));
    }

    fn tick(&mut self) {
        self.ops += 1;
        if let Some(every) = self.decay_every {
            if self.ops % every == 0 {
                self.halve();
            }
        }
    }

    fn halve(&mut self) {
        let mut order = BTreeSet::new();
        for (&id, entry) in self.entries.iter_mut() {
            entry.freq /= 2;
            order.insert((entry.freq, entry.seq, id));
        }
        self.order = order;
    }
}
