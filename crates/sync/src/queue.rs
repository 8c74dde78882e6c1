//! Kind-priority emission queue.
//!
//! Orders outgoing deltas so control-plane state crosses a constrained
//! link first (see `EntityKind::sync_priority`). The bound applies to
//! emission only: entries dropped here stay in the local store and are
//! re-served when the peer next asks.

use std::collections::BTreeMap;

use weft_primitives::delta::Delta;
use weft_primitives::entity::EntityKind;
use weft_primitives::id::DeltaId;
use weft_primitives::time::Timestamp;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedDelta {
    pub kind: EntityKind,
    pub delta: Delta,
}

type QueueKey = (u8, Timestamp, DeltaId);

/// Bounded priority queue over deltas by entity class.
#[derive(Debug)]
pub struct PriorityQueue {
    entries: BTreeMap<QueueKey, QueuedDelta>,
    capacity: usize,
    dropped: u64,
}

impl PriorityQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Enqueue a delta. When full, the lowest-priority tail entry is
    /// dropped (which may be the one being pushed).
    pub fn push(&mut self, kind: EntityKind, delta: Delta) {
        let key = (kind.sync_priority(), delta.timestamp, delta.delta_id);
        let _ = self.entries.insert(key, QueuedDelta { kind, delta });
        while self.entries.len() > self.capacity {
            let _ = self.entries.pop_last();
            self.dropped += 1;
        }
    }

    /// Highest-priority entry: lowest priority number, then oldest.
    pub fn pop(&mut self) -> Option<QueuedDelta> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Emission drops since construction.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
