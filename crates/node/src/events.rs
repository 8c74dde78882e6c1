//! Node event hook.
//!
//! The node reports interesting transitions through a dispatcher the
//! embedding application installs; returning `false` from `dispatch`
//! means the event was dropped, which the node tolerates (events are
//! advisory, the chain is the record).

use serde::{Deserialize, Serialize};
use weft_primitives::actuation::IntentStatus;
use weft_primitives::entity::{Author, EntityKind};
use weft_primitives::hash::Hash;
use weft_primitives::id::{ConflictId, EntityId, IntentId, NodeId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    /// A delta was accepted locally (authored or synced).
    DeltaApplied {
        entity_id: EntityId,
        kind: EntityKind,
        author: Author,
        new_hash: Hash,
    },
    /// A fork was recorded.
    ConflictDetected {
        conflict_id: ConflictId,
        entity_id: EntityId,
    },
    /// A conflict was closed by a resolution delta.
    ConflictResolved {
        conflict_id: ConflictId,
        entity_id: EntityId,
    },
    /// An intent reached a terminal status.
    IntentTerminal {
        intent_id: IntentId,
        status: IntentStatus,
    },
    /// A sync session reached COMPLETE.
    SyncCompleted {
        session_id: SessionId,
        peer_id: NodeId,
        deltas_sent: u64,
        deltas_received: u64,
    },
    /// A sync session died (protocol error, bad signature, cancel).
    SyncFailed {
        session_id: SessionId,
        peer_id: NodeId,
        error: String,
    },
}

pub trait EventDispatcher: Send + Sync {
    /// Deliver one event; `false` means it was dropped.
    fn dispatch(&self, event: NodeEvent) -> bool;
}

/// Discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullDispatcher;

impl EventDispatcher for NullDispatcher {
    fn dispatch(&self, _event: NodeEvent) -> bool {
        false
    }
}
