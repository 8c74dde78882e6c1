use thiserror::Error;
use weft_patch::PatchError;
use weft_primitives::hash::Hash;
use weft_primitives::id::{DeltaId, EntityId};
use weft_primitives::sync::RejectReason;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("entity {0} already exists")]
    EntityExists(EntityId),

    #[error("delta {delta_id} does not link: expected prev {expected}, got {actual}")]
    BrokenLink {
        delta_id: DeltaId,
        expected: Hash,
        actual: Hash,
    },

    #[error("delta {delta_id} state mismatch: computed {computed}, declared {declared}")]
    HashMismatch {
        delta_id: DeltaId,
        computed: Hash,
        declared: Hash,
    },

    #[error("fork on {entity_id} at {prev_hash}: deltas {first} and {second}")]
    Fork {
        entity_id: EntityId,
        prev_hash: Hash,
        first: DeltaId,
        second: DeltaId,
    },

    #[error("creation delta expected for unknown entity {entity_id}, got extension {delta_id}")]
    MissingCreation {
        entity_id: EntityId,
        delta_id: DeltaId,
    },

    #[error("initial state must be an object")]
    InitialNotObject,

    #[error(transparent)]
    Patch(#[from] PatchError),
}

impl ChainError {
    /// The wire-level reject class this error maps to when a delta is
    /// refused during sync acceptance.
    #[must_use]
    pub const fn reject_reason(&self) -> RejectReason {
        match self {
            Self::UnknownEntity(_) | Self::MissingCreation { .. } => RejectReason::EntityUnknown,
            Self::EntityExists(_) => RejectReason::SchemaInvalid,
            Self::BrokenLink { .. } | Self::HashMismatch { .. } | Self::Fork { .. } => {
                RejectReason::HashChainBroken
            }
            Self::InitialNotObject | Self::Patch(_) => RejectReason::SchemaInvalid,
        }
    }

    #[must_use]
    pub const fn is_fork(&self) -> bool {
        matches!(self, Self::Fork { .. })
    }
}
