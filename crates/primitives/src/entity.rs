//! Entity headers and the closed kind taxonomy.

use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::id::EntityId;
use crate::time::Timestamp;

/// The closed set of entity kinds known to the fabric.
///
/// Kinds discriminate both patch targets and sync emission priority;
/// adding a kind is a protocol change.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    SystemState,
    Thread,
    Message,
    Task,
    Project,
    Draft,
    Inbox,
    Note,
    PendingAction,
    Token,
    Pattern,
    Motif,
    UiSurface,
    UiComponent,
    CameraSurface,
    AudioSurface,
    SceneTile,
    SceneObject,
    SceneLight,
    Actuator,
    ActuatorState,
    ActuationIntent,
    ActuationReceipt,
    Dictionary,
    Proposal,
}

impl EntityKind {
    /// Sync emission priority, 1 (highest) to 10 (lowest).
    ///
    /// Control-plane state goes first so a constrained link carries the
    /// system's mode and pending commands before it carries notes.
    #[must_use]
    pub const fn sync_priority(&self) -> u8 {
        match self {
            Self::SystemState => 1,
            Self::PendingAction => 2,
            Self::ActuationIntent => 3,
            Self::Actuator | Self::ActuatorState | Self::ActuationReceipt => 4,
            Self::CameraSurface
            | Self::AudioSurface
            | Self::SceneTile
            | Self::SceneObject
            | Self::SceneLight => 5,
            Self::UiSurface | Self::UiComponent => 6,
            Self::Message | Self::Thread => 7,
            Self::Task | Self::Project => 8,
            Self::Draft | Self::Inbox | Self::Note => 9,
            Self::Token | Self::Pattern | Self::Motif | Self::Dictionary | Self::Proposal => 10,
        }
    }
}

/// Who authored a delta.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    System,
    DeviceAgent,
    Sync,
    Policy,
}

/// System-wide operating mode, replicated as the `system_state` entity.
///
/// `Recover` is the restricted mode: only actuator kinds in the
/// configured allow-set may be commanded while it is active.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    #[default]
    Build,
    Observe,
    Recover,
}

impl SystemMode {
    #[must_use]
    pub const fn is_restricted(&self) -> bool {
        matches!(self, Self::Recover)
    }
}

/// Header of one logical object in the fabric.
///
/// The header is derived bookkeeping: `current_hash` must equal the
/// `new_hash` of the latest accepted delta, and `current_version` the
/// count of accepted deltas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub created_at: Timestamp,
    pub current_version: u64,
    pub current_hash: Hash,
    pub is_archived: bool,
}

impl Entity {
    #[must_use]
    pub fn new(id: EntityId, kind: EntityKind, created_at: Timestamp) -> Self {
        Self {
            id,
            kind,
            created_at,
            current_version: 0,
            current_hash: Hash::genesis(),
            is_archived: false,
        }
    }
}
