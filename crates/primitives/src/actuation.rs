//! Actuation entity states: actuators, their live state, intents and
//! receipts.
//!
//! These structs are the *typed views* of entity state. The entity log
//! stores plain JSON values; anything that needs to reason about an
//! actuator deserializes the materialized state into these shapes.

use serde::{Deserialize, Serialize};

use crate::entity::Author;
use crate::id::{EntityId, IntentId, NodeId};
use crate::time::Timestamp;

/// The closed set of controllable thing kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuatorKind {
    Relay,
    Dimmer,
    SoftwareToggle,
    Servo,
    Lock,
}

/// Value envelope an actuator accepts for `SET_VALUE`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<f64>>,
}

/// State of an `actuator` entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    pub name: String,
    pub kind: ActuatorKind,
    pub owner_node_id: NodeId,
    #[serde(default)]
    pub capabilities: ActuatorCapabilities,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuatorStateKind {
    #[default]
    Unknown,
    Off,
    On,
    Moving,
    Error,
}

/// State of an `actuator_state` entity. Mutated only by the device
/// agent on the owning node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActuatorState {
    pub actuator_id: EntityId,
    pub state: ActuatorStateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_intent_id: Option<IntentId>,
    pub updated_at: Timestamp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActuationAction {
    SetOn,
    SetOff,
    SetValue,
}

/// The requested change an intent carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActuationRequest {
    pub action: ActuationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Per-intent policy knobs supplied by the creator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentPolicy {
    #[serde(default)]
    pub requires_human_confirm: bool,
    pub ttl_ms: u64,
}

/// Intent lifecycle status (see the state machine in the actuation
/// engine). Terminal statuses are never left.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    New,
    Authorized,
    Dispatched,
    Applied,
    Denied,
    Expired,
    Failed,
}

impl IntentStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Denied | Self::Expired | Self::Failed
        )
    }
}

/// State of an `actuation_intent` entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActuationIntent {
    pub actuator_id: EntityId,
    pub requested_by_node: NodeId,
    pub requested_by_actor: Author,
    pub request: ActuationRequest,
    pub policy: IntentPolicy,
    pub status: IntentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptOutcome {
    Applied,
    Failed,
}

/// State of an `actuation_receipt` entity. Exactly one receipt exists
/// per applied or failed intent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActuationReceipt {
    pub intent_id: IntentId,
    pub actuator_id: EntityId,
    pub owner_node_id: NodeId,
    pub outcome: ReceiptOutcome,
    pub observed_state: ActuatorStateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_value: Option<f64>,
    pub created_at: Timestamp,
}

/// Why policy evaluation denied an intent. Carried verbatim into the
/// intent's `/reason` field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyReason {
    IntentExpired,
    ModeRestrictRecover,
    ValueRequired,
    ValueNotAllowed,
    ValueBelowMin,
    ValueAboveMax,
    ValueNotOnStep,
    RateLimited,
}

impl PolicyReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::IntentExpired => "INTENT_EXPIRED",
            Self::ModeRestrictRecover => "MODE_RESTRICT_RECOVER",
            Self::ValueRequired => "VALUE_REQUIRED",
            Self::ValueNotAllowed => "VALUE_NOT_ALLOWED",
            Self::ValueBelowMin => "VALUE_BELOW_MIN",
            Self::ValueAboveMax => "VALUE_ABOVE_MAX",
            Self::ValueNotOnStep => "VALUE_NOT_ON_STEP",
            Self::RateLimited => "RATE_LIMITED",
        }
    }
}

impl core::fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
