use thiserror::Error;
use weft_chain::ChainError;
use weft_primitives::actuation::IntentStatus;
use weft_primitives::id::{EntityId, IntentId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActuationError {
    #[error("unknown intent {0}")]
    UnknownIntent(IntentId),

    #[error("unknown actuator {0}")]
    UnknownActuator(EntityId),

    #[error("actuator {0} has no state entity registered")]
    MissingActuatorState(EntityId),

    #[error("intent {0} already has a receipt")]
    DuplicateReceipt(IntentId),

    #[error("illegal intent transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: IntentStatus,
        to: IntentStatus,
    },

    #[error("intent {intent_id} is terminal ({status:?})")]
    Terminal {
        intent_id: IntentId,
        status: IntentStatus,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("entity state does not decode: {0}")]
    BadEntityState(String),
}
