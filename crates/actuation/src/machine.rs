//! The intent state machine.
//!
//! ```text
//!        create
//!          │
//!          ▼
//!        NEW ──policy──▶ DENIED
//!          │
//!      authorize
//!          │
//!          ▼
//!      AUTHORIZED ──dispatch──▶ DISPATCHED ──apply──▶ APPLIED
//!          │                        │            └──▶ FAILED
//!          └────── ttl ──▶ EXPIRED ◀┘
//! ```
//!
//! Transitions are patches: each one replaces `/status` and, where a
//! reason exists, sets `/reason`. A terminal intent accepts nothing
//! further. `DISPATCHED → APPLIED/FAILED` is deliberately re-enterable
//! so a device agent resuming after a crash between dispatch and apply
//! can finish the job. `AUTHORIZED → DENIED` exists for caller
//! cancellation; once dispatched, an intent can only finish or expire.

use serde_json::json;
use weft_primitives::actuation::IntentStatus;
use weft_primitives::delta::PatchOp;

use crate::error::ActuationError;

/// Is `from → to` a legal edge of the machine?
#[must_use]
pub const fn is_legal(from: IntentStatus, to: IntentStatus) -> bool {
    matches!(
        (from, to),
        (
            IntentStatus::New,
            IntentStatus::Authorized | IntentStatus::Denied | IntentStatus::Expired
        ) | (
            IntentStatus::Authorized,
            IntentStatus::Dispatched | IntentStatus::Denied | IntentStatus::Expired
        ) | (
            IntentStatus::Dispatched,
            IntentStatus::Applied | IntentStatus::Failed | IntentStatus::Expired
        )
    )
}

/// Build the patch for one transition.
///
/// The `/reason` op uses `add` (set-or-overwrite) because intents are
/// created without a reason field.
pub fn transition_patch(
    from: IntentStatus,
    to: IntentStatus,
    reason: Option<&str>,
) -> Result<Vec<PatchOp>, ActuationError> {
    if !is_legal(from, to) {
        return Err(ActuationError::IllegalTransition { from, to });
    }
    let mut patch = vec![PatchOp::replace("/status", json!(to))];
    if let Some(reason) = reason {
        patch.push(PatchOp::add("/reason", json!(reason)));
    }
    Ok(patch)
}
