//! Fork records and their resolution.
//!
//! A fork (two deltas sharing a parent) is never silently ordered
//! away: it becomes a first-class [`Conflict`] holding both branches.
//! Resolution produces an ordinary delta (the chain stays the only
//! authority) whose patch asserts the surviving shape and whose
//! reserved `/_resolution` entry records the fork for audit.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use weft_primitives::delta::{Delta, PatchOp};
use weft_primitives::hash::Hash;
use weft_primitives::id::{ConflictId, DeltaId, EntityId, NodeId};
use weft_primitives::time::Timestamp;

/// Reserved state path the resolution audit record lands under.
pub const RESOLUTION_PATH: &str = "/_resolution";

/// One side of a fork.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictBranch {
    /// Node whose chain carried this branch.
    pub node_id: NodeId,
    pub head_hash: Hash,
    pub deltas: Vec<Delta>,
}

impl ConflictBranch {
    /// Timestamp of the branch tip, for the newer-branch rule.
    #[must_use]
    pub fn tip_key(&self) -> (Timestamp, DeltaId) {
        self.deltas
            .last()
            .map_or((Timestamp::from_millis(0), DeltaId::from_bytes([0; 16])), Delta::chain_key)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Detected,
    Resolving,
    Resolved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionKind {
    ChooseA,
    ChooseB,
    Merge,
}

/// A persisted fork: both branches retained until resolved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_id: EntityId,
    pub base_hash: Hash,
    pub branch_a: ConflictBranch,
    pub branch_b: ConflictBranch,
    pub status: ConflictStatus,
    pub detected_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_delta_id: Option<DeltaId>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConflictError {
    #[error("unknown conflict {0}")]
    Unknown(ConflictId),
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),
    #[error("MERGE resolution requires a caller-supplied patch")]
    MergePatchRequired,
}

/// What the orchestrator must do to the entity chain to resolve a
/// conflict: possibly adopt the other branch, then extend with `patch`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionPlan {
    /// Head the resolution delta must link to.
    pub prev_hash: Hash,
    /// Branch the local chain must carry before the resolution delta
    /// (the store adopts it if its current head differs).
    pub adopt: ConflictBranch,
    pub patch: Vec<PatchOp>,
}

/// Build the resolution for `conflict`.
///
/// `CHOOSE_A`/`CHOOSE_B` re-assert the chosen branch's patches on top
/// of its own head; `MERGE` applies the caller's patch on top of the
/// newer-timestamped branch head. All three append the audit record.
pub fn plan_resolution(
    conflict: &Conflict,
    kind: ResolutionKind,
    merge_patch: Option<Vec<PatchOp>>,
) -> Result<ResolutionPlan, ConflictError> {
    let newer_is_a = conflict.branch_a.tip_key() >= conflict.branch_b.tip_key();

    let (base, mut patch) = match kind {
        ResolutionKind::ChooseA => (
            &conflict.branch_a,
            branch_patch_ops(&conflict.branch_a),
        ),
        ResolutionKind::ChooseB => (
            &conflict.branch_b,
            branch_patch_ops(&conflict.branch_b),
        ),
        ResolutionKind::Merge => {
            let supplied = merge_patch.ok_or(ConflictError::MergePatchRequired)?;
            let base = if newer_is_a {
                &conflict.branch_a
            } else {
                &conflict.branch_b
            };
            (base, supplied)
        }
    };

    patch.push(PatchOp::add(
        RESOLUTION_PATH,
        json!({
            "base_hash": conflict.base_hash,
            "branch_a": conflict.branch_a.head_hash,
            "branch_b": conflict.branch_b.head_hash,
            "resolution_type": kind,
        }),
    ));

    Ok(ResolutionPlan {
        prev_hash: base.head_hash,
        adopt: base.clone(),
        patch,
    })
}

fn branch_patch_ops(branch: &ConflictBranch) -> Vec<PatchOp> {
    branch
        .deltas
        .iter()
        .flat_map(|d| d.patch.iter().cloned())
        .collect()
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConflictStats {
    pub detected: usize,
    pub resolving: usize,
    pub resolved: usize,
}

/// All known conflicts, indexed by id and entity.
#[derive(Debug, Default)]
pub struct ConflictStore {
    conflicts: HashMap<ConflictId, Conflict>,
    by_entity: HashMap<EntityId, Vec<ConflictId>>,
}

impl ConflictStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fork. Opening the same fork twice (same entity and
    /// base hash, not yet resolved) returns the existing record, so a
    /// peer delivering both branches opens exactly one conflict.
    pub fn open(
        &mut self,
        id: ConflictId,
        entity_id: EntityId,
        base_hash: Hash,
        branch_a: ConflictBranch,
        branch_b: ConflictBranch,
        now: Timestamp,
    ) -> ConflictId {
        if let Some(existing) = self.by_entity.get(&entity_id).and_then(|ids| {
            ids.iter().find(|cid| {
                self.conflicts.get(cid).is_some_and(|c| {
                    c.base_hash == base_hash && c.status != ConflictStatus::Resolved
                })
            })
        }) {
            return *existing;
        }

        debug!(%entity_id, base = %base_hash, "fork detected, opening conflict");
        let _ = self.conflicts.insert(
            id,
            Conflict {
                id,
                entity_id,
                base_hash,
                branch_a,
                branch_b,
                status: ConflictStatus::Detected,
                detected_at: now,
                resolved_at: None,
                resolution_delta_id: None,
            },
        );
        self.by_entity.entry(entity_id).or_default().push(id);
        id
    }

    #[must_use]
    pub fn get(&self, id: &ConflictId) -> Option<&Conflict> {
        self.conflicts.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.values()
    }

    #[must_use]
    pub fn for_entity(&self, entity_id: &EntityId) -> Vec<&Conflict> {
        self.by_entity
            .get(entity_id)
            .map(|ids| ids.iter().filter_map(|id| self.conflicts.get(id)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn with_status(&self, status: ConflictStatus) -> Vec<&Conflict> {
        self.conflicts
            .values()
            .filter(|c| c.status == status)
            .collect()
    }

    /// Move a conflict into RESOLVING; errors if unknown or done.
    pub fn begin_resolution(&mut self, id: &ConflictId) -> Result<&Conflict, ConflictError> {
        let conflict = self
            .conflicts
            .get_mut(id)
            .ok_or(ConflictError::Unknown(*id))?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(ConflictError::AlreadyResolved(*id));
        }
        conflict.status = ConflictStatus::Resolving;
        Ok(conflict)
    }

    /// Record the resolution delta and close the conflict.
    pub fn mark_resolved(
        &mut self,
        id: &ConflictId,
        resolution_delta_id: DeltaId,
        now: Timestamp,
    ) -> Result<(), ConflictError> {
        let conflict = self
            .conflicts
            .get_mut(id)
            .ok_or(ConflictError::Unknown(*id))?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(ConflictError::AlreadyResolved(*id));
        }
        conflict.status = ConflictStatus::Resolved;
        conflict.resolved_at = Some(now);
        conflict.resolution_delta_id = Some(resolution_delta_id);
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> ConflictStats {
        let mut stats = ConflictStats::default();
        for conflict in self.conflicts.values() {
            match conflict.status {
                ConflictStatus::Detected => stats.detected += 1,
                ConflictStatus::Resolving => stats.resolving += 1,
                ConflictStatus::Resolved => stats.resolved += 1,
            }
        }
        stats
    }
}
