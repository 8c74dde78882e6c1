//! Pure chain verification.
//!
//! Verification never trusts a declared hash: it re-folds the patch
//! sequence from the empty state and re-derives every link. It reports
//! instead of panicking, so sync acceptance and audits share it.

use serde_json::Value;
use weft_patch::{apply_all, canonical_hash, empty_state};
use weft_primitives::delta::Delta;
use weft_primitives::hash::Hash;
use weft_primitives::id::DeltaId;

use crate::error::ChainError;

/// Deltas in canonical chain order: `(timestamp, delta_id)` ascending.
#[must_use]
pub fn linearized(deltas: &[Delta]) -> Vec<Delta> {
    let mut sorted = deltas.to_vec();
    sorted.sort_by_key(Delta::chain_key);
    sorted
}

/// Fold a delta sequence into its terminal state.
///
/// Pure reconstruction: sorts into chain order and applies from the
/// empty value. Hash linkage is *not* checked here; use
/// [`verify_chain`] when acceptance is at stake.
pub fn reconstruct(deltas: &[Delta]) -> Result<Value, ChainError> {
    let mut state = empty_state();
    for delta in linearized(deltas) {
        state = apply_all(&state, &delta.patch)?;
    }
    Ok(state)
}

/// Where verification stopped, if it did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainFailure {
    /// Index into the linearized sequence.
    pub index: usize,
    pub error: ChainError,
}

/// Outcome of verifying one entity's chain.
#[derive(Clone, Debug)]
pub struct ChainReport {
    /// Deltas accepted before the first failure (all, when valid).
    pub accepted: usize,
    /// Hash after the last accepted delta.
    pub head_hash: Hash,
    /// State after the last accepted delta.
    pub state: Value,
    pub failure: Option<ChainFailure>,
}

impl ChainReport {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.failure.is_none()
    }
}

/// Verify an entity's chain end to end.
///
/// Sorts into chain order, then for each delta checks the `prev_hash`
/// link, applies the patch, and re-derives the declared `new_hash`.
/// Stops at the first failure.
#[must_use]
pub fn verify_chain(deltas: &[Delta]) -> ChainReport {
    let ordered = linearized(deltas);
    let mut state = empty_state();
    let mut expected_prev = Hash::genesis();

    for (index, delta) in ordered.iter().enumerate() {
        if delta.prev_hash != expected_prev {
            return ChainReport {
                accepted: index,
                head_hash: expected_prev,
                state,
                failure: Some(ChainFailure {
                    index,
                    error: ChainError::BrokenLink {
                        delta_id: delta.delta_id,
                        expected: expected_prev,
                        actual: delta.prev_hash,
                    },
                }),
            };
        }

        let next = match apply_all(&state, &delta.patch) {
            Ok(next) => next,
            Err(err) => {
                return ChainReport {
                    accepted: index,
                    head_hash: expected_prev,
                    state,
                    failure: Some(ChainFailure {
                        index,
                        error: err.into(),
                    }),
                };
            }
        };

        let computed = canonical_hash(&next);
        if computed != delta.new_hash {
            return ChainReport {
                accepted: index,
                head_hash: expected_prev,
                state,
                failure: Some(ChainFailure {
                    index,
                    error: ChainError::HashMismatch {
                        delta_id: delta.delta_id,
                        computed,
                        declared: delta.new_hash,
                    },
                }),
            };
        }

        state = next;
        expected_prev = computed;
    }

    ChainReport {
        accepted: ordered.len(),
        head_hash: expected_prev,
        state,
        failure: None,
    }
}

/// A group of deltas sharing one parent hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkGroup {
    pub prev_hash: Hash,
    pub delta_ids: Vec<DeltaId>,
}

/// Scan a delta set for forks: distinct deltas sharing a `prev_hash`.
///
/// The scan reports every group rather than silently ordering them; at
/// most one branch may be linearized without a resolution delta.
#[must_use]
pub fn scan_forks(deltas: &[Delta]) -> Vec<ForkGroup> {
    let mut groups: Vec<ForkGroup> = Vec::new();
    for delta in linearized(deltas) {
        match groups.iter_mut().find(|g| g.prev_hash == delta.prev_hash) {
            Some(group) => {
                if !group.delta_ids.contains(&delta.delta_id) {
                    group.delta_ids.push(delta.delta_id);
                }
            }
            None => groups.push(ForkGroup {
                prev_hash: delta.prev_hash,
                delta_ids: vec![delta.delta_id],
            }),
        }
    }
    groups.retain(|g| g.delta_ids.len() > 1);
    groups
}
