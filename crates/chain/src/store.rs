//! The entity/delta store.
//!
//! One [`EntityLog`] per entity: header, chain-ordered deltas, and the
//! materialized current state. The store is the single writer for all
//! of them; everything that mutates an entity (local creates and
//! extends, sync acceptance, actuation transitions) funnels through
//! here so that hash re-derivation happens in exactly one place.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use weft_patch::{apply_all, canonical_hash, empty_state};
use weft_primitives::delta::{Delta, PatchOp};
use weft_primitives::entity::{Author, Entity, EntityKind};
use weft_primitives::hash::Hash;
use weft_primitives::id::{DeltaId, EntityId};
use weft_primitives::sync::EntityHead;
use weft_primitives::time::Timestamp;

use crate::error::ChainError;

/// Everything the store holds for one entity.
#[derive(Clone, Debug)]
pub struct EntityLog {
    entity: Entity,
    deltas: Vec<Delta>,
    state: Value,
}

impl EntityLog {
    #[must_use]
    pub const fn entity(&self) -> &Entity {
        &self.entity
    }

    #[must_use]
    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    #[must_use]
    pub const fn state(&self) -> &Value {
        &self.state
    }

    #[must_use]
    pub const fn head_hash(&self) -> Hash {
        self.entity.current_hash
    }

    /// The suffix of the chain strictly after the delta whose
    /// `new_hash` equals `since`. Genesis means the whole chain.
    /// `None` means `since` is not on this chain, a divergence signal.
    #[must_use]
    pub fn deltas_since(&self, since: &Hash) -> Option<&[Delta]> {
        if since.is_genesis() {
            return Some(&self.deltas);
        }
        self.deltas
            .iter()
            .position(|d| d.new_hash == *since)
            .map(|i| &self.deltas[i + 1..])
    }

    fn contains_delta(&self, delta_id: &DeltaId) -> bool {
        self.deltas.iter().any(|d| d.delta_id == *delta_id)
    }
}

/// Result of feeding one remote delta into the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Linked, re-hashed and materialized.
    Applied,
    /// Delta id already present on the chain; idempotent no-op.
    AlreadyKnown,
}

/// Async persistence seam behind the store.
///
/// The store itself is the in-memory working set; a journal sees every
/// accepted delta (with the entity header and post-state) before the
/// mutation is acknowledged. Backends are out of scope here.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn record(
        &self,
        entity: &Entity,
        delta: &Delta,
        state: &Value,
    ) -> Result<(), JournalError>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    #[error("failed to journal delta: {0}")]
    Backend(String),
}

/// A journal that drops everything. The default for nodes that hold
/// state in memory only.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullJournal;

#[async_trait]
impl Journal for NullJournal {
    async fn record(
        &self,
        _entity: &Entity,
        _delta: &Delta,
        _state: &Value,
    ) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Point-in-time counters, snapshot-cloned on read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainStats {
    pub entity_count: usize,
    pub delta_count: usize,
    pub deltas_appended: u64,
}

/// The in-memory entity store. Single-writer: owned by the node's core
/// loop, mutated only between suspension points.
#[derive(Debug, Default)]
pub struct EntityStore {
    logs: HashMap<EntityId, EntityLog>,
    deltas_appended: u64,
}

impl EntityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity from an initial object.
    ///
    /// The creation delta carries one `add` per top-level field (sorted
    /// by key), its `prev_hash` is genesis, and its `new_hash` is the
    /// canonical hash of the initial state.
    pub fn create_entity(
        &mut self,
        id: EntityId,
        delta_id: DeltaId,
        kind: EntityKind,
        initial: &Value,
        author: Author,
        now: Timestamp,
    ) -> Result<(Entity, Delta), ChainError> {
        if self.logs.contains_key(&id) {
            return Err(ChainError::EntityExists(id));
        }
        let Value::Object(fields) = initial else {
            return Err(ChainError::InitialNotObject);
        };

        let patch: Vec<PatchOp> = fields
            .iter()
            .map(|(key, value)| PatchOp::add(format!("/{key}"), value.clone()))
            .collect();
        let state = apply_all(&empty_state(), &patch)?;
        let new_hash = canonical_hash(&state);

        let mut entity = Entity::new(id, kind, now);
        entity.current_version = 1;
        entity.current_hash = new_hash;

        let delta = Delta {
            delta_id,
            entity_id: id,
            timestamp: now,
            author,
            patch,
            prev_hash: Hash::genesis(),
            new_hash,
        };

        debug!(entity_id = %id, ?kind, "created entity");
        let _ = self.logs.insert(
            id,
            EntityLog {
                entity: entity.clone(),
                deltas: vec![delta.clone()],
                state,
            },
        );
        self.deltas_appended += 1;

        Ok((entity, delta))
    }

    /// Append a locally-authored delta to an entity's chain.
    ///
    /// Per-entity delta timestamps are strictly monotonic: a
    /// same-millisecond extend is nudged forward one tick so canonical
    /// `(timestamp, delta_id)` order always agrees with chain order.
    pub fn extend_entity(
        &mut self,
        entity_id: EntityId,
        delta_id: DeltaId,
        patch: Vec<PatchOp>,
        author: Author,
        now: Timestamp,
    ) -> Result<Delta, ChainError> {
        let log = self
            .logs
            .get_mut(&entity_id)
            .ok_or(ChainError::UnknownEntity(entity_id))?;

        let now = match log.deltas.last() {
            Some(last) if now <= last.timestamp => last.timestamp + 1,
            _ => now,
        };
        let new_state = apply_all(&log.state, &patch)?;
        let new_hash = canonical_hash(&new_state);

        let delta = Delta {
            delta_id,
            entity_id,
            timestamp: now,
            author,
            patch,
            prev_hash: log.entity.current_hash,
            new_hash,
        };

        log.deltas.push(delta.clone());
        log.state = new_state;
        log.entity.current_version += 1;
        log.entity.current_hash = new_hash;
        self.deltas_appended += 1;

        debug!(%entity_id, version = log.entity.current_version, "extended entity");
        Ok(delta)
    }

    /// Accept a delta produced elsewhere (sync, replay).
    ///
    /// Runs the full chain check: linkage against the current head,
    /// patch application, and re-derivation of the declared post-hash.
    /// A delta that shares its `prev_hash` with an existing delta but
    /// differs in id is reported as a fork, not applied.
    pub fn ingest_delta(
        &mut self,
        kind: EntityKind,
        delta: &Delta,
    ) -> Result<IngestOutcome, ChainError> {
        match self.logs.get_mut(&delta.entity_id) {
            None => {
                if !delta.is_creation() {
                    return Err(ChainError::MissingCreation {
                        entity_id: delta.entity_id,
                        delta_id: delta.delta_id,
                    });
                }
                let state = apply_all(&empty_state(), &delta.patch)?;
                let computed = canonical_hash(&state);
                if computed != delta.new_hash {
                    return Err(ChainError::HashMismatch {
                        delta_id: delta.delta_id,
                        computed,
                        declared: delta.new_hash,
                    });
                }

                let mut entity = Entity::new(delta.entity_id, kind, delta.timestamp);
                entity.current_version = 1;
                entity.current_hash = computed;

                let _ = self.logs.insert(
                    delta.entity_id,
                    EntityLog {
                        entity,
                        deltas: vec![delta.clone()],
                        state,
                    },
                );
                self.deltas_appended += 1;
                Ok(IngestOutcome::Applied)
            }
            Some(log) => {
                if log.contains_delta(&delta.delta_id) {
                    return Ok(IngestOutcome::AlreadyKnown);
                }

                if delta.prev_hash == log.entity.current_hash {
                    let new_state = apply_all(&log.state, &delta.patch)?;
                    let computed = canonical_hash(&new_state);
                    if computed != delta.new_hash {
                        return Err(ChainError::HashMismatch {
                            delta_id: delta.delta_id,
                            computed,
                            declared: delta.new_hash,
                        });
                    }

                    log.deltas.push(delta.clone());
                    log.state = new_state;
                    log.entity.current_version += 1;
                    log.entity.current_hash = computed;
                    self.deltas_appended += 1;
                    return Ok(IngestOutcome::Applied);
                }

                // Same parent as an existing delta, different id: fork.
                if let Some(existing) = log.deltas.iter().find(|d| d.prev_hash == delta.prev_hash)
                {
                    return Err(ChainError::Fork {
                        entity_id: delta.entity_id,
                        prev_hash: delta.prev_hash,
                        first: existing.delta_id,
                        second: delta.delta_id,
                    });
                }

                Err(ChainError::BrokenLink {
                    delta_id: delta.delta_id,
                    expected: log.entity.current_hash,
                    actual: delta.prev_hash,
                })
            }
        }
    }

    /// Replace the chain suffix after `base_hash` with `branch`.
    ///
    /// Used by conflict resolution when the losing side must adopt the
    /// other branch before the resolution delta lands. Each branch
    /// delta is re-verified as it is appended; on any failure the log
    /// is left unchanged.
    pub fn adopt_branch(
        &mut self,
        entity_id: EntityId,
        base_hash: &Hash,
        branch: &[Delta],
    ) -> Result<(), ChainError> {
        let log = self
            .logs
            .get(&entity_id)
            .ok_or(ChainError::UnknownEntity(entity_id))?;

        let keep = if base_hash.is_genesis() {
            0
        } else {
            log.deltas
                .iter()
                .position(|d| d.new_hash == *base_hash)
                .map(|i| i + 1)
                .ok_or(ChainError::BrokenLink {
                    delta_id: branch.first().map_or(DeltaId::from_bytes([0; 16]), |d| d.delta_id),
                    expected: *base_hash,
                    actual: log.entity.current_hash,
                })?
        };

        // Rebuild on a scratch copy so failures leave the log intact.
        let mut rebuilt_state = empty_state();
        let mut rebuilt: Vec<Delta> = Vec::with_capacity(keep + branch.len());
        let mut expected_prev = Hash::genesis();

        for delta in log.deltas.iter().take(keep).chain(branch.iter()) {
            if delta.prev_hash != expected_prev {
                return Err(ChainError::BrokenLink {
                    delta_id: delta.delta_id,
                    expected: expected_prev,
                    actual: delta.prev_hash,
                });
            }
            rebuilt_state = apply_all(&rebuilt_state, &delta.patch)?;
            let computed = canonical_hash(&rebuilt_state);
            if computed != delta.new_hash {
                return Err(ChainError::HashMismatch {
                    delta_id: delta.delta_id,
                    computed,
                    declared: delta.new_hash,
                });
            }
            expected_prev = computed;
            rebuilt.push(delta.clone());
        }

        let log = self
            .logs
            .get_mut(&entity_id)
            .ok_or(ChainError::UnknownEntity(entity_id))?;
        log.entity.current_version = rebuilt.len() as u64;
        log.entity.current_hash = expected_prev;
        log.deltas = rebuilt;
        log.state = rebuilt_state;

        debug!(%entity_id, head = %expected_prev, "adopted branch");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<&EntityLog> {
        self.logs.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.logs.contains_key(id)
    }

    /// Current chain tips for every entity, for a HEADS exchange.
    /// Sorted by entity id so packets are deterministic.
    #[must_use]
    pub fn heads(&self) -> Vec<EntityHead> {
        let mut heads: Vec<EntityHead> =
            self.logs.values().map(|log| (&log.entity).into()).collect();
        heads.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        heads
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityLog> {
        self.logs.values()
    }

    #[must_use]
    pub fn stats(&self) -> ChainStats {
        ChainStats {
            entity_count: self.logs.len(),
            delta_count: self.logs.values().map(|l| l.deltas.len()).sum(),
            deltas_appended: self.deltas_appended,
        }
    }
}
