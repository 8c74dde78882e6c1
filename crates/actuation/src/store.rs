//! Typed indexes over actuation entities.
//!
//! The chain store holds the authoritative state; this store holds
//! O(1)-registration indexes the policy engine and device agent query:
//! intents and receipts by id, receipts by intent (unique), intents by
//! actuator and status, actuators by owner.

use std::collections::HashMap;

use weft_primitives::actuation::{ActuationIntent, ActuationReceipt, Actuator, IntentStatus};
use weft_primitives::hash::Hash;
use weft_primitives::id::{EntityId, IntentId, NodeId};

use crate::error::ActuationError;

#[derive(Clone, Debug)]
pub struct IntentRecord {
    pub entity_id: EntityId,
    pub state: ActuationIntent,
    pub hash: Hash,
}

#[derive(Clone, Debug)]
pub struct ReceiptRecord {
    pub entity_id: EntityId,
    pub state: ActuationReceipt,
    pub hash: Hash,
}

#[derive(Clone, Debug)]
pub struct ActuatorRecord {
    pub entity_id: EntityId,
    pub state_entity_id: Option<EntityId>,
    pub state: Actuator,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IntentStoreStats {
    pub intents: usize,
    pub receipts: usize,
    pub actuators: usize,
}

/// All registrations are O(1); queries are bounded by category size.
#[derive(Debug, Default)]
pub struct IntentStore {
    intents: HashMap<IntentId, IntentRecord>,
    receipts: HashMap<EntityId, ReceiptRecord>,
    receipts_by_intent: HashMap<IntentId, EntityId>,
    actuators: HashMap<EntityId, ActuatorRecord>,
}

impl IntentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh an actuator known to this node.
    pub fn register_actuator(&mut self, entity_id: EntityId, state: Actuator) {
        let state_entity_id = self
            .actuators
            .get(&entity_id)
            .and_then(|r| r.state_entity_id);
        let _ = self.actuators.insert(
            entity_id,
            ActuatorRecord {
                entity_id,
                state_entity_id,
                state,
            },
        );
    }

    /// Remember which `actuator_state` entity mirrors an actuator.
    pub fn link_state_entity(
        &mut self,
        actuator_entity_id: EntityId,
        state_entity_id: EntityId,
    ) -> Result<(), ActuationError> {
        let record = self
            .actuators
            .get_mut(&actuator_entity_id)
            .ok_or(ActuationError::UnknownActuator(actuator_entity_id))?;
        record.state_entity_id = Some(state_entity_id);
        Ok(())
    }

    #[must_use]
    pub fn actuator(&self, entity_id: &EntityId) -> Option<&ActuatorRecord> {
        self.actuators.get(entity_id)
    }

    #[must_use]
    pub fn actuators_owned_by(&self, node_id: &NodeId) -> Vec<&ActuatorRecord> {
        self.actuators
            .values()
            .filter(|r| r.state.owner_node_id == *node_id)
            .collect()
    }

    /// Register a new intent or refresh one after a transition.
    pub fn upsert_intent(&mut self, entity_id: EntityId, state: ActuationIntent, hash: Hash) {
        let _ = self.intents.insert(
            entity_id.into(),
            IntentRecord {
                entity_id,
                state,
                hash,
            },
        );
    }

    #[must_use]
    pub fn intent(&self, intent_id: &IntentId) -> Option<&IntentRecord> {
        self.intents.get(intent_id)
    }

    #[must_use]
    pub fn by_status(&self, status: IntentStatus) -> Vec<&IntentRecord> {
        let mut records: Vec<&IntentRecord> = self
            .intents
            .values()
            .filter(|r| r.state.status == status)
            .collect();
        records.sort_by_key(|r| (r.state.created_at, r.entity_id));
        records
    }

    #[must_use]
    pub fn by_actuator(&self, actuator_entity_id: &EntityId) -> Vec<&IntentRecord> {
        self.intents
            .values()
            .filter(|r| r.state.actuator_id == *actuator_entity_id)
            .collect()
    }

    /// Intents whose actuator is owned by `node_id`.
    #[must_use]
    pub fn by_owner(&self, node_id: &NodeId) -> Vec<&IntentRecord> {
        self.intents
            .values()
            .filter(|r| {
                self.actuators
                    .get(&r.state.actuator_id)
                    .is_some_and(|a| a.state.owner_node_id == *node_id)
            })
            .collect()
    }

    /// Register the unique receipt for an intent.
    pub fn register_receipt(
        &mut self,
        entity_id: EntityId,
        state: ActuationReceipt,
        hash: Hash,
    ) -> Result<(), ActuationError> {
        let intent_id = state.intent_id;
        if self.receipts_by_intent.contains_key(&intent_id) {
            return Err(ActuationError::DuplicateReceipt(intent_id));
        }
        let _ = self.receipts_by_intent.insert(intent_id, entity_id);
        let _ = self.receipts.insert(
            entity_id,
            ReceiptRecord {
                entity_id,
                state,
                hash,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn receipt(&self, entity_id: &EntityId) -> Option<&ReceiptRecord> {
        self.receipts.get(entity_id)
    }

    #[must_use]
    pub fn receipt_for_intent(&self, intent_id: &IntentId) -> Option<&ReceiptRecord> {
        self.receipts_by_intent
            .get(intent_id)
            .and_then(|entity_id| self.receipts.get(entity_id))
    }

    #[must_use]
    pub fn stats(&self) -> IntentStoreStats {
        IntentStoreStats {
            intents: self.intents.len(),
            receipts: self.receipts.len(),
            actuators: self.actuators.len(),
        }
    }
}
