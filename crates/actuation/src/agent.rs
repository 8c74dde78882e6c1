//! The device agent: the only writer of actuator state.
//!
//! Runs on each node that owns actuators. Each tick it picks up
//! AUTHORIZED intents for locally-owned actuators (plus DISPATCHED
//! ones left behind by a crash), drives the executor, and writes the
//! results back as ordinary entity deltas: the intent's terminal
//! transition, the actuator-state update, and the receipt entity.
//!
//! The idempotency barrier is checked before anything else: an intent
//! already named by `last_applied_intent_id` or already holding a
//! receipt is skipped and counted, never re-executed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::thread_rng;
use serde_json::json;
use tracing::{debug, warn};
use weft_chain::EntityStore;
use weft_primitives::actuation::{
    ActuationAction, ActuationIntent, ActuationReceipt, ActuatorKind, ActuatorState,
    ActuatorStateKind, IntentStatus, ReceiptOutcome,
};
use weft_primitives::entity::{Author, EntityKind};
use weft_primitives::id::{DeltaId, EntityId, IntentId, NodeId};
use weft_primitives::time::Timestamp;

use crate::error::ActuationError;
use crate::machine::transition_patch;
use crate::store::{IntentRecord, IntentStore};

/// Reason recorded when the expiry sweep ages out an intent.
pub const TTL_EXCEEDED: &str = "TTL_EXCEEDED";

/// What the local executor observed after carrying out a command.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorOutcome {
    pub observed_state: ActuatorStateKind,
    pub observed_value: Option<f64>,
    pub ok: bool,
    pub error: Option<String>,
}

impl ExecutorOutcome {
    #[must_use]
    pub const fn success(observed_state: ActuatorStateKind, observed_value: Option<f64>) -> Self {
        Self {
            observed_state,
            observed_value,
            ok: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            observed_state: ActuatorStateKind::Error,
            observed_value: None,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Capability interface to the physical (or software) device driver.
///
/// Implementations are assumed single-threaded per device and owned by
/// the agent; this is the only suspension point in the actuation path.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        kind: ActuatorKind,
        action: ActuationAction,
        value: Option<f64>,
    ) -> ExecutorOutcome;
}

/// Scoped executor slot, held from dispatch to terminal transition.
#[derive(Debug)]
struct ExecutorLease {
    in_flight: Arc<AtomicUsize>,
}

impl ExecutorLease {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
        Self {
            in_flight: Arc::clone(counter),
        }
    }
}

impl Drop for ExecutorLease {
    fn drop(&mut self) {
        let _ = self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Cumulative agent counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentStats {
    pub applied: u64,
    pub failed: u64,
    pub duplicates_prevented: u64,
    pub expired_swept: u64,
}

/// What one tick did; latencies feed the node's median tracker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub applied: usize,
    pub failed: usize,
    pub duplicates_prevented: usize,
    pub apply_latencies_ms: Vec<u64>,
    /// Intents that reached a terminal status this tick.
    pub terminal: Vec<(EntityId, IntentStatus)>,
}

pub struct DeviceAgent {
    node_id: NodeId,
    stats: AgentStats,
    in_flight: Arc<AtomicUsize>,
}

impl core::fmt::Debug for DeviceAgent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceAgent")
            .field("node_id", &self.node_id)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl DeviceAgent {
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            stats: AgentStats::default(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &AgentStats {
        &self.stats
    }

    /// One scheduling pass over actionable intents.
    pub async fn tick(
        &mut self,
        store: &mut EntityStore,
        intents: &mut IntentStore,
        executor: &dyn Executor,
        now: Timestamp,
    ) -> Result<TickReport, ActuationError> {
        let mut report = TickReport::default();

        let mut candidates: Vec<IntentRecord> = intents
            .by_status(IntentStatus::Authorized)
            .into_iter()
            .chain(intents.by_status(IntentStatus::Dispatched))
            .filter(|r| {
                intents
                    .actuator(&r.state.actuator_id)
                    .is_some_and(|a| a.state.owner_node_id == self.node_id)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|r| (r.state.created_at, r.entity_id));

        for record in candidates {
            let intent_id: IntentId = record.entity_id.into();
            let Some(actuator) = intents.actuator(&record.state.actuator_id).cloned() else {
                continue;
            };
            let Some(state_entity_id) = actuator.state_entity_id else {
                warn!(actuator = %actuator.entity_id, "no state entity, skipping intent");
                continue;
            };
            let actuator_state: ActuatorState = decode_state(store, &state_entity_id)?;

            // The idempotency barrier: one APPLIED, one receipt, ever.
            if actuator_state.last_applied_intent_id == Some(intent_id)
                || intents.receipt_for_intent(&intent_id).is_some()
            {
                self.stats.duplicates_prevented += 1;
                report.duplicates_prevented += 1;
                debug!(intent = %intent_id, "duplicate prevented");
                continue;
            }

            let lease = ExecutorLease::acquire(&self.in_flight);

            // A DISPATCHED candidate is a crash resume: skip straight
            // to execution.
            let mut current = record.state.clone();
            if current.status == IntentStatus::Authorized {
                current = self.transition(
                    store,
                    intents,
                    record.entity_id,
                    &current,
                    IntentStatus::Dispatched,
                    None,
                    now,
                )?;
                report.dispatched += 1;
            }

            let outcome = executor
                .execute(
                    actuator.state.kind,
                    current.request.action,
                    current.request.value,
                )
                .await;

            let (terminal, reason) = if outcome.ok {
                (IntentStatus::Applied, None)
            } else {
                (
                    IntentStatus::Failed,
                    Some(
                        outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "executor failed".to_owned()),
                    ),
                )
            };
            let _ = self.transition(
                store,
                intents,
                record.entity_id,
                &current,
                terminal,
                reason.as_deref(),
                now,
            )?;

            self.write_actuator_state(store, &state_entity_id, &outcome, intent_id, now)?;
            self.write_receipt(store, intents, &record, &actuator.entity_id, &outcome, now)?;

            if outcome.ok {
                self.stats.applied += 1;
                report.applied += 1;
            } else {
                self.stats.failed += 1;
                report.failed += 1;
            }
            report.terminal.push((record.entity_id, terminal));
            report
                .apply_latencies_ms
                .push(now.saturating_sub(current.created_at));
            drop(lease);
        }

        Ok(report)
    }

    /// Age out every non-terminal intent past its deadline.
    pub fn sweep_expired(
        &mut self,
        store: &mut EntityStore,
        intents: &mut IntentStore,
        now: Timestamp,
    ) -> Result<usize, ActuationError> {
        let mut expired: Vec<IntentRecord> = vec![];
        for status in [
            IntentStatus::New,
            IntentStatus::Authorized,
            IntentStatus::Dispatched,
        ] {
            expired.extend(
                intents
                    .by_status(status)
                    .into_iter()
                    .filter(|r| now > r.state.expires_at)
                    .cloned(),
            );
        }

        for record in &expired {
            let _ = self.transition(
                store,
                intents,
                record.entity_id,
                &record.state,
                IntentStatus::Expired,
                Some(TTL_EXCEEDED),
                now,
            )?;
            self.stats.expired_swept += 1;
        }
        Ok(expired.len())
    }

    /// Apply one machine transition as a delta and refresh the index.
    #[allow(clippy::too_many_arguments)]
    fn transition(
        &self,
        store: &mut EntityStore,
        intents: &mut IntentStore,
        entity_id: EntityId,
        current: &ActuationIntent,
        to: IntentStatus,
        reason: Option<&str>,
        now: Timestamp,
    ) -> Result<ActuationIntent, ActuationError> {
        let patch = transition_patch(current.status, to, reason)?;
        let delta = store.extend_entity(
            entity_id,
            DeltaId::random(&mut thread_rng()),
            patch,
            Author::DeviceAgent,
            now,
        )?;

        let mut next = current.clone();
        next.status = to;
        if let Some(reason) = reason {
            next.reason = Some(reason.to_owned());
        }
        intents.upsert_intent(entity_id, next.clone(), delta.new_hash);
        debug!(intent = %entity_id, from = ?current.status, ?to, "intent transition");
        Ok(next)
    }

    fn write_actuator_state(
        &self,
        store: &mut EntityStore,
        state_entity_id: &EntityId,
        outcome: &ExecutorOutcome,
        intent_id: IntentId,
        now: Timestamp,
    ) -> Result<(), ActuationError> {
        let mut patch = vec![
            weft_primitives::delta::PatchOp::add("/state", json!(outcome.observed_state)),
            weft_primitives::delta::PatchOp::add("/updated_at", json!(now)),
            weft_primitives::delta::PatchOp::add("/last_applied_intent_id", json!(intent_id)),
        ];
        if let Some(value) = outcome.observed_value {
            patch.push(weft_primitives::delta::PatchOp::add("/value", json!(value)));
        }
        let _ = store.extend_entity(
            *state_entity_id,
            DeltaId::random(&mut thread_rng()),
            patch,
            Author::DeviceAgent,
            now,
        )?;
        Ok(())
    }

    fn write_receipt(
        &self,
        store: &mut EntityStore,
        intents: &mut IntentStore,
        record: &IntentRecord,
        actuator_entity_id: &EntityId,
        outcome: &ExecutorOutcome,
        now: Timestamp,
    ) -> Result<(), ActuationError> {
        let receipt = ActuationReceipt {
            intent_id: record.entity_id.into(),
            actuator_id: *actuator_entity_id,
            owner_node_id: self.node_id,
            outcome: if outcome.ok {
                ReceiptOutcome::Applied
            } else {
                ReceiptOutcome::Failed
            },
            observed_state: outcome.observed_state,
            observed_value: outcome.observed_value,
            created_at: now,
        };

        let mut rng = thread_rng();
        let entity_id = EntityId::random(&mut rng);
        let initial = serde_json::to_value(&receipt)
            .map_err(|e| ActuationError::BadEntityState(e.to_string()))?;
        let (entity, _) = store.create_entity(
            entity_id,
            DeltaId::random(&mut rng),
            EntityKind::ActuationReceipt,
            &initial,
            Author::DeviceAgent,
            now,
        )?;
        intents.register_receipt(entity_id, receipt, entity.current_hash)?;
        Ok(())
    }
}

fn decode_state(
    store: &EntityStore,
    entity_id: &EntityId,
) -> Result<ActuatorState, ActuationError> {
    let log = store
        .get(entity_id)
        .ok_or(ActuationError::MissingActuatorState(*entity_id))?;
    serde_json::from_value(log.state().clone())
        .map_err(|e| ActuationError::BadEntityState(e.to_string()))
}

/// Executor double for tests: scripted outcomes, recorded calls.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::{
        async_trait, ActuationAction, ActuatorKind, ActuatorStateKind, Executor, ExecutorOutcome,
    };

    #[derive(Debug, Default)]
    pub struct ScriptedExecutor {
        script: Mutex<VecDeque<ExecutorOutcome>>,
        calls: Mutex<Vec<(ActuatorKind, ActuationAction, Option<f64>)>>,
    }

    impl ScriptedExecutor {
        /// Succeeds forever, deriving the observed state from the action.
        #[must_use]
        pub fn ok() -> Self {
            Self::default()
        }

        /// Plays `outcomes` in order, then falls back to the default.
        #[must_use]
        pub fn scripted(outcomes: Vec<ExecutorOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                calls: Mutex::new(vec![]),
            }
        }

        pub fn calls(&self) -> Vec<(ActuatorKind, ActuationAction, Option<f64>)> {
            self.calls.lock().expect("executor call log poisoned").clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            kind: ActuatorKind,
            action: ActuationAction,
            value: Option<f64>,
        ) -> ExecutorOutcome {
            self.calls
                .lock()
                .expect("executor call log poisoned")
                .push((kind, action, value));
            if let Some(next) = self
                .script
                .lock()
                .expect("executor script poisoned")
                .pop_front()
            {
                return next;
            }
            match action {
                ActuationAction::SetOn => {
                    ExecutorOutcome::success(ActuatorStateKind::On, None)
                }
                ActuationAction::SetOff => {
                    ExecutorOutcome::success(ActuatorStateKind::Off, None)
                }
                ActuationAction::SetValue => {
                    ExecutorOutcome::success(ActuatorStateKind::On, value)
                }
            }
        }
    }
}
