//! The orchestrator: wires every engine together and exposes the
//! programmatic surface.
//!
//! All state lives behind `&mut self`; the node is meant to be driven
//! by one task (the core loop). Suspension points are the journal
//! writes and the executor call inside the device agent tick;
//! everything else is synchronous with respect to the loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, eyre, Result as EyreResult, WrapErr};
use rand::thread_rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use weft_actuation::agent::Executor;
use weft_actuation::machine::transition_patch;
use weft_actuation::{DeviceAgent, IntentStore, PolicyContext, PolicyEngine};
use weft_chain::conflict::{plan_resolution, ConflictStore, ResolutionKind};
use weft_chain::store::{Journal, NullJournal};
use weft_chain::EntityStore;
use weft_primitives::actuation::{
    ActuationAction, ActuationIntent, ActuationRequest, ActuatorState, IntentPolicy, IntentStatus,
};
use weft_primitives::delta::{Delta, PatchOp};
use weft_primitives::entity::{Author, Entity, EntityKind, SystemMode};
use weft_primitives::hash::Hash;
use weft_primitives::id::{ConflictId, DeltaId, EntityId, IntentId, NodeId, SessionId};
use weft_primitives::identity::PrivateKey;
use weft_primitives::sync::{Capabilities, PeerWatermark, SyncNodeInfo};
use weft_primitives::time::Timestamp;
use weft_sync::session::{SenderLease, SessionSetup, SyncSession};
use weft_sync::{Packet, PacketBody, SessionState};

use crate::config::NodeConfig;
use crate::events::{EventDispatcher, NodeEvent, NullDispatcher};
use crate::metrics::Metrics;

/// Reason recorded when a caller cancels an intent.
pub const CANCELLED: &str = "CANCELLED";

/// Options accepted by [`Node::request_intent`].
#[derive(Clone, Debug, Default)]
pub struct IntentOptions {
    /// TTL override; the configured default applies when absent.
    pub ttl_ms: Option<u64>,
    pub requires_human_confirm: bool,
    /// Who asked. Defaults to the interactive user.
    pub actor: Option<Author>,
}

pub struct Node {
    info: SyncNodeInfo,
    signing_key: PrivateKey,
    config: NodeConfig,
    store: EntityStore,
    conflicts: ConflictStore,
    intents: IntentStore,
    policy: PolicyEngine,
    agent: DeviceAgent,
    executor: Option<Arc<dyn Executor>>,
    journal: Arc<dyn Journal>,
    dispatcher: Arc<dyn EventDispatcher>,
    peers: HashMap<NodeId, SyncNodeInfo>,
    watermarks: HashMap<NodeId, PeerWatermark>,
    sessions: HashMap<SessionId, SyncSession>,
    finalized_sessions: HashSet<SessionId>,
    active_senders: Arc<AtomicUsize>,
    announced_conflicts: HashSet<ConflictId>,
    system_entity: Option<EntityId>,
    metrics: Metrics,
    manual_now: Option<Timestamp>,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.info.node_id)
            .field("name", &self.info.node_name)
            .finish_non_exhaustive()
    }
}

impl Node {
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        let mut rng = thread_rng();
        let signing_key = PrivateKey::random(&mut rng);
        let node_id = NodeId::random(&mut rng);
        let info = SyncNodeInfo {
            node_id,
            node_name: config.node_name.clone(),
            public_key: signing_key.public_key(),
            created_at: Timestamp::now(),
            capabilities: Capabilities {
                protocol_version: config.protocol_version.clone(),
                max_packet_bytes: config.sync.max_packet_bytes,
                supports_chunking: config.sync.supports_chunking,
                supports_signing: config.sync.supports_signing,
            },
        };
        info!(%node_id, name = %config.node_name, "node created");

        Self {
            info,
            signing_key,
            policy: PolicyEngine::new(config.actuation.clone()),
            agent: DeviceAgent::new(node_id),
            config,
            store: EntityStore::new(),
            conflicts: ConflictStore::new(),
            intents: IntentStore::new(),
            executor: None,
            journal: Arc::new(NullJournal),
            dispatcher: Arc::new(NullDispatcher),
            peers: HashMap::new(),
            watermarks: HashMap::new(),
            sessions: HashMap::new(),
            finalized_sessions: HashSet::new(),
            active_senders: Arc::new(AtomicUsize::new(0)),
            announced_conflicts: HashSet::new(),
            system_entity: None,
            metrics: Metrics::default(),
            manual_now: None,
        }
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    #[must_use]
    pub fn node_info(&self) -> &SyncNodeInfo {
        &self.info
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    // ── clock ────────────────────────────────────────────────

    /// Pin the node's clock for deterministic tests.
    pub fn set_clock(&mut self, now: Timestamp) {
        self.manual_now = Some(now);
    }

    /// Advance a pinned clock.
    pub fn advance_clock(&mut self, millis: u64) {
        if let Some(now) = self.manual_now {
            self.manual_now = Some(now + millis);
        }
    }

    fn now(&self) -> Timestamp {
        self.manual_now.unwrap_or_else(Timestamp::now)
    }

    // ── entity surface ───────────────────────────────────────

    pub async fn create_entity(
        &mut self,
        kind: EntityKind,
        initial: &Value,
        author: Author,
    ) -> EyreResult<(Entity, Delta)> {
        let mut rng = thread_rng();
        let id = EntityId::random(&mut rng);
        let delta_id = DeltaId::random(&mut rng);
        let now = self.now();

        let (entity, delta) = self
            .store
            .create_entity(id, delta_id, kind, initial, author, now)
            .wrap_err("creating entity")?;
        self.journal_and_announce(&entity, &delta).await?;
        self.metrics.chain.entities_created += 1;
        self.metrics.chain.deltas_appended += 1;
        self.index_entity(id);
        Ok((entity, delta))
    }

    pub async fn extend_entity(
        &mut self,
        entity_id: EntityId,
        patch: Vec<PatchOp>,
        author: Author,
    ) -> EyreResult<Delta> {
        let now = self.now();
        let delta = self
            .store
            .extend_entity(
                entity_id,
                DeltaId::random(&mut thread_rng()),
                patch,
                author,
                now,
            )
            .wrap_err("extending entity")?;
        let entity = self
            .store
            .get(&entity_id)
            .map(|log| log.entity().clone())
            .ok_or_else(|| eyre!("entity vanished mid-extend"))?;
        self.journal_and_announce(&entity, &delta).await?;
        self.metrics.chain.deltas_appended += 1;
        self.index_entity(entity_id);
        Ok(delta)
    }

    async fn journal_and_announce(&mut self, entity: &Entity, delta: &Delta) -> EyreResult<()> {
        match entity.kind {
            EntityKind::SceneTile => self.metrics.scene.tile_updates += 1,
            EntityKind::SceneObject => self.metrics.scene.object_updates += 1,
            EntityKind::SceneLight => self.metrics.scene.light_updates += 1,
            _ => {}
        }
        let state = self
            .store
            .get(&entity.id)
            .map(|log| log.state().clone())
            .unwrap_or(Value::Null);
        self.journal
            .record(entity, delta, &state)
            .await
            .wrap_err("journaling delta")?;
        let _ = self.dispatcher.dispatch(NodeEvent::DeltaApplied {
            entity_id: entity.id,
            kind: entity.kind,
            author: delta.author,
            new_hash: delta.new_hash,
        });
        Ok(())
    }

    #[must_use]
    pub fn get_entity(&self, entity_id: &EntityId) -> Option<Entity> {
        self.store.get(entity_id).map(|log| log.entity().clone())
    }

    #[must_use]
    pub fn get_state(&self, entity_id: &EntityId) -> Option<Value> {
        self.store.get(entity_id).map(|log| log.state().clone())
    }

    /// The entity's chain, optionally only strictly after `since`.
    pub fn get_deltas(
        &self,
        entity_id: &EntityId,
        since: Option<&Hash>,
    ) -> EyreResult<Vec<Delta>> {
        let log = self
            .store
            .get(entity_id)
            .ok_or_else(|| eyre!("unknown entity {entity_id}"))?;
        match since {
            None => Ok(log.deltas().to_vec()),
            Some(hash) => log
                .deltas_since(hash)
                .map(<[Delta]>::to_vec)
                .ok_or_else(|| eyre!("hash {hash} is not on the chain of {entity_id}")),
        }
    }

    /// Current operating mode, read from the `system_state` entity.
    #[must_use]
    pub fn system_mode(&self) -> SystemMode {
        self.system_entity
            .and_then(|id| self.store.get(&id))
            .and_then(|log| log.state().get("mode").cloned())
            .and_then(|mode| serde_json::from_value(mode).ok())
            .unwrap_or_default()
    }

    // ── sync surface ─────────────────────────────────────────

    pub fn register_peer(&mut self, peer: SyncNodeInfo) {
        let _ = self.peers.insert(peer.node_id, peer);
    }

    /// Open a session toward a registered peer. Returns the session id
    /// and the packets (HELLO) to ship.
    pub fn open_session(&mut self, peer_id: &NodeId) -> EyreResult<(SessionId, Vec<Packet>)> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| eyre!("unknown peer {peer_id}"))?
            .clone();
        let session_id = SessionId::random(&mut thread_rng());
        let setup = SessionSetup {
            id: session_id,
            local: self.info.clone(),
            peer,
            config: self.config.sync.clone(),
            signing_key: Some(self.signing_key.clone()),
            watermark: self.watermarks.get(peer_id).cloned().unwrap_or_default(),
            lease: SenderLease::acquire(&self.active_senders),
        };
        let (session, outbound) = SyncSession::initiate(setup).wrap_err("opening session")?;
        let _ = self.sessions.insert(session_id, session);
        self.metrics.sync.sessions_opened += 1;
        debug!(%session_id, %peer_id, "session opened");
        Ok((session_id, outbound))
    }

    /// Feed a packet to a known session.
    pub fn handle_packet(
        &mut self,
        session_id: &SessionId,
        packet: &Packet,
    ) -> EyreResult<Vec<Packet>> {
        let now = self.now();
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| eyre!("unknown session {session_id}"))?;

        let result = session.handle_packet(packet, &mut self.store, &mut self.conflicts, now);
        self.after_session_step(*session_id, result)
    }

    /// Route an inbound packet by peer: reuses the live session with
    /// that peer, or accepts a HELLO as a new one.
    pub fn route_packet(&mut self, packet: &Packet) -> EyreResult<Vec<Packet>> {
        let live = self
            .sessions
            .iter()
            .find(|(_, s)| s.peer_node_id() == packet.node_id && !s.state().is_terminal())
            .map(|(id, _)| *id);
        if let Some(session_id) = live {
            return self.handle_packet(&session_id, packet);
        }

        if !matches!(packet.body, PacketBody::Hello { .. }) {
            // Stragglers for an already-finished session drop there.
            let finished = self
                .sessions
                .iter()
                .find(|(_, s)| s.peer_node_id() == packet.node_id)
                .map(|(id, _)| *id);
            if let Some(session_id) = finished {
                return self.handle_packet(&session_id, packet);
            }
            bail!(
                "no session with {} for {}",
                packet.node_id,
                packet.body.type_name()
            );
        }
        let peer = self
            .peers
            .get(&packet.node_id)
            .ok_or_else(|| eyre!("HELLO from unregistered peer {}", packet.node_id))?
            .clone();

        let session_id = SessionId::random(&mut thread_rng());
        let setup = SessionSetup {
            id: session_id,
            local: self.info.clone(),
            peer,
            config: self.config.sync.clone(),
            signing_key: Some(self.signing_key.clone()),
            watermark: self
                .watermarks
                .get(&packet.node_id)
                .cloned()
                .unwrap_or_default(),
            lease: SenderLease::acquire(&self.active_senders),
        };
        let (session, outbound) = SyncSession::respond(setup, packet).wrap_err("accepting session")?;
        let _ = self.sessions.insert(session_id, session);
        self.metrics.sync.sessions_opened += 1;
        self.after_session_step(session_id, Ok(outbound))
    }

    /// Give every live session a chance to drain deferred work.
    pub fn advance_sessions(&mut self) -> EyreResult<Vec<(NodeId, Vec<Packet>)>> {
        let now = self.now();
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        let mut out = vec![];
        for session_id in ids {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            let peer_id = session.peer_node_id();
            let result = session.advance(&mut self.store, &mut self.conflicts, now);
            let packets = self.after_session_step(session_id, result)?;
            if !packets.is_empty() {
                out.push((peer_id, packets));
            }
        }
        Ok(out)
    }

    pub fn cancel_session(&mut self, session_id: &SessionId) -> EyreResult<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| eyre!("unknown session {session_id}"))?;
        session.cancel();
        Ok(())
    }

    #[must_use]
    pub fn session_state(&self, session_id: &SessionId) -> Option<SessionState> {
        self.sessions.get(session_id).map(SyncSession::state)
    }

    #[must_use]
    pub fn watermark(&self, peer_id: &NodeId) -> Option<&PeerWatermark> {
        self.watermarks.get(peer_id)
    }

    /// Common bookkeeping after a session consumed a packet or
    /// advanced: conflicts may have appeared, actuation entities may
    /// have landed, the session may have finished.
    fn after_session_step(
        &mut self,
        session_id: SessionId,
        result: Result<Vec<Packet>, weft_sync::SyncError>,
    ) -> EyreResult<Vec<Packet>> {
        let outbound = match result {
            Ok(outbound) => outbound,
            Err(err) => {
                if let Some(session) = self.sessions.get(&session_id) {
                    if session.state() == SessionState::Error {
                        self.metrics.sync.sessions_failed += 1;
                        let _ = self.dispatcher.dispatch(NodeEvent::SyncFailed {
                            session_id,
                            peer_id: session.peer_node_id(),
                            error: err.to_string(),
                        });
                    }
                }
                return Err(err).wrap_err("session step failed");
            }
        };

        self.refresh_indexes();
        self.announce_new_conflicts();

        if let Some(session) = self.sessions.get(&session_id) {
            if session.state() == SessionState::Complete
                && self.finalized_sessions.insert(session_id)
            {
                let stats = *session.stats();
                let peer_id = session.peer_node_id();
                let _ = self
                    .watermarks
                    .insert(peer_id, session.watermark().clone());

                self.metrics.sync.sessions_completed += 1;
                self.metrics.sync.bytes_sent += stats.bytes_sent;
                self.metrics.sync.bytes_received += stats.bytes_received;
                self.metrics.sync.deltas_sent += stats.deltas_sent;
                self.metrics.sync.deltas_received += stats.deltas_received;
                self.metrics.sync.rejects_sent += stats.rejects_sent;
                self.metrics.sync.rejects_received += stats.rejects_received;
                self.metrics.sync.chunks_sent += stats.chunks_sent;
                self.metrics.sync.chunks_received += stats.chunks_received;
                self.metrics.sync.queue_dropped += stats.queue_dropped;
                let _ = self.dispatcher.dispatch(NodeEvent::SyncCompleted {
                    session_id,
                    peer_id,
                    deltas_sent: stats.deltas_sent,
                    deltas_received: stats.deltas_received,
                });
            }
        }
        Ok(outbound)
    }

    fn announce_new_conflicts(&mut self) {
        let fresh: Vec<(ConflictId, EntityId)> = self
            .conflicts
            .iter()
            .filter(|c| !self.announced_conflicts.contains(&c.id))
            .map(|c| (c.id, c.entity_id))
            .collect();
        for (conflict_id, entity_id) in fresh {
            let _ = self.announced_conflicts.insert(conflict_id);
            self.metrics.chain.conflicts_detected += 1;
            warn!(%conflict_id, %entity_id, "conflict detected");
            let _ = self.dispatcher.dispatch(NodeEvent::ConflictDetected {
                conflict_id,
                entity_id,
            });
        }
    }

    #[must_use]
    pub fn conflicts(&self) -> Vec<weft_chain::conflict::Conflict> {
        self.conflicts.iter().cloned().collect()
    }

    /// Resolve a recorded fork. Adopts the chosen branch if the local
    /// chain is on the other one, then appends the resolution delta.
    pub async fn resolve_conflict(
        &mut self,
        conflict_id: &ConflictId,
        resolution: ResolutionKind,
        merge_patch: Option<Vec<PatchOp>>,
    ) -> EyreResult<DeltaId> {
        let now = self.now();
        let conflict = self
            .conflicts
            .begin_resolution(conflict_id)
            .wrap_err("starting resolution")?
            .clone();
        let plan =
            plan_resolution(&conflict, resolution, merge_patch).wrap_err("planning resolution")?;

        let local_head = self
            .store
            .get(&conflict.entity_id)
            .map(|log| log.head_hash())
            .ok_or_else(|| eyre!("conflicted entity {} not in store", conflict.entity_id))?;
        if local_head != plan.adopt.head_hash {
            self.store
                .adopt_branch(conflict.entity_id, &conflict.base_hash, &plan.adopt.deltas)
                .wrap_err("adopting winning branch")?;
        }

        let delta = self
            .extend_entity(conflict.entity_id, plan.patch, Author::System)
            .await
            .wrap_err("appending resolution delta")?;
        self.conflicts
            .mark_resolved(conflict_id, delta.delta_id, now)
            .wrap_err("closing conflict")?;
        self.metrics.chain.conflicts_resolved += 1;
        let _ = self.dispatcher.dispatch(NodeEvent::ConflictResolved {
            conflict_id: *conflict_id,
            entity_id: conflict.entity_id,
        });
        Ok(delta.delta_id)
    }

    // ── actuation surface ────────────────────────────────────

    /// Create an actuator entity plus its state entity, linked.
    pub async fn create_actuator(
        &mut self,
        actuator: weft_primitives::actuation::Actuator,
    ) -> EyreResult<(EntityId, EntityId)> {
        let initial = serde_json::to_value(&actuator).wrap_err("encoding actuator")?;
        let (entity, _) = self
            .create_entity(EntityKind::Actuator, &initial, Author::System)
            .await?;

        let state = ActuatorState {
            actuator_id: entity.id,
            state: weft_primitives::actuation::ActuatorStateKind::Unknown,
            value: None,
            last_applied_intent_id: None,
            updated_at: self.now(),
        };
        let state_value = serde_json::to_value(&state).wrap_err("encoding actuator state")?;
        let (state_entity, _) = self
            .create_entity(EntityKind::ActuatorState, &state_value, Author::System)
            .await?;
        Ok((entity.id, state_entity.id))
    }

    /// Request a change to an actuator. The intent is policy-checked
    /// immediately unless it requires human confirmation.
    pub async fn request_intent(
        &mut self,
        actuator_id: EntityId,
        action: ActuationAction,
        value: Option<f64>,
        opts: IntentOptions,
    ) -> EyreResult<IntentId> {
        if self.intents.actuator(&actuator_id).is_none() {
            bail!("unknown actuator {actuator_id}");
        }
        let now = self.now();
        let ttl_ms = opts.ttl_ms.unwrap_or(self.config.actuation.intent_ttl_default_ms);
        let intent = ActuationIntent {
            actuator_id,
            requested_by_node: self.info.node_id,
            requested_by_actor: opts.actor.unwrap_or(Author::User),
            request: ActuationRequest { action, value },
            policy: IntentPolicy {
                requires_human_confirm: opts.requires_human_confirm,
                ttl_ms,
            },
            status: IntentStatus::New,
            reason: None,
            created_at: now,
            expires_at: now + ttl_ms,
        };
        let initial = serde_json::to_value(&intent).wrap_err("encoding intent")?;
        let (entity, _) = self
            .create_entity(EntityKind::ActuationIntent, &initial, intent.requested_by_actor)
            .await?;
        self.metrics.actuation.intents_requested += 1;

        let intent_id: IntentId = entity.id.into();
        if !opts.requires_human_confirm {
            self.evaluate_intent(&intent_id).await?;
        }
        Ok(intent_id)
    }

    /// Human confirmation for a held intent. Policy is re-evaluated:
    /// bounds and TTL may have changed since the request.
    pub async fn confirm_intent(&mut self, intent_id: &IntentId) -> EyreResult<IntentStatus> {
        let record = self
            .intents
            .intent(intent_id)
            .ok_or_else(|| eyre!("unknown intent {intent_id}"))?;
        if record.state.status != IntentStatus::New {
            bail!(
                "intent {intent_id} is {:?}, only NEW intents confirm",
                record.state.status
            );
        }
        self.evaluate_intent(intent_id).await?;
        Ok(self
            .intents
            .intent(intent_id)
            .map(|r| r.state.status)
            .unwrap_or(IntentStatus::New))
    }

    /// Cancel a NEW or AUTHORIZED intent.
    pub async fn cancel_intent(&mut self, intent_id: &IntentId) -> EyreResult<()> {
        let record = self
            .intents
            .intent(intent_id)
            .ok_or_else(|| eyre!("unknown intent {intent_id}"))?
            .clone();
        match record.state.status {
            IntentStatus::New | IntentStatus::Authorized => {
                self.transition_intent(&record.entity_id, IntentStatus::Denied, Some(CANCELLED))
                    .await?;
                Ok(())
            }
            status => bail!("intent {intent_id} is {status:?}, cannot cancel"),
        }
    }

    /// Run policy for a NEW intent and move it to AUTHORIZED or DENIED.
    async fn evaluate_intent(&mut self, intent_id: &IntentId) -> EyreResult<()> {
        let record = self
            .intents
            .intent(intent_id)
            .ok_or_else(|| eyre!("unknown intent {intent_id}"))?
            .clone();
        let actuator = self
            .intents
            .actuator(&record.state.actuator_id)
            .ok_or_else(|| eyre!("unknown actuator {}", record.state.actuator_id))?
            .clone();
        let actuator_state: Option<ActuatorState> = actuator
            .state_entity_id
            .and_then(|id| self.store.get(&id))
            .and_then(|log| serde_json::from_value(log.state().clone()).ok());
        let system_mode = self.system_mode();
        let now = self.now();

        let verdict = self.policy.evaluate(
            record.state.actuator_id,
            &record.state,
            &PolicyContext {
                system_mode,
                actuator: &actuator.state,
                actuator_state: actuator_state.as_ref(),
                requested_by_node: record.state.requested_by_node,
                now,
            },
        );

        match verdict {
            Ok(()) => {
                self.transition_intent(&record.entity_id, IntentStatus::Authorized, None)
                    .await?;
                self.metrics.actuation.intents_authorized += 1;
            }
            Err(reason) => {
                self.transition_intent(
                    &record.entity_id,
                    IntentStatus::Denied,
                    Some(reason.as_str()),
                )
                .await?;
                self.metrics.actuation.intents_denied += 1;
                debug!(intent = %intent_id, %reason, "intent denied");
            }
        }
        Ok(())
    }

    async fn transition_intent(
        &mut self,
        entity_id: &EntityId,
        to: IntentStatus,
        reason: Option<&str>,
    ) -> EyreResult<()> {
        let record = self
            .intents
            .intent(&(*entity_id).into())
            .ok_or_else(|| eyre!("unknown intent {entity_id}"))?
            .clone();
        let patch = transition_patch(record.state.status, to, reason)
            .wrap_err("building transition patch")?;
        let delta = self
            .extend_entity(*entity_id, patch, Author::Policy)
            .await?;

        let mut next = record.state;
        next.status = to;
        if let Some(reason) = reason {
            next.reason = Some(reason.to_owned());
        }
        self.intents.upsert_intent(*entity_id, next, delta.new_hash);

        if to.is_terminal() {
            let _ = self.dispatcher.dispatch(NodeEvent::IntentTerminal {
                intent_id: (*entity_id).into(),
                status: to,
            });
        }
        Ok(())
    }

    /// One device-agent pass over actionable intents.
    pub async fn tick_device_agent(&mut self) -> EyreResult<()> {
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| eyre!("no executor installed"))?;
        let now = self.now();
        self.refresh_indexes();
        let report = self
            .agent
            .tick(&mut self.store, &mut self.intents, executor.as_ref(), now)
            .await
            .wrap_err("device agent tick")?;

        self.metrics.actuation.intents_applied += report.applied as u64;
        self.metrics.actuation.intents_failed += report.failed as u64;
        self.metrics.actuation.duplicates_prevented += report.duplicates_prevented as u64;
        for latency in &report.apply_latencies_ms {
            self.metrics.actuation.apply_latency.record(*latency);
        }
        for (entity_id, status) in &report.terminal {
            let _ = self.dispatcher.dispatch(NodeEvent::IntentTerminal {
                intent_id: (*entity_id).into(),
                status: *status,
            });
        }
        Ok(())
    }

    /// Age out non-terminal intents past their deadline.
    pub fn sweep_expired_intents(&mut self) -> EyreResult<usize> {
        let now = self.now();
        let swept = self
            .agent
            .sweep_expired(&mut self.store, &mut self.intents, now)
            .wrap_err("expiry sweep")?;
        self.metrics.actuation.intents_expired += swept as u64;
        Ok(swept)
    }

    #[must_use]
    pub fn intent_status(&self, intent_id: &IntentId) -> Option<IntentStatus> {
        self.intents.intent(intent_id).map(|r| r.state.status)
    }

    #[must_use]
    pub fn receipt_for(&self, intent_id: &IntentId) -> Option<weft_primitives::actuation::ActuationReceipt> {
        self.intents
            .receipt_for_intent(intent_id)
            .map(|r| r.state.clone())
    }

    // ── housekeeping ─────────────────────────────────────────

    /// Rebuild the derived actuation indexes from entity state. Safe
    /// to run any time; called after sync may have landed entities.
    fn refresh_indexes(&mut self) {
        let mut actuators: Vec<EntityId> = vec![];
        let mut others: Vec<EntityId> = vec![];
        for log in self.store.iter() {
            match log.entity().kind {
                EntityKind::Actuator => actuators.push(log.entity().id),
                EntityKind::ActuatorState
                | EntityKind::ActuationIntent
                | EntityKind::ActuationReceipt
                | EntityKind::SystemState => others.push(log.entity().id),
                _ => {}
            }
        }
        // Actuators first so state entities can link to them.
        for id in actuators.into_iter().chain(others) {
            self.index_entity(id);
        }
    }

    /// Update derived indexes for one entity, by kind.
    fn index_entity(&mut self, entity_id: EntityId) {
        let Some(log) = self.store.get(&entity_id) else {
            return;
        };
        let kind = log.entity().kind;
        let state = log.state().clone();
        let head = log.head_hash();

        match kind {
            EntityKind::Actuator => {
                match serde_json::from_value(state) {
                    Ok(actuator) => self.intents.register_actuator(entity_id, actuator),
                    Err(err) => warn!(%entity_id, %err, "actuator state does not decode"),
                }
            }
            EntityKind::ActuatorState => {
                let decoded: Result<ActuatorState, _> = serde_json::from_value(state);
                match decoded {
                    Ok(actuator_state) => {
                        if self
                            .intents
                            .link_state_entity(actuator_state.actuator_id, entity_id)
                            .is_err()
                        {
                            debug!(%entity_id, "state entity precedes its actuator");
                        }
                    }
                    Err(err) => warn!(%entity_id, %err, "actuator state does not decode"),
                }
            }
            EntityKind::ActuationIntent => {
                match serde_json::from_value::<ActuationIntent>(state) {
                    Ok(intent) => self.intents.upsert_intent(entity_id, intent, head),
                    Err(err) => warn!(%entity_id, %err, "intent state does not decode"),
                }
            }
            EntityKind::ActuationReceipt => {
                match serde_json::from_value::<weft_primitives::actuation::ActuationReceipt>(state)
                {
                    Ok(receipt) => {
                        if self.intents.receipt_for_intent(&receipt.intent_id).is_none() {
                            let _ = self.intents.register_receipt(entity_id, receipt, head);
                        }
                    }
                    Err(err) => warn!(%entity_id, %err, "receipt state does not decode"),
                }
            }
            EntityKind::SystemState => {
                self.system_entity = Some(entity_id);
            }
            _ => {}
        }
    }

    /// Drive periodic work until `shutdown` fires: expiry sweep,
    /// device-agent tick, session advancement.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> EyreResult<()> {
        let period = Duration::from_millis(self.config.actuation.expiry_sweep_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(node = %self.info.node_id, "shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let _ = self.sweep_expired_intents()?;
                    if self.executor.is_some() {
                        self.tick_device_agent().await?;
                    }
                    let _ = self.advance_sessions()?;
                }
            }
        }
        Ok(())
    }
}
