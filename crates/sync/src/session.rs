//! The per-peer sync session state machine.
//!
//! One session reconciles one peer, packet in, packets out. It owns no
//! transport and no clock: the node loop feeds it inbound packets (and
//! periodic [`SyncSession::advance`] calls for deferred work) and
//! ships whatever it returns.
//!
//! Serve bursts are terminated by the server's own WANT (first burst)
//! or an empty ACK (later bursts), so the requesting side always
//! learns when a diverged entity yielded nothing and can escalate to a
//! from-genesis fetch, which is what turns a bare divergence signal
//! into a conflict record with both branches attached.
//!
//! Acceptance is delta-by-delta against the chain store, so dropping a
//! session mid-flight loses nothing: every accepted delta was already
//! persisted before its ACK was emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng as _;
use tracing::{debug, warn};
use weft_chain::conflict::{ConflictBranch, ConflictStore};
use weft_chain::{ChainError, EntityStore, IngestOutcome};
use weft_primitives::delta::Delta;
use weft_primitives::entity::EntityKind;
use weft_primitives::hash::Hash;
use weft_primitives::id::{ConflictId, DeltaId, EntityId, NodeId, SessionId};
use weft_primitives::identity::PrivateKey;
use weft_primitives::sync::{Capabilities, EntityHead, PeerWatermark, RejectReason, SyncNodeInfo};
use weft_primitives::time::Timestamp;

use crate::chunk::{chunk_delta, Reassembler};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::queue::PriorityQueue;
use crate::wire::{Packet, PacketBody, WantEntry, WireError, ENVELOPE_OVERHEAD};

/// Where a session is in the exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    HelloSent,
    HelloReceived,
    HeadsExchanged,
    Syncing,
    Complete,
    Error,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// Scoped sender slot. Acquired when a session starts talking,
/// released (by drop) when it reaches COMPLETE or ERROR on any path.
#[derive(Debug)]
pub struct SenderLease {
    active: Arc<AtomicUsize>,
}

impl SenderLease {
    #[must_use]
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::Relaxed);
        Self {
            active: Arc::clone(counter),
        }
    }
}

impl Drop for SenderLease {
    fn drop(&mut self) {
        let _ = self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-session traffic counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub deltas_sent: u64,
    pub deltas_received: u64,
    pub deltas_duplicate: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub rejects_sent: u64,
    pub rejects_received: u64,
    pub queue_dropped: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WantStatus {
    /// Asked, nothing conclusive yet.
    Pending,
    /// Peer couldn't serve our head; re-asked from genesis. The
    /// response burst may still be in flight.
    Retried,
    /// A burst ended after the retry with still nothing for it.
    RetriedStale,
    /// Converged, conflicted, or given up.
    Settled,
}

#[derive(Clone, Debug)]
struct WantState {
    since: Hash,
    status: WantStatus,
}

pub struct SyncSession {
    id: SessionId,
    local: SyncNodeInfo,
    peer: SyncNodeInfo,
    config: SyncConfig,
    signing_key: Option<PrivateKey>,
    initiated: bool,
    state: SessionState,
    nonce: u64,
    peer_caps: Option<Capabilities>,
    remote_heads: HashMap<EntityId, EntityHead>,
    wants: HashMap<EntityId, WantState>,
    want_sent: bool,
    peer_want_received: bool,
    /// Deltas we served, awaiting acknowledgment: delta id to the
    /// entity and post-hash the peer will hold once it ACKs.
    acks_pending: HashMap<DeltaId, (EntityId, Hash)>,
    deferred: VecDeque<Delta>,
    marker_pending: bool,
    reassembler: Reassembler,
    watermark: PeerWatermark,
    stats: SessionStats,
    lease: Option<SenderLease>,
}

impl core::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncSession")
            .field("id", &self.id)
            .field("peer", &self.peer.node_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Everything a session needs at construction besides its role.
pub struct SessionSetup {
    pub id: SessionId,
    pub local: SyncNodeInfo,
    pub peer: SyncNodeInfo,
    pub config: SyncConfig,
    pub signing_key: Option<PrivateKey>,
    pub watermark: PeerWatermark,
    pub lease: SenderLease,
}

impl core::fmt::Debug for SessionSetup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionSetup")
            .field("id", &self.id)
            .field("peer", &self.peer.node_id)
            .finish_non_exhaustive()
    }
}

impl SyncSession {
    /// Open a session toward a peer and produce the HELLO packet.
    pub fn initiate(setup: SessionSetup) -> Result<(Self, Vec<Packet>), SyncError> {
        let nonce = rand::thread_rng().gen();
        let mut session = Self::new(setup, true, SessionState::HelloSent, nonce);
        let hello = session.hello_packet();
        let outbound = session.finish_outbound(vec![hello])?;
        Ok((session, outbound))
    }

    /// Accept a session opened by a peer: consumes its HELLO, replies
    /// with ours (echoing the nonce).
    pub fn respond(setup: SessionSetup, hello: &Packet) -> Result<(Self, Vec<Packet>), SyncError> {
        let mut session = Self::new(setup, false, SessionState::HelloReceived, 0);
        session.check_peer(hello)?;
        session.note_received(hello)?;

        let PacketBody::Hello {
            protocol_version,
            caps,
            nonce,
        } = &hello.body
        else {
            return Err(SyncError::UnexpectedPacket {
                state: format!("{:?}", session.state),
                packet: hello.body.type_name(),
            });
        };
        session.accept_hello(protocol_version, caps, hello)?;
        session.nonce = *nonce;

        let reply = session.hello_packet();
        let outbound = session.finish_outbound(vec![reply])?;
        Ok((session, outbound))
    }

    fn new(setup: SessionSetup, initiated: bool, state: SessionState, nonce: u64) -> Self {
        let reassembly_timeout = setup.config.chunk_reassembly_timeout_ms;
        Self {
            id: setup.id,
            local: setup.local,
            peer: setup.peer,
            config: setup.config,
            signing_key: setup.signing_key,
            initiated,
            state,
            nonce,
            peer_caps: None,
            remote_heads: HashMap::new(),
            wants: HashMap::new(),
            want_sent: false,
            peer_want_received: false,
            acks_pending: HashMap::new(),
            deferred: VecDeque::new(),
            marker_pending: false,
            reassembler: Reassembler::new(reassembly_timeout),
            watermark: setup.watermark,
            stats: SessionStats::default(),
            lease: Some(setup.lease),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn peer_node_id(&self) -> NodeId {
        self.peer.node_id
    }

    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    #[must_use]
    pub const fn watermark(&self) -> &PeerWatermark {
        &self.watermark
    }

    /// Abandon the session. Safe at any point: acceptance already
    /// happened delta-by-delta, so nothing is half-applied.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            debug!(session = %self.id, "session cancelled");
            self.set_state(SessionState::Error);
        }
    }

    /// Feed one inbound packet; returns the packets to send back.
    /// Packets arriving after the session is terminal are dropped.
    pub fn handle_packet(
        &mut self,
        packet: &Packet,
        store: &mut EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) -> Result<Vec<Packet>, SyncError> {
        if self.state.is_terminal() {
            debug!(session = %self.id, packet = packet.body.type_name(), "dropped, session terminal");
            return Ok(vec![]);
        }
        self.check_peer(packet)?;
        self.note_received(packet)?;
        self.verify_inbound(packet)?;

        let mut outbound = match (self.state, &packet.body) {
            (SessionState::HelloSent, PacketBody::Hello { protocol_version, caps, nonce }) => {
                self.accept_hello(protocol_version, caps, packet)?;
                if *nonce != self.nonce {
                    self.set_state(SessionState::Error);
                    return Err(SyncError::NonceMismatch {
                        expected: self.nonce,
                        echoed: *nonce,
                    });
                }
                self.state = SessionState::HelloReceived;
                vec![self.heads_packet(store)]
            }

            (SessionState::HelloReceived, PacketBody::Heads { heads }) => {
                self.accept_heads(heads, store, now);
                if self.initiated {
                    // The initiator follows the diff with its WANT.
                    self.state = SessionState::Syncing;
                    vec![self.want_packet()]
                } else {
                    self.state = SessionState::HeadsExchanged;
                    vec![self.heads_packet(store)]
                }
            }

            (
                SessionState::HeadsExchanged | SessionState::Syncing,
                PacketBody::Want { entries },
            ) => {
                let had_sent_want = self.want_sent;
                self.state = SessionState::Syncing;
                self.peer_want_received = true;

                let mut burst = self.serve_want(entries, store)?;
                if had_sent_want {
                    // Later burst: terminate with an empty ACK so the
                    // peer can evaluate what never arrived.
                    burst.push(Packet::new(
                        self.local.node_id,
                        PacketBody::Ack { delta_ids: vec![] },
                    ));
                    // The peer's WANT also marks the end of *its*
                    // serve burst toward us.
                    burst.extend(self.serve_marker(store, conflicts, now)?);
                } else {
                    burst.push(self.want_packet());
                }
                burst
            }

            (SessionState::Syncing, PacketBody::Deltas { deltas }) => {
                self.accept_deltas(deltas.clone(), store, conflicts, now)?
            }

            (
                SessionState::Syncing,
                PacketBody::DeltasChunk {
                    delta_id,
                    chunk_index,
                    chunk_total,
                    payload,
                },
            ) => {
                self.stats.chunks_received += 1;
                match self
                    .reassembler
                    .accept(*delta_id, *chunk_index, *chunk_total, payload, now)
                {
                    Ok(Some(delta)) => self.accept_deltas(vec![delta], store, conflicts, now)?,
                    Ok(None) => vec![],
                    Err(err) => {
                        warn!(session = %self.id, %err, "bad chunk");
                        self.stats.rejects_sent += 1;
                        vec![self.reject_packet(RejectReason::SchemaInvalid, err.to_string())]
                    }
                }
            }

            (SessionState::Syncing, PacketBody::Ack { delta_ids }) => {
                for id in delta_ids {
                    // An ACK proves the peer holds the entity at that
                    // hash; remember it for the next heads exchange.
                    if let Some((entity_id, hash)) = self.acks_pending.remove(id) {
                        self.watermark.record(entity_id, hash, now);
                    }
                }
                if delta_ids.is_empty() {
                    // Bare ACK: the peer's serve burst is over.
                    self.serve_marker(store, conflicts, now)?
                } else {
                    vec![]
                }
            }

            (_, PacketBody::Reject { reason, details }) => {
                self.stats.rejects_received += 1;
                warn!(session = %self.id, ?reason, details, "peer rejected");
                // Whatever we had in flight will not be acknowledged.
                self.acks_pending.clear();
                if reason.is_fatal() {
                    self.set_state(SessionState::Error);
                }
                vec![]
            }

            (state, body) => {
                return Err(SyncError::UnexpectedPacket {
                    state: format!("{state:?}"),
                    packet: body.type_name(),
                })
            }
        };

        self.check_complete(now);
        self.sign_all(&mut outbound)?;
        self.note_sent(&outbound)?;
        Ok(outbound)
    }

    /// Drain deferred inbound work (backpressure) and stale reassembly
    /// buffers. The node loop calls this between packets.
    pub fn advance(
        &mut self,
        store: &mut EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) -> Result<Vec<Packet>, SyncError> {
        if self.state.is_terminal() {
            return Ok(vec![]);
        }
        let _ = self.reassembler.sweep_stale(now);

        let mut outbound = if self.deferred.is_empty() {
            if self.marker_pending {
                self.serve_marker(store, conflicts, now)?
            } else {
                vec![]
            }
        } else {
            let batch = self.take_deferred_batch();
            self.process_delta_batch(batch, store, conflicts, now)?
        };

        self.check_complete(now);
        self.sign_all(&mut outbound)?;
        self.note_sent(&outbound)?;
        Ok(outbound)
    }

    /// True while inbound deltas are parked awaiting `advance`.
    #[must_use]
    pub fn is_backlogged(&self) -> bool {
        !self.deferred.is_empty() || self.marker_pending
    }

    // ── packet builders ──────────────────────────────────────

    fn hello_packet(&self) -> Packet {
        Packet::new(
            self.local.node_id,
            PacketBody::Hello {
                protocol_version: self.local.capabilities.protocol_version.clone(),
                caps: self.local.capabilities.clone(),
                nonce: self.nonce,
            },
        )
    }

    fn heads_packet(&self, store: &EntityStore) -> Packet {
        let heads: Vec<EntityHead> = store
            .heads()
            .into_iter()
            .filter(|head| !self.watermark.is_current(&head.entity_id, &head.current_hash))
            .collect();
        Packet::new(self.local.node_id, PacketBody::Heads { heads })
    }

    fn want_packet(&mut self) -> Packet {
        self.want_sent = true;
        let mut entries: Vec<WantEntry> = self
            .wants
            .iter()
            .filter(|(_, w)| w.status == WantStatus::Pending)
            .map(|(entity_id, w)| WantEntry {
                entity_id: *entity_id,
                since_hash: w.since,
            })
            .collect();
        entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Packet::new(self.local.node_id, PacketBody::Want { entries })
    }

    fn reject_packet(&self, reason: RejectReason, details: String) -> Packet {
        Packet::new(self.local.node_id, PacketBody::Reject { reason, details })
    }

    // ── exchange steps ───────────────────────────────────────

    fn accept_hello(
        &mut self,
        protocol_version: &str,
        caps: &Capabilities,
        packet: &Packet,
    ) -> Result<(), SyncError> {
        let ours = self.local.capabilities.protocol_version.clone();
        if protocol_version != ours {
            self.set_state(SessionState::Error);
            return Err(SyncError::ProtocolMismatch {
                ours,
                theirs: protocol_version.to_owned(),
            });
        }
        // With signing negotiated, the HELLO itself must verify.
        if self.local.capabilities.supports_signing && caps.supports_signing {
            match packet.verify_signature(&self.peer.public_key) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    self.set_state(SessionState::Error);
                    return Err(SyncError::SignatureInvalid);
                }
            }
        }
        self.peer_caps = Some(caps.clone());
        Ok(())
    }

    /// Diff the peer's heads against ours and queue the WANTs.
    fn accept_heads(&mut self, heads: &[EntityHead], store: &EntityStore, now: Timestamp) {
        for head in heads {
            let _ = self.remote_heads.insert(head.entity_id, head.clone());
            let want = match store.get(&head.entity_id) {
                // Remote-only: fetch the whole chain.
                None => Some(Hash::genesis()),
                // Synced: nothing to do beyond the watermark.
                Some(log) if log.head_hash() == head.current_hash => None,
                // Diverged: ask strictly forward of our head.
                Some(log) => Some(log.head_hash()),
            };
            match want {
                Some(since) => {
                    let _ = self.wants.insert(
                        head.entity_id,
                        WantState {
                            since,
                            status: WantStatus::Pending,
                        },
                    );
                }
                None => {
                    self.watermark
                        .record(head.entity_id, head.current_hash, now);
                }
            }
        }
        debug!(
            session = %self.id,
            remote = heads.len(),
            wanted = self.wants.len(),
            "heads diffed"
        );
    }

    /// Serve a peer WANT: collect chain suffixes, order by priority,
    /// pack into size-bounded packets, chunking oversize deltas.
    fn serve_want(
        &mut self,
        entries: &[WantEntry],
        store: &EntityStore,
    ) -> Result<Vec<Packet>, SyncError> {
        let mut queue = PriorityQueue::new(self.config.emission_queue_capacity);
        for entry in entries {
            let Some(log) = store.get(&entry.entity_id) else {
                // Nothing to serve; the peer will fall back or conflict.
                continue;
            };
            match log.deltas_since(&entry.since_hash) {
                Some(suffix) => {
                    for delta in suffix {
                        queue.push(log.entity().kind, delta.clone());
                    }
                }
                None => {
                    // Their hash is not on our chain: divergence
                    // signal. Serve nothing for this entity.
                    debug!(
                        session = %self.id,
                        entity = %entry.entity_id,
                        since = %entry.since_hash,
                        "WANT since-hash unknown, withholding"
                    );
                }
            }
        }
        self.stats.queue_dropped += queue.dropped();

        let max_packet = self
            .peer_caps
            .as_ref()
            .map_or(self.config.max_packet_bytes, |c| c.max_packet_bytes);
        let chunking = self.config.supports_chunking
            && self.peer_caps.as_ref().is_some_and(|c| c.supports_chunking);
        let budget = max_packet.saturating_sub(ENVELOPE_OVERHEAD).max(1);

        let mut packets = vec![];
        let mut batch: Vec<Delta> = vec![];
        let mut batch_len = 0_usize;

        while let Some(entry) = queue.pop() {
            let delta = entry.delta;
            let encoded = serde_json::to_vec(&delta).map_err(WireError::Encode)?.len();
            let _ = self
                .acks_pending
                .insert(delta.delta_id, (delta.entity_id, delta.new_hash));
            self.stats.deltas_sent += 1;

            if encoded > budget && chunking {
                if !batch.is_empty() {
                    packets.push(self.deltas_packet(core::mem::take(&mut batch)));
                    batch_len = 0;
                }
                let chunks = chunk_delta(self.local.node_id, &delta, max_packet)?;
                self.stats.chunks_sent += chunks.len() as u64;
                packets.extend(chunks);
                continue;
            }

            if !batch.is_empty() && batch_len + encoded + 1 > budget {
                packets.push(self.deltas_packet(core::mem::take(&mut batch)));
                batch_len = 0;
            }
            batch_len += encoded + 1;
            batch.push(delta);
        }
        if !batch.is_empty() {
            packets.push(self.deltas_packet(batch));
        }
        Ok(packets)
    }

    fn deltas_packet(&self, deltas: Vec<Delta>) -> Packet {
        Packet::new(self.local.node_id, PacketBody::Deltas { deltas })
    }

    /// Inbound DELTAS: respect the backpressure budget, then process.
    fn accept_deltas(
        &mut self,
        deltas: Vec<Delta>,
        store: &mut EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) -> Result<Vec<Packet>, SyncError> {
        self.deferred.extend(deltas);
        let batch = self.take_deferred_batch();
        self.process_delta_batch(batch, store, conflicts, now)
    }

    fn take_deferred_batch(&mut self) -> Vec<Delta> {
        let take = self
            .config
            .inbound_batch_limit
            .max(1)
            .min(self.deferred.len());
        self.deferred.drain(..take).collect()
    }

    /// Chain-check and materialize a batch. ACK the accepted prefix;
    /// on the first failure, register a conflict if it is a fork, send
    /// REJECT, and drop the rest of the packet.
    fn process_delta_batch(
        &mut self,
        batch: Vec<Delta>,
        store: &mut EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) -> Result<Vec<Packet>, SyncError> {
        let mut accepted: Vec<DeltaId> = vec![];
        let mut reject: Option<Packet> = None;

        for (position, delta) in batch.iter().enumerate() {
            self.stats.deltas_received += 1;
            let Some(kind) = self.kind_of(&delta.entity_id, store) else {
                self.stats.rejects_sent += 1;
                reject = Some(self.reject_packet(
                    RejectReason::EntityUnknown,
                    format!("no kind known for entity {}", delta.entity_id),
                ));
                self.settle(delta.entity_id);
                break;
            };

            match store.ingest_delta(kind, delta) {
                Ok(IngestOutcome::Applied) => {
                    accepted.push(delta.delta_id);
                    self.settle_if_converged(delta.entity_id, store, now);
                }
                Ok(IngestOutcome::AlreadyKnown) => {
                    self.stats.deltas_duplicate += 1;
                    accepted.push(delta.delta_id);
                    self.settle_if_converged(delta.entity_id, store, now);
                }
                Err(err) if err.is_fork() => {
                    self.open_fork_conflict(&err, delta, &batch[position..], store, conflicts, now);
                    self.stats.rejects_sent += 1;
                    reject =
                        Some(self.reject_packet(RejectReason::HashChainBroken, err.to_string()));
                    self.settle(delta.entity_id);
                    break;
                }
                Err(err) => {
                    warn!(session = %self.id, %err, "delta refused");
                    self.stats.rejects_sent += 1;
                    reject = Some(self.reject_packet(err.reject_reason(), err.to_string()));
                    self.settle(delta.entity_id);
                    break;
                }
            }
        }

        // A rejected packet discards everything after the failure.
        if reject.is_some() {
            self.deferred.clear();
        }

        let mut outbound = vec![];
        if !accepted.is_empty() {
            outbound.push(Packet::new(
                self.local.node_id,
                PacketBody::Ack {
                    delta_ids: accepted,
                },
            ));
        }
        outbound.extend(reject);
        Ok(outbound)
    }

    /// The peer finished a serve burst: any of our wants still pending
    /// got nothing. Escalate diverged ones to a from-genesis fetch
    /// once; after that, record the divergence with what we know.
    fn serve_marker(
        &mut self,
        store: &mut EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) -> Result<Vec<Packet>, SyncError> {
        if !self.deferred.is_empty() {
            // Evaluate once the backlog drains.
            self.marker_pending = true;
            return Ok(vec![]);
        }
        self.marker_pending = false;

        let mut retry: Vec<WantEntry> = vec![];
        let mut orphaned: Vec<EntityId> = vec![];
        for (entity_id, want) in &mut self.wants {
            match want.status {
                WantStatus::Pending if !want.since.is_genesis() => {
                    want.since = Hash::genesis();
                    want.status = WantStatus::Retried;
                    retry.push(WantEntry {
                        entity_id: *entity_id,
                        since_hash: Hash::genesis(),
                    });
                }
                // A from-genesis ask that still produced nothing.
                WantStatus::Pending | WantStatus::RetriedStale => {
                    want.status = WantStatus::Settled;
                    orphaned.push(*entity_id);
                }
                // Markers interleave with bursts; give the retry one
                // more burst to land before giving up on it.
                WantStatus::Retried => {
                    want.status = WantStatus::RetriedStale;
                }
                WantStatus::Settled => {}
            }
        }

        for entity_id in orphaned {
            self.record_blind_conflict(entity_id, store, conflicts, now);
        }

        if retry.is_empty() {
            return Ok(vec![]);
        }
        retry.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        debug!(session = %self.id, retries = retry.len(), "escalating diverged wants to genesis");
        Ok(vec![Packet::new(
            self.local.node_id,
            PacketBody::Want { entries: retry },
        )])
    }

    /// Register a fork with full information from an ingest failure.
    fn open_fork_conflict(
        &mut self,
        err: &ChainError,
        first_remote: &Delta,
        remainder: &[Delta],
        store: &EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) {
        let ChainError::Fork {
            entity_id,
            prev_hash,
            ..
        } = err
        else {
            return;
        };

        let local_branch: Vec<Delta> = store
            .get(entity_id)
            .and_then(|log| log.deltas_since(prev_hash))
            .map(<[Delta]>::to_vec)
            .unwrap_or_default();
        let local_head = store
            .get(entity_id)
            .map_or(*prev_hash, |log| log.head_hash());

        let remote_branch: Vec<Delta> = remainder
            .iter()
            .filter(|d| d.entity_id == *entity_id)
            .cloned()
            .collect();
        let remote_head = remote_branch
            .last()
            .map_or(first_remote.new_hash, |d| d.new_hash);

        let _ = conflicts.open(
            ConflictId::random(&mut rand::thread_rng()),
            *entity_id,
            *prev_hash,
            ConflictBranch {
                node_id: self.local.node_id,
                head_hash: local_head,
                deltas: local_branch,
            },
            ConflictBranch {
                node_id: self.peer.node_id,
                head_hash: remote_head,
                deltas: remote_branch,
            },
            now,
        );
    }

    /// Divergence we could not get branch data for: record it anyway,
    /// with the remote branch known only by its declared head.
    fn record_blind_conflict(
        &mut self,
        entity_id: EntityId,
        store: &EntityStore,
        conflicts: &mut ConflictStore,
        now: Timestamp,
    ) {
        let Some(remote) = self.remote_heads.get(&entity_id) else {
            return;
        };
        let Some(log) = store.get(&entity_id) else {
            return;
        };
        if log.head_hash() == remote.current_hash {
            return;
        }
        warn!(
            session = %self.id,
            entity = %entity_id,
            "diverged entity yielded no deltas, recording conflict"
        );
        let _ = conflicts.open(
            ConflictId::random(&mut rand::thread_rng()),
            entity_id,
            Hash::genesis(),
            ConflictBranch {
                node_id: self.local.node_id,
                head_hash: log.head_hash(),
                deltas: log.deltas().to_vec(),
            },
            ConflictBranch {
                node_id: self.peer.node_id,
                head_hash: remote.current_hash,
                deltas: vec![],
            },
            now,
        );
    }

    fn kind_of(&self, entity_id: &EntityId, store: &EntityStore) -> Option<EntityKind> {
        store
            .get(entity_id)
            .map(|log| log.entity().kind)
            .or_else(|| self.remote_heads.get(entity_id).map(|h| h.kind))
    }

    /// Settle the want (and stamp the watermark) once local and
    /// declared remote heads agree.
    fn settle_if_converged(&mut self, entity_id: EntityId, store: &EntityStore, now: Timestamp) {
        let Some(log) = store.get(&entity_id) else {
            return;
        };
        let converged = self
            .remote_heads
            .get(&entity_id)
            .is_some_and(|remote| remote.current_hash == log.head_hash());
        if converged {
            self.settle(entity_id);
            self.watermark.record(entity_id, log.head_hash(), now);
        }
    }

    fn settle(&mut self, entity_id: EntityId) {
        if let Some(want) = self.wants.get_mut(&entity_id) {
            want.status = WantStatus::Settled;
        }
    }

    fn check_complete(&mut self, now: Timestamp) {
        if self.state != SessionState::Syncing {
            return;
        }
        let wants_done = self.wants.values().all(|w| w.status == WantStatus::Settled);
        if wants_done
            && self.want_sent
            && self.peer_want_received
            && self.acks_pending.is_empty()
            && self.deferred.is_empty()
            && !self.marker_pending
        {
            self.watermark.last_sync_at = Some(now);
            debug!(session = %self.id, peer = %self.peer.node_id, "session complete");
            self.set_state(SessionState::Complete);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        if self.state.is_terminal() {
            // Release the sender slot on every exit path.
            let _ = self.lease.take();
        }
    }

    fn check_peer(&self, packet: &Packet) -> Result<(), SyncError> {
        if packet.node_id != self.peer.node_id {
            return Err(SyncError::WrongPeer {
                expected: self.peer.node_id,
                actual: packet.node_id,
            });
        }
        Ok(())
    }

    /// Signature check for post-HELLO packets when negotiated.
    fn verify_inbound(&mut self, packet: &Packet) -> Result<(), SyncError> {
        if matches!(packet.body, PacketBody::Hello { .. }) {
            // Verified against its own advertised caps in accept_hello.
            return Ok(());
        }
        let negotiated = self.local.capabilities.supports_signing
            && self.peer_caps.as_ref().is_some_and(|c| c.supports_signing);
        if !negotiated {
            return Ok(());
        }
        match packet.verify_signature(&self.peer.public_key) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => {
                self.set_state(SessionState::Error);
                Err(SyncError::SignatureInvalid)
            }
        }
    }

    fn sign_all(&self, outbound: &mut [Packet]) -> Result<(), SyncError> {
        if !self.local.capabilities.supports_signing {
            return Ok(());
        }
        let Some(key) = &self.signing_key else {
            return Ok(());
        };
        for packet in outbound {
            packet.sign(key)?;
        }
        Ok(())
    }

    fn note_received(&mut self, packet: &Packet) -> Result<(), SyncError> {
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.encoded_len()? as u64;
        Ok(())
    }

    fn note_sent(&mut self, outbound: &[Packet]) -> Result<(), SyncError> {
        for packet in outbound {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += packet.encoded_len()? as u64;
        }
        Ok(())
    }

    fn finish_outbound(&mut self, mut outbound: Vec<Packet>) -> Result<Vec<Packet>, SyncError> {
        self.sign_all(&mut outbound)?;
        self.note_sent(&outbound)?;
        Ok(outbound)
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;
    use serde_json::json;
    use weft_primitives::delta::PatchOp;
    use weft_primitives::entity::Author;
    use weft_primitives::time::Timestamp;

    use super::*;

    struct Peer {
        info: SyncNodeInfo,
        key: PrivateKey,
        store: EntityStore,
        conflicts: ConflictStore,
        session: Option<SyncSession>,
        counter: Arc<AtomicUsize>,
    }

    impl Peer {
        fn new(name: &str) -> Self {
            let key = PrivateKey::random(&mut thread_rng());
            Self {
                info: SyncNodeInfo {
                    node_id: NodeId::random(&mut thread_rng()),
                    node_name: name.to_owned(),
                    public_key: key.public_key(),
                    created_at: Timestamp::from_millis(0),
                    capabilities: Capabilities::default(),
                },
                key,
                store: EntityStore::new(),
                conflicts: ConflictStore::new(),
                session: None,
                counter: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn setup_toward(&self, peer: &Peer) -> SessionSetup {
            self.setup_with(peer, SyncConfig::default())
        }

        fn setup_with(&self, peer: &Peer, config: SyncConfig) -> SessionSetup {
            SessionSetup {
                id: SessionId::random(&mut thread_rng()),
                local: self.info.clone(),
                peer: peer.info.clone(),
                config,
                signing_key: Some(self.key.clone()),
                watermark: PeerWatermark::default(),
                lease: SenderLease::acquire(&self.counter),
            }
        }

        fn create(&mut self, kind: EntityKind, initial: serde_json::Value, at: u64) -> EntityId {
            let mut rng = thread_rng();
            let id = EntityId::random(&mut rng);
            drop(
                self.store
                    .create_entity(
                        id,
                        DeltaId::random(&mut rng),
                        kind,
                        &initial,
                        Author::User,
                        Timestamp::from_millis(at),
                    )
                    .unwrap(),
            );
            id
        }

        fn extend(&mut self, id: EntityId, patch: Vec<PatchOp>, at: u64) {
            drop(
                self.store
                    .extend_entity(
                        id,
                        DeltaId::random(&mut thread_rng()),
                        patch,
                        Author::User,
                        Timestamp::from_millis(at),
                    )
                    .unwrap(),
            );
        }
    }

    /// Shuttle packets between the two peers until both go quiet.
    fn pump(a: &mut Peer, b: &mut Peer, first: Vec<Packet>) {
        let now = Timestamp::from_millis(1_000);
        let mut to_b = VecDeque::from(first);
        let mut to_a = VecDeque::new();

        for _ in 0..10_000 {
            if let Some(packet) = to_b.pop_front() {
                let session = b.session.as_mut().unwrap();
                let replies = session
                    .handle_packet(&packet, &mut b.store, &mut b.conflicts, now)
                    .unwrap();
                to_a.extend(replies);
            } else if let Some(packet) = to_a.pop_front() {
                let session = a.session.as_mut().unwrap();
                let replies = session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap();
                to_b.extend(replies);
            } else {
                // Drain deferred work before declaring quiescence.
                let ra = a
                    .session
                    .as_mut()
                    .unwrap()
                    .advance(&mut a.store, &mut a.conflicts, now)
                    .unwrap();
                let rb = b
                    .session
                    .as_mut()
                    .unwrap()
                    .advance(&mut b.store, &mut b.conflicts, now)
                    .unwrap();
                if ra.is_empty() && rb.is_empty() {
                    return;
                }
                to_b.extend(ra);
                to_a.extend(rb);
            }
        }
        panic!("pump did not quiesce");
    }

    fn connect(a: &mut Peer, b: &mut Peer) -> Vec<Packet> {
        let (session_a, hello) = SyncSession::initiate(a.setup_toward(b)).unwrap();
        a.session = Some(session_a);

        let (session_b, replies) = SyncSession::respond(b.setup_toward(a), &hello[0]).unwrap();
        b.session = Some(session_b);
        // Feed B's HELLO back through the pump from A's side.
        replies
    }

    fn assert_converged(a: &Peer, b: &Peer) {
        assert_eq!(a.session.as_ref().unwrap().state(), SessionState::Complete);
        assert_eq!(b.session.as_ref().unwrap().state(), SessionState::Complete);
        let heads_a = a.store.heads();
        let heads_b = b.store.heads();
        assert_eq!(heads_a, heads_b, "stores did not converge");
    }

    #[test]
    fn test_empty_stores_complete_without_exchange() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");
        let replies = connect(&mut a, &mut b);

        // B's HELLO goes to A, and the exchange runs dry.
        let now = Timestamp::from_millis(1_000);
        let mut to_b = VecDeque::new();
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            to_b.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        let mut to_a: VecDeque<Packet> = VecDeque::new();
        let mut to_b: VecDeque<Packet> = to_b.into_iter().collect();
        for _ in 0..100 {
            if let Some(packet) = to_b.pop_front() {
                let session = b.session.as_mut().unwrap();
                to_a.extend(
                    session
                        .handle_packet(&packet, &mut b.store, &mut b.conflicts, now)
                        .unwrap(),
                );
            } else if let Some(packet) = to_a.pop_front() {
                let session = a.session.as_mut().unwrap();
                to_b.extend(
                    session
                        .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                        .unwrap(),
                );
            } else {
                break;
            }
        }

        assert_converged(&a, &b);
        let stats = a.session.as_ref().unwrap().stats();
        assert_eq!(stats.deltas_sent, 0);
        assert_eq!(stats.deltas_received, 0);
    }

    #[test]
    fn test_one_sided_catch_up() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");

        let task = a.create(EntityKind::Task, json!({"title": "t", "status": "OPEN"}), 10);
        a.extend(task, vec![PatchOp::replace("/status", json!("DONE"))], 20);
        let _ = a.create(EntityKind::Message, json!({"body": "hi"}), 30);

        let replies = connect(&mut a, &mut b);
        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        pump(&mut a, &mut b, first);

        assert_converged(&a, &b);
        assert_eq!(b.store.stats().entity_count, 2);
        assert_eq!(
            b.store.get(&task).unwrap().state()["status"],
            json!("DONE")
        );
        assert!(b.conflicts.stats().detected == 0);
    }

    #[test]
    fn test_bidirectional_sync() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");

        let _ = a.create(EntityKind::Task, json!({"title": "from-a"}), 10);
        let _ = b.create(EntityKind::Note, json!({"text": "from-b"}), 11);

        let replies = connect(&mut a, &mut b);
        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        pump(&mut a, &mut b, first);

        assert_converged(&a, &b);
        assert_eq!(a.store.stats().entity_count, 2);
        assert_eq!(b.store.stats().entity_count, 2);
    }

    #[test]
    fn test_fork_opens_exactly_one_conflict() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");

        // Shared entity, then divergent extends on each side.
        let shared = a.create(EntityKind::Note, json!({"n": 0}), 10);
        let creation = a.store.get(&shared).unwrap().deltas()[0].clone();
        drop(b.store.ingest_delta(EntityKind::Note, &creation).unwrap());

        a.extend(shared, vec![PatchOp::replace("/n", json!(1))], 20);
        b.extend(shared, vec![PatchOp::replace("/n", json!(2))], 30);

        let replies = connect(&mut a, &mut b);
        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        pump(&mut a, &mut b, first);

        // Each side records exactly one conflict for the fork.
        assert_eq!(a.conflicts.stats().detected, 1);
        assert_eq!(b.conflicts.stats().detected, 1);

        let conflict = a.conflicts.iter().next().unwrap();
        assert_eq!(conflict.entity_id, shared);
        assert_eq!(conflict.base_hash, creation.new_hash);
        assert!(!conflict.branch_a.deltas.is_empty());
        assert!(!conflict.branch_b.deltas.is_empty());
    }

    #[test]
    fn test_signed_session_converges() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");
        a.info.capabilities.supports_signing = true;
        b.info.capabilities.supports_signing = true;

        let _ = a.create(EntityKind::Task, json!({"title": "signed"}), 10);

        let replies = connect(&mut a, &mut b);
        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        pump(&mut a, &mut b, first);

        assert_converged(&a, &b);
    }

    #[test]
    fn test_tampered_packet_kills_signed_session() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");
        a.info.capabilities.supports_signing = true;
        b.info.capabilities.supports_signing = true;

        let replies = connect(&mut a, &mut b);
        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }

        // Strip the signature from A's HEADS before delivery.
        let mut tampered = first[0].clone();
        tampered.sig = None;
        let session = b.session.as_mut().unwrap();
        let err = session
            .handle_packet(&tampered, &mut b.store, &mut b.conflicts, now)
            .unwrap_err();

        assert!(matches!(err, SyncError::SignatureInvalid));
        assert_eq!(session.state(), SessionState::Error);
        // The sender slot was released on the error path.
        assert_eq!(b.counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_backpressure_defers_and_still_converges() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");

        for i in 0..8 {
            let _ = a.create(EntityKind::Note, json!({"n": i}), 10 + i);
        }

        // One delta per batch on the receiving side.
        let config = SyncConfig {
            inbound_batch_limit: 1,
            ..SyncConfig::default()
        };
        let (session_a, hello) = SyncSession::initiate(a.setup_with(&b, config.clone())).unwrap();
        a.session = Some(session_a);
        let (session_b, replies) =
            SyncSession::respond(b.setup_with(&a, config), &hello[0]).unwrap();
        b.session = Some(session_b);

        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        pump(&mut a, &mut b, first);

        assert_converged(&a, &b);
        assert_eq!(b.store.stats().entity_count, 8);
    }

    #[test]
    fn test_wrong_peer_refused() {
        let mut a = Peer::new("a");
        let b = Peer::new("b");
        let (session, _) = SyncSession::initiate(a.setup_toward(&b)).unwrap();
        a.session = Some(session);

        let stranger = NodeId::random(&mut thread_rng());
        let packet = Packet::new(
            stranger,
            PacketBody::Ack { delta_ids: vec![] },
        );
        let err = a
            .session
            .as_mut()
            .unwrap()
            .handle_packet(
                &packet,
                &mut a.store,
                &mut a.conflicts,
                Timestamp::from_millis(0),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::WrongPeer { .. }));
    }

    #[test]
    fn test_sender_lease_released_on_completion() {
        let mut a = Peer::new("a");
        let mut b = Peer::new("b");
        let _ = a.create(EntityKind::Task, json!({"title": "t"}), 10);

        let replies = connect(&mut a, &mut b);
        assert_eq!(a.counter.load(Ordering::Relaxed), 1);
        assert_eq!(b.counter.load(Ordering::Relaxed), 1);

        let now = Timestamp::from_millis(1_000);
        let mut first = vec![];
        for packet in replies {
            let session = a.session.as_mut().unwrap();
            first.extend(
                session
                    .handle_packet(&packet, &mut a.store, &mut a.conflicts, now)
                    .unwrap(),
            );
        }
        pump(&mut a, &mut b, first);

        assert_converged(&a, &b);
        assert_eq!(a.counter.load(Ordering::Relaxed), 0);
        assert_eq!(b.counter.load(Ordering::Relaxed), 0);
    }
}
