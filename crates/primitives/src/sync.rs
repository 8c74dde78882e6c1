//! Sync-layer descriptors: peers, capabilities, heads, watermarks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityKind};
use crate::hash::Hash;
use crate::id::{EntityId, NodeId};
use crate::identity::PublicKey;
use crate::time::Timestamp;

/// Protocol identifier; peers with a different version refuse to sync.
pub const PROTOCOL_VERSION: &str = "/weft/sync/0.1.0";

/// Default upper bound on an emitted packet, in bytes. Deliberately
/// tiny: the fabric is designed for links where an MTU of a few hundred
/// bytes is real (LoRa-class radios), and larger transports simply
/// raise it in config.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 220;

/// What a peer can do, exchanged in HELLO.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub protocol_version: String,
    pub max_packet_bytes: usize,
    pub supports_chunking: bool,
    pub supports_signing: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            supports_chunking: true,
            supports_signing: false,
        }
    }
}

/// A node participating in the fabric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncNodeInfo {
    pub node_id: NodeId,
    pub node_name: String,
    pub public_key: PublicKey,
    pub created_at: Timestamp,
    pub capabilities: Capabilities,
}

/// One entry of a HEADS packet: where one entity's chain currently ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHead {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub current_hash: Hash,
    pub current_version: u64,
}

impl From<&Entity> for EntityHead {
    fn from(entity: &Entity) -> Self {
        Self {
            entity_id: entity.id,
            kind: entity.kind,
            current_hash: entity.current_hash,
            current_version: entity.current_version,
        }
    }
}

/// Last-known chain tips for one remote peer, updated when a session
/// completes. Lets the next HEADS exchange skip entities the peer
/// already holds at the same hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerWatermark {
    pub entities: BTreeMap<EntityId, Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<Timestamp>,
}

impl PeerWatermark {
    /// True if the peer is known to hold `entity_id` at exactly `hash`.
    #[must_use]
    pub fn is_current(&self, entity_id: &EntityId, hash: &Hash) -> bool {
        self.entities.get(entity_id) == Some(hash)
    }

    pub fn record(&mut self, entity_id: EntityId, hash: Hash, at: Timestamp) {
        let _ = self.entities.insert(entity_id, hash);
        self.last_sync_at = Some(at);
    }
}

/// Why a peer refused a packet or a delta.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    HashChainBroken,
    SchemaInvalid,
    Unauthorized,
    EntityUnknown,
    SignatureInvalid,
}

impl RejectReason {
    /// Signature failures are the only rejects that kill the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SignatureInvalid)
    }
}
