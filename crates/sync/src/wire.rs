//! Wire packets.
//!
//! Every packet is one canonical-JSON frame: `{type, node_id, ...body,
//! sig?}`. Canonical form (sorted keys, no whitespace, stable numbers)
//! is what gets hashed and signed, with the `sig` field excluded from
//! the signable bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weft_patch::canonical_bytes;
use weft_primitives::delta::Delta;
use weft_primitives::hash::Hash;
use weft_primitives::id::{DeltaId, EntityId, NodeId};
use weft_primitives::identity::{PrivateKey, PublicKey, Signature};
use weft_primitives::sync::{Capabilities, EntityHead, RejectReason};

/// Approximate per-packet framing cost (type tag, node id, signature
/// slot) budgeted out of `max_packet_bytes` before payload.
pub const ENVELOPE_OVERHEAD: usize = 50;

/// One WANT entry: "send me `entity_id` strictly after `since_hash`"
/// (genesis means the whole chain).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantEntry {
    pub entity_id: EntityId,
    pub since_hash: Hash,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketBody {
    Hello {
        protocol_version: String,
        caps: Capabilities,
        nonce: u64,
    },
    Heads {
        heads: Vec<EntityHead>,
    },
    Want {
        entries: Vec<WantEntry>,
    },
    Deltas {
        deltas: Vec<Delta>,
    },
    DeltasChunk {
        delta_id: DeltaId,
        chunk_index: u32,
        chunk_total: u32,
        /// Base64 of a slice of the delta's canonical bytes.
        payload: String,
    },
    Ack {
        delta_ids: Vec<DeltaId>,
    },
    Reject {
        reason: RejectReason,
        details: String,
    },
}

impl PacketBody {
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Heads { .. } => "HEADS",
            Self::Want { .. } => "WANT",
            Self::Deltas { .. } => "DELTAS",
            Self::DeltasChunk { .. } => "DELTAS_CHUNK",
            Self::Ack { .. } => "ACK",
            Self::Reject { .. } => "REJECT",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub body: PacketBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    #[error("packet encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("packet decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Packet {
    #[must_use]
    pub const fn new(node_id: NodeId, body: PacketBody) -> Self {
        Self {
            node_id,
            body,
            sig: None,
        }
    }

    /// Canonical frame bytes, signature included if present.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let value = serde_json::to_value(self).map_err(WireError::Encode)?;
        Ok(canonical_bytes(&value))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(WireError::Decode)
    }

    /// Encoded size of the packet as it would go on the wire.
    pub fn encoded_len(&self) -> Result<usize, WireError> {
        Ok(self.encode()?.len())
    }

    /// The bytes a signature covers: the canonical frame with `sig`
    /// absent.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, WireError> {
        let unsigned = Self {
            node_id: self.node_id,
            body: self.body.clone(),
            sig: None,
        };
        let value = serde_json::to_value(&unsigned).map_err(WireError::Encode)?;
        Ok(canonical_bytes(&value))
    }

    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), WireError> {
        let bytes = self.signable_bytes()?;
        self.sig = Some(key.sign(&bytes));
        Ok(())
    }

    /// True only when a signature is present and verifies.
    pub fn verify_signature(&self, key: &PublicKey) -> Result<bool, WireError> {
        let Some(sig) = &self.sig else {
            return Ok(false);
        };
        Ok(key.verify(&self.signable_bytes()?, sig))
    }
}
