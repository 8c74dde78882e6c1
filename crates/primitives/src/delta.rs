//! Deltas: the append-only unit of change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Author;
use crate::hash::Hash;
use crate::id::{DeltaId, EntityId};
use crate::time::Timestamp;

/// One structured patch operation, addressed by a root-anchored,
/// slash-segmented path. Numeric segments index arrays; the reserved
/// segment `-` appends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Remove,
    Replace,
}

impl PatchOp {
    #[must_use]
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    #[must_use]
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOpKind::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOpKind::Remove,
            path: path.into(),
            value: None,
        }
    }
}

/// A single append to one entity's hash chain.
///
/// `prev_hash` is the genesis hash for a creation delta, otherwise the
/// `new_hash` of the chain's previous delta. `new_hash` is the
/// chain-grade digest of the state after applying `patch`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub delta_id: DeltaId,
    pub entity_id: EntityId,
    pub timestamp: Timestamp,
    pub author: Author,
    pub patch: Vec<PatchOp>,
    pub prev_hash: Hash,
    pub new_hash: Hash,
}

impl Delta {
    /// A creation delta starts the chain from the genesis hash.
    #[must_use]
    pub fn is_creation(&self) -> bool {
        self.prev_hash.is_genesis()
    }

    /// Canonical in-chain ordering key: timestamp, then delta id.
    #[must_use]
    pub fn chain_key(&self) -> (Timestamp, DeltaId) {
        (self.timestamp, self.delta_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_patch_op_serde_shape() {
        let op = PatchOp::add("/title", json!("t"));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"op": "add", "path": "/title", "value": "t"}));

        let removal = PatchOp::remove("/title");
        let value = serde_json::to_value(&removal).unwrap();
        // No value key at all for removals.
        assert_eq!(value, json!({"op": "remove", "path": "/title"}));
    }

    #[test]
    fn test_creation_detection() {
        let delta = Delta {
            delta_id: DeltaId::from_bytes([1; 16]),
            entity_id: EntityId::from_bytes([2; 16]),
            timestamp: Timestamp::from_millis(10),
            author: Author::User,
            patch: vec![PatchOp::add("/title", json!("t"))],
            prev_hash: Hash::genesis(),
            new_hash: Hash::new(b"state"),
        };
        assert!(delta.is_creation());
    }
}
