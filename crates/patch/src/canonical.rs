//! Canonical serialization and the chain-grade hash.
//!
//! Canonical form is compact JSON with lexicographically sorted object
//! keys and serde_json's stable number formatting. Sorting comes for
//! free: `serde_json::Value` maps are `BTreeMap`-backed, so any value
//! built or parsed in this workspace serializes with ordered keys and
//! no whitespace.

use serde_json::Value;
use weft_primitives::hash::Hash;

/// The canonical byte sequence for `value`.
#[must_use]
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Chain-grade (SHA-256) digest of the canonical form.
///
/// Every acceptance boundary (extend, verify, sync) uses this grade;
/// the fast grade in [`crate::fast`] is a change-detection hint only.
#[must_use]
pub fn canonical_hash(value: &Value) -> Hash {
    Hash::new(&canonical_bytes(value))
}
