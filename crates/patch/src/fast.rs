//! Fast, non-authoritative equality digests.
//!
//! A keyed 64-bit ahash over the canonical bytes, widened to the chain
//! hash width by zero padding. Useful for cheap has-anything-changed
//! checks on streaming deltas; never valid at an acceptance boundary,
//! which is why this type is distinct from
//! [`weft_primitives::hash::Hash`] and does not convert into it.

use std::hash::BuildHasher as _;

use ahash::RandomState;
use serde_json::Value;

use crate::canonical::canonical_bytes;

/// Widened fast digest. Equality of two digests produced by the *same*
/// keyed hasher is a strong hint, not proof, of equal states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FastDigest([u8; 32]);

impl FastDigest {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn from_word(word: u64) -> Self {
        let mut bytes = [0_u8; 32];
        bytes[..8].copy_from_slice(&word.to_le_bytes());
        Self(bytes)
    }
}

/// A keyed fast hasher. Two hashers built from the same seed agree on
/// digests; different seeds intentionally do not.
#[derive(Clone, Debug)]
pub struct FastHasher {
    state: RandomState,
}

impl FastHasher {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: RandomState::with_seeds(
                seed,
                seed.rotate_left(17),
                seed.rotate_left(31),
                seed.rotate_left(47),
            ),
        }
    }

    #[must_use]
    pub fn digest(&self, value: &Value) -> FastDigest {
        FastDigest::from_word(self.state.hash_one(canonical_bytes(value)))
    }
}
