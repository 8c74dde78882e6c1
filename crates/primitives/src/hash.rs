use core::fmt;
use core::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Width of a content hash in bytes.
pub const HASH_LEN: usize = 32;

/// A 256-bit content digest over the canonical form of an entity state.
///
/// The all-zero value is the distinguished *genesis* hash: it marks the
/// pre-creation state of every entity and is the `prev_hash` of every
/// creation delta.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Digest arbitrary bytes with the chain-grade (SHA-256) hash.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// The distinguished all-zero genesis hash.
    #[must_use]
    pub const fn genesis() -> Self {
        Self([0; HASH_LEN])
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.0 == [0; HASH_LEN]
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_string()).finish()
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidHash {
    #[error("invalid base58: {0}")]
    Encoding(#[from] bs58::decode::Error),
    #[error("expected {HASH_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for Hash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let bytes: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|e: Vec<u8>| InvalidHash::Length(e.len()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}
