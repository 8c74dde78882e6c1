//! Opaque 128-bit identifiers.
//!
//! Every identifier in the fabric is the same wire shape: 16 random
//! bytes, displayed as base58. Distinct newtypes keep entity, delta,
//! node and intent ids from being confused for one another; uniqueness
//! is the caller's responsibility.

use core::fmt;
use core::str::FromStr;

use rand::Rng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of an identifier in bytes.
pub const ID_LEN: usize = 16;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("invalid base58: {0}")]
    Encoding(#[from] bs58::decode::Error),
    #[error("expected {ID_LEN} bytes, got {0}")]
    Length(usize),
}

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            #[must_use]
            pub fn random<R: Rng>(rng: &mut R) -> Self {
                Self(rng.gen())
            }

            #[must_use]
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&bs58::encode(&self.0).into_string())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&self.to_string())
                    .finish()
            }
        }

        impl FromStr for $name {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = bs58::decode(s).into_vec()?;
                let bytes: [u8; ID_LEN] = bytes
                    .try_into()
                    .map_err(|e: Vec<u8>| InvalidId::Length(e.len()))?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let encoded = String::deserialize(deserializer)?;
                encoded.parse().map_err(D::Error::custom)
            }
        }
    };
}

id_newtype!(
    /// Identifies one entity for the whole of its life.
    EntityId
);
id_newtype!(
    /// Identifies a single delta in an entity's chain.
    DeltaId
);
id_newtype!(
    /// Identifies a node participating in sync and actuation.
    NodeId
);
id_newtype!(
    /// Identifies an actuation intent. Intents are entities, so this is
    /// interchangeable with the intent entity's [`EntityId`] bytes.
    IntentId
);
id_newtype!(
    /// Identifies a recorded fork between two branches of one entity.
    ConflictId
);
id_newtype!(
    /// Identifies one sync session with one peer.
    SessionId
);

impl From<EntityId> for IntentId {
    fn from(id: EntityId) -> Self {
        Self(*id.as_bytes())
    }
}

impl From<IntentId> for EntityId {
    fn from(id: IntentId) -> Self {
        Self(*id.as_bytes())
    }
}
