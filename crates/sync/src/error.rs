use thiserror::Error;
use weft_primitives::id::{NodeId, SessionId};

use crate::chunk::ChunkError;
use crate::wire::WireError;

/// Errors that end or refuse a session step.
///
/// Per-delta refusals are not errors: they travel back to the peer as
/// REJECT packets and the session keeps going. What lands here is
/// protocol-level: bad framing, wrong state, a peer that fails
/// signature verification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("session {0} not found")]
    UnknownSession(SessionId),

    #[error("protocol mismatch: ours {ours}, peer offered {theirs}")]
    ProtocolMismatch { ours: String, theirs: String },

    #[error("peer echoed nonce {echoed}, expected {expected}")]
    NonceMismatch { expected: u64, echoed: u64 },

    #[error("unexpected {packet} in session state {state}")]
    UnexpectedPacket { state: String, packet: &'static str },

    #[error("packet from {actual} on a session with {expected}")]
    WrongPeer { expected: NodeId, actual: NodeId },

    #[error("peer signature missing or invalid; session killed")]
    SignatureInvalid,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}
