//! Sync-layer tunables.

use serde::{Deserialize, Serialize};
use weft_primitives::sync::DEFAULT_MAX_PACKET_BYTES;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SyncConfig {
    /// Upper bound on an emitted packet. Smaller values force more
    /// chunking.
    #[serde(default = "default_max_packet_bytes")]
    pub max_packet_bytes: usize,
    #[serde(default = "default_true")]
    pub supports_chunking: bool,
    #[serde(default)]
    pub supports_signing: bool,
    /// Abandon stalled chunk reassembly buffers after this long.
    #[serde(default = "default_reassembly_timeout")]
    pub chunk_reassembly_timeout_ms: u64,
    /// Deltas accepted from one inbound packet before the session
    /// defers the rest (backpressure; ACKs arrive late, not never).
    #[serde(default = "default_inbound_budget")]
    pub inbound_batch_limit: usize,
    /// Emission queue bound; lower-priority entries drop first.
    #[serde(default = "default_queue_capacity")]
    pub emission_queue_capacity: usize,
}

const fn default_max_packet_bytes() -> usize {
    DEFAULT_MAX_PACKET_BYTES
}

const fn default_true() -> bool {
    true
}

const fn default_reassembly_timeout() -> u64 {
    30_000
}

const fn default_inbound_budget() -> usize {
    64
}

const fn default_queue_capacity() -> usize {
    1_024
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_packet_bytes: default_max_packet_bytes(),
            supports_chunking: true,
            supports_signing: false,
            chunk_reassembly_timeout_ms: default_reassembly_timeout(),
            inbound_batch_limit: default_inbound_budget(),
            emission_queue_capacity: default_queue_capacity(),
        }
    }
}
