//! Splitting oversize deltas into `DELTAS_CHUNK` packets and putting
//! them back together.
//!
//! The chunk payload is a base64 slice of the delta's canonical frame
//! bytes. Chunks are sized so the *encoded* payload fits the peer's
//! packet budget. Reassembly buffers are keyed by delta id and swept
//! by age; a stalled buffer times out silently and the sender may
//! re-emit.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::debug;
use weft_primitives::delta::Delta;
use weft_primitives::id::{DeltaId, NodeId};
use weft_primitives::time::Timestamp;

use crate::wire::{Packet, PacketBody, WireError, ENVELOPE_OVERHEAD};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChunkError {
    #[error("chunk {index} of {total} out of range for delta {delta_id}")]
    IndexOutOfRange {
        delta_id: DeltaId,
        index: u32,
        total: u32,
    },
    #[error("chunk total changed mid-stream for delta {delta_id}: {previous} then {current}")]
    TotalMismatch {
        delta_id: DeltaId,
        previous: u32,
        current: u32,
    },
    #[error("chunk payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("reassembled delta does not parse: {0}")]
    Reassembly(#[source] serde_json::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Raw bytes per chunk such that the base64 text fits the budget.
fn raw_chunk_len(max_packet_bytes: usize) -> usize {
    let budget = max_packet_bytes.saturating_sub(ENVELOPE_OVERHEAD);
    // base64 expands 3 raw bytes into 4 text bytes.
    budget.div_euclid(4).saturating_mul(3).max(1)
}

/// Split one delta into ordered `DELTAS_CHUNK` packets.
pub fn chunk_delta(
    node_id: NodeId,
    delta: &Delta,
    max_packet_bytes: usize,
) -> Result<Vec<Packet>, ChunkError> {
    let bytes = serde_json::to_vec(delta).map_err(WireError::Encode)?;
    let per_chunk = raw_chunk_len(max_packet_bytes);
    let chunks: Vec<&[u8]> = bytes.chunks(per_chunk).collect();
    let total = u32::try_from(chunks.len()).unwrap_or(u32::MAX);

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, slice)| {
            Packet::new(
                node_id,
                PacketBody::DeltasChunk {
                    delta_id: delta.delta_id,
                    chunk_index: u32::try_from(index).unwrap_or(u32::MAX),
                    chunk_total: total,
                    payload: BASE64.encode(slice),
                },
            )
        })
        .collect())
}

#[derive(Debug)]
struct ChunkBuffer {
    total: u32,
    parts: BTreeMap<u32, Vec<u8>>,
    opened_at: Timestamp,
}

/// Per-session reassembly state.
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<DeltaId, ChunkBuffer>,
    timeout_ms: u64,
}

impl Reassembler {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout_ms,
        }
    }

    /// Accept one chunk. Returns the reassembled delta once the full
    /// set is present; duplicates of an already-buffered index are
    /// ignored.
    pub fn accept(
        &mut self,
        delta_id: DeltaId,
        chunk_index: u32,
        chunk_total: u32,
        payload: &str,
        now: Timestamp,
    ) -> Result<Option<Delta>, ChunkError> {
        if chunk_total == 0 || chunk_index >= chunk_total {
            return Err(ChunkError::IndexOutOfRange {
                delta_id,
                index: chunk_index,
                total: chunk_total,
            });
        }

        let buffer = self.buffers.entry(delta_id).or_insert_with(|| ChunkBuffer {
            total: chunk_total,
            parts: BTreeMap::new(),
            opened_at: now,
        });
        if buffer.total != chunk_total {
            let previous = buffer.total;
            return Err(ChunkError::TotalMismatch {
                delta_id,
                previous,
                current: chunk_total,
            });
        }

        let bytes = BASE64.decode(payload)?;
        let _ = buffer.parts.entry(chunk_index).or_insert(bytes);

        if buffer.parts.len() < buffer.total as usize {
            return Ok(None);
        }

        let Some(buffer) = self.buffers.remove(&delta_id) else {
            return Ok(None);
        };
        let assembled: Vec<u8> = buffer.parts.into_values().flatten().collect();
        let delta: Delta =
            serde_json::from_slice(&assembled).map_err(ChunkError::Reassembly)?;
        debug!(%delta_id, "reassembled chunked delta");
        Ok(Some(delta))
    }

    /// Drop buffers older than the reassembly timeout. Returns how
    /// many were abandoned.
    pub fn sweep_stale(&mut self, now: Timestamp) -> usize {
        let timeout = self.timeout_ms;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.saturating_sub(buffer.opened_at) <= timeout);
        before - self.buffers.len()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use weft_primitives::delta::PatchOp;
    use weft_primitives::entity::Author;
    use weft_primitives::hash::Hash;
    use weft_primitives::id::EntityId;

    use super::*;

    fn big_delta() -> Delta {
        Delta {
            delta_id: DeltaId::from_bytes([1; 16]),
            entity_id: EntityId::from_bytes([2; 16]),
            timestamp: Timestamp::from_millis(5),
            author: Author::User,
            patch: vec![PatchOp::add(
                "/blob",
                json!("x".repeat(600)),
            )],
            prev_hash: Hash::genesis(),
            new_hash: Hash::new(b"post"),
        }
    }

    fn unpack(packet: &Packet) -> (DeltaId, u32, u32, String) {
        match &packet.body {
            PacketBody::DeltasChunk {
                delta_id,
                chunk_index,
                chunk_total,
                payload,
            } => (*delta_id, *chunk_index, *chunk_total, payload.clone()),
            other => panic!("expected DELTAS_CHUNK, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_chunks_fit_budget() {
        let delta = big_delta();
        let packets = chunk_delta(NodeId::from_bytes([9; 16]), &delta, 220).unwrap();
        assert!(packets.len() > 1, "600-byte blob must not fit one packet");

        for packet in &packets {
            let (_, _, total, payload) = unpack(packet);
            assert_eq!(total as usize, packets.len());
            assert!(payload.len() <= 220 - ENVELOPE_OVERHEAD);
        }
    }

    #[test]
    fn test_reassembly_roundtrip_any_order() {
        let delta = big_delta();
        let mut packets = chunk_delta(NodeId::from_bytes([9; 16]), &delta, 220).unwrap();
        packets.reverse();

        let mut reassembler = Reassembler::new(10_000);
        let mut result = None;
        for packet in &packets {
            let (id, index, total, payload) = unpack(packet);
            if let Some(done) = reassembler
                .accept(id, index, total, &payload, Timestamp::from_millis(1))
                .unwrap()
            {
                result = Some(done);
            }
        }

        assert_eq!(result.unwrap(), delta);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_minimum_budget_forces_many_chunks() {
        // Budget of overhead + 1 leaves one raw byte per chunk.
        let delta = big_delta();
        let packets =
            chunk_delta(NodeId::from_bytes([9; 16]), &delta, ENVELOPE_OVERHEAD + 1).unwrap();
        let encoded = serde_json::to_vec(&delta).unwrap();
        assert_eq!(packets.len(), encoded.len());

        let mut reassembler = Reassembler::new(10_000);
        let mut result = None;
        for packet in &packets {
            let (id, index, total, payload) = unpack(packet);
            if let Some(done) = reassembler
                .accept(id, index, total, &payload, Timestamp::from_millis(1))
                .unwrap()
            {
                result = Some(done);
            }
        }
        assert_eq!(result.unwrap(), delta);
    }

    #[test]
    fn test_stale_buffers_time_out_silently() {
        let delta = big_delta();
        let packets = chunk_delta(NodeId::from_bytes([9; 16]), &delta, 220).unwrap();
        let (id, index, total, payload) = unpack(&packets[0]);

        let mut reassembler = Reassembler::new(1_000);
        assert!(reassembler
            .accept(id, index, total, &payload, Timestamp::from_millis(0))
            .unwrap()
            .is_none());
        assert_eq!(reassembler.pending(), 1);

        assert_eq!(reassembler.sweep_stale(Timestamp::from_millis(500)), 0);
        assert_eq!(reassembler.sweep_stale(Timestamp::from_millis(1_500)), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let mut reassembler = Reassembler::new(1_000);
        let id = DeltaId::from_bytes([4; 16]);
        drop(reassembler.accept(id, 0, 3, "AAAA", Timestamp::from_millis(0)));
        let err = reassembler
            .accept(id, 1, 4, "AAAA", Timestamp::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, ChunkError::TotalMismatch { .. }));
    }
}
