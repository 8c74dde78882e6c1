//! Per-subsystem counters and the apply-latency median tracker.
//!
//! Plain snapshot structs: the node owns one `Metrics`, mutates it
//! from the core loop, and hands out copies. `reset` swaps the whole
//! thing in one assignment, which is atomic with respect to the loop.

use std::collections::VecDeque;

/// Rolling window of latency samples with an incrementally maintained
/// sorted mirror, so the median is O(1) to read.
#[derive(Clone, Debug)]
pub struct LatencyTracker {
    window: VecDeque<u64>,
    sorted: Vec<u64>,
    capacity: usize,
}

impl LatencyTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            sorted: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample_ms: u64) {
        if self.window.len() == self.capacity {
            if let Some(evicted) = self.window.pop_front() {
                if let Ok(at) = self.sorted.binary_search(&evicted) {
                    let _ = self.sorted.remove(at);
                }
            }
        }
        self.window.push_back(sample_ms);
        let at = self.sorted.partition_point(|s| *s <= sample_ms);
        self.sorted.insert(at, sample_ms);
    }

    /// Median of the current window; even windows average the two
    /// middle samples.
    #[must_use]
    pub fn median_ms(&self) -> Option<u64> {
        if self.sorted.is_empty() {
            return None;
        }
        let mid = self.sorted.len().div_euclid(2);
        if self.sorted.len() % 2 == 1 {
            Some(self.sorted[mid])
        } else {
            Some(self.sorted[mid - 1].midpoint(self.sorted[mid]))
        }
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.window.len()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ActuationMetrics {
    pub intents_requested: u64,
    pub intents_authorized: u64,
    pub intents_denied: u64,
    pub intents_applied: u64,
    pub intents_failed: u64,
    pub intents_expired: u64,
    pub duplicates_prevented: u64,
    pub apply_latency: LatencyTracker,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SyncMetrics {
    pub sessions_opened: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub deltas_sent: u64,
    pub deltas_received: u64,
    pub rejects_sent: u64,
    pub rejects_received: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub queue_dropped: u64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ChainMetrics {
    pub entities_created: u64,
    pub deltas_appended: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
}

/// Update counters for locally-authored scene-stream deltas.
#[derive(Copy, Clone, Debug, Default)]
pub struct SceneMetrics {
    pub tile_updates: u64,
    pub object_updates: u64,
    pub light_updates: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub actuation: ActuationMetrics,
    pub sync: SyncMetrics,
    pub chain: ChainMetrics,
    pub scene: SceneMetrics,
}

impl Metrics {
    /// Drop every counter and sample at once.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
