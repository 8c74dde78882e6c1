//! Actuation-layer tunables.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use weft_primitives::actuation::ActuatorKind;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ActuationConfig {
    /// Sliding-window length for the per-actuator rate limit.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_ms: u64,
    /// Intents allowed per actuator per window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
    /// TTL applied when an intent creator does not supply one.
    #[serde(default = "default_intent_ttl")]
    pub intent_ttl_default_ms: u64,
    /// Period of the device agent's TTL check.
    #[serde(default = "default_sweep_interval")]
    pub expiry_sweep_interval_ms: u64,
    /// Actuator kinds that may still be commanded in the restricted
    /// (RECOVER) mode.
    #[serde(default = "default_restricted_kinds")]
    pub mode_restricted_kinds: BTreeSet<ActuatorKind>,
}

const fn default_rate_limit_window() -> u64 {
    10_000
}

const fn default_rate_limit_max() -> u32 {
    3
}

const fn default_intent_ttl() -> u64 {
    30_000
}

const fn default_sweep_interval() -> u64 {
    5_000
}

fn default_restricted_kinds() -> BTreeSet<ActuatorKind> {
    BTreeSet::from([ActuatorKind::SoftwareToggle])
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_ms: default_rate_limit_window(),
            rate_limit_max: default_rate_limit_max(),
            intent_ttl_default_ms: default_intent_ttl(),
            expiry_sweep_interval_ms: default_sweep_interval(),
            mode_restricted_kinds: default_restricted_kinds(),
        }
    }
}
