//! Deterministic intent policy.
//!
//! Rules run in a fixed order and stop at the first failure: expiry,
//! mode legality, value bounds, rate limit. Ownership is deliberately
//! not checked here: the device agent only ever executes intents for
//! locally-owned actuators, and sync carries no ownership enforcement.
//!
//! Evaluation is stateless apart from the per-actuator rate-limit
//! windows, which live on the engine itself (no process globals).

use std::collections::HashMap;

use tracing::debug;
use weft_primitives::actuation::{
    ActuationAction, ActuationIntent, Actuator, ActuatorState, PolicyReason,
};
use weft_primitives::entity::SystemMode;
use weft_primitives::id::{EntityId, NodeId};
use weft_primitives::time::Timestamp;

use crate::config::ActuationConfig;

/// Everything the rules may look at besides the intent itself.
#[derive(Clone, Debug)]
pub struct PolicyContext<'a> {
    pub system_mode: SystemMode,
    pub actuator: &'a Actuator,
    pub actuator_state: Option<&'a ActuatorState>,
    pub requested_by_node: NodeId,
    pub now: Timestamp,
}

#[derive(Copy, Clone, Debug)]
struct RateWindow {
    opened_at: Timestamp,
    count: u32,
}

/// The policy engine: rules plus rate-limit bookkeeping.
#[derive(Debug)]
pub struct PolicyEngine {
    config: ActuationConfig,
    windows: HashMap<EntityId, RateWindow>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(config: ActuationConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Evaluate an intent. `Ok(())` authorizes; a denial names the
    /// first rule that fired. Only a fully-passing evaluation counts
    /// against the rate limit, so a denied intent re-evaluated in an
    /// unchanged context is denied with the same reason.
    pub fn evaluate(
        &mut self,
        actuator_entity_id: EntityId,
        intent: &ActuationIntent,
        ctx: &PolicyContext<'_>,
    ) -> Result<(), PolicyReason> {
        self.check_expiry(intent, ctx)?;
        self.check_mode(ctx)?;
        self.check_bounds(intent, ctx)?;
        self.check_rate_limit(actuator_entity_id, ctx)?;
        Ok(())
    }

    fn check_expiry(
        &self,
        intent: &ActuationIntent,
        ctx: &PolicyContext<'_>,
    ) -> Result<(), PolicyReason> {
        if ctx.now > intent.expires_at {
            return Err(PolicyReason::IntentExpired);
        }
        Ok(())
    }

    fn check_mode(&self, ctx: &PolicyContext<'_>) -> Result<(), PolicyReason> {
        if ctx.system_mode.is_restricted()
            && !self.config.mode_restricted_kinds.contains(&ctx.actuator.kind)
        {
            return Err(PolicyReason::ModeRestrictRecover);
        }
        Ok(())
    }

    fn check_bounds(
        &self,
        intent: &ActuationIntent,
        ctx: &PolicyContext<'_>,
    ) -> Result<(), PolicyReason> {
        if intent.request.action != ActuationAction::SetValue {
            return Ok(());
        }
        let Some(value) = intent.request.value else {
            return Err(PolicyReason::ValueRequired);
        };
        let caps = &ctx.actuator.capabilities;

        if let Some(allowed) = &caps.allowed_values {
            if !allowed.iter().any(|v| *v == value) {
                return Err(PolicyReason::ValueNotAllowed);
            }
        }
        if let Some(min) = caps.min {
            if value < min {
                return Err(PolicyReason::ValueBelowMin);
            }
        }
        if let Some(max) = caps.max {
            if value > max {
                return Err(PolicyReason::ValueAboveMax);
            }
        }
        if let Some(step) = caps.step {
            if step > 0.0 {
                let base = caps.min.unwrap_or(0.0);
                let steps = (value - base) / step;
                if (steps - steps.round()).abs() > 1e-9 {
                    return Err(PolicyReason::ValueNotOnStep);
                }
            }
        }
        Ok(())
    }

    fn check_rate_limit(
        &mut self,
        actuator_entity_id: EntityId,
        ctx: &PolicyContext<'_>,
    ) -> Result<(), PolicyReason> {
        let window_ms = self.config.rate_limit_window_ms;
        let window = self
            .windows
            .entry(actuator_entity_id)
            .or_insert(RateWindow {
                opened_at: ctx.now,
                count: 0,
            });

        if ctx.now.saturating_sub(window.opened_at) > window_ms {
            window.opened_at = ctx.now;
            window.count = 0;
        }
        if window.count >= self.config.rate_limit_max {
            debug!(actuator = %actuator_entity_id, "rate limited");
            return Err(PolicyReason::RateLimited);
        }
        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use weft_primitives::actuation::{
        ActuationRequest, ActuatorCapabilities, ActuatorKind, IntentPolicy, IntentStatus,
    };
    use weft_primitives::entity::Author;
    use weft_primitives::id::NodeId;

    use super::*;

    fn actuator(kind: ActuatorKind, caps: ActuatorCapabilities) -> Actuator {
        Actuator {
            name: "Dimmer1".to_owned(),
            kind,
            owner_node_id: NodeId::from_bytes([1; 16]),
            capabilities: caps,
        }
    }

    fn intent(action: ActuationAction, value: Option<f64>, expires_at: u64) -> ActuationIntent {
        ActuationIntent {
            actuator_id: EntityId::from_bytes([2; 16]),
            requested_by_node: NodeId::from_bytes([1; 16]),
            requested_by_actor: Author::User,
            request: ActuationRequest { action, value },
            policy: IntentPolicy {
                requires_human_confirm: false,
                ttl_ms: 30_000,
            },
            status: IntentStatus::New,
            reason: None,
            created_at: Timestamp::from_millis(0),
            expires_at: Timestamp::from_millis(expires_at),
        }
    }

    fn ctx<'a>(actuator: &'a Actuator, mode: SystemMode, now: u64) -> PolicyContext<'a> {
        PolicyContext {
            system_mode: mode,
            actuator,
            actuator_state: None,
            requested_by_node: NodeId::from_bytes([1; 16]),
            now: Timestamp::from_millis(now),
        }
    }

    #[test]
    fn test_expiry_fires_first() {
        let relay = actuator(ActuatorKind::Relay, ActuatorCapabilities::default());
        let mut engine = PolicyEngine::new(ActuationConfig::default());
        // Expired *and* in restricted mode: expiry wins.
        let result = engine.evaluate(
            EntityId::from_bytes([2; 16]),
            &intent(ActuationAction::SetOn, None, 10),
            &ctx(&relay, SystemMode::Recover, 100),
        );
        assert_eq!(result, Err(PolicyReason::IntentExpired));
    }

    #[test]
    fn test_mode_restriction() {
        let relay = actuator(ActuatorKind::Relay, ActuatorCapabilities::default());
        let toggle = actuator(ActuatorKind::SoftwareToggle, ActuatorCapabilities::default());
        let mut engine = PolicyEngine::new(ActuationConfig::default());

        assert_eq!(
            engine.evaluate(
                EntityId::from_bytes([2; 16]),
                &intent(ActuationAction::SetOn, None, 10_000),
                &ctx(&relay, SystemMode::Recover, 100),
            ),
            Err(PolicyReason::ModeRestrictRecover)
        );
        // Software toggles stay commandable in RECOVER.
        assert_eq!(
            engine.evaluate(
                EntityId::from_bytes([3; 16]),
                &intent(ActuationAction::SetOn, None, 10_000),
                &ctx(&toggle, SystemMode::Recover, 100),
            ),
            Ok(())
        );
    }

    #[test]
    fn test_bounds() {
        let dimmer = actuator(
            ActuatorKind::Dimmer,
            ActuatorCapabilities {
                min: Some(0.0),
                max: Some(100.0),
                step: Some(1.0),
                allowed_values: None,
            },
        );
        let mut engine = PolicyEngine::new(ActuationConfig::default());
        let id = EntityId::from_bytes([2; 16]);

        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, None, 10_000),
                &ctx(&dimmer, SystemMode::Build, 100)
            ),
            Err(PolicyReason::ValueRequired)
        );
        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, Some(999.0), 10_000),
                &ctx(&dimmer, SystemMode::Build, 100)
            ),
            Err(PolicyReason::ValueAboveMax)
        );
        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, Some(-1.0), 10_000),
                &ctx(&dimmer, SystemMode::Build, 100)
            ),
            Err(PolicyReason::ValueBelowMin)
        );
        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, Some(40.5), 10_000),
                &ctx(&dimmer, SystemMode::Build, 100)
            ),
            Err(PolicyReason::ValueNotOnStep)
        );
        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, Some(40.0), 10_000),
                &ctx(&dimmer, SystemMode::Build, 100)
            ),
            Ok(())
        );
    }

    #[test]
    fn test_allowed_values() {
        let valve = actuator(
            ActuatorKind::Servo,
            ActuatorCapabilities {
                min: None,
                max: None,
                step: None,
                allowed_values: Some(vec![0.0, 50.0, 100.0]),
            },
        );
        let mut engine = PolicyEngine::new(ActuationConfig::default());
        let id = EntityId::from_bytes([2; 16]);

        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, Some(30.0), 10_000),
                &ctx(&valve, SystemMode::Build, 100)
            ),
            Err(PolicyReason::ValueNotAllowed)
        );
        assert_eq!(
            engine.evaluate(
                id,
                &intent(ActuationAction::SetValue, Some(50.0), 10_000),
                &ctx(&valve, SystemMode::Build, 100)
            ),
            Ok(())
        );
    }

    #[test]
    fn test_rate_limit_window() {
        let relay = actuator(ActuatorKind::Relay, ActuatorCapabilities::default());
        let mut engine = PolicyEngine::new(ActuationConfig::default());
        let id = EntityId::from_bytes([2; 16]);
        let approve = intent(ActuationAction::SetOn, None, 1_000_000);

        // Three pass inside the window, the fourth is limited.
        for _ in 0..3 {
            assert_eq!(
                engine.evaluate(id, &approve, &ctx(&relay, SystemMode::Build, 100)),
                Ok(())
            );
        }
        assert_eq!(
            engine.evaluate(id, &approve, &ctx(&relay, SystemMode::Build, 200)),
            Err(PolicyReason::RateLimited)
        );
        // Denials do not consume budget: still limited, same reason.
        assert_eq!(
            engine.evaluate(id, &approve, &ctx(&relay, SystemMode::Build, 300)),
            Err(PolicyReason::RateLimited)
        );
        // A fresh window opens after the duration passes.
        assert_eq!(
            engine.evaluate(id, &approve, &ctx(&relay, SystemMode::Build, 20_000)),
            Ok(())
        );
    }
}
