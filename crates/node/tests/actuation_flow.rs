//! The actuation pipeline end to end: request, policy, device agent,
//! receipts, TTL, and replay safety.

use std::sync::Arc;

use eyre::Result as EyreResult;
use serde_json::json;
use weft_actuation::agent::testing::ScriptedExecutor;
use weft_node::node::IntentOptions;
use weft_node::{Node, NodeConfig};
use weft_primitives::actuation::{
    ActuationAction, Actuator, ActuatorCapabilities, ActuatorKind, ActuatorStateKind,
    IntentStatus, ReceiptOutcome,
};
use weft_primitives::delta::PatchOp;
use weft_primitives::id::EntityId;
use weft_primitives::time::Timestamp;

fn rig() -> Node {
    let mut node = Node::new(NodeConfig::default())
        .with_executor(Arc::new(ScriptedExecutor::ok()));
    node.set_clock(Timestamp::from_millis(1_000));
    node
}

async fn relay(node: &mut Node) -> EyreResult<(EntityId, EntityId)> {
    let owner = node.node_id();
    Ok(node
        .create_actuator(Actuator {
            name: "Relay1".to_owned(),
            kind: ActuatorKind::Relay,
            owner_node_id: owner,
            capabilities: ActuatorCapabilities::default(),
        })
        .await?)
}

#[tokio::test]
async fn test_authorize_apply_receipt() -> EyreResult<()> {
    let mut node = rig();
    let (actuator, state_entity) = relay(&mut node).await?;

    let intent_id = node
        .request_intent(
            actuator,
            ActuationAction::SetOn,
            None,
            IntentOptions {
                ttl_ms: Some(30_000),
                ..IntentOptions::default()
            },
        )
        .await?;
    assert_eq!(node.intent_status(&intent_id), Some(IntentStatus::Authorized));

    node.tick_device_agent().await?;

    assert_eq!(node.intent_status(&intent_id), Some(IntentStatus::Applied));

    let state = node.get_state(&state_entity).expect("state entity");
    assert_eq!(state["state"], json!("ON"));
    assert_eq!(state["last_applied_intent_id"], json!(intent_id.to_string()));

    let receipt = node.receipt_for(&intent_id).expect("one receipt");
    assert_eq!(receipt.outcome, ReceiptOutcome::Applied);
    assert_eq!(receipt.observed_state, ActuatorStateKind::On);
    Ok(())
}

#[tokio::test]
async fn test_out_of_bounds_is_denied() -> EyreResult<()> {
    let mut node = rig();
    let owner = node.node_id();
    let (actuator, state_entity) = node
        .create_actuator(Actuator {
            name: "Dimmer1".to_owned(),
            kind: ActuatorKind::Dimmer,
            owner_node_id: owner,
            capabilities: ActuatorCapabilities {
                min: Some(0.0),
                max: Some(100.0),
                step: Some(1.0),
                allowed_values: None,
            },
        })
        .await?;
    let before = node.get_state(&state_entity).expect("state entity");

    let intent_id = node
        .request_intent(
            actuator,
            ActuationAction::SetValue,
            Some(999.0),
            IntentOptions::default(),
        )
        .await?;

    assert_eq!(node.intent_status(&intent_id), Some(IntentStatus::Denied));
    let intent_state = node.get_state(&EntityId::from(intent_id)).expect("intent");
    assert_eq!(intent_state["reason"], json!("VALUE_ABOVE_MAX"));

    node.tick_device_agent().await?;

    // No receipt, no actuator-state change.
    assert!(node.receipt_for(&intent_id).is_none());
    assert_eq!(node.get_state(&state_entity).expect("state"), before);
    Ok(())
}

#[tokio::test]
async fn test_ttl_expiry_at_confirmation_and_by_sweep() -> EyreResult<()> {
    let mut node = rig();
    let (actuator, _) = relay(&mut node).await?;

    // Held for confirmation; the clock moves past the TTL meanwhile.
    let held = node
        .request_intent(
            actuator,
            ActuationAction::SetOn,
            None,
            IntentOptions {
                ttl_ms: Some(1_000),
                requires_human_confirm: true,
                ..IntentOptions::default()
            },
        )
        .await?;
    assert_eq!(node.intent_status(&held), Some(IntentStatus::New));

    node.advance_clock(2_000);
    let status = node.confirm_intent(&held).await?;
    assert_eq!(status, IntentStatus::Denied);
    let state = node.get_state(&EntityId::from(held)).expect("intent");
    assert_eq!(state["reason"], json!("INTENT_EXPIRED"));

    // Authorized but never ticked: the sweep ages it out.
    let stale = node
        .request_intent(
            actuator,
            ActuationAction::SetOn,
            None,
            IntentOptions {
                ttl_ms: Some(100),
                ..IntentOptions::default()
            },
        )
        .await?;
    assert_eq!(node.intent_status(&stale), Some(IntentStatus::Authorized));

    node.advance_clock(150);
    let swept = node.sweep_expired_intents()?;
    assert_eq!(swept, 1);
    assert_eq!(node.intent_status(&stale), Some(IntentStatus::Expired));
    let state = node.get_state(&EntityId::from(stale)).expect("intent");
    assert_eq!(state["reason"], json!("TTL_EXCEEDED"));
    Ok(())
}

#[tokio::test]
async fn test_replay_increments_duplicates_prevented() -> EyreResult<()> {
    let mut node = rig();
    let (actuator, _) = relay(&mut node).await?;

    let intent_id = node
        .request_intent(
            actuator,
            ActuationAction::SetOn,
            None,
            IntentOptions::default(),
        )
        .await?;
    node.tick_device_agent().await?;
    assert_eq!(node.intent_status(&intent_id), Some(IntentStatus::Applied));

    // Replay: force the status back to AUTHORIZED on the entity, the
    // way a crashed-and-restored index would see it.
    let _ = node
        .extend_entity(
            EntityId::from(intent_id),
            vec![PatchOp::replace("/status", json!("AUTHORIZED"))],
            weft_primitives::entity::Author::System,
        )
        .await?;

    node.tick_device_agent().await?;

    // One APPLIED transition, one receipt, one duplicate counted.
    assert!(node.receipt_for(&intent_id).is_some());
    assert_eq!(node.metrics().actuation.duplicates_prevented, 1);
    assert_eq!(node.metrics().actuation.intents_applied, 1);
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_denies_fourth_request() -> EyreResult<()> {
    let mut node = rig();
    let (actuator, _) = relay(&mut node).await?;

    let mut statuses = vec![];
    for _ in 0..4 {
        let id = node
            .request_intent(
                actuator,
                ActuationAction::SetOn,
                None,
                IntentOptions::default(),
            )
            .await?;
        statuses.push(node.intent_status(&id).expect("known intent"));
    }

    assert_eq!(
        statuses,
        vec![
            IntentStatus::Authorized,
            IntentStatus::Authorized,
            IntentStatus::Authorized,
            IntentStatus::Denied,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_intent() -> EyreResult<()> {
    let mut node = rig();
    let (actuator, _) = relay(&mut node).await?;

    let intent_id = node
        .request_intent(
            actuator,
            ActuationAction::SetOn,
            None,
            IntentOptions::default(),
        )
        .await?;
    node.cancel_intent(&intent_id).await?;

    assert_eq!(node.intent_status(&intent_id), Some(IntentStatus::Denied));
    let state = node.get_state(&EntityId::from(intent_id)).expect("intent");
    assert_eq!(state["reason"], json!("CANCELLED"));

    // Terminal now: a second cancel refuses.
    assert!(node.cancel_intent(&intent_id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_events_reach_the_dispatcher() -> EyreResult<()> {
    use std::sync::Mutex;
    use weft_node::{EventDispatcher, NodeEvent};

    #[derive(Debug, Default)]
    struct Recorder(Mutex<Vec<NodeEvent>>);

    impl EventDispatcher for Recorder {
        fn dispatch(&self, event: NodeEvent) -> bool {
            self.0.lock().expect("recorder poisoned").push(event);
            true
        }
    }

    let recorder = Arc::new(Recorder::default());
    let mut node = Node::new(NodeConfig::default())
        .with_executor(Arc::new(ScriptedExecutor::ok()))
        .with_dispatcher(recorder.clone());
    node.set_clock(Timestamp::from_millis(1_000));

    let (actuator, _) = relay(&mut node).await?;
    let intent_id = node
        .request_intent(
            actuator,
            ActuationAction::SetOn,
            None,
            IntentOptions::default(),
        )
        .await?;
    node.tick_device_agent().await?;

    let events = recorder.0.lock().expect("recorder poisoned").clone();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, NodeEvent::DeltaApplied { .. })),
        "expected delta events"
    );
    assert!(
        events.iter().any(|e| matches!(
            e,
            NodeEvent::IntentTerminal { intent_id: id, status: IntentStatus::Applied } if *id == intent_id
        )),
        "expected the applied intent event"
    );
    Ok(())
}

#[tokio::test]
async fn test_apply_latency_median_tracked() -> EyreResult<()> {
    let mut node = rig();
    let (actuator, _) = relay(&mut node).await?;

    for _ in 0..3 {
        let _ = node
            .request_intent(
                actuator,
                ActuationAction::SetOn,
                None,
                IntentOptions::default(),
            )
            .await?;
        node.advance_clock(40);
        node.tick_device_agent().await?;
        node.advance_clock(10_000); // reopen the rate-limit window
    }

    assert_eq!(node.metrics().actuation.intents_applied, 3);
    assert_eq!(node.metrics().actuation.apply_latency.median_ms(), Some(40));
    Ok(())
}
