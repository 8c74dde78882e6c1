//! Two-node sync: convergence after offline work, tiny-packet
//! chunking, empty exchanges, and fork resolution.

mod common;

use eyre::Result as EyreResult;
use serde_json::json;
use weft_chain::conflict::{ConflictStatus, ResolutionKind};
use weft_chain::verify::verify_chain;
use weft_node::{Node, NodeConfig};
use weft_primitives::delta::PatchOp;
use weft_primitives::entity::{Author, EntityKind};
use weft_primitives::time::Timestamp;

use common::{assert_converged, introduce, sync_nodes};

fn node(name: &str) -> Node {
    let mut config = NodeConfig::default();
    config.node_name = name.to_owned();
    let mut node = Node::new(config);
    node.set_clock(Timestamp::from_millis(1_000));
    node
}

#[tokio::test]
async fn test_off_grid_convergence() -> EyreResult<()> {
    let mut a = node("node-a");
    let mut b = node("node-b");
    introduce(&mut a, &mut b);

    // Both start with the identical system_state entity.
    let (system, _) = a
        .create_entity(
            EntityKind::SystemState,
            &json!({"mode": "OBSERVE", "signals": {"open_loops": 3}}),
            Author::System,
        )
        .await?;
    sync_nodes(&mut a, &mut b)?;
    assert_converged(&a, &b, &[system.id]);

    // Node A, offline: a message, a task created and completed, and
    // system-state patches.
    a.advance_clock(50);
    let (message, _) = a
        .create_entity(
            EntityKind::Message,
            &json!({"body": "back online soon", "thread": "ops"}),
            Author::User,
        )
        .await?;
    let (task, _) = a
        .create_entity(
            EntityKind::Task,
            &json!({"title": "reconnect", "status": "OPEN"}),
            Author::User,
        )
        .await?;
    a.advance_clock(10);
    let _ = a
        .extend_entity(
            task.id,
            vec![PatchOp::replace("/status", json!("DONE"))],
            Author::User,
        )
        .await?;
    let _ = a
        .extend_entity(
            system.id,
            vec![
                PatchOp::replace("/signals/open_loops", json!(0)),
                PatchOp::replace("/mode", json!("BUILD")),
            ],
            Author::System,
        )
        .await?;

    // Reconnect.
    a.advance_clock(1_000);
    b.advance_clock(1_060);
    sync_nodes(&mut a, &mut b)?;

    assert_converged(&a, &b, &[system.id, message.id, task.id]);
    assert!(a.conflicts().is_empty(), "no conflicts expected on A");
    assert!(b.conflicts().is_empty(), "no conflicts expected on B");
    assert_eq!(b.get_state(&task.id).expect("task")["status"], json!("DONE"));
    assert_eq!(b.system_mode(), weft_primitives::entity::SystemMode::Build);

    // Watermarks recorded the converged heads.
    let watermark = a.watermark(&b.node_id()).expect("watermark for B");
    assert!(watermark.is_current(&task.id, &a.get_entity(&task.id).expect("task").current_hash));
    Ok(())
}

#[tokio::test]
async fn test_second_exchange_is_empty() -> EyreResult<()> {
    let mut a = node("node-a");
    let mut b = node("node-b");
    introduce(&mut a, &mut b);

    let (entity, _) = a
        .create_entity(EntityKind::Note, &json!({"text": "once"}), Author::User)
        .await?;
    sync_nodes(&mut a, &mut b)?;
    assert_converged(&a, &b, &[entity.id]);

    let sent_before = a.metrics().sync.deltas_sent;
    sync_nodes(&mut a, &mut b)?;

    // Nothing new: no deltas crossed the wire the second time.
    assert_eq!(a.metrics().sync.deltas_sent, sent_before);
    assert_eq!(a.metrics().sync.sessions_completed, 2);
    Ok(())
}

#[tokio::test]
async fn test_chunking_at_minimum_packet_size() -> EyreResult<()> {
    // envelope_overhead + 1: every delta is forced through chunking,
    // one raw byte per chunk.
    let mut config = NodeConfig::default();
    config.sync.max_packet_bytes = weft_sync::wire::ENVELOPE_OVERHEAD + 1;
    let mut a = Node::new(config.clone());
    let mut b = Node::new(config);
    a.set_clock(Timestamp::from_millis(1_000));
    b.set_clock(Timestamp::from_millis(1_000));
    introduce(&mut a, &mut b);

    let (entity, _) = a
        .create_entity(
            EntityKind::Task,
            &json!({"title": "chunky", "notes": "x".repeat(256)}),
            Author::User,
        )
        .await?;
    sync_nodes(&mut a, &mut b)?;

    assert_converged(&a, &b, &[entity.id]);
    assert!(
        a.metrics().sync.chunks_sent > 256,
        "expected one chunk per byte, got {}",
        a.metrics().sync.chunks_sent
    );
    assert_eq!(b.get_state(&entity.id).expect("task")["title"], json!("chunky"));
    Ok(())
}

#[tokio::test]
async fn test_fork_detected_and_resolved() -> EyreResult<()> {
    let mut a = node("node-a");
    let mut b = node("node-b");
    introduce(&mut a, &mut b);

    let (entity, _) = a
        .create_entity(EntityKind::Note, &json!({"n": 0}), Author::User)
        .await?;
    sync_nodes(&mut a, &mut b)?;

    // Divergent extends from the same head on both sides.
    a.advance_clock(10);
    b.advance_clock(20);
    let _ = a
        .extend_entity(
            entity.id,
            vec![PatchOp::replace("/n", json!(1))],
            Author::User,
        )
        .await?;
    let _ = b
        .extend_entity(
            entity.id,
            vec![PatchOp::replace("/n", json!(2))],
            Author::User,
        )
        .await?;

    a.advance_clock(1_000);
    b.advance_clock(1_000);
    sync_nodes(&mut a, &mut b)?;

    // Exactly one conflict on each side.
    let conflicts_a = a.conflicts();
    assert_eq!(conflicts_a.len(), 1);
    assert_eq!(b.conflicts().len(), 1);
    let conflict = &conflicts_a[0];
    assert_eq!(conflict.entity_id, entity.id);
    assert_eq!(conflict.status, ConflictStatus::Detected);
    assert!(!conflict.branch_a.deltas.is_empty());
    assert!(!conflict.branch_b.deltas.is_empty());

    // Resolve on A, taking B's branch.
    let resolution_delta = a
        .resolve_conflict(&conflict.id, ResolutionKind::ChooseB, None)
        .await?;

    let deltas = a.get_deltas(&entity.id, None)?;
    let report = verify_chain(&deltas);
    assert!(report.is_valid(), "resolved chain broken: {:?}", report.failure);
    assert_eq!(deltas.last().expect("chain").delta_id, resolution_delta);

    let state = a.get_state(&entity.id).expect("note");
    assert_eq!(state["n"], json!(2));
    assert!(state.get("_resolution").is_some(), "audit record missing");

    assert_eq!(
        a.conflicts()[0].status,
        ConflictStatus::Resolved,
        "conflict should be closed"
    );
    Ok(())
}
