//! Shared two-node harness: an in-process packet pump standing in for
//! the transport.

use std::collections::VecDeque;
use std::sync::Once;

use eyre::{bail, Result as EyreResult};
use tracing_subscriber::EnvFilter;
use weft_node::Node;
use weft_sync::Packet;

static TRACING: Once = Once::new();

/// Route test logs through `RUST_LOG` once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Make two nodes known to each other.
pub fn introduce(a: &mut Node, b: &mut Node) {
    init_tracing();
    a.register_peer(b.node_info().clone());
    b.register_peer(a.node_info().clone());
}

/// Run one full sync exchange, A initiating, shuttling packets until
/// both sides go quiet.
pub fn sync_nodes(a: &mut Node, b: &mut Node) -> EyreResult<()> {
    let (_, first) = a.open_session(&b.node_id())?;
    let mut to_b: VecDeque<Packet> = first.into();
    let mut to_a: VecDeque<Packet> = VecDeque::new();

    for _ in 0..100_000 {
        if let Some(packet) = to_b.pop_front() {
            to_a.extend(b.route_packet(&packet)?);
        } else if let Some(packet) = to_a.pop_front() {
            to_b.extend(a.route_packet(&packet)?);
        } else {
            let mut moved = false;
            for (_, packets) in a.advance_sessions()? {
                to_b.extend(packets);
                moved = true;
            }
            for (_, packets) in b.advance_sessions()? {
                to_a.extend(packets);
                moved = true;
            }
            if !moved {
                return Ok(());
            }
        }
    }
    bail!("sync exchange did not quiesce")
}

/// Assert that every entity known to both nodes carries the same hash.
pub fn assert_converged(a: &Node, b: &Node, entities: &[weft_primitives::id::EntityId]) {
    for entity_id in entities {
        let ha = a
            .get_entity(entity_id)
            .unwrap_or_else(|| panic!("node A lost {entity_id}"))
            .current_hash;
        let hb = b
            .get_entity(entity_id)
            .unwrap_or_else(|| panic!("node B lost {entity_id}"))
            .current_hash;
        assert_eq!(ha, hb, "entity {entity_id} diverged");
    }
}
