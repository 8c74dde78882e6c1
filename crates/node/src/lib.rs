//! The Weft node: one process's view of the fabric.
//!
//! [`node::Node`] wires the engines (entity store, chain
//! verification, conflict records, sync sessions, the policy engine
//! and the device agent) behind the programmatic surface the rest of
//! a deployment talks to. The node is single-threaded-cooperative:
//! every mutation happens on the caller's task between suspension
//! points, and the stores are owned, not shared.

pub mod config;
pub mod events;
pub mod metrics;
pub mod node;

pub use config::NodeConfig;
pub use events::{EventDispatcher, NodeEvent};
pub use metrics::Metrics;
pub use node::Node;
