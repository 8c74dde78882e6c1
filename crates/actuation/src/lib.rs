//! The actuation engine: policy-gated, idempotent command delivery.
//!
//! Every command is an `actuation_intent` entity moving through a
//! fixed state machine (`NEW → AUTHORIZED → DISPATCHED → APPLIED`,
//! with `DENIED`/`EXPIRED`/`FAILED` as the other exits), evaluated by
//! a deterministic [`policy::PolicyEngine`], executed by the
//! [`agent::DeviceAgent`] on the actuator's owning node, and closed by
//! exactly one `actuation_receipt` entity. All of it is ordinary
//! entity state: the chain, not the process, is the record.

pub mod agent;
pub mod config;
pub mod error;
pub mod machine;
pub mod policy;
pub mod store;

pub use agent::{DeviceAgent, Executor, ExecutorOutcome};
pub use config::ActuationConfig;
pub use error::ActuationError;
pub use policy::{PolicyContext, PolicyEngine};
pub use store::IntentStore;
