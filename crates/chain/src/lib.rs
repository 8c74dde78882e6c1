//! Entity chains: append-only delta logs with verified hash linkage.
//!
//! This crate owns the fabric's core invariant: every entity's state
//! is reconstructible by folding its deltas, and every accepted delta's
//! post-hash is re-derived, never trusted. It provides:
//!
//! - [`store::EntityStore`]: the single-writer in-memory working set of
//!   entity logs (header + chain + materialized state)
//! - [`store::Journal`]: the async persistence seam behind the store
//! - [`verify`]: pure chain verification and fork scanning
//! - [`conflict`]: fork records and their resolution

pub mod conflict;
pub mod error;
pub mod store;
pub mod verify;

pub use error::ChainError;
pub use store::{EntityLog, EntityStore, IngestOutcome};
