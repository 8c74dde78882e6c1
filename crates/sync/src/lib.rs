//! Peer-to-peer delta synchronization.
//!
//! A [`session::SyncSession`] is a bounded, stateful exchange that
//! reconciles two peers' entity chains:
//!
//! ```text
//! initiator                         responder
//!    │ ──────────── HELLO ────────────▶ │
//!    │ ◀─────────── HELLO ───────────── │
//!    │ ──────────── HEADS ────────────▶ │
//!    │ ◀─────────── HEADS ───────────── │
//!    │ ──────────── WANT ─────────────▶ │
//!    │ ◀── DELTAS / DELTAS_CHUNK ────── │
//!    │ ◀─────────── WANT ────────────── │
//!    │ ── ACK / DELTAS / REJECT ──────▶ │
//!    │ ◀─────────── ACK ─────────────── │
//! ```
//!
//! Transport is out of scope: sessions consume and produce [`wire::Packet`]s
//! and the caller shuttles bytes however it likes. Acceptance is
//! delta-by-delta through the chain store, so a session can be dropped
//! at any point without partial state.

pub mod chunk;
pub mod config;
pub mod error;
pub mod queue;
pub mod session;
pub mod wire;

pub use config::SyncConfig;
pub use error::SyncError;
pub use session::{SessionState, SyncSession};
pub use wire::{Packet, PacketBody};
