//! Ames protocol core logic.
//!
//! This crate contains the pure state machines of the Ames transport:
//! per-peer reliable message flows (pump and sink), the packet-level
//! congestion controller, packet sealing, the peer lifecycle, and the
//! top-level event dispatcher. It is completely decoupled from I/O,
//! enabling deterministic testing and replay from an event log.
//!
//! # Architecture
//!
//! Protocol logic is strictly separated from transport concerns:
//!
//! ```text
//!      ┌───────────────────────────────┐
//!      │ ames-core                     │
//!      │ - peer / flow state machines  │
//!      │ - congestion control          │
//!      │ - packet sealing              │
//!      └───────────────────────────────┘
//!         ↓                      ↓
//! ┌────────────────┐  ┌──────────────────┐
//! │ ames-harness   │  │ production host  │
//! │ - virtual time │  │ - UDP sockets    │
//! │ - fault inject │  │ - system timers  │
//! └────────────────┘  └──────────────────┘
//! ```
//!
//! # Key principles
//!
//! - No I/O in core: never open a socket, never read the clock, never pull
//!   entropy. Time arrives as a `now: Instant` parameter on every handler.
//! - One event at a time: [`Ames::handle`](ames::Ames::handle) processes a
//!   single [`Task`](task::Task) to completion and returns the complete
//!   list of [`Effect`](task::Effect)s; the host executes them.
//! - Determinism: the same task sequence with the same timestamps produces
//!   the same effects, which is what makes event-log replay possible.
//!
//! # Modules
//!
//! - [`ames`]: top-level state and event dispatch
//! - [`peer`]: per-peer state (routes, QoS, ossuary, flows, alien agendas)
//! - [`pump`]: outbound flow engine and its congestion controller
//! - [`sink`]: inbound flow engine (reassembly, ack scheduling)
//! - [`crypto`]: key derivation, packet sealing, comet attestation
//! - [`channel`]: the per-event identity/key view
//! - [`task`]: the closed task and effect sums
//! - [`save`]: versioned snapshots and the migration ladder

pub mod ames;
pub mod channel;
pub mod crypto;
pub mod error;
pub mod peer;
pub mod pump;
pub mod save;
pub mod sink;
pub mod task;

pub use ames::Ames;
pub use channel::Channel;
pub use error::AmesError;
pub use task::{Effect, Task};
