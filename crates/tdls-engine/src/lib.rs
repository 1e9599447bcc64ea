//! tdls-engine — the TDLS control plane.
//!
//! Decides when to establish, maintain, and tear down direct station-to-
//! station links while the station stays associated to its access point.
//! Four tightly coupled pieces: the peer registry and its link-state
//! machine, the connection tracker that samples traffic and RSSI, the
//! command serialization gateway that keeps at most one link command in
//! flight per session, and the mode controller that reconciles independent
//! disable sources into one effective operating mode.
//!
//! Everything mutating runs on one consumer task per device context
//! ([`TdlsEngine::run`]); producers — timers, frame reception, the
//! user-facing [`TdlsHandle`] — only enqueue.

pub mod collab;
pub mod engine;
pub mod event;
pub mod gateway;
pub mod handle;
pub mod mode;
pub mod registry;
pub mod sample;
pub mod session;

mod link;
mod tracker;

pub use collab::{Collaborators, FirmwareTdlsState};
pub use engine::TdlsEngine;
pub use event::InboundAction;
pub use handle::TdlsHandle;
pub use mode::{DisableSource, TdlsMode};
