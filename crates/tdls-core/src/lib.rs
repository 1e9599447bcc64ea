//! tdls-core — shared types for the TDLS control plane.
//! All other TDLS crates depend on this one.

pub mod addr;
pub mod config;
pub mod error;
pub mod peer;
pub mod wire;

pub use addr::MacAddr;
pub use error::TdlsError;

use std::fmt;

/// Stable identifier of a radio-interface (vdev) session.
///
/// Ids are what crosses asynchronous boundaries — never live references.
/// Resolution back to session state happens inside the single-consumer
/// event loop, which either finds a live session or treats the event as
/// stale and drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vdev{}", self.0)
    }
}
