//! Error taxonomy for the TDLS control plane.

use thiserror::Error;

/// Errors surfaced by control-plane APIs.
///
/// Link and hardware failures never show up here — those resolve into a
/// state transition plus a [`ReasonCode`](crate::peer::ReasonCode) delivered
/// asynchronously. This enum covers only what a caller did wrong or what
/// the plane cannot take on right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TdlsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Progress exclusivity: another peer is already being driven through
    /// discovery or setup on this session.
    #[error("another link operation is in progress")]
    Busy,

    #[error("serialized command timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}
