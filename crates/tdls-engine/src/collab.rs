//! Collaborator interfaces — the seams to the rest of the driver.
//!
//! All of these are called from inside the single-consumer event loop and
//! must not block. Anything that round-trips to hardware reports its
//! outcome back through [`TdlsHandle`](crate::TdlsHandle) rather than by
//! making the caller wait.

use std::sync::Arc;

use bytes::Bytes;

use tdls_core::peer::PeerParams;
use tdls_core::wire::ActionHeader;
use tdls_core::{MacAddr, SessionId, TdlsError};

use crate::mode::TdlsMode;

/// Higher-level concurrency/mode policy.
///
/// The core calls it, never the reverse except through the event queue.
pub trait ConcurrencyPolicy: Send + Sync {
    /// Number of concurrent radio sessions currently active.
    fn session_count(&self) -> u32;

    /// The session eligible to run TDLS (station or P2P-client), if any.
    fn eligible_session(&self) -> Option<SessionId>;

    /// TDLS enable/disable bookkeeping: +1 when the plane starts using a
    /// session, -1 when it stops.
    fn notify_session_delta(&self, delta: i32);
}

/// Legacy MAC-layer peer messaging.
///
/// Each request is keyed by (session, address) and eventually answered via
/// [`TdlsHandle::peer_command_done`](crate::TdlsHandle::peer_command_done).
pub trait PeerMessaging: Send + Sync {
    fn add_peer(&self, session: SessionId, addr: MacAddr, params: &PeerParams)
        -> Result<(), TdlsError>;
    fn update_peer(&self, session: SessionId, addr: MacAddr, params: &PeerParams)
        -> Result<(), TdlsError>;
    fn delete_peer(&self, session: SessionId, addr: MacAddr) -> Result<(), TdlsError>;
    /// Fire-and-forget MAC-side link state, mirroring the datapath notification.
    fn set_peer_state(&self, session: SessionId, addr: MacAddr, connected: bool)
        -> Result<(), TdlsError>;
}

/// Outbound management-frame transport.
///
/// Bodies are opaque; only the [`ActionHeader`] is structured. Transmit
/// completion arrives via [`TdlsHandle::frame_sent`](crate::TdlsHandle::frame_sent).
pub trait FrameTransport: Send + Sync {
    fn send_action(
        &self,
        session: SessionId,
        dest: MacAddr,
        header: ActionHeader,
        body: Bytes,
    ) -> Result<(), TdlsError>;
}

/// Regulatory/channel-class lookup. Pure function of its inputs.
pub trait RegulatoryLookup: Send + Sync {
    fn operating_class(&self, country: &str, channel: u8, bandwidth_mhz: u16) -> Option<u8>;
}

/// Forwarding-plane registration: tells the datapath a peer is (or is no
/// longer) directly reachable.
pub trait DatapathControl: Send + Sync {
    fn set_peer_connected(&self, session: SessionId, addr: MacAddr, flags: u32, connected: bool);
}

/// Aggregate state pushed to the firmware-facing collaborator whenever the
/// effective mode or any threshold changes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FirmwareTdlsState {
    pub mode: TdlsMode,
    pub off_channel: bool,
    pub buffer_sta: bool,
    pub sleep_sta: bool,
    pub wmm: bool,
    pub max_connected_peers: u32,
    pub rssi_trigger_threshold: i8,
    pub rssi_teardown_threshold: i8,
    pub rssi_delta: i8,
    pub idle_packet_threshold: u32,
    pub idle_timeout_ms: u64,
}

pub trait FirmwareState: Send + Sync {
    fn apply(&self, state: &FirmwareTdlsState);
}

/// The full collaborator bundle handed to engine construction.
#[derive(Clone)]
pub struct Collaborators {
    pub policy: Arc<dyn ConcurrencyPolicy>,
    pub peers: Arc<dyn PeerMessaging>,
    pub frames: Arc<dyn FrameTransport>,
    pub regulatory: Arc<dyn RegulatoryLookup>,
    pub datapath: Arc<dyn DatapathControl>,
    pub firmware: Arc<dyn FirmwareState>,
}
