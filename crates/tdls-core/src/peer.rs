//! Peer data model and link-state machine types.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::addr::MacAddr;

// ── Capability and link state ────────────────────────────────────────────────

/// What we know about a peer's TDLS capability.
///
/// Starts `Unknown`; a discovery exchange settles it one way or the other.
/// `NotSupported` is permanent for the lifetime of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerCapability {
    Unknown,
    Supported,
    NotSupported,
}

/// Per-peer link state.
///
/// `Idle` is both the initial state and the state reached after any failure
/// or teardown. `Discovering` and `Connecting` are exclusive session-wide:
/// at most one peer per session may occupy either at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Idle,
    Discovering,
    Discovered,
    Connecting,
    Connected,
    Tearing,
}

impl LinkStatus {
    /// True for the session-wide exclusive "progress" states.
    pub fn is_progress(self) -> bool {
        matches!(self, LinkStatus::Discovering | LinkStatus::Connecting)
    }

    /// Coarse hint reported to forced-peer state-change callbacks.
    pub fn hint(self) -> LinkHint {
        match self {
            LinkStatus::Idle | LinkStatus::Discovering => LinkHint::Disconnected,
            LinkStatus::Discovered | LinkStatus::Connecting => LinkHint::Connecting,
            LinkStatus::Connected => LinkHint::Connected,
            LinkStatus::Tearing => LinkHint::Disconnecting,
        }
    }
}

/// External view of a link state. Callbacks never see the internal
/// six-state machine, only this translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHint {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Why a peer was dropped back toward `Idle`. Numeric for callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReasonCode {
    Unspecified = 1,
    NotSupported = 2,
    SetupFailure = 3,
    LowRssi = 4,
    PeerDeleted = 5,
    ScanSuspend = 6,
    ConcurrencyDisabled = 7,
    UserDisabled = 8,
}

impl ReasonCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

// ── Forced peers ─────────────────────────────────────────────────────────────

/// Payload of a forced-peer state-change callback.
#[derive(Debug, Clone)]
pub struct ForcedPeerUpdate {
    pub addr: MacAddr,
    pub channel: u8,
    pub op_class: u8,
    pub hint: LinkHint,
    pub reason: i32,
}

/// Invoked on every link-status change of a forced peer.
pub type ForcedPeerCallback = Arc<dyn Fn(&ForcedPeerUpdate) + Send + Sync>;

/// External-control bookkeeping for a peer supplied by a higher layer.
///
/// A forced peer bypasses the discovery retry bound and, under strict
/// external control, is the only kind of peer that may be connected.
#[derive(Clone)]
pub struct ForcedPeer {
    pub channel: u8,
    pub op_class: u8,
    pub callback: Option<ForcedPeerCallback>,
}

impl fmt::Debug for ForcedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForcedPeer")
            .field("channel", &self.channel)
            .field("op_class", &self.op_class)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

// ── Peer record ──────────────────────────────────────────────────────────────

/// Parameters handed to the peer-management collaborator on add/update.
#[derive(Debug, Clone, Default)]
pub struct PeerParams {
    pub supported_channels: Vec<u8>,
    pub supported_op_classes: Vec<u8>,
    pub buffer_sta: bool,
    pub off_channel: bool,
    pub qos: bool,
    pub responder: bool,
}

/// One candidate or active direct-link partner.
///
/// Exactly one record exists per (session, address). The record is owned by
/// the session's peer table and only touched from the single-consumer event
/// loop; timer events refer to it by slot id, not by reference.
#[derive(Debug)]
pub struct Peer {
    pub addr: MacAddr,
    pub capability: PeerCapability,
    pub status: LinkStatus,

    /// Discovery attempts this record has burned. Bounded by
    /// `discovery_tries_max` unless the peer is forced.
    pub discovery_attempts: u8,

    /// Per-sampling-interval packet counters, reset by every tracker tick.
    pub tx_pkts: u32,
    pub rx_pkts: u32,

    /// Last-known signal strength in dBm. Zero means never measured.
    pub rssi: i8,

    /// True when the remote side initiated the link.
    pub responder: bool,

    pub supported_channels: Vec<u8>,
    pub supported_op_classes: Vec<u8>,
    pub buffer_sta: bool,
    pub off_channel: bool,
    pub qos: bool,

    pub forced: Option<ForcedPeer>,

    /// Device-wide slot id — what idle-timer events carry instead of a
    /// live reference.
    pub slot: usize,

    /// Idle-teardown timer bookkeeping. A fire whose generation no longer
    /// matches is stale and ignored.
    pub idle_gen: u64,
    pub idle_armed: bool,

    /// Dialog token of the outstanding request toward this peer, zero when
    /// none is in flight.
    pub dialog_token: u8,
}

impl Peer {
    pub fn new(addr: MacAddr, slot: usize) -> Self {
        Self {
            addr,
            capability: PeerCapability::Unknown,
            status: LinkStatus::Idle,
            discovery_attempts: 0,
            tx_pkts: 0,
            rx_pkts: 0,
            rssi: 0,
            responder: false,
            supported_channels: Vec::new(),
            supported_op_classes: Vec::new(),
            buffer_sta: false,
            off_channel: false,
            qos: false,
            forced: None,
            slot,
            idle_gen: 0,
            idle_armed: false,
            dialog_token: 0,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_some()
    }

    /// Packets seen in the current sampling interval.
    pub fn interval_packets(&self) -> u32 {
        self.tx_pkts.saturating_add(self.rx_pkts)
    }

    pub fn reset_counters(&mut self) {
        self.tx_pkts = 0;
        self.rx_pkts = 0;
    }

    /// Collaborator-facing view of the learned capabilities.
    pub fn params(&self) -> PeerParams {
        PeerParams {
            supported_channels: self.supported_channels.clone(),
            supported_op_classes: self.supported_op_classes.clone(),
            buffer_sta: self.buffer_sta,
            off_channel: self.off_channel,
            qos: self.qos,
            responder: self.responder,
        }
    }

    /// Entry invalidation after teardown. The record is retained for reuse
    /// — learned capability survives, link bookkeeping does not.
    pub fn invalidate(&mut self) {
        self.reset_counters();
        self.responder = false;
        self.dialog_token = 0;
        self.idle_armed = false;
        self.idle_gen = self.idle_gen.wrapping_add(1);
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            addr: self.addr.to_string(),
            capability: self.capability,
            status: self.status,
            rssi: self.rssi,
            tx_pkts: self.tx_pkts,
            rx_pkts: self.rx_pkts,
            discovery_attempts: self.discovery_attempts,
            forced: self.is_forced(),
            responder: self.responder,
        }
    }
}

/// Diagnostic view of one peer. Produced through the event queue — never
/// read concurrently off the live record.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub addr: String,
    pub capability: PeerCapability,
    pub status: LinkStatus,
    pub rssi: i8,
    pub tx_pkts: u32,
    pub rx_pkts: u32,
    pub discovery_attempts: u8,
    pub forced: bool,
    pub responder: bool,
}
