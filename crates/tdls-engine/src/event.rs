//! Event vocabulary of the single-consumer dispatch loop.
//!
//! Every mutating operation — timer fire, inbound frame, user request,
//! command outcome — is one of these, enqueued by a producer and handled
//! to completion by the engine task.

use bytes::Bytes;
use tokio::sync::oneshot;

use tdls_core::peer::{ForcedPeerCallback, PeerSnapshot, ReasonCode};
use tdls_core::wire::{ActionCode, ActionHeader};
use tdls_core::{MacAddr, SessionId};

use crate::gateway::{CommandEvent, CommandId, CommandKind};
use crate::mode::{DisableSource, TdlsMode};

/// An inbound management action frame, stripped to header + opaque body by
/// the transport collaborator.
#[derive(Debug, Clone)]
pub struct InboundAction {
    pub src: MacAddr,
    pub header: ActionHeader,
    /// Receive signal strength in dBm.
    pub rssi: i8,
    pub body: Bytes,
}

pub enum Event {
    SessionUp(SessionId),
    SessionDown(SessionId),

    // — timers —
    TrackerTick { session: SessionId, gen: u64 },
    IdleTimeout { slot: usize, gen: u64 },
    DiscoveryTimeout { session: SessionId, gen: u64 },
    SetupTimeout { session: SessionId, addr: MacAddr, gen: u64 },
    CommandTimeout { id: CommandId },

    // — collaborator callbacks —
    FrameRx { session: SessionId, frame: InboundAction },
    FrameSent { session: SessionId, dialog_token: u8, ok: bool },
    PeerCommandDone { session: SessionId, addr: MacAddr, kind: CommandKind, ok: bool },
    CommandSettled {
        session: SessionId,
        addr: MacAddr,
        kind: CommandKind,
        action: Option<ActionCode>,
        event: CommandEvent,
    },
    RssiReport { session: SessionId, addr: MacAddr, rssi: i8 },

    // — mode / policy —
    SetMode { mode: TdlsMode, source: DisableSource },
    SessionCountChanged { count: u32 },
    ScanStarted { session: SessionId },
    ScanDone { session: SessionId },

    // — external control and explicit triggers —
    AddForcedPeer {
        session: SessionId,
        addr: MacAddr,
        channel: u8,
        op_class: u8,
        callback: Option<ForcedPeerCallback>,
    },
    RemoveForcedPeer { session: SessionId, addr: MacAddr },
    SetupLink { session: SessionId, addr: MacAddr },
    TeardownLink { session: SessionId, addr: MacAddr, reason: ReasonCode },
    ChannelSwitch { session: SessionId, channel: u8, bandwidth_mhz: u16 },

    // — diagnostics —
    Snapshot { session: SessionId, reply: oneshot::Sender<Vec<PeerSnapshot>> },

    Shutdown,
}

impl Event {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionUp(_) => "session_up",
            Event::SessionDown(_) => "session_down",
            Event::TrackerTick { .. } => "tracker_tick",
            Event::IdleTimeout { .. } => "idle_timeout",
            Event::DiscoveryTimeout { .. } => "discovery_timeout",
            Event::SetupTimeout { .. } => "setup_timeout",
            Event::CommandTimeout { .. } => "command_timeout",
            Event::FrameRx { .. } => "frame_rx",
            Event::FrameSent { .. } => "frame_sent",
            Event::PeerCommandDone { .. } => "peer_command_done",
            Event::CommandSettled { .. } => "command_settled",
            Event::RssiReport { .. } => "rssi_report",
            Event::SetMode { .. } => "set_mode",
            Event::SessionCountChanged { .. } => "session_count_changed",
            Event::ScanStarted { .. } => "scan_started",
            Event::ScanDone { .. } => "scan_done",
            Event::AddForcedPeer { .. } => "add_forced_peer",
            Event::RemoveForcedPeer { .. } => "remove_forced_peer",
            Event::SetupLink { .. } => "setup_link",
            Event::TeardownLink { .. } => "teardown_link",
            Event::ChannelSwitch { .. } => "channel_switch",
            Event::Snapshot { .. } => "snapshot",
            Event::Shutdown => "shutdown",
        }
    }
}
