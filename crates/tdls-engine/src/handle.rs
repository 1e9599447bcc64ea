//! Non-blocking producer handle to the engine.
//!
//! Every method is a fire-and-forget enqueue; outcomes arrive through the
//! collaborators and forced-peer callbacks. The only await in this module
//! is [`TdlsHandle::snapshot`], which parks on a oneshot reply that the
//! engine fills from inside the consumer loop — diagnostics go through the
//! queue like everything else, never by reading live state concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use tdls_core::peer::{ForcedPeerCallback, PeerSnapshot, ReasonCode};
use tdls_core::{MacAddr, SessionId, TdlsError};

use crate::event::{Event, InboundAction};
use crate::gateway::CommandKind;
use crate::mode::{DisableSource, TdlsMode};
use crate::sample::TrafficSampler;

/// Map of live per-session sample tables, shared between the engine (which
/// installs/removes them on session up/down) and every handle clone.
pub(crate) type SamplerMap = Arc<DashMap<SessionId, Arc<TrafficSampler>>>;

#[derive(Clone)]
pub struct TdlsHandle {
    tx: mpsc::UnboundedSender<Event>,
    samplers: SamplerMap,
}

impl TdlsHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>, samplers: SamplerMap) -> Self {
        Self { tx, samplers }
    }

    fn send(&self, event: Event) -> Result<(), TdlsError> {
        self.tx
            .send(event)
            .map_err(|_| TdlsError::NotSupported("engine stopped"))
    }

    // — session lifecycle —

    pub fn session_up(&self, session: SessionId) -> Result<(), TdlsError> {
        self.send(Event::SessionUp(session))
    }

    pub fn session_down(&self, session: SessionId) -> Result<(), TdlsError> {
        self.send(Event::SessionDown(session))
    }

    // — traffic sampling (hot path, bypasses the queue by design) —

    /// Record one transmitted frame toward `addr`. Lock-free enough for the
    /// datapath; silently a no-op for sessions the engine does not know.
    pub fn note_tx(&self, session: SessionId, addr: MacAddr) {
        if let Some(sampler) = self.samplers.get(&session) {
            sampler.note_tx(addr);
        }
    }

    /// Record one received frame from `addr`.
    pub fn note_rx(&self, session: SessionId, addr: MacAddr) {
        if let Some(sampler) = self.samplers.get(&session) {
            sampler.note_rx(addr);
        }
    }

    /// Out-of-band RSSI measurement for a known peer.
    pub fn report_rssi(&self, session: SessionId, addr: MacAddr, rssi: i8) -> Result<(), TdlsError> {
        self.send(Event::RssiReport { session, addr, rssi })
    }

    // — collaborator completion paths —

    /// Inbound management action frame from the transport collaborator.
    pub fn frame_rx(&self, session: SessionId, frame: InboundAction) -> Result<(), TdlsError> {
        self.send(Event::FrameRx { session, frame })
    }

    /// Transmit completion for an outbound action frame.
    pub fn frame_sent(&self, session: SessionId, dialog_token: u8, ok: bool) -> Result<(), TdlsError> {
        self.send(Event::FrameSent { session, dialog_token, ok })
    }

    /// Completion callback from the peer-management collaborator.
    pub fn peer_command_done(
        &self,
        session: SessionId,
        addr: MacAddr,
        kind: CommandKind,
        ok: bool,
    ) -> Result<(), TdlsError> {
        self.send(Event::PeerCommandDone { session, addr, kind, ok })
    }

    // — mode / policy —

    pub fn set_mode(&self, mode: TdlsMode, source: DisableSource) -> Result<(), TdlsError> {
        self.send(Event::SetMode { mode, source })
    }

    pub fn session_count_changed(&self, count: u32) -> Result<(), TdlsError> {
        self.send(Event::SessionCountChanged { count })
    }

    pub fn scan_started(&self, session: SessionId) -> Result<(), TdlsError> {
        self.send(Event::ScanStarted { session })
    }

    pub fn scan_done(&self, session: SessionId) -> Result<(), TdlsError> {
        self.send(Event::ScanDone { session })
    }

    // — external control and explicit triggers —

    pub fn add_forced_peer(
        &self,
        session: SessionId,
        addr: MacAddr,
        channel: u8,
        op_class: u8,
        callback: Option<ForcedPeerCallback>,
    ) -> Result<(), TdlsError> {
        if addr.is_multicast() || addr.is_zero() {
            return Err(TdlsError::InvalidArgument("forced peer address must be unicast"));
        }
        self.send(Event::AddForcedPeer { session, addr, channel, op_class, callback })
    }

    pub fn remove_forced_peer(&self, session: SessionId, addr: MacAddr) -> Result<(), TdlsError> {
        self.send(Event::RemoveForcedPeer { session, addr })
    }

    /// Explicit link setup, the only trigger honored in
    /// [`TdlsMode::ExplicitTriggerOnly`].
    pub fn setup_link(&self, session: SessionId, addr: MacAddr) -> Result<(), TdlsError> {
        if addr.is_multicast() || addr.is_zero() {
            return Err(TdlsError::InvalidArgument("peer address must be unicast"));
        }
        self.send(Event::SetupLink { session, addr })
    }

    pub fn teardown_link(
        &self,
        session: SessionId,
        addr: MacAddr,
        reason: ReasonCode,
    ) -> Result<(), TdlsError> {
        self.send(Event::TeardownLink { session, addr, reason })
    }

    /// Ask one connected peer to move the direct link to another channel.
    pub fn request_channel_switch(
        &self,
        session: SessionId,
        channel: u8,
        bandwidth_mhz: u16,
    ) -> Result<(), TdlsError> {
        if channel == 0 {
            return Err(TdlsError::InvalidArgument("channel must be nonzero"));
        }
        self.send(Event::ChannelSwitch { session, channel, bandwidth_mhz })
    }

    // — diagnostics —

    /// Peer listing for one session, produced inside the consumer loop.
    pub async fn snapshot(&self, session: SessionId) -> Result<Vec<PeerSnapshot>, TdlsError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Snapshot { session, reply })?;
        rx.await.map_err(|_| TdlsError::NotSupported("engine stopped"))
    }

    /// Stop the engine. Idempotent; outstanding events ahead of the
    /// shutdown marker are still handled.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}
