//! The single-consumer dispatch loop.
//!
//! One engine task owns every core data structure — peer tables, gateway,
//! mode controller, counters. Handlers run to completion; nothing in here
//! awaits anything except the next event. Hardware round trips are
//! expressed as "submit command, return" with a callback event resuming
//! the work later. Timers are spawned tasks that post back into the same
//! queue and are invalidated by generation counters, never by reaching
//! into the timer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use tdls_core::config::{ExternalControlLevel, TdlsConfig};
use tdls_core::peer::{ForcedPeer, ForcedPeerCallback, LinkStatus, PeerCapability, ReasonCode};
use tdls_core::{MacAddr, SessionId, TdlsError};

use crate::collab::{Collaborators, FirmwareTdlsState};
use crate::event::Event;
use crate::gateway::{
    Activation, CommandCallback, CommandEvent, CommandGateway, CommandId, CommandKind,
    CommandPayload, CommandRequest,
};
use crate::handle::{SamplerMap, TdlsHandle};
use crate::mode::{DisableSource, ModeController, TdlsMode};
use crate::registry::{apply_link_status, LinkHooks, SlotTable, MAX_PEER_SLOTS};
use crate::session::SessionState;

pub struct TdlsEngine {
    pub(crate) config: TdlsConfig,
    pub(crate) collab: Collaborators,
    pub(crate) mode: ModeController,
    pub(crate) sessions: HashMap<SessionId, SessionState>,
    pub(crate) slots: SlotTable,
    /// Device-wide count of peers in `Connected` — always the sum over all
    /// sessions, maintained by [`apply_link_status`].
    pub(crate) connected_count: u32,
    pub(crate) gateway: CommandGateway,
    pub(crate) samplers: SamplerMap,
    pub(crate) tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl TdlsEngine {
    pub fn new(config: TdlsConfig, collab: Collaborators) -> (Self, TdlsHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let samplers: SamplerMap = Arc::new(DashMap::new());
        let initial = match config.features.external_control {
            ExternalControlLevel::Off => TdlsMode::Implicit,
            ExternalControlLevel::Strict | ExternalControlLevel::Liberal => {
                TdlsMode::ExternalControl
            }
        };
        let handle = TdlsHandle::new(tx.clone(), samplers.clone());
        let engine = Self {
            config,
            collab,
            mode: ModeController::new(initial),
            sessions: HashMap::new(),
            slots: SlotTable::new(MAX_PEER_SLOTS),
            connected_count: 0,
            gateway: CommandGateway::new(),
            samplers,
            tx,
            rx,
        };
        (engine, handle)
    }

    pub fn handle(&self) -> TdlsHandle {
        TdlsHandle::new(self.tx.clone(), self.samplers.clone())
    }

    /// Drain the queue until shutdown. The engine consumes itself — spawn
    /// this on the runtime and keep a [`TdlsHandle`].
    pub async fn run(mut self) {
        tracing::info!(mode = ?self.mode.effective(), "tdls engine starting");
        self.push_firmware_state();
        while let Some(event) = self.rx.recv().await {
            tracing::trace!(event = event.name(), "dispatch");
            if !self.handle_event(event) {
                break;
            }
        }
        tracing::info!("tdls engine stopped");
    }

    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::SessionUp(session) => self.on_session_up(session),
            Event::SessionDown(session) => self.on_session_down(session),

            Event::TrackerTick { session, gen } => self.on_tracker_tick(session, gen),
            Event::IdleTimeout { slot, gen } => self.on_idle_timeout(slot, gen),
            Event::DiscoveryTimeout { session, gen } => self.on_discovery_timeout(session, gen),
            Event::SetupTimeout { session, addr, gen } => self.on_setup_timeout(session, addr, gen),
            Event::CommandTimeout { id } => self.on_command_timeout(id),

            Event::FrameRx { session, frame } => self.on_frame_rx(session, frame),
            Event::FrameSent { session, dialog_token, ok } => {
                self.on_frame_sent(session, dialog_token, ok)
            }
            Event::PeerCommandDone { session, addr, kind, ok } => {
                self.on_peer_command_done(session, addr, kind, ok)
            }
            Event::CommandSettled { session, addr, kind, action, event } => {
                self.on_command_settled(session, addr, kind, action, event)
            }
            Event::RssiReport { session, addr, rssi } => self.on_rssi_report(session, addr, rssi),

            Event::SetMode { mode, source } => self.on_set_mode(mode, source),
            Event::SessionCountChanged { count } => self.on_session_count(count),
            Event::ScanStarted { session } => self.on_scan_started(session),
            Event::ScanDone { session } => self.on_scan_done(session),

            Event::AddForcedPeer { session, addr, channel, op_class, callback } => {
                self.on_add_forced_peer(session, addr, channel, op_class, callback)
            }
            Event::RemoveForcedPeer { session, addr } => self.on_remove_forced_peer(session, addr),
            Event::SetupLink { session, addr } => self.on_setup_link(session, addr),
            Event::TeardownLink { session, addr, reason } => {
                self.on_teardown_link(session, addr, reason)
            }
            Event::ChannelSwitch { session, channel, bandwidth_mhz } => {
                self.on_channel_switch(session, channel, bandwidth_mhz)
            }

            Event::Snapshot { session, reply } => {
                let peers = self
                    .sessions
                    .get(&session)
                    .map(|s| s.peers.snapshot())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }

            Event::Shutdown => {
                let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
                for id in ids {
                    self.on_session_down(id);
                }
                return false;
            }
        }
        true
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Post `event` back into the queue after `delay`. The task cannot be
    /// reached once spawned; correctness comes from generation checks in
    /// the handlers.
    pub(crate) fn arm(&self, delay: Duration, event: Event) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    // ── Session lifecycle ────────────────────────────────────────────────────

    fn on_session_up(&mut self, session: SessionId) {
        if self.sessions.contains_key(&session) {
            tracing::debug!(session = %session, "session already up");
            return;
        }
        // reconcile with the policy's current view before anything starts
        let count = self.collab.policy.session_count();
        self.on_session_count(count);

        let state = SessionState::new(session);
        self.samplers.insert(session, state.sampler.clone());
        self.sessions.insert(session, state);
        tracing::info!(session = %session, "tdls session up");

        self.seed_forced_peers(session);
        if self.mode.is_enabled() {
            self.start_tracker(session);
            self.collab.policy.notify_session_delta(1);
        }
    }

    fn on_session_down(&mut self, session: SessionId) {
        if !self.sessions.contains_key(&session) {
            return;
        }
        self.gateway.flush_session(session);
        self.teardown_session_peers(session, ReasonCode::Unspecified);
        if let Some(mut state) = self.sessions.remove(&session) {
            state.bump_timers();
            state.peers.clear(&mut self.slots);
        }
        self.samplers.remove(&session);
        if self.mode.is_enabled() {
            self.collab.policy.notify_session_delta(-1);
        }
        tracing::info!(session = %session, "tdls session down");
    }

    /// Forced peers named in the config, installed at session start.
    fn seed_forced_peers(&mut self, session: SessionId) {
        let configured: Vec<String> = self.config.features.forced_peers.clone();
        for text in configured {
            let addr: MacAddr = match text.parse() {
                Ok(a) => a,
                Err(_) => {
                    tracing::warn!(value = %text, "ignoring malformed forced peer address");
                    continue;
                }
            };
            self.install_forced_peer(session, addr, 0, 0, None);
        }
    }

    // ── Link-status plumbing ─────────────────────────────────────────────────

    /// Transition one peer, with the registry side effects (connected
    /// count, datapath registration, forced-peer callback).
    pub(crate) fn apply_status(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        new: LinkStatus,
        reason: ReasonCode,
    ) {
        let Some(state) = self.sessions.get_mut(&session) else {
            return;
        };
        let Some(peer) = state.peers.find_mut(addr) else {
            return;
        };
        let mut hooks = LinkHooks {
            session,
            connected_count: &mut self.connected_count,
            datapath: &*self.collab.datapath,
        };
        apply_link_status(peer, new, reason, &mut hooks);
    }

    /// Best-effort drop of every non-idle peer on a session. Failure to
    /// deregister one peer never stops the rest.
    pub(crate) fn teardown_session_peers(&mut self, session: SessionId, reason: ReasonCode) {
        let Some(state) = self.sessions.get(&session) else {
            return;
        };
        let addrs: Vec<(MacAddr, LinkStatus)> =
            state.peers.iter().map(|p| (p.addr, p.status)).collect();
        for (addr, status) in addrs {
            match status {
                LinkStatus::Idle => continue,
                LinkStatus::Connected | LinkStatus::Tearing => {
                    self.apply_status(session, addr, LinkStatus::Tearing, reason);
                    if let Err(error) = self.collab.peers.set_peer_state(session, addr, false) {
                        tracing::warn!(peer = %addr, %error, "set_peer_state failed during teardown");
                    }
                    if let Err(error) = self.collab.peers.delete_peer(session, addr) {
                        tracing::warn!(peer = %addr, %error, "delete_peer failed during teardown");
                    }
                    self.apply_status(session, addr, LinkStatus::Idle, reason);
                }
                _ => {
                    // mid-discovery or mid-setup: drop straight back
                    self.apply_status(session, addr, LinkStatus::Idle, reason);
                }
            }
            if let Some(state) = self.sessions.get_mut(&session) {
                if let Some(peer) = state.peers.find_mut(addr) {
                    peer.invalidate();
                }
            }
        }
        if let Some(state) = self.sessions.get_mut(&session) {
            state.candidate = None;
            state.discovery_outstanding = 0;
        }
    }

    // ── Mode handling ────────────────────────────────────────────────────────

    fn on_set_mode(&mut self, mode: TdlsMode, source: DisableSource) {
        let change = self.mode.request(mode, source);
        self.after_mode_change(change.old, change.new, reason_for(source));
    }

    fn on_session_count(&mut self, count: u32) {
        // TDLS needs exactly one qualifying session; any other count
        // forces Disabled regardless of the other sources.
        let eligible = self.collab.policy.eligible_session();
        let change = if count == 1 && eligible.is_some() {
            self.mode.clear(DisableSource::Concurrency)
        } else {
            tracing::info!(count, eligible = ?eligible, "concurrency forbids tdls");
            self.mode.assert_disable(DisableSource::Concurrency)
        };
        self.after_mode_change(change.old, change.new, ReasonCode::ConcurrencyDisabled);
    }

    fn on_scan_started(&mut self, session: SessionId) {
        if !self.mode.is_enabled() {
            return;
        }
        if self.can_ride_through_scan(session) {
            tracing::debug!(session = %session, "all connected peers buffer, links ride through scan");
            return;
        }
        let change = self.mode.assert_disable(DisableSource::Scan);
        self.after_mode_change(change.old, change.new, ReasonCode::ScanSuspend);
    }

    fn on_scan_done(&mut self, _session: SessionId) {
        let change = self.mode.clear(DisableSource::Scan);
        self.after_mode_change(change.old, change.new, ReasonCode::Unspecified);
    }

    /// A scan can coexist with established links only when every connected
    /// peer (and the device) supports peer buffering.
    fn can_ride_through_scan(&self, session: SessionId) -> bool {
        if !self.config.features.scan || !self.config.features.buffer_sta {
            return false;
        }
        let Some(state) = self.sessions.get(&session) else {
            return true;
        };
        state
            .peers
            .iter()
            .filter(|p| p.status == LinkStatus::Connected)
            .all(|p| p.buffer_sta)
    }

    fn after_mode_change(&mut self, old: TdlsMode, new: TdlsMode, reason: ReasonCode) {
        if old == new {
            return;
        }
        tracing::info!(from = ?old, to = ?new, "effective mode changed");
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        if new == TdlsMode::Disabled {
            // teardown precedes the firmware report
            for id in &ids {
                self.gateway.flush_session(*id);
                if let Some(state) = self.sessions.get_mut(id) {
                    state.bump_timers();
                }
                self.teardown_session_peers(*id, reason);
                self.collab.policy.notify_session_delta(-1);
            }
        } else if old == TdlsMode::Disabled {
            for id in &ids {
                self.start_tracker(*id);
                self.collab.policy.notify_session_delta(1);
            }
        }
        self.push_firmware_state();
    }

    pub(crate) fn push_firmware_state(&self) {
        let t = &self.config.thresholds;
        let f = &self.config.features;
        let state = FirmwareTdlsState {
            mode: self.mode.effective(),
            off_channel: f.off_channel,
            buffer_sta: f.buffer_sta,
            sleep_sta: f.sleep_sta,
            wmm: f.wmm,
            max_connected_peers: f.max_connected_peers,
            rssi_trigger_threshold: t.rssi_trigger_threshold,
            rssi_teardown_threshold: t.rssi_teardown_threshold,
            rssi_delta: t.rssi_delta,
            idle_packet_threshold: t.idle_packet_threshold,
            idle_timeout_ms: t.idle_timeout_ms,
        };
        self.collab.firmware.apply(&state);
    }

    // ── External control ─────────────────────────────────────────────────────

    fn on_add_forced_peer(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        channel: u8,
        op_class: u8,
        callback: Option<ForcedPeerCallback>,
    ) {
        self.install_forced_peer(session, addr, channel, op_class, callback);
    }

    fn install_forced_peer(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        channel: u8,
        op_class: u8,
        callback: Option<ForcedPeerCallback>,
    ) {
        let Some(state) = self.sessions.get_mut(&session) else {
            tracing::warn!(session = %session, "forced peer for unknown session");
            return;
        };
        match state.peers.get_or_create(session, addr, &mut self.slots) {
            Ok(peer) => {
                peer.capability = PeerCapability::Supported;
                if channel != 0 {
                    peer.off_channel = true;
                }
                peer.forced = Some(ForcedPeer { channel, op_class, callback });
                tracing::info!(peer = %addr, session = %session, channel, "forced peer installed");
            }
            Err(error) => {
                tracing::warn!(peer = %addr, %error, "cannot install forced peer");
            }
        }
    }

    fn on_remove_forced_peer(&mut self, session: SessionId, addr: MacAddr) {
        let strict = self.config.features.external_control == ExternalControlLevel::Strict;
        let Some(state) = self.sessions.get_mut(&session) else {
            return;
        };
        let Some(peer) = state.peers.find_mut(addr) else {
            return;
        };
        peer.forced = None;
        let connected = peer.status == LinkStatus::Connected;
        tracing::info!(peer = %addr, session = %session, "forced peer removed");
        // under strict external control an unforced peer may not stay up
        if strict && connected {
            self.start_teardown(session, addr, ReasonCode::PeerDeleted, true);
        }
    }

    // ── Command gateway glue ─────────────────────────────────────────────────

    /// Submit a serialized command. Activation — now or later — dispatches
    /// the actual collaborator call from the command's callback; terminal
    /// failures come back as [`Event::CommandSettled`].
    pub(crate) fn submit_command(
        &mut self,
        kind: CommandKind,
        session: SessionId,
        addr: MacAddr,
        payload: CommandPayload,
    ) {
        let req = CommandRequest {
            session,
            kind,
            addr,
            timeout: self.config.thresholds.command_timeout(),
            payload,
        };
        let cb = self.command_callback();
        match self.gateway.submit(req, cb) {
            Ok((_id, activation)) => self.arm_command_timeout(activation),
            Err(error) => {
                tracing::warn!(kind = ?kind, peer = %addr, %error, "command rejected");
            }
        }
    }

    fn command_callback(&self) -> CommandCallback {
        let collab = self.collab.clone();
        let tx = self.tx.clone();
        Box::new(move |id, req, event| match event {
            CommandEvent::Activated => {
                let result = match (&req.kind, &req.payload) {
                    (CommandKind::AddPeer, CommandPayload::Peer(params)) => {
                        collab.peers.add_peer(req.session, req.addr, params)
                    }
                    (CommandKind::UpdatePeer, CommandPayload::Peer(params)) => {
                        collab.peers.update_peer(req.session, req.addr, params)
                    }
                    (CommandKind::DeletePeer, _) => collab.peers.delete_peer(req.session, req.addr),
                    (CommandKind::SendMgmtFrame, CommandPayload::Frame { header, body }) => collab
                        .frames
                        .send_action(req.session, req.addr, header.clone(), body.clone()),
                    _ => Err(TdlsError::InvalidArgument("command payload does not match kind")),
                };
                if let Err(error) = result {
                    tracing::warn!(cmd = %id, kind = ?req.kind, peer = %req.addr, %error, "command dispatch failed");
                    // surface as an immediate failure completion
                    let _ = match req.kind {
                        CommandKind::SendMgmtFrame => tx.send(Event::FrameSent {
                            session: req.session,
                            dialog_token: req.dialog_token().unwrap_or(0),
                            ok: false,
                        }),
                        kind => tx.send(Event::PeerCommandDone {
                            session: req.session,
                            addr: req.addr,
                            kind,
                            ok: false,
                        }),
                    };
                }
            }
            CommandEvent::Completed => {}
            terminal => {
                let _ = tx.send(Event::CommandSettled {
                    session: req.session,
                    addr: req.addr,
                    kind: req.kind,
                    action: req.action(),
                    event: terminal,
                });
            }
        })
    }

    fn arm_command_timeout(&self, activation: Option<Activation>) {
        if let Some(activation) = activation {
            self.arm(activation.timeout, Event::CommandTimeout { id: activation.id });
        }
    }

    fn on_command_timeout(&mut self, id: CommandId) {
        let next = self.gateway.on_timeout(id);
        self.arm_command_timeout(next);
    }

    fn on_peer_command_done(&mut self, session: SessionId, addr: MacAddr, kind: CommandKind, ok: bool) {
        match self.gateway.complete_active(session, kind) {
            Ok((info, next)) => {
                self.arm_command_timeout(next);
                if info.addr != addr {
                    tracing::warn!(
                        session = %session,
                        expected = %info.addr,
                        got = %addr,
                        "peer command completion for unexpected address"
                    );
                    return;
                }
                self.advance_after_peer_command(session, addr, kind, ok);
            }
            Err(error) => {
                tracing::warn!(session = %session, kind = ?kind, %error, "stale peer command completion");
            }
        }
    }

    fn on_frame_sent(&mut self, session: SessionId, dialog_token: u8, ok: bool) {
        match self.gateway.complete_active(session, CommandKind::SendMgmtFrame) {
            Ok((info, next)) => {
                self.arm_command_timeout(next);
                let _ = dialog_token; // correlation is by lane order; token is log detail
                self.advance_after_frame_sent(session, info.addr, info.action, ok);
            }
            Err(error) => {
                tracing::warn!(session = %session, %error, "stale frame tx completion");
            }
        }
    }

    fn on_command_settled(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        kind: CommandKind,
        action: Option<tdls_core::wire::ActionCode>,
        event: CommandEvent,
    ) {
        debug_assert!(event.is_terminal());
        if event == CommandEvent::Completed {
            return;
        }
        // cancellation and timeout both mean the exchange died mid-flight
        tracing::debug!(
            session = %session,
            peer = %addr,
            kind = ?kind,
            action = ?action,
            outcome = ?event,
            "command failed without completing"
        );
        self.abort_link_attempt(session, addr, ReasonCode::SetupFailure);
    }

    fn on_rssi_report(&mut self, session: SessionId, addr: MacAddr, rssi: i8) {
        if let Some(state) = self.sessions.get_mut(&session) {
            if let Some(peer) = state.peers.find_mut(addr) {
                peer.rssi = rssi;
            }
        }
    }
}

fn reason_for(source: DisableSource) -> ReasonCode {
    match source {
        DisableSource::User => ReasonCode::UserDisabled,
        DisableSource::Concurrency => ReasonCode::ConcurrencyDisabled,
        DisableSource::Scan => ReasonCode::ScanSuspend,
        DisableSource::ExternalControl => ReasonCode::Unspecified,
    }
}
