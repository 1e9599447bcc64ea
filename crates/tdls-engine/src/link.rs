//! Link establishment and teardown — inbound frame correlation plus the
//! serialized command progression that moves a peer between `Idle` and
//! `Connected`.
//!
//! Initiator: AddPeer → SetupRequest → (SetupResponse) → SetupConfirm →
//! UpdatePeer → Connected. Responder: AddPeer → SetupResponse →
//! (SetupConfirm) → UpdatePeer → Connected. Every command goes through the
//! gateway; every wait is a timer event, never a blocking call.

use bytes::Bytes;

use tdls_core::peer::{LinkStatus, PeerCapability, ReasonCode};
use tdls_core::wire::{status_code, ActionCode, ActionHeader};
use tdls_core::{MacAddr, SessionId};

use crate::engine::TdlsEngine;
use crate::event::{Event, InboundAction};
use crate::gateway::{CommandKind, CommandPayload};

impl TdlsEngine {
    // ── Inbound frames ───────────────────────────────────────────────────────

    pub(crate) fn on_frame_rx(&mut self, session: SessionId, frame: InboundAction) {
        if !self.mode.is_enabled() {
            tracing::debug!(peer = %frame.src, "inbound frame dropped, tdls disabled");
            return;
        }
        if !self.sessions.contains_key(&session) {
            tracing::warn!(session = %session, "inbound frame for unknown session");
            return;
        }
        // any frame from a known peer refreshes its RSSI
        if frame.rssi != 0 {
            if let Some(state) = self.sessions.get_mut(&session) {
                if let Some(peer) = state.peers.find_mut(frame.src) {
                    peer.rssi = frame.rssi;
                }
            }
        }
        let raw_action = frame.header.action;
        let Some(action) = frame.header.action_code() else {
            tracing::warn!(peer = %frame.src, value = raw_action, "unknown action code dropped");
            return;
        };
        match action {
            ActionCode::DiscoveryRequest => self.on_discovery_request(session, &frame),
            ActionCode::DiscoveryResponse => self.on_discovery_response(session, &frame),
            ActionCode::SetupRequest => self.on_setup_request(session, &frame),
            ActionCode::SetupResponse => self.on_setup_response(session, &frame),
            ActionCode::SetupConfirm => self.on_setup_confirm(session, &frame),
            ActionCode::Teardown => self.on_teardown_frame(session, &frame),
            ActionCode::PeerTrafficIndication => self.on_peer_traffic_indication(session, &frame),
            ActionCode::ChannelSwitchResponse => {
                let status = frame.header.status;
                tracing::info!(peer = %frame.src, status, "channel switch response");
            }
            other => {
                tracing::debug!(peer = %frame.src, action = ?other, "action not handled");
            }
        }
    }

    /// A sleeping peer announces buffered frames for us; acknowledge so it
    /// can deliver and go back to doze. Only meaningful on a live link.
    fn on_peer_traffic_indication(&mut self, session: SessionId, frame: &InboundAction) {
        let token = frame.header.dialog_token;
        let connected = self
            .sessions
            .get(&session)
            .and_then(|s| s.peers.find(frame.src))
            .map(|p| p.status == LinkStatus::Connected)
            .unwrap_or(false);
        if !connected {
            tracing::debug!(peer = %frame.src, "traffic indication without a link");
            return;
        }
        self.submit_command(
            CommandKind::SendMgmtFrame,
            session,
            frame.src,
            CommandPayload::Frame {
                header: ActionHeader::response(
                    token,
                    ActionCode::PeerTrafficResponse,
                    status_code::SUCCESS,
                    false,
                ),
                body: Bytes::new(),
            },
        );
    }

    /// Someone probes us: answer with our capabilities and remember theirs.
    fn on_discovery_request(&mut self, session: SessionId, frame: &InboundAction) {
        let token = frame.header.dialog_token;
        {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            match state.peers.get_or_create(session, frame.src, &mut self.slots) {
                Ok(peer) => {
                    peer.capability = PeerCapability::Supported;
                }
                Err(error) => {
                    tracing::warn!(peer = %frame.src, %error, "cannot track discovering peer");
                    return;
                }
            }
        }
        tracing::info!(peer = %frame.src, token, "answering discovery request");
        self.submit_command(
            CommandKind::SendMgmtFrame,
            session,
            frame.src,
            CommandPayload::Frame {
                header: ActionHeader::response(
                    token,
                    ActionCode::DiscoveryResponse,
                    status_code::SUCCESS,
                    true,
                ),
                body: Bytes::new(),
            },
        );
    }

    /// Responder side of setup. Progress exclusivity and the connected-peer
    /// cap decide between accepting and declining.
    fn on_setup_request(&mut self, session: SessionId, frame: &InboundAction) {
        let addr = frame.src;
        let token = frame.header.dialog_token;
        let max_peers = self.config.features.max_connected_peers;

        let decline = {
            let Some(state) = self.sessions.get(&session) else {
                return;
            };
            state.peers.in_progress(Some(addr)).is_some() || self.connected_count >= max_peers
        };
        if decline {
            tracing::info!(peer = %addr, "declining setup request");
            self.submit_command(
                CommandKind::SendMgmtFrame,
                session,
                addr,
                CommandPayload::Frame {
                    header: ActionHeader::response(
                        token,
                        ActionCode::SetupResponse,
                        status_code::REQUEST_DECLINED,
                        true,
                    ),
                    body: Bytes::new(),
                },
            );
            return;
        }

        let params = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            state.candidate = Some(addr);
            match state.peers.get_or_create(session, addr, &mut self.slots) {
                Ok(peer) => {
                    peer.capability = PeerCapability::Supported;
                    peer.responder = true;
                    peer.dialog_token = token;
                    peer.params()
                }
                Err(error) => {
                    tracing::warn!(peer = %addr, %error, "cannot accept setup request");
                    return;
                }
            }
        };
        tracing::info!(peer = %addr, token, "accepting setup request");
        self.apply_status(session, addr, LinkStatus::Connecting, ReasonCode::Unspecified);
        self.submit_command(CommandKind::AddPeer, session, addr, CommandPayload::Peer(params));
    }

    /// Initiator side: the peer answered our setup request.
    fn on_setup_response(&mut self, session: SessionId, frame: &InboundAction) {
        let addr = frame.src;
        let token = frame.header.dialog_token;
        let status = frame.header.status;

        {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            let Some(peer) = state.peers.find_mut(addr) else {
                tracing::debug!(peer = %addr, "setup response from unknown peer");
                return;
            };
            if peer.status != LinkStatus::Connecting || peer.responder {
                tracing::debug!(peer = %addr, status = ?peer.status, "unsolicited setup response");
                return;
            }
            if peer.dialog_token != token {
                tracing::warn!(
                    peer = %addr,
                    expected = peer.dialog_token,
                    got = token,
                    "mismatched dialog token in setup response"
                );
                return;
            }
            // answer arrived, response timer is now stale
            state.setup_gen += 1;
        }

        if status != status_code::SUCCESS {
            tracing::info!(peer = %addr, status, "setup request declined by peer");
            self.fail_setup(session, addr, true);
            return;
        }
        self.submit_command(
            CommandKind::SendMgmtFrame,
            session,
            addr,
            CommandPayload::Frame {
                header: ActionHeader::request(token, ActionCode::SetupConfirm),
                body: Bytes::new(),
            },
        );
    }

    /// Responder side: the initiator confirmed; promote once firmware knows.
    fn on_setup_confirm(&mut self, session: SessionId, frame: &InboundAction) {
        let addr = frame.src;
        let token = frame.header.dialog_token;
        let status = frame.header.status;

        let params = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            let Some(peer) = state.peers.find_mut(addr) else {
                return;
            };
            if peer.status != LinkStatus::Connecting || !peer.responder {
                tracing::debug!(peer = %addr, status = ?peer.status, "unsolicited setup confirm");
                return;
            }
            if peer.dialog_token != token {
                tracing::warn!(
                    peer = %addr,
                    expected = peer.dialog_token,
                    got = token,
                    "mismatched dialog token in setup confirm"
                );
                return;
            }
            let params = peer.params();
            state.setup_gen += 1;
            params
        };

        if status != status_code::SUCCESS {
            self.fail_setup(session, addr, true);
            return;
        }
        self.submit_command(CommandKind::UpdatePeer, session, addr, CommandPayload::Peer(params));
    }

    /// The peer tore the link down (or aborted a setup in flight).
    fn on_teardown_frame(&mut self, session: SessionId, frame: &InboundAction) {
        let addr = frame.src;
        let status = frame.header.status;
        let Some(link_status) = self
            .sessions
            .get(&session)
            .and_then(|s| s.peers.find(addr))
            .map(|p| p.status)
        else {
            return;
        };
        match link_status {
            LinkStatus::Connected => {
                tracing::info!(peer = %addr, status, "peer tore down the link");
                self.apply_status(session, addr, LinkStatus::Tearing, ReasonCode::PeerDeleted);
                if let Err(error) = self.collab.peers.set_peer_state(session, addr, false) {
                    tracing::warn!(peer = %addr, %error, "set_peer_state failed");
                }
                self.submit_command(CommandKind::DeletePeer, session, addr, CommandPayload::None);
            }
            LinkStatus::Connecting | LinkStatus::Discovered => {
                self.fail_setup(session, addr, true);
            }
            other => {
                tracing::debug!(peer = %addr, status = ?other, "teardown for inactive link");
            }
        }
    }

    // ── Setup progression ────────────────────────────────────────────────────

    /// Begin driving a peer to `Connected`. The caller has already settled
    /// progress exclusivity and capacity.
    pub(crate) fn trigger_setup(&mut self, session: SessionId, addr: MacAddr) {
        let params = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            state.candidate = Some(addr);
            let Some(peer) = state.peers.find_mut(addr) else {
                return;
            };
            peer.responder = false;
            peer.params()
        };
        self.apply_status(session, addr, LinkStatus::Connecting, ReasonCode::Unspecified);
        self.submit_command(CommandKind::AddPeer, session, addr, CommandPayload::Peer(params));
    }

    /// Next step after a peer-management command completed.
    pub(crate) fn advance_after_peer_command(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        kind: CommandKind,
        ok: bool,
    ) {
        let Some((status, responder, peer_token)) = self
            .sessions
            .get(&session)
            .and_then(|s| s.peers.find(addr))
            .map(|p| (p.status, p.responder, p.dialog_token))
        else {
            return;
        };

        match kind {
            CommandKind::AddPeer => {
                if status != LinkStatus::Connecting {
                    return;
                }
                if !ok {
                    self.fail_setup(session, addr, false);
                    return;
                }
                if responder {
                    // answer the setup request we accepted
                    self.submit_command(
                        CommandKind::SendMgmtFrame,
                        session,
                        addr,
                        CommandPayload::Frame {
                            header: ActionHeader::response(
                                peer_token,
                                ActionCode::SetupResponse,
                                status_code::SUCCESS,
                                true,
                            ),
                            body: Bytes::new(),
                        },
                    );
                } else {
                    let token = {
                        let Some(state) = self.sessions.get_mut(&session) else {
                            return;
                        };
                        let token = state.next_token();
                        if let Some(peer) = state.peers.find_mut(addr) {
                            peer.dialog_token = token;
                        }
                        token
                    };
                    self.submit_command(
                        CommandKind::SendMgmtFrame,
                        session,
                        addr,
                        CommandPayload::Frame {
                            header: ActionHeader::request(token, ActionCode::SetupRequest),
                            body: Bytes::new(),
                        },
                    );
                }
            }
            CommandKind::UpdatePeer => {
                if status != LinkStatus::Connecting {
                    return;
                }
                if !ok {
                    self.fail_setup(session, addr, true);
                    return;
                }
                self.finish_setup(session, addr);
            }
            CommandKind::DeletePeer => {
                if status == LinkStatus::Tearing {
                    self.apply_status(session, addr, LinkStatus::Idle, ReasonCode::Unspecified);
                    if let Some(state) = self.sessions.get_mut(&session) {
                        if state.candidate == Some(addr) {
                            state.candidate = None;
                        }
                        if let Some(peer) = state.peers.find_mut(addr) {
                            peer.invalidate();
                        }
                    }
                }
            }
            CommandKind::SendMgmtFrame => {}
        }
    }

    /// Next step after an outbound frame finished transmitting.
    pub(crate) fn advance_after_frame_sent(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        action: Option<ActionCode>,
        ok: bool,
    ) {
        let Some(action) = action else {
            return;
        };
        match action {
            ActionCode::SetupRequest | ActionCode::SetupResponse => {
                let connecting = self
                    .sessions
                    .get(&session)
                    .and_then(|s| s.peers.find(addr))
                    .map(|p| p.status == LinkStatus::Connecting)
                    .unwrap_or(false);
                if !connecting {
                    // e.g. the declined branch of a setup response
                    return;
                }
                if !ok {
                    self.fail_setup(session, addr, true);
                    return;
                }
                // now waiting for the peer's answer
                self.arm_setup_timeout(session, addr);
            }
            ActionCode::SetupConfirm => {
                if !ok {
                    self.fail_setup(session, addr, true);
                    return;
                }
                let Some(params) = self
                    .sessions
                    .get(&session)
                    .and_then(|s| s.peers.find(addr))
                    .map(|p| p.params())
                else {
                    return;
                };
                self.submit_command(
                    CommandKind::UpdatePeer,
                    session,
                    addr,
                    CommandPayload::Peer(params),
                );
            }
            ActionCode::DiscoveryRequest => {
                if ok {
                    return;
                }
                // tx failed: give the round back and drop to Idle
                {
                    let Some(state) = self.sessions.get_mut(&session) else {
                        return;
                    };
                    state.discovery_outstanding = state.discovery_outstanding.saturating_sub(1);
                    if state.discovery_outstanding == 0 {
                        state.discovery_gen += 1;
                    }
                    if state.candidate == Some(addr) {
                        state.candidate = None;
                    }
                    if let Some(peer) = state.peers.find_mut(addr) {
                        peer.dialog_token = 0;
                    }
                }
                self.apply_status(session, addr, LinkStatus::Idle, ReasonCode::SetupFailure);
            }
            _ => {}
        }
    }

    fn arm_setup_timeout(&mut self, session: SessionId, addr: MacAddr) {
        let timeout = self.config.thresholds.setup_timeout();
        let gen = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            state.setup_gen += 1;
            state.setup_gen
        };
        self.arm(timeout, Event::SetupTimeout { session, addr, gen });
    }

    pub(crate) fn on_setup_timeout(&mut self, session: SessionId, addr: MacAddr, gen: u64) {
        {
            let Some(state) = self.sessions.get(&session) else {
                return;
            };
            if state.setup_gen != gen {
                return;
            }
            let Some(peer) = state.peers.find(addr) else {
                return;
            };
            if peer.status != LinkStatus::Connecting {
                return;
            }
        }
        tracing::warn!(peer = %addr, session = %session, "setup answer window expired");
        self.fail_setup(session, addr, true);
    }

    fn finish_setup(&mut self, session: SessionId, addr: MacAddr) {
        self.apply_status(session, addr, LinkStatus::Connected, ReasonCode::Unspecified);
        if let Err(error) = self.collab.peers.set_peer_state(session, addr, true) {
            tracing::warn!(peer = %addr, %error, "set_peer_state failed");
        }
        if let Some(state) = self.sessions.get_mut(&session) {
            if state.candidate == Some(addr) {
                state.candidate = None;
            }
            if let Some(peer) = state.peers.find_mut(addr) {
                peer.dialog_token = 0;
            }
        }
        tracing::info!(peer = %addr, session = %session, "direct link established");
    }

    /// Any mid-setup failure lands here: back to `Idle` with a reason, the
    /// record never left dangling in `Connecting`.
    pub(crate) fn fail_setup(&mut self, session: SessionId, addr: MacAddr, cleanup_peer: bool) {
        tracing::warn!(peer = %addr, session = %session, "link setup failed");
        if cleanup_peer {
            // firmware already knows this peer; queue the removal
            self.submit_command(CommandKind::DeletePeer, session, addr, CommandPayload::None);
        }
        self.apply_status(session, addr, LinkStatus::Idle, ReasonCode::SetupFailure);
        if let Some(state) = self.sessions.get_mut(&session) {
            if state.candidate == Some(addr) {
                state.candidate = None;
            }
            state.setup_gen += 1;
            if let Some(peer) = state.peers.find_mut(addr) {
                peer.invalidate();
            }
        }
    }

    /// Fallout of a command that was cancelled or timed out mid-flight.
    pub(crate) fn abort_link_attempt(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        reason: ReasonCode,
    ) {
        let Some(status) = self
            .sessions
            .get(&session)
            .and_then(|s| s.peers.find(addr))
            .map(|p| p.status)
        else {
            return;
        };
        match status {
            LinkStatus::Connecting | LinkStatus::Discovered => {
                self.fail_setup(session, addr, true);
            }
            LinkStatus::Discovering => {
                {
                    let Some(state) = self.sessions.get_mut(&session) else {
                        return;
                    };
                    state.discovery_outstanding = state.discovery_outstanding.saturating_sub(1);
                    if state.discovery_outstanding == 0 {
                        state.discovery_gen += 1;
                    }
                    if state.candidate == Some(addr) {
                        state.candidate = None;
                    }
                }
                self.apply_status(session, addr, LinkStatus::Idle, reason);
            }
            LinkStatus::Tearing => {
                self.apply_status(session, addr, LinkStatus::Idle, reason);
                if let Some(state) = self.sessions.get_mut(&session) {
                    if let Some(peer) = state.peers.find_mut(addr) {
                        peer.invalidate();
                    }
                }
            }
            _ => {}
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Tear down an established link: `Tearing` now, `Idle` when the
    /// delete-peer command completes.
    pub(crate) fn start_teardown(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        reason: ReasonCode,
        notify_peer: bool,
    ) {
        let token = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            match state.peers.find(addr) {
                Some(peer) if peer.status == LinkStatus::Connected => {}
                _ => {
                    tracing::debug!(peer = %addr, "teardown requested for peer without a link");
                    return;
                }
            }
            state.next_token()
        };
        self.apply_status(session, addr, LinkStatus::Tearing, reason);
        if let Err(error) = self.collab.peers.set_peer_state(session, addr, false) {
            tracing::warn!(peer = %addr, %error, "set_peer_state failed");
        }
        if notify_peer {
            self.submit_command(
                CommandKind::SendMgmtFrame,
                session,
                addr,
                CommandPayload::Frame {
                    header: ActionHeader::response(
                        token,
                        ActionCode::Teardown,
                        status_code::UNSPECIFIED_REASON,
                        false,
                    ),
                    body: Bytes::new(),
                },
            );
        }
        self.submit_command(CommandKind::DeletePeer, session, addr, CommandPayload::None);
    }

    // ── Handle-level operations ──────────────────────────────────────────────

    /// Explicit link setup: the only trigger honored in
    /// `ExplicitTriggerOnly`, also the entry point external control uses.
    pub(crate) fn on_setup_link(&mut self, session: SessionId, addr: MacAddr) {
        if !self.mode.is_enabled() {
            tracing::warn!(peer = %addr, "setup requested while tdls disabled");
            return;
        }
        if self.connected_count >= self.config.features.max_connected_peers {
            tracing::warn!(peer = %addr, "setup rejected, connected peer cap reached");
            return;
        }
        {
            let Some(state) = self.sessions.get_mut(&session) else {
                tracing::warn!(session = %session, "setup requested for unknown session");
                return;
            };
            if state.peers.in_progress(Some(addr)).is_some() {
                tracing::warn!(peer = %addr, "setup rejected, another link operation in progress");
                return;
            }
            match state.peers.get_or_create(session, addr, &mut self.slots) {
                Ok(peer) => {
                    if peer.status == LinkStatus::Connected {
                        tracing::debug!(peer = %addr, "already connected");
                        return;
                    }
                    // explicitly requested: trust the caller on capability
                    peer.capability = PeerCapability::Supported;
                }
                Err(error) => {
                    tracing::warn!(peer = %addr, %error, "setup rejected");
                    return;
                }
            }
        }
        self.trigger_setup(session, addr);
    }

    pub(crate) fn on_teardown_link(&mut self, session: SessionId, addr: MacAddr, reason: ReasonCode) {
        let connected = self
            .sessions
            .get(&session)
            .and_then(|s| s.peers.find(addr))
            .map(|p| p.status == LinkStatus::Connected)
            .unwrap_or(false);
        if connected {
            self.start_teardown(session, addr, reason, true);
        } else {
            tracing::debug!(peer = %addr, "teardown requested without an established link");
        }
    }

    /// Ask one connected peer to move the direct link to another channel.
    /// Resolution of (country, channel, bandwidth) to an operating class is
    /// the regulatory collaborator's business; the switch itself is
    /// firmware's.
    pub(crate) fn on_channel_switch(&mut self, session: SessionId, channel: u8, bandwidth_mhz: u16) {
        if !self.mode.is_enabled() {
            tracing::warn!("channel switch requested while tdls disabled");
            return;
        }
        if !self.config.features.off_channel {
            tracing::warn!("channel switch rejected, off-channel disabled");
            return;
        }
        let target = {
            let Some(state) = self.sessions.get(&session) else {
                return;
            };
            let Some(peer) = state.peers.find_first_connected() else {
                tracing::info!(session = %session, "channel switch rejected, no connected peer");
                return;
            };
            if !peer.off_channel && !peer.is_forced() {
                tracing::warn!(peer = %peer.addr, "channel switch rejected, peer lacks off-channel support");
                return;
            }
            peer.addr
        };
        let Some(op_class) = self
            .collab
            .regulatory
            .operating_class(&self.config.country, channel, bandwidth_mhz)
        else {
            tracing::warn!(channel, bandwidth_mhz, "no operating class for requested channel");
            return;
        };
        let token = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            state.next_token()
        };
        tracing::info!(peer = %target, channel, op_class, "requesting channel switch");
        // the transport expands (channel, op class) into the full request body
        self.submit_command(
            CommandKind::SendMgmtFrame,
            session,
            target,
            CommandPayload::Frame {
                header: ActionHeader::request(token, ActionCode::ChannelSwitchRequest),
                body: Bytes::from(vec![channel, op_class]),
            },
        );
    }
}
