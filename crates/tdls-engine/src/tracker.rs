//! Connection tracker — periodic traffic/RSSI sampling and the decisions
//! it drives: discovery triggers, idle-teardown timers, and retry bounds.
//!
//! Runs entirely inside the consumer loop, once per `tx_period`. The only
//! concurrent input is the per-session sample table, drained at the top of
//! every tick.

use bytes::Bytes;

use tdls_core::config::{ExternalControlLevel, ThresholdConfig};
use tdls_core::peer::{LinkStatus, Peer, PeerCapability, ReasonCode};
use tdls_core::wire::{ActionCode, ActionHeader};
use tdls_core::{MacAddr, SessionId};

use crate::engine::TdlsEngine;
use crate::event::{Event, InboundAction};
use crate::gateway::{CommandKind, CommandPayload};
use crate::mode::TdlsMode;

/// What one tick decided for one peer.
enum TickAction {
    Discover,
    ArmIdle,
    DisarmIdle,
    Teardown(ReasonCode),
    MarkNotSupported,
}

/// Whether traffic alone may start discovery toward this peer.
fn implicit_trigger_allowed(
    mode: TdlsMode,
    level: ExternalControlLevel,
    peer: &Peer,
    any_forced: bool,
) -> bool {
    match mode {
        TdlsMode::Implicit => true,
        TdlsMode::ExternalControl => match level {
            // liberal external control behaves like implicit mode while at
            // least one forced peer exists (recorded design ambiguity)
            ExternalControlLevel::Liberal => any_forced || peer.is_forced(),
            ExternalControlLevel::Strict | ExternalControlLevel::Off => peer.is_forced(),
        },
        TdlsMode::ExplicitTriggerOnly | TdlsMode::Disabled => false,
    }
}

fn decide(
    peer: &Peer,
    mode: TdlsMode,
    level: ExternalControlLevel,
    t: &ThresholdConfig,
    any_forced: bool,
    connected_count: u32,
    max_peers: u32,
) -> Option<TickAction> {
    match (peer.capability, peer.status) {
        (_, LinkStatus::Connected) => {
            if peer.rssi != 0 && peer.rssi < t.rssi_teardown_threshold {
                return Some(TickAction::Teardown(ReasonCode::LowRssi));
            }
            let idle = peer.tx_pkts < t.idle_packet_threshold
                && peer.rx_pkts < t.idle_packet_threshold;
            match (idle, peer.idle_armed) {
                (true, false) => Some(TickAction::ArmIdle),
                (false, true) => Some(TickAction::DisarmIdle),
                _ => None,
            }
        }
        (
            PeerCapability::Supported | PeerCapability::Unknown,
            LinkStatus::Idle | LinkStatus::Discovering,
        ) => {
            if !implicit_trigger_allowed(mode, level, peer, any_forced) {
                return None;
            }
            if peer.interval_packets() < t.tx_packet_threshold || connected_count >= max_peers {
                return None;
            }
            // the retry bound holds for every unforced peer, whatever we
            // believed about its capability so far
            if peer.discovery_attempts < t.discovery_tries_max || peer.is_forced() {
                Some(TickAction::Discover)
            } else {
                Some(TickAction::MarkNotSupported)
            }
        }
        _ => None,
    }
}

impl TdlsEngine {
    /// (Re)start the sampling timer for a session. Bumps the generation so
    /// any tick already in flight lands stale.
    pub(crate) fn start_tracker(&mut self, session: SessionId) {
        let period = self.config.thresholds.tx_period();
        let gen = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            state.tick_gen += 1;
            state.tick_gen
        };
        tracing::debug!(session = %session, "tracker started");
        self.arm(period, Event::TrackerTick { session, gen });
    }

    pub(crate) fn on_tracker_tick(&mut self, session: SessionId, gen: u64) {
        {
            let Some(state) = self.sessions.get(&session) else {
                return;
            };
            if state.tick_gen != gen {
                return;
            }
        }
        if !self.mode.is_enabled() {
            return;
        }

        // 1. drain the sample table into peer counters, creating records
        //    lazily for addresses seen for the first time
        let drained = self
            .sessions
            .get(&session)
            .map(|s| s.sampler.drain())
            .unwrap_or_default();
        for (addr, tx_pkts, rx_pkts) in drained {
            let state = match self.sessions.get_mut(&session) {
                Some(s) => s,
                None => return,
            };
            match state.peers.get_or_create(session, addr, &mut self.slots) {
                Ok(peer) => {
                    peer.tx_pkts = peer.tx_pkts.saturating_add(tx_pkts);
                    peer.rx_pkts = peer.rx_pkts.saturating_add(rx_pkts);
                }
                Err(error) => {
                    tracing::warn!(peer = %addr, %error, "sampled address not tracked");
                }
            }
        }

        // 2. per-peer decisions on an immutable pass, applied after
        let mode = self.mode.effective();
        let level = self.config.features.external_control;
        let thresholds = self.config.thresholds.clone();
        let max_peers = self.config.features.max_connected_peers;
        let connected_count = self.connected_count;

        let (actions, progress) = {
            let Some(state) = self.sessions.get(&session) else {
                return;
            };
            let any_forced = state.peers.iter().any(|p| p.is_forced());
            let progress = state.peers.in_progress(None);
            let mut actions = Vec::new();
            for peer in state.peers.iter() {
                if let Some(action) = decide(
                    peer,
                    mode,
                    level,
                    &thresholds,
                    any_forced,
                    connected_count,
                    max_peers,
                ) {
                    actions.push((peer.addr, action));
                }
            }
            (actions, progress)
        };

        // one new candidate per tick; the current candidate may retry
        let mut discovery_budget = 1u32;
        for (addr, action) in actions {
            match action {
                TickAction::Discover => {
                    let allowed = (progress.is_none() || progress == Some(addr))
                        && discovery_budget > 0;
                    if allowed {
                        discovery_budget -= 1;
                        self.trigger_discovery(session, addr);
                    }
                }
                TickAction::ArmIdle => self.arm_idle_timer(session, addr),
                TickAction::DisarmIdle => {
                    if let Some(state) = self.sessions.get_mut(&session) {
                        if let Some(peer) = state.peers.find_mut(addr) {
                            peer.idle_armed = false;
                            peer.idle_gen += 1;
                            tracing::debug!(peer = %addr, "traffic resumed, idle timer dropped");
                        }
                    }
                }
                TickAction::Teardown(reason) => {
                    tracing::info!(peer = %addr, ?reason, "tracker tearing down link");
                    self.start_teardown(session, addr, reason, true);
                }
                TickAction::MarkNotSupported => {
                    self.apply_status(session, addr, LinkStatus::Idle, ReasonCode::NotSupported);
                    if let Some(state) = self.sessions.get_mut(&session) {
                        if let Some(peer) = state.peers.find_mut(addr) {
                            peer.capability = PeerCapability::NotSupported;
                        }
                    }
                    tracing::info!(peer = %addr, "discovery retries exhausted, marked not supported");
                }
            }
        }

        // 3. reset interval counters and schedule the next tick
        let next_gen = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            for peer in state.peers.iter_mut() {
                peer.reset_counters();
            }
            state.tick_gen
        };
        self.arm(
            self.config.thresholds.tx_period(),
            Event::TrackerTick { session, gen: next_gen },
        );
    }

    // ── Idle teardown ────────────────────────────────────────────────────────

    fn arm_idle_timer(&mut self, session: SessionId, addr: MacAddr) {
        let timeout = self.config.thresholds.idle_timeout();
        let armed = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            let Some(peer) = state.peers.find_mut(addr) else {
                return;
            };
            peer.idle_gen += 1;
            peer.idle_armed = true;
            (peer.slot, peer.idle_gen)
        };
        tracing::debug!(peer = %addr, session = %session, "link idle, teardown timer armed");
        self.arm(timeout, Event::IdleTimeout { slot: armed.0, gen: armed.1 });
    }

    /// Idle timer fired: re-check current traffic and only tear down when
    /// the link is still quiet. Traffic that resumed in the meantime keeps
    /// the link (and disarms the timer).
    pub(crate) fn on_idle_timeout(&mut self, slot: usize, gen: u64) {
        let Some((session, addr)) = self.slots.resolve(slot) else {
            return;
        };
        let idle_threshold = self.config.thresholds.idle_packet_threshold;
        let still_idle = {
            let Some(state) = self.sessions.get(&session) else {
                return;
            };
            let Some(peer) = state.peers.find(addr) else {
                return;
            };
            if !peer.idle_armed || peer.idle_gen != gen || peer.status != LinkStatus::Connected {
                return;
            }
            // counters were reset at the last tick; samples since then are
            // still sitting in the table
            let (sample_tx, sample_rx) = state.sampler.peek(addr);
            peer.tx_pkts.saturating_add(sample_tx) < idle_threshold
                && peer.rx_pkts.saturating_add(sample_rx) < idle_threshold
        };
        if still_idle {
            tracing::info!(peer = %addr, session = %session, "idle timeout, tearing down link");
            self.start_teardown(session, addr, ReasonCode::Unspecified, true);
        } else if let Some(state) = self.sessions.get_mut(&session) {
            if let Some(peer) = state.peers.find_mut(addr) {
                peer.idle_armed = false;
            }
        }
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    pub(crate) fn trigger_discovery(&mut self, session: SessionId, addr: MacAddr) {
        let timeout = self.config.thresholds.discovery_timeout();
        let Some((token, arm_gen)) = ({
            let state = self.sessions.get_mut(&session);
            state.and_then(|state| {
                let token = state.next_token();
                state.candidate = Some(addr);
                let arm_gen = if state.discovery_outstanding == 0 {
                    state.discovery_gen += 1;
                    Some(state.discovery_gen)
                } else {
                    None
                };
                state.discovery_outstanding += 1;
                let peer = state.peers.find_mut(addr)?;
                peer.dialog_token = token;
                peer.discovery_attempts = peer.discovery_attempts.saturating_add(1);
                Some((token, arm_gen))
            })
        }) else {
            return;
        };

        self.apply_status(session, addr, LinkStatus::Discovering, ReasonCode::Unspecified);
        if let Some(gen) = arm_gen {
            self.arm(timeout, Event::DiscoveryTimeout { session, gen });
        }
        tracing::info!(peer = %addr, session = %session, token, "discovery triggered");
        self.submit_command(
            CommandKind::SendMgmtFrame,
            session,
            addr,
            CommandPayload::Frame {
                header: ActionHeader::request(token, ActionCode::DiscoveryRequest),
                body: Bytes::new(),
            },
        );
    }

    /// Correlate a discovery response with its outstanding request and
    /// decide between promotion to setup and a retry-friendly demotion.
    pub(crate) fn on_discovery_response(&mut self, session: SessionId, frame: &InboundAction) {
        let addr = frame.src;
        let token = frame.header.dialog_token;
        let trigger = self.config.thresholds.rssi_trigger_threshold;
        let tries_max = self.config.thresholds.discovery_tries_max;

        {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            let Some(peer) = state.peers.find_mut(addr) else {
                tracing::warn!(peer = %addr, "discovery response from unknown peer dropped");
                return;
            };
            if peer.status != LinkStatus::Discovering {
                tracing::debug!(peer = %addr, status = ?peer.status, "unsolicited discovery response");
                return;
            }
            if peer.dialog_token != token {
                tracing::warn!(
                    peer = %addr,
                    expected = peer.dialog_token,
                    got = token,
                    "mismatched dialog token in discovery response"
                );
                return;
            }
            peer.dialog_token = 0;
            peer.rssi = frame.rssi;
            peer.capability = PeerCapability::Supported;
            state.discovery_outstanding = state.discovery_outstanding.saturating_sub(1);
            if state.discovery_outstanding == 0 {
                // last outstanding response cancels the timeout
                state.discovery_gen += 1;
            }
        }

        if frame.rssi > trigger {
            tracing::info!(
                peer = %addr,
                rssi = frame.rssi,
                "discovery response above trigger threshold, requesting setup"
            );
            self.apply_status(session, addr, LinkStatus::Discovered, ReasonCode::Unspecified);
            self.trigger_setup(session, addr);
        } else {
            tracing::info!(peer = %addr, rssi = frame.rssi, "discovery response below trigger threshold");
            {
                let Some(state) = self.sessions.get_mut(&session) else {
                    return;
                };
                if state.candidate == Some(addr) {
                    state.candidate = None;
                }
                if let Some(peer) = state.peers.find_mut(addr) {
                    if peer.discovery_attempts < tries_max {
                        // give the attempt back so a later sample can retry
                        peer.discovery_attempts = peer.discovery_attempts.saturating_sub(1);
                    }
                }
            }
            self.apply_status(session, addr, LinkStatus::Idle, ReasonCode::LowRssi);
        }
    }

    /// Discovery window expired: every peer still `Discovering` reverts.
    pub(crate) fn on_discovery_timeout(&mut self, session: SessionId, gen: u64) {
        let addrs = {
            let Some(state) = self.sessions.get_mut(&session) else {
                return;
            };
            if state.discovery_gen != gen {
                return;
            }
            state.discovery_outstanding = 0;
            state.candidate = None;
            let addrs: Vec<MacAddr> = state
                .peers
                .iter()
                .filter(|p| p.status == LinkStatus::Discovering)
                .map(|p| p.addr)
                .collect();
            for addr in &addrs {
                if let Some(peer) = state.peers.find_mut(*addr) {
                    peer.dialog_token = 0;
                }
            }
            addrs
        };
        if !addrs.is_empty() {
            tracing::info!(session = %session, peers = addrs.len(), "discovery window expired");
        }
        for addr in addrs {
            self.apply_status(session, addr, LinkStatus::Idle, ReasonCode::NotSupported);
        }
    }
}
