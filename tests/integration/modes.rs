//! Mode controller behavior: disable-source reconciliation, concurrency
//! and scan interactions, explicit-trigger mode, and external control.

use crate::*;
use tdls_core::config::ExternalControlLevel;
use tdls_core::peer::{ForcedPeerCallback, LinkHint, ReasonCode};
use tdls_engine::{DisableSource, TdlsMode};

/// Two disable sources must both clear before the plane comes back up.
#[tokio::test(start_paused = true)]
async fn disable_sources_reconcile() {
    let h = spawn_engine(test_config());
    h.up().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Implicit);

    h.handle.set_mode(TdlsMode::Disabled, DisableSource::User).unwrap();
    settle().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Disabled);

    // concurrency joins in, then clears — the user bit still holds it down
    h.handle.session_count_changed(2).unwrap();
    settle().await;
    h.handle.session_count_changed(1).unwrap();
    settle().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Disabled);

    // only clearing the user source restores the last non-disabled mode
    h.handle.set_mode(TdlsMode::Implicit, DisableSource::User).unwrap();
    settle().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Implicit);
}

/// A second concurrent radio session forces all links down before the new
/// state reaches firmware; returning to one session re-enables.
#[tokio::test(start_paused = true)]
async fn concurrency_tears_links_down() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.establish_link(peer_addr(1)).await;

    h.handle.session_count_changed(2).unwrap();
    settle().await;
    assert_eq!(h.datapath.connected_now(), 0);
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Idle);
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Disabled);

    h.handle.session_count_changed(1).unwrap();
    settle().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Implicit);
}

/// A connected peer without buffering support cannot ride through a scan:
/// the scan source disables the plane and drops the link, and completion
/// restores the previous mode.
#[tokio::test(start_paused = true)]
async fn scan_suspends_without_buffer_peers() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.establish_link(peer_addr(1)).await;

    h.handle.scan_started(SESSION).unwrap();
    settle().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Disabled);
    assert_eq!(h.datapath.connected_now(), 0);

    h.handle.scan_done(SESSION).unwrap();
    settle().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Implicit);
}

/// With no links established a scan changes nothing.
#[tokio::test(start_paused = true)]
async fn scan_with_no_links_is_a_no_op() {
    let h = spawn_engine(test_config());
    h.up().await;
    let pushes_before = h.firmware.states.lock().unwrap().len();

    h.handle.scan_started(SESSION).unwrap();
    settle().await;
    h.handle.scan_done(SESSION).unwrap();
    settle().await;

    assert_eq!(h.firmware.states.lock().unwrap().len(), pushes_before);
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::Implicit);
}

/// Disabling the plane cancels in-flight work and tears every peer down.
#[tokio::test(start_paused = true)]
async fn disable_drops_everything() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.establish_link(peer_addr(1)).await;
    h.establish_link(peer_addr(2)).await;

    h.handle.set_mode(TdlsMode::Disabled, DisableSource::User).unwrap();
    settle().await;

    assert_eq!(h.datapath.connected_now(), 0);
    for last in [1u8, 2u8] {
        assert_eq!(h.status_of(peer_addr(last)).await, LinkStatus::Idle);
    }
    // while disabled, traffic and frames are inert
    h.pump_tx(peer_addr(3), 20);
    one_tick().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 0);
}

/// Explicit-trigger mode: traffic never starts discovery, an explicit
/// setup request still works.
#[tokio::test(start_paused = true)]
async fn explicit_trigger_only() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.handle
        .set_mode(TdlsMode::ExplicitTriggerOnly, DisableSource::User)
        .unwrap();
    settle().await;

    h.pump_tx(peer_addr(1), 20);
    one_tick().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 0);

    h.establish_link(peer_addr(1)).await;
    assert_eq!(h.datapath.connected_now(), 1);
}

/// Strict external control: only forced peers may be driven by traffic.
#[tokio::test(start_paused = true)]
async fn strict_external_control_gates_on_forced_list() {
    let mut config = test_config();
    config.features.external_control = ExternalControlLevel::Strict;
    config.features.forced_peers = vec![peer_addr(1).to_string()];
    let h = spawn_engine(config);
    h.up().await;
    assert_eq!(h.firmware.last().unwrap().mode, TdlsMode::ExternalControl);

    // unforced peer: ignored no matter how much it talks
    h.pump_tx(peer_addr(2), 20);
    one_tick().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 0);

    // forced peer: discovered
    h.pump_tx(peer_addr(1), 20);
    one_tick().await;
    let request = h.frames.last(ActionCode::DiscoveryRequest).unwrap();
    assert_eq!(request.dest, peer_addr(1));
}

/// Liberal external control behaves like implicit mode as long as at least
/// one forced peer exists. (Recorded design ambiguity — asserted loosely.)
#[tokio::test(start_paused = true)]
async fn liberal_external_control_allows_ambient_peers() {
    let mut config = test_config();
    config.features.external_control = ExternalControlLevel::Liberal;
    config.features.forced_peers = vec![peer_addr(1).to_string()];
    let h = spawn_engine(config);
    h.up().await;

    // an unforced peer may trigger while the forced list is non-empty
    h.pump_tx(peer_addr(2), 20);
    one_tick().await;
    assert!(h.frames.count(ActionCode::DiscoveryRequest) >= 1);
    let request = h.frames.last(ActionCode::DiscoveryRequest).unwrap();
    assert_eq!(request.dest, peer_addr(2));
}

/// A forced peer's registered callback sees every link-state change with
/// its channel and a translated hint.
#[tokio::test(start_paused = true)]
async fn forced_peer_callback_tracks_link_state() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);

    let seen: Arc<Mutex<Vec<(LinkHint, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ForcedPeerCallback = Arc::new(move |update| {
        assert_eq!(update.channel, 36);
        sink.lock().unwrap().push((update.hint, update.reason));
    });
    h.handle
        .add_forced_peer(SESSION, peer, 36, 115, Some(callback))
        .unwrap();
    settle().await;

    h.establish_link(peer).await;
    h.handle.teardown_link(SESSION, peer, ReasonCode::Unspecified).unwrap();
    settle().await;

    let hints: Vec<LinkHint> = seen.lock().unwrap().iter().map(|(h, _)| *h).collect();
    assert!(hints.contains(&LinkHint::Connecting));
    assert!(hints.contains(&LinkHint::Connected));
    assert!(hints.contains(&LinkHint::Disconnecting));
    assert_eq!(hints.last(), Some(&LinkHint::Disconnected));
}

/// A channel-switch request goes to the first connected peer with the
/// operating class resolved through the regulatory collaborator.
#[tokio::test(start_paused = true)]
async fn channel_switch_request_reaches_peer() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    // forcing with a channel marks the peer off-channel capable
    h.handle.add_forced_peer(SESSION, peer, 36, 115, None).unwrap();
    settle().await;
    h.establish_link(peer).await;

    h.handle.request_channel_switch(SESSION, 36, 40).unwrap();
    settle().await;
    let request = h.frames.last(ActionCode::ChannelSwitchRequest).unwrap();
    assert_eq!(request.dest, peer);

    // a channel the regulatory table cannot place is rejected
    h.handle.request_channel_switch(SESSION, 165, 40).unwrap();
    settle().await;
    assert_eq!(h.frames.count(ActionCode::ChannelSwitchRequest), 1);
}

/// Session teardown drains everything and survives a re-up.
#[tokio::test(start_paused = true)]
async fn session_down_and_up_again() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.establish_link(peer_addr(1)).await;

    h.handle.session_down(SESSION).unwrap();
    settle().await;
    assert_eq!(h.datapath.connected_now(), 0);
    assert!(h.handle.snapshot(SESSION).await.unwrap().is_empty());

    h.up().await;
    h.establish_link(peer_addr(1)).await;
    assert_eq!(h.datapath.connected_now(), 1);
}
