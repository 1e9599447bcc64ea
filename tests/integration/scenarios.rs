//! End-to-end link lifecycle scenarios: traffic-driven discovery, setup
//! promotion and demotion, idle teardown, retry exhaustion, and the
//! registry invariants that must hold throughout.

use crate::*;
use tdls_core::peer::PeerCapability;

/// Make the engine treat `addr` as a known TDLS-capable peer by letting it
/// answer the peer's own discovery probe.
async fn known_supported_peer(h: &Harness, addr: MacAddr) {
    h.inject(addr, ActionCode::DiscoveryRequest, 42, status_code::SUCCESS, -50);
    settle().await;
    assert_eq!(h.peer(addr).await.unwrap().capability, PeerCapability::Supported);
}

/// Traffic at the packet threshold promotes a supported idle peer to
/// `Discovering` and sends exactly one discovery request.
#[tokio::test(start_paused = true)]
async fn traffic_threshold_triggers_discovery_once() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    known_supported_peer(&h, peer).await;

    h.pump_tx(peer, 10); // exactly tx_packet_threshold
    one_tick().await;

    assert_eq!(h.status_of(peer).await, LinkStatus::Discovering);
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 1);
    let request = h.frames.last(ActionCode::DiscoveryRequest).unwrap();
    assert_eq!(request.dest, peer);

    // no further traffic, no further request
    one_tick().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 1);
}

/// A discovery response well above the RSSI trigger threshold promotes the
/// peer and starts setup; the attempt counter resets on promotion.
#[tokio::test(start_paused = true)]
async fn strong_discovery_response_starts_setup() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    known_supported_peer(&h, peer).await;

    h.pump_tx(peer, 10);
    one_tick().await;
    let request = h.frames.last(ActionCode::DiscoveryRequest).unwrap();

    // 10 dB above the -75 trigger threshold
    h.inject(peer, ActionCode::DiscoveryResponse, request.token, status_code::SUCCESS, -65);
    settle().await;

    let snap = h.peer(peer).await.unwrap();
    assert_eq!(snap.discovery_attempts, 0);
    assert_eq!(snap.status, LinkStatus::Connecting);
    assert_eq!(h.peers.count(CommandKind::AddPeer), 1);
    assert_eq!(h.frames.count(ActionCode::SetupRequest), 1);
}

/// A weak discovery response demotes the peer back to `Idle` and gives the
/// burned attempt back so a later sample can retry.
#[tokio::test(start_paused = true)]
async fn weak_discovery_response_demotes_and_refunds_attempt() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    known_supported_peer(&h, peer).await;

    h.pump_tx(peer, 10);
    one_tick().await;
    let request = h.frames.last(ActionCode::DiscoveryRequest).unwrap();

    h.inject(peer, ActionCode::DiscoveryResponse, request.token, status_code::SUCCESS, -88);
    settle().await;

    let snap = h.peer(peer).await.unwrap();
    assert_eq!(snap.status, LinkStatus::Idle);
    assert_eq!(snap.discovery_attempts, 0, "attempt decremented, not incremented");
    assert_eq!(h.peers.count(CommandKind::AddPeer), 0, "no setup was started");
}

/// A response whose dialog token does not match the outstanding request is
/// dropped without touching the state machine.
#[tokio::test(start_paused = true)]
async fn mismatched_dialog_token_is_ignored() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    known_supported_peer(&h, peer).await;

    h.pump_tx(peer, 10);
    one_tick().await;
    let request = h.frames.last(ActionCode::DiscoveryRequest).unwrap();

    h.inject(
        peer,
        ActionCode::DiscoveryResponse,
        request.token.wrapping_add(1),
        status_code::SUCCESS,
        -60,
    );
    settle().await;
    assert_eq!(h.status_of(peer).await, LinkStatus::Discovering);
}

/// No response at all: the discovery window expires and the peer reverts.
#[tokio::test(start_paused = true)]
async fn discovery_timeout_reverts_to_idle() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    known_supported_peer(&h, peer).await;

    h.pump_tx(peer, 10);
    one_tick().await;
    assert_eq!(h.status_of(peer).await, LinkStatus::Discovering);

    // past discovery_timeout_ms without a response
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.status_of(peer).await, LinkStatus::Idle);
}

/// An unanswered peer is retried up to the bound, then permanently marked
/// not supported; the attempt counter never exceeds the bound.
#[tokio::test(start_paused = true)]
async fn silent_peer_is_marked_not_supported() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);

    for _ in 0..6 {
        h.pump_tx(peer, 10);
        one_tick().await;
        if let Some(snap) = h.peer(peer).await {
            assert!(snap.discovery_attempts <= 3, "attempts bounded for unforced peers");
        }
    }

    let snap = h.peer(peer).await.unwrap();
    assert_eq!(snap.capability, PeerCapability::NotSupported);
    assert_eq!(snap.status, LinkStatus::Idle);
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 3);

    // permanently out: more traffic triggers nothing
    h.pump_tx(peer, 10);
    one_tick().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 3);
}

/// An idle connected link is torn down after one full idle window: Tearing
/// then Idle, the datapath deregistered, the peer deleted from firmware.
#[tokio::test(start_paused = true)]
async fn idle_link_is_torn_down() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    h.establish_link(peer).await;
    assert_eq!(h.datapath.connected_now(), 1);

    // no traffic at all: tick arms the idle timer, the timer fires
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(h.status_of(peer).await, LinkStatus::Idle);
    assert_eq!(h.datapath.connected_now(), 0);
    assert_eq!(h.frames.count(ActionCode::Teardown), 1);
    assert!(h.peers.count(CommandKind::DeletePeer) >= 1);
}

/// Traffic that resumes before the idle timer fires keeps the link.
#[tokio::test(start_paused = true)]
async fn active_link_survives_idle_timer() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    h.establish_link(peer).await;

    // keep packets flowing through several idle windows
    for _ in 0..8 {
        h.pump_tx(peer, 5);
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
    assert_eq!(h.status_of(peer).await, LinkStatus::Connected);
    assert_eq!(h.frames.count(ActionCode::Teardown), 0);
}

/// Signal collapse on an established link tears it down at the next tick.
#[tokio::test(start_paused = true)]
async fn rssi_collapse_tears_down_link() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    h.establish_link(peer).await;

    h.handle.report_rssi(SESSION, peer, -92).unwrap();
    // keep the link busy so only RSSI can be the reason
    h.pump_tx(peer, 10);
    one_tick().await;
    settle().await;

    assert_eq!(h.status_of(peer).await, LinkStatus::Idle);
    assert_eq!(h.frames.count(ActionCode::Teardown), 1);
}

/// Responder half of setup: accept, answer, confirm, connect.
#[tokio::test(start_paused = true)]
async fn responder_accepts_setup_request() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);

    h.inject(peer, ActionCode::SetupRequest, 7, status_code::SUCCESS, -48);
    settle().await;
    let response = h.frames.last(ActionCode::SetupResponse).unwrap();
    assert_eq!(response.status, status_code::SUCCESS);
    assert_eq!(response.token, 7);

    h.inject(peer, ActionCode::SetupConfirm, 7, status_code::SUCCESS, -48);
    settle().await;

    let snap = h.peer(peer).await.unwrap();
    assert_eq!(snap.status, LinkStatus::Connected);
    assert!(snap.responder);
    assert_eq!(h.datapath.connected_now(), 1);
}

/// A second setup request while another link operation is in progress is
/// declined, preserving progress exclusivity.
#[tokio::test(start_paused = true)]
async fn concurrent_setup_request_is_declined() {
    let mut config = test_config();
    config.features.max_connected_peers = 1;
    let h = spawn_engine(config);
    h.up().await;
    h.establish_link(peer_addr(1)).await;

    h.inject(peer_addr(2), ActionCode::SetupRequest, 9, status_code::SUCCESS, -50);
    settle().await;

    let response = h.frames.last(ActionCode::SetupResponse).unwrap();
    assert_eq!(response.dest, peer_addr(2));
    assert_eq!(response.status, status_code::REQUEST_DECLINED);
    assert!(h.peer(peer_addr(2)).await.is_none() || {
        h.peer(peer_addr(2)).await.unwrap().status == LinkStatus::Idle
    });
}

/// The peer tears the link down: we deregister and delete without sending
/// a teardown of our own.
#[tokio::test(start_paused = true)]
async fn peer_initiated_teardown() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    h.establish_link(peer).await;

    h.inject(peer, ActionCode::Teardown, 0, status_code::UNSPECIFIED_REASON, -60);
    settle().await;

    assert_eq!(h.status_of(peer).await, LinkStatus::Idle);
    assert_eq!(h.datapath.connected_now(), 0);
    assert_eq!(h.frames.count(ActionCode::Teardown), 0, "no teardown frame echoed back");
    assert!(h.peers.count(CommandKind::DeletePeer) >= 1);
}

/// A traffic indication from a connected peer is answered; one from a
/// stranger is not.
#[tokio::test(start_paused = true)]
async fn peer_traffic_indication_is_acknowledged() {
    let h = spawn_engine(test_config());
    h.up().await;
    let peer = peer_addr(1);
    h.establish_link(peer).await;

    h.inject(peer, ActionCode::PeerTrafficIndication, 11, status_code::SUCCESS, -50);
    settle().await;
    let response = h.frames.last(ActionCode::PeerTrafficResponse).unwrap();
    assert_eq!(response.token, 11);
    assert_eq!(response.dest, peer);

    h.inject(peer_addr(9), ActionCode::PeerTrafficIndication, 12, status_code::SUCCESS, -50);
    settle().await;
    assert_eq!(h.frames.count(ActionCode::PeerTrafficResponse), 1);
}

// ── Invariants ───────────────────────────────────────────────────────────────

/// At most one peer per session is ever in a progress state.
#[tokio::test(start_paused = true)]
async fn progress_exclusivity_across_peers() {
    let h = spawn_engine(test_config());
    h.up().await;

    // two peers cross the threshold in the same interval
    h.pump_tx(peer_addr(1), 10);
    h.pump_tx(peer_addr(2), 10);
    one_tick().await;

    let peers = h.handle.snapshot(SESSION).await.unwrap();
    let in_progress = peers
        .iter()
        .filter(|p| {
            matches!(p.status, LinkStatus::Discovering | LinkStatus::Connecting)
        })
        .count();
    assert_eq!(in_progress, 1);
}

/// The forwarding plane's view of the connected count tracks link
/// establishment and teardown exactly.
#[tokio::test(start_paused = true)]
async fn connected_count_matches_datapath() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.establish_link(peer_addr(1)).await;
    h.establish_link(peer_addr(2)).await;
    assert_eq!(h.datapath.connected_now(), 2);

    let peers = h.handle.snapshot(SESSION).await.unwrap();
    let connected = peers.iter().filter(|p| p.status == LinkStatus::Connected).count();
    assert_eq!(connected as i64, h.datapath.connected_now());

    h.handle
        .teardown_link(SESSION, peer_addr(1), tdls_core::peer::ReasonCode::Unspecified)
        .unwrap();
    settle().await;
    assert_eq!(h.datapath.connected_now(), 1);

    h.handle
        .teardown_link(SESSION, peer_addr(2), tdls_core::peer::ReasonCode::Unspecified)
        .unwrap();
    settle().await;
    assert_eq!(h.datapath.connected_now(), 0);
}

/// The connected-peer cap stops further traffic-driven discovery.
#[tokio::test(start_paused = true)]
async fn connected_peer_cap_blocks_discovery() {
    let mut config = test_config();
    config.features.max_connected_peers = 1;
    let h = spawn_engine(config);
    h.up().await;
    h.establish_link(peer_addr(1)).await;

    h.pump_tx(peer_addr(2), 10);
    one_tick().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryRequest), 0);
}
