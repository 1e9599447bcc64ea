//! Serialized-command behavior observable from outside: single in-flight
//! execution, FIFO ordering, timeout and cancellation fallout.

use crate::*;
use tdls_engine::{DisableSource, TdlsMode};

/// While one management frame is in flight, the next one waits; completing
/// the first releases the second in submission order.
#[tokio::test(start_paused = true)]
async fn frames_are_serialized_per_session() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.frames.auto_ack.store(false, Ordering::SeqCst);

    // setup toward peer 1 parks a SetupRequest in the active slot
    h.handle.setup_link(SESSION, peer_addr(1)).unwrap();
    settle().await;
    assert_eq!(h.frames.count(ActionCode::SetupRequest), 1);

    // a discovery probe from peer 2 queues a response behind it
    h.inject(peer_addr(2), ActionCode::DiscoveryRequest, 5, status_code::SUCCESS, -50);
    settle().await;
    assert_eq!(
        h.frames.count(ActionCode::DiscoveryResponse),
        0,
        "second command must not activate before the first settles"
    );

    // tx completion for the setup request releases the queue
    let request = h.frames.last(ActionCode::SetupRequest).unwrap();
    h.handle.frame_sent(SESSION, request.token, true).unwrap();
    settle().await;
    assert_eq!(h.frames.count(ActionCode::DiscoveryResponse), 1);
}

/// An activated command that never completes times out; the setup attempt
/// fails cleanly back to Idle and the firmware entry is removed.
#[tokio::test(start_paused = true)]
async fn command_timeout_fails_setup() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.frames.auto_ack.store(false, Ordering::SeqCst);

    h.handle.setup_link(SESSION, peer_addr(1)).unwrap();
    settle().await;
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Connecting);

    // past command_timeout_ms with no tx completion
    tokio::time::sleep(Duration::from_millis(450)).await;

    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Idle);
    assert!(h.peers.count(CommandKind::DeletePeer) >= 1, "firmware peer cleaned up");
    assert_eq!(h.datapath.connected_now(), 0);
}

/// A setup request that gets no answer from the peer expires via the setup
/// timer even though every command completed normally.
#[tokio::test(start_paused = true)]
async fn unanswered_setup_request_expires() {
    let h = spawn_engine(test_config());
    h.up().await;

    h.handle.setup_link(SESSION, peer_addr(1)).unwrap();
    settle().await;
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Connecting);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Idle);
}

/// Disabling mid-setup cancels the held command; a completion arriving
/// after the cancellation is ignored rather than resurrecting the link.
#[tokio::test(start_paused = true)]
async fn disable_cancels_pending_work() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.peers.auto_ack.store(false, Ordering::SeqCst);

    h.handle.setup_link(SESSION, peer_addr(1)).unwrap();
    settle().await;
    assert_eq!(h.peers.count(CommandKind::AddPeer), 1);
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Connecting);

    h.handle.set_mode(TdlsMode::Disabled, DisableSource::User).unwrap();
    settle().await;
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Idle);

    // stale completion from the collaborator: dropped, state unchanged
    h.handle
        .peer_command_done(SESSION, peer_addr(1), CommandKind::AddPeer, true)
        .unwrap();
    settle().await;
    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Idle);
    assert_eq!(h.datapath.connected_now(), 0);

    // the engine is still healthy
    h.handle.set_mode(TdlsMode::Implicit, DisableSource::User).unwrap();
    settle().await;
    h.peers.auto_ack.store(true, Ordering::SeqCst);
    h.establish_link(peer_addr(1)).await;
}

/// A failing add-peer collaborator call resolves into a clean setup
/// failure, never a wedged `Connecting` record.
#[tokio::test(start_paused = true)]
async fn add_peer_failure_degrades_gracefully() {
    let h = spawn_engine(test_config());
    h.up().await;
    h.peers.fail_add.store(true, Ordering::SeqCst);

    h.handle.setup_link(SESSION, peer_addr(1)).unwrap();
    settle().await;

    assert_eq!(h.status_of(peer_addr(1)).await, LinkStatus::Idle);
    assert_eq!(h.frames.count(ActionCode::SetupRequest), 0);
    assert_eq!(h.datapath.connected_now(), 0);
}
