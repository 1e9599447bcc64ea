//! Per-interface session state.

use std::sync::Arc;

use tdls_core::{MacAddr, SessionId};

use crate::registry::PeerTable;
use crate::sample::{TrafficSampler, DEFAULT_SAMPLE_CAPACITY};

/// Everything one radio interface owns: its peers, the candidate currently
/// being driven through discovery/setup, and the timer bookkeeping.
///
/// Timer generations exist because timer tasks cannot be reached once
/// spawned — a fire whose generation no longer matches the session's is
/// stale and dropped by the handler.
pub struct SessionState {
    pub id: SessionId,
    pub peers: PeerTable,

    /// The one peer being driven through discovery or setup right now.
    pub candidate: Option<MacAddr>,

    /// Discovery requests sent and not yet answered this round.
    pub discovery_outstanding: u32,

    pub tick_gen: u64,
    pub discovery_gen: u64,
    pub setup_gen: u64,

    next_dialog_token: u8,

    /// Shared with producers; drained by the tracker each tick.
    pub sampler: Arc<TrafficSampler>,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            peers: PeerTable::new(),
            candidate: None,
            discovery_outstanding: 0,
            tick_gen: 0,
            discovery_gen: 0,
            setup_gen: 0,
            next_dialog_token: 0,
            sampler: Arc::new(TrafficSampler::new(DEFAULT_SAMPLE_CAPACITY)),
        }
    }

    /// Next dialog token. Wraps, skipping zero (zero means "none").
    pub fn next_token(&mut self) -> u8 {
        self.next_dialog_token = self.next_dialog_token.wrapping_add(1);
        if self.next_dialog_token == 0 {
            self.next_dialog_token = 1;
        }
        self.next_dialog_token
    }

    /// Invalidate every timer owned by this session.
    pub fn bump_timers(&mut self) {
        self.tick_gen += 1;
        self.discovery_gen += 1;
        self.setup_gen += 1;
    }
}
