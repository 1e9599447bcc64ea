//! Peer registry — the sharded per-session peer table, the device-wide
//! slot table, and the link-status transition with its side effects.

use std::collections::btree_map::Entry;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use tdls_core::peer::{
    ForcedPeerUpdate, LinkStatus, Peer, PeerSnapshot, ReasonCode,
};
use tdls_core::{MacAddr, SessionId, TdlsError};

use crate::collab::DatapathControl;

pub const SHARD_COUNT: usize = 8;

/// Device-wide ceiling on live peer records across all sessions.
pub const MAX_PEER_SLOTS: usize = 32;

fn shard_of(addr: &MacAddr) -> usize {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

// ── Peer table ───────────────────────────────────────────────────────────────

/// Sharded peer collection, one per session.
///
/// Shards are ordered maps so scan order is stable across insertions:
/// `find_first_connected` keeps returning the same peer until that peer
/// disconnects.
pub struct PeerTable {
    shards: Vec<BTreeMap<MacAddr, Peer>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| BTreeMap::new()).collect(),
        }
    }

    /// O(1) expected lookup. Never blocks.
    pub fn find(&self, addr: MacAddr) -> Option<&Peer> {
        self.shards[shard_of(&addr)].get(&addr)
    }

    pub fn find_mut(&mut self, addr: MacAddr) -> Option<&mut Peer> {
        self.shards[shard_of(&addr)].get_mut(&addr)
    }

    /// Idempotent create-or-return. New records start `Idle`/`Unknown` and
    /// take a device-wide slot; exhaustion is the caller's error to absorb.
    pub fn get_or_create(
        &mut self,
        session: SessionId,
        addr: MacAddr,
        slots: &mut SlotTable,
    ) -> Result<&mut Peer, TdlsError> {
        match self.shards[shard_of(&addr)].entry(addr) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let slot = slots
                    .alloc(session, addr)
                    .ok_or(TdlsError::ResourceExhausted("peer slot table full"))?;
                tracing::debug!(peer = %addr, session = %session, slot, "peer record created");
                Ok(v.insert(Peer::new(addr, slot)))
            }
        }
    }

    pub fn remove(&mut self, addr: MacAddr, slots: &mut SlotTable) -> Option<Peer> {
        let peer = self.shards[shard_of(&addr)].remove(&addr)?;
        slots.free(peer.slot);
        Some(peer)
    }

    /// Any one connected peer — first in shard scan order, stable until
    /// that peer disconnects. Used by the channel-switch negotiator.
    pub fn find_first_connected(&self) -> Option<&Peer> {
        self.iter().find(|p| p.status == LinkStatus::Connected)
    }

    /// The peer currently in a progress state, if any — the exclusivity
    /// scan. Full-table, O(n).
    pub fn in_progress(&self, exclude: Option<MacAddr>) -> Option<MacAddr> {
        self.iter()
            .find(|p| p.status.is_progress() && Some(p.addr) != exclude)
            .map(|p| p.addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.shards.iter().flat_map(|s| s.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.shards.iter_mut().flat_map(|s| s.values_mut())
    }

    pub fn addresses(&self) -> Vec<MacAddr> {
        self.iter().map(|p| p.addr).collect()
    }

    pub fn connected_addresses(&self) -> Vec<MacAddr> {
        self.iter()
            .filter(|p| p.status == LinkStatus::Connected)
            .map(|p| p.addr)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Drop every record, returning their slots.
    pub fn clear(&mut self, slots: &mut SlotTable) {
        for shard in &mut self.shards {
            for peer in shard.values() {
                slots.free(peer.slot);
            }
            shard.clear();
        }
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.iter().map(|p| p.snapshot()).collect()
    }
}

// ── Slot table ───────────────────────────────────────────────────────────────

/// Fixed table mapping peer-record slot → (session, address).
///
/// Timer events carry a slot id across the async boundary and resolve it
/// here at the point of use — a stale slot simply resolves to "gone".
pub struct SlotTable {
    slots: Vec<Option<(SessionId, MacAddr)>>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn alloc(&mut self, session: SessionId, addr: MacAddr) -> Option<usize> {
        let idx = self.slots.iter().position(|s| s.is_none())?;
        self.slots[idx] = Some((session, addr));
        Some(idx)
    }

    pub fn free(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn resolve(&self, slot: usize) -> Option<(SessionId, MacAddr)> {
        self.slots.get(slot).copied().flatten()
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

// ── Link-status transition ───────────────────────────────────────────────────

/// Side-effect hooks of a link-status change.
pub struct LinkHooks<'a> {
    pub session: SessionId,
    pub connected_count: &'a mut u32,
    pub datapath: &'a dyn DatapathControl,
}

/// Apply a link-status transition.
///
/// Clears the discovery-attempt counter once the peer reaches `Discovered`
/// or later, keeps the device-wide connected count in step with entries to
/// and exits from `Connected` (registering/deregistering with the datapath
/// on the same edge), and notifies a forced peer's state-change callback.
pub fn apply_link_status(
    peer: &mut Peer,
    new: LinkStatus,
    reason: ReasonCode,
    hooks: &mut LinkHooks<'_>,
) {
    let old = peer.status;
    if old == new {
        return;
    }
    peer.status = new;

    if matches!(
        new,
        LinkStatus::Discovered | LinkStatus::Connecting | LinkStatus::Connected
    ) {
        peer.discovery_attempts = 0;
    }

    if old != LinkStatus::Connected && new == LinkStatus::Connected {
        *hooks.connected_count += 1;
        hooks
            .datapath
            .set_peer_connected(hooks.session, peer.addr, 0, true);
    } else if old == LinkStatus::Connected && new != LinkStatus::Connected {
        *hooks.connected_count = hooks.connected_count.saturating_sub(1);
        hooks
            .datapath
            .set_peer_connected(hooks.session, peer.addr, 0, false);
    }

    if let Some(forced) = &peer.forced {
        if let Some(callback) = &forced.callback {
            callback(&ForcedPeerUpdate {
                addr: peer.addr,
                channel: forced.channel,
                op_class: forced.op_class,
                hint: new.hint(),
                reason: reason.as_i32(),
            });
        }
    }

    tracing::debug!(
        peer = %peer.addr,
        session = %hooks.session,
        from = ?old,
        to = ?new,
        reason = ?reason,
        "link status changed"
    );
}
