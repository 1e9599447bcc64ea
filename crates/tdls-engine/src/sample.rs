//! Recent-traffic sample table.
//!
//! The one structure written from outside the single-consumer loop:
//! datapath producers record per-address packet counts here on every frame,
//! and the tracker drains the table once per sampling period. Bounded — a
//! flood of never-seen addresses cannot grow memory; once `capacity`
//! distinct addresses are present, packets from further unseen addresses
//! are not sampled until a drain frees space.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use tdls_core::MacAddr;

/// Distinct addresses tracked between drains.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 8;

#[derive(Default)]
struct Counters {
    tx: AtomicU32,
    rx: AtomicU32,
}

pub struct TrafficSampler {
    entries: DashMap<MacAddr, Counters>,
    capacity: usize,
}

impl TrafficSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn note_tx(&self, addr: MacAddr) {
        self.note(addr, 1, 0);
    }

    pub fn note_rx(&self, addr: MacAddr) {
        self.note(addr, 0, 1);
    }

    fn note(&self, addr: MacAddr, tx: u32, rx: u32) {
        if addr.is_multicast() || addr.is_zero() {
            return;
        }
        if let Some(counters) = self.entries.get(&addr) {
            counters.tx.fetch_add(tx, Ordering::Relaxed);
            counters.rx.fetch_add(rx, Ordering::Relaxed);
            return;
        }
        // Capacity check before the insert. Concurrent producers racing on
        // the same tick may overshoot by a packet's worth of entries; the
        // table stays bounded by the producer count either way.
        if self.entries.len() >= self.capacity {
            tracing::trace!(peer = %addr, "sample table full, address not sampled");
            return;
        }
        let entry = self.entries.entry(addr).or_default();
        entry.tx.fetch_add(tx, Ordering::Relaxed);
        entry.rx.fetch_add(rx, Ordering::Relaxed);
    }

    /// Current counts for one address, without consuming them.
    pub fn peek(&self, addr: MacAddr) -> (u32, u32) {
        self.entries
            .get(&addr)
            .map(|c| (c.tx.load(Ordering::Relaxed), c.rx.load(Ordering::Relaxed)))
            .unwrap_or((0, 0))
    }

    /// Remove and return every sampled address with its counts.
    pub fn drain(&self) -> Vec<(MacAddr, u32, u32)> {
        let addrs: Vec<MacAddr> = self.entries.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if let Some((_, counters)) = self.entries.remove(&addr) {
                out.push((
                    addr,
                    counters.tx.into_inner(),
                    counters.rx.into_inner(),
                ));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
