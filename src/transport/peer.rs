//! The peer table (§4.2).
//!
//! Peers are created on first need and never deleted for the lifetime of
//! the process: they are referenced by `Arc` from RPCs across many
//! threads, and a table that never shrinks lets readers dereference a
//! peer without taking any lock on the hot path (§4.2, §9). This mirrors
//! the teacher's peer-like tables (`PortmapTable`, the per-socket RPC
//! hash tables): a `parking_lot::RwLock` guards *insertion*, never
//! lookup of an already-resolved entry, since entries are handed out as
//! `Arc` clones that keep living after a table write elsewhere.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::NUM_PRIORITIES;

/// Per-peer state mutated by both the sender and receiver sides of the
/// protocol engine (§3).
struct PeerState {
    /// Unscheduled-priority cutoff vector last received from this peer
    /// (used when *we* are the sender to *their* receiver).
    cutoffs: [u32; NUM_PRIORITIES],
    /// Version tag of `cutoffs`.
    cutoff_version: u16,
    /// Tick at which we last sent *our own* cutoffs to this peer (used
    /// when *we* are the receiver, to rate-limit CUTOFFS retransmission).
    last_cutoff_sent_tick: u64,
    /// Tick at which we last sent a RESEND to this peer (§4.10).
    last_resend_tick: u64,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            cutoffs: [u32::MAX; NUM_PRIORITIES],
            cutoff_version: 0,
            last_cutoff_sent_tick: 0,
            last_resend_tick: 0,
        }
    }
}

/// One remote endpoint. Never freed; safe to hold a raw `Arc` clone
/// across an arbitrarily long RPC lifetime.
pub struct Peer {
    pub addr: Ipv4Addr,
    state: Mutex<PeerState>,
}

impl Peer {
    fn new(addr: Ipv4Addr) -> Self {
        Self { addr, state: Mutex::new(PeerState::default()) }
    }

    /// The cutoff vector most recently advertised by this peer, plus the
    /// version it was tagged with.
    pub fn cutoffs(&self) -> ([u32; NUM_PRIORITIES], u16) {
        let s = self.state.lock();
        (s.cutoffs, s.cutoff_version)
    }

    /// Applies an incoming CUTOFFS packet (§4.7).
    pub fn update_cutoffs(&self, cutoffs: [u32; NUM_PRIORITIES], version: u16) {
        let mut s = self.state.lock();
        s.cutoffs = cutoffs;
        s.cutoff_version = version;
    }

    /// Whether our locally observed copy of this peer's cutoffs is stale
    /// relative to `current_version` — if so, a DATA arrival from them
    /// should trigger us sending a fresh CUTOFFS (§4.8). This reads the
    /// *version they last told us they're on* is unrelated; callers pass
    /// the version carried on the just-arrived packet.
    pub fn cutoff_version(&self) -> u16 {
        self.state.lock().cutoff_version
    }

    /// Rate-limits CUTOFFS retransmission to this peer (§4.8): returns
    /// `true` (and records `now_tick`) at most once per `min_interval_ticks`.
    pub fn should_send_cutoffs(&self, now_tick: u64, min_interval_ticks: u64) -> bool {
        let mut s = self.state.lock();
        if now_tick.saturating_sub(s.last_cutoff_sent_tick) >= min_interval_ticks {
            s.last_cutoff_sent_tick = now_tick;
            true
        } else {
            false
        }
    }

    /// Rate-limits RESEND issuance to this peer (§4.10): returns `true`
    /// (and records `now_tick`) at most once per `resend_interval` ticks.
    pub fn should_send_resend(&self, now_tick: u64, resend_interval: u64) -> bool {
        let mut s = self.state.lock();
        if now_tick.saturating_sub(s.last_resend_tick) >= resend_interval {
            s.last_resend_tick = now_tick;
            true
        } else {
            false
        }
    }
}

/// Address -> peer lookup. Lock-free for readers that already hold an
/// `Arc`; only `find`'s insert path takes the write lock, and only when
/// the peer doesn't exist yet.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<Ipv4Addr, Arc<Peer>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing peer or creates one under a short write lock
    /// (§4.2). Never removes an entry.
    pub fn find(&self, addr: Ipv4Addr) -> Arc<Peer> {
        if let Some(p) = self.peers.read().get(&addr) {
            return p.clone();
        }
        let mut peers = self.peers.write();
        peers.entry(addr).or_insert_with(|| {
            debug!(%addr, "creating new peer");
            Arc::new(Peer::new(addr))
        }).clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_creates_then_reuses_peer() {
        let table = PeerTable::new();
        let addr: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let a = table.find(addr);
        let b = table.find(addr);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn cutoffs_round_trip_through_peer_state() {
        let peer = Peer::new("10.0.0.2".parse().unwrap());
        peer.update_cutoffs([1, 2, 3, 4, 5, 6, 7, 8], 9);
        assert_eq!(peer.cutoffs(), ([1, 2, 3, 4, 5, 6, 7, 8], 9));
    }

    #[test]
    fn resend_rate_limit_blocks_within_window() {
        let peer = Peer::new("10.0.0.3".parse().unwrap());
        assert!(peer.should_send_resend(100, 5));
        assert!(!peer.should_send_resend(103, 5));
        assert!(peer.should_send_resend(105, 5));
    }
}
