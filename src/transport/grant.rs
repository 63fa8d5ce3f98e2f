//! The global grant scheduler (§4.8): SRPT ordering across every
//! scheduled inbound message, GRANT issuance bounded by `max_overcommit`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::HomaConfig;
use crate::transport::socket::RpcHandle;

/// One entry in the grantable list: the RPC plus the sequence number it
/// was inserted with, used to break ties in `bytes_remaining` by
/// insertion order (§8 invariant 4, §9 open question).
struct Entry {
    handle: RpcHandle,
    seq: u64,
}

/// A single GRANT to issue, handed back to the caller (the dispatcher or
/// its driving loop) to actually serialize and transmit — the scheduler
/// itself has no notion of sockets or wire I/O.
pub struct GrantDecision {
    pub handle: RpcHandle,
    pub offset: u32,
    pub priority: u8,
}

/// Maintains `grantable_rpcs` (§3, §4.8) and computes the set of GRANTs
/// to send on each poke. Entirely independent of the network layer: the
/// dispatcher calls [`GrantScheduler::link`]/[`GrantScheduler::unlink`]
/// as messages become scheduled or complete, and [`GrantScheduler::poke`]
/// whenever new DATA might have changed the ordering.
pub struct GrantScheduler {
    grantable: Mutex<Vec<Entry>>,
    next_seq: AtomicU64,
}

impl Default for GrantScheduler {
    fn default() -> Self {
        Self { grantable: Mutex::new(Vec::new()), next_seq: AtomicU64::new(0) }
    }
}

impl GrantScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a scheduled message's RPC to the grantable set, unless it is
    /// already present. Marks `in_grantable` on the RPC so membership can
    /// be tested in O(1) elsewhere (§9).
    pub fn link(&self, handle: RpcHandle) {
        {
            let mut rpc = handle.lock();
            if rpc.in_grantable {
                return;
            }
            rpc.in_grantable = true;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.grantable.lock().push(Entry { handle, seq });
    }

    /// Removes an RPC from the grantable set (§4.5: on reassembly
    /// completion).
    pub fn unlink(&self, handle: &RpcHandle) {
        handle.lock().in_grantable = false;
        self.grantable.lock().retain(|e| !Arc::ptr_eq(&e.handle, handle));
    }

    pub fn grantable_len(&self) -> usize {
        self.grantable.lock().len()
    }

    /// Re-sorts the grantable list by ascending `bytes_remaining`, ties
    /// broken by insertion order (§8 invariant 4), then walks the first
    /// `max_overcommit` entries and computes the GRANTs needed to keep
    /// each one's `incoming` at `min(length, received + rtt_bytes)`,
    /// issued in `grant_increment`-sized steps (§4.8).
    ///
    /// Priority is the entry's rank within the scanned window, mapped
    /// onto `[min_prio, max_sched_prio]` — rank 0 (shortest remaining)
    /// gets `max_sched_prio`, the highest scheduled priority.
    pub fn poke(&self, config: &HomaConfig) -> Vec<GrantDecision> {
        let mut entries = self.grantable.lock();
        entries.sort_by(|a, b| {
            let ra = a.handle.lock().msgin.as_ref().map(|m| m.bytes_remaining).unwrap_or(0);
            let rb = b.handle.lock().msgin.as_ref().map(|m| m.bytes_remaining).unwrap_or(0);
            ra.cmp(&rb).then(a.seq.cmp(&b.seq))
        });

        let band = config.max_sched_prio.saturating_sub(config.min_prio) as usize + 1;
        let mut decisions = Vec::new();

        for (rank, entry) in entries.iter().take(config.max_overcommit).enumerate() {
            let mut rpc = entry.handle.lock();
            let Some(msgin) = rpc.msgin.as_mut() else { continue };

            let received = msgin.length - msgin.bytes_remaining;
            let target = (received + config.rtt_bytes).min(msgin.length);
            if target <= msgin.incoming {
                continue;
            }

            let priority = config.max_sched_prio.saturating_sub((rank % band) as u8);
            let mut next = msgin.incoming;
            while next < target {
                next = (next + config.grant_increment).min(target);
                decisions.push(GrantDecision {
                    handle: entry.handle.clone(),
                    offset: next,
                    priority,
                });
            }
            msgin.incoming = next;
        }

        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message_in::InboundMessage;
    use crate::transport::peer::PeerTable;
    use crate::transport::rpc::{Rpc, RpcId};
    use std::net::Ipv4Addr;

    #[test]
    fn shortest_remaining_message_is_granted_highest_priority() {
        let config = HomaConfig::default();
        let scheduler = GrantScheduler::new();

        let big = make_handle(1, 200_000, config.rtt_bytes);
        let small = make_handle(2, 50_000, config.rtt_bytes);
        scheduler.link(big.clone());
        scheduler.link(small.clone());

        let decisions = scheduler.poke(&config);
        let small_prio = decisions.iter().find(|d| Arc::ptr_eq(&d.handle, &small)).map(|d| d.priority);
        let big_prio = decisions.iter().find(|d| Arc::ptr_eq(&d.handle, &big)).map(|d| d.priority);
        assert!(small_prio.unwrap() > big_prio.unwrap());
    }

    #[test]
    fn unlink_removes_from_grantable_set() {
        let config = HomaConfig::default();
        let scheduler = GrantScheduler::new();
        let handle = make_handle(1, 200_000, config.rtt_bytes);
        scheduler.link(handle.clone());
        assert_eq!(scheduler.grantable_len(), 1);
        scheduler.unlink(&handle);
        assert_eq!(scheduler.grantable_len(), 0);
        assert!(!handle.lock().in_grantable);
    }

    #[test]
    fn poke_grants_in_increment_sized_steps() {
        let mut config = HomaConfig::default();
        config.rtt_bytes = 10_000;
        config.grant_increment = 1_500;
        config.max_overcommit = 1;
        let scheduler = GrantScheduler::new();
        let handle = make_handle(1, 100_000, 10_000);
        scheduler.link(handle.clone());

        let decisions = scheduler.poke(&config);
        assert!(!decisions.is_empty());
        for d in &decisions {
            assert!(d.offset <= 20_000);
        }
        assert_eq!(handle.lock().msgin.as_ref().unwrap().incoming, 20_000);
    }

    /// Builds an RPC with a scheduled inbound message that has already
    /// received its unscheduled window, so `poke` has real `bytes_remaining`
    /// slack to reason about (a freshly-created message's `incoming`
    /// already equals its unscheduled window, so it grants nothing yet).
    fn make_handle(id: u64, length: u32, unscheduled: u32) -> RpcHandle {
        let peer = PeerTable::new().find("10.0.0.1".parse::<Ipv4Addr>().unwrap());
        let mut rpc = Rpc::new_server(RpcId(id), peer, 20, 10);
        let mut msgin = InboundMessage::new(length, unscheduled);
        msgin.on_data(0, &vec![0u8; unscheduled as usize], unscheduled);
        rpc.msgin = Some(msgin);
        Arc::new(parking_lot::Mutex::new(rpc))
    }
}
