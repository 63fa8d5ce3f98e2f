//! Link-rate pacing (§4.9): the throttled-RPC queue and the
//! `link_idle_time` estimator that keeps transmissions from overrunning
//! the NIC queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::HomaConfig;
use crate::transport::message_out::OutFrame;
use crate::transport::socket::RpcHandle;

/// One frame released by the pacer, paired with the RPC it came from so
/// the caller can actually serialize and send it.
pub struct PacedFrame {
    pub handle: RpcHandle,
    pub frame: OutFrame,
    pub priority: u8,
}

/// Tracks the throttled-RPC FIFO and the estimated NIC-drain horizon.
/// `link_idle_time` and `pacer_active` are plain atomics rather than
/// lock-guarded fields because every thread entering the transport may
/// want to read or CAS them without first acquiring any other lock
/// (§4.9, §5 lock-ordering table — the pacer's own state sits outside
/// that hierarchy by design).
pub struct Pacer {
    throttled: Mutex<VecDeque<RpcHandle>>,
    /// Clock-time (nanoseconds since some fixed epoch, supplied by the
    /// caller's clock) at which everything already hand to the NIC will
    /// have drained.
    link_idle_time: AtomicU64,
    /// Single-runner guard: only one pump (dedicated thread or an
    /// opportunistic caller) may drain the throttled list at a time
    /// (§4.9 "cooperative pacer").
    pacer_active: AtomicBool,
}

impl Default for Pacer {
    fn default() -> Self {
        Self {
            throttled: Mutex::new(VecDeque::new()),
            link_idle_time: AtomicU64::new(0),
            pacer_active: AtomicBool::new(false),
        }
    }
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an RPC to the throttled list if it isn't linked already
    /// (tracked via `in_throttled` on the RPC itself, §9).
    pub fn enqueue(&self, handle: RpcHandle) {
        {
            let mut rpc = handle.lock();
            if rpc.in_throttled {
                return;
            }
            rpc.in_throttled = true;
        }
        self.throttled.lock().push_back(handle);
    }

    pub fn throttled_len(&self) -> usize {
        self.throttled.lock().len()
    }

    /// Attempts to become the sole pacer pump. Returns `false` if another
    /// thread is already running it (§4.9).
    pub fn try_acquire(&self) -> bool {
        self.pacer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.pacer_active.store(false, Ordering::Release);
    }

    /// `check_nic_queue` (§4.9): whether transmitting `size` bytes right
    /// now would push the estimated drain time past `max_nic_queue_ns`
    /// beyond `now`. Frames below `throttle_min_bytes` always pass —
    /// they are CPU-bound, not link-bound.
    pub fn check_nic_queue(&self, config: &HomaConfig, now_ns: u64, size: u32) -> bool {
        if size < config.throttle_min_bytes {
            return true;
        }
        let idle = self.link_idle_time.load(Ordering::Acquire);
        now_ns + config.max_nic_queue_ns >= idle
    }

    /// Records that `size` bytes were just handed to the NIC, advancing
    /// `link_idle_time` by the pacing cost of that many bytes.
    pub fn record_sent(&self, config: &HomaConfig, now_ns: u64, size: u32) {
        let cost = (size as u64 * config.ns_per_kbyte()) / 1000;
        let idle = self.link_idle_time.load(Ordering::Acquire);
        let base = idle.max(now_ns);
        self.link_idle_time.store(base + cost, Ordering::Release);
    }

    pub fn link_idle_time(&self) -> u64 {
        self.link_idle_time.load(Ordering::Acquire)
    }

    /// One round-robin pass over the throttled list (§4.9): pops each RPC
    /// in turn, takes its next sendable frame if `check_nic_queue` allows
    /// it, and requeues the RPC if it still has more to send. Stops as
    /// soon as the NIC queue estimate says to back off. An RPC with no
    /// sendable frame left (blocked on grants, or fully drained) is
    /// dropped from the list rather than requeued.
    pub fn pump(&self, config: &HomaConfig, now_ns: u64) -> Vec<PacedFrame> {
        let mut released = Vec::new();
        loop {
            let handle = {
                let mut queue = self.throttled.lock();
                match queue.pop_front() {
                    Some(h) => h,
                    None => break,
                }
            };

            let (frame, priority, still_sendable) = {
                let mut rpc = handle.lock();
                let Some(msgout) = rpc.msgout.as_mut() else {
                    rpc.in_throttled = false;
                    continue;
                };
                if !msgout.has_sendable_frame() {
                    rpc.in_throttled = false;
                    continue;
                }
                // Unscheduled bytes get their priority from the peer's
                // cutoff vector (§4.8); only bytes beyond the
                // unscheduled window use the GRANT-assigned priority.
                let next_offset = msgout.next_offset();
                let priority = if next_offset < msgout.unscheduled {
                    let (cutoffs, _version) = rpc.peer.cutoffs();
                    config.unscheduled_priority(msgout.length, &cutoffs)
                } else {
                    msgout.sched_priority
                };
                let frame = msgout.take_next_sendable();
                (frame, priority, msgout.has_sendable_frame())
            };

            let Some(frame) = frame else { continue };

            if !self.check_nic_queue(config, now_ns, frame.payload.len() as u32) {
                trace!("pacer backing off, nic queue estimate full");
                // Put the frame's owner back at the front for the next pass.
                // The frame itself was already taken from msgout's cursor,
                // so we only requeue the RPC, not the frame.
                self.throttled.lock().push_front(handle);
                break;
            }

            self.record_sent(config, now_ns, frame.payload.len() as u32);
            released.push(PacedFrame { handle: handle.clone(), frame, priority });

            if still_sendable {
                self.throttled.lock().push_back(handle);
            } else {
                handle.lock().in_throttled = false;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message_out::OutboundMessage;
    use crate::transport::peer::PeerTable;
    use crate::transport::rpc::{Rpc, RpcId};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn handle_with_msgout(id: u64, len: usize) -> RpcHandle {
        let peer = PeerTable::new().find("10.0.0.1".parse::<Ipv4Addr>().unwrap());
        let mut rpc = Rpc::new_client(RpcId(id), peer, 20, 99);
        rpc.msgout = Some(OutboundMessage::new(&vec![0u8; len], 10_000, 1_400, 4));
        Arc::new(parking_lot::Mutex::new(rpc))
    }

    #[test]
    fn enqueue_twice_is_idempotent() {
        let pacer = Pacer::new();
        let handle = handle_with_msgout(1, 100);
        pacer.enqueue(handle.clone());
        pacer.enqueue(handle);
        assert_eq!(pacer.throttled_len(), 1);
    }

    #[test]
    fn try_acquire_is_single_runner() {
        let pacer = Pacer::new();
        assert!(pacer.try_acquire());
        assert!(!pacer.try_acquire());
        pacer.release();
        assert!(pacer.try_acquire());
    }

    #[test]
    fn small_frames_bypass_throttling() {
        let config = HomaConfig::default();
        let pacer = Pacer::new();
        assert!(pacer.check_nic_queue(&config, 0, config.throttle_min_bytes - 1));
    }

    #[test]
    fn pump_drains_a_fully_unscheduled_message() {
        let config = HomaConfig::default();
        let pacer = Pacer::new();
        let handle = handle_with_msgout(1, 100);
        pacer.enqueue(handle);
        let released = pacer.pump(&config, 0);
        assert_eq!(released.len(), 1);
        assert_eq!(pacer.throttled_len(), 0);
    }
}
