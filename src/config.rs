//! Tunable protocol parameters (§6 of the spec).
//!
//! Unlike the teacher's `rpc::Context`, which is per-connection, a
//! [`HomaConfig`] is process-wide: it is shared (behind an `Arc`) by every
//! peer, socket, and subsystem in a [`crate::transport::Engine`]. It is
//! plain data, the way `rpc::Context` is — there is no file/env config
//! layer here either; a host application wires that up itself.

use std::sync::atomic::{AtomicU16, Ordering};

/// Number of unscheduled-priority cutoff bands.
pub const NUM_PRIORITIES: usize = 8;

/// All tunables have protocol effects (§6); changing any of them changes
/// what a peer will observe on the wire.
#[derive(Debug)]
pub struct HomaConfig {
    /// Bandwidth-delay product, in bytes: size of the unscheduled window
    /// granted to every message up front, and the extra "in flight"
    /// allowance the grant scheduler tries to keep authorized.
    pub rtt_bytes: u32,

    /// Link rate, used by the pacer to estimate NIC queue drain time.
    pub link_mbps: u32,

    /// Byte step used when the grant scheduler extends `incoming`.
    pub grant_increment: u32,

    /// Maximum number of messages the grant scheduler keeps granted
    /// concurrently (highest priority goes to lowest `bytes_remaining`).
    pub max_overcommit: usize,

    /// Lowest priority value usable by the scheduled band.
    pub min_prio: u8,

    /// Highest priority value in the whole priority space.
    pub max_prio: u8,

    /// Highest priority value reserved for *scheduled* bytes; priorities
    /// above this are the sender-selected unscheduled band.
    pub max_sched_prio: u8,

    /// Per-peer cutoff vector: `cutoffs[i]` is the largest unscheduled
    /// message length that gets priority `i`.
    pub unsched_cutoffs: [u32; NUM_PRIORITIES],

    /// Bumped by [`HomaConfig::set_cutoffs`]; carried on CUTOFFS packets
    /// so receivers can tell senders their cached vector is stale.
    cutoff_version: AtomicU16,

    /// Timer ticks of silence before a RESEND is considered.
    pub resend_ticks: u32,

    /// Minimum ticks between two RESENDs to the same peer.
    pub resend_interval: u32,

    /// Number of RESENDs before an RPC is aborted.
    pub abort_resends: u32,

    /// Pacer "is the NIC queue full" horizon, in nanoseconds.
    pub max_nic_queue_ns: u64,

    /// Frames below this size bypass the pacer (CPU-bound, not link-bound).
    pub throttle_min_bytes: u32,

    /// Maximum payload bytes a single transmit frame may carry.
    pub max_gso_size: u32,

    /// Verbosity knob consumed by the host (this crate logs via
    /// `tracing` regardless; this only gates extra host-side dumps).
    pub verbose: bool,
}

impl Clone for HomaConfig {
    fn clone(&self) -> Self {
        Self {
            rtt_bytes: self.rtt_bytes,
            link_mbps: self.link_mbps,
            grant_increment: self.grant_increment,
            max_overcommit: self.max_overcommit,
            min_prio: self.min_prio,
            max_prio: self.max_prio,
            max_sched_prio: self.max_sched_prio,
            unsched_cutoffs: self.unsched_cutoffs,
            cutoff_version: AtomicU16::new(self.cutoff_version()),
            resend_ticks: self.resend_ticks,
            resend_interval: self.resend_interval,
            abort_resends: self.abort_resends,
            max_nic_queue_ns: self.max_nic_queue_ns,
            throttle_min_bytes: self.throttle_min_bytes,
            max_gso_size: self.max_gso_size,
            verbose: self.verbose,
        }
    }
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self {
            rtt_bytes: 10_000,
            link_mbps: 10_000,
            grant_increment: 1_500,
            max_overcommit: 8,
            min_prio: 0,
            max_prio: 7,
            max_sched_prio: 4,
            unsched_cutoffs: [u32::MAX; NUM_PRIORITIES],
            cutoff_version: AtomicU16::new(1),
            resend_ticks: 5,
            resend_interval: 5,
            abort_resends: 5,
            max_nic_queue_ns: 5_000,
            throttle_min_bytes: 1_000,
            max_gso_size: 1_400,
            verbose: false,
        }
    }
}

impl HomaConfig {
    /// Current cutoff-vector version.
    pub fn cutoff_version(&self) -> u16 {
        self.cutoff_version.load(Ordering::Acquire)
    }

    /// The "prios-changed" hook from §6: replace the cutoff vector and/or
    /// priority band and bump `cutoff_version` so that peers refresh their
    /// cached copy on next contact.
    pub fn set_cutoffs(&mut self, cutoffs: [u32; NUM_PRIORITIES]) {
        self.unsched_cutoffs = cutoffs;
        self.cutoff_version.fetch_add(1, Ordering::AcqRel);
    }

    /// The unscheduled-window size for a message of the given total
    /// length: rounded up to a full packet, but never larger than the
    /// message itself (§4.4).
    pub fn unscheduled_window(&self, message_len: u32) -> u32 {
        let packet = self.max_gso_size.max(1);
        let rounded = self.rtt_bytes.div_ceil(packet) * packet;
        rounded.min(message_len)
    }

    /// Priority band for `length` unscheduled bytes under the given peer
    /// cutoff vector (§4.8): smallest `i` with `length <= cutoffs[i]`.
    pub fn unscheduled_priority(&self, length: u32, cutoffs: &[u32; NUM_PRIORITIES]) -> u8 {
        for (i, &cutoff) in cutoffs.iter().enumerate() {
            if length <= cutoff {
                return i as u8;
            }
        }
        (NUM_PRIORITIES - 1) as u8
    }

    /// Cycles-per-kilobyte pacing cost implied by `link_mbps`, expressed in
    /// nanoseconds per kilobyte so the pacer can advance `link_idle_time`.
    pub fn ns_per_kbyte(&self) -> u64 {
        // link_mbps is megabits/sec; 1 kB = 8000 bits.
        let mbps = self.link_mbps.max(1) as u64;
        8_000_000 / mbps
    }
}
