//! The external collaborators the core consumes (§1): a way to send and
//! receive fully-formed datagrams at a chosen egress priority, a
//! monotonic clock, and a thread/task-spawn primitive. Segmentation
//! offload, the `/proc`-style metrics surface, packet tracing, and
//! runtime parameter administration stay external to this crate — these
//! traits are the entire surface the engine needs from a host.
//!
//! This plays the role the teacher's `tcp::NFSTcp`/`TcpListener` split
//! plays for NFS: a trait the engine is written against, plus one real
//! (`tokio`-backed) implementation and, for tests, an in-memory double
//! that needs no OS sockets at all.

mod mem;
mod udp;

pub use mem::{InMemoryTransport, Network};
pub use udp::UdpTransport;

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

/// Sends and receives whole Homa datagrams. One instance is shared by
/// every socket in an [`crate::transport::Engine`] — Homa multiplexes
/// all of a host's sockets over a single underlying medium and demuxes
/// purely by the ports embedded in the common header (§4.1, §4.3),
/// exactly as the real protocol runs over one raw-IP socket per host.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Transmits `payload` (an already wire-encoded Homa packet) to
    /// `dest_addr` at the given egress `priority`. The host is free to
    /// map `priority` onto whatever the local NIC/QoS layer supports (or
    /// ignore it); Homa's tail-latency story depends on *some* in-network
    /// priority scheme existing, not on any particular one (§1).
    async fn send_to(
        &self,
        dest_addr: Ipv4Addr,
        priority: u8,
        payload: &[u8],
    ) -> std::io::Result<()>;

    /// Blocks until the next datagram arrives, returning its bytes and
    /// the address it came from.
    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, Ipv4Addr)>;

    /// This host's own address, used when constructing peer records for
    /// replies.
    fn local_addr(&self) -> Ipv4Addr;
}

/// A monotonic, high-resolution clock (§1). Homa's pacer and timer only
/// ever compare two readings of the same clock, never a wall-clock
/// timestamp, so the unit is nanoseconds since an arbitrary fixed point.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The `tokio`-backed default: nanoseconds since this `Clock` was
/// constructed, read from [`std::time::Instant`] exactly the way a
/// kernel build reads `get_cycles()` relative to boot.
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// A thread/task-spawn primitive (§1): the engine's background loops
/// (dispatcher receive loop, pacer pump, timer tick) are spawned through
/// this instead of calling `tokio::spawn` directly, so a host can supply
/// a different executor without the engine caring.
pub trait Spawner: Send + Sync {
    fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send + 'static>>);
}

/// The `tokio`-backed default, matching the way the teacher spawns one
/// task per accepted connection in `tcp::NFSTcpListener::handle_forever`.
#[derive(Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) {
        tokio::spawn(fut);
    }
}

/// Convenience bundle of the three collaborators, so driver code (the
/// dispatcher loop, pacer loop, timer loop) only needs to carry one
/// value around.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn DatagramTransport>,
    pub clock: Arc<dyn Clock>,
    pub spawner: Arc<dyn Spawner>,
}

impl Collaborators {
    pub fn tokio(transport: Arc<dyn DatagramTransport>) -> Self {
        Self {
            transport,
            clock: Arc::new(MonotonicClock::default()),
            spawner: Arc::new(TokioSpawner),
        }
    }
}
