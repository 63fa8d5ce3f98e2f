//! Shared fixtures for the end-to-end scenarios below: a two-host Homa
//! pair wired up over an in-memory [`homa::net::InMemoryTransport`] pair
//! sharing one [`homa::net::Network`] bus, the way the teacher's
//! `tests/rpc.rs` wires a client and server over a `tokio::io::duplex`
//! pair.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use homa::net::{Collaborators, Network};
use homa::{Homa, HomaConfig};

pub const HOST_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const HOST_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Spins up a [`Homa`] driver bound to `addr` on `net`, with its
/// background loops already running.
pub fn spawn_host(net: &Network, addr: Ipv4Addr, config: HomaConfig) -> Arc<Homa> {
    let transport = net.bind(addr);
    let collab = Collaborators::tokio(Arc::new(transport));
    Homa::new(config, collab)
}

/// Small helper: waits up to `timeout` for `fut`, panicking on timeout
/// (used instead of an unbounded blocking `recv` to keep a buggy test
/// from hanging the suite forever).
pub async fn with_timeout<F: std::future::Future>(fut: F, timeout: Duration) -> F::Output {
    tokio::time::timeout(timeout, fut).await.expect("operation timed out")
}

pub fn short_timeout() -> Duration {
    Duration::from_secs(2)
}
