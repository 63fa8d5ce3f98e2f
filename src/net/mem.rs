//! An in-memory [`super::DatagramTransport`] double for tests: the
//! async analogue of the teacher's `tokio::io::duplex` socket pair in
//! `tests/rpc.rs`, generalized from one stream to an addressed datagram
//! network so multi-peer scenarios (§8 end-to-end scenarios) don't need
//! real sockets or a real network namespace.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::DatagramTransport;

type Filter = Box<dyn Fn(Ipv4Addr, Ipv4Addr, &[u8]) -> bool + Send + Sync>;

struct NetworkInner {
    routes: HashMap<Ipv4Addr, mpsc::UnboundedSender<(Vec<u8>, Ipv4Addr)>>,
    /// Optional drop predicate: `(src, dest, payload) -> true` to drop
    /// the datagram in flight. Used to script packet loss for the §8
    /// loss/RESEND scenario without touching the engine.
    drop_if: Option<Filter>,
}

/// A shared, addressed datagram bus. Every [`InMemoryTransport`] bound
/// to the same `Network` can reach every other one by `Ipv4Addr`.
#[derive(Clone)]
pub struct Network {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for Network {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(NetworkInner { routes: HashMap::new(), drop_if: None })) }
    }
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a drop predicate; `true` means "lose this datagram"
    /// (§8: "drop the DATA frame with offset 3000").
    pub fn set_drop_filter(&self, f: impl Fn(Ipv4Addr, Ipv4Addr, &[u8]) -> bool + Send + Sync + 'static) {
        self.inner.lock().unwrap().drop_if = Some(Box::new(f));
    }

    pub fn clear_drop_filter(&self) {
        self.inner.lock().unwrap().drop_if = None;
    }

    pub fn bind(&self, addr: Ipv4Addr) -> InMemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().routes.insert(addr, tx);
        InMemoryTransport {
            network: self.clone(),
            local_addr: addr,
            inbox: Mutex::new(rx),
        }
    }
}

pub struct InMemoryTransport {
    network: Network,
    local_addr: Ipv4Addr,
    inbox: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Ipv4Addr)>>,
}

#[async_trait]
impl DatagramTransport for InMemoryTransport {
    async fn send_to(
        &self,
        dest_addr: Ipv4Addr,
        _priority: u8,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let inner = self.network.inner.lock().unwrap();
        if let Some(drop_if) = inner.drop_if.as_ref() {
            if drop_if(self.local_addr, dest_addr, payload) {
                return Ok(());
            }
        }
        let Some(tx) = inner.routes.get(&dest_addr) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no transport bound to {dest_addr}"),
            ));
        };
        let _ = tx.send((payload.to_vec(), self.local_addr));
        Ok(())
    }

    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, Ipv4Addr)> {
        let mut inbox = self.inbox.lock().unwrap();
        inbox.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport closed")
        })
    }

    fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_the_right_bound_address() {
        let net = Network::new();
        let a = net.bind("10.0.0.1".parse().unwrap());
        let b = net.bind("10.0.0.2".parse().unwrap());

        a.send_to("10.0.0.2".parse().unwrap(), 0, b"hi").await.unwrap();
        let (payload, from) = b.recv_from().await.unwrap();
        assert_eq!(payload, b"hi");
        assert_eq!(from, "10.0.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn drop_filter_silently_loses_matching_datagrams() {
        let net = Network::new();
        let a = net.bind("10.0.0.1".parse().unwrap());
        let b = net.bind("10.0.0.2".parse().unwrap());
        net.set_drop_filter(|_, _, payload| payload == b"lost");

        a.send_to("10.0.0.2".parse().unwrap(), 0, b"lost").await.unwrap();
        a.send_to("10.0.0.2".parse().unwrap(), 0, b"kept").await.unwrap();
        let (payload, _) = b.recv_from().await.unwrap();
        assert_eq!(payload, b"kept");
    }
}
