use std::net::Ipv4Addr;
use std::sync::Arc;

use homa::net::{Collaborators, UdpTransport};
use homa::{Homa, HomaConfig, RecvFlags};

const SERVER_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;
const SERVER_PORT: u16 = 100;
/// A distinct loopback address from the server's, so both demos can share
/// the one well-known Homa control port (see `net::udp::DEFAULT_CONTROL_PORT`)
/// without a bind conflict — Homa multiplexes by address, not by OS port.
const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// Demo Homa client: sends one request to `echo_server` and prints the
/// echoed response.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let transport = UdpTransport::bind_default(CLIENT_ADDR).await.unwrap();
    let collab = Collaborators::tokio(Arc::new(transport));
    let homa = Homa::new(HomaConfig::default(), collab);

    let socket = homa.socket();
    let message = std::env::args().nth(1).unwrap_or_else(|| "hello, homa".to_string());

    let id = socket.send(SERVER_ADDR, SERVER_PORT, message.as_bytes()).await.unwrap();
    let (_, reply, _) = socket.recv(RecvFlags::NONE, Some(id)).await.unwrap().expect("blocking recv");
    println!("echoed: {}", String::from_utf8_lossy(&reply));
}
