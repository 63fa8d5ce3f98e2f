use std::net::Ipv4Addr;
use std::sync::Arc;

use homa::{Homa, HomaConfig, RecvFlags};
use homa::net::{Collaborators, UdpTransport};

/// Homa control port this demo listens on; see `net::udp::DEFAULT_CONTROL_PORT`.
const LISTEN_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;
/// The Homa server port the echo service is bound to.
const SERVER_PORT: u16 = 100;

/// Demo Homa server: echoes every request back to its sender.
/// Shows how to bind a socket and service requests with `recv`/`reply`.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let transport = UdpTransport::bind_default(LISTEN_ADDR).await.unwrap();
    let collab = Collaborators::tokio(Arc::new(transport));
    let homa = Homa::new(HomaConfig::default(), collab);

    let socket = homa.socket();
    socket.bind(SERVER_PORT).unwrap();
    println!("echo server listening on Homa port {SERVER_PORT}");

    loop {
        let (id, buffer, src) = socket.recv(RecvFlags::NONE, None).await.unwrap().expect("blocking recv");
        println!("request {} bytes from {src}", buffer.len());
        socket.reply(id, &buffer).await.unwrap();
    }
}
