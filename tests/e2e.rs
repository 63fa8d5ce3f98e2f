//! End-to-end scenarios (§8) run over the in-memory transport double so
//! no real sockets or a network namespace are needed.

mod support;

use homa::{HomaConfig, RecvFlags};

use support::{spawn_host, with_timeout, HOST_A, HOST_B};

const SERVER_PORT: u16 = 100;

#[tokio::test]
async fn tiny_request_response_round_trips() {
    let net = homa::net::Network::new();
    let client_host = spawn_host(&net, HOST_A, HomaConfig::default());
    let server_host = spawn_host(&net, HOST_B, HomaConfig::default());

    let server = server_host.socket();
    server.bind(SERVER_PORT).unwrap();

    let client = client_host.socket();
    let id = client.send(HOST_B, SERVER_PORT, b"ping").await.unwrap();

    let (req_id, request, _src) =
        with_timeout(server.recv(RecvFlags::NONE, None), support::short_timeout())
            .await
            .unwrap()
            .expect("server receives the request");
    assert_eq!(request, b"ping");
    server.reply(req_id, b"pong").await.unwrap();

    let (resp_id, response, _src) =
        with_timeout(client.recv(RecvFlags::NONE, Some(id)), support::short_timeout())
            .await
            .unwrap()
            .expect("client receives the response");
    assert_eq!(resp_id, id);
    assert_eq!(response, b"pong");
}

#[tokio::test]
async fn scheduled_inbound_message_is_fully_delivered_via_grants() {
    let net = homa::net::Network::new();
    let mut config = HomaConfig::default();
    config.rtt_bytes = 10_000;
    config.max_gso_size = 1_400;
    config.grant_increment = 1_400;

    let client_host = spawn_host(&net, HOST_A, config.clone());
    let server_host = spawn_host(&net, HOST_B, config);

    let server = server_host.socket();
    server.bind(SERVER_PORT).unwrap();
    let client = client_host.socket();

    let big_request = vec![7u8; 100_000];
    let id = client.send(HOST_B, SERVER_PORT, &big_request).await.unwrap();

    let (req_id, request, _) =
        with_timeout(server.recv(RecvFlags::NONE, None), support::short_timeout())
            .await
            .unwrap()
            .expect("server eventually assembles the full scheduled message");
    assert_eq!(request.len(), big_request.len());
    assert_eq!(request, big_request);

    server.reply(req_id, b"ack").await.unwrap();
    let (_, response, _) =
        with_timeout(client.recv(RecvFlags::NONE, Some(id)), support::short_timeout())
            .await
            .unwrap()
            .expect("client receives the ack");
    assert_eq!(response, b"ack");
}

#[tokio::test]
async fn message_survives_a_dropped_data_frame_via_resend() {
    let net = homa::net::Network::new();
    let mut config = HomaConfig::default();
    config.max_gso_size = 1_000;
    config.rtt_bytes = 1_000;
    config.resend_ticks = 2;
    config.resend_interval = 1;

    let client_host = spawn_host(&net, HOST_A, config.clone());
    let server_host = spawn_host(&net, HOST_B, config);

    let server = server_host.socket();
    server.bind(SERVER_PORT).unwrap();
    let client = client_host.socket();

    // Drop exactly one DATA frame once, simulating a single lost packet;
    // the RESEND path should recover it without the application noticing.
    let dropped = std::sync::atomic::AtomicBool::new(false);
    net.set_drop_filter(move |_from, _to, payload| {
        if payload.len() > homa::wire::MIN_PACKET_LEN && !dropped.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        false
    });

    let request = vec![9u8; 5_000];
    let _id = client.send(HOST_B, SERVER_PORT, &request).await.unwrap();

    let (_, received, _) = with_timeout(
        server.recv(RecvFlags::NONE, None),
        std::time::Duration::from_secs(5),
    )
    .await
    .unwrap()
    .expect("server recovers the dropped frame via resend");
    assert_eq!(received, request);
}

#[tokio::test]
async fn nonblocking_recv_returns_none_when_nothing_is_ready() {
    let net = homa::net::Network::new();
    let host = spawn_host(&net, HOST_A, HomaConfig::default());
    let socket = host.socket();
    socket.bind(SERVER_PORT).unwrap();

    let result = socket.recv(RecvFlags::NONBLOCK, None).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn shutdown_aborts_a_pending_client_rpc() {
    let net = homa::net::Network::new();
    let client_host = spawn_host(&net, HOST_A, HomaConfig::default());
    // No server bound on HOST_B: the request goes out but nothing ever
    // answers, so the RPC stays pending until shutdown tears it down.
    let client = client_host.socket();
    let id = client.send(HOST_B, SERVER_PORT, b"hello?").await.unwrap();

    client.shutdown();

    let err = with_timeout(client.recv(RecvFlags::NONE, Some(id)), support::short_timeout())
        .await
        .expect_err("shutdown aborts the rpc with an error rather than hanging forever");
    assert!(matches!(err, homa::Error::Shutdown));
}
