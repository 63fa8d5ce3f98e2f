//! The host-facing `socket`/`bind`/`send`/`reply`/`recv`/`poll`/
//! `shutdown` surface (§6), built on top of the protocol engine. The
//! engine itself (`transport`) has no notion of "blocking" or "the
//! application" — this module is the thin wrapper that gives it one,
//! the way the teacher's `tcp::NFSTcpListener` is the usable surface
//! over `protocol::rpc::handle_rpc`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::config::HomaConfig;
use crate::error::{Error, Result};
use crate::net::Collaborators;
use crate::transport::dispatch::{self, Outgoing};
use crate::transport::message_out::OutboundMessage;
use crate::transport::pacer::PacedFrame;
use crate::transport::rpc::{Rpc, RpcId, RpcState, Role};
use crate::transport::socket::{RpcHandle, SocketState};
use crate::transport::timer::{self, TimerAction};
use crate::transport::Engine;
use crate::wire::{CommonHeader, DataPacket, Packet, PacketType, Segment};

/// Caps how many dead RPCs a single `send`/`recv`/`reply` call reaps
/// before returning, bounding the tail latency the reaper can add to
/// any one call (§5, §9).
const REAPER_BATCH: usize = 64;

/// Frame the pacer's cooperative pump drains per opportunistic call
/// (§4.9 "cooperative pacer"), so a busy application thread doesn't get
/// stuck draining an unbounded throttled list on someone else's behalf.
const PACER_BATCH_LIMIT: usize = 256;

/// The process-wide driver: owns the [`Engine`] and the collaborators it
/// runs against, and spawns the background dispatch/pacer/timer loops
/// (§5: soft-interrupt context, pacer thread, periodic timer).
pub struct Homa {
    engine: Arc<Engine>,
    collab: Collaborators,
    tick: AtomicU64,
}

impl Homa {
    /// Builds the engine and spawns its background loops through
    /// `collab.spawner` (§1: the core only requires a spawn primitive,
    /// not a specific executor).
    pub fn new(config: HomaConfig, collab: Collaborators) -> Arc<Self> {
        let homa = Arc::new(Self { engine: Engine::new(config), collab, tick: AtomicU64::new(0) });
        homa.clone().spawn_background_loops();
        homa
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// `socket()` (§6): a fresh socket bound to an ephemeral client port.
    pub fn socket(self: &Arc<Self>) -> Socket {
        let state = self.engine.sockets.create();
        Socket { homa: self.clone(), state }
    }

    fn spawn_background_loops(self: Arc<Self>) {
        let recv_homa = self.clone();
        self.collab.spawner.spawn(Box::pin(async move { recv_homa.receive_loop().await }));

        let pacer_homa = self.clone();
        self.collab.spawner.spawn(Box::pin(async move { pacer_homa.pacer_loop().await }));

        let timer_homa = self.clone();
        self.collab.spawner.spawn(Box::pin(async move { timer_homa.timer_loop().await }));
    }

    /// Soft-interrupt context (§5 item 2): demuxes every arriving
    /// datagram and transmits whatever the dispatcher decided to send
    /// back (GRANT, CUTOFFS, RESTART, retransmitted DATA, ...).
    async fn receive_loop(self: Arc<Self>) {
        loop {
            match self.collab.transport.recv_from().await {
                Ok((raw, src_addr)) => {
                    let now_tick = self.tick.load(Ordering::Relaxed);
                    let outgoing = dispatch::dispatch(&self.engine, src_addr, &raw, now_tick);
                    self.send_all(outgoing).await;
                    self.check_pacer().await;
                }
                Err(e) => {
                    error!(error = %e, "transport recv_from failed, receive loop stopping");
                    break;
                }
            }
        }
    }

    /// The dedicated pacer thread (§4.9, §5 item 3): keeps pumping the
    /// throttled list on a short cadence. Real Homa's pacer otherwise
    /// sleeps on an empty throttled list; here a short poll interval
    /// stands in for that wakeup without needing a condvar plumbed
    /// through the `Spawner` trait.
    async fn pacer_loop(self: Arc<Self>) {
        loop {
            self.check_pacer().await;
            tokio::time::sleep(std::time::Duration::from_micros(100)).await;
        }
    }

    /// The periodic timer (§4.10, §5 item 4), nominally ~1ms.
    async fn timer_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(1));
        loop {
            interval.tick().await;
            let now_tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
            for socket in self.engine.sockets.all() {
                let actions = {
                    let config = self.engine.config();
                    timer::tick(&socket, &config, &self.engine.metrics, now_tick)
                };
                for action in actions {
                    self.send_timer_action(action).await;
                }
            }
        }
    }

    async fn send_timer_action(&self, action: TimerAction) {
        match action {
            TimerAction::Resend { handle, offset, length, priority } => {
                self.engine.metrics.resends_sent();
                let (dest_addr, dest_port, local_port, id) = {
                    let rpc = handle.lock();
                    (rpc.peer.addr, rpc.remote_port, rpc.local_port, rpc.id)
                };
                let header = CommonHeader::new(local_port, dest_port, id.0, PacketType::Resend);
                let packet = Packet::Resend(crate::wire::ResendPacket { header, offset, length, priority });
                if let Err(e) = self.collab.transport.send_to(dest_addr, priority, &packet.encode()).await {
                    self.engine.metrics.transmit_failed();
                    warn!(error = %e, "failed to transmit timer-issued resend");
                }
            }
            TimerAction::Busy { handle } => {
                let (dest_addr, dest_port, local_port, id) = {
                    let rpc = handle.lock();
                    (rpc.peer.addr, rpc.remote_port, rpc.local_port, rpc.id)
                };
                let header = CommonHeader::new(local_port, dest_port, id.0, PacketType::Busy);
                let packet = Packet::Busy(crate::wire::BusyPacket { header });
                if let Err(e) = self.collab.transport.send_to(dest_addr, 0, &packet.encode()).await {
                    self.engine.metrics.transmit_failed();
                    warn!(error = %e, "failed to transmit timer-issued busy");
                }
            }
        }
    }

    async fn send_all(&self, outgoing: Vec<Outgoing>) {
        for o in outgoing {
            if let Err(e) = self.collab.transport.send_to(o.dest_addr, o.priority, &o.packet.encode()).await {
                self.engine.metrics.transmit_failed();
                warn!(error = %e, "failed to transmit dispatcher-generated packet");
            }
        }
    }

    /// `check_pacer()` (§4.9): becomes the sole pump (via `pacer_active`)
    /// if no one else currently is, drains up to [`PACER_BATCH_LIMIT`]
    /// frames, and releases the guard. Any thread entering the
    /// transport may call this opportunistically (§4.9 "cooperative
    /// pacer") to cover the dedicated pacer thread having been
    /// descheduled.
    async fn check_pacer(&self) {
        if !self.engine.pacer.try_acquire() {
            return;
        }
        let mut sent = 0;
        loop {
            let now_ns = self.collab.clock.now_ns();
            let frames = {
                let config = self.engine.config();
                self.engine.pacer.pump(&config, now_ns)
            };
            if frames.is_empty() {
                break;
            }
            sent += frames.len();
            for frame in frames {
                self.send_paced_frame(frame).await;
            }
            if sent >= PACER_BATCH_LIMIT {
                break;
            }
        }
        self.engine.pacer.release();
    }

    async fn send_paced_frame(&self, paced: PacedFrame) {
        let (dest_addr, dest_port, local_port, id, length, incoming, cutoff_version) = {
            let rpc = paced.handle.lock();
            let msgout = match rpc.msgout.as_ref() {
                Some(m) => m,
                None => return,
            };
            let incoming = rpc.msgin.as_ref().map(|m| m.incoming).unwrap_or(0);
            (
                rpc.peer.addr,
                rpc.remote_port,
                rpc.local_port,
                rpc.id,
                msgout.length,
                incoming,
                rpc.peer.cutoff_version(),
            )
        };
        let header = CommonHeader::new(local_port, dest_port, id.0, PacketType::Data);
        let packet = Packet::Data(DataPacket {
            header,
            message_length: length,
            incoming,
            cutoff_version,
            retransmit: paced.frame.retransmit,
            segments: vec![Segment { offset: paced.frame.offset, payload: paced.frame.payload }],
        });
        if let Err(e) = self.collab.transport.send_to(dest_addr, paced.priority, &packet.encode()).await {
            self.engine.metrics.transmit_failed();
            warn!(error = %e, "failed to transmit paced DATA frame");
        }
    }
}

/// One endpoint (§6): `socket()`, `bind(port)`, `send`, `reply`, `recv`,
/// `poll`, `shutdown`/`close`.
pub struct Socket {
    homa: Arc<Homa>,
    state: Arc<SocketState>,
}

impl Socket {
    /// `bind(port)` (§6): assigns a server port. `port == 0` leaves the
    /// socket client-only.
    pub fn bind(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Ok(());
        }
        self.homa.engine.sockets.bind(&self.state, port)
    }

    pub fn local_client_port(&self) -> u16 {
        self.state.client_port
    }

    pub fn local_server_port(&self) -> u16 {
        self.state.server_port.load(Ordering::Acquire)
    }

    /// `send(dest, buffer)` (§6): starts a client RPC and returns its id
    /// immediately — the message is queued for transmission, not
    /// necessarily sent by the time this returns (§5: "send returns
    /// immediately with the message queued").
    pub async fn send(&self, dest_addr: Ipv4Addr, dest_port: u16, buffer: &[u8]) -> Result<RpcId> {
        self.reap();
        let (rtt_bytes, max_gso_size, max_sched_prio) = {
            let config = self.homa.engine.config();
            (config.rtt_bytes, config.max_gso_size, config.max_sched_prio)
        };
        let peer = self.homa.engine.peers.find(dest_addr);
        let id = self.state.alloc_id();
        let mut rpc = Rpc::new_client(id, peer, self.state.client_port, dest_port);
        rpc.msgout = Some(OutboundMessage::new(buffer, rtt_bytes, max_gso_size, max_sched_prio));
        let handle: RpcHandle = Arc::new(Mutex::new(rpc));
        self.state.insert_client_rpc(handle.clone());
        self.homa.engine.pacer.enqueue(handle);
        self.homa.check_pacer().await;
        Ok(id)
    }

    /// `reply(id, buffer)` (§6): completes a server RPC that is
    /// currently `InService` (i.e. the application already read its
    /// request via [`Socket::recv`]).
    pub async fn reply(&self, id: RpcId, buffer: &[u8]) -> Result<()> {
        self.reap();
        let Some(handle) = self.state.find_server_rpc_by_id(id) else {
            return Err(Error::UnknownRpc);
        };
        let (rtt_bytes, max_gso_size, max_sched_prio) = {
            let config = self.homa.engine.config();
            (config.rtt_bytes, config.max_gso_size, config.max_sched_prio)
        };
        {
            let mut rpc = handle.lock();
            if rpc.state != RpcState::InService {
                return Err(Error::UnknownRpc);
            }
            rpc.msgout = Some(OutboundMessage::new(buffer, rtt_bytes, max_gso_size, max_sched_prio));
            rpc.state = RpcState::Outgoing;
        }
        self.homa.engine.pacer.enqueue(handle);
        self.homa.check_pacer().await;
        Ok(())
    }

    /// `recv(flags [, id]) -> (id, buffer, src)` (§6): dequeues the next
    /// `READY` server-RPC request or client-RPC response. `id` filters
    /// to one exchange; `flags.nonblock` makes this return
    /// [`Error::Interrupted`]-free but with no message instead of
    /// blocking (modeled as `None`).
    pub async fn recv(&self, flags: RecvFlags, id: Option<RpcId>) -> Result<Option<(RpcId, Vec<u8>, Ipv4Addr)>> {
        self.reap();
        loop {
            if let Some(result) = self.try_dequeue_ready(id)? {
                return Ok(Some(result));
            }
            if flags.nonblock {
                return Ok(None);
            }
            let request_ready = self.state.request_ready.clone();
            let response_ready = self.state.response_ready.clone();
            tokio::select! {
                _ = request_ready.notified() => {}
                _ = response_ready.notified() => {}
            }
        }
    }

    /// Tries a request first, then a response, so a socket that both
    /// serves and has made client calls still drains both queues; `id`
    /// narrows to one specific exchange (§6: `recv(flags, id)`).
    fn try_dequeue_ready(&self, id: Option<RpcId>) -> Result<Option<(RpcId, Vec<u8>, Ipv4Addr)>> {
        let handle = match id {
            Some(id) => {
                self.state.take_ready_request_by_id(id).or_else(|| self.state.take_ready_response_by_id(id))
            }
            None => self.state.pop_ready_request().or_else(|| self.state.pop_ready_response()),
        };

        let Some(handle) = handle else { return Ok(None) };

        let mut rpc = handle.lock();
        if let Some(err) = rpc.error.take() {
            drop(rpc);
            self.state.retire(&handle);
            return Err(err);
        }
        let src = rpc.peer.addr;
        let rpc_id = rpc.id;
        match rpc.role {
            Role::Server => {
                let buffer = rpc.msgin.as_ref().map(|m| m.reassembled()).unwrap_or_default();
                rpc.state = RpcState::InService;
                Ok(Some((rpc_id, buffer, src)))
            }
            Role::Client => {
                let buffer = rpc.msgin.as_ref().map(|m| m.reassembled()).unwrap_or_default();
                rpc.state = RpcState::ClientDone;
                drop(rpc);
                self.state.retire(&handle);
                Ok(Some((rpc_id, buffer, src)))
            }
        }
    }

    /// `poll()` (§6): resolves once a request or response is available,
    /// without consuming it — the caller follows up with [`Socket::recv`].
    pub async fn poll(&self) {
        if self.has_ready() {
            return;
        }
        let request_ready = self.state.request_ready.clone();
        let response_ready = self.state.response_ready.clone();
        tokio::select! {
            _ = request_ready.notified() => {}
            _ = response_ready.notified() => {}
        }
    }

    fn has_ready(&self) -> bool {
        let request = self.state.pop_ready_request();
        if let Some(h) = request {
            // Peeked via pop; put it back at the front so FIFO order and
            // `recv` both still see it.
            self.state.push_ready_request_front(h);
            return true;
        }
        let response = self.state.pop_ready_response();
        if let Some(h) = response {
            self.state.push_ready_response_front(h);
            return true;
        }
        false
    }

    /// `shutdown()`/`close()` (§6): aborts every RPC on this socket,
    /// releases its port(s), and drains the dead list.
    pub fn shutdown(&self) {
        self.state.shutdown();
        self.homa.engine.sockets.remove(&self.state);
        self.reap();
    }

    /// The reaper (§5 item 5): runs opportunistically on send/recv
    /// entry, releasing a bounded batch of already-dead RPCs so no
    /// single call pays for an unbounded backlog (§5, §9).
    fn reap(&self) {
        let _ = self.state.drain_dead(REAPER_BATCH);
    }
}

/// Flags accepted by [`Socket::recv`] (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvFlags {
    pub nonblock: bool,
}

impl RecvFlags {
    pub const NONBLOCK: RecvFlags = RecvFlags { nonblock: true };
    pub const NONE: RecvFlags = RecvFlags { nonblock: false };
}
