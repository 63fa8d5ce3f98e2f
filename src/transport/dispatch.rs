//! The packet dispatcher (§4.7): demuxes each incoming datagram into a
//! transition on the right RPC state machine and decides what, if
//! anything, needs to go back out on the wire.
//!
//! Mirrors the shape of the teacher's `protocol::rpc::wire::handle_rpc`:
//! one entry point that decodes, looks up routing state, and dispatches
//! by packet type to a handler — except where the teacher routes by RPC
//! program/version, Homa routes by destination port and then by id or
//! `(peer, port, id)` (§4.3, §4.7).

use std::net::Ipv4Addr;

use tracing::{debug, trace, warn};

use crate::transport::context::Engine;
use crate::transport::message_in::{InboundMessage, InsertOutcome};
use crate::transport::peer::Peer;
use crate::transport::rpc::{Rpc, RpcId, RpcState, Role, ServerRpcKey};
use crate::transport::socket::{RpcHandle, SocketState};
use crate::wire::{
    BusyPacket, CommonHeader, CutoffsPacket, DataPacket, FreezePacket, GrantPacket, Packet,
    PacketType, ResendPacket, RestartPacket,
};

/// One packet this dispatch pass decided to transmit, addressed to a
/// peer address/port — the caller (the driver loop in [`crate::Socket`]
/// and friends) is responsible for actually handing it to the
/// [`crate::net::DatagramTransport`].
pub struct Outgoing {
    pub dest_addr: Ipv4Addr,
    pub dest_port: u16,
    pub packet: Packet,
    pub priority: u8,
}

fn outgoing(dest_addr: Ipv4Addr, dest_port: u16, priority: u8, packet: Packet) -> Outgoing {
    Outgoing { dest_addr, dest_port, packet, priority }
}

/// Decodes `raw` and dispatches it (§4.7). Short packets and unknown
/// type codes are discarded and counted (§7) rather than propagated as
/// errors — nothing a caller can usefully branch on.
pub fn dispatch(engine: &Engine, src_addr: Ipv4Addr, raw: &[u8], now_tick: u64) -> Vec<Outgoing> {
    let packet = match Packet::decode(raw) {
        Ok(p) => p,
        Err(crate::wire::WireError::TooShort(_)) => {
            engine.metrics.short_packets();
            return Vec::new();
        }
        Err(crate::wire::WireError::UnknownType(t)) => {
            warn!(type_code = t, "discarding packet with unknown type code");
            engine.metrics.unknown_type();
            return Vec::new();
        }
        Err(e) => {
            warn!(error = %e, "discarding truncated packet");
            engine.metrics.short_packets();
            return Vec::new();
        }
    };

    let header = *packet.header();
    let Some(socket) = engine.sockets.find(header.dest_port) else {
        trace!(port = header.dest_port, "no socket bound to destination port");
        engine.metrics.unknown_rpc();
        return Vec::new();
    };

    if header.dest_port == socket.client_port {
        dispatch_client_side(engine, &socket, src_addr, packet, now_tick)
    } else {
        dispatch_server_side(engine, &socket, src_addr, packet, now_tick)
    }
}

/// Packets addressed to this socket's client port: they concern an RPC
/// *this* socket originated, matched by id alone (§4.3, §4.7).
fn dispatch_client_side(
    engine: &Engine,
    socket: &SocketState,
    src_addr: Ipv4Addr,
    packet: Packet,
    now_tick: u64,
) -> Vec<Outgoing> {
    let id = RpcId(packet.header().id);
    match &packet {
        Packet::Cutoffs(c) => {
            update_cutoffs(engine, src_addr, c);
            return Vec::new();
        }
        Packet::Freeze(_) => {
            debug!("received FREEZE (debug hook, no protocol effect)");
            return Vec::new();
        }
        _ => {}
    }

    let Some(handle) = socket.find_client_rpc(id) else {
        engine.metrics.unknown_rpc();
        return Vec::new();
    };

    match packet {
        Packet::Data(d) => on_data(engine, socket, &handle, &d, now_tick),
        Packet::Grant(g) => on_grant(engine, &handle, &g),
        Packet::Resend(r) => on_resend(engine, &handle, &r),
        Packet::Restart(_) => on_restart(engine, &handle),
        Packet::Busy(_) => {
            handle.lock().silent_ticks = 0;
            Vec::new()
        }
        Packet::Cutoffs(_) | Packet::Freeze(_) => unreachable!("handled above"),
    }
}

/// Packets addressed to this socket's bound server port: they concern
/// an RPC this socket is serving, matched by `(peer, source port, id)`
/// (§4.3, §4.7).
fn dispatch_server_side(
    engine: &Engine,
    socket: &SocketState,
    src_addr: Ipv4Addr,
    packet: Packet,
    now_tick: u64,
) -> Vec<Outgoing> {
    if !socket.is_bound() {
        engine.metrics.unknown_rpc();
        return Vec::new();
    }

    let header = *packet.header();
    let key = ServerRpcKey {
        peer_addr: src_addr,
        client_port: header.source_port,
        id: RpcId(header.id),
    };

    match packet {
        Packet::Data(d) => {
            let handle = socket.find_server_rpc(&key).unwrap_or_else(|| {
                let peer = engine.peers.find(src_addr);
                let rpc = Rpc::new_server(
                    key.id,
                    peer,
                    socket.server_port.load(std::sync::atomic::Ordering::Acquire),
                    header.source_port,
                );
                let handle: RpcHandle = std::sync::Arc::new(parking_lot::Mutex::new(rpc));
                socket.insert_server_rpc(key, handle.clone());
                debug!(id = key.id.0, "created server rpc on first DATA");
                handle
            });
            on_data(engine, socket, &handle, &d, now_tick)
        }
        Packet::Resend(r) => match socket.find_server_rpc(&key) {
            Some(handle) => on_resend(engine, &handle, &r),
            None => {
                engine.metrics.restarts_sent();
                vec![restart_reply(&header, src_addr)]
            }
        },
        Packet::Busy(_) => match socket.find_server_rpc(&key) {
            Some(handle) => {
                handle.lock().silent_ticks = 0;
                Vec::new()
            }
            None => {
                engine.metrics.restarts_sent();
                vec![restart_reply(&header, src_addr)]
            }
        },
        Packet::Grant(g) => match socket.find_server_rpc(&key) {
            Some(handle) => on_grant(engine, &handle, &g),
            None => {
                engine.metrics.unknown_rpc();
                Vec::new()
            }
        },
        Packet::Restart(_) => match socket.find_server_rpc(&key) {
            Some(handle) => on_restart(engine, &handle),
            None => Vec::new(),
        },
        Packet::Cutoffs(c) => {
            update_cutoffs(engine, src_addr, &c);
            Vec::new()
        }
        Packet::Freeze(_) => {
            debug!("received FREEZE (debug hook, no protocol effect)");
            Vec::new()
        }
    }
}

fn restart_reply(header: &CommonHeader, dest_addr: Ipv4Addr) -> Outgoing {
    let reply_header =
        CommonHeader::new(header.dest_port, header.source_port, header.id, PacketType::Restart);
    outgoing(dest_addr, header.source_port, 0, Packet::Restart(RestartPacket { header: reply_header }))
}

fn update_cutoffs(engine: &Engine, src_addr: Ipv4Addr, c: &CutoffsPacket) {
    engine.peers.find(src_addr).update_cutoffs(c.cutoffs, c.cutoff_version);
}

/// DATA arrival (§4.5, §4.7): reassemble, advance `incoming`, possibly
/// flip a client RPC `Outgoing -> Incoming`, refresh the sender's cutoff
/// knowledge, reset the silence clock, and poke the grant scheduler.
fn on_data(
    engine: &Engine,
    socket: &SocketState,
    handle: &RpcHandle,
    d: &DataPacket,
    now_tick: u64,
) -> Vec<Outgoing> {
    let config = engine.config();
    let (peer_addr, peer_remote_port, local_port, is_client): (Ipv4Addr, u16, u16, bool);
    let scheduled;
    let complete;
    let our_cutoff_version = config.cutoff_version();

    {
        let mut rpc = handle.lock();
        rpc.silent_ticks = 0;

        if rpc.role == Role::Client && rpc.state == RpcState::Outgoing {
            rpc.state = RpcState::Incoming;
            debug!(id = rpc.id.0, "client rpc: first response byte, Outgoing -> Incoming");
        }

        if rpc.msgin.is_none() {
            let window = config.unscheduled_window(d.message_length);
            rpc.msgin = Some(InboundMessage::new(d.message_length, window));
        }

        let msgin = rpc.msgin.as_mut().expect("just ensured msgin is Some");
        for seg in &d.segments {
            match msgin.on_data(seg.offset, &seg.payload, d.incoming) {
                InsertOutcome::Inserted => {}
                InsertOutcome::Duplicate => engine.metrics.duplicate_segment(),
                InsertOutcome::OutOfBounds => engine.metrics.short_packets(),
            }
        }

        scheduled = msgin.scheduled;
        complete = msgin.is_complete();

        if complete {
            rpc.state = RpcState::Ready;
            rpc.waiter.notify_waiters();
        }

        peer_addr = rpc.peer.addr;
        peer_remote_port = rpc.remote_port;
        local_port = rpc.local_port;
        is_client = rpc.role == Role::Client;
    }

    let mut outgoing_packets = Vec::new();

    if complete {
        engine.grants.unlink(handle);
        if is_client {
            socket.push_ready_response(handle.clone());
        } else {
            socket.push_ready_request(handle.clone());
        }
    } else if scheduled {
        engine.grants.link(handle.clone());
    }

    // Refresh the sender's view of our cutoffs if it's stale (§4.8).
    let peer: std::sync::Arc<Peer> = handle.lock().peer.clone();
    if d.cutoff_version != our_cutoff_version
        && peer.should_send_cutoffs(now_tick, config.resend_interval as u64)
    {
        let header = CommonHeader::new(local_port, peer_remote_port, d.header.id, PacketType::Cutoffs);
        outgoing_packets.push(outgoing(
            peer_addr,
            peer_remote_port,
            0,
            Packet::Cutoffs(CutoffsPacket {
                header,
                cutoffs: config.unsched_cutoffs,
                cutoff_version: our_cutoff_version,
            }),
        ));
        engine.metrics.cutoffs_sent();
    }

    if scheduled && !complete {
        for decision in engine.grants.poke(&config) {
            let (dest_addr, dest_port, local, rpc_id) = {
                let rpc = decision.handle.lock();
                (rpc.peer.addr, rpc.remote_port, rpc.local_port, rpc.id)
            };
            let header = CommonHeader::new(local, dest_port, rpc_id.0, PacketType::Grant);
            outgoing_packets.push(outgoing(
                dest_addr,
                dest_port,
                decision.priority,
                Packet::Grant(GrantPacket { header, offset: decision.offset, priority: decision.priority }),
            ));
            engine.metrics.grants_sent();
        }
    }

    outgoing_packets
}

/// GRANT arrival on the sending side (§4.7): advance `granted`, requeue
/// on the pacer if that newly unblocked sendable bytes, and adopt the
/// granted priority.
fn on_grant(engine: &Engine, handle: &RpcHandle, g: &GrantPacket) -> Vec<Outgoing> {
    let unblocked = {
        let mut rpc = handle.lock();
        rpc.silent_ticks = 0;
        match rpc.msgout.as_mut() {
            Some(msgout) => msgout.on_grant(g.offset, g.priority),
            None => false,
        }
    };
    if unblocked {
        engine.pacer.enqueue(handle.clone());
    }
    Vec::new()
}

/// RESEND arrival (§4.7): retransmit the requested range of *our own*
/// outbound message, flagged `retransmit = 1`. If we have no outbound
/// message yet for this RPC (e.g. a server still `InService`), answer
/// with BUSY instead, mirroring the timer's "outbound-only -> BUSY"
/// rule symmetrically for the inbound direction.
fn on_resend(engine: &Engine, handle: &RpcHandle, r: &ResendPacket) -> Vec<Outgoing> {
    let mut rpc = handle.lock();
    rpc.silent_ticks = 0;

    let Some(msgout) = rpc.msgout.as_mut() else {
        let header = CommonHeader::new(rpc.local_port, rpc.remote_port, rpc.id.0, PacketType::Busy);
        return vec![outgoing(rpc.peer.addr, rpc.remote_port, 0, Packet::Busy(BusyPacket { header }))];
    };

    let frames = msgout.frames_in_range(r.offset, r.length);
    let length = msgout.length;
    let local_port = rpc.local_port;
    let remote_port = rpc.remote_port;
    let peer_addr = rpc.peer.addr;
    let rpc_id = rpc.id.0;
    let incoming = rpc.msgin.as_ref().map(|m| m.incoming).unwrap_or(0);
    let cutoff_version = rpc.peer.cutoff_version();
    drop(rpc);

    engine.metrics.resends_sent();
    frames
        .into_iter()
        .map(|frame| {
            let header = CommonHeader::new(local_port, remote_port, rpc_id, PacketType::Data);
            outgoing(
                peer_addr,
                remote_port,
                r.priority,
                Packet::Data(DataPacket {
                    header,
                    message_length: length,
                    incoming,
                    cutoff_version,
                    retransmit: frame.retransmit,
                    segments: vec![crate::wire::Segment { offset: frame.offset, payload: frame.payload }],
                }),
            )
        })
        .collect()
}

/// RESTART arrival (§4.7): the peer lost all state for this exchange.
/// We rebuild our outbound progress from scratch (keeping the same id,
/// per §4.7/§9) and discard any partial response we'd started
/// reassembling.
fn on_restart(engine: &Engine, handle: &RpcHandle) -> Vec<Outgoing> {
    let should_requeue = {
        let mut rpc = handle.lock();
        rpc.silent_ticks = 0;
        rpc.num_resends = 0;
        rpc.msgin = None;
        if rpc.role == Role::Client {
            rpc.state = RpcState::Outgoing;
        }
        match rpc.msgout.as_mut() {
            Some(msgout) => {
                msgout.restart(engine.config().max_sched_prio);
                true
            }
            None => false,
        }
    };
    if should_requeue {
        engine.pacer.enqueue(handle.clone());
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message_out::OutboundMessage;
    use crate::transport::socket::SocketTable;
    use crate::wire::Segment;
    use std::sync::Arc;

    fn setup() -> (Arc<Engine>, Arc<SocketState>, Arc<SocketState>) {
        let engine = Engine::new(crate::HomaConfig::default());
        let client = engine.sockets.create();
        let server = engine.sockets.create();
        engine.sockets.bind(&server, 99).unwrap();
        (engine, client, server)
    }

    #[test]
    fn tiny_rpc_request_creates_server_rpc_and_completes() {
        let (engine, client, server) = setup();
        let id = client.alloc_id();
        let mut rpc = Rpc::new_client(id, engine.peers.find("10.0.0.1".parse().unwrap()), client.client_port, 99);
        rpc.msgout = Some(OutboundMessage::new(b"hello", 10_000, 1_400, 4));
        client.insert_client_rpc(Arc::new(parking_lot::Mutex::new(rpc)));

        let header = CommonHeader::new(client.client_port, 99, id.0, PacketType::Data);
        let data = Packet::Data(DataPacket {
            header,
            message_length: 5,
            incoming: 5,
            cutoff_version: 0,
            retransmit: false,
            segments: vec![Segment { offset: 0, payload: b"hello".to_vec() }],
        });
        let raw = data.encode();

        let out = dispatch(&engine, "10.0.0.2".parse().unwrap(), &raw, 0);
        assert!(out.is_empty());

        let key = ServerRpcKey { peer_addr: "10.0.0.2".parse().unwrap(), client_port: client.client_port, id };
        let server_rpc = server.find_server_rpc(&key).expect("server rpc created");
        assert!(server_rpc.lock().msgin.as_ref().unwrap().is_complete());
        assert_eq!(server.pop_ready_request().map(|h| h.lock().id), Some(id));
    }

    #[test]
    fn unknown_type_code_is_discarded_without_panic() {
        let (engine, _client, _server) = setup();
        let mut buf = vec![0u8; crate::wire::MIN_PACKET_LEN];
        buf[13] = 250;
        let out = dispatch(&engine, "10.0.0.1".parse().unwrap(), &buf, 0);
        assert!(out.is_empty());
        assert_eq!(engine.metrics.snapshot().unknown_type, 1);
    }

    #[test]
    fn resend_for_unknown_server_rpc_gets_restart() {
        let (engine, _client, server) = setup();
        let header = CommonHeader::new(555, server.server_port.load(std::sync::atomic::Ordering::Acquire), 42, PacketType::Resend);
        let pkt = Packet::Resend(ResendPacket { header, offset: 0, length: 10, priority: 0 });
        let raw = pkt.encode();
        let out = dispatch(&engine, "10.0.0.3".parse().unwrap(), &raw, 0);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].packet, Packet::Restart(_)));
        assert_eq!(engine.metrics.snapshot().restarts_sent, 1);
    }

    /// §8 scenario 4: the server crashes and restarts mid-RPC, loses its
    /// reassembly state, and replies RESTART instead of ACKing further
    /// DATA. The client rewinds its outbound message back to the
    /// unscheduled window and requeues it with the pacer rather than
    /// treating the RPC as failed.
    #[test]
    fn restart_rewinds_client_message_and_requeues_with_pacer() {
        let (engine, client, _server) = setup();
        let id = client.alloc_id();
        let mut rpc = Rpc::new_client(id, engine.peers.find("10.0.0.1".parse().unwrap()), client.client_port, 99);
        let mut msgout = OutboundMessage::new(&[7u8; 5_000], 10_000, 1_400, 4);
        while msgout.take_next_sendable().is_some() {}
        assert!(msgout.fully_sent());
        rpc.msgout = Some(msgout);
        rpc.msgin = Some(InboundMessage::new(10, 10_000));
        rpc.silent_ticks = 3;
        rpc.num_resends = 2;
        let handle = Arc::new(parking_lot::Mutex::new(rpc));
        client.insert_client_rpc(handle.clone());

        let header = CommonHeader::new(client.client_port, 99, id.0, PacketType::Restart);
        let pkt = Packet::Restart(RestartPacket { header });
        let raw = pkt.encode();

        let out = dispatch(&engine, "10.0.0.1".parse().unwrap(), &raw, 0);
        assert!(out.is_empty(), "RESTART is answered by resuming transmission, not a direct reply");

        let rpc = handle.lock();
        assert_eq!(rpc.silent_ticks, 0);
        assert_eq!(rpc.num_resends, 0);
        assert!(rpc.msgin.is_none(), "reassembly state is dropped along with the crashed server's");
        assert!(!rpc.msgout.as_ref().unwrap().fully_sent(), "outbound message rewound for retransmission");
        assert_eq!(rpc.state, RpcState::Outgoing);
    }
}
