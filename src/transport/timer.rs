//! The periodic timer (§4.10): silence detection, RESEND/BUSY issuance,
//! and RPC abort after too many unanswered RESENDs.

use tracing::{debug, warn};

use crate::config::HomaConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::transport::rpc::Role;
use crate::transport::socket::{RpcHandle, SocketState};

enum Decision {
    Resend { offset: u32, length: u32, priority: u8 },
    Busy,
    /// The RPC is done for: a client RPC is handed to the ready-response
    /// queue so a blocked `recv` wakes up and observes the error;
    /// a server RPC has no error slot and is simply retired (§4.10).
    Discard { was_client: bool },
}

/// One action the caller must actually perform on the wire, computed by
/// walking a socket's active-RPC list on a tick.
pub enum TimerAction {
    /// Emit a RESEND for `[offset, offset+length)` on `handle`'s inbound
    /// message.
    Resend { handle: RpcHandle, offset: u32, length: u32, priority: u8 },
    /// The RPC has only ever sent, never received — emit a liveness BUSY
    /// instead of a RESEND (§4.10: "if outbound-only, emit a BUSY").
    Busy { handle: RpcHandle },
}

/// Runs one tick over every active RPC on `socket` (§4.10). `now_tick` is
/// a monotonically increasing tick counter, not a wall-clock timestamp;
/// per-peer RESEND rate-limiting is expressed in ticks via
/// [`crate::transport::peer::Peer::should_send_resend`].
pub fn tick(socket: &SocketState, config: &HomaConfig, metrics: &Metrics, now_tick: u64) -> Vec<TimerAction> {
    let mut actions = Vec::new();

    for handle in socket.active_rpcs() {
        let decision = {
            let mut rpc = handle.lock();
            if !rpc.is_active() {
                continue;
            }
            rpc.silent_ticks += 1;
            if rpc.silent_ticks < config.resend_ticks {
                continue;
            }

            // §4.6: "OUTGOING (server), last frame sent and silent for
            // timeout -> (deleted)". A server RPC whose response has
            // been fully handed off and whose request has no
            // outstanding gap has nothing left to recover — retire it
            // on the generic silent-tick threshold directly (§8
            // scenario 1: reaped within resend_ticks+1 ticks of
            // silence), rather than cycling it through the rate-limited
            // resend/abort-count machinery that exists for loss
            // recovery.
            let server_done = rpc.role == Role::Server
                && rpc.msgout.as_ref().is_some_and(|m| m.fully_sent())
                && rpc.msgin.as_ref().is_some_and(|m| m.is_complete());
            if server_done {
                debug!(id = rpc.id.0, "server rpc fully sent and silent, retiring");
                Decision::Discard { was_client: false }
            } else if !rpc.peer.should_send_resend(now_tick, config.resend_interval as u64) {
                continue;
            } else {
                rpc.num_resends += 1;
                if rpc.num_resends >= config.abort_resends {
                    warn!(id = rpc.id.0, resends = rpc.num_resends, "aborting rpc after too many resends");
                    metrics.rpcs_timed_out();
                    // Clients get a waiter notification with the timeout error;
                    // servers have no error slot and are simply discarded (§4.10).
                    let was_client = rpc.role == Role::Client;
                    if was_client {
                        rpc.abort(Error::TimedOut);
                    }
                    Decision::Discard { was_client }
                } else if let Some(msgin) = rpc.msgin.as_ref() {
                    match msgin.get_resend_range() {
                        Some((offset, length)) => {
                            debug!(id = rpc.id.0, offset, length, "emitting resend");
                            Decision::Resend { offset, length, priority: msgin_priority(config) }
                        }
                        None => continue,
                    }
                } else {
                    debug!(id = rpc.id.0, "emitting busy (outbound-only, no inbound message)");
                    Decision::Busy
                }
            }
        };

        match decision {
            Decision::Resend { offset, length, priority } => {
                actions.push(TimerAction::Resend { handle, offset, length, priority });
            }
            Decision::Busy => {
                actions.push(TimerAction::Busy { handle });
            }
            Decision::Discard { was_client } => {
                if was_client {
                    socket.push_ready_response(handle.clone());
                } else {
                    socket.retire(&handle);
                }
            }
        }
    }

    actions
}

fn msgin_priority(config: &HomaConfig) -> u8 {
    config.max_sched_prio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message_in::InboundMessage;
    use crate::transport::message_out::OutboundMessage;
    use crate::transport::peer::PeerTable;
    use crate::transport::rpc::{Rpc, RpcId};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn socket_with_scheduled_rpc() -> Arc<SocketState> {
        let table = crate::transport::socket::SocketTable::new();
        let socket = table.create();
        let peer = PeerTable::new().find("10.0.0.1".parse::<Ipv4Addr>().unwrap());
        let mut rpc = Rpc::new_client(RpcId(1), peer, 20, 10);
        rpc.msgin = Some(InboundMessage::new(100_000, 10_000));
        socket.insert_client_rpc(Arc::new(parking_lot::Mutex::new(rpc)));
        socket
    }

    #[test]
    fn no_action_before_resend_ticks_elapse() {
        let config = HomaConfig::default();
        let metrics = Metrics::new();
        let socket = socket_with_scheduled_rpc();
        let actions = tick(&socket, &config, &metrics, 1);
        assert!(actions.is_empty());
    }

    #[test]
    fn resend_emitted_after_silence_threshold() {
        let config = HomaConfig::default();
        let metrics = Metrics::new();
        let socket = socket_with_scheduled_rpc();
        let mut actions = Vec::new();
        for t in 0..config.resend_ticks as u64 + 1 {
            actions = tick(&socket, &config, &metrics, t);
        }
        assert!(matches!(actions.first(), Some(TimerAction::Resend { .. })));
    }

    #[test]
    fn rpc_aborted_after_abort_resends_reached() {
        let mut config = HomaConfig::default();
        config.resend_ticks = 1;
        config.resend_interval = 1;
        config.abort_resends = 2;
        let metrics = Metrics::new();
        let socket = socket_with_scheduled_rpc();

        for t in 0..20u64 {
            tick(&socket, &config, &metrics, t);
        }

        // A timed-out client RPC is handed to the ready-response queue
        // (so a blocked `recv` wakes up and observes the error) rather
        // than retired outright; the application retires it by draining
        // that queue.
        let ready = socket.pop_ready_response().expect("timed-out rpc queued as a ready response");
        assert!(matches!(ready.lock().error, Some(Error::TimedOut)));
        assert_eq!(metrics.snapshot().rpcs_timed_out, 1);
    }

    /// §4.6 "OUTGOING (server), last frame sent and silent for timeout ->
    /// (deleted)" and §8 scenario 1: a server RPC whose response is fully
    /// sent and whose request has no outstanding gap is retired as soon
    /// as the silent-tick threshold is reached, not after cycling through
    /// `abort_resends` rounds of resend rate-limiting.
    #[test]
    fn fully_sent_server_rpc_is_retired_on_first_silence_threshold() {
        let mut config = HomaConfig::default();
        config.resend_ticks = 3;
        config.abort_resends = 5;
        let metrics = Metrics::new();

        let table = crate::transport::socket::SocketTable::new();
        let socket = table.create();
        let peer = PeerTable::new().find("10.0.0.5".parse::<Ipv4Addr>().unwrap());
        let mut rpc = Rpc::new_server(RpcId(1), peer, 99, 20);
        rpc.msgin = Some(InboundMessage::new(10, 10_000));
        rpc.msgin.as_mut().unwrap().on_data(0, &[0u8; 10], 10);
        let mut msgout = OutboundMessage::new(b"pong", 10_000, 1_400, 4);
        msgout.take_next_sendable();
        rpc.msgout = Some(msgout);
        let handle = Arc::new(parking_lot::Mutex::new(rpc));
        socket.insert_server_rpc(
            crate::transport::rpc::ServerRpcKey {
                peer_addr: "10.0.0.5".parse().unwrap(),
                client_port: 20,
                id: RpcId(1),
            },
            handle,
        );

        for t in 0..config.resend_ticks as u64 {
            let actions = tick(&socket, &config, &metrics, t);
            assert!(actions.is_empty(), "no action expected before the silence threshold");
        }
        tick(&socket, &config, &metrics, config.resend_ticks as u64);

        assert_eq!(socket.active_rpcs().len(), 0, "server rpc should be retired immediately");
        assert_eq!(socket.dead_len(), 1);
        // Retired because it's done, not because it exhausted resends.
        assert_eq!(metrics.snapshot().rpcs_timed_out, 0);
    }
}
