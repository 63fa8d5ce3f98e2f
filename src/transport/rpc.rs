//! The RPC state machine (§4.6) and the `(socket, peer, id)` identity
//! every RPC is keyed by (§3).

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::transport::message_in::InboundMessage;
use crate::transport::message_out::OutboundMessage;
use crate::transport::peer::Peer;

/// 64-bit RPC identifier, unique per originating client socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(pub u64);

/// Distinguishes which end of the exchange an `Rpc` represents. A client
/// RPC is looked up by id alone within a socket; a server RPC is looked
/// up by `(peer, source port, id)` since many clients may reuse the same
/// id value independently (§4.7).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Lifecycle state (§3/§4.6). Client RPCs traverse
/// `Outgoing -> Incoming -> Ready -> ClientDone`. Server RPCs traverse
/// `Incoming -> Ready -> InService -> Outgoing` and then die once the
/// response has drained and gone silent.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RpcState {
    Outgoing,
    Incoming,
    Ready,
    InService,
    ClientDone,
}

/// Key a server RPC is looked up by: the requester's address, the
/// requester's ephemeral port, and the RPC id it chose.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerRpcKey {
    pub peer_addr: Ipv4Addr,
    pub client_port: u16,
    pub id: RpcId,
}

/// A single request/response exchange. Owns exactly one inbound and one
/// outbound message (§3); the RPC does not own its `Peer` (shared, never
/// freed) or its parent socket.
pub struct Rpc {
    pub id: RpcId,
    pub role: Role,
    pub state: RpcState,
    pub peer: Arc<Peer>,
    /// This socket's own Homa port for this RPC: the socket's
    /// `client_port` for a client RPC, its `server_port` for a server
    /// RPC. Needed to address GRANT/RESEND/CUTOFFS packets sent back
    /// to the peer (§4.7).
    pub local_port: u16,
    /// Port on the far end this RPC talks to (server port for a client
    /// RPC's request; the client's ephemeral port for a server RPC).
    pub remote_port: u16,

    pub msgout: Option<OutboundMessage>,
    pub msgin: Option<InboundMessage>,

    /// Client-only error slot; zero/`None` means healthy (§3).
    pub error: Option<crate::Error>,

    /// Ticks since the last packet was seen for this RPC (§4.10).
    pub silent_ticks: u32,
    /// RESENDs issued so far; `abort_resends` aborts the RPC (§4.10).
    pub num_resends: u32,

    /// Woken when the RPC transitions to `Ready` or `ClientDone` so a
    /// blocked `recv` can return. `rpc_deleted` on the waiter side (here,
    /// simply checking `state`/`error` after the notification fires)
    /// distinguishes "delivered" from "cancelled underneath me" (§5).
    pub waiter: Arc<Notify>,

    /// Membership flags for the five intrusive lists an RPC can belong
    /// to (§3, §9): active, grantable, throttled, and the two ready
    /// queues. A real kernel build avoids the allocation a `HashSet`-based
    /// membership table would cost by using embedded list links; in safe
    /// Rust the id-keyed tables in [`crate::transport::socket::SocketState`]
    /// and [`crate::transport::grant::GrantScheduler`] play that role, and
    /// these flags exist purely so a given subsystem can test "am I
    /// already linked in?" in O(1) without a lookup.
    pub in_grantable: bool,
    pub in_throttled: bool,
}

impl Rpc {
    pub fn new_client(id: RpcId, peer: Arc<Peer>, local_port: u16, remote_port: u16) -> Self {
        Self {
            id,
            role: Role::Client,
            state: RpcState::Outgoing,
            peer,
            local_port,
            remote_port,
            msgout: None,
            msgin: None,
            error: None,
            silent_ticks: 0,
            num_resends: 0,
            waiter: Arc::new(Notify::new()),
            in_grantable: false,
            in_throttled: false,
        }
    }

    pub fn new_server(id: RpcId, peer: Arc<Peer>, local_port: u16, remote_port: u16) -> Self {
        Self {
            id,
            role: Role::Server,
            state: RpcState::Incoming,
            peer,
            local_port,
            remote_port,
            msgout: None,
            msgin: None,
            error: None,
            silent_ticks: 0,
            num_resends: 0,
            waiter: Arc::new(Notify::new()),
            in_grantable: false,
            in_throttled: false,
        }
    }

    /// Whether this RPC is eligible for the active list the timer walks
    /// (§4.10) — i.e. it hasn't already been torn down.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, RpcState::ClientDone)
    }

    /// Fatal per-RPC abort (§7): set the client error and notify the
    /// waiter. A no-op on server RPCs, which are simply discarded by
    /// their socket instead (§4.10).
    pub fn abort(&mut self, err: crate::Error) {
        if self.role == Role::Client {
            self.error = Some(err);
            self.state = RpcState::ClientDone;
            self.waiter.notify_waiters();
        }
    }
}
