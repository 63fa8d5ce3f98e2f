//! The socket table (§4.3) and per-socket state (§3).
//!
//! A `SocketState` owns everything the protocol engine needs to drive one
//! bound or unbound endpoint: the RPC hash tables, the two ready queues,
//! the active/dead lists the timer and reaper walk, and the two waiter
//! notifications `recv` blocks on. `SocketTable` is the port -> socket
//! directory; like [`crate::transport::peer::PeerTable`] its write lock
//! only guards insertion and removal, never the lookup a hot-path
//! dispatch performs once it already has the `Arc`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::rpc::{Rpc, RpcId, ServerRpcKey};

/// An RPC shared between the dispatcher, timer, grant scheduler, pacer
/// and any application thread blocked on it.
pub type RpcHandle = Arc<Mutex<Rpc>>;

/// First ephemeral client port handed out; mirrors the common
/// Linux-style ephemeral range floor closely enough for a reference
/// engine, without claiming wire compatibility with any specific OS.
const FIRST_EPHEMERAL_PORT: u16 = 32_768;

struct SocketInner {
    client_rpcs: HashMap<RpcId, RpcHandle>,
    server_rpcs: HashMap<ServerRpcKey, RpcHandle>,
    /// Secondary index so the application-facing `reply(id, buffer)`
    /// surface (§6) can look up a server RPC by id alone, without
    /// needing to remember the full `(peer, port, id)` key it arrived
    /// under.
    server_ids: HashMap<RpcId, ServerRpcKey>,
    /// RPCs the timer walks every tick (§4.10); holds both client and
    /// server RPCs for this socket.
    active: Vec<RpcHandle>,
    /// Freed RPCs awaiting the reaper's bounded-batch release (§4.6, §5).
    dead: Vec<RpcHandle>,
    ready_requests: VecDeque<RpcHandle>,
    ready_responses: VecDeque<RpcHandle>,
}

impl Default for SocketInner {
    fn default() -> Self {
        Self {
            client_rpcs: HashMap::new(),
            server_rpcs: HashMap::new(),
            server_ids: HashMap::new(),
            active: Vec::new(),
            dead: Vec::new(),
            ready_requests: VecDeque::new(),
            ready_responses: VecDeque::new(),
        }
    }
}

/// One endpoint (§3). `server_port` is `0` until [`SocketTable::bind`]
/// assigns one; `client_port` is allocated eagerly at creation since
/// every socket can originate client RPCs regardless of whether it is
/// ever bound as a server.
pub struct SocketState {
    pub server_port: AtomicU16,
    pub client_port: u16,
    next_id: AtomicU64,
    inner: Mutex<SocketInner>,
    pub request_ready: Arc<Notify>,
    pub response_ready: Arc<Notify>,
}

impl SocketState {
    fn new(client_port: u16) -> Arc<Self> {
        Arc::new(Self {
            server_port: AtomicU16::new(0),
            client_port,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(SocketInner::default()),
            request_ready: Arc::new(Notify::new()),
            response_ready: Arc::new(Notify::new()),
        })
    }

    pub fn is_bound(&self) -> bool {
        self.server_port.load(Ordering::Acquire) != 0
    }

    /// Allocates the next outgoing RPC id for a client RPC originated on
    /// this socket (§3: "next-outgoing-id").
    pub fn alloc_id(&self) -> RpcId {
        RpcId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert_client_rpc(&self, handle: RpcHandle) {
        let id = handle.lock().id;
        let mut inner = self.inner.lock();
        inner.active.push(handle.clone());
        inner.client_rpcs.insert(id, handle);
    }

    pub fn find_client_rpc(&self, id: RpcId) -> Option<RpcHandle> {
        self.inner.lock().client_rpcs.get(&id).cloned()
    }

    pub fn insert_server_rpc(&self, key: ServerRpcKey, handle: RpcHandle) {
        let mut inner = self.inner.lock();
        inner.active.push(handle.clone());
        inner.server_ids.insert(key.id, key);
        inner.server_rpcs.insert(key, handle);
    }

    pub fn find_server_rpc(&self, key: &ServerRpcKey) -> Option<RpcHandle> {
        self.inner.lock().server_rpcs.get(key).cloned()
    }

    /// Looks up a server RPC by id alone (§6 `reply(id, buffer)`).
    pub fn find_server_rpc_by_id(&self, id: RpcId) -> Option<RpcHandle> {
        let inner = self.inner.lock();
        let key = inner.server_ids.get(&id)?;
        inner.server_rpcs.get(key).cloned()
    }

    /// Moves a request onto the ready-requests queue and wakes anyone
    /// polling for one (§4.6: READY server RPCs are dequeued by `recv`).
    pub fn push_ready_request(&self, handle: RpcHandle) {
        self.inner.lock().ready_requests.push_back(handle);
        self.request_ready.notify_waiters();
    }

    pub fn pop_ready_request(&self) -> Option<RpcHandle> {
        self.inner.lock().ready_requests.pop_front()
    }

    /// Re-inserts at the front after a peek (e.g. [`crate::Socket::poll`]
    /// checking readiness without consuming), preserving FIFO order for
    /// the next real dequeue.
    pub fn push_ready_request_front(&self, handle: RpcHandle) {
        self.inner.lock().ready_requests.push_front(handle);
    }

    pub fn push_ready_response(&self, handle: RpcHandle) {
        self.inner.lock().ready_responses.push_back(handle);
        self.response_ready.notify_waiters();
    }

    pub fn pop_ready_response(&self) -> Option<RpcHandle> {
        self.inner.lock().ready_responses.pop_front()
    }

    pub fn push_ready_response_front(&self, handle: RpcHandle) {
        self.inner.lock().ready_responses.push_front(handle);
    }

    /// Removes a specific response by id, for `recv(flags, id)` filtering
    /// to one exchange (§6).
    pub fn take_ready_response_by_id(&self, id: RpcId) -> Option<RpcHandle> {
        let mut inner = self.inner.lock();
        let pos = inner
            .ready_responses
            .iter()
            .position(|h| h.lock().id == id)?;
        inner.ready_responses.remove(pos)
    }

    /// Removes a specific request by id, for the same `recv(flags, id)`
    /// filtering on the server side (§6).
    pub fn take_ready_request_by_id(&self, id: RpcId) -> Option<RpcHandle> {
        let mut inner = self.inner.lock();
        let pos = inner
            .ready_requests
            .iter()
            .position(|h| h.lock().id == id)?;
        inner.ready_requests.remove(pos)
    }

    /// The active list the timer walks each tick (§4.10). Cloned out from
    /// under the lock so the timer never holds the socket lock while
    /// also trying to lock individual RPCs.
    pub fn active_rpcs(&self) -> Vec<RpcHandle> {
        self.inner.lock().active.clone()
    }

    /// Unlinks `handle` from the active list and the appropriate RPC
    /// table, moving it to the dead list for the reaper (§4.6).
    pub fn retire(&self, handle: &RpcHandle) {
        let (id, key) = {
            let rpc = handle.lock();
            (rpc.id, rpc_server_key(&rpc))
        };
        let mut inner = self.inner.lock();
        inner.active.retain(|h| !Arc::ptr_eq(h, handle));
        inner.client_rpcs.remove(&id);
        if let Some(key) = key {
            inner.server_rpcs.remove(&key);
            inner.server_ids.remove(&id);
        }
        inner.dead.push(handle.clone());
    }

    /// Releases up to `max_batch` dead RPCs (§5: capped reaper batches
    /// bound tail latency on the reclaiming thread).
    pub fn drain_dead(&self, max_batch: usize) -> Vec<RpcHandle> {
        let mut inner = self.inner.lock();
        let take = max_batch.min(inner.dead.len());
        inner.dead.drain(..take).collect()
    }

    pub fn dead_len(&self) -> usize {
        self.inner.lock().dead.len()
    }

    /// `shutdown()`/`close()` (§6): aborts every RPC on this socket and
    /// wakes every waiter. Aborted client RPCs are handed to the
    /// ready-response queue (rather than the dead list) so a blocked
    /// `recv` wakes up, observes [`Error::Shutdown`], and drives the sole
    /// `retire()` call for that handle itself (§8 invariant 7: a handle
    /// must land in `dead` exactly once). Everything else with no one
    /// left to drain it — server RPCs, which have no waiter to wake — is
    /// retired into `dead` here directly.
    pub fn shutdown(&self) {
        use crate::transport::rpc::Role;

        let active = self.active_rpcs();
        let mut aborted_clients = Vec::new();
        let mut retire_now = Vec::new();
        for handle in &active {
            let mut rpc = handle.lock();
            rpc.abort(Error::Shutdown);
            if rpc.role == Role::Client {
                aborted_clients.push(handle.clone());
            } else {
                retire_now.push(handle.clone());
            }
        }

        let mut inner = self.inner.lock();
        inner.active.clear();
        inner.client_rpcs.clear();
        inner.server_rpcs.clear();
        inner.server_ids.clear();
        inner.ready_requests.clear();
        inner.ready_responses.clear();
        inner.dead.append(&mut retire_now);
        inner.ready_responses.extend(aborted_clients);
        drop(inner);

        self.request_ready.notify_waiters();
        self.response_ready.notify_waiters();
    }
}

fn rpc_server_key(rpc: &Rpc) -> Option<ServerRpcKey> {
    use crate::transport::rpc::Role;
    (rpc.role == Role::Server).then(|| ServerRpcKey {
        peer_addr: rpc.peer.addr,
        client_port: rpc.remote_port,
        id: rpc.id,
    })
}

/// Port -> socket directory (§4.3).
pub struct SocketTable {
    by_port: RwLock<HashMap<u16, Arc<SocketState>>>,
    next_client_port: AtomicU16,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self {
            by_port: RwLock::new(HashMap::new()),
            next_client_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
        }
    }
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `socket()` (§6): creates a socket bound to a fresh ephemeral
    /// client port.
    pub fn create(&self) -> Arc<SocketState> {
        loop {
            let port = self.next_client_port.fetch_add(1, Ordering::Relaxed);
            if port == 0 {
                continue;
            }
            let mut table = self.by_port.write();
            if table.contains_key(&port) {
                continue;
            }
            let socket = SocketState::new(port);
            table.insert(port, socket.clone());
            debug!(port, "socket created");
            return socket;
        }
    }

    /// `bind(port)` (§6): assigns a server port. Fails if another socket
    /// already owns it.
    pub fn bind(&self, socket: &Arc<SocketState>, port: u16) -> Result<()> {
        let mut table = self.by_port.write();
        if let Some(existing) = table.get(&port) {
            if !Arc::ptr_eq(existing, socket) {
                return Err(Error::BindConflict(format!("port {port} already bound")));
            }
        }
        socket.server_port.store(port, Ordering::Release);
        table.insert(port, socket.clone());
        Ok(())
    }

    pub fn find(&self, port: u16) -> Option<Arc<SocketState>> {
        self.by_port.read().get(&port).cloned()
    }

    /// `shutdown()`/`close()` (§6): releases the port entries. The
    /// socket's own RPC/queue teardown is [`SocketState::shutdown`].
    pub fn remove(&self, socket: &SocketState) {
        let mut table = self.by_port.write();
        table.remove(&socket.client_port);
        let server_port = socket.server_port.load(Ordering::Acquire);
        if server_port != 0 {
            table.remove(&server_port);
        }
    }

    pub fn len(&self) -> usize {
        self.by_port.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every distinct socket currently registered, for the timer's
    /// per-tick walk (§4.10) and the reaper. A bound socket is keyed
    /// under both its client and server port, so entries are deduped by
    /// identity before returning.
    pub fn all(&self) -> Vec<Arc<SocketState>> {
        let table = self.by_port.read();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for socket in table.values() {
            if seen.insert(Arc::as_ptr(socket) as usize) {
                out.push(socket.clone());
            }
        }
        out
    }
}
