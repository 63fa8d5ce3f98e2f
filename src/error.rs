//! Public error type returned from the host-facing socket surface.
//!
//! Internal dispatch and codec paths discard malformed or unrouteable
//! packets via `tracing::warn!`/`debug!` rather than surfacing a `Result` —
//! those are paths a caller never branches on. This type covers exactly the
//! client-visible outcomes from the RPC error taxonomy: resend exhaustion,
//! socket shutdown, cancellation, and local port-binding conflicts.
//!
//! The spec's fatal-per-RPC taxonomy also names a "peer abort propagated
//! from ICMP error" trigger (an unreachable-destination signal the host OS
//! would normally deliver out-of-band). That trigger is **not implemented**
//! here: detecting it needs a host-level signal (a raw/ICMP socket, or
//! `MSG_ERRQUEUE` on a connected UDP socket) that [`crate::net::UdpTransport`]
//! — like the rest of the OS-facade layer §1 places out of scope — doesn't
//! surface through safe `tokio` UDP. See `DESIGN.md` for the same kind of
//! documented limitation around the UDP/raw-IP substitution.

use thiserror::Error;

/// Errors visible to a caller of [`crate::Socket`].
#[derive(Debug, Error)]
pub enum Error {
    /// `abort_resends` was reached without a response; the RPC has been
    /// moved to `CLIENT_DONE` with this error set.
    #[error("RPC timed out after exhausting resends")]
    TimedOut,

    /// The socket was shut down while the RPC was outstanding.
    #[error("socket was shut down")]
    Shutdown,

    /// A blocking receive was interrupted before a message became ready.
    #[error("operation interrupted")]
    Interrupted,

    /// `bind(port)` named a server port already owned by another socket
    /// in this process.
    #[error("bind conflict: {0}")]
    BindConflict(String),

    /// A malformed or truncated wire packet was encountered where the
    /// caller needs to know (as opposed to a silent, counted discard).
    #[error("wire format error: {0}")]
    Wire(#[from] crate::wire::WireError),

    /// The underlying datagram transport failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No RPC exists with the given id.
    #[error("unknown RPC id")]
    UnknownRpc,
}

pub type Result<T> = std::result::Result<T, Error>;
