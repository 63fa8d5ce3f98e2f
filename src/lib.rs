//! Homa — a datagram-oriented RPC transport optimized for low-tail-latency
//! request/response traffic inside a datacenter.
//!
//! Homa replaces stream transports (TCP) for short RPCs. It delivers whole
//! messages (up to ~1 MB) over a lossy, best-effort network by combining
//! receiver-driven scheduling (grants) with a link-rate pacer, so that tail
//! completion times stay close to the unloaded minimum even under load and
//! packet loss.
//!
//! ## What this crate implements
//!
//! - [`wire`]: the seven-packet wire format, bit-compatible with a TCP
//!   header prefix so RSS/GSO-capable NICs treat Homa traffic like TCP.
//! - [`transport`]: the protocol engine — peer/socket/RPC tables, outbound
//!   message pacing, inbound reassembly, the grant scheduler, the packet
//!   dispatcher, and the timer.
//! - [`net`]: the collaborator traits the core consumes (datagram
//!   send/receive, a monotonic clock, a periodic tick) plus a `tokio`
//!   UDP-backed implementation.
//! - [`Socket`]: the host-facing `send`/`reply`/`recv`/`poll`/`shutdown`
//!   surface built on top of the core engine.
//!
//! ## Non-goals
//!
//! No stream abstraction, no in-order delivery across messages, no
//! congestion control beyond receiver-granted scheduling plus link-rate
//! pacing, no encryption, no NAT traversal, no IPv6 in this revision.
//! Exactly-once execution is **not** guaranteed: a server may legitimately
//! execute the same request twice after loss-induced restart.

pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
mod socket_api;
pub mod transport;
pub mod wire;

pub use config::HomaConfig;
pub use error::Error;
pub use socket_api::{Homa, RecvFlags, Socket};
pub use transport::rpc::RpcId;
