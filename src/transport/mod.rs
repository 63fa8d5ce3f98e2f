//! The protocol engine (§2-§5, §9): peer/socket/RPC tables, outbound
//! message pacing, inbound reassembly, the grant scheduler, the packet
//! dispatcher and the timer, plus the [`Engine`] that owns all of it.
//!
//! Mirrors the way the teacher's `protocol` module groups `rpc`, `xdr`
//! and `nfs` as siblings under one parent: each submodule here owns one
//! row of the component table in spec §2, and [`context::Engine`] is the
//! process-wide aggregate every socket and background task shares.

pub mod context;
pub mod dispatch;
pub mod grant;
pub mod message_in;
pub mod message_out;
pub mod pacer;
pub mod peer;
pub mod rpc;
pub mod socket;
pub mod timer;

pub use context::Engine;
pub use rpc::{Rpc, RpcId, RpcState, Role};
