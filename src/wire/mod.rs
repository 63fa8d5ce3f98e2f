//! The Homa wire format (§4.1).
//!
//! Every packet begins with a 28-byte common header laid out so that a
//! hardware receive-side-scaling/segmentation-offload engine that only
//! understands TCP still hashes and splits Homa traffic sanely: source
//! and destination port sit where TCP expects them, and the 32-bit field
//! at the TCP sequence-number offset is never written by this crate.
//!
//! This module plays the role the teacher's `protocol::xdr` module plays
//! for NFS: every on-wire type encodes to and decodes from a plain byte
//! buffer with `byteorder`. Unlike XDR, Homa's format is not
//! self-describing or padded to 4-byte alignment — it is a fixed, compact
//! binary layout chosen to fit inside one MTU-sized datagram.

mod header;
mod packet;

pub use header::{CommonHeader, PacketType, HEADER_LEN};
pub use packet::{
    BusyPacket, CutoffsPacket, DataPacket, FreezePacket, GrantPacket, Packet, ResendPacket,
    RestartPacket, Segment,
};

/// Minimum legal size of a Homa packet on the wire (§4.1). Anything
/// shorter is discarded and counted rather than parsed.
pub const MIN_PACKET_LEN: usize = 64;

/// Errors produced while encoding or decoding wire packets.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet shorter than the {MIN_PACKET_LEN}-byte minimum: {0} bytes")]
    TooShort(usize),

    #[error("unknown packet type code {0}")]
    UnknownType(u8),

    #[error("truncated packet: {0}")]
    Truncated(&'static str),
}

/// Pads `buf` up to [`MIN_PACKET_LEN`] with zero bytes. Real Homa frames
/// are essentially never this small (GRANT/RESEND/etc. are far below the
/// header-plus-payload bound already), but the invariant is cheap to
/// maintain centrally rather than re-derive at every call site.
pub(crate) fn pad_to_minimum(buf: &mut Vec<u8>) {
    if buf.len() < MIN_PACKET_LEN {
        buf.resize(MIN_PACKET_LEN, 0);
    }
}
