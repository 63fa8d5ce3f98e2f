//! The 28-byte common header shared by every Homa packet type (§4.1).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use std::io::Cursor;

use super::WireError;

/// Size in bytes of the common header.
pub const HEADER_LEN: usize = 28;

/// One-byte type code carried in the common header.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 20,
    Grant = 21,
    Resend = 22,
    Restart = 23,
    Busy = 24,
    Cutoffs = 25,
    Freeze = 26,
}

/// The header fields common to every packet type.
///
/// Bit-compatible with a TCP header prefix: `reserved_seq` sits at the TCP
/// sequence-number offset and is never written, since offload hardware may
/// mutate that slot; `checksum_reserved` sits at the TCP checksum offset
/// for the same reason.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommonHeader {
    pub source_port: u16,
    pub dest_port: u16,
    /// RPC identifier. Big-endian on the wire; host-order in memory.
    pub id: u64,
    pub packet_type: PacketType,
    /// 4-bit data offset (in 4-byte words), valid only for DATA packets;
    /// covers the header up to (but not including) the first segment.
    pub data_offset: u8,
}

impl CommonHeader {
    pub fn new(source_port: u16, dest_port: u16, id: u64, packet_type: PacketType) -> Self {
        Self { source_port, dest_port, id, packet_type, data_offset: 0 }
    }

    pub fn encode(&self, dest: &mut Vec<u8>) {
        dest.write_u16::<BigEndian>(self.source_port).unwrap();
        dest.write_u16::<BigEndian>(self.dest_port).unwrap();
        dest.write_u32::<BigEndian>(0).unwrap(); // reserved1
        dest.write_u32::<BigEndian>(0).unwrap(); // reserved_seq: never written
        dest.write_u8(self.data_offset << 4).unwrap();
        dest.write_u8(self.packet_type as u8).unwrap();
        dest.write_u16::<BigEndian>(0).unwrap(); // unused1
        dest.write_u16::<BigEndian>(0).unwrap(); // checksum_reserved: never written
        dest.write_u16::<BigEndian>(0).unwrap(); // unused2
        dest.write_u64::<BigEndian>(self.id).unwrap();
    }

    pub fn decode(src: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let source_port =
            src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("source_port"))?;
        let dest_port =
            src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("dest_port"))?;
        let _reserved1 =
            src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("reserved1"))?;
        let _reserved_seq =
            src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("reserved_seq"))?;
        let doff_byte = src.read_u8().map_err(|_| WireError::Truncated("data_offset"))?;
        let type_byte = src.read_u8().map_err(|_| WireError::Truncated("type"))?;
        let _unused1 = src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("unused1"))?;
        let _checksum_reserved =
            src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("checksum_reserved"))?;
        let _unused2 = src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("unused2"))?;
        let id = src.read_u64::<BigEndian>().map_err(|_| WireError::Truncated("id"))?;

        let packet_type =
            PacketType::from_u8(type_byte).ok_or(WireError::UnknownType(type_byte))?;

        Ok(Self { source_port, dest_port, id, packet_type, data_offset: doff_byte >> 4 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let h = CommonHeader {
            data_offset: 7,
            ..CommonHeader::new(80, 443, 0xdead_beef_0011_2233, PacketType::Data)
        };
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = CommonHeader::decode(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn never_writes_reserved_slots() {
        let h = CommonHeader::new(1, 2, 3, PacketType::Busy);
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]); // reserved_seq
        assert_eq!(&buf[16..18], &[0, 0]); // checksum_reserved
    }

    #[test]
    fn rejects_unknown_type_code() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[13] = 200;
        let err = CommonHeader::decode(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(200)));
    }
}
