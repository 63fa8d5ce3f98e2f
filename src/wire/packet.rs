//! Per-type packet bodies (§4.1) layered on top of [`super::CommonHeader`].

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use super::header::{CommonHeader, PacketType, HEADER_LEN};
use super::{pad_to_minimum, WireError, MIN_PACKET_LEN};
use crate::config::NUM_PRIORITIES;

/// A single `(offset, payload)` segment inside a DATA packet. A
/// segmentation-offload layer may further split a frame's segments; Homa
/// itself only needs to know where each one starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub offset: u32,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub header: CommonHeader,
    pub message_length: u32,
    pub incoming: u32,
    pub cutoff_version: u16,
    pub retransmit: bool,
    pub segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantPacket {
    pub header: CommonHeader,
    pub offset: u32,
    pub priority: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResendPacket {
    pub header: CommonHeader,
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPacket {
    pub header: CommonHeader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusyPacket {
    pub header: CommonHeader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CutoffsPacket {
    pub header: CommonHeader,
    pub cutoffs: [u32; NUM_PRIORITIES],
    pub cutoff_version: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreezePacket {
    pub header: CommonHeader,
}

/// Any of the seven wire packet types, after the common header has been
/// used to pick which body to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Grant(GrantPacket),
    Resend(ResendPacket),
    Restart(RestartPacket),
    Busy(BusyPacket),
    Cutoffs(CutoffsPacket),
    Freeze(FreezePacket),
}

impl Packet {
    pub fn header(&self) -> &CommonHeader {
        match self {
            Packet::Data(p) => &p.header,
            Packet::Grant(p) => &p.header,
            Packet::Resend(p) => &p.header,
            Packet::Restart(p) => &p.header,
            Packet::Busy(p) => &p.header,
            Packet::Cutoffs(p) => &p.header,
            Packet::Freeze(p) => &p.header,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_PACKET_LEN);
        match self {
            Packet::Data(p) => p.encode(&mut buf),
            Packet::Grant(p) => p.encode(&mut buf),
            Packet::Resend(p) => p.encode(&mut buf),
            Packet::Restart(p) => p.encode(&mut buf),
            Packet::Busy(p) => p.encode(&mut buf),
            Packet::Cutoffs(p) => p.encode(&mut buf),
            Packet::Freeze(p) => p.encode(&mut buf),
        }
        pad_to_minimum(&mut buf);
        buf
    }

    /// Parses a raw datagram into a typed packet. Discards (per §7) that
    /// are the dispatcher's responsibility to count — short packets and
    /// unknown type codes — are surfaced as [`WireError`] so the caller
    /// can bump the right metric and move on.
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < MIN_PACKET_LEN {
            return Err(WireError::TooShort(raw.len()));
        }
        let mut cursor = Cursor::new(raw);
        let header = CommonHeader::decode(&mut cursor)?;
        Ok(match header.packet_type {
            PacketType::Data => Packet::Data(DataPacket::decode_body(header, &mut cursor)?),
            PacketType::Grant => Packet::Grant(GrantPacket::decode_body(header, &mut cursor)?),
            PacketType::Resend => Packet::Resend(ResendPacket::decode_body(header, &mut cursor)?),
            PacketType::Restart => Packet::Restart(RestartPacket { header }),
            PacketType::Busy => Packet::Busy(BusyPacket { header }),
            PacketType::Cutoffs => {
                Packet::Cutoffs(CutoffsPacket::decode_body(header, &mut cursor)?)
            }
            PacketType::Freeze => Packet::Freeze(FreezePacket { header }),
        })
    }
}

impl DataPacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        let mut header = self.header;
        header.data_offset = (HEADER_LEN / 4) as u8;
        header.encode(dest);
        dest.write_u32::<BigEndian>(self.message_length).unwrap();
        dest.write_u32::<BigEndian>(self.incoming).unwrap();
        dest.write_u16::<BigEndian>(self.cutoff_version).unwrap();
        dest.write_u8(self.retransmit as u8).unwrap();
        dest.write_u16::<BigEndian>(self.segments.len() as u16).unwrap();
        for seg in &self.segments {
            dest.write_u32::<BigEndian>(seg.offset).unwrap();
            dest.write_u32::<BigEndian>(seg.payload.len() as u32).unwrap();
            dest.extend_from_slice(&seg.payload);
        }
    }

    fn decode_body(header: CommonHeader, src: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let message_length =
            src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("message_length"))?;
        let incoming =
            src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("incoming"))?;
        let cutoff_version =
            src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("cutoff_version"))?;
        let retransmit = src.read_u8().map_err(|_| WireError::Truncated("retransmit"))? != 0;
        let count = src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("seg_count"))?;

        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset =
                src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("seg_offset"))?;
            let length =
                src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("seg_length"))?;
            let mut payload = vec![0u8; length as usize];
            std::io::Read::read_exact(src, &mut payload)
                .map_err(|_| WireError::Truncated("seg_payload"))?;
            segments.push(Segment { offset, payload });
        }

        Ok(Self { header, message_length, incoming, cutoff_version, retransmit, segments })
    }
}

impl GrantPacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        self.header.encode(dest);
        dest.write_u32::<BigEndian>(self.offset).unwrap();
        dest.write_u8(self.priority).unwrap();
    }

    fn decode_body(header: CommonHeader, src: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let offset = src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("offset"))?;
        let priority = src.read_u8().map_err(|_| WireError::Truncated("priority"))?;
        Ok(Self { header, offset, priority })
    }
}

impl ResendPacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        self.header.encode(dest);
        dest.write_u32::<BigEndian>(self.offset).unwrap();
        dest.write_u32::<BigEndian>(self.length).unwrap();
        dest.write_u8(self.priority).unwrap();
    }

    fn decode_body(header: CommonHeader, src: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let offset = src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("offset"))?;
        let length = src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("length"))?;
        let priority = src.read_u8().map_err(|_| WireError::Truncated("priority"))?;
        Ok(Self { header, offset, length, priority })
    }
}

impl RestartPacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        self.header.encode(dest);
    }
}

impl BusyPacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        self.header.encode(dest);
    }
}

impl FreezePacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        self.header.encode(dest);
    }
}

impl CutoffsPacket {
    fn encode(&self, dest: &mut Vec<u8>) {
        self.header.encode(dest);
        for c in &self.cutoffs {
            dest.write_u32::<BigEndian>(*c).unwrap();
        }
        dest.write_u16::<BigEndian>(self.cutoff_version).unwrap();
    }

    fn decode_body(header: CommonHeader, src: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let mut cutoffs = [0u32; NUM_PRIORITIES];
        for c in cutoffs.iter_mut() {
            *c = src.read_u32::<BigEndian>().map_err(|_| WireError::Truncated("cutoff"))?;
        }
        let cutoff_version =
            src.read_u16::<BigEndian>().map_err(|_| WireError::Truncated("cutoff_version"))?;
        Ok(Self { header, cutoffs, cutoff_version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::header::PacketType;

    fn hdr(t: PacketType) -> CommonHeader {
        CommonHeader::new(100, 200, 42, t)
    }

    #[test]
    fn data_packet_round_trips_with_segments() {
        let pkt = Packet::Data(DataPacket {
            header: hdr(PacketType::Data),
            message_length: 1000,
            incoming: 500,
            cutoff_version: 3,
            retransmit: false,
            segments: vec![
                Segment { offset: 0, payload: vec![1, 2, 3] },
                Segment { offset: 3, payload: vec![4, 5] },
            ],
        });
        let bytes = pkt.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn zero_byte_data_packet_round_trips() {
        let pkt = Packet::Data(DataPacket {
            header: hdr(PacketType::Data),
            message_length: 0,
            incoming: 0,
            cutoff_version: 1,
            retransmit: false,
            segments: vec![],
        });
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), MIN_PACKET_LEN);
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn grant_packet_round_trips() {
        let pkt =
            Packet::Grant(GrantPacket { header: hdr(PacketType::Grant), offset: 9000, priority: 2 });
        let bytes = pkt.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn resend_packet_round_trips() {
        let pkt = Packet::Resend(ResendPacket {
            header: hdr(PacketType::Resend),
            offset: 3000,
            length: 1400,
            priority: 5,
        });
        let bytes = pkt.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn cutoffs_packet_round_trips() {
        let pkt = Packet::Cutoffs(CutoffsPacket {
            header: hdr(PacketType::Cutoffs),
            cutoffs: [100, 200, 300, 400, 500, 600, 700, u32::MAX],
            cutoff_version: 9,
        });
        let bytes = pkt.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn control_only_packets_round_trip() {
        for t in [PacketType::Restart, PacketType::Busy, PacketType::Freeze] {
            let bytes = match t {
                PacketType::Restart => Packet::Restart(RestartPacket { header: hdr(t) }).encode(),
                PacketType::Busy => Packet::Busy(BusyPacket { header: hdr(t) }).encode(),
                PacketType::Freeze => Packet::Freeze(FreezePacket { header: hdr(t) }).encode(),
                _ => unreachable!(),
            };
            assert_eq!(bytes.len(), MIN_PACKET_LEN);
            Packet::decode(&bytes).unwrap();
        }
    }

    #[test]
    fn short_packet_is_rejected() {
        let buf = vec![0u8; MIN_PACKET_LEN - 1];
        assert!(matches!(Packet::decode(&buf), Err(WireError::TooShort(_))));
    }
}
