//! TCP segment view.

use std::fmt;
use std::net::IpAddr;

use etherparse::{TcpHeaderSlice, TcpOptionElement, TcpOptionsIterator};

use super::ipv4::{ones_complement_sum, IP_PROTO_TCP};
use crate::error::ProtocolError;

/// TCP flags bit positions.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// The control bits the reassembler looks at.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags(flags::SYN);
    pub const SYN_ACK: TcpFlags = TcpFlags(flags::SYN | flags::ACK);
    pub const ACK: TcpFlags = TcpFlags(flags::ACK);
    pub const PSH_ACK: TcpFlags = TcpFlags(flags::PSH | flags::ACK);
    pub const FIN_ACK: TcpFlags = TcpFlags(flags::FIN | flags::ACK);
    pub const RST: TcpFlags = TcpFlags(flags::RST);

    #[inline]
    pub fn syn(self) -> bool {
        self.0 & flags::SYN != 0
    }
    #[inline]
    pub fn ack(self) -> bool {
        self.0 & flags::ACK != 0
    }
    #[inline]
    pub fn fin(self) -> bool {
        self.0 & flags::FIN != 0
    }
    #[inline]
    pub fn rst(self) -> bool {
        self.0 & flags::RST != 0
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (flags::SYN, "SYN"),
            (flags::ACK, "ACK"),
            (flags::FIN, "FIN"),
            (flags::RST, "RST"),
            (flags::PSH, "PSH"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(","))
    }
}

/// A TCP segment with its network endpoints.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    /// Raw option bytes.
    pub options: &'a [u8],
    pub payload: &'a [u8],
    /// Header plus payload, for checksum verification.
    pub raw: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Parse the transport bytes of an IP packet.
    pub fn parse(src: IpAddr, dst: IpAddr, data: &'a [u8]) -> Result<Self, ProtocolError> {
        let tcp = TcpHeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
            protocol: "tcp",
            field: "header",
            reason: e.to_string(),
        })?;
        let header_len = tcp.slice().len();

        let mut bits = 0;
        for (set, bit) in [
            (tcp.fin(), flags::FIN),
            (tcp.syn(), flags::SYN),
            (tcp.rst(), flags::RST),
            (tcp.psh(), flags::PSH),
            (tcp.ack(), flags::ACK),
        ] {
            if set {
                bits |= bit;
            }
        }

        Ok(Self {
            src,
            dst,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: TcpFlags(bits),
            options: &data[20..header_len],
            payload: &data[header_len..],
            raw: data,
        })
    }

    /// Iterate the well-formed options.
    pub fn option_elements(&self) -> impl Iterator<Item = TcpOptionElement> + 'a {
        TcpOptionsIterator::from_slice(self.options).filter_map(|opt| opt.ok())
    }

    /// Sequence space consumed: payload plus one for each of SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.flags.syn() as u32 + self.flags.fin() as u32
    }

    /// Verify the checksum over the pseudo-header and the whole segment.
    pub fn checksum_valid(&self) -> bool {
        let len = self.raw.len() as u32;
        let mut pseudo = IP_PROTO_TCP as u32;
        match (self.src, self.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                pseudo += ones_complement_sum(&s.octets(), 0) as u32;
                pseudo += ones_complement_sum(&d.octets(), 0) as u32;
                pseudo += len;
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                pseudo += ones_complement_sum(&s.octets(), 0) as u32;
                pseudo += ones_complement_sum(&d.octets(), 0) as u32;
                pseudo += (len >> 16) + (len & 0xffff);
            }
            _ => return false,
        }
        ones_complement_sum(self.raw, pseudo) == 0xffff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn ipv4_tcp(payload: &[u8], syn: bool) -> Vec<u8> {
        let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64).tcp(40000, 80, 1000, 65535);
        let builder = if syn {
            builder.syn().options(&[TcpOptionElement::MaximumSegmentSize(1460)]).unwrap()
        } else {
            builder.ack(77).psh()
        };
        let mut out = Vec::new();
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn segment(packet: &[u8]) -> TcpSegment<'_> {
        TcpSegment::parse(
            IpAddr::from([10, 0, 0, 1]),
            IpAddr::from([10, 0, 0, 2]),
            &packet[20..],
        )
        .unwrap()
    }

    // Test 1: fields and flags come from the header
    #[test]
    fn test_parse_fields() {
        let packet = ipv4_tcp(b"GET / HTTP/1.1\r\n", false);
        let seg = segment(&packet);
        assert_eq!(seg.src_port, 40000);
        assert_eq!(seg.dst_port, 80);
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.ack, 77);
        assert!(seg.flags.ack() && !seg.flags.syn());
        assert_eq!(seg.payload, b"GET / HTTP/1.1\r\n");
        assert_eq!(seg.seq_len(), 16);
    }

    // Test 2: options are iterated from the raw bytes
    #[test]
    fn test_options() {
        let packet = ipv4_tcp(b"", true);
        let seg = segment(&packet);
        assert!(seg.flags.syn());
        assert_eq!(seg.seq_len(), 1);
        let opts: Vec<_> = seg.option_elements().collect();
        assert!(opts.contains(&TcpOptionElement::MaximumSegmentSize(1460)));
    }

    // Test 3: checksum verifies and detects corruption
    #[test]
    fn test_checksum() {
        let mut packet = ipv4_tcp(b"hello", false);
        assert!(segment(&packet).checksum_valid());
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        assert!(!segment(&packet).checksum_valid());
    }

    // Test 4: flag rendering
    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", TcpFlags::SYN_ACK), "[SYN,ACK]");
    }
}
