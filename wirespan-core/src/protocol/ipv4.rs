//! IPv4 header access.

use std::net::Ipv4Addr;

use etherparse::Ipv4HeaderSlice;

use crate::error::ProtocolError;

/// IP protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;

/// Decoded view of an IPv4 packet.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub header: &'a [u8],
    pub payload: &'a [u8],
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub more_fragments: bool,
    /// Fragment offset in bytes.
    pub fragment_offset: usize,
}

impl<'a> Ipv4Packet<'a> {
    /// Parse `data`, trimming link-layer padding past the total length.
    pub fn parse(data: &'a [u8]) -> Result<Self, ProtocolError> {
        let ip = Ipv4HeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
            protocol: "ipv4",
            field: "header",
            reason: e.to_string(),
        })?;
        let header_len = ip.slice().len();
        let end = (ip.total_len() as usize).max(header_len).min(data.len());

        Ok(Self {
            header: ip.slice(),
            payload: &data[header_len..end],
            src: ip.source_addr(),
            dst: ip.destination_addr(),
            protocol: ip.protocol().0,
            identification: ip.identification(),
            more_fragments: ip.more_fragments(),
            fragment_offset: ip.fragments_offset().value() as usize * 8,
        })
    }

    /// Whether this packet is one piece of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

/// Ones-complement sum of 16-bit big-endian words, folded.
pub fn ones_complement_sum(data: &[u8], initial: u32) -> u16 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Header checksum for an IPv4 header whose checksum field is zero.
pub fn header_checksum(header: &[u8]) -> u16 {
    !ones_complement_sum(header, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{IpNumber, Ipv4Header};

    fn header(payload_len: usize) -> Ipv4Header {
        Ipv4Header::new(payload_len as u16, 64, IpNumber::TCP, [10, 0, 0, 1], [10, 0, 0, 2]).unwrap()
    }

    fn packet(payload_len: usize, padding: usize) -> Vec<u8> {
        let header = header(payload_len);
        let mut out = Vec::new();
        header.write(&mut out).unwrap();
        out.extend(std::iter::repeat(0xAB).take(payload_len));
        out.extend(std::iter::repeat(0).take(padding));
        out
    }

    // Test 1: payload is bounded by total length, not the frame
    #[test]
    fn test_parse_trims_padding() {
        let data = packet(6, 10);
        let ip = Ipv4Packet::parse(&data).unwrap();
        assert_eq!(ip.payload.len(), 6);
        assert_eq!(ip.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.protocol, IP_PROTO_TCP);
        assert!(!ip.is_fragment());
    }

    // Test 2: truncated capture keeps what is there
    #[test]
    fn test_parse_truncated() {
        let data = packet(100, 0);
        let ip = Ipv4Packet::parse(&data[..40]).unwrap();
        assert_eq!(ip.payload.len(), 20);
    }

    // Test 3: computed header checksum matches the writer's
    #[test]
    fn test_header_checksum() {
        let expected = header(0).calc_header_checksum();
        let mut data = packet(0, 0);
        data[10] = 0;
        data[11] = 0;
        assert_eq!(header_checksum(&data[..20]), expected);
    }

    // Test 4: odd-length sums pad with zero
    #[test]
    fn test_ones_complement_odd() {
        assert_eq!(ones_complement_sum(&[0x01], 0), 0x0100);
        assert_eq!(ones_complement_sum(&[0xff, 0xff, 0x00, 0x01], 0), 0x0001);
    }
}
