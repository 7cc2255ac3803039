//! Packet decoding from the link layer down to TCP.
//!
//! ## Supported Framing
//!
//! | Layer | Protocols |
//! |-------|-----------|
//! | Link | Ethernet (802.1Q/802.1ad tags), Linux cooked v1/v2, raw IP, BSD loopback |
//! | Network | IPv4, IPv6 (extension headers skipped, fragments dropped) |
//! | Transport | TCP |
//!
//! IPv4 fragments are reassembled by [`crate::defrag`] between
//! [`strip_link`] and [`tcp_from_ipv4`].

mod ipv4;
mod ipv6;
mod link;
mod tcp;

pub use ipv4::{header_checksum, ones_complement_sum, Ipv4Packet, IP_PROTO_TCP};
pub use ipv6::Ipv6Packet;
pub use link::{strip_link, LinkType};
pub use tcp::{flags, TcpFlags, TcpSegment};

use crate::error::ProtocolError;

/// Network-layer packet located inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkLayer<'a> {
    Ipv4(&'a [u8]),
    Ipv6(&'a [u8]),
}

/// Decode the TCP segment of an unfragmented IPv4 packet.
///
/// Returns `Ok(None)` for other protocols and for non-initial fragments.
pub fn tcp_from_ipv4(packet: &[u8]) -> Result<Option<TcpSegment<'_>>, ProtocolError> {
    let ip = Ipv4Packet::parse(packet)?;
    if ip.protocol != IP_PROTO_TCP || ip.fragment_offset != 0 {
        return Ok(None);
    }
    TcpSegment::parse(ip.src.into(), ip.dst.into(), ip.payload).map(Some)
}

/// Decode the TCP segment of an IPv6 packet.
pub fn tcp_from_ipv6(packet: &[u8], lazy: bool) -> Result<Option<TcpSegment<'_>>, ProtocolError> {
    let ip = Ipv6Packet::parse(packet, lazy)?;
    if ip.protocol != IP_PROTO_TCP || ip.fragmented {
        return Ok(None);
    }
    TcpSegment::parse(ip.src.into(), ip.dst.into(), ip.payload).map(Some)
}
