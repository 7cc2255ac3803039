//! IPv6 header access with extension header skipping.

use std::net::Ipv6Addr;

use etherparse::Ipv6HeaderSlice;

use crate::error::ProtocolError;

/// IPv6 Next Header values walked before the transport header.
pub mod next_header {
    pub const HOP_BY_HOP: u8 = 0;
    pub const TCP: u8 = 6;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const DESTINATION: u8 = 60;
}

/// Decoded view of an IPv6 packet.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Packet<'a> {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// Final next-header value after the extension chain.
    pub protocol: u8,
    pub payload: &'a [u8],
    /// A fragment header was present. IPv6 fragments are not reassembled.
    pub fragmented: bool,
}

impl<'a> Ipv6Packet<'a> {
    /// Parse `data`. With `lazy`, the extension chain is not walked and
    /// the first next-header value is taken as the transport protocol.
    pub fn parse(data: &'a [u8], lazy: bool) -> Result<Self, ProtocolError> {
        let ip = Ipv6HeaderSlice::from_slice(data).map_err(|e| ProtocolError::InvalidField {
            protocol: "ipv6",
            field: "header",
            reason: e.to_string(),
        })?;
        let header_len = ip.slice().len();
        let end = (header_len + ip.payload_length() as usize).min(data.len());
        let mut payload = &data[header_len..end];
        let mut protocol = ip.next_header().0;
        let mut fragmented = false;

        if !lazy {
            loop {
                match protocol {
                    next_header::HOP_BY_HOP | next_header::ROUTING | next_header::DESTINATION => {
                        let len = ext_len(payload)?;
                        protocol = payload[0];
                        payload = &payload[len..];
                    }
                    next_header::FRAGMENT => {
                        if payload.len() < 8 {
                            return Err(truncated(8, payload.len()));
                        }
                        fragmented = true;
                        protocol = payload[0];
                        payload = &payload[8..];
                    }
                    _ => break,
                }
            }
        }

        Ok(Self {
            src: ip.source_addr(),
            dst: ip.destination_addr(),
            protocol,
            payload,
            fragmented,
        })
    }
}

/// Length of a generic extension header in bytes.
fn ext_len(data: &[u8]) -> Result<usize, ProtocolError> {
    if data.len() < 2 {
        return Err(truncated(2, data.len()));
    }
    // Length is in units of 8 octets, not including the first 8 octets
    let len = (data[1] as usize + 1) * 8;
    if data.len() < len {
        return Err(truncated(len, data.len()));
    }
    Ok(len)
}

fn truncated(needed: usize, have: usize) -> ProtocolError {
    ProtocolError::PacketTooShort {
        protocol: "ipv6",
        needed,
        have,
    }
}
