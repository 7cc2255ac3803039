//! Link-layer framing.
//!
//! Strips whatever the capture put in front of the IP header. Frames that
//! do not carry IPv4 or IPv6 decode to `None` and are ignored.

use etherparse::{EtherType, Ethernet2HeaderSlice, SingleVlanHeaderSlice};

use super::NetworkLayer;
use crate::error::ProtocolError;

/// Linux cooked capture v1 header length.
pub const LINUX_SLL_HEADER_LEN: usize = 16;

/// Linux cooked capture v2 header length.
pub const LINUX_SLL2_HEADER_LEN: usize = 20;

/// BSD loopback family header length.
pub const NULL_HEADER_LEN: usize = 4;

/// Framing of captured frames, named after the libpcap link types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback (`DLT_NULL`)
    Null,
    /// Ethernet II, optionally 802.1Q/802.1ad tagged
    Ethernet,
    /// Raw IP, no link header
    Raw,
    /// Linux cooked capture v1, used on the "any" pseudo-interface
    LinuxSll,
    /// Linux cooked capture v2
    LinuxSll2,
}

impl LinkType {
    /// Map a DLT / LINKTYPE value.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            0 => Some(LinkType::Null),
            1 => Some(LinkType::Ethernet),
            12 | 14 | 101 => Some(LinkType::Raw),
            113 => Some(LinkType::LinuxSll),
            276 => Some(LinkType::LinuxSll2),
            _ => None,
        }
    }

    /// The DLT value libpcap expects when compiling filters.
    pub fn dlt(&self) -> i32 {
        match self {
            LinkType::Null => 0,
            LinkType::Ethernet => 1,
            LinkType::Raw => 12,
            LinkType::LinuxSll => 113,
            LinkType::LinuxSll2 => 276,
        }
    }
}

/// Return the network-layer packet inside `frame`.
pub fn strip_link(link_type: LinkType, frame: &[u8]) -> Result<Option<NetworkLayer<'_>>, ProtocolError> {
    match link_type {
        LinkType::Ethernet => strip_ethernet(frame),
        LinkType::Raw => Ok(by_version(frame)),
        LinkType::LinuxSll => {
            need("linux_sll", LINUX_SLL_HEADER_LEN, frame)?;
            let proto = u16::from_be_bytes([frame[14], frame[15]]);
            Ok(by_ethertype(EtherType(proto), &frame[LINUX_SLL_HEADER_LEN..]))
        }
        LinkType::LinuxSll2 => {
            need("linux_sll2", LINUX_SLL2_HEADER_LEN, frame)?;
            let proto = u16::from_be_bytes([frame[0], frame[1]]);
            Ok(by_ethertype(EtherType(proto), &frame[LINUX_SLL2_HEADER_LEN..]))
        }
        LinkType::Null => {
            // The family word is in the capturing host's byte order.
            need("null", NULL_HEADER_LEN, frame)?;
            Ok(by_version(&frame[NULL_HEADER_LEN..]))
        }
    }
}

fn strip_ethernet(frame: &[u8]) -> Result<Option<NetworkLayer<'_>>, ProtocolError> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).map_err(|_| ProtocolError::PacketTooShort {
        protocol: "ethernet",
        needed: 14,
        have: frame.len(),
    })?;
    let mut ether_type = eth.ether_type();
    let mut rest = &frame[eth.slice().len()..];

    while matches!(
        ether_type,
        EtherType::VLAN_TAGGED_FRAME
            | EtherType::PROVIDER_BRIDGING
            | EtherType::VLAN_DOUBLE_TAGGED_FRAME
    ) {
        let vlan = SingleVlanHeaderSlice::from_slice(rest).map_err(|_| ProtocolError::PacketTooShort {
            protocol: "vlan",
            needed: 4,
            have: rest.len(),
        })?;
        ether_type = vlan.ether_type();
        rest = &rest[vlan.slice().len()..];
    }
    Ok(by_ethertype(ether_type, rest))
}

fn by_ethertype(ether_type: EtherType, payload: &[u8]) -> Option<NetworkLayer<'_>> {
    match ether_type {
        EtherType::IPV4 => Some(NetworkLayer::Ipv4(payload)),
        EtherType::IPV6 => Some(NetworkLayer::Ipv6(payload)),
        _ => None,
    }
}

fn by_version(packet: &[u8]) -> Option<NetworkLayer<'_>> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => Some(NetworkLayer::Ipv4(packet)),
        Some(6) => Some(NetworkLayer::Ipv6(packet)),
        _ => None,
    }
}

fn need(protocol: &'static str, needed: usize, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() < needed {
        return Err(ProtocolError::PacketTooShort {
            protocol,
            needed,
            have: data.len(),
        });
    }
    Ok(())
}
