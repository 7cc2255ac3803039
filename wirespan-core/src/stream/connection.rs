use std::net::{IpAddr, SocketAddr};

use crate::protocol::TcpSegment;

/// Normalized connection key (lower IP/port first for consistent lookup).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct FlowKey {
    ip_a: IpAddr,
    port_a: u16,
    ip_b: IpAddr,
    port_b: u16,
}

impl FlowKey {
    /// Create a normalized connection key.
    /// Ensures (ip_a, port_a) <= (ip_b, port_b) lexicographically.
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        if (src_ip, src_port) <= (dst_ip, dst_port) {
            Self {
                ip_a: src_ip,
                port_a: src_port,
                ip_b: dst_ip,
                port_b: dst_port,
            }
        } else {
            Self {
                ip_a: dst_ip,
                port_a: dst_port,
                ip_b: src_ip,
                port_b: src_port,
            }
        }
    }

    pub fn of(segment: &TcpSegment<'_>) -> Self {
        Self::new(segment.src, segment.src_port, segment.dst, segment.dst_port)
    }

    pub fn endpoint_a(&self) -> SocketAddr {
        SocketAddr::new(self.ip_a, self.port_a)
    }

    pub fn endpoint_b(&self) -> SocketAddr {
        SocketAddr::new(self.ip_b, self.port_b)
    }
}

/// Request-line prefixes that identify the client side of a flow.
const REQUEST_PREFIXES: [&[u8]; 9] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"TRACE ", b"CONNECT ",
];

/// Whether `payload` starts like an HTTP/1 request.
pub fn looks_like_request(payload: &[u8]) -> bool {
    REQUEST_PREFIXES.iter().any(|p| payload.starts_with(p))
}

/// Whether `payload` starts like an HTTP/1 response.
pub fn looks_like_response(payload: &[u8]) -> bool {
    payload.starts_with(b"HTTP/")
}

/// Decide which endpoint of the first segment seen is the client.
///
/// Returns `(client, server)`.
pub fn guess_roles(segment: &TcpSegment<'_>) -> (SocketAddr, SocketAddr) {
    let src = SocketAddr::new(segment.src, segment.src_port);
    let dst = SocketAddr::new(segment.dst, segment.dst_port);

    let src_is_client = if segment.flags.syn() {
        // SYN comes from the client, SYN-ACK goes to it.
        !segment.flags.ack()
    } else if looks_like_request(segment.payload) {
        true
    } else if looks_like_response(segment.payload) {
        false
    } else {
        segment.src_port > segment.dst_port
    };

    if src_is_client {
        (src, dst)
    } else {
        (dst, src)
    }
}
