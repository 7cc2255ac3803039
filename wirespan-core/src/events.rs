//! Parsed HTTP messages and the exchanges built from them.

use std::net::SocketAddr;

use compact_str::CompactString;
use serde::Serialize;
use smallvec::SmallVec;

use crate::stream::FlowInfo;

/// Allow-listed headers kept on a message, in wire order.
pub type Headers = SmallVec<[(CompactString, CompactString); 2]>;

/// Body size recorded when the length is not known up front.
pub const UNKNOWN_BODY_SIZE: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpRequest {
    pub method: CompactString,
    /// Request target as sent (`/path?query`).
    pub target: String,
    pub version: u8,
    /// Declared body size; `-1` when chunked, `0` without a body.
    pub content_length: i64,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: CompactString,
    pub version: u8,
    /// Declared body size; `-1` when chunked or close-delimited.
    pub content_length: i64,
    pub headers: Headers,
}

impl HttpRequest {
    /// Value of an allow-listed header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A request paired with its response, or one of them alone when the
/// other never showed up before the flow closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpExchange {
    /// Flow identity, `"<client_ip>-><server_ip>:<client_port>-><server_port>:<id>"`.
    pub stream_ident: String,
    pub client: SocketAddr,
    pub server: SocketAddr,
    /// Correlator: the request's ACK, equal to the response's first sequence number.
    pub seqack: u32,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub request_timestamp_us: Option<i64>,
    pub response_timestamp_us: Option<i64>,
    pub request_packets: u32,
    pub response_packets: u32,
    /// When the flow closed, for exchanges emitted by the close.
    pub closed_at_us: Option<i64>,
}

impl HttpExchange {
    pub fn new(flow: &FlowInfo, seqack: u32) -> Self {
        Self {
            stream_ident: flow.ident.clone(),
            client: flow.client,
            server: flow.server,
            seqack,
            request: None,
            response: None,
            request_timestamp_us: None,
            response_timestamp_us: None,
            request_packets: 0,
            response_packets: 0,
            closed_at_us: None,
        }
    }

    /// `"<stream_ident>:<seqack>"`
    pub fn display_id(&self) -> String {
        format!("{}:{}", self.stream_ident, self.seqack)
    }

    /// Time the exchange is reported at: the request's, else the
    /// response's, else the close time.
    pub fn timestamp_us(&self) -> Option<i64> {
        self.request_timestamp_us
            .or(self.response_timestamp_us)
            .or(self.closed_at_us)
    }

    /// Response time minus request time, when both are known.
    pub fn duration_us(&self) -> Option<i64> {
        Some(self.response_timestamp_us? - self.request_timestamp_us?)
    }

    pub fn is_complete(&self) -> bool {
        self.request.is_some() && self.response.is_some()
    }
}
