//! Stream protocol parsers.

mod http;

pub use http::{
    parse_request_head, parse_response_head, ChunkedDecoder, Framing, HttpConfig,
    HttpParseError, HttpStreamParser, Side, MAX_HEAD_SIZE,
};
