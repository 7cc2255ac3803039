//! HTTP/1.x stream parser using httparse.
//!
//! One parser runs per direction of a flow: the client side reads
//! requests, the server side reads responses. Each message head is parsed
//! from the reader's buffer, its body is skipped according to its framing
//! (Content-Length, chunked, or until the connection closes), and the
//! result is handed to the flow's [`Matcher`].
//!
//! Correlation: a request is keyed by the ACK of the segment carrying its
//! first byte, a response by the sequence number of its first byte. On a
//! well-behaved connection those are the same number.

use std::sync::Arc;

use compact_str::CompactString;
use httparse::{Request, Response, Status, EMPTY_HEADER};
use thiserror::Error;
use tracing::debug;

use crate::events::{Headers, HttpRequest, HttpResponse, UNKNOWN_BODY_SIZE};
use crate::queue::EventQueue;
use crate::stats::Stats;
use crate::stream::connection::{looks_like_request, looks_like_response};
use crate::stream::matcher::{MatchOutcome, Matcher};
use crate::stream::reader::{Fill, StreamReader};
use crate::stream::{Direction, FlowInfo};

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

/// Largest header block accepted before the message is declared malformed.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 4096;

/// Bytes kept at the end of the buffer while resynchronising, enough
/// for a newline and the longest message prefix.
const RESYNC_TAIL: usize = 9;

/// Why a message could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("malformed message head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("message head larger than 65536 bytes")]
    HeadTooLarge,

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("invalid chunk framing")]
    InvalidChunk,
}

/// Parser settings shared by every flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Header names kept on parsed messages, matched case-insensitively.
    pub headers: Vec<CompactString>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            headers: vec![CompactString::new("User-Agent")],
        }
    }
}

impl HttpConfig {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            headers: headers
                .into_iter()
                .map(|h| CompactString::new(h.as_ref().trim()))
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Keep the allow-listed headers, named as configured. The first
    /// occurrence of a repeated header wins.
    fn filter(&self, raw: &[httparse::Header<'_>]) -> Headers {
        let mut kept = Headers::new();
        for name in &self.headers {
            if let Some(header) = raw.iter().find(|h| h.name.eq_ignore_ascii_case(name)) {
                let value = String::from_utf8_lossy(header.value);
                kept.push((name.clone(), CompactString::new(value.trim())));
            }
        }
        kept
    }
}

/// Which messages a parser reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Client to server: requests.
    Client,
    /// Server to client: responses.
    Server,
}

impl From<Direction> for Side {
    fn from(dir: Direction) -> Self {
        match dir {
            Direction::ToServer => Side::Client,
            Direction::ToClient => Side::Server,
        }
    }
}

/// Incremental chunked transfer-coding decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
    Done,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consume as much of `buf` as possible. Returns the bytes consumed;
    /// check [`is_done`](Self::is_done) for the end of the body.
    pub fn advance(&mut self, buf: &[u8]) -> Result<usize, HttpParseError> {
        let mut pos = 0;
        loop {
            let rest = &buf[pos..];
            match self.state {
                ChunkState::Done => return Ok(pos),
                ChunkState::Size => {
                    let Some(line) = line_end(rest)? else {
                        return Ok(pos);
                    };
                    let size = parse_chunk_size(&rest[..line])?;
                    pos += line + 2;
                    self.state = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if rest.is_empty() {
                        return Ok(pos);
                    }
                    let take = remaining.min(rest.len() as u64);
                    pos += take as usize;
                    self.state = match remaining - take {
                        0 => ChunkState::DataCrlf,
                        left => ChunkState::Data(left),
                    };
                }
                ChunkState::DataCrlf => {
                    if rest.len() < 2 {
                        return Ok(pos);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(HttpParseError::InvalidChunk);
                    }
                    pos += 2;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(line) = line_end(rest)? else {
                        return Ok(pos);
                    };
                    pos += line + 2;
                    if line == 0 {
                        self.state = ChunkState::Done;
                    }
                }
            }
        }
    }
}

/// Offset of the next CRLF, or `None` when more bytes are needed.
fn line_end(buf: &[u8]) -> Result<Option<usize>, HttpParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) if end <= MAX_CHUNK_LINE => Ok(Some(end)),
        Some(_) => Err(HttpParseError::InvalidChunk),
        None if buf.len() > MAX_CHUNK_LINE => Err(HttpParseError::InvalidChunk),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpParseError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpParseError::InvalidChunk)?;
    // Handle chunk extensions (anything after semicolon)
    let size = line.split(';').next().unwrap_or(line).trim();
    u64::from_str_radix(size, 16).map_err(|_| HttpParseError::InvalidChunk)
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    None,
    Length(u64),
    Chunked(ChunkedDecoder),
    UntilEof,
}

/// Body-related headers of a message.
fn body_headers(headers: &[httparse::Header<'_>]) -> Result<(bool, Option<u64>), HttpParseError> {
    let mut chunked = false;
    let mut length = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        } else if header.name.eq_ignore_ascii_case("content-length") && length.is_none() {
            let value = String::from_utf8_lossy(header.value);
            let parsed = value
                .trim()
                .parse::<u64>()
                .map_err(|_| HttpParseError::InvalidContentLength(value.to_string()))?;
            length = Some(parsed);
        }
    }
    Ok((chunked, length))
}

fn head_incomplete(buf: &[u8]) -> Result<(), HttpParseError> {
    if buf.len() > MAX_HEAD_SIZE {
        Err(HttpParseError::HeadTooLarge)
    } else {
        Ok(())
    }
}

/// Parse a request head at the start of `buf`. `Ok(None)` means the head
/// is not complete yet.
pub fn parse_request_head(
    buf: &[u8],
    config: &HttpConfig,
) -> Result<Option<(usize, HttpRequest, Framing)>, HttpParseError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut req = Request::new(&mut headers);
    let head_len = match req.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return head_incomplete(buf).map(|_| None),
    };

    let (chunked, length) = body_headers(req.headers)?;
    let (framing, content_length) = match (chunked, length) {
        (true, _) => (Framing::Chunked(ChunkedDecoder::new()), UNKNOWN_BODY_SIZE),
        (false, Some(0)) | (false, None) => (Framing::None, 0),
        (false, Some(n)) => (Framing::Length(n), n as i64),
    };

    let request = HttpRequest {
        method: CompactString::new(req.method.unwrap_or_default()),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        content_length,
        headers: config.filter(req.headers),
    };
    Ok(Some((head_len, request, framing)))
}

/// Parse a response head at the start of `buf`.
pub fn parse_response_head(
    buf: &[u8],
    config: &HttpConfig,
) -> Result<Option<(usize, HttpResponse, Framing)>, HttpParseError> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut resp = Response::new(&mut headers);
    let head_len = match resp.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return head_incomplete(buf).map(|_| None),
    };

    let status = resp.code.unwrap_or_default();
    let (chunked, length) = body_headers(resp.headers)?;
    let bodiless = (100..200).contains(&status) || status == 204 || status == 304;
    let (framing, content_length) = match (bodiless, chunked, length) {
        (true, _, _) => (Framing::None, 0),
        (false, true, _) => (Framing::Chunked(ChunkedDecoder::new()), UNKNOWN_BODY_SIZE),
        (false, false, Some(0)) => (Framing::None, 0),
        (false, false, Some(n)) => (Framing::Length(n), n as i64),
        (false, false, None) => (Framing::UntilEof, UNKNOWN_BODY_SIZE),
    };

    let response = HttpResponse {
        status,
        reason: CompactString::new(resp.reason.unwrap_or_default()),
        version: resp.version.unwrap_or(1),
        content_length,
        headers: config.filter(resp.headers),
    };
    Ok(Some((head_len, response, framing)))
}

/// Offset of the next line in `buf` that starts like a message of `side`.
fn resync_offset(buf: &[u8], side: Side) -> Option<usize> {
    buf.iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i + 1)
        .find(|&start| {
            let line = &buf[start..];
            match side {
                Side::Client => looks_like_request(line),
                Side::Server => looks_like_response(line),
            }
        })
}

#[derive(Debug)]
enum Message {
    Request(HttpRequest),
    Response(HttpResponse),
}

/// Result of looking for a head at the front of the buffer.
#[derive(Debug)]
enum Head {
    Message(InFlight),
    /// More bytes are needed.
    Partial,
    /// An interim 1xx response was consumed.
    Interim,
}

/// A message whose head has been parsed and whose body is being skipped.
#[derive(Debug)]
struct InFlight {
    id: u32,
    timestamp_us: i64,
    message: Message,
    framing: Framing,
}

/// Parses one direction of a flow and feeds the flow's matcher.
pub struct HttpStreamParser {
    side: Side,
    config: Arc<HttpConfig>,
    flow: Arc<FlowInfo>,
    matcher: Arc<Matcher>,
    queue: Arc<EventQueue>,
    stats: Arc<Stats>,
}

impl HttpStreamParser {
    pub fn new(
        side: Side,
        config: Arc<HttpConfig>,
        flow: Arc<FlowInfo>,
        matcher: Arc<Matcher>,
        queue: Arc<EventQueue>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            side,
            config,
            flow,
            matcher,
            queue,
            stats,
        }
    }

    /// Parse messages until the reader reaches end of stream.
    pub async fn run(self, mut reader: StreamReader) {
        let mut current: Option<InFlight> = None;
        let mut resyncing = false;
        // Id of a 1xx response awaiting its final response.
        let mut informational: Option<u32> = None;

        loop {
            let need_more = if let Some(msg) = current.as_mut() {
                match skip_body(&mut msg.framing, &mut reader) {
                    Ok(false) => true,
                    Ok(true) => {
                        if let Some(msg) = current.take() {
                            self.finish(msg, &mut reader);
                        }
                        false
                    }
                    Err(err) => {
                        self.parse_error(&err, msg.id);
                        current = None;
                        resyncing = true;
                        false
                    }
                }
            } else if resyncing {
                match resync_offset(reader.buffer(), self.side) {
                    Some(offset) => {
                        reader.consume(offset);
                        resyncing = false;
                        false
                    }
                    None => {
                        let len = reader.buffer().len();
                        reader.consume(len.saturating_sub(RESYNC_TAIL));
                        true
                    }
                }
            } else if reader.buffer().is_empty() {
                true
            } else {
                match self.parse_head(&mut reader, &mut informational) {
                    Ok(Head::Message(msg)) if msg.framing == Framing::None => {
                        self.finish(msg, &mut reader);
                        false
                    }
                    Ok(Head::Message(msg)) => {
                        current = Some(msg);
                        false
                    }
                    Ok(Head::Interim) => false,
                    Ok(Head::Partial) => true,
                    Err(err) => {
                        let id = reader.head().map(|h| h.seq).unwrap_or_default();
                        self.parse_error(&err, id);
                        resyncing = true;
                        false
                    }
                }
            };

            if !need_more {
                continue;
            }
            match reader.fill().await {
                Fill::Data => {}
                Fill::Gap => {
                    if let Some(msg) = current.take() {
                        debug!(
                            flow = %self.flow.ident,
                            id = msg.id,
                            "message abandoned at capture gap"
                        );
                    }
                    resyncing = false;
                }
                Fill::Eof => break,
            }
        }

        // The head was intact; a truncated or close-delimited body still
        // yields the message.
        if let Some(msg) = current.take() {
            self.finish(msg, &mut reader);
        }
        reader.close();
    }

    /// Parse the head at the front of the reader's buffer.
    fn parse_head(
        &self,
        reader: &mut StreamReader,
        informational: &mut Option<u32>,
    ) -> Result<Head, HttpParseError> {
        let Some(head) = reader.head() else {
            return Ok(Head::Partial);
        };
        match self.side {
            Side::Client => {
                let Some((len, request, framing)) = parse_request_head(reader.buffer(), &self.config)? else {
                    return Ok(Head::Partial);
                };
                reader.consume(len);
                Ok(Head::Message(InFlight {
                    id: head.ack,
                    timestamp_us: head.timestamp_us,
                    message: Message::Request(request),
                    framing,
                }))
            }
            Side::Server => {
                let Some((len, response, mut framing)) = parse_response_head(reader.buffer(), &self.config)? else {
                    return Ok(Head::Partial);
                };
                reader.consume(len);
                if (100..200).contains(&response.status) && response.status != 101 {
                    informational.get_or_insert(head.seq);
                    return Ok(Head::Interim);
                }
                let id = informational.take().unwrap_or(head.seq);
                if self.matcher.answers_head(id) {
                    framing = Framing::None;
                }
                Ok(Head::Message(InFlight {
                    id,
                    timestamp_us: head.timestamp_us,
                    message: Message::Response(response),
                    framing,
                }))
            }
        }
    }

    fn parse_error(&self, err: &HttpParseError, id: u32) {
        Stats::incr(&self.stats.http_parse_errors);
        debug!(
            flow = %self.flow.ident,
            side = ?self.side,
            id,
            error = %err,
            "error parsing HTTP message"
        );
    }

    /// Hand a parsed message to the matcher and emit whatever it releases.
    fn finish(&self, msg: InFlight, reader: &mut StreamReader) {
        let packets = reader.take_packet_count();
        let outcome = match msg.message {
            Message::Request(request) => {
                Stats::incr(&self.stats.requests_parsed);
                self.matcher
                    .get_or_store_request(msg.id, msg.timestamp_us, request, packets)
            }
            Message::Response(response) => {
                Stats::incr(&self.stats.responses_parsed);
                self.matcher
                    .get_or_store_response(msg.id, msg.timestamp_us, response, packets)
            }
        };
        let released = match outcome {
            MatchOutcome::Pending => return,
            MatchOutcome::Matched(pending) => pending,
            MatchOutcome::Displaced(newer) => {
                debug!(flow = %self.flow.ident, id = msg.id, "correlator reused, emitting newer half on its own");
                newer
            }
        };
        Stats::incr(&self.stats.exchanges_completed);
        self.queue.push(released.into_exchange(&self.flow, msg.id, None));
    }
}

/// Skip body bytes in the reader's buffer. Returns true once the body is
/// complete.
fn skip_body(framing: &mut Framing, reader: &mut StreamReader) -> Result<bool, HttpParseError> {
    match framing {
        Framing::None => Ok(true),
        Framing::Length(remaining) => {
            let take = (*remaining).min(reader.buffer().len() as u64);
            reader.consume(take as usize);
            *remaining -= take;
            Ok(*remaining == 0)
        }
        Framing::Chunked(decoder) => {
            let used = decoder.advance(reader.buffer())?;
            reader.consume(used);
            Ok(decoder.is_done())
        }
        Framing::UntilEof => {
            let len = reader.buffer().len();
            reader.consume(len);
            Ok(false)
        }
    }
}
