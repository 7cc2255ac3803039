//! # wirespan-core
//!
//! Passive HTTP/1.x observation from captured TCP traffic.
//!
//! Frames come from a [`PacketSource`](io::PacketSource), are stripped to
//! the network layer, defragmented, and fed as TCP segments to the
//! [`Assembler`](stream::Assembler). Reassembled bytes are parsed into
//! requests and responses, paired by sequence number, and pushed onto an
//! [`EventQueue`] as [`HttpExchange`](events::HttpExchange)s.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        wirespan-core                                |
//! +---------------------------------------------------------------------+
//! |  io/        - PacketSource: libpcap live, AF_PACKET ring, file      |
//! |  protocol/  - link stripping, IPv4/IPv6, TCP segment view           |
//! |  defrag     - IPv4 fragment reassembly                              |
//! |  stream/    - TCP reassembly, stream readers, HTTP parser, matcher  |
//! |  events     - parsed messages and exchanges                         |
//! |  queue      - bounded drop-oldest exchange queue                    |
//! |  stats      - process-wide counters                                 |
//! |  error      - error types                                           |
//! +---------------------------------------------------------------------+
//! ```

pub mod defrag;
pub mod error;
pub mod events;
pub mod io;
pub mod protocol;
pub mod queue;
pub mod stats;
pub mod stream;

pub use defrag::Ipv4Defragmenter;
pub use error::{Error, PcapError, ProtocolError, Result};
pub use events::{HttpExchange, HttpRequest, HttpResponse};
pub use io::{CaptureSource, PacketSource, SourceConfig, SourceKind};
pub use queue::EventQueue;
pub use stats::{Stats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
