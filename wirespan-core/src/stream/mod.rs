//! TCP stream processing and HTTP parsing.
//!
//! The [`Assembler`] tracks every TCP flow, runs the state machine and
//! option checks, and reorders segments into contiguous chunks per
//! direction. Chunks go to a stream opened by a [`StreamFactory`]; the
//! production factory, [`HttpStreamFactory`], feeds each direction to its
//! own [`HttpStreamParser`] task and pairs the results with a [`Matcher`].
//!
//! ## Components
//!
//! - [`Assembler`] - flow table, checks, buffer caps and flushing
//! - [`HalfStream`] - sequencing of one direction
//! - [`StreamReader`] - buffered byte reader fed by the assembler
//! - [`HttpStreamParser`] - HTTP/1.x message extraction
//! - [`Matcher`] - request/response correlation by sequence number
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wirespan_core::queue::EventQueue;
//! use wirespan_core::stats::Stats;
//! use wirespan_core::stream::{Assembler, AssemblerConfig, HttpConfig, HttpStreamFactory};
//!
//! # async fn run() {
//! let stats = Arc::new(Stats::new());
//! let queue = Arc::new(EventQueue::new(1000, Arc::clone(&stats)));
//! let factory = HttpStreamFactory::new(
//!     tokio::runtime::Handle::current(),
//!     Arc::clone(&queue),
//!     Arc::clone(&stats),
//!     Arc::new(HttpConfig::default()),
//!     64,
//! );
//! let mut assembler = Assembler::new(AssemblerConfig::default(), factory, stats);
//! // assembler.assemble(&segment, &info) for every TCP segment...
//! assembler.flush_all();
//! # }
//! ```

mod assembler;
mod connection;
mod context;
mod factory;
mod fsm;
pub mod matcher;
mod options;
pub mod parsers;
pub mod reader;
mod reassembly;

pub use assembler::{Assembler, AssemblerConfig, FlushOptions, ReassembledStream, StreamFactory};
pub use connection::{guess_roles, looks_like_request, looks_like_response, FlowKey};
pub use context::{Chunk, ChunkMeta, Direction, FlowInfo};
pub use factory::{HttpStream, HttpStreamFactory};
pub use fsm::{TcpFsm, TcpState};
pub use matcher::{MatchOutcome, Matcher, PendingExchange};
pub use options::{OptionViolation, TcpOptionCheck};
pub use parsers::{HttpConfig, HttpParseError, HttpStreamParser, Side};
pub use reader::{reader_channel, Fill, ReaderSender, StreamReader};
pub use reassembly::{pages_for, HalfStats, HalfStream, PAGE_SIZE};
