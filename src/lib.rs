//! wirespan - passive HTTP observability from captured packets.
//!
//! This crate wires the `wirespan-core` pipeline into a process: it reads
//! configuration from flags and the environment, runs the capture loop on a
//! blocking thread and writes one event per reconstructed HTTP exchange.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use wirespan::driver::{Driver, DriverConfig};
//! use wirespan_core::io::FileSource;
//! use wirespan_core::stream::{Assembler, AssemblerConfig, HttpConfig, HttpStreamFactory};
//! use wirespan_core::{EventQueue, Stats};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stats = Arc::new(Stats::new());
//!     let queue = Arc::new(EventQueue::new(1000, Arc::clone(&stats)));
//!     let factory = HttpStreamFactory::new(
//!         tokio::runtime::Handle::current(),
//!         Arc::clone(&queue),
//!         Arc::clone(&stats),
//!         Arc::new(HttpConfig::default()),
//!         1000,
//!     );
//!     let assembler = Assembler::new(AssemblerConfig::default(), factory, Arc::clone(&stats));
//!     let source = FileSource::open("capture.pcap")?;
//!     let driver = Driver::new(source, true, assembler, DriverConfig::default(), stats, queue);
//!     let summary = tokio::task::spawn_blocking(move || driver.run(CancellationToken::new())).await??;
//!     println!("{} packets", summary.packets);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod driver;
pub mod error;
pub mod handlers;

pub use error::{Error, Result};

/// Agent version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
