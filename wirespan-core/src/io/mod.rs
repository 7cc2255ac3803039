//! Packet ingestion.
//!
//! Every backend satisfies the same capability set: hand out the next
//! frame with its capture info, report capture counters, close. The
//! driver is generic over [`PacketSource`]; [`CaptureSource`] is the
//! enum-dispatched union the binary opens from configuration, so the hot
//! loop never goes through a vtable.
//!
//! ## Available Sources
//!
//! - [`LiveSource`] - libpcap live capture on a named interface (or "any")
//! - `RingSource` - Linux `AF_PACKET` TPACKET_V3 memory-mapped ring
//! - [`FileSource`] - offline replay of a PCAP/PCAPNG file (optionally gzipped)

mod file;
pub mod filter;
mod live;
mod ring;

use std::path::PathBuf;
use std::time::Duration;

pub use file::FileSource;
pub use filter::{compile_filter, http_filter_expression, FilterInstruction};
pub use live::LiveSource;
#[cfg(target_os = "linux")]
pub use ring::RingSource;
pub use ring::{compute_ring_size, RingSize, FRAMES_PER_BLOCK};

use crate::error::Result;
use crate::protocol::LinkType;

/// Capture metadata that travels with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureInfo {
    /// Timestamp in microseconds since Unix epoch
    pub timestamp_us: i64,
    /// Captured length (may be less than original)
    pub captured_len: u32,
    /// Original packet length on the wire
    pub original_len: u32,
}

/// A frame borrowed from the source's buffer.
///
/// Valid until the next call to [`PacketSource::next_packet`].
#[derive(Debug, Clone, Copy)]
pub struct PacketRef<'a> {
    pub info: CaptureInfo,
    pub data: &'a [u8],
}

/// Outcome of one poll of a source.
#[derive(Debug)]
pub enum NextPacket<'a> {
    Packet(PacketRef<'a>),
    /// The read timeout expired with nothing captured.
    Timeout,
    /// The source is exhausted (offline replay only).
    Eof,
}

/// Running totals reported by the capture backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureCounters {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub interface_drops: u64,
}

/// A source of link-layer frames.
pub trait PacketSource: Send {
    /// Read the next frame, waiting at most the configured read timeout.
    fn next_packet(&mut self) -> Result<NextPacket<'_>>;

    /// Link-layer framing of the frames this source yields.
    fn link_type(&self) -> LinkType;

    /// Cumulative capture counters.
    fn stats(&mut self) -> Result<CaptureCounters>;

    /// Release the capture handle. Idempotent.
    fn close(&mut self);
}

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    #[default]
    Pcap,
    AfPacket,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pcap => "pcap",
            SourceKind::AfPacket => "afpacket",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcap" => Ok(SourceKind::Pcap),
            "afpacket" | "af_packet" => Ok(SourceKind::AfPacket),
            other => Err(format!("unknown packet source `{other}` (expected pcap or afpacket)")),
        }
    }
}

/// Configuration for opening a capture source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub interface: String,
    pub snaplen: u32,
    pub promiscuous: bool,
    /// BPF filter text; `None` uses [`http_filter_expression`].
    pub filter: Option<String>,
    pub kind: SourceKind,
    /// Total ring size for the `AF_PACKET` backend.
    pub buffer_size_mb: usize,
    pub read_timeout: Duration,
    /// Replay this file instead of capturing live.
    pub read_file: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interface: "any".to_string(),
            snaplen: 262_144,
            promiscuous: true,
            filter: None,
            kind: SourceKind::Pcap,
            buffer_size_mb: 64,
            read_timeout: Duration::from_secs(1),
            read_file: None,
        }
    }
}

impl SourceConfig {
    /// The filter text that will be compiled for this source.
    pub fn filter_text(&self) -> String {
        self.filter
            .clone()
            .unwrap_or_else(http_filter_expression)
    }
}

/// The backends, dispatched by variant.
pub enum CaptureSource {
    Live(LiveSource),
    #[cfg(target_os = "linux")]
    Ring(RingSource),
    File(FileSource),
}

impl CaptureSource {
    /// Open the backend selected by `config`.
    ///
    /// Failing to open the interface, compile the filter, or size the ring
    /// is fatal for the caller.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        if let Some(path) = &config.read_file {
            return Ok(CaptureSource::File(FileSource::open(path)?));
        }

        match config.kind {
            SourceKind::Pcap => Ok(CaptureSource::Live(LiveSource::open(config)?)),
            #[cfg(target_os = "linux")]
            SourceKind::AfPacket => Ok(CaptureSource::Ring(RingSource::open(config)?)),
            #[cfg(not(target_os = "linux"))]
            SourceKind::AfPacket => Err(crate::error::Error::SourceOpen {
                source_name: config.interface.clone(),
                reason: "the afpacket source is only available on Linux".to_string(),
            }),
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, CaptureSource::File(_))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            CaptureSource::Live(_) => "pcap",
            #[cfg(target_os = "linux")]
            CaptureSource::Ring(_) => "afpacket",
            CaptureSource::File(_) => "file",
        }
    }
}

impl PacketSource for CaptureSource {
    #[inline]
    fn next_packet(&mut self) -> Result<NextPacket<'_>> {
        match self {
            CaptureSource::Live(s) => s.next_packet(),
            #[cfg(target_os = "linux")]
            CaptureSource::Ring(s) => s.next_packet(),
            CaptureSource::File(s) => s.next_packet(),
        }
    }

    fn link_type(&self) -> LinkType {
        match self {
            CaptureSource::Live(s) => s.link_type(),
            #[cfg(target_os = "linux")]
            CaptureSource::Ring(s) => s.link_type(),
            CaptureSource::File(s) => s.link_type(),
        }
    }

    fn stats(&mut self) -> Result<CaptureCounters> {
        match self {
            CaptureSource::Live(s) => s.stats(),
            #[cfg(target_os = "linux")]
            CaptureSource::Ring(s) => s.stats(),
            CaptureSource::File(s) => s.stats(),
        }
    }

    fn close(&mut self) {
        match self {
            CaptureSource::Live(s) => s.close(),
            #[cfg(target_os = "linux")]
            CaptureSource::Ring(s) => s.close(),
            CaptureSource::File(s) => s.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: source kind parsing
    #[test]
    fn test_source_kind_from_str() {
        assert_eq!("pcap".parse::<SourceKind>().unwrap(), SourceKind::Pcap);
        assert_eq!("AFPACKET".parse::<SourceKind>().unwrap(), SourceKind::AfPacket);
        assert!("netmap".parse::<SourceKind>().is_err());
    }

    // Test 2: default filter is the HTTP prefix filter
    #[test]
    fn test_filter_text_default() {
        let config = SourceConfig::default();
        assert_eq!(config.filter_text(), http_filter_expression());

        let custom = SourceConfig {
            filter: Some("tcp port 8080".into()),
            ..Default::default()
        };
        assert_eq!(custom.filter_text(), "tcp port 8080");
    }
}
