//! Error types for wirespan-core.
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`PcapError`] - Errors from offline capture file replay
//! - [`ProtocolError`] - Errors from packet decoding and defragmentation
//!
//! Only the initialisation variants (`SourceOpen`, `FilterCompile`,
//! `BufferTooSmall`) are fatal. Everything raised while packets flow is
//! counted on [`crate::Stats`] and dropped.

use thiserror::Error;

/// Main error type for wirespan-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The capture handle could not be opened
    #[error("cannot open capture source {source_name}: {reason}")]
    SourceOpen { source_name: String, reason: String },

    /// The BPF filter text did not compile
    #[error("cannot compile filter `{filter}`: {reason}")]
    FilterCompile { filter: String, reason: String },

    /// The requested ring is smaller than a single block
    #[error("ring buffer of {target_mb} MiB cannot hold one {block_size}-byte block")]
    BufferTooSmall { target_mb: usize, block_size: usize },

    /// A read from an open capture handle failed
    #[error("capture on {source_name} failed: {reason}")]
    Capture { source_name: String, reason: String },

    /// Error reading or parsing a capture file
    #[error("PCAP error: {0}")]
    Pcap(#[from] PcapError),

    /// Error during packet decoding
    #[error("Protocol parse error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum PcapError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid PCAP format
    #[error("Invalid PCAP format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u32 },
}

/// Errors related to protocol decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet too short for protocol header
    #[error("{protocol}: packet too short (need {needed} bytes, have {have})")]
    PacketTooShort {
        protocol: &'static str,
        needed: usize,
        have: usize,
    },

    /// Invalid header field value
    #[error("{protocol}: invalid {field}: {reason}")]
    InvalidField {
        protocol: &'static str,
        field: &'static str,
        reason: String,
    },
}

impl Error {
    /// Whether this error must stop the agent at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SourceOpen { .. } | Error::FilterCompile { .. } | Error::BufferTooSmall { .. }
        )
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: initialisation errors are fatal, decode errors are not
    #[test]
    fn test_fatal_classification() {
        let open = Error::SourceOpen {
            source_name: "eth9".into(),
            reason: "No such device".into(),
        };
        assert!(open.is_fatal());

        let small = Error::BufferTooSmall {
            target_mb: 1,
            block_size: 8_388_608,
        };
        assert!(small.is_fatal());

        let decode = Error::Protocol(ProtocolError::PacketTooShort {
            protocol: "ipv4",
            needed: 20,
            have: 3,
        });
        assert!(!decode.is_fatal());
    }

    // Test 2: messages carry the offending input
    #[test]
    fn test_display() {
        let err = Error::FilterCompile {
            filter: "tcp[".into(),
            reason: "syntax error".into(),
        };
        assert_eq!(err.to_string(), "cannot compile filter `tcp[`: syntax error");
    }
}
