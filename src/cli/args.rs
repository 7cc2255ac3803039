//! Command-line and environment configuration.
//!
//! Every setting is a flag with an environment fallback, so a container
//! can be configured purely through its environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use wirespan_core::io::{SourceConfig, SourceKind};
use wirespan_core::stream::{AssemblerConfig, HttpConfig};

use crate::driver::DriverConfig;
use crate::error::{Error, Result};
use crate::handlers::{AgentInfo, RecordOptions};

/// Passively reconstruct HTTP request/response exchanges from network traffic.
#[derive(Parser, Debug, Clone)]
#[command(name = "wirespan")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture interface, or "any"
    #[arg(short = 'i', long, env = "INTERFACE", default_value = "any")]
    pub interface: String,

    /// Per-packet snapshot length
    #[arg(long, env = "SNAPLEN", default_value_t = 262_144)]
    pub snaplen: u32,

    /// Put the interface in promiscuous mode
    #[arg(long, env = "PROMISCUOUS", default_value = "true", value_name = "BOOL",
          value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub promiscuous: bool,

    /// Capture backend: pcap or afpacket
    #[arg(long = "packet-source", env = "PACKET_SOURCE", default_value = "pcap")]
    pub packet_source: SourceKind,

    /// Total ring size in MiB for the afpacket backend
    #[arg(long = "buffer-size-mb", env = "BUFFER_SIZE_MB", default_value_t = 64)]
    pub buffer_size_mb: usize,

    /// Skip decoding the IPv6 extension header chain
    #[arg(long, env = "LAZY", default_value = "false", value_name = "BOOL",
          value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub lazy: bool,

    /// Do not reassemble IPv4 fragments
    #[arg(long, env = "NODEFRAG", default_value = "false", value_name = "BOOL",
          value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub nodefrag: bool,

    /// Reject segments with a bad TCP checksum
    #[arg(long, env = "CHECKSUM", default_value = "false", value_name = "BOOL",
          value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub checksum: bool,

    /// Accept segments whose TCP options look inconsistent
    #[arg(long = "no-opt-check", env = "NO_OPT_CHECK", default_value = "true", value_name = "BOOL",
          value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub no_opt_check: bool,

    /// Accept segments the TCP state machine rejects
    #[arg(long = "ignore-fsm-err", env = "IGNORE_FSM_ERR", default_value = "true", value_name = "BOOL",
          value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub ignore_fsm_err: bool,

    /// Track connections first seen after their handshake
    #[arg(long = "allow-missing-init", env = "ALLOW_MISSING_INIT", default_value = "true",
          value_name = "BOOL", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub allow_missing_init: bool,

    /// Idle time after which a flow's gaps are skipped (e.g. 10s, 500ms)
    #[arg(long = "stream-flush-timeout", env = "STREAM_FLUSH_TIMEOUT", default_value = "10s",
          value_parser = parse_duration)]
    pub stream_flush_timeout: Duration,

    /// Idle time after which a flow is closed
    #[arg(long = "stream-close-timeout", env = "STREAM_CLOSE_TIMEOUT", default_value = "90s",
          value_parser = parse_duration)]
    pub stream_close_timeout: Duration,

    /// Capacity of each stream reader and of the event queue
    #[arg(long = "channel-buffer-size", env = "CHANNEL_BUFFER_SIZE", default_value_t = 1000)]
    pub channel_buffer_size: usize,

    /// Buffered page cap for a single connection
    #[arg(long = "max-buffered-pages-per-conn", env = "MAX_BUFFERED_PAGES_PER_CONN", default_value_t = 4000)]
    pub max_buffered_pages_per_conn: usize,

    /// Buffered page cap across all connections
    #[arg(long = "max-buffered-pages-total", env = "MAX_BUFFERED_PAGES_TOTAL", default_value_t = 150_000)]
    pub max_buffered_pages_total: usize,

    /// BPF filter; defaults to HTTP method and status-line prefixes
    #[arg(long, env = "FILTER")]
    pub filter: Option<String>,

    /// Replay a PCAP/PCAPNG file instead of capturing live
    #[arg(short = 'r', long = "read-file", env = "READ_FILE", value_name = "FILE")]
    pub read_file: Option<PathBuf>,

    /// Stop after this many packets (0 = unlimited)
    #[arg(short = 'c', long = "max-count", env = "MAX_COUNT", default_value_t = 0)]
    pub max_count: u64,

    /// Headers kept on emitted events, comma separated
    #[arg(long = "http-headers", env = "HTTP_HEADERS", value_delimiter = ',', default_value = "User-Agent")]
    pub http_headers: Vec<String>,

    /// Report the request target as url.path
    #[arg(long = "include-request-url", env = "INCLUDE_REQUEST_URL", default_value = "true",
          value_name = "BOOL", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub include_request_url: bool,

    /// Extra attributes added to every event, as k=v,k2=v2
    #[arg(long = "additional-attributes", env = "ADDITIONAL_ATTRIBUTES", default_value = "")]
    pub additional_attributes: Attributes,

    #[arg(long = "agent-node-ip", env = "AGENT_NODE_IP")]
    pub agent_node_ip: Option<String>,

    #[arg(long = "agent-node-name", env = "AGENT_NODE_NAME")]
    pub agent_node_name: Option<String>,

    #[arg(long = "agent-pod-ip", env = "AGENT_POD_IP")]
    pub agent_pod_ip: Option<String>,

    #[arg(long = "agent-pod-name", env = "AGENT_POD_NAME")]
    pub agent_pod_name: Option<String>,

    #[arg(long = "agent-service-account", env = "AGENT_SERVICE_ACCOUNT")]
    pub agent_service_account: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.channel_buffer_size == 0 {
            return Err(Error::Config("CHANNEL_BUFFER_SIZE must be at least 1".to_string()));
        }
        if self.max_buffered_pages_per_conn > self.max_buffered_pages_total {
            return Err(Error::Config(format!(
                "MAX_BUFFERED_PAGES_PER_CONN ({}) exceeds MAX_BUFFERED_PAGES_TOTAL ({})",
                self.max_buffered_pages_per_conn, self.max_buffered_pages_total
            )));
        }
        if self.stream_close_timeout < self.stream_flush_timeout {
            return Err(Error::Config(format!(
                "STREAM_CLOSE_TIMEOUT ({:?}) is shorter than STREAM_FLUSH_TIMEOUT ({:?})",
                self.stream_close_timeout, self.stream_flush_timeout
            )));
        }
        Ok(())
    }

    /// Filter directive for the subscriber when RUST_LOG is unset.
    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => self.log_level.to_ascii_lowercase(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            interface: self.interface.clone(),
            snaplen: self.snaplen,
            promiscuous: self.promiscuous,
            filter: self.filter.clone(),
            kind: self.packet_source,
            buffer_size_mb: self.buffer_size_mb,
            read_file: self.read_file.clone(),
            ..SourceConfig::default()
        }
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            ignore_fsm_errors: self.ignore_fsm_err,
            no_opt_check: self.no_opt_check,
            checksum: self.checksum,
            allow_missing_init: self.allow_missing_init,
            max_buffered_pages_per_conn: self.max_buffered_pages_per_conn,
            max_buffered_pages_total: self.max_buffered_pages_total,
        }
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig::new(&self.http_headers)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            nodefrag: self.nodefrag,
            lazy: self.lazy,
            flush_timeout: self.stream_flush_timeout,
            close_timeout: self.stream_close_timeout,
            max_count: self.max_count,
            ..DriverConfig::default()
        }
    }

    pub fn record_options(&self) -> RecordOptions {
        RecordOptions {
            include_request_url: self.include_request_url,
            agent: AgentInfo {
                node_ip: self.agent_node_ip.clone(),
                node_name: self.agent_node_name.clone(),
                pod_ip: self.agent_pod_ip.clone(),
                pod_name: self.agent_pod_name.clone(),
                service_account: self.agent_service_account.clone(),
            },
            additional_attributes: self.additional_attributes.0.clone(),
        }
    }
}

/// `k=v` pairs from a comma separated list. Entries without exactly one
/// `=` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(pub Vec<(String, String)>);

impl FromStr for Attributes {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let pairs = s
            .split(',')
            .filter_map(|entry| {
                let mut parts = entry.split('=');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(k), Some(v), None) if !k.trim().is_empty() => {
                        Some((k.trim().to_string(), v.trim().to_string()))
                    }
                    _ => None,
                }
            })
            .collect();
        Ok(Attributes(pairs))
    }
}

/// Parse `90s`, `500ms`, `5m`, `24h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration `{s}`"))?;
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit `{other}` in `{s}`")),
    }
}
