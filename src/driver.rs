//! The capture loop.
//!
//! One blocking thread pulls frames from the packet source, decodes them
//! down to TCP, runs IPv4 defragmentation and feeds the assembler. Flush
//! and stats cadences are checked between packets against the driver's
//! clock: wall time for live capture, the latest packet timestamp for a
//! replayed file.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wirespan_core::io::{CaptureInfo, NextPacket, PacketSource};
use wirespan_core::protocol::{strip_link, tcp_from_ipv4, tcp_from_ipv6, LinkType, NetworkLayer};
use wirespan_core::stream::{Assembler, FlushOptions, StreamFactory};
use wirespan_core::{EventQueue, Ipv4Defragmenter, Result, Stats};

/// Interval between idle-flow flushes.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between stats reports.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Incomplete IPv4 datagrams older than this are dropped.
pub const DEFRAG_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Bypass IPv4 defragmentation.
    pub nodefrag: bool,
    /// Skip the IPv6 extension header chain.
    pub lazy: bool,
    pub flush_timeout: Duration,
    pub close_timeout: Duration,
    /// Packet budget; 0 means unlimited.
    pub max_count: u64,
    pub flush_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            nodefrag: false,
            lazy: false,
            flush_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(90),
            max_count: 0,
            flush_interval: FLUSH_INTERVAL,
            stats_interval: STATS_INTERVAL,
        }
    }
}

/// Why the capture loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    EndOfFile,
    MaxCount,
    /// Reading from the source failed after startup.
    SourceFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSummary {
    pub packets: u64,
    /// Flows still open at shutdown and closed by the final flush.
    pub flows_closed: usize,
    pub reason: StopReason,
}

/// Everything downstream of the source. Kept apart from the source so a
/// borrowed frame can be processed while the source stays borrowed.
struct Pipeline<F: StreamFactory> {
    assembler: Assembler<F>,
    defrag: Ipv4Defragmenter,
    config: DriverConfig,
    stats: Arc<Stats>,
}

impl<F: StreamFactory> Pipeline<F> {
    fn handle_frame(&mut self, link: LinkType, info: &CaptureInfo, frame: &[u8]) {
        Stats::incr(&self.stats.packets_processed);

        let network = match strip_link(link, frame) {
            Ok(Some(network)) => network,
            Ok(None) => return,
            Err(e) => {
                Stats::incr(&self.stats.decode_errors);
                debug!(error = %e, "undecodable frame");
                return;
            }
        };

        match network {
            NetworkLayer::Ipv4(packet) => {
                let datagram = if self.config.nodefrag {
                    Cow::Borrowed(packet)
                } else {
                    match self.defrag.process(packet, info.timestamp_us) {
                        Ok(Some(datagram)) => datagram,
                        Ok(None) => return,
                        Err(e) => {
                            Stats::incr(&self.stats.defrag_errors);
                            debug!(error = %e, "bad IPv4 fragment");
                            return;
                        }
                    }
                };
                if matches!(datagram, Cow::Owned(_)) {
                    Stats::incr(&self.stats.ip_defrag);
                }
                match tcp_from_ipv4(&datagram) {
                    Ok(Some(segment)) => self.assembler.assemble(&segment, info),
                    Ok(None) => {}
                    Err(e) => {
                        Stats::incr(&self.stats.decode_errors);
                        debug!(error = %e, "undecodable IPv4 packet");
                    }
                }
            }
            NetworkLayer::Ipv6(packet) => match tcp_from_ipv6(packet, self.config.lazy) {
                Ok(Some(segment)) => self.assembler.assemble(&segment, info),
                Ok(None) => {}
                Err(e) => {
                    Stats::incr(&self.stats.decode_errors);
                    debug!(error = %e, "undecodable IPv6 packet");
                }
            },
        }
    }

    fn flush(&mut self, now_us: i64) {
        self.assembler.advance_clock(now_us);
        let (flushed, closed) = self.assembler.flush_with_options(FlushOptions {
            flush_before: now_us - micros(self.config.flush_timeout),
            close_before: now_us - micros(self.config.close_timeout),
        });
        let expired = self.defrag.discard_older_than(now_us - micros(DEFRAG_WINDOW));
        Stats::add(&self.stats.defrag_expired, expired as u64);
        debug!(flushed, closed, expired, flows = self.assembler.flow_count(), "flushed idle flows");
    }
}

/// Owns the source and the pipeline on the capture thread.
pub struct Driver<S: PacketSource, F: StreamFactory> {
    source: S,
    offline: bool,
    pipeline: Pipeline<F>,
    queue: Arc<EventQueue>,
}

impl<S: PacketSource, F: StreamFactory> Driver<S, F> {
    /// `offline` selects packet time instead of wall time as the clock.
    pub fn new(
        source: S,
        offline: bool,
        assembler: Assembler<F>,
        config: DriverConfig,
        stats: Arc<Stats>,
        queue: Arc<EventQueue>,
    ) -> Self {
        Self {
            source,
            offline,
            pipeline: Pipeline {
                assembler,
                defrag: Ipv4Defragmenter::new(),
                config,
                stats,
            },
            queue,
        }
    }

    /// Run until cancelled, the source ends, the packet budget is spent or
    /// the source fails. Every open flow is closed before returning.
    pub fn run(mut self, cancel: CancellationToken) -> Result<DriverSummary> {
        let link = self.source.link_type();
        let flush_every = micros(self.pipeline.config.flush_interval);
        let stats_every = micros(self.pipeline.config.stats_interval);
        let max_count = self.pipeline.config.max_count;

        let mut packets: u64 = 0;
        let mut clock_us: Option<i64> = (!self.offline).then(wall_clock_us);
        let mut next_flush = clock_us.map(|now| now + flush_every);
        let mut next_stats = clock_us.map(|now| now + stats_every);

        info!(link = ?link, offline = self.offline, max_count, "capture loop started");

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if max_count > 0 && packets >= max_count {
                break StopReason::MaxCount;
            }

            match self.source.next_packet() {
                Ok(NextPacket::Packet(packet)) => {
                    packets += 1;
                    if self.offline {
                        clock_us = Some(clock_us.map_or(packet.info.timestamp_us, |c| c.max(packet.info.timestamp_us)));
                    }
                    self.pipeline.handle_frame(link, &packet.info, packet.data);
                }
                Ok(NextPacket::Timeout) => {}
                Ok(NextPacket::Eof) => break StopReason::EndOfFile,
                Err(e) => {
                    warn!(error = %e, "packet source failed");
                    break StopReason::SourceFailed(e.to_string());
                }
            }

            if !self.offline {
                clock_us = Some(wall_clock_us());
            }
            let Some(now) = clock_us else { continue };

            if *next_flush.get_or_insert(now + flush_every) <= now {
                self.pipeline.flush(now);
                next_flush = Some(now + flush_every);
            }
            if *next_stats.get_or_insert(now + stats_every) <= now {
                self.report_stats();
                next_stats = Some(now + stats_every);
            }
        };

        if let Some(now) = clock_us {
            self.pipeline.assembler.advance_clock(now);
        }
        let flows_closed = self.pipeline.assembler.flush_all();
        self.report_stats();
        self.source.close();

        info!(packets, flows_closed, reason = ?reason, "capture loop stopped");
        Ok(DriverSummary {
            packets,
            flows_closed,
            reason,
        })
    }

    fn report_stats(&mut self) {
        match self.source.stats() {
            Ok(counters) => self.pipeline.stats.set_capture(counters),
            Err(e) => debug!(error = %e, "capture counters unavailable"),
        }
        let snapshot = self.pipeline.stats.snapshot(self.queue.len());
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(target: "wirespan::stats", stats = %json, "pipeline stats"),
            Err(e) => warn!(error = %e, "cannot encode stats"),
        }
    }
}

fn micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

fn wall_clock_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
