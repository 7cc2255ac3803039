//! Pipeline counters.
//!
//! One [`Stats`] instance lives for the whole process. The driver thread
//! and the per-flow tasks bump counters with relaxed atomics; the stats
//! timer takes a [`StatsSnapshot`] and logs it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::io::CaptureCounters;

/// Process-wide counters.
#[derive(Debug)]
pub struct Stats {
    started: Instant,

    pub packets_processed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub total_tcp_bytes: AtomicU64,

    pub ip_defrag: AtomicU64,
    pub defrag_errors: AtomicU64,
    pub defrag_expired: AtomicU64,

    pub rejected_fsm: AtomicU64,
    pub conn_rejected_fsm: AtomicU64,
    pub rejected_options: AtomicU64,
    pub rejected_checksum: AtomicU64,

    pub missed_bytes: AtomicU64,
    pub overlap_bytes: AtomicU64,
    pub overlap_packets: AtomicU64,
    pub out_of_order_bytes: AtomicU64,
    pub out_of_order_packets: AtomicU64,
    pub buffered_pages: AtomicU64,

    pub total_streams: AtomicU64,
    pub active_streams: AtomicU64,

    pub http_parse_errors: AtomicU64,
    pub requests_parsed: AtomicU64,
    pub responses_parsed: AtomicU64,
    pub exchanges_completed: AtomicU64,
    pub events_dropped: AtomicU64,

    pub source_received: AtomicU64,
    pub source_dropped: AtomicU64,
    pub source_if_dropped: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            packets_processed: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            total_tcp_bytes: AtomicU64::new(0),
            ip_defrag: AtomicU64::new(0),
            defrag_errors: AtomicU64::new(0),
            defrag_expired: AtomicU64::new(0),
            rejected_fsm: AtomicU64::new(0),
            conn_rejected_fsm: AtomicU64::new(0),
            rejected_options: AtomicU64::new(0),
            rejected_checksum: AtomicU64::new(0),
            missed_bytes: AtomicU64::new(0),
            overlap_bytes: AtomicU64::new(0),
            overlap_packets: AtomicU64::new(0),
            out_of_order_bytes: AtomicU64::new(0),
            out_of_order_packets: AtomicU64::new(0),
            buffered_pages: AtomicU64::new(0),
            total_streams: AtomicU64::new(0),
            active_streams: AtomicU64::new(0),
            http_parse_errors: AtomicU64::new(0),
            requests_parsed: AtomicU64::new(0),
            responses_parsed: AtomicU64::new(0),
            exchanges_completed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            source_received: AtomicU64::new(0),
            source_dropped: AtomicU64::new(0),
            source_if_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn decr(counter: &AtomicU64) {
        // Saturating: a stray close must not wrap the gauge.
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Record the cumulative capture counters reported by the source.
    ///
    /// Sources report running totals, so these are stored, not added.
    pub fn set_capture(&self, counters: CaptureCounters) {
        self.source_received
            .store(counters.packets_received, Ordering::Relaxed);
        self.source_dropped
            .store(counters.packets_dropped, Ordering::Relaxed);
        self.source_if_dropped
            .store(counters.interface_drops, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy for reporting.
    pub fn snapshot(&self, event_queue_length: usize) -> StatsSnapshot {
        StatsSnapshot {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            packets_processed: Self::get(&self.packets_processed),
            decode_errors: Self::get(&self.decode_errors),
            ip_defrag: Self::get(&self.ip_defrag),
            defrag_errors: Self::get(&self.defrag_errors),
            defrag_expired: Self::get(&self.defrag_expired),
            rejected_fsm: Self::get(&self.rejected_fsm),
            rejected_options: Self::get(&self.rejected_options),
            rejected_checksum: Self::get(&self.rejected_checksum),
            total_tcp_bytes: Self::get(&self.total_tcp_bytes),
            conn_rejected_fsm: Self::get(&self.conn_rejected_fsm),
            missed_bytes: Self::get(&self.missed_bytes),
            overlap_bytes: Self::get(&self.overlap_bytes),
            overlap_packets: Self::get(&self.overlap_packets),
            out_of_order_bytes: Self::get(&self.out_of_order_bytes),
            out_of_order_packets: Self::get(&self.out_of_order_packets),
            buffered_pages: Self::get(&self.buffered_pages),
            source_received: Self::get(&self.source_received),
            source_dropped: Self::get(&self.source_dropped),
            source_if_dropped: Self::get(&self.source_if_dropped),
            event_queue_length,
            total_streams: Self::get(&self.total_streams),
            active_streams: Self::get(&self.active_streams),
            http_parse_errors: Self::get(&self.http_parse_errors),
            requests_parsed: Self::get(&self.requests_parsed),
            responses_parsed: Self::get(&self.responses_parsed),
            exchanges_completed: Self::get(&self.exchanges_completed),
            events_dropped: Self::get(&self.events_dropped),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Stats`], serialised with the field names the
/// stats log line has always used.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime_ms: u64,
    pub packets_processed: u64,
    pub decode_errors: u64,
    #[serde(rename = "IPdefrag")]
    pub ip_defrag: u64,
    pub defrag_errors: u64,
    pub defrag_expired: u64,
    #[serde(rename = "rejected_FSM")]
    pub rejected_fsm: u64,
    #[serde(rename = "rejected_Options")]
    pub rejected_options: u64,
    pub rejected_checksum: u64,
    #[serde(rename = "total_TCP_bytes")]
    pub total_tcp_bytes: u64,
    #[serde(rename = "conn_rejected_FSM")]
    pub conn_rejected_fsm: u64,
    pub missed_bytes: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
    pub out_of_order_bytes: u64,
    pub out_of_order_packets: u64,
    pub buffered_pages: u64,
    pub source_received: u64,
    pub source_dropped: u64,
    pub source_if_dropped: u64,
    pub event_queue_length: usize,
    pub total_streams: u64,
    pub active_streams: u64,
    pub http_parse_errors: u64,
    pub requests_parsed: u64,
    pub responses_parsed: u64,
    pub exchanges_completed: u64,
    pub events_dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: counters feed the snapshot
    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = Stats::new();
        Stats::incr(&stats.rejected_fsm);
        Stats::incr(&stats.rejected_fsm);
        Stats::add(&stats.total_tcp_bytes, 1500);

        let snap = stats.snapshot(7);
        assert_eq!(snap.rejected_fsm, 2);
        assert_eq!(snap.total_tcp_bytes, 1500);
        assert_eq!(snap.event_queue_length, 7);
    }

    // Test 2: gauges never wrap below zero
    #[test]
    fn test_decr_saturates() {
        let stats = Stats::new();
        Stats::decr(&stats.active_streams);
        assert_eq!(Stats::get(&stats.active_streams), 0);
    }

    // Test 3: capture counters are stored as totals
    #[test]
    fn test_set_capture_overwrites() {
        let stats = Stats::new();
        stats.set_capture(CaptureCounters {
            packets_received: 10,
            packets_dropped: 1,
            interface_drops: 0,
        });
        stats.set_capture(CaptureCounters {
            packets_received: 25,
            packets_dropped: 2,
            interface_drops: 1,
        });
        let snap = stats.snapshot(0);
        assert_eq!(snap.source_received, 25);
        assert_eq!(snap.source_dropped, 2);
        assert_eq!(snap.source_if_dropped, 1);
    }

    // Test 4: serialised names match the stats log schema
    #[test]
    fn test_serialized_field_names() {
        let stats = Stats::new();
        Stats::incr(&stats.ip_defrag);
        let json = serde_json::to_value(stats.snapshot(0)).unwrap();
        assert_eq!(json["IPdefrag"], 1);
        assert!(json.get("rejected_FSM").is_some());
        assert!(json.get("conn_rejected_FSM").is_some());
        assert!(json.get("total_TCP_bytes").is_some());
    }
}
