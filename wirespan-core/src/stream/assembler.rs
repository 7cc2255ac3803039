use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use super::connection::{guess_roles, FlowKey};
use super::fsm::TcpFsm;
use super::options::TcpOptionCheck;
use super::reassembly::HalfStream;
use super::{Chunk, Direction, FlowInfo};
use crate::io::CaptureInfo;
use crate::protocol::TcpSegment;
use crate::stats::Stats;

/// Acceptance and memory settings for the [`Assembler`].
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Deliver segments the state machine rejects.
    pub ignore_fsm_errors: bool,
    /// Deliver segments whose TCP options look inconsistent.
    pub no_opt_check: bool,
    /// Verify the TCP checksum.
    pub checksum: bool,
    /// Accept flows first seen mid-stream.
    pub allow_missing_init: bool,
    pub max_buffered_pages_per_conn: usize,
    pub max_buffered_pages_total: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ignore_fsm_errors: true,
            no_opt_check: true,
            checksum: false,
            allow_missing_init: true,
            max_buffered_pages_per_conn: 4000,
            max_buffered_pages_total: 150_000,
        }
    }
}

/// Consumer of one flow's reassembled bytes.
pub trait ReassembledStream {
    /// Hand over the next in-order chunk of `dir`. Returning the chunk
    /// means the consumer is full; it is kept and offered again later.
    fn deliver(&mut self, dir: Direction, chunk: Chunk) -> Result<(), Chunk>;

    /// The flow is closed. `backlog` holds the chunks per direction
    /// (indexed by [`Direction::index`]) that were never accepted.
    fn complete(self, backlog: [Vec<Chunk>; 2], closed_at_us: i64);
}

/// Creates a [`ReassembledStream`] for each new flow.
pub trait StreamFactory {
    type Stream: ReassembledStream;

    fn new_stream(&mut self, info: &FlowInfo) -> Self::Stream;
}

/// Idle thresholds for [`Assembler::flush_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Flows idle since before this time have their gaps skipped.
    pub flush_before: i64,
    /// Flows idle since before this time are closed.
    pub close_before: i64,
}

struct Flow<S> {
    info: FlowInfo,
    fsm: TcpFsm,
    options: TcpOptionCheck,
    /// Set once the first state machine rejection has been counted.
    fsm_err: bool,
    halves: [HalfStream; 2],
    stream: Option<S>,
    last_seen_us: i64,
}

impl<S> Flow<S> {
    fn pages(&self) -> usize {
        self.halves[0].pages() + self.halves[1].pages()
    }

    fn direction_of(&self, segment: &TcpSegment<'_>) -> Direction {
        if SocketAddr::new(segment.src, segment.src_port) == self.info.client {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }
}

/// TCP reassembler: vets segments, orders each direction and feeds the
/// stream the factory opened for the flow.
pub struct Assembler<F: StreamFactory> {
    config: AssemblerConfig,
    factory: F,
    flows: HashMap<FlowKey, Flow<F::Stream>>,
    stats: Arc<Stats>,
    total_pages: usize,
    next_stream_id: u64,
    /// Latest time seen; stamps flows closed by a flush.
    clock_us: i64,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(config: AssemblerConfig, factory: F, stats: Arc<Stats>) -> Self {
        Self {
            config,
            factory,
            flows: HashMap::new(),
            stats,
            total_pages: 0,
            next_stream_id: 0,
            clock_us: 0,
        }
    }

    /// Move the assembler's notion of now forward. Flows closed by a
    /// flush are stamped with this time.
    pub fn advance_clock(&mut self, now_us: i64) {
        self.clock_us = self.clock_us.max(now_us);
    }

    /// Number of flows currently tracked.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Pages buffered across all flows.
    pub fn buffered_pages(&self) -> usize {
        self.total_pages
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Feed one TCP segment.
    pub fn assemble(&mut self, segment: &TcpSegment<'_>, info: &CaptureInfo) {
        let ts = info.timestamp_us;
        self.clock_us = self.clock_us.max(ts);
        let key = FlowKey::of(segment);

        // A bare ACK cannot open a flow; the last ACK of a closed connection lands here.
        let flags = segment.flags;
        if segment.payload.is_empty()
            && !(flags.syn() || flags.fin() || flags.rst())
            && !self.flows.contains_key(&key)
        {
            return;
        }

        let stats = Arc::clone(&self.stats);
        let allow_missing_init = self.config.allow_missing_init;
        let next_id = &mut self.next_stream_id;
        let flow = self.flows.entry(key).or_insert_with(|| {
            let (client, server) = guess_roles(segment);
            *next_id += 1;
            Flow {
                info: FlowInfo::new(*next_id, client, server),
                fsm: TcpFsm::new(allow_missing_init),
                options: TcpOptionCheck::new(),
                fsm_err: false,
                halves: [HalfStream::new(), HalfStream::new()],
                stream: None,
                last_seen_us: ts,
            }
        });
        let dir = flow.direction_of(segment);

        if !flow.fsm.check(segment.flags, dir) {
            Stats::incr(&stats.rejected_fsm);
            if !flow.fsm_err {
                flow.fsm_err = true;
                Stats::incr(&stats.conn_rejected_fsm);
            }
            debug!(
                flow = %flow.info.ident,
                state = %flow.fsm.state(),
                flags = ?segment.flags,
                "segment rejected by state machine"
            );
            if !self.config.ignore_fsm_errors {
                return;
            }
        }

        if let Err(violation) = flow.options.accept(segment, dir) {
            Stats::incr(&stats.rejected_options);
            debug!(flow = %flow.info.ident, %violation, "segment options rejected");
            if !self.config.no_opt_check {
                return;
            }
        }

        if self.config.checksum && !segment.checksum_valid() {
            Stats::incr(&stats.rejected_checksum);
            debug!(flow = %flow.info.ident, "bad TCP checksum");
            return;
        }

        let unsynced = flow.halves[dir.index()].next_seq().is_none();
        if unsynced && !segment.flags.syn() && !allow_missing_init {
            return;
        }

        if flow.stream.is_none() {
            flow.stream = Some(self.factory.new_stream(&flow.info));
            Stats::incr(&stats.total_streams);
            Stats::incr(&stats.active_streams);
            debug!(flow = %flow.info.ident, "stream opened");
        }

        Stats::add(&stats.total_tcp_bytes, segment.payload.len() as u64);
        let before = flow.pages();
        flow.halves[dir.index()].accept(segment, ts, &stats);
        flow.last_seen_us = ts;

        deliver(flow, dir);
        self.total_pages = self.total_pages + flow.pages() - before;
        self.enforce_caps(&key);

        let Some(flow) = self.flows.get(&key) else {
            return;
        };
        let finished = flow.halves.iter().all(HalfStream::is_finished);
        if segment.flags.rst() || finished {
            self.close(&key, ts);
        }
        self.publish_pages();
    }

    /// Evict from the flow at `key` until it and the whole assembler are
    /// within their page caps.
    fn enforce_caps(&mut self, key: &FlowKey) {
        let per_conn = self.config.max_buffered_pages_per_conn;
        let total = self.config.max_buffered_pages_total;
        let Some(flow) = self.flows.get_mut(key) else {
            return;
        };
        while flow.pages() > per_conn || self.total_pages > total {
            let dir = if flow.halves[0].pages() >= flow.halves[1].pages() {
                Direction::ToServer
            } else {
                Direction::ToClient
            };
            let before = flow.pages();
            if !flow.halves[dir.index()].evict_oldest(&self.stats) {
                break;
            }
            deliver(flow, dir);
            self.total_pages = self.total_pages + flow.pages() - before;
            debug!(flow = %flow.info.ident, pages = flow.pages(), "buffer cap reached, evicted oldest bytes");
        }
    }

    fn close(&mut self, key: &FlowKey, closed_at_us: i64) {
        let Some(mut flow) = self.flows.remove(key) else {
            return;
        };
        let before = flow.pages();
        for half in flow.halves.iter_mut() {
            half.skip_all_gaps(&self.stats);
        }
        deliver(&mut flow, Direction::ToServer);
        deliver(&mut flow, Direction::ToClient);
        let backlog = [flow.halves[0].take_backlog(), flow.halves[1].take_backlog()];
        self.total_pages -= before;

        debug!(
            flow = %flow.info.ident,
            state = %flow.fsm.state(),
            to_server = ?flow.halves[0].stats(),
            to_client = ?flow.halves[1].stats(),
            "stream closed"
        );
        if let Some(stream) = flow.stream.take() {
            stream.complete(backlog, closed_at_us);
            Stats::decr(&self.stats.active_streams);
        }
    }

    /// Skip gaps in flows idle since `flush_before` and close those idle
    /// since `close_before`. Returns `(flushed, closed)`.
    pub fn flush_with_options(&mut self, options: FlushOptions) -> (usize, usize) {
        let mut flushed = 0;
        let mut to_close = Vec::new();

        for (key, flow) in self.flows.iter_mut() {
            let before = flow.pages();
            if flow.last_seen_us < options.flush_before
                && flow.halves.iter().any(HalfStream::has_pending)
            {
                for half in flow.halves.iter_mut() {
                    half.skip_all_gaps(&self.stats);
                }
                flushed += 1;
            }
            deliver(flow, Direction::ToServer);
            deliver(flow, Direction::ToClient);
            self.total_pages = self.total_pages + flow.pages() - before;

            let finished = flow.halves.iter().all(HalfStream::is_finished);
            if flow.last_seen_us < options.close_before || finished {
                to_close.push(*key);
            }
        }

        let closed_at = self.clock_us;
        for key in &to_close {
            self.close(key, closed_at);
        }
        self.publish_pages();
        (flushed, to_close.len())
    }

    /// Flush and close every flow idle since `cutoff_us`.
    pub fn flush_older_than(&mut self, cutoff_us: i64) -> (usize, usize) {
        self.flush_with_options(FlushOptions {
            flush_before: cutoff_us,
            close_before: cutoff_us,
        })
    }

    /// Close every flow. Used at shutdown.
    pub fn flush_all(&mut self) -> usize {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        let closed_at = self.clock_us;
        for key in &keys {
            self.close(key, closed_at);
        }
        self.publish_pages();
        keys.len()
    }

    fn publish_pages(&self) {
        self.stats
            .buffered_pages
            .store(self.total_pages as u64, Ordering::Relaxed);
    }
}

/// Offer the backlog of `dir` until it is empty or the stream is full.
fn deliver<S: ReassembledStream>(flow: &mut Flow<S>, dir: Direction) {
    let Some(stream) = flow.stream.as_mut() else {
        return;
    };
    let half = &mut flow.halves[dir.index()];
    while let Some(chunk) = half.pop_chunk() {
        if let Err(chunk) = stream.deliver(dir, chunk) {
            half.unpop_chunk(chunk);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TcpFlags;
    use std::cell::RefCell;
    use std::net::IpAddr;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        opened: Vec<FlowInfo>,
        data: [Vec<u8>; 2],
        chunks: [Vec<Chunk>; 2],
        completed: Vec<([usize; 2], i64)>,
    }

    struct Recorder {
        log: Rc<RefCell<Log>>,
        /// Refuse delivery once this many chunks have been taken.
        capacity: usize,
        taken: usize,
    }

    impl ReassembledStream for Recorder {
        fn deliver(&mut self, dir: Direction, chunk: Chunk) -> Result<(), Chunk> {
            if self.taken >= self.capacity {
                return Err(chunk);
            }
            self.taken += 1;
            let mut log = self.log.borrow_mut();
            log.data[dir.index()].extend_from_slice(&chunk.data);
            log.chunks[dir.index()].push(chunk);
            Ok(())
        }

        fn complete(self, backlog: [Vec<Chunk>; 2], closed_at_us: i64) {
            self.log
                .borrow_mut()
                .completed
                .push(([backlog[0].len(), backlog[1].len()], closed_at_us));
        }
    }

    struct RecorderFactory {
        log: Rc<RefCell<Log>>,
        capacity: usize,
    }

    impl StreamFactory for RecorderFactory {
        type Stream = Recorder;

        fn new_stream(&mut self, info: &FlowInfo) -> Recorder {
            self.log.borrow_mut().opened.push(info.clone());
            Recorder {
                log: Rc::clone(&self.log),
                capacity: self.capacity,
                taken: 0,
            }
        }
    }

    fn assembler(config: AssemblerConfig, capacity: usize) -> (Assembler<RecorderFactory>, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let factory = RecorderFactory {
            log: Rc::clone(&log),
            capacity,
        };
        (Assembler::new(config, factory, Arc::new(Stats::new())), log)
    }

    const CLIENT: [u8; 4] = [1, 2, 3, 4];
    const SERVER: [u8; 4] = [5, 6, 7, 8];

    fn to_server(seq: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src: IpAddr::from(CLIENT),
            dst: IpAddr::from(SERVER),
            src_port: 40000,
            dst_port: 80,
            seq,
            ack: 9000,
            flags,
            options: &[],
            payload,
            raw: &[],
        }
    }

    fn to_client(seq: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src: IpAddr::from(SERVER),
            dst: IpAddr::from(CLIENT),
            src_port: 80,
            dst_port: 40000,
            seq,
            ack: 1,
            flags,
            options: &[],
            payload,
            raw: &[],
        }
    }

    fn from_port(src_port: u16, seq: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src_port,
            ..to_server(seq, flags, payload)
        }
    }

    fn at(ts: i64) -> CaptureInfo {
        CaptureInfo {
            timestamp_us: ts,
            captured_len: 0,
            original_len: 0,
        }
    }

    // Test 1: full connection delivers both directions and closes on FINs
    #[test]
    fn test_full_connection() {
        let (mut asm, log) = assembler(AssemblerConfig::default(), usize::MAX);
        asm.assemble(&to_server(0, TcpFlags::SYN, b""), &at(1));
        asm.assemble(&to_client(8999, TcpFlags::SYN_ACK, b""), &at(2));
        asm.assemble(&to_server(1, TcpFlags::ACK, b""), &at(3));
        asm.assemble(&to_server(1, TcpFlags::PSH_ACK, b"GET / HTTP/1.1\r\n\r\n"), &at(4));
        asm.assemble(&to_client(9000, TcpFlags::PSH_ACK, b"HTTP/1.1 200 OK\r\n\r\n"), &at(5));
        asm.assemble(&to_server(19, TcpFlags::FIN_ACK, b""), &at(6));
        assert_eq!(asm.flow_count(), 1);
        asm.assemble(&to_client(9019, TcpFlags::FIN_ACK, b""), &at(7));
        assert_eq!(asm.flow_count(), 0);

        let log = log.borrow();
        assert_eq!(log.opened.len(), 1);
        assert_eq!(log.opened[0].ident, "1.2.3.4->5.6.7.8:40000->80:1");
        assert_eq!(log.data[0], b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(log.data[1], b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(log.chunks[0][0].ack, 9000);
        assert_eq!(log.completed, vec![([0, 0], 7)]);
        assert_eq!(Stats::get(&asm.stats.active_streams), 0);
        assert_eq!(Stats::get(&asm.stats.total_streams), 1);
    }

    // Test 2: strict mode drops mid-stream flows and latches the per-flow count
    #[test]
    fn test_fsm_relaxation_off() {
        let config = AssemblerConfig {
            ignore_fsm_errors: false,
            allow_missing_init: false,
            ..Default::default()
        };
        let (mut asm, log) = assembler(config, usize::MAX);
        asm.assemble(&to_server(100, TcpFlags::PSH_ACK, b"GET / HTTP/1.1\r\n"), &at(1));
        assert_eq!(Stats::get(&asm.stats.rejected_fsm), 1);
        assert_eq!(Stats::get(&asm.stats.conn_rejected_fsm), 1);

        asm.assemble(&to_server(116, TcpFlags::PSH_ACK, b"Host: x\r\n"), &at(2));
        assert_eq!(Stats::get(&asm.stats.rejected_fsm), 2);
        assert_eq!(Stats::get(&asm.stats.conn_rejected_fsm), 1);
        assert!(log.borrow().opened.is_empty());
    }

    // Test 3: missing handshake without FSM enforcement still needs allow_missing_init
    #[test]
    fn test_missing_init_dropped() {
        let config = AssemblerConfig {
            allow_missing_init: false,
            ..Default::default()
        };
        let (mut asm, log) = assembler(config, usize::MAX);
        asm.assemble(&to_server(100, TcpFlags::PSH_ACK, b"GET / HTTP/1.1\r\n"), &at(1));
        assert!(log.borrow().data[0].is_empty());
        assert_eq!(Stats::get(&asm.stats.total_tcp_bytes), 0);
    }

    // Test 4: duplicate segment adds no bytes
    #[test]
    fn test_duplicate_segment() {
        let (mut asm, log) = assembler(AssemblerConfig::default(), usize::MAX);
        asm.assemble(&to_server(10, TcpFlags::PSH_ACK, b"GET /a HTTP/1.1\r\n"), &at(1));
        asm.assemble(&to_server(10, TcpFlags::PSH_ACK, b"GET /a HTTP/1.1\r\n"), &at(2));
        assert_eq!(log.borrow().data[0], b"GET /a HTTP/1.1\r\n");
        assert_eq!(Stats::get(&asm.stats.overlap_bytes), 17);
    }

    // Test 5: bad checksum is rejected only when verification is on
    #[test]
    fn test_checksum_rejection() {
        let config = AssemblerConfig {
            checksum: true,
            ..Default::default()
        };
        let (mut asm, log) = assembler(config, usize::MAX);
        let raw = [0u8; 24];
        let mut seg = to_server(10, TcpFlags::PSH_ACK, b"GET");
        seg.raw = &raw;
        asm.assemble(&seg, &at(1));
        assert_eq!(Stats::get(&asm.stats.rejected_checksum), 1);
        assert!(log.borrow().data[0].is_empty());
    }

    // Test 6: full reader keeps chunks in the backlog until flush
    #[test]
    fn test_backpressure() {
        let (mut asm, log) = assembler(AssemblerConfig::default(), 1);
        asm.assemble(&to_server(0, TcpFlags::PSH_ACK, b"GET / HTTP/1.1\r\n"), &at(1));
        asm.assemble(&to_server(16, TcpFlags::PSH_ACK, b"Host: a\r\n"), &at(2));
        assert_eq!(log.borrow().chunks[0].len(), 1);
        assert_eq!(asm.buffered_pages(), 1);

        assert_eq!(asm.flush_all(), 1);
        assert_eq!(log.borrow().completed, vec![([1, 0], 2)]);
        assert_eq!(asm.buffered_pages(), 0);
    }

    // Test 7: per-connection cap evicts and records missed bytes
    #[test]
    fn test_per_connection_cap() {
        let config = AssemblerConfig {
            max_buffered_pages_per_conn: 2,
            ..Default::default()
        };
        let (mut asm, log) = assembler(config, usize::MAX);
        let block = [b'x'; 1900];
        asm.assemble(&to_server(0, TcpFlags::PSH_ACK, b"GET"), &at(1));
        for i in 0..3u32 {
            asm.assemble(&to_server(1000 + i * 1900, TcpFlags::ACK, &block), &at(2));
        }
        assert!(asm.buffered_pages() <= 2);
        assert_eq!(Stats::get(&asm.stats.missed_bytes), 997);
        let chunks = &log.borrow().chunks[0];
        assert_eq!(chunks[1].skipped, 997);
        assert_eq!(chunks[1].len(), 1900 * 3);
    }

    // Test 8: idle flows are closed by the flush timer
    #[test]
    fn test_flush_older_than_closes_idle() {
        let (mut asm, log) = assembler(AssemblerConfig::default(), usize::MAX);
        asm.assemble(&to_server(0, TcpFlags::PSH_ACK, b"GET"), &at(1_000));
        asm.assemble(&to_server(10, TcpFlags::PSH_ACK, b"late"), &at(2_000));

        let (flushed, closed) = asm.flush_with_options(FlushOptions {
            flush_before: 5_000,
            close_before: 0,
        });
        assert_eq!((flushed, closed), (1, 0));
        assert_eq!(log.borrow().data[0], b"GETlate");

        asm.advance_clock(10_000);
        assert_eq!(asm.flush_older_than(10_000), (0, 1));
        assert_eq!(log.borrow().completed, vec![([0, 0], 10_000)]);
        assert_eq!(asm.flow_count(), 0);
    }

    // Test 9: RST closes immediately
    #[test]
    fn test_rst_closes() {
        let (mut asm, log) = assembler(AssemblerConfig::default(), usize::MAX);
        asm.assemble(&to_server(0, TcpFlags::PSH_ACK, b"GET"), &at(1));
        asm.assemble(&to_client(9000, TcpFlags::RST, b""), &at(2));
        assert_eq!(asm.flow_count(), 0);
        assert_eq!(log.borrow().completed.len(), 1);
    }

    // Test 10: the trailing ACK after a FIN/FIN close opens nothing
    #[test]
    fn test_trailing_ack_after_close() {
        let (mut asm, log) = assembler(AssemblerConfig::default(), usize::MAX);
        asm.assemble(&to_server(0, TcpFlags::SYN, b""), &at(1));
        asm.assemble(&to_client(8999, TcpFlags::SYN_ACK, b""), &at(2));
        asm.assemble(&to_server(1, TcpFlags::ACK, b""), &at(3));
        asm.assemble(&to_server(1, TcpFlags::PSH_ACK, b"GET / HTTP/1.1\r\n\r\n"), &at(4));
        asm.assemble(&to_client(9000, TcpFlags::PSH_ACK, b"HTTP/1.1 200 OK\r\n\r\n"), &at(5));
        asm.assemble(&to_server(19, TcpFlags::FIN_ACK, b""), &at(6));
        asm.assemble(&to_client(9019, TcpFlags::FIN_ACK, b""), &at(7));
        assert_eq!(asm.flow_count(), 0);

        asm.assemble(&to_server(20, TcpFlags::ACK, b""), &at(8));
        assert_eq!(asm.flow_count(), 0);
        assert_eq!(log.borrow().opened.len(), 1);
        assert_eq!(Stats::get(&asm.stats.total_streams), 1);
        assert_eq!(Stats::get(&asm.stats.active_streams), 0);
    }

    // Test 11: a bare ACK on a tracked flow is still accepted
    #[test]
    fn test_bare_ack_on_open_flow() {
        let (mut asm, _log) = assembler(AssemblerConfig::default(), usize::MAX);
        asm.assemble(&to_server(0, TcpFlags::PSH_ACK, b"GET"), &at(1));
        asm.assemble(&to_client(9000, TcpFlags::ACK, b""), &at(2));
        assert_eq!(asm.flow_count(), 1);
        assert_eq!(Stats::get(&asm.stats.total_streams), 1);
    }

    // Test 12: the global cap evicts from the flow that crossed it
    #[test]
    fn test_total_cap() {
        let config = AssemblerConfig {
            max_buffered_pages_total: 3,
            ..Default::default()
        };
        let (mut asm, log) = assembler(config, usize::MAX);
        let block = [b'x'; 1900];

        asm.assemble(&from_port(40000, 0, TcpFlags::PSH_ACK, b"GET"), &at(1));
        asm.assemble(&from_port(40000, 1000, TcpFlags::ACK, &block), &at(2));
        asm.assemble(&from_port(40000, 2900, TcpFlags::ACK, &block), &at(3));
        assert_eq!(asm.buffered_pages(), 2);

        asm.assemble(&from_port(40001, 0, TcpFlags::PSH_ACK, b"GET"), &at(4));
        asm.assemble(&from_port(40001, 1000, TcpFlags::ACK, &block), &at(5));
        assert_eq!(asm.buffered_pages(), 3);
        assert_eq!(Stats::get(&asm.stats.missed_bytes), 0);

        asm.assemble(&from_port(40001, 2900, TcpFlags::ACK, &block), &at(6));
        assert!(asm.buffered_pages() <= 3);
        assert_eq!(asm.buffered_pages(), 2);
        assert_eq!(Stats::get(&asm.stats.missed_bytes), 997);

        let log = log.borrow();
        assert_eq!(log.opened.len(), 2);
        assert_eq!(log.opened[1].client.port(), 40001);
        let last = log.chunks[0].last().unwrap();
        assert_eq!(last.skipped, 997);
        assert_eq!(last.len(), 1900 * 2);
    }
}
