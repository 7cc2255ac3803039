//! Runs an HTTP parser pair for each reassembled flow.
//!
//! Every flow gets two reader queues, two parser tasks and a shared
//! matcher. When the assembler closes the flow, a finaliser task pushes
//! the leftover chunks, ends both readers, waits for the parsers and
//! emits whatever the matcher still holds as single-sided exchanges.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::assembler::{ReassembledStream, StreamFactory};
use super::matcher::Matcher;
use super::parsers::{HttpConfig, HttpStreamParser, Side};
use super::reader::{reader_channel, ReaderSender};
use super::{Chunk, Direction, FlowInfo};
use crate::queue::EventQueue;
use crate::stats::Stats;

/// Opens an [`HttpStream`] per flow on a tokio runtime.
pub struct HttpStreamFactory {
    handle: Handle,
    queue: Arc<EventQueue>,
    stats: Arc<Stats>,
    config: Arc<HttpConfig>,
    channel_capacity: usize,
    tracker: TaskTracker,
}

impl HttpStreamFactory {
    pub fn new(
        handle: Handle,
        queue: Arc<EventQueue>,
        stats: Arc<Stats>,
        config: Arc<HttpConfig>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            handle,
            queue,
            stats,
            config,
            channel_capacity,
            tracker: TaskTracker::new(),
        }
    }

    /// Tracker of every parser and finaliser task spawned so far.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }
}

impl StreamFactory for HttpStreamFactory {
    type Stream = HttpStream;

    fn new_stream(&mut self, info: &FlowInfo) -> HttpStream {
        let flow = Arc::new(info.clone());
        let matcher = Arc::new(Matcher::new());

        let spawn_parser = |dir: Direction| {
            let (sender, reader) = reader_channel(self.channel_capacity);
            let parser = HttpStreamParser::new(
                Side::from(dir),
                Arc::clone(&self.config),
                Arc::clone(&flow),
                Arc::clone(&matcher),
                Arc::clone(&self.queue),
                Arc::clone(&self.stats),
            );
            let task = self.tracker.spawn_on(parser.run(reader), &self.handle);
            (sender, task)
        };
        let (to_server, server_task) = spawn_parser(Direction::ToServer);
        let (to_client, client_task) = spawn_parser(Direction::ToClient);

        HttpStream {
            flow,
            senders: [to_server, to_client],
            parsers: [server_task, client_task],
            matcher,
            queue: Arc::clone(&self.queue),
            stats: Arc::clone(&self.stats),
            handle: self.handle.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

/// The assembler's handle on one flow's parser tasks.
pub struct HttpStream {
    flow: Arc<FlowInfo>,
    senders: [ReaderSender; 2],
    parsers: [JoinHandle<()>; 2],
    matcher: Arc<Matcher>,
    queue: Arc<EventQueue>,
    stats: Arc<Stats>,
    handle: Handle,
    tracker: TaskTracker,
}

impl ReassembledStream for HttpStream {
    fn deliver(&mut self, dir: Direction, chunk: Chunk) -> Result<(), Chunk> {
        self.senders[dir.index()].deliver(chunk)
    }

    fn complete(self, backlog: [Vec<Chunk>; 2], closed_at_us: i64) {
        let HttpStream {
            flow,
            senders,
            parsers,
            matcher,
            queue,
            stats,
            handle,
            tracker,
        } = self;

        tracker.spawn_on(
            async move {
                for (sender, chunks) in senders.iter().zip(backlog) {
                    for chunk in chunks {
                        sender.send(chunk).await;
                    }
                }
                drop(senders);
                for parser in parsers {
                    let _ = parser.await;
                }

                let leftover = matcher.drain();
                debug!(flow = %flow.ident, unmatched = leftover.len(), "flow finalised");
                for (id, pending) in leftover {
                    Stats::incr(&stats.exchanges_completed);
                    queue.push(pending.into_exchange(&flow, id, Some(closed_at_us)));
                }
            },
            &handle,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(data: &'static [u8], seq: u32, ack: u32, ts: i64) -> Chunk {
        Chunk {
            data: Bytes::from_static(data),
            seq,
            ack,
            timestamp_us: ts,
            packets: 1,
            skipped: 0,
        }
    }

    fn factory(capacity: usize) -> (HttpStreamFactory, Arc<EventQueue>, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        let queue = Arc::new(EventQueue::new(16, Arc::clone(&stats)));
        let factory = HttpStreamFactory::new(
            Handle::current(),
            Arc::clone(&queue),
            Arc::clone(&stats),
            Arc::new(HttpConfig::default()),
            capacity,
        );
        (factory, queue, stats)
    }

    fn flow() -> FlowInfo {
        FlowInfo::new(1, "1.2.3.4:40000".parse().unwrap(), "5.6.7.8:80".parse().unwrap())
    }

    // Test 1: request and response on one flow pair up
    #[tokio::test]
    async fn test_exchange_emitted() {
        let (mut factory, queue, stats) = factory(8);
        let mut stream = factory.new_stream(&flow());
        stream
            .deliver(Direction::ToServer, chunk(b"GET /a HTTP/1.1\r\n\r\n", 1, 500, 1_000))
            .unwrap();
        stream
            .deliver(Direction::ToClient, chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", 500, 21, 4_000))
            .unwrap();

        let exchange = queue.pop().await.unwrap();
        assert_eq!(exchange.seqack, 500);
        assert_eq!(exchange.request.as_ref().unwrap().target, "/a");
        assert_eq!(exchange.response.as_ref().unwrap().status, 200);
        assert_eq!(exchange.duration_us(), Some(3_000));
        assert_eq!(exchange.closed_at_us, None);

        stream.complete([Vec::new(), Vec::new()], 9_000);
        let tracker = factory.tracker();
        tracker.close();
        tracker.wait().await;
        assert_eq!(Stats::get(&stats.requests_parsed), 1);
        assert_eq!(Stats::get(&stats.responses_parsed), 1);
        assert!(queue.is_empty());
    }

    // Test 2: close flushes the backlog and emits the unmatched request
    #[tokio::test]
    async fn test_complete_emits_single_sided() {
        let (mut factory, queue, _stats) = factory(8);
        let stream = factory.new_stream(&flow());
        let backlog = [vec![chunk(b"GET /lonely HTTP/1.1\r\n\r\n", 1, 777, 1_000)], Vec::new()];
        stream.complete(backlog, 5_000);

        let tracker = factory.tracker();
        tracker.close();
        tracker.wait().await;

        let exchange = queue.pop().await.unwrap();
        assert_eq!(exchange.seqack, 777);
        assert!(exchange.response.is_none());
        assert_eq!(exchange.closed_at_us, Some(5_000));
        assert_eq!(exchange.timestamp_us(), Some(1_000));
    }

    // Test 3: a HEAD response with Content-Length does not eat the next response
    #[tokio::test]
    async fn test_head_response_is_bodiless() {
        let (mut factory, queue, stats) = factory(8);
        let mut stream = factory.new_stream(&flow());
        stream
            .deliver(Direction::ToServer, chunk(b"HEAD /h HTTP/1.1\r\n\r\n", 1, 500, 1_000))
            .unwrap();
        stream
            .deliver(Direction::ToServer, chunk(b"GET /g HTTP/1.1\r\n\r\n", 21, 539, 2_000))
            .unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        stream
            .deliver(Direction::ToClient, chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", 500, 40, 3_000))
            .unwrap();
        stream
            .deliver(Direction::ToClient, chunk(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", 539, 40, 4_000))
            .unwrap();
        stream.complete([Vec::new(), Vec::new()], 9_000);

        let tracker = factory.tracker();
        tracker.close();
        tracker.wait().await;
        assert_eq!(queue.len(), 2);
        assert_eq!(Stats::get(&stats.http_parse_errors), 0);

        let mut exchanges = vec![queue.pop().await.unwrap(), queue.pop().await.unwrap()];
        exchanges.sort_by_key(|e| e.seqack);
        assert_eq!(exchanges[0].request.as_ref().unwrap().method, "HEAD");
        assert_eq!(exchanges[0].response.as_ref().unwrap().status, 200);
        assert_eq!(exchanges[1].request.as_ref().unwrap().target, "/g");
        assert_eq!(exchanges[1].response.as_ref().unwrap().status, 404);
    }

    // Test 4: pipelined requests in one segment pair with responses in order
    #[tokio::test]
    async fn test_pipelined_requests() {
        let (mut factory, queue, _stats) = factory(8);
        let mut stream = factory.new_stream(&flow());
        stream
            .deliver(
                Direction::ToServer,
                chunk(b"GET /first HTTP/1.1\r\n\r\nGET /second HTTP/1.1\r\n\r\n", 1, 500, 1_000),
            )
            .unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        stream
            .deliver(Direction::ToClient, chunk(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", 500, 49, 2_000))
            .unwrap();
        stream
            .deliver(Direction::ToClient, chunk(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", 538, 49, 3_000))
            .unwrap();
        stream.complete([Vec::new(), Vec::new()], 9_000);

        let tracker = factory.tracker();
        tracker.close();
        tracker.wait().await;

        let mut exchanges = Vec::new();
        while !queue.is_empty() {
            exchanges.push(queue.pop().await.unwrap());
        }
        let first = exchanges
            .iter()
            .find(|e| e.request.as_ref().is_some_and(|r| r.target == "/first"))
            .unwrap();
        assert_eq!(first.response.as_ref().unwrap().status, 200);
        assert_eq!(first.duration_us(), Some(1_000));

        let second = exchanges
            .iter()
            .find(|e| e.request.as_ref().is_some_and(|r| r.target == "/second"))
            .unwrap();
        assert!(second.response.is_none());
        assert!(exchanges
            .iter()
            .any(|e| e.request.is_none() && e.response.as_ref().is_some_and(|r| r.status == 404)));
    }
}
