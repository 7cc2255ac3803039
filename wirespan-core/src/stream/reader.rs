//! Per-direction byte stream handed to a parser task.
//!
//! The assembler side holds a [`ReaderSender`] and pushes [`Chunk`]s
//! without blocking; the parser side owns the [`StreamReader`] and pulls
//! bytes as it needs them. Dropping every sender is end of stream.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{Chunk, ChunkMeta};

/// Create a bounded reader queue holding up to `capacity` chunks.
pub fn reader_channel(capacity: usize) -> (ReaderSender, StreamReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ReaderSender { tx },
        StreamReader {
            rx,
            buf: BytesMut::new(),
            marks: VecDeque::new(),
            base: 0,
            appended: 0,
            last_timestamp_us: 0,
            last_seq: 0,
            packets: 0,
            eof: false,
        },
    )
}

/// Producer half of a reader queue.
#[derive(Debug, Clone)]
pub struct ReaderSender {
    tx: mpsc::Sender<Chunk>,
}

impl ReaderSender {
    /// Queue a chunk without waiting. A full queue hands the chunk back.
    pub fn deliver(&self, chunk: Chunk) -> Result<(), Chunk> {
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) => Err(chunk),
            // Nobody is reading any more.
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Queue a chunk, waiting for room.
    pub async fn send(&self, chunk: Chunk) {
        let _ = self.tx.send(chunk).await;
    }
}

/// What [`StreamReader::fill`] appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// More contiguous bytes.
    Data,
    /// Bytes that follow a missed region; anything buffered before it
    /// was discarded.
    Gap,
    /// The stream is closed and nothing more will arrive.
    Eof,
}

/// Start of a chunk within the buffer, by absolute stream position.
#[derive(Debug, Clone, Copy)]
struct Mark {
    pos: u64,
    meta: ChunkMeta,
}

/// Consumer half of a reader queue.
#[derive(Debug)]
pub struct StreamReader {
    rx: mpsc::Receiver<Chunk>,
    buf: BytesMut,
    marks: VecDeque<Mark>,
    /// Stream position of `buf[0]`.
    base: u64,
    /// Stream position one past the last buffered byte.
    appended: u64,
    last_timestamp_us: i64,
    last_seq: u32,
    packets: u32,
    eof: bool,
}

impl StreamReader {
    /// Wait for the next chunk and append it to the buffer.
    pub async fn fill(&mut self) -> Fill {
        if self.eof {
            return Fill::Eof;
        }
        let Some(chunk) = self.rx.recv().await else {
            self.eof = true;
            return Fill::Eof;
        };

        let gap = chunk.skipped > 0;
        if gap {
            self.buf.clear();
            self.marks.clear();
            self.base = self.appended;
        }
        self.marks.push_back(Mark {
            pos: self.appended,
            meta: chunk.meta(),
        });
        self.appended += chunk.len() as u64;
        self.last_timestamp_us = chunk.timestamp_us;
        self.last_seq = chunk.seq;
        self.packets = self.packets.saturating_add(chunk.packets);
        self.buf.extend_from_slice(&chunk.data);

        if gap {
            Fill::Gap
        } else {
            Fill::Data
        }
    }

    /// Unconsumed bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.base += n as u64;
        while self.marks.len() > 1 && self.marks[1].pos <= self.base {
            self.marks.pop_front();
        }
    }

    /// Position of the first unconsumed byte: its sequence number, and the
    /// ack and capture time of the chunk that carried it.
    pub fn head(&self) -> Option<ChunkMeta> {
        if self.buf.is_empty() {
            return None;
        }
        let mark = self.marks.front()?;
        let offset = (self.base - mark.pos) as u32;
        Some(ChunkMeta {
            seq: mark.meta.seq.wrapping_add(offset),
            ..mark.meta
        })
    }

    /// Copy out up to `out.len()` bytes, waiting for data. `0` is end of
    /// stream.
    pub async fn read(&mut self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        while self.buf.is_empty() {
            if self.fill().await == Fill::Eof {
                return 0;
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.consume(n);
        n
    }

    /// Capture time of the latest chunk received.
    pub fn last_timestamp_us(&self) -> i64 {
        self.last_timestamp_us
    }

    /// Sequence number of the latest chunk received.
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    /// Packets that carried the chunks received since the last call.
    pub fn take_packet_count(&mut self) -> u32 {
        std::mem::take(&mut self.packets)
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Stop accepting chunks and drop what is buffered.
    pub fn close(&mut self) {
        self.rx.close();
        self.eof = true;
        self.buf.clear();
        self.marks.clear();
        self.base = self.appended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(data: &'static [u8], seq: u32, ts: i64, skipped: u32) -> Chunk {
        Chunk {
            data: Bytes::from_static(data),
            seq,
            ack: seq + 1000,
            timestamp_us: ts,
            packets: 1,
            skipped,
        }
    }

    // Test 1: read drains chunks in order and reports EOF
    #[tokio::test]
    async fn test_read_until_eof() {
        let (tx, mut reader) = reader_channel(4);
        tx.deliver(chunk(b"hello ", 1, 10, 0)).unwrap();
        tx.deliver(chunk(b"world", 7, 20, 0)).unwrap();
        drop(tx);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).await;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(reader.last_timestamp_us(), 20);
        assert_eq!(reader.last_seq(), 7);
        assert!(reader.is_eof());
    }

    // Test 2: a full queue hands the chunk back
    #[tokio::test]
    async fn test_deliver_backpressure() {
        let (tx, _reader) = reader_channel(1);
        assert!(tx.deliver(chunk(b"a", 1, 1, 0)).is_ok());
        let refused = tx.deliver(chunk(b"b", 2, 2, 0)).unwrap_err();
        assert_eq!(&refused.data[..], b"b");
    }

    // Test 3: head tracks the chunk carrying the first unconsumed byte
    #[tokio::test]
    async fn test_head_follows_consume() {
        let (tx, mut reader) = reader_channel(4);
        tx.deliver(chunk(b"abc", 100, 1, 0)).unwrap();
        tx.deliver(chunk(b"def", 103, 2, 0)).unwrap();
        reader.fill().await;
        reader.fill().await;

        assert_eq!(reader.head().unwrap().seq, 100);
        reader.consume(2);
        let head = reader.head().unwrap();
        assert_eq!((head.seq, head.ack, head.timestamp_us), (102, 1100, 1));
        reader.consume(1);
        let head = reader.head().unwrap();
        assert_eq!((head.seq, head.ack, head.timestamp_us), (103, 1103, 2));
        reader.consume(3);
        assert!(reader.head().is_none());
        assert_eq!(reader.take_packet_count(), 2);
        assert_eq!(reader.take_packet_count(), 0);
    }

    // Test 4: a gap discards what was buffered before it
    #[tokio::test]
    async fn test_gap_resets_buffer() {
        let (tx, mut reader) = reader_channel(4);
        tx.deliver(chunk(b"partial", 1, 1, 0)).unwrap();
        tx.deliver(chunk(b"fresh", 50, 2, 42)).unwrap();
        assert_eq!(reader.fill().await, Fill::Data);
        assert_eq!(reader.fill().await, Fill::Gap);
        assert_eq!(reader.buffer(), b"fresh");
        assert_eq!(reader.head().unwrap().seq, 50);
    }

    // Test 5: close is idempotent and silences the sender
    #[tokio::test]
    async fn test_close() {
        let (tx, mut reader) = reader_channel(2);
        reader.close();
        reader.close();
        assert!(tx.deliver(chunk(b"x", 1, 1, 0)).is_ok());
        assert_eq!(reader.fill().await, Fill::Eof);
    }
}
