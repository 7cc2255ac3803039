use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};

use super::Chunk;
use crate::protocol::TcpSegment;
use crate::stats::Stats;

/// Unit of buffer accounting, in bytes.
pub const PAGE_SIZE: usize = 1900;

/// Pages needed to hold `len` bytes.
#[inline]
pub fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// A TCP segment waiting for the bytes before it.
#[derive(Debug, Clone)]
struct Segment {
    data: Bytes,
    seq: u32,
    ack: u32,
    timestamp_us: i64,
}

/// Per-direction reassembly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HalfStats {
    pub delivered_bytes: u64,
    pub missed_bytes: u64,
    pub overlap_bytes: u64,
    pub overlap_packets: u64,
    pub out_of_order_bytes: u64,
    pub out_of_order_packets: u64,
}

/// Buffer for one direction of a TCP stream.
///
/// Bytes are addressed by an absolute offset from the first sequenced
/// byte, so the out-of-order map stays ordered across sequence wrap.
#[derive(Debug, Default)]
pub struct HalfStream {
    /// Next expected sequence number.
    next_seq: Option<u32>,
    /// Absolute offset of `next_seq`.
    offset: u64,
    /// Out-of-order segments keyed by absolute offset.
    pending: BTreeMap<u64, Segment>,
    /// In-order chunks the reader has not accepted yet.
    backlog: VecDeque<Chunk>,
    /// Missed bytes not yet attributed to a chunk.
    skipped: u32,
    fin_seq: Option<u32>,
    finished: bool,
    pages: usize,
    stats: HalfStats,
}

impl HalfStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_seq(&self) -> Option<u32> {
        self.next_seq
    }

    /// Whether the FIN of this direction has been sequenced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Pages held in the out-of-order map and the backlog.
    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn stats(&self) -> HalfStats {
        self.stats
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Take in one segment.
    pub fn accept(&mut self, segment: &TcpSegment<'_>, timestamp_us: i64, stats: &Stats) {
        let syn = segment.flags.syn();
        let data_seq = if syn {
            segment.seq.wrapping_add(1)
        } else {
            segment.seq
        };
        let next_seq = match self.next_seq {
            Some(seq) => seq,
            None => {
                self.next_seq = Some(data_seq);
                data_seq
            }
        };

        if segment.flags.fin() && self.fin_seq.is_none() {
            self.fin_seq = Some(seq_add(data_seq, segment.payload.len()));
        }

        let payload = segment.payload;
        if !payload.is_empty() {
            let rel = data_seq.wrapping_sub(next_seq) as i32 as i64;
            if rel < 0 {
                let overlap = (-rel) as usize;
                if overlap >= payload.len() {
                    self.count_overlap(payload.len(), stats);
                } else {
                    self.count_overlap(overlap, stats);
                    self.insert(
                        0,
                        Segment {
                            data: Bytes::copy_from_slice(&payload[overlap..]),
                            seq: next_seq,
                            ack: segment.ack,
                            timestamp_us,
                        },
                        stats,
                    );
                }
            } else {
                self.insert(
                    rel as u64,
                    Segment {
                        data: Bytes::copy_from_slice(payload),
                        seq: data_seq,
                        ack: segment.ack,
                        timestamp_us,
                    },
                    stats,
                );
            }
        }
        self.check_fin();
    }

    /// Place a segment `rel` bytes past `next_seq`.
    fn insert(&mut self, rel: u64, segment: Segment, stats: &Stats) {
        if rel == 0 {
            self.sequence(segment, stats);
            return;
        }

        let abs = self.offset + rel;
        let len = segment.data.len();
        if let Some(existing) = self.pending.get(&abs) {
            if existing.data.len() >= len {
                self.count_overlap(len, stats);
                return;
            }
            let old = existing.data.len();
            self.count_overlap(old, stats);
            self.pages -= pages_for(old);
        }
        self.stats.out_of_order_bytes += len as u64;
        self.stats.out_of_order_packets += 1;
        Stats::add(&stats.out_of_order_bytes, len as u64);
        Stats::incr(&stats.out_of_order_packets);
        self.pages += pages_for(len);
        self.pending.insert(abs, segment);
    }

    /// Append an in-order segment, pulling in whatever pending bytes now
    /// follow it, and queue the result as one chunk.
    fn sequence(&mut self, head: Segment, stats: &Stats) {
        let mut data = BytesMut::from(&head.data[..]);
        let mut packets = 1;
        let mut end = self.offset + head.data.len() as u64;

        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > end {
                break;
            }
            let segment = entry.remove();
            let len = segment.data.len() as u64;
            self.pages -= pages_for(segment.data.len());
            if start + len <= end {
                self.count_overlap(segment.data.len(), stats);
                continue;
            }
            let trim = (end - start) as usize;
            if trim > 0 {
                self.count_overlap(trim, stats);
            }
            data.extend_from_slice(&segment.data[trim..]);
            end = start + len;
            packets += 1;
        }

        let delivered = (end - self.offset) as usize;
        self.offset = end;
        self.next_seq = Some(seq_add(head.seq, delivered));
        self.stats.delivered_bytes += delivered as u64;

        self.pages += pages_for(delivered);
        self.backlog.push_back(Chunk {
            data: data.freeze(),
            seq: head.seq,
            ack: head.ack,
            timestamp_us: head.timestamp_us,
            packets,
            skipped: std::mem::take(&mut self.skipped),
        });
    }

    fn check_fin(&mut self) {
        if let (Some(fin), Some(next)) = (self.fin_seq, self.next_seq) {
            if !self.finished && !seq_lt(next, fin) {
                self.finished = true;
            }
        }
    }

    fn count_overlap(&mut self, bytes: usize, stats: &Stats) {
        self.stats.overlap_bytes += bytes as u64;
        self.stats.overlap_packets += 1;
        Stats::add(&stats.overlap_bytes, bytes as u64);
        Stats::incr(&stats.overlap_packets);
    }

    fn count_missed(&mut self, bytes: u64, stats: &Stats) {
        self.stats.missed_bytes += bytes;
        Stats::add(&stats.missed_bytes, bytes);
    }

    /// Declare the gap before the first out-of-order segment missed and
    /// sequence from there. Returns the bytes skipped.
    pub fn skip_gap(&mut self, stats: &Stats) -> u64 {
        let Some((&start, _)) = self.pending.first_key_value() else {
            return 0;
        };
        let gap = start - self.offset;
        self.count_missed(gap, stats);
        self.skipped = self.skipped.saturating_add(gap as u32);
        self.offset = start;
        if let Some(next) = self.next_seq {
            self.next_seq = Some(seq_add(next, gap as usize));
        }
        if let Some(head) = self.pending.remove(&start) {
            self.pages -= pages_for(head.data.len());
            self.sequence(head, stats);
        }
        self.check_fin();
        gap
    }

    /// Skip every gap so all buffered bytes become chunks.
    pub fn skip_all_gaps(&mut self, stats: &Stats) -> u64 {
        let mut total = 0;
        while self.has_pending() {
            total += self.skip_gap(stats);
        }
        total
    }

    /// Give up the oldest buffered bytes: the backlog the reader has not
    /// taken, or else the gap before the out-of-order data, whose bytes
    /// then become deliverable. Returns false when nothing is buffered.
    pub fn evict_oldest(&mut self, stats: &Stats) -> bool {
        if self.drop_front(stats) {
            return true;
        }
        self.skip_gap(stats) > 0
    }

    /// Discard the oldest backlog chunk, charging it to the next one.
    fn drop_front(&mut self, stats: &Stats) -> bool {
        let Some(chunk) = self.backlog.pop_front() else {
            return false;
        };
        self.pages -= pages_for(chunk.len());
        self.count_missed(chunk.len() as u64, stats);
        let lost = (chunk.len() as u32).saturating_add(chunk.skipped);
        match self.backlog.front_mut() {
            Some(next) => next.skipped = next.skipped.saturating_add(lost),
            None => self.skipped = self.skipped.saturating_add(lost),
        }
        true
    }

    /// Next chunk for the reader.
    pub fn pop_chunk(&mut self) -> Option<Chunk> {
        let chunk = self.backlog.pop_front()?;
        self.pages -= pages_for(chunk.len());
        Some(chunk)
    }

    /// Return a chunk the reader refused.
    pub fn unpop_chunk(&mut self, chunk: Chunk) {
        self.pages += pages_for(chunk.len());
        self.backlog.push_front(chunk);
    }

    /// Everything still queued for the reader.
    pub fn take_backlog(&mut self) -> Vec<Chunk> {
        self.pages -= self.backlog.iter().map(|c| pages_for(c.len())).sum::<usize>();
        self.backlog.drain(..).collect()
    }
}

// Sequence number comparison helpers
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}
