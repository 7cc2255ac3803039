//! IPv4 fragment reassembly.
//!
//! Fragments are grouped by `(src, dst, protocol, identification)`. When
//! the last piece of a group arrives the datagram is rebuilt behind the
//! first fragment's header, with the fragmentation fields cleared and the
//! length and checksum recomputed. Overlapping bytes keep the copy that
//! arrived first.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use crate::error::{ProtocolError, Result};
use crate::protocol::{header_checksum, Ipv4Packet};

/// Largest datagram IPv4 can describe.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

/// Upper bound on pieces held for one datagram.
pub const MAX_FRAGMENTS: usize = 8_192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    identification: u16,
}

#[derive(Debug, Default)]
struct FragmentGroup {
    /// Payload pieces keyed by byte offset, never overlapping.
    pieces: BTreeMap<usize, Vec<u8>>,
    /// Header of the offset-zero fragment.
    header: Option<Vec<u8>>,
    /// Payload length, known once the final fragment arrived.
    total_len: Option<usize>,
    fragments: usize,
    last_seen_us: i64,
}

impl FragmentGroup {
    /// Add `[offset, offset + data.len())`, keeping bytes already held.
    fn insert(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        let mut cursor = offset;
        let mut gaps = Vec::new();
        for (&start, piece) in self.pieces.range(..end) {
            let piece_end = start + piece.len();
            if piece_end <= cursor {
                continue;
            }
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(piece_end);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        for (from, to) in gaps {
            self.pieces
                .insert(from, data[from - offset..to - offset].to_vec());
        }
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total_len else {
            return false;
        };
        if self.header.is_none() {
            return false;
        }
        let mut covered = 0;
        for (&start, piece) in &self.pieces {
            if start > covered {
                return false;
            }
            covered = covered.max(start + piece.len());
        }
        covered >= total
    }

    fn assemble(self) -> Option<Vec<u8>> {
        let mut header = self.header?;
        let total = self.total_len?;
        let header_len = header.len();
        let datagram_len = header_len + total;

        let mut out = Vec::with_capacity(datagram_len);
        header[2..4].copy_from_slice(&(datagram_len as u16).to_be_bytes());
        header[6] = 0;
        header[7] = 0;
        header[10] = 0;
        header[11] = 0;
        let checksum = header_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&header);

        for (start, piece) in self.pieces {
            let skip = out.len() - header_len;
            if start + piece.len() <= skip {
                continue;
            }
            let from = skip.saturating_sub(start);
            let to = piece.len().min(total.saturating_sub(start));
            if from < to {
                out.extend_from_slice(&piece[from..to]);
            }
        }
        Some(out)
    }
}

/// Reassembles fragmented IPv4 datagrams.
#[derive(Debug, Default)]
pub struct Ipv4Defragmenter {
    groups: HashMap<GroupKey, FragmentGroup>,
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one IPv4 packet.
    ///
    /// Unfragmented packets are returned as-is. A fragment yields `None`
    /// until it completes its datagram, which is then returned owned.
    pub fn process<'a>(&mut self, packet: &'a [u8], now_us: i64) -> Result<Option<Cow<'a, [u8]>>> {
        let ip = Ipv4Packet::parse(packet)?;
        if !ip.is_fragment() {
            return Ok(Some(Cow::Borrowed(packet)));
        }

        let key = GroupKey {
            src: ip.src,
            dst: ip.dst,
            protocol: ip.protocol,
            identification: ip.identification,
        };
        let end = ip.fragment_offset + ip.payload.len();
        if end + ip.header.len() > MAX_DATAGRAM_LEN {
            self.groups.remove(&key);
            return Err(ProtocolError::InvalidField {
                protocol: "ipv4",
                field: "fragment_offset",
                reason: format!("fragment ends at {end}, past the maximum datagram size"),
            }
            .into());
        }

        let group = self.groups.entry(key).or_default();
        group.fragments += 1;
        if group.fragments > MAX_FRAGMENTS {
            self.groups.remove(&key);
            return Err(ProtocolError::InvalidField {
                protocol: "ipv4",
                field: "fragments",
                reason: format!("more than {MAX_FRAGMENTS} fragments for one datagram"),
            }
            .into());
        }

        group.last_seen_us = now_us;
        group.insert(ip.fragment_offset, ip.payload);
        if ip.fragment_offset == 0 && group.header.is_none() {
            group.header = Some(ip.header.to_vec());
        }
        if !ip.more_fragments && group.total_len.is_none() {
            group.total_len = Some(end);
        }

        if !group.is_complete() {
            return Ok(None);
        }
        let datagram = self.groups.remove(&key).and_then(FragmentGroup::assemble);
        if let Some(bytes) = &datagram {
            tracing::trace!(
                src = %key.src,
                dst = %key.dst,
                id = key.identification,
                len = bytes.len(),
                "Reassembled IPv4 datagram"
            );
        }
        Ok(datagram.map(Cow::Owned))
    }

    /// Drop incomplete datagrams last touched before `cutoff_us`.
    pub fn discard_older_than(&mut self, cutoff_us: i64) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| group.last_seen_us >= cutoff_us);
        before - self.groups.len()
    }

    /// Number of incomplete datagrams held.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
