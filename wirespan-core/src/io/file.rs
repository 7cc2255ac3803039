//! Offline replay of PCAP and PCAPNG files.
//!
//! Gzip-compressed captures are detected from their magic and decoded on
//! the fly. Frames are copied into one reusable buffer, so the borrow
//! handed to the caller ends at the next read like a live capture's does.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError as ParserError, PcapNGReader};

use super::{CaptureCounters, CaptureInfo, NextPacket, PacketRef, PacketSource};
use crate::error::{Error, PcapError, Result};
use crate::protocol::LinkType;

/// Buffer size for pcap_parser readers.
const BUFFER_SIZE: usize = 262_144;

type Input = BufReader<Box<dyn Read + Send>>;

enum ReaderInner {
    Legacy(LegacyPcapReader<Input>),
    Ng(PcapNGReader<Input>),
}

/// Reader for PCAP and PCAPNG capture files.
pub struct FileSource {
    inner: Option<ReaderInner>,
    link_type: LinkType,
    /// Legacy files may record nanosecond timestamps.
    nanosecond: bool,
    /// PCAPNG timestamp units per second, from the interface block.
    ng_units_per_sec: u64,
    buf: Vec<u8>,
    peeked: Option<CaptureInfo>,
    frames: u64,
    path: String,
}

impl FileSource {
    /// Open a capture file, reading up to its first frame.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let mut file = File::open(path).map_err(|_| {
            Error::Pcap(PcapError::FileNotFound {
                path: display.clone(),
            })
        })?;

        let mut magic = [0u8; 2];
        let compressed = match file.read_exact(&mut magic) {
            Ok(()) => magic == [0x1f, 0x8b],
            Err(_) => {
                return Err(Error::Pcap(PcapError::InvalidFormat {
                    reason: "File too short".to_string(),
                }))
            }
        };
        file.seek(SeekFrom::Start(0))?;

        let source: Box<dyn Read + Send> = if compressed {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut input = BufReader::with_capacity(BUFFER_SIZE, source);

        let head = input.fill_buf()?;
        if head.len() < 4 {
            return Err(Error::Pcap(PcapError::InvalidFormat {
                reason: "File too short to read magic number".to_string(),
            }));
        }
        let is_ng = u32::from_ne_bytes([head[0], head[1], head[2], head[3]]) == 0x0a0d0d0a;

        let inner = if is_ng {
            ReaderInner::Ng(PcapNGReader::new(BUFFER_SIZE, input).map_err(|e| {
                Error::Pcap(PcapError::InvalidFormat {
                    reason: format!("Failed to parse PCAPNG: {}", e),
                })
            })?)
        } else {
            ReaderInner::Legacy(LegacyPcapReader::new(BUFFER_SIZE, input).map_err(|e| {
                Error::Pcap(PcapError::InvalidFormat {
                    reason: format!("Failed to parse legacy PCAP: {}", e),
                })
            })?)
        };

        let mut source = Self {
            inner: Some(inner),
            link_type: LinkType::Ethernet,
            nanosecond: false,
            ng_units_per_sec: 1_000_000,
            buf: Vec::with_capacity(65_536),
            peeked: None,
            frames: 0,
            path: display,
        };
        // Prime the reader so the link type is known before the first poll.
        source.peeked = source.read_next()?;

        tracing::info!(
            path = %source.path,
            compressed,
            format = if is_ng { "pcapng" } else { "pcap" },
            link_type = ?source.link_type,
            "Opened capture file"
        );
        Ok(source)
    }

    /// Number of frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Copy the next frame into `buf`.
    fn read_next(&mut self) -> Result<Option<CaptureInfo>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        let info = match inner {
            ReaderInner::Legacy(reader) => read_legacy(
                reader,
                &mut self.buf,
                &mut self.link_type,
                &mut self.nanosecond,
            )?,
            ReaderInner::Ng(reader) => read_ng(
                reader,
                &mut self.buf,
                &mut self.link_type,
                &mut self.ng_units_per_sec,
            )?,
        };
        if info.is_some() {
            self.frames += 1;
        }
        Ok(info)
    }
}

fn set_link_type(link_type: &mut LinkType, dlt: i32) -> Result<()> {
    *link_type = LinkType::from_dlt(dlt).ok_or(Error::Pcap(PcapError::UnsupportedLinkType {
        link_type: dlt as u32,
    }))?;
    Ok(())
}

fn read_legacy(
    reader: &mut LegacyPcapReader<Input>,
    buf: &mut Vec<u8>,
    link_type: &mut LinkType,
    nanosecond: &mut bool,
) -> Result<Option<CaptureInfo>> {
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let info = match block {
                    PcapBlockOwned::Legacy(packet) => {
                        let frac = if *nanosecond {
                            packet.ts_usec as i64 / 1_000
                        } else {
                            packet.ts_usec as i64
                        };
                        buf.clear();
                        buf.extend_from_slice(packet.data);
                        Some(CaptureInfo {
                            timestamp_us: packet.ts_sec as i64 * 1_000_000 + frac,
                            captured_len: packet.caplen,
                            original_len: packet.origlen,
                        })
                    }
                    PcapBlockOwned::LegacyHeader(header) => {
                        *nanosecond = header.is_nanosecond_precision();
                        set_link_type(link_type, header.network.0)?;
                        None
                    }
                    _ => None,
                };
                reader.consume(offset);
                if info.is_some() {
                    return Ok(info);
                }
            }
            Err(ParserError::Eof) => return Ok(None),
            Err(ParserError::Incomplete(_)) => {
                reader.refill().map_err(|e| {
                    Error::Pcap(PcapError::InvalidFormat {
                        reason: format!("Legacy PCAP refill error: {}", e),
                    })
                })?;
            }
            Err(e) => {
                return Err(Error::Pcap(PcapError::InvalidFormat {
                    reason: format!("Legacy PCAP parse error: {}", e),
                }));
            }
        }
    }
}

fn read_ng(
    reader: &mut PcapNGReader<Input>,
    buf: &mut Vec<u8>,
    link_type: &mut LinkType,
    units_per_sec: &mut u64,
) -> Result<Option<CaptureInfo>> {
    use pcap_parser::pcapng::Block;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let info = match block {
                    PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                        *units_per_sec = ts_units_per_sec(idb.if_tsresol);
                        set_link_type(link_type, idb.linktype.0)?;
                        None
                    }
                    PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                        let raw = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                        buf.clear();
                        buf.extend_from_slice(epb.data);
                        Some(CaptureInfo {
                            timestamp_us: (raw as u128 * 1_000_000 / *units_per_sec as u128) as i64,
                            captured_len: epb.caplen,
                            original_len: epb.origlen,
                        })
                    }
                    PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                        buf.clear();
                        buf.extend_from_slice(spb.data);
                        Some(CaptureInfo {
                            timestamp_us: 0,
                            captured_len: spb.data.len() as u32,
                            original_len: spb.origlen,
                        })
                    }
                    _ => None,
                };
                reader.consume(offset);
                if info.is_some() {
                    return Ok(info);
                }
            }
            Err(ParserError::Eof) => return Ok(None),
            Err(ParserError::Incomplete(_)) => {
                reader.refill().map_err(|e| {
                    Error::Pcap(PcapError::InvalidFormat {
                        reason: format!("PCAPNG refill error: {}", e),
                    })
                })?;
            }
            Err(e) => {
                return Err(Error::Pcap(PcapError::InvalidFormat {
                    reason: format!("PCAPNG parse error: {}", e),
                }));
            }
        }
    }
}

/// Decode an `if_tsresol` option value.
fn ts_units_per_sec(tsresol: u8) -> u64 {
    let exp = (tsresol & 0x7f) as u32;
    let units = if tsresol & 0x80 != 0 {
        2u64.checked_pow(exp)
    } else {
        10u64.checked_pow(exp)
    };
    units.filter(|u| *u > 0).unwrap_or(1_000_000)
}

impl PacketSource for FileSource {
    fn next_packet(&mut self) -> Result<NextPacket<'_>> {
        let info = match self.peeked.take() {
            Some(info) => Some(info),
            None => self.read_next()?,
        };
        match info {
            Some(info) => Ok(NextPacket::Packet(PacketRef {
                info,
                data: &self.buf,
            })),
            None => Ok(NextPacket::Eof),
        }
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn stats(&mut self) -> Result<CaptureCounters> {
        Ok(CaptureCounters {
            packets_received: self.frames,
            ..Default::default()
        })
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            tracing::debug!(path = %self.path, frames = self.frames, "Closed capture file");
        }
    }
}
