//! libpcap live capture.

use pcap::{Active, Capture};

use super::{CaptureCounters, CaptureInfo, NextPacket, PacketRef, PacketSource, SourceConfig};
use crate::error::{Error, Result};
use crate::protocol::LinkType;

/// Live capture through libpcap.
///
/// Frames are handed out as borrows of libpcap's own buffer.
pub struct LiveSource {
    cap: Option<Capture<Active>>,
    link_type: LinkType,
    interface: String,
}

impl LiveSource {
    /// Open `config.interface` and install the capture filter.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let open_err = |reason: String| Error::SourceOpen {
            source_name: config.interface.clone(),
            reason,
        };

        let timeout_ms = config.read_timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
        let mut cap = Capture::from_device(config.interface.as_str())
            .map_err(|e| open_err(e.to_string()))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen.min(i32::MAX as u32) as i32)
            .timeout(timeout_ms)
            .immediate_mode(true)
            .open()
            .map_err(|e| open_err(e.to_string()))?;

        let filter = config.filter_text();
        cap.filter(&filter, true).map_err(|e| Error::FilterCompile {
            filter: filter.clone(),
            reason: e.to_string(),
        })?;

        let dlt = cap.get_datalink().0;
        let link_type = LinkType::from_dlt(dlt).ok_or_else(|| {
            open_err(format!("unsupported datalink type {dlt}"))
        })?;

        tracing::info!(
            interface = %config.interface,
            snaplen = config.snaplen,
            promiscuous = config.promiscuous,
            bpf_filter = %filter,
            link_type = ?link_type,
            "Configured pcap packet source"
        );

        Ok(Self {
            cap: Some(cap),
            link_type,
            interface: config.interface.clone(),
        })
    }
}

impl PacketSource for LiveSource {
    fn next_packet(&mut self) -> Result<NextPacket<'_>> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(NextPacket::Eof);
        };
        match cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let info = CaptureInfo {
                    timestamp_us: ts.tv_sec as i64 * 1_000_000 + ts.tv_usec as i64,
                    captured_len: packet.header.caplen,
                    original_len: packet.header.len,
                };
                Ok(NextPacket::Packet(PacketRef {
                    info,
                    data: packet.data,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(NextPacket::Timeout),
            Err(pcap::Error::NoMorePackets) => Ok(NextPacket::Eof),
            Err(e) => Err(Error::Capture {
                source_name: self.interface.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn stats(&mut self) -> Result<CaptureCounters> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(CaptureCounters::default());
        };
        let stat = cap.stats().map_err(|e| Error::Capture {
            source_name: self.interface.clone(),
            reason: e.to_string(),
        })?;
        Ok(CaptureCounters {
            packets_received: stat.received as u64,
            packets_dropped: stat.dropped as u64,
            interface_drops: stat.if_dropped as u64,
        })
    }

    fn close(&mut self) {
        if self.cap.take().is_some() {
            tracing::debug!(interface = %self.interface, "Closed pcap handle");
        }
    }
}
