//! `AF_PACKET` TPACKET_V3 ring capture (Linux).
//!
//! The kernel fills fixed-size blocks of a ring shared through `mmap`; user
//! space walks the packets of a block it owns and hands the block back by
//! resetting its status word. A block is released on the call after its
//! last packet was returned, so the borrowed frame stays valid until then.

use crate::error::{Error, Result};

/// Frames per block in the memory-mapped ring.
pub const FRAMES_PER_BLOCK: usize = 128;

/// Geometry of a TPACKET_V3 ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSize {
    pub frame_size: usize,
    pub block_size: usize,
    pub num_blocks: usize,
}

/// Size a ring from a target size in MiB.
///
/// The frame size divides the block size and the block size is a whole
/// number of pages. Fails when not even one block fits the target.
pub fn compute_ring_size(target_mb: usize, snaplen: usize, page_size: usize) -> Result<RingSize> {
    let frame_size = if snaplen < page_size {
        page_size / (page_size / snaplen.max(1))
    } else {
        (snaplen / page_size + 1) * page_size
    };
    let block_size = frame_size * FRAMES_PER_BLOCK;
    let num_blocks = target_mb * 1024 * 1024 / block_size;
    if num_blocks == 0 {
        return Err(Error::BufferTooSmall {
            target_mb,
            block_size,
        });
    }
    Ok(RingSize {
        frame_size,
        block_size,
        num_blocks,
    })
}

#[cfg(target_os = "linux")]
pub use imp::RingSource;

#[cfg(target_os = "linux")]
mod imp {
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{fence, Ordering};

    use memmap2::{MmapOptions, MmapRaw};
    use socket2::{Domain, Protocol, Socket, Type};

    use super::{compute_ring_size, RingSize};
    use crate::error::{Error, Result};
    use crate::io::{
        compile_filter, CaptureCounters, CaptureInfo, FilterInstruction, NextPacket, PacketRef,
        PacketSource, SourceConfig,
    };
    use crate::protocol::LinkType;

    const ETH_P_ALL: u16 = 0x0003;
    const SOL_PACKET: libc::c_int = 263;
    const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
    const PACKET_RX_RING: libc::c_int = 5;
    const PACKET_STATISTICS: libc::c_int = 6;
    const PACKET_VERSION: libc::c_int = 10;
    const PACKET_MR_PROMISC: u16 = 1;
    const TPACKET_V3: libc::c_int = 2;
    const SO_ATTACH_FILTER: libc::c_int = 26;

    const TP_STATUS_KERNEL: u32 = 0;
    const TP_STATUS_USER: u32 = 1;

    /// Block retire timeout, so quiet links still surface packets.
    const BLOCK_TIMEOUT_MS: u32 = 64;

    // Offsets into `tpacket_block_desc` / `tpacket_hdr_v1`.
    const BLOCK_STATUS: usize = 8;
    const BLOCK_NUM_PKTS: usize = 12;
    const BLOCK_FIRST_PKT: usize = 16;

    // Offsets into `tpacket3_hdr`.
    const PKT_NEXT_OFFSET: usize = 0;
    const PKT_SEC: usize = 4;
    const PKT_NSEC: usize = 8;
    const PKT_SNAPLEN: usize = 12;
    const PKT_LEN: usize = 16;
    const PKT_MAC: usize = 24;

    #[repr(C)]
    struct TpacketReq3 {
        tp_block_size: u32,
        tp_block_nr: u32,
        tp_frame_size: u32,
        tp_frame_nr: u32,
        tp_retire_blk_tov: u32,
        tp_sizeof_priv: u32,
        tp_feature_req_word: u32,
    }

    #[repr(C)]
    struct TpacketStatsV3 {
        tp_packets: u32,
        tp_drops: u32,
        tp_freeze_q_cnt: u32,
    }

    #[repr(C)]
    struct PacketMreq {
        mr_ifindex: libc::c_int,
        mr_type: u16,
        mr_alen: u16,
        mr_address: [u8; 8],
    }

    #[repr(C)]
    struct SockFprog {
        len: u16,
        filter: *const FilterInstruction,
    }

    /// Block currently owned by user space.
    #[derive(Debug, Clone, Copy)]
    struct OwnedBlock {
        index: usize,
        remaining: u32,
        offset: usize,
    }

    /// Memory-mapped `AF_PACKET` capture.
    pub struct RingSource {
        // Field order matters: the mapping is dropped before the socket.
        ring: Option<MmapRaw>,
        socket: Option<Socket>,
        size: RingSize,
        current: Option<OwnedBlock>,
        next_block: usize,
        pending_release: Option<usize>,
        poll_timeout_ms: libc::c_int,
        counters: CaptureCounters,
        interface: String,
    }

    // The raw mapping is only touched through `&mut self`.
    unsafe impl Send for RingSource {}

    impl RingSource {
        /// Create the socket, attach the filter, and map the ring.
        pub fn open(config: &SourceConfig) -> Result<Self> {
            let open_err = |reason: String| Error::SourceOpen {
                source_name: config.interface.clone(),
                reason,
            };

            // Leave room for a VLAN tag the kernel re-inserts.
            let snaplen = config.snaplen.saturating_sub(1) as usize;
            let page_size = page_size();
            let size = compute_ring_size(config.buffer_size_mb, snaplen, page_size)?;

            let socket = Socket::new(
                Domain::PACKET,
                Type::RAW,
                Some(Protocol::from(ETH_P_ALL.to_be() as libc::c_int)),
            )
            .map_err(|e| open_err(e.to_string()))?;
            let fd = socket.as_raw_fd();

            setsockopt(fd, SOL_PACKET, PACKET_VERSION, &TPACKET_V3)
                .map_err(|e| open_err(format!("PACKET_VERSION: {e}")))?;

            // Attach before the ring exists so no unfiltered frame lands in it.
            let filter = config.filter_text();
            let program = compile_filter(&filter, LinkType::Ethernet, config.snaplen)?;
            let fprog = SockFprog {
                len: program.len() as u16,
                filter: program.as_ptr(),
            };
            setsockopt(fd, libc::SOL_SOCKET, SO_ATTACH_FILTER, &fprog).map_err(|e| {
                Error::FilterCompile {
                    filter: filter.clone(),
                    reason: format!("SO_ATTACH_FILTER: {e}"),
                }
            })?;

            let req = TpacketReq3 {
                tp_block_size: size.block_size as u32,
                tp_block_nr: size.num_blocks as u32,
                tp_frame_size: size.frame_size as u32,
                tp_frame_nr: (size.block_size / size.frame_size * size.num_blocks) as u32,
                tp_retire_blk_tov: BLOCK_TIMEOUT_MS,
                tp_sizeof_priv: 0,
                tp_feature_req_word: 0,
            };
            setsockopt(fd, SOL_PACKET, PACKET_RX_RING, &req)
                .map_err(|e| open_err(format!("PACKET_RX_RING: {e}")))?;

            let ring = MmapOptions::new()
                .len(size.block_size * size.num_blocks)
                .map_raw(&socket)
                .map_err(|e| open_err(format!("mmap: {e}")))?;

            if config.interface != "any" {
                let ifindex = interface_index(&config.interface).map_err(open_err)?;
                bind(fd, ifindex).map_err(|e| open_err(format!("bind: {e}")))?;
                if config.promiscuous {
                    let mreq = PacketMreq {
                        mr_ifindex: ifindex,
                        mr_type: PACKET_MR_PROMISC,
                        mr_alen: 0,
                        mr_address: [0; 8],
                    };
                    setsockopt(fd, SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq)
                        .map_err(|e| open_err(format!("PACKET_ADD_MEMBERSHIP: {e}")))?;
                }
            }

            tracing::info!(
                interface = %config.interface,
                snaplen,
                bpf_filter = %filter,
                frame_size = size.frame_size,
                block_size = size.block_size,
                num_blocks = size.num_blocks,
                target_size_mb = config.buffer_size_mb,
                page_size,
                "Configured afpacket packet source"
            );

            Ok(Self {
                ring: Some(ring),
                socket: Some(socket),
                size,
                current: None,
                next_block: 0,
                pending_release: None,
                poll_timeout_ms: config.read_timeout.as_millis().min(i32::MAX as u128) as libc::c_int,
                counters: CaptureCounters::default(),
                interface: config.interface.clone(),
            })
        }

        fn block_ptr(&self, base: *mut u8, index: usize) -> *mut u8 {
            // SAFETY: index < num_blocks, so the offset stays inside the mapping.
            unsafe { base.add(index * self.size.block_size) }
        }

        fn release(&mut self, base: *mut u8, index: usize) {
            let block = self.block_ptr(base, index);
            fence(Ordering::Release);
            // SAFETY: the status word lies inside the block header.
            unsafe { write_u32(block, BLOCK_STATUS, TP_STATUS_KERNEL) };
        }

        fn poll(&self) -> Result<bool> {
            let Some(socket) = self.socket.as_ref() else {
                return Ok(false);
            };
            let mut pfd = libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN | libc::POLLERR,
                revents: 0,
            };
            // SAFETY: one valid pollfd.
            let rc = unsafe { libc::poll(&mut pfd, 1, self.poll_timeout_ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(Error::Capture {
                    source_name: self.interface.clone(),
                    reason: format!("poll: {err}"),
                });
            }
            Ok(rc > 0)
        }
    }

    impl PacketSource for RingSource {
        fn next_packet(&mut self) -> Result<NextPacket<'_>> {
            let base = match self.ring.as_ref() {
                Some(ring) => ring.as_mut_ptr(),
                None => return Ok(NextPacket::Eof),
            };

            if let Some(index) = self.pending_release.take() {
                self.release(base, index);
            }

            let mut polled = false;
            loop {
                if let Some(mut block) = self.current {
                    if block.remaining > 0 {
                        let start = self.block_ptr(base, block.index);
                        // SAFETY: offsets come from the kernel-written block header
                        // and stay inside this block.
                        let (info, data, next) = unsafe {
                            let hdr = start.add(block.offset);
                            let sec = read_u32(hdr, PKT_SEC) as i64;
                            let nsec = read_u32(hdr, PKT_NSEC) as i64;
                            let snaplen = read_u32(hdr, PKT_SNAPLEN);
                            let len = read_u32(hdr, PKT_LEN);
                            let mac = read_u16(hdr, PKT_MAC) as usize;
                            let next = read_u32(hdr, PKT_NEXT_OFFSET) as usize;
                            let data = std::slice::from_raw_parts(hdr.add(mac), snaplen as usize);
                            let info = CaptureInfo {
                                timestamp_us: sec * 1_000_000 + nsec / 1_000,
                                captured_len: snaplen,
                                original_len: len,
                            };
                            (info, data, next)
                        };
                        block.remaining -= 1;
                        block.offset += next;
                        if block.remaining == 0 {
                            self.pending_release = Some(block.index);
                            self.current = None;
                        } else {
                            self.current = Some(block);
                        }
                        return Ok(NextPacket::Packet(PacketRef { info, data }));
                    }
                    // Empty block retired by timeout.
                    self.release(base, block.index);
                    self.current = None;
                }

                let index = self.next_block;
                let start = self.block_ptr(base, index);
                // SAFETY: block header fields are inside the mapping.
                let status = unsafe { read_u32(start, BLOCK_STATUS) };
                if status & TP_STATUS_USER != 0 {
                    fence(Ordering::Acquire);
                    // SAFETY: as above; the block now belongs to user space.
                    let (remaining, offset) = unsafe {
                        (
                            read_u32(start, BLOCK_NUM_PKTS),
                            read_u32(start, BLOCK_FIRST_PKT) as usize,
                        )
                    };
                    self.current = Some(OwnedBlock {
                        index,
                        remaining,
                        offset,
                    });
                    self.next_block = (index + 1) % self.size.num_blocks;
                    continue;
                }

                if polled {
                    return Ok(NextPacket::Timeout);
                }
                if !self.poll()? {
                    return Ok(NextPacket::Timeout);
                }
                polled = true;
            }
        }

        fn link_type(&self) -> LinkType {
            LinkType::Ethernet
        }

        fn stats(&mut self) -> Result<CaptureCounters> {
            let Some(socket) = self.socket.as_ref() else {
                return Ok(self.counters);
            };
            let mut stats = TpacketStatsV3 {
                tp_packets: 0,
                tp_drops: 0,
                tp_freeze_q_cnt: 0,
            };
            let mut len = std::mem::size_of::<TpacketStatsV3>() as libc::socklen_t;
            // SAFETY: buffer and length describe `stats`.
            let rc = unsafe {
                libc::getsockopt(
                    socket.as_raw_fd(),
                    SOL_PACKET,
                    PACKET_STATISTICS,
                    &mut stats as *mut TpacketStatsV3 as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc < 0 {
                return Err(Error::Capture {
                    source_name: self.interface.clone(),
                    reason: format!("PACKET_STATISTICS: {}", std::io::Error::last_os_error()),
                });
            }
            // The kernel resets these on every read.
            self.counters.packets_received += stats.tp_packets as u64;
            self.counters.packets_dropped += stats.tp_drops as u64;
            self.counters.interface_drops += stats.tp_freeze_q_cnt as u64;
            Ok(self.counters)
        }

        fn close(&mut self) {
            self.current = None;
            self.pending_release = None;
            self.ring = None;
            if self.socket.take().is_some() {
                tracing::debug!(interface = %self.interface, "Closed afpacket socket");
            }
        }
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    fn interface_index(name: &str) -> std::result::Result<libc::c_int, String> {
        let cname = CString::new(name).map_err(|_| "interface name contains NUL".to_string())?;
        // SAFETY: valid NUL-terminated string.
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 {
            return Err(format!("no such interface: {}", std::io::Error::last_os_error()));
        }
        Ok(index as libc::c_int)
    }

    fn bind(fd: libc::c_int, ifindex: libc::c_int) -> std::io::Result<()> {
        // SAFETY: sockaddr_ll is plain data; zeroed is a valid starting value.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETH_P_ALL.to_be();
        addr.sll_ifindex = ifindex;
        // SAFETY: addr is a fully initialised sockaddr_ll.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn setsockopt<T>(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: &T) -> std::io::Result<()> {
        // SAFETY: value points to a live T of the given size.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
        std::ptr::read_volatile(base.add(offset) as *const u32)
    }

    unsafe fn read_u16(base: *const u8, offset: usize) -> u16 {
        std::ptr::read_volatile(base.add(offset) as *const u16)
    }

    unsafe fn write_u32(base: *mut u8, offset: usize, value: u32) {
        std::ptr::write_volatile(base.add(offset) as *mut u32, value)
    }
}
