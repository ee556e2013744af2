//! Interface engine
//!
//! One instance owns a raw AF_PACKET socket bound to one Ethernet port,
//! with memory-mapped TPACKET_V2 RX and TX rings sized from the
//! configuration. Frames are drained from the RX ring in batches and
//! replies are written into TX ring slots, flushed with one send() per
//! batch. Kernels with a broken PACKET_TX_RING can fall back to plain
//! send() per frame.

use crate::config::NetifConfig;
use crate::ctl::NetifStats;
use crate::protocol::{max_sectors_for_mtu, AOE_ETHERTYPE, SECTOR_SIZE};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{fence, Ordering};
use thiserror::Error;

/// Upper bound on frames parked while the TX ring is saturated.
const TX_BACKLOG_MAX: usize = 1024;

// AF_PACKET ring ABI (linux/if_packet.h)
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_TX_RING: libc::c_int = 13;
const TPACKET_V2: libc::c_int = 1;

const TP_STATUS_USER: u32 = 1;
const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_SEND_REQUEST: u32 = 1;
const TP_STATUS_SENDING: u32 = 2;

const TPACKET_ALIGNMENT: usize = 16;

#[repr(C)]
struct Tpacket2Hdr {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_nsec: u32,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

/// sizeof(Tpacket2Hdr) rounded up to TPACKET_ALIGNMENT; TX frame data
/// starts here.
const TPACKET2_HDRLEN: usize =
    (std::mem::size_of::<Tpacket2Hdr>() + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1);

#[repr(C)]
struct TpacketReq {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
}

#[derive(Debug, Error)]
pub enum NetifError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}: ring setup failed: {1}")]
    RingSetup(String, io::Error),
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Ring geometry derived from the configured size and the interface MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub frame_size: usize,
    pub block_size: usize,
    pub block_nr: usize,
    pub frame_nr: usize,
}

impl RingGeometry {
    pub fn bytes(&self) -> usize {
        self.block_size * self.block_nr
    }
}

/// Compute the per-direction ring layout. Frame slots hold one full MTU
/// frame plus the TPACKET header; blocks are page-multiple power-of-two
/// sized so every block holds a whole number of frames.
pub fn ring_geometry(ring_kb: usize, mtu: usize) -> RingGeometry {
    let needed = TPACKET2_HDRLEN + 14 + mtu;
    let frame_size = needed.next_power_of_two().max(2048);
    let block_size = frame_size.max(128 * 1024);
    let per_direction = (ring_kb * 1024 / 2).max(block_size);
    let block_nr = (per_direction / block_size).max(1);
    let frames_per_block = block_size / frame_size;
    RingGeometry {
        frame_size,
        block_size,
        block_nr,
        frame_nr: block_nr * frames_per_block,
    }
}

/// The mmap'ed RX+TX ring pair.
struct Ring {
    map: *mut u8,
    map_len: usize,
    rx: RingGeometry,
    tx: RingGeometry,
    rx_next: usize,
    tx_next: usize,
    /// Frames staged in the TX ring since the last flush
    tx_staged: bool,
}

// The mapping is owned by exactly one Netif on the event-loop thread.
unsafe impl Send for Ring {}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}

impl Ring {
    fn rx_frame(&self, idx: usize) -> *mut u8 {
        let block = idx / (self.rx.block_size / self.rx.frame_size);
        let within = idx % (self.rx.block_size / self.rx.frame_size);
        unsafe {
            self.map
                .add(block * self.rx.block_size + within * self.rx.frame_size)
        }
    }

    fn tx_frame(&self, idx: usize) -> *mut u8 {
        let block = idx / (self.tx.block_size / self.tx.frame_size);
        let within = idx % (self.tx.block_size / self.tx.frame_size);
        unsafe {
            self.map
                .add(self.rx.bytes() + block * self.tx.block_size + within * self.tx.frame_size)
        }
    }
}

/// One Ethernet port exporting AoE devices.
pub struct Netif {
    pub name: String,
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub mtu: usize,
    fd: OwnedFd,
    ring: Ring,
    tx_ring_bug: bool,
    backlog: VecDeque<Vec<u8>>,
    pub stats: NetifStats,
    /// Indices of devices reachable through this interface
    pub attached: Vec<usize>,
}

impl Netif {
    /// Open a raw socket on the interface and map its rings.
    pub fn open(
        name: &str,
        ifindex: u32,
        mac: [u8; 6],
        cfg: &NetifConfig,
        tx_ring_bug: bool,
    ) -> Result<Self, NetifError> {
        let mtu = if cfg.mtu != 0 {
            cfg.mtu
        } else {
            sysfs_mtu(name)?
        };

        let fd = cvt(unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if cfg.send_buf_size > 0 {
            set_buf_size(fd.as_raw_fd(), libc::SO_SNDBUF, cfg.send_buf_size)?;
        }
        if cfg.recv_buf_size > 0 {
            set_buf_size(fd.as_raw_fd(), libc::SO_RCVBUF, cfg.recv_buf_size)?;
        }

        let ring = Self::setup_rings(name, fd.as_raw_fd(), cfg.ring_size_kb, mtu)?;

        // Binding after ring setup so no frame is delivered to an unmapped
        // ring.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = AOE_ETHERTYPE.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;
        cvt(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })?;

        log::info!(
            "{}: listening (MTU {}, {} RX + {} TX ring frames)",
            name,
            mtu,
            ring.rx.frame_nr,
            ring.tx.frame_nr
        );

        Ok(Self {
            name: name.to_string(),
            ifindex,
            mac,
            mtu,
            fd,
            ring,
            tx_ring_bug,
            backlog: VecDeque::new(),
            stats: NetifStats::default(),
            attached: Vec::new(),
        })
    }

    fn setup_rings(
        name: &str,
        fd: RawFd,
        ring_kb: usize,
        mtu: usize,
    ) -> Result<Ring, NetifError> {
        let version = TPACKET_V2;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                PACKET_VERSION,
                &version as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map_err(|err| NetifError::RingSetup(name.to_string(), err))?;

        let geometry = ring_geometry(ring_kb, mtu);
        for opt in [PACKET_RX_RING, PACKET_TX_RING] {
            let req = TpacketReq {
                tp_block_size: geometry.block_size as u32,
                tp_block_nr: geometry.block_nr as u32,
                tp_frame_size: geometry.frame_size as u32,
                tp_frame_nr: geometry.frame_nr as u32,
            };
            cvt(unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_PACKET,
                    opt,
                    &req as *const TpacketReq as *const libc::c_void,
                    std::mem::size_of::<TpacketReq>() as libc::socklen_t,
                )
            })
            .map_err(|err| NetifError::RingSetup(name.to_string(), err))?;
        }

        let map_len = geometry.bytes() * 2;
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(NetifError::RingSetup(
                name.to_string(),
                io::Error::last_os_error(),
            ));
        }

        Ok(Ring {
            map: map as *mut u8,
            map_len,
            rx: geometry,
            tx: geometry,
            rx_next: 0,
            tx_next: 0,
            tx_staged: false,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Sectors one request may carry on this interface.
    pub fn max_payload(&self) -> usize {
        max_sectors_for_mtu(self.mtu) as usize * SECTOR_SIZE
    }

    /// Drain the RX ring, handing each frame to the dispatcher. Stops at
    /// the first kernel-owned slot.
    pub fn rx_drain(&mut self, mut dispatch: impl FnMut(&[u8])) {
        let mut processed = 0usize;
        loop {
            let frame = self.ring.rx_frame(self.ring.rx_next);
            let hdr = frame as *mut Tpacket2Hdr;
            let status = unsafe { std::ptr::read_volatile(&(*hdr).tp_status) };
            if status & TP_STATUS_USER == 0 {
                break;
            }
            fence(Ordering::Acquire);

            let (mac_off, snaplen) =
                unsafe { ((*hdr).tp_mac as usize, (*hdr).tp_snaplen as usize) };
            let data = unsafe { std::slice::from_raw_parts(frame.add(mac_off), snaplen) };

            self.stats.rx_cnt += 1;
            self.stats.rx_bytes += snaplen as u64;
            if snaplen > self.mtu + 14 {
                self.stats.dropped += 1;
            } else {
                dispatch(data);
            }

            fence(Ordering::Release);
            unsafe { std::ptr::write_volatile(&mut (*hdr).tp_status, TP_STATUS_KERNEL) };
            self.ring.rx_next = (self.ring.rx_next + 1) % self.ring.rx.frame_nr;

            processed += 1;
            if processed >= self.ring.rx.frame_nr {
                // Walked the whole ring without finding a kernel slot
                self.stats.rx_buffers_full += 1;
                break;
            }
        }
        if processed > 0 {
            self.stats.rx_runs += 1;
        }
    }

    /// Queue one frame for transmission.
    pub fn enqueue_tx(&mut self, frame: Vec<u8>) {
        if self.tx_ring_bug {
            self.send_direct(&frame);
            return;
        }
        if !self.stage_tx(&frame) {
            self.stats.tx_buffers_full += 1;
            if self.backlog.len() >= TX_BACKLOG_MAX {
                self.stats.dropped += 1;
                return;
            }
            self.backlog.push_back(frame);
        }
    }

    /// Copy a frame into the next free TX ring slot.
    fn stage_tx(&mut self, frame: &[u8]) -> bool {
        if frame.len() > self.ring.tx.frame_size - TPACKET2_HDRLEN {
            // Cannot ever fit; send it out of band instead of looping
            self.send_direct(frame);
            return true;
        }
        let slot = self.ring.tx_frame(self.ring.tx_next);
        let hdr = slot as *mut Tpacket2Hdr;
        let status = unsafe { std::ptr::read_volatile(&(*hdr).tp_status) };
        if status & (TP_STATUS_SEND_REQUEST | TP_STATUS_SENDING) != 0 {
            return false;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                frame.as_ptr(),
                slot.add(TPACKET2_HDRLEN),
                frame.len(),
            );
            (*hdr).tp_len = frame.len() as u32;
            fence(Ordering::Release);
            std::ptr::write_volatile(&mut (*hdr).tp_status, TP_STATUS_SEND_REQUEST);
        }
        self.ring.tx_next = (self.ring.tx_next + 1) % self.ring.tx.frame_nr;
        self.ring.tx_staged = true;
        self.stats.tx_cnt += 1;
        self.stats.tx_bytes += frame.len() as u64;
        true
    }

    /// Bypass the ring with a plain send().
    fn send_direct(&mut self, frame: &[u8]) {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::warn!("{}: send failed: {}", self.name, err);
            }
            self.stats.dropped += 1;
        } else {
            self.stats.tx_cnt += 1;
            self.stats.tx_bytes += frame.len() as u64;
        }
    }

    /// Push staged frames to the wire and retry the backlog.
    pub fn flush_tx(&mut self) {
        while let Some(frame) = self.backlog.pop_front() {
            if !self.stage_tx(&frame) {
                self.backlog.push_front(frame);
                break;
            }
        }
        if !self.ring.tx_staged {
            return;
        }
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                std::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock
                && err.raw_os_error() != Some(libc::ENOBUFS)
            {
                log::warn!("{}: TX ring flush failed: {}", self.name, err);
            }
            // Staged frames stay queued; the kernel picks them up on the
            // next flush.
            return;
        }
        self.ring.tx_staged = false;
        self.stats.tx_runs += 1;
    }

    /// Work left that the event loop should retry soon.
    pub fn has_deferred_tx(&self) -> bool {
        !self.backlog.is_empty() || self.ring.tx_staged
    }
}

fn set_buf_size(fd: RawFd, opt: libc::c_int, size: usize) -> io::Result<()> {
    let value = size as libc::c_int;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// The interface MTU as reported by sysfs.
fn sysfs_mtu(name: &str) -> io::Result<usize> {
    let content = std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))?;
    content
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unparsable MTU"))
}
