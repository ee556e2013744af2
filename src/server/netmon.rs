//! Netlink link monitor
//!
//! A NETLINK_ROUTE socket subscribed to the link multicast group. The
//! event loop drains it on readiness; any link change triggers an
//! interface re-scan, which diffs the present Ethernet devices against the
//! configured pattern list.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// rtnetlink link multicast group (linux/rtnetlink.h)
const RTMGRP_LINK: u32 = 1;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;

pub struct Netmon {
    fd: OwnedFd,
}

impl Netmon {
    pub fn open() -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = RTMGRP_LINK;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drain pending messages. Returns true when a link appeared, vanished
    /// or changed state.
    pub fn drain(&self) -> bool {
        let mut changed = false;
        let mut buf = [0u8; 8192];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                break;
            }
            changed |= link_message_present(&buf[..n as usize]);
        }
        changed
    }
}

/// Walk a netlink message chain looking for link notifications.
fn link_message_present(data: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset + 16 <= data.len() {
        let len = u32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let msg_type = u16::from_ne_bytes(data[offset + 4..offset + 6].try_into().unwrap());
        if len < 16 || offset + len > data.len() {
            break;
        }
        if msg_type == RTM_NEWLINK || msg_type == RTM_DELLINK {
            return true;
        }
        // Messages are 4-byte aligned
        offset += (len + 3) & !3;
    }
    false
}
