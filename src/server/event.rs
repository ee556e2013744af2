//! Event loop plumbing
//!
//! A thin wrapper around level-triggered epoll plus the timerfd used for
//! queue deadline expiry. Signals never do work themselves; they set flags
//! on a shutdown token that the event loop consults once per tick.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// What a ready file descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Netif(u32),
    Device(u32),
    Ctl,
    Timer,
    Netmon,
}

impl Token {
    fn encode(self) -> u64 {
        match self {
            Token::Netif(idx) => (1u64 << 32) | idx as u64,
            Token::Device(idx) => (2u64 << 32) | idx as u64,
            Token::Ctl => 3u64 << 32,
            Token::Timer => 4u64 << 32,
            Token::Netmon => 5u64 << 32,
        }
    }

    fn decode(value: u64) -> Option<Self> {
        let idx = (value & 0xFFFF_FFFF) as u32;
        match value >> 32 {
            1 => Some(Token::Netif(idx)),
            2 => Some(Token::Device(idx)),
            3 => Some(Token::Ctl),
            4 => Some(Token::Timer),
            5 => Some(Token::Netmon),
            _ => None,
        }
    }
}

/// Level-triggered readiness multiplexer.
pub struct Poller {
    epfd: OwnedFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Option<Token>) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.map(Token::encode).unwrap_or(0),
        };
        let event_ptr = if token.is_some() {
            &mut event
        } else {
            std::ptr::null_mut()
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, event_ptr) })?;
        Ok(())
    }

    /// Watch a descriptor for input readiness.
    pub fn add(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(token))
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Wait for events; fills `ready` with the decoded tokens.
    pub fn wait(&self, timeout_ms: i32, ready: &mut Vec<Token>) -> io::Result<()> {
        ready.clear();
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let count = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for event in events.iter().take(count as usize) {
            if let Some(token) = Token::decode(event.u64) {
                ready.push(token);
            }
        }
        Ok(())
    }
}

/// One-shot monotonic timer for queue deadlines.
pub struct Timer {
    fd: OwnedFd,
}

impl Timer {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Arm the timer to fire once after `ns` nanoseconds; `None` disarms.
    pub fn arm(&self, ns: Option<u64>) -> io::Result<()> {
        let ns = ns.unwrap_or(0);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (ns / 1_000_000_000) as libc::time_t,
                // A zero it_value disarms; clamp armed timers to 1ns
                tv_nsec: if ns == 0 { 0 } else { (ns % 1_000_000_000).max(1) as libc::c_long },
            },
        };
        cvt(unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        })?;
        Ok(())
    }

    /// Drain the expiry counter after the poller reported readiness.
    pub fn consume(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            );
        }
    }
}

static EXIT_FLAG: AtomicBool = AtomicBool::new(false);
static RELOAD_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(sig: libc::c_int) {
    if sig == libc::SIGHUP {
        RELOAD_FLAG.store(true, Ordering::SeqCst);
    } else {
        EXIT_FLAG.store(true, Ordering::SeqCst);
    }
}

/// Cancellation token consulted by the event loop once per tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownToken;

impl ShutdownToken {
    /// Install the signal handlers and return the token.
    pub fn install() -> io::Result<Self> {
        let handler: extern "C" fn(libc::c_int) = on_signal;
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT, libc::SIGHUP] {
                cvt(libc::sigaction(sig, &sa, std::ptr::null_mut()))?;
            }

            let mut ign: libc::sigaction = std::mem::zeroed();
            ign.sa_sigaction = libc::SIG_IGN;
            ign.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut ign.sa_mask);
            cvt(libc::sigaction(libc::SIGPIPE, &ign, std::ptr::null_mut()))?;
        }
        Ok(Self)
    }

    pub fn exit_requested(&self) -> bool {
        EXIT_FLAG.load(Ordering::SeqCst)
    }

    pub fn reload_requested(&self) -> bool {
        RELOAD_FLAG.load(Ordering::SeqCst)
    }

    /// Acknowledge a reload request.
    pub fn clear_reload(&self) {
        RELOAD_FLAG.store(false, Ordering::SeqCst);
    }

    /// Request exit from inside the process (fatal subsystem errors).
    pub fn request_exit(&self) {
        EXIT_FLAG.store(true, Ordering::SeqCst);
    }

    /// Request a reload from inside the process (control plane RELOAD).
    pub fn request_reload(&self) {
        RELOAD_FLAG.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn reset_for_tests(&self) {
        EXIT_FLAG.store(false, Ordering::SeqCst);
        RELOAD_FLAG.store(false, Ordering::SeqCst);
    }
}
