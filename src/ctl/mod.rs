//! Control plane protocol
//!
//! Requests and replies exchanged over the UNIX datagram control socket.
//! Every request starts with a 32-bit command word followed by a
//! length-prefixed argument vector; replies start with a 32-bit type word.
//! A HELLO handshake carrying the protocol version is mandatory before any
//! other request.

mod wire;

pub use wire::{decode_reply, decode_request, encode_reply, encode_request};

use thiserror::Error;

/// Control protocol version exchanged in HELLO
pub const CTL_PROTO_VERSION: u32 = 1;

/// Upper bound for one control datagram
pub const CTL_MAX_PACKET: usize = 64 * 1024;

/// Control protocol errors
#[derive(Debug, Error)]
pub enum CtlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control message")]
    Malformed,

    #[error("unknown control command: {0}")]
    UnknownCommand(u32),

    #[error("unknown reply type: {0}")]
    UnknownReply(u32),

    #[error("control message too large")]
    TooLarge,
}

/// Client requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlRequest {
    Hello,
    GetStats(Vec<String>),
    GetConfig(Vec<String>),
    GetMacMask(Vec<String>),
    GetReserve(Vec<String>),
    ClearStats(Vec<String>),
    ClearConfig(Vec<String>),
    ClearMacMask(Vec<String>),
    ClearReserve(Vec<String>),
    Reload,
}

impl CtlRequest {
    pub fn command_word(&self) -> u32 {
        match self {
            CtlRequest::Hello => 1,
            CtlRequest::GetStats(_) => 2,
            CtlRequest::GetConfig(_) => 3,
            CtlRequest::GetMacMask(_) => 4,
            CtlRequest::GetReserve(_) => 5,
            CtlRequest::ClearStats(_) => 6,
            CtlRequest::ClearConfig(_) => 7,
            CtlRequest::ClearMacMask(_) => 8,
            CtlRequest::ClearReserve(_) => 9,
            CtlRequest::Reload => 10,
        }
    }

    pub fn args(&self) -> &[String] {
        match self {
            CtlRequest::Hello | CtlRequest::Reload => &[],
            CtlRequest::GetStats(args)
            | CtlRequest::GetConfig(args)
            | CtlRequest::GetMacMask(args)
            | CtlRequest::GetReserve(args)
            | CtlRequest::ClearStats(args)
            | CtlRequest::ClearConfig(args)
            | CtlRequest::ClearMacMask(args)
            | CtlRequest::ClearReserve(args) => args,
        }
    }
}

/// Per-device statistics exported on the control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub read_cnt: u64,
    pub read_bytes: u64,
    pub read_time_ns: u64,
    pub write_cnt: u64,
    pub write_bytes: u64,
    pub write_time_ns: u64,
    pub other_cnt: u32,
    pub other_time_ns: u64,
    pub io_slots: u64,
    pub io_runs: u64,
    /// Cumulative queue length, sampled at submit time
    pub queue_length: u64,
    pub queue_stall: u32,
    pub queue_over: u32,
    pub ata_err: u32,
    pub proto_err: u32,
}

/// Per-interface statistics exported on the control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetifStats {
    pub rx_cnt: u64,
    pub rx_bytes: u64,
    pub rx_runs: u64,
    pub rx_buffers_full: u32,
    pub tx_cnt: u64,
    pub tx_bytes: u64,
    pub tx_runs: u64,
    pub tx_buffers_full: u32,
    pub dropped: u32,
    pub ignored: u32,
    pub broadcast: u32,
}

/// Daemon replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlReply {
    Hello { version: u32 },
    Ok,
    Uptime { uptime_ns: u64 },
    DevStat { name: String, stats: DeviceStats },
    NetStat { name: String, stats: NetifStats },
    Config { name: String, config: Vec<u8> },
    MacList { name: String, macs: Vec<[u8; 6]> },
}

impl CtlReply {
    pub fn type_word(&self) -> u32 {
        match self {
            CtlReply::Hello { .. } => 1,
            CtlReply::Ok => 2,
            CtlReply::Uptime { .. } => 3,
            CtlReply::DevStat { .. } => 4,
            CtlReply::NetStat { .. } => 5,
            CtlReply::Config { .. } => 6,
            CtlReply::MacList { .. } => 7,
        }
    }
}
