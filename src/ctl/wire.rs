//! Control message encoding
//!
//! All integers are little-endian; strings and byte blobs carry a u16
//! length prefix. Decoding never reads past the datagram.

use super::{CtlError, CtlReply, CtlRequest, DeviceStats, NetifStats, CTL_MAX_PACKET};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), CtlError> {
    if s.len() > u16::MAX as usize {
        return Err(CtlError::TooLarge);
    }
    out.write_u16::<LittleEndian>(s.len() as u16)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, CtlError> {
    let len = cursor.read_u16::<LittleEndian>().map_err(|_| CtlError::Malformed)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| CtlError::Malformed)?;
    String::from_utf8(buf).map_err(|_| CtlError::Malformed)
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CtlError> {
    if bytes.len() > u16::MAX as usize {
        return Err(CtlError::TooLarge);
    }
    out.write_u16::<LittleEndian>(bytes.len() as u16)?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CtlError> {
    let len = cursor.read_u16::<LittleEndian>().map_err(|_| CtlError::Malformed)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| CtlError::Malformed)?;
    Ok(buf)
}

/// Encode a request datagram.
pub fn encode_request(request: &CtlRequest) -> Result<Vec<u8>, CtlError> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(request.command_word())?;
    let args = request.args();
    if args.len() > u16::MAX as usize {
        return Err(CtlError::TooLarge);
    }
    out.write_u16::<LittleEndian>(args.len() as u16)?;
    for arg in args {
        write_string(&mut out, arg)?;
    }
    if out.len() > CTL_MAX_PACKET {
        return Err(CtlError::TooLarge);
    }
    Ok(out)
}

/// Decode a request datagram.
pub fn decode_request(data: &[u8]) -> Result<CtlRequest, CtlError> {
    let mut cursor = Cursor::new(data);
    let command = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let count = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)? as usize;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        args.push(read_string(&mut cursor)?);
    }

    Ok(match command {
        1 => CtlRequest::Hello,
        2 => CtlRequest::GetStats(args),
        3 => CtlRequest::GetConfig(args),
        4 => CtlRequest::GetMacMask(args),
        5 => CtlRequest::GetReserve(args),
        6 => CtlRequest::ClearStats(args),
        7 => CtlRequest::ClearConfig(args),
        8 => CtlRequest::ClearMacMask(args),
        9 => CtlRequest::ClearReserve(args),
        10 => CtlRequest::Reload,
        other => return Err(CtlError::UnknownCommand(other)),
    })
}

fn write_devstats(out: &mut Vec<u8>, stats: &DeviceStats) -> Result<(), CtlError> {
    out.write_u64::<LittleEndian>(stats.read_cnt)?;
    out.write_u64::<LittleEndian>(stats.read_bytes)?;
    out.write_u64::<LittleEndian>(stats.read_time_ns)?;
    out.write_u64::<LittleEndian>(stats.write_cnt)?;
    out.write_u64::<LittleEndian>(stats.write_bytes)?;
    out.write_u64::<LittleEndian>(stats.write_time_ns)?;
    out.write_u32::<LittleEndian>(stats.other_cnt)?;
    out.write_u64::<LittleEndian>(stats.other_time_ns)?;
    out.write_u64::<LittleEndian>(stats.io_slots)?;
    out.write_u64::<LittleEndian>(stats.io_runs)?;
    out.write_u64::<LittleEndian>(stats.queue_length)?;
    out.write_u32::<LittleEndian>(stats.queue_stall)?;
    out.write_u32::<LittleEndian>(stats.queue_over)?;
    out.write_u32::<LittleEndian>(stats.ata_err)?;
    out.write_u32::<LittleEndian>(stats.proto_err)?;
    Ok(())
}

fn read_devstats(cursor: &mut Cursor<&[u8]>) -> Result<DeviceStats, CtlError> {
    let mut read = |wide: bool| -> Result<u64, CtlError> {
        if wide {
            cursor.read_u64::<LittleEndian>().map_err(|_| CtlError::Malformed)
        } else {
            cursor
                .read_u32::<LittleEndian>()
                .map(u64::from)
                .map_err(|_| CtlError::Malformed)
        }
    };
    Ok(DeviceStats {
        read_cnt: read(true)?,
        read_bytes: read(true)?,
        read_time_ns: read(true)?,
        write_cnt: read(true)?,
        write_bytes: read(true)?,
        write_time_ns: read(true)?,
        other_cnt: read(false)? as u32,
        other_time_ns: read(true)?,
        io_slots: read(true)?,
        io_runs: read(true)?,
        queue_length: read(true)?,
        queue_stall: read(false)? as u32,
        queue_over: read(false)? as u32,
        ata_err: read(false)? as u32,
        proto_err: read(false)? as u32,
    })
}

fn write_netstats(out: &mut Vec<u8>, stats: &NetifStats) -> Result<(), CtlError> {
    out.write_u64::<LittleEndian>(stats.rx_cnt)?;
    out.write_u64::<LittleEndian>(stats.rx_bytes)?;
    out.write_u64::<LittleEndian>(stats.rx_runs)?;
    out.write_u32::<LittleEndian>(stats.rx_buffers_full)?;
    out.write_u64::<LittleEndian>(stats.tx_cnt)?;
    out.write_u64::<LittleEndian>(stats.tx_bytes)?;
    out.write_u64::<LittleEndian>(stats.tx_runs)?;
    out.write_u32::<LittleEndian>(stats.tx_buffers_full)?;
    out.write_u32::<LittleEndian>(stats.dropped)?;
    out.write_u32::<LittleEndian>(stats.ignored)?;
    out.write_u32::<LittleEndian>(stats.broadcast)?;
    Ok(())
}

fn read_netstats(cursor: &mut Cursor<&[u8]>) -> Result<NetifStats, CtlError> {
    let mut u64_field = || -> Result<u64, CtlError> {
        cursor.read_u64::<LittleEndian>().map_err(|_| CtlError::Malformed)
    };
    let rx_cnt = u64_field()?;
    let rx_bytes = u64_field()?;
    let rx_runs = u64_field()?;
    let rx_buffers_full = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let tx_cnt = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let tx_bytes = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let tx_runs = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let tx_buffers_full = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let dropped = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let ignored = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    let broadcast = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;
    Ok(NetifStats {
        rx_cnt,
        rx_bytes,
        rx_runs,
        rx_buffers_full,
        tx_cnt,
        tx_bytes,
        tx_runs,
        tx_buffers_full,
        dropped,
        ignored,
        broadcast,
    })
}

/// Encode a reply datagram.
pub fn encode_reply(reply: &CtlReply) -> Result<Vec<u8>, CtlError> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(reply.type_word())?;
    match reply {
        CtlReply::Hello { version } => out.write_u32::<LittleEndian>(*version)?,
        CtlReply::Ok => {}
        CtlReply::Uptime { uptime_ns } => out.write_u64::<LittleEndian>(*uptime_ns)?,
        CtlReply::DevStat { name, stats } => {
            write_string(&mut out, name)?;
            write_devstats(&mut out, stats)?;
        }
        CtlReply::NetStat { name, stats } => {
            write_string(&mut out, name)?;
            write_netstats(&mut out, stats)?;
        }
        CtlReply::Config { name, config } => {
            write_string(&mut out, name)?;
            write_bytes(&mut out, config)?;
        }
        CtlReply::MacList { name, macs } => {
            write_string(&mut out, name)?;
            if macs.len() > u16::MAX as usize {
                return Err(CtlError::TooLarge);
            }
            out.write_u16::<LittleEndian>(macs.len() as u16)?;
            for mac in macs {
                out.write_all(mac)?;
            }
        }
    }
    if out.len() > CTL_MAX_PACKET {
        return Err(CtlError::TooLarge);
    }
    Ok(out)
}

/// Decode a reply datagram.
pub fn decode_reply(data: &[u8]) -> Result<CtlReply, CtlError> {
    let mut cursor = Cursor::new(data);
    let reply_type = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CtlError::Malformed)?;

    Ok(match reply_type {
        1 => CtlReply::Hello {
            version: cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| CtlError::Malformed)?,
        },
        2 => CtlReply::Ok,
        3 => CtlReply::Uptime {
            uptime_ns: cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| CtlError::Malformed)?,
        },
        4 => {
            let name = read_string(&mut cursor)?;
            let stats = read_devstats(&mut cursor)?;
            CtlReply::DevStat { name, stats }
        }
        5 => {
            let name = read_string(&mut cursor)?;
            let stats = read_netstats(&mut cursor)?;
            CtlReply::NetStat { name, stats }
        }
        6 => {
            let name = read_string(&mut cursor)?;
            let config = read_blob(&mut cursor)?;
            CtlReply::Config { name, config }
        }
        7 => {
            let name = read_string(&mut cursor)?;
            let count = cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| CtlError::Malformed)? as usize;
            let mut macs = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let mut mac = [0u8; 6];
                cursor.read_exact(&mut mac).map_err(|_| CtlError::Malformed)?;
                macs.push(mac);
            }
            CtlReply::MacList { name, macs }
        }
        other => return Err(CtlError::UnknownReply(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            CtlRequest::Hello,
            CtlRequest::Reload,
            CtlRequest::GetStats(vec![]),
            CtlRequest::GetStats(vec!["disk0".to_string(), "eth0".to_string()]),
            CtlRequest::ClearReserve(vec!["disk1".to_string()]),
        ];
        for request in requests {
            let data = encode_request(&request).unwrap();
            assert_eq!(decode_request(&data).unwrap(), request);
        }
    }

    #[test]
    fn test_reply_roundtrip() {
        let replies = vec![
            CtlReply::Hello { version: 1 },
            CtlReply::Ok,
            CtlReply::Uptime {
                uptime_ns: 12_345_678_901,
            },
            CtlReply::DevStat {
                name: "disk0".to_string(),
                stats: DeviceStats {
                    read_cnt: 100,
                    read_bytes: 51200,
                    read_time_ns: 7_000_000,
                    write_cnt: 50,
                    write_bytes: 25600,
                    write_time_ns: 9_000_000,
                    other_cnt: 3,
                    other_time_ns: 1000,
                    io_slots: 120,
                    io_runs: 40,
                    queue_length: 220,
                    queue_stall: 1,
                    queue_over: 2,
                    ata_err: 3,
                    proto_err: 4,
                },
            },
            CtlReply::NetStat {
                name: "eth0".to_string(),
                stats: NetifStats {
                    rx_cnt: 9,
                    rx_bytes: 900,
                    rx_runs: 3,
                    rx_buffers_full: 1,
                    tx_cnt: 8,
                    tx_bytes: 800,
                    tx_runs: 2,
                    tx_buffers_full: 0,
                    dropped: 1,
                    ignored: 2,
                    broadcast: 3,
                },
            },
            CtlReply::Config {
                name: "disk0".to_string(),
                config: b"pool=a".to_vec(),
            },
            CtlReply::MacList {
                name: "disk0".to_string(),
                macs: vec![[1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1]],
            },
        ];
        for reply in replies {
            let data = encode_reply(&reply).unwrap();
            assert_eq!(decode_reply(&data).unwrap(), reply);
        }
    }

    #[test]
    fn test_truncated_messages_fail() {
        let data = encode_reply(&CtlReply::DevStat {
            name: "disk0".to_string(),
            stats: DeviceStats::default(),
        })
        .unwrap();
        for len in 0..data.len() {
            assert!(decode_reply(&data[..len]).is_err());
        }

        let data = encode_request(&CtlRequest::GetStats(vec!["a".to_string()])).unwrap();
        for len in 0..data.len() {
            assert!(decode_request(&data[..len]).is_err());
        }
    }

    #[test]
    fn test_unknown_words_fail() {
        let mut data = Vec::new();
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        assert!(matches!(
            decode_request(&data),
            Err(CtlError::UnknownCommand(99))
        ));
        assert!(matches!(
            decode_reply(&99u32.to_le_bytes()),
            Err(CtlError::UnknownReply(99))
        ));
    }
}
