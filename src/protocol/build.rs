//! AoE frame building
//!
//! Encodes structured AoE frames back to wire format and offers the reply
//! constructors used by the device engine. Replies always carry the device's
//! real shelf/slot (never the broadcast pair) and the interface MAC as
//! source.

use super::types::*;

/// Identity a reply is sent as: the answering device and interface.
#[derive(Debug, Clone, Copy)]
pub struct ReplyCtx {
    pub shelf: u16,
    pub slot: u8,
    pub src_mac: [u8; 6],
}

/// Encode a structured frame into wire format.
pub fn encode_frame(frame: &AoeFrame) -> Vec<u8> {
    let header = &frame.header;
    let mut out = Vec::with_capacity(AoeHeader::SIZE + 32);

    out.extend_from_slice(&header.dst_mac);
    out.extend_from_slice(&header.src_mac);
    out.extend_from_slice(&AOE_ETHERTYPE.to_be_bytes());

    out.push(header.flags.to_byte(header.version));
    out.push(header.error);
    out.extend_from_slice(&header.shelf.to_be_bytes());
    out.push(header.slot);
    out.push(header.command as u8);
    out.extend_from_slice(&header.tag.to_be_bytes());

    match &frame.payload {
        AoePayload::Ata { header: ata, data } => {
            out.push(ata.flags.to_byte());
            out.push(ata.err_feature);
            out.push(ata.sector_count);
            out.push(ata.cmd_status);
            // LBA is little-endian in 6 bytes (LBA0-LBA5)
            let lba = ata.lba.to_le_bytes();
            out.extend_from_slice(&lba[0..6]);
            out.extend_from_slice(&[0, 0]); // reserved
            out.extend_from_slice(data);
        }
        AoePayload::Config(cfg) => {
            out.extend_from_slice(&cfg.buffer_count.to_be_bytes());
            out.extend_from_slice(&cfg.firmware_version.to_be_bytes());
            out.push(cfg.sector_count);
            out.push(cfg.aoe_ccmd);
            out.extend_from_slice(&(cfg.config_string.len() as u16).to_be_bytes());
            out.extend_from_slice(&cfg.config_string);
        }
        AoePayload::MacMask(mask) => {
            out.push(0); // reserved
            out.push(mask.command as u8);
            out.push(mask.merror);
            out.push(mask.directives.len() as u8);
            for dir in &mask.directives {
                out.push(0); // reserved
                out.push(dir.command as u8);
                out.extend_from_slice(&dir.mac);
            }
        }
        AoePayload::Reserve(reserve) => {
            out.push(reserve.command as u8);
            out.push(reserve.macs.len() as u8);
            for mac in &reserve.macs {
                out.extend_from_slice(mac);
            }
        }
    }

    out
}

fn reply_header(
    ctx: &ReplyCtx,
    dst: [u8; 6],
    tag: u32,
    command: AoeCommand,
    error: Option<AoeErrorCode>,
) -> AoeHeader {
    AoeHeader {
        dst_mac: dst,
        src_mac: ctx.src_mac,
        version: AOE_VERSION,
        flags: AoeFlags {
            response: true,
            error: error.is_some(),
        },
        error: error.map(|code| code as u8).unwrap_or(0),
        shelf: ctx.shelf,
        slot: ctx.slot,
        command,
        tag,
    }
}

/// Build an ATA reply. `ata` carries the response registers; `data` the read
/// payload (empty for writes and flushes).
pub fn ata_reply(ctx: &ReplyCtx, dst: [u8; 6], tag: u32, ata: AtaHeader, data: Vec<u8>) -> Vec<u8> {
    encode_frame(&AoeFrame {
        header: reply_header(ctx, dst, tag, AoeCommand::Ata, None),
        payload: AoePayload::Ata { header: ata, data },
    })
}

/// Build a Config reply.
pub fn config_reply(
    ctx: &ReplyCtx,
    dst: [u8; 6],
    tag: u32,
    buffer_count: u16,
    firmware_version: u16,
    sector_count: u8,
    ccmd: ConfigCommand,
    config_string: Vec<u8>,
) -> Vec<u8> {
    encode_frame(&AoeFrame {
        header: reply_header(ctx, dst, tag, AoeCommand::Config, None),
        payload: AoePayload::Config(ConfigHeader {
            buffer_count,
            firmware_version,
            sector_count,
            aoe_ccmd: (AOE_VERSION << 4) | (ccmd as u8),
            config_string,
        }),
    })
}

/// Build a MAC mask reply carrying the current list as Add directives.
pub fn mask_reply(
    ctx: &ReplyCtx,
    dst: [u8; 6],
    tag: u32,
    command: MaskCommand,
    merror: u8,
    macs: impl Iterator<Item = [u8; 6]>,
) -> Vec<u8> {
    let directives = macs
        .map(|mac| MaskDirective {
            command: MaskDirCommand::Add,
            mac,
        })
        .collect();
    encode_frame(&AoeFrame {
        header: reply_header(ctx, dst, tag, AoeCommand::MacMask, None),
        payload: AoePayload::MacMask(MacMaskHeader {
            command,
            merror,
            directives,
        }),
    })
}

/// Build a reserve reply carrying the current reservation list.
pub fn reserve_reply(
    ctx: &ReplyCtx,
    dst: [u8; 6],
    tag: u32,
    command: ReserveCommand,
    macs: impl Iterator<Item = [u8; 6]>,
) -> Vec<u8> {
    encode_frame(&AoeFrame {
        header: reply_header(ctx, dst, tag, AoeCommand::Reserve, None),
        payload: AoePayload::Reserve(ReserveHeader {
            command,
            macs: macs.collect(),
        }),
    })
}

/// Build an error reply. ATA requests get a minimal ATA tail with the ABRT
/// bit so initiators see both the AoE and the ATA failure.
pub fn error_reply(
    ctx: &ReplyCtx,
    dst: [u8; 6],
    tag: u32,
    command: AoeCommand,
    code: AoeErrorCode,
    ata: Option<&AtaHeader>,
) -> Vec<u8> {
    let header = reply_header(ctx, dst, tag, command, Some(code));
    match (command, ata) {
        (AoeCommand::Ata, Some(req)) => encode_frame(&AoeFrame {
            header,
            payload: AoePayload::Ata {
                header: AtaHeader {
                    flags: req.flags,
                    err_feature: ata_error::ABRT,
                    sector_count: 0,
                    cmd_status: ata_status::ERR | ata_status::DRDY,
                    lba: req.lba,
                },
                data: Vec::new(),
            },
        }),
        _ => {
            // Header-only error reply
            let mut out = Vec::with_capacity(AoeHeader::SIZE);
            out.extend_from_slice(&header.dst_mac);
            out.extend_from_slice(&header.src_mac);
            out.extend_from_slice(&AOE_ETHERTYPE.to_be_bytes());
            out.push(header.flags.to_byte(header.version));
            out.push(header.error);
            out.extend_from_slice(&header.shelf.to_be_bytes());
            out.push(header.slot);
            out.push(header.command as u8);
            out.extend_from_slice(&header.tag.to_be_bytes());
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse::parse_frame;

    fn header(command: AoeCommand) -> AoeHeader {
        AoeHeader {
            dst_mac: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55],
            src_mac: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            version: AOE_VERSION,
            flags: AoeFlags::default(),
            error: 0,
            shelf: 7,
            slot: 3,
            command,
            tag: 0xDEADBEEF,
        }
    }

    #[test]
    fn test_roundtrip_ata() {
        let frame = AoeFrame {
            header: header(AoeCommand::Ata),
            payload: AoePayload::Ata {
                header: AtaHeader {
                    flags: AtaFlags {
                        extended: true,
                        device: false,
                        async_write: false,
                        write: true,
                    },
                    err_feature: 0,
                    sector_count: 2,
                    cmd_status: 0x34,
                    lba: 0x0102_0304_0506,
                },
                data: vec![0x5A; 1024],
            },
        };
        assert_eq!(parse_frame(&encode_frame(&frame)).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_config() {
        let frame = AoeFrame {
            header: header(AoeCommand::Config),
            payload: AoePayload::Config(ConfigHeader {
                buffer_count: 64,
                firmware_version: 0x4019,
                sector_count: 2,
                aoe_ccmd: (AOE_VERSION << 4) | ConfigCommand::TestPrefix as u8,
                config_string: b"storage-pool-a".to_vec(),
            }),
        };
        assert_eq!(parse_frame(&encode_frame(&frame)).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_mask() {
        let frame = AoeFrame {
            header: header(AoeCommand::MacMask),
            payload: AoePayload::MacMask(MacMaskHeader {
                command: MaskCommand::Edit,
                merror: 0,
                directives: vec![
                    MaskDirective {
                        command: MaskDirCommand::Add,
                        mac: [1, 2, 3, 4, 5, 6],
                    },
                    MaskDirective {
                        command: MaskDirCommand::Delete,
                        mac: [6, 5, 4, 3, 2, 1],
                    },
                ],
            }),
        };
        assert_eq!(parse_frame(&encode_frame(&frame)).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_reserve() {
        let frame = AoeFrame {
            header: header(AoeCommand::Reserve),
            payload: AoePayload::Reserve(ReserveHeader {
                command: ReserveCommand::ForceSet,
                macs: vec![[1u8; 6], [2u8; 6], [3u8; 6]],
            }),
        };
        assert_eq!(parse_frame(&encode_frame(&frame)).unwrap(), frame);
    }

    #[test]
    fn test_ata_reply_wire_layout() {
        let ctx = ReplyCtx {
            shelf: 1,
            slot: 0,
            src_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
        };
        let dst = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let reply = ata_reply(
            &ctx,
            dst,
            42,
            AtaHeader {
                flags: AtaFlags::default(),
                err_feature: 0,
                sector_count: 1,
                cmd_status: ata_status::DRDY,
                lba: 0,
            },
            vec![0u8; SECTOR_SIZE],
        );

        assert_eq!(&reply[0..6], &dst);
        assert_eq!(&reply[6..12], &ctx.src_mac);
        // Response flag set, no error flag
        assert_eq!(reply[14] & 0x80, 0x80);
        assert_eq!(reply[14] & 0x40, 0);
        let tag = u32::from_be_bytes([reply[20], reply[21], reply[22], reply[23]]);
        assert_eq!(tag, 42);
        assert_eq!(reply.len(), AoeHeader::SIZE + AtaHeader::SIZE + SECTOR_SIZE);
    }

    #[test]
    fn test_error_reply_sets_error_byte() {
        let ctx = ReplyCtx {
            shelf: 1,
            slot: 0,
            src_mac: [0x02, 0, 0, 0, 0, 1],
        };
        let reply = error_reply(
            &ctx,
            [0xAA; 6],
            7,
            AoeCommand::Config,
            AoeErrorCode::DeviceUnavailable,
            None,
        );
        assert_eq!(reply.len(), AoeHeader::SIZE);
        assert_eq!(reply[14] & 0x40, 0x40); // error flag
        assert_eq!(reply[15], AoeErrorCode::DeviceUnavailable as u8);
    }

    #[test]
    fn test_ata_error_reply_carries_ata_tail() {
        let ctx = ReplyCtx {
            shelf: 1,
            slot: 0,
            src_mac: [0x02, 0, 0, 0, 0, 1],
        };
        let req = AtaHeader {
            flags: AtaFlags {
                extended: true,
                ..Default::default()
            },
            err_feature: 0,
            sector_count: 1,
            cmd_status: 0x24,
            lba: 2097152,
        };
        let reply = error_reply(
            &ctx,
            [0xAA; 6],
            9,
            AoeCommand::Ata,
            AoeErrorCode::BadArgument,
            Some(&req),
        );
        assert_eq!(reply.len(), AoeHeader::SIZE + AtaHeader::SIZE);
        assert_eq!(reply[15], AoeErrorCode::BadArgument as u8);
        assert_eq!(reply[25], ata_error::ABRT);
        assert_eq!(reply[27], ata_status::ERR | ata_status::DRDY);
        // LBA echoed back
        assert_eq!(&reply[28..34], &2097152u64.to_le_bytes()[0..6]);
    }
}
