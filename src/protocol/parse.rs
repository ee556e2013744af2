//! AoE frame parsing
//!
//! Parses raw Ethernet frames into structured AoE frames.

use super::types::*;
use thiserror::Error;

/// Parsing errors
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("invalid EtherType: expected 0x{:04X}, got 0x{actual:04X}", AOE_ETHERTYPE)]
    InvalidEtherType { actual: u16 },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("invalid config header")]
    InvalidConfigHeader,

    #[error("unknown config sub-command: {0}")]
    UnknownConfigCommand(u8),

    #[error("invalid MAC mask header")]
    InvalidMaskHeader,

    #[error("unknown MAC mask sub-command: {0}")]
    UnknownMaskCommand(u8),

    #[error("invalid reserve header")]
    InvalidReserveHeader,

    #[error("unknown reserve sub-command: {0}")]
    UnknownReserveCommand(u8),
}

impl ParseError {
    /// The AoE error code reported back to the initiator for this failure.
    pub fn aoe_error(&self) -> AoeErrorCode {
        match self {
            ParseError::UnknownCommand(_) => AoeErrorCode::BadCommand,
            ParseError::UnsupportedVersion(_) => AoeErrorCode::UnsupportedVersion,
            _ => AoeErrorCode::BadArgument,
        }
    }
}

/// Parse a raw Ethernet frame into an AoE frame
pub fn parse_frame(data: &[u8]) -> Result<AoeFrame, ParseError> {
    // Minimum size: Ethernet header (14) + AoE header (10) = 24 bytes
    if data.len() < AoeHeader::SIZE {
        return Err(ParseError::TooShort {
            expected: AoeHeader::SIZE,
            actual: data.len(),
        });
    }

    let dst_mac: [u8; 6] = data[0..6].try_into().unwrap();
    let src_mac: [u8; 6] = data[6..12].try_into().unwrap();
    let ethertype = u16::from_be_bytes([data[12], data[13]]);

    if ethertype != AOE_ETHERTYPE {
        return Err(ParseError::InvalidEtherType { actual: ethertype });
    }

    let ver_flags = data[14];
    let version = ver_flags & 0x0F;
    let flags = AoeFlags::from_byte(ver_flags >> 4);

    if version != AOE_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let error = data[15];
    let shelf = u16::from_be_bytes([data[16], data[17]]);
    let slot = data[18];
    let command_byte = data[19];
    let tag = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);

    let command = AoeCommand::try_from(command_byte)
        .map_err(ParseError::UnknownCommand)?;

    let header = AoeHeader {
        dst_mac,
        src_mac,
        version,
        flags,
        error,
        shelf,
        slot,
        command,
        tag,
    };

    let tail = &data[AoeHeader::SIZE..];
    let payload = match command {
        AoeCommand::Ata => parse_ata_payload(tail)?,
        AoeCommand::Config => parse_config_payload(tail)?,
        AoeCommand::MacMask => parse_mask_payload(tail)?,
        AoeCommand::Reserve => parse_reserve_payload(tail)?,
    };

    Ok(AoeFrame { header, payload })
}

/// Parse an ATA command payload
fn parse_ata_payload(data: &[u8]) -> Result<AoePayload, ParseError> {
    if data.len() < AtaHeader::SIZE {
        return Err(ParseError::TooShort {
            expected: AoeHeader::SIZE + AtaHeader::SIZE,
            actual: AoeHeader::SIZE + data.len(),
        });
    }

    let flags = AtaFlags::from_byte(data[0]);
    let err_feature = data[1];
    let sector_count = data[2];
    let cmd_status = data[3];

    // LBA is stored little-endian in 6 bytes (LBA0-LBA5)
    let lba = u64::from(data[4])
        | (u64::from(data[5]) << 8)
        | (u64::from(data[6]) << 16)
        | (u64::from(data[7]) << 24)
        | (u64::from(data[8]) << 32)
        | (u64::from(data[9]) << 40);

    // Bytes 10-11 are reserved

    let ata_header = AtaHeader {
        flags,
        err_feature,
        sector_count,
        cmd_status,
        lba,
    };

    // Data follows the ATA header (if write command)
    let payload_data = data[AtaHeader::SIZE..].to_vec();

    Ok(AoePayload::Ata {
        header: ata_header,
        data: payload_data,
    })
}

/// Parse a Config command payload
fn parse_config_payload(data: &[u8]) -> Result<AoePayload, ParseError> {
    if data.len() < ConfigHeader::MIN_SIZE {
        return Err(ParseError::TooShort {
            expected: AoeHeader::SIZE + ConfigHeader::MIN_SIZE,
            actual: AoeHeader::SIZE + data.len(),
        });
    }

    let buffer_count = u16::from_be_bytes([data[0], data[1]]);
    let firmware_version = u16::from_be_bytes([data[2], data[3]]);
    let sector_count = data[4];
    let aoe_ccmd = data[5];
    let config_len = u16::from_be_bytes([data[6], data[7]]) as usize;

    if config_len > CONFIG_STR_MAX {
        return Err(ParseError::InvalidConfigHeader);
    }

    let config_string = if config_len > 0 {
        let start = ConfigHeader::MIN_SIZE;
        let end = start + config_len;
        if data.len() < end {
            return Err(ParseError::InvalidConfigHeader);
        }
        data[start..end].to_vec()
    } else {
        Vec::new()
    };

    let header = ConfigHeader {
        buffer_count,
        firmware_version,
        sector_count,
        aoe_ccmd,
        config_string,
    };
    header
        .config_command()
        .map_err(ParseError::UnknownConfigCommand)?;

    Ok(AoePayload::Config(header))
}

/// Parse a MAC mask command payload
fn parse_mask_payload(data: &[u8]) -> Result<AoePayload, ParseError> {
    if data.len() < MacMaskHeader::MIN_SIZE {
        return Err(ParseError::TooShort {
            expected: AoeHeader::SIZE + MacMaskHeader::MIN_SIZE,
            actual: AoeHeader::SIZE + data.len(),
        });
    }

    // Byte 0 is reserved
    let command =
        MaskCommand::try_from(data[1]).map_err(ParseError::UnknownMaskCommand)?;
    let merror = data[2];
    let dir_count = data[3] as usize;

    let dirs_end = MacMaskHeader::MIN_SIZE + dir_count * MacMaskHeader::DIR_SIZE;
    if data.len() < dirs_end {
        return Err(ParseError::InvalidMaskHeader);
    }

    let mut directives = Vec::with_capacity(dir_count);
    for i in 0..dir_count {
        let off = MacMaskHeader::MIN_SIZE + i * MacMaskHeader::DIR_SIZE;
        // Directive byte 0 is reserved
        let dcmd = MaskDirCommand::try_from(data[off + 1])
            .map_err(|_| ParseError::InvalidMaskHeader)?;
        let mac: [u8; 6] = data[off + 2..off + 8].try_into().unwrap();
        directives.push(MaskDirective { command: dcmd, mac });
    }

    Ok(AoePayload::MacMask(MacMaskHeader {
        command,
        merror,
        directives,
    }))
}

/// Parse a reserve/release command payload
fn parse_reserve_payload(data: &[u8]) -> Result<AoePayload, ParseError> {
    if data.len() < ReserveHeader::MIN_SIZE {
        return Err(ParseError::TooShort {
            expected: AoeHeader::SIZE + ReserveHeader::MIN_SIZE,
            actual: AoeHeader::SIZE + data.len(),
        });
    }

    let command =
        ReserveCommand::try_from(data[0]).map_err(ParseError::UnknownReserveCommand)?;
    let nmacs = data[1] as usize;

    let macs_end = ReserveHeader::MIN_SIZE + nmacs * 6;
    if data.len() < macs_end {
        return Err(ParseError::InvalidReserveHeader);
    }

    let mut macs = Vec::with_capacity(nmacs);
    for i in 0..nmacs {
        let off = ReserveHeader::MIN_SIZE + i * 6;
        macs.push(data[off..off + 6].try_into().unwrap());
    }

    Ok(AoePayload::Reserve(ReserveHeader { command, macs }))
}
