//! ATA command classification and IDENTIFY synthesis
//!
//! The device engine owns the actual I/O; this module turns ATA register
//! values into typed operations and builds the 512-byte IDENTIFY DEVICE
//! block.

use super::types::*;

/// Model string reported by IDENTIFY DEVICE
pub const IDENT_MODEL: &str = "ggaoed";

/// What an ATA request asks the device to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaKind {
    Read,
    Write,
    Flush,
    Identify,
}

/// A classified ATA operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaOp {
    pub kind: AtaKind,
    pub lba: u64,
    /// Sector count; 0 in the register means 256
    pub count: u32,
}

/// Classify the ATA registers into an operation. Returns the raw command
/// byte on unknown commands.
pub fn classify(header: &AtaHeader) -> Result<AtaOp, u8> {
    let cmd = AtaCommand::try_from(header.cmd_status)?;

    let lba = if header.flags.extended {
        header.lba48()
    } else {
        header.lba28() as u64
    };
    let count = if header.sector_count == 0 {
        256
    } else {
        header.sector_count as u32
    };

    let op = if cmd.is_read() {
        AtaOp {
            kind: AtaKind::Read,
            lba,
            count,
        }
    } else if cmd.is_write() {
        AtaOp {
            kind: AtaKind::Write,
            lba,
            count,
        }
    } else if cmd.is_flush() {
        AtaOp {
            kind: AtaKind::Flush,
            lba: 0,
            count: 0,
        }
    } else {
        AtaOp {
            kind: AtaKind::Identify,
            lba: 0,
            count: 1,
        }
    };
    Ok(op)
}

/// Identity reported by IDENTIFY DEVICE
#[derive(Debug, Clone)]
pub struct DeviceIdent {
    /// Serial number (max 20 chars)
    pub serial: String,
    /// Firmware revision (max 8 chars)
    pub firmware: String,
    /// Total addressable sectors
    pub total_sectors: u64,
}

/// Build the 512-byte IDENTIFY DEVICE response block.
pub fn build_identify_data(ident: &DeviceIdent) -> Vec<u8> {
    let mut data = vec![0u8; SECTOR_SIZE];

    // Word 0: general configuration; bit 6 = fixed device
    data[1] = 0x00;

    // Words 10-19: serial number (20 ASCII chars, space-padded)
    let serial = format!("{:20}", &ident.serial[..ident.serial.len().min(20)]);
    copy_ata_string(&mut data[20..40], &serial);

    // Words 23-26: firmware revision (8 ASCII chars)
    let firmware = format!("{:8}", &ident.firmware[..ident.firmware.len().min(8)]);
    copy_ata_string(&mut data[46..54], &firmware);

    // Words 27-46: model number (40 ASCII chars)
    let model = format!("{:40}", IDENT_MODEL);
    copy_ata_string(&mut data[54..94], &model);

    // Word 47: max sectors per interrupt
    data[95] = 0x01;

    // Word 49: capabilities; LBA + DMA supported
    data[99] = 0x03;

    // Word 53: field validity; words 64-70 and 88 valid
    data[107] = 0x06;

    // Words 60-61: total addressable sectors (LBA28)
    let lba28_sectors = ident.total_sectors.min(0x0FFF_FFFF) as u32;
    data[120..124].copy_from_slice(&lba28_sectors.to_le_bytes());

    // Word 83: command set supported (2); bit 10 = LBA48
    data[167] = 0x04;

    // Word 86: command set enabled (2); bit 10 = LBA48
    data[173] = 0x04;

    // Words 100-103: total addressable sectors (LBA48)
    data[200..208].copy_from_slice(&ident.total_sectors.to_le_bytes());

    data
}

/// Copy a string to ATA format (byte-swapped ASCII within each word)
fn copy_ata_string(dest: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    for i in (0..dest.len()).step_by(2) {
        if i + 1 < bytes.len() {
            dest[i] = bytes[i + 1];
            dest[i + 1] = bytes[i];
        } else if i < bytes.len() {
            dest[i] = b' ';
            dest[i + 1] = bytes[i];
        } else {
            dest[i] = b' ';
            dest[i + 1] = b' ';
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_ata_string() {
        let mut dest = [0u8; 8];
        copy_ata_string(&mut dest, "TEST");

        // "TEST" becomes "ETTS" (byte-swapped pairs)
        assert_eq!(dest[0], b'E');
        assert_eq!(dest[1], b'T');
        assert_eq!(dest[2], b'T');
        assert_eq!(dest[3], b'S');
    }

    #[test]
    fn test_classify_read_lba48() {
        let header = AtaHeader {
            flags: AtaFlags {
                extended: true,
                ..Default::default()
            },
            err_feature: 0,
            sector_count: 8,
            cmd_status: 0x24,
            lba: 0x0001_0000_0000,
        };
        let op = classify(&header).unwrap();
        assert_eq!(op.kind, AtaKind::Read);
        assert_eq!(op.lba, 0x0001_0000_0000);
        assert_eq!(op.count, 8);
    }

    #[test]
    fn test_classify_lba28_masks_high_bits() {
        let header = AtaHeader {
            flags: AtaFlags::default(),
            err_feature: 0,
            sector_count: 0, // register 0 means 256 sectors
            cmd_status: 0x30,
            lba: 0xFFFF_FFFF_FFFF,
        };
        let op = classify(&header).unwrap();
        assert_eq!(op.kind, AtaKind::Write);
        assert_eq!(op.lba, 0x0FFF_FFFF);
        assert_eq!(op.count, 256);
    }

    #[test]
    fn test_classify_unknown_command() {
        let header = AtaHeader {
            flags: AtaFlags::default(),
            err_feature: 0,
            sector_count: 1,
            cmd_status: 0xA1, // IDENTIFY PACKET DEVICE, unsupported
            lba: 0,
        };
        assert_eq!(classify(&header), Err(0xA1));
    }

    #[test]
    fn test_identify_block() {
        let ident = DeviceIdent {
            serial: "1234567890".to_string(),
            firmware: "0.1.0".to_string(),
            total_sectors: 2097152, // 1 GiB
        };
        let data = build_identify_data(&ident);
        assert_eq!(data.len(), SECTOR_SIZE);

        // LBA48 sector count at words 100-103
        let sectors = u64::from_le_bytes(data[200..208].try_into().unwrap());
        assert_eq!(sectors, 2097152);

        // LBA48 support advertised in word 83 bit 10
        assert_eq!(data[167] & 0x04, 0x04);

        // Model string, un-swapped, reads "gg"
        assert_eq!(data[54], b'g');
        assert_eq!(data[55], b'g');
    }
}
