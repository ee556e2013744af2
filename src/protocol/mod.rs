//! AoE protocol handling
//!
//! Parsing and building of AoE frames, ATA command classification and the
//! protocol-level error type.

pub mod ata;
mod build;
mod parse;
mod types;

pub use ata::{build_identify_data, classify, AtaKind, AtaOp, DeviceIdent, IDENT_MODEL};
pub use build::{
    ata_reply, config_reply, encode_frame, error_reply, mask_reply, reserve_reply, ReplyCtx,
};
pub use parse::{parse_frame, ParseError};
pub use types::*;

use thiserror::Error;

/// AoE protocol errors
#[derive(Debug, Error)]
pub enum AoeError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("unrecognized command code: {0}")]
    UnrecognizedCommand(u8),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("device unavailable")]
    DeviceUnavailable,

    #[error("config string present")]
    ConfigStringPresent,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("target reserved")]
    TargetReserved,
}

impl AoeError {
    /// The AoE error byte carried in the response header
    pub fn to_error_code(&self) -> AoeErrorCode {
        match self {
            AoeError::Parse(err) => err.aoe_error(),
            AoeError::UnrecognizedCommand(_) => AoeErrorCode::BadCommand,
            AoeError::BadArgument(_) => AoeErrorCode::BadArgument,
            AoeError::DeviceUnavailable => AoeErrorCode::DeviceUnavailable,
            AoeError::ConfigStringPresent => AoeErrorCode::ConfigStringPresent,
            AoeError::UnsupportedVersion(_) => AoeErrorCode::UnsupportedVersion,
            AoeError::TargetReserved => AoeErrorCode::TargetReserved,
        }
    }
}
