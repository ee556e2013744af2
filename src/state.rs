//! Persisted per-device state
//!
//! Each exported device keeps its AoE config string, MAC mask list and
//! reservation list in one JSON file under the state directory. Files are
//! written atomically (temp file + rename) so a crash never leaves a
//! half-written state behind.

use crate::acl::{self, AclMap};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state file corrupt: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("state file corrupt: {0}")]
    Mac(#[from] acl::BadMacAddress),

    #[error("state file corrupt: {0}")]
    AclFull(#[from] acl::AclMapFull),
}

/// Runtime state of one device that survives restarts.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    /// AoE configuration string (≤ 1024 octets)
    pub config: Vec<u8>,
    /// Dynamic MAC mask list
    pub macmask: AclMap,
    /// Current reservation list
    pub reserve: AclMap,
}

/// On-disk representation: hex-encoded so the file stays greppable.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    config_string: String,
    mac_mask: Vec<String>,
    reserve: Vec<String>,
}

fn state_path(statedir: &Path, name: &str) -> PathBuf {
    statedir.join(format!("{name}.state"))
}

impl DeviceState {
    /// Load the state of a device; a missing file yields empty state.
    pub fn load(statedir: &Path, name: &str) -> Result<Self, StateError> {
        let path = state_path(statedir, name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(err) => return Err(err.into()),
        };

        let file: StateFile = serde_json::from_str(&content)?;
        let mut state = DeviceState {
            config: hex::decode(&file.config_string)?,
            ..Default::default()
        };
        for mac in &file.mac_mask {
            state.macmask.insert(&acl::parse_mac(mac)?)?;
        }
        for mac in &file.reserve {
            state.reserve.insert(&acl::parse_mac(mac)?)?;
        }
        Ok(state)
    }

    /// Write the state atomically.
    pub fn save(&self, statedir: &Path, name: &str) -> Result<(), StateError> {
        let file = StateFile {
            config_string: hex::encode(&self.config),
            mac_mask: self.macmask.iter().map(|mac| acl::format_mac(&mac)).collect(),
            reserve: self.reserve.iter().map(|mac| acl::format_mac(&mac)).collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let path = state_path(statedir, name);
        let tmp = statedir.join(format!(".{name}.state.tmp"));
        {
            let mut out = File::create(&tmp)?;
            out.write_all(content.as_bytes())?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove the state file (clear-config on an unconfigured device keeps
    /// nothing behind).
    pub fn remove(statedir: &Path, name: &str) -> Result<(), StateError> {
        match std::fs::remove_file(state_path(statedir, name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = TempDir::new().unwrap();
        let state = DeviceState::load(dir.path(), "disk0").unwrap();
        assert!(state.config.is_empty());
        assert!(state.macmask.is_empty());
        assert!(state.reserve.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();

        let mut state = DeviceState {
            config: b"owner=backup-pool".to_vec(),
            ..Default::default()
        };
        state.macmask.insert(&[1, 2, 3, 4, 5, 6]).unwrap();
        state.reserve.insert(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]).unwrap();
        state.save(dir.path(), "disk0").unwrap();

        let loaded = DeviceState::load(dir.path(), "disk0").unwrap();
        assert_eq!(loaded.config, state.config);
        assert!(loaded.macmask.contains(&[1, 2, 3, 4, 5, 6]));
        assert!(loaded.reserve.contains(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
    }

    #[test]
    fn test_save_replaces_previous_content() {
        let dir = TempDir::new().unwrap();

        let mut state = DeviceState {
            config: b"first".to_vec(),
            ..Default::default()
        };
        state.save(dir.path(), "disk0").unwrap();

        state.config = b"second".to_vec();
        state.save(dir.path(), "disk0").unwrap();

        let loaded = DeviceState::load(dir.path(), "disk0").unwrap();
        assert_eq!(loaded.config, b"second");
        // No temp file left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("disk0.state"), "not json at all").unwrap();
        assert!(matches!(
            DeviceState::load(dir.path(), "disk0"),
            Err(StateError::Json(_))
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        DeviceState::remove(dir.path(), "disk0").unwrap();
        let state = DeviceState::default();
        state.save(dir.path(), "disk0").unwrap();
        DeviceState::remove(dir.path(), "disk0").unwrap();
        DeviceState::remove(dir.path(), "disk0").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
