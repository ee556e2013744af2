//! Configuration file parsing
//!
//! The configuration is INI-style: a `defaults` group for globals, an `acls`
//! group naming reusable MAC lists, any group with a `shelf` key describes an
//! exported device, and every other group is a per-interface override. The
//! file is parsed with the `toml` crate and walked group by group so that
//! unknown keys fail loudly instead of being dropped.

use crate::acl::{self, AclMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound for per-device queue length
pub const MAX_QUEUE_LEN: usize = 256;

/// Default per-device queue length
pub const DEF_QUEUE_LEN: usize = 64;

/// Default ring buffer size in KiB
pub const DEF_RING_SIZE_KB: usize = 1024;

/// Length of a virtual device WWN in octets
pub const WWN_ALEN: usize = 8;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Host database consulted for symbolic ACL entries
const ETHERS_PATH: &str = "/etc/ethers";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}: invalid configuration: {1}")]
    Invalid(String, String),
}

fn invalid(section: &str, what: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(section.to_string(), what.into())
}

/// A list of glob patterns (`*` and `?`); an absent list matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternList {
    patterns: Vec<String>,
}

impl PatternList {
    pub fn new(patterns: Vec<String>) -> Option<Self> {
        if patterns.is_empty() {
            None
        } else {
            Some(Self { patterns })
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, text))
    }
}

/// Match a shell-style glob pattern supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat = pattern.as_bytes();
    let txt = text.as_bytes();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

/// True when the name matches the pattern list (or the list is absent).
pub fn match_patternlist(list: &Option<PatternList>, name: &str) -> bool {
    match list {
        None => true,
        Some(patterns) => patterns.matches(name),
    }
}

/// Global defaults from the `defaults` group
#[derive(Debug, Clone, PartialEq)]
pub struct Defaults {
    pub queue_length: usize,
    pub direct_io: bool,
    pub trace_io: bool,
    pub pid_file: PathBuf,
    pub ctl_socket: PathBuf,
    pub statedir: PathBuf,
    /// 0 means "use the interface MTU"
    pub mtu: usize,
    pub ring_size_kb: usize,
    pub send_buf_size: usize,
    pub recv_buf_size: usize,
    pub max_delay_ns: u64,
    pub merge_delay_ns: u64,
    pub interfaces: Option<PatternList>,
    pub tx_ring_bug: bool,
    pub placement_map: Option<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            queue_length: DEF_QUEUE_LEN,
            direct_io: true,
            trace_io: false,
            pid_file: PathBuf::from("/var/run/ggaoed.pid"),
            ctl_socket: PathBuf::from("/var/run/ggaoed.ctl"),
            statedir: PathBuf::from("/var/lib/ggaoed"),
            mtu: 0,
            ring_size_kb: DEF_RING_SIZE_KB,
            send_buf_size: 0,
            recv_buf_size: 0,
            max_delay_ns: (0.001 * NSEC_PER_SEC as f64) as u64,
            merge_delay_ns: 0,
            interfaces: None,
            tx_ring_bug: false,
            placement_map: None,
        }
    }
}

/// Backing kind of an exported device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Physical,
    Virtual,
}

/// One exported device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Group name; doubles as the state-file stem and control-plane name
    pub name: String,
    pub shelf: u16,
    pub slot: u8,
    pub dev_type: DeviceType,
    /// Backing path (physical devices)
    pub path: Option<PathBuf>,
    /// Filesystem UUID, resolved through /dev/disk/by-uuid at open time
    pub uuid: Option<String>,
    /// Virtual capacity in MiB
    pub capacity_mib: u64,
    /// World-wide name of a virtual device
    pub wwn: [u8; WWN_ALEN],
    /// Placement rule consulted by a virtual device
    pub dppolicy: Option<String>,
    pub queue_length: usize,
    pub direct_io: bool,
    pub trace_io: bool,
    pub broadcast: bool,
    pub read_only: bool,
    pub max_delay_ns: u64,
    pub merge_delay_ns: u64,
    pub iface_patterns: Option<PatternList>,
    pub accept: Option<AclMap>,
    pub deny: Option<AclMap>,
}

/// Per-interface overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetifConfig {
    pub mtu: usize,
    pub ring_size_kb: usize,
    pub send_buf_size: usize,
    pub recv_buf_size: usize,
}

/// Declarative binding between an external shelf/slot and upstream MACs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMacs {
    pub shelf: u16,
    pub slot: u8,
    pub device_id: u32,
    pub macs: Vec<[u8; 6]>,
}

/// A parsed and validated configuration snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub defaults: Defaults,
    pub acls: Vec<(String, AclMap)>,
    pub devices: Vec<DeviceConfig>,
    pub netifs: HashMap<String, NetifConfig>,
    pub device_macs: Vec<DeviceMacs>,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = content.parse()?;

        let defaults_group = table.get("defaults").and_then(|v| v.as_table());
        let defaults = parse_defaults(defaults_group)?;
        let device_macs = match defaults_group {
            Some(group) => parse_device_macs(group)?,
            None => Vec::new(),
        };

        let acls = match table.get("acls").and_then(|v| v.as_table()) {
            Some(group) => parse_acls(group)?,
            None => Vec::new(),
        };

        let mut devices = Vec::new();
        let mut netifs = HashMap::new();
        for (name, value) in &table {
            if name == "defaults" || name == "acls" {
                continue;
            }
            let group = value
                .as_table()
                .ok_or_else(|| invalid(name, "expected a group"))?;
            if group.contains_key("shelf") {
                devices.push(parse_device(name, group, &defaults, &acls)?);
            } else {
                netifs.insert(name.clone(), parse_netif(name, group, &defaults)?);
            }
        }

        let config = Config {
            defaults,
            acls,
            devices,
            netifs,
            device_macs,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for dev in &self.devices {
            if !seen.insert((dev.shelf, dev.slot)) {
                return Err(invalid(
                    &dev.name,
                    format!("duplicate device address e{}.{}", dev.shelf, dev.slot),
                ));
            }
        }
        Ok(())
    }

    /// Effective settings for an interface, override or defaults.
    pub fn netif_config(&self, name: &str) -> NetifConfig {
        self.netifs.get(name).copied().unwrap_or(NetifConfig {
            mtu: self.defaults.mtu,
            ring_size_kb: self.defaults.ring_size_kb,
            send_buf_size: self.defaults.send_buf_size,
            recv_buf_size: self.defaults.recv_buf_size,
        })
    }

    /// Device lookup by group name.
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|dev| dev.name == name)
    }
}

fn queue_length_valid(len: usize) -> bool {
    (1..=MAX_QUEUE_LEN).contains(&len)
}

fn get_bool(group: &toml::Table, section: &str, key: &str, def: bool) -> Result<bool, ConfigError> {
    match group.get(key) {
        None => Ok(def),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| invalid(section, format!("'{key}' must be a boolean"))),
    }
}

fn get_int(group: &toml::Table, section: &str, key: &str, def: i64) -> Result<i64, ConfigError> {
    match group.get(key) {
        None => Ok(def),
        Some(value) => value
            .as_integer()
            .ok_or_else(|| invalid(section, format!("'{key}' must be an integer"))),
    }
}

fn get_str(group: &toml::Table, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
    match group.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| invalid(section, format!("'{key}' must be a string"))),
    }
}

fn get_str_list(group: &toml::Table, section: &str, key: &str) -> Result<Vec<String>, ConfigError> {
    match group.get(key) {
        None => Ok(Vec::new()),
        Some(value) => {
            let array = value
                .as_array()
                .ok_or_else(|| invalid(section, format!("'{key}' must be a list")))?;
            array
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(|s| s.trim().to_string())
                        .ok_or_else(|| invalid(section, format!("'{key}' must list strings")))
                })
                .collect()
        }
    }
}

/// Delays are configured in seconds and must stay in [0, 1).
fn get_delay(
    group: &toml::Table,
    section: &str,
    key: &str,
    def_ns: u64,
) -> Result<u64, ConfigError> {
    let seconds = match group.get(key) {
        None => return Ok(def_ns),
        Some(value) => value
            .as_float()
            .or_else(|| value.as_integer().map(|n| n as f64))
            .ok_or_else(|| invalid(section, format!("'{key}' must be a number")))?,
    };
    if !(0.0..1.0).contains(&seconds) {
        return Err(invalid(section, format!("'{key}' must be in [0, 1)")));
    }
    Ok((seconds * NSEC_PER_SEC as f64) as u64)
}

fn parse_defaults(group: Option<&toml::Table>) -> Result<Defaults, ConfigError> {
    let mut defaults = Defaults::default();
    let group = match group {
        Some(group) => group,
        None => return Ok(defaults),
    };
    let section = "defaults";

    let queue_length = get_int(group, section, "queue-length", defaults.queue_length as i64)?;
    if !queue_length_valid(queue_length.max(0) as usize) {
        return Err(invalid(section, "invalid queue length"));
    }
    defaults.queue_length = queue_length as usize;

    defaults.direct_io = get_bool(group, section, "direct-io", defaults.direct_io)?;
    defaults.trace_io = get_bool(group, section, "trace-io", defaults.trace_io)?;

    if let Some(path) = get_str(group, section, "pid-file")? {
        defaults.pid_file = PathBuf::from(path);
    }
    if let Some(path) = get_str(group, section, "control-socket")? {
        defaults.ctl_socket = PathBuf::from(path);
    }
    if let Some(path) = get_str(group, section, "state-directory")? {
        defaults.statedir = PathBuf::from(path);
    }
    if let Some(path) = get_str(group, section, "placement-map")? {
        defaults.placement_map = Some(PathBuf::from(path));
    }

    let mtu = get_int(group, section, "mtu", 0)?;
    if mtu != 0 && mtu < min_mtu() as i64 {
        return Err(invalid(section, "requested MTU is too small"));
    }
    defaults.mtu = mtu.max(0) as usize;

    let ring = get_int(group, section, "ring-buffer-size", DEF_RING_SIZE_KB as i64)?;
    if ring < 0 {
        return Err(invalid(section, "requested ring buffer size is invalid"));
    }
    defaults.ring_size_kb = ring as usize;

    let send_buf = get_int(group, section, "send-buffer-size", 0)?;
    if send_buf < 0 {
        return Err(invalid(section, "requested send buffer size is invalid"));
    }
    defaults.send_buf_size = send_buf as usize;

    let recv_buf = get_int(group, section, "receive-buffer-size", 0)?;
    if recv_buf < 0 {
        return Err(invalid(section, "requested receive buffer size is invalid"));
    }
    defaults.recv_buf_size = recv_buf as usize;

    defaults.tx_ring_bug = get_bool(group, section, "tx-ring-bug", false)?;
    defaults.max_delay_ns = get_delay(group, section, "max-delay", defaults.max_delay_ns)?;
    defaults.merge_delay_ns = get_delay(group, section, "merge-delay", defaults.merge_delay_ns)?;

    defaults.interfaces = PatternList::new(get_str_list(group, section, "interfaces")?);

    Ok(defaults)
}

/// Smallest usable MTU: room for 1024 bytes of config string plus headers.
pub fn min_mtu() -> usize {
    1024 + crate::protocol::AoeHeader::SIZE - 14 + crate::protocol::ConfigHeader::MIN_SIZE
}

fn parse_acls(group: &toml::Table) -> Result<Vec<(String, AclMap)>, ConfigError> {
    // Collect the raw entry lists first; an ACL may reference another ACL
    // regardless of where either appears in the file.
    let mut pending: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in group {
        let values = value
            .as_array()
            .ok_or_else(|| invalid(name, "ACL must be a list"))?;
        let mut entries = Vec::new();
        for item in values {
            entries.push(
                item.as_str()
                    .ok_or_else(|| invalid(name, "ACL entries must be strings"))?
                    .trim()
                    .to_string(),
            );
        }
        pending.push((name.clone(), entries));
    }
    let all_names: Vec<String> = pending.iter().map(|(name, _)| name.clone()).collect();

    // Resolve to a fixed point: each pass resolves every ACL whose
    // references are all resolved already. A pass without progress means a
    // reference cycle.
    let mut acls: Vec<(String, AclMap)> = Vec::new();
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for (name, entries) in pending {
            let ready = entries.iter().all(|entry| {
                acl::parse_mac(entry).is_ok()
                    || !all_names.contains(entry)
                    || acls.iter().any(|(resolved, _)| resolved == entry)
            });
            if ready {
                let map = resolve_acl_values(&entries, &acls, &name)?;
                acls.push((name, map));
            } else {
                deferred.push((name, entries));
            }
        }
        if deferred.len() == before {
            let (name, _) = &deferred[0];
            return Err(invalid(name, "circular ACL reference"));
        }
        pending = deferred;
    }
    Ok(acls)
}

/// Resolve a list of ACL elements: literal MAC addresses, references to
/// already-defined ACLs, or names from /etc/ethers.
fn resolve_acl_values(
    values: &[String],
    defined: &[(String, AclMap)],
    section: &str,
) -> Result<AclMap, ConfigError> {
    let mut map = AclMap::new();
    for value in values {
        if let Ok(mac) = acl::parse_mac(value) {
            map.insert(&mac)
                .map_err(|_| invalid(section, "ACL table full"))?;
            continue;
        }
        if let Some((_, reference)) = defined.iter().find(|(name, _)| name == value) {
            map.extend_from(reference)
                .map_err(|_| invalid(section, "ACL table full"))?;
            continue;
        }
        if let Some(mac) = ethers_lookup(value) {
            map.insert(&mac)
                .map_err(|_| invalid(section, "ACL table full"))?;
            continue;
        }
        return Err(invalid(
            section,
            format!("failed to parse ACL element '{value}'"),
        ));
    }
    Ok(map)
}

/// Look up a host name in /etc/ethers (`MAC hostname` lines).
fn ethers_lookup(name: &str) -> Option<[u8; 6]> {
    let content = std::fs::read_to_string(ETHERS_PATH).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let mac = fields.next()?;
        if fields.next() == Some(name) {
            if let Ok(mac) = acl::parse_mac(mac) {
                return Some(mac);
            }
        }
    }
    None
}

fn parse_device(
    name: &str,
    group: &toml::Table,
    defaults: &Defaults,
    acls: &[(String, AclMap)],
) -> Result<DeviceConfig, ConfigError> {
    let direct_io = get_bool(group, name, "direct-io", defaults.direct_io)?;
    let trace_io = get_bool(group, name, "trace-io", defaults.trace_io)?;
    let broadcast = get_bool(group, name, "broadcast", false)?;
    let read_only = get_bool(group, name, "read-only", false)?;

    let dev_type = match get_str(group, name, "type")?.as_deref() {
        None | Some("physical") => DeviceType::Physical,
        Some("virtual") => DeviceType::Virtual,
        Some(other) => {
            return Err(invalid(name, format!("unknown device type '{other}'")));
        }
    };

    let mut capacity_mib = 0u64;
    let mut wwn = [0u8; WWN_ALEN];
    let mut dppolicy = None;
    if dev_type == DeviceType::Virtual {
        let capacity = get_int(group, name, "capacity", 10)?;
        if !(1..100_000).contains(&capacity) {
            return Err(invalid(
                name,
                "invalid virtual device capacity (must be in 1 - 100000 MiB)",
            ));
        }
        capacity_mib = capacity as u64;

        let wwn_str = get_str(group, name, "wwn")?
            .ok_or_else(|| invalid(name, "virtual devices need a 'wwn'"))?;
        wwn = parse_wwn(&wwn_str).ok_or_else(|| invalid(name, "bad wwn"))?;

        dppolicy = get_str(group, name, "dppolicy")?;
    }

    let queue_length = get_int(group, name, "queue-length", defaults.queue_length as i64)?;
    if !queue_length_valid(queue_length.max(0) as usize) {
        return Err(invalid(name, "invalid queue length"));
    }

    let shelf = get_int(group, name, "shelf", -1)?;
    if !(0..crate::protocol::SHELF_MAX as i64).contains(&shelf) {
        return Err(invalid(name, "missing or invalid shelf number"));
    }
    let slot = get_int(group, name, "slot", -1)?;
    if !(0..crate::protocol::SLOT_MAX as i64).contains(&slot) {
        return Err(invalid(name, "missing or invalid slot number"));
    }

    let max_delay_ns = get_delay(group, name, "max-delay", defaults.max_delay_ns)?;
    let merge_delay_ns = get_delay(group, name, "merge-delay", defaults.merge_delay_ns)?;

    let uuid = get_str(group, name, "uuid")?;
    let path = get_str(group, name, "path")?.map(PathBuf::from);
    match dev_type {
        DeviceType::Physical => {
            if uuid.is_some() && path.is_some() {
                return Err(invalid(name, "only one of 'path' and 'uuid' may be given"));
            }
            if uuid.is_none() && path.is_none() {
                return Err(invalid(name, "missing 'path' or 'uuid'"));
            }
        }
        DeviceType::Virtual => {
            if uuid.is_some() || path.is_some() {
                return Err(invalid(name, "virtual devices take no 'path' or 'uuid'"));
            }
        }
    }

    let iface_patterns = PatternList::new(get_str_list(group, name, "interfaces")?);

    let accept_list = get_str_list(group, name, "accept")?;
    let accept = if accept_list.is_empty() {
        None
    } else {
        Some(resolve_acl_values(&accept_list, acls, name)?)
    };
    let deny_list = get_str_list(group, name, "deny")?;
    let deny = if deny_list.is_empty() {
        None
    } else {
        Some(resolve_acl_values(&deny_list, acls, name)?)
    };

    Ok(DeviceConfig {
        name: name.to_string(),
        shelf: shelf as u16,
        slot: slot as u8,
        dev_type,
        path,
        uuid,
        capacity_mib,
        wwn,
        dppolicy,
        queue_length: queue_length as usize,
        direct_io,
        trace_io,
        broadcast,
        read_only,
        max_delay_ns,
        merge_delay_ns,
        iface_patterns,
        accept,
        deny,
    })
}

fn parse_netif(
    name: &str,
    group: &toml::Table,
    defaults: &Defaults,
) -> Result<NetifConfig, ConfigError> {
    let mtu = get_int(group, name, "mtu", defaults.mtu as i64)?;
    if mtu != 0 && mtu < min_mtu() as i64 {
        return Err(invalid(name, "requested MTU is too small"));
    }
    let ring = get_int(group, name, "ring-buffer-size", defaults.ring_size_kb as i64)?;
    if ring < 0 {
        return Err(invalid(name, "requested ring buffer size is invalid"));
    }
    let send_buf = get_int(group, name, "send-buffer-size", defaults.send_buf_size as i64)?;
    if send_buf < 0 {
        return Err(invalid(name, "requested send buffer size is invalid"));
    }
    let recv_buf = get_int(
        group,
        name,
        "receive-buffer-size",
        defaults.recv_buf_size as i64,
    )?;
    if recv_buf < 0 {
        return Err(invalid(name, "requested receive buffer size is invalid"));
    }
    Ok(NetifConfig {
        mtu: mtu.max(0) as usize,
        ring_size_kb: ring as usize,
        send_buf_size: send_buf as usize,
        recv_buf_size: recv_buf as usize,
    })
}

/// Parse a dotted-numeric WWN: exactly [`WWN_ALEN`] octets.
pub fn parse_wwn(s: &str) -> Option<[u8; WWN_ALEN]> {
    let mut wwn = [0u8; WWN_ALEN];
    let mut count = 0;
    for part in s.split('.') {
        if count >= WWN_ALEN || part.is_empty() {
            return None;
        }
        wwn[count] = part.parse::<u8>().ok()?;
        count += 1;
    }
    if count == WWN_ALEN {
        Some(wwn)
    } else {
        None
    }
}

/// Parse `device-macs` entries: `eSHELF.SLOT:ID mac [mac...]`.
fn parse_device_macs(group: &toml::Table) -> Result<Vec<DeviceMacs>, ConfigError> {
    let section = "defaults";
    let entries = get_str_list(group, section, "device-macs")?;
    let mut bindings = Vec::with_capacity(entries.len());
    for entry in &entries {
        bindings.push(
            parse_device_macs_entry(entry)
                .ok_or_else(|| invalid(section, format!("bad device-macs entry '{entry}'")))?,
        );
    }
    Ok(bindings)
}

fn parse_device_macs_entry(entry: &str) -> Option<DeviceMacs> {
    let entry = entry.trim();
    let rest = entry.strip_prefix('e')?;

    let (addr, rest) = rest.split_once(':')?;
    let (shelf, slot) = addr.split_once('.')?;
    let shelf: u16 = shelf.parse().ok()?;
    let slot: u8 = slot.parse().ok()?;
    if shelf >= crate::protocol::SHELF_MAX || slot >= crate::protocol::SLOT_MAX {
        return None;
    }

    let mut fields = rest.split_whitespace();
    let device_id: u32 = fields.next()?.parse().ok()?;

    let mut macs = Vec::new();
    for field in fields {
        macs.push(acl::parse_mac(field).ok()?);
    }
    if macs.is_empty() {
        return None;
    }

    Some(DeviceMacs {
        shelf,
        slot,
        device_id,
        macs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("eth*", "eth0"));
        assert!(glob_match("eth*", "eth"));
        assert!(glob_match("eth?", "eth1"));
        assert!(!glob_match("eth?", "eth"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("e*0", "enp3s0"));
        assert!(!glob_match("eth*", "wlan0"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::parse(
            r#"
[defaults]
interfaces = ["eth*"]

[disk0]
shelf = 1
slot = 0
path = "/dev/sdb"
"#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 1);
        let dev = &config.devices[0];
        assert_eq!(dev.name, "disk0");
        assert_eq!(dev.shelf, 1);
        assert_eq!(dev.slot, 0);
        assert_eq!(dev.dev_type, DeviceType::Physical);
        assert_eq!(dev.queue_length, DEF_QUEUE_LEN);
        assert!(dev.direct_io);
        assert!(config.defaults.interfaces.as_ref().unwrap().matches("eth2"));
    }

    #[test]
    fn test_parse_device_overrides() {
        let config = Config::parse(
            r#"
[defaults]
queue-length = 32
direct-io = false
max-delay = 0.01

[disk0]
shelf = 2
slot = 3
path = "/data/disk.img"
queue-length = 4
read-only = true
broadcast = true
merge-delay = 0.002
interfaces = ["eth0"]
"#,
        )
        .unwrap();

        let dev = &config.devices[0];
        assert_eq!(dev.queue_length, 4);
        assert!(!dev.direct_io);
        assert!(dev.read_only);
        assert!(dev.broadcast);
        assert_eq!(dev.max_delay_ns, 10_000_000);
        assert_eq!(dev.merge_delay_ns, 2_000_000);
        assert!(match_patternlist(&dev.iface_patterns, "eth0"));
        assert!(!match_patternlist(&dev.iface_patterns, "eth1"));
    }

    #[test]
    fn test_parse_virtual_device() {
        let config = Config::parse(
            r#"
[vdisk]
shelf = 10
slot = 1
type = "virtual"
capacity = 100
wwn = "1.2.3.4.5.6.7.8"
dppolicy = "replicated"
"#,
        )
        .unwrap();

        let dev = &config.devices[0];
        assert_eq!(dev.dev_type, DeviceType::Virtual);
        assert_eq!(dev.capacity_mib, 100);
        assert_eq!(dev.wwn, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(dev.dppolicy.as_deref(), Some("replicated"));
    }

    #[test]
    fn test_virtual_device_requires_wwn() {
        let result = Config::parse(
            r#"
[vdisk]
shelf = 10
slot = 1
type = "virtual"
capacity = 100
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn test_acl_references() {
        let config = Config::parse(
            r#"
[acls]
admins = ["aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02"]
all = ["admins", "aa:bb:cc:00:00:03"]

[disk0]
shelf = 1
slot = 0
path = "/dev/sdb"
accept = ["all"]
deny = ["aa:bb:cc:00:00:02"]
"#,
        )
        .unwrap();

        let dev = &config.devices[0];
        let accept = dev.accept.as_ref().unwrap();
        assert_eq!(accept.len(), 3);
        assert!(accept.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 1]));
        assert!(accept.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 3]));
        assert!(dev.deny.as_ref().unwrap().contains(&[0xaa, 0xbb, 0xcc, 0, 0, 2]));
    }

    #[test]
    fn test_acl_forward_reference() {
        // "alpha" sorts before "zulu", so resolution cannot lean on table
        // iteration order.
        let config = Config::parse(
            r#"
[acls]
alpha = ["zulu", "aa:bb:cc:00:00:09"]
zulu = ["aa:bb:cc:00:00:01", "aa:bb:cc:00:00:02"]
"#,
        )
        .unwrap();

        let (_, alpha) = config.acls.iter().find(|(name, _)| name == "alpha").unwrap();
        assert_eq!(alpha.len(), 3);
        assert!(alpha.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 1]));
        assert!(alpha.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 2]));
        assert!(alpha.contains(&[0xaa, 0xbb, 0xcc, 0, 0, 9]));
    }

    #[test]
    fn test_acl_reference_cycle_fails() {
        let result = Config::parse(
            r#"
[acls]
a = ["b"]
b = ["a"]
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));

        let result = Config::parse(
            r#"
[acls]
selfref = ["selfref"]
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn test_unknown_acl_reference_fails() {
        let result = Config::parse(
            r#"
[disk0]
shelf = 1
slot = 0
path = "/dev/sdb"
accept = ["no-such-acl-or-host"]
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn test_duplicate_address_fails() {
        let result = Config::parse(
            r#"
[disk0]
shelf = 1
slot = 0
path = "/dev/sdb"

[disk1]
shelf = 1
slot = 0
path = "/dev/sdc"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn test_invalid_delay_fails() {
        let result = Config::parse(
            r#"
[disk0]
shelf = 1
slot = 0
path = "/dev/sdb"
max-delay = 1.5
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn test_netif_override_group() {
        let config = Config::parse(
            r#"
[defaults]
ring-buffer-size = 512

[eth0]
mtu = 9000
ring-buffer-size = 2048

[disk0]
shelf = 1
slot = 0
path = "/dev/sdb"
"#,
        )
        .unwrap();

        let eth0 = config.netif_config("eth0");
        assert_eq!(eth0.mtu, 9000);
        assert_eq!(eth0.ring_size_kb, 2048);

        // Unlisted interfaces inherit the defaults
        let eth1 = config.netif_config("eth1");
        assert_eq!(eth1.mtu, 0);
        assert_eq!(eth1.ring_size_kb, 512);
    }

    #[test]
    fn test_parse_wwn() {
        assert_eq!(parse_wwn("1.2.3.4.5.6.7.8"), Some([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(parse_wwn("0.0.0.0.0.0.0.255"), Some([0, 0, 0, 0, 0, 0, 0, 255]));
        assert_eq!(parse_wwn("1.2.3.4.5.6.7"), None);
        assert_eq!(parse_wwn("1.2.3.4.5.6.7.8.9"), None);
        assert_eq!(parse_wwn("1.2.3.4.5.6.7.256"), None);
        assert_eq!(parse_wwn("1..3.4.5.6.7.8"), None);
        assert_eq!(parse_wwn(""), None);
    }

    #[test]
    fn test_parse_device_macs() {
        let config = Config::parse(
            r#"
[defaults]
device-macs = ["e1.0:5 00:11:22:33:44:55 66:77:88:99:aa:bb", "e2.1:7 0a:0b:0c:0d:0e:0f"]
"#,
        )
        .unwrap();

        assert_eq!(config.device_macs.len(), 2);
        let first = &config.device_macs[0];
        assert_eq!((first.shelf, first.slot, first.device_id), (1, 0, 5));
        assert_eq!(first.macs.len(), 2);
        assert_eq!(first.macs[1], [0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);

        assert!(Config::parse(
            r#"
[defaults]
device-macs = ["e1.0:5"]
"#
        )
        .is_err());
        assert!(Config::parse(
            r#"
[defaults]
device-macs = ["1.0:5 00:11:22:33:44:55"]
"#
        )
        .is_err());
    }

    #[test]
    fn test_syntax_error_reported_as_parse() {
        let result = Config::parse("[defaults\nqueue-length = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
