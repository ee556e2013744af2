//! Server lifecycle
//!
//! One [`Server`] owns every interface, device, the placement map, the
//! control socket and the event loop. Startup wires the subsystems in
//! order; reload diffs the old and new configuration and only touches
//! entities that changed; teardown drains and releases in reverse order.

pub mod ctl;
pub mod device;
pub mod event;
pub mod netif;
pub mod netmon;
pub mod queue;

use crate::config::{match_patternlist, Config, ConfigError};
use crate::ctl::{CtlReply, CtlRequest};
use crate::placement::PlacementMap;
use crate::protocol::{self, parse_frame, AoeCommand, AoeError, AoeHeader, ReplyCtx};
use ctl::CtlServer;
use device::{Device, DeviceError, Reply};
use event::{Poller, ShutdownToken, Timer, Token};
use netif::{Netif, NetifError};
use netmon::Netmon;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Idle bound for one event-loop tick (milliseconds).
const WAIT_TIMEOUT_MS: i32 = 10_000;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("interface: {0}")]
    Netif(#[from] NetifError),

    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error("placement map: {0}")]
    Map(#[from] crate::placement::MapError),

    #[error("state directory {0} does not exist or is not writable")]
    BadStateDir(PathBuf),
}

/// Why the event loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Exit,
    Reload,
}

pub struct Server {
    config: Config,
    map: Arc<PlacementMap>,
    netifs: Vec<Netif>,
    devices: Vec<Device>,
    /// (shelf, slot) to device index
    dev_index: HashMap<(u16, u8), usize>,
    poller: Poller,
    timer: Timer,
    netmon: Netmon,
    ctl: CtlServer,
    token: ShutdownToken,
    started: Instant,
}

impl Server {
    /// Initialize every subsystem. Order matters: event loop, netlink
    /// monitor, interfaces, devices, control plane.
    pub fn new(config: Config, token: ShutdownToken) -> Result<Self, ServerError> {
        let statedir = &config.defaults.statedir;
        if !statedir.is_dir() || !dir_writable(statedir) {
            return Err(ServerError::BadStateDir(statedir.clone()));
        }

        let map = Arc::new(match &config.defaults.placement_map {
            Some(path) => PlacementMap::load(path)?,
            None => PlacementMap::identity(),
        });

        let poller = Poller::new()?;
        let timer = Timer::new()?;
        poller.add(timer.as_raw_fd(), Token::Timer)?;

        let netmon = Netmon::open()?;
        poller.add(netmon.as_raw_fd(), Token::Netmon)?;

        let ctl = CtlServer::bind(&config.defaults.ctl_socket)?;
        poller.add(ctl.as_raw_fd(), Token::Ctl)?;

        let mut server = Self {
            config,
            map,
            netifs: Vec::new(),
            devices: Vec::new(),
            dev_index: HashMap::new(),
            poller,
            timer,
            netmon,
            ctl,
            token,
            started: Instant::now(),
        };
        server.setup_ifaces();
        server.setup_devices();
        server.bind_topology();
        Ok(server)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn netif_count(&self) -> usize {
        self.netifs.len()
    }

    /// Present Ethernet devices that match the configured pattern list.
    fn wanted_interfaces(&self) -> Vec<(String, u32, [u8; 6])> {
        pnet_datalink::interfaces()
            .into_iter()
            .filter(|iface| {
                iface.is_up()
                    && !iface.is_loopback()
                    && iface.mac.is_some()
                    && match_patternlist(&self.config.defaults.interfaces, &iface.name)
            })
            .filter_map(|iface| {
                iface
                    .mac
                    .map(|mac| (iface.name.clone(), iface.index, mac.octets()))
            })
            .collect()
    }

    /// Diff the present interfaces against the running set.
    fn setup_ifaces(&mut self) {
        let wanted = self.wanted_interfaces();

        // Drop interfaces that vanished or no longer match
        let before = self.netifs.len();
        self.netifs
            .retain(|netif| wanted.iter().any(|(name, _, _)| *name == netif.name));
        if self.netifs.len() != before {
            log::info!("{} interface(s) removed", before - self.netifs.len());
        }

        // Open the new ones
        for (name, index, mac) in wanted {
            if self.netifs.iter().any(|netif| netif.name == name) {
                continue;
            }
            let cfg = self.config.netif_config(&name);
            match Netif::open(&name, index, mac, &cfg, self.config.defaults.tx_ring_bug) {
                Ok(netif) => self.netifs.push(netif),
                Err(err) => log::error!("{name}: disabled: {err}"),
            }
        }
    }

    /// Diff the configured devices against the running set. Unchanged
    /// devices keep their queue and counters.
    fn setup_devices(&mut self) {
        let mut kept = Vec::new();
        for device in self.devices.drain(..) {
            match self.config.device(device.name()) {
                Some(cfg) if *cfg == device.cfg => kept.push(device),
                _ => {
                    log::info!("{}: removed", device.name());
                    let mut device = device;
                    device.shutdown();
                }
            }
        }
        self.devices = kept;

        let wanted: Vec<_> = self
            .config
            .devices
            .iter()
            .filter(|cfg| !self.devices.iter().any(|dev| dev.name() == cfg.name))
            .cloned()
            .collect();
        for cfg in wanted {
            match Device::open(
                cfg,
                self.config.defaults.statedir.clone(),
                Arc::clone(&self.map),
            ) {
                Ok(device) => self.devices.push(device),
                Err(err) => log::error!("device disabled: {err}"),
            }
        }
    }

    /// Rebuild the device/interface attachment lists.
    fn attach(&mut self) {
        for device in &mut self.devices {
            device.attached.clear();
        }
        for netif in &mut self.netifs {
            netif.attached.clear();
        }
        for (dev_idx, device) in self.devices.iter_mut().enumerate() {
            for (if_idx, netif) in self.netifs.iter_mut().enumerate() {
                if match_patternlist(&device.cfg.iface_patterns, &netif.name) {
                    device.attached.push(if_idx);
                    netif.attached.push(dev_idx);
                }
            }
        }
    }

    /// Recompute interface/device attachment and poller registration after
    /// any topology change. Interfaces no exported device can use are
    /// released.
    fn bind_topology(&mut self) {
        self.attach();

        // An interface with no attached device has nothing to serve
        if self.netifs.iter().any(|netif| netif.attached.is_empty()) {
            for netif in &self.netifs {
                if netif.attached.is_empty() {
                    log::info!("{}: no exported device, releasing", netif.name);
                }
            }
            self.netifs.retain(|netif| !netif.attached.is_empty());
            // Indices shifted
            self.attach();
        }

        self.dev_index = self
            .devices
            .iter()
            .enumerate()
            .map(|(idx, device)| ((device.cfg.shelf, device.cfg.slot), idx))
            .collect();

        // Re-register the data-plane descriptors under their new indices
        for (idx, netif) in self.netifs.iter().enumerate() {
            let _ = self.poller.delete(netif.as_raw_fd());
            if let Err(err) = self.poller.add(netif.as_raw_fd(), Token::Netif(idx as u32)) {
                log::error!("{}: cannot watch socket: {}", netif.name, err);
            }
        }
        for (idx, device) in self.devices.iter().enumerate() {
            let _ = self.poller.delete(device.event_raw_fd());
            if let Err(err) = self
                .poller
                .add(device.event_raw_fd(), Token::Device(idx as u32))
            {
                log::error!("{}: cannot watch eventfd: {}", device.name(), err);
            }
        }

        log::info!(
            "serving {} device(s) on {} interface(s)",
            self.devices.len(),
            self.netifs.len()
        );
    }

    /// Swap in a new validated configuration. A placement map that fails
    /// to load keeps the previous one.
    pub fn reload(&mut self, config: Config) {
        self.config = config;
        let map = match &self.config.defaults.placement_map {
            Some(path) => PlacementMap::load(path),
            None => Ok(PlacementMap::identity()),
        };
        match map {
            Ok(map) => self.map = Arc::new(map),
            Err(err) => log::error!("placement map not reloaded: {err}"),
        }
        self.setup_ifaces();
        self.setup_devices();
        self.bind_topology();
        log::info!("the configuration has been reloaded");
    }

    /// Run the event loop until exit or reload is requested.
    pub fn run(&mut self) -> RunOutcome {
        let mut ready = Vec::new();
        let mut replies: Vec<Reply> = Vec::new();

        loop {
            if self.token.exit_requested() {
                return RunOutcome::Exit;
            }
            if self.token.reload_requested() {
                return RunOutcome::Reload;
            }

            self.arm_timer();
            if let Err(err) = self.poller.wait(WAIT_TIMEOUT_MS, &mut ready) {
                log::error!("event loop wait failed: {err}");
                self.token.request_exit();
                continue;
            }

            let now = Instant::now();
            let macs: Vec<[u8; 6]> = self.netifs.iter().map(|netif| netif.mac).collect();
            let mut topology_changed = false;

            for &token in &ready {
                match token {
                    Token::Netif(idx) => self.handle_netif_rx(idx as usize, now, &mut replies),
                    Token::Device(idx) => {
                        if let Some(device) = self.devices.get_mut(idx as usize) {
                            device.on_event(now, &macs, &mut replies);
                        }
                    }
                    Token::Timer => self.timer.consume(),
                    Token::Netmon => {
                        if self.netmon.drain() {
                            topology_changed = true;
                        }
                    }
                    Token::Ctl => self.handle_ctl(),
                }
            }

            // Deferred work: submit queued I/O, then push replies out
            for device in &mut self.devices {
                device.progress(now, &macs, &mut replies);
            }
            for reply in replies.drain(..) {
                if let Some(netif) = self.netifs.get_mut(reply.netif) {
                    netif.enqueue_tx(reply.frame);
                }
            }
            for netif in &mut self.netifs {
                netif.flush_tx();
            }

            if topology_changed {
                log::info!("link change detected, re-scanning interfaces");
                self.setup_ifaces();
                self.bind_topology();
            }
        }
    }

    fn arm_timer(&self) {
        let deadline = self
            .devices
            .iter()
            .filter_map(|device| device.next_deadline())
            .min();
        let ns = deadline.map(|at| {
            at.saturating_duration_since(Instant::now())
                .as_nanos()
                .max(1) as u64
        });
        if let Err(err) = self.timer.arm(ns) {
            log::error!("failed to arm the deadline timer: {err}");
        }
    }

    /// Drain one interface's RX ring and dispatch every frame.
    fn handle_netif_rx(&mut self, idx: usize, now: Instant, replies: &mut Vec<Reply>) {
        let mut frames: Vec<Vec<u8>> = Vec::new();
        if let Some(netif) = self.netifs.get_mut(idx) {
            netif.rx_drain(|data| frames.push(data.to_vec()));
        } else {
            return;
        }
        for frame in frames {
            self.dispatch_frame(idx, &frame, now, replies);
        }
    }

    /// Route one frame by (shelf, slot).
    fn dispatch_frame(
        &mut self,
        netif_idx: usize,
        data: &[u8],
        now: Instant,
        replies: &mut Vec<Reply>,
    ) {
        let (mac, max_payload) = {
            let netif = &self.netifs[netif_idx];
            (netif.mac, netif.max_payload())
        };

        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(protocol::ParseError::InvalidEtherType { .. }) => {
                self.netifs[netif_idx].stats.ignored += 1;
                return;
            }
            Err(err) => {
                self.reject_unparsable(netif_idx, data, err, mac, replies);
                return;
            }
        };
        if frame.header.flags.response {
            self.netifs[netif_idx].stats.ignored += 1;
            return;
        }

        if frame.header.is_broadcast() {
            self.netifs[netif_idx].stats.broadcast += 1;
            let attached = self.netifs[netif_idx].attached.clone();
            for dev_idx in attached {
                self.devices[dev_idx]
                    .handle_frame(&frame, netif_idx, mac, max_payload, now, replies);
            }
            return;
        }

        match self.dev_index.get(&(frame.header.shelf, frame.header.slot)) {
            Some(&dev_idx) if self.devices[dev_idx].attached.contains(&netif_idx) => {
                self.devices[dev_idx]
                    .handle_frame(&frame, netif_idx, mac, max_payload, now, replies);
            }
            _ => {
                self.netifs[netif_idx].stats.dropped += 1;
            }
        }
    }

    /// A frame with a healthy AoE header but a bad command or tail still
    /// earns an error response from the addressed device.
    fn reject_unparsable(
        &mut self,
        netif_idx: usize,
        data: &[u8],
        err: protocol::ParseError,
        mac: [u8; 6],
        replies: &mut Vec<Reply>,
    ) {
        if data.len() < AoeHeader::SIZE {
            self.netifs[netif_idx].stats.ignored += 1;
            return;
        }
        if data[14] & 0x80 != 0 {
            // A response frame, not ours to answer
            self.netifs[netif_idx].stats.ignored += 1;
            return;
        }
        let shelf = u16::from_be_bytes([data[16], data[17]]);
        let slot = data[18];
        let command = data[19];
        let tag = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let src: [u8; 6] = data[6..12].try_into().unwrap();

        let dev_idx = match self.dev_index.get(&(shelf, slot)) {
            Some(&idx) if self.devices[idx].attached.contains(&netif_idx) => idx,
            _ => {
                self.netifs[netif_idx].stats.dropped += 1;
                return;
            }
        };
        let device = &mut self.devices[dev_idx];
        device.stats.proto_err += 1;
        let err = AoeError::Parse(err);
        log::debug!("{}: malformed frame: {}", device.name(), err);

        let ctx = ReplyCtx {
            shelf: device.cfg.shelf,
            slot: device.cfg.slot,
            src_mac: mac,
        };
        let command = AoeCommand::try_from(command).unwrap_or(AoeCommand::Config);
        replies.push(Reply {
            netif: netif_idx,
            frame: protocol::error_reply(&ctx, src, tag, command, err.to_error_code(), None),
        });
    }

    /// Serve control plane requests.
    fn handle_ctl(&mut self) {
        let requests = self.ctl.recv_requests();
        for (client, request) in requests {
            match request {
                CtlRequest::GetStats(names) => {
                    self.ctl.send(&client, &CtlReply::Uptime {
                        uptime_ns: self.started.elapsed().as_nanos() as u64,
                    });
                    for device in &self.devices {
                        if name_selected(&names, device.name()) {
                            self.ctl.send(&client, &CtlReply::DevStat {
                                name: device.name().to_string(),
                                stats: device.stats,
                            });
                        }
                    }
                    for netif in &self.netifs {
                        if name_selected(&names, &netif.name) {
                            self.ctl.send(&client, &CtlReply::NetStat {
                                name: netif.name.clone(),
                                stats: netif.stats,
                            });
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::GetConfig(names) => {
                    for device in &self.devices {
                        if name_selected(&names, device.name()) {
                            self.ctl.send(&client, &CtlReply::Config {
                                name: device.name().to_string(),
                                config: device.state.config.clone(),
                            });
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::GetMacMask(names) => {
                    for device in &self.devices {
                        if name_selected(&names, device.name()) {
                            self.ctl.send(&client, &CtlReply::MacList {
                                name: device.name().to_string(),
                                macs: device.macmask_list(),
                            });
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::GetReserve(names) => {
                    for device in &self.devices {
                        if name_selected(&names, device.name()) {
                            self.ctl.send(&client, &CtlReply::MacList {
                                name: device.name().to_string(),
                                macs: device.reserve_list(),
                            });
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::ClearStats(names) => {
                    for device in &mut self.devices {
                        if name_selected(&names, device.name()) {
                            device.clear_stats();
                        }
                    }
                    for netif in &mut self.netifs {
                        if name_selected(&names, &netif.name) {
                            netif.stats = Default::default();
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::ClearConfig(names) => {
                    for device in &mut self.devices {
                        if name_selected(&names, device.name()) {
                            device.clear_config();
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::ClearMacMask(names) => {
                    for device in &mut self.devices {
                        if name_selected(&names, device.name()) {
                            device.clear_macmask();
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::ClearReserve(names) => {
                    for device in &mut self.devices {
                        if name_selected(&names, device.name()) {
                            device.clear_reserve();
                        }
                    }
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::Reload => {
                    self.token.request_reload();
                    self.ctl.send(&client, &CtlReply::Ok);
                }
                CtlRequest::Hello => {}
            }
        }
    }

    /// Drain and release everything, reverse of startup order.
    pub fn shutdown(mut self) {
        for device in &mut self.devices {
            device.shutdown();
        }
        log::info!("shut down cleanly");
    }
}

fn name_selected(names: &[String], name: &str) -> bool {
    names.is_empty() || names.iter().any(|n| n == name)
}

fn dir_writable(path: &std::path::Path) -> bool {
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctl::{decode_reply, encode_request};
    use std::os::unix::net::UnixDatagram;
    use tempfile::TempDir;

    fn test_server(dir: &TempDir) -> Server {
        let backing = dir.path().join("disk.img");
        std::fs::write(&backing, vec![0u8; 1024 * 1024]).unwrap();
        let config = Config::parse(&format!(
            r#"
[defaults]
state-directory = "{state}"
control-socket = "{ctl}"
interfaces = ["no-such-interface-*"]

[disk0]
shelf = 1
slot = 0
path = "{path}"
direct-io = false
interfaces = ["no-such-interface-*"]
"#,
            state = dir.path().display(),
            ctl = dir.path().join("ctl").display(),
            path = backing.display(),
        ))
        .unwrap();
        Server::new(config, ShutdownToken).unwrap()
    }

    fn greeted_client(dir: &TempDir) -> UnixDatagram {
        let socket = UnixDatagram::bind(dir.path().join("ctl.client")).unwrap();
        socket.connect(dir.path().join("ctl")).unwrap();
        socket
    }

    fn recv_reply(socket: &UnixDatagram) -> CtlReply {
        let mut buf = vec![0u8; crate::ctl::CTL_MAX_PACKET];
        let len = socket.recv(&mut buf).unwrap();
        decode_reply(&buf[..len]).unwrap()
    }

    #[test]
    fn test_stats_flow_over_control_socket() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        assert_eq!(server.device_count(), 1);
        // The pattern list matches no real interface
        assert_eq!(server.netif_count(), 0);

        let socket = greeted_client(&dir);
        socket
            .send(&encode_request(&CtlRequest::Hello).unwrap())
            .unwrap();
        server.handle_ctl();
        assert!(matches!(recv_reply(&socket), CtlReply::Hello { version: 1 }));

        socket
            .send(&encode_request(&CtlRequest::GetStats(vec![])).unwrap())
            .unwrap();
        server.handle_ctl();
        assert!(matches!(recv_reply(&socket), CtlReply::Uptime { .. }));
        match recv_reply(&socket) {
            CtlReply::DevStat { name, stats } => {
                assert_eq!(name, "disk0");
                assert_eq!(stats.read_cnt, 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(recv_reply(&socket), CtlReply::Ok);
    }

    #[test]
    fn test_clear_reserve_over_control_socket() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        server.devices[0]
            .state
            .reserve
            .insert(&[1, 2, 3, 4, 5, 6])
            .unwrap();

        let socket = greeted_client(&dir);
        socket
            .send(&encode_request(&CtlRequest::Hello).unwrap())
            .unwrap();
        server.handle_ctl();
        recv_reply(&socket);

        socket
            .send(&encode_request(&CtlRequest::ClearReserve(vec!["disk0".into()])).unwrap())
            .unwrap();
        server.handle_ctl();
        assert_eq!(recv_reply(&socket), CtlReply::Ok);
        assert!(server.devices[0].state.reserve.is_empty());
    }

    #[test]
    fn test_reload_keeps_unchanged_device_counters() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);
        server.devices[0].stats.proto_err = 42;

        // Reload with an identical configuration: the device is kept
        let config = server.config.clone();
        server.reload(config);
        assert_eq!(server.device_count(), 1);
        assert_eq!(server.devices[0].stats.proto_err, 42);
    }

    #[test]
    fn test_reload_drops_removed_device() {
        let dir = TempDir::new().unwrap();
        let mut server = test_server(&dir);

        let mut config = server.config.clone();
        config.devices.clear();
        server.reload(config);
        assert_eq!(server.device_count(), 0);
    }
}
