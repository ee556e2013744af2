//! Device engine
//!
//! One instance per exported device. Owns the bounded request queue, the
//! io_uring instance used for kernel asynchronous block I/O, the dynamic
//! MAC mask and reservation lists, and the per-device statistics. The
//! completion eventfd is registered with the event loop; everything here
//! runs on the event-loop thread.

use crate::config::{DeviceConfig, DeviceType};
use crate::ctl::DeviceStats;
use crate::placement::{MapError, PlacementMap};
use crate::protocol::{
    self, ata_error, ata_status, classify, mask_error, AoeCommand, AoeError, AoeFrame,
    AoePayload, AtaHeader, AtaKind, ConfigCommand, MaskCommand, MaskDirCommand, ReplyCtx,
    ReserveCommand, SECTOR_SIZE,
};
use crate::server::queue::{Constituent, IoDir, QueueFull, QueueSlot, RequestQueue};
use crate::state::{DeviceState, StateError};
use io_uring::{opcode, types, IoUring};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Placement granularity for virtual devices: 1 MiB objects.
const OBJECT_SECTORS: u64 = 2048;

/// Firmware version advertised in CONFIG replies.
const FIRMWARE_VERSION: u16 = 0x4019;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("placement map: {0}")]
    Map(#[from] MapError),

    #[error("UUID {0} does not match any known device")]
    UnknownUuid(String),

    #[error("placement rule '{0}' not present in the map")]
    UnknownRule(String),
}

/// A frame to be queued on an interface.
#[derive(Debug)]
pub struct Reply {
    pub netif: usize,
    pub frame: Vec<u8>,
}

/// What backs the device's sectors.
enum Backing {
    Physical {
        file: File,
    },
    Virtual {
        rule: u32,
        pool: u32,
        map: Arc<PlacementMap>,
        /// Sparse per-target segment files, opened on first use
        segments: HashMap<u32, File>,
    },
}

/// In-flight bookkeeping for one queue slot.
#[derive(Debug, Clone, Copy, Default)]
struct IoProgress {
    pending: u8,
    error: Option<i32>,
    submitted_at: Option<Instant>,
}

/// One fragment of a slot's kernel I/O.
struct IoPart {
    fd: RawFd,
    buf_offset: usize,
    len: usize,
    file_offset: u64,
}

pub struct Device {
    pub cfg: DeviceConfig,
    backing: Backing,
    total_sectors: u64,
    ring: IoUring,
    event_fd: OwnedFd,
    queue: RequestQueue,
    io: Vec<IoProgress>,
    pub state: DeviceState,
    statedir: PathBuf,
    pub stats: DeviceStats,
    /// Indices of interfaces this device is reachable through
    pub attached: Vec<usize>,
}

fn open_backing(cfg: &DeviceConfig) -> Result<(File, u64), DeviceError> {
    let path = match (&cfg.path, &cfg.uuid) {
        (Some(path), _) => path.clone(),
        (None, Some(uuid)) => {
            let link = PathBuf::from(format!("/dev/disk/by-uuid/{uuid}"));
            std::fs::canonicalize(&link)
                .map_err(|_| DeviceError::UnknownUuid(uuid.clone()))?
        }
        (None, None) => unreachable!("config validation requires path or uuid"),
    };

    let mut options = OpenOptions::new();
    options.read(true).write(!cfg.read_only);
    if cfg.direct_io {
        options.custom_flags(libc::O_DIRECT);
    }
    let file = options.open(&path)?;

    // Regular files report their size in metadata; block devices need a
    // seek to the end.
    let size = unsafe { libc::lseek(file.as_raw_fd(), 0, libc::SEEK_END) };
    if size < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok((file, size as u64 / SECTOR_SIZE as u64))
}

impl Device {
    pub fn open(
        cfg: DeviceConfig,
        statedir: PathBuf,
        map: Arc<PlacementMap>,
    ) -> Result<Self, DeviceError> {
        let (backing, total_sectors) = match cfg.dev_type {
            DeviceType::Physical => {
                let (file, sectors) = open_backing(&cfg)?;
                (Backing::Physical { file }, sectors)
            }
            DeviceType::Virtual => {
                let rule = match &cfg.dppolicy {
                    Some(name) => map
                        .rule_named(name)
                        .ok_or_else(|| DeviceError::UnknownRule(name.clone()))?,
                    None => 0,
                };
                if !map.has_rule(rule) {
                    return Err(DeviceError::UnknownRule(rule.to_string()));
                }
                let pool = (cfg.shelf as u32) << 8 | cfg.slot as u32;
                let sectors = cfg.capacity_mib * (1024 * 1024 / SECTOR_SIZE as u64);
                (
                    Backing::Virtual {
                        rule,
                        pool,
                        map,
                        segments: HashMap::new(),
                    },
                    sectors,
                )
            }
        };

        let entries = (cfg.queue_length * 4).next_power_of_two().max(64) as u32;
        let ring = IoUring::new(entries)?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };
        ring.submitter().register_eventfd(event_fd.as_raw_fd())?;

        let state = DeviceState::load(&statedir, &cfg.name)?;
        let queue = RequestQueue::new(cfg.queue_length);
        let io = vec![IoProgress::default(); cfg.queue_length];

        log::info!(
            "{}: exporting e{}.{} ({} sectors{})",
            cfg.name,
            cfg.shelf,
            cfg.slot,
            total_sectors,
            if cfg.read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            cfg,
            backing,
            total_sectors,
            ring,
            event_fd,
            queue,
            io,
            state,
            statedir,
            stats: DeviceStats::default(),
            attached: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn event_raw_fd(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn reply_ctx(&self, netif_mac: [u8; 6]) -> ReplyCtx {
        ReplyCtx {
            shelf: self.cfg.shelf,
            slot: self.cfg.slot,
            src_mac: netif_mac,
        }
    }

    /// ACL admission: static accept/deny from the configuration plus the
    /// dynamic MAC mask list.
    fn admitted(&self, src: &[u8; 6]) -> bool {
        if let Some(accept) = &self.cfg.accept {
            if !accept.contains(src) {
                return false;
            }
        }
        if let Some(deny) = &self.cfg.deny {
            if deny.contains(src) {
                return false;
            }
        }
        if !self.state.macmask.is_empty() && !self.state.macmask.contains(src) {
            return false;
        }
        true
    }

    fn write_admitted(&self, src: &[u8; 6]) -> bool {
        self.state.reserve.is_empty() || self.state.reserve.contains(src)
    }

    fn persist_state(&mut self) {
        if let Err(err) = self.state.save(&self.statedir, &self.cfg.name) {
            log::error!("{}: failed to persist state: {}", self.cfg.name, err);
        }
    }

    /// Serial number for IDENTIFY: the WWN of virtual devices, a path hash
    /// otherwise.
    fn serial(&self) -> String {
        match self.cfg.dev_type {
            DeviceType::Virtual => hex::encode(self.cfg.wwn),
            DeviceType::Physical => {
                let path = self
                    .cfg
                    .path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .or_else(|| self.cfg.uuid.clone())
                    .unwrap_or_default();
                format!(
                    "{:016x}",
                    xxhash_rust::xxh3::xxh3_64(path.as_bytes())
                )
            }
        }
    }

    /// Handle one inbound request frame addressed to this device.
    pub fn handle_frame(
        &mut self,
        frame: &AoeFrame,
        netif: usize,
        netif_mac: [u8; 6],
        max_payload: usize,
        now: Instant,
        replies: &mut Vec<Reply>,
    ) {
        let src = frame.header.src_mac;
        if !self.admitted(&src) {
            self.stats.proto_err += 1;
            return;
        }

        // Broadcast ATA handling is opt-in; discovery commands always work.
        if frame.header.is_broadcast()
            && frame.header.command == AoeCommand::Ata
            && !self.cfg.broadcast
        {
            return;
        }

        let ctx = self.reply_ctx(netif_mac);
        match &frame.payload {
            AoePayload::Ata { header, data } => {
                self.handle_ata(frame, header, data, ctx, netif, max_payload, now, replies)
            }
            AoePayload::Config(config) => {
                self.handle_config(frame, config, ctx, netif, max_payload, replies)
            }
            AoePayload::MacMask(mask) => self.handle_mask(frame, mask, ctx, netif, replies),
            AoePayload::Reserve(reserve) => {
                self.handle_reserve(frame, reserve, ctx, netif, replies)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ata(
        &mut self,
        frame: &AoeFrame,
        header: &AtaHeader,
        data: &[u8],
        ctx: ReplyCtx,
        netif: usize,
        max_payload: usize,
        now: Instant,
        replies: &mut Vec<Reply>,
    ) {
        let tag = frame.header.tag;
        let dst = frame.header.src_mac;

        let op = match classify(header) {
            Ok(op) => op,
            Err(cmd) => {
                log::debug!("{}: unknown ATA command 0x{:02X}", self.cfg.name, cmd);
                self.stats.proto_err += 1;
                replies.push(Reply {
                    netif,
                    frame: self.ata_error_frame(&ctx, dst, tag, header, ata_error::ABRT),
                });
                return;
            }
        };

        if self.cfg.trace_io {
            log::debug!(
                "{}: ATA {:?} LBA={} count={} tag={:#x}",
                self.cfg.name,
                op.kind,
                op.lba,
                op.count,
                tag
            );
        }

        match op.kind {
            AtaKind::Identify => {
                let ident = protocol::DeviceIdent {
                    serial: self.serial(),
                    firmware: env!("CARGO_PKG_VERSION").to_string(),
                    total_sectors: self.total_sectors,
                };
                let started = Instant::now();
                let block = protocol::build_identify_data(&ident);
                self.stats.other_cnt += 1;
                self.stats.other_time_ns += started.elapsed().as_nanos() as u64;
                replies.push(Reply {
                    netif,
                    frame: protocol::ata_reply(
                        &ctx,
                        dst,
                        tag,
                        AtaHeader {
                            flags: header.flags,
                            err_feature: 0,
                            sector_count: 1,
                            cmd_status: ata_status::DRDY,
                            lba: header.lba,
                        },
                        block,
                    ),
                });
            }
            AtaKind::Read | AtaKind::Write => {
                let bytes = op.count as usize * SECTOR_SIZE;
                if op.lba + op.count as u64 > self.total_sectors || bytes > max_payload {
                    self.stats.ata_err += 1;
                    let err = AoeError::BadArgument(format!(
                        "LBA {} count {} out of range",
                        op.lba, op.count
                    ));
                    replies.push(Reply {
                        netif,
                        frame: self.aoe_error_frame(&ctx, dst, tag, AoeCommand::Ata, &err,
                            Some(header)),
                    });
                    return;
                }
                if op.kind == AtaKind::Write {
                    if self.cfg.read_only {
                        self.stats.ata_err += 1;
                        replies.push(Reply {
                            netif,
                            frame: self.ata_error_frame(&ctx, dst, tag, header, ata_error::ABRT),
                        });
                        return;
                    }
                    if !self.write_admitted(&frame.header.src_mac) {
                        self.stats.proto_err += 1;
                        replies.push(Reply {
                            netif,
                            frame: self.aoe_error_frame(&ctx, dst, tag, AoeCommand::Ata,
                                &AoeError::TargetReserved, Some(header)),
                        });
                        return;
                    }
                    if data.len() != bytes {
                        self.stats.proto_err += 1;
                        let err = AoeError::BadArgument(format!(
                            "write payload is {} bytes, expected {}",
                            data.len(),
                            bytes
                        ));
                        replies.push(Reply {
                            netif,
                            frame: self.aoe_error_frame(&ctx, dst, tag, AoeCommand::Ata, &err,
                                Some(header)),
                        });
                        return;
                    }
                }
                let dir = if op.kind == AtaKind::Read {
                    IoDir::Read
                } else {
                    IoDir::Write
                };
                self.queue_io(frame, header, dir, op.lba, op.count, data, ctx, netif,
                    max_payload, now, replies);
            }
            AtaKind::Flush => {
                self.queue_io(frame, header, IoDir::Flush, 0, 0, &[], ctx, netif,
                    max_payload, now, replies);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn queue_io(
        &mut self,
        frame: &AoeFrame,
        header: &AtaHeader,
        dir: IoDir,
        lba: u64,
        count: u32,
        data: &[u8],
        ctx: ReplyCtx,
        netif: usize,
        max_payload: usize,
        now: Instant,
        replies: &mut Vec<Reply>,
    ) {
        let constituent = Constituent {
            tag: frame.header.tag,
            src: frame.header.src_mac,
            lba,
            count,
            aflags: header.flags,
        };
        let merge_window = Duration::from_nanos(self.cfg.merge_delay_ns);
        let async_write = header.flags.async_write;

        if self.queue.try_merge(
            dir,
            lba,
            count,
            data,
            constituent,
            netif,
            async_write,
            now,
            merge_window,
            max_payload,
        ) {
            self.stats.queue_length += self.queue.outstanding() as u64;
            return;
        }

        match self.queue.enqueue(
            dir,
            lba,
            count,
            data,
            constituent,
            netif,
            async_write,
            now,
            max_payload,
        ) {
            Ok(_) => {
                self.stats.queue_length += self.queue.outstanding() as u64;
            }
            Err(QueueFull) => {
                let max_delay = Duration::from_nanos(self.cfg.max_delay_ns);
                let head_age = self
                    .queue
                    .head_arrived()
                    .map(|arrived| now.duration_since(arrived))
                    .unwrap_or(Duration::ZERO);
                if head_age <= max_delay {
                    // The head still has time to drain; the initiator will
                    // retransmit.
                    self.stats.queue_stall += 1;
                } else {
                    self.stats.queue_over += 1;
                    replies.push(Reply {
                        netif,
                        frame: self.aoe_error_frame(
                            &ctx,
                            frame.header.src_mac,
                            frame.header.tag,
                            AoeCommand::Ata,
                            &AoeError::DeviceUnavailable,
                            Some(header),
                        ),
                    });
                }
            }
        }
    }

    fn handle_config(
        &mut self,
        frame: &AoeFrame,
        config: &protocol::ConfigHeader,
        ctx: ReplyCtx,
        netif: usize,
        max_payload: usize,
        replies: &mut Vec<Reply>,
    ) {
        let ccmd = match config.config_command() {
            Ok(ccmd) => ccmd,
            Err(code) => {
                self.stats.proto_err += 1;
                let err = AoeError::BadArgument(format!("unknown config sub-command {code}"));
                replies.push(Reply {
                    netif,
                    frame: self.aoe_error_frame(
                        &ctx,
                        frame.header.src_mac,
                        frame.header.tag,
                        AoeCommand::Config,
                        &err,
                        None,
                    ),
                });
                return;
            }
        };

        let sectors_per_request = (max_payload / SECTOR_SIZE).min(255) as u8;
        let respond = |device: &Device, replies: &mut Vec<Reply>| {
            replies.push(Reply {
                netif,
                frame: protocol::config_reply(
                    &ctx,
                    frame.header.src_mac,
                    frame.header.tag,
                    device.queue.capacity() as u16,
                    FIRMWARE_VERSION,
                    sectors_per_request,
                    ccmd,
                    device.state.config.clone(),
                ),
            });
        };

        match ccmd {
            ConfigCommand::Read => respond(self, replies),
            ConfigCommand::TestExact => {
                if self.state.config == config.config_string {
                    respond(self, replies);
                }
            }
            ConfigCommand::TestPrefix => {
                if self.state.config.starts_with(&config.config_string) {
                    respond(self, replies);
                }
            }
            ConfigCommand::Set => {
                if !self.state.config.is_empty() && self.state.config != config.config_string {
                    self.stats.proto_err += 1;
                    replies.push(Reply {
                        netif,
                        frame: self.aoe_error_frame(
                            &ctx,
                            frame.header.src_mac,
                            frame.header.tag,
                            AoeCommand::Config,
                            &AoeError::ConfigStringPresent,
                            None,
                        ),
                    });
                    return;
                }
                self.state.config = config.config_string.clone();
                self.persist_state();
                respond(self, replies);
            }
            ConfigCommand::ForceSet => {
                self.state.config = config.config_string.clone();
                self.persist_state();
                respond(self, replies);
            }
        }
    }

    fn handle_mask(
        &mut self,
        frame: &AoeFrame,
        mask: &protocol::MacMaskHeader,
        ctx: ReplyCtx,
        netif: usize,
        replies: &mut Vec<Reply>,
    ) {
        let mut merror = mask_error::NONE;
        if mask.command == MaskCommand::Edit {
            let mut changed = false;
            for directive in &mask.directives {
                match directive.command {
                    MaskDirCommand::None => {}
                    MaskDirCommand::Add => match self.state.macmask.insert(&directive.mac) {
                        Ok(inserted) => changed |= inserted,
                        Err(_) => {
                            merror = mask_error::LIST_FULL;
                            break;
                        }
                    },
                    MaskDirCommand::Delete => {
                        changed |= self.state.macmask.remove(&directive.mac);
                    }
                }
            }
            if changed {
                self.persist_state();
            }
            if merror != mask_error::NONE {
                self.stats.proto_err += 1;
            }
        }

        replies.push(Reply {
            netif,
            frame: protocol::mask_reply(
                &ctx,
                frame.header.src_mac,
                frame.header.tag,
                mask.command,
                merror,
                self.state.macmask.iter(),
            ),
        });
    }

    fn handle_reserve(
        &mut self,
        frame: &AoeFrame,
        reserve: &protocol::ReserveHeader,
        ctx: ReplyCtx,
        netif: usize,
        replies: &mut Vec<Reply>,
    ) {
        let src = frame.header.src_mac;
        match reserve.command {
            ReserveCommand::Read => {}
            ReserveCommand::Set => {
                if !self.state.reserve.is_empty() && !self.state.reserve.contains(&src) {
                    self.stats.proto_err += 1;
                    replies.push(Reply {
                        netif,
                        frame: self.aoe_error_frame(
                            &ctx,
                            src,
                            frame.header.tag,
                            AoeCommand::Reserve,
                            &AoeError::TargetReserved,
                            None,
                        ),
                    });
                    return;
                }
                if self.apply_reserve_list(&reserve.macs, &ctx, src, frame.header.tag,
                    netif, replies) {
                    return;
                }
            }
            ReserveCommand::ForceSet => {
                if self.apply_reserve_list(&reserve.macs, &ctx, src, frame.header.tag,
                    netif, replies) {
                    return;
                }
            }
        }

        replies.push(Reply {
            netif,
            frame: protocol::reserve_reply(
                &ctx,
                src,
                frame.header.tag,
                reserve.command,
                self.state.reserve.iter(),
            ),
        });
    }

    /// Replace the reservation list; true means an error reply was queued.
    fn apply_reserve_list(
        &mut self,
        macs: &[[u8; 6]],
        ctx: &ReplyCtx,
        src: [u8; 6],
        tag: u32,
        netif: usize,
        replies: &mut Vec<Reply>,
    ) -> bool {
        if self.state.reserve.replace(macs.iter()).is_err() {
            self.stats.proto_err += 1;
            replies.push(Reply {
                netif,
                frame: self.aoe_error_frame(
                    ctx,
                    src,
                    tag,
                    AoeCommand::Reserve,
                    &AoeError::BadArgument("reservation list too long".to_string()),
                    None,
                ),
            });
            return true;
        }
        self.persist_state();
        false
    }

    /// AoE-level failure reply: error flag and code in the AoE header.
    fn aoe_error_frame(
        &self,
        ctx: &ReplyCtx,
        dst: [u8; 6],
        tag: u32,
        command: AoeCommand,
        err: &AoeError,
        ata: Option<&AtaHeader>,
    ) -> Vec<u8> {
        log::debug!("{}: {}", self.cfg.name, err);
        protocol::error_reply(ctx, dst, tag, command, err.to_error_code(), ata)
    }

    /// ATA-level failure reply: error bit in the status register, no AoE
    /// header error.
    fn ata_error_frame(
        &self,
        ctx: &ReplyCtx,
        dst: [u8; 6],
        tag: u32,
        header: &AtaHeader,
        error: u8,
    ) -> Vec<u8> {
        protocol::ata_reply(
            ctx,
            dst,
            tag,
            AtaHeader {
                flags: header.flags,
                err_feature: error,
                sector_count: 0,
                cmd_status: ata_status::ERR | ata_status::DRDY,
                lba: header.lba,
            },
            Vec::new(),
        )
    }

    /// Expire overdue requests and submit everything whose merge window has
    /// passed. Called after new arrivals, completions and timer fires.
    pub fn progress(
        &mut self,
        now: Instant,
        netif_macs: &[[u8; 6]],
        replies: &mut Vec<Reply>,
    ) {
        let max_delay = Duration::from_nanos(self.cfg.max_delay_ns);
        let merge_window = Duration::from_nanos(self.cfg.merge_delay_ns);

        for slot in self.queue.expire(now, max_delay) {
            self.stats.queue_over += 1;
            self.reply_error_for_slot(&slot, &AoeError::DeviceUnavailable, netif_macs,
                replies);
        }

        let mut submitted = 0usize;
        while let Some(idx) = self.queue.pop_submittable(now, merge_window) {
            if let Err(err) = self.submit_slot(idx, now) {
                log::error!("{}: submit failed: {}", self.cfg.name, err);
                self.io[idx].error = Some(err.raw_os_error().unwrap_or(libc::EIO));
                self.io[idx].pending = 0;
                self.finish_slot(idx, now, netif_macs, replies);
                continue;
            }
            if self.io[idx].pending == 0 {
                // Nothing to hand to the kernel (a flush with no dirty
                // segment files); finish right away.
                self.finish_slot(idx, now, netif_macs, replies);
                continue;
            }
            submitted += 1;
        }
        if submitted > 0 {
            self.stats.io_slots += submitted as u64;
            if let Err(err) = self.ring.submit() {
                log::error!("{}: io_uring submit: {}", self.cfg.name, err);
            }
        }
    }

    /// Build the kernel I/O fragments for a slot. Physical devices always
    /// get one fragment; virtual devices get one per placement object the
    /// range touches (at most two, since requests are bounded by the frame
    /// payload).
    fn io_parts(&mut self, idx: usize) -> Result<Vec<IoPart>, DeviceError> {
        let (dir, lba, count) = {
            let slot = self.queue.get(idx).expect("submitting a live slot");
            (slot.dir, slot.lba, slot.count)
        };

        if let Backing::Physical { file } = &self.backing {
            let fd = file.as_raw_fd();
            return Ok(match dir {
                IoDir::Flush => vec![IoPart {
                    fd,
                    buf_offset: 0,
                    len: 0,
                    file_offset: 0,
                }],
                _ => vec![IoPart {
                    fd,
                    buf_offset: 0,
                    len: count as usize * SECTOR_SIZE,
                    file_offset: lba * SECTOR_SIZE as u64,
                }],
            });
        }

        if dir == IoDir::Flush {
            let segments = match &self.backing {
                Backing::Virtual { segments, .. } => segments,
                Backing::Physical { .. } => unreachable!(),
            };
            return Ok(segments
                .values()
                .map(|file| IoPart {
                    fd: file.as_raw_fd(),
                    buf_offset: 0,
                    len: 0,
                    file_offset: 0,
                })
                .collect());
        }

        let mut parts: Vec<IoPart> = Vec::with_capacity(2);
        let mut cursor = lba;
        let end = lba + count as u64;
        while cursor < end {
            let object = cursor / OBJECT_SECTORS;
            let object_end = (object + 1) * OBJECT_SECTORS;
            let span = object_end.min(end) - cursor;
            let fd = self.segment_fd(object)?;
            let buf_offset = (cursor - lba) as usize * SECTOR_SIZE;
            let len = span as usize * SECTOR_SIZE;
            let file_offset = cursor * SECTOR_SIZE as u64;
            match parts.last_mut() {
                Some(last)
                    if last.fd == fd && last.file_offset + last.len as u64 == file_offset =>
                {
                    last.len += len;
                }
                _ => parts.push(IoPart {
                    fd,
                    buf_offset,
                    len,
                    file_offset,
                }),
            }
            cursor += span;
        }
        Ok(parts)
    }

    /// The segment file of the target that owns an object, opened sparse on
    /// first touch.
    fn segment_fd(&mut self, object: u64) -> Result<RawFd, DeviceError> {
        let (rule, pool, map) = match &self.backing {
            Backing::Virtual {
                rule, pool, map, ..
            } => (*rule, *pool, Arc::clone(map)),
            _ => unreachable!(),
        };
        let targets = map.select(rule, pool, object)?;
        let target = *targets.first().ok_or(MapError::EmptyBucket)?;

        let statedir = self.statedir.clone();
        let name = self.cfg.name.clone();
        let direct_io = self.cfg.direct_io;
        let capacity = self.total_sectors * SECTOR_SIZE as u64;

        let segments = match &mut self.backing {
            Backing::Virtual { segments, .. } => segments,
            _ => unreachable!(),
        };
        if let Some(file) = segments.get(&target) {
            return Ok(file.as_raw_fd());
        }

        let path = statedir.join(format!("{name}.t{target}.img"));
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(&path)?;
        if file.metadata()?.len() < capacity {
            file.set_len(capacity)?;
        }
        log::debug!("{name}: opened segment {} for target {target}", path.display());
        let fd = file.as_raw_fd();
        segments.insert(target, file);
        Ok(fd)
    }

    fn submit_slot(&mut self, idx: usize, now: Instant) -> Result<(), io::Error> {
        let parts = self
            .io_parts(idx)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let slot = self.queue.get(idx).expect("submitting a live slot");
        let dir = slot.dir;
        let buf_ptr = slot.buf.as_ptr();

        self.io[idx] = IoProgress {
            pending: parts.len() as u8,
            error: None,
            submitted_at: Some(now),
        };

        for part in &parts {
            let sqe = match dir {
                IoDir::Read => opcode::Read::new(
                    types::Fd(part.fd),
                    unsafe { buf_ptr.add(part.buf_offset) } as *mut u8,
                    part.len as u32,
                )
                .offset(part.file_offset)
                .build()
                .user_data(idx as u64),
                IoDir::Write => opcode::Write::new(
                    types::Fd(part.fd),
                    unsafe { buf_ptr.add(part.buf_offset) },
                    part.len as u32,
                )
                .offset(part.file_offset)
                .build()
                .user_data(idx as u64),
                IoDir::Flush => opcode::Fsync::new(types::Fd(part.fd))
                    .build()
                    .user_data(idx as u64),
            };
            unsafe {
                if self.ring.submission().push(&sqe).is_err() {
                    // Make room and retry once; the ring is sized for the
                    // worst case so a second failure is a real error.
                    self.ring.submit()?;
                    self.ring
                        .submission()
                        .push(&sqe)
                        .map_err(|_| io::Error::new(io::ErrorKind::Other, "sq overflow"))?;
                }
            }
        }
        Ok(())
    }

    /// Eventfd readiness: drain the counter and process completions.
    pub fn on_event(
        &mut self,
        now: Instant,
        netif_macs: &[[u8; 6]],
        replies: &mut Vec<Reply>,
    ) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(
                self.event_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            );
        }
        self.process_completions(now, netif_macs, replies);
    }

    /// Drain the completion queue, finishing every slot whose fragments all
    /// completed.
    pub fn process_completions(
        &mut self,
        now: Instant,
        netif_macs: &[[u8; 6]],
        replies: &mut Vec<Reply>,
    ) {
        let mut finished: Vec<usize> = Vec::new();
        let mut any = false;
        for cqe in self.ring.completion() {
            any = true;
            let idx = cqe.user_data() as usize;
            if idx >= self.io.len() || self.io[idx].pending == 0 {
                continue;
            }
            let progress = &mut self.io[idx];
            if cqe.result() < 0 {
                progress.error.get_or_insert(-cqe.result());
            }
            progress.pending -= 1;
            if progress.pending == 0 {
                finished.push(idx);
            }
        }

        if any {
            self.stats.io_runs += 1;
        }
        for idx in finished {
            self.finish_slot(idx, now, netif_macs, replies);
        }
    }

    /// Account a completed slot and answer every constituent.
    fn finish_slot(
        &mut self,
        idx: usize,
        now: Instant,
        netif_macs: &[[u8; 6]],
        replies: &mut Vec<Reply>,
    ) {
        let progress = std::mem::take(&mut self.io[idx]);
        let slot = match self.queue.complete(idx) {
            Some(slot) => slot,
            None => return,
        };

        let elapsed = progress
            .submitted_at
            .map(|at| now.duration_since(at).as_nanos() as u64)
            .unwrap_or(0);
        let nreq = slot.constituents.len() as u64;
        match slot.dir {
            IoDir::Read => {
                self.stats.read_cnt += nreq;
                self.stats.read_bytes += slot.byte_len() as u64;
                self.stats.read_time_ns += elapsed;
            }
            IoDir::Write => {
                self.stats.write_cnt += nreq;
                self.stats.write_bytes += slot.byte_len() as u64;
                self.stats.write_time_ns += elapsed;
            }
            IoDir::Flush => {
                self.stats.other_cnt += nreq as u32;
                self.stats.other_time_ns += elapsed;
            }
        }

        if let Some(errno) = progress.error {
            self.stats.ata_err += slot.constituents.len() as u32;
            log::warn!(
                "{}: {:?} LBA={} count={} failed: {}",
                self.cfg.name,
                slot.dir,
                slot.lba,
                slot.count,
                io::Error::from_raw_os_error(errno)
            );
            self.reply_ata_error_for_slot(&slot, netif_macs, replies);
            return;
        }

        if self.cfg.trace_io {
            log::debug!(
                "{}: completed {:?} LBA={} count={} ({} requests, {} ns)",
                self.cfg.name,
                slot.dir,
                slot.lba,
                slot.count,
                nreq,
                elapsed
            );
        }

        let mac = netif_macs.get(slot.netif).copied().unwrap_or([0; 6]);
        let ctx = self.reply_ctx(mac);
        for c in &slot.constituents {
            let data = match slot.dir {
                IoDir::Read => {
                    let start = (c.lba - slot.lba) as usize * SECTOR_SIZE;
                    slot.buf.as_slice()[start..start + c.count as usize * SECTOR_SIZE].to_vec()
                }
                _ => Vec::new(),
            };
            replies.push(Reply {
                netif: slot.netif,
                frame: protocol::ata_reply(
                    &ctx,
                    c.src,
                    c.tag,
                    AtaHeader {
                        flags: c.aflags,
                        err_feature: 0,
                        sector_count: c.count as u8,
                        cmd_status: ata_status::DRDY,
                        lba: c.lba,
                    },
                    data,
                ),
            });
        }
    }

    fn reply_ata_error_for_slot(
        &self,
        slot: &QueueSlot,
        netif_macs: &[[u8; 6]],
        replies: &mut Vec<Reply>,
    ) {
        let mac = netif_macs.get(slot.netif).copied().unwrap_or([0; 6]);
        let ctx = self.reply_ctx(mac);
        let error = if slot.dir == IoDir::Flush {
            ata_error::ABRT
        } else {
            ata_error::UNC
        };
        for c in &slot.constituents {
            let header = AtaHeader {
                flags: c.aflags,
                err_feature: 0,
                sector_count: c.count as u8,
                cmd_status: 0,
                lba: c.lba,
            };
            replies.push(Reply {
                netif: slot.netif,
                frame: self.ata_error_frame(&ctx, c.src, c.tag, &header, error),
            });
        }
    }

    fn reply_error_for_slot(
        &self,
        slot: &QueueSlot,
        err: &AoeError,
        netif_macs: &[[u8; 6]],
        replies: &mut Vec<Reply>,
    ) {
        let mac = netif_macs.get(slot.netif).copied().unwrap_or([0; 6]);
        let ctx = self.reply_ctx(mac);
        for c in &slot.constituents {
            let header = AtaHeader {
                flags: c.aflags,
                err_feature: 0,
                sector_count: 0,
                cmd_status: 0,
                lba: c.lba,
            };
            replies.push(Reply {
                netif: slot.netif,
                frame: self.aoe_error_frame(&ctx, c.src, c.tag, AoeCommand::Ata, err,
                    Some(&header)),
            });
        }
    }

    /// The next queue deadline, for arming the shared timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline(
            Duration::from_nanos(self.cfg.merge_delay_ns),
            Duration::from_nanos(self.cfg.max_delay_ns),
        )
    }

    pub fn has_pending_work(&self) -> bool {
        self.queue.outstanding() > self.queue.inflight()
    }

    /// Drain outstanding kernel I/O before teardown; late replies are
    /// discarded.
    pub fn shutdown(&mut self) {
        let mut replies = Vec::new();
        let macs: Vec<[u8; 6]> = Vec::new();
        while self.queue.inflight() > 0 {
            if self.ring.submit_and_wait(1).is_err() {
                break;
            }
            self.process_completions(Instant::now(), &macs, &mut replies);
        }
        self.queue.drain();
        self.persist_state();
    }

    // Control plane operations

    pub fn clear_stats(&mut self) {
        self.stats = DeviceStats::default();
    }

    pub fn clear_config(&mut self) {
        self.state.config.clear();
        self.persist_state();
    }

    pub fn clear_macmask(&mut self) {
        self.state.macmask.clear();
        self.persist_state();
    }

    pub fn clear_reserve(&mut self) {
        self.state.reserve.clear();
        self.persist_state();
    }

    pub fn macmask_list(&self) -> Vec<[u8; 6]> {
        self.state.macmask.iter().collect()
    }

    pub fn reserve_list(&self) -> Vec<[u8; 6]> {
        self.state.reserve.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclMap;
    use crate::config::{DeviceConfig, DeviceType};
    use crate::protocol::{parse_frame, AoeErrorCode, AoeFlags, AoeHeader, AtaFlags};
    use tempfile::TempDir;

    const INITIATOR: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
    const IFACE_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const MAX_PAYLOAD: usize = 16 * SECTOR_SIZE;

    fn test_cfg(name: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            shelf: 1,
            slot: 0,
            dev_type: DeviceType::Physical,
            path: None,
            uuid: None,
            capacity_mib: 0,
            wwn: [0; 8],
            dppolicy: None,
            queue_length: 8,
            direct_io: false,
            trace_io: false,
            broadcast: false,
            read_only: false,
            max_delay_ns: 100_000_000,
            merge_delay_ns: 0,
            iface_patterns: None,
            accept: None,
            deny: None,
        }
    }

    struct Harness {
        device: Device,
        _statedir: TempDir,
        _backing: tempfile::NamedTempFile,
    }

    fn harness_with(mut mutate: impl FnMut(&mut DeviceConfig)) -> Harness {
        let statedir = TempDir::new().unwrap();
        let backing = tempfile::NamedTempFile::new().unwrap();
        backing.as_file().set_len(1024 * 1024 * 1024).unwrap(); // 1 GiB

        let mut cfg = test_cfg("disk0");
        cfg.path = Some(backing.path().to_path_buf());
        mutate(&mut cfg);

        let device = Device::open(
            cfg,
            statedir.path().to_path_buf(),
            Arc::new(PlacementMap::identity()),
        )
        .unwrap();
        Harness {
            device,
            _statedir: statedir,
            _backing: backing,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn ata_frame(tag: u32, cmd: u8, lba: u64, count: u8, data: Vec<u8>) -> AoeFrame {
        AoeFrame {
            header: AoeHeader {
                dst_mac: IFACE_MAC,
                src_mac: INITIATOR,
                version: 1,
                flags: AoeFlags::default(),
                error: 0,
                shelf: 1,
                slot: 0,
                command: AoeCommand::Ata,
                tag,
            },
            payload: AoePayload::Ata {
                header: AtaHeader {
                    flags: AtaFlags {
                        extended: true,
                        ..Default::default()
                    },
                    err_feature: 0,
                    sector_count: count,
                    cmd_status: cmd,
                    lba,
                },
                data,
            },
        }
    }

    fn reserve_frame(tag: u32, src: [u8; 6], command: ReserveCommand, macs: Vec<[u8; 6]>) -> AoeFrame {
        AoeFrame {
            header: AoeHeader {
                dst_mac: IFACE_MAC,
                src_mac: src,
                version: 1,
                flags: AoeFlags::default(),
                error: 0,
                shelf: 1,
                slot: 0,
                command: AoeCommand::Reserve,
                tag,
            },
            payload: AoePayload::Reserve(protocol::ReserveHeader { command, macs }),
        }
    }

    fn run_io(h: &mut Harness, replies: &mut Vec<Reply>) {
        let macs = [IFACE_MAC];
        h.device.progress(Instant::now(), &macs, replies);
        while h.device.queue.inflight() > 0 {
            h.device.ring.submit_and_wait(1).unwrap();
            h.device.process_completions(Instant::now(), &macs, replies);
        }
    }

    #[test]
    fn test_identify_scenario() {
        let mut h = harness();
        let mut replies = Vec::new();
        let frame = ata_frame(42, 0xEC, 0, 1, Vec::new());
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);

        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        assert_eq!(reply.header.tag, 42);
        assert!(reply.header.flags.response);
        assert!(!reply.header.flags.error);
        if let AoePayload::Ata { data, .. } = reply.payload {
            assert_eq!(data.len(), 512);
            // 1 GiB = 2097152 sectors, words 100-103
            let sectors = u64::from_le_bytes(data[200..208].try_into().unwrap());
            assert_eq!(sectors, 2097152);
        } else {
            panic!("expected ATA payload");
        }
        assert_eq!(h.device.stats.other_cnt, 1);
    }

    #[test]
    fn test_read_beyond_capacity() {
        let mut h = harness();
        let mut replies = Vec::new();
        let frame = ata_frame(7, 0x24, 2097152, 1, Vec::new());
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);

        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        assert_eq!(reply.header.tag, 7);
        assert!(reply.header.flags.error);
        assert_eq!(reply.header.error, AoeErrorCode::BadArgument as u8);
        // Nothing was queued
        assert_eq!(h.device.queue.outstanding(), 0);
        assert_eq!(h.device.stats.ata_err, 1);
    }

    #[test]
    fn test_acl_deny_is_silent() {
        let mut h = harness_with(|cfg| {
            let mut deny = AclMap::new();
            deny.insert(&INITIATOR).unwrap();
            cfg.deny = Some(deny);
        });
        let mut replies = Vec::new();
        let frame = ata_frame(1, 0x24, 0, 1, Vec::new());
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);

        assert!(replies.is_empty());
        assert_eq!(h.device.stats.proto_err, 1);
    }

    #[test]
    fn test_reservation_scenario() {
        let mut h = harness();
        let mac_a = [0x0A; 6];
        let mac_b = [0x0B; 6];
        let mac_c = [0x0C; 6];
        let mut replies = Vec::new();

        // A reserves for A and B
        let frame = reserve_frame(1, mac_a, ReserveCommand::Set, vec![mac_a, mac_b]);
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        if let AoePayload::Reserve(r) = reply.payload {
            assert_eq!(r.macs.len(), 2);
        } else {
            panic!("expected reserve payload");
        }
        replies.clear();

        // C's write is rejected with a reservation conflict
        let mut frame = ata_frame(2, 0x34, 0, 1, vec![0u8; 512]);
        frame.header.src_mac = mac_c;
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        assert!(reply.header.flags.error);
        assert_eq!(reply.header.error, AoeErrorCode::TargetReserved as u8);
        replies.clear();

        // B's write goes through
        let mut frame = ata_frame(3, 0x34, 0, 1, vec![0x5Au8; 512]);
        frame.header.src_mac = mac_b;
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert!(replies.is_empty()); // queued, not yet complete
        run_io(&mut h, &mut replies);
        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        assert_eq!(reply.header.tag, 3);
        assert!(!reply.header.flags.error);
        replies.clear();

        // Clearing the reservation re-admits everyone
        let frame = reserve_frame(4, mac_a, ReserveCommand::Set, vec![]);
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        replies.clear();
        let mut frame = ata_frame(5, 0x34, 8, 1, vec![1u8; 512]);
        frame.header.src_mac = mac_c;
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        run_io(&mut h, &mut replies);
        assert_eq!(replies.len(), 1);
        assert!(!parse_frame(&replies[0].frame).unwrap().header.flags.error);
    }

    #[test]
    fn test_merge_scenario_single_io_two_replies() {
        let mut h = harness_with(|cfg| {
            cfg.merge_delay_ns = 5_000_000; // 5ms window
        });
        let mut replies = Vec::new();
        let now = Instant::now();

        let first = ata_frame(10, 0x34, 100, 8, vec![1u8; 8 * 512]);
        let second = ata_frame(11, 0x34, 108, 8, vec![2u8; 8 * 512]);
        h.device
            .handle_frame(&first, 0, IFACE_MAC, MAX_PAYLOAD, now, &mut replies);
        h.device
            .handle_frame(&second, 0, IFACE_MAC, MAX_PAYLOAD, now, &mut replies);
        assert!(replies.is_empty());
        assert_eq!(h.device.queue.outstanding(), 1);

        // Run once the merge window expired
        let macs = [IFACE_MAC];
        let later = now + Duration::from_millis(6);
        h.device.progress(later, &macs, &mut replies);
        assert_eq!(h.device.stats.io_slots, 1);
        while h.device.queue.inflight() > 0 {
            h.device.ring.submit_and_wait(1).unwrap();
            h.device.process_completions(Instant::now(), &macs, &mut replies);
        }

        // Exactly one kernel I/O; both tags answered OK
        assert_eq!(replies.len(), 2);
        let mut tags: Vec<u32> = replies
            .iter()
            .map(|r| parse_frame(&r.frame).unwrap().header.tag)
            .collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![10, 11]);
        assert_eq!(h.device.stats.write_cnt, 2);
        assert_eq!(h.device.stats.write_bytes, 16 * 512);

        // The backing file got the union of both payloads
        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(h._backing.path()).unwrap();
        let mut sector = [0u8; 512];
        file.seek(SeekFrom::Start(100 * 512)).unwrap();
        file.read_exact(&mut sector).unwrap();
        assert_eq!(sector[0], 1);
        file.seek(SeekFrom::Start(108 * 512)).unwrap();
        file.read_exact(&mut sector).unwrap();
        assert_eq!(sector[0], 2);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let mut h = harness();
        let mut replies = Vec::new();

        let payload: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        let write = ata_frame(20, 0x34, 5, 1, payload.clone());
        h.device
            .handle_frame(&write, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        run_io(&mut h, &mut replies);
        assert_eq!(replies.len(), 1);
        replies.clear();

        let read = ata_frame(21, 0x24, 5, 1, Vec::new());
        h.device
            .handle_frame(&read, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        run_io(&mut h, &mut replies);
        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        if let AoePayload::Ata { data, .. } = reply.payload {
            assert_eq!(data, payload);
        } else {
            panic!("expected ATA payload");
        }
        assert_eq!(h.device.stats.read_cnt, 1);
        assert_eq!(h.device.stats.read_bytes, 512);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        // Read-only uses a plain open; the file still needs content access
        let mut h = harness_with(|cfg| cfg.read_only = true);
        let mut replies = Vec::new();
        let frame = ata_frame(1, 0x34, 0, 1, vec![0u8; 512]);
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        if let AoePayload::Ata { header, .. } = reply.payload {
            assert_ne!(header.cmd_status & ata_status::ERR, 0);
            assert_eq!(header.err_feature, ata_error::ABRT);
        } else {
            panic!("expected ATA payload");
        }
    }

    #[test]
    fn test_queue_over_reports_unavailable() {
        let mut h = harness_with(|cfg| {
            cfg.queue_length = 1;
            cfg.max_delay_ns = 0;
            cfg.merge_delay_ns = 0;
        });
        let mut replies = Vec::new();
        let now = Instant::now();

        // Distinct, non-mergeable ranges
        let first = ata_frame(1, 0x24, 0, 1, Vec::new());
        let second = ata_frame(2, 0x24, 100, 1, Vec::new());
        h.device
            .handle_frame(&first, 0, IFACE_MAC, MAX_PAYLOAD, now, &mut replies);
        let later = now + Duration::from_millis(1);
        h.device
            .handle_frame(&second, 0, IFACE_MAC, MAX_PAYLOAD, later, &mut replies);

        assert_eq!(h.device.stats.queue_over, 1);
        assert_eq!(replies.len(), 1);
        let reply = parse_frame(&replies[0].frame).unwrap();
        assert_eq!(reply.header.tag, 2);
        assert_eq!(reply.header.error, AoeErrorCode::DeviceUnavailable as u8);
    }

    #[test]
    fn test_config_set_and_test() {
        let mut h = harness();
        let mut replies = Vec::new();

        let mut set = AoeFrame {
            header: AoeHeader {
                dst_mac: IFACE_MAC,
                src_mac: INITIATOR,
                version: 1,
                flags: AoeFlags::default(),
                error: 0,
                shelf: 1,
                slot: 0,
                command: AoeCommand::Config,
                tag: 1,
            },
            payload: AoePayload::Config(protocol::ConfigHeader {
                buffer_count: 0,
                firmware_version: 0,
                sector_count: 0,
                aoe_ccmd: (1 << 4) | ConfigCommand::Set as u8,
                config_string: b"owner=pool-a".to_vec(),
            }),
        };
        h.device
            .handle_frame(&set, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert_eq!(replies.len(), 1);
        assert_eq!(h.device.state.config, b"owner=pool-a");
        replies.clear();

        // A different Set is refused while a string is present
        if let AoePayload::Config(config) = &mut set.payload {
            config.config_string = b"owner=pool-b".to_vec();
        }
        h.device
            .handle_frame(&set, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        let reply = parse_frame(&replies[0].frame).unwrap();
        assert_eq!(reply.header.error, AoeErrorCode::ConfigStringPresent as u8);
        assert_eq!(h.device.state.config, b"owner=pool-a");
        replies.clear();

        // Prefix test matches the stored string
        if let AoePayload::Config(config) = &mut set.payload {
            config.aoe_ccmd = (1 << 4) | ConfigCommand::TestPrefix as u8;
            config.config_string = b"owner=".to_vec();
        }
        h.device
            .handle_frame(&set, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert_eq!(replies.len(), 1);

        // Non-matching exact test stays silent
        replies.clear();
        if let AoePayload::Config(config) = &mut set.payload {
            config.aoe_ccmd = (1 << 4) | ConfigCommand::TestExact as u8;
            config.config_string = b"nope".to_vec();
        }
        h.device
            .handle_frame(&set, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_mask_edit_gates_admission() {
        let mut h = harness();
        let mut replies = Vec::new();
        let other: [u8; 6] = [9; 6];

        let edit = AoeFrame {
            header: AoeHeader {
                dst_mac: IFACE_MAC,
                src_mac: INITIATOR,
                version: 1,
                flags: AoeFlags::default(),
                error: 0,
                shelf: 1,
                slot: 0,
                command: AoeCommand::MacMask,
                tag: 1,
            },
            payload: AoePayload::MacMask(protocol::MacMaskHeader {
                command: MaskCommand::Edit,
                merror: 0,
                directives: vec![protocol::MaskDirective {
                    command: MaskDirCommand::Add,
                    mac: INITIATOR,
                }],
            }),
        };
        h.device
            .handle_frame(&edit, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert_eq!(replies.len(), 1);
        assert!(h.device.state.macmask.contains(&INITIATOR));
        replies.clear();

        // A MAC outside the mask is dropped silently now
        let mut frame = ata_frame(2, 0x24, 0, 1, Vec::new());
        frame.header.src_mac = other;
        h.device
            .handle_frame(&frame, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        assert!(replies.is_empty());
        assert_eq!(h.device.stats.proto_err, 1);
    }

    #[test]
    fn test_virtual_device_reads_zeroes() {
        let statedir = TempDir::new().unwrap();
        let mut cfg = test_cfg("vdisk");
        cfg.dev_type = DeviceType::Virtual;
        cfg.capacity_mib = 16;
        cfg.wwn = [1, 2, 3, 4, 5, 6, 7, 8];

        let mut device = Device::open(
            cfg,
            statedir.path().to_path_buf(),
            Arc::new(PlacementMap::identity()),
        )
        .unwrap();
        assert_eq!(device.total_sectors(), 16 * 2048);

        let mut replies = Vec::new();
        let macs = [IFACE_MAC];
        let write = ata_frame(1, 0x34, 2040, 16, vec![0xA5u8; 16 * 512]);
        device.handle_frame(&write, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        device.progress(Instant::now(), &macs, &mut replies);
        while device.queue.inflight() > 0 {
            device.ring.submit_and_wait(1).unwrap();
            device.process_completions(Instant::now(), &macs, &mut replies);
        }
        assert_eq!(replies.len(), 1);
        assert!(!parse_frame(&replies[0].frame).unwrap().header.flags.error);
        replies.clear();

        // Read spanning the same object boundary returns the payload
        let read = ata_frame(2, 0x24, 2040, 16, Vec::new());
        device.handle_frame(&read, 0, IFACE_MAC, MAX_PAYLOAD, Instant::now(), &mut replies);
        device.progress(Instant::now(), &macs, &mut replies);
        while device.queue.inflight() > 0 {
            device.ring.submit_and_wait(1).unwrap();
            device.process_completions(Instant::now(), &macs, &mut replies);
        }
        let reply = parse_frame(&replies[0].frame).unwrap();
        if let AoePayload::Ata { data, .. } = reply.payload {
            assert_eq!(data, vec![0xA5u8; 16 * 512]);
        } else {
            panic!("expected ATA payload");
        }
    }
}
