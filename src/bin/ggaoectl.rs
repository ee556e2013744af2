//! ggaoectl - control client for the ggaoed daemon
//!
//! Talks to the daemon over its UNIX datagram control socket. The client
//! binds `<socket>.<pid>` so the daemon can answer, greets with HELLO and
//! then issues one command (or loops, for `monitor`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ggaoed::acl::format_mac;
use ggaoed::ctl::{
    decode_reply, encode_request, CtlReply, CtlRequest, DeviceStats, NetifStats,
    CTL_MAX_PACKET, CTL_PROTO_VERSION,
};
use std::collections::HashMap;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_INTERVAL: f64 = 1.0;

#[derive(Parser)]
#[command(name = "ggaoectl", version, about = "Control the ggaoed daemon")]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = "/etc/ggaoed.conf")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reload the configuration file
    Reload,
    /// Monitor devices/interfaces ([interval] [name...])
    Monitor { args: Vec<String> },
    /// Dump device/interface statistics
    Stats { names: Vec<String> },
    /// Show the AoE configuration strings
    ShowConfig { names: Vec<String> },
    /// Show the AoE MAC mask lists
    ShowMacmask { names: Vec<String> },
    /// Show the AoE reservation lists
    ShowReserve { names: Vec<String> },
    /// Clear device/interface statistics
    ClearStats { names: Vec<String> },
    /// Clear the AoE configuration strings
    ClearConfig { names: Vec<String> },
    /// Clear the AoE MAC mask lists
    ClearMacmask { names: Vec<String> },
    /// Clear the AoE reservation lists
    ClearReserve { names: Vec<String> },
}

/// The client socket; the local path is unlinked on drop.
struct Client {
    socket: UnixDatagram,
    local_path: PathBuf,
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.local_path);
    }
}

impl Client {
    fn connect(ctl_socket: &PathBuf) -> Result<Self> {
        let local_path = PathBuf::from(format!(
            "{}.{}",
            ctl_socket.display(),
            std::process::id()
        ));
        let socket = UnixDatagram::bind(&local_path)
            .with_context(|| format!("failed to bind {}", local_path.display()))?;
        let client = Self { socket, local_path };
        client
            .socket
            .connect(ctl_socket)
            .with_context(|| format!("failed to connect to {}", ctl_socket.display()))?;
        client
            .socket
            .set_read_timeout(Some(Duration::from_secs(5)))?;

        client.send(&CtlRequest::Hello)?;
        match client.recv()? {
            CtlReply::Hello { version } if version == CTL_PROTO_VERSION => Ok(client),
            _ => bail!("unknown response for HELLO"),
        }
    }

    fn send(&self, request: &CtlRequest) -> Result<()> {
        let data = encode_request(request)?;
        self.socket.send(&data).context("sendmsg()")?;
        Ok(())
    }

    fn recv(&self) -> Result<CtlReply> {
        let mut buf = vec![0u8; CTL_MAX_PACKET];
        let len = self.socket.recv(&mut buf).context("recv()")?;
        Ok(decode_reply(&buf[..len])?)
    }

    /// Send a request and collect replies until OK.
    fn transact(&self, request: &CtlRequest) -> Result<Vec<CtlReply>> {
        self.send(request)?;
        let mut replies = Vec::new();
        loop {
            match self.recv()? {
                CtlReply::Ok => return Ok(replies),
                reply => replies.push(reply),
            }
        }
    }
}

/// Only the control-socket path is needed from the daemon configuration.
fn ctl_socket_path(config: &PathBuf) -> PathBuf {
    std::fs::read_to_string(config)
        .ok()
        .and_then(|content| content.parse::<toml::Table>().ok())
        .and_then(|table| {
            table
                .get("defaults")
                .and_then(|v| v.as_table())
                .and_then(|defaults| defaults.get("control-socket"))
                .and_then(|v| v.as_str())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("/var/run/ggaoed.ctl"))
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let client = Client::connect(&ctl_socket_path(&args.config))?;

    match args.command {
        Command::Reload => {
            client.transact(&CtlRequest::Reload)?;
        }
        Command::Monitor { args } => do_monitor(&client, args)?,
        Command::Stats { names } => do_stats(&client, names)?,
        Command::ShowConfig { names } => {
            for reply in client.transact(&CtlRequest::GetConfig(names))? {
                if let CtlReply::Config { name, config } = reply {
                    print_config(&name, &config);
                }
            }
        }
        Command::ShowMacmask { names } => {
            show_maclists(&client, &CtlRequest::GetMacMask(names))?
        }
        Command::ShowReserve { names } => {
            show_maclists(&client, &CtlRequest::GetReserve(names))?
        }
        Command::ClearStats { names } => {
            client.transact(&CtlRequest::ClearStats(names))?;
        }
        Command::ClearConfig { names } => {
            require_names(&names)?;
            client.transact(&CtlRequest::ClearConfig(names))?;
        }
        Command::ClearMacmask { names } => {
            require_names(&names)?;
            client.transact(&CtlRequest::ClearMacMask(names))?;
        }
        Command::ClearReserve { names } => {
            require_names(&names)?;
            client.transact(&CtlRequest::ClearReserve(names))?;
        }
    }
    Ok(())
}

fn require_names(names: &[String]) -> Result<()> {
    if names.is_empty() {
        bail!("no names were given on the command line");
    }
    Ok(())
}

fn show_maclists(client: &Client, request: &CtlRequest) -> Result<()> {
    for reply in client.transact(request)? {
        if let CtlReply::MacList { name, macs } = reply {
            println!("Device {name}:");
            for chunk in macs.chunks(4) {
                let line: Vec<String> = chunk.iter().map(format_mac).collect();
                println!("{}", line.join(" "));
            }
            println!();
        }
    }
    Ok(())
}

fn print_config(name: &str, config: &[u8]) {
    println!("Device {name}:");
    for chunk in config.chunks(16) {
        let mut line = String::new();
        for byte in chunk {
            line.push_str(&format!("{byte:02x} "));
        }
        for _ in chunk.len()..16 {
            line.push_str("   ");
        }
        line.push(' ');
        for &byte in chunk {
            line.push(if (32..127).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        println!("{line}");
    }
    println!();
}

fn do_stats(client: &Client, names: Vec<String>) -> Result<()> {
    client.send(&CtlRequest::GetStats(names))?;
    match client.recv()? {
        CtlReply::Uptime { .. } => {}
        _ => bail!("unexpected message"),
    }
    loop {
        match client.recv()? {
            CtlReply::Ok => return Ok(()),
            CtlReply::DevStat { name, stats } => {
                println!("# Statistics for device {name}");
                dump_devstats(&stats);
                println!();
            }
            CtlReply::NetStat { name, stats } => {
                println!("# Statistics for interface {name}");
                dump_netstats(&stats);
                println!();
            }
            _ => bail!("unexpected message"),
        }
    }
}

fn dump_devstats(stats: &DeviceStats) {
    println!("read_cnt: {}", stats.read_cnt);
    println!("read_bytes: {}", stats.read_bytes);
    println!("read_time: {}", fmt_time(stats.read_time_ns));
    println!("write_cnt: {}", stats.write_cnt);
    println!("write_bytes: {}", stats.write_bytes);
    println!("write_time: {}", fmt_time(stats.write_time_ns));
    println!("other_cnt: {}", stats.other_cnt);
    println!("other_time: {}", fmt_time(stats.other_time_ns));
    println!("io_slots: {}", stats.io_slots);
    println!("io_runs: {}", stats.io_runs);
    println!("queue_length: {}", stats.queue_length);
    println!("queue_stall: {}", stats.queue_stall);
    println!("queue_over: {}", stats.queue_over);
    println!("ata_err: {}", stats.ata_err);
    println!("proto_err: {}", stats.proto_err);
}

fn dump_netstats(stats: &NetifStats) {
    println!("rx_cnt: {}", stats.rx_cnt);
    println!("rx_bytes: {}", stats.rx_bytes);
    println!("rx_runs: {}", stats.rx_runs);
    println!("rx_buffers_full: {}", stats.rx_buffers_full);
    println!("tx_cnt: {}", stats.tx_cnt);
    println!("tx_bytes: {}", stats.tx_bytes);
    println!("tx_runs: {}", stats.tx_runs);
    println!("tx_buffers_full: {}", stats.tx_buffers_full);
    println!("dropped: {}", stats.dropped);
    println!("ignored: {}", stats.ignored);
    println!("broadcast: {}", stats.broadcast);
}

fn fmt_time(ns: u64) -> String {
    format!("{}", ns as f64 / 1e9)
}

fn do_monitor(client: &Client, mut args: Vec<String>) -> Result<()> {
    // A leading numeric argument is the update interval
    let interval = match args.first().and_then(|arg| arg.parse::<f64>().ok()) {
        Some(value) => {
            args.remove(0);
            value
        }
        None => DEFAULT_INTERVAL,
    };

    let mut prev_dev: HashMap<String, DeviceStats> = HashMap::new();
    let mut prev_net: HashMap<String, NetifStats> = HashMap::new();
    let mut prev_uptime = 0u64;

    loop {
        client.send(&CtlRequest::GetStats(args.clone()))?;
        let uptime = match client.recv()? {
            CtlReply::Uptime { uptime_ns } => uptime_ns,
            _ => bail!("unexpected message"),
        };
        let elapsed = (uptime.saturating_sub(prev_uptime)) as f64 / 1e9;
        prev_uptime = uptime;

        let mut devices: Vec<(String, DeviceStats)> = Vec::new();
        let mut netifs: Vec<(String, NetifStats)> = Vec::new();
        loop {
            match client.recv()? {
                CtlReply::Ok => break,
                CtlReply::DevStat { name, stats } => devices.push((name, stats)),
                CtlReply::NetStat { name, stats } => netifs.push((name, stats)),
                _ => bail!("unexpected message"),
            }
        }

        let width = devices
            .iter()
            .map(|(name, _)| name.len())
            .chain(netifs.iter().map(|(name, _)| name.len()))
            .max()
            .unwrap_or(4)
            .max(4);

        if !devices.is_empty() {
            println!(
                "{:<width$}   rrqm/s      rkB/s   wrqm/s      wkB/s oth avgqsz qs qf ae pe    svctm",
                "dev",
            );
        }
        for (name, stats) in &devices {
            let old = prev_dev.get(name).copied().unwrap_or_default();
            print_dev_rates(name, stats, &old, elapsed, width);
            prev_dev.insert(name.clone(), *stats);
        }
        if !devices.is_empty() && !netifs.is_empty() {
            println!();
        }
        if !netifs.is_empty() {
            println!(
                "{:<width$}    rx/s      rkB/s     tx/s      tkB/s drp  avrun",
                "net",
            );
        }
        for (name, stats) in &netifs {
            let old = prev_net.get(name).copied().unwrap_or_default();
            print_net_rates(name, stats, &old, elapsed, width);
            prev_net.insert(name.clone(), *stats);
        }
        println!();

        std::thread::sleep(Duration::from_secs_f64(interval));
    }
}

fn print_dev_rates(name: &str, new: &DeviceStats, old: &DeviceStats, elapsed: f64, width: usize) {
    let elapsed = if elapsed > 0.0 { elapsed } else { 1.0 };
    let reads = new.read_cnt - old.read_cnt;
    let writes = new.write_cnt - old.write_cnt;
    let others = new.other_cnt - old.other_cnt;
    let allreq = reads + writes + others as u64;

    let time_ns = (new.read_time_ns - old.read_time_ns)
        + (new.write_time_ns - old.write_time_ns)
        + (new.other_time_ns - old.other_time_ns);
    let (svctm, avgqsz) = if allreq > 0 {
        (
            time_ns as f64 / 1e6 / allreq as f64,
            (new.queue_length - old.queue_length) as f64 / allreq as f64,
        )
    } else {
        (0.0, 0.0)
    };

    println!(
        "{:<width$} {:8.1} {:10.2} {:8.1} {:10.2} {:3} {:6.2} {:2} {:2} {:2} {:2} {:8.2}",
        name,
        reads as f64 / elapsed,
        (new.read_bytes - old.read_bytes) as f64 / 1024.0 / elapsed,
        writes as f64 / elapsed,
        (new.write_bytes - old.write_bytes) as f64 / 1024.0 / elapsed,
        others,
        avgqsz,
        new.queue_stall - old.queue_stall,
        new.queue_over - old.queue_over,
        new.ata_err - old.ata_err,
        new.proto_err - old.proto_err,
        svctm,
    );
}

fn print_net_rates(name: &str, new: &NetifStats, old: &NetifStats, elapsed: f64, width: usize) {
    let elapsed = if elapsed > 0.0 { elapsed } else { 1.0 };
    let runs = (new.rx_runs - old.rx_runs) + (new.tx_runs - old.tx_runs);
    let frames = (new.rx_cnt - old.rx_cnt) + (new.tx_cnt - old.tx_cnt);
    let avrun = if runs > 0 {
        frames as f64 / runs as f64
    } else {
        0.0
    };

    println!(
        "{:<width$} {:8.1} {:10.2} {:8.1} {:10.2} {:3} {:6.2}",
        name,
        (new.rx_cnt - old.rx_cnt) as f64 / elapsed,
        (new.rx_bytes - old.rx_bytes) as f64 / 1024.0 / elapsed,
        (new.tx_cnt - old.tx_cnt) as f64 / elapsed,
        (new.tx_bytes - old.tx_bytes) as f64 / 1024.0 / elapsed,
        new.dropped - old.dropped,
        avrun,
    );
}
