//! ggaoed - ATA over Ethernet target daemon
//!
//! Usage:
//!   ggaoed [OPTIONS]
//!
//! Example:
//!   ggaoed -c /etc/ggaoed.conf

use anyhow::{bail, Context, Result};
use clap::Parser;
use ggaoed::config::Config;
use ggaoed::server::event::ShutdownToken;
use ggaoed::server::{RunOutcome, Server};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "ggaoed",
    version,
    about = "ATA over Ethernet target daemon",
    long_about = None
)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/ggaoed.conf")]
    config: PathBuf,

    /// Debug mode: verbose logging plus per-request I/O tracing
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if args.debug { "debug" } else { "info" },
    ))
    .init();

    let config = load_config(&args.config, args.debug)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    log::info!("ggaoed v{}", env!("CARGO_PKG_VERSION"));

    let _pid_guard = PidFile::write(&config.defaults.pid_file)?;

    let token = ShutdownToken::install().context("failed to install signal handlers")?;
    let mut server = Server::new(config, token).context("failed to start")?;

    loop {
        match server.run() {
            RunOutcome::Exit => break,
            RunOutcome::Reload => {
                token.clear_reload();
                log::info!("reload request received");
                match load_config(&args.config, args.debug) {
                    Ok(config) => server.reload(config),
                    Err(err) => {
                        // The previous configuration stays in effect
                        log::error!("the config file contains errors, not reloading: {err:#}");
                    }
                }
            }
        }
    }

    server.shutdown();
    Ok(())
}

fn load_config(path: &Path, debug: bool) -> Result<Config> {
    let mut config = Config::load(path)?;
    if debug {
        // The command line overrides the configuration
        config.defaults.trace_io = true;
        for device in &mut config.devices {
            device.trace_io = true;
        }
    }
    Ok(config)
}

/// Holds the locked PID file for the daemon's lifetime.
struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    fn write(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to create the pid file {}", path.display()))?;

        let locked = unsafe { libc::lockf(file.as_raw_fd(), libc::F_TLOCK, 0) } == 0;
        if !locked {
            bail!("another instance of the daemon seems to be already running");
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
