//! ggaoed - an ATA over Ethernet target daemon
//!
//! This crate exports local block devices (or virtual disks placed through a
//! CRUSH-style map) on the local Ethernet segment. The data plane runs on a
//! single event-loop thread: memory-mapped AF_PACKET rings on the network
//! side, io_uring with eventfd completion notification on the disk side.

pub mod acl;
pub mod config;
pub mod ctl;
pub mod placement;
pub mod protocol;
pub mod server;
pub mod state;

pub use acl::AclMap;
pub use config::{Config, ConfigError};
pub use protocol::AoeError;
