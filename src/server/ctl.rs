//! Control socket server
//!
//! Owns the UNIX datagram socket the control client talks to. Clients bind
//! their own `<socket>.<pid>` path so the daemon can answer them. The
//! HELLO handshake is tracked per client address; requests from clients
//! that never greeted are dropped.

use crate::ctl::{
    decode_request, encode_reply, CtlReply, CtlRequest, CTL_MAX_PACKET, CTL_PROTO_VERSION,
};
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

pub struct CtlServer {
    socket: UnixDatagram,
    path: PathBuf,
    greeted: HashSet<PathBuf>,
}

impl CtlServer {
    pub fn bind(path: &Path) -> io::Result<Self> {
        // A previous instance may have left its socket behind
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        log::info!("control socket listening at {}", path.display());
        Ok(Self {
            socket,
            path: path.to_path_buf(),
            greeted: HashSet::new(),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Drain the socket. HELLO is answered here; every other validated
    /// request is returned for the server to act on.
    pub fn recv_requests(&mut self) -> Vec<(PathBuf, CtlRequest)> {
        let mut requests = Vec::new();
        let mut buf = vec![0u8; CTL_MAX_PACKET];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf) {
                Ok(result) => result,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("control socket receive failed: {}", err);
                    break;
                }
            };
            let client = match addr.as_pathname() {
                Some(path) => path.to_path_buf(),
                None => {
                    log::warn!("dropping control request from unnamed client");
                    continue;
                }
            };
            let request = match decode_request(&buf[..len]) {
                Ok(request) => request,
                Err(err) => {
                    log::warn!("{}: bad control request: {}", client.display(), err);
                    continue;
                }
            };

            if request == CtlRequest::Hello {
                self.greeted.insert(client.clone());
                self.send(&client, &CtlReply::Hello {
                    version: CTL_PROTO_VERSION,
                });
                continue;
            }
            if !self.greeted.contains(&client) {
                log::warn!("{}: request before HELLO, dropping", client.display());
                continue;
            }
            requests.push((client, request));
        }
        requests
    }

    pub fn send(&self, client: &Path, reply: &CtlReply) {
        let data = match encode_reply(reply) {
            Ok(data) => data,
            Err(err) => {
                log::error!("failed to encode control reply: {}", err);
                return;
            }
        };
        if let Err(err) = self.socket.send_to(&data, client) {
            // The client may have exited; forget it
            log::debug!("{}: control send failed: {}", client.display(), err);
        }
    }

}

impl Drop for CtlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
