//! Unreliable datagram channel for voice and ping traffic.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use voxlink_protocol::codec::MAX_DATAGRAM_SIZE;

/// Kernel buffer size for the voice socket.
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// UDP socket bound to an ephemeral port and aimed at one peer.
///
/// The socket handle is behind a mutex held only while binding, sending or
/// closing, so a close racing a send never sees a half-torn-down socket.
/// Sends after [`close`](Self::close) are dropped.
pub struct DatagramChannel {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    peer: SocketAddr,
    local_addr: SocketAddr,
}

impl DatagramChannel {
    /// Bind an ephemeral local port in `peer`'s address family.
    /// Must be called from within a tokio runtime.
    pub fn bind(peer: SocketAddr) -> io::Result<Self> {
        let sock = socket2::Socket::new(
            socket2::Domain::for_address(peer),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("could not set UDP receive buffer: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("could not set UDP send buffer: {}", e);
        }
        let any: SocketAddr = match peer {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        sock.bind(&any.into())?;
        sock.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(sock.into())?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, %peer, "UDP voice channel bound");

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            peer,
            local_addr,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_open(&self) -> bool {
        self.socket
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Only datagrams from the exact address and port of the control peer
    /// are ours.
    pub fn accepts(&self, from: SocketAddr) -> bool {
        from == self.peer
    }

    /// Handle for the receive loop, or `None` once closed.
    pub fn receiver(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Fire-and-forget send to the peer. Returns whether the datagram was
    /// handed to the kernel.
    pub fn send(&self, payload: &[u8]) -> bool {
        if payload.len() > MAX_DATAGRAM_SIZE {
            warn!(len = payload.len(), "datagram too large, dropping");
            return false;
        }
        let guard = self.socket.lock().unwrap_or_else(|p| p.into_inner());
        let Some(socket) = guard.as_ref() else {
            trace!("UDP channel closed, dropping datagram");
            return false;
        };
        match socket.try_send_to(payload, self.peer) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("UDP send buffer full, dropping datagram");
                false
            }
            Err(e) => {
                warn!(peer = %self.peer, "UDP send error: {}", e);
                false
            }
        }
    }

    /// Release the socket. Idempotent.
    pub fn close(&self) {
        let mut guard = self.socket.lock().unwrap_or_else(|p| p.into_inner());
        if guard.take().is_some() {
            debug!(local_addr = %self.local_addr, "UDP voice channel closed");
        }
    }
}
