//! Live session state and the single inbound dispatch point.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::CertificateDer;
use rustls::CipherSuite;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use voxlink_protocol::{Message, MessageBody, MessageKind, SessionId};

use crate::collaborators::Collaborators;
use crate::control::{ControlWriter, TransportError};
use crate::datagram::DatagramChannel;

const UNMEASURED: u64 = u64::MAX;
/// Most departed peers remembered for dropping late voice frames.
const DEPARTED_CAPACITY: usize = 256;

/// Which transport delivered (or will carry) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Datagram,
}

/// Last measured round-trip time per channel, readable from any thread.
#[derive(Debug)]
pub struct RoundTripTimes {
    control_us: AtomicU64,
    datagram_us: AtomicU64,
}

impl Default for RoundTripTimes {
    fn default() -> Self {
        Self {
            control_us: AtomicU64::new(UNMEASURED),
            datagram_us: AtomicU64::new(UNMEASURED),
        }
    }
}

impl RoundTripTimes {
    pub fn record(&self, via: ChannelKind, rtt_us: u64) {
        let slot = match via {
            ChannelKind::Control => &self.control_us,
            ChannelKind::Datagram => &self.datagram_us,
        };
        slot.store(rtt_us.min(UNMEASURED - 1), Ordering::Relaxed);
    }

    pub fn get(&self, via: ChannelKind) -> Option<Duration> {
        let us = match via {
            ChannelKind::Control => self.control_us.load(Ordering::Relaxed),
            ChannelKind::Datagram => self.datagram_us.load(Ordering::Relaxed),
        };
        (us != UNMEASURED).then(|| Duration::from_micros(us))
    }

    pub fn control(&self) -> Option<Duration> {
        self.get(ChannelKind::Control)
    }

    pub fn datagram(&self) -> Option<Duration> {
        self.get(ChannelKind::Datagram)
    }

    pub fn reset(&self) {
        self.control_us.store(UNMEASURED, Ordering::Relaxed);
        self.datagram_us.store(UNMEASURED, Ordering::Relaxed);
    }
}

/// Monotonic microsecond clock used for ping timestamps.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock(Instant);

impl SessionClock {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    pub fn now_us(&self) -> u64 {
        self.0.elapsed().as_micros() as u64
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Datagram,
    Control { flush: bool },
}

/// An encoded message on its way from any thread into the session's queue.
/// An empty payload is the close sentinel; real messages are never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutbound {
    pub payload: Vec<u8>,
    /// Push through the TLS layer immediately instead of coalescing.
    pub flush: bool,
    /// Latency-sensitive and not forced onto the reliable channel.
    pub datagram_eligible: bool,
}

impl PendingOutbound {
    pub fn new(kind: MessageKind, payload: Vec<u8>, force_reliable: bool) -> Self {
        let datagram_eligible = kind.is_latency_sensitive() && !force_reliable;
        Self {
            payload,
            flush: datagram_eligible,
            datagram_eligible,
        }
    }

    pub fn close() -> Self {
        Self {
            payload: Vec::new(),
            flush: false,
            datagram_eligible: false,
        }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    /// `datagram_usable`: the datagram channel is open and TCP-compat mode
    /// is off.
    pub fn route(&self, datagram_usable: bool) -> Route {
        if self.datagram_eligible && datagram_usable {
            Route::Datagram
        } else {
            Route::Control { flush: self.flush }
        }
    }
}

/// Applies inbound messages to session state and hands them to the audio
/// output or the UI.
pub struct Dispatcher {
    collab: Collaborators,
    rtt: Arc<RoundTripTimes>,
    local_session: Arc<AtomicU32>,
    /// Peers that announced they left; their audio state is already purged.
    departed: HashSet<SessionId>,
    /// Departure order, oldest first. Bounds `departed` to `DEPARTED_CAPACITY`.
    departed_order: VecDeque<SessionId>,
}

impl Dispatcher {
    pub fn new(
        collab: Collaborators,
        rtt: Arc<RoundTripTimes>,
        local_session: Arc<AtomicU32>,
    ) -> Self {
        Self {
            collab,
            rtt,
            local_session,
            departed: HashSet::new(),
            departed_order: VecDeque::new(),
        }
    }

    fn mark_departed(&mut self, peer: SessionId) {
        if !self.departed.insert(peer) {
            return;
        }
        self.departed_order.push_back(peer);
        while self.departed_order.len() > DEPARTED_CAPACITY {
            if let Some(oldest) = self.departed_order.pop_front() {
                self.departed.remove(&oldest);
            }
        }
    }

    fn mark_returned(&mut self, peer: SessionId) {
        if self.departed.remove(&peer) {
            self.departed_order.retain(|p| *p != peer);
        }
    }

    #[cfg(test)]
    fn departed_len(&self) -> usize {
        self.departed.len()
    }

    pub fn dispatch(&mut self, msg: Message, via: ChannelKind, now_us: u64) {
        let peer = msg.session;
        match &msg.body {
            MessageBody::Ping { timestamp } => {
                let rtt_us = now_us.saturating_sub(*timestamp);
                trace!(?via, rtt_us, "ping reply");
                self.rtt.record(via, rtt_us);
            }
            MessageBody::VoiceFrame { sequence, payload } => {
                let Some(output) = self.collab.audio_output() else {
                    return;
                };
                if self.departed.contains(&peer) {
                    trace!(peer, "late voice frame from departed peer");
                    return;
                }
                match self.collab.peers.lookup(peer) {
                    Some(status) if !status.locally_muted => {
                        output.add_frame(peer, payload, *sequence)
                    }
                    Some(_) => {}
                    None => {
                        debug!(peer, "voice frame for unknown peer, purging its buffer");
                        output.remove_buffered_state(peer);
                    }
                }
            }
            MessageBody::PeerLeft => {
                if let Some(output) = self.collab.audio_output() {
                    output.remove_buffered_state(peer);
                }
                self.mark_departed(peer);
                self.collab.observer.message(msg);
            }
            MessageBody::PeerJoined { .. } => {
                self.mark_returned(peer);
                self.collab.observer.message(msg);
            }
            MessageBody::ServerSync { .. } => {
                debug!(session = peer, "server assigned local session");
                self.local_session.store(peer, Ordering::Relaxed);
                self.collab.observer.message(msg);
            }
            MessageBody::Authenticate { .. }
            | MessageBody::ServerReject { .. }
            | MessageBody::TextMessage { .. } => self.collab.observer.message(msg),
        }
    }
}

/// Snapshot of the established connection, for display.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer_addr: SocketAddr,
    /// Leaf first.
    pub certificates: Vec<CertificateDer<'static>>,
    pub cipher: Option<CipherSuite>,
    /// Local port of the voice channel, if it could be bound.
    pub datagram_port: Option<u16>,
}

/// A connected session. Owned by the handler thread only.
pub struct Session {
    pub info: SessionInfo,
    pub writer: ControlWriter,
    pub datagram: Option<DatagramChannel>,
    pub dispatcher: Dispatcher,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn accepts_datagram(&self, from: SocketAddr) -> bool {
        self.datagram.as_ref().is_some_and(|d| d.accepts(from))
    }

    pub fn datagram_open(&self) -> bool {
        self.datagram.as_ref().is_some_and(DatagramChannel::is_open)
    }

    pub async fn execute(
        &mut self,
        pending: PendingOutbound,
        tcp_compat: bool,
    ) -> Result<(), TransportError> {
        let usable = !tcp_compat && self.datagram_open();
        match pending.route(usable) {
            Route::Datagram => {
                if let Some(datagram) = &self.datagram {
                    datagram.send(&pending.payload);
                }
                Ok(())
            }
            Route::Control { flush } => self.writer.send(&pending.payload, flush).await,
        }
    }

    /// Stop the receive tasks and close both channels.
    pub async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(datagram) = self.datagram.take() {
            datagram.close();
        }
        self.writer.close().await;
    }
}
