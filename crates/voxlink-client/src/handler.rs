//! The per-connection coordinator.
//!
//! [`ServerHandler::start`] spawns a dedicated thread running a
//! single-threaded tokio runtime. That thread owns the [`Session`] and is the
//! only place channels are opened, written and closed. Other threads talk to
//! it through one unbounded FIFO queue: outbound messages, inbound frames and
//! datagrams, and the disconnect request all flow through the same queue, so
//! they are handled strictly in arrival order.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use voxlink_protocol::codec::MAX_DATAGRAM_SIZE;
use voxlink_protocol::{decode, encode, Message, MessageKind, ProtocolError, SessionId};

use crate::collaborators::{Collaborators, SessionObserver};
use crate::config::{
    ClientSettings, ConnectionParameters, LoopbackMode, TrustSettings, VoiceSettings,
};
use crate::control::{CertificateReviewer, ControlChannel, FrameReader, TransportError};
use crate::datagram::DatagramChannel;
use crate::session::{
    ChannelKind, Dispatcher, PendingOutbound, RoundTripTimes, Session, SessionClock, SessionInfo,
};
use crate::trust::{self, CertificateDecision, CertificateIssue, PinStore};

/// Interval between keep-alive pings on each channel.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    CertificateReview,
    Authenticating,
    Connected,
    Disconnecting,
}

/// Why a session ended. Reported exactly once per [`ServerHandler`].
#[derive(Debug, Clone, Error)]
pub enum DisconnectReason {
    #[error("{0}")]
    Transport(String),

    #[error("server certificate rejected: {}", describe_issues(.0))]
    CertificateRejected(CertificateDecision),

    #[error("server closed the connection")]
    ClosedByServer,

    #[error("disconnected")]
    Requested,
}

fn describe_issues(decision: &CertificateDecision) -> String {
    decision
        .reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<TransportError> for DisconnectReason {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

enum Event {
    Outbound(PendingOutbound),
    /// Outbound voice diverted by local loopback, not yet "delivered".
    LoopbackSend(Vec<u8>),
    /// A loopback frame coming back in.
    LoopbackEcho(Vec<u8>),
    ControlFrame(Vec<u8>),
    ControlClosed(DisconnectReason),
    Datagram { payload: Vec<u8>, from: SocketAddr },
}

/// Publishes state changes to the watch channel and the observer.
struct StatePublisher {
    tx: watch::Sender<ConnectionState>,
    observer: Arc<dyn SessionObserver>,
}

impl StatePublisher {
    fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "connection state changed");
            self.observer.state_changed(state);
        }
    }
}

/// Runs the trust evaluator when native validation rejects the chain.
struct PinReviewer {
    host: String,
    port: u16,
    pins: Arc<dyn PinStore>,
    states: Arc<StatePublisher>,
    decision: Mutex<Option<CertificateDecision>>,
}

impl PinReviewer {
    fn take_decision(&self) -> Option<CertificateDecision> {
        self.decision.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

impl CertificateReviewer for PinReviewer {
    fn review(&self, chain: &[CertificateDer<'static>], error: &rustls::Error) -> bool {
        self.states.set(ConnectionState::CertificateReview);
        let issues = [CertificateIssue::from(error)];
        let decision = trust::evaluate(chain, &issues, &self.host, self.port, self.pins.as_ref());
        let trusted = decision.trusted;
        *self.decision.lock().unwrap_or_else(|p| p.into_inner()) = Some(decision);
        trusted
    }
}

/// Handle to one connection attempt and, if it succeeds, its session.
///
/// Every method is safe to call from any thread. Dropping the handle requests
/// a disconnect and waits for the session thread to finish.
pub struct ServerHandler {
    params: ConnectionParameters,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ConnectionState>,
    rtt: Arc<RoundTripTimes>,
    local_session: Arc<AtomicU32>,
    info: Arc<Mutex<Option<SessionInfo>>>,
    loopback: LoopbackMode,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandler {
    /// Start connecting in the background. Connection is optimistic: this
    /// returns as soon as the session thread exists, and progress is reported
    /// through the observer.
    pub fn start(
        params: ConnectionParameters,
        settings: ClientSettings,
        collab: Collaborators,
    ) -> io::Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let rtt = Arc::new(RoundTripTimes::default());
        let local_session = Arc::new(AtomicU32::new(0));
        let info = Arc::new(Mutex::new(None));
        let voice = settings.voice.clamped();
        let loopback = voice.loopback;

        let coordinator = Coordinator {
            params: params.clone(),
            voice,
            trust: settings.trust,
            states: Arc::new(StatePublisher {
                tx: state_tx,
                observer: collab.observer.clone(),
            }),
            collab,
            events_tx: events_tx.clone(),
            rtt: rtt.clone(),
            local_session: local_session.clone(),
            info: info.clone(),
            clock: SessionClock::start(),
        };

        let thread = thread::Builder::new()
            .name("server-handler".into())
            .spawn(move || coordinator.run(events_rx))?;

        Ok(Self {
            params,
            events: events_tx,
            state: state_rx,
            rtt,
            local_session,
            info,
            loopback,
            thread: Some(thread),
        })
    }

    pub fn connection_info(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn round_trip_times(&self) -> &RoundTripTimes {
        &self.rtt
    }

    /// Session id the server assigned us, 0 until the server sync arrives.
    pub fn local_session(&self) -> SessionId {
        self.local_session.load(Ordering::Relaxed)
    }

    /// Peer address, certificate chain and cipher of the live session.
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.info.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Queue a message for the server. The message is stamped with our
    /// session id and encoded on the calling thread.
    ///
    /// Voice and ping go over the datagram channel when it is available
    /// unless `force_reliable` is set. Messages queued after the session
    /// ended are dropped.
    pub fn send_message(&self, mut msg: Message, force_reliable: bool) -> Result<(), ProtocolError> {
        msg.session = self.local_session();
        let kind = msg.kind();
        let payload = encode(&msg)?;

        let event = if kind == MessageKind::VoiceFrame && self.loopback == LoopbackMode::Local {
            Event::LoopbackSend(payload)
        } else {
            Event::Outbound(PendingOutbound::new(kind, payload, force_reliable))
        };
        if self.events.send(event).is_err() {
            trace!(?kind, "session gone, dropping outbound message");
        }
        Ok(())
    }

    /// Request a disconnect. Idempotent; returns immediately.
    pub fn disconnect(&self) {
        let _ = self.events.send(Event::Outbound(PendingOutbound::close()));
    }

    /// Wait for the session thread to finish.
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("server handler thread panicked");
            }
        }
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        self.disconnect();
        self.join_thread();
    }
}

/// State owned by the session thread.
struct Coordinator {
    params: ConnectionParameters,
    voice: VoiceSettings,
    trust: TrustSettings,
    collab: Collaborators,
    states: Arc<StatePublisher>,
    events_tx: mpsc::UnboundedSender<Event>,
    rtt: Arc<RoundTripTimes>,
    local_session: Arc<AtomicU32>,
    info: Arc<Mutex<Option<SessionInfo>>>,
    clock: SessionClock,
}

impl Coordinator {
    fn run(self, mut events: mpsc::UnboundedReceiver<Event>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("failed to start session runtime: {}", e);
                self.collab
                    .observer
                    .disconnected(&DisconnectReason::Transport(e.to_string()));
                return;
            }
        };
        runtime.block_on(self.run_session(&mut events));
        info!(host = %self.params.host, "server handler finished");
    }

    async fn run_session(&self, events: &mut mpsc::UnboundedReceiver<Event>) {
        self.states.set(ConnectionState::Connecting);

        let (channel, backlog) = match self.connect(events).await {
            Ok(connected) => connected,
            Err(reason) => {
                if !matches!(reason, DisconnectReason::Requested) {
                    warn!(host = %self.params.host, "connection failed: {}", reason);
                }
                self.collab.observer.disconnected(&reason);
                self.states.set(ConnectionState::Idle);
                return;
            }
        };

        self.states.set(ConnectionState::Authenticating);
        let mut session = self.establish(channel);

        let reason = match self.authenticate(&mut session).await {
            Ok(()) => {
                self.open_datagram(&mut session);
                *self.info.lock().unwrap_or_else(|p| p.into_inner()) = Some(session.info.clone());
                self.states.set(ConnectionState::Connected);
                self.collab.observer.connected();
                self.event_loop(&mut session, events, backlog).await
            }
            Err(e) => e.into(),
        };

        self.states.set(ConnectionState::Disconnecting);
        info!("disconnecting: {}", reason);
        session.close().await;
        *self.info.lock().unwrap_or_else(|p| p.into_inner()) = None;
        if let Some(output) = self.collab.audio_output() {
            output.purge_all();
        }
        self.collab.observer.disconnected(&reason);
        self.states.set(ConnectionState::Idle);
    }

    /// TCP connect plus TLS handshake. Messages queued meanwhile are kept in
    /// order and returned; a disconnect request aborts the attempt.
    async fn connect(
        &self,
        events: &mut mpsc::UnboundedReceiver<Event>,
    ) -> Result<(ControlChannel, VecDeque<Event>), DisconnectReason> {
        let roots = self
            .trust
            .root_store()
            .map_err(|e| DisconnectReason::Transport(e.to_string()))?;
        let reviewer = Arc::new(PinReviewer {
            host: self.params.host.clone(),
            port: self.params.port,
            pins: self.collab.pins.clone(),
            states: self.states.clone(),
            decision: Mutex::new(None),
        });

        let mut backlog = VecDeque::new();
        let connect = ControlChannel::connect(
            &self.params.host,
            self.params.port,
            roots,
            reviewer.clone(),
        );
        tokio::pin!(connect);

        let result = loop {
            tokio::select! {
                result = &mut connect => break result,
                event = events.recv() => match event {
                    Some(Event::Outbound(pending)) if pending.is_close() => {
                        return Err(DisconnectReason::Requested);
                    }
                    Some(event) => backlog.push_back(event),
                    None => return Err(DisconnectReason::Requested),
                },
            }
        };

        match (result, reviewer.take_decision()) {
            (Ok(channel), _) => Ok((channel, backlog)),
            (Err(_), Some(decision)) if !decision.trusted => {
                Err(DisconnectReason::CertificateRejected(decision))
            }
            (Err(e), _) => Err(e.into()),
        }
    }

    fn establish(&self, channel: ControlChannel) -> Session {
        let info = SessionInfo {
            peer_addr: channel.peer_addr(),
            certificates: channel.peer_certificates(),
            cipher: channel.cipher_suite(),
            datagram_port: None,
        };
        let (reader, writer) = channel.split();
        let reader_task = tokio::spawn(control_reader_task(reader, self.events_tx.clone()));
        self.rtt.reset();
        self.local_session.store(0, Ordering::Relaxed);

        Session {
            info,
            writer,
            datagram: None,
            dispatcher: Dispatcher::new(
                self.collab.clone(),
                self.rtt.clone(),
                self.local_session.clone(),
            ),
            tasks: vec![reader_task],
        }
    }

    async fn authenticate(&self, session: &mut Session) -> Result<(), TransportError> {
        let max_bandwidth = self
            .collab
            .audio_input()
            .map_or(0, |input| input.max_bandwidth());
        let auth = Message::authenticate(&self.params.username, &self.params.password, max_bandwidth);
        session.writer.send(&encode(&auth)?, true).await?;
        debug!(username = %self.params.username, max_bandwidth, "authentication sent");
        Ok(())
    }

    /// Voice degrades to the control channel if the socket cannot be bound.
    fn open_datagram(&self, session: &mut Session) {
        match DatagramChannel::bind(session.info.peer_addr) {
            Ok(datagram) => {
                if let Some(socket) = datagram.receiver() {
                    session.tasks.push(tokio::spawn(datagram_reader_task(
                        socket,
                        self.events_tx.clone(),
                    )));
                }
                session.info.datagram_port = Some(datagram.local_port());
                session.datagram = Some(datagram);
            }
            Err(e) => warn!("could not open UDP voice channel, using TCP only: {}", e),
        }
    }

    async fn event_loop(
        &self,
        session: &mut Session,
        events: &mut mpsc::UnboundedReceiver<Event>,
        backlog: VecDeque<Event>,
    ) -> DisconnectReason {
        for event in backlog {
            if let Some(reason) = self.handle_event(session, event).await {
                return reason;
            }
        }

        let mut pings =
            tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
        pings.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = pings.tick() => {
                    if let Err(e) = self.send_pings(session).await {
                        return e.into();
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return DisconnectReason::Requested;
                    };
                    if let Some(reason) = self.handle_event(session, event).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Returns a reason when the event ends the session.
    async fn handle_event(&self, session: &mut Session, event: Event) -> Option<DisconnectReason> {
        match event {
            Event::Outbound(pending) => {
                if pending.is_close() {
                    return Some(DisconnectReason::Requested);
                }
                if let Err(e) = session.execute(pending, self.voice.tcp_compat).await {
                    return Some(e.into());
                }
            }
            Event::ControlFrame(payload) => self.dispatch(session, &payload, ChannelKind::Control),
            Event::ControlClosed(reason) => return Some(reason),
            Event::Datagram { payload, from } => {
                if session.accepts_datagram(from) {
                    self.dispatch(session, &payload, ChannelKind::Datagram);
                } else {
                    trace!(%from, "dropping datagram from unexpected address");
                }
            }
            Event::LoopbackSend(payload) => self.simulate_loopback(payload),
            Event::LoopbackEcho(payload) => self.dispatch(session, &payload, ChannelKind::Datagram),
        }
        None
    }

    fn dispatch(&self, session: &mut Session, payload: &[u8], via: ChannelKind) {
        match decode(payload) {
            Ok(msg) => session.dispatcher.dispatch(msg, via, self.clock.now_us()),
            Err(e) => debug!(?via, "dropping undecodable message: {}", e),
        }
    }

    /// One ping forced onto the control channel, one allowed on the datagram
    /// channel, so both round-trip times stay fresh.
    async fn send_pings(&self, session: &mut Session) -> Result<(), TransportError> {
        let mut ping = Message::ping(self.clock.now_us());
        ping.session = self.local_session.load(Ordering::Relaxed);
        let payload = encode(&ping)?;
        session
            .execute(
                PendingOutbound::new(MessageKind::Ping, payload.clone(), true),
                self.voice.tcp_compat,
            )
            .await?;
        session
            .execute(
                PendingOutbound::new(MessageKind::Ping, payload, false),
                self.voice.tcp_compat,
            )
            .await
    }

    /// Echo an outbound voice frame back in after simulated loss and delay.
    fn simulate_loopback(&self, payload: Vec<u8>) {
        let (lost, delay_ms) = {
            let mut rng = rand::thread_rng();
            let lost = self.voice.packet_loss > 0.0 && rng.gen_bool(self.voice.packet_loss);
            (lost, rng.gen_range(0..=self.voice.packet_delay_ms))
        };
        if lost {
            trace!("loopback frame lost");
            return;
        }
        if delay_ms == 0 {
            let _ = self.events_tx.send(Event::LoopbackEcho(payload));
            return;
        }
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(delay_ms))).await;
            let _ = events.send(Event::LoopbackEcho(payload));
        });
    }
}

async fn control_reader_task(mut reader: FrameReader, events: mpsc::UnboundedSender<Event>) {
    let reason = loop {
        match reader.next_frame().await {
            Ok(Some(payload)) => {
                if events.send(Event::ControlFrame(payload)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                info!("server closed TCP connection");
                break DisconnectReason::ClosedByServer;
            }
            Err(e) => {
                error!("TCP read error: {}", e);
                break e.into();
            }
        }
    };
    let _ = events.send(Event::ControlClosed(reason));
    info!("TCP reader task ended");
}

async fn datagram_reader_task(socket: Arc<UdpSocket>, events: mpsc::UnboundedSender<Event>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((0, _)) => continue,
            Ok((n, from)) => {
                let event = Event::Datagram {
                    payload: buf[..n].to_vec(),
                    from,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            // ICMP port unreachable surfaces as a reset on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                trace!("UDP recv reset: {}", e);
            }
            Err(e) => {
                warn!("UDP recv error, voice receive stopped: {}", e);
                break;
            }
        }
    }
    debug!("UDP reader task ended");
}
