use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use voxlink_client::config::DEFAULT_PORT;
use voxlink_client::{
    ClientSettings, Collaborators, ConnectionParameters, ConnectionState, DisconnectReason,
    FilePinStore, LoopbackMode, PeerDirectory, PeerStatus, ServerHandler, SessionObserver,
};
use voxlink_protocol::{Message, MessageBody, SessionId};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "voxlink", about = "Connect to a voxlink voice server and report on the session")]
struct Args {
    /// Server host name or IP address
    #[arg(long)]
    host: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// User name to authenticate as
    #[arg(short, long)]
    username: String,

    /// Password, empty for servers without one
    #[arg(long, default_value = "", env = "VOXLINK_PASSWORD", hide_env_values = true)]
    password: String,

    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the certificate pin file (JSON), overrides the default location
    #[arg(long)]
    pins: Option<PathBuf>,

    /// Seconds to stay connected, 0 to stay until the server disconnects
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Send all traffic over TLS, overrides config
    #[arg(long)]
    tcp_compat: bool,

    /// Voice loopback test mode
    #[arg(long, value_enum)]
    loopback: Option<Loopback>,

    /// Pin the server's certificate if it is rejected, for the next connect
    #[arg(long)]
    trust_new_certificate: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Loopback {
    None,
    Local,
    Server,
}

impl From<Loopback> for LoopbackMode {
    fn from(l: Loopback) -> Self {
        match l {
            Loopback::None => LoopbackMode::None,
            Loopback::Local => LoopbackMode::Local,
            Loopback::Server => LoopbackMode::Server,
        }
    }
}

/// Logs everything the session reports and hands the final reason to main.
struct LogObserver {
    done: Mutex<mpsc::Sender<DisconnectReason>>,
}

impl SessionObserver for LogObserver {
    fn state_changed(&self, state: ConnectionState) {
        info!(?state, "connection state");
    }

    fn connected(&self) {
        info!("connected");
    }

    fn message(&self, msg: Message) {
        let session = msg.session;
        match msg.body {
            MessageBody::ServerSync {
                max_bandwidth,
                welcome,
            } => info!(session, max_bandwidth, "server sync: {}", welcome),
            MessageBody::ServerReject { reason, text } => {
                warn!(%reason, "server rejected us: {}", text)
            }
            MessageBody::PeerJoined { name } => info!(session, "{} joined", name),
            MessageBody::PeerLeft => info!(session, "peer left"),
            MessageBody::TextMessage { text } => info!(session, "message: {}", text),
            other => info!(session, kind = ?other.kind(), "message"),
        }
    }

    fn disconnected(&self, reason: &DisconnectReason) {
        let done = self.done.lock().unwrap_or_else(|p| p.into_inner());
        let _ = done.send(reason.clone());
    }
}

impl PeerDirectory for LogObserver {
    fn lookup(&self, _peer: SessionId) -> Option<PeerStatus> {
        None
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxlink=info,voxlink_client=info,voxlink_protocol=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => ClientSettings::load_from_file(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => ClientSettings::default(),
    };
    if args.tcp_compat {
        settings.voice.tcp_compat = true;
    }
    if let Some(loopback) = args.loopback {
        settings.voice.loopback = loopback.into();
    }

    let pin_path = args
        .pins
        .clone()
        .or_else(FilePinStore::default_path)
        .context("no config directory on this platform, pass --pins")?;
    let pins = Arc::new(
        FilePinStore::load(&pin_path)
            .with_context(|| format!("failed to load pins: {}", pin_path.display()))?,
    );

    let (done_tx, done_rx) = mpsc::channel();
    let observer = Arc::new(LogObserver {
        done: Mutex::new(done_tx),
    });
    let collab = Collaborators::new(observer.clone(), observer, pins.clone());
    let params = ConnectionParameters::new(&args.host, args.port, &args.username, &args.password);
    info!(?params, "voxlink starting");

    let handler =
        ServerHandler::start(params, settings, collab).context("failed to start session thread")?;

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let reason = loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break None;
                }
                left.min(REPORT_INTERVAL)
            }
            None => REPORT_INTERVAL,
        };
        match done_rx.recv_timeout(wait) {
            Ok(reason) => break Some(reason),
            Err(mpsc::RecvTimeoutError::Timeout) => report(&handler),
            Err(mpsc::RecvTimeoutError::Disconnected) => break None,
        }
    };

    handler.disconnect();
    handler.join();
    let reason = reason.or_else(|| done_rx.try_recv().ok());

    match reason {
        Some(DisconnectReason::CertificateRejected(decision)) => {
            warn!("server certificate rejected: {:?}", decision.reasons);
            match decision.leaf_digest {
                Some(digest) if args.trust_new_certificate => {
                    pins.pin(&args.host, args.port, digest)
                        .with_context(|| format!("failed to save pin to {}", pins.path().display()))?;
                    info!(%digest, "certificate pinned, connect again to use it");
                }
                Some(digest) => {
                    info!(%digest, "pass --trust-new-certificate to pin this certificate")
                }
                None => {}
            }
        }
        Some(reason) => info!("session ended: {}", reason),
        None => {}
    }

    Ok(())
}

fn report(handler: &ServerHandler) {
    if handler.state() != ConnectionState::Connected {
        return;
    }
    let rtt = handler.round_trip_times();
    info!(
        session = handler.local_session(),
        control_rtt = ?rtt.control(),
        datagram_rtt = ?rtt.datagram(),
        "round-trip times"
    );
}
