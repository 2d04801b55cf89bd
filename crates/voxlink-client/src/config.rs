use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Default server port for both the TLS control stream and voice datagrams.
pub const DEFAULT_PORT: u16 = 9987;

/// Duration of one audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("no usable trust anchors in {0}")]
    NoCertificates(PathBuf),

    #[error("trust store has no anchors (enable webpki roots or add extra roots)")]
    EmptyTrustStore,
}

/// Who to connect to and as whom. Fixed for the lifetime of one attempt.
#[derive(Clone)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Zeroizing<String>,
}

impl ConnectionParameters {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_owned(),
            port,
            username: username.to_owned(),
            password: Zeroizing::new(password.to_owned()),
        }
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// When the audio input transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitMode {
    Continuous,
    #[default]
    VoiceActivity,
    PushToTalk,
}

/// Voice loopback test modes. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopbackMode {
    #[default]
    None,
    /// Emulate a local server: outbound voice is echoed back locally.
    Local,
    /// Ask the server to echo our voice back.
    Server,
}

/// Audio transport settings, snapshotted once per connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub transmit_mode: TransmitMode,
    /// Frames voice activation stays open after speech ends (20..=250).
    pub voice_hold: u32,
    /// Audio frames bundled per packet (1..=4).
    pub frames_per_packet: u32,
    /// Send everything over the TLS stream, never over UDP.
    pub tcp_compat: bool,
    /// Hint for the caller; the transport itself never reconnects.
    pub auto_reconnect: bool,
    /// Default jitter buffer size in frames (1..=5).
    pub jitter_buffer: u32,

    // Loopback testing only
    #[serde(skip)]
    pub loopback: LoopbackMode,
    /// Maximum simulated extra delay in milliseconds (0..=100).
    #[serde(skip)]
    pub packet_delay_ms: u32,
    /// Simulated packet loss ratio (0.0..=0.5).
    #[serde(skip)]
    pub packet_loss: f64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            transmit_mode: TransmitMode::default(),
            voice_hold: 50,
            frames_per_packet: 2,
            tcp_compat: false,
            auto_reconnect: true,
            jitter_buffer: 1,
            loopback: LoopbackMode::None,
            packet_delay_ms: 0,
            packet_loss: 0.0,
        }
    }
}

impl VoiceSettings {
    /// Clamp every field into its supported range.
    pub fn clamped(mut self) -> Self {
        self.voice_hold = self.voice_hold.clamp(20, 250);
        self.frames_per_packet = self.frames_per_packet.clamp(1, 4);
        self.jitter_buffer = self.jitter_buffer.clamp(1, 5);
        self.packet_delay_ms = self.packet_delay_ms.min(100);
        self.packet_loss = if self.packet_loss.is_nan() {
            0.0
        } else {
            self.packet_loss.clamp(0.0, 0.5)
        };
        self
    }

    pub fn voice_hold_duration(&self) -> Duration {
        FRAME_DURATION * self.voice_hold
    }

    /// Protocol overhead in bits per second for the configured packetization.
    ///
    /// 50 frames per second, each costing IP (20) + UDP (8) + message header
    /// (3) + flags (1) + sequence (2) bytes; TCP adds 12 bytes per packet, and
    /// bundling adds one length byte per frame.
    pub fn overhead_bitrate(&self) -> i32 {
        let frames = self.frames_per_packet.clamp(1, 4) as i32;
        let mut overhead = 50 * 8 * (20 + 8 + 3 + 1 + 2);
        if self.tcp_compat {
            overhead += 50 * 8 * 12;
        }
        if frames > 1 {
            overhead += frames * 8 * 50;
        }
        overhead / frames
    }

    /// Whether `audio_bitrate` plus overhead exceeds the server's limit
    /// (`max_bandwidth` is in bytes per second).
    pub fn exceeds_bandwidth(&self, audio_bitrate: i32, max_bandwidth: i32) -> bool {
        (audio_bitrate + self.overhead_bitrate()) / 8 > max_bandwidth
    }
}

/// Which certificate authorities the TLS handshake trusts natively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    /// Include the bundled Mozilla root set.
    pub use_webpki_roots: bool,
    /// PEM files with additional trust anchors.
    pub extra_root_files: Vec<PathBuf>,
    /// Additional DER anchors supplied programmatically.
    #[serde(skip)]
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            use_webpki_roots: true,
            extra_root_files: Vec::new(),
            extra_roots: Vec::new(),
        }
    }
}

impl TrustSettings {
    pub fn root_store(&self) -> Result<RootCertStore, ConfigError> {
        let mut roots = RootCertStore::empty();
        if self.use_webpki_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        for path in &self.extra_root_files {
            let file = File::open(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
                .filter_map(|c| c.ok())
                .collect();
            let (added, _ignored) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(ConfigError::NoCertificates(path.clone()));
            }
        }

        roots.add_parsable_certificates(self.extra_roots.iter().cloned());

        if roots.is_empty() {
            return Err(ConfigError::EmptyTrustStore);
        }
        Ok(roots)
    }
}

/// Client configuration file (TOML), `[voice]` and `[trust]` sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub voice: VoiceSettings,
    pub trust: TrustSettings,
}

impl ClientSettings {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.voice = settings.voice.clamped();
        Ok(settings)
    }
}

/// Returns the voxlink data directory (`~/.config/voxlink` on Linux), if the
/// platform has one.
pub fn data_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("voxlink"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_voice_settings() {
        let s = VoiceSettings::default();
        assert_eq!(s.transmit_mode, TransmitMode::VoiceActivity);
        assert_eq!(s.voice_hold, 50);
        assert_eq!(s.frames_per_packet, 2);
        assert!(!s.tcp_compat);
        assert_eq!(s.loopback, LoopbackMode::None);
        assert_eq!(s.voice_hold_duration(), Duration::from_secs(1));
    }

    #[test]
    fn clamp_out_of_range_values() {
        let s = VoiceSettings {
            voice_hold: 1000,
            frames_per_packet: 0,
            jitter_buffer: 9,
            packet_delay_ms: 500,
            packet_loss: 0.9,
            ..VoiceSettings::default()
        }
        .clamped();
        assert_eq!(s.voice_hold, 250);
        assert_eq!(s.frames_per_packet, 1);
        assert_eq!(s.jitter_buffer, 5);
        assert_eq!(s.packet_delay_ms, 100);
        assert_eq!(s.packet_loss, 0.5);
    }

    #[test]
    fn clamp_nan_loss() {
        let s = VoiceSettings {
            packet_loss: f64::NAN,
            ..VoiceSettings::default()
        }
        .clamped();
        assert_eq!(s.packet_loss, 0.0);
    }

    #[test]
    fn overhead_single_frame_udp() {
        let s = VoiceSettings {
            frames_per_packet: 1,
            ..VoiceSettings::default()
        };
        assert_eq!(s.overhead_bitrate(), 50 * 8 * 34);
    }

    #[test]
    fn overhead_bundled_tcp() {
        let s = VoiceSettings {
            frames_per_packet: 2,
            tcp_compat: true,
            ..VoiceSettings::default()
        };
        let expected = (50 * 8 * 34 + 50 * 8 * 12 + 2 * 8 * 50) / 2;
        assert_eq!(s.overhead_bitrate(), expected);
    }

    #[test]
    fn bandwidth_check() {
        let s = VoiceSettings {
            frames_per_packet: 1,
            ..VoiceSettings::default()
        };
        // 13_600 bps overhead + 16_400 audio = 30_000 bps = 3_750 B/s
        assert!(!s.exceeds_bandwidth(16_400, 3_750));
        assert!(s.exceeds_bandwidth(16_400, 3_749));
    }

    #[test]
    fn settings_toml_deserialization() {
        let toml = r#"
            [voice]
            transmit_mode = "push_to_talk"
            frames_per_packet = 3
            tcp_compat = true

            [trust]
            use_webpki_roots = false
        "#;
        let settings: ClientSettings = toml::from_str(toml).unwrap();
        assert_eq!(settings.voice.transmit_mode, TransmitMode::PushToTalk);
        assert_eq!(settings.voice.frames_per_packet, 3);
        assert!(settings.voice.tcp_compat);
        assert_eq!(settings.voice.voice_hold, 50);
        assert!(!settings.trust.use_webpki_roots);
    }

    #[test]
    fn empty_trust_store_is_rejected() {
        let trust = TrustSettings {
            use_webpki_roots: false,
            ..TrustSettings::default()
        };
        assert!(matches!(trust.root_store(), Err(ConfigError::EmptyTrustStore)));
    }

    #[test]
    fn webpki_roots_are_loaded() {
        let roots = TrustSettings::default().root_store().unwrap();
        assert!(!roots.is_empty());
    }

    #[test]
    fn connection_parameters_debug_redacts_password() {
        let params = ConnectionParameters::new("example.org", DEFAULT_PORT, "alice", "secret");
        let dbg = format!("{params:?}");
        assert!(dbg.contains("alice"));
        assert!(!dbg.contains("secret"));
    }
}
