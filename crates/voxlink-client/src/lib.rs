//! voxlink client session transport.
//!
//! A [`ServerHandler`] owns one connection to a voice server: a TLS control
//! channel for reliable messages and a UDP datagram channel for voice and
//! pings. Certificates the platform trust store rejects can still be accepted
//! when their SHA-1 digest matches a pin the user stored earlier.

pub mod collaborators;
pub mod config;
pub mod control;
pub mod datagram;
pub mod handler;
pub mod pins;
pub mod session;
pub mod trust;

pub use collaborators::{
    AudioInput, AudioOutput, Collaborators, PeerDirectory, PeerStatus, SessionObserver,
};
pub use config::{ClientSettings, ConnectionParameters, LoopbackMode, TrustSettings, VoiceSettings};
pub use handler::{ConnectionState, DisconnectReason, ServerHandler};
pub use pins::FilePinStore;
pub use session::{RoundTripTimes, SessionInfo};
pub use trust::{CertDigest, CertificateDecision, MemoryPinStore, PinStore};
