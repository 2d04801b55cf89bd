use crate::error::DecodeError;
use crate::types::*;

/// Wire tag of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Authenticate = 0,
    Ping = 1,
    VoiceFrame = 2,
    ServerSync = 3,
    ServerReject = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    TextMessage = 7,
}

impl MessageKind {
    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::Authenticate),
            1 => Ok(Self::Ping),
            2 => Ok(Self::VoiceFrame),
            3 => Ok(Self::ServerSync),
            4 => Ok(Self::ServerReject),
            5 => Ok(Self::PeerJoined),
            6 => Ok(Self::PeerLeft),
            7 => Ok(Self::TextMessage),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Kinds that may travel over the datagram channel.
    pub fn is_latency_sensitive(self) -> bool {
        matches!(self, Self::VoiceFrame | Self::Ping)
    }
}

/// A protocol message: the peer it concerns plus a kind-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub session: SessionId,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Sent by the client right after the TLS handshake.
    Authenticate {
        username: String,
        password: String,
        /// Highest bitrate the local audio input can produce, 0 if none.
        max_bandwidth: i32,
    },

    /// Latency measurement. The server echoes the timestamp back unchanged.
    Ping {
        /// Microseconds on the sender's clock.
        timestamp: u64,
    },

    /// One encoded audio frame.
    VoiceFrame {
        sequence: SequenceNumber,
        payload: Vec<u8>,
    },

    /// Server accepted the login; `session` on the message is our own id.
    ServerSync { max_bandwidth: i32, welcome: String },

    /// Server refused the login.
    ServerReject { reason: RejectReason, text: String },

    /// A peer connected.
    PeerJoined { name: String },

    /// A peer disconnected.
    PeerLeft,

    /// Chat text from a peer.
    TextMessage { text: String },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Authenticate { .. } => MessageKind::Authenticate,
            Self::Ping { .. } => MessageKind::Ping,
            Self::VoiceFrame { .. } => MessageKind::VoiceFrame,
            Self::ServerSync { .. } => MessageKind::ServerSync,
            Self::ServerReject { .. } => MessageKind::ServerReject,
            Self::PeerJoined { .. } => MessageKind::PeerJoined,
            Self::PeerLeft => MessageKind::PeerLeft,
            Self::TextMessage { .. } => MessageKind::TextMessage,
        }
    }
}

impl Message {
    pub fn new(session: SessionId, body: MessageBody) -> Self {
        Self { session, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn authenticate(username: &str, password: &str, max_bandwidth: i32) -> Self {
        Self::new(
            0,
            MessageBody::Authenticate {
                username: username.to_owned(),
                password: password.to_owned(),
                max_bandwidth,
            },
        )
    }

    pub fn ping(timestamp: u64) -> Self {
        Self::new(0, MessageBody::Ping { timestamp })
    }

    pub fn voice(session: SessionId, sequence: SequenceNumber, payload: Vec<u8>) -> Self {
        Self::new(session, MessageBody::VoiceFrame { sequence, payload })
    }

    pub fn peer_left(session: SessionId) -> Self {
        Self::new(session, MessageBody::PeerLeft)
    }
}
