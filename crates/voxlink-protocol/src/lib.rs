//! voxlink wire protocol: message types, the little-endian tagged codec, and
//! length framing for the reliable stream.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{decode, encode};
pub use error::{DecodeError, ProtocolError};
pub use messages::{Message, MessageBody, MessageKind};
pub use types::{RejectReason, SequenceNumber, SessionId};
