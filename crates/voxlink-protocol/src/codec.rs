use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use crate::error::{DecodeError, ProtocolError};
use crate::messages::{Message, MessageBody, MessageKind};
use crate::types::RejectReason;

/// Header size: 4 (kind) + 4 (session) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum reliable-stream message size: 64 KiB.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Largest payload a single datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Size of the reliable-stream length prefix.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Encode a message into its wire form.
///
/// Wire format:
/// ```text
/// [kind: u32 LE] [session: u32 LE] [payload]
/// ```
/// Strings are `[len: u16 LE][utf-8 bytes]`; a voice frame's audio runs to the
/// end of the buffer. The result is never shorter than [`HEADER_SIZE`].
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 32);
    buf.put_u32_le(msg.kind().tag());
    buf.put_u32_le(msg.session);

    match &msg.body {
        MessageBody::Authenticate {
            username,
            password,
            max_bandwidth,
        } => {
            put_str(&mut buf, username)?;
            put_str(&mut buf, password)?;
            buf.put_i32_le(*max_bandwidth);
        }
        MessageBody::Ping { timestamp } => buf.put_u64_le(*timestamp),
        MessageBody::VoiceFrame { sequence, payload } => {
            buf.put_u32_le(*sequence);
            buf.put_slice(payload);
        }
        MessageBody::ServerSync {
            max_bandwidth,
            welcome,
        } => {
            buf.put_i32_le(*max_bandwidth);
            put_str(&mut buf, welcome)?;
        }
        MessageBody::ServerReject { reason, text } => {
            buf.put_u32_le(reason.0);
            put_str(&mut buf, text)?;
        }
        MessageBody::PeerJoined { name } => put_str(&mut buf, name)?,
        MessageBody::PeerLeft => {}
        MessageBody::TextMessage { text } => put_str(&mut buf, text)?,
    }

    Ok(buf)
}

/// Decode one message from its wire form (no length prefix).
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    let mut r = Reader::new(data);
    let tag = r.u32()?;
    let session = r.u32()?;

    let body = match MessageKind::from_tag(tag)? {
        MessageKind::Authenticate => MessageBody::Authenticate {
            username: r.string()?,
            password: r.string()?,
            max_bandwidth: r.i32()?,
        },
        MessageKind::Ping => MessageBody::Ping {
            timestamp: r.u64()?,
        },
        MessageKind::VoiceFrame => MessageBody::VoiceFrame {
            sequence: r.u32()?,
            payload: r.rest(),
        },
        MessageKind::ServerSync => MessageBody::ServerSync {
            max_bandwidth: r.i32()?,
            welcome: r.string()?,
        },
        MessageKind::ServerReject => MessageBody::ServerReject {
            reason: RejectReason(r.u32()?),
            text: r.string()?,
        },
        MessageKind::PeerJoined => MessageBody::PeerJoined { name: r.string()? },
        MessageKind::PeerLeft => MessageBody::PeerLeft,
        MessageKind::TextMessage => MessageBody::TextMessage { text: r.string()? },
    };

    r.finish()?;
    Ok(Message { session, body })
}

/// Prefix an encoded message with its length for the reliable stream.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_MSG_SIZE as usize {
        return Err(ProtocolError::MessageTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(FRAME_PREFIX_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        warn!(length, max = MAX_MSG_SIZE, "frame length prefix exceeds maximum message size");
        return Err(ProtocolError::MessageTooLarge(length));
    }

    if buf.len() < FRAME_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(FRAME_PREFIX_SIZE);
    Ok(Some(buf.split_to(length).to_vec()))
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::FieldTooLong(s.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked little-endian cursor. `bytes::Buf` getters panic on short
/// input, so every read goes through `need` first.
struct Reader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated {
                expected: self.total - self.buf.remaining() + n,
                got: self.total,
            });
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf = &[];
        out
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
