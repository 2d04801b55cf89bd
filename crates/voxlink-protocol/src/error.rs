use thiserror::Error;

/// Reasons a single wire message could not be decoded.
///
/// These never end a connection: the offending message is dropped and the
/// stream carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("unknown message kind: {0}")]
    UnknownKind(u32),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("field too long: {0} bytes (max 65535)")]
    FieldTooLong(usize),

    #[error("message too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_display() {
        let e = DecodeError::Truncated { expected: 12, got: 5 };
        let msg = e.to_string();
        assert!(msg.contains("12"));
        assert!(msg.contains("5"));
    }

    #[test]
    fn unknown_kind_display() {
        let e = DecodeError::UnknownKind(0xAB);
        assert!(e.to_string().contains("171"));
    }

    #[test]
    fn message_too_large_display() {
        let e = ProtocolError::MessageTooLarge(100000);
        assert!(e.to_string().contains("100000"));
    }

    #[test]
    fn from_decode_error() {
        let e: ProtocolError = DecodeError::InvalidUtf8.into();
        assert!(matches!(e, ProtocolError::Decode(DecodeError::InvalidUtf8)));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let proto_err: ProtocolError = io_err.into();
        assert!(proto_err.to_string().contains("broken"));
    }
}
