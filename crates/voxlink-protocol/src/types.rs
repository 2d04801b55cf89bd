use std::fmt;

/// Server-assigned identifier of a connected peer.
///
/// On a message this names the peer the message concerns. The local client's
/// own id is learned from `ServerSync`.
pub type SessionId = u32;

/// Sequence number for voice frames, monotonically increasing per sender.
pub type SequenceNumber = u32;

/// Why the server refused an authentication attempt.
///
/// Kept open-ended so codes from newer servers survive a decode/encode cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RejectReason(pub u32);

impl RejectReason {
    pub const NONE: Self = Self(0);
    pub const WRONG_VERSION: Self = Self(1);
    pub const INVALID_USERNAME: Self = Self(2);
    pub const WRONG_USER_PASSWORD: Self = Self(3);
    pub const WRONG_SERVER_PASSWORD: Self = Self(4);
    pub const USERNAME_IN_USE: Self = Self(5);
    pub const SERVER_FULL: Self = Self(6);
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match *self {
            Self::NONE => "no reason given",
            Self::WRONG_VERSION => "client version not supported",
            Self::INVALID_USERNAME => "invalid username",
            Self::WRONG_USER_PASSWORD => "wrong user password",
            Self::WRONG_SERVER_PASSWORD => "wrong server password",
            Self::USERNAME_IN_USE => "username already in use",
            Self::SERVER_FULL => "server is full",
            Self(code) => return write!(f, "unknown reason {code}"),
        };
        f.write_str(text)
    }
}
