//! Interfaces to the parts of the client that live outside the transport:
//! audio capture and playback, the peer list, the UI, and the pin store.

use std::sync::{Arc, Weak};

use voxlink_protocol::{Message, SequenceNumber, SessionId};

use crate::handler::{ConnectionState, DisconnectReason};
use crate::trust::PinStore;

pub trait AudioInput: Send + Sync {
    /// Highest bitrate (bytes per second) the current encoder setup produces.
    fn max_bandwidth(&self) -> i32;
}

pub trait AudioOutput: Send + Sync {
    fn add_frame(&self, peer: SessionId, payload: &[u8], sequence: SequenceNumber);

    /// Drop any jitter-buffer state held for `peer`. Must tolerate unknown peers.
    fn remove_buffered_state(&self, peer: SessionId);

    fn purge_all(&self);
}

/// What the UI knows about a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerStatus {
    pub locally_muted: bool,
}

pub trait PeerDirectory: Send + Sync {
    fn lookup(&self, peer: SessionId) -> Option<PeerStatus>;
}

/// Receives everything the session reports upward. Called from the session's
/// own thread; implementations hand off to their UI loop.
pub trait SessionObserver: Send + Sync {
    fn state_changed(&self, _state: ConnectionState) {}

    fn connected(&self) {}

    fn message(&self, msg: Message);

    fn disconnected(&self, reason: &DisconnectReason);
}

/// Everything a [`ServerHandler`](crate::handler::ServerHandler) talks to.
///
/// The audio pipeline is referenced weakly: the session never keeps it alive
/// and re-resolves it on every use.
#[derive(Clone)]
pub struct Collaborators {
    pub observer: Arc<dyn SessionObserver>,
    pub peers: Arc<dyn PeerDirectory>,
    pub pins: Arc<dyn PinStore>,
    pub audio_input: Option<Weak<dyn AudioInput>>,
    pub audio_output: Option<Weak<dyn AudioOutput>>,
}

impl Collaborators {
    pub fn new(
        observer: Arc<dyn SessionObserver>,
        peers: Arc<dyn PeerDirectory>,
        pins: Arc<dyn PinStore>,
    ) -> Self {
        Self {
            observer,
            peers,
            pins,
            audio_input: None,
            audio_output: None,
        }
    }

    pub fn with_audio_input(mut self, input: &Arc<dyn AudioInput>) -> Self {
        self.audio_input = Some(Arc::downgrade(input));
        self
    }

    pub fn with_audio_output(mut self, output: &Arc<dyn AudioOutput>) -> Self {
        self.audio_output = Some(Arc::downgrade(output));
        self
    }

    pub fn audio_input(&self) -> Option<Arc<dyn AudioInput>> {
        self.audio_input.as_ref().and_then(Weak::upgrade)
    }

    pub fn audio_output(&self) -> Option<Arc<dyn AudioOutput>> {
        self.audio_output.as_ref().and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::MemoryPinStore;

    struct Silent;

    impl SessionObserver for Silent {
        fn message(&self, _msg: Message) {}
        fn disconnected(&self, _reason: &DisconnectReason) {}
    }

    impl PeerDirectory for Silent {
        fn lookup(&self, _peer: SessionId) -> Option<PeerStatus> {
            None
        }
    }

    struct FixedInput(i32);

    impl AudioInput for FixedInput {
        fn max_bandwidth(&self) -> i32 {
            self.0
        }
    }

    #[test]
    fn weak_audio_input_resolves_while_alive() {
        let input: Arc<dyn AudioInput> = Arc::new(FixedInput(4000));
        let collab = Collaborators::new(
            Arc::new(Silent),
            Arc::new(Silent),
            Arc::new(MemoryPinStore::default()),
        )
        .with_audio_input(&input);

        assert_eq!(collab.audio_input().map(|i| i.max_bandwidth()), Some(4000));
        drop(input);
        assert!(collab.audio_input().is_none());
    }

    #[test]
    fn missing_audio_output_is_none() {
        let collab = Collaborators::new(
            Arc::new(Silent),
            Arc::new(Silent),
            Arc::new(MemoryPinStore::default()),
        );
        assert!(collab.audio_output().is_none());
    }
}
