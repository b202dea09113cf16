use thiserror::Error;

use crate::protocol::PeerId;

/// Failures acquiring the local audio source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no audio input device available")]
    NoDevice,
    #[error("media backend error: {0}")]
    Backend(String),
}

/// Failures reported by the underlying real-time connection primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection setup failed: {0}")]
    Setup(String),
    #[error("invalid connection state: {0}")]
    InvalidState(String),
    #[error("failed to apply ice candidate: {0}")]
    Candidate(String),
    #[error("connection closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay setup failed: {0}")]
    Setup(String),
    #[error("relay channel closed")]
    ChannelClosed,
    #[error("relay codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("failed to acquire local media: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error("session already joined")]
    AlreadyJoined,
    #[error("session not joined")]
    NotJoined,
    #[error("peer {peer_id} abandoned after {attempts} failed connection attempts")]
    PeerAbandoned { peer_id: PeerId, attempts: u32 },
    #[error("connection to peer {peer_id} failed: {source}")]
    Connection {
        peer_id: PeerId,
        #[source]
        source: ConnectionError,
    },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("mesh session task stopped")]
    SessionClosed,
}

impl MeshError {
    pub(crate) fn connection(peer_id: &str, source: ConnectionError) -> Self {
        MeshError::Connection {
            peer_id: peer_id.to_string(),
            source,
        }
    }
}
