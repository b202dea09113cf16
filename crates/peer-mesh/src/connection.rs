use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::media::{LocalMedia, RemoteMedia};
use crate::protocol::{IceCandidate, PeerId, SessionDescription};

/// Transport-level state of one underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteTrack(RemoteMedia),
}

/// Event raised by an underlying connection, tagged with the generation of the
/// link that created it so events from a replaced connection can be discarded.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub peer_id: PeerId,
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

/// Sender handed to a connection when it is opened.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    pub fn new(
        peer_id: impl Into<PeerId>,
        generation: u64,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the owning session is gone.
    pub fn emit(&self, kind: ConnectionEventKind) -> bool {
        self.tx
            .send(ConnectionEvent {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// The real-time connection primitive for a single remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), ConnectionError>;
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;
    async fn close(&self);
}

/// Opens fresh underlying connections; every renegotiation gets a new one.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}
