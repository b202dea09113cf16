//! In-memory stand-ins for the connection primitive, the relay and the audio
//! source. Everything is synchronous behind a mutex, so tests control delivery
//! order by choosing which session processes its queue first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{
    ConnectionEventKind, ConnectionEvents, LinkState, PeerConnection, PeerConnector,
};
use crate::error::{ConnectionError, MediaError, RelayError};
use crate::media::{LocalMedia, MediaSource, RemoteMedia};
use crate::protocol::{ClientMessage, IceCandidate, PeerId, SessionDescription, ServerMessage};
use crate::relay::{RelayEvent, RelayGateway};

type Pair = (PeerId, PeerId);

fn pair(local: &str, remote: &str) -> Pair {
    (local.to_string(), remote.to_string())
}

fn unordered(a: &str, b: &str) -> Pair {
    if a <= b { pair(a, b) } else { pair(b, a) }
}

struct Endpoint {
    generation: u64,
    events: ConnectionEvents,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    media: Option<String>,
    settled: bool,
    closed: bool,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<Pair, Endpoint>,
    opened: HashMap<Pair, u32>,
    offers: HashMap<Pair, u32>,
    scheduled_failures: HashMap<Pair, u32>,
    failed_opens: HashMap<Pair, u32>,
}

impl NetworkState {
    /// Completes the handshake once both ends hold each other's descriptions.
    fn settle(&mut self, local: &str, remote: &str) {
        let forward = pair(local, remote);
        let backward = pair(remote, local);
        let (Some(a), Some(b)) = (self.endpoints.get(&forward), self.endpoints.get(&backward))
        else {
            return;
        };
        if a.closed || b.closed || a.settled || b.settled {
            return;
        }
        let matched = a.local.is_some()
            && a.local == b.remote
            && b.local.is_some()
            && b.local == a.remote;
        if !matched {
            return;
        }

        let key = unordered(local, remote);
        let fail = match self.scheduled_failures.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        let a_media = a.media.clone();
        let b_media = b.media.clone();
        for (key, their_media) in [(forward, b_media), (backward, a_media)] {
            let Some(endpoint) = self.endpoints.get_mut(&key) else {
                continue;
            };
            endpoint.settled = true;
            if fail {
                endpoint
                    .events
                    .emit(ConnectionEventKind::StateChanged(LinkState::Failed));
                continue;
            }
            endpoint
                .events
                .emit(ConnectionEventKind::StateChanged(LinkState::Connected));
            if let Some(media_id) = their_media {
                endpoint
                    .events
                    .emit(ConnectionEventKind::RemoteTrack(RemoteMedia {
                        peer_id: key.1.clone(),
                        track_id: media_id,
                        stream_id: key.1.clone(),
                        track: None,
                    }));
            }
        }
    }
}

/// A loopback network of connection endpoints keyed by `(local, remote)`.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, local_id: impl Into<PeerId>) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            local_id: local_id.into(),
            network: self.clone(),
        })
    }

    /// Makes the next `count` completed handshakes between `a` and `b` fail.
    pub fn fail_next_handshakes(&self, a: &str, b: &str, count: u32) {
        *self
            .inner
            .lock()
            .scheduled_failures
            .entry(unordered(a, b))
            .or_default() += count;
    }

    /// Makes `local`'s next `count` attempts to open a connection to `remote`
    /// fail before any endpoint exists.
    pub fn fail_next_opens(&self, local: &str, remote: &str, count: u32) {
        *self
            .inner
            .lock()
            .failed_opens
            .entry(pair(local, remote))
            .or_default() += count;
    }

    /// Reports a transport failure on `local`'s current connection to `remote`.
    pub fn fail_link(&self, local: &str, remote: &str) -> bool {
        self.emit_state(local, remote, LinkState::Failed)
    }

    /// Reports a clean close on `local`'s current connection to `remote`.
    pub fn close_link(&self, local: &str, remote: &str) -> bool {
        self.emit_state(local, remote, LinkState::Closed)
    }

    fn emit_state(&self, local: &str, remote: &str, state: LinkState) -> bool {
        let state_guard = self.inner.lock();
        match state_guard.endpoints.get(&pair(local, remote)) {
            Some(endpoint) if !endpoint.closed => endpoint
                .events
                .emit(ConnectionEventKind::StateChanged(state)),
            _ => false,
        }
    }

    pub fn opened(&self, local: &str, remote: &str) -> u32 {
        self.inner
            .lock()
            .opened
            .get(&pair(local, remote))
            .copied()
            .unwrap_or(0)
    }

    pub fn offers_created(&self, local: &str, remote: &str) -> u32 {
        self.inner
            .lock()
            .offers
            .get(&pair(local, remote))
            .copied()
            .unwrap_or(0)
    }

    pub fn applied_candidates(&self, local: &str, remote: &str) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .endpoints
            .get(&pair(local, remote))
            .map(|endpoint| endpoint.candidates.clone())
            .unwrap_or_default()
    }

    /// True when `local`'s current connection to `remote` finished its handshake
    /// and is still open.
    pub fn is_established(&self, local: &str, remote: &str) -> bool {
        self.inner
            .lock()
            .endpoints
            .get(&pair(local, remote))
            .is_some_and(|endpoint| endpoint.settled && !endpoint.closed)
    }

    pub fn is_closed(&self, local: &str, remote: &str) -> bool {
        self.inner
            .lock()
            .endpoints
            .get(&pair(local, remote))
            .is_none_or(|endpoint| endpoint.closed)
    }
}

pub struct MockConnector {
    local_id: PeerId,
    network: MockNetwork,
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn open(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let remote_id = events.peer_id().to_string();
        let generation = events.generation();
        let key = pair(&self.local_id, &remote_id);
        let mut state = self.network.inner.lock();
        if let Some(remaining) = state.failed_opens.get_mut(&key).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(ConnectionError::Setup(format!(
                "{} could not open a connection to {remote_id}",
                self.local_id
            )));
        }
        *state.opened.entry(key.clone()).or_default() += 1;
        state.endpoints.insert(
            key,
            Endpoint {
                generation,
                events,
                local: None,
                remote: None,
                candidates: Vec::new(),
                media: None,
                settled: false,
                closed: false,
            },
        );
        Ok(Arc::new(MockConnection {
            network: self.network.clone(),
            local_id: self.local_id.clone(),
            remote_id,
            generation,
        }))
    }
}

pub struct MockConnection {
    network: MockNetwork,
    local_id: PeerId,
    remote_id: PeerId,
    generation: u64,
}

impl MockConnection {
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut NetworkState, Pair) -> Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        let mut state = self.network.inner.lock();
        let key = pair(&self.local_id, &self.remote_id);
        match state.endpoints.get(&key) {
            Some(endpoint) if endpoint.generation == self.generation && !endpoint.closed => {}
            _ => return Err(ConnectionError::Closed),
        }
        f(&mut state, key)
    }

    fn description(&self, kind: &str) -> String {
        format!(
            "mock-{kind} {}->{} gen={}",
            self.local_id, self.remote_id, self.generation
        )
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), ConnectionError> {
        self.with_endpoint(|state, key| {
            if let Some(endpoint) = state.endpoints.get_mut(&key) {
                endpoint.media = Some(media.id().to_string());
            }
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let sdp = self.description("offer");
        self.with_endpoint(|state, key| {
            *state.offers.entry(key).or_default() += 1;
            Ok(SessionDescription::offer(sdp))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let sdp = self.description("answer");
        self.with_endpoint(|state, key| match state.endpoints.get(&key) {
            Some(endpoint) if endpoint.remote.is_some() => Ok(SessionDescription::answer(sdp)),
            _ => Err(ConnectionError::InvalidState(
                "cannot answer without a remote offer".into(),
            )),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{}-{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.local_id,
                self.generation,
                40_000 + self.generation
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let (local, remote) = (self.local_id.clone(), self.remote_id.clone());
        self.with_endpoint(move |state, key| {
            if let Some(endpoint) = state.endpoints.get_mut(&key) {
                endpoint.local = Some(description);
                endpoint
                    .events
                    .emit(ConnectionEventKind::LocalCandidate(candidate));
            }
            state.settle(&local, &remote);
            Ok(())
        })
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let (local, remote) = (self.local_id.clone(), self.remote_id.clone());
        self.with_endpoint(move |state, key| {
            if let Some(endpoint) = state.endpoints.get_mut(&key) {
                endpoint.remote = Some(description);
            }
            state.settle(&local, &remote);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        self.with_endpoint(|state, key| match state.endpoints.get_mut(&key) {
            Some(endpoint) if endpoint.remote.is_some() => {
                endpoint.candidates.push(candidate);
                Ok(())
            }
            _ => Err(ConnectionError::InvalidState(
                "remote description not set".into(),
            )),
        })
    }

    async fn close(&self) {
        let mut state = self.network.inner.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&pair(&self.local_id, &self.remote_id)) {
            if endpoint.generation == self.generation && !endpoint.closed {
                endpoint.closed = true;
                endpoint
                    .events
                    .emit(ConnectionEventKind::StateChanged(LinkState::Closed));
            }
        }
    }
}

#[derive(Default)]
struct HubState {
    clients: BTreeMap<PeerId, mpsc::UnboundedSender<RelayEvent>>,
    log: Vec<(PeerId, ClientMessage)>,
}

impl HubState {
    fn deliver(&self, to: &str, message: ServerMessage) {
        if let Some(tx) = self.clients.get(to) {
            let _ = tx.send(RelayEvent::Message(message));
        }
    }

    fn broadcast_presence(&self) {
        let peer_ids: Vec<PeerId> = self.clients.keys().cloned().collect();
        for tx in self.clients.values() {
            let _ = tx.send(RelayEvent::Message(ServerMessage::Presence {
                peer_ids: peer_ids.clone(),
            }));
        }
    }
}

/// A relay room: echoes joins to everyone else, routes point-to-point
/// messages by `to_id`, answers pings, and pushes presence on every
/// connect/disconnect.
#[derive(Clone, Default)]
pub struct MockRelayHub {
    inner: Arc<Mutex<HubState>>,
}

impl MockRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(
        &self,
        peer_id: impl Into<PeerId>,
    ) -> (Arc<MockRelay>, mpsc::UnboundedReceiver<RelayEvent>) {
        let peer_id = peer_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock();
        state.clients.insert(peer_id.clone(), tx);
        state.broadcast_presence();
        let relay = Arc::new(MockRelay {
            peer_id,
            hub: self.clone(),
        });
        (relay, rx)
    }

    pub fn disconnect(&self, peer_id: &str) {
        let mut state = self.inner.lock();
        if let Some(tx) = state.clients.remove(peer_id) {
            let _ = tx.send(RelayEvent::Disconnected);
        }
        state.broadcast_presence();
    }

    /// Everything sent through the hub, in order.
    pub fn sent(&self) -> Vec<(PeerId, ClientMessage)> {
        self.inner.lock().log.clone()
    }

    pub fn sent_by(&self, peer_id: &str) -> Vec<ClientMessage> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|(from, _)| from == peer_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    fn route(&self, from: &str, message: ClientMessage) -> Result<(), RelayError> {
        let mut state = self.inner.lock();
        if !state.clients.contains_key(from) {
            return Err(RelayError::ChannelClosed);
        }
        state.log.push((from.to_string(), message.clone()));
        match message {
            ClientMessage::Join { account_id } => {
                for peer in state.clients.keys().filter(|peer| **peer != account_id) {
                    state.deliver(
                        peer,
                        ServerMessage::Join {
                            from_id: account_id.clone(),
                        },
                    );
                }
            }
            ClientMessage::Offer {
                from_id,
                to_id,
                offer,
            } => {
                let to = to_id.clone();
                state.deliver(
                    &to,
                    ServerMessage::Offer {
                        from_id,
                        to_id,
                        offer,
                    },
                );
            }
            ClientMessage::Answer {
                from_id,
                to_id,
                answer,
            } => {
                let to = to_id.clone();
                state.deliver(
                    &to,
                    ServerMessage::Answer {
                        from_id,
                        to_id,
                        answer,
                    },
                );
            }
            ClientMessage::IceCandidate {
                from_id,
                to_id,
                candidate,
            } => {
                let to = to_id.clone();
                state.deliver(
                    &to,
                    ServerMessage::IceCandidate {
                        from_id,
                        to_id,
                        candidate,
                    },
                );
            }
            ClientMessage::Ping => state.deliver(from, ServerMessage::Pong),
        }
        Ok(())
    }
}

pub struct MockRelay {
    peer_id: PeerId,
    hub: MockRelayHub,
}

impl RelayGateway for MockRelay {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError> {
        self.hub.route(&self.peer_id, message)
    }
}

/// Audio source that always succeeds, or always fails with a fixed error.
pub struct StaticMediaSource {
    id: String,
    failure: Option<MediaError>,
    acquired: AtomicUsize,
}

impl StaticMediaSource {
    pub fn available(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            failure: None,
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            id: String::new(),
            failure: Some(error),
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia::new(self.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;

    #[tokio::test]
    async fn hub_routes_joins_signals_and_pings() {
        let hub = MockRelayHub::new();
        let (alice, mut alice_rx) = hub.connect("alice");
        let (_bob, mut bob_rx) = hub.connect("bob");

        // alice sees her own presence and then bob's arrival.
        let mut presence = Vec::new();
        while let Ok(RelayEvent::Message(ServerMessage::Presence { peer_ids })) = alice_rx.try_recv() {
            presence.push(peer_ids);
        }
        assert_eq!(presence.last(), Some(&vec!["alice".to_string(), "bob".to_string()]));
        while bob_rx.try_recv().is_ok() {}

        alice
            .send(ClientMessage::Join {
                account_id: "alice".into(),
            })
            .expect("join");
        alice.send(ClientMessage::Ping).expect("ping");
        alice
            .send(ClientMessage::Offer {
                from_id: "alice".into(),
                to_id: "bob".into(),
                offer: SessionDescription::offer("v=0"),
            })
            .expect("offer");

        assert_eq!(
            bob_rx.try_recv().ok(),
            Some(RelayEvent::Message(ServerMessage::Join {
                from_id: "alice".into()
            }))
        );
        assert!(matches!(
            bob_rx.try_recv(),
            Ok(RelayEvent::Message(ServerMessage::Offer { .. }))
        ));
        assert_eq!(
            alice_rx.try_recv().ok(),
            Some(RelayEvent::Message(ServerMessage::Pong))
        );
        assert_eq!(hub.sent_by("alice").len(), 3);

        hub.disconnect("alice");
        assert_eq!(alice_rx.try_recv().ok(), Some(RelayEvent::Disconnected));
        assert!(alice.send(ClientMessage::Ping).is_err());
    }

    fn saw_connected(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> bool {
        let mut connected = false;
        while let Ok(event) = rx.try_recv() {
            connected |= matches!(
                event.kind,
                ConnectionEventKind::StateChanged(LinkState::Connected)
            );
        }
        connected
    }

    #[tokio::test]
    async fn matching_descriptions_connect_both_ends() {
        let network = MockNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network
            .connector("a")
            .open(ConnectionEvents::new("b", 1, a_tx))
            .await
            .expect("open a");
        let b = network
            .connector("b")
            .open(ConnectionEvents::new("a", 1, b_tx))
            .await
            .expect("open b");

        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("local offer");
        b.set_remote_description(offer).await.expect("remote offer");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer.clone()).await.expect("local answer");
        assert!(!network.is_established("a", "b"));
        a.set_remote_description(answer).await.expect("remote answer");

        assert!(network.is_established("a", "b"));
        assert!(network.is_established("b", "a"));
        assert!(saw_connected(&mut a_rx));
        assert!(saw_connected(&mut b_rx));

        a.close().await;
        assert!(network.is_closed("a", "b"));
        assert!(matches!(a.create_offer().await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn failing_source_reports_its_error() {
        let source = StaticMediaSource::failing(MediaError::PermissionDenied);
        assert_eq!(source.acquire().await.err(), Some(MediaError::PermissionDenied));
        assert_eq!(source.acquired(), 0);

        let source = StaticMediaSource::available("mic");
        assert_eq!(source.acquire().await.expect("media").id(), "mic");
        assert_eq!(source.acquired(), 1);
    }
}
