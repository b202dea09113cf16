//! Per-peer perfect negotiation.
//!
//! Each remote participant gets a [`PeerLink`] holding the offer/answer state
//! machine and the underlying connection. Both sides may initiate at once; the
//! politeness rule (smaller id is polite) decides who yields without an extra
//! round trip. The controller never talks to the relay directly: every
//! operation returns [`NegotiationEvent`]s that the session applies.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::candidates::CandidateBuffer;
use crate::connection::{ConnectionEvent, ConnectionEvents, LinkState, PeerConnection, PeerConnector};
use crate::error::MeshError;
use crate::media::{LocalMedia, RemoteMedia};
use crate::protocol::{ClientMessage, IceCandidate, PeerId, SessionDescription, Signal};

/// The participant with the lexicographically smaller id is polite.
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    MakingOffer,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
}

#[derive(Debug, Clone)]
enum Negotiation {
    Idle,
    MakingOffer,
    HaveLocalOffer {
        offer: SessionDescription,
    },
    HaveRemoteOffer {
        offer: SessionDescription,
    },
    Stable {
        local: SessionDescription,
        remote: SessionDescription,
    },
}

impl Negotiation {
    fn state(&self) -> NegotiationState {
        match self {
            Negotiation::Idle => NegotiationState::Idle,
            Negotiation::MakingOffer => NegotiationState::MakingOffer,
            Negotiation::HaveLocalOffer { .. } => NegotiationState::HaveLocalOffer,
            Negotiation::HaveRemoteOffer { .. } => NegotiationState::HaveRemoteOffer,
            Negotiation::Stable { .. } => NegotiationState::Stable,
        }
    }

    fn has_remote_description(&self) -> bool {
        matches!(
            self,
            Negotiation::HaveRemoteOffer { .. } | Negotiation::Stable { .. }
        )
    }

    fn in_progress(&self) -> bool {
        matches!(
            self,
            Negotiation::MakingOffer
                | Negotiation::HaveLocalOffer { .. }
                | Negotiation::HaveRemoteOffer { .. }
        )
    }
}

/// Everything this side knows about one remote participant.
pub struct PeerLink {
    peer_id: PeerId,
    polite: bool,
    negotiation: Negotiation,
    ignore_offer: bool,
    candidates: CandidateBuffer,
    retry_count: u32,
    generation: u64,
    connection: Option<Arc<dyn PeerConnection>>,
}

impl PeerLink {
    fn new(local_id: &str, peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            polite: is_polite(local_id, peer_id),
            negotiation: Negotiation::Idle,
            ignore_offer: false,
            candidates: CandidateBuffer::new(),
            retry_count: 0,
            generation: 0,
            connection: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn is_making_offer(&self) -> bool {
        matches!(self.negotiation, Negotiation::MakingOffer)
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn has_remote_description(&self) -> bool {
        self.connection.is_some() && self.negotiation.has_remote_description()
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    /// The offer/answer pair the link settled on, once stable.
    pub fn settled_descriptions(&self) -> Option<(&SessionDescription, &SessionDescription)> {
        match &self.negotiation {
            Negotiation::Stable { local, remote } => Some((local, remote)),
            _ => None,
        }
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retry_count = 0;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection.is_some() && self.generation == generation
    }

    fn install(&mut self, connection: Arc<dyn PeerConnection>, generation: u64) {
        self.connection = Some(connection);
        self.generation = generation;
        self.negotiation = Negotiation::Idle;
        self.ignore_offer = false;
        self.candidates.reset_for_new_connection();
    }

    fn take_connection(&mut self) -> Option<Arc<dyn PeerConnection>> {
        self.negotiation = Negotiation::Idle;
        self.ignore_offer = false;
        self.candidates.reset_for_new_connection();
        self.connection.take()
    }

    fn signal(&self, local_id: &str, signal: Signal) -> NegotiationEvent {
        NegotiationEvent::Send(signal.into_client_message(local_id, &self.peer_id))
    }

    fn flush_outbound(&mut self, local_id: &str, events: &mut Vec<NegotiationEvent>) {
        for candidate in self.candidates.take_outbound() {
            events.push(self.signal(local_id, Signal::IceCandidate(candidate)));
        }
    }
}

/// Typed effects of a negotiation step, consumed by the session.
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    Send(ClientMessage),
    LinkConnecting(PeerId),
    LinkReady(PeerId),
    LinkFailed(PeerId),
    LinkClosed(PeerId),
    RemoteMedia(RemoteMedia),
}

pub struct NegotiationController {
    my_id: PeerId,
    connector: Arc<dyn PeerConnector>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    links: HashMap<PeerId, PeerLink>,
    next_generation: u64,
}

impl NegotiationController {
    pub fn new(
        my_id: impl Into<PeerId>,
        connector: Arc<dyn PeerConnector>,
        events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            my_id: my_id.into(),
            connector,
            events_tx,
            links: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    pub fn link(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub(crate) fn link_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Starts an offer toward `peer_id` unless a negotiation is already under way
    /// or finished on the current connection.
    pub async fn initiate(
        &mut self,
        peer_id: &str,
        media: &LocalMedia,
    ) -> Result<Vec<NegotiationEvent>, MeshError> {
        if let Some(link) = self.links.get(peer_id) {
            if link.has_connection() && link.state() != NegotiationState::Idle {
                tracing::debug!(
                    target = "mesh",
                    peer_id = %peer_id,
                    state = ?link.state(),
                    "negotiation already under way; not issuing another offer"
                );
                return Ok(Vec::new());
            }
        }
        let needs_connection = self
            .links
            .get(peer_id)
            .is_none_or(|link| !link.has_connection());
        if needs_connection {
            self.rebuild(peer_id).await?;
        }

        let my_id = self.my_id.clone();
        let link = self.require_link(peer_id)?;
        let connection = link.connection.clone().ok_or_else(|| closed(peer_id))?;
        link.negotiation = Negotiation::MakingOffer;
        tracing::debug!(
            target = "mesh",
            peer_id = %peer_id,
            generation = link.generation,
            polite = link.polite,
            "creating offer"
        );

        let offer = match make_offer(connection.as_ref(), media).await {
            Ok(offer) => offer,
            Err(err) => {
                link.negotiation = Negotiation::Idle;
                return Err(MeshError::connection(peer_id, err));
            }
        };
        link.negotiation = Negotiation::HaveLocalOffer {
            offer: offer.clone(),
        };
        Ok(vec![
            link.signal(&my_id, Signal::Offer(offer)),
            NegotiationEvent::LinkConnecting(peer_id.to_string()),
        ])
    }

    pub async fn on_remote_offer(
        &mut self,
        peer_id: &str,
        offer: SessionDescription,
        media: &LocalMedia,
    ) -> Result<Vec<NegotiationEvent>, MeshError> {
        let my_id = self.my_id.clone();
        let (collision, polite, needs_rebuild) = match self.links.get(peer_id) {
            Some(link) => (
                link.has_connection() && link.negotiation.in_progress(),
                link.polite,
                !link.has_connection() || link.state() != NegotiationState::Idle,
            ),
            None => (false, is_polite(&my_id, peer_id), true),
        };

        if collision && !polite {
            if let Some(link) = self.links.get_mut(peer_id) {
                link.ignore_offer = true;
            }
            tracing::debug!(
                target = "mesh",
                peer_id = %peer_id,
                "offer collision; impolite side keeps its own offer"
            );
            return Ok(Vec::new());
        }
        if collision {
            tracing::debug!(
                target = "mesh",
                peer_id = %peer_id,
                "offer collision; polite side rolls back and accepts remote offer"
            );
        }
        if needs_rebuild {
            self.rebuild(peer_id).await?;
        }

        let link = self.require_link(peer_id)?;
        let connection = link.connection.clone().ok_or_else(|| closed(peer_id))?;
        connection
            .set_remote_description(offer.clone())
            .await
            .map_err(|err| MeshError::connection(peer_id, err))?;
        link.negotiation = Negotiation::HaveRemoteOffer {
            offer: offer.clone(),
        };
        replay_inbound(link).await;

        let answer = match make_answer(connection.as_ref(), media).await {
            Ok(answer) => answer,
            Err(err) => {
                link.negotiation = Negotiation::Idle;
                return Err(MeshError::connection(peer_id, err));
            }
        };
        link.negotiation = Negotiation::Stable {
            local: answer.clone(),
            remote: offer,
        };
        link.ignore_offer = false;
        tracing::debug!(
            target = "mesh",
            peer_id = %peer_id,
            generation = link.generation,
            "answered remote offer"
        );

        let mut events = vec![link.signal(&my_id, Signal::Answer(answer))];
        link.flush_outbound(&my_id, &mut events);
        events.push(NegotiationEvent::LinkConnecting(peer_id.to_string()));
        Ok(events)
    }

    /// Applies an answer to our outstanding offer; answers in any other state
    /// are stale and dropped.
    pub async fn on_remote_answer(
        &mut self,
        peer_id: &str,
        answer: SessionDescription,
    ) -> Result<Vec<NegotiationEvent>, MeshError> {
        let my_id = self.my_id.clone();
        let Some(link) = self.links.get_mut(peer_id) else {
            tracing::debug!(target = "mesh", peer_id = %peer_id, "answer for unknown peer; discarding");
            return Ok(Vec::new());
        };
        let offer = match (&link.negotiation, &link.connection) {
            (Negotiation::HaveLocalOffer { offer }, Some(_)) => offer.clone(),
            _ => {
                tracing::debug!(
                    target = "mesh",
                    peer_id = %peer_id,
                    state = ?link.state(),
                    "answer without outstanding offer; discarding"
                );
                return Ok(Vec::new());
            }
        };
        let connection = link.connection.clone().ok_or_else(|| closed(peer_id))?;
        connection
            .set_remote_description(answer.clone())
            .await
            .map_err(|err| MeshError::connection(peer_id, err))?;
        link.negotiation = Negotiation::Stable {
            local: offer,
            remote: answer,
        };
        replay_inbound(link).await;
        link.ignore_offer = false;

        let mut events = Vec::new();
        link.flush_outbound(&my_id, &mut events);
        Ok(events)
    }

    pub async fn on_remote_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        let Some(link) = self.links.get_mut(peer_id) else {
            tracing::debug!(target = "mesh", peer_id = %peer_id, "candidate for unknown peer; discarding");
            return;
        };
        if link.candidates.is_applied(&candidate) {
            tracing::trace!(target = "mesh", peer_id = %peer_id, "duplicate candidate ignored");
            return;
        }
        if !link.has_remote_description() {
            if link.candidates.queue_inbound(candidate) {
                tracing::trace!(
                    target = "mesh",
                    peer_id = %peer_id,
                    queued = link.candidates.inbound_len(),
                    "queued remote candidate until remote description is set"
                );
            }
            return;
        }
        apply_candidate(link, candidate).await;
    }

    pub fn on_local_candidate(
        &mut self,
        peer_id: &str,
        generation: u64,
        candidate: IceCandidate,
    ) -> Vec<NegotiationEvent> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Vec::new();
        };
        if !link.is_current(generation) {
            tracing::trace!(target = "mesh", peer_id = %peer_id, generation, "stale local candidate dropped");
            return Vec::new();
        }
        if link.has_remote_description() {
            vec![link.signal(&self.my_id, Signal::IceCandidate(candidate))]
        } else {
            link.candidates.queue_outbound(candidate);
            Vec::new()
        }
    }

    pub fn on_connection_state(
        &mut self,
        peer_id: &str,
        generation: u64,
        state: LinkState,
    ) -> Option<NegotiationEvent> {
        let link = self.links.get(peer_id)?;
        if !link.is_current(generation) {
            tracing::trace!(
                target = "mesh",
                peer_id = %peer_id,
                generation,
                state = ?state,
                "state change from replaced connection ignored"
            );
            return None;
        }
        match state {
            LinkState::Connected => Some(NegotiationEvent::LinkReady(peer_id.to_string())),
            LinkState::Failed => Some(NegotiationEvent::LinkFailed(peer_id.to_string())),
            LinkState::Closed => Some(NegotiationEvent::LinkClosed(peer_id.to_string())),
            LinkState::Disconnected => {
                tracing::debug!(target = "mesh", peer_id = %peer_id, "link disconnected; waiting for recovery or failure");
                None
            }
            LinkState::New | LinkState::Connecting => None,
        }
    }

    pub fn on_remote_track(
        &mut self,
        peer_id: &str,
        generation: u64,
        media: RemoteMedia,
    ) -> Option<NegotiationEvent> {
        let link = self.links.get(peer_id)?;
        link.is_current(generation)
            .then_some(NegotiationEvent::RemoteMedia(media))
    }

    /// Closes the peer's connection but keeps the link (and its retry count).
    pub async fn teardown(&mut self, peer_id: &str) {
        let connection = self.links.get_mut(peer_id).and_then(PeerLink::take_connection);
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    pub async fn remove(&mut self, peer_id: &str) -> bool {
        match self.links.remove(peer_id) {
            Some(mut link) => {
                if let Some(connection) = link.connection.take() {
                    connection.close().await;
                }
                true
            }
            None => false,
        }
    }

    pub async fn clear(&mut self) {
        for (_, mut link) in self.links.drain() {
            if let Some(connection) = link.connection.take() {
                connection.close().await;
            }
        }
    }

    /// Destroys the current connection (if any) and installs a fresh one.
    ///
    /// The link is registered before the connector runs, so a failed open
    /// leaves a connectionless link for the supervisor to charge and retry.
    async fn rebuild(&mut self, peer_id: &str) -> Result<(), MeshError> {
        self.teardown(peer_id).await;
        let my_id = self.my_id.clone();
        self.links
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerLink::new(&my_id, peer_id));

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = ConnectionEvents::new(peer_id, generation, self.events_tx.clone());
        let connection = self
            .connector
            .open(events)
            .await
            .map_err(|err| MeshError::connection(peer_id, err))?;
        let link = self.require_link(peer_id)?;
        link.install(connection, generation);
        tracing::trace!(target = "mesh", peer_id = %peer_id, generation, "opened fresh connection");
        Ok(())
    }

    fn require_link(&mut self, peer_id: &str) -> Result<&mut PeerLink, MeshError> {
        self.links.get_mut(peer_id).ok_or_else(|| closed(peer_id))
    }
}

fn closed(peer_id: &str) -> MeshError {
    MeshError::connection(peer_id, crate::error::ConnectionError::Closed)
}

async fn make_offer(
    connection: &dyn PeerConnection,
    media: &LocalMedia,
) -> Result<SessionDescription, crate::error::ConnectionError> {
    connection.attach_media(media).await?;
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn make_answer(
    connection: &dyn PeerConnection,
    media: &LocalMedia,
) -> Result<SessionDescription, crate::error::ConnectionError> {
    connection.attach_media(media).await?;
    let answer = connection.create_answer().await?;
    connection.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn replay_inbound(link: &mut PeerLink) {
    for candidate in link.candidates.take_inbound() {
        apply_candidate(link, candidate).await;
    }
}

async fn apply_candidate(link: &mut PeerLink, candidate: IceCandidate) {
    let Some(connection) = link.connection.clone() else {
        return;
    };
    if !link.candidates.mark_applied(candidate.clone()) {
        return;
    }
    if let Err(err) = connection.add_ice_candidate(candidate).await {
        if link.ignore_offer {
            tracing::debug!(
                target = "mesh",
                peer_id = %link.peer_id,
                error = %err,
                "candidate for ignored offer rejected"
            );
        } else {
            tracing::warn!(
                target = "mesh",
                peer_id = %link.peer_id,
                error = %err,
                "failed to apply remote candidate"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEventKind;
    use crate::mock::MockNetwork;

    struct Side {
        controller: NegotiationController,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        media: LocalMedia,
    }

    fn side(network: &MockNetwork, id: &str) -> Side {
        let (tx, rx) = mpsc::unbounded_channel();
        Side {
            controller: NegotiationController::new(id, network.connector(id), tx),
            events: rx,
            media: LocalMedia::new(format!("{id}-mic")),
        }
    }

    fn sent(events: &[NegotiationEvent]) -> Vec<ClientMessage> {
        events
            .iter()
            .filter_map(|event| match event {
                NegotiationEvent::Send(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn offer_of(message: &ClientMessage) -> SessionDescription {
        match message {
            ClientMessage::Offer { offer, .. } => offer.clone(),
            other => panic!("expected offer, got {other:?}"),
        }
    }

    fn answer_of(message: &ClientMessage) -> SessionDescription {
        match message {
            ClientMessage::Answer { answer, .. } => answer.clone(),
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn exactly_one_side_of_a_pair_is_polite() {
        let ids = ["alice", "bob", "carol", "a", "ab", "peer-10", "peer-9"];
        for a in ids {
            for b in ids {
                if a != b {
                    assert_ne!(is_polite(a, b), is_polite(b, a), "{a} vs {b}");
                }
            }
        }
        assert!(is_polite("alice", "bob"));
    }

    #[tokio::test]
    async fn initiate_does_not_issue_a_second_offer_while_one_is_outstanding() {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice");

        let first = alice
            .controller
            .initiate("bob", &alice.media)
            .await
            .expect("first offer");
        assert_eq!(sent(&first).len(), 1);
        let second = alice
            .controller
            .initiate("bob", &alice.media)
            .await
            .expect("second initiate");
        assert!(second.is_empty());
        assert_eq!(network.offers_created("alice", "bob"), 1);
        assert_eq!(
            alice.controller.link("bob").map(PeerLink::state),
            Some(NegotiationState::HaveLocalOffer)
        );
    }

    async fn glare(impolite_first: bool) {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice"); // polite
        let mut bob = side(&network, "bob"); // impolite

        let alice_offer = sent(&alice.controller.initiate("bob", &alice.media).await.expect("alice offer"));
        let bob_offer = sent(&bob.controller.initiate("alice", &bob.media).await.expect("bob offer"));

        let (bob_reply, alice_reply);
        if impolite_first {
            bob_reply = bob
                .controller
                .on_remote_offer("alice", offer_of(&alice_offer[0]), &bob.media)
                .await
                .expect("bob handles offer");
            alice_reply = alice
                .controller
                .on_remote_offer("bob", offer_of(&bob_offer[0]), &alice.media)
                .await
                .expect("alice handles offer");
        } else {
            alice_reply = alice
                .controller
                .on_remote_offer("bob", offer_of(&bob_offer[0]), &alice.media)
                .await
                .expect("alice handles offer");
            bob_reply = bob
                .controller
                .on_remote_offer("alice", offer_of(&alice_offer[0]), &bob.media)
                .await
                .expect("bob handles offer");
        }

        assert!(bob_reply.is_empty(), "impolite side must ignore the colliding offer");
        assert!(bob.controller.link("alice").is_some_and(PeerLink::ignore_offer));

        let answers = sent(&alice_reply);
        assert_eq!(answers.len(), 1);
        let answer = answer_of(&answers[0]);
        let (alice_local, alice_remote) = alice
            .controller
            .link("bob")
            .and_then(PeerLink::settled_descriptions)
            .expect("alice stable");
        assert_eq!(alice_remote, &offer_of(&bob_offer[0]));
        assert_eq!(alice_local, &answer);

        bob.controller
            .on_remote_answer("alice", answer)
            .await
            .expect("bob applies answer");
        let bob_link = bob.controller.link("alice").expect("bob link");
        assert_eq!(bob_link.state(), NegotiationState::Stable);
        assert!(!bob_link.ignore_offer());
        assert!(network.is_established("alice", "bob"));
        assert!(network.is_established("bob", "alice"));
        assert_eq!(network.offers_created("bob", "alice"), 1);
    }

    #[tokio::test]
    async fn impolite_offer_wins_when_impolite_side_hears_first() {
        glare(true).await;
    }

    #[tokio::test]
    async fn impolite_offer_wins_when_polite_side_hears_first() {
        glare(false).await;
    }

    #[tokio::test]
    async fn answer_outside_have_local_offer_is_discarded() {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice");

        let events = alice
            .controller
            .on_remote_answer("bob", SessionDescription::answer("stale"))
            .await
            .expect("unknown peer");
        assert!(events.is_empty());
        assert!(alice.controller.link("bob").is_none());

        let offer = SessionDescription::offer("mock-offer bob->alice gen=99");
        alice
            .controller
            .on_remote_offer("bob", offer, &alice.media)
            .await
            .expect("accept offer");
        let events = alice
            .controller
            .on_remote_answer("bob", SessionDescription::answer("duplicate"))
            .await
            .expect("stable link");
        assert!(events.is_empty());
        assert_eq!(
            alice.controller.link("bob").map(PeerLink::state),
            Some(NegotiationState::Stable)
        );
    }

    #[tokio::test]
    async fn remote_candidates_wait_for_remote_description_and_apply_once() {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice");
        let mut bob = side(&network, "bob");
        let candidate = IceCandidate::new("candidate:bob-1 1 udp 1 127.0.0.1 9 typ host");

        let offer = sent(&alice.controller.initiate("bob", &alice.media).await.expect("offer"));
        alice.controller.on_remote_candidate("bob", candidate.clone()).await;
        alice.controller.on_remote_candidate("bob", candidate.clone()).await;
        assert_eq!(
            alice.controller.link("bob").map(|link| link.candidates().inbound_len()),
            Some(1)
        );
        assert!(network.applied_candidates("alice", "bob").is_empty());

        let reply = sent(
            &bob.controller
                .on_remote_offer("alice", offer_of(&offer[0]), &bob.media)
                .await
                .expect("answer"),
        );
        alice
            .controller
            .on_remote_answer("bob", answer_of(&reply[0]))
            .await
            .expect("apply answer");
        alice.controller.on_remote_candidate("bob", candidate.clone()).await;

        assert_eq!(network.applied_candidates("alice", "bob"), vec![candidate]);
    }

    #[tokio::test]
    async fn local_candidates_are_held_until_the_answer_arrives() {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice");
        let mut bob = side(&network, "bob");

        let offer = sent(&alice.controller.initiate("bob", &alice.media).await.expect("offer"));
        let mut held = Vec::new();
        while let Ok(event) = alice.events.try_recv() {
            if let ConnectionEventKind::LocalCandidate(candidate) = event.kind {
                held.extend(alice.controller.on_local_candidate("bob", event.generation, candidate));
            }
        }
        assert!(held.is_empty());
        assert_eq!(
            alice.controller.link("bob").map(|link| link.candidates().outbound_len()),
            Some(1)
        );

        let reply = sent(
            &bob.controller
                .on_remote_offer("alice", offer_of(&offer[0]), &bob.media)
                .await
                .expect("answer"),
        );
        let flushed = alice
            .controller
            .on_remote_answer("bob", answer_of(&reply[0]))
            .await
            .expect("apply answer");
        let flushed = sent(&flushed);
        assert_eq!(flushed.len(), 1);
        assert!(matches!(flushed[0], ClientMessage::IceCandidate { .. }));
    }

    #[tokio::test]
    async fn failed_open_leaves_a_connectionless_link_behind() {
        let network = MockNetwork::new();
        network.fail_next_opens("alice", "bob", 1);
        let mut alice = side(&network, "alice");

        let err = alice
            .controller
            .initiate("bob", &alice.media)
            .await
            .expect_err("open fails");
        assert!(matches!(err, MeshError::Connection { ref peer_id, .. } if peer_id == "bob"));
        let link = alice.controller.link("bob").expect("link registered before open");
        assert!(!link.has_connection());
        assert_eq!(link.state(), NegotiationState::Idle);

        let retry = alice
            .controller
            .initiate("bob", &alice.media)
            .await
            .expect("second open succeeds");
        assert_eq!(sent(&retry).len(), 1);
        assert_eq!(network.opened("alice", "bob"), 1);
    }

    #[tokio::test]
    async fn candidates_queued_for_a_dead_connection_are_not_replayed() {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice");
        let mut bob = side(&network, "bob");
        let stale = IceCandidate::new("candidate:bob-old 1 udp 1 127.0.0.1 9 typ host");

        alice.controller.initiate("bob", &alice.media).await.expect("offer");
        alice.controller.on_remote_candidate("bob", stale).await;
        alice.controller.teardown("bob").await;
        assert_eq!(
            alice.controller.link("bob").map(|link| link.candidates().inbound_len()),
            Some(0)
        );

        let offer = sent(&alice.controller.initiate("bob", &alice.media).await.expect("re-offer"));
        let reply = sent(
            &bob.controller
                .on_remote_offer("alice", offer_of(&offer[0]), &bob.media)
                .await
                .expect("answer"),
        );
        alice
            .controller
            .on_remote_answer("bob", answer_of(&reply[0]))
            .await
            .expect("apply answer");
        assert!(network.applied_candidates("alice", "bob").is_empty());
    }

    #[tokio::test]
    async fn events_from_a_replaced_connection_are_ignored() {
        let network = MockNetwork::new();
        let mut alice = side(&network, "alice");

        alice.controller.initiate("bob", &alice.media).await.expect("offer");
        let first_generation = alice.controller.link("bob").map(PeerLink::generation).expect("link");
        // bob's offer collides and alice (polite) rebuilds the link.
        alice
            .controller
            .on_remote_offer("bob", SessionDescription::offer("mock-offer bob->alice gen=7"), &alice.media)
            .await
            .expect("rollback");
        let link = alice.controller.link("bob").expect("link");
        assert_ne!(link.generation(), first_generation);
        assert!(
            alice
                .controller
                .on_connection_state("bob", first_generation, LinkState::Failed)
                .is_none()
        );
        assert_eq!(network.opened("alice", "bob"), 2);
    }
}
