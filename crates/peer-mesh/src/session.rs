//! Mesh session coordinator.
//!
//! A [`MeshSession`] owns every peer link for one local participant and is the
//! only thing that mutates them. Relay messages, connection events and retry
//! timers are funnelled into [`MeshSession::handle_event`] one at a time, so
//! no two handlers ever interleave on the same link. Drive it either with
//! [`MeshSession::spawn`] (an actor task plus a cloneable [`MeshHandle`]) or,
//! in tests, with [`MeshSession::process_pending`].

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectionEvent, ConnectionEventKind, PeerConnector};
use crate::error::MeshError;
use crate::media::{LocalMedia, MediaSource, RemoteMedia};
use crate::negotiation::{NegotiationController, NegotiationEvent, NegotiationState, PeerLink};
use crate::protocol::{ClientMessage, PeerId, ServerMessage, Signal};
use crate::relay::{RelayEvent, RelayGateway};
use crate::supervisor::{LinkHealth, ReconnectionSupervisor, RetryDecision, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshStatus {
    NotStarted,
    Pending,
    Completed,
    Failed,
}

/// Inputs to [`derive_status`]. Counts exclude the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusInputs {
    pub others_online: usize,
    pub connected: usize,
    /// Online peers the supervisor gave up on.
    pub abandoned: usize,
}

/// Aggregate status as a pure function of the current status and the counts.
///
/// `Completed` is sticky: once every online peer has been reached, later
/// churn does not demote the session. `Failed` only appears when some peer
/// was abandoned and nobody at all is connected.
pub fn derive_status(current: MeshStatus, inputs: StatusInputs) -> MeshStatus {
    if current == MeshStatus::NotStarted {
        return MeshStatus::NotStarted;
    }
    if inputs.abandoned > 0 && inputs.connected == 0 {
        return MeshStatus::Failed;
    }
    let required = inputs.others_online.saturating_sub(inputs.abandoned);
    if inputs.connected >= required {
        return MeshStatus::Completed;
    }
    match current {
        MeshStatus::Completed => MeshStatus::Completed,
        _ => MeshStatus::Pending,
    }
}

/// Observable changes, for UIs and logs.
#[derive(Debug, Clone)]
pub enum MeshNotification {
    StatusChanged(MeshStatus),
    PeerConnecting(PeerId),
    PeerConnected(PeerId),
    PeerRetrying {
        peer_id: PeerId,
        attempt: u32,
        delay: Duration,
    },
    PeerAbandoned {
        peer_id: PeerId,
        attempts: u32,
    },
    RemoteMedia(RemoteMedia),
    PeerLeft(PeerId),
}

impl MeshNotification {
    /// The error a caller would surface for this notification, if any.
    pub fn as_error(&self) -> Option<MeshError> {
        match self {
            MeshNotification::PeerAbandoned { peer_id, attempts } => {
                Some(MeshError::PeerAbandoned {
                    peer_id: peer_id.clone(),
                    attempts: *attempts,
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Relay(RelayEvent),
    Connection(ConnectionEvent),
    RetryDue(PeerId),
}

/// Point-in-time view of a session, returned through [`MeshHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub status: MeshStatus,
    pub muted: bool,
    pub online: Vec<PeerId>,
    pub connected: Vec<PeerId>,
    pub connecting: Vec<PeerId>,
}

pub struct MeshSession {
    my_id: PeerId,
    media_source: Arc<dyn MediaSource>,
    relay: Arc<dyn RelayGateway>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    controller: NegotiationController,
    supervisor: ReconnectionSupervisor,
    online: BTreeSet<PeerId>,
    connected: BTreeSet<PeerId>,
    ready_retries: VecDeque<PeerId>,
    remote_media: HashMap<PeerId, RemoteMedia>,
    local_media: Option<LocalMedia>,
    status_tx: watch::Sender<MeshStatus>,
    notify_tx: Option<mpsc::UnboundedSender<MeshNotification>>,
}

impl MeshSession {
    pub fn new(
        my_id: impl Into<PeerId>,
        retry: RetryPolicy,
        media_source: Arc<dyn MediaSource>,
        connector: Arc<dyn PeerConnector>,
        relay: Arc<dyn RelayGateway>,
        relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> Self {
        let my_id = my_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(MeshStatus::NotStarted);
        Self {
            controller: NegotiationController::new(my_id.clone(), connector, events_tx),
            supervisor: ReconnectionSupervisor::new(retry),
            my_id,
            media_source,
            relay,
            relay_rx,
            events_rx,
            online: BTreeSet::new(),
            connected: BTreeSet::new(),
            ready_retries: VecDeque::new(),
            remote_media: HashMap::new(),
            local_media: None,
            status_tx,
            notify_tx: None,
        }
    }

    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    pub fn status(&self) -> MeshStatus {
        *self.status_tx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<MeshStatus> {
        self.status_tx.subscribe()
    }

    /// Starts a fresh notification stream; only the latest receiver is fed.
    pub fn notifications(&mut self) -> mpsc::UnboundedReceiver<MeshNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.notify_tx = Some(tx);
        rx
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn remote_media(&self, peer_id: &str) -> Option<&RemoteMedia> {
        self.remote_media.get(peer_id)
    }

    pub fn is_muted(&self) -> bool {
        self.local_media
            .as_ref()
            .is_some_and(|media| !media.is_enabled())
    }

    pub fn link(&self, peer_id: &str) -> Option<&PeerLink> {
        self.controller.link(peer_id)
    }

    pub fn link_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.controller.link(peer_id).map(PeerLink::state)
    }

    pub fn link_count(&self) -> usize {
        self.controller.len()
    }

    pub fn peer_health(&self, peer_id: &str) -> LinkHealth {
        self.supervisor.health(peer_id)
    }

    /// True while a link to the peer exists but is neither up nor abandoned.
    pub fn is_peer_connecting(&self, peer_id: &str) -> bool {
        self.controller.link(peer_id).is_some()
            && !self.connected.contains(peer_id)
            && !self.supervisor.is_abandoned(peer_id)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.connected.iter()
    }

    pub fn online_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.online.iter()
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            status: self.status(),
            muted: self.is_muted(),
            online: self.online.iter().cloned().collect(),
            connected: self.connected.iter().cloned().collect(),
            connecting: self
                .online
                .iter()
                .filter(|peer_id| self.is_peer_connecting(peer_id))
                .cloned()
                .collect(),
        }
    }

    /// Acquires local audio and announces this participant to the room.
    pub async fn join(&mut self) -> Result<(), MeshError> {
        if self.status() != MeshStatus::NotStarted {
            return Err(MeshError::AlreadyJoined);
        }
        let media = match self.media_source.acquire().await {
            Ok(media) => media,
            Err(err) => {
                tracing::warn!(target = "mesh", peer_id = %self.my_id, error = %err, "could not acquire local audio");
                return Err(MeshError::MediaAcquisition(err));
            }
        };
        if let Err(err) = self.relay.send(ClientMessage::Join {
            account_id: self.my_id.clone(),
        }) {
            media.release();
            return Err(err.into());
        }
        tracing::info!(
            target = "mesh",
            peer_id = %self.my_id,
            media = %media.id(),
            online = self.online.len(),
            "joined mesh"
        );
        self.local_media = Some(media);
        self.set_status(MeshStatus::Pending);
        self.refresh_status();
        Ok(())
    }

    /// Tears down every link and releases local audio. Safe to call in any
    /// state; a second call is a no-op.
    pub async fn leave(&mut self) {
        if self.status() == MeshStatus::NotStarted {
            return;
        }
        let links = self.controller.len();
        self.supervisor.clear();
        self.ready_retries.clear();
        self.controller.clear().await;
        self.connected.clear();
        self.remote_media.clear();
        if let Some(media) = self.local_media.take() {
            media.release();
        }
        tracing::info!(target = "mesh", peer_id = %self.my_id, links, "left mesh");
        self.set_status(MeshStatus::NotStarted);
    }

    /// Flips the local audio's enabled flag. Returns `true` when now muted.
    pub fn toggle_mute(&mut self) -> Result<bool, MeshError> {
        let media = self.local_media.as_ref().ok_or(MeshError::NotJoined)?;
        let muted = !media.toggle();
        tracing::debug!(target = "mesh", peer_id = %self.my_id, muted, "toggled mute");
        Ok(muted)
    }

    /// Reacts to another participant announcing itself.
    pub async fn on_peer_announced(&mut self, peer_id: &str) -> Result<(), MeshError> {
        if peer_id == self.my_id {
            return Ok(());
        }
        self.online.insert(peer_id.to_string());
        if self.supervisor.is_abandoned(peer_id) {
            let link = self.controller.link_mut(peer_id);
            self.supervisor.reinstate(link, peer_id);
            tracing::info!(target = "mesh", peer_id = %peer_id, "abandoned peer re-announced; retry budget restored");
        }
        if self.local_media.is_none() {
            return Ok(());
        }
        // A JOIN means the peer restarted: whatever we had with it is void,
        // including an offer it never saw.
        let was_connected = self.connected.remove(peer_id);
        if was_connected || self.controller.link(peer_id).is_some_and(PeerLink::has_connection) {
            tracing::debug!(
                target = "mesh",
                peer_id = %peer_id,
                was_connected,
                state = ?self.link_state(peer_id),
                "peer re-announced; rebuilding link"
            );
            self.remote_media.remove(peer_id);
            self.controller.teardown(peer_id).await;
        }
        self.start_negotiation(peer_id).await
    }

    /// Routes one point-to-point signal from `peer_id`.
    pub async fn on_signal(&mut self, peer_id: &str, signal: Signal) -> Result<(), MeshError> {
        if peer_id == self.my_id {
            return Ok(());
        }
        let Some(media) = self.local_media.clone() else {
            tracing::debug!(target = "mesh", peer_id = %peer_id, "signal before join; discarding");
            return Ok(());
        };
        match signal {
            Signal::Offer(offer) => {
                self.online.insert(peer_id.to_string());
                self.supervisor.cancel(peer_id);
                self.ready_retries.retain(|queued| queued != peer_id);
                let result = self.controller.on_remote_offer(peer_id, offer, &media).await;
                if matches!(&result, Ok(events) if !events.is_empty()) && self.connected.remove(peer_id) {
                    self.remote_media.remove(peer_id);
                }
                self.absorb(peer_id, result).await
            }
            Signal::Answer(answer) => {
                let result = self.controller.on_remote_answer(peer_id, answer).await;
                self.absorb(peer_id, result).await
            }
            Signal::IceCandidate(candidate) => {
                self.controller.on_remote_candidate(peer_id, candidate).await;
                Ok(())
            }
        }
    }

    pub async fn handle_event(&mut self, event: SessionEvent) -> Result<(), MeshError> {
        let result = match event {
            SessionEvent::Relay(RelayEvent::Message(message)) => {
                self.on_relay_message(message).await
            }
            SessionEvent::Relay(RelayEvent::Disconnected) => {
                tracing::warn!(target = "relay", peer_id = %self.my_id, "relay disconnected");
                Ok(())
            }
            SessionEvent::Connection(event) => self.on_connection_event(event).await,
            SessionEvent::RetryDue(peer_id) => {
                self.renegotiate(&peer_id).await;
                Ok(())
            }
        };
        while let Some(peer_id) = self.ready_retries.pop_front() {
            self.renegotiate(&peer_id).await;
        }
        self.refresh_status();
        result
    }

    /// Waits for the next relay message, connection event or due retry.
    /// Connection events win ties so a link's own failure is seen before any
    /// signal that arrived behind it. A closed relay only disables its branch;
    /// the retry timer keeps the wait alive.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => SessionEvent::Connection(event),
            peer_id = self.supervisor.next_due() => SessionEvent::RetryDue(peer_id),
            Some(event) = self.relay_rx.recv() => SessionEvent::Relay(event),
        }
    }

    /// Handles everything that is ready without waiting. Returns how many
    /// events were processed.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = if let Ok(event) = self.events_rx.try_recv() {
                SessionEvent::Connection(event)
            } else if let Some(peer_id) = self.supervisor.poll_due_now() {
                SessionEvent::RetryDue(peer_id)
            } else if let Ok(event) = self.relay_rx.try_recv() {
                SessionEvent::Relay(event)
            } else {
                return handled;
            };
            if let Err(err) = self.handle_event(event).await {
                tracing::warn!(target = "mesh", peer_id = %self.my_id, error = %err, "failed to handle session event");
            }
            handled += 1;
        }
    }

    /// Moves the session onto its own task.
    pub fn spawn(self) -> (MeshHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = MeshHandle {
            commands: commands_tx,
            status: self.status_watch(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.leave().await;
                        break;
                    }
                },
                event = self.next_event() => {
                    if let Err(err) = self.handle_event(event).await {
                        tracing::warn!(target = "mesh", peer_id = %self.my_id, error = %err, "failed to handle session event");
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join(reply) => {
                let result = self.join().await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn on_relay_message(&mut self, message: ServerMessage) -> Result<(), MeshError> {
        match message {
            ServerMessage::Join { from_id } => self.on_peer_announced(&from_id).await,
            ServerMessage::Presence { peer_ids } => {
                self.on_presence(peer_ids).await;
                Ok(())
            }
            ServerMessage::Pong => Ok(()),
            other => {
                let Some((from_id, to_id, signal)) = other.into_signal() else {
                    return Ok(());
                };
                if to_id != self.my_id {
                    tracing::debug!(target = "relay", from = %from_id, to = %to_id, "signal addressed elsewhere; discarding");
                    return Ok(());
                }
                self.on_signal(&from_id, signal).await
            }
        }
    }

    async fn on_presence(&mut self, peer_ids: Vec<PeerId>) {
        let next: BTreeSet<PeerId> = peer_ids
            .into_iter()
            .filter(|peer_id| *peer_id != self.my_id)
            .collect();
        let departed: Vec<PeerId> = self.online.difference(&next).cloned().collect();
        self.online = next;
        for peer_id in departed {
            self.remove_peer(&peer_id).await;
        }
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) -> Result<(), MeshError> {
        let ConnectionEvent {
            peer_id,
            generation,
            kind,
        } = event;
        let events = match kind {
            ConnectionEventKind::LocalCandidate(candidate) => {
                self.controller
                    .on_local_candidate(&peer_id, generation, candidate)
            }
            ConnectionEventKind::StateChanged(state) => self
                .controller
                .on_connection_state(&peer_id, generation, state)
                .into_iter()
                .collect(),
            ConnectionEventKind::RemoteTrack(media) => self
                .controller
                .on_remote_track(&peer_id, generation, media)
                .into_iter()
                .collect(),
        };
        self.apply(events).await
    }

    /// Turns a negotiation step's result into effects. Connection-level
    /// failures count against the peer's retry budget instead of propagating.
    async fn absorb(
        &mut self,
        peer_id: &str,
        result: Result<Vec<NegotiationEvent>, MeshError>,
    ) -> Result<(), MeshError> {
        match result {
            Ok(events) => self.apply(events).await,
            Err(err @ MeshError::Connection { .. }) => {
                tracing::warn!(target = "mesh", peer_id = %peer_id, error = %err, "negotiation step failed");
                self.link_failed(peer_id).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn apply(&mut self, events: Vec<NegotiationEvent>) -> Result<(), MeshError> {
        for event in events {
            match event {
                NegotiationEvent::Send(message) => {
                    tracing::trace!(target = "relay", kind = message.label(), to = ?message.to_id(), "sending signal");
                    self.relay.send(message)?;
                }
                NegotiationEvent::LinkConnecting(peer_id) => {
                    self.notify(MeshNotification::PeerConnecting(peer_id));
                }
                NegotiationEvent::LinkReady(peer_id) => self.link_ready(peer_id),
                NegotiationEvent::LinkFailed(peer_id) => self.link_failed(&peer_id).await,
                NegotiationEvent::LinkClosed(peer_id) => {
                    tracing::info!(target = "mesh", peer_id = %peer_id, "link closed by remote");
                    self.remove_peer(&peer_id).await;
                }
                NegotiationEvent::RemoteMedia(media) => {
                    tracing::debug!(target = "mesh", peer_id = %media.peer_id, track = %media.track_id, "remote audio attached");
                    self.remote_media.insert(media.peer_id.clone(), media.clone());
                    self.notify(MeshNotification::RemoteMedia(media));
                }
            }
        }
        Ok(())
    }

    fn link_ready(&mut self, peer_id: PeerId) {
        if let Some(link) = self.controller.link_mut(&peer_id) {
            self.supervisor.on_connected(link);
        }
        self.online.insert(peer_id.clone());
        if self.connected.insert(peer_id.clone()) {
            tracing::info!(
                target = "mesh",
                peer_id = %peer_id,
                connected = self.connected.len(),
                online = self.online.len(),
                "peer connected"
            );
            self.notify(MeshNotification::PeerConnected(peer_id));
        }
    }

    async fn link_failed(&mut self, peer_id: &str) {
        self.controller.teardown(peer_id).await;
        self.connected.remove(peer_id);
        self.remote_media.remove(peer_id);
        if self.supervisor.is_abandoned(peer_id) {
            tracing::debug!(target = "mesh", peer_id = %peer_id, "link to abandoned peer failed again");
            return;
        }
        let Some(link) = self.controller.link_mut(peer_id) else {
            return;
        };
        match self.supervisor.on_failed(link) {
            RetryDecision::Retry { attempt, delay } => {
                if delay.is_zero() {
                    self.ready_retries.push_back(peer_id.to_string());
                }
                self.notify(MeshNotification::PeerRetrying {
                    peer_id: peer_id.to_string(),
                    attempt,
                    delay,
                });
            }
            RetryDecision::Abandon { attempts } => {
                let err = MeshError::PeerAbandoned {
                    peer_id: peer_id.to_string(),
                    attempts,
                };
                tracing::error!(target = "mesh", error = %err, "giving up on peer");
                self.notify(MeshNotification::PeerAbandoned {
                    peer_id: peer_id.to_string(),
                    attempts,
                });
            }
        }
    }

    async fn renegotiate(&mut self, peer_id: &str) {
        if self.local_media.is_none()
            || !self.online.contains(peer_id)
            || self.supervisor.is_abandoned(peer_id)
        {
            return;
        }
        let attempt = self
            .controller
            .link(peer_id)
            .map(PeerLink::retry_count)
            .unwrap_or_default();
        tracing::info!(target = "mesh", peer_id = %peer_id, attempt, "renegotiating link");
        if let Err(err) = self.start_negotiation(peer_id).await {
            tracing::warn!(target = "mesh", peer_id = %peer_id, error = %err, "renegotiation failed");
        }
    }

    async fn start_negotiation(&mut self, peer_id: &str) -> Result<(), MeshError> {
        let media = self.local_media.clone().ok_or(MeshError::NotJoined)?;
        if self.connected.contains(peer_id) {
            return Ok(());
        }
        let result = self.controller.initiate(peer_id, &media).await;
        self.absorb(peer_id, result).await
    }

    async fn remove_peer(&mut self, peer_id: &str) {
        let had_link = self.controller.remove(peer_id).await;
        self.connected.remove(peer_id);
        self.remote_media.remove(peer_id);
        self.supervisor.forget(peer_id);
        self.ready_retries.retain(|queued| queued != peer_id);
        if had_link {
            tracing::info!(target = "mesh", peer_id = %peer_id, "peer left; link removed");
            self.notify(MeshNotification::PeerLeft(peer_id.to_string()));
        }
    }

    fn refresh_status(&mut self) {
        let current = self.status();
        let inputs = StatusInputs {
            others_online: self.online.len(),
            connected: self
                .connected
                .iter()
                .filter(|peer_id| self.online.contains(*peer_id))
                .count(),
            abandoned: self
                .online
                .iter()
                .filter(|peer_id| self.supervisor.is_abandoned(peer_id))
                .count(),
        };
        let next = derive_status(current, inputs);
        if next != current {
            self.set_status(next);
        }
    }

    fn set_status(&mut self, status: MeshStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            tracing::info!(target = "mesh", peer_id = %self.my_id, from = ?previous, to = ?status, "mesh status changed");
            self.notify(MeshNotification::StatusChanged(status));
        }
    }

    fn notify(&mut self, notification: MeshNotification) {
        if let Some(tx) = &self.notify_tx {
            if tx.send(notification).is_err() {
                self.notify_tx = None;
            }
        }
    }
}

enum Command {
    Join(oneshot::Sender<Result<(), MeshError>>),
    Leave(oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<Result<bool, MeshError>>),
    Snapshot(oneshot::Sender<MeshSnapshot>),
}

/// Cloneable front end to a spawned session. Dropping every handle makes the
/// session leave and stop.
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<MeshStatus>,
}

impl MeshHandle {
    pub async fn join(&self) -> Result<(), MeshError> {
        self.request(Command::Join).await?
    }

    pub async fn leave(&self) -> Result<(), MeshError> {
        self.request(Command::Leave).await
    }

    pub async fn toggle_mute(&self) -> Result<bool, MeshError> {
        self.request(Command::ToggleMute).await?
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot, MeshError> {
        self.request(Command::Snapshot).await
    }

    pub fn status(&self) -> MeshStatus {
        *self.status.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<MeshStatus> {
        self.status.clone()
    }

    pub async fn wait_for_status(&self, target: MeshStatus) -> Result<(), MeshError> {
        let mut status = self.status.clone();
        status
            .wait_for(|current| *current == target)
            .await
            .map_err(|_| MeshError::SessionClosed)?;
        Ok(())
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| MeshError::SessionClosed)?;
        rx.await.map_err(|_| MeshError::SessionClosed)
    }
}
