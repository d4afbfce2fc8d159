//! Per-remote-peer negotiation state machines and the sender table that
//! maps local sources onto each connection.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    client::SignalSink,
    config::IceConfig,
    error::PeerError,
    multiplexer::{Attachment, SourceChange},
    protocol::{
        ClientMessage, ConnectionId, IceCandidate, SessionDescription, SignalEnvelope, SignalType,
    },
    room::short,
    track::{LocalTrack, MediaKind, SlotKey, StreamId},
    view::{RemoteStreams, ViewEvent},
};

/// Handle of one sender on a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

/// Transport-level connection state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: MediaKind,
    pub stream_ids: Vec<String>,
}

/// Callbacks a peer connection raises, funneled into the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate {
        peer: ConnectionId,
        candidate: IceCandidate,
    },
    RemoteTrack {
        peer: ConnectionId,
        track: RemoteTrack,
    },
    RemoteTrackEnded {
        peer: ConnectionId,
        track_id: String,
    },
    StateChanged {
        peer: ConnectionId,
        state: ConnectionState,
    },
}

/// The platform peer connection behind one link.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;
    /// Discards a pending local offer, returning to stable.
    async fn rollback(&self) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    fn add_track(&self, track: &LocalTrack, stream: &StreamId) -> Result<SenderId, PeerError>;
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), PeerError>;
    fn remove_track(&self, sender: SenderId) -> Result<(), PeerError>;
    fn stop_transceivers(&self);
    fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        peer_id: &str,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

struct Sender {
    id: SenderId,
    track: LocalTrack,
}

/// Local view of one remote peer.
pub struct PeerLink {
    peer_id: ConnectionId,
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    senders: HashMap<SlotKey, Sender>,
    pending_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
    renegotiation_pending: bool,
}

impl PeerLink {
    fn new(peer_id: ConnectionId, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer_id,
            connection,
            state: NegotiationState::New,
            senders: HashMap::new(),
            pending_candidates: Vec::new(),
            has_remote_description: false,
            renegotiation_pending: false,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Puts `attachment` on its slot. Returns `true` when a new sender was
    /// added, which needs a renegotiation.
    async fn attach(&mut self, attachment: &Attachment) -> Result<bool, PeerError> {
        if let Some(sender) = self.senders.get_mut(&attachment.slot) {
            if sender.track.same_track(&attachment.track) {
                return Ok(false);
            }
            self.connection
                .replace_track(sender.id, &attachment.track)
                .await?;
            sender.track = attachment.track.clone();
            debug!(peer = %short(&self.peer_id), slot = ?attachment.slot, "replaced sender track");
            return Ok(false);
        }
        let id = self
            .connection
            .add_track(&attachment.track, &attachment.stream_id)?;
        self.senders.insert(
            attachment.slot,
            Sender {
                id,
                track: attachment.track.clone(),
            },
        );
        debug!(peer = %short(&self.peer_id), slot = ?attachment.slot, "added sender");
        Ok(true)
    }

    fn detach(&mut self, slot: &SlotKey) -> Result<bool, PeerError> {
        match self.senders.remove(slot) {
            Some(sender) => {
                self.connection.remove_track(sender.id)?;
                debug!(peer = %short(&self.peer_id), ?slot, "removed sender");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Owns every [`PeerLink`] of a session.
///
/// Links are created when a peer appears or when an offer arrives from an
/// unknown peer. Torn-down peers are remembered so late envelopes from them
/// are dropped instead of resurrecting a link, until [`reopen`](Self::reopen)
/// or a new appearance clears them.
pub struct PeerManager {
    local_id: ConnectionId,
    factory: Arc<dyn PeerConnectionFactory>,
    ice: IceConfig,
    signals: Arc<dyn SignalSink>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    views: mpsc::UnboundedSender<ViewEvent>,
    links: HashMap<ConnectionId, PeerLink>,
    closed: HashSet<ConnectionId>,
    remote: RemoteStreams,
}

impl PeerManager {
    pub fn new(
        local_id: impl Into<ConnectionId>,
        factory: Arc<dyn PeerConnectionFactory>,
        ice: IceConfig,
        signals: Arc<dyn SignalSink>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        views: mpsc::UnboundedSender<ViewEvent>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            factory,
            ice,
            signals,
            peer_events,
            views,
            links: HashMap::new(),
            closed: HashSet::new(),
            remote: RemoteStreams::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn link(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    /// `Closed` for torn-down peers, `None` for peers never seen.
    pub fn link_state(&self, peer_id: &str) -> Option<NegotiationState> {
        match self.links.get(peer_id) {
            Some(link) => Some(link.state),
            None if self.closed.contains(peer_id) => Some(NegotiationState::Closed),
            None => None,
        }
    }

    /// Forgets that `peer_id` was torn down so a new negotiation can link it
    /// again. Returns `false` when the peer was not closed.
    pub fn reopen(&mut self, peer_id: &str) -> bool {
        self.closed.remove(peer_id)
    }

    pub fn sender_count(&self, peer_id: &str) -> usize {
        self.links.get(peer_id).map_or(0, PeerLink::sender_count)
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Allocates a link for `peer_id` if none exists.
    pub fn create_link(&mut self, peer_id: &str) -> Result<&mut PeerLink, PeerError> {
        if !self.links.contains_key(peer_id) {
            let connection = self
                .factory
                .create(peer_id, &self.ice, self.peer_events.clone())?;
            debug!(peer = %short(peer_id), "created peer link");
            self.links
                .insert(peer_id.to_string(), PeerLink::new(peer_id.to_string(), connection));
        }
        self.links
            .get_mut(peer_id)
            .ok_or_else(|| PeerError::Negotiation("link vanished".into()))
    }

    /// A peer joined: link it, attach every active local track and offer.
    /// A second call for an already-linked peer does nothing.
    pub async fn on_peer_appeared(&mut self, peer_id: &str, attachments: &[Attachment]) {
        if peer_id == self.local_id {
            return;
        }
        if self.links.contains_key(peer_id) {
            debug!(peer = %short(peer_id), "peer already linked, ignoring");
            return;
        }
        self.reopen(peer_id);
        info!(peer = %short(peer_id), tracks = attachments.len(), "peer appeared, offering");

        let result = async {
            let link = self.create_link(peer_id)?;
            for attachment in attachments {
                link.attach(attachment).await?;
            }
            self.offer(peer_id).await
        }
        .await;
        if let Err(err) = result {
            self.fail(peer_id, err);
        }
    }

    /// Routes an inbound negotiation envelope. `attachments` are the local
    /// tracks a link created by an incoming offer starts with.
    pub async fn on_envelope(&mut self, envelope: SignalEnvelope, attachments: &[Attachment]) {
        let from = envelope.from.clone();
        if from.is_empty() || from == self.local_id {
            return;
        }
        if self.closed.contains(&from) {
            debug!(peer = %short(&from), kind = ?envelope.kind, "dropping envelope for closed link");
            return;
        }

        let result = match envelope.kind {
            SignalType::Offer => match serde_json::from_value::<SessionDescription>(envelope.data) {
                Ok(offer) => self.handle_offer(&from, offer, attachments).await,
                Err(err) => Err(err.into()),
            },
            SignalType::Answer => match serde_json::from_value::<SessionDescription>(envelope.data) {
                Ok(answer) => self.handle_answer(&from, answer).await,
                Err(err) => Err(err.into()),
            },
            SignalType::IceCandidate => {
                match serde_json::from_value::<IceCandidate>(envelope.data) {
                    Ok(candidate) => self.handle_candidate(&from, candidate).await,
                    Err(err) => {
                        warn!(peer = %short(&from), error = %err, "ignoring malformed candidate");
                        Ok(())
                    }
                }
            }
        };
        if let Err(err) = result {
            self.fail(&from, err);
        }
    }

    async fn handle_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        attachments: &[Attachment],
    ) -> Result<(), PeerError> {
        if !self.links.contains_key(from) {
            let link = self.create_link(from)?;
            for attachment in attachments {
                link.attach(attachment).await?;
            }
        }
        let polite = self.local_id.as_str() < from;
        let Some(link) = self.links.get_mut(from) else {
            return Ok(());
        };

        match link.state {
            NegotiationState::HaveLocalOffer if !polite => {
                debug!(peer = %short(from), "glare: keeping our offer, ignoring theirs");
                return Ok(());
            }
            NegotiationState::HaveLocalOffer => {
                debug!(peer = %short(from), "glare: rolling back our offer");
                link.connection.rollback().await?;
                link.state = NegotiationState::Stable;
                link.renegotiation_pending = true;
            }
            NegotiationState::Closed => return Ok(()),
            _ => {}
        }

        link.connection.set_remote_description(&offer).await?;
        link.has_remote_description = true;
        link.state = NegotiationState::HaveRemoteOffer;
        flush_candidates(link).await;

        let answer = link.connection.create_answer().await?;
        link.connection.set_local_description(&answer).await?;
        link.state = NegotiationState::Stable;
        self.send_signal(from, SignalType::Answer, &answer)?;
        debug!(peer = %short(from), "answered offer");

        self.offer_if_pending(from).await
    }

    async fn handle_answer(&mut self, from: &str, answer: SessionDescription) -> Result<(), PeerError> {
        let Some(link) = self.links.get_mut(from) else {
            debug!(peer = %short(from), "answer for unknown link");
            return Ok(());
        };
        if link.state != NegotiationState::HaveLocalOffer {
            debug!(peer = %short(from), state = ?link.state, "ignoring unexpected answer");
            return Ok(());
        }
        link.connection.set_remote_description(&answer).await?;
        link.has_remote_description = true;
        link.state = NegotiationState::Stable;
        flush_candidates(link).await;
        debug!(peer = %short(from), "negotiation stable");

        self.offer_if_pending(from).await
    }

    async fn handle_candidate(&mut self, from: &str, candidate: IceCandidate) -> Result<(), PeerError> {
        let Some(link) = self.links.get_mut(from) else {
            debug!(peer = %short(from), "candidate for unknown link");
            return Ok(());
        };
        if !link.has_remote_description {
            link.pending_candidates.push(candidate);
            return Ok(());
        }
        if let Err(err) = link.connection.add_ice_candidate(&candidate).await {
            warn!(peer = %short(from), error = %err, "failed to add ICE candidate");
        }
        Ok(())
    }

    async fn offer_if_pending(&mut self, peer_id: &str) -> Result<(), PeerError> {
        let pending = self
            .links
            .get_mut(peer_id)
            .map(|l| std::mem::take(&mut l.renegotiation_pending))
            .unwrap_or(false);
        if pending {
            self.offer(peer_id).await?;
        }
        Ok(())
    }

    /// Creates and sends an offer, or marks one pending while a round is
    /// already in flight.
    async fn offer(&mut self, peer_id: &str) -> Result<(), PeerError> {
        let Some(link) = self.links.get_mut(peer_id) else {
            return Ok(());
        };
        match link.state {
            NegotiationState::New | NegotiationState::Stable => {}
            NegotiationState::HaveLocalOffer | NegotiationState::HaveRemoteOffer => {
                link.renegotiation_pending = true;
                return Ok(());
            }
            NegotiationState::Closed => return Ok(()),
        }
        let offer = link.connection.create_offer().await?;
        link.connection.set_local_description(&offer).await?;
        link.state = NegotiationState::HaveLocalOffer;
        self.send_signal(peer_id, SignalType::Offer, &offer)?;
        debug!(peer = %short(peer_id), "sent offer");
        Ok(())
    }

    fn send_signal(
        &self,
        to: &str,
        kind: SignalType,
        payload: &impl serde::Serialize,
    ) -> Result<(), PeerError> {
        let envelope = SignalEnvelope {
            to: to.to_string(),
            from: self.local_id.clone(),
            kind,
            data: serde_json::to_value(payload)?,
        };
        self.signals
            .send(ClientMessage::Signal(envelope))
            .map_err(|err| PeerError::Transport(err.to_string()))
    }

    /// A fresh offer to one peer.
    pub async fn renegotiate(&mut self, peer_id: &str) {
        if let Err(err) = self.offer(peer_id).await {
            self.fail(peer_id, err);
        }
    }

    /// A fresh offer to every linked peer.
    pub async fn renegotiate_all(&mut self) {
        let peers: Vec<ConnectionId> = self.links.keys().cloned().collect();
        for peer in peers {
            self.renegotiate(&peer).await;
        }
    }

    /// Replaces the track on an existing sender for the slot, or adds a
    /// sender and renegotiates with that peer.
    pub async fn replace_or_add(&mut self, peer_id: &str, attachment: &Attachment) {
        let Some(link) = self.links.get_mut(peer_id) else {
            return;
        };
        let attached = link.attach(attachment).await;
        match attached {
            Ok(true) => self.renegotiate(peer_id).await,
            Ok(false) => {}
            Err(err) => self.fail(peer_id, err),
        }
    }

    /// Applies a local source change to every link, renegotiating each at
    /// most once and only when its sender set changed.
    pub async fn apply_change(&mut self, change: &SourceChange) {
        if change.is_empty() {
            return;
        }
        let peers: Vec<ConnectionId> = self.links.keys().cloned().collect();
        for peer in peers {
            let result = async {
                let Some(link) = self.links.get_mut(&peer) else {
                    return Ok(false);
                };
                let mut changed = false;
                for attachment in &change.attach {
                    changed |= link.attach(attachment).await?;
                }
                for slot in &change.detach {
                    changed |= link.detach(slot)?;
                }
                Ok::<bool, PeerError>(changed)
            }
            .await;
            match result {
                Ok(true) => self.renegotiate(&peer).await,
                Ok(false) => {}
                Err(err) => self.fail(&peer, err),
            }
        }
    }

    /// Sends a locally gathered candidate to its peer.
    pub fn on_local_candidate(&mut self, peer_id: &str, candidate: IceCandidate) {
        if !self.links.contains_key(peer_id) {
            return;
        }
        if let Err(err) = self.send_signal(peer_id, SignalType::IceCandidate, &candidate) {
            warn!(peer = %short(peer_id), error = %err, "could not send candidate");
        }
    }

    pub fn on_remote_track(&mut self, peer_id: &str, track: RemoteTrack) {
        if !self.links.contains_key(peer_id) {
            return;
        }
        debug!(peer = %short(peer_id), track = %track.track_id, streams = ?track.stream_ids, "remote track");
        let view = self.remote.add_track(peer_id, track);
        let _ = self.views.send(ViewEvent::ParticipantUpdated(view));
    }

    pub fn on_remote_track_ended(&mut self, peer_id: &str, track_id: &str) {
        if let Some(view) = self.remote.remove_track(peer_id, track_id) {
            let _ = self.views.send(ViewEvent::ParticipantUpdated(view));
        }
    }

    pub fn on_connection_state_change(&mut self, peer_id: &str, state: ConnectionState) {
        if state.is_terminal() {
            info!(peer = %short(peer_id), ?state, "connection ended");
            self.teardown(peer_id);
        } else {
            debug!(peer = %short(peer_id), ?state, "connection state");
        }
    }

    /// Dispatches a callback raised by a peer connection.
    pub fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { peer, candidate } => self.on_local_candidate(&peer, candidate),
            PeerEvent::RemoteTrack { peer, track } => self.on_remote_track(&peer, track),
            PeerEvent::RemoteTrackEnded { peer, track_id } => {
                self.on_remote_track_ended(&peer, &track_id)
            }
            PeerEvent::StateChanged { peer, state } => self.on_connection_state_change(&peer, state),
        }
    }

    fn fail(&mut self, peer_id: &str, err: PeerError) {
        warn!(peer = %short(peer_id), error = %err, "negotiation failed, dropping link");
        self.teardown(peer_id);
    }

    /// Stops and closes the link, remembers the peer as closed and tells the
    /// UI. Returns `false` when there was no link.
    pub fn teardown(&mut self, peer_id: &str) -> bool {
        let Some(mut link) = self.links.remove(peer_id) else {
            return false;
        };
        link.state = NegotiationState::Closed;
        link.connection.stop_transceivers();
        link.connection.close();
        self.closed.insert(peer_id.to_string());
        self.remote.remove_peer(peer_id);
        let _ = self.views.send(ViewEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
        info!(peer = %short(peer_id), "peer link closed");
        true
    }

    pub fn close_all(&mut self) {
        let peers: Vec<ConnectionId> = self.links.keys().cloned().collect();
        for peer in peers {
            self.teardown(&peer);
        }
        self.remote.clear();
    }
}

async fn flush_candidates(link: &mut PeerLink) {
    for candidate in std::mem::take(&mut link.pending_candidates) {
        if let Err(err) = link.connection.add_ice_candidate(&candidate).await {
            warn!(peer = %short(&link.peer_id), error = %err, "failed to add buffered candidate");
        }
    }
}
