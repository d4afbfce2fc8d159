//! The connection-scoped participant context: created on join, torn down on
//! leave or disconnect, and the only place relay messages, peer callbacks and
//! local media changes meet.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    capture::{MediaDevices, PlaybackSurface},
    client::SignalSink,
    config::IceConfig,
    error::{ClientError, MediaError},
    multiplexer::{Attachment, MediaEvent, MediaMultiplexer, SourceChange},
    peer::{PeerConnectionFactory, PeerEvent, PeerManager},
    playback::{MediaElement, PlaybackIntent, PlaybackSync},
    protocol::{ClientMessage, ConnectionId, PeerSummary, RoomId, ServerMessage, SignalType},
    room::short,
    track::{SourceType, TrackDescriptor},
    view::ViewEvent,
};

/// Platform handles a session is built from.
pub struct SessionContext {
    pub local_id: ConnectionId,
    pub signals: Arc<dyn SignalSink>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub ice: IceConfig,
    pub views: mpsc::UnboundedSender<ViewEvent>,
}

pub struct RoomSession {
    local_id: ConnectionId,
    room_id: RoomId,
    display_name: Option<String>,
    members: Vec<PeerSummary>,
    signals: Arc<dyn SignalSink>,
    views: mpsc::UnboundedSender<ViewEvent>,
    peers: PeerManager,
    media: MediaMultiplexer,
    playback: PlaybackSync,
    remote_elements: HashMap<(ConnectionId, SourceType), Arc<dyn MediaElement>>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
}

impl RoomSession {
    pub fn new(ctx: SessionContext, room_id: impl Into<RoomId>, display_name: Option<String>) -> Self {
        let room_id = room_id.into();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let peers = PeerManager::new(
            ctx.local_id.clone(),
            ctx.factory,
            ctx.ice,
            ctx.signals.clone(),
            peer_tx,
            ctx.views.clone(),
        );
        Self {
            local_id: ctx.local_id,
            playback: PlaybackSync::new(room_id.clone()),
            room_id,
            display_name,
            members: Vec::new(),
            signals: ctx.signals,
            views: ctx.views,
            peers,
            media: MediaMultiplexer::new(ctx.devices, media_tx),
            remote_elements: HashMap::new(),
            peer_rx,
            media_rx,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn members(&self) -> &[PeerSummary] {
        &self.members
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn media(&self) -> &MediaMultiplexer {
        &self.media
    }

    pub fn join(&self) -> Result<(), ClientError> {
        info!(room = %self.room_id, "joining room");
        self.signals.send(ClientMessage::JoinRoom {
            room_id: self.room_id.clone(),
            display_name: self.display_name.clone(),
        })
    }

    /// Tells the relay we are gone and releases every link and source.
    pub fn leave(&mut self) -> Result<(), ClientError> {
        let sent = self.signals.send(ClientMessage::LeaveRoom {
            room_id: self.room_id.clone(),
        });
        self.release();
        sent
    }

    /// The signaling socket is gone.
    pub fn on_disconnect(&mut self) {
        warn!(room = %self.room_id, "signaling disconnected, releasing session");
        self.release();
    }

    fn release(&mut self) {
        self.peers.close_all();
        self.media.stop_all();
        self.remote_elements.clear();
        self.members.clear();
    }

    fn publish_members(&self) {
        let _ = self.views.send(ViewEvent::MembersChanged(self.members.clone()));
    }

    fn attachments(&self) -> Vec<Attachment> {
        self.media.attachments()
    }

    fn is_member(&self, peer_id: &str) -> bool {
        self.members.iter().any(|m| m.id == peer_id)
    }

    /// Offers again to a room member, typically after its link failed.
    /// Returns `false` when the peer is not in the room.
    pub async fn reinvite(&mut self, peer_id: &str) -> bool {
        if peer_id == self.local_id || !self.is_member(peer_id) {
            return false;
        }
        let attachments = self.attachments();
        self.peers.on_peer_appeared(peer_id, &attachments).await;
        self.peers.link(peer_id).is_some()
    }

    pub async fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Welcome { id } => debug!(id = %id, "welcome after handshake"),
            ServerMessage::ExistingPeers(peers) => {
                // existing members offer to us once they see new-peer
                debug!(count = peers.len(), "existing peers");
                self.members = peers;
                self.publish_members();
            }
            ServerMessage::RoomJoined { members } => {
                info!(room = %self.room_id, count = members.len(), "joined");
                self.members = members;
                self.publish_members();
            }
            ServerMessage::NewPeer(peer) => {
                match self.members.iter_mut().find(|m| m.id == peer.id) {
                    Some(existing) => existing.name = peer.name.clone(),
                    None => self.members.push(peer.clone()),
                }
                self.publish_members();
                let attachments = self.attachments();
                self.peers.on_peer_appeared(&peer.id, &attachments).await;
            }
            ServerMessage::PeerLeft { id } => {
                self.members.retain(|m| m.id != id);
                self.publish_members();
                self.peers.teardown(&id);
                self.forget_elements(&id);
            }
            ServerMessage::Signal(envelope) => {
                // a fresh offer from someone still in the room starts a new link
                if envelope.kind == SignalType::Offer
                    && self.is_member(&envelope.from)
                    && self.peers.reopen(&envelope.from)
                {
                    info!(peer = %short(&envelope.from), "peer re-offered after teardown");
                }
                let attachments = self.attachments();
                self.peers.on_envelope(envelope, &attachments).await;
            }
            msg @ (ServerMessage::VideoPlay { .. }
            | ServerMessage::VideoPause { .. }
            | ServerMessage::VideoSeek { .. }) => {
                if let Some((intent, room)) = PlaybackIntent::from_server_message(&msg) {
                    if room != self.room_id {
                        debug!(room, "playback event for another room");
                        return;
                    }
                    let elements: Vec<_> = self.remote_elements.values().cloned().collect();
                    self.playback.apply_remote(intent, &elements);
                }
            }
            ServerMessage::Error { message } => warn!(%message, "relay reported an error"),
        }
    }

    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        let closed = match &event {
            PeerEvent::StateChanged { peer, state } if state.is_terminal() => Some(peer.clone()),
            _ => None,
        };
        self.peers.on_peer_event(event);
        if let Some(peer) = closed {
            self.forget_elements(&peer);
        }
    }

    /// A source ended on the platform side; treated as an explicit stop.
    pub async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::SourceEnded { source, stream_id } => {
                if self.media.current_stream(source) != Some(&stream_id) {
                    debug!(%stream_id, "end of a source that was already replaced");
                    return;
                }
                info!(?source, "source ended by the platform");
                self.stop_source(source).await;
            }
        }
    }

    async fn sync_links(&mut self, before: &[Attachment]) {
        let change = SourceChange::between(before, &self.media.attachments());
        if !change.is_empty() {
            debug!(
                attach = change.attach.len(),
                detach = change.detach.len(),
                "applying source change to links"
            );
            self.peers.apply_change(&change).await;
        }
    }

    pub async fn start_camera(
        &mut self,
        device_id: Option<String>,
        include_audio: bool,
    ) -> Result<Vec<TrackDescriptor>, MediaError> {
        let before = self.attachments();
        let result = self.media.start_camera(device_id, include_audio).await;
        self.sync_links(&before).await;
        result
    }

    pub async fn flip_camera(&mut self) -> Result<Vec<TrackDescriptor>, MediaError> {
        let before = self.attachments();
        let result = self.media.flip_camera().await;
        self.sync_links(&before).await;
        result
    }

    pub async fn start_screen_share(&mut self, include_mic: bool) -> Result<Vec<TrackDescriptor>, MediaError> {
        let before = self.attachments();
        let result = self.media.start_screen_share(include_mic).await;
        self.sync_links(&before).await;
        result
    }

    pub async fn capture_file_playback(
        &mut self,
        surface: Arc<dyn PlaybackSurface>,
    ) -> Result<Vec<TrackDescriptor>, MediaError> {
        let before = self.attachments();
        let result = self.media.capture_file_playback(surface).await;
        self.sync_links(&before).await;
        result
    }

    pub async fn toggle_mic(&mut self) -> Result<bool, MediaError> {
        let before = self.attachments();
        let result = self.media.toggle_mic().await;
        self.sync_links(&before).await;
        result
    }

    pub async fn stop_source(&mut self, source: SourceType) -> bool {
        let before = self.attachments();
        let stopped = self.media.stop_source(source);
        self.sync_links(&before).await;
        stopped
    }

    pub async fn stop_all_media(&mut self) {
        let before = self.attachments();
        self.media.stop_all();
        self.sync_links(&before).await;
    }

    /// Broadcasts a local play/pause/seek. Returns `false` when no file
    /// playback is active, in which case nothing is sent.
    pub fn broadcast_playback(&self, intent: PlaybackIntent) -> Result<bool, ClientError> {
        match self.playback.outbound(intent, self.media.is_file_playing()) {
            Some(msg) => self.signals.send(msg).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn play(&self) -> Result<bool, ClientError> {
        self.broadcast_playback(PlaybackIntent::Play)
    }

    pub fn pause(&self) -> Result<bool, ClientError> {
        self.broadcast_playback(PlaybackIntent::Pause)
    }

    pub fn seek(&self, time: f64) -> Result<bool, ClientError> {
        self.broadcast_playback(PlaybackIntent::Seek { time })
    }

    /// Registers an element the UI renders one of a peer's streams into.
    /// Main and overlay elements both follow remote playback intents.
    pub fn attach_remote_element(
        &mut self,
        peer_id: &str,
        source: SourceType,
        element: Arc<dyn MediaElement>,
    ) {
        self.remote_elements
            .insert((peer_id.to_string(), source), element);
    }

    pub fn detach_remote_element(&mut self, peer_id: &str, source: SourceType) {
        self.remote_elements.remove(&(peer_id.to_string(), source));
    }

    fn forget_elements(&mut self, peer_id: &str) {
        self.remote_elements.retain(|(peer, _), _| peer != peer_id);
    }

    /// Runs the session until the inbound relay stream ends, then releases
    /// everything.
    pub async fn drive(&mut self, inbound: &mut mpsc::UnboundedReceiver<ServerMessage>) {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_server_message(msg).await,
                    None => break,
                },
                Some(event) = self.peer_rx.recv() => self.handle_peer_event(event),
                Some(event) = self.media_rx.recv() => self.handle_media_event(event).await,
            }
        }
        info!(local = %short(&self.local_id), "session loop finished");
        self.on_disconnect();
    }
}
