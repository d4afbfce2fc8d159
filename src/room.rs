use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::DirectoryError,
    playback::PlaybackIntent,
    protocol::{
        normalize_display_name, ConnectionId, PeerSummary, RoomId, ServerMessage, SignalEnvelope,
    },
};

/// Outgoing queue of one accepted socket.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub room_id: RoomId,
}

impl Member {
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.connection_id.clone(),
            name: self.display_name.clone(),
        }
    }
}

/// Members in join order. At most one entry per connection.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    members: Vec<Member>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Room {
            id,
            members: Vec::new(),
        }
    }

    /// Inserts the member or renames the existing entry in place.
    /// Returns `true` when a new entry was created.
    pub fn upsert(&mut self, connection_id: &str, display_name: String) -> bool {
        if let Some(existing) = self
            .members
            .iter_mut()
            .find(|m| m.connection_id == connection_id)
        {
            existing.display_name = display_name;
            return false;
        }
        self.members.push(Member {
            connection_id: connection_id.to_string(),
            display_name,
            room_id: self.id.clone(),
        });
        true
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<Member> {
        let idx = self
            .members
            .iter()
            .position(|m| m.connection_id == connection_id)?;
        Some(self.members.remove(idx))
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.members.iter().any(|m| m.connection_id == connection_id)
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.members.iter().map(Member::summary).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Default)]
struct DirectoryInner {
    rooms: HashMap<RoomId, Room>,
    connections: HashMap<ConnectionId, Outbox>,
    shut_down: bool,
}

impl DirectoryInner {
    fn deliver(&self, to: &str, msg: ServerMessage) -> bool {
        match self.connections.get(to) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn broadcast_except(&self, room: &Room, except: &str, msg: &ServerMessage) {
        for member in room.members() {
            if member.connection_id != except {
                self.deliver(&member.connection_id, msg.clone());
            }
        }
    }

    /// Drops `connection_id` from every room, notifying the rest of each room.
    fn remove_everywhere(&mut self, connection_id: &str) -> Vec<RoomId> {
        let mut left = Vec::new();
        for room in self.rooms.values_mut() {
            if let Some(member) = room.remove(connection_id) {
                info!(
                    client = %short(connection_id),
                    name = %member.display_name,
                    room = %room.id,
                    "left room"
                );
                left.push(room.id.clone());
            }
        }

        let peer_left = ServerMessage::PeerLeft {
            id: connection_id.to_string(),
        };
        for room_id in &left {
            if let Some(room) = self.rooms.get(room_id) {
                self.broadcast_except(room, connection_id, &peer_left);
            }
        }

        // empty rooms are dropped immediately
        self.rooms.retain(|id, room| {
            let keep = !room.is_empty();
            if !keep {
                debug!(room = %id, "removing empty room");
            }
            keep
        });
        left
    }
}

/// Room membership table plus the routing table of live connections.
///
/// One instance is built at startup and shared by handle; every socket task
/// talks to it, never to a global map.
#[derive(Clone, Default)]
pub struct RoomDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connection_id` reachable by `relay` and room broadcasts.
    pub async fn register(&self, connection_id: &str, outbox: Outbox) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write().await;
        if inner.shut_down {
            return Err(DirectoryError::ShutDown);
        }
        if inner.connections.contains_key(connection_id) {
            return Err(DirectoryError::DuplicateConnection(connection_id.to_string()));
        }
        inner.connections.insert(connection_id.to_string(), outbox);
        Ok(())
    }

    /// Adds the connection to `room_id`, creating the room on first use.
    ///
    /// The joiner receives `existingPeers` (members before insertion, itself
    /// excluded) followed by `room-joined` with the full list; everyone else in
    /// the room receives `new-peer`. Joining again renames in place.
    /// Returns the members that were already present.
    pub async fn join(
        &self,
        connection_id: &str,
        room_id: &str,
        display_name: Option<&str>,
    ) -> Vec<PeerSummary> {
        let name = normalize_display_name(display_name);
        let mut inner = self.inner.write().await;

        let room = inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id.to_string()));

        let existing: Vec<PeerSummary> = room
            .members()
            .iter()
            .filter(|m| m.connection_id != connection_id)
            .map(Member::summary)
            .collect();

        let inserted = room.upsert(connection_id, name.clone());
        let members = room.summaries();
        let room = room.clone();

        inner.deliver(connection_id, ServerMessage::ExistingPeers(existing.clone()));
        inner.deliver(connection_id, ServerMessage::RoomJoined { members });
        inner.broadcast_except(
            &room,
            connection_id,
            &ServerMessage::NewPeer(PeerSummary {
                id: connection_id.to_string(),
                name: name.clone(),
            }),
        );

        if inserted {
            info!(client = %short(connection_id), %name, room = %room_id, "joined room");
        } else {
            info!(client = %short(connection_id), %name, room = %room_id, "rejoined room, name updated");
        }
        existing
    }

    /// Removes the connection from every room it is in. `room_id` only names
    /// the room the client asked to leave.
    pub async fn leave(&self, connection_id: &str, room_id: &str) -> Vec<RoomId> {
        let mut inner = self.inner.write().await;
        let left = inner.remove_everywhere(connection_id);
        if !left.iter().any(|r| r == room_id) {
            debug!(client = %short(connection_id), room = %room_id, "leave for a room the client was not in");
        }
        left
    }

    /// Socket closed: leave every room and forget the route.
    pub async fn disconnect(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        inner.remove_everywhere(connection_id);
        inner.connections.remove(connection_id);
    }

    /// Forwards an envelope to `envelope.to`. Unknown recipients are dropped.
    pub async fn relay(&self, sender: &str, mut envelope: SignalEnvelope) -> bool {
        if envelope.from.is_empty() {
            envelope.from = sender.to_string();
        }
        let inner = self.inner.read().await;
        let to = envelope.to.clone();
        let delivered = inner.deliver(&to, ServerMessage::Signal(envelope));
        if !delivered {
            debug!(from = %short(sender), to = %short(&to), "dropping envelope for unknown recipient");
        }
        delivered
    }

    /// Fans a playback intent out to every other member of `room_id`.
    /// Returns `false` when the sender is not a member of that room.
    pub async fn broadcast_playback(&self, sender: &str, room_id: &str, intent: PlaybackIntent) -> bool {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(room_id).filter(|r| r.contains(sender)) else {
            warn!(client = %short(sender), room = %room_id, "playback event from non-member");
            return false;
        };
        let msg = intent.to_server_message(room_id);
        inner.broadcast_except(room, sender, &msg);
        true
    }

    /// Sends an error event to one connection.
    pub async fn notify_error(&self, connection_id: &str, message: impl Into<String>) {
        let inner = self.inner.read().await;
        inner.deliver(
            connection_id,
            ServerMessage::Error {
                message: message.into(),
            },
        );
    }

    pub async fn members(&self, room_id: &str) -> Vec<Member> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(room_id)
            .map(|r| r.members().to_vec())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Drops every outbox (ending the socket writer tasks) and refuses new
    /// registrations.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        inner.shut_down = true;
        inner.rooms.clear();
        inner.connections.clear();
        info!("room directory shut down");
    }
}

pub(crate) fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
