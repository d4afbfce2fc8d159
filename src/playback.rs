//! Best-effort play/pause/seek mirroring from the host's file playback to the
//! viewers' remote video elements. One-way, no acknowledgment.

use std::sync::Arc;

use tracing::debug;

use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackIntent {
    Play,
    Pause,
    Seek { time: f64 },
}

impl PlaybackIntent {
    pub fn to_client_message(self, room_id: &str) -> ClientMessage {
        let room_id = room_id.to_string();
        match self {
            PlaybackIntent::Play => ClientMessage::VideoPlay { room_id },
            PlaybackIntent::Pause => ClientMessage::VideoPause { room_id },
            PlaybackIntent::Seek { time } => ClientMessage::VideoSeek { time, room_id },
        }
    }

    pub fn to_server_message(self, room_id: &str) -> ServerMessage {
        let room_id = room_id.to_string();
        match self {
            PlaybackIntent::Play => ServerMessage::VideoPlay { room_id },
            PlaybackIntent::Pause => ServerMessage::VideoPause { room_id },
            PlaybackIntent::Seek { time } => ServerMessage::VideoSeek { time, room_id },
        }
    }

    /// Extracts the intent and its room from a relay event.
    pub fn from_server_message(msg: &ServerMessage) -> Option<(Self, &str)> {
        match msg {
            ServerMessage::VideoPlay { room_id } => Some((PlaybackIntent::Play, room_id)),
            ServerMessage::VideoPause { room_id } => Some((PlaybackIntent::Pause, room_id)),
            ServerMessage::VideoSeek { time, room_id } => {
                Some((PlaybackIntent::Seek { time: *time }, room_id))
            }
            _ => None,
        }
    }
}

/// HTML media element readiness, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

impl ReadyState {
    /// Seeking needs decoded data at the current position; play and pause
    /// are always accepted by the element.
    pub fn permits(self, intent: PlaybackIntent) -> bool {
        match intent {
            PlaybackIntent::Seek { .. } => self >= ReadyState::HaveCurrentData,
            PlaybackIntent::Play | PlaybackIntent::Pause => true,
        }
    }
}

/// A rendered video element, local or remote.
pub trait MediaElement: Send + Sync {
    fn ready_state(&self) -> ReadyState;
    fn is_paused(&self) -> bool;
    fn play(&self);
    fn pause(&self);
    fn set_current_time(&self, time: f64);
}

/// Applies an intent to one element. Returns whether it was applied.
pub fn apply_to_element(element: &dyn MediaElement, intent: PlaybackIntent) -> bool {
    if !element.ready_state().permits(intent) {
        return false;
    }
    match intent {
        PlaybackIntent::Play => element.play(),
        PlaybackIntent::Pause => element.pause(),
        PlaybackIntent::Seek { time } => {
            if !time.is_finite() || time < 0.0 {
                return false;
            }
            element.set_current_time(time)
        }
    }
    true
}

/// Room-scoped sync channel living inside a joined session.
#[derive(Debug, Clone)]
pub struct PlaybackSync {
    room_id: String,
}

impl PlaybackSync {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Outbound broadcast for a local intent; nothing is sent unless a file
    /// playback source is active.
    pub fn outbound(&self, intent: PlaybackIntent, file_active: bool) -> Option<ClientMessage> {
        if !file_active {
            return None;
        }
        debug!(room = %self.room_id, ?intent, "broadcasting playback intent");
        Some(intent.to_client_message(&self.room_id))
    }

    /// Applies a received intent to every remote element. Returns how many
    /// elements took it; elements that are not ready are skipped.
    pub fn apply_remote(
        &self,
        intent: PlaybackIntent,
        elements: &[Arc<dyn MediaElement>],
    ) -> usize {
        let applied = elements
            .iter()
            .filter(|el| apply_to_element(el.as_ref(), intent))
            .count();
        debug!(?intent, applied, total = elements.len(), "applied remote playback intent");
        applied
    }
}
