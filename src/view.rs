//! View-model entities the UI renders remote participants from.

use std::collections::HashMap;

use crate::{
    peer::RemoteTrack,
    protocol::{ConnectionId, PeerSummary},
    track::SourceType,
};

/// One inbound stream, classified once from its synthetic id.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStreamView {
    pub stream_id: String,
    pub source: Option<SourceType>,
    pub tracks: Vec<RemoteTrack>,
}

/// What to render for a remote peer: a main surface and, when a screen or
/// file stream is showing, the camera as an overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParticipantView {
    pub peer_id: ConnectionId,
    pub main: Option<RemoteStreamView>,
    pub overlay: Option<RemoteStreamView>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    ParticipantUpdated(RemoteParticipantView),
    PeerDisconnected { peer_id: ConnectionId },
    MembersChanged(Vec<PeerSummary>),
}

/// Inbound streams per remote peer, in arrival order.
#[derive(Debug, Default)]
pub struct RemoteStreams {
    peers: HashMap<ConnectionId, Vec<RemoteStreamView>>,
}

impl RemoteStreams {
    /// Files the track under its first stream id and returns the updated view.
    pub fn add_track(&mut self, peer_id: &str, track: RemoteTrack) -> RemoteParticipantView {
        let stream_id = track
            .stream_ids
            .first()
            .cloned()
            .unwrap_or_else(|| track.track_id.clone());
        let streams = self.peers.entry(peer_id.to_string()).or_default();

        match streams.iter_mut().find(|s| s.stream_id == stream_id) {
            Some(stream) => {
                stream.tracks.retain(|t| t.track_id != track.track_id);
                stream.tracks.push(track);
            }
            None => streams.push(RemoteStreamView {
                source: SourceType::from_stream_id(&stream_id),
                stream_id,
                tracks: vec![track],
            }),
        }
        self.view(peer_id)
    }

    /// Drops a track; streams left without tracks disappear from the view.
    pub fn remove_track(&mut self, peer_id: &str, track_id: &str) -> Option<RemoteParticipantView> {
        let streams = self.peers.get_mut(peer_id)?;
        let before: usize = streams.iter().map(|s| s.tracks.len()).sum();
        for stream in streams.iter_mut() {
            stream.tracks.retain(|t| t.track_id != track_id);
        }
        streams.retain(|s| !s.tracks.is_empty());
        let after: usize = streams.iter().map(|s| s.tracks.len()).sum();
        (before != after).then(|| self.view(peer_id))
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn view(&self, peer_id: &str) -> RemoteParticipantView {
        let streams = self.peers.get(peer_id).map(Vec::as_slice).unwrap_or_default();
        let camera = streams
            .iter()
            .rev()
            .find(|s| s.source == Some(SourceType::Camera));
        let primary = streams
            .iter()
            .rev()
            .find(|s| s.source != Some(SourceType::Camera));

        let (main, overlay) = match primary {
            Some(primary) => (Some(primary.clone()), camera.cloned()),
            None => (camera.cloned(), None),
        };
        RemoteParticipantView {
            peer_id: peer_id.to_string(),
            main,
            overlay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::MediaKind;

    fn track(id: &str, kind: MediaKind, stream: &str) -> RemoteTrack {
        RemoteTrack {
            track_id: id.into(),
            kind,
            stream_ids: vec![stream.into()],
        }
    }

    #[test]
    fn camera_alone_is_the_main_view() {
        let mut streams = RemoteStreams::default();
        streams.add_track("host", track("v", MediaKind::Video, "camera_abcdefghi"));
        let view = streams.add_track("host", track("a", MediaKind::Audio, "camera_abcdefghi"));

        let main = view.main.unwrap();
        assert_eq!(main.source, Some(SourceType::Camera));
        assert_eq!(main.tracks.len(), 2);
        assert!(view.overlay.is_none());
    }

    #[test]
    fn screen_takes_main_and_camera_moves_to_overlay() {
        let mut streams = RemoteStreams::default();
        streams.add_track("host", track("cam", MediaKind::Video, "camera_abcdefghi"));
        let view = streams.add_track("host", track("scr", MediaKind::Video, "screen_abcdefghi"));

        assert_eq!(view.main.unwrap().source, Some(SourceType::Screen));
        assert_eq!(view.overlay.unwrap().source, Some(SourceType::Camera));
    }

    #[test]
    fn unclassified_streams_render_as_main() {
        let mut streams = RemoteStreams::default();
        let view = streams.add_track("host", track("x", MediaKind::Video, "{4f1e-77}"));
        let main = view.main.unwrap();
        assert_eq!(main.source, None);
    }

    #[test]
    fn removing_last_track_drops_the_stream() {
        let mut streams = RemoteStreams::default();
        streams.add_track("host", track("cam", MediaKind::Video, "camera_abcdefghi"));
        streams.add_track("host", track("scr", MediaKind::Video, "screen_abcdefghi"));

        let view = streams.remove_track("host", "scr").unwrap();
        assert_eq!(view.main.unwrap().source, Some(SourceType::Camera));
        assert!(view.overlay.is_none());
        assert!(streams.remove_track("host", "scr").is_none());
    }
}
