use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Which local source produced a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Camera,
    Screen,
    File,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [SourceType::Camera, SourceType::Screen, SourceType::File];

    pub fn prefix(self) -> &'static str {
        match self {
            SourceType::Camera => "camera",
            SourceType::Screen => "screen",
            SourceType::File => "file",
        }
    }

    /// Reads the type back from a synthetic stream id (`camera_xxxxxxxxx`).
    pub fn from_stream_id(stream_id: &str) -> Option<SourceType> {
        let (prefix, rest) = stream_id.split_once('_')?;
        if rest.is_empty() {
            return None;
        }
        SourceType::ALL.into_iter().find(|s| s.prefix() == prefix)
    }
}

/// The capture a track physically came from. Fixed at capture time so
/// microphone tracks are never guessed from device labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackOrigin {
    CameraDevice,
    Microphone,
    Display,
    SystemAudio,
    Playback,
}

/// Synthetic stream id carrying the source type, assigned once at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn generate(source: SourceType) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        StreamId(format!("{}_{}", source.prefix(), &suffix[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source_type(&self) -> Option<SourceType> {
        SourceType::from_stream_id(&self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub track_id: String,
    pub kind: MediaKind,
    pub source_type: SourceType,
    pub origin: TrackOrigin,
    pub owner_stream_id: StreamId,
}

impl TrackDescriptor {
    pub fn slot(&self) -> SlotKey {
        SlotKey {
            kind: self.kind,
            source: self.source_type,
            origin: self.origin,
        }
    }
}

/// Identity of one sender on a peer link.
///
/// Camera and file sources contribute at most one track per kind, so for them
/// this is exactly the `(kind, source)` pair. A screen share may carry system
/// audio and a microphone side by side; `origin` keeps those apart, so such a
/// share is the one case with two `(Audio, Screen)` senders on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub kind: MediaKind,
    pub source: SourceType,
    pub origin: TrackOrigin,
}

/// Platform handle behind a captured track.
pub trait TrackControl: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
    /// Flips to `true` when the platform ends the track on its own, e.g. the
    /// user pressing the browser's "stop sharing" button.
    fn ended(&self) -> watch::Receiver<bool>;
}

/// A raw track straight out of a capture call, before it is classified.
pub struct RawTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    pub control: Arc<dyn TrackControl>,
}

impl fmt::Debug for RawTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish()
    }
}

struct LocalTrackInner {
    descriptor: TrackDescriptor,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    control: Arc<dyn TrackControl>,
}

/// A classified local track, shared by reference by every peer link that
/// sends it. Enabling, disabling and stopping are visible to all of them.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    pub fn new(raw: RawTrack, source: SourceType, origin: TrackOrigin, stream: &StreamId) -> Self {
        LocalTrack {
            inner: Arc::new(LocalTrackInner {
                descriptor: TrackDescriptor {
                    track_id: raw.id,
                    kind: raw.kind,
                    source_type: source,
                    origin,
                    owner_stream_id: stream.clone(),
                },
                label: raw.label,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                control: raw.control,
            }),
        }
    }

    pub fn descriptor(&self) -> &TrackDescriptor {
        &self.inner.descriptor
    }

    pub fn id(&self) -> &str {
        &self.inner.descriptor.track_id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.descriptor.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        self.inner.control.set_enabled(enabled);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stops the capture. Further calls do nothing.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.control.stop();
        }
    }

    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.control.ended()
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("descriptor", &self.inner.descriptor)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
