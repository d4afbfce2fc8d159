use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    capture::{
        is_actively_playing, run_chain, AudioConstraints, CanvasCapture, CaptureHandle, DeviceInfo, DeviceKind,
        DisplayMediaRequest, MediaDevices, PlaybackSurface, UserMediaRequest, VideoConstraints,
        FILE_CAPTURE_CHAIN,
    },
    error::MediaError,
    track::{LocalTrack, MediaKind, RawTrack, SlotKey, SourceType, StreamId, TrackDescriptor, TrackOrigin},
};

/// Upper bound on waiting for a file element to report `playing`.
pub const PLAYBACK_START_TIMEOUT: Duration = Duration::from_secs(2);

/// A local track bound to the sender slot it should occupy on every link.
///
/// `stream_id` is the stream the slot was opened under; it can differ from
/// the track's own stream when a file video rides on the camera's slot.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub slot: SlotKey,
    pub track: LocalTrack,
    pub stream_id: StreamId,
}

/// Difference between two attachment sets, applied to every peer link.
#[derive(Debug, Clone, Default)]
pub struct SourceChange {
    pub attach: Vec<Attachment>,
    pub detach: Vec<SlotKey>,
}

impl SourceChange {
    pub fn between(before: &[Attachment], after: &[Attachment]) -> Self {
        let attach = after
            .iter()
            .filter(|a| {
                !before
                    .iter()
                    .any(|b| b.slot == a.slot && b.track.same_track(&a.track))
            })
            .cloned()
            .collect();
        let detach = before
            .iter()
            .filter(|b| !after.iter().any(|a| a.slot == b.slot))
            .map(|b| b.slot)
            .collect();
        SourceChange { attach, detach }
    }

    pub fn is_empty(&self) -> bool {
        self.attach.is_empty() && self.detach.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The platform ended a source's primary track (e.g. "stop sharing").
    SourceEnded {
        source: SourceType,
        stream_id: StreamId,
    },
}

struct ActiveSource {
    stream_id: StreamId,
    tracks: Vec<LocalTrack>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSource {
    fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
        for track in &self.tracks {
            track.stop();
        }
    }

    fn first(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    fn microphone(&self) -> Option<&LocalTrack> {
        self.tracks
            .iter()
            .find(|t| t.descriptor().origin == TrackOrigin::Microphone)
    }

    fn descriptors(&self) -> Vec<TrackDescriptor> {
        self.tracks.iter().map(|t| t.descriptor().clone()).collect()
    }
}

/// Owns the camera, screen-share and file-playback sources plus a standalone
/// microphone, and maps them onto sender slots.
pub struct MediaMultiplexer {
    devices: Arc<dyn MediaDevices>,
    events: mpsc::UnboundedSender<MediaEvent>,
    camera: Option<ActiveSource>,
    screen: Option<ActiveSource>,
    file: Option<ActiveSource>,
    microphone: Option<ActiveSource>,
    file_surface: Option<Arc<dyn PlaybackSurface>>,
    cameras: Vec<DeviceInfo>,
    camera_device: Option<String>,
}

impl MediaMultiplexer {
    pub fn new(devices: Arc<dyn MediaDevices>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            devices,
            events,
            camera: None,
            screen: None,
            file: None,
            microphone: None,
            file_surface: None,
            cameras: Vec::new(),
            camera_device: None,
        }
    }

    pub fn is_camera_active(&self) -> bool {
        self.camera.is_some()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn is_file_playing(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.camera.is_some() || self.screen.is_some() || self.file.is_some()
    }

    pub fn mic_enabled(&self) -> bool {
        self.find_microphone().is_some_and(LocalTrack::is_enabled)
    }

    pub fn available_cameras(&self) -> &[DeviceInfo] {
        &self.cameras
    }

    pub fn playback_surface(&self) -> Option<&Arc<dyn PlaybackSurface>> {
        self.file_surface.as_ref()
    }

    pub fn current_stream(&self, source: SourceType) -> Option<&StreamId> {
        self.source(source).map(|s| &s.stream_id)
    }

    fn source(&self, source: SourceType) -> Option<&ActiveSource> {
        match source {
            SourceType::Camera => self.camera.as_ref(),
            SourceType::Screen => self.screen.as_ref(),
            SourceType::File => self.file.as_ref(),
        }
    }

    fn find_microphone(&self) -> Option<&LocalTrack> {
        [&self.camera, &self.screen, &self.microphone]
            .into_iter()
            .flatten()
            .find_map(ActiveSource::microphone)
    }

    /// Every track that should currently be sent, keyed by sender slot.
    ///
    /// While the camera runs next to file playback, the file's video takes
    /// over the camera's video slot and the camera audio stays on its own.
    pub fn attachments(&self) -> Vec<Attachment> {
        let mut out: Vec<Attachment> = Vec::new();
        let file_video = self.file.as_ref().and_then(|f| f.first(MediaKind::Video));

        if let Some(camera) = &self.camera {
            for track in &camera.tracks {
                let track = match (track.kind(), file_video) {
                    (MediaKind::Video, Some(file_video)) => file_video,
                    _ => track,
                };
                push_unique(&mut out, camera.stream_id.clone(), track, camera_slot(track, camera));
            }
        }
        if let Some(screen) = &self.screen {
            for track in &screen.tracks {
                push_unique(&mut out, screen.stream_id.clone(), track, track.descriptor().slot());
            }
        }
        if let Some(file) = &self.file {
            let camera_has_video = self
                .camera
                .as_ref()
                .is_some_and(|c| c.first(MediaKind::Video).is_some());
            if !camera_has_video {
                for track in &file.tracks {
                    if self.camera.is_some() && track.kind() == MediaKind::Audio {
                        continue;
                    }
                    push_unique(&mut out, file.stream_id.clone(), track, track.descriptor().slot());
                }
            }
        }
        if let Some(mic) = &self.microphone {
            for track in &mic.tracks {
                push_unique(&mut out, mic.stream_id.clone(), track, track.descriptor().slot());
            }
        }
        out
    }

    /// Enumerates video inputs for [`flip_camera`](Self::flip_camera).
    pub async fn refresh_cameras(&mut self) -> Result<&[DeviceInfo], MediaError> {
        let devices = self.devices.enumerate_devices().await?;
        self.cameras = devices
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect();
        debug!(count = self.cameras.len(), "enumerated cameras");
        Ok(&self.cameras)
    }

    /// Starts (or restarts) the camera. When audio cannot be acquired the
    /// camera comes up video-only.
    pub async fn start_camera(
        &mut self,
        device_id: Option<String>,
        include_audio: bool,
    ) -> Result<Vec<TrackDescriptor>, MediaError> {
        let video = VideoConstraints::camera(device_id.clone());
        let request = UserMediaRequest {
            video: Some(video.clone()),
            audio: include_audio.then(AudioConstraints::voice),
        };

        let raw = match self.devices.get_user_media(&request).await {
            Ok(raw) => raw,
            Err(err) if include_audio => {
                warn!(error = %err, "camera with audio failed, retrying video only");
                let video_only = UserMediaRequest {
                    video: Some(video),
                    audio: None,
                };
                self.devices.get_user_media(&video_only).await?
            }
            Err(err) => return Err(err),
        };

        if !raw.iter().any(|t| t.kind == MediaKind::Video) {
            for t in &raw {
                t.control.stop();
            }
            return Err(MediaError::CaptureFailed("camera returned no video track".into()));
        }

        if let Some(old) = self.camera.take() {
            old.stop();
        }

        let stream_id = StreamId::generate(SourceType::Camera);
        let tracks = classify(raw, SourceType::Camera, &stream_id, |kind| match kind {
            MediaKind::Video => TrackOrigin::CameraDevice,
            MediaKind::Audio => TrackOrigin::Microphone,
        });
        // a camera microphone supersedes a standalone one
        if tracks.iter().any(|t| t.kind() == MediaKind::Audio) {
            if let Some(mic) = self.microphone.take() {
                mic.stop();
            }
        }
        let tasks = self.watch_ended(SourceType::Camera, &stream_id, &tracks);
        let source = ActiveSource {
            stream_id,
            tracks,
            tasks,
        };
        info!(
            stream = %source.stream_id,
            audio = source.first(MediaKind::Audio).is_some(),
            "camera started"
        );
        let descriptors = source.descriptors();
        self.camera = Some(source);
        self.camera_device = device_id;
        Ok(descriptors)
    }

    /// Moves the camera to the next enumerated device, round robin.
    pub async fn flip_camera(&mut self) -> Result<Vec<TrackDescriptor>, MediaError> {
        if self.cameras.len() < 2 {
            if let Err(err) = self.refresh_cameras().await {
                warn!(error = %err, "could not enumerate cameras");
            }
        }
        if self.cameras.len() < 2 {
            return Err(MediaError::NoAlternateCamera {
                available: self.cameras.len(),
            });
        }

        if let Some(old) = self.camera.take() {
            old.stop();
        }
        let next = self
            .camera_device
            .as_deref()
            .and_then(|id| self.cameras.iter().position(|c| c.device_id == id))
            .map_or(1, |current| (current + 1) % self.cameras.len());
        let device = self.cameras[next].clone();
        info!(label = %device.label, index = next, "switching camera");
        self.start_camera(Some(device.device_id), true).await
    }

    /// Starts display capture, optionally with a commentary microphone. The
    /// screen video, system audio and microphone stay separate tracks.
    pub async fn start_screen_share(&mut self, include_mic: bool) -> Result<Vec<TrackDescriptor>, MediaError> {
        let request = DisplayMediaRequest {
            show_cursor: true,
            system_audio: true,
        };
        let display = self.devices.get_display_media(&request).await.map_err(|err| {
            warn!(error = %err, "screen share denied");
            MediaError::ScreenShareDenied
        })?;

        let stream_id = StreamId::generate(SourceType::Screen);
        let mut tracks = Vec::new();
        let mut system_audio = false;
        for raw in display {
            match raw.kind {
                MediaKind::Video => tracks.push(LocalTrack::new(
                    raw,
                    SourceType::Screen,
                    TrackOrigin::Display,
                    &stream_id,
                )),
                MediaKind::Audio if !system_audio => {
                    system_audio = true;
                    tracks.push(LocalTrack::new(
                        raw,
                        SourceType::Screen,
                        TrackOrigin::SystemAudio,
                        &stream_id,
                    ));
                }
                MediaKind::Audio => raw.control.stop(),
            }
        }
        if !tracks.iter().any(|t| t.kind() == MediaKind::Video) {
            for t in &tracks {
                t.stop();
            }
            return Err(MediaError::CaptureFailed("display capture returned no video".into()));
        }

        let mic = if include_mic {
            let mic_request = UserMediaRequest {
                video: None,
                audio: Some(AudioConstraints::commentary()),
            };
            match self.devices.get_user_media(&mic_request).await {
                Ok(raw) => {
                    let mut mic = None;
                    for t in raw {
                        if mic.is_none() && t.kind == MediaKind::Audio {
                            mic = Some(t);
                        } else {
                            t.control.stop();
                        }
                    }
                    mic
                }
                Err(err) => {
                    warn!(error = %err, "microphone denied, sharing without commentary");
                    None
                }
            }
        } else {
            None
        };
        if let Some(raw) = mic {
            tracks.push(LocalTrack::new(
                raw,
                SourceType::Screen,
                TrackOrigin::Microphone,
                &stream_id,
            ));
        }

        if let Some(old) = self.screen.take() {
            old.stop();
        }
        let tasks = self.watch_ended(SourceType::Screen, &stream_id, &tracks);
        let source = ActiveSource {
            stream_id,
            tracks,
            tasks,
        };
        info!(
            stream = %source.stream_id,
            system_audio,
            mic = source.microphone().is_some(),
            "screen share started"
        );
        let descriptors = source.descriptors();
        self.screen = Some(source);
        Ok(descriptors)
    }

    /// Captures a playing file element, falling back to a software draw loop
    /// when the element cannot be captured directly.
    pub async fn capture_file_playback(
        &mut self,
        surface: Arc<dyn PlaybackSurface>,
    ) -> Result<Vec<TrackDescriptor>, MediaError> {
        if let Err(err) = surface.start_playback().await {
            warn!(error = %err, "play() may be blocked");
        }
        if !is_actively_playing(surface.as_ref())
            && tokio::time::timeout(PLAYBACK_START_TIMEOUT, surface.playing())
                .await
                .is_err()
        {
            debug!("element did not report playing in time, capturing anyway");
        }

        let (strategy, handle) = run_chain(&FILE_CAPTURE_CHAIN, surface.as_ref())
            .ok_or_else(|| MediaError::NotSupported("no capture strategy produced a video track".into()))?;
        debug!(strategy, tracks = handle.tracks().len(), "file capture strategy succeeded");

        let stream_id = StreamId::generate(SourceType::File);
        let (raw, draw_loop) = match handle {
            CaptureHandle::Direct(raw) => (raw, None),
            CaptureHandle::DrawLoop { tracks, canvas, fps } => {
                (tracks, Some(spawn_draw_loop(canvas, fps)))
            }
        };
        let tracks = classify(first_per_kind(raw), SourceType::File, &stream_id, |_| {
            TrackOrigin::Playback
        });

        if let Some(old) = self.file.take() {
            old.stop();
        }
        let mut tasks = self.watch_ended(SourceType::File, &stream_id, &tracks);
        tasks.extend(draw_loop);
        let source = ActiveSource {
            stream_id,
            tracks,
            tasks,
        };
        info!(stream = %source.stream_id, strategy, "file playback capture started");
        let descriptors = source.descriptors();
        self.file = Some(source);
        self.file_surface = Some(surface);
        Ok(descriptors)
    }

    /// Flips an existing microphone, or acquires a new one enabled.
    /// Returns whether the microphone is now enabled.
    pub async fn toggle_mic(&mut self) -> Result<bool, MediaError> {
        if let Some(track) = self.find_microphone() {
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            info!(track = %track.id(), enabled, "toggled microphone");
            return Ok(enabled);
        }

        debug!("no microphone track, requesting one");
        let request = UserMediaRequest {
            video: None,
            audio: Some(AudioConstraints::voice()),
        };
        let raw = self
            .devices
            .get_user_media(&request)
            .await?
            .into_iter()
            .find(|t| t.kind == MediaKind::Audio)
            .ok_or(MediaError::NoMicrophone)?;

        let stream_id = StreamId::generate(SourceType::Camera);
        let track = LocalTrack::new(raw, SourceType::Camera, TrackOrigin::Microphone, &stream_id);
        self.microphone = Some(ActiveSource {
            stream_id,
            tracks: vec![track],
            tasks: Vec::new(),
        });
        info!("microphone added and enabled");
        Ok(true)
    }

    pub fn stop_camera(&mut self) -> bool {
        self.stop_source(SourceType::Camera)
    }

    pub fn stop_screen_share(&mut self) -> bool {
        self.stop_source(SourceType::Screen)
    }

    pub fn stop_file_playback(&mut self) -> bool {
        self.stop_source(SourceType::File)
    }

    /// Stops one source. Returns `false` when it was not running.
    pub fn stop_source(&mut self, source: SourceType) -> bool {
        let slot = match source {
            SourceType::Camera => &mut self.camera,
            SourceType::Screen => &mut self.screen,
            SourceType::File => {
                self.file_surface = None;
                &mut self.file
            }
        };
        match slot.take() {
            Some(active) => {
                info!(stream = %active.stream_id, ?source, "source stopped");
                active.stop();
                true
            }
            None => false,
        }
    }

    /// Stops every source and the standalone microphone. Safe to repeat.
    pub fn stop_all(&mut self) {
        for source in SourceType::ALL {
            self.stop_source(source);
        }
        if let Some(mic) = self.microphone.take() {
            mic.stop();
        }
        debug!("all local sources stopped");
    }

    fn watch_ended(&self, source: SourceType, stream_id: &StreamId, tracks: &[LocalTrack]) -> Vec<JoinHandle<()>> {
        let Some(video) = tracks.iter().find(|t| t.kind() == MediaKind::Video) else {
            return Vec::new();
        };
        let mut ended = video.ended();
        let events = self.events.clone();
        let stream_id = stream_id.clone();
        vec![tokio::spawn(async move {
            if ended.wait_for(|e| *e).await.is_ok() {
                let _ = events.send(MediaEvent::SourceEnded { source, stream_id });
            }
        })]
    }
}

impl Drop for MediaMultiplexer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn camera_slot(track: &LocalTrack, camera: &ActiveSource) -> SlotKey {
    // the camera's own tracks define the slots even when a file video rides on them
    camera
        .first(track.kind())
        .map(|t| t.descriptor().slot())
        .unwrap_or_else(|| track.descriptor().slot())
}

fn push_unique(out: &mut Vec<Attachment>, stream_id: StreamId, track: &LocalTrack, slot: SlotKey) {
    if out.iter().any(|a| a.slot == slot) {
        return;
    }
    out.push(Attachment {
        slot,
        track: track.clone(),
        stream_id,
    });
}

fn classify(
    raw: Vec<RawTrack>,
    source: SourceType,
    stream_id: &StreamId,
    origin: impl Fn(MediaKind) -> TrackOrigin,
) -> Vec<LocalTrack> {
    raw.into_iter()
        .map(|t| {
            let o = origin(t.kind);
            LocalTrack::new(t, source, o, stream_id)
        })
        .collect()
}

fn first_per_kind(raw: Vec<RawTrack>) -> Vec<RawTrack> {
    let mut out: Vec<RawTrack> = Vec::new();
    for track in raw {
        if out.iter().any(|t| t.kind == track.kind) {
            track.control.stop();
            continue;
        }
        out.push(track);
    }
    out
}

fn spawn_draw_loop(mut canvas: Box<dyn CanvasCapture>, fps: u32) -> JoinHandle<()> {
    let period = Duration::from_millis(1000 / u64::from(fps.max(1)));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            canvas.draw_frame();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        capture::fakes::{FakeDevices, FakeSurface},
        playback::{fakes::FakeElement, ReadyState},
    };

    fn mux(devices: &Arc<FakeDevices>) -> (MediaMultiplexer, mpsc::UnboundedReceiver<MediaEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MediaMultiplexer::new(devices.clone(), tx), rx)
    }

    fn cam_av() -> Vec<(&'static str, MediaKind)> {
        vec![("cam-v", MediaKind::Video), ("cam-a", MediaKind::Audio)]
    }

    #[tokio::test]
    async fn camera_tracks_are_tagged_camera() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(cam_av()));
        let (mut m, _rx) = mux(&devices);

        let tracks = m.start_camera(None, true).await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|d| d.source_type == SourceType::Camera));
        assert!(tracks[0].owner_stream_id.as_str().starts_with("camera_"));
        assert!(m.is_camera_active() && m.mic_enabled());
    }

    #[tokio::test]
    async fn camera_falls_back_to_video_only() {
        let devices = FakeDevices::new();
        devices.push_user(Err(MediaError::PermissionDenied("mic".into())));
        devices.push_user(Ok(vec![("cam-v", MediaKind::Video)]));
        let (mut m, _rx) = mux(&devices);

        let tracks = m.start_camera(None, true).await.unwrap();
        assert_eq!(tracks.len(), 1);
        let requests = devices.requests.lock().unwrap();
        assert!(requests[0].audio.is_some());
        assert!(requests[1].audio.is_none());
    }

    #[tokio::test]
    async fn camera_denied_outright_is_reported() {
        let devices = FakeDevices::new();
        devices.push_user(Err(MediaError::PermissionDenied("all".into())));
        devices.push_user(Err(MediaError::PermissionDenied("video".into())));
        let (mut m, _rx) = mux(&devices);
        assert!(matches!(
            m.start_camera(None, true).await,
            Err(MediaError::PermissionDenied(_))
        ));
        assert!(!m.is_camera_active());
    }

    #[tokio::test]
    async fn camera_without_video_releases_its_audio() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(vec![("cam-a", MediaKind::Audio)]));
        let (mut m, _rx) = mux(&devices);

        assert!(matches!(
            m.start_camera(None, true).await,
            Err(MediaError::CaptureFailed(_))
        ));
        assert_eq!(devices.control("cam-a").stop_count(), 1);
        assert!(!m.is_camera_active());
        assert!(m.attachments().is_empty());
    }

    #[tokio::test]
    async fn stop_all_twice_is_harmless() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(cam_av()));
        let (mut m, _rx) = mux(&devices);
        m.start_camera(None, true).await.unwrap();

        m.stop_all();
        m.stop_all();
        assert!(!m.is_camera_active());
        assert!(!m.is_screen_sharing());
        assert!(!m.is_streaming());
        assert!(!m.mic_enabled());
        assert_eq!(devices.control("cam-v").stop_count(), 1);
    }

    #[tokio::test]
    async fn flip_needs_two_cameras() {
        let devices = FakeDevices::new();
        devices.set_cameras(&["front"]);
        devices.push_user(Ok(cam_av()));
        let (mut m, _rx) = mux(&devices);
        m.start_camera(None, true).await.unwrap();

        let err = m.flip_camera().await.unwrap_err();
        assert!(matches!(err, MediaError::NoAlternateCamera { available: 1 }));
        assert!(m.is_camera_active());
        assert_eq!(devices.control("cam-v").stop_count(), 0);
    }

    #[tokio::test]
    async fn flip_cycles_devices() {
        let devices = FakeDevices::new();
        devices.set_cameras(&["front", "back"]);
        devices.push_user(Ok(cam_av()));
        devices.push_user(Ok(vec![("back-v", MediaKind::Video), ("back-a", MediaKind::Audio)]));
        devices.push_user(Ok(vec![("front-v", MediaKind::Video), ("front-a", MediaKind::Audio)]));
        let (mut m, _rx) = mux(&devices);
        m.start_camera(None, true).await.unwrap();

        let flipped = m.flip_camera().await.unwrap();
        assert_eq!(flipped[0].track_id, "back-v");
        assert_eq!(devices.control("cam-v").stop_count(), 1);
        m.flip_camera().await.unwrap();

        let requests = devices.requests.lock().unwrap();
        let ids: Vec<_> = requests
            .iter()
            .map(|r| r.video.as_ref().and_then(|v| v.device_id.clone()))
            .collect();
        assert_eq!(ids, vec![None, Some("back".to_string()), Some("front".to_string())]);
    }

    #[tokio::test]
    async fn flip_moves_past_the_device_actually_open() {
        let devices = FakeDevices::new();
        devices.set_cameras(&["front", "back", "wide"]);
        devices.push_user(Ok(vec![("back-v", MediaKind::Video)]));
        devices.push_user(Ok(vec![("wide-v", MediaKind::Video)]));
        let (mut m, _rx) = mux(&devices);
        m.start_camera(Some("back".into()), true).await.unwrap();

        let flipped = m.flip_camera().await.unwrap();
        assert_eq!(flipped[0].track_id, "wide-v");
        let last = devices.requests.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.video.and_then(|v| v.device_id), Some("wide".to_string()));
    }

    #[tokio::test]
    async fn screen_share_keeps_audio_tracks_separate() {
        let devices = FakeDevices::new();
        devices.push_display(Ok(vec![("scr-v", MediaKind::Video), ("sys-a", MediaKind::Audio)]));
        devices.push_user(Ok(vec![("mic-a", MediaKind::Audio)]));
        let (mut m, _rx) = mux(&devices);

        let tracks = m.start_screen_share(true).await.unwrap();
        let origins: Vec<_> = tracks.iter().map(|d| d.origin).collect();
        assert_eq!(
            origins,
            vec![TrackOrigin::Display, TrackOrigin::SystemAudio, TrackOrigin::Microphone]
        );
        assert!(tracks[0].owner_stream_id.as_str().starts_with("screen_"));
        assert_eq!(m.attachments().len(), 3);
    }

    #[tokio::test]
    async fn screen_share_without_system_audio_or_mic() {
        let devices = FakeDevices::new();
        devices.push_display(Ok(vec![("scr-v", MediaKind::Video)]));
        devices.push_user(Err(MediaError::PermissionDenied("mic".into())));
        let (mut m, _rx) = mux(&devices);
        let tracks = m.start_screen_share(true).await.unwrap();
        assert_eq!(tracks.len(), 1);
    }

    #[tokio::test]
    async fn screen_share_denial_is_reported() {
        let devices = FakeDevices::new();
        let (mut m, _rx) = mux(&devices);
        assert!(matches!(
            m.start_screen_share(false).await,
            Err(MediaError::ScreenShareDenied)
        ));
        assert!(!m.is_screen_sharing());
    }

    #[tokio::test]
    async fn audio_only_display_releases_everything() {
        let devices = FakeDevices::new();
        devices.push_display(Ok(vec![("sys-a", MediaKind::Audio)]));
        devices.push_user(Ok(vec![("mic-a", MediaKind::Audio)]));
        let (mut m, _rx) = mux(&devices);

        assert!(matches!(
            m.start_screen_share(true).await,
            Err(MediaError::CaptureFailed(_))
        ));
        assert_eq!(devices.control("sys-a").stop_count(), 1);
        // the commentary mic is never opened without a screen to go with it
        assert!(devices.requests.lock().unwrap().is_empty());
        assert!(!m.is_screen_sharing());
        assert!(m.attachments().is_empty());
    }

    #[tokio::test]
    async fn extra_mic_tracks_are_released() {
        let devices = FakeDevices::new();
        devices.push_display(Ok(vec![("scr-v", MediaKind::Video)]));
        devices.push_user(Ok(vec![("mic-a", MediaKind::Audio), ("mic-b", MediaKind::Audio)]));
        let (mut m, _rx) = mux(&devices);

        m.start_screen_share(true).await.unwrap();
        assert_eq!(devices.control("mic-a").stop_count(), 0);
        assert_eq!(devices.control("mic-b").stop_count(), 1);
    }

    #[tokio::test]
    async fn user_stopping_the_share_emits_source_ended() {
        let devices = FakeDevices::new();
        devices.push_display(Ok(vec![("scr-v", MediaKind::Video)]));
        let (mut m, mut rx) = mux(&devices);
        m.start_screen_share(false).await.unwrap();
        let stream = m.current_stream(SourceType::Screen).cloned().unwrap();

        devices.control("scr-v").end();
        assert_eq!(
            rx.recv().await,
            Some(MediaEvent::SourceEnded {
                source: SourceType::Screen,
                stream_id: stream
            })
        );
    }

    #[tokio::test]
    async fn file_video_takes_camera_slot_and_keeps_camera_audio() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(cam_av()));
        let (mut m, _rx) = mux(&devices);
        m.start_camera(None, true).await.unwrap();
        let before = m.attachments();

        let surface = Arc::new(FakeSurface::new(FakeElement::new(ReadyState::HaveEnoughData)));
        m.capture_file_playback(surface).await.unwrap();
        let after = m.attachments();

        assert_eq!(after.len(), before.len());
        let video = after.iter().find(|a| a.slot.kind == MediaKind::Video).unwrap();
        assert_eq!(video.track.id(), "file-video");
        assert_eq!(video.slot, before[0].slot);
        let audio = after.iter().find(|a| a.slot.kind == MediaKind::Audio).unwrap();
        assert_eq!(audio.track.id(), "cam-a");

        let change = SourceChange::between(&before, &after);
        assert_eq!(change.attach.len(), 1);
        assert!(change.detach.is_empty());

        // stopping the file hands the slot back to the camera
        m.stop_file_playback();
        let restored = SourceChange::between(&after, &m.attachments());
        assert_eq!(restored.attach.len(), 1);
        assert_eq!(restored.attach[0].track.id(), "cam-v");
    }

    #[tokio::test(start_paused = true)]
    async fn draw_loop_runs_until_stopped() {
        let devices = FakeDevices::new();
        let (mut m, _rx) = mux(&devices);
        let mut surface = FakeSurface::new(FakeElement::new(ReadyState::HaveEnoughData));
        surface.direct = false;
        let draws = surface.draws.clone();

        let tracks = m.capture_file_playback(Arc::new(surface)).await.unwrap();
        assert_eq!(tracks[0].source_type, SourceType::File);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let drawn = draws.load(Ordering::SeqCst);
        assert!(drawn >= 5, "only {drawn} frames drawn");

        m.stop_all();
        tokio::task::yield_now().await;
        let settled = draws.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(draws.load(Ordering::SeqCst), settled);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_element_waits_bounded_time() {
        let devices = FakeDevices::new();
        let (mut m, _rx) = mux(&devices);
        let element = FakeElement::new(ReadyState::HaveMetadata);
        let surface = Arc::new(FakeSurface::new(element));

        let started = tokio::time::Instant::now();
        m.capture_file_playback(surface).await.unwrap();
        assert!(started.elapsed() >= PLAYBACK_START_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn file_capture_without_any_strategy_is_unsupported() {
        let devices = FakeDevices::new();
        let (mut m, _rx) = mux(&devices);
        let mut surface = FakeSurface::new(FakeElement::new(ReadyState::HaveEnoughData));
        surface.direct = false;
        surface.canvas = false;

        assert!(matches!(
            m.capture_file_playback(Arc::new(surface)).await,
            Err(MediaError::NotSupported(_))
        ));
        assert!(!m.is_file_playing());
    }

    #[tokio::test]
    async fn toggle_mic_flips_existing_track() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(cam_av()));
        let (mut m, _rx) = mux(&devices);
        m.start_camera(None, true).await.unwrap();

        assert!(!m.toggle_mic().await.unwrap());
        assert!(!devices.control("cam-a").enabled.load(Ordering::SeqCst));
        assert!(m.toggle_mic().await.unwrap());
        assert_eq!(devices.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn toggle_mic_acquires_when_missing() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(vec![("mic-a", MediaKind::Audio)]));
        let (mut m, _rx) = mux(&devices);

        assert!(m.toggle_mic().await.unwrap());
        assert!(m.mic_enabled());
        let attachments = m.attachments();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].slot.origin, TrackOrigin::Microphone);
    }

    #[tokio::test]
    async fn toggle_mic_without_device_errors() {
        let devices = FakeDevices::new();
        devices.push_user(Ok(vec![]));
        let (mut m, _rx) = mux(&devices);
        assert!(matches!(m.toggle_mic().await, Err(MediaError::NoMicrophone)));
    }
}
