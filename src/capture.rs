//! Platform capture seams and the ordered capture-strategy chain used for
//! file playback.

use async_trait::async_trait;

use crate::{
    error::MediaError,
    playback::{MediaElement, ReadyState},
    track::{MediaKind, RawTrack},
};

/// Frame rate of the software draw-loop fallback.
pub const CANVAS_CAPTURE_FPS: u32 = 15;
pub const CANVAS_MAX_WIDTH: u32 = 960;
const CANVAS_DEFAULT_SIZE: (u32, u32) = (640, 360);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub device_id: Option<String>,
}

impl VideoConstraints {
    pub fn camera(device_id: Option<String>) -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            device_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub channel_count: Option<u8>,
}

impl AudioConstraints {
    /// Voice settings used for the camera and standalone microphone.
    pub fn voice() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: Some(1),
        }
    }

    /// Commentary microphone next to a screen share.
    pub fn commentary() -> Self {
        Self {
            channel_count: None,
            ..Self::voice()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMediaRequest {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMediaRequest {
    pub show_cursor: bool,
    pub system_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

/// Camera, microphone and display capture of the hosting platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, request: &UserMediaRequest) -> Result<Vec<RawTrack>, MediaError>;
    async fn get_display_media(&self, request: &DisplayMediaRequest) -> Result<Vec<RawTrack>, MediaError>;
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;
}

/// Offscreen surface the draw-loop fallback paints into.
pub trait CanvasCapture: Send {
    /// Copies the current element frame. Errors while the element is still
    /// loading are swallowed by the implementation.
    fn draw_frame(&mut self);
    fn tracks(&mut self, fps: u32) -> Vec<RawTrack>;
}

/// The video element the host loaded a file into.
#[async_trait]
pub trait PlaybackSurface: MediaElement {
    async fn start_playback(&self) -> Result<(), MediaError>;
    /// Resolves on the element's next `playing` event.
    async fn playing(&self);
    fn video_size(&self) -> (u32, u32);
    fn capture_stream(&self) -> Option<Vec<RawTrack>>;
    fn vendor_capture_stream(&self) -> Option<Vec<RawTrack>>;
    fn open_canvas(&self, width: u32, height: u32) -> Option<Box<dyn CanvasCapture>>;
}

/// Playing as far as capture is concerned.
pub fn is_actively_playing(surface: &dyn PlaybackSurface) -> bool {
    !surface.is_paused() && surface.ready_state() >= ReadyState::HaveFutureData
}

/// What a capture strategy produced.
pub enum CaptureHandle {
    Direct(Vec<RawTrack>),
    DrawLoop {
        tracks: Vec<RawTrack>,
        canvas: Box<dyn CanvasCapture>,
        fps: u32,
    },
}

impl CaptureHandle {
    pub fn tracks(&self) -> &[RawTrack] {
        match self {
            CaptureHandle::Direct(tracks) | CaptureHandle::DrawLoop { tracks, .. } => tracks,
        }
    }
}

/// One entry of the capture chain: environment in, handle out (or `None`).
pub struct CaptureStrategy {
    pub name: &'static str,
    pub capture: fn(&dyn PlaybackSurface) -> Option<CaptureHandle>,
}

fn has_video(tracks: &[RawTrack]) -> bool {
    tracks.iter().any(|t| t.kind == MediaKind::Video)
}

fn element_capture(surface: &dyn PlaybackSurface) -> Option<CaptureHandle> {
    surface
        .capture_stream()
        .filter(|tracks| has_video(tracks))
        .map(CaptureHandle::Direct)
}

fn vendor_element_capture(surface: &dyn PlaybackSurface) -> Option<CaptureHandle> {
    surface
        .vendor_capture_stream()
        .filter(|tracks| has_video(tracks))
        .map(CaptureHandle::Direct)
}

fn canvas_draw_loop(surface: &dyn PlaybackSurface) -> Option<CaptureHandle> {
    let (width, height) = canvas_size(surface.video_size());
    let mut canvas = surface.open_canvas(width, height)?;
    canvas.draw_frame();
    let tracks = canvas.tracks(CANVAS_CAPTURE_FPS);
    if !has_video(&tracks) {
        return None;
    }
    Some(CaptureHandle::DrawLoop {
        tracks,
        canvas,
        fps: CANVAS_CAPTURE_FPS,
    })
}

/// Strategies for capturing a playing element, in the order they are tried.
pub const FILE_CAPTURE_CHAIN: [CaptureStrategy; 3] = [
    CaptureStrategy {
        name: "element-capture",
        capture: element_capture,
    },
    CaptureStrategy {
        name: "vendor-element-capture",
        capture: vendor_element_capture,
    },
    CaptureStrategy {
        name: "canvas-draw-loop",
        capture: canvas_draw_loop,
    },
];

/// Runs `chain` until a strategy yields tracks.
pub fn run_chain<'a>(
    chain: &'a [CaptureStrategy],
    surface: &dyn PlaybackSurface,
) -> Option<(&'a str, CaptureHandle)> {
    chain.iter().find_map(|strategy| {
        let handle = (strategy.capture)(surface)?;
        Some((strategy.name, handle))
    })
}

/// Downscaled canvas size: at most 960 wide, aspect preserved.
pub fn canvas_size((width, height): (u32, u32)) -> (u32, u32) {
    let (w, h) = if width == 0 || height == 0 {
        CANVAS_DEFAULT_SIZE
    } else {
        (width, height)
    };
    let target_w = w.min(CANVAS_MAX_WIDTH);
    let scaled_h = (f64::from(target_w) * f64::from(h) / f64::from(w)).round() as u32;
    (target_w, h.min(scaled_h.max(1)))
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use super::*;
    use crate::{
        playback::fakes::FakeElement,
        track::fakes::{raw, FakeControl},
    };

    /// Scripted device layer. Each capture call pops the next scripted result.
    #[derive(Default)]
    pub struct FakeDevices {
        pub user_media: Mutex<VecDeque<Result<Vec<(&'static str, MediaKind)>, MediaError>>>,
        pub display_media: Mutex<VecDeque<Result<Vec<(&'static str, MediaKind)>, MediaError>>>,
        pub devices: Mutex<Vec<DeviceInfo>>,
        pub requests: Mutex<Vec<UserMediaRequest>>,
        pub controls: Mutex<Vec<(String, Arc<FakeControl>)>>,
    }

    impl FakeDevices {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push_user(&self, result: Result<Vec<(&'static str, MediaKind)>, MediaError>) {
            self.user_media.lock().unwrap().push_back(result);
        }

        pub fn push_display(&self, result: Result<Vec<(&'static str, MediaKind)>, MediaError>) {
            self.display_media.lock().unwrap().push_back(result);
        }

        pub fn set_cameras(&self, ids: &[&str]) {
            *self.devices.lock().unwrap() = ids
                .iter()
                .map(|id| DeviceInfo {
                    device_id: id.to_string(),
                    kind: DeviceKind::VideoInput,
                    label: format!("{id} camera"),
                })
                .collect();
        }

        pub fn control(&self, id: &str) -> Arc<FakeControl> {
            self.controls
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(tid, _)| tid == id)
                .map(|(_, c)| c.clone())
                .unwrap()
        }

        fn build(&self, tracks: Vec<(&'static str, MediaKind)>) -> Vec<RawTrack> {
            tracks.into_iter()
                .map(|(id, kind)| {
                    let (track, control) = raw(id, kind);
                    self.controls.lock().unwrap().push((id.to_string(), control));
                    track
                })
                .collect()
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn get_user_media(&self, request: &UserMediaRequest) -> Result<Vec<RawTrack>, MediaError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self
                .user_media
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(MediaError::PermissionDenied("unscripted".into())));
            next.map(|tracks| self.build(tracks))
        }

        async fn get_display_media(&self, _request: &DisplayMediaRequest) -> Result<Vec<RawTrack>, MediaError> {
            let next = self
                .display_media
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(MediaError::ScreenShareDenied));
            next.map(|tracks| self.build(tracks))
        }

        async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError> {
            Ok(self.devices.lock().unwrap().clone())
        }
    }

    pub struct FakeCanvas {
        pub draws: Arc<AtomicUsize>,
    }

    impl CanvasCapture for FakeCanvas {
        fn draw_frame(&mut self) {
            self.draws.fetch_add(1, Ordering::SeqCst);
        }
        fn tracks(&mut self, _fps: u32) -> Vec<RawTrack> {
            vec![raw("canvas-video", MediaKind::Video).0]
        }
    }

    pub struct FakeSurface {
        pub element: Arc<FakeElement>,
        pub direct: bool,
        pub vendor: bool,
        pub canvas: bool,
        pub size: (u32, u32),
        pub draws: Arc<AtomicUsize>,
    }

    impl FakeSurface {
        pub fn new(element: Arc<FakeElement>) -> Self {
            Self {
                element,
                direct: true,
                vendor: false,
                canvas: true,
                size: (1920, 1080),
                draws: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl MediaElement for FakeSurface {
        fn ready_state(&self) -> ReadyState {
            self.element.ready_state()
        }
        fn is_paused(&self) -> bool {
            self.element.is_paused()
        }
        fn play(&self) {
            self.element.play()
        }
        fn pause(&self) {
            self.element.pause()
        }
        fn set_current_time(&self, time: f64) {
            self.element.set_current_time(time)
        }
    }

    #[async_trait]
    impl PlaybackSurface for FakeSurface {
        async fn start_playback(&self) -> Result<(), MediaError> {
            self.element.play();
            Ok(())
        }
        async fn playing(&self) {
            std::future::pending::<()>().await
        }
        fn video_size(&self) -> (u32, u32) {
            self.size
        }
        fn capture_stream(&self) -> Option<Vec<RawTrack>> {
            self.direct.then(|| {
                vec![
                    raw("file-video", MediaKind::Video).0,
                    raw("file-audio", MediaKind::Audio).0,
                ]
            })
        }
        fn vendor_capture_stream(&self) -> Option<Vec<RawTrack>> {
            self.vendor.then(|| vec![raw("moz-video", MediaKind::Video).0])
        }
        fn open_canvas(&self, _width: u32, _height: u32) -> Option<Box<dyn CanvasCapture>> {
            self.canvas.then(|| {
                Box::new(FakeCanvas {
                    draws: self.draws.clone(),
                }) as Box<dyn CanvasCapture>
            })
        }
    }
}
