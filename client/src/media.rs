//! Media Streams and Render Targets
//!
//! Backend-neutral handles for local and remote media. A [`MediaTrack`] is a
//! cheap clone of a shared track: enabling, disabling and stopping are visible
//! through every clone. Capture backends plug in through [`TrackControl`];
//! UI surfaces plug in through [`RenderTarget`] and [`AudioSink`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rtc_common::MediaKind;
use uuid::Uuid;

/// Backend hook behind a track (camera, microphone, decoder).
pub trait TrackControl: Send + Sync {
    /// Pause or resume capture without releasing the device.
    fn set_enabled(&self, _enabled: bool) {}

    /// Release the underlying device. Called at most once per track.
    fn stop(&self);
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    control: Option<Arc<dyn TrackControl>>,
}

/// A single audio or video track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track with a generated id and no backend.
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::build(Uuid::now_v7().to_string(), kind, label.into(), None)
    }

    /// Create a track with an explicit id and no backend.
    pub fn with_id(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        Self::build(id.into(), kind, label.into(), None)
    }

    /// Create a track driven by a capture or decode backend.
    pub fn controlled(
        id: impl Into<String>,
        kind: MediaKind,
        label: impl Into<String>,
        control: Arc<dyn TrackControl>,
    ) -> Self {
        Self::build(id.into(), kind, label.into(), Some(control))
    }

    fn build(
        id: String,
        kind: MediaKind,
        label: String,
        control: Option<Arc<dyn TrackControl>>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                control,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable capture. A disabled track keeps its device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if let Some(control) = &self.inner.control {
            control.set_enabled(enabled);
        }
    }

    /// Whether the track still holds its device.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop the track and release its device. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            if let Some(control) = &self.inner.control {
                control.stop();
            }
        }
    }

    /// Whether both handles refer to the same track.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A group of tracks rendered together.
#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(Uuid::now_v7().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(MediaKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(MediaKind::Audio)
    }

    /// First track of the given kind.
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks_of(kind).next()
    }

    fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    /// Stop every track in the stream.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Whether any track still holds its device.
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Whether both handles describe the same stream.
    pub fn same_as(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// A decoded RGB8 video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB, `width * height * 3` bytes.
    pub data: Vec<u8>,
}

/// A surface that renders a video stream (the local preview or a remote tile).
pub trait RenderTarget: Send + Sync {
    /// Replace the rendered stream; `None` clears the surface.
    fn set_source(&self, stream: Option<MediaStream>);

    fn source(&self) -> Option<MediaStream>;

    /// Start playback of the current source.
    fn play(&self) -> Result<(), String> {
        Ok(())
    }

    /// Frame currently on screen, if any.
    fn current_frame(&self) -> Option<VideoFrame>;
}

/// An audio output bound to a stream.
pub trait AudioSink: Send + Sync {
    fn set_source(&self, stream: Option<MediaStream>);

    fn source(&self) -> Option<MediaStream>;

    fn set_muted(&self, muted: bool);

    fn is_muted(&self) -> bool;
}
