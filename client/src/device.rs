//! Camera and Microphone Management
//!
//! [`DeviceManager`] is the single owner of the local media stream. Platform
//! capture backends implement [`MediaDevices`]; the manager layers the
//! acquisition policy on top: release before acquire, exact facing mode first
//! with one loose retry, re-attach on camera flip.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::media::{MediaStream, RenderTarget, VideoFrame};

/// Which camera to use on devices with more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera.
    #[default]
    User,
    /// Rear camera.
    Environment,
}

impl FacingMode {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

/// Facing-mode requirement passed to the capture backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingConstraint {
    /// Only a camera with this facing mode is acceptable.
    Exact(FacingMode),
    /// Prefer this facing mode, accept any camera.
    Ideal(FacingMode),
}

impl FacingConstraint {
    #[must_use]
    pub const fn mode(&self) -> FacingMode {
        match self {
            Self::Exact(mode) | Self::Ideal(mode) => *mode,
        }
    }
}

/// Capture request for [`MediaDevices::get_user_media`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub facing: FacingConstraint,
    pub width: u32,
    pub height: u32,
    pub audio: bool,
}

/// Errors reported by a capture backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied for camera or microphone")]
    PermissionDenied,
    #[error("No device satisfies the constraints: {0}")]
    ConstraintUnsatisfiable(String),
    #[error("Device is in use by another application")]
    DeviceBusy,
    #[error("Capture backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by [`DeviceManager`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Camera or microphone access denied")]
    PermissionDenied,
    #[error("No {facing:?} camera available: {reason}")]
    DeviceUnavailable { facing: FacingMode, reason: String },
    #[error("No active video element or stream to capture from")]
    NoActiveStream,
    #[error("Render target has no frame to capture")]
    FrameUnavailable,
    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Platform capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Grant a stream with one video track and, if requested, one audio track.
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<MediaStream, MediaError>;
}

/// Capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub with_audio: bool,
    /// JPEG quality (1-100) used by [`DeviceManager::capture_frame`].
    pub snapshot_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            with_audio: true,
            snapshot_quality: 95,
        }
    }
}

#[derive(Default)]
struct DeviceState {
    stream: Option<MediaStream>,
    facing: FacingMode,
    target: Option<Arc<dyn RenderTarget>>,
}

/// Exclusive owner of the local camera/microphone stream.
pub struct DeviceManager {
    devices: Arc<dyn MediaDevices>,
    config: CaptureConfig,
    state: Mutex<DeviceState>,
}

impl DeviceManager {
    pub fn new(devices: Arc<dyn MediaDevices>, config: CaptureConfig) -> Self {
        Self {
            devices,
            config,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Acquire the camera with the given facing mode.
    ///
    /// Any previous stream is fully stopped first. The exact facing mode is
    /// requested, then, on failure, a loose constraint once.
    #[tracing::instrument(skip(self))]
    pub async fn start_camera(&self, facing: FacingMode) -> Result<MediaStream, DeviceError> {
        // Held across acquisition so concurrent starts cannot both hold a grant.
        let mut state = self.state.lock().await;
        Self::release(&mut state);
        state.facing = facing;

        let mut constraints = MediaConstraints {
            facing: FacingConstraint::Exact(facing),
            width: self.config.width,
            height: self.config.height,
            audio: self.config.with_audio,
        };

        let stream = match self.devices.get_user_media(&constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    ?facing,
                    error = %e,
                    "Exact facing mode unavailable, retrying with loose constraints"
                );
                constraints.facing = FacingConstraint::Ideal(facing);
                match self.devices.get_user_media(&constraints).await {
                    Ok(stream) => {
                        warn!(?facing, "Used fallback camera constraints");
                        stream
                    }
                    Err(MediaError::PermissionDenied) => {
                        error!(?facing, "Camera access denied");
                        return Err(DeviceError::PermissionDenied);
                    }
                    Err(e) => {
                        error!(?facing, error = %e, "No camera matching constraints");
                        return Err(DeviceError::DeviceUnavailable {
                            facing,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        };

        if let Some(track) = stream.video_tracks().next() {
            info!(label = track.label(), ?facing, "Camera started");
        }
        state.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Stop the camera and release every track. Safe to call repeatedly.
    pub async fn stop_camera(&self) {
        let mut state = self.state.lock().await;
        if state.stream.is_none() {
            debug!("Camera already released");
            return;
        }
        Self::release(&mut state);
        info!("Camera stopped and resources released");
    }

    /// Flip between front and rear camera, re-attaching the render target.
    pub async fn toggle_camera(&self) -> Result<MediaStream, DeviceError> {
        let next = self.state.lock().await.facing.opposite();
        info!(facing = ?next, "Toggling camera");

        let stream = self.start_camera(next).await?;

        let state = self.state.lock().await;
        if let Some(target) = &state.target {
            Self::render(target.as_ref(), &stream);
        }
        Ok(stream)
    }

    /// Bind a render target, showing `stream` or the current local stream.
    pub async fn attach_stream(&self, target: Arc<dyn RenderTarget>, stream: Option<MediaStream>) {
        let mut state = self.state.lock().await;
        match stream.or_else(|| state.stream.clone()) {
            Some(stream) => Self::render(target.as_ref(), &stream),
            None => warn!("No active stream to attach, start the camera first"),
        }
        state.target = Some(target);
    }

    /// Snapshot the attached render target as a JPEG.
    pub async fn capture_frame(&self) -> Result<Vec<u8>, DeviceError> {
        let frame = {
            let state = self.state.lock().await;
            let (Some(target), Some(stream)) = (&state.target, &state.stream) else {
                return Err(DeviceError::NoActiveStream);
            };
            if !stream.is_active() {
                return Err(DeviceError::NoActiveStream);
            }
            target.current_frame().ok_or(DeviceError::FrameUnavailable)?
        };

        encode_jpeg(&frame, self.config.snapshot_quality)
    }

    /// The current local stream, if the camera is running.
    pub async fn current_stream(&self) -> Option<MediaStream> {
        self.state.lock().await.stream.clone()
    }

    pub async fn facing_mode(&self) -> FacingMode {
        self.state.lock().await.facing
    }

    fn release(state: &mut DeviceState) {
        if let Some(stream) = state.stream.take() {
            stream.stop();
            if let Some(target) = &state.target {
                target.set_source(None);
            }
        }
    }

    fn render(target: &dyn RenderTarget, stream: &MediaStream) {
        target.set_source(Some(stream.clone()));
        if let Err(e) = target.play() {
            error!(error = %e, "Video play failed");
        }
    }
}

/// Encode an RGB8 frame as JPEG at the given quality.
pub(crate) fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Vec<u8>, DeviceError> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.width == 0 || frame.height == 0 || frame.data.len() != expected {
        return Err(DeviceError::Encode(format!(
            "frame buffer is {} bytes, expected {expected} for {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        )));
    }

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| DeviceError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}
