//! Webcam Capture Backend
//!
//! [`MediaDevices`] implemented with `nokhwa`. `nokhwa::Camera` is `!Send`,
//! so every grant runs its own capture loop on a blocking thread; stopping
//! the video track shuts that loop down and releases the camera. Decoded RGB
//! frames are published on a watch channel for preview and snapshots.
//!
//! Only video is captured here. Requests for audio get a video-only stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use rtc_common::MediaKind;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::device::{FacingConstraint, FacingMode, MediaConstraints, MediaDevices, MediaError};
use crate::media::{MediaStream, MediaTrack, TrackControl, VideoFrame};

/// A camera available for capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebcamDevice {
    /// Device index (used for opening).
    pub index: u32,
    /// Human-readable device name.
    pub name: String,
}

/// Enumerate available cameras. Blocking.
pub fn enumerate_webcam_devices() -> Result<Vec<WebcamDevice>, MediaError> {
    let backend = nokhwa::native_api_backend()
        .ok_or_else(|| MediaError::Backend("no camera backend available".to_string()))?;

    let cameras = nokhwa::query(backend).map_err(|e| classify(&e.to_string()))?;

    Ok(cameras
        .into_iter()
        .map(|info| {
            let index = match info.index() {
                CameraIndex::Index(i) => *i,
                CameraIndex::String(_) => 0,
            };
            WebcamDevice {
                index,
                name: info.human_name(),
            }
        })
        .collect())
}

fn name_suggests(name: &str, mode: FacingMode) -> bool {
    let name = name.to_lowercase();
    let hints: &[&str] = match mode {
        FacingMode::User => &["front", "user", "facetime"],
        FacingMode::Environment => &["back", "rear", "environment"],
    };
    hints.iter().any(|hint| name.contains(hint))
}

/// Choose a camera for `facing`.
///
/// Desktop backends report no facing mode, so names are matched first and
/// position second: the first camera is the front one, the second the rear.
fn pick_camera(devices: &[WebcamDevice], facing: FacingConstraint) -> Option<&WebcamDevice> {
    let mode = facing.mode();
    let named = devices.iter().find(|d| name_suggests(&d.name, mode));
    let positional = match mode {
        FacingMode::User => devices.first(),
        FacingMode::Environment => devices.get(1),
    }
    .filter(|d| !name_suggests(&d.name, mode.opposite()));

    let matched = named.or(positional);
    match facing {
        FacingConstraint::Exact(_) => matched,
        FacingConstraint::Ideal(_) => matched.or_else(|| devices.first()),
    }
}

/// Map a backend error message onto the capture error taxonomy.
fn classify(message: &str) -> MediaError {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        MediaError::PermissionDenied
    } else if ["busy", "in use", "temporarily unavailable"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        MediaError::DeviceBusy
    } else {
        MediaError::Backend(message.to_string())
    }
}

/// Track hook for one running capture loop.
struct CaptureControl {
    shutdown: watch::Sender<bool>,
    enabled: Arc<AtomicBool>,
}

impl TrackControl for CaptureControl {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Parameters of one capture loop.
struct Capture {
    device_index: u32,
    width: u32,
    height: u32,
    fps: u32,
    enabled: Arc<AtomicBool>,
    frames: Arc<watch::Sender<Option<VideoFrame>>>,
}

impl Capture {
    /// Open the camera, report the outcome, then pump frames until shut down.
    fn run(
        self,
        opened: oneshot::Sender<Result<(), MediaError>>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let device_index = self.device_index;
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(
                Resolution::new(self.width, self.height),
                FrameFormat::MJPEG,
                self.fps,
            ),
        ));

        let mut camera = match Camera::new(CameraIndex::Index(device_index), requested) {
            Ok(c) => c,
            Err(e) => {
                error!(device = device_index, error = %e, "Failed to open webcam");
                let _ = opened.send(Err(classify(&e.to_string())));
                return;
            }
        };

        if let Err(e) = camera.open_stream() {
            error!(device = device_index, error = %e, "Failed to open webcam stream");
            let _ = opened.send(Err(classify(&e.to_string())));
            return;
        }

        let resolution = camera.camera_format().resolution();
        info!(
            device = device_index,
            requested_w = self.width,
            requested_h = self.height,
            actual_w = resolution.width_x,
            actual_h = resolution.height_y,
            fps = self.fps,
            "Webcam capture started"
        );

        if opened.send(Ok(())).is_err() {
            debug!(device = device_index, "Capture requester gone, closing webcam");
            let _ = camera.stop_stream();
            return;
        }

        let frame_interval = Duration::from_millis(1000 / u64::from(self.fps));

        loop {
            // A dropped sender means the track is gone without a stop.
            if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
                info!(device = device_index, "Webcam capture shutdown requested");
                break;
            }

            let frame_start = Instant::now();

            if self.enabled.load(Ordering::SeqCst) {
                match camera.frame() {
                    Ok(buffer) => match buffer.decode_image::<RgbFormat>() {
                        Ok(decoded) => {
                            let frame = VideoFrame {
                                width: decoded.width(),
                                height: decoded.height(),
                                data: decoded.into_raw(),
                            };
                            self.frames.send_replace(Some(frame));
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to decode webcam frame");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to capture webcam frame");
                        std::thread::sleep(Duration::from_millis(50));
                        continue;
                    }
                }
            }

            if let Some(remaining) = frame_interval.checked_sub(frame_start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }

        if let Err(e) = camera.stop_stream() {
            warn!(error = %e, "Error stopping webcam stream");
        }
        info!(device = device_index, "Webcam capture stopped");
    }
}

/// Camera backend for desktop platforms.
pub struct NokhwaDevices {
    fps: u32,
    frames: Arc<watch::Sender<Option<VideoFrame>>>,
}

impl NokhwaDevices {
    pub fn new(fps: u32) -> Self {
        let (frames, _) = watch::channel(None);
        Self {
            fps: fps.clamp(1, 120),
            frames: Arc::new(frames),
        }
    }

    /// Latest decoded frame of the running capture.
    pub fn frames(&self) -> watch::Receiver<Option<VideoFrame>> {
        self.frames.subscribe()
    }
}

impl Default for NokhwaDevices {
    fn default() -> Self {
        Self::new(30)
    }
}

#[async_trait]
impl MediaDevices for NokhwaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if constraints.audio {
            debug!("Webcam backend captures video only, omitting audio track");
        }

        let devices = tokio::task::spawn_blocking(enumerate_webcam_devices)
            .await
            .map_err(|e| MediaError::Backend(e.to_string()))??;
        let device = pick_camera(&devices, constraints.facing)
            .cloned()
            .ok_or_else(|| {
                MediaError::ConstraintUnsatisfiable(format!(
                    "no {:?} camera among {} device(s)",
                    constraints.facing.mode(),
                    devices.len()
                ))
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (opened_tx, opened_rx) = oneshot::channel();
        let enabled = Arc::new(AtomicBool::new(true));
        let capture = Capture {
            device_index: device.index,
            width: constraints.width,
            height: constraints.height,
            fps: self.fps,
            enabled: enabled.clone(),
            frames: self.frames.clone(),
        };
        tokio::task::spawn_blocking(move || capture.run(opened_tx, shutdown_rx));

        opened_rx.await.map_err(|_| {
            MediaError::Backend("capture thread exited before opening".to_string())
        })??;

        let control = Arc::new(CaptureControl {
            shutdown: shutdown_tx,
            enabled,
        });
        let track = MediaTrack::controlled(
            Uuid::now_v7().to_string(),
            MediaKind::Video,
            device.name,
            control,
        );
        Ok(MediaStream::new(vec![track]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cameras(names: &[&str]) -> Vec<WebcamDevice> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| WebcamDevice {
                index: i as u32,
                name: (*name).to_string(),
            })
            .collect()
    }

    #[test]
    fn named_rear_camera_wins_over_position() {
        let devices = cameras(&["Integrated Webcam", "USB Camera", "Rear Camera"]);
        let picked = pick_camera(&devices, FacingConstraint::Exact(FacingMode::Environment));
        assert_eq!(picked.map(|d| d.index), Some(2));
    }

    #[test]
    fn first_camera_is_front_by_default() {
        let devices = cameras(&["Integrated Webcam", "USB Camera"]);
        let picked = pick_camera(&devices, FacingConstraint::Exact(FacingMode::User));
        assert_eq!(picked.map(|d| d.index), Some(0));
    }

    #[test]
    fn exact_rear_on_single_camera_is_unsatisfiable() {
        let devices = cameras(&["Integrated Webcam"]);
        assert!(pick_camera(&devices, FacingConstraint::Exact(FacingMode::Environment)).is_none());
        let loose = pick_camera(&devices, FacingConstraint::Ideal(FacingMode::Environment));
        assert_eq!(loose.map(|d| d.index), Some(0));
    }

    #[test]
    fn front_request_skips_rear_named_first_camera() {
        let devices = cameras(&["Back Camera"]);
        assert!(pick_camera(&devices, FacingConstraint::Exact(FacingMode::User)).is_none());
    }

    #[test]
    fn no_cameras_is_unsatisfiable_even_when_loose() {
        assert!(pick_camera(&[], FacingConstraint::Ideal(FacingMode::User)).is_none());
    }

    #[test]
    fn backend_errors_are_classified() {
        assert_eq!(
            classify("Could not open device: Permission denied (os error 13)"),
            MediaError::PermissionDenied
        );
        assert_eq!(classify("Device or resource busy"), MediaError::DeviceBusy);
        assert_eq!(
            classify("format not supported"),
            MediaError::Backend("format not supported".to_string())
        );
    }
}
