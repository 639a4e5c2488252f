//! RTC Session Core
//!
//! Client-side engine for SFU-backed calls: local device ownership, signaling,
//! peer negotiation, moderated private calls and multi-party rooms with host
//! controls.

#[cfg(feature = "webcam")]
pub mod capture;
pub mod config;
pub mod device;
pub mod media;
pub mod observability;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;

pub use config::ClientConfig;
pub use device::{CaptureConfig, DeviceError, DeviceManager, FacingMode, MediaDevices};
pub use media::{AudioSink, MediaStream, MediaTrack, RenderTarget, VideoFrame};
pub use room::{RoomConfig, RoomDeps, RoomError, RoomSessionManager};
pub use session::{
    ModeratedSessionClient, ModerationPolicy, SessionClient, SessionConfig, SessionDeps,
    SessionError, SessionState, TerminationPolicy,
};
pub use signaling::{SignalConnector, SignalingChannel, WsConnector};
