//! Peer Session
//!
//! One peer connection to the SFU: SDP exchange, ICE trickle and local track
//! attachment. Connection callbacks are delivered as [`PeerEvent`]s on a
//! channel so the owning session handles them on its own task.

mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use rtc_common::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaStream, MediaTrack};

pub use self::webrtc::{WebRtcConnector, WebRtcPeer};

/// WebRTC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("WebRTC API error: {0}")]
    ApiError(String),
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),
    #[error("SDP error: {0}")]
    SdpError(String),
    #[error("ICE error: {0}")]
    IceError(String),
    #[error("Track error: {0}")]
    TrackError(String),
    #[error("Peer connection closed")]
    Closed,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Callbacks raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate to forward to the server.
    IceCandidate(IceCandidate),
    /// Remote media arrived; `stream_id` identifies the sending participant.
    RemoteTrack {
        stream_id: String,
        stream: MediaStream,
    },
    StateChanged(ConnectionState),
}

/// Sender half handed to a connector.
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// A negotiated (or negotiating) peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local track for sending.
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection. Repeated calls are no-ops.
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
