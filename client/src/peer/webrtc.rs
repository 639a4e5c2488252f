//! WebRTC Peer Backend
//!
//! [`PeerConnector`] backed by the `webrtc` crate. Local tracks are exposed as
//! sample tracks so a capture/encode pipeline can feed them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rtc_common::{IceCandidate, MediaKind, SdpType, SessionDescription};
use tokio::sync::RwLock;
use tracing::{debug, info};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::sdp_type::RTCSdpType, sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use super::{
    ConnectionState, IceServerConfig, PeerConnection, PeerConnector, PeerError, PeerEvent,
    PeerEventSender,
};
use crate::media::{MediaStream, MediaTrack};

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Builds `webrtc` peer connections with Opus audio and VP8 video.
pub struct WebRtcConnector {
    api: Arc<API>,
}

impl WebRtcConnector {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| PeerError::ApiError(e.to_string()))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: vp8_capability(),
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| PeerError::ApiError(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::ApiError(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!("WebRTC peer backend initialized");

        Ok(Self { api: Arc::new(api) })
    }

    /// Create `RTCConfiguration` from ICE server config
    fn create_rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    fn setup_event_handlers(pc: &RTCPeerConnection, events: PeerEventSender) {
        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(init) = candidate.to_json() {
                        let _ = events.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        ConnectionState::Disconnected
                    }
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    _ => ConnectionState::Connecting,
                };
                info!("Peer connection state changed: {:?}", s);
                let _ = events.send(PeerEvent::StateChanged(new_state));
            })
        }));

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    let mime = track.codec().capability.mime_type;
                    info!("Remote track received: {} ({})", kind, mime);

                    let stream_id = track.stream_id();
                    let media = MediaTrack::with_id(track.id(), kind, mime);
                    let _ = events.send(PeerEvent::RemoteTrack {
                        stream: MediaStream::with_id(stream_id.clone(), vec![media]),
                        stream_id,
                    });
                })
            },
        ));
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let config = Self::create_rtc_config(ice_servers);
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| PeerError::PeerConnectionError(e.to_string()))?;

        Self::setup_event_handlers(&pc, events);

        Ok(Arc::new(WebRtcPeer {
            pc: Arc::new(pc),
            local_tracks: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A `webrtc` peer connection.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    local_tracks: RwLock<HashMap<String, Arc<TrackLocalStaticSample>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    /// The sample track fed by the local media track `track_id`.
    pub async fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.read().await.get(track_id).cloned()
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(PeerError::SdpError("rollback is not supported".to_string()))
        }
    };
    result.map_err(|e| PeerError::SdpError(e.to_string()))
}

fn from_rtc(description: &RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => return None,
    };
    Some(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError> {
        let capability = match track.kind() {
            MediaKind::Audio => opus_capability(),
            MediaKind::Video => vp8_capability(),
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_string(),
            stream_id.to_string(),
        ));

        self.pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::TrackError(e.to_string()))?;

        self.local_tracks
            .write()
            .await
            .insert(track.id().to_string(), local);
        debug!(kind = %track.kind(), "Local track attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::SdpError(e.to_string()))?;
        from_rtc(&offer).ok_or_else(|| PeerError::SdpError("unexpected SDP type".to_string()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| PeerError::SdpError(e.to_string()))?;
        debug!("Local description set");
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .as_ref()
            .and_then(from_rtc)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| PeerError::SdpError(e.to_string()))?;
        debug!("Remote description set");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::IceError(e.to_string()))?;
        debug!("ICE candidate added");
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::PeerConnectionError(e.to_string()))?;
        info!("WebRTC peer connection closed");
        Ok(())
    }
}
