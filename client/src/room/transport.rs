//! SFU media primitives.
//!
//! A [`MediaDevice`] is loaded with the router's capabilities and then builds
//! send/recv transports. Transports call back into a [`TransportHandler`]
//! when they need the server: to deliver DTLS parameters and to obtain a
//! producer id.

use std::sync::Arc;

use async_trait::async_trait;
use rtc_common::api::{
    ConsumerDescriptor, DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions,
};
use rtc_common::MediaKind;

use super::RoomError;
use crate::media::MediaTrack;

/// Server round trips a transport depends on.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// The transport needs its DTLS parameters connected on the server.
    async fn on_connect(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RoomError>;

    /// The transport wants to produce; resolves with the server's producer id.
    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, RoomError>;
}

/// Local SFU device: capability negotiation and transport factory.
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's capabilities. Must precede transport creation.
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), RoomError>;

    /// Capabilities of the loaded device; `None` before `load`.
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    fn create_send_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SendTransport>, RoomError>;

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn RecvTransport>, RoomError>;
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Start sending `track`.
    async fn produce(&self, track: &MediaTrack) -> Result<Arc<dyn Producer>, RoomError>;

    fn close(&self);
}

#[async_trait]
pub trait RecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Start receiving the producer described by `descriptor`.
    async fn consume(
        &self,
        descriptor: ConsumerDescriptor,
    ) -> Result<Arc<dyn Consumer>, RoomError>;

    fn close(&self);
}

/// One outbound track.
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Stop sending data without closing.
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
}

/// One inbound track.
pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> MediaTrack;
    fn close(&self);
}
