//! Reusable fakes for session and room integration tests.
//!
//! Every fake counts or records the calls made to it so tests can assert on
//! side effects ("no network call before the host check", "camera released
//! once", ...).
//!
//! ## Signaling
//!
//! [`FakeSignalConnector`] hands the test a [`ServerEnd`] per connection: the
//! messages the client sent, a sender for server events, and the shutdown
//! signal.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rtc_common::api::{
    ConsumeRequest, ConsumerDescriptor, DtlsParameters, MuteParticipantRequest, ProduceRequest,
    ProduceResponse, RemoveParticipantRequest, RoomHandshake, RtpCapabilities, RtpParameters,
    TransportOptions,
};
use rtc_common::{IceCandidate, MediaKind, SessionDescription, SignalMessage, TransportDirection};
use rtc_session::device::{
    CaptureConfig, DeviceManager, FacingConstraint, MediaConstraints, MediaDevices, MediaError,
};
use rtc_session::media::{
    AudioSink, MediaStream, MediaTrack, RenderTarget, TrackControl, VideoFrame,
};
use rtc_session::peer::{
    IceServerConfig, PeerConnection, PeerConnector, PeerError, PeerEventSender,
};
use rtc_session::room::{
    ApiError, Consumer, MediaDevice, Producer, RecvTransport, RoomError, SendTransport, SfuApi,
    TransportHandler,
};
use rtc_session::session::{CallEntitlement, Clock, Navigator};
use rtc_session::signaling::{ChannelEvent, SignalConnector, SignalingChannel, SignalingError};
use serde_json::json;
use tokio::sync::mpsc;

/// Poll an (async) condition until it holds or ~1s of test time passes.
#[macro_export]
macro_rules! eventually {
    ($cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        ok
    }};
}

/// Receive the next message or fail after a second.
pub async fn next_signal(rx: &mut mpsc::Receiver<SignalMessage>) -> SignalMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("signal channel closed")
}

// ============================================================================
// Media
// ============================================================================

struct StopCounter(Arc<AtomicUsize>);

impl TrackControl for StopCounter {
    fn stop(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture backend that grants camera + microphone unless told to fail.
#[derive(Default)]
pub struct FakeMediaDevices {
    pub requests: Mutex<Vec<MediaConstraints>>,
    pub grants: Mutex<Vec<MediaStream>>,
    pub track_stops: Arc<AtomicUsize>,
    exact_error: Mutex<Option<MediaError>>,
    loose_error: Mutex<Option<MediaError>>,
}

impl FakeMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_exact(&self, error: MediaError) {
        *self.exact_error.lock().unwrap() = Some(error);
    }

    pub fn fail_loose(&self, error: MediaError) {
        *self.loose_error.lock().unwrap() = Some(error);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Grants whose tracks are still live.
    pub fn live_grants(&self) -> usize {
        self.grants
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_active())
            .count()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.requests.lock().unwrap().push(constraints.clone());
        tokio::task::yield_now().await;

        let failure = match constraints.facing {
            FacingConstraint::Exact(_) => self.exact_error.lock().unwrap().clone(),
            FacingConstraint::Ideal(_) => self.loose_error.lock().unwrap().clone(),
        };
        if let Some(error) = failure {
            return Err(error);
        }

        let facing = format!("{:?}", constraints.facing.mode());
        let mut tracks = vec![MediaTrack::controlled(
            uuid::Uuid::now_v7().to_string(),
            MediaKind::Video,
            format!("{facing} camera"),
            Arc::new(StopCounter(self.track_stops.clone())),
        )];
        if constraints.audio {
            tracks.push(MediaTrack::controlled(
                uuid::Uuid::now_v7().to_string(),
                MediaKind::Audio,
                "microphone",
                Arc::new(StopCounter(self.track_stops.clone())),
            ));
        }
        let stream = MediaStream::new(tracks);
        self.grants.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

pub fn device_manager(devices: &Arc<FakeMediaDevices>) -> Arc<DeviceManager> {
    Arc::new(DeviceManager::new(devices.clone(), CaptureConfig::default()))
}

#[derive(Default)]
pub struct FakeRenderTarget {
    source: Mutex<Option<MediaStream>>,
    frame: Mutex<Option<VideoFrame>>,
    pub plays: AtomicUsize,
}

impl FakeRenderTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_frame(width: u32, height: u32) -> Arc<Self> {
        let target = Self::default();
        *target.frame.lock().unwrap() = Some(VideoFrame {
            width,
            height,
            data: vec![200; (width * height * 3) as usize],
        });
        Arc::new(target)
    }
}

impl RenderTarget for FakeRenderTarget {
    fn set_source(&self, stream: Option<MediaStream>) {
        *self.source.lock().unwrap() = stream;
    }

    fn source(&self) -> Option<MediaStream> {
        self.source.lock().unwrap().clone()
    }

    fn play(&self) -> Result<(), String> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_frame(&self) -> Option<VideoFrame> {
        self.frame.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeAudioSink {
    source: Mutex<Option<MediaStream>>,
    muted: AtomicBool,
}

impl FakeAudioSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl AudioSink for FakeAudioSink {
    fn set_source(&self, stream: Option<MediaStream>) {
        *self.source.lock().unwrap() = stream;
    }

    fn source(&self) -> Option<MediaStream> {
        self.source.lock().unwrap().clone()
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Server side of one fake signaling connection.
pub struct ServerEnd {
    pub outgoing: mpsc::Receiver<SignalMessage>,
    pub events: mpsc::Sender<ChannelEvent>,
    pub shutdown: mpsc::Receiver<()>,
}

impl ServerEnd {
    pub async fn push(&self, message: SignalMessage) {
        self.events
            .send(ChannelEvent::Message(message))
            .await
            .expect("client dropped its channel");
    }
}

pub struct FakeSignalConnector {
    pub connects: AtomicUsize,
    auto_open: bool,
    ends: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeSignalConnector {
    /// With `auto_open`, every channel reports `Opened` immediately.
    pub fn new(auto_open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                auto_open,
                ends: tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl SignalConnector for FakeSignalConnector {
    async fn connect(&self, _url: &str) -> Result<SignalingChannel, SignalingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        if self.auto_open {
            let _ = event_tx.try_send(ChannelEvent::Opened);
        }
        let _ = self.ends.send(ServerEnd {
            outgoing: out_rx,
            events: event_tx,
            shutdown: shutdown_rx,
        });
        Ok(SignalingChannel::from_parts(out_tx, event_rx, shutdown_tx))
    }
}

// ============================================================================
// Peer
// ============================================================================

pub struct FakePeer {
    pub tracks: Mutex<Vec<(String, String)>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub remote: Mutex<Option<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub closes: AtomicUsize,
    pub events: PeerEventSender,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError> {
        self.tracks
            .lock()
            .unwrap()
            .push((track.id().to_string(), stream_id.to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0\r\no=- fake-offer\r\n"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        *self.local.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        *self.remote.lock().unwrap() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerConnector {
    pub creates: AtomicUsize,
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_peer(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer created")
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(FakePeer {
            tracks: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            events,
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Moderation collaborators
// ============================================================================

#[derive(Default)]
pub struct FakeNavigator {
    pub navigations: Mutex<Vec<String>>,
    pub notices: Mutex<Vec<String>>,
}

impl FakeNavigator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

impl Navigator for FakeNavigator {
    fn navigate(&self, url: &str) {
        self.navigations.lock().unwrap().push(url.to_string());
    }

    fn announce(&self, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }
}

/// Clock that records requested sleeps and returns at once.
#[derive(Default)]
pub struct FakeClock {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

pub struct FakeEntitlement {
    pub allowed: bool,
    pub checks: AtomicUsize,
}

impl FakeEntitlement {
    pub fn new(allowed: bool) -> Arc<Self> {
        Arc::new(Self {
            allowed,
            checks: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CallEntitlement for FakeEntitlement {
    async fn authorize(&self, _room_id: &str, _user_id: &str) -> Result<bool, String> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.allowed)
    }
}

// ============================================================================
// SFU
// ============================================================================

/// In-memory SFU REST API.
#[derive(Default)]
pub struct FakeSfuApi {
    pub calls: Mutex<Vec<&'static str>>,
    pub consume_requests: Mutex<Vec<ConsumeRequest>>,
    pub produce_requests: Mutex<Vec<ProduceRequest>>,
    pub fail_host_controls: AtomicBool,
    consumed: AtomicUsize,
    join_error: Mutex<Option<ApiError>>,
    transport_delay: Mutex<Option<Duration>>,
    failing_produce: Mutex<Option<MediaKind>>,
}

impl FakeSfuApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == endpoint)
            .count()
    }

    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Fail the next create/join handshake only.
    pub fn fail_next_join(&self, error: ApiError) {
        *self.join_error.lock().unwrap() = Some(error);
    }

    /// Hold every transport creation for `delay`.
    pub fn delay_transports(&self, delay: Duration) {
        *self.transport_delay.lock().unwrap() = Some(delay);
    }

    /// Reject produce requests for `kind` with a 500.
    pub fn fail_produce(&self, kind: MediaKind) {
        *self.failing_produce.lock().unwrap() = Some(kind);
    }

    fn record(&self, endpoint: &'static str) {
        self.calls.lock().unwrap().push(endpoint);
    }

    fn handshake_result(&self) -> Result<RoomHandshake, ApiError> {
        match self.join_error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(handshake()),
        }
    }

    fn host_control_result(&self) -> Result<(), ApiError> {
        if self.fail_host_controls.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "boom".into(),
            });
        }
        Ok(())
    }
}

fn handshake() -> RoomHandshake {
    RoomHandshake {
        room_id: None,
        rtp_capabilities: RtpCapabilities(json!({"codecs": [{"mimeType": "video/VP8"}]})),
    }
}

#[async_trait]
impl SfuApi for FakeSfuApi {
    async fn create_room(&self, _room_id: &str) -> Result<RoomHandshake, ApiError> {
        self.record("create_room");
        self.handshake_result()
    }

    async fn join_room(&self, _room_id: &str) -> Result<RoomHandshake, ApiError> {
        self.record("join_room");
        self.handshake_result()
    }

    async fn create_transport(
        &self,
        _room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportOptions, ApiError> {
        self.record("create_transport");
        let delay = *self.transport_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(TransportOptions {
            id: format!("{direction}-transport"),
            ice_parameters: json!({}),
            ice_candidates: Vec::new(),
            dtls_parameters: DtlsParameters(json!({"role": "auto"})),
        })
    }

    async fn connect_transport(
        &self,
        _transport_id: &str,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), ApiError> {
        self.record("connect_transport");
        Ok(())
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, ApiError> {
        self.record("produce");
        if *self.failing_produce.lock().unwrap() == Some(request.kind) {
            return Err(ApiError::Status {
                status: 500,
                body: "produce rejected".into(),
            });
        }
        let producer_id = format!("producer-{}", request.kind);
        self.produce_requests.lock().unwrap().push(request);
        Ok(ProduceResponse { producer_id })
    }

    async fn consume(
        &self,
        request: ConsumeRequest,
    ) -> Result<Option<ConsumerDescriptor>, ApiError> {
        self.record("consume");
        let n = self.consumed.fetch_add(1, Ordering::SeqCst);
        let descriptor = ConsumerDescriptor {
            id: format!("consumer-{n}"),
            producer_id: request.producer_id.clone(),
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters(json!({})),
        };
        self.consume_requests.lock().unwrap().push(request);
        Ok(Some(descriptor))
    }

    async fn mute_participant(&self, _request: MuteParticipantRequest) -> Result<(), ApiError> {
        self.record("mute_participant");
        self.host_control_result()
    }

    async fn remove_participant(
        &self,
        _request: RemoveParticipantRequest,
    ) -> Result<(), ApiError> {
        self.record("remove_participant");
        self.host_control_result()
    }

    async fn leave_room(&self, _room_id: &str) -> Result<(), ApiError> {
        self.record("leave_room");
        Ok(())
    }
}

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    pub closed: AtomicBool,
}

impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    track: MediaTrack,
    pub closed: AtomicBool,
}

impl Consumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> MediaTrack {
        self.track.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeSendTransport {
    id: String,
    handler: Arc<dyn TransportHandler>,
    connected: AtomicBool,
    pub closed: AtomicBool,
    pub producers: Mutex<Vec<Arc<FakeProducer>>>,
}

#[async_trait]
impl SendTransport for FakeSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, track: &MediaTrack) -> Result<Arc<dyn Producer>, RoomError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.handler
                .on_connect(&self.id, DtlsParameters(json!({"role": "client"})))
                .await?;
        }
        let id = self
            .handler
            .on_produce(&self.id, track.kind(), RtpParameters(json!({"encodings": []})))
            .await?;
        let producer = Arc::new(FakeProducer {
            id,
            kind: track.kind(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeRecvTransport {
    id: String,
    handler: Arc<dyn TransportHandler>,
    connected: AtomicBool,
    pub closed: AtomicBool,
    pub consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

#[async_trait]
impl RecvTransport for FakeRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn consume(
        &self,
        descriptor: ConsumerDescriptor,
    ) -> Result<Arc<dyn Consumer>, RoomError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.handler
                .on_connect(&self.id, DtlsParameters(json!({"role": "client"})))
                .await?;
        }
        let consumer = Arc::new(FakeConsumer {
            track: MediaTrack::new(descriptor.kind, "remote"),
            id: descriptor.id,
            producer_id: descriptor.producer_id,
            kind: descriptor.kind,
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().unwrap().push(consumer.clone());
        Ok(consumer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Local SFU device.
#[derive(Default)]
pub struct FakeSfuDevice {
    pub loads: AtomicUsize,
    capabilities: Mutex<Option<RtpCapabilities>>,
    pub send: Mutex<Option<Arc<FakeSendTransport>>>,
    pub recv: Mutex<Option<Arc<FakeRecvTransport>>>,
}

impl FakeSfuDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn send_transport(&self) -> Arc<FakeSendTransport> {
        self.send.lock().unwrap().clone().expect("no send transport")
    }

    pub fn recv_transport(&self) -> Arc<FakeRecvTransport> {
        self.recv.lock().unwrap().clone().expect("no recv transport")
    }
}

#[async_trait]
impl MediaDevice for FakeSfuDevice {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), RoomError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        *self.capabilities.lock().unwrap() = Some(router_capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.capabilities.lock().unwrap().clone()
    }

    fn create_send_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn SendTransport>, RoomError> {
        let transport = Arc::new(FakeSendTransport {
            id: options.id,
            handler,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
        });
        *self.send.lock().unwrap() = Some(transport.clone());
        Ok(transport)
    }

    fn create_recv_transport(
        &self,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn RecvTransport>, RoomError> {
        let transport = Arc::new(FakeRecvTransport {
            id: options.id,
            handler,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        });
        *self.recv.lock().unwrap() = Some(transport.clone());
        Ok(transport)
    }
}
