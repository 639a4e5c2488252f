//! Room Session Manager
//!
//! Multi-party rooms on an SFU: one send and one recv transport, a producer
//! per local track kind, a consumer per remote participant, and host controls.
//!
//! Precondition failures (not connected, not host, terminated) are returned
//! as errors before any network call. Network failures while publishing,
//! subscribing or moderating are reported through the error callback; the
//! call itself still succeeds.

mod api;
mod state;
mod transport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rtc_common::api::{
    ConsumeRequest, DtlsParameters, MuteParticipantRequest, ProduceRequest,
    RemoveParticipantRequest, RoomEvent, RtpParameters,
};
use rtc_common::{MediaKind, ParticipantRole, TransportDirection};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceError, DeviceManager, FacingMode};
use crate::media::MediaStream;

pub use api::{ApiError, HttpSfuApi, SfuApi};
pub use state::{Participant, Room, RoomState, Roster, RosterChange, RosterCommand};
pub use transport::{
    Consumer, MediaDevice, Producer, RecvTransport, SendTransport, TransportHandler,
};

use state::RoomSession;

/// Room errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Not authorized: {0}")]
    Authorization(String),
    #[error("Room is not connected")]
    NotConnected,
    #[error("Room connect already started")]
    AlreadyConnected,
    #[error("Room has been terminated")]
    Terminated,
    #[error("Transport negotiation failed: {0}")]
    TransportNegotiation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomConfig {
    /// Bound on every REST round trip.
    pub handshake_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators a room session is built from.
#[derive(Clone)]
pub struct RoomDeps {
    pub api: Arc<dyn SfuApi>,
    pub device: Arc<dyn MediaDevice>,
    pub devices: Arc<DeviceManager>,
}

async fn bounded<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T, RoomError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| RoomError::Timeout(what))?
        .map_err(RoomError::from)
}

/// Routes transport callbacks to the REST API.
struct ServerTransportHandler {
    api: Arc<dyn SfuApi>,
    room_id: String,
    timeout: Duration,
}

#[async_trait]
impl TransportHandler for ServerTransportHandler {
    async fn on_connect(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), RoomError> {
        debug!(transport_id, "Connecting transport");
        bounded(
            self.timeout,
            "transport connect",
            self.api.connect_transport(transport_id, dtls_parameters),
        )
        .await
    }

    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String, RoomError> {
        let request = ProduceRequest {
            room_id: self.room_id.clone(),
            transport_id: transport_id.to_string(),
            kind,
            rtp_parameters,
        };
        let response = bounded(self.timeout, "produce", self.api.produce(request)).await?;
        debug!(%kind, producer_id = %response.producer_id, "Producer created on server");
        Ok(response.producer_id)
    }
}

type ParticipantCallback = Box<dyn Fn(Participant) + Send + Sync>;
type LeftCallback = Box<dyn Fn(String) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&RoomError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_participant_joined: RwLock<Option<ParticipantCallback>>,
    on_participant_left: RwLock<Option<LeftCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

/// One client's membership in an SFU room.
pub struct RoomSessionManager {
    role: ParticipantRole,
    deps: RoomDeps,
    config: RoomConfig,
    session: Mutex<RoomSession>,
    callbacks: Callbacks,
}

impl RoomSessionManager {
    pub fn new(
        room_id: impl Into<String>,
        role: ParticipantRole,
        deps: RoomDeps,
        config: RoomConfig,
    ) -> Self {
        Self {
            role,
            deps,
            config,
            session: Mutex::new(RoomSession::new(room_id.into(), role)),
            callbacks: Callbacks::default(),
        }
    }

    pub const fn is_host(&self) -> bool {
        self.role.is_host()
    }

    pub async fn room(&self) -> Room {
        self.session.lock().await.room.clone()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.session.lock().await.roster.participants().to_vec()
    }

    pub async fn participant(&self, user_id: &str) -> Option<Participant> {
        self.session.lock().await.roster.get(user_id).cloned()
    }

    pub async fn producer(&self, kind: MediaKind) -> Option<Arc<dyn Producer>> {
        self.session.lock().await.producers.get(&kind).cloned()
    }

    pub async fn consumer(&self, user_id: &str) -> Option<Arc<dyn Consumer>> {
        self.session.lock().await.consumers.get(user_id).cloned()
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.session.lock().await.local_stream.clone()
    }

    /// Called the first time a remote participant is seen.
    pub async fn set_on_participant_joined<F>(&self, callback: F)
    where
        F: Fn(Participant) + Send + Sync + 'static,
    {
        *self.callbacks.on_participant_joined.write().await = Some(Box::new(callback));
    }

    pub async fn set_on_participant_left<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.callbacks.on_participant_left.write().await = Some(Box::new(callback));
    }

    pub async fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&RoomError) + Send + Sync + 'static,
    {
        *self.callbacks.on_error.write().await = Some(Box::new(callback));
    }

    /// Create (host) or join the room, load the device and build both transports.
    ///
    /// A failed connect can be retried. A disconnect while connecting makes
    /// this return [`RoomError::Terminated`].
    #[tracing::instrument(skip(self), fields(role = ?self.role))]
    pub async fn connect(&self) -> Result<(), RoomError> {
        let room_id = {
            let mut session = self.session.lock().await;
            if session.is_terminated() {
                return Err(RoomError::Terminated);
            }
            if session.connect_started {
                return Err(RoomError::AlreadyConnected);
            }
            session.connect_started = true;
            session.room.id.clone()
        };

        match self.establish(room_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_connect().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, room_id: String) -> Result<(), RoomError> {
        let limit = self.config.handshake_timeout;

        let handshake = if self.role.is_host() {
            bounded(limit, "room create", self.deps.api.create_room(&room_id)).await?
        } else {
            bounded(limit, "room join", self.deps.api.join_room(&room_id)).await?
        };
        let room_id = handshake.room_id.unwrap_or(room_id);
        self.mark_joined(&room_id).await?;
        info!(room_id = %room_id, "Router capabilities received");

        self.deps.device.load(&handshake.rtp_capabilities).await?;
        self.ensure_live().await?;

        let handler: Arc<dyn TransportHandler> = Arc::new(ServerTransportHandler {
            api: self.deps.api.clone(),
            room_id: room_id.clone(),
            timeout: limit,
        });

        let send_options = bounded(
            limit,
            "send transport",
            self.deps.api.create_transport(&room_id, TransportDirection::Send),
        )
        .await?;
        self.ensure_live().await?;
        let send = self
            .deps
            .device
            .create_send_transport(send_options, handler.clone())?;

        let recv = match self.create_recv_transport(&room_id, handler).await {
            Ok(recv) => recv,
            Err(e) => {
                send.close();
                return Err(e);
            }
        };

        let mut session = self.session.lock().await;
        if session.is_terminated() {
            debug!("Room torn down during connect, discarding transports");
            send.close();
            recv.close();
            return Err(RoomError::Terminated);
        }
        session.send_transport = Some(send);
        session.recv_transport = Some(recv);
        session.advance(RoomState::Joined);
        info!(room_id = %session.room.id, "Room connected");
        Ok(())
    }

    async fn create_recv_transport(
        &self,
        room_id: &str,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Arc<dyn RecvTransport>, RoomError> {
        let options = bounded(
            self.config.handshake_timeout,
            "recv transport",
            self.deps.api.create_transport(room_id, TransportDirection::Recv),
        )
        .await?;
        self.ensure_live().await?;
        self.deps.device.create_recv_transport(options, handler)
    }

    /// Record the server-side membership so teardown knows to leave.
    async fn mark_joined(&self, room_id: &str) -> Result<(), RoomError> {
        {
            let mut session = self.session.lock().await;
            if !session.is_terminated() {
                session.room.id = room_id.to_string();
                session.server_joined = true;
                return Ok(());
            }
        }
        // Disconnected while the handshake was in flight; nobody else will leave.
        debug!(room_id, "Room torn down during handshake, leaving");
        self.leave(room_id).await;
        Err(RoomError::Terminated)
    }

    async fn ensure_live(&self) -> Result<(), RoomError> {
        if self.session.lock().await.is_terminated() {
            debug!("Room torn down during connect");
            return Err(RoomError::Terminated);
        }
        Ok(())
    }

    /// Undo a failed connect so it can be retried.
    async fn abort_connect(&self) {
        let joined_room = {
            let mut session = self.session.lock().await;
            if session.is_terminated() {
                return;
            }
            session.connect_started = false;
            std::mem::take(&mut session.server_joined).then(|| session.room.id.clone())
        };
        if let Some(room_id) = joined_room {
            warn!(room_id = %room_id, "Connect failed after joining, leaving room");
            self.leave(&room_id).await;
        }
    }

    async fn leave(&self, room_id: &str) {
        if let Err(e) = bounded(
            self.config.handshake_timeout,
            "room leave",
            self.deps.api.leave_room(room_id),
        )
        .await
        {
            self.report(e).await;
        }
    }

    /// Acquire the front camera and publish it.
    pub async fn publish_camera(&self) -> Result<(), RoomError> {
        self.ensure_can_publish().await?;
        let stream = self.deps.devices.start_camera(FacingMode::User).await?;
        self.publish_local_media(stream).await
    }

    /// Create one producer per track kind present in `stream`.
    ///
    /// `stream` replaces any previously published stream: the old stream is
    /// stopped and producers for kinds it no longer carries are closed. If a
    /// produce fails the whole publish is rolled back and the stream stopped.
    pub async fn publish_local_media(&self, stream: MediaStream) -> Result<(), RoomError> {
        let send = self.ensure_can_publish().await?;

        let previous = {
            let mut session = self.session.lock().await;
            if session.is_terminated() {
                return Err(RoomError::Terminated);
            }
            let absent: Vec<MediaKind> = session
                .producers
                .keys()
                .copied()
                .filter(|kind| stream.track(*kind).is_none())
                .collect();
            for kind in absent {
                if let Some(producer) = session.producers.remove(&kind) {
                    debug!(%kind, "Closing producer for track no longer published");
                    producer.close();
                }
            }
            session.local_stream.replace(stream.clone())
        };
        if let Some(previous) = previous.filter(|p| !p.same_as(&stream)) {
            self.release_stream(&previous).await;
        }

        for kind in [MediaKind::Video, MediaKind::Audio] {
            let Some(track) = stream.track(kind) else {
                continue;
            };
            let producer = match send.produce(track).await {
                Ok(producer) => producer,
                Err(e) => {
                    self.abandon_publish(&stream).await;
                    self.report(e).await;
                    return Ok(());
                }
            };

            let mut session = self.session.lock().await;
            if session.is_terminated() {
                debug!(%kind, "Room terminated while producing, closing producer");
                producer.close();
                return Ok(());
            }
            info!(%kind, producer_id = producer.id(), "Publishing local track");
            if let Some(previous) = session.producers.insert(kind, producer) {
                previous.close();
            }
        }

        let mut session = self.session.lock().await;
        if !session.is_terminated() {
            session.advance(RoomState::Active);
        }
        Ok(())
    }

    /// Close every producer for `stream`'s kinds and release the stream.
    async fn abandon_publish(&self, stream: &MediaStream) {
        let owned = {
            let mut session = self.session.lock().await;
            for kind in [MediaKind::Video, MediaKind::Audio] {
                if stream.track(kind).is_none() {
                    continue;
                }
                if let Some(producer) = session.producers.remove(&kind) {
                    producer.close();
                }
            }
            if session
                .local_stream
                .as_ref()
                .is_some_and(|current| current.same_as(stream))
            {
                session.local_stream = None;
                true
            } else {
                false
            }
        };
        if owned {
            warn!("Publish failed, local media released");
            self.release_stream(stream).await;
        }
    }

    /// Stop a local stream, releasing the camera if the device manager owns it.
    async fn release_stream(&self, stream: &MediaStream) {
        let owned_by_device = self
            .deps
            .devices
            .current_stream()
            .await
            .is_some_and(|current| current.same_as(stream));
        stream.stop();
        if owned_by_device {
            self.deps.devices.stop_camera().await;
        }
    }

    /// Consume `producer_id` and show it as `participant_id`.
    pub async fn subscribe_to_participant(
        &self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<(), RoomError> {
        let (room_id, recv) = {
            let session = self.session.lock().await;
            if session.is_terminated() {
                return Err(RoomError::Terminated);
            }
            let recv = session.recv_transport.clone().ok_or(RoomError::NotConnected)?;
            (session.room.id.clone(), recv)
        };
        let capabilities = self
            .deps
            .device
            .rtp_capabilities()
            .ok_or(RoomError::NotConnected)?;

        let request = ConsumeRequest {
            room_id,
            producer_id: producer_id.to_string(),
            rtp_capabilities: capabilities,
        };
        let descriptor = match bounded(
            self.config.handshake_timeout,
            "consume",
            self.deps.api.consume(request),
        )
        .await
        {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                warn!(participant_id, producer_id, "Nothing to consume for producer");
                return Ok(());
            }
            Err(e) => {
                self.report(e).await;
                return Ok(());
            }
        };

        let consumer = match recv.consume(descriptor).await {
            Ok(consumer) => consumer,
            Err(e) => {
                self.report(e).await;
                return Ok(());
            }
        };
        let stream = MediaStream::new(vec![consumer.track()]);

        let change = {
            let mut session = self.session.lock().await;
            if session.is_terminated() {
                debug!(participant_id, "Room terminated while consuming, closing consumer");
                consumer.close();
                return Ok(());
            }
            if let Some(previous) = session
                .consumers
                .insert(participant_id.to_string(), consumer)
            {
                previous.close();
            }
            session.roster.apply(RosterCommand::Upsert {
                user_id: participant_id.to_string(),
                stream,
            })
        };

        if let RosterChange::Joined(participant) = change {
            info!(participant_id, "Participant joined");
            if let Some(cb) = self.callbacks.on_participant_joined.read().await.as_ref() {
                cb(participant);
            }
        }
        Ok(())
    }

    /// Pause the audio producer and disable the local audio track together.
    pub async fn toggle_mute(&self, muted: bool) {
        self.set_local_kind(MediaKind::Audio, muted).await;
    }

    /// Pause the video producer and disable the local video track together.
    pub async fn toggle_video(&self, video_off: bool) {
        self.set_local_kind(MediaKind::Video, video_off).await;
    }

    async fn set_local_kind(&self, kind: MediaKind, off: bool) {
        let session = self.session.lock().await;
        if let Some(producer) = session.producers.get(&kind) {
            if off {
                producer.pause();
            } else {
                producer.resume();
            }
        }
        if let Some(track) = session.local_stream.as_ref().and_then(|s| s.track(kind)) {
            track.set_enabled(!off);
        }
        debug!(%kind, off, "Local track toggled");
    }

    /// Host only: mute or unmute another participant.
    pub async fn mute_participant(&self, user_id: &str, muted: bool) -> Result<(), RoomError> {
        self.require_host("mute participants")?;
        let room_id = self.ensure_joined().await?;

        let request = MuteParticipantRequest {
            room_id,
            user_id: user_id.to_string(),
            is_muted: muted,
        };
        match bounded(
            self.config.handshake_timeout,
            "participant mute",
            self.deps.api.mute_participant(request),
        )
        .await
        {
            Ok(()) => {
                info!(user_id, muted, "Participant mute updated");
                self.session.lock().await.roster.apply(RosterCommand::SetMuted {
                    user_id: user_id.to_string(),
                    muted,
                });
            }
            Err(e) => self.report(e).await,
        }
        Ok(())
    }

    /// Host only: remove a participant from the room.
    pub async fn remove_participant(&self, user_id: &str) -> Result<(), RoomError> {
        self.require_host("remove participants")?;
        let room_id = self.ensure_joined().await?;

        let request = RemoveParticipantRequest {
            room_id,
            user_id: user_id.to_string(),
        };
        match bounded(
            self.config.handshake_timeout,
            "participant remove",
            self.deps.api.remove_participant(request),
        )
        .await
        {
            Ok(()) => {
                info!(user_id, "Participant removed");
                self.drop_participant(user_id).await;
                self.notify_left(user_id).await;
            }
            Err(e) => self.report(e).await,
        }
        Ok(())
    }

    /// Apply an event pushed by the server.
    pub async fn apply_room_event(&self, event: RoomEvent) -> Result<(), RoomError> {
        match event {
            RoomEvent::NewProducer {
                user_id,
                producer_id,
                kind,
            } => {
                debug!(user_id = %user_id, %kind, "New remote producer");
                self.subscribe_to_participant(&user_id, &producer_id).await?;
            }
            RoomEvent::ParticipantMuted { user_id, is_muted } => {
                self.session.lock().await.roster.apply(RosterCommand::SetMuted {
                    user_id,
                    muted: is_muted,
                });
            }
            RoomEvent::ParticipantVideo {
                user_id,
                is_video_off,
            } => {
                self.session
                    .lock()
                    .await
                    .roster
                    .apply(RosterCommand::SetVideoOff {
                        user_id,
                        video_off: is_video_off,
                    });
            }
            RoomEvent::ParticipantLeft { user_id } => {
                if self.drop_participant(&user_id).await {
                    info!(user_id = %user_id, "Participant left");
                    self.notify_left(&user_id).await;
                }
            }
            RoomEvent::RoomClosed { reason } => {
                warn!(reason = reason.as_deref().unwrap_or("unspecified"), "Room closed by server");
                self.teardown(false).await;
            }
        }
        Ok(())
    }

    /// Close everything and leave the room. Safe to call repeatedly or
    /// concurrently; later calls do nothing.
    pub async fn disconnect(&self) {
        self.teardown(true).await;
    }

    async fn teardown(&self, notify_server: bool) {
        let (released, room_id) = {
            let mut session = self.session.lock().await;
            if session.is_terminated() {
                debug!("Room already disconnected");
                return;
            }
            (session.terminate(), session.room.id.clone())
        };

        for producer in &released.producers {
            producer.close();
        }
        for consumer in &released.consumers {
            consumer.close();
        }
        if let Some(send) = &released.send_transport {
            send.close();
        }
        if let Some(recv) = &released.recv_transport {
            recv.close();
        }
        if let Some(stream) = &released.local_stream {
            self.release_stream(stream).await;
        }

        if notify_server && released.was_joined {
            self.leave(&room_id).await;
        }
        info!(room_id = %room_id, "Left room");
    }

    async fn ensure_can_publish(&self) -> Result<Arc<dyn SendTransport>, RoomError> {
        if !self.role.can_publish() {
            return Err(RoomError::Authorization(
                "viewers cannot publish media".to_string(),
            ));
        }
        let session = self.session.lock().await;
        if session.is_terminated() {
            return Err(RoomError::Terminated);
        }
        session.send_transport.clone().ok_or(RoomError::NotConnected)
    }

    /// The room id, once both transports are up.
    async fn ensure_joined(&self) -> Result<String, RoomError> {
        let session = self.session.lock().await;
        if session.is_terminated() {
            return Err(RoomError::Terminated);
        }
        if session.send_transport.is_none() {
            return Err(RoomError::NotConnected);
        }
        Ok(session.room.id.clone())
    }

    fn require_host(&self, action: &str) -> Result<(), RoomError> {
        if self.role.is_host() {
            return Ok(());
        }
        warn!(action, "Rejected host control from non-host");
        Err(RoomError::Authorization(format!("only the host can {action}")))
    }

    /// Remove a participant and close its consumer. Returns whether it was known.
    async fn drop_participant(&self, user_id: &str) -> bool {
        let mut session = self.session.lock().await;
        if let Some(consumer) = session.consumers.remove(user_id) {
            consumer.close();
        }
        matches!(
            session.roster.apply(RosterCommand::Remove {
                user_id: user_id.to_string(),
            }),
            RosterChange::Left(_)
        )
    }

    async fn notify_left(&self, user_id: &str) {
        if let Some(cb) = self.callbacks.on_participant_left.read().await.as_ref() {
            cb(user_id.to_string());
        }
    }

    async fn report(&self, err: RoomError) {
        error!(error = %err, "Room operation failed");
        if let Some(cb) = self.callbacks.on_error.read().await.as_ref() {
            cb(&err);
        }
    }
}
