//! Session Client
//!
//! Joins a call over a [`SignalingChannel`](crate::signaling::SignalingChannel)
//! and a [`PeerConnection`]. Participants publish the local camera and
//! negotiate with an SDP offer; spectators only receive a pull-stream URL.
//!
//! All signaling and peer callbacks are handled on one dispatch task per
//! session. Termination behaviour is injected through [`TerminationPolicy`].

pub mod moderated;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rtc_common::{SessionDescription, SignalMessage, TerminationSignal};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceError, DeviceManager, FacingMode};
use crate::media::MediaStream;
use crate::peer::{
    ConnectionState, IceServerConfig, PeerConnection, PeerConnector, PeerError, PeerEvent,
};
use crate::signaling::{ChannelEvent, ChannelHandle, SignalConnector, SignalSender, SignalingError};

pub use moderated::{
    CallEntitlement, Clock, ModeratedSessionClient, ModerationConfig, ModerationPolicy,
    Navigator, TokioClock,
};

/// Session lifecycle. Transitions only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Signaled,
    Negotiating,
    Active,
    Closed,
}

/// Session errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
    #[error("Timed out waiting for {0}")]
    HandshakeTimeout(&'static str),
    #[error("Session closed")]
    Closed,
    #[error("Not entitled to join this call")]
    NotEntitled,
    #[error("Entitlement check failed: {0}")]
    Entitlement(String),
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fully qualified ws(s) URL of the signaling endpoint.
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Bound on waiting for the socket to open or the spectator URL.
    pub handshake_timeout: Duration,
}

impl SessionConfig {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ice_servers: vec![IceServerConfig::default()],
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<DeviceManager>,
    pub signaling: Arc<dyn SignalConnector>,
    pub peers: Arc<dyn PeerConnector>,
}

/// Hook run around the session's own teardown when the server ends the call.
#[async_trait]
pub trait TerminationPolicy: Send + Sync {
    /// Runs before the session releases media, peer and socket.
    async fn before_close(&self, _signal: &TerminationSignal) {}

    /// Runs once teardown has finished.
    async fn after_close(&self, _signal: &TerminationSignal) {}
}

/// Plain termination: notify, then close.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloseOnTermination;

impl TerminationPolicy for CloseOnTermination {}

type RemoteStreamCallback = Box<dyn Fn(MediaStream, String) + Send + Sync>;
type TerminationCallback = Box<dyn Fn(TerminationSignal) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&SessionError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_remote_stream: RwLock<Option<RemoteStreamCallback>>,
    on_termination: RwLock<Option<TerminationCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
}

struct Link {
    sender: SignalSender,
    handle: ChannelHandle,
}

struct Inner {
    state: SessionState,
    is_spectator: bool,
    link: Option<Link>,
    peer: Option<Arc<dyn PeerConnection>>,
    owns_media: bool,
    local_offer: Option<SessionDescription>,
    joined_tx: Option<oneshot::Sender<()>>,
    spectator_tx: Option<oneshot::Sender<String>>,
}

impl Inner {
    /// Move forward to `next`; earlier states are ignored.
    fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if next > self.state {
            debug!(from = ?self.state, to = ?next, "Session state change");
            self.state = next;
        }
        Ok(())
    }
}

struct Shared {
    room_id: String,
    user_id: String,
    config: SessionConfig,
    deps: SessionDeps,
    policy: Arc<dyn TerminationPolicy>,
    inner: Mutex<Inner>,
    callbacks: Callbacks,
    /// Wakes the dispatch task once the session closes.
    shutdown: Notify,
}

/// Signaling + peer negotiation for one room.
#[derive(Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

impl SessionClient {
    /// Create a session that simply closes on server termination.
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Self {
        Self::with_policy(room_id, user_id, config, deps, Arc::new(CloseOnTermination))
    }

    /// Create a session with an injected termination policy.
    pub fn with_policy(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        config: SessionConfig,
        deps: SessionDeps,
        policy: Arc<dyn TerminationPolicy>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                room_id: room_id.into(),
                user_id: user_id.into(),
                config,
                deps,
                policy,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    is_spectator: false,
                    link: None,
                    peer: None,
                    owns_media: false,
                    local_offer: None,
                    joined_tx: None,
                    spectator_tx: None,
                }),
                callbacks: Callbacks::default(),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    /// Set remote stream callback; receives the stream and its stream id.
    pub async fn set_on_remote_stream<F>(&self, callback: F)
    where
        F: Fn(MediaStream, String) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_remote_stream.write().await = Some(Box::new(callback));
    }

    /// Set termination callback
    pub async fn set_on_termination<F>(&self, callback: F)
    where
        F: Fn(TerminationSignal) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_termination.write().await = Some(Box::new(callback));
    }

    /// Set callback for non-fatal mid-call errors
    pub async fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&SessionError) + Send + Sync + 'static,
    {
        *self.shared.callbacks.on_error.write().await = Some(Box::new(callback));
    }

    /// Join as a publishing participant.
    ///
    /// Acquires the front camera, opens signaling, announces `JOIN_ROOM` once
    /// the socket is open, then sends an `OFFER` after the local description
    /// is set. Resolves when the offer is sent; the `ANSWER` activates the
    /// session asynchronously.
    #[tracing::instrument(skip(self), fields(room_id = %self.shared.room_id))]
    pub async fn join_as_participant(&self) -> Result<(), SessionError> {
        self.shared.begin("join as participant", false).await?;
        let result = self.shared.clone().participant_flow().await;
        if let Err(e) = &result {
            if *e != SessionError::Closed {
                error!(error = %e, "Failed to join as participant");
                self.shared.teardown().await;
            }
        }
        result
    }

    /// Join read-only and resolve with the pull-stream URL.
    ///
    /// Never acquires local media and never creates a peer connection.
    #[tracing::instrument(skip(self), fields(room_id = %self.shared.room_id))]
    pub async fn join_as_spectator(&self) -> Result<String, SessionError> {
        self.shared.begin("join as spectator", true).await?;
        let result = self.shared.clone().spectator_flow().await;
        if let Err(e) = &result {
            if *e != SessionError::Closed {
                error!(error = %e, "Failed to join as spectator");
                self.shared.teardown().await;
            }
        }
        result
    }

    /// Run the termination sequence as if `TERMINATE_CALL` had arrived.
    pub async fn handle_termination(&self, signal: TerminationSignal) {
        self.shared.handle_termination(signal).await;
    }

    /// Stop local media, close the peer connection and the signaling channel.
    /// Safe to call any number of times.
    pub async fn close(&self) {
        self.shared.teardown().await;
    }
}

impl Shared {
    async fn begin(&self, operation: &'static str, spectator: bool) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                state: inner.state,
                operation,
            });
        }
        inner.is_spectator = spectator;
        inner.advance(SessionState::Connecting)
    }

    async fn participant_flow(self: Arc<Self>) -> Result<(), SessionError> {
        let stream = self.deps.devices.start_camera(FacingMode::User).await?;
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                drop(inner);
                self.deps.devices.stop_camera().await;
                return Err(SessionError::Closed);
            }
            inner.owns_media = true;
        }

        let channel = self.deps.signaling.connect(&self.config.signaling_url).await?;
        let (sender, events, handle) = channel.split();

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = self
            .deps
            .peers
            .create(&self.config.ice_servers, peer_tx)
            .await?;
        for track in stream.tracks() {
            peer.add_track(track, stream.id()).await?;
        }

        let (joined_tx, joined_rx) = oneshot::channel();
        self.install(
            Link {
                sender: sender.clone(),
                handle,
            },
            Some(peer.clone()),
            Some(joined_tx),
            None,
        )
        .await?;
        tokio::spawn(dispatch(self.clone(), events, Some(peer_rx)));

        match timeout(self.config.handshake_timeout, joined_rx).await {
            Err(_) => return Err(SessionError::HandshakeTimeout("signaling channel to open")),
            Ok(Err(_)) => return Err(SessionError::Closed),
            Ok(Ok(())) => {}
        }

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        let local = peer.local_description().await.unwrap_or(offer);
        {
            let mut inner = self.inner.lock().await;
            inner.advance(SessionState::Negotiating)?;
            inner.local_offer = Some(local.clone());
        }

        sender
            .send(SignalMessage::Offer {
                sdp: local,
                room_id: self.room_id.clone(),
                user_id: self.user_id.clone(),
            })
            .await?;
        info!("Offer sent, waiting for answer");
        Ok(())
    }

    async fn spectator_flow(self: Arc<Self>) -> Result<String, SessionError> {
        let channel = self.deps.signaling.connect(&self.config.signaling_url).await?;
        let (sender, events, handle) = channel.split();

        let (url_tx, url_rx) = oneshot::channel();
        self.install(Link { sender, handle }, None, None, Some(url_tx))
            .await?;
        tokio::spawn(dispatch(self.clone(), events, None));

        match timeout(self.config.handshake_timeout, url_rx).await {
            Err(_) => Err(SessionError::HandshakeTimeout("spectator stream URL")),
            Ok(Err(_)) => Err(SessionError::Closed),
            Ok(Ok(url)) => {
                info!("Spectator stream URL received");
                Ok(url)
            }
        }
    }

    /// Store the live resources, or release them if the session closed meanwhile.
    async fn install(
        &self,
        mut link: Link,
        peer: Option<Arc<dyn PeerConnection>>,
        joined_tx: Option<oneshot::Sender<()>>,
        spectator_tx: Option<oneshot::Sender<String>>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            drop(inner);
            if let Some(peer) = peer {
                let _ = peer.close().await;
            }
            link.handle.close().await;
            return Err(SessionError::Closed);
        }
        inner.link = Some(link);
        inner.peer = peer;
        inner.joined_tx = joined_tx;
        inner.spectator_tx = spectator_tx;
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == SessionState::Closed
    }

    async fn report(&self, err: SessionError) {
        error!(error = %err, "Session error");
        if let Some(cb) = self.callbacks.on_error.read().await.as_ref() {
            cb(&err);
        }
    }

    async fn on_opened(&self) {
        let (sender, join, resend) = {
            let inner = self.inner.lock().await;
            let Some(link) = inner.link.as_ref() else {
                return;
            };
            if inner.state == SessionState::Closed {
                return;
            }
            let join = SignalMessage::JoinRoom {
                room_id: self.room_id.clone(),
                user_id: self.user_id.clone(),
                is_spectator: inner.is_spectator,
            };
            (link.sender.clone(), join, inner.local_offer.clone())
        };

        if let Err(e) = sender.send(join).await {
            self.report(e.into()).await;
            return;
        }
        info!("JOIN_ROOM sent");

        {
            let mut inner = self.inner.lock().await;
            if inner.advance(SessionState::Signaled).is_err() {
                return;
            }
            if let Some(tx) = inner.joined_tx.take() {
                let _ = tx.send(());
            }
        }

        // Re-opened after a drop: the server has lost our offer.
        if let Some(sdp) = resend {
            info!("Re-sending offer after reconnect");
            let offer = SignalMessage::Offer {
                sdp,
                room_id: self.room_id.clone(),
                user_id: self.user_id.clone(),
            };
            if let Err(e) = sender.send(offer).await {
                self.report(e.into()).await;
            }
        }
    }

    async fn on_signal(&self, message: SignalMessage) -> ControlFlow<()> {
        match message {
            SignalMessage::Answer { sdp } => {
                let Some(peer) = self.inner.lock().await.peer.clone() else {
                    debug!("Ignoring answer without a peer connection");
                    return ControlFlow::Continue(());
                };
                match peer.set_remote_description(sdp).await {
                    Ok(()) => {
                        if self
                            .inner
                            .lock()
                            .await
                            .advance(SessionState::Active)
                            .is_ok()
                        {
                            info!("Answer applied, session active");
                        }
                    }
                    Err(e) => self.report(e.into()).await,
                }
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                let Some(peer) = self.inner.lock().await.peer.clone() else {
                    debug!("Ignoring ICE candidate without a peer connection");
                    return ControlFlow::Continue(());
                };
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    self.report(e.into()).await;
                }
            }
            SignalMessage::SpectatorUrl { stream_url } => {
                let mut inner = self.inner.lock().await;
                match inner.spectator_tx.take() {
                    Some(tx) => {
                        if inner.advance(SessionState::Active).is_ok() {
                            let _ = tx.send(stream_url);
                        }
                    }
                    None => debug!("Ignoring unsolicited spectator URL"),
                }
            }
            SignalMessage::TerminateCall {
                reason,
                redirect_url,
            } => {
                self.handle_termination(TerminationSignal {
                    reason,
                    redirect_url,
                })
                .await;
                return ControlFlow::Break(());
            }
            other @ (SignalMessage::JoinRoom { .. } | SignalMessage::Offer { .. }) => {
                warn!(kind = other.kind(), "Ignoring client-bound message from server");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let Some(sender) = self
                    .inner
                    .lock()
                    .await
                    .link
                    .as_ref()
                    .map(|l| l.sender.clone())
                else {
                    return;
                };
                let message = SignalMessage::IceCandidate {
                    candidate,
                    room_id: Some(self.room_id.clone()),
                    user_id: Some(self.user_id.clone()),
                };
                if let Err(e) = sender.send(message).await {
                    self.report(e.into()).await;
                }
            }
            PeerEvent::RemoteTrack { stream_id, stream } => {
                info!(stream_id = %stream_id, "Remote stream received");
                if let Some(cb) = self.callbacks.on_remote_stream.read().await.as_ref() {
                    cb(stream, stream_id);
                }
            }
            PeerEvent::StateChanged(ConnectionState::Failed) => {
                self.report(PeerError::IceError("peer connection failed".to_string()).into())
                    .await;
            }
            PeerEvent::StateChanged(state) => debug!(?state, "Peer state changed"),
        }
    }

    async fn on_link_lost(&self) {
        if self.is_closed().await {
            return;
        }
        self.report(SignalingError::Closed.into()).await;
        self.teardown().await;
    }

    async fn handle_termination(&self, signal: TerminationSignal) {
        warn!(
            reason = %signal.reason,
            redirect_url = %signal.redirect_url,
            "Call terminated by server"
        );
        self.policy.before_close(&signal).await;
        if let Some(cb) = self.callbacks.on_termination.read().await.as_ref() {
            cb(signal.clone());
        }
        self.teardown().await;
        self.policy.after_close(&signal).await;
    }

    /// Release everything. Returns false if the session was already closed.
    async fn teardown(&self) -> bool {
        let (link, peer, owns_media) = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Closed {
                debug!("Session already closed");
                return false;
            }
            inner.state = SessionState::Closed;
            self.shutdown.notify_one();
            inner.joined_tx = None;
            inner.spectator_tx = None;
            inner.local_offer = None;
            (
                inner.link.take(),
                inner.peer.take(),
                std::mem::take(&mut inner.owns_media),
            )
        };

        if owns_media {
            self.deps.devices.stop_camera().await;
        }
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                warn!(error = %e, "Failed to close peer connection");
            }
        }
        if let Some(mut link) = link {
            link.handle.close().await;
        }
        info!(room_id = %self.room_id, "Session closed");
        true
    }
}

async fn next_peer_event(
    rx: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>,
) -> Option<PeerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Single consumer of signaling and peer events for one session.
async fn dispatch(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<ChannelEvent>,
    mut peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Opened) => shared.on_opened().await,
                Some(ChannelEvent::Message(message)) => {
                    if shared.on_signal(message).await.is_break() {
                        break;
                    }
                }
                Some(ChannelEvent::Closed { will_reconnect: true }) => {
                    warn!("Signaling dropped, reconnecting");
                }
                Some(ChannelEvent::Closed { will_reconnect: false }) | None => {
                    shared.on_link_lost().await;
                    break;
                }
            },
            event = next_peer_event(&mut peer_events) => match event {
                Some(event) => shared.on_peer_event(event).await,
                None => peer_events = None,
            },
            () = shared.shutdown.notified() => break,
        }

        if shared.is_closed().await {
            break;
        }
    }
    debug!(room_id = %shared.room_id, "Session dispatch finished");
}
