//! Signaling Channel
//!
//! Persistent duplex connection carrying [`SignalMessage`]s. Frames are decoded
//! once at this boundary; the rest of the crate only sees typed messages and
//! [`ChannelEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rtc_common::SignalMessage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Signaling errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Signaling channel closed")]
    Closed,
}

/// Events delivered to the owner of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The socket is open; (re-)announce the session.
    Opened,
    /// A decoded message from the server.
    Message(SignalMessage),
    /// The socket dropped.
    Closed { will_reconnect: bool },
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Reconnection policy for a dropped socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after a drop; `0` disables reconnection.
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    pub const DISABLED: Self = Self {
        max_attempts: 0,
        max_backoff: Duration::from_secs(30),
    };

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        std::cmp::min(
            Duration::from_secs(2u64.pow(attempt.min(5))),
            self.max_backoff,
        )
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::DISABLED
    }
}

/// Channel tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingConfig {
    pub reconnect: ReconnectPolicy,
    /// Ping interval; a link silent for two intervals counts as dropped.
    pub heartbeat_interval: Option<Duration>,
    pub queue_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Some(Duration::from_secs(15)),
            queue_capacity: 100,
        }
    }
}

/// Cloneable handle for sending messages.
#[derive(Clone, Debug)]
pub struct SignalSender {
    tx: mpsc::Sender<SignalMessage>,
}

impl SignalSender {
    /// Queue a message; it is written once the socket is open.
    pub async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SignalingError::Closed)
    }
}

/// Owner-side control of a channel.
#[derive(Debug)]
pub struct ChannelHandle {
    status: Arc<RwLock<ConnectionStatus>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ChannelHandle {
    pub async fn status(&self) -> ConnectionStatus {
        *self.status.read().await
    }

    /// Close the channel. Repeated calls are no-ops.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// An open (or opening) signaling channel.
#[derive(Debug)]
pub struct SignalingChannel {
    sender: SignalSender,
    events: mpsc::Receiver<ChannelEvent>,
    handle: ChannelHandle,
}

impl SignalingChannel {
    /// Assemble a channel from raw queues, for in-process transports.
    pub fn from_parts(
        outgoing: mpsc::Sender<SignalMessage>,
        events: mpsc::Receiver<ChannelEvent>,
        shutdown: mpsc::Sender<()>,
    ) -> Self {
        Self {
            sender: SignalSender { tx: outgoing },
            events,
            handle: ChannelHandle {
                status: Arc::new(RwLock::new(ConnectionStatus::Connecting)),
                shutdown_tx: Some(shutdown),
            },
        }
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn split(self) -> (SignalSender, mpsc::Receiver<ChannelEvent>, ChannelHandle) {
        (self.sender, self.events, self.handle)
    }
}

/// Opens signaling channels.
#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalingChannel, SignalingError>;
}

/// WebSocket connector.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: SignalingConfig,
}

impl WsConnector {
    pub const fn new(config: SignalingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SignalingChannel, SignalingError> {
        let parsed =
            url::Url::parse(url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let (out_tx, out_rx) = mpsc::channel::<SignalMessage>(self.config.queue_capacity);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(self.config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let status = Arc::new(RwLock::new(ConnectionStatus::Connecting));

        tokio::spawn(connection_loop(
            url.to_string(),
            self.config,
            out_rx,
            event_tx,
            shutdown_rx,
            status.clone(),
        ));

        Ok(SignalingChannel {
            sender: SignalSender { tx: out_tx },
            events: event_rx,
            handle: ChannelHandle {
                status,
                shutdown_tx: Some(shutdown_tx),
            },
        })
    }
}

/// Why an open socket stopped being serviced.
enum LinkEnd {
    Dropped,
    Shutdown,
}

/// Main connection loop with reconnection logic.
async fn connection_loop(
    url: String,
    config: SignalingConfig,
    mut out_rx: mpsc::Receiver<SignalMessage>,
    event_tx: mpsc::Sender<ChannelEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
    status: Arc<RwLock<ConnectionStatus>>,
) {
    let mut attempt = 0u32;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            info!("Signaling shutdown requested");
            *status.write().await = ConnectionStatus::Disconnected;
            return;
        }

        info!("Connecting to signaling: {}", url.split('?').next().unwrap_or(&url));
        *status.write().await = if attempt > 0 {
            ConnectionStatus::Reconnecting { attempt }
        } else {
            ConnectionStatus::Connecting
        };

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Signaling connected");
                attempt = 0;
                *status.write().await = ConnectionStatus::Connected;
                if event_tx.send(ChannelEvent::Opened).await.is_err() {
                    return;
                }

                let end =
                    serve_link(ws_stream, &config, &mut out_rx, &event_tx, &mut shutdown_rx).await;
                if matches!(end, LinkEnd::Shutdown) {
                    *status.write().await = ConnectionStatus::Disconnected;
                    return;
                }
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
            }
        }

        *status.write().await = ConnectionStatus::Disconnected;

        attempt += 1;
        if attempt > config.reconnect.max_attempts {
            info!(attempts = attempt - 1, "Signaling closed, not reconnecting");
            let _ = event_tx
                .send(ChannelEvent::Closed {
                    will_reconnect: false,
                })
                .await;
            return;
        }
        let _ = event_tx
            .send(ChannelEvent::Closed {
                will_reconnect: true,
            })
            .await;

        let backoff = config.reconnect.backoff(attempt);
        info!("Reconnecting in {:?} (attempt {})", backoff, attempt);

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown during reconnect backoff");
                *status.write().await = ConnectionStatus::Disconnected;
                return;
            }
        }
    }
}

/// Pump one open socket until it drops or shutdown is requested.
async fn serve_link<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    config: &SignalingConfig,
    out_rx: &mut mpsc::Receiver<SignalMessage>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> LinkEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    let period = config.heartbeat_interval.unwrap_or(Duration::from_secs(3600));
    let mut heartbeat = interval_at(Instant::now() + period, period);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match SignalMessage::decode(text.as_str()) {
                            Ok(message) => {
                                debug!(kind = message.kind(), "Received signal");
                                if event_tx.send(ChannelEvent::Message(message)).await.is_err() {
                                    return LinkEnd::Shutdown;
                                }
                            }
                            Err(e) => warn!("Failed to parse signal: {} - {}", e, text.as_str()),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Server closed signaling connection");
                        return LinkEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        error!("Signaling socket error: {}", e);
                        return LinkEnd::Dropped;
                    }
                    None => {
                        info!("Signaling stream ended");
                        return LinkEnd::Dropped;
                    }
                    _ => {}
                }
            }

            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else {
                    info!("All signal senders dropped");
                    let _ = write.send(Message::Close(None)).await;
                    return LinkEnd::Shutdown;
                };
                match message.encode() {
                    Ok(json) => {
                        debug!(kind = message.kind(), "Sending signal");
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            error!("Failed to send signal: {}", e);
                            return LinkEnd::Dropped;
                        }
                    }
                    Err(e) => error!("Failed to encode signal: {}", e),
                }
            }

            _ = heartbeat.tick(), if config.heartbeat_interval.is_some() => {
                if last_seen.elapsed() > period * 2 {
                    warn!(
                        silent_for = ?last_seen.elapsed(),
                        "Signaling link silent, treating as dropped"
                    );
                    return LinkEnd::Dropped;
                }
                if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                    warn!("Failed to send heartbeat: {}", e);
                    return LinkEnd::Dropped;
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Shutdown received during connection");
                let _ = write.send(Message::Close(None)).await;
                return LinkEnd::Shutdown;
            }
        }
    }
}
