//! Client Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;

use crate::device::CaptureConfig;
use crate::peer::IceServerConfig;
use crate::room::RoomConfig;
use crate::session::{ModerationConfig, SessionConfig};
use crate::signaling::{ReconnectPolicy, SignalingConfig};

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base http(s) URL of the API/SFU server
    pub server_url: String,

    /// Signaling websocket path (default: /api/rtc/signaling)
    pub signaling_path: String,

    /// Bearer token of the authenticated user (optional)
    pub api_token: Option<String>,

    /// WebRTC STUN server
    pub stun_server: String,

    /// WebRTC TURN server (optional)
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional)
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional)
    pub turn_credential: Option<String>,

    /// Requested capture width (default: 1280)
    pub capture_width: u32,

    /// Requested capture height (default: 720)
    pub capture_height: u32,

    /// JPEG quality for frame snapshots (default: 95)
    pub snapshot_quality: u8,

    /// Delay before the post-termination redirect in ms (default: 1000)
    pub redirect_delay_ms: u64,

    /// Timeout per handshake round trip in seconds (default: 10)
    pub handshake_timeout_secs: u64,

    /// Signaling ping interval in seconds, 0 disables (default: 15)
    pub heartbeat_interval_secs: u64,

    /// Signaling reconnect attempts (default: 0)
    pub reconnect_max_attempts: u32,
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let server_url = env::var("RTC_SERVER_URL").context("RTC_SERVER_URL must be set")?;
        Url::parse(&server_url).context("RTC_SERVER_URL is not a valid URL")?;

        Ok(Self {
            server_url,
            signaling_path: env::var("RTC_SIGNALING_PATH")
                .unwrap_or_else(|_| "/api/rtc/signaling".into()),
            api_token: env::var("RTC_API_TOKEN").ok(),
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".into()),
            turn_server: env::var("TURN_SERVER").ok(),
            turn_username: env::var("TURN_USERNAME").ok(),
            turn_credential: env::var("TURN_CREDENTIAL").ok(),
            capture_width: parsed("RTC_CAPTURE_WIDTH", 1280),
            capture_height: parsed("RTC_CAPTURE_HEIGHT", 720),
            snapshot_quality: parsed("RTC_SNAPSHOT_QUALITY", 95),
            redirect_delay_ms: parsed("RTC_REDIRECT_DELAY_MS", 1000),
            handshake_timeout_secs: parsed("RTC_HANDSHAKE_TIMEOUT_SECS", 10),
            heartbeat_interval_secs: parsed("RTC_HEARTBEAT_INTERVAL_SECS", 15),
            reconnect_max_attempts: parsed("RTC_RECONNECT_MAX_ATTEMPTS", 0),
        })
    }

    /// Create a default config for testing.
    pub fn default_for_test() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            signaling_path: "/api/rtc/signaling".into(),
            api_token: None,
            stun_server: "stun:stun.l.google.com:19302".into(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            capture_width: 1280,
            capture_height: 720,
            snapshot_quality: 95,
            redirect_delay_ms: 1000,
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            reconnect_max_attempts: 0,
        }
    }

    /// Websocket URL of the signaling endpoint, carrying the token if set.
    pub fn signaling_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.server_url).context("invalid server URL")?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|()| anyhow::anyhow!("cannot use {scheme} for {}", self.server_url))?;
        url.set_path(&self.signaling_path);
        if let Some(token) = &self.api_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }

    /// STUN server plus TURN when configured.
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = vec![IceServerConfig {
            urls: vec![self.stun_server.clone()],
            username: None,
            credential: None,
        }];

        if let Some(turn) = &self.turn_server {
            servers.push(IceServerConfig {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            width: self.capture_width,
            height: self.capture_height,
            snapshot_quality: self.snapshot_quality,
            ..CaptureConfig::default()
        }
    }

    pub fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect_max_attempts,
                ..ReconnectPolicy::DISABLED
            },
            heartbeat_interval: (self.heartbeat_interval_secs > 0)
                .then(|| Duration::from_secs(self.heartbeat_interval_secs)),
            ..SignalingConfig::default()
        }
    }

    pub fn session(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            signaling_url: self.signaling_url()?,
            ice_servers: self.ice_servers(),
            handshake_timeout: self.handshake_timeout(),
        })
    }

    pub const fn moderation(&self) -> ModerationConfig {
        ModerationConfig {
            redirect_delay: Duration::from_millis(self.redirect_delay_ms),
        }
    }

    pub const fn room(&self) -> RoomConfig {
        RoomConfig {
            handshake_timeout: self.handshake_timeout(),
        }
    }
}
