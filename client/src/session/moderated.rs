//! Moderated Session Client
//!
//! A [`SessionClient`] that obeys server-side termination of a private call:
//! blank the remote media, tell the user why, then leave for the redirect URL
//! after a short delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rtc_common::TerminationSignal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    SessionClient, SessionConfig, SessionDeps, SessionError, SessionState, TerminationPolicy,
};
use crate::media::{AudioSink, RenderTarget};

/// Host navigation surface.
pub trait Navigator: Send + Sync {
    /// Leave the call UI for `url`.
    fn navigate(&self, url: &str);

    /// Show a blocking notice to the user.
    fn announce(&self, _message: &str) {}
}

/// Time source for the redirect delay.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Clock`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Billing gate consulted before a private call is joined.
#[async_trait]
pub trait CallEntitlement: Send + Sync {
    /// `Ok(false)` means the user may not join; `Err` means the check itself failed.
    async fn authorize(&self, room_id: &str, user_id: &str) -> Result<bool, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModerationConfig {
    /// Pause between the notice and the redirect.
    pub redirect_delay: Duration,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            redirect_delay: Duration::from_millis(1000),
        }
    }
}

/// Termination policy for moderated calls. Runs at most once.
pub struct ModerationPolicy {
    video: RwLock<Option<Arc<dyn RenderTarget>>>,
    audio: RwLock<Option<Arc<dyn AudioSink>>>,
    navigator: Arc<dyn Navigator>,
    clock: Arc<dyn Clock>,
    config: ModerationConfig,
    torn_down: AtomicBool,
    redirected: AtomicBool,
}

impl ModerationPolicy {
    pub fn new(
        navigator: Arc<dyn Navigator>,
        clock: Arc<dyn Clock>,
        config: ModerationConfig,
    ) -> Self {
        Self {
            video: RwLock::new(None),
            audio: RwLock::new(None),
            navigator,
            clock,
            config,
            torn_down: AtomicBool::new(false),
            redirected: AtomicBool::new(false),
        }
    }

    /// Register the elements that play remote media.
    pub async fn attach_stream_elements(
        &self,
        video: Option<Arc<dyn RenderTarget>>,
        audio: Option<Arc<dyn AudioSink>>,
    ) {
        *self.video.write().await = video;
        *self.audio.write().await = audio;
    }

    /// Whether a termination has been handled.
    pub fn is_terminated(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn notice(signal: &TerminationSignal) -> String {
        format!(
            "Your private call has ended. Reason: {}.",
            signal.reason_text()
        )
    }
}

#[async_trait]
impl TerminationPolicy for ModerationPolicy {
    async fn before_close(&self, signal: &TerminationSignal) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Termination already handled");
            return;
        }
        warn!(reason = %signal.reason, "Private call terminated");

        if let Some(video) = self.video.read().await.as_ref() {
            video.set_source(None);
        }
        if let Some(audio) = self.audio.read().await.as_ref() {
            audio.set_source(None);
            audio.set_muted(true);
        }
    }

    async fn after_close(&self, signal: &TerminationSignal) {
        if self.redirected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.navigator.announce(&Self::notice(signal));
        self.clock.sleep(self.config.redirect_delay).await;
        info!(redirect_url = %signal.redirect_url, "Redirecting after termination");
        self.navigator.navigate(&signal.redirect_url);
    }
}

/// Session client for moderated private calls.
pub struct ModeratedSessionClient {
    session: SessionClient,
    policy: Arc<ModerationPolicy>,
    entitlement: Option<Arc<dyn CallEntitlement>>,
}

impl ModeratedSessionClient {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        config: SessionConfig,
        deps: SessionDeps,
        policy: Arc<ModerationPolicy>,
    ) -> Self {
        let session = SessionClient::with_policy(room_id, user_id, config, deps, policy.clone());
        Self {
            session,
            policy,
            entitlement: None,
        }
    }

    /// Require an entitlement check before joining.
    #[must_use]
    pub fn with_entitlement(mut self, entitlement: Arc<dyn CallEntitlement>) -> Self {
        self.entitlement = Some(entitlement);
        self
    }

    /// The underlying session, for callbacks and state.
    pub const fn session(&self) -> &SessionClient {
        &self.session
    }

    pub fn policy(&self) -> &ModerationPolicy {
        &self.policy
    }

    pub async fn attach_stream_elements(
        &self,
        video: Option<Arc<dyn RenderTarget>>,
        audio: Option<Arc<dyn AudioSink>>,
    ) {
        self.policy.attach_stream_elements(video, audio).await;
    }

    pub async fn join_as_participant(&self) -> Result<(), SessionError> {
        self.authorize().await?;
        self.session.join_as_participant().await
    }

    pub async fn join_as_spectator(&self) -> Result<String, SessionError> {
        self.authorize().await?;
        self.session.join_as_spectator().await
    }

    /// Run the moderated termination sequence directly.
    pub async fn handle_termination(&self, signal: TerminationSignal) {
        self.session.handle_termination(signal).await;
    }

    pub async fn state(&self) -> SessionState {
        self.session.state().await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    async fn authorize(&self) -> Result<(), SessionError> {
        let Some(entitlement) = &self.entitlement else {
            return Ok(());
        };
        match entitlement
            .authorize(self.session.room_id(), self.session.user_id())
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(room_id = %self.session.room_id(), "Call not entitled");
                Err(SessionError::NotEntitled)
            }
            Err(e) => Err(SessionError::Entitlement(e)),
        }
    }
}
