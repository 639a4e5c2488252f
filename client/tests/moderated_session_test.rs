//! Integration tests for moderated private calls: termination teardown,
//! redirect, and the entitlement gate.
//!
//! Run with: `cargo test --test moderated_session_test`

mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use helpers::{
    device_manager, next_signal, FakeAudioSink, FakeClock, FakeEntitlement, FakeMediaDevices,
    FakeNavigator, FakePeerConnector, FakeRenderTarget, FakeSignalConnector, ServerEnd,
};
use rtc_common::{MediaKind, SignalMessage, TerminationSignal};
use rtc_session::media::{AudioSink, MediaStream, MediaTrack, RenderTarget};
use rtc_session::session::{
    ModeratedSessionClient, ModerationConfig, ModerationPolicy, SessionConfig, SessionDeps,
    SessionError, SessionState,
};
use tokio::sync::mpsc;

struct Fixture {
    client: ModeratedSessionClient,
    devices: Arc<FakeMediaDevices>,
    signaling: Arc<FakeSignalConnector>,
    navigator: Arc<FakeNavigator>,
    clock: Arc<FakeClock>,
    video: Arc<FakeRenderTarget>,
    audio: Arc<FakeAudioSink>,
    ends: mpsc::UnboundedReceiver<ServerEnd>,
}

async fn fixture() -> Fixture {
    let devices = FakeMediaDevices::new();
    let (signaling, ends) = FakeSignalConnector::new(true);
    let navigator = FakeNavigator::new();
    let clock = FakeClock::new();
    let policy = Arc::new(ModerationPolicy::new(
        navigator.clone(),
        clock.clone(),
        ModerationConfig::default(),
    ));
    let deps = SessionDeps {
        devices: device_manager(&devices),
        signaling: signaling.clone(),
        peers: FakePeerConnector::new(),
    };
    let client = ModeratedSessionClient::new(
        "private-9",
        "fan-1",
        SessionConfig::new("ws://127.0.0.1:9/api/rtc/signaling"),
        deps,
        policy,
    );

    let video = FakeRenderTarget::new();
    let audio = FakeAudioSink::new();
    let remote = MediaStream::new(vec![
        MediaTrack::new(MediaKind::Video, "remote"),
        MediaTrack::new(MediaKind::Audio, "remote"),
    ]);
    video.set_source(Some(remote.clone()));
    audio.set_source(Some(remote));
    client
        .attach_stream_elements(
            Some(video.clone() as Arc<dyn RenderTarget>),
            Some(audio.clone() as Arc<dyn AudioSink>),
        )
        .await;

    Fixture {
        client,
        devices,
        signaling,
        navigator,
        clock,
        video,
        audio,
        ends,
    }
}

fn payment_expired() -> SignalMessage {
    SignalMessage::TerminateCall {
        reason: "PAYMENT_EXPIRED".into(),
        redirect_url: "/models".into(),
    }
}

#[tokio::test]
async fn termination_blanks_media_and_redirects() {
    let mut fx = fixture().await;
    fx.client.join_as_participant().await.unwrap();
    let server = fx.ends.recv().await.unwrap();

    server.push(payment_expired()).await;

    assert!(eventually!(fx.navigator.navigations().len() == 1));
    assert_eq!(fx.navigator.navigations(), vec!["/models".to_string()]);
    assert!(fx.video.source().is_none());
    assert!(fx.audio.source().is_none());
    assert!(fx.audio.is_muted());
    assert_eq!(fx.client.state().await, SessionState::Closed);
    assert_eq!(fx.devices.live_grants(), 0);
    assert!(fx.client.policy().is_terminated());
}

#[tokio::test]
async fn termination_announces_reason_and_waits_before_redirect() {
    let mut fx = fixture().await;
    fx.client.join_as_participant().await.unwrap();
    let server = fx.ends.recv().await.unwrap();

    server.push(payment_expired()).await;

    assert!(eventually!(fx.navigator.navigations().len() == 1));
    assert_eq!(
        *fx.navigator.notices.lock().unwrap(),
        vec!["Your private call has ended. Reason: PAYMENT EXPIRED.".to_string()]
    );
    assert_eq!(
        *fx.clock.sleeps.lock().unwrap(),
        vec![Duration::from_millis(1000)]
    );
}

#[tokio::test]
async fn duplicate_termination_navigates_once() {
    let mut fx = fixture().await;
    fx.client.join_as_participant().await.unwrap();
    let server = fx.ends.recv().await.unwrap();

    server.push(payment_expired()).await;
    assert!(eventually!(fx.navigator.navigations().len() == 1));

    fx.client
        .handle_termination(TerminationSignal::new("PAYMENT_EXPIRED", "/models"))
        .await;
    fx.client
        .handle_termination(TerminationSignal::new("HOST_LEFT", "/elsewhere"))
        .await;

    assert_eq!(fx.navigator.navigations(), vec!["/models".to_string()]);
    assert_eq!(fx.navigator.notices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn spectator_termination_also_redirects() {
    let mut fx = fixture().await;
    let joined = {
        let client = &fx.client;
        let ends = &mut fx.ends;
        let join = client.join_as_spectator();
        let server = async move {
            let mut server = ends.recv().await.unwrap();
            next_signal(&mut server.outgoing).await;
            server
                .push(SignalMessage::SpectatorUrl {
                    stream_url: "rtmp://cdn.example.com/live/private-9".into(),
                })
                .await;
            server
        };
        tokio::join!(join, server)
    };
    let (url, server) = joined;
    assert_eq!(url.unwrap(), "rtmp://cdn.example.com/live/private-9");

    server.push(payment_expired()).await;

    assert!(eventually!(fx.navigator.navigations().len() == 1));
    assert!(fx.audio.is_muted());
    assert_eq!(fx.devices.request_count(), 0);
}

#[tokio::test]
async fn unentitled_user_is_rejected_before_any_io() {
    let fx = fixture().await;
    let entitlement = FakeEntitlement::new(false);
    let client = fx.client.with_entitlement(entitlement.clone());

    let err = client.join_as_participant().await.unwrap_err();

    assert_eq!(err, SessionError::NotEntitled);
    assert_eq!(entitlement.checks.load(Ordering::SeqCst), 1);
    assert_eq!(fx.devices.request_count(), 0);
    assert_eq!(fx.signaling.connects.load(Ordering::SeqCst), 0);
    assert_eq!(client.state().await, SessionState::Idle);
}

#[tokio::test]
async fn entitled_user_joins() {
    let mut fx = fixture().await;
    let client = fx.client.with_entitlement(FakeEntitlement::new(true));

    client.join_as_participant().await.unwrap();
    let mut server = fx.ends.recv().await.unwrap();
    assert!(matches!(
        next_signal(&mut server.outgoing).await,
        SignalMessage::JoinRoom { .. }
    ));
    client.close().await;
    assert!(fx.navigator.navigations().is_empty());
}
