use super::*;

use std::time::Duration;

use tokio::time::timeout;

use crate::media::SyntheticDevices;
use crate::models::{CallStatus, SessionDescription};
use crate::peer::LoopbackNetwork;
use crate::signaling::MemoryRelay;

const PATIENCE: Duration = Duration::from_secs(120);

struct World {
    relay: MemoryRelay,
    network: LoopbackNetwork,
}

struct Party {
    session: CallSession,
    notices: mpsc::UnboundedReceiver<CallNotice>,
    devices: SyntheticDevices,
}

impl World {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    fn party(&self, id: &str) -> Party {
        self.party_with(id, CallConfig::default())
    }

    fn party_with(&self, id: &str, config: CallConfig) -> Party {
        let devices = SyntheticDevices::new(id);
        let (session, notices) = CallSession::new(
            id,
            config,
            Arc::new(self.relay.clone()),
            Arc::new(devices.clone()),
            Arc::new(self.network.clone()),
        )
        .unwrap();
        Party {
            session,
            notices,
            devices,
        }
    }

    fn signaling(&self) -> CallSignaling {
        CallSignaling::new(Arc::new(self.relay.clone()))
    }

    fn removals_of(&self, call_id: &str) -> usize {
        let path = CallSignaling::call_path(call_id);
        self.relay.removals().iter().filter(|p| **p == path).count()
    }
}

impl Party {
    async fn until<F>(&self, predicate: F) -> CallSnapshot
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        timeout(PATIENCE, self.session.wait_for(predicate))
            .await
            .expect("state not reached")
            .unwrap()
    }

    async fn notice<F>(&mut self, mut matches: F) -> CallNotice
    where
        F: FnMut(&CallNotice) -> bool,
    {
        let notices = &mut self.notices;
        timeout(PATIENCE, async move {
            while let Some(notice) = notices.recv().await {
                if matches(&notice) {
                    return notice;
                }
            }
            panic!("notice stream closed");
        })
        .await
        .expect("notice not received")
    }

    async fn incoming(&mut self) -> CallRecord {
        match self.notice(|n| matches!(n, CallNotice::IncomingCall(_))).await {
            CallNotice::IncomingCall(record) => record,
            other => panic!("unexpected notice {:?}", other),
        }
    }

    fn drain(&mut self) -> Vec<CallNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn local_stream(&self) -> MediaStream {
        self.session.snapshot().local_stream.expect("no local stream")
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn connected_with_media(expected_tracks: usize) -> impl FnMut(&CallSnapshot) -> bool {
    move |s: &CallSnapshot| {
        s.phase == SessionPhase::Connected
            && s.remote_stream
                .as_ref()
                .map(|r| r.tracks().len() == expected_tracks)
                .unwrap_or(false)
    }
}

/// Alice calls Bob, Bob answers, both sides end up connected.
async fn connect(world: &World, alice: &mut Party, bob: &mut Party, video: bool) -> String {
    let call_id = alice.session.start_call("bob", video).await.unwrap();
    let record = bob.incoming().await;
    assert_eq!(record.id, call_id);
    bob.session.answer_call(&record).await.unwrap();

    let tracks = if video { 2 } else { 1 };
    alice.until(connected_with_media(tracks)).await;
    bob.until(connected_with_media(tracks)).await;
    assert!(world.relay.get(&CallSignaling::call_path(&call_id)).is_some());
    call_id
}

#[test]
fn test_transition_table() {
    use SessionEvent as E;
    use SessionPhase as P;

    assert_eq!(transition(P::Idle, E::StartCall).unwrap(), P::AcquiringMedia);
    assert_eq!(transition(P::Ended, E::AnswerCall).unwrap(), P::AcquiringMedia);
    assert_eq!(
        transition(P::AcquiringMedia, E::MediaAcquired(Role::Caller)).unwrap(),
        P::CreatingOffer
    );
    assert_eq!(
        transition(P::AcquiringMedia, E::MediaAcquired(Role::Callee)).unwrap(),
        P::CreatingAnswer
    );
    assert_eq!(transition(P::AwaitingAnswer, E::RemoteRejected).unwrap(), P::Ended);
    assert_eq!(transition(P::Connected, E::TransportConnected).unwrap(), P::Connected);
    for phase in [P::Idle, P::Connecting, P::Connected, P::Ended] {
        assert_eq!(transition(phase, E::EndCall).unwrap(), P::Ended);
    }

    assert!(matches!(
        transition(P::Connected, E::StartCall),
        Err(CallError::InvalidTransition { .. })
    ));
    assert!(transition(P::Idle, E::RemoteAnswerApplied).is_err());
    assert!(transition(P::CreatingOffer, E::TransportConnected).is_err());
}

#[test]
fn test_call_id_format() {
    let id = generate_call_id();
    let parts: Vec<&str> = id.split('_').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "call");
    assert!(parts[1].parse::<i64>().is_ok());
    assert_eq!(parts[2].len(), 9);
    assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
}

#[tokio::test(start_paused = true)]
async fn test_audio_call_connects_both_sides() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    let record = bob.incoming().await;
    assert_eq!(record.id, call_id);
    assert_eq!(record.caller_id, "alice");
    assert_eq!(record.call_type, CallType::Audio);

    let stored = world.relay.get(&CallSignaling::call_path(&call_id)).unwrap();
    assert_eq!(stored["type"], "audio");
    assert_eq!(stored["status"], "ringing");
    assert_eq!(stored["offer"]["type"], "offer");

    let local = alice.local_stream();
    assert_eq!(local.audio_tracks().count(), 1);
    assert_eq!(local.video_tracks().count(), 0);

    bob.session.answer_call(&record).await.unwrap();
    let a = alice.until(connected_with_media(1)).await;
    let b = bob.until(connected_with_media(1)).await;

    assert!(a.is_call_active);
    assert_eq!(a.call_status, "Connected");
    assert_eq!(a.role, Some(Role::Caller));
    assert_eq!(b.role, Some(Role::Callee));

    let stored = world.relay.get(&CallSignaling::call_path(&call_id)).unwrap();
    assert_eq!(stored["status"], "accepted");
    assert_eq!(stored["answer"]["type"], "answer");

    // Each side hears exactly the other side's microphone
    let bob_mic = b.local_stream.unwrap().tracks()[0].clone();
    let heard = a.remote_stream.unwrap();
    assert_eq!(heard.tracks().len(), 1);
    assert_eq!(heard.tracks()[0].id(), bob_mic.id());
    assert_eq!(heard.video_tracks().count(), 0);

    let notices = alice.drain();
    assert!(notices.contains(&CallNotice::CallInitiated {
        call_id: call_id.clone()
    }));
    assert!(notices.contains(&CallNotice::Connected { call_id }));
}

#[tokio::test(start_paused = true)]
async fn test_video_call_carries_video_both_ways() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");

    let call_id = connect(&world, &mut alice, &mut bob, true).await;
    let stored = world.relay.get(&CallSignaling::call_path(&call_id)).unwrap();
    assert_eq!(stored["type"], "video");

    let a = alice.session.snapshot();
    let b = bob.session.snapshot();
    assert_eq!(a.call_type, Some(CallType::Video));
    assert!(b.local_stream.unwrap().has_video());
    assert_eq!(a.remote_stream.unwrap().video_tracks().count(), 1);
    assert_eq!(b.remote_stream.unwrap().video_tracks().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duration_counts_while_connected() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;

    let snapshot = alice.until(|s| s.call_duration >= 3).await;
    assert_eq!(snapshot.formatted_duration(), "00:03");

    alice.session.end_call().await;
    assert_eq!(alice.session.snapshot().call_duration, 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_call_is_idempotent() {
    let world = World::new();
    let alice = world.party("alice");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    alice.until(|s| s.phase == SessionPhase::AwaitingAnswer).await;
    let local = alice.local_stream();
    let unsubscribed = world.relay.unsubscribe_count();

    alice.session.end_call().await;
    alice.session.end_call().await;
    alice.session.end_call().await;

    let snapshot = alice.session.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Ended);
    assert_eq!(snapshot.last_end, Some(EndReason::LocalHangup));
    assert!(snapshot.local_stream.is_none());
    assert!(local.tracks().iter().all(|t| t.stop_count() == 1));
    assert!(world.network.is_closed("alice"));
    assert_eq!(world.removals_of(&call_id), 1);
    // Call record and candidate subscriptions
    assert_eq!(world.relay.unsubscribe_count(), unsubscribed + 2);
    assert!(world.relay.get("calls").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hangup_ends_both_sides() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    let call_id = connect(&world, &mut alice, &mut bob, false).await;

    let alice_local = alice.local_stream();
    let bob_local = bob.local_stream();
    let bob_remote = bob.session.snapshot().remote_stream.unwrap();

    alice.session.end_call().await;
    let b = bob.until(|s| s.phase == SessionPhase::Ended).await;

    assert_eq!(b.last_end, Some(EndReason::RemoteHangup));
    assert!(!b.is_call_active);
    assert!(alice_local.tracks().iter().all(|t| t.stop_count() == 1));
    assert!(bob_local.tracks().iter().all(|t| t.stop_count() == 1));
    assert!(!bob_remote.is_live());
    assert!(world.relay.get(&CallSignaling::call_path(&call_id)).is_none());
    bob.notice(|n| *n == CallNotice::CallEnded(EndReason::RemoteHangup)).await;
}

#[tokio::test(start_paused = true)]
async fn test_second_call_rejected_while_busy() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    world.network.hold_connections(true);

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    let record = bob.incoming().await;
    bob.session.answer_call(&record).await.unwrap();
    alice.until(|s| s.phase == SessionPhase::Connecting).await;

    let err = alice.session.start_call("carol", false).await.unwrap_err();
    assert!(matches!(err, CallError::CallInProgress));
    let calls = world.relay.get("calls").unwrap();
    assert_eq!(calls.as_object().unwrap().len(), 1);
    assert!(calls.get(&call_id).is_some());

    world.network.hold_connections(false);
    world
        .network
        .emit("alice", PeerEvent::ConnectionState(PeerConnectionState::Connected));
    alice.until(|s| s.phase == SessionPhase::Connected).await;
    assert!(matches!(
        alice.session.start_call("carol", false).await,
        Err(CallError::CallInProgress)
    ));
    assert_eq!(world.network.transports_created("alice"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let world = World::new();
    let mut alice = world.party("alice");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    alice.until(|s| s.phase == SessionPhase::AwaitingAnswer).await;
    let local = alice.local_stream();
    let started = Instant::now();

    let snapshot = alice.until(|s| s.phase == SessionPhase::Ended).await;
    assert!(started.elapsed() >= Duration::from_secs(29));
    assert_eq!(snapshot.last_end, Some(EndReason::Timeout));
    assert!(!local.is_live());
    assert!(world.relay.get(&CallSignaling::call_path(&call_id)).is_none());

    alice.notice(|n| *n == CallNotice::CallTimeout).await;
    alice.notice(|n| *n == CallNotice::CallEnded(EndReason::Timeout)).await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_call_ends_caller() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    let record = bob.incoming().await;
    assert!(bob.session.snapshot().is_incoming_call);
    let local = alice.local_stream();

    bob.session.reject_call(&record).await.unwrap();
    assert!(!bob.session.snapshot().is_incoming_call);

    let a = alice.until(|s| s.phase == SessionPhase::Ended).await;
    assert_eq!(a.last_end, Some(EndReason::Rejected));
    assert!(!local.is_live());
    alice.notice(|n| *n == CallNotice::CallRejected).await;

    settle().await;
    assert!(world.relay.get(&CallSignaling::call_path(&call_id)).is_none());
    assert!(!bob.session.snapshot().is_incoming_call);
    assert_eq!(world.network.transports_created("bob"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_during_media_acquisition_releases_devices() {
    let world = World::new();
    let alice = world.party("alice");
    alice.devices.set_delay(Some(Duration::from_secs(5)));

    alice.session.start_call("bob", true).await.unwrap();
    assert_eq!(alice.session.snapshot().phase, SessionPhase::AcquiringMedia);
    assert_eq!(alice.session.snapshot().call_status, "Getting media...");
    alice.session.end_call().await;
    assert_eq!(alice.session.snapshot().phase, SessionPhase::Ended);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    let issued = alice.devices.issued();
    assert_eq!(issued.len(), 1);
    assert!(!issued[0].is_live());
    assert!(world.relay.get("calls").is_none());
    assert_eq!(world.network.transports_created("alice"), 0);
    assert_eq!(alice.session.snapshot().phase, SessionPhase::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_media_failure_ends_attempt() {
    let world = World::new();
    let mut alice = world.party("alice");
    alice.devices.fail_with(Some(MediaError::PermissionDenied));

    alice.session.start_call("bob", false).await.unwrap();
    let snapshot = alice.until(|s| s.phase == SessionPhase::Ended).await;

    assert_eq!(
        snapshot.last_end,
        Some(EndReason::Media(MediaError::PermissionDenied))
    );
    alice
        .notice(|n| *n == CallNotice::MediaFailed("Camera/microphone access denied".to_string()))
        .await;
    assert!(world.relay.get("calls").is_none());
    assert_eq!(world.network.transports_created("alice"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_relay_write_failure_ends_call() {
    let world = World::new();
    let mut alice = world.party("alice");
    world.relay.set_fail_writes(true);

    alice.session.start_call("bob", false).await.unwrap();
    let snapshot = alice.until(|s| s.phase == SessionPhase::Ended).await;

    assert!(matches!(snapshot.last_end, Some(EndReason::Signaling(_))));
    alice.notice(|n| matches!(n, CallNotice::CallFailed(_))).await;
    assert!(alice.devices.issued().iter().all(|s| !s.is_live()));
    assert!(world.network.is_closed("alice"));
    assert!(world.relay.get("calls").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stale_ringing_record_not_surfaced() {
    let world = World::new();
    let stale = CallRecord::ringing(
        "call_stale".to_string(),
        "alice".to_string(),
        "bob".to_string(),
        CallType::Audio,
        SessionDescription::offer("v=0"),
        now_millis() - 60_000,
        30_000,
    );
    world.signaling().write_call(&stale).await.unwrap();

    let mut bob = world.party("bob");
    settle().await;
    assert!(!bob.session.snapshot().is_incoming_call);
    assert!(bob.drain().is_empty());

    // A fresh invitation still gets through
    let mut alice = world.party("alice");
    let call_id = alice.session.start_call("bob", false).await.unwrap();
    assert_eq!(bob.incoming().await.id, call_id);
}

#[tokio::test(start_paused = true)]
async fn test_caller_withdraws_before_answer() {
    let world = World::new();
    let alice = world.party("alice");
    let mut bob = world.party("bob");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    bob.incoming().await;

    alice.session.end_call().await;
    bob.notice(|n| *n == CallNotice::MissedCall { call_id: call_id.clone() })
        .await;
    let b = bob.session.snapshot();
    assert!(!b.is_incoming_call);
    assert!(b.incoming_call_data.is_none());
    assert_eq!(b.phase, SessionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_caller_hangup_while_callee_gets_media() {
    let world = World::new();
    let alice = world.party("alice");
    let mut bob = world.party("bob");
    bob.devices.set_delay(Some(Duration::from_secs(5)));

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    let record = bob.incoming().await;
    bob.session.answer_call(&record).await.unwrap();
    assert_eq!(bob.session.snapshot().phase, SessionPhase::AcquiringMedia);

    alice.session.end_call().await;
    assert!(world.relay.get(&CallSignaling::call_path(&call_id)).is_none());

    let b = bob.until(|s| s.phase == SessionPhase::Ended).await;
    assert_eq!(b.last_end, Some(EndReason::RemoteHangup));
    assert!(b.local_stream.is_none());
    bob.notice(|n| *n == CallNotice::CallEnded(EndReason::RemoteHangup))
        .await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;

    // Nothing was written back under the removed record
    assert!(world.relay.get("calls").is_none());
    assert!(bob.devices.issued().iter().all(|s| !s.is_live()));
    assert!(world.network.is_closed("bob"));
    assert_eq!(bob.session.snapshot().phase, SessionPhase::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_reject_after_caller_withdraws_writes_nothing() {
    let world = World::new();
    let alice = world.party("alice");
    let mut bob = world.party("bob");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    let record = bob.incoming().await;

    alice.session.end_call().await;
    bob.session.reject_call(&record).await.unwrap();
    settle().await;

    assert!(world.relay.get(&CallSignaling::call_path(&call_id)).is_none());
    assert!(world.relay.get("calls").is_none());

    let notices = bob.drain();
    assert!(notices.contains(&CallNotice::MissedCall { call_id }));
    assert!(!notices
        .iter()
        .any(|n| matches!(n, CallNotice::IncomingRejected { .. })));
    assert!(!bob.session.snapshot().is_incoming_call);
}

#[tokio::test(start_paused = true)]
async fn test_connection_failure_ends_after_grace() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;

    let started = Instant::now();
    world
        .network
        .emit("bob", PeerEvent::ConnectionState(PeerConnectionState::Failed));
    bob.notice(|n| *n == CallNotice::ConnectionFailed).await;

    let b = bob.until(|s| s.phase == SessionPhase::Ended).await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(b.last_end, Some(EndReason::TransportFailed));

    let a = alice.until(|s| s.phase == SessionPhase::Ended).await;
    assert_eq!(a.last_end, Some(EndReason::RemoteHangup));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_recovers_within_grace() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;

    world
        .network
        .emit("alice", PeerEvent::ConnectionState(PeerConnectionState::Disconnected));
    alice.until(|s| s.call_status == "Reconnecting...").await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    world
        .network
        .emit("alice", PeerEvent::ConnectionState(PeerConnectionState::Connected));
    alice.until(|s| s.call_status == "Connected").await;

    tokio::time::sleep(Duration::from_secs(15)).await;
    settle().await;
    assert_eq!(alice.session.snapshot().phase, SessionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_recovery_ends_call() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;

    world
        .network
        .emit("alice", PeerEvent::ConnectionState(PeerConnectionState::Disconnected));
    let started = Instant::now();
    let a = alice.until(|s| s.phase == SessionPhase::Ended).await;

    assert!(started.elapsed() >= Duration::from_secs(9));
    assert_eq!(a.last_end, Some(EndReason::TransportFailed));
}

#[tokio::test(start_paused = true)]
async fn test_transport_closed_ends_call() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;

    world
        .network
        .emit("bob", PeerEvent::ConnectionState(PeerConnectionState::Closed));
    let b = bob.until(|s| s.phase == SessionPhase::Ended).await;
    assert_eq!(b.last_end, Some(EndReason::TransportFailed));
}

#[tokio::test(start_paused = true)]
async fn test_call_collision_greater_identity_yields() {
    let world = World::new();
    let alice = world.party("alice");
    let mut bob = world.party("bob");
    // Both attempts exist before either record reaches the relay
    alice.devices.set_delay(Some(Duration::from_secs(1)));
    bob.devices.set_delay(Some(Duration::from_secs(1)));

    let alice_call = alice.session.start_call("bob", false).await.unwrap();
    let bob_call = bob.session.start_call("alice", false).await.unwrap();
    assert_eq!(bob.session.snapshot().phase, SessionPhase::AcquiringMedia);

    let b = bob.until(|s| s.is_incoming_call).await;
    assert_eq!(b.last_end, Some(EndReason::Collision));
    assert_eq!(b.incoming_call_data.as_ref().map(|r| r.id.as_str()), Some(alice_call.as_str()));

    settle().await;
    let a = alice.session.snapshot();
    assert_eq!(a.phase, SessionPhase::AwaitingAnswer);
    assert!(!a.is_incoming_call);
    assert!(world.relay.get(&CallSignaling::call_path(&bob_call)).is_none());

    let record = b.incoming_call_data.unwrap();
    bob.session.answer_call(&record).await.unwrap();
    alice.until(connected_with_media(1)).await;
    bob.until(connected_with_media(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_incoming_prompt_auto_rejects() {
    let world = World::new();
    let config = CallConfig {
        ring_timeout: Duration::from_secs(60),
        ..CallConfig::default()
    };
    let alice = world.party_with("alice", config);
    let mut bob = world.party("bob");

    let call_id = alice.session.start_call("bob", false).await.unwrap();
    bob.incoming().await;
    let prompted = Instant::now();

    bob.notice(|n| *n == CallNotice::MissedCall { call_id: call_id.clone() })
        .await;
    assert!(prompted.elapsed() >= Duration::from_secs(29));
    assert!(!bob.session.snapshot().is_incoming_call);

    let a = alice.until(|s| s.phase == SessionPhase::Ended).await;
    assert_eq!(a.last_end, Some(EndReason::Rejected));
}

#[tokio::test(start_paused = true)]
async fn test_start_refused_while_prompt_shown() {
    let world = World::new();
    let alice = world.party("alice");
    let mut bob = world.party("bob");

    alice.session.start_call("bob", false).await.unwrap();
    bob.incoming().await;

    assert!(matches!(
        bob.session.start_call("carol", false).await,
        Err(CallError::IncomingCallPending)
    ));
    assert!(matches!(
        alice.session.start_call("alice", false).await,
        Err(CallError::CallInProgress)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_answer_requires_ringing_record() {
    let world = World::new();
    let bob = world.party("bob");

    let record = CallRecord::ringing(
        "call_1".to_string(),
        "alice".to_string(),
        "bob".to_string(),
        CallType::Audio,
        SessionDescription::offer("v=0"),
        now_millis(),
        30_000,
    );
    let err = bob
        .session
        .answer_call(&record.with_status(CallStatus::Ended))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidState(_)));

    let mut misaddressed = record.clone();
    misaddressed.receiver_id = "carol".to_string();
    assert!(bob.session.answer_call(&misaddressed).await.is_err());
    assert_eq!(bob.session.snapshot().phase, SessionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_mute_and_camera_toggles() {
    let world = World::new();
    let alice = world.party("alice");

    assert!(matches!(
        alice.session.toggle_audio().await,
        Err(CallError::InvalidState(_))
    ));

    alice.session.start_call("bob", true).await.unwrap();
    alice.until(|s| s.phase == SessionPhase::AwaitingAnswer).await;
    let local = alice.local_stream();

    assert!(!alice.session.toggle_audio().await.unwrap());
    assert!(local.audio_tracks().all(|t| !t.is_enabled()));
    assert!(!alice.session.snapshot().audio_enabled);

    assert!(!alice.session.set_video_enabled(false).await.unwrap());
    assert!(local.video_tracks().all(|t| !t.is_enabled()));
    assert!(!alice.session.snapshot().video_enabled);

    assert!(alice.session.set_audio_enabled(true).await.unwrap());
    assert!(alice.session.toggle_video().await.unwrap());
    let snapshot = alice.session.snapshot();
    assert!(snapshot.audio_enabled && snapshot.video_enabled);
}

#[tokio::test(start_paused = true)]
async fn test_page_hidden_ends_call() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;

    alice.session.page_hidden();
    let a = alice.until(|s| s.phase == SessionPhase::Ended).await;
    assert_eq!(a.last_end, Some(EndReason::PageHidden));
    bob.until(|s| s.phase == SessionPhase::Ended).await;
}

#[tokio::test(start_paused = true)]
async fn test_new_call_after_previous_ended() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");

    connect(&world, &mut alice, &mut bob, false).await;
    bob.session.end_call().await;
    alice.until(|s| s.phase == SessionPhase::Ended).await;

    connect(&world, &mut alice, &mut bob, false).await;
    assert_eq!(world.network.transports_created("alice"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_session() {
    let world = World::new();
    let mut alice = world.party("alice");
    let mut bob = world.party("bob");
    connect(&world, &mut alice, &mut bob, false).await;
    let local = alice.local_stream();

    alice.session.shutdown().await;
    assert!(!local.is_live());
    bob.until(|s| s.phase == SessionPhase::Ended).await;

    settle().await;
    assert!(matches!(
        alice.session.start_call("bob", false).await,
        Err(CallError::SessionClosed)
    ));
}
