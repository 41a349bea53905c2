//! Media, offer/answer and transport handling for the live attempt.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    CallNotice, EndReason, Internal, Role, SessionActor, SessionEvent, SessionPhase, TimerKind,
};
use crate::media::{self, MediaError, MediaStream};
use crate::models::{now_millis, CallRecord, CallStatus, IceCandidate};
use crate::peer::{IceConnectionState, PeerConnectionManager, PeerConnectionState, PeerEvent};
use crate::signaling::{parse_call, parse_calls, parse_candidates};

impl SessionActor {
    pub(super) async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::MediaReady { attempt, result } => self.on_media_ready(attempt, result).await,
            Internal::CallUpdate { attempt, snapshot } => self.on_call_update(attempt, snapshot).await,
            Internal::Candidates { attempt, snapshot } => {
                if let Some(peer) = self.current(attempt).and_then(|a| a.peer.as_mut()) {
                    peer.apply_remote_candidates(parse_candidates(snapshot)).await;
                }
            }
            Internal::Peer { attempt, event } => self.on_peer_event(attempt, event).await,
            Internal::Timer { attempt, kind } => self.on_timer(attempt, kind).await,
            Internal::Tick { attempt } => {
                if self.current(attempt).is_some() && self.phase == SessionPhase::Connected {
                    self.publish();
                }
            }
            Internal::Incoming(snapshot) => {
                self.last_incoming = parse_calls(snapshot);
                self.evaluate_incoming().await;
            }
            Internal::AutoReject { call_id } => self.on_auto_reject(call_id).await,
            Internal::CooldownElapsed => self.evaluate_incoming().await,
        }
    }

    pub(super) fn acquire_media(&self, attempt: u64, is_video: bool) {
        let constraints = self.config.media_constraints(is_video);
        let devices = self.devices.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = media::acquire(devices.as_ref(), &constraints).await;
            if let Err(mpsc::error::SendError(Internal::MediaReady { result: Ok(stream), .. })) =
                tx.send(Internal::MediaReady { attempt, result })
            {
                // Session is gone; release the devices here
                stream.stop_all();
            }
        });
    }

    async fn on_media_ready(&mut self, id: u64, result: Result<MediaStream, MediaError>) {
        let live = self.phase == SessionPhase::AcquiringMedia && self.current(id).is_some();
        if !live {
            if let Ok(stream) = result {
                tracing::info!("Call ended during media setup, releasing devices");
                stream.stop_all();
            }
            return;
        }

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.notify(CallNotice::MediaFailed(e.user_message().to_string()));
                self.end_call(EndReason::Media(e)).await;
                return;
            }
        };

        let Some(attempt) = self.attempt.as_mut() else {
            stream.stop_all();
            return;
        };
        attempt.local_stream = Some(stream.clone());
        let role = attempt.role;
        let call_id = attempt.call_id.clone();
        let token = attempt.token.clone();
        let ending = attempt.ending.clone();

        if let Err(e) = self.advance(SessionEvent::MediaAcquired(role)) {
            tracing::error!("Call {}: {}", call_id, e);
            self.end_call(EndReason::Negotiation(e.to_string())).await;
            return;
        }

        let (transport, events) = match self.transports.create(&self.self_id, &self.config.ice_servers) {
            Ok(created) => created,
            Err(e) => {
                tracing::error!("Call {}: failed to create peer connection: {}", call_id, e);
                self.notify(CallNotice::CallFailed(e.to_string()));
                self.end_call(EndReason::Negotiation(e.to_string())).await;
                return;
            }
        };
        let peer = PeerConnectionManager::new(
            call_id.clone(),
            self.self_id.clone(),
            transport,
            self.signaling.clone(),
            ending,
        );
        peer.add_local_stream(&stream);
        self.forward_peer_events(id, events, token.clone());

        // Watch the record before anything is written under it
        let (call_handle, call_updates) = self.signaling.watch_call(&call_id).into_parts();
        self.forward_snapshots(call_updates, token.clone(), move |snapshot| Internal::CallUpdate {
            attempt: id,
            snapshot,
        });
        let (candidate_handle, candidate_updates) =
            self.signaling.watch_candidates(&call_id).into_parts();
        self.forward_snapshots(candidate_updates, token, move |snapshot| Internal::Candidates {
            attempt: id,
            snapshot,
        });

        if let Some(attempt) = self.attempt.as_mut() {
            attempt.peer = Some(peer);
            attempt.call_watch = Some(call_handle);
            attempt.candidate_watch = Some(candidate_handle);
        }

        match role {
            Role::Caller => self.publish_offer(id).await,
            Role::Callee => self.publish_answer(id).await,
        }
    }

    async fn publish_offer(&mut self, id: u64) {
        self.set_status("Creating offer...");
        self.publish();

        let Some(attempt) = self.current(id) else {
            return;
        };
        let call_id = attempt.call_id.clone();
        let call_type = attempt.call_type;
        let receiver_id = attempt.remote_id.clone();
        let Some(peer) = attempt.peer.as_ref() else {
            return;
        };

        let created = peer.create_offer(call_type.is_video()).await;
        let offer = match created {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!("Call {}: offer creation failed: {}", call_id, e);
                self.notify(CallNotice::CallFailed("Failed to start call".to_string()));
                self.end_call(EndReason::Negotiation(e.to_string())).await;
                return;
            }
        };

        let record = CallRecord::ringing(
            call_id.clone(),
            self.self_id.clone(),
            receiver_id,
            call_type,
            offer,
            now_millis(),
            self.config.ring_timeout_ms(),
        );
        if let Err(e) = self.signaling.write_call(&record).await {
            tracing::error!("Call {}: failed to save call: {}", call_id, e);
            self.notify(CallNotice::CallFailed("Failed to start call".to_string()));
            self.end_call(EndReason::Signaling(e.to_string())).await;
            return;
        }

        let Some(attempt) = self.current(id) else {
            return;
        };
        attempt.record_on_relay = true;
        let token = attempt.token.clone();

        if let Err(e) = self.advance(SessionEvent::OfferPublished) {
            tracing::error!("Call {}: {}", call_id, e);
            self.end_call(EndReason::Negotiation(e.to_string())).await;
            return;
        }

        self.schedule(
            token,
            self.config.ring_timeout,
            Internal::Timer {
                attempt: id,
                kind: TimerKind::RingTimeout,
            },
        );

        self.set_status("Calling...");
        self.notify(CallNotice::CallInitiated { call_id });
        self.publish();

        // The other party may have called us while we were setting up
        self.evaluate_incoming().await;
    }

    async fn publish_answer(&mut self, id: u64) {
        self.set_status("Setting up connection...");
        self.publish();

        let Some(attempt) = self.current(id) else {
            return;
        };
        let call_id = attempt.call_id.clone();
        let offer = attempt.incoming.as_ref().and_then(|r| r.offer.clone());
        let Some(peer) = attempt.peer.as_mut() else {
            return;
        };

        let accepted = peer.accept_offer(offer.as_ref()).await;
        let answer = match accepted {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!("Call {}: answer creation failed: {}", call_id, e);
                self.notify(CallNotice::CallFailed("Failed to answer call".to_string()));
                self.end_call(EndReason::Negotiation(e.to_string())).await;
                return;
            }
        };

        // Writing under a removed record would recreate it
        if !self.still_ringing(&call_id).await {
            tracing::info!("Call {} withdrawn before it could be answered", call_id);
            if let Some(attempt) = self.current(id) {
                attempt.record_on_relay = false;
            }
            self.end_call(EndReason::RemoteHangup).await;
            return;
        }
        if let Err(e) = self.signaling.write_answer(&call_id, &answer).await {
            tracing::error!("Call {}: failed to save answer: {}", call_id, e);
            self.notify(CallNotice::CallFailed("Failed to answer call".to_string()));
            self.end_call(EndReason::Signaling(e.to_string())).await;
            return;
        }
        if self.current(id).is_none() {
            return;
        }

        if let Err(e) = self.advance(SessionEvent::AnswerPublished) {
            tracing::error!("Call {}: {}", call_id, e);
            self.end_call(EndReason::Negotiation(e.to_string())).await;
            return;
        }

        tracing::info!("Call {} answered", call_id);
        self.set_status("Connecting...");
        self.notify(CallNotice::CallAnswered { call_id });
        self.publish();
    }

    async fn on_call_update(&mut self, id: u64, snapshot: Option<Value>) {
        let record = match parse_call(snapshot) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Ignoring malformed call update: {}", e);
                return;
            }
        };
        let phase = self.phase;
        let Some(attempt) = self.current(id) else {
            return;
        };

        let Some(record) = record else {
            if attempt.record_seen {
                tracing::info!("Call {} removed by remote party", attempt.call_id);
                self.end_call(EndReason::RemoteHangup).await;
            }
            return;
        };
        attempt.record_seen = true;
        tracing::debug!("Call {} update: {:?}", record.id, record.status);

        match (attempt.role, record.status) {
            (Role::Caller, CallStatus::Accepted) => {
                let Some(answer) = record.answer.as_ref() else {
                    return;
                };
                let Some(peer) = attempt.peer.as_mut() else {
                    return;
                };
                let applied = peer.apply_remote_answer(answer).await;
                match applied {
                    Ok(true) if phase == SessionPhase::AwaitingAnswer => {
                        if self.advance(SessionEvent::RemoteAnswerApplied).is_ok() {
                            self.set_status("Connecting...");
                            self.publish();
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Call {}: remote answer rejected: {}", record.id, e);
                    }
                }
            }
            (Role::Caller, CallStatus::Rejected) => {
                if self.advance(SessionEvent::RemoteRejected).is_ok() {
                    self.notify(CallNotice::CallRejected);
                    self.end_call(EndReason::Rejected).await;
                }
            }
            (_, CallStatus::Ended) => {
                self.end_call(EndReason::RemoteHangup).await;
            }
            _ => {}
        }
    }

    async fn on_peer_event(&mut self, id: u64, event: PeerEvent) {
        let Some(attempt) = self.current(id) else {
            return;
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => self.publish_candidate(id, candidate).await,
            PeerEvent::Track(track) => {
                tracing::info!("Remote {} track received on call {}", track.kind(), attempt.call_id);
                attempt
                    .remote_stream
                    .get_or_insert_with(|| MediaStream::new(Vec::new()))
                    .add_track(track);
                self.mark_connected(id);
            }
            PeerEvent::ConnectionState(state) => {
                tracing::info!("Call {} connection state: {}", attempt.call_id, state);
                attempt.connection = state;
                match state {
                    PeerConnectionState::Connected => self.mark_connected(id),
                    PeerConnectionState::Disconnected => self.mark_disconnected(id),
                    PeerConnectionState::Failed => {
                        self.mark_failed(id, TimerKind::ConnectionFailed, self.config.connection_failed_grace)
                    }
                    PeerConnectionState::Closed => self.end_call(EndReason::TransportFailed).await,
                    PeerConnectionState::New | PeerConnectionState::Connecting => {}
                }
            }
            PeerEvent::IceConnectionState(state) => {
                tracing::debug!("Call {} ICE state: {:?}", attempt.call_id, state);
                attempt.ice = state;
                match state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.mark_connected(id)
                    }
                    IceConnectionState::Disconnected => self.mark_disconnected(id),
                    IceConnectionState::Failed => {
                        self.mark_failed(id, TimerKind::IceFailed, self.config.ice_failed_grace)
                    }
                    _ => {}
                }
            }
        }
    }

    async fn publish_candidate(&mut self, id: u64, candidate: IceCandidate) {
        let Some(peer) = self.current(id).and_then(|a| a.peer.as_ref()) else {
            return;
        };
        let published = peer.publish_local_candidate(&candidate).await;
        if let Err(e) = published {
            tracing::error!("Failed to save ICE candidate: {}", e);
            self.notify(CallNotice::CallFailed("Connection setup failed".to_string()));
            self.end_call(EndReason::Signaling(e.to_string())).await;
        }
    }

    fn mark_connected(&mut self, id: u64) {
        let phase = self.phase;
        let Some(attempt) = self.current(id) else {
            return;
        };
        attempt.recovered();
        match phase {
            SessionPhase::Connecting => {
                attempt.duration.start(Instant::now());
                let call_id = attempt.call_id.clone();
                let token = attempt.token.clone();
                if self.advance(SessionEvent::TransportConnected).is_err() {
                    return;
                }
                self.start_ticker(id, token);
                self.set_status("Connected");
                self.notify(CallNotice::Connected { call_id });
                self.publish();
            }
            SessionPhase::Connected => {
                if self.status != "Connected" {
                    self.set_status("Connected");
                    self.publish();
                }
            }
            other => {
                tracing::debug!("Ignoring transport connect in {}", other);
            }
        }
    }

    fn mark_disconnected(&mut self, id: u64) {
        let Some(attempt) = self.current(id) else {
            return;
        };
        attempt.disconnect_epoch += 1;
        let epoch = attempt.disconnect_epoch;
        let token = attempt.token.clone();

        self.schedule(
            token,
            self.config.disconnected_grace,
            Internal::Timer {
                attempt: id,
                kind: TimerKind::Disconnected(epoch),
            },
        );
        self.set_status("Reconnecting...");
        self.notify(CallNotice::Reconnecting);
        self.publish();
    }

    fn mark_failed(&mut self, id: u64, kind: TimerKind, grace: Duration) {
        let Some(attempt) = self.current(id) else {
            return;
        };
        tracing::warn!("Call {} transport failed, waiting {:?}", attempt.call_id, grace);
        let token = attempt.token.clone();
        self.schedule(token, grace, Internal::Timer { attempt: id, kind });
        self.notify(CallNotice::ConnectionFailed);
    }

    async fn on_timer(&mut self, id: u64, kind: TimerKind) {
        let phase = self.phase;
        let Some(attempt) = self.current(id) else {
            return;
        };

        let expired = match kind {
            TimerKind::RingTimeout => phase == SessionPhase::AwaitingAnswer,
            TimerKind::ConnectionFailed => attempt.connection == PeerConnectionState::Failed,
            TimerKind::IceFailed => attempt.ice == IceConnectionState::Failed,
            TimerKind::Disconnected(epoch) => epoch == attempt.disconnect_epoch,
        };
        if !expired {
            tracing::debug!("Call {}: {:?} timer no longer applies", attempt.call_id, kind);
            return;
        }

        match kind {
            TimerKind::RingTimeout => {
                tracing::info!("Call {} not answered in time", attempt.call_id);
                self.notify(CallNotice::CallTimeout);
                self.end_call(EndReason::Timeout).await;
            }
            _ => {
                tracing::warn!("Call {} did not recover ({:?})", attempt.call_id, kind);
                self.end_call(EndReason::TransportFailed).await;
            }
        }
    }
}
