//! UI commands handled by the session actor.

use super::{generate_call_id, Attempt, CallNotice, Command, Role, SessionActor, SessionEvent};
use crate::media::TrackKind;
use crate::models::{CallRecord, CallStatus, CallType};
use crate::CallError;

impl SessionActor {
    pub(super) async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                receiver_id,
                is_video,
                reply,
            } => {
                let _ = reply.send(self.start_call(receiver_id, is_video));
            }
            Command::Answer { record, reply } => {
                let _ = reply.send(self.answer_call(record));
            }
            Command::Reject { record, reply } => {
                let result = self.reject_call(record).await;
                let _ = reply.send(result);
            }
            Command::End { reason, reply } => {
                self.end_call(reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::SetTrackEnabled {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_track_enabled(kind, enabled));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn begin_attempt(&mut self, call_id: String, role: Role, call_type: CallType, remote_id: String) -> u64 {
        self.next_attempt += 1;
        let id = self.next_attempt;
        self.attempt = Some(Attempt::new(
            id,
            call_id,
            role,
            call_type,
            remote_id,
            self.shutdown.child_token(),
        ));
        self.last_end = None;
        id
    }

    fn start_call(&mut self, receiver_id: String, is_video: bool) -> Result<String, CallError> {
        if self.attempt.is_some() {
            tracing::warn!("Rejecting new call to {}: a call is in progress", receiver_id);
            return Err(CallError::CallInProgress);
        }
        if self.incoming.is_prompting() {
            return Err(CallError::IncomingCallPending);
        }
        if receiver_id.is_empty() || receiver_id == self.self_id {
            return Err(CallError::InvalidState(format!(
                "Cannot call {:?}",
                receiver_id
            )));
        }
        self.advance(SessionEvent::StartCall)?;

        let call_id = generate_call_id();
        tracing::info!("Starting call {} to {}", call_id, receiver_id);
        let attempt = self.begin_attempt(
            call_id.clone(),
            Role::Caller,
            CallType::from_video(is_video),
            receiver_id,
        );
        self.set_status("Getting media...");
        self.acquire_media(attempt, is_video);
        self.publish();
        Ok(call_id)
    }

    fn answer_call(&mut self, record: CallRecord) -> Result<(), CallError> {
        if self.attempt.is_some() {
            return Err(CallError::CallInProgress);
        }
        if record.receiver_id != self.self_id {
            return Err(CallError::InvalidState(format!(
                "Call {} is not addressed to {}",
                record.id, self.self_id
            )));
        }
        if record.status != CallStatus::Ringing {
            return Err(CallError::InvalidState(format!(
                "Call {} is no longer ringing",
                record.id
            )));
        }
        self.advance(SessionEvent::AnswerCall)?;

        tracing::info!("Answering call {} from {}", record.id, record.caller_id);
        self.incoming.dismiss(&record.id);
        if let Some(token) = self.auto_reject.take() {
            token.cancel();
        }

        let is_video = record.call_type.is_video();
        let attempt = self.begin_attempt(
            record.id.clone(),
            Role::Callee,
            record.call_type,
            record.caller_id.clone(),
        );
        if let Some(a) = self.attempt.as_mut() {
            // The record already lives on the relay
            a.record_on_relay = true;
            a.record_seen = true;
            a.incoming = Some(record);
        }
        self.set_status("Getting media...");
        self.acquire_media(attempt, is_video);
        self.publish();
        Ok(())
    }

    async fn reject_call(&mut self, record: CallRecord) -> Result<(), CallError> {
        if self.attempt.as_ref().map(|a| a.call_id.as_str()) == Some(record.id.as_str()) {
            return Err(CallError::InvalidState(format!(
                "Call {} is already being answered",
                record.id
            )));
        }

        let prompted = self.incoming.prompt().map(|p| p.id == record.id).unwrap_or(false);
        self.incoming.dismiss(&record.id);
        if prompted {
            if let Some(token) = self.auto_reject.take() {
                token.cancel();
            }
        }
        self.publish();

        if !self.still_ringing(&record.id).await {
            tracing::info!("Call {} withdrawn before it was rejected", record.id);
            // Withdrawal already reported a missed call if it got here first
            if prompted {
                self.notify(CallNotice::MissedCall { call_id: record.id });
            }
            return Ok(());
        }
        if let Err(e) = self.signaling.write_status(&record.id, CallStatus::Rejected).await {
            tracing::error!("Reject call {} error: {}", record.id, e);
            return Err(e.into());
        }
        tracing::info!("Call {} rejected", record.id);
        self.notify(CallNotice::IncomingRejected {
            call_id: record.id,
        });
        Ok(())
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: Option<bool>) -> Result<bool, CallError> {
        let stream = self
            .attempt
            .as_ref()
            .and_then(|a| a.local_stream.clone())
            .ok_or_else(|| CallError::InvalidState("No local media".to_string()))?;

        let current = stream
            .tracks()
            .iter()
            .find(|t| t.kind() == kind)
            .map(|t| t.is_enabled())
            .ok_or_else(|| CallError::InvalidState(format!("No {} track", kind)))?;

        let target = enabled.unwrap_or(!current);
        stream.set_kind_enabled(kind, target);
        tracing::info!("Local {} {}", kind, if target { "enabled" } else { "disabled" });
        self.publish();
        Ok(target)
    }
}
