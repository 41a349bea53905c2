//! Actor side of incoming calls: prompting, collisions, withdrawal and
//! auto-reject.

use tokio::time::Instant;

use super::{
    CallNotice, EndReason, Internal, LocalView, SessionActor, SessionPhase, WatchOutcome,
};
use crate::models::{now_millis, CallRecord, CallStatus};

impl SessionActor {
    fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub(super) async fn evaluate_incoming(&mut self) {
        let ringing_out_to = match (self.phase, self.attempt.as_ref()) {
            (SessionPhase::AwaitingAnswer, Some(a)) => Some(a.remote_id.clone()),
            _ => None,
        };
        let view = LocalView {
            busy: self.attempt.is_some(),
            ringing_out_to: ringing_out_to.as_deref(),
        };

        match self.incoming.evaluate(&self.last_incoming, now_millis(), view) {
            WatchOutcome::Surface(record) => {
                if self.in_cooldown() {
                    tracing::debug!("Deferring incoming call {} until cooldown ends", record.id);
                    return;
                }
                self.surface_incoming(record);
            }
            WatchOutcome::Collision(record) => {
                tracing::info!(
                    "Call collision with {}: yielding to call {}",
                    record.caller_id,
                    record.id
                );
                self.end_call(EndReason::Collision).await;
                self.surface_incoming(record);
            }
            WatchOutcome::Withdrawn(call_id) => {
                tracing::info!("Incoming call {} withdrawn", call_id);
                self.incoming.dismiss(&call_id);
                if let Some(token) = self.auto_reject.take() {
                    token.cancel();
                }
                self.notify(CallNotice::MissedCall { call_id });
                self.publish();
            }
            WatchOutcome::Unchanged => {}
        }
    }

    fn surface_incoming(&mut self, record: CallRecord) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.auto_reject.replace(token.clone()) {
            previous.cancel();
        }
        self.schedule(
            token,
            self.config.incoming_auto_reject,
            Internal::AutoReject {
                call_id: record.id.clone(),
            },
        );
        self.incoming.set_prompt(record.clone());
        self.notify(CallNotice::IncomingCall(record));
        self.publish();
    }

    /// `true` while `call_id` is stored on the relay and still ringing.
    /// A failed read counts as gone so nothing is written blind.
    pub(super) async fn still_ringing(&self, call_id: &str) -> bool {
        match self.signaling.read_call(call_id).await {
            Ok(Some(record)) => record.status == CallStatus::Ringing,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Could not read call {}: {}", call_id, e);
                false
            }
        }
    }

    pub(super) async fn on_auto_reject(&mut self, call_id: String) {
        if self.incoming.prompt().map(|p| p.id.as_str()) != Some(call_id.as_str()) {
            return;
        }
        tracing::info!("Incoming call {} not answered, rejecting", call_id);
        self.incoming.dismiss(&call_id);
        self.auto_reject = None;
        self.publish();

        if !self.still_ringing(&call_id).await {
            tracing::info!("Call {} already withdrawn, nothing to reject", call_id);
        } else if let Err(e) = self.signaling.write_status(&call_id, CallStatus::Rejected).await {
            tracing::error!("Auto-reject of call {} failed: {}", call_id, e);
        }
        self.notify(CallNotice::MissedCall { call_id });
    }
}
