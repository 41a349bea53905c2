use std::sync::atomic::Ordering;

use tokio::time::Instant;

use super::{transition, CallNotice, EndReason, Internal, SessionActor, SessionEvent, SessionPhase};

impl SessionActor {
    /// The single cancellation primitive. Only the first invocation for an
    /// attempt does any work.
    pub(super) async fn end_call(&mut self, reason: EndReason) {
        let Some(mut attempt) = self.attempt.take() else {
            tracing::debug!("Already ending call, skipping");
            return;
        };
        attempt.ending.store(true, Ordering::SeqCst);
        tracing::info!("Ending call {} ({:?})", attempt.call_id, reason);

        self.phase = transition(self.phase, SessionEvent::EndCall).unwrap_or(SessionPhase::Ended);
        attempt.token.cancel();
        attempt.duration.reset();

        if let Some(peer) = attempt.peer.take() {
            peer.close();
        }
        if let Some(stream) = attempt.local_stream.take() {
            stream.stop_all();
        }
        if let Some(stream) = attempt.remote_stream.take() {
            stream.stop_all();
        }
        if let Some(mut handle) = attempt.call_watch.take() {
            handle.unsubscribe();
        }
        if let Some(mut handle) = attempt.candidate_watch.take() {
            handle.unsubscribe();
        }
        if attempt.record_on_relay {
            if let Err(e) = self.signaling.remove_call(&attempt.call_id).await {
                tracing::error!("Failed to remove call {}: {}", attempt.call_id, e);
            }
        }

        let cooldown = self.config.end_cooldown;
        self.cooldown_until = Some(Instant::now() + cooldown);
        self.schedule(self.shutdown.clone(), cooldown, Internal::CooldownElapsed);

        self.set_status("");
        self.last_end = Some(reason.clone());
        if reason != EndReason::Collision {
            self.notify(CallNotice::CallEnded(reason));
        }
        self.publish();
        tracing::info!("Call {} ended", attempt.call_id);
    }
}
