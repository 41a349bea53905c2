//! Incoming Call Watcher
//!
//! Decides which call records addressed to us become an incoming-call
//! prompt. At most one prompt exists at a time and there is no call waiting:
//! while a local call is in progress new invitations are ignored, except for
//! the call-collision tie-break.

use std::collections::HashSet;

use crate::models::{CallRecord, CallStatus};

/// What the owning session is doing when a snapshot arrives
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalView<'a> {
    /// A local call attempt exists (acquiring media, ringing out, connecting, connected)
    pub busy: bool,
    /// Receiver of our own outgoing call while it is still unanswered
    pub ringing_out_to: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// Show this record as the incoming call
    Surface(CallRecord),
    /// Both parties called each other; ours must yield to this record
    Collision(CallRecord),
    /// The prompted record stopped ringing or vanished
    Withdrawn(String),
    Unchanged,
}

/// `true` iff `record` is a live invitation for `self_id` at `now_ms`.
pub fn qualifies(record: &CallRecord, self_id: &str, now_ms: i64, max_age_ms: i64) -> bool {
    record.receiver_id == self_id
        && record.caller_id != self_id
        && record.status == CallStatus::Ringing
        && record.age_ms(now_ms) < max_age_ms
}

pub struct IncomingCallWatcher {
    self_id: String,
    max_age_ms: i64,
    prompt: Option<CallRecord>,
    /// Records already answered or rejected here; never prompted again
    dismissed: HashSet<String>,
}

impl IncomingCallWatcher {
    pub fn new(self_id: impl Into<String>, max_age_ms: i64) -> Self {
        Self {
            self_id: self_id.into(),
            max_age_ms,
            prompt: None,
            dismissed: HashSet::new(),
        }
    }

    pub fn prompt(&self) -> Option<&CallRecord> {
        self.prompt.as_ref()
    }

    pub fn is_prompting(&self) -> bool {
        self.prompt.is_some()
    }

    pub fn set_prompt(&mut self, record: CallRecord) {
        tracing::info!("Incoming call {} from {}", record.id, record.caller_id);
        self.prompt = Some(record);
    }

    /// Forget the prompt and never surface that record again.
    pub fn dismiss(&mut self, call_id: &str) {
        self.dismissed.insert(call_id.to_string());
        if self.prompt.as_ref().map(|p| p.id.as_str()) == Some(call_id) {
            self.prompt = None;
        }
    }

    pub fn clear_prompt(&mut self) -> Option<CallRecord> {
        self.prompt.take()
    }

    pub fn evaluate(&self, records: &[CallRecord], now_ms: i64, local: LocalView<'_>) -> WatchOutcome {
        if let Some(prompt) = &self.prompt {
            let still_ringing = records
                .iter()
                .any(|r| r.id == prompt.id && r.status == CallStatus::Ringing);
            return if still_ringing {
                WatchOutcome::Unchanged
            } else {
                WatchOutcome::Withdrawn(prompt.id.clone())
            };
        }

        let mut candidates: Vec<&CallRecord> = records
            .iter()
            .filter(|r| !self.dismissed.contains(&r.id))
            .filter(|r| qualifies(r, &self.self_id, now_ms, self.max_age_ms))
            .collect();
        candidates.sort_by_key(|r| r.timestamp);

        let Some(first) = candidates.first() else {
            return WatchOutcome::Unchanged;
        };

        if !local.busy {
            return WatchOutcome::Surface((*first).clone());
        }

        // Simultaneous calls between the same pair: the greater identity yields
        if let Some(target) = local.ringing_out_to {
            if let Some(colliding) = candidates.iter().find(|r| r.caller_id == target) {
                if self.self_id.as_str() > target {
                    return WatchOutcome::Collision((*colliding).clone());
                }
                tracing::debug!(
                    "Call collision with {}: keeping our outgoing call",
                    target
                );
            }
        }
        WatchOutcome::Unchanged
    }
}
