//! Call signaling records
//!
//! These are the documents exchanged through the relay. Field names match the
//! persisted representation so that any peer speaking the same protocol can
//! read them.

use serde::{Deserialize, Serialize};

/// Media kind of a call, fixed at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn from_video(is_video: bool) -> Self {
        if is_video {
            CallType::Video
        } else {
            CallType::Audio
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// Status flag stored on the call record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

impl CallStatus {
    /// A record in one of these states still occupies both parties.
    pub fn is_active(&self) -> bool {
        matches!(self, CallStatus::Ringing | CallStatus::Accepted)
    }

    /// Status only moves forward: ringing -> accepted|rejected -> ended.
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        match (self, next) {
            (CallStatus::Ringing, CallStatus::Accepted | CallStatus::Rejected | CallStatus::Ended) => true,
            (CallStatus::Accepted | CallStatus::Rejected, CallStatus::Ended) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Opaque session description blob (`{type, sdp}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// The shared document describing one call attempt, stored at `calls/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRecord {
    pub id: String,
    #[serde(rename = "callerId")]
    pub caller_id: String,
    #[serde(rename = "receiverId")]
    pub receiver_id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "expiresAt", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl CallRecord {
    /// Build the record a caller writes when placing a call.
    pub fn ringing(
        id: String,
        caller_id: String,
        receiver_id: String,
        call_type: CallType,
        offer: SessionDescription,
        now_ms: i64,
        ring_timeout_ms: i64,
    ) -> Self {
        Self {
            id,
            caller_id,
            receiver_id,
            call_type,
            status: CallStatus::Ringing,
            offer: Some(offer),
            answer: None,
            timestamp: now_ms,
            expires_at: Some(now_ms + ring_timeout_ms),
        }
    }

    /// Milliseconds elapsed since creation.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }

    /// The record as the callee writes it back after answering.
    pub fn accepted(&self, answer: SessionDescription) -> Self {
        Self {
            answer: Some(answer),
            status: CallStatus::Accepted,
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: CallStatus) -> Self {
        Self { status, ..self.clone() }
    }

    /// The other party from the point of view of `self_id`.
    pub fn peer_of(&self, self_id: &str) -> &str {
        if self.caller_id == self_id {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }
}

/// A transport path descriptor as produced by the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: Option<u16>,
    pub sdp_mid: Option<String>,
}

/// One published candidate, stored under `calls/{id}/candidates/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    pub from: String,
    pub timestamp: i64,
}

impl CandidateRecord {
    pub fn new(candidate: &IceCandidate, from: &str, now_ms: i64) -> Self {
        Self {
            candidate: candidate.candidate.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid.clone(),
            from: from.to_string(),
            timestamp: now_ms,
        }
    }

    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self.candidate.clone(),
            sdp_mline_index: self.sdp_mline_index,
            sdp_mid: self.sdp_mid.clone(),
        }
    }
}

/// Current wall-clock time in milliseconds, the unit used by record timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
