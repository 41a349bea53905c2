//! Peer Connection Manager
//!
//! Wraps the direct media transport negotiated between the two parties.
//! Local candidates go out through the signaling channel, remote candidates
//! come back in, and transport state changes are surfaced as `PeerEvent`s for
//! the session to map onto its own transitions.
//!
//! Once teardown has begun nothing observable happens here any more: no
//! candidate is published and no remote description or candidate is applied.

mod loopback;

pub use loopback::LoopbackNetwork;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::media::{MediaStream, MediaTrack};
use crate::models::{now_millis, CandidateRecord, IceCandidate, SessionDescription};
use crate::signaling::{CallSignaling, RelayError};

/// Transport-level negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    #[error("No remote description set")]
    NoRemoteDescription,

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Peer connection closed")]
    Closed,
}

/// Offer/answer progress of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerConnectionState::New => write!(f, "new"),
            PeerConnectionState::Connecting => write!(f, "connecting"),
            PeerConnectionState::Connected => write!(f, "connected"),
            PeerConnectionState::Disconnected => write!(f, "disconnected"),
            PeerConnectionState::Failed => write!(f, "failed"),
            PeerConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks raised by the transport
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local network path was discovered
    LocalCandidate(IceCandidate),
    /// Media arrived from the other party
    Track(MediaTrack),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

/// The direct media transport primitive
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;
    fn signaling_state(&self) -> SignalingState;
    fn close(&self);
}

/// Creates one transport per call attempt together with its event stream.
pub trait PeerTransportFactory: Send + Sync {
    fn create(
        &self,
        owner: &str,
        ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>), PeerError>;
}

/// Owns the transport for a single call attempt.
pub struct PeerConnectionManager {
    call_id: String,
    self_id: String,
    transport: Box<dyn PeerTransport>,
    signaling: CallSignaling,
    /// Shared with the owning session; set once teardown starts
    ending: Arc<AtomicBool>,
    /// Remote candidate keys already handled
    seen_candidates: HashSet<String>,
    /// Remote candidates that arrived before a remote description
    pending: Vec<IceCandidate>,
    has_remote_description: bool,
}

impl PeerConnectionManager {
    pub fn new(
        call_id: String,
        self_id: String,
        transport: Box<dyn PeerTransport>,
        signaling: CallSignaling,
        ending: Arc<AtomicBool>,
    ) -> Self {
        tracing::info!("Creating peer connection for call {}", call_id);
        Self {
            call_id,
            self_id,
            transport,
            signaling,
            ending,
            seen_candidates: HashSet::new(),
            pending: Vec::new(),
            has_remote_description: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    fn is_ending(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.transport.signaling_state()
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Attach every local track. Individual failures are logged and skipped.
    pub fn add_local_stream(&self, stream: &MediaStream) {
        for track in stream.tracks() {
            tracing::debug!("Adding {} track to call {}", track.kind(), self.call_id);
            if let Err(e) = self.transport.add_track(track) {
                tracing::error!("Error adding {} track: {}", track.kind(), e);
            }
        }
    }

    /// Caller side: create the offer and install it locally.
    pub async fn create_offer(&self, with_video: bool) -> Result<SessionDescription, PeerError> {
        if self.is_ending() {
            return Err(PeerError::Closed);
        }
        let offer = self
            .transport
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: with_video,
            })
            .await?;
        self.transport.set_local_description(&offer).await?;
        tracing::info!("Offer created and set for call {}", self.call_id);
        Ok(offer)
    }

    /// Callee side: install the remote offer and produce the local answer.
    pub async fn accept_offer(
        &mut self,
        offer: Option<&SessionDescription>,
    ) -> Result<SessionDescription, PeerError> {
        if self.is_ending() {
            return Err(PeerError::Closed);
        }
        if let Some(offer) = offer {
            tracing::debug!("Setting remote offer for call {}", self.call_id);
            self.transport.set_remote_description(offer).await?;
            self.has_remote_description = true;
        }

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;
        self.flush_pending().await;
        Ok(answer)
    }

    /// Caller side: apply the callee's answer.
    ///
    /// Returns `Ok(false)` without touching the transport when no offer is
    /// outstanding (already applied, or torn down) or when ending.
    pub async fn apply_remote_answer(&mut self, answer: &SessionDescription) -> Result<bool, PeerError> {
        if self.is_ending() {
            return Ok(false);
        }
        let state = self.transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::debug!(
                "Ignoring answer for call {}: signaling state {:?}",
                self.call_id,
                state
            );
            return Ok(false);
        }

        tracing::info!("Setting remote answer for call {}", self.call_id);
        self.transport.set_remote_description(answer).await?;
        self.has_remote_description = true;
        self.flush_pending().await;
        Ok(true)
    }

    /// Publish a locally discovered candidate. Returns the relay key, or
    /// `None` when suppressed because the call is ending.
    pub async fn publish_local_candidate(
        &self,
        candidate: &IceCandidate,
    ) -> Result<Option<String>, RelayError> {
        if self.is_ending() {
            tracing::debug!("Suppressing local candidate for ending call {}", self.call_id);
            return Ok(None);
        }
        let record = CandidateRecord::new(candidate, &self.self_id, now_millis());
        let key = self.signaling.push_candidate(&self.call_id, &record).await?;
        tracing::debug!("Published local candidate {} for call {}", key, self.call_id);
        Ok(Some(key))
    }

    /// Handle a candidates snapshot. Each key is processed once; our own
    /// echoed candidates are discarded. Returns how many were applied now.
    pub async fn apply_remote_candidates(&mut self, candidates: Vec<(String, CandidateRecord)>) -> usize {
        if self.is_ending() {
            return 0;
        }

        let mut applied = 0;
        for (key, record) in candidates {
            if !self.seen_candidates.insert(key) {
                continue;
            }
            if record.from == self.self_id || record.candidate.is_empty() {
                continue;
            }

            let candidate = record.to_candidate();
            if !self.has_remote_description {
                tracing::debug!("Buffering early candidate for call {}", self.call_id);
                self.pending.push(candidate);
                continue;
            }
            if self.add_candidate(&candidate).await {
                applied += 1;
            }
        }
        applied
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> bool {
        if self.is_ending() {
            return false;
        }
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => {
                tracing::debug!("Remote candidate added for call {}", self.call_id);
                true
            }
            Err(e) => {
                tracing::warn!("Remote candidate rejected for call {}: {}", self.call_id, e);
                false
            }
        }
    }

    async fn flush_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        tracing::debug!(
            "Applying {} buffered candidates for call {}",
            pending.len(),
            self.call_id
        );
        for candidate in pending {
            self.add_candidate(&candidate).await;
        }
    }

    pub fn close(&self) {
        tracing::debug!("Closing peer connection for call {}", self.call_id);
        self.transport.close();
    }
}
