//! Peer-to-peer call signaling and session lifecycle.
//!
//! Two parties place audio or video calls to each other through a shared
//! realtime relay that carries call records, session descriptions and
//! connectivity candidates. Media flows over a direct transport negotiated
//! through that relay. The relay, capture devices and transport sit behind
//! the traits in [`signaling`], [`media`] and [`peer`]; in-process
//! implementations of each ship with the crate.

pub mod config;
pub mod media;
pub mod models;
pub mod peer;
pub mod session;
pub mod signaling;

use thiserror::Error;

pub use config::CallConfig;
pub use media::{MediaDevices, MediaError, MediaStream, MediaTrack, SyntheticDevices, TrackKind};
pub use models::{CallRecord, CallStatus, CallType, CandidateRecord, IceCandidate, SessionDescription};
pub use peer::{LoopbackNetwork, PeerError, PeerTransport, PeerTransportFactory};
pub use session::{
    format_duration, CallNotice, CallSession, CallSnapshot, EndReason, Role, SessionEvent,
    SessionPhase,
};
pub use signaling::{CallSignaling, MemoryRelay, RelayError, SignalingChannel};

/// Call-level errors
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] RelayError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] PeerError),

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("An incoming call is waiting for an answer")]
    IncomingCallPending,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Illegal transition from {from} on {event:?}")]
    InvalidTransition {
        from: SessionPhase,
        event: SessionEvent,
    },

    #[error("Call timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Call session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, CallError>;
