//! Session State Machine
//!
//! Owns the lifecycle of a single call attempt for one local identity:
//! media acquisition, offer/answer exchange through the relay, candidate
//! exchange, connection monitoring and teardown.
//!
//! Each `CallSession` is a single actor task. UI commands, relay
//! notifications, transport callbacks and timers all arrive on its inbox and
//! are handled one at a time, so call logic never runs concurrently with
//! itself. Work that must not block the inbox (device acquisition, timers,
//! subscription pumps) runs in spawned tasks that post their results back
//! tagged with the attempt they belong to; results for a finished attempt
//! only release resources.

mod commands;
pub mod incoming;
mod negotiation;
mod prompt;
mod teardown;
mod timer;

pub use incoming::{qualifies, IncomingCallWatcher, LocalView, WatchOutcome};
pub use timer::{format_duration, DurationTracker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CallConfig;
use crate::media::{MediaDevices, MediaError, MediaStream, TrackKind};
use crate::models::{now_millis, CallRecord, CallType};
use crate::peer::{
    IceConnectionState, PeerConnectionManager, PeerConnectionState, PeerEvent, PeerTransportFactory,
};
use crate::signaling::{CallSignaling, SignalingChannel, WatchHandle};
use crate::CallError;

/// Which side of the handshake this session plays for the current attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No call attempt has been made yet
    Idle,
    /// Waiting for the capture devices
    AcquiringMedia,
    /// Caller is creating and publishing its offer
    CreatingOffer,
    /// Caller's record is ringing at the remote party
    AwaitingAnswer,
    /// Callee is creating and publishing its answer
    CreatingAnswer,
    /// Descriptions exchanged, transport not yet up
    Connecting,
    /// Media is flowing
    Connected,
    /// The last attempt has been torn down
    Ended,
}

impl SessionPhase {
    /// A call attempt owns resources in this phase.
    pub fn is_in_call(&self) -> bool {
        !matches!(self, SessionPhase::Idle | SessionPhase::Ended)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "Idle"),
            SessionPhase::AcquiringMedia => write!(f, "AcquiringMedia"),
            SessionPhase::CreatingOffer => write!(f, "CreatingOffer"),
            SessionPhase::AwaitingAnswer => write!(f, "AwaitingAnswer"),
            SessionPhase::CreatingAnswer => write!(f, "CreatingAnswer"),
            SessionPhase::Connecting => write!(f, "Connecting"),
            SessionPhase::Connected => write!(f, "Connected"),
            SessionPhase::Ended => write!(f, "Ended"),
        }
    }
}

/// Inputs of the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StartCall,
    AnswerCall,
    MediaAcquired(Role),
    OfferPublished,
    AnswerPublished,
    RemoteAnswerApplied,
    RemoteRejected,
    TransportConnected,
    EndCall,
}

/// The transition table. Anything not listed is an illegal transition.
pub fn transition(phase: SessionPhase, event: SessionEvent) -> Result<SessionPhase, CallError> {
    use SessionEvent as E;
    use SessionPhase as P;

    let next = match (phase, event) {
        (_, E::EndCall) => P::Ended,
        (P::Idle | P::Ended, E::StartCall | E::AnswerCall) => P::AcquiringMedia,
        (P::AcquiringMedia, E::MediaAcquired(Role::Caller)) => P::CreatingOffer,
        (P::AcquiringMedia, E::MediaAcquired(Role::Callee)) => P::CreatingAnswer,
        (P::CreatingOffer, E::OfferPublished) => P::AwaitingAnswer,
        (P::AwaitingAnswer, E::RemoteAnswerApplied) => P::Connecting,
        (P::AwaitingAnswer, E::RemoteRejected) => P::Ended,
        (P::CreatingAnswer, E::AnswerPublished) => P::Connecting,
        (P::Connecting | P::Connected, E::TransportConnected) => P::Connected,
        (from, event) => return Err(CallError::InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Why the last call attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// The other party hung up or withdrew the record
    RemoteHangup,
    /// The callee rejected the call
    Rejected,
    /// Nobody answered in time
    Timeout,
    /// Capture devices could not be acquired
    Media(MediaError),
    /// A relay write failed
    Signaling(String),
    /// Offer/answer could not be produced
    Negotiation(String),
    /// The direct transport failed or closed
    TransportFailed,
    /// Our outgoing call yielded to a simultaneous incoming one
    Collision,
    /// The application was hidden or unloaded
    PageHidden,
}

impl EndReason {
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            EndReason::LocalHangup | EndReason::RemoteHangup | EndReason::PageHidden
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            EndReason::LocalHangup | EndReason::RemoteHangup | EndReason::PageHidden => "Call ended",
            EndReason::Rejected => "Call rejected",
            EndReason::Timeout => "Call timeout",
            EndReason::Media(e) => e.user_message(),
            EndReason::Signaling(_) | EndReason::Negotiation(_) => "Failed to start call",
            EndReason::TransportFailed => "Connection failed",
            EndReason::Collision => "Call collided with an incoming call",
        }
    }
}

/// User-facing notifications
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    CallInitiated { call_id: String },
    IncomingCall(CallRecord),
    /// The prompted call stopped ringing before we acted on it
    MissedCall { call_id: String },
    CallAnswered { call_id: String },
    IncomingRejected { call_id: String },
    Connected { call_id: String },
    Reconnecting,
    CallRejected,
    CallTimeout,
    ConnectionFailed,
    MediaFailed(String),
    CallFailed(String),
    CallEnded(EndReason),
}

/// Read-only view of the session for the UI layer
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub phase: SessionPhase,
    pub role: Option<Role>,
    pub call_id: Option<String>,
    pub call_type: Option<CallType>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub is_call_active: bool,
    pub is_incoming_call: bool,
    pub incoming_call_data: Option<CallRecord>,
    /// Free-text phase label
    pub call_status: String,
    /// Seconds since `Connected`
    pub call_duration: u64,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub last_end: Option<EndReason>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            role: None,
            call_id: None,
            call_type: None,
            local_stream: None,
            remote_stream: None,
            is_call_active: false,
            is_incoming_call: false,
            incoming_call_data: None,
            call_status: String::new(),
            call_duration: 0,
            audio_enabled: true,
            video_enabled: true,
            last_end: None,
        }
    }
}

impl CallSnapshot {
    pub fn formatted_duration(&self) -> String {
        format_duration(self.call_duration)
    }
}

enum Command {
    Start {
        receiver_id: String,
        is_video: bool,
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    Answer {
        record: CallRecord,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        record: CallRecord,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reason: EndReason,
        reply: Option<oneshot::Sender<()>>,
    },
    SetTrackEnabled {
        kind: TrackKind,
        /// `None` toggles
        enabled: Option<bool>,
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    RingTimeout,
    ConnectionFailed,
    IceFailed,
    Disconnected(u64),
}

enum Internal {
    MediaReady {
        attempt: u64,
        result: Result<MediaStream, MediaError>,
    },
    CallUpdate {
        attempt: u64,
        snapshot: Option<Value>,
    },
    Candidates {
        attempt: u64,
        snapshot: Option<Value>,
    },
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
    Timer {
        attempt: u64,
        kind: TimerKind,
    },
    Tick {
        attempt: u64,
    },
    Incoming(Option<Value>),
    AutoReject {
        call_id: String,
    },
    CooldownElapsed,
}

enum Inbox {
    Command(Option<Command>),
    Internal(Internal),
}

/// Everything owned by one call attempt
struct Attempt {
    id: u64,
    call_id: String,
    role: Role,
    call_type: CallType,
    remote_id: String,
    /// Callee: the record being answered
    incoming: Option<CallRecord>,
    peer: Option<PeerConnectionManager>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    /// Cancels every task spawned for this attempt
    token: CancellationToken,
    /// Shared with the peer manager; set once teardown starts
    ending: Arc<AtomicBool>,
    call_watch: Option<WatchHandle>,
    candidate_watch: Option<WatchHandle>,
    /// The call record has been observed on the relay at least once
    record_seen: bool,
    /// The call record exists on the relay and must be removed on teardown
    record_on_relay: bool,
    connection: PeerConnectionState,
    ice: IceConnectionState,
    disconnect_epoch: u64,
    duration: DurationTracker,
}

impl Attempt {
    fn new(
        id: u64,
        call_id: String,
        role: Role,
        call_type: CallType,
        remote_id: String,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            call_id,
            role,
            call_type,
            remote_id,
            incoming: None,
            peer: None,
            local_stream: None,
            remote_stream: None,
            token,
            ending: Arc::new(AtomicBool::new(false)),
            call_watch: None,
            candidate_watch: None,
            record_seen: false,
            record_on_relay: false,
            connection: PeerConnectionState::New,
            ice: IceConnectionState::New,
            disconnect_epoch: 0,
            duration: DurationTracker::new(),
        }
    }

    /// Any pending disconnect timer stops applying.
    fn recovered(&mut self) {
        self.disconnect_epoch += 1;
    }
}

fn generate_call_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("call_{}_{}", now_millis(), suffix)
}

/// Handle to a running call session. Clones drive the same session.
#[derive(Clone)]
pub struct CallSession {
    self_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallSnapshot>,
}

impl CallSession {
    /// Validate the configuration and spawn the session actor for `self_id`.
    ///
    /// Must be called from within a Tokio runtime. Returns the handle together
    /// with the stream of user-facing notices.
    pub fn new(
        self_id: impl Into<String>,
        config: CallConfig,
        relay: Arc<dyn SignalingChannel>,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn PeerTransportFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallNotice>), CallError> {
        let self_id = self_id.into();
        if self_id.is_empty() {
            return Err(CallError::Config("Local identity is required".to_string()));
        }
        config.validate().map_err(CallError::Config)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSnapshot::default());

        let max_age_ms = config.incoming_max_age.as_millis() as i64;
        let actor = SessionActor {
            incoming: IncomingCallWatcher::new(self_id.clone(), max_age_ms),
            self_id: self_id.clone(),
            config,
            signaling: CallSignaling::new(relay),
            devices,
            transports,
            commands: command_rx,
            internal_tx,
            internal_rx,
            notices: notice_tx,
            state_tx,
            phase: SessionPhase::Idle,
            status: String::new(),
            attempt: None,
            next_attempt: 0,
            incoming_watch: None,
            last_incoming: Vec::new(),
            auto_reject: None,
            cooldown_until: None,
            last_end: None,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(actor.run());

        tracing::info!("Call session started for {}", self_id);
        Ok((
            Self {
                self_id,
                commands: command_tx,
                state: state_rx,
            },
            notice_rx,
        ))
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands.send(command).map_err(|_| CallError::SessionClosed)
    }

    /// Place a call. Returns the new call id once the attempt is accepted;
    /// later failures surface as notices and in `CallSnapshot::last_end`.
    pub async fn start_call(&self, receiver_id: &str, is_video: bool) -> Result<String, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            receiver_id: receiver_id.to_string(),
            is_video,
            reply,
        })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Answer an incoming call record.
    pub async fn answer_call(&self, record: &CallRecord) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Answer {
            record: record.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Reject an incoming call record.
    pub async fn reject_call(&self, record: &CallRecord) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reject {
            record: record.clone(),
            reply,
        })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Hang up. Safe to call any number of times from any state; only the
    /// first call while an attempt exists performs teardown.
    pub async fn end_call(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .send(Command::End {
                reason: EndReason::LocalHangup,
                reply: Some(reply),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// The application was hidden or is unloading.
    pub fn page_hidden(&self) {
        let _ = self.send(Command::End {
            reason: EndReason::PageHidden,
            reply: None,
        });
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: Option<bool>) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetTrackEnabled {
            kind,
            enabled,
            reply,
        })?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Mute or unmute the microphone. Returns the new enabled flag.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.set_track_enabled(TrackKind::Audio, Some(enabled)).await
    }

    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.set_track_enabled(TrackKind::Audio, None).await
    }

    /// Turn the camera on or off. Returns the new enabled flag.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, CallError> {
        self.set_track_enabled(TrackKind::Video, Some(enabled)).await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.set_track_enabled(TrackKind::Video, None).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<CallSnapshot, CallError>
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        let mut rx = self.state.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| CallError::SessionClosed)?;
        }
    }

    /// End any call, drop the incoming-call subscription and stop the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct SessionActor {
    self_id: String,
    config: CallConfig,
    signaling: CallSignaling,
    devices: Arc<dyn MediaDevices>,
    transports: Arc<dyn PeerTransportFactory>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    notices: mpsc::UnboundedSender<CallNotice>,
    state_tx: watch::Sender<CallSnapshot>,
    phase: SessionPhase,
    status: String,
    /// At most one attempt at a time
    attempt: Option<Attempt>,
    next_attempt: u64,
    incoming: IncomingCallWatcher,
    incoming_watch: Option<WatchHandle>,
    last_incoming: Vec<CallRecord>,
    auto_reject: Option<CancellationToken>,
    cooldown_until: Option<Instant>,
    last_end: Option<EndReason>,
    shutdown: CancellationToken,
}

impl SessionActor {
    async fn run(mut self) {
        self.watch_incoming();

        loop {
            let next = tokio::select! {
                command = self.commands.recv() => Inbox::Command(command),
                Some(event) = self.internal_rx.recv() => Inbox::Internal(event),
            };

            match next {
                Inbox::Command(Some(Command::Shutdown { reply })) => {
                    self.close().await;
                    let _ = reply.send(());
                    break;
                }
                Inbox::Command(Some(command)) => self.handle_command(command).await,
                Inbox::Command(None) => {
                    self.close().await;
                    break;
                }
                Inbox::Internal(event) => self.handle_internal(event).await,
            }
        }
        tracing::info!("Call session for {} stopped", self.self_id);
    }

    async fn close(&mut self) {
        self.end_call(EndReason::LocalHangup).await;
        if let Some(mut handle) = self.incoming_watch.take() {
            handle.unsubscribe();
        }
        if let Some(token) = self.auto_reject.take() {
            token.cancel();
        }
        self.shutdown.cancel();
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    fn notify(&self, notice: CallNotice) {
        let _ = self.notices.send(notice);
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn publish(&self) {
        let attempt = self.attempt.as_ref();
        let local_stream = attempt.and_then(|a| a.local_stream.clone());
        let kind_enabled = |kind: TrackKind| {
            local_stream
                .as_ref()
                .and_then(|s| s.tracks().iter().find(|t| t.kind() == kind).map(|t| t.is_enabled()))
                .unwrap_or(true)
        };

        let snapshot = CallSnapshot {
            phase: self.phase,
            role: attempt.map(|a| a.role),
            call_id: attempt.map(|a| a.call_id.clone()),
            call_type: attempt.map(|a| a.call_type),
            audio_enabled: kind_enabled(TrackKind::Audio),
            video_enabled: kind_enabled(TrackKind::Video),
            local_stream,
            remote_stream: attempt.and_then(|a| a.remote_stream.clone()),
            is_call_active: self.phase == SessionPhase::Connected,
            is_incoming_call: self.incoming.is_prompting(),
            incoming_call_data: self.incoming.prompt().cloned(),
            call_status: self.status.clone(),
            call_duration: attempt
                .map(|a| a.duration.elapsed_secs(Instant::now()))
                .unwrap_or(0),
            last_end: self.last_end.clone(),
        };
        self.state_tx.send_replace(snapshot);
    }

    fn advance(&mut self, event: SessionEvent) -> Result<(), CallError> {
        let next = transition(self.phase, event)?;
        if next != self.phase {
            let call_id = self.attempt.as_ref().map(|a| a.call_id.as_str()).unwrap_or("-");
            tracing::info!("Call {}: {} -> {} ({:?})", call_id, self.phase, next, event);
        }
        self.phase = next;
        Ok(())
    }

    /// `Some(attempt)` only if `id` is the live attempt and it is not ending.
    fn current(&mut self, id: u64) -> Option<&mut Attempt> {
        self.attempt
            .as_mut()
            .filter(|a| a.id == id && !a.ending.load(Ordering::SeqCst))
    }

    fn forward_snapshots<F>(
        &self,
        mut updates: mpsc::UnboundedReceiver<Option<Value>>,
        token: CancellationToken,
        wrap: F,
    ) where
        F: Fn(Option<Value>) -> Internal + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    update = updates.recv() => match update {
                        Some(snapshot) => {
                            if tx.send(wrap(snapshot)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn forward_peer_events(
        &self,
        attempt: u64,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        token: CancellationToken,
    ) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if tx.send(Internal::Peer { attempt, event }).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    fn schedule(&self, token: CancellationToken, delay: std::time::Duration, event: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(event);
                }
            }
        });
    }

    fn start_ticker(&self, attempt: u64, token: CancellationToken) {
        let tx = self.internal_tx.clone();
        let period = self.config.duration_tick;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(Internal::Tick { attempt }).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn watch_incoming(&mut self) {
        let (handle, updates) = self.signaling.watch_incoming(&self.self_id).into_parts();
        self.incoming_watch = Some(handle);
        self.forward_snapshots(updates, self.shutdown.clone(), Internal::Incoming);
    }
}

#[cfg(test)]
mod tests;
