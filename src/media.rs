//! Media Acquisition
//!
//! Requests local capture devices and hands back a stream whose tracks the
//! caller owns until they are stopped. Failures are terminal for the attempt
//! that requested them; nothing here retries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::config::MediaConstraints;

/// Capture failures, each with its own user-facing message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Device busy")]
    DeviceBusy,

    #[error("Media error: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Map a platform error name (as reported by browser-style device APIs).
    pub fn from_name(name: &str) -> Self {
        match name {
            "NotAllowedError" | "SecurityError" => MediaError::PermissionDenied,
            "NotFoundError" | "OverconstrainedError" => MediaError::DeviceNotFound,
            "NotReadableError" | "AbortError" => MediaError::DeviceBusy,
            other => MediaError::Unknown(other.to_string()),
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => "Camera/microphone access denied",
            MediaError::DeviceNotFound => "No camera/microphone found",
            MediaError::DeviceBusy => "Camera/microphone is being used by another application",
            MediaError::Unknown(_) => "Could not access camera/microphone",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    stop_calls: AtomicUsize,
}

/// Handle to one live media track. Clones share the same underlying track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                stop_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute (audio) or blank (video) without releasing the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the device. Repeated calls are harmless but counted.
    pub fn stop(&self) {
        self.inner.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stopped {} track {}", self.inner.kind, self.inner.id);
        }
    }

    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// How many times `stop` has been invoked on this track.
    pub fn stop_count(&self) -> usize {
        self.inner.stop_calls.load(Ordering::SeqCst)
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A set of tracks captured or received together
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    /// Add a track unless one with the same id is already present.
    pub fn add_track(&mut self, track: MediaTrack) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut touched = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            touched += 1;
        }
        touched
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }
}

/// The platform capture API
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Acquire a local stream for one call attempt.
pub async fn acquire(
    devices: &dyn MediaDevices,
    constraints: &MediaConstraints,
) -> Result<MediaStream, MediaError> {
    tracing::info!(
        "Getting user media (video: {})",
        constraints.video.is_some()
    );

    match devices.get_user_media(constraints).await {
        Ok(stream) => {
            tracing::info!("Got media stream with {} tracks", stream.tracks().len());
            Ok(stream)
        }
        Err(e) => {
            tracing::error!("Media error: {}", e);
            Err(e)
        }
    }
}

#[derive(Default)]
struct SyntheticState {
    fail_with: Option<MediaError>,
    delay: Option<Duration>,
    issued: Vec<MediaStream>,
}

/// Capture backend producing synthetic tracks.
///
/// Used by the demo binary and by tests, which can make the next acquisition
/// fail or stall to exercise the abandonment paths.
#[derive(Clone, Default)]
pub struct SyntheticDevices {
    owner: String,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticDevices {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            state: Arc::default(),
        }
    }

    /// Every following acquisition fails with `error` until cleared.
    pub fn fail_with(&self, error: Option<MediaError>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_with = error;
        }
    }

    /// Delay every following acquisition (simulates a pending permission prompt).
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut state) = self.state.lock() {
            state.delay = delay;
        }
    }

    /// Every stream handed out so far, in order.
    pub fn issued(&self) -> Vec<MediaStream> {
        self.state
            .lock()
            .map(|s| s.issued.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let (delay, failure) = {
            let state = self
                .state
                .lock()
                .map_err(|_| MediaError::Unknown("device state poisoned".to_string()))?;
            (state.delay, state.fail_with.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let mut tracks = vec![MediaTrack::new(
            TrackKind::Audio,
            format!("{} microphone", self.owner),
        )];
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                format!("{} camera", self.owner),
            ));
        }

        let stream = MediaStream::new(tracks);
        if let Ok(mut state) = self.state.lock() {
            state.issued.push(stream.clone());
        }
        Ok(stream)
    }
}
