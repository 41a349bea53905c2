//! Call Configuration
//!
//! Timeouts, ICE servers and capture constraints used by a call session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// STUN/TURN server entry handed to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Public Google STUN servers.
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
            Self::stun("stun:stun2.l.google.com:19302"),
        ]
    }
}

/// Audio capture processing flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 44100,
        }
    }
}

/// A preferred value with an upper bound; devices degrade below `ideal` as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub ideal: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: Range,
    pub height: Range,
    pub frame_rate: Range,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: Range { ideal: 1280, max: 1920 },
            height: Range { ideal: 720, max: 1080 },
            frame_rate: Range { ideal: 30, max: 60 },
        }
    }
}

/// Constraints passed to the media device API for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    /// `None` requests an audio-only stream.
    pub video: Option<VideoConstraints>,
}

/// Call session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN/TURN servers for the peer transport
    pub ice_servers: Vec<IceServer>,

    /// Caller gives up when nobody answers within this window
    pub ring_timeout: Duration,

    /// Ringing records older than this are never surfaced as incoming calls
    pub incoming_max_age: Duration,

    /// Unanswered incoming prompts are rejected after this window
    pub incoming_auto_reject: Duration,

    /// Grace window after the peer connection reports `failed`
    pub connection_failed_grace: Duration,

    /// Grace window after the ICE layer reports `failed`
    pub ice_failed_grace: Duration,

    /// A `disconnected` transport that does not recover within this window is torn down
    pub disconnected_grace: Duration,

    /// Incoming notifications are ignored this long after a teardown
    pub end_cooldown: Duration,

    /// Call duration refresh interval
    pub duration_tick: Duration,

    /// Audio capture constraints
    pub audio: AudioConstraints,

    /// Video capture constraints, used for video calls
    pub video: VideoConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            ring_timeout: Duration::from_secs(30),
            incoming_max_age: Duration::from_secs(30),
            incoming_auto_reject: Duration::from_secs(30),
            connection_failed_grace: Duration::from_millis(2000),
            ice_failed_grace: Duration::from_millis(3000),
            disconnected_grace: Duration::from_secs(10),
            end_cooldown: Duration::from_millis(1000),
            duration_tick: Duration::from_secs(1),
            audio: AudioConstraints::default(),
            video: VideoConstraints::default(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

impl CallConfig {
    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ice_servers = std::env::var("CALL_ICE_SERVERS")
            .ok()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(IceServer::stun)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.ice_servers);

        Self {
            ice_servers,
            ring_timeout: env_secs("CALL_RING_TIMEOUT_SECS").unwrap_or(defaults.ring_timeout),
            incoming_max_age: env_secs("CALL_INCOMING_MAX_AGE_SECS")
                .unwrap_or(defaults.incoming_max_age),
            incoming_auto_reject: env_secs("CALL_AUTO_REJECT_SECS")
                .unwrap_or(defaults.incoming_auto_reject),
            connection_failed_grace: env_millis("CALL_FAILED_GRACE_MS")
                .unwrap_or(defaults.connection_failed_grace),
            ice_failed_grace: env_millis("CALL_ICE_FAILED_GRACE_MS")
                .unwrap_or(defaults.ice_failed_grace),
            disconnected_grace: env_secs("CALL_DISCONNECTED_GRACE_SECS")
                .unwrap_or(defaults.disconnected_grace),
            end_cooldown: env_millis("CALL_END_COOLDOWN_MS").unwrap_or(defaults.end_cooldown),
            ..defaults
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.ice_servers.is_empty() {
            return Err("At least one ICE server is required".to_string());
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err("ICE server entry without URLs".to_string());
        }
        if self.ring_timeout.is_zero() {
            return Err("Ring timeout must be positive".to_string());
        }
        if self.incoming_max_age.is_zero() || self.incoming_auto_reject.is_zero() {
            return Err("Incoming call windows must be positive".to_string());
        }
        if self.duration_tick.is_zero() {
            return Err("Duration tick must be positive".to_string());
        }
        if self.connection_failed_grace > self.ring_timeout
            || self.ice_failed_grace > self.ring_timeout
        {
            return Err("Failure grace windows must not exceed the ring timeout".to_string());
        }
        Ok(())
    }

    /// Capture constraints for one call attempt
    pub fn media_constraints(&self, want_video: bool) -> MediaConstraints {
        MediaConstraints {
            audio: self.audio.clone(),
            video: want_video.then(|| self.video.clone()),
        }
    }

    pub fn ring_timeout_ms(&self) -> i64 {
        self.ring_timeout.as_millis() as i64
    }
}
