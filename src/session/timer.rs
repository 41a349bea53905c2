//! Call duration tracking

use tokio::time::Instant;

/// Seconds since the call reached `Connected`; zero otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct DurationTracker {
    connected_at: Option<Instant>,
}

impl DurationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting. Later calls keep the first connect time.
    pub fn start(&mut self, now: Instant) {
        if self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
    }

    pub fn reset(&mut self) {
        self.connected_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.connected_at.is_some()
    }

    pub fn elapsed_secs(&self, now: Instant) -> u64 {
        self.connected_at
            .map(|start| now.saturating_duration_since(start).as_secs())
            .unwrap_or(0)
    }
}

/// Format seconds as `MM:SS`. Minutes keep counting past 59.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
