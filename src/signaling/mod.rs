//! Signaling Channel
//!
//! A keyed-record relay used only to exchange call metadata and candidates
//! between two parties that cannot reach each other directly yet.
//! Features:
//! - put / push / remove of JSON records at slash-separated paths
//! - change subscriptions on a path or on a field-equality query
//! - typed helpers for the `calls/{id}` layout
//!
//! Relays deliver change notifications at least once, echo a writer's own
//! changes back to it, and give no ordering guarantee across paths. Every
//! consumer must therefore treat notifications as replayable snapshots.

mod memory;

pub use memory::MemoryRelay;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{CallRecord, CallStatus, CandidateRecord, SessionDescription};

/// Relay-related errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Relay closed")]
    Closed,
}

/// Handle that ends a subscription. Unsubscribing twice is a no-op and
/// dropping the handle unsubscribes.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WatchHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A live subscription: the current value at the watched location, then one
/// snapshot per change. `None` means nothing is stored there.
pub struct Subscription {
    handle: WatchHandle,
    updates: mpsc::UnboundedReceiver<Option<Value>>,
}

impl Subscription {
    pub fn new(handle: WatchHandle, updates: mpsc::UnboundedReceiver<Option<Value>>) -> Self {
        Self { handle, updates }
    }

    /// Next snapshot, or `None` once the relay side has gone away.
    pub async fn next(&mut self) -> Option<Option<Value>> {
        self.updates.recv().await
    }

    pub fn unsubscribe(&mut self) {
        self.handle.unsubscribe();
    }

    pub fn into_parts(self) -> (WatchHandle, mpsc::UnboundedReceiver<Option<Value>>) {
        (self.handle, self.updates)
    }
}

/// The external realtime relay
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Replace the value at `path` (last write wins).
    async fn write(&self, path: &str, value: Value) -> Result<(), RelayError>;

    /// One-shot read of the value at `path`.
    async fn read(&self, path: &str) -> Result<Option<Value>, RelayError>;

    /// Append a child under `path` and return its relay-assigned key.
    async fn push(&self, path: &str, value: Value) -> Result<String, RelayError>;

    /// Delete `path` and everything below it. Removing a missing path succeeds.
    async fn remove(&self, path: &str) -> Result<(), RelayError>;

    /// Observe `path` and its subtree.
    fn watch(&self, path: &str) -> Subscription;

    /// Observe the children of `collection` whose `field` equals `value`.
    fn watch_where(&self, collection: &str, field: &str, value: &str) -> Subscription;
}

const CALLS: &str = "calls";

/// Typed access to the `calls/{id}` layout on top of a relay
#[derive(Clone)]
pub struct CallSignaling {
    relay: Arc<dyn SignalingChannel>,
}

impl CallSignaling {
    pub fn new(relay: Arc<dyn SignalingChannel>) -> Self {
        Self { relay }
    }

    pub fn call_path(call_id: &str) -> String {
        format!("{}/{}", CALLS, call_id)
    }

    pub fn candidates_path(call_id: &str) -> String {
        format!("{}/{}/candidates", CALLS, call_id)
    }

    /// Write a whole call record (caller side, at creation).
    pub async fn write_call(&self, record: &CallRecord) -> Result<(), RelayError> {
        let value = serde_json::to_value(record)?;
        self.relay.write(&Self::call_path(&record.id), value).await?;
        tracing::debug!("Call {} saved ({:?})", record.id, record.status);
        Ok(())
    }

    /// Write the callee's answer and flip the status to accepted.
    ///
    /// Fields are written individually so candidates already published under
    /// the record survive; the answer lands before the status.
    pub async fn write_answer(
        &self,
        call_id: &str,
        answer: &SessionDescription,
    ) -> Result<(), RelayError> {
        let base = Self::call_path(call_id);
        self.relay
            .write(&format!("{}/answer", base), serde_json::to_value(answer)?)
            .await?;
        self.write_status(call_id, CallStatus::Accepted).await
    }

    pub async fn write_status(&self, call_id: &str, status: CallStatus) -> Result<(), RelayError> {
        let path = format!("{}/status", Self::call_path(call_id));
        self.relay.write(&path, serde_json::to_value(status)?).await?;
        tracing::debug!("Call {} status -> {:?}", call_id, status);
        Ok(())
    }

    pub async fn push_candidate(
        &self,
        call_id: &str,
        candidate: &CandidateRecord,
    ) -> Result<String, RelayError> {
        let value = serde_json::to_value(candidate)?;
        self.relay.push(&Self::candidates_path(call_id), value).await
    }

    /// Delete the call record together with its candidates.
    pub async fn remove_call(&self, call_id: &str) -> Result<(), RelayError> {
        self.relay.remove(&Self::call_path(call_id)).await
    }

    /// The stored call record, if there is one.
    pub async fn read_call(&self, call_id: &str) -> Result<Option<CallRecord>, RelayError> {
        let snapshot = self.relay.read(&Self::call_path(call_id)).await?;
        parse_call(snapshot)
    }

    pub fn watch_call(&self, call_id: &str) -> Subscription {
        self.relay.watch(&Self::call_path(call_id))
    }

    pub fn watch_candidates(&self, call_id: &str) -> Subscription {
        self.relay.watch(&Self::candidates_path(call_id))
    }

    /// Calls addressed to `receiver_id`.
    pub fn watch_incoming(&self, receiver_id: &str) -> Subscription {
        self.relay.watch_where(CALLS, "receiverId", receiver_id)
    }
}

/// Decode a call record snapshot. A node without an `id` holds only stray
/// fields written after the record was removed and counts as no record.
pub fn parse_call(snapshot: Option<Value>) -> Result<Option<CallRecord>, RelayError> {
    match snapshot {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(fields)) if !fields.contains_key("id") => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

/// Decode a candidates snapshot into `(key, record)` pairs in key order.
/// Malformed entries are logged and skipped.
pub fn parse_candidates(snapshot: Option<Value>) -> Vec<(String, CandidateRecord)> {
    let Some(Value::Object(entries)) = snapshot else {
        return Vec::new();
    };

    let mut candidates: Vec<(String, CandidateRecord)> = entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value(value) {
            Ok(record) => Some((key, record)),
            Err(e) => {
                tracing::warn!("Skipping malformed candidate {}: {}", key, e);
                None
            }
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates
}

/// Decode a query snapshot of call records. Malformed entries are skipped.
pub fn parse_calls(snapshot: Option<Value>) -> Vec<CallRecord> {
    let Some(Value::Object(entries)) = snapshot else {
        return Vec::new();
    };

    entries
        .into_iter()
        .filter_map(|(key, value)| match serde_json::from_value::<CallRecord>(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping malformed call record {}: {}", key, e);
                None
            }
        })
        .collect()
}
