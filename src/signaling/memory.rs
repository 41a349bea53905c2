//! In-process relay
//!
//! Stores one JSON tree and notifies watchers synchronously after every
//! mutation, including the writer's own watchers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{RelayError, SignalingChannel, Subscription, WatchHandle};

enum WatchTarget {
    Path(Vec<String>),
    Query {
        collection: Vec<String>,
        field: String,
        value: String,
    },
}

impl WatchTarget {
    fn anchor(&self) -> &[String] {
        match self {
            WatchTarget::Path(path) => path,
            WatchTarget::Query { collection, .. } => collection,
        }
    }
}

struct Watcher {
    target: WatchTarget,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

#[derive(Default)]
struct RelayInner {
    root: Map<String, Value>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    next_push: u64,
    fail_writes: bool,
    unsubscribes: usize,
    removals: Vec<String>,
}

fn split(path: &str) -> Result<Vec<String>, RelayError> {
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if segments.is_empty() {
        return Err(RelayError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    prefix.len() <= path.len() && prefix.iter().zip(path).all(|(a, b)| a == b)
}

impl RelayInner {
    fn get(&self, path: &[String]) -> Option<Value> {
        let (first, rest) = path.split_first()?;
        let mut node = self.root.get(first)?;
        for segment in rest {
            node = node.as_object()?.get(segment)?;
        }
        Some(node.clone())
    }

    fn set(&mut self, path: &[String], value: Value) {
        if value.is_null() {
            self.delete(path);
            return;
        }

        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut node = &mut self.root;
        for segment in parents {
            let entry = node
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry.as_object_mut() {
                Some(map) => map,
                None => return,
            };
        }
        node.insert(last.clone(), value);
    }

    fn delete(&mut self, path: &[String]) {
        fn delete_in(map: &mut Map<String, Value>, path: &[String]) {
            let Some((first, rest)) = path.split_first() else {
                return;
            };
            if rest.is_empty() {
                map.remove(first);
                return;
            }
            let now_empty = match map.get_mut(first).and_then(Value::as_object_mut) {
                Some(child) => {
                    delete_in(child, rest);
                    child.is_empty()
                }
                None => false,
            };
            // Empty interior nodes do not exist in a keyed store
            if now_empty {
                map.remove(first);
            }
        }
        delete_in(&mut self.root, path);
    }

    fn snapshot(&self, target: &WatchTarget) -> Option<Value> {
        match target {
            WatchTarget::Path(path) => self.get(path),
            WatchTarget::Query {
                collection,
                field,
                value,
            } => {
                let children = self.get(collection)?;
                let matching: Map<String, Value> = children
                    .as_object()?
                    .iter()
                    .filter(|(_, child)| {
                        child.get(field).and_then(Value::as_str) == Some(value.as_str())
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if matching.is_empty() {
                    None
                } else {
                    Some(Value::Object(matching))
                }
            }
        }
    }

    fn notify(&mut self, changed: &[String]) {
        let mut closed = Vec::new();
        for (id, watcher) in &self.watchers {
            let anchor = watcher.target.anchor();
            if !is_prefix(anchor, changed) && !is_prefix(changed, anchor) {
                continue;
            }
            if watcher.tx.send(self.snapshot(&watcher.target)).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.watchers.remove(&id);
        }
    }
}

/// Relay kept entirely in memory; cloning shares the same store.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RelayInner>, RelayError> {
        self.inner.lock().map_err(|_| RelayError::Closed)
    }

    /// Current value at `path`.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = split(path).ok()?;
        self.lock().ok()?.get(&segments)
    }

    /// Make writes and pushes fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut inner) = self.lock() {
            inner.fail_writes = fail;
        }
    }

    pub fn active_watchers(&self) -> usize {
        self.lock().map(|i| i.watchers.len()).unwrap_or(0)
    }

    /// Number of subscriptions ended through their handle.
    pub fn unsubscribe_count(&self) -> usize {
        self.lock().map(|i| i.unsubscribes).unwrap_or(0)
    }

    /// Every path passed to `remove`, in call order.
    pub fn removals(&self) -> Vec<String> {
        self.lock().map(|i| i.removals.clone()).unwrap_or_default()
    }

    fn subscribe(&self, target: WatchTarget) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak: Weak<Mutex<RelayInner>> = Arc::downgrade(&self.inner);

        let id = match self.inner.lock() {
            Ok(mut inner) => {
                let id = inner.next_watcher;
                inner.next_watcher += 1;
                // Initial value is delivered like any other change
                let _ = tx.send(inner.snapshot(&target));
                inner.watchers.insert(id, Watcher { target, tx });
                Some(id)
            }
            Err(_) => None,
        };

        let handle = WatchHandle::new(move || {
            let (Some(id), Some(inner)) = (id, weak.upgrade()) else {
                return;
            };
            if let Ok(mut inner) = inner.lock() {
                if inner.watchers.remove(&id).is_some() {
                    inner.unsubscribes += 1;
                }
            };
        });
        Subscription::new(handle, rx)
    }
}

#[async_trait]
impl SignalingChannel for MemoryRelay {
    async fn write(&self, path: &str, value: Value) -> Result<(), RelayError> {
        let segments = split(path)?;
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(RelayError::WriteFailed(path.to_string()));
        }
        inner.set(&segments, value);
        inner.notify(&segments);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, RelayError> {
        let segments = split(path)?;
        let inner = self.lock()?;
        Ok(inner.get(&segments))
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, RelayError> {
        let mut segments = split(path)?;
        let mut inner = self.lock()?;
        if inner.fail_writes {
            return Err(RelayError::WriteFailed(path.to_string()));
        }
        inner.next_push += 1;
        // Keys sort in push order
        let key = format!("-k{:012}", inner.next_push);
        segments.push(key.clone());
        inner.set(&segments, value);
        inner.notify(&segments);
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<(), RelayError> {
        let segments = split(path)?;
        let mut inner = self.lock()?;
        inner.removals.push(path.to_string());
        if inner.get(&segments).is_none() {
            return Ok(());
        }
        inner.delete(&segments);
        inner.notify(&segments);
        Ok(())
    }

    fn watch(&self, path: &str) -> Subscription {
        let segments = split(path).unwrap_or_default();
        self.subscribe(WatchTarget::Path(segments))
    }

    fn watch_where(&self, collection: &str, field: &str, value: &str) -> Subscription {
        let segments = split(collection).unwrap_or_default();
        self.subscribe(WatchTarget::Query {
            collection: segments,
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_watch_delivers_initial_and_echo() {
        let relay = MemoryRelay::new();
        let mut sub = relay.watch("calls/c1");

        assert_eq!(sub.next().await, Some(None));

        relay.write("calls/c1", json!({ "status": "ringing" })).await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!({ "status": "ringing" }))));
    }

    #[tokio::test]
    async fn test_read_returns_current_value() {
        let relay = MemoryRelay::new();
        assert_eq!(relay.read("calls/c1").await.unwrap(), None);

        relay.write("calls/c1", json!({ "status": "ringing" })).await.unwrap();
        assert_eq!(relay.read("calls/c1/status").await.unwrap(), Some(json!("ringing")));

        relay.remove("calls/c1").await.unwrap();
        assert_eq!(relay.read("calls/c1").await.unwrap(), None);
        assert!(relay.read("").await.is_err());
    }

    #[tokio::test]
    async fn test_subtree_change_notifies_parent() {
        let relay = MemoryRelay::new();
        relay.write("calls/c1", json!({ "status": "ringing" })).await.unwrap();

        let mut sub = relay.watch("calls/c1");
        let _ = sub.next().await;

        let key = relay.push("calls/c1/candidates", json!({ "candidate": "x" })).await.unwrap();
        let snapshot = sub.next().await.unwrap().unwrap();
        assert_eq!(snapshot["candidates"][&key]["candidate"], json!("x"));
    }

    #[tokio::test]
    async fn test_query_filters_on_field() {
        let relay = MemoryRelay::new();
        let mut sub = relay.watch_where("calls", "receiverId", "bob");
        assert_eq!(sub.next().await, Some(None));

        relay.write("calls/c1", json!({ "receiverId": "carol" })).await.unwrap();
        assert_eq!(sub.next().await, Some(None));

        relay.write("calls/c2", json!({ "receiverId": "bob" })).await.unwrap();
        let snapshot = sub.next().await.unwrap().unwrap();
        assert!(snapshot.get("c2").is_some());
        assert!(snapshot.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_prunes() {
        let relay = MemoryRelay::new();
        relay.write("calls/c1/status", json!("ringing")).await.unwrap();

        relay.remove("calls/c1").await.unwrap();
        relay.remove("calls/c1").await.unwrap();

        assert!(relay.get("calls/c1").is_none());
        assert!(relay.get("calls").is_none());
        assert_eq!(relay.removals().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let relay = MemoryRelay::new();
        let mut sub = relay.watch("calls/c1");
        assert_eq!(relay.active_watchers(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(relay.active_watchers(), 0);
        assert_eq!(relay.unsubscribe_count(), 1);

        relay.write("calls/c1", json!(1)).await.unwrap();
        assert_eq!(sub.next().await, Some(None));
        assert_eq!(sub.next().await, None);
    }

    #[test]
    fn test_unsubscribe_after_relay_dropped() {
        let relay = MemoryRelay::new();
        let mut sub = relay.watch("calls/c1");
        drop(relay);

        sub.unsubscribe();
        drop(sub);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let relay = MemoryRelay::new();
        relay.set_fail_writes(true);

        let result = relay.write("calls/c1", json!(1)).await;
        assert!(matches!(result, Err(RelayError::WriteFailed(_))));

        relay.set_fail_writes(false);
        assert!(relay.write("calls/c1", json!(1)).await.is_ok());
    }
}
