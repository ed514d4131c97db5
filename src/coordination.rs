//! Cluster-wide coordination primitives.
//!
//! Networks need a little shared state that outlives any single coordinator,
//! such as the registry of live networks and the lock serializing changes to
//! one network. The core treats this as a capability: named key/value maps,
//! sets, lists, queues, locks and id generators, each addressed by name.
//! Production backends (a data grid, etcd, a database) implement
//! [`Coordination`]; [`InMemoryCoordination`] keeps everything in the local
//! process.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::trace;

/// Named shared data structures and locks.
#[async_trait]
pub trait Coordination: Send + Sync {
  /// Returns the value stored under `key` in map `map`.
  async fn get(&self, map: &str, key: &str) -> Option<Value>;

  /// Stores `value` under `key` in map `map`, returning the previous value.
  async fn put(&self, map: &str, key: &str, value: Value) -> Option<Value>;

  /// Stores `value` only if `key` is absent. Returns true if it was stored.
  async fn put_if_absent(&self, map: &str, key: &str, value: Value) -> bool;

  /// Removes `key` from map `map`, returning the removed value.
  async fn remove(&self, map: &str, key: &str) -> Option<Value>;

  /// Lists the keys of map `map`.
  async fn keys(&self, map: &str) -> Vec<String>;

  /// Adds `value` to set `set`. Returns false if it was already a member.
  async fn set_add(&self, set: &str, value: Value) -> bool;

  /// Removes `value` from set `set`. Returns true if it was a member.
  async fn set_remove(&self, set: &str, value: &Value) -> bool;

  /// Whether `value` is a member of set `set`.
  async fn set_contains(&self, set: &str, value: &Value) -> bool;

  /// Members of set `set` in insertion order.
  async fn set_members(&self, set: &str) -> Vec<Value>;

  /// Appends `value` to list `list`.
  async fn list_push(&self, list: &str, value: Value);

  /// Returns the element at `index` of list `list`.
  async fn list_get(&self, list: &str, index: usize) -> Option<Value>;

  /// Removes and returns the element at `index`, shifting later elements down.
  async fn list_remove(&self, list: &str, index: usize) -> Option<Value>;

  /// Length of list `list`.
  async fn list_len(&self, list: &str) -> usize;

  /// Adds `value` to the tail of queue `queue`.
  async fn queue_push(&self, queue: &str, value: Value);

  /// Takes the head of queue `queue`.
  async fn queue_pop(&self, queue: &str) -> Option<Value>;

  /// Length of queue `queue`.
  async fn queue_len(&self, queue: &str) -> usize;

  /// Takes lock `lock` for `owner` if it is free. Re-entrant for the holder.
  async fn try_lock(&self, lock: &str, owner: &str) -> bool;

  /// Waits up to `timeout` for lock `lock`. Returns true once held by `owner`.
  async fn lock(&self, lock: &str, owner: &str, timeout: Duration) -> bool;

  /// Releases lock `lock`. Returns false if `owner` did not hold it.
  async fn unlock(&self, lock: &str, owner: &str) -> bool;

  /// Returns the next value of the named monotonically increasing id generator.
  async fn next_id(&self, generator: &str) -> u64;
}

#[derive(Debug, Default)]
struct CoordinationState {
  maps: HashMap<String, HashMap<String, Value>>,
  sets: HashMap<String, Vec<Value>>,
  lists: HashMap<String, Vec<Value>>,
  queues: HashMap<String, VecDeque<Value>>,
  locks: HashMap<String, String>,
  ids: HashMap<String, u64>,
}

/// Process-local [`Coordination`] implementation.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCoordination {
  state: Arc<RwLock<CoordinationState>>,
  released: Arc<Notify>,
}

impl InMemoryCoordination {
  /// Creates empty coordination state.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Coordination for InMemoryCoordination {
  async fn get(&self, map: &str, key: &str) -> Option<Value> {
    let state = self.state.read().await;
    state.maps.get(map).and_then(|m| m.get(key)).cloned()
  }

  async fn put(&self, map: &str, key: &str, value: Value) -> Option<Value> {
    let mut state = self.state.write().await;
    state
      .maps
      .entry(map.to_string())
      .or_default()
      .insert(key.to_string(), value)
  }

  async fn put_if_absent(&self, map: &str, key: &str, value: Value) -> bool {
    let mut state = self.state.write().await;
    let entries = state.maps.entry(map.to_string()).or_default();
    if entries.contains_key(key) {
      return false;
    }
    entries.insert(key.to_string(), value);
    true
  }

  async fn remove(&self, map: &str, key: &str) -> Option<Value> {
    let mut state = self.state.write().await;
    state.maps.get_mut(map).and_then(|m| m.remove(key))
  }

  async fn keys(&self, map: &str) -> Vec<String> {
    let state = self.state.read().await;
    let mut keys: Vec<String> = state
      .maps
      .get(map)
      .map(|m| m.keys().cloned().collect())
      .unwrap_or_default();
    keys.sort();
    keys
  }

  async fn set_add(&self, set: &str, value: Value) -> bool {
    let mut state = self.state.write().await;
    let members = state.sets.entry(set.to_string()).or_default();
    if members.contains(&value) {
      return false;
    }
    members.push(value);
    true
  }

  async fn set_remove(&self, set: &str, value: &Value) -> bool {
    let mut state = self.state.write().await;
    let Some(members) = state.sets.get_mut(set) else {
      return false;
    };
    let before = members.len();
    members.retain(|m| m != value);
    members.len() != before
  }

  async fn set_contains(&self, set: &str, value: &Value) -> bool {
    let state = self.state.read().await;
    state.sets.get(set).is_some_and(|m| m.contains(value))
  }

  async fn set_members(&self, set: &str) -> Vec<Value> {
    let state = self.state.read().await;
    state.sets.get(set).cloned().unwrap_or_default()
  }

  async fn list_push(&self, list: &str, value: Value) {
    let mut state = self.state.write().await;
    state.lists.entry(list.to_string()).or_default().push(value);
  }

  async fn list_get(&self, list: &str, index: usize) -> Option<Value> {
    let state = self.state.read().await;
    state.lists.get(list).and_then(|l| l.get(index)).cloned()
  }

  async fn list_remove(&self, list: &str, index: usize) -> Option<Value> {
    let mut state = self.state.write().await;
    let elements = state.lists.get_mut(list)?;
    (index < elements.len()).then(|| elements.remove(index))
  }

  async fn list_len(&self, list: &str) -> usize {
    let state = self.state.read().await;
    state.lists.get(list).map_or(0, Vec::len)
  }

  async fn queue_push(&self, queue: &str, value: Value) {
    let mut state = self.state.write().await;
    state.queues.entry(queue.to_string()).or_default().push_back(value);
  }

  async fn queue_pop(&self, queue: &str) -> Option<Value> {
    let mut state = self.state.write().await;
    state.queues.get_mut(queue).and_then(VecDeque::pop_front)
  }

  async fn queue_len(&self, queue: &str) -> usize {
    let state = self.state.read().await;
    state.queues.get(queue).map_or(0, VecDeque::len)
  }

  async fn try_lock(&self, lock: &str, owner: &str) -> bool {
    let mut state = self.state.write().await;
    match state.locks.get(lock) {
      Some(holder) => holder == owner,
      None => {
        state.locks.insert(lock.to_string(), owner.to_string());
        trace!(lock, owner, "Lock taken");
        true
      }
    }
  }

  async fn lock(&self, lock: &str, owner: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
      // Registered before the attempt so a release in between is not missed.
      let released = self.released.notified();
      if self.try_lock(lock, owner).await {
        return true;
      }
      if tokio::time::timeout_at(deadline, released).await.is_err() {
        return false;
      }
    }
  }

  async fn unlock(&self, lock: &str, owner: &str) -> bool {
    let mut state = self.state.write().await;
    if state.locks.get(lock).map(String::as_str) != Some(owner) {
      return false;
    }
    state.locks.remove(lock);
    self.released.notify_waiters();
    trace!(lock, owner, "Lock released");
    true
  }

  async fn next_id(&self, generator: &str) -> u64 {
    let mut state = self.state.write().await;
    let counter = state.ids.entry(generator.to_string()).or_insert(0);
    *counter += 1;
    *counter
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_map_operations() {
    let c = InMemoryCoordination::new();
    assert!(c.get("networks", "a").await.is_none());
    assert!(c.put("networks", "a", json!(1)).await.is_none());
    assert_eq!(c.put("networks", "a", json!(2)).await, Some(json!(1)));
    assert!(!c.put_if_absent("networks", "a", json!(3)).await);
    assert!(c.put_if_absent("networks", "b", json!(3)).await);
    assert_eq!(c.keys("networks").await, vec!["a", "b"]);
    assert_eq!(c.remove("networks", "a").await, Some(json!(2)));
    assert_eq!(c.keys("networks").await, vec!["b"]);
  }

  #[tokio::test]
  async fn test_set_deduplicates_members() {
    let c = InMemoryCoordination::new();
    assert!(c.set_add("workers", json!("net.a-1")).await);
    assert!(!c.set_add("workers", json!("net.a-1")).await);
    assert!(c.set_add("workers", json!({"address": "net.b-1"})).await);
    assert!(c.set_contains("workers", &json!("net.a-1")).await);
    assert_eq!(c.set_members("workers").await.len(), 2);

    assert!(c.set_remove("workers", &json!("net.a-1")).await);
    assert!(!c.set_remove("workers", &json!("net.a-1")).await);
    assert!(!c.set_contains("workers", &json!("net.a-1")).await);
    assert!(c.set_members("other").await.is_empty());
  }

  #[tokio::test]
  async fn test_list_keeps_order_and_shifts_on_remove() {
    let c = InMemoryCoordination::new();
    for n in 0..3 {
      c.list_push("events", json!(n)).await;
    }
    assert_eq!(c.list_len("events").await, 3);
    assert_eq!(c.list_get("events", 1).await, Some(json!(1)));
    assert_eq!(c.list_remove("events", 0).await, Some(json!(0)));
    assert_eq!(c.list_get("events", 0).await, Some(json!(1)));
    assert_eq!(c.list_remove("events", 5).await, None);
    assert_eq!(c.list_len("events").await, 2);
    assert_eq!(c.list_len("missing").await, 0);
  }

  #[tokio::test]
  async fn test_queue_is_fifo() {
    let c = InMemoryCoordination::new();
    c.queue_push("jobs", json!("first")).await;
    c.queue_push("jobs", json!("second")).await;
    assert_eq!(c.queue_len("jobs").await, 2);
    assert_eq!(c.queue_pop("jobs").await, Some(json!("first")));
    assert_eq!(c.queue_pop("jobs").await, Some(json!("second")));
    assert_eq!(c.queue_pop("jobs").await, None);
  }

  #[tokio::test]
  async fn test_lock_is_owned_and_reentrant() {
    let c = InMemoryCoordination::new();
    assert!(c.try_lock("networks.a", "m1").await);
    assert!(c.try_lock("networks.a", "m1").await);
    assert!(!c.try_lock("networks.a", "m2").await);
    assert!(c.try_lock("networks.b", "m2").await);

    assert!(!c.unlock("networks.a", "m2").await);
    assert!(c.unlock("networks.a", "m1").await);
    assert!(c.try_lock("networks.a", "m2").await);
  }

  #[tokio::test(start_paused = true)]
  async fn test_lock_waits_for_release_or_times_out() {
    let c = InMemoryCoordination::new();
    assert!(c.lock("networks.a", "m1", Duration::ZERO).await);
    assert!(!c.lock("networks.a", "m2", Duration::from_secs(1)).await);

    let holder = c.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      holder.unlock("networks.a", "m1").await;
    });
    let started = Instant::now();
    assert!(c.lock("networks.a", "m2", Duration::from_secs(5)).await);
    assert!(started.elapsed() >= Duration::from_millis(300));
  }

  #[tokio::test]
  async fn test_id_generators_are_independent() {
    let c = InMemoryCoordination::new();
    assert_eq!(c.next_id("x").await, 1);
    assert_eq!(c.next_id("x").await, 2);
    assert_eq!(c.next_id("y").await, 1);
  }
}
