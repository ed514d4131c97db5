//! Message bus abstraction used by every component of a network.
//!
//! The core only needs four capabilities from the underlying bus: publish to
//! all handlers on an address, point-to-point send (with or without a reply),
//! and handler registration. [`LocalTransport`] implements them in-process on
//! top of tokio channels.
//!
//! Replies between components follow one convention: `{"status": "ok", ...}`
//! on success and `{"status": "error", "message": ...}` on failure. Use
//! [`ok_reply`], [`error_reply`] and [`reply_result`] to build and read them.

use crate::error::ConnectionError;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::trace;

/// A message delivered to a registered handler.
#[derive(Debug)]
pub struct Delivery {
  body: Value,
  reply: Option<oneshot::Sender<Value>>,
}

impl Delivery {
  /// Creates a delivery that expects a reply on `reply`.
  pub fn with_reply(body: Value, reply: oneshot::Sender<Value>) -> Self {
    Self {
      body,
      reply: Some(reply),
    }
  }

  /// Creates a delivery that does not expect a reply.
  pub fn oneway(body: Value) -> Self {
    Self { body, reply: None }
  }

  /// The message body.
  pub fn body(&self) -> &Value {
    &self.body
  }

  /// Returns true if the sender is waiting for a reply.
  pub fn expects_reply(&self) -> bool {
    self.reply.is_some()
  }

  /// Replies to the sender. Returns false if nobody is waiting any more.
  pub fn reply(&mut self, value: Value) -> bool {
    match self.reply.take() {
      Some(tx) => tx.send(value).is_ok(),
      None => false,
    }
  }

  /// Splits the delivery into its body and reply channel.
  pub fn into_parts(self) -> (Value, Option<oneshot::Sender<Value>>) {
    (self.body, self.reply)
  }
}

/// The receiving side of a handler registration.
#[derive(Debug)]
pub struct Subscription {
  address: String,
  rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
  /// Creates a subscription from its address and delivery channel.
  pub fn new(address: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
    Self {
      address: address.into(),
      rx,
    }
  }

  /// The address this subscription listens on.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Waits for the next delivery. Returns `None` once unregistered.
  pub async fn recv(&mut self) -> Option<Delivery> {
    self.rx.recv().await
  }
}

/// Publish / point-to-point message bus.
///
/// Implementations are expected to provide at-least-once delivery; the core
/// builds its own acking and timeouts on top and assumes no ordering across
/// addresses.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Delivers `body` to every handler registered at `address`.
  async fn publish(&self, address: &str, body: Value) -> Result<(), ConnectionError>;

  /// Delivers `body` to one handler at `address` and waits for its reply.
  ///
  /// No timeout is applied here; callers wrap the future with their own.
  async fn send(&self, address: &str, body: Value) -> Result<Value, ConnectionError>;

  /// Delivers `body` to one handler at `address` without waiting for a reply.
  async fn send_oneway(&self, address: &str, body: Value) -> Result<(), ConnectionError>;

  /// Registers a new handler at `address`.
  async fn register(&self, address: &str) -> Result<Subscription, ConnectionError>;

  /// Removes every handler registered at `address`.
  async fn unregister(&self, address: &str) -> Result<(), ConnectionError>;
}

/// Builds a success reply, merging the fields of `fields` if it is an object.
pub fn ok_reply(fields: Value) -> Value {
  let mut map = match fields {
    Value::Object(map) => map,
    Value::Null => Map::new(),
    other => {
      let mut map = Map::new();
      map.insert("result".to_string(), other);
      map
    }
  };
  map.insert("status".to_string(), Value::String("ok".to_string()));
  Value::Object(map)
}

/// Builds an error reply carrying `message`.
pub fn error_reply(message: impl Into<String>) -> Value {
  json!({ "status": "error", "message": message.into() })
}

/// Interprets a reply built with [`ok_reply`] or [`error_reply`].
pub fn reply_result(reply: Value) -> Result<Value, ConnectionError> {
  match reply.get("status").and_then(Value::as_str) {
    Some("ok") => Ok(reply),
    Some("error") => Err(ConnectionError::Remote(
      reply
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string(),
    )),
    _ => Err(ConnectionError::Serialization(format!(
      "reply has no status: {}",
      reply
    ))),
  }
}

#[derive(Debug)]
struct HandlerEntry {
  id: u64,
  tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct AddressHandlers {
  handlers: Vec<HandlerEntry>,
  cursor: usize,
}

impl AddressHandlers {
  fn prune(&mut self) {
    self.handlers.retain(|h| !h.tx.is_closed());
  }

  fn next(&mut self) -> Option<&HandlerEntry> {
    self.prune();
    if self.handlers.is_empty() {
      return None;
    }
    let idx = self.cursor % self.handlers.len();
    self.cursor = self.cursor.wrapping_add(1);
    self.handlers.get(idx)
  }
}

/// In-process transport backed by unbounded tokio channels.
///
/// `send` picks handlers on an address round-robin; `publish` reaches all of
/// them. Clones share the same bus.
#[derive(Clone, Debug, Default)]
pub struct LocalTransport {
  addresses: Arc<RwLock<HashMap<String, AddressHandlers>>>,
  next_id: Arc<AtomicU64>,
}

impl LocalTransport {
  /// Creates an empty bus.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the number of live handlers at `address`.
  pub async fn handler_count(&self, address: &str) -> usize {
    let addresses = self.addresses.read().await;
    addresses
      .get(address)
      .map(|a| a.handlers.iter().filter(|h| !h.tx.is_closed()).count())
      .unwrap_or(0)
  }

  async fn deliver_one(&self, address: &str, delivery: Delivery) -> Result<(), ConnectionError> {
    let mut addresses = self.addresses.write().await;
    let handlers = addresses
      .get_mut(address)
      .ok_or_else(|| ConnectionError::NoHandlers(address.to_string()))?;
    let entry = handlers
      .next()
      .ok_or_else(|| ConnectionError::NoHandlers(address.to_string()))?;
    trace!(address = %address, handler = entry.id, "Delivering point-to-point message");
    entry.tx.send(delivery).map_err(|_| ConnectionError::Closed)
  }
}

#[async_trait]
impl Transport for LocalTransport {
  async fn publish(&self, address: &str, body: Value) -> Result<(), ConnectionError> {
    let mut addresses = self.addresses.write().await;
    if let Some(handlers) = addresses.get_mut(address) {
      handlers.prune();
      for entry in &handlers.handlers {
        // A handler closing concurrently just misses this publish.
        let _ = entry.tx.send(Delivery::oneway(body.clone()));
      }
    }
    Ok(())
  }

  async fn send(&self, address: &str, body: Value) -> Result<Value, ConnectionError> {
    let (tx, rx) = oneshot::channel();
    self
      .deliver_one(address, Delivery::with_reply(body, tx))
      .await?;
    rx.await.map_err(|_| ConnectionError::Closed)
  }

  async fn send_oneway(&self, address: &str, body: Value) -> Result<(), ConnectionError> {
    self.deliver_one(address, Delivery::oneway(body)).await
  }

  async fn register(&self, address: &str) -> Result<Subscription, ConnectionError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut addresses = self.addresses.write().await;
    addresses
      .entry(address.to_string())
      .or_default()
      .handlers
      .push(HandlerEntry { id, tx });
    trace!(address = %address, handler = id, "Registered handler");
    Ok(Subscription::new(address, rx))
  }

  async fn unregister(&self, address: &str) -> Result<(), ConnectionError> {
    let mut addresses = self.addresses.write().await;
    addresses.remove(address);
    trace!(address = %address, "Unregistered handlers");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_send_round_robins_between_handlers() {
    let bus = LocalTransport::new();
    let mut a = bus.register("addr").await.unwrap();
    let mut b = bus.register("addr").await.unwrap();

    bus.send_oneway("addr", json!(1)).await.unwrap();
    bus.send_oneway("addr", json!(2)).await.unwrap();

    assert_eq!(a.recv().await.unwrap().body(), &json!(1));
    assert_eq!(b.recv().await.unwrap().body(), &json!(2));
  }

  #[tokio::test]
  async fn test_publish_reaches_all_handlers() {
    let bus = LocalTransport::new();
    let mut a = bus.register("addr").await.unwrap();
    let mut b = bus.register("addr").await.unwrap();

    bus.publish("addr", json!("hello")).await.unwrap();

    assert_eq!(a.recv().await.unwrap().body(), &json!("hello"));
    assert_eq!(b.recv().await.unwrap().body(), &json!("hello"));
  }

  #[tokio::test]
  async fn test_send_waits_for_reply() {
    let bus = LocalTransport::new();
    let mut sub = bus.register("echo").await.unwrap();
    tokio::spawn(async move {
      while let Some(mut delivery) = sub.recv().await {
        let body = delivery.body().clone();
        delivery.reply(body);
      }
    });

    let reply = bus.send("echo", json!({"x": 1})).await.unwrap();
    assert_eq!(reply, json!({"x": 1}));
  }

  #[tokio::test]
  async fn test_send_without_handlers_fails() {
    let bus = LocalTransport::new();
    let err = bus.send("nowhere", json!(null)).await.unwrap_err();
    assert_eq!(err, ConnectionError::NoHandlers("nowhere".to_string()));
  }

  #[tokio::test]
  async fn test_dropped_delivery_reports_closed() {
    let bus = LocalTransport::new();
    let mut sub = bus.register("sink").await.unwrap();
    tokio::spawn(async move {
      let _ = sub.recv().await;
    });
    let err = bus.send("sink", json!(null)).await.unwrap_err();
    assert_eq!(err, ConnectionError::Closed);
  }

  #[tokio::test]
  async fn test_unregister_closes_subscription() {
    let bus = LocalTransport::new();
    let mut sub = bus.register("addr").await.unwrap();
    bus.unregister("addr").await.unwrap();
    assert!(sub.recv().await.is_none());
    assert_eq!(bus.handler_count("addr").await, 0);
  }

  #[test]
  fn test_reply_helpers() {
    let ok = ok_reply(json!({"address": "hb"}));
    assert_eq!(ok["status"], "ok");
    assert_eq!(ok["address"], "hb");
    assert!(reply_result(ok).is_ok());

    let err = reply_result(error_reply("boom")).unwrap_err();
    assert_eq!(err, ConnectionError::Remote("boom".to_string()));
  }
}
