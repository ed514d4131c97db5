//! Point-to-point connection with timeout and bounded retry.

use crate::error::ConnectionError;
use crate::transport::{Transport, reply_result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{trace, warn};

/// Per-send delivery options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
  /// How long to wait for a reply to each attempt.
  pub timeout: Duration,
  /// Whether to resend after a timeout or transport failure.
  pub retry: bool,
  /// Maximum physical sends when `retry` is on.
  pub max_attempts: usize,
}

impl Default for SendOptions {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      retry: false,
      max_attempts: 3,
    }
  }
}

impl SendOptions {
  /// Sets the reply timeout.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Enables or disables resending.
  #[must_use]
  pub fn with_retry(mut self, retry: bool) -> Self {
    self.retry = retry;
    self
  }

  /// Sets the attempt limit used when retrying.
  #[must_use]
  pub fn with_max_attempts(mut self, attempts: usize) -> Self {
    self.max_attempts = attempts;
    self
  }

  /// Number of physical sends one logical send may make.
  pub fn attempts(&self) -> usize {
    if self.retry { self.max_attempts.max(1) } else { 1 }
  }
}

/// A request/reply channel to one worker address.
#[derive(Clone)]
pub struct ReliableConnection {
  address: String,
  transport: Arc<dyn Transport>,
}

impl fmt::Debug for ReliableConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReliableConnection")
      .field("address", &self.address)
      .finish()
  }
}

impl ReliableConnection {
  /// Creates a connection to `address`.
  pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
    Self {
      address: address.into(),
      transport,
    }
  }

  /// The target address.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Sends `payload` and waits for the receiver's reply.
  ///
  /// Produces exactly one result per call. A reply with an error status is
  /// final and not retried; timeouts and transport failures are retried while
  /// `options` allow it. When every attempt fails the last failure is
  /// reported.
  pub async fn send<T: Serialize>(&self, payload: &T, options: &SendOptions) -> Result<Value, ConnectionError> {
    let body = serde_json::to_value(payload)?;
    let attempts = options.attempts();
    let mut last_error = ConnectionError::Timeout;

    for attempt in 1..=attempts {
      match timeout(options.timeout, self.transport.send(&self.address, body.clone())).await {
        Ok(Ok(reply)) => {
          trace!(address = %self.address, attempt, "Send acknowledged");
          return reply_result(reply);
        }
        Ok(Err(e)) => last_error = e,
        Err(_) => last_error = ConnectionError::Timeout,
      }
      if attempt < attempts {
        warn!(
          address = %self.address,
          attempt,
          max_attempts = attempts,
          error = %last_error,
          "Send failed, retrying"
        );
      }
    }

    Err(last_error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::{LocalTransport, error_reply, ok_reply};
  use serde_json::json;

  #[test]
  fn test_attempts_respect_retry_flag() {
    let options = SendOptions::default().with_max_attempts(5);
    assert_eq!(options.attempts(), 1);
    assert_eq!(options.clone().with_retry(true).attempts(), 5);
    assert_eq!(options.with_retry(true).with_max_attempts(0).attempts(), 1);
  }

  #[tokio::test]
  async fn test_send_returns_reply() {
    let bus = LocalTransport::new();
    let mut sub = bus.register("w").await.unwrap();
    tokio::spawn(async move {
      let mut delivery = sub.recv().await.unwrap();
      let echoed = delivery.body().clone();
      delivery.reply(ok_reply(json!({ "echo": echoed })));
    });

    let conn = ReliableConnection::new("w", Arc::new(bus));
    let reply = conn.send(&json!("hi"), &SendOptions::default()).await.unwrap();
    assert_eq!(reply["echo"], json!("hi"));
  }

  #[tokio::test]
  async fn test_remote_error_is_not_retried() {
    let bus = LocalTransport::new();
    let mut sub = bus.register("w").await.unwrap();
    tokio::spawn(async move {
      while let Some(mut delivery) = sub.recv().await {
        delivery.reply(error_reply("rejected"));
      }
    });

    let conn = ReliableConnection::new("w", Arc::new(bus));
    let err = conn
      .send(&json!({}), &SendOptions::default().with_retry(true))
      .await
      .unwrap_err();
    assert_eq!(err, ConnectionError::Remote("rejected".to_string()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_silent_receiver_times_out_after_every_attempt() {
    let bus = LocalTransport::new();
    let mut sub = bus.register("w").await.unwrap();
    let (count_tx, mut count_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
      let mut held = Vec::new();
      while let Some(delivery) = sub.recv().await {
        let _ = count_tx.send(());
        held.push(delivery);
      }
    });

    let conn = ReliableConnection::new("w", Arc::new(bus));
    let options = SendOptions::default()
      .with_timeout(Duration::from_secs(1))
      .with_retry(true)
      .with_max_attempts(3);
    let err = conn.send(&json!({"n": 1}), &options).await.unwrap_err();
    assert_eq!(err, ConnectionError::Timeout);

    let mut sends = 0;
    while count_rx.try_recv().is_ok() {
      sends += 1;
    }
    assert_eq!(sends, 3);
  }

  #[tokio::test]
  async fn test_no_handlers_without_retry() {
    let conn = ReliableConnection::new("nowhere", Arc::new(LocalTransport::new()));
    let err = conn.send(&json!({}), &SendOptions::default()).await.unwrap_err();
    assert_eq!(err, ConnectionError::NoHandlers("nowhere".to_string()));
  }
}
