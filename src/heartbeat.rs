//! Heartbeat-based liveness detection.
//!
//! Every registered worker gets a private heartbeat address. The worker runs a
//! [`HeartbeatEmitter`] that publishes an empty beat there every `interval`;
//! the coordinator runs a [`HeartbeatMonitor`] that declares the worker lost
//! when `missed_threshold` intervals pass without a beat.
//!
//! A monitor watches exactly one worker lifetime. Re-registration always
//! creates a new monitor on a new address.

use crate::error::ConnectionError;
use crate::transport::Transport;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Shortest beat interval; anything below is raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat timing shared by monitors and emitters.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
  /// Expected time between beats.
  pub interval: Duration,
  /// Consecutive intervals without a beat before the worker counts as lost.
  pub missed_threshold: u32,
}

impl Default for HeartbeatConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(5),
      missed_threshold: 2,
    }
  }
}

impl HeartbeatConfig {
  /// Sets the beat interval, at least [`MIN_INTERVAL`].
  #[must_use]
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval.max(MIN_INTERVAL);
    self
  }

  /// Sets how many intervals may be missed.
  #[must_use]
  pub fn with_missed_threshold(mut self, threshold: u32) -> Self {
    self.missed_threshold = threshold;
    self
  }

  /// Silence after which a worker is declared lost.
  pub fn loss_window(&self) -> Duration {
    self.interval.max(MIN_INTERVAL) * self.missed_threshold.max(1)
  }
}

/// Allocates a fresh heartbeat address for `worker`.
pub fn heartbeat_address(worker: &str) -> String {
  format!("{}.__heartbeat.{}", worker, Uuid::new_v4())
}

/// Watches one heartbeat address.
pub struct HeartbeatMonitor {
  address: String,
  transport: Arc<dyn Transport>,
  config: HeartbeatConfig,
  shutdown: CancellationToken,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
  /// Creates an idle monitor for `address`.
  pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>, config: HeartbeatConfig) -> Self {
    Self {
      address: address.into(),
      transport,
      config,
      shutdown: CancellationToken::new(),
      task: Mutex::new(None),
    }
  }

  /// The heartbeat address being watched.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Starts listening. `on_lost` runs at most once, when beats stop arriving.
  ///
  /// The monitor unregisters its address when it fires or is unlistened.
  pub async fn listen<F>(&self, on_lost: F) -> Result<(), ConnectionError>
  where
    F: FnOnce() + Send + 'static,
  {
    let mut subscription = self.transport.register(&self.address).await?;
    let transport = self.transport.clone();
    let token = self.shutdown.clone();
    let window = self.config.loss_window();
    let address = self.address.clone();

    let task = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => {
            trace!(address = %address, "Heartbeat monitor stopped");
            break;
          }
          beat = tokio::time::timeout(window, subscription.recv()) => match beat {
            Ok(Some(_)) => trace!(address = %address, "Heartbeat"),
            Ok(None) => break,
            Err(_) => {
              warn!(address = %address, "Heartbeat lost");
              on_lost();
              break;
            }
          }
        }
      }
      if let Err(e) = transport.unregister(&address).await {
        debug!(address = %address, error = %e, "Failed to unregister heartbeat address");
      }
    });

    if let Ok(mut slot) = self.task.lock() {
      if let Some(previous) = slot.replace(task) {
        previous.abort();
      }
    }
    debug!(address = %self.address, window_ms = window.as_millis() as u64, "Listening for heartbeats");
    Ok(())
  }

  /// Stops listening. Safe to call repeatedly or after the monitor fired.
  pub fn unlisten(&self) {
    self.shutdown.cancel();
  }

  /// Returns true once the monitor stopped, whether it fired or was unlistened.
  pub fn is_stopped(&self) -> bool {
    self.shutdown.is_cancelled()
      || self
        .task
        .lock()
        .map(|slot| slot.as_ref().is_some_and(JoinHandle::is_finished))
        .unwrap_or(true)
  }
}

impl Drop for HeartbeatMonitor {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}

/// Publishes beats to a heartbeat address until stopped.
pub struct HeartbeatEmitter {
  address: String,
  shutdown: CancellationToken,
  task: Option<JoinHandle<()>>,
}

impl HeartbeatEmitter {
  /// Starts beating on `address` every `interval`, at least [`MIN_INTERVAL`].
  pub fn start(address: impl Into<String>, transport: Arc<dyn Transport>, interval: Duration) -> Self {
    let address = address.into();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let target = address.clone();

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = ticker.tick() => {
            if let Err(e) = transport.publish(&target, Value::Null).await {
              warn!(address = %target, error = %e, "Failed to publish heartbeat");
            }
          }
        }
      }
    });

    Self {
      address,
      shutdown,
      task: Some(task),
    }
  }

  /// The heartbeat address.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Stops beating and waits for the emitter task to finish.
  pub async fn stop(mut self) {
    self.shutdown.cancel();
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }
}

impl Drop for HeartbeatEmitter {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
