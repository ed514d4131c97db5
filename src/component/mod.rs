//! # Component Runtime
//!
//! What runs inside a deployed worker. The cluster hands each instance its
//! [`WorkerSpec`]; a [`WorkerContext`] turns that into the services the
//! instance needs:
//!
//! - registration with the network coordinator and a [`HeartbeatEmitter`],
//! - an [`AuditorClient`] for the network's auditor,
//! - an [`OutputCollector`] over the worker's output connections.
//!
//! [`Feeder`] is the source side: it creates root messages and waits for their
//! trees to resolve. [`ComponentWorker`] is the processing side: it receives
//! messages, hands them to a [`MessageHandler`], emits descendants and acks.

mod feeder;
mod output;
mod worker;

pub use feeder::Feeder;
pub use output::OutputCollector;
pub use worker::{ComponentWorker, MessageHandler};

use crate::auditor::AuditorClient;
use crate::coordinator::ControlAction;
use crate::dispatch::{ReliableConnection, SendOptions};
use crate::error::ConnectionError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatEmitter};
use crate::topology::WorkerSpec;
use crate::transport::Transport;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Everything a running worker instance knows about its place in the network.
#[derive(Clone)]
pub struct WorkerContext {
  spec: WorkerSpec,
  transport: Arc<dyn Transport>,
  auditor: AuditorClient,
  heartbeat: HeartbeatConfig,
  send_options: SendOptions,
}

impl WorkerContext {
  /// Creates the context of the instance described by `spec`.
  pub fn new(spec: WorkerSpec, transport: Arc<dyn Transport>) -> Self {
    let auditor = AuditorClient::new(spec.auditor.clone(), transport.clone());
    Self {
      spec,
      transport,
      auditor,
      heartbeat: HeartbeatConfig::default(),
      send_options: SendOptions::default(),
    }
  }

  /// Sets the heartbeat interval used when the coordinator does not send one.
  #[must_use]
  pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
    self.heartbeat = heartbeat;
    self
  }

  /// Sets the options used for sends to downstream workers.
  #[must_use]
  pub fn with_send_options(mut self, options: SendOptions) -> Self {
    self.auditor = self.auditor.with_request_timeout(options.timeout);
    self.send_options = options;
    self
  }

  /// The worker's spec.
  pub fn spec(&self) -> &WorkerSpec {
    &self.spec
  }

  /// The worker's unique address.
  pub fn address(&self) -> &str {
    &self.spec.address
  }

  /// The component configuration.
  pub fn config(&self) -> &Value {
    &self.spec.config
  }

  /// The transport the worker talks over.
  pub fn transport(&self) -> &Arc<dyn Transport> {
    &self.transport
  }

  /// Client for the network's auditor.
  pub fn auditor(&self) -> &AuditorClient {
    &self.auditor
  }

  /// Options for sends to downstream workers.
  pub fn send_options(&self) -> &SendOptions {
    &self.send_options
  }

  /// Builds the collector over this worker's output connections.
  pub fn outputs(&self) -> OutputCollector {
    OutputCollector::new(
      &self.spec,
      self.transport.clone(),
      self.auditor.clone(),
      self.send_options.clone(),
    )
  }

  /// Registers with the network coordinator and starts heartbeating.
  pub async fn register(&self) -> Result<HeartbeatEmitter, ConnectionError> {
    let reply = self
      .control()
      .send(
        &ControlAction::Register {
          address: self.spec.address.clone(),
        },
        &self.send_options,
      )
      .await?;
    let address = reply
      .get("address")
      .and_then(Value::as_str)
      .ok_or_else(|| ConnectionError::Serialization("register reply has no heartbeat address".to_string()))?;
    let interval = reply
      .get("interval")
      .and_then(Value::as_u64)
      .map(Duration::from_millis)
      .unwrap_or(self.heartbeat.interval);

    info!(address = %self.spec.address, heartbeat = %address, "Registered with network");
    Ok(HeartbeatEmitter::start(address, self.transport.clone(), interval))
  }

  /// Unregisters from the network coordinator.
  pub async fn unregister(&self) -> Result<(), ConnectionError> {
    self
      .control()
      .send(
        &ControlAction::Unregister {
          address: self.spec.address.clone(),
        },
        &self.send_options,
      )
      .await?;
    debug!(address = %self.spec.address, "Unregistered from network");
    Ok(())
  }

  fn control(&self) -> ReliableConnection {
    ReliableConnection::new(self.spec.network.clone(), self.transport.clone())
  }
}
