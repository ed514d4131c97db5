//! Fan-out of emitted messages over a worker's output channels.

use crate::auditor::AuditorClient;
use crate::dispatch::{ConnectionPool, Dispatcher, ReliableConnection, SendOptions};
use crate::error::{ConnectionError, EmitError};
use crate::message::{JsonMessage, MessageId};
use crate::topology::{OutputSpec, WorkerSpec};
use crate::transport::Transport;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

struct OutputChannel {
  port: String,
  target: String,
  dispatcher: Dispatcher,
}

/// One dispatcher per output connection of a worker.
///
/// Every emitted message is registered with the parent's auditor once per
/// selected target, so each delivery carries its own descendant of the parent
/// and an `All` grouping completes only when every target has acked.
pub struct OutputCollector {
  source: String,
  channels: Vec<OutputChannel>,
  auditor: AuditorClient,
  options: SendOptions,
}

impl OutputCollector {
  /// Builds the channels described by `spec.outputs`.
  pub fn new(spec: &WorkerSpec, transport: Arc<dyn Transport>, auditor: AuditorClient, options: SendOptions) -> Self {
    let channels = spec
      .outputs
      .iter()
      .map(|output: &OutputSpec| OutputChannel {
        port: output.port.clone(),
        target: output.target_component.clone(),
        dispatcher: Dispatcher::new(
          ConnectionPool::from_addresses(output.addresses.iter().cloned(), transport.clone()),
          output.grouping.clone(),
        ),
      })
      .collect();
    Self {
      source: spec.component.clone(),
      channels,
      auditor,
      options,
    }
  }

  /// Number of output channels.
  pub fn len(&self) -> usize {
    self.channels.len()
  }

  /// Returns true if the worker has no outputs.
  pub fn is_empty(&self) -> bool {
    self.channels.is_empty()
  }

  /// Output port names, one per channel.
  pub fn ports(&self) -> impl Iterator<Item = &str> {
    self.channels.iter().map(|c| c.port.as_str())
  }

  /// Emits `body` as a descendant of `parent` on every channel.
  ///
  /// Returns how many channels carried the message. Targets whose branch is
  /// rejected because the tree already resolved are skipped.
  pub async fn emit(&self, parent: &MessageId, body: Value) -> Result<usize, EmitError> {
    self.emit_channels(self.channels.iter().collect(), parent, body).await
  }

  /// Emits `body` on the channels leaving output port `port`.
  pub async fn emit_port(&self, port: &str, parent: &MessageId, body: Value) -> Result<usize, EmitError> {
    let channels: Vec<_> = self.channels.iter().filter(|c| c.port == port).collect();
    if channels.is_empty() {
      return Err(EmitError::UnknownPort(port.to_string()));
    }
    self.emit_channels(channels, parent, body).await
  }

  async fn emit_channels(&self, channels: Vec<&OutputChannel>, parent: &MessageId, body: Value) -> Result<usize, EmitError> {
    let results = join_all(channels.into_iter().map(|c| self.emit_one(c, parent, body.clone()))).await;
    let mut sent = 0;
    for result in results {
      if result? {
        sent += 1;
      }
    }
    Ok(sent)
  }

  async fn emit_one(&self, channel: &OutputChannel, parent: &MessageId, body: Value) -> Result<bool, EmitError> {
    let targets = channel.dispatcher.select(&body);
    if targets.is_empty() {
      return Err(ConnectionError::NoConnections.into());
    }
    let results = join_all(targets.into_iter().map(|c| self.deliver(channel, c, parent, body.clone()))).await;
    let mut delivered = false;
    for result in results {
      delivered |= result?;
    }
    Ok(delivered)
  }

  async fn deliver(
    &self,
    channel: &OutputChannel,
    target: &ReliableConnection,
    parent: &MessageId,
    body: Value,
  ) -> Result<bool, EmitError> {
    let child = match self.auditor.branch(parent).await {
      Ok(child) => child,
      Err(e) if e.is_benign() => {
        debug!(parent = %parent, port = %channel.port, "Tree already resolved, skipping target");
        return Ok(false);
      }
      Err(e) => return Err(e.into()),
    };
    trace!(id = %child, port = %channel.port, target = %target.address(), "Emitting message");
    let message = JsonMessage::new(child, body).with_source(self.source.clone());
    if let Err(e) = target.send(&message, &self.options).await {
      // Branched but never delivered: fail it so the tree does not wait for
      // the audit timeout.
      let _ = self.auditor.fail(&message.id).await;
      return Err(e.into());
    }
    Ok(true)
  }
}
