//! Message-processing worker.

use super::{OutputCollector, WorkerContext};
use crate::error::{AuditError, ConnectionError, EmitError, ProcessError};
use crate::message::{JsonMessage, MessageId};
use crate::transport::{error_reply, ok_reply};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Application logic of a worker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
  /// Processes one input message.
  ///
  /// Use `worker` to emit descendants. With auto-ack enabled the message is
  /// acked when this returns `Ok` and failed when it returns `Err`.
  async fn handle(&self, worker: &ComponentWorker, message: &JsonMessage) -> Result<(), ProcessError>;
}

/// Receives messages on a worker address and feeds them to a handler.
pub struct ComponentWorker {
  context: WorkerContext,
  outputs: OutputCollector,
  auto_ack: bool,
}

impl ComponentWorker {
  /// Creates a worker with auto-ack enabled.
  pub fn new(context: WorkerContext) -> Self {
    Self {
      outputs: context.outputs(),
      context,
      auto_ack: true,
    }
  }

  /// Enables or disables acking after each handled message.
  #[must_use]
  pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
    self.auto_ack = auto_ack;
    self
  }

  /// The worker context.
  pub fn context(&self) -> &WorkerContext {
    &self.context
  }

  /// The worker's output channels.
  pub fn outputs(&self) -> &OutputCollector {
    &self.outputs
  }

  /// Emits `body` as a descendant of `parent` on every output channel.
  pub async fn emit(&self, parent: &MessageId, body: Value) -> Result<usize, EmitError> {
    self.outputs.emit(parent, body).await
  }

  /// Emits `body` as a descendant of `parent` on one output port.
  pub async fn emit_port(&self, port: &str, parent: &MessageId, body: Value) -> Result<usize, EmitError> {
    self.outputs.emit_port(port, parent, body).await
  }

  /// Acks a message at its auditor.
  pub async fn ack(&self, message: &JsonMessage) -> Result<(), AuditError> {
    self.context.auditor().ack(&message.id).await
  }

  /// Fails a message, and with it its whole tree.
  pub async fn fail(&self, message: &JsonMessage) -> Result<(), AuditError> {
    self.context.auditor().fail(&message.id).await
  }

  /// Serves the worker address until `shutdown` is cancelled.
  ///
  /// Registers with the network first; a network that cannot be reached
  /// leaves the worker running without heartbeats. Each delivery is
  /// acknowledged on receipt and then processed in arrival order.
  pub async fn run<H: MessageHandler>(self, handler: H, shutdown: CancellationToken) -> Result<(), ConnectionError> {
    let address = self.context.address().to_string();
    let transport = self.context.transport().clone();
    let mut subscription = transport.register(&address).await?;

    let emitter = match self.context.register().await {
      Ok(emitter) => Some(emitter),
      Err(e) => {
        warn!(address = %address, error = %e, "Running without network registration");
        None
      }
    };
    info!(address = %address, "Worker started");

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        delivery = subscription.recv() => {
          let Some(mut delivery) = delivery else { break };
          let message = match JsonMessage::from_value(delivery.body().clone()) {
            Ok(message) => message,
            Err(e) => {
              warn!(address = %address, error = %e, "Dropping malformed message");
              delivery.reply(error_reply(e.to_string()));
              continue;
            }
          };
          delivery.reply(ok_reply(Value::Null));
          self.process(&handler, message).await;
        }
      }
    }

    if let Some(emitter) = emitter {
      emitter.stop().await;
      if let Err(e) = self.context.unregister().await {
        debug!(address = %address, error = %e, "Failed to unregister from network");
      }
    }
    transport.unregister(&address).await?;
    info!(address = %address, "Worker stopped");
    Ok(())
  }

  async fn process<H: MessageHandler>(&self, handler: &H, message: JsonMessage) {
    trace!(address = %self.context.address(), id = %message.id, "Processing message");
    let outcome = handler.handle(self, &message).await;
    if let Err(e) = &outcome {
      warn!(address = %self.context.address(), id = %message.id, error = %e, "Message handling failed");
    }
    if !self.auto_ack {
      return;
    }
    let result = match outcome {
      Ok(()) => self.ack(&message).await,
      Err(_) => self.fail(&message).await,
    };
    if let Err(e) = result {
      warn!(address = %self.context.address(), id = %message.id, error = %e, "Failed to report message outcome");
    }
  }
}
