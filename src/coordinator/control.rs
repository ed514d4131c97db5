//! Control surface on the network address.

use super::{Inner, NetworkCoordinator};
use crate::error::{ControlError, DeploymentError};
use crate::transport::{Delivery, Subscription, error_reply, ok_reply};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Weak;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Verbs accepted on a network's control address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlAction {
  /// A worker came up. Replied with its heartbeat address.
  Register {
    /// Worker address.
    address: String,
  },
  /// A worker is going away.
  Unregister {
    /// Worker address.
    address: String,
  },
  /// Undeploy the network and stop coordinating it.
  Shutdown,
  /// Undeploy and deploy the whole network again.
  Redeploy,
}

impl ControlAction {
  /// Decodes a control message.
  pub fn parse(body: &Value) -> Result<Self, ControlError> {
    let action = body
      .get("action")
      .and_then(Value::as_str)
      .ok_or(ControlError::MissingAction)?;
    match action {
      "register" => Ok(ControlAction::Register {
        address: required_address(body, action)?,
      }),
      "unregister" => Ok(ControlAction::Unregister {
        address: required_address(body, action)?,
      }),
      "shutdown" => Ok(ControlAction::Shutdown),
      "redeploy" => Ok(ControlAction::Redeploy),
      other => Err(ControlError::UnknownAction(other.to_string())),
    }
  }

  /// Encodes the action as a control message.
  pub fn to_value(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}

fn required_address(body: &Value, action: &str) -> Result<String, ControlError> {
  body
    .get("address")
    .and_then(Value::as_str)
    .filter(|a| !a.is_empty())
    .map(str::to_string)
    .ok_or_else(|| ControlError::Malformed {
      action: action.to_string(),
      reason: "missing address".to_string(),
    })
}

impl NetworkCoordinator {
  /// Applies a control action and returns the reply fields.
  pub async fn execute(&self, action: ControlAction) -> Result<Value, DeploymentError> {
    match action {
      ControlAction::Register { address } => {
        let heartbeat = self.register(&address).await?;
        let interval = self.inner.config.heartbeat.interval.as_millis() as u64;
        Ok(json!({ "address": heartbeat, "interval": interval }))
      }
      ControlAction::Unregister { address } => {
        self.unregister(&address).await?;
        Ok(Value::Null)
      }
      ControlAction::Shutdown => {
        self.shutdown().await?;
        Ok(Value::Null)
      }
      ControlAction::Redeploy => {
        self.redeploy_all(None).await?;
        Ok(Value::Null)
      }
    }
  }
}

/// Serves control messages until `shutdown` is cancelled.
///
/// Each message is handled on its own task so that a long shutdown or
/// redeploy never blocks the registrations it causes.
pub(super) fn spawn_control_loop(inner: Weak<Inner>, mut subscription: Subscription, shutdown: CancellationToken) {
  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        delivery = subscription.recv() => {
          let Some(delivery) = delivery else { break };
          let Some(inner) = inner.upgrade() else { break };
          tokio::spawn(handle(NetworkCoordinator { inner }, delivery));
        }
      }
    }
    debug!(address = %subscription.address(), "Control loop stopped");
  });
}

async fn handle(coordinator: NetworkCoordinator, mut delivery: Delivery) {
  let reply = match ControlAction::parse(delivery.body()) {
    Ok(ControlAction::Unregister { address }) => {
      // The worker waits for this reply before it exits, and the redeploy
      // below waits for that exit.
      delivery.reply(ok_reply(Value::Null));
      if let Err(e) = coordinator.unregister(&address).await {
        warn!(network = %coordinator.name(), address = %address, error = %e, "Unregister failed");
      }
      return;
    }
    Ok(action) => {
      debug!(network = %coordinator.name(), action = ?action, "Control action");
      match coordinator.execute(action).await {
        Ok(fields) => ok_reply(fields),
        Err(e) => {
          warn!(network = %coordinator.name(), error = %e, "Control action failed");
          error_reply(e.to_string())
        }
      }
    }
    Err(e) => {
      warn!(network = %coordinator.name(), error = %e, "Rejected control message");
      error_reply(e.to_string())
    }
  };
  delivery.reply(reply);
}
