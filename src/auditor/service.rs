//! Auditor access over the transport.
//!
//! Workers never hold an [`Auditor`] handle directly; they talk to the auditor
//! at the address stored in each [`MessageId`]. [`AuditorService`] binds an
//! auditor to that address and [`AuditorClient`] is the matching caller side.
//!
//! Tree resolutions are published to the root's owner as an [`AuditNotice`].

use super::Auditor;
use crate::error::{AuditError, ConnectionError};
use crate::message::MessageId;
use crate::transport::{Delivery, Transport, error_reply, ok_reply, reply_result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Requests understood by an auditor service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AuditAction {
  /// Start a new tree owned by `owner`. Replies with the root id.
  Create {
    /// Address notified when the tree resolves.
    owner: String,
  },
  /// Register a descendant of `parent`. Replies with the child id.
  Branch {
    /// Message the new one descends from.
    parent: MessageId,
  },
  /// Ack a message.
  Ack {
    /// Message being acked.
    id: MessageId,
  },
  /// Fail a message and its tree.
  Fail {
    /// Message being failed.
    id: MessageId,
  },
}

/// How a tree resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
  /// Fully processed.
  Ack,
  /// Explicitly failed, or abandoned because the auditor stopped.
  Fail,
  /// Not resolved before the audit timeout.
  Timeout,
}

/// Resolution notice published to a root's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditNotice {
  /// How the tree resolved.
  pub action: NoticeKind,
  /// Root message id.
  pub id: MessageId,
}

impl AuditNotice {
  /// Builds the notice for a resolved tree.
  pub fn new(root: MessageId, outcome: &Result<(), AuditError>) -> Self {
    let action = match outcome {
      Ok(()) => NoticeKind::Ack,
      Err(AuditError::Timeout(_)) => NoticeKind::Timeout,
      Err(_) => NoticeKind::Fail,
    };
    Self { action, id: root }
  }

  /// Converts the notice into the outcome a feeder reports.
  pub fn into_result(self) -> Result<MessageId, AuditError> {
    match self.action {
      NoticeKind::Ack => Ok(self.id),
      NoticeKind::Fail => Err(AuditError::Failed(self.id.root().to_string())),
      NoticeKind::Timeout => Err(AuditError::Timeout(self.id.root().to_string())),
    }
  }
}

/// Serves an [`Auditor`] on its address.
pub struct AuditorService {
  address: String,
  transport: Arc<dyn Transport>,
  shutdown: CancellationToken,
  task: JoinHandle<()>,
}

impl AuditorService {
  /// Registers on the auditor's address and starts serving requests.
  pub async fn start(auditor: Auditor, transport: Arc<dyn Transport>) -> Result<Self, ConnectionError> {
    let address = auditor.address().to_string();
    let mut subscription = transport.register(&address).await?;
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let bus = transport.clone();

    let task = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          delivery = subscription.recv() => {
            let Some(delivery) = delivery else { break };
            handle(&auditor, &bus, delivery).await;
          }
        }
      }
      auditor.shutdown().await;
    });

    debug!(address = %address, "Auditor service started");
    Ok(Self {
      address,
      transport,
      shutdown,
      task,
    })
  }

  /// The address being served.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Stops serving and shuts the auditor down.
  pub async fn stop(self) {
    self.shutdown.cancel();
    if let Err(e) = self.transport.unregister(&self.address).await {
      warn!(address = %self.address, error = %e, "Failed to unregister auditor");
    }
    let _ = self.task.await;
    debug!(address = %self.address, "Auditor service stopped");
  }
}

async fn handle(auditor: &Auditor, transport: &Arc<dyn Transport>, mut delivery: Delivery) {
  let action: AuditAction = match serde_json::from_value(delivery.body().clone()) {
    Ok(action) => action,
    Err(e) => {
      warn!(error = %e, "Invalid audit request");
      delivery.reply(error_reply(e.to_string()));
      return;
    }
  };

  let reply = match action {
    AuditAction::Create { owner } => {
      let bus = transport.clone();
      let notify = owner.clone();
      auditor
        .create_with(
          &owner,
          Box::new(move |root, outcome| publish_notice(bus, notify, AuditNotice::new(root, &outcome))),
        )
        .await
        .map(|id| ok_reply(json!({ "id": id })))
    }
    AuditAction::Branch { parent } => auditor
      .branch(&parent)
      .await
      .map(|id| ok_reply(json!({ "id": id }))),
    AuditAction::Ack { id } => auditor.ack(&id).await.map(|()| ok_reply(Value::Null)),
    AuditAction::Fail { id } => auditor.fail(&id).await.map(|()| ok_reply(Value::Null)),
  };

  if delivery.expects_reply() {
    delivery.reply(reply.unwrap_or_else(|e| error_reply(e.to_string())));
  }
}

fn publish_notice(transport: Arc<dyn Transport>, owner: String, notice: AuditNotice) {
  tokio::spawn(async move {
    match serde_json::to_value(&notice) {
      Ok(body) => {
        if let Err(e) = transport.publish(&owner, body).await {
          warn!(owner = %owner, error = %e, "Failed to notify tree owner");
        }
      }
      Err(e) => warn!(error = %e, "Failed to encode audit notice"),
    }
  });
}

/// Caller side of an [`AuditorService`].
#[derive(Clone)]
pub struct AuditorClient {
  address: String,
  transport: Arc<dyn Transport>,
  request_timeout: Duration,
}

impl AuditorClient {
  /// Creates a client for the auditor at `address`.
  pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
    Self {
      address: address.into(),
      transport,
      request_timeout: Duration::from_secs(30),
    }
  }

  /// Sets how long create/branch requests wait for the auditor.
  #[must_use]
  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  /// Address of the auditor new roots are created at.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Starts a new tree owned by `owner`.
  pub async fn create(&self, owner: &str) -> Result<MessageId, AuditError> {
    let action = AuditAction::Create {
      owner: owner.to_string(),
    };
    self.request(&self.address, &action).await
  }

  /// Registers a descendant of `parent` at the parent's auditor.
  ///
  /// Any refusal from the auditor means the tree is gone and is reported as
  /// [`AuditError::UnknownRoot`].
  pub async fn branch(&self, parent: &MessageId) -> Result<MessageId, AuditError> {
    let action = AuditAction::Branch {
      parent: parent.clone(),
    };
    match self.request(parent.auditor(), &action).await {
      Err(AuditError::Unreachable(reason)) if reason.starts_with("remote:") => {
        Err(AuditError::UnknownRoot(parent.root().to_string()))
      }
      other => other,
    }
  }

  /// Acks a message at its auditor.
  pub async fn ack(&self, id: &MessageId) -> Result<(), AuditError> {
    self.notify(id.auditor(), &AuditAction::Ack { id: id.clone() }).await
  }

  /// Fails a message at its auditor.
  pub async fn fail(&self, id: &MessageId) -> Result<(), AuditError> {
    self.notify(id.auditor(), &AuditAction::Fail { id: id.clone() }).await
  }

  async fn notify(&self, address: &str, action: &AuditAction) -> Result<(), AuditError> {
    let body = serde_json::to_value(action).map_err(|e| AuditError::Unreachable(e.to_string()))?;
    self
      .transport
      .send_oneway(address, body)
      .await
      .map_err(|e| AuditError::Unreachable(e.to_string()))
  }

  async fn request(&self, address: &str, action: &AuditAction) -> Result<MessageId, AuditError> {
    let body = serde_json::to_value(action).map_err(|e| AuditError::Unreachable(e.to_string()))?;
    let reply = tokio::time::timeout(self.request_timeout, self.transport.send(address, body))
      .await
      .map_err(|_| AuditError::Unreachable(ConnectionError::Timeout.to_string()))?
      .map_err(|e| AuditError::Unreachable(e.to_string()))?;
    let reply = reply_result(reply).map_err(|e| match e {
      ConnectionError::Remote(message) => AuditError::Unreachable(format!("remote: {}", message)),
      other => AuditError::Unreachable(other.to_string()),
    })?;
    serde_json::from_value(reply.get("id").cloned().unwrap_or(Value::Null))
      .map_err(|e| AuditError::Unreachable(e.to_string()))
  }
}
