//! # Message Auditing
//!
//! Every root message a feeder creates grows a tree of descendants as workers
//! emit new messages in response. The [`Auditor`] tracks each tree and
//! resolves it exactly once:
//!
//! - **acked** once the root and every registered descendant were acked,
//! - **failed** as soon as any member of the tree is failed,
//! - **timed out** when the tree is still active after the audit timeout.
//!
//! Events may arrive out of order and from many workers at once. The auditor
//! is an actor: one task owns the [`AuditLedger`] and applies commands from its
//! mailbox one at a time, so "nothing left pending" is always evaluated
//! atomically against concurrent branches and acks. Events that refer to a
//! tree that already resolved are dropped.
//!
//! ```rust,no_run
//! use weavenet::auditor::{Auditor, AuditorConfig};
//!
//! # async fn example() -> Result<(), weavenet::error::AuditError> {
//! let auditor = Auditor::spawn("net.__auditor", AuditorConfig::default());
//! let (root, completion) = auditor.create("net.feeder-1").await?;
//! let child = auditor.branch(&root).await?;
//! auditor.ack(&child).await?;
//! auditor.ack(&root).await?;
//! assert_eq!(completion.await?, root);
//! # Ok(())
//! # }
//! ```

mod service;
mod tree;

pub use service::{AuditAction, AuditNotice, AuditorClient, AuditorService, NoticeKind};
pub use tree::{AuditLedger, CompletionHandler, MessageTree, TreeState};

use crate::error::AuditError;
use crate::message::MessageId;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shortest sweep interval; anything below is raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Auditor configuration.
#[derive(Debug, Clone)]
pub struct AuditorConfig {
  /// How long a tree may stay unresolved before it fails.
  pub timeout: Duration,
  /// How often expired trees are swept.
  pub sweep_interval: Duration,
  /// Capacity of the auditor's mailbox.
  pub mailbox_capacity: usize,
}

impl Default for AuditorConfig {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(30),
      sweep_interval: Duration::from_secs(1),
      mailbox_capacity: 1024,
    }
  }
}

impl AuditorConfig {
  /// Sets the audit timeout.
  #[must_use]
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Sets the sweep interval, at least [`MIN_SWEEP_INTERVAL`].
  #[must_use]
  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
    self
  }

  /// Sets the mailbox capacity.
  #[must_use]
  pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
    self.mailbox_capacity = capacity;
    self
  }
}

enum Command {
  Create {
    owner: String,
    handler: CompletionHandler,
    reply: oneshot::Sender<MessageId>,
  },
  Branch {
    parent: MessageId,
    reply: oneshot::Sender<Result<MessageId, AuditError>>,
  },
  Ack(MessageId),
  Fail(MessageId),
  Pending(oneshot::Sender<usize>),
  Shutdown,
}

/// Future resolving when a root's tree resolves.
#[derive(Debug)]
pub struct Completion {
  rx: oneshot::Receiver<Result<MessageId, AuditError>>,
}

impl Completion {
  pub(crate) fn new(rx: oneshot::Receiver<Result<MessageId, AuditError>>) -> Self {
    Self { rx }
  }
}

impl Future for Completion {
  type Output = Result<MessageId, AuditError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.rx).poll(cx) {
      Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
      Poll::Ready(Err(_)) => Poll::Ready(Err(AuditError::Closed)),
      Poll::Pending => Poll::Pending,
    }
  }
}

/// Handle to a running auditor. Clones share the same actor.
#[derive(Clone, Debug)]
pub struct Auditor {
  address: String,
  tx: mpsc::Sender<Command>,
}

impl Auditor {
  /// Starts an auditor task for `address`.
  pub fn spawn(address: impl Into<String>, config: AuditorConfig) -> Self {
    let address = address.into();
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let ledger = AuditLedger::new(address.clone(), config.timeout);
    tokio::spawn(run(ledger, rx, config.sweep_interval.max(MIN_SWEEP_INTERVAL)));
    Self { address, tx }
  }

  /// The address this auditor's ids point at.
  pub fn address(&self) -> &str {
    &self.address
  }

  /// Creates a root message and returns a future for its resolution.
  pub async fn create(&self, owner: &str) -> Result<(MessageId, Completion), AuditError> {
    let (done_tx, done_rx) = oneshot::channel();
    let root = self
      .create_with(
        owner,
        Box::new(move |root, outcome| {
          let _ = done_tx.send(outcome.map(|()| root));
        }),
      )
      .await?;
    Ok((root, Completion::new(done_rx)))
  }

  /// Creates a root message whose resolution is reported to `handler`.
  pub async fn create_with(&self, owner: &str, handler: CompletionHandler) -> Result<MessageId, AuditError> {
    let (reply, rx) = oneshot::channel();
    self
      .submit(Command::Create {
        owner: owner.to_string(),
        handler,
        reply,
      })
      .await?;
    rx.await.map_err(|_| AuditError::Closed)
  }

  /// Registers a new descendant of `parent`.
  ///
  /// Fails with [`AuditError::UnknownRoot`] when the tree already resolved.
  pub async fn branch(&self, parent: &MessageId) -> Result<MessageId, AuditError> {
    let (reply, rx) = oneshot::channel();
    self
      .submit(Command::Branch {
        parent: parent.clone(),
        reply,
      })
      .await?;
    rx.await.map_err(|_| AuditError::Closed)?
  }

  /// Acks a message.
  pub async fn ack(&self, id: &MessageId) -> Result<(), AuditError> {
    self.submit(Command::Ack(id.clone())).await
  }

  /// Fails a message and with it the whole tree.
  pub async fn fail(&self, id: &MessageId) -> Result<(), AuditError> {
    self.submit(Command::Fail(id.clone())).await
  }

  /// Number of unresolved trees.
  pub async fn pending(&self) -> Result<usize, AuditError> {
    let (reply, rx) = oneshot::channel();
    self.submit(Command::Pending(reply)).await?;
    rx.await.map_err(|_| AuditError::Closed)
  }

  /// Stops the auditor. Unresolved trees report [`AuditError::Closed`].
  pub async fn shutdown(&self) {
    let _ = self.tx.send(Command::Shutdown).await;
  }

  async fn submit(&self, command: Command) -> Result<(), AuditError> {
    self.tx.send(command).await.map_err(|_| AuditError::Closed)
  }
}

async fn run(mut ledger: AuditLedger, mut rx: mpsc::Receiver<Command>, sweep_interval: Duration) {
  let mut sweep = tokio::time::interval(sweep_interval);
  sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      command = rx.recv() => {
        let Some(command) = command else { break };
        match command {
          Command::Create { owner, handler, reply } => {
            let root = ledger.create(&owner, handler, Instant::now());
            let _ = reply.send(root);
          }
          Command::Branch { parent, reply } => {
            let _ = reply.send(ledger.branch(&parent));
          }
          Command::Ack(id) => ledger.ack(&id),
          Command::Fail(id) => ledger.fail(&id),
          Command::Pending(reply) => {
            let _ = reply.send(ledger.len());
          }
          Command::Shutdown => break,
        }
      }
      _ = sweep.tick() => {
        let expired = ledger.sweep(Instant::now());
        if expired > 0 {
          debug!(expired, "Swept timed out message trees");
        }
      }
    }
  }

  if !ledger.is_empty() {
    info!(pending = ledger.len(), "Auditor stopping with unresolved trees");
  }
  ledger.close();
}
