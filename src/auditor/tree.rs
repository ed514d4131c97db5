//! Message trees and the ledger that resolves them.
//!
//! The ledger is plain synchronous state. [`Auditor`](super::Auditor) owns one
//! inside a single actor task, which is what serializes every mutation to a
//! tree; the ledger itself does no locking.

use crate::error::AuditError;
use crate::message::MessageId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Callback invoked exactly once when a tree resolves.
///
/// Receives the root id and `Ok(())` on completion, or [`AuditError::Failed`],
/// [`AuditError::Timeout`] or [`AuditError::Closed`]. Runs on the auditor's
/// task, so it must not block.
pub type CompletionHandler = Box<dyn FnOnce(MessageId, Result<(), AuditError>) + Send>;

/// Resolution state of a message tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
  /// Still waiting for acks.
  Active,
  /// The root and every descendant were acked.
  Acked,
  /// A descendant failed or the tree timed out. Terminal.
  Failed,
}

/// Pending descendants of one root message.
#[derive(Debug, Clone)]
pub struct MessageTree {
  root: MessageId,
  children: HashSet<String>,
  root_pending: bool,
  state: TreeState,
  created_at: DateTime<Utc>,
  timeout_at: Instant,
}

impl MessageTree {
  /// Creates an active tree whose root is still pending.
  pub fn new(root: MessageId, timeout: Duration, now: Instant) -> Self {
    Self {
      root,
      children: HashSet::new(),
      root_pending: true,
      state: TreeState::Active,
      created_at: Utc::now(),
      timeout_at: now + timeout,
    }
  }

  /// The root message id.
  pub fn root(&self) -> &MessageId {
    &self.root
  }

  /// Current state.
  pub fn state(&self) -> TreeState {
    self.state
  }

  /// Wall-clock creation time.
  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  /// Deadline after which the tree fails.
  pub fn timeout_at(&self) -> Instant {
    self.timeout_at
  }

  /// Number of descendants still waiting for an ack.
  pub fn pending_children(&self) -> usize {
    self.children.len()
  }

  /// Returns true while the root itself has not been acked.
  pub fn root_pending(&self) -> bool {
    self.root_pending
  }

  /// Registers a pending descendant. Ignored unless the tree is active.
  pub fn branch(&mut self, child: &MessageId) -> bool {
    if self.state != TreeState::Active {
      return false;
    }
    self.children.insert(child.id().to_string())
  }

  /// Acks `id` and returns the resulting state.
  ///
  /// Acking an id that is not pending (a duplicate, or one never branched) is
  /// a no-op.
  pub fn ack(&mut self, id: &str) -> TreeState {
    if self.state != TreeState::Active {
      return self.state;
    }
    if id == self.root.id() {
      self.root_pending = false;
    } else {
      self.children.remove(id);
    }
    if !self.root_pending && self.children.is_empty() {
      self.state = TreeState::Acked;
    }
    self.state
  }

  /// Fails the tree.
  pub fn fail(&mut self) {
    self.state = TreeState::Failed;
  }

  /// Returns true if the tree is still active past its deadline.
  pub fn is_expired(&self, now: Instant) -> bool {
    self.state == TreeState::Active && now >= self.timeout_at
  }
}

struct Entry {
  tree: MessageTree,
  handler: Option<CompletionHandler>,
}

/// All active message trees of one auditor, keyed by root id.
///
/// Trees are removed as soon as they resolve; every event that refers to a
/// removed or unknown tree is a no-op.
pub struct AuditLedger {
  address: String,
  timeout: Duration,
  trees: HashMap<String, Entry>,
}

impl AuditLedger {
  /// Creates an empty ledger for the auditor at `address`.
  pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
    Self {
      address: address.into(),
      timeout,
      trees: HashMap::new(),
    }
  }

  /// Number of unresolved trees.
  pub fn len(&self) -> usize {
    self.trees.len()
  }

  /// Returns true when no tree is pending.
  pub fn is_empty(&self) -> bool {
    self.trees.is_empty()
  }

  /// Looks up the tree of a root id.
  pub fn tree(&self, root: &str) -> Option<&MessageTree> {
    self.trees.get(root).map(|e| &e.tree)
  }

  /// Allocates a new root owned by `owner` and starts its tree.
  pub fn create(&mut self, owner: &str, handler: CompletionHandler, now: Instant) -> MessageId {
    let root = MessageId::new_root(owner, self.address.clone());
    trace!(root = %root, owner = %owner, "Created message tree");
    self.trees.insert(
      root.id().to_string(),
      Entry {
        tree: MessageTree::new(root.clone(), self.timeout, now),
        handler: Some(handler),
      },
    );
    root
  }

  /// Allocates a descendant of `parent` in the parent's tree.
  pub fn branch(&mut self, parent: &MessageId) -> Result<MessageId, AuditError> {
    let entry = self
      .trees
      .get_mut(parent.root())
      .ok_or_else(|| AuditError::UnknownRoot(parent.root().to_string()))?;
    let child = parent.new_child();
    entry.tree.branch(&child);
    Ok(child)
  }

  /// Acks `id`; resolves the tree when nothing else is pending.
  pub fn ack(&mut self, id: &MessageId) {
    let Some(entry) = self.trees.get_mut(id.root()) else {
      trace!(id = %id, "Ignoring ack for resolved tree");
      return;
    };
    if entry.tree.ack(id.id()) == TreeState::Acked {
      self.resolve(id.root(), Ok(()));
    }
  }

  /// Fails the tree that `id` belongs to.
  pub fn fail(&mut self, id: &MessageId) {
    if let Some(entry) = self.trees.get_mut(id.root()) {
      entry.tree.fail();
      self.resolve(id.root(), Err(AuditError::Failed(id.root().to_string())));
    } else {
      trace!(id = %id, "Ignoring fail for resolved tree");
    }
  }

  /// Fails every tree past its deadline. Returns how many timed out.
  pub fn sweep(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .trees
      .iter()
      .filter(|(_, e)| e.tree.is_expired(now))
      .map(|(root, _)| root.clone())
      .collect();
    for root in &expired {
      debug!(root = %root, "Message tree timed out");
      if let Some(entry) = self.trees.get_mut(root) {
        entry.tree.fail();
      }
      self.resolve(root, Err(AuditError::Timeout(root.clone())));
    }
    expired.len()
  }

  /// Resolves every remaining tree with [`AuditError::Closed`].
  pub fn close(&mut self) {
    let roots: Vec<String> = self.trees.keys().cloned().collect();
    for root in roots {
      self.resolve(&root, Err(AuditError::Closed));
    }
  }

  fn resolve(&mut self, root: &str, outcome: Result<(), AuditError>) {
    let Some(entry) = self.trees.remove(root) else {
      return;
    };
    trace!(root = %root, ok = outcome.is_ok(), "Resolved message tree");
    if let Some(handler) = entry.handler {
      handler(entry.tree.root, outcome);
    }
  }
}
