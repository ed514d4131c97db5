//! Message identifiers and the envelope exchanged between components.
//!
//! Every message that flows through a network carries a [`MessageId`] linking
//! it to the root message a feeder created. The auditor uses the `root` to find
//! the message tree, and any component can route ack/fail to the `auditor`
//! address stored in the id.
//!
//! # Example
//!
//! ```rust
//! use weavenet::message::MessageId;
//!
//! let root = MessageId::new_root("network.feeder-1", "network.auditor");
//! let child = root.new_child();
//!
//! assert!(root.is_root());
//! assert_eq!(child.root(), root.id());
//! assert_eq!(child.parent(), Some(root.id()));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Identifies one message instance within a message tree.
///
/// Ids are immutable once created and never reused. Descendants inherit the
/// root's `owner` and `auditor`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
  id: String,
  owner: String,
  auditor: String,
  parent: Option<String>,
  root: String,
}

impl MessageId {
  /// Creates a fresh root id owned by `owner` and audited at `auditor`.
  #[must_use]
  pub fn new_root(owner: impl Into<String>, auditor: impl Into<String>) -> Self {
    let id = Uuid::new_v4().to_string();
    Self {
      root: id.clone(),
      id,
      owner: owner.into(),
      auditor: auditor.into(),
      parent: None,
    }
  }

  /// Creates a fresh descendant of this message in the same tree.
  #[must_use]
  pub fn new_child(&self) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      owner: self.owner.clone(),
      auditor: self.auditor.clone(),
      parent: Some(self.id.clone()),
      root: self.root.clone(),
    }
  }

  /// The unique id of this message.
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Address notified when the root's tree resolves.
  pub fn owner(&self) -> &str {
    &self.owner
  }

  /// Address of the auditor tracking this message's tree.
  pub fn auditor(&self) -> &str {
    &self.auditor
  }

  /// Id of the message this one descends from, if any.
  pub fn parent(&self) -> Option<&str> {
    self.parent.as_deref()
  }

  /// Id of the root message of this tree.
  pub fn root(&self) -> &str {
    &self.root
  }

  /// Returns true if this id is the root of its tree.
  #[must_use]
  pub fn is_root(&self) -> bool {
    self.id == self.root
  }
}

impl Display for MessageId {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    if self.is_root() {
      write!(f, "{}", self.id)
    } else {
      write!(f, "{}<{}", self.id, self.root)
    }
  }
}

/// A message envelope: an id, a JSON body and the emitting component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonMessage {
  /// Identity of this message in its tree.
  pub id: MessageId,
  /// Message payload.
  pub body: Value,
  /// Name of the component that emitted the message, if known.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
}

impl JsonMessage {
  /// Creates a new message with the given id and body.
  #[must_use]
  pub fn new(id: MessageId, body: Value) -> Self {
    Self {
      id,
      body,
      source: None,
    }
  }

  /// Tags the message with the emitting component's name.
  #[must_use]
  pub fn with_source(mut self, source: impl Into<String>) -> Self {
    self.source = Some(source.into());
    self
  }

  /// Returns the value of a top-level body field, if the body is an object.
  pub fn field(&self, name: &str) -> Option<&Value> {
    self.body.get(name)
  }

  /// Encodes the message as a JSON value for the transport.
  pub fn to_value(&self) -> Result<Value, serde_json::Error> {
    serde_json::to_value(self)
  }

  /// Decodes a message received from the transport.
  pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
    serde_json::from_value(value)
  }
}
