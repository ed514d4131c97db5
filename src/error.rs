//! # Error Types
//!
//! One error enum per concern of the reliability core:
//!
//! - **AuditError**: message tree resolution (unknown root, failure, timeout)
//! - **ConnectionError**: point-to-point sends over the transport
//! - **DeploymentError**: cluster deploy/undeploy and coordinator state
//! - **TopologyError**: building a deployable topology from a network config
//! - **ControlError**: decoding action-coded control messages
//! - **EmitError** / **ProcessError**: worker-side emission and message handling
//!
//! Expected races (a duplicate ack, a branch that arrives after its tree
//! resolved) surface as [`AuditError::UnknownRoot`] and are swallowed by the
//! callers that can legitimately observe them. Everything else propagates to
//! the nearest awaiting caller.

use thiserror::Error;

/// Errors reported by the auditor and its clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditError {
  /// The root's tree no longer exists (already resolved, or never created).
  #[error("Unknown message tree root: {0}")]
  UnknownRoot(String),
  /// The tree was explicitly failed by a downstream worker.
  #[error("Message tree {0} failed")]
  Failed(String),
  /// The tree did not complete before its audit timeout.
  #[error("Message tree {0} timed out")]
  Timeout(String),
  /// The auditor is no longer running.
  #[error("Auditor closed")]
  Closed,
  /// A request to a remote auditor could not be delivered.
  #[error("Auditor unreachable: {0}")]
  Unreachable(String),
}

impl AuditError {
  /// Returns true for errors that callers treat as benign no-ops.
  #[must_use]
  pub fn is_benign(&self) -> bool {
    matches!(self, AuditError::UnknownRoot(_))
  }
}

/// Errors reported by transport sends and reliable connections.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
  /// No reply arrived within the send timeout (after all attempts).
  #[error("Connection timeout")]
  Timeout,
  /// Nothing is registered at the target address.
  #[error("No handlers for address {0}")]
  NoHandlers(String),
  /// A dispatcher was asked to send through an empty pool.
  #[error("No connections in pool")]
  NoConnections,
  /// The receiving side went away before replying.
  #[error("Connection closed")]
  Closed,
  /// The payload could not be encoded or decoded.
  #[error("Serialization error: {0}")]
  Serialization(String),
  /// The receiver replied with an error status.
  #[error("Remote error: {0}")]
  Remote(String),
}

impl From<serde_json::Error> for ConnectionError {
  fn from(err: serde_json::Error) -> Self {
    ConnectionError::Serialization(err.to_string())
  }
}

/// Errors raised while building a topology from a network configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
  /// A component declares zero instances.
  #[error("Component {0} must have at least one instance")]
  NoInstances(String),
  /// The configuration could not be parsed.
  #[error("Invalid network configuration: {0}")]
  InvalidConfig(String),
}

/// Errors raised by the cluster and the network coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeploymentError {
  /// The cluster refused to deploy or undeploy a worker.
  #[error("Deployment of {address} refused: {reason}")]
  Refused {
    /// Worker address the operation targeted.
    address: String,
    /// Reason reported by the cluster.
    reason: String,
  },
  /// No factory is registered for the executable reference.
  #[error("Unknown executable: {0}")]
  UnknownExecutable(String),
  /// The handle does not name a live deployment.
  #[error("Not deployed: {0}")]
  NotDeployed(String),
  /// Another deployment of the same network holds its lock.
  #[error("Network {0} is busy")]
  Busy(String),
  /// The coordinator is not in a state that allows the operation.
  #[error("Invalid network state: expected {expected}, found {actual}")]
  InvalidState {
    /// State the operation requires.
    expected: String,
    /// State the network was in.
    actual: String,
  },
  /// The network configuration could not be compiled.
  #[error(transparent)]
  Topology(#[from] TopologyError),
  /// A transport operation needed by the deployment failed.
  #[error("Transport error: {0}")]
  Transport(#[from] ConnectionError),
}

/// Errors raised while decoding a control message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
  /// The `action` field names a verb the network does not understand.
  #[error("Invalid action {0}.")]
  UnknownAction(String),
  /// The message has no `action` field.
  #[error("No action specified.")]
  MissingAction,
  /// The verb is known but its fields are missing or malformed.
  #[error("Malformed {action} message: {reason}")]
  Malformed {
    /// Verb being decoded.
    action: String,
    /// What was wrong with it.
    reason: String,
  },
}

/// Errors raised while emitting a message to a worker's output channels.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmitError {
  /// The auditor refused or could not be reached.
  #[error(transparent)]
  Audit(#[from] AuditError),
  /// A downstream send failed.
  #[error(transparent)]
  Connection(#[from] ConnectionError),
  /// The worker has no output port with this name.
  #[error("Unknown output port: {0}")]
  UnknownPort(String),
}

/// Errors a message handler reports for the message it was given.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
  /// Emitting derived messages failed.
  #[error(transparent)]
  Emit(#[from] EmitError),
  /// The handler rejected the message.
  #[error("Message rejected: {0}")]
  Rejected(String),
}
