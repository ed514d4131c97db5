//! Grouping-aware fan-out over a connection pool.

use super::connection::{ReliableConnection, SendOptions};
use super::grouping::{Grouping, Selector};
use super::pool::ConnectionPool;
use crate::error::ConnectionError;
use crate::message::JsonMessage;
use futures::future::join_all;
use serde_json::Value;
use tracing::trace;

/// Sends each message to the pool members its grouping selects.
#[derive(Debug)]
pub struct Dispatcher {
  pool: ConnectionPool,
  selector: Selector,
}

impl Dispatcher {
  /// Creates a dispatcher over `pool` with a fresh cursor.
  pub fn new(pool: ConnectionPool, grouping: Grouping) -> Self {
    Self {
      pool,
      selector: Selector::new(grouping),
    }
  }

  /// The pooled connections.
  pub fn pool(&self) -> &ConnectionPool {
    &self.pool
  }

  /// Mutable access to the pool, for membership changes.
  pub fn pool_mut(&mut self) -> &mut ConnectionPool {
    &mut self.pool
  }

  /// The grouping in use.
  pub fn grouping(&self) -> &Grouping {
    self.selector.grouping()
  }

  /// Connections a message with `body` is routed to.
  ///
  /// Advances the round-robin cursor like a real dispatch.
  pub fn select(&self, body: &Value) -> Vec<&ReliableConnection> {
    self
      .selector
      .select(body, self.pool.len())
      .into_iter()
      .filter_map(|i| self.pool.get(i))
      .collect()
  }

  /// Sends `message` to every selected member concurrently.
  ///
  /// Returns every reply in selection order, or the first failure.
  pub async fn dispatch(&self, message: &JsonMessage, options: &SendOptions) -> Result<Vec<Value>, ConnectionError> {
    if self.pool.is_empty() {
      return Err(ConnectionError::NoConnections);
    }
    let targets = self.select(&message.body);
    trace!(id = %message.id, targets = targets.len(), "Dispatching message");

    join_all(targets.iter().map(|c| c.send(message, options)))
      .await
      .into_iter()
      .collect()
  }
}
