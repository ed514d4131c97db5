//! Ordered set of connections behind one output port.

use super::connection::ReliableConnection;
use crate::transport::Transport;
use std::sync::Arc;

/// Connections to every worker behind an output port.
///
/// Members keep insertion order, which is the order groupings index into, and
/// are unique by address.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
  connections: Vec<ReliableConnection>,
}

impl ConnectionPool {
  /// Creates an empty pool.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a pool with one connection per address.
  pub fn from_addresses<I, S>(addresses: I, transport: Arc<dyn Transport>) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut pool = Self::new();
    for address in addresses {
      pool.add(ReliableConnection::new(address, transport.clone()));
    }
    pool
  }

  /// Adds a connection. Returns false if its address is already pooled.
  pub fn add(&mut self, connection: ReliableConnection) -> bool {
    if self.contains(connection.address()) {
      return false;
    }
    self.connections.push(connection);
    true
  }

  /// Removes the connection to `address`.
  pub fn remove(&mut self, address: &str) -> Option<ReliableConnection> {
    let pos = self.connections.iter().position(|c| c.address() == address)?;
    Some(self.connections.remove(pos))
  }

  /// The connection at position `index`.
  pub fn get(&self, index: usize) -> Option<&ReliableConnection> {
    self.connections.get(index)
  }

  /// Returns true if a connection to `address` is pooled.
  pub fn contains(&self, address: &str) -> bool {
    self.connections.iter().any(|c| c.address() == address)
  }

  /// Number of connections.
  pub fn len(&self) -> usize {
    self.connections.len()
  }

  /// Returns true when the pool is empty.
  pub fn is_empty(&self) -> bool {
    self.connections.is_empty()
  }

  /// Iterates over connections in pool order.
  pub fn iter(&self) -> impl Iterator<Item = &ReliableConnection> {
    self.connections.iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::LocalTransport;

  #[test]
  fn test_pool_is_ordered_and_deduplicated() {
    let bus: Arc<dyn Transport> = Arc::new(LocalTransport::new());
    let mut pool = ConnectionPool::from_addresses(["a", "b", "a", "c"], bus.clone());
    assert_eq!(pool.len(), 3);
    let addresses: Vec<&str> = pool.iter().map(ReliableConnection::address).collect();
    assert_eq!(addresses, vec!["a", "b", "c"]);

    assert!(!pool.add(ReliableConnection::new("b", bus.clone())));
    assert_eq!(pool.remove("b").map(|c| c.address().to_string()), Some("b".to_string()));
    assert!(pool.remove("b").is_none());
    assert_eq!(pool.get(1).map(ReliableConnection::address), Some("c"));
    assert!(pool.add(ReliableConnection::new("b", bus)));
    assert_eq!(pool.get(2).map(ReliableConnection::address), Some("b"));
  }
}
