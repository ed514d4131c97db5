//! # Output Dispatch
//!
//! Routing of outbound messages to downstream workers:
//!
//! - [`Grouping`] picks targets (round-robin, random, fields hash, all),
//! - [`ConnectionPool`] holds one [`ReliableConnection`] per target address,
//! - [`Dispatcher`] combines the two and joins the per-target sends.

mod connection;
mod dispatcher;
mod grouping;
mod pool;

pub use connection::{ReliableConnection, SendOptions};
pub use dispatcher::Dispatcher;
pub use grouping::{Grouping, Selector};
pub use pool::ConnectionPool;
