//! # weavenet
//!
//! Reliability and orchestration core for distributed stream-processing
//! networks.
//!
//! A network is a directed graph of long-running components connected by
//! streams. weavenet deploys every instance of every component onto a cluster,
//! tracks each message from its source through all of its descendants, and
//! replaces workers that stop heartbeating.
//!
//! ## Key Features
//!
//! - **Message Auditing**: every root message resolves exactly once as acked,
//!   failed or timed out ([`auditor`])
//! - **Recursive Deployment**: network → node → worker deploy and undeploy
//!   passes with heartbeat-driven recovery ([`coordinator`])
//! - **Grouped Dispatch**: round-robin, random, fields and all groupings over
//!   pooled connections with timeout and retry ([`dispatch`])
//! - **Pluggable Backends**: transport, cluster and coordination are traits,
//!   with in-process implementations for local runs and tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weavenet::cluster::LocalCluster;
//! use weavenet::coordination::InMemoryCoordination;
//! use weavenet::manager::ClusterManager;
//! use weavenet::topology::{ComponentConfig, ConnectionConfig, NetworkConfig};
//! use weavenet::transport::LocalTransport;
//!
//! # async fn example() -> Result<(), weavenet::error::DeploymentError> {
//! let transport = Arc::new(LocalTransport::new());
//! let cluster = Arc::new(LocalCluster::new(transport.clone()));
//! let manager = ClusterManager::new(cluster, transport, Arc::new(InMemoryCoordination::new()));
//!
//! let network = NetworkConfig::new("wordcount")
//!   .with_component("feeder", ComponentConfig::new("word-feeder"))
//!   .with_component("counter", ComponentConfig::new("word-counter").with_instances(2))
//!   .with_connection(ConnectionConfig::new(("feeder", "out"), ("counter", "in")));
//! manager.deploy_network(network).await?;
//! manager.undeploy_network("wordcount").await?;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Message trees, the auditor actor and its transport service.
pub mod auditor;
/// Cluster deploy/undeploy capability and the in-process cluster.
pub mod cluster;
/// Worker-side runtime: context, feeders, processing workers, outputs.
pub mod component;
/// Named maps, sets, lists, queues, locks and id generators shared across a cluster.
pub mod coordination;
/// Network deployment state machine and heartbeat recovery.
pub mod coordinator;
/// Grouping, connection pools and reliable point-to-point sends.
pub mod dispatch;
/// Error types for every concern of the core.
pub mod error;
/// Heartbeat monitors and emitters.
pub mod heartbeat;
/// Live-network registry and whole-network deploy/undeploy.
pub mod manager;
/// Message ids and envelopes.
pub mod message;
/// Network configuration and the compiled topology.
pub mod topology;
/// Message bus abstraction and the in-process bus.
pub mod transport;

#[cfg(test)]
mod coordinator_test;
