//! # Network Topology
//!
//! A network is declared with a [`NetworkConfig`]: named components, how many
//! instances of each to run, and the connections between their ports. The
//! config is compiled once into a read-only [`NetworkTopology`], the
//! `Network { Nodes { Workers } }` hierarchy the coordinator deploys.
//!
//! Addresses are derived from names:
//!
//! | Entity    | Address                         |
//! |-----------|---------------------------------|
//! | network   | `{network}`                     |
//! | auditor   | `{network}.__auditor`           |
//! | node      | `{network}.{component}`         |
//! | worker    | `{network}.{component}-{n}`     |
//!
//! ## Example
//!
//! ```rust
//! use weavenet::dispatch::Grouping;
//! use weavenet::topology::{ComponentConfig, ConnectionConfig, NetworkConfig};
//!
//! let config = NetworkConfig::new("wordcount")
//!   .with_component("feeder", ComponentConfig::new("word-feeder"))
//!   .with_component("counter", ComponentConfig::new("word-counter").with_instances(2))
//!   .with_connection(
//!     ConnectionConfig::new(("feeder", "out"), ("counter", "in"))
//!       .with_grouping(Grouping::fields(["word"])),
//!   );
//!
//! let topology = config.build().unwrap();
//! assert_eq!(topology.workers().count(), 3);
//! ```

use crate::dispatch::Grouping;
use crate::error::TopologyError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// One end of a connection: a component and one of its ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
  /// Component name.
  pub component: String,
  /// Port name on that component.
  #[serde(default = "default_port")]
  pub port: String,
}

fn default_port() -> String {
  "default".to_string()
}

fn default_instances() -> usize {
  1
}

impl<C: Into<String>, P: Into<String>> From<(C, P)> for Endpoint {
  fn from((component, port): (C, P)) -> Self {
    Self {
      component: component.into(),
      port: port.into(),
    }
  }
}

/// Declaration of one component of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
  /// Executable reference the cluster uses to start instances.
  pub main: String,
  /// Number of worker instances.
  #[serde(default = "default_instances")]
  pub instances: usize,
  /// Opaque configuration handed to every instance.
  #[serde(default)]
  pub config: Value,
  /// Optional cluster group the instances should be placed in.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub group: Option<String>,
}

impl ComponentConfig {
  /// Declares a single-instance component running `main`.
  pub fn new(main: impl Into<String>) -> Self {
    Self {
      main: main.into(),
      instances: 1,
      config: Value::Null,
      group: None,
    }
  }

  /// Sets the number of instances.
  #[must_use]
  pub fn with_instances(mut self, instances: usize) -> Self {
    self.instances = instances;
    self
  }

  /// Sets the per-instance configuration.
  #[must_use]
  pub fn with_config(mut self, config: Value) -> Self {
    self.config = config;
    self
  }

  /// Sets the placement group.
  #[must_use]
  pub fn with_group(mut self, group: impl Into<String>) -> Self {
    self.group = Some(group.into());
    self
  }
}

/// A stream from one component's output port to another's input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
  /// Emitting side.
  pub source: Endpoint,
  /// Receiving side.
  pub target: Endpoint,
  /// How messages pick target instances.
  #[serde(default)]
  pub grouping: Grouping,
}

impl ConnectionConfig {
  /// Connects `source` to `target` with round-robin grouping.
  pub fn new(source: impl Into<Endpoint>, target: impl Into<Endpoint>) -> Self {
    Self {
      source: source.into(),
      target: target.into(),
      grouping: Grouping::default(),
    }
  }

  /// Sets the grouping.
  #[must_use]
  pub fn with_grouping(mut self, grouping: Grouping) -> Self {
    self.grouping = grouping;
    self
  }
}

/// Declarative definition of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
  /// Network name; also its control address.
  pub name: String,
  /// Components by name.
  #[serde(default)]
  pub components: BTreeMap<String, ComponentConfig>,
  /// Connections between component ports.
  #[serde(default)]
  pub connections: Vec<ConnectionConfig>,
}

impl NetworkConfig {
  /// Creates an empty network definition.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      components: BTreeMap::new(),
      connections: Vec::new(),
    }
  }

  /// Parses a network definition from JSON.
  pub fn from_json(value: Value) -> Result<Self, TopologyError> {
    serde_json::from_value(value).map_err(|e| TopologyError::InvalidConfig(e.to_string()))
  }

  /// Adds (or replaces) a component.
  #[must_use]
  pub fn with_component(mut self, name: impl Into<String>, component: ComponentConfig) -> Self {
    self.components.insert(name.into(), component);
    self
  }

  /// Adds a connection.
  #[must_use]
  pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
    self.connections.push(connection);
    self
  }

  /// Folds `other` into this definition.
  ///
  /// Components of `other` are added, replacing same-named ones, and its
  /// connections are appended unless already declared. Nothing is removed.
  pub fn merge(&mut self, other: &NetworkConfig) {
    for (name, component) in &other.components {
      self.components.insert(name.clone(), component.clone());
    }
    for connection in &other.connections {
      if !self.connections.contains(connection) {
        self.connections.push(connection.clone());
      }
    }
  }

  /// Compiles the definition into a deployable topology.
  pub fn build(&self) -> Result<NetworkTopology, TopologyError> {
    NetworkTopology::from_config(self)
  }
}

/// Resolved output connection of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
  /// Output port on the emitting component.
  pub port: String,
  /// Receiving component.
  pub target_component: String,
  /// Input port on the receiving component.
  pub target_port: String,
  /// How messages pick target instances.
  pub grouping: Grouping,
  /// Addresses of every instance of the receiving component.
  pub addresses: Vec<String>,
}

/// Everything the cluster needs to start one worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
  /// Unique worker address.
  pub address: String,
  /// Executable reference (what to run).
  pub executable_ref: String,
  /// Component configuration.
  pub config: Value,
  /// Placement group, if any.
  pub group_id: Option<String>,
  /// Heartbeat address assigned when the running worker registers.
  pub heartbeat_address: Option<String>,
  /// Network control address.
  pub network: String,
  /// Address of the network's auditor.
  pub auditor: String,
  /// Component this worker is an instance of.
  pub component: String,
  /// 1-based instance number.
  pub instance: usize,
  /// Total instances of the component.
  pub instances: usize,
  /// Output connections leaving this worker's component.
  pub outputs: Vec<OutputSpec>,
}

/// One component of a deployed network and its workers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeContext {
  /// Component name.
  pub name: String,
  /// Component address.
  pub address: String,
  /// Worker instances.
  pub workers: Vec<WorkerSpec>,
}

/// Read-only `Network { Nodes { Workers } }` hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkTopology {
  name: String,
  audit_address: String,
  nodes: Vec<NodeContext>,
  connections: Vec<ConnectionConfig>,
}

impl NetworkTopology {
  /// Compiles a network config.
  ///
  /// Connections naming an undeclared component are skipped with a warning.
  pub fn from_config(config: &NetworkConfig) -> Result<Self, TopologyError> {
    if config.name.is_empty() {
      return Err(TopologyError::InvalidConfig(
        "network name must not be empty".to_string(),
      ));
    }
    for (name, component) in &config.components {
      if component.instances == 0 {
        return Err(TopologyError::NoInstances(name.clone()));
      }
    }
    // A connection to or from an undeclared component carries nothing.
    let connections: Vec<ConnectionConfig> = config
      .connections
      .iter()
      .filter(|c| {
        let dangling = [&c.source, &c.target]
          .into_iter()
          .find(|e| !config.components.contains_key(&e.component));
        if let Some(endpoint) = dangling {
          warn!(
            network = %config.name,
            source = %c.source.component,
            target = %c.target.component,
            missing = %endpoint.component,
            "Skipping connection to undeclared component"
          );
        }
        dangling.is_none()
      })
      .cloned()
      .collect();

    let network = config.name.clone();
    let audit_address = format!("{}.__auditor", network);
    let worker_addresses = |component: &str, instances: usize| -> Vec<String> {
      (1..=instances)
        .map(|n| format!("{}.{}-{}", network, component, n))
        .collect()
    };

    let nodes = config
      .components
      .iter()
      .map(|(name, component)| {
        let outputs: Vec<OutputSpec> = connections
          .iter()
          .filter(|c| &c.source.component == name)
          .map(|c| {
            let target_instances = config
              .components
              .get(&c.target.component)
              .map(|t| t.instances)
              .unwrap_or(0);
            OutputSpec {
              port: c.source.port.clone(),
              target_component: c.target.component.clone(),
              target_port: c.target.port.clone(),
              grouping: c.grouping.clone(),
              addresses: worker_addresses(&c.target.component, target_instances),
            }
          })
          .collect();

        let workers = worker_addresses(name, component.instances)
          .into_iter()
          .enumerate()
          .map(|(i, address)| WorkerSpec {
            address,
            executable_ref: component.main.clone(),
            config: component.config.clone(),
            group_id: component.group.clone(),
            heartbeat_address: None,
            network: network.clone(),
            auditor: audit_address.clone(),
            component: name.clone(),
            instance: i + 1,
            instances: component.instances,
            outputs: outputs.clone(),
          })
          .collect();

        NodeContext {
          name: name.clone(),
          address: format!("{}.{}", network, name),
          workers,
        }
      })
      .collect();

    Ok(Self {
      name: config.name.clone(),
      audit_address,
      nodes,
      connections,
    })
  }

  /// Network name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Network control address.
  pub fn address(&self) -> &str {
    &self.name
  }

  /// Address of the network's auditor.
  pub fn audit_address(&self) -> &str {
    &self.audit_address
  }

  /// Component nodes in name order.
  pub fn nodes(&self) -> &[NodeContext] {
    &self.nodes
  }

  /// Connections between declared components.
  pub fn connections(&self) -> &[ConnectionConfig] {
    &self.connections
  }

  /// Iterates over every worker of every node.
  pub fn workers(&self) -> impl Iterator<Item = &WorkerSpec> {
    self.nodes.iter().flat_map(|n| n.workers.iter())
  }

  /// Looks up a worker by address.
  pub fn worker(&self, address: &str) -> Option<&WorkerSpec> {
    self.workers().find(|w| w.address == address)
  }
}
