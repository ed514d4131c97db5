//! Deploying, looking up and undeploying whole networks by name.
//!
//! The set of live networks is kept in the cluster's [`Coordination`] map
//! `networks`, so every manager sharing that backend sees the same registry.
//! Each entry stores the network's configuration and a deployment number.
//!
//! Deploying a network whose name is already live merges the new
//! configuration into the running one. Changes to one network are serialized
//! through the coordination lock `networks.{name}`.

use crate::cluster::Cluster;
use crate::coordination::Coordination;
use crate::coordinator::{CoordinatorConfig, NetworkCoordinator};
use crate::error::{DeploymentError, TopologyError};
use crate::topology::NetworkConfig;
use crate::transport::Transport;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

const NETWORKS: &str = "networks";
const DEPLOYMENTS: &str = "deployments";

/// Entry point for running networks on a cluster.
pub struct ClusterManager {
  id: String,
  cluster: Arc<dyn Cluster>,
  transport: Arc<dyn Transport>,
  coordination: Arc<dyn Coordination>,
  config: CoordinatorConfig,
  lock_timeout: Duration,
  coordinators: Mutex<HashMap<String, NetworkCoordinator>>,
}

impl ClusterManager {
  /// Creates a manager over the given cluster capabilities.
  pub fn new(cluster: Arc<dyn Cluster>, transport: Arc<dyn Transport>, coordination: Arc<dyn Coordination>) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      cluster,
      transport,
      coordination,
      config: CoordinatorConfig::default(),
      lock_timeout: Duration::from_secs(30),
      coordinators: Mutex::new(HashMap::new()),
    }
  }

  /// Sets the configuration given to every network coordinator.
  #[must_use]
  pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
    self.config = config;
    self
  }

  /// Sets how long a deploy or undeploy waits for the network's lock.
  #[must_use]
  pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
    self.lock_timeout = timeout;
    self
  }

  /// Deploys a network and returns its coordinator.
  ///
  /// If a network with the same name is already deployed through this
  /// manager, `config` is merged into it: new components are deployed,
  /// changed ones replaced, and the rest keep running.
  ///
  /// A network whose workers only partly deployed stays registered and can be
  /// undeployed by name; the first deployment failure is still returned.
  pub async fn deploy_network(&self, config: NetworkConfig) -> Result<NetworkCoordinator, DeploymentError> {
    let topology = config.build()?;
    let name = topology.name().to_string();
    self
      .locked(&name, async {
        let deployment = self.coordination.next_id(DEPLOYMENTS).await;
        if !self
          .coordination
          .put_if_absent(NETWORKS, &name, registry_entry(&config, deployment)?)
          .await
        {
          return self.merge_network(&name, config, deployment).await;
        }

        let coordinator = NetworkCoordinator::new(
          topology,
          self.cluster.clone(),
          self.transport.clone(),
          self.config.clone(),
        );
        self
          .coordinators
          .lock()
          .await
          .insert(name.clone(), coordinator.clone());

        match coordinator.start().await {
          Ok(()) => {
            info!(network = %name, deployment, "Network deployed");
            Ok(coordinator)
          }
          Err(e) => {
            error!(network = %name, error = %e, "Network deployment failed");
            Err(e)
          }
        }
      })
      .await
  }

  async fn merge_network(
    &self,
    name: &str,
    config: NetworkConfig,
    deployment: u64,
  ) -> Result<NetworkCoordinator, DeploymentError> {
    let Some(coordinator) = self.coordinator(name).await else {
      return Err(DeploymentError::InvalidState {
        expected: "deployed by this manager".to_string(),
        actual: "deployed elsewhere".to_string(),
      });
    };
    let mut merged = self.get_network(name).await.unwrap_or_else(|| NetworkConfig::new(name));
    merged.merge(&config);
    let topology = merged.build()?;

    self
      .coordination
      .put(NETWORKS, name, registry_entry(&merged, deployment)?)
      .await;
    match coordinator.merge(topology).await {
      Ok(()) => {
        info!(network = %name, deployment, "Network merged");
        Ok(coordinator)
      }
      Err(e) => {
        error!(network = %name, error = %e, "Network merge failed");
        Err(e)
      }
    }
  }

  /// Deploys a network described as JSON.
  pub async fn deploy_network_json(&self, config: Value) -> Result<NetworkCoordinator, DeploymentError> {
    self.deploy_network(NetworkConfig::from_json(config)?).await
  }

  /// Shuts a network down and removes it from the registry.
  pub async fn undeploy_network(&self, name: &str) -> Result<(), DeploymentError> {
    self
      .locked(name, async {
        let coordinator = self.coordinators.lock().await.remove(name);
        let registered = self.coordination.remove(NETWORKS, name).await.is_some();
        match coordinator {
          Some(coordinator) => {
            let result = coordinator.shutdown().await;
            info!(network = %name, "Network undeployed");
            result
          }
          None if registered => Ok(()),
          None => Err(DeploymentError::NotDeployed(name.to_string())),
        }
      })
      .await
  }

  /// Undeploys the network `config` names.
  pub async fn undeploy_network_config(&self, config: &NetworkConfig) -> Result<(), DeploymentError> {
    self.undeploy_network(&config.name).await
  }

  /// Configuration of a live network.
  pub async fn get_network(&self, name: &str) -> Option<NetworkConfig> {
    let entry = self.coordination.get(NETWORKS, name).await?;
    NetworkConfig::from_json(entry.get("config")?.clone()).ok()
  }

  /// Returns true if a network with this name is live.
  pub async fn is_deployed(&self, name: &str) -> bool {
    self.coordination.get(NETWORKS, name).await.is_some()
  }

  /// Names of every live network.
  pub async fn networks(&self) -> Vec<String> {
    self.coordination.keys(NETWORKS).await
  }

  /// Coordinator of a network deployed through this manager.
  pub async fn coordinator(&self, name: &str) -> Option<NetworkCoordinator> {
    self.coordinators.lock().await.get(name).cloned()
  }

  /// Runs `work` while holding the network's coordination lock.
  async fn locked<T, F>(&self, name: &str, work: F) -> Result<T, DeploymentError>
  where
    F: Future<Output = Result<T, DeploymentError>>,
  {
    let lock = format!("{}.{}", NETWORKS, name);
    if !self.coordination.lock(&lock, &self.id, self.lock_timeout).await {
      return Err(DeploymentError::Busy(name.to_string()));
    }
    debug!(network = %name, manager = %self.id, "Network lock taken");
    let result = work.await;
    self.coordination.unlock(&lock, &self.id).await;
    result
  }
}

fn registry_entry(config: &NetworkConfig, deployment: u64) -> Result<Value, DeploymentError> {
  Ok(json!({
    "config": serde_json::to_value(config).map_err(|e| TopologyError::InvalidConfig(e.to_string()))?,
    "deployment": deployment,
  }))
}
