//! Recursive deploy and undeploy passes.
//!
//! A pass is a join over nodes, and within each node a join over its workers.
//! Siblings are never cancelled when one of them fails; the pass reports the
//! first failure once everything has finished.
//!
//! Every pass runs under a generation number taken from the coordinator
//! state. Undeploy, redeploy and shutdown advance the generation, and a
//! worker whose deployment finishes under an older generation is undeployed
//! again instead of being recorded.

use super::{Inner, NetworkStatus};
use crate::cluster::DeploymentHandle;
use crate::error::DeploymentError;
use crate::topology::{NetworkTopology, NodeContext, WorkerSpec};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

impl Inner {
  pub(super) async fn deploy_topology(&self, topology: &NetworkTopology, generation: u64) -> Result<(), DeploymentError> {
    first_error(join_all(topology.nodes().iter().map(|node| self.deploy_node(node, generation))).await)
  }

  pub(super) async fn undeploy_topology(&self, topology: &NetworkTopology) -> Result<(), DeploymentError> {
    first_error(join_all(topology.nodes().iter().map(|node| self.undeploy_node(node))).await)
  }

  async fn deploy_node(&self, node: &NodeContext, generation: u64) -> Result<(), DeploymentError> {
    debug!(node = %node.address, workers = node.workers.len(), "Deploying node");
    first_error(join_all(node.workers.iter().map(|w| self.deploy_worker(w.clone(), generation))).await)
  }

  async fn undeploy_node(&self, node: &NodeContext) -> Result<(), DeploymentError> {
    debug!(node = %node.address, "Undeploying node");
    first_error(join_all(node.workers.iter().map(|w| self.undeploy_worker(&w.address))).await)
  }

  /// Deploys one worker and records its handle and spec.
  pub(super) async fn deploy_worker(&self, spec: WorkerSpec, generation: u64) -> Result<DeploymentHandle, DeploymentError> {
    let address = spec.address.clone();
    self
      .state
      .lock()
      .await
      .specs
      .insert(address.clone(), spec.clone());

    match self.cluster.deploy(&spec).await {
      Ok(handle) => {
        self.record(spec, handle.clone(), generation).await?;
        info!(address = %address, handle = %handle, "Worker deployed");
        Ok(handle)
      }
      Err(e) => {
        error!(address = %address, error = %e, "Worker deployment failed");
        Err(e)
      }
    }
  }

  /// Replaces the running instance of `spec.address` with a fresh one.
  ///
  /// The previous handle is undeployed first, ignoring failure, and any
  /// heartbeat monitor of the worker is stopped. Only allowed while the
  /// network is running.
  pub(super) async fn replace_worker(&self, mut spec: WorkerSpec) -> Result<DeploymentHandle, DeploymentError> {
    let address = spec.address.clone();
    spec.heartbeat_address = None;
    let (previous, generation) = {
      let mut state = self.state.lock().await;
      state.require_running()?;
      if let Some(monitor) = state.heartbeats.remove(&address) {
        monitor.unlisten();
      }
      // The new instance registers against this spec as soon as it starts.
      state.specs.insert(address.clone(), spec.clone());
      (state.deployments.remove(&address), state.generation)
    };
    if let Some(handle) = previous {
      if let Err(e) = self.cluster.undeploy(&handle).await {
        warn!(address = %address, handle = %handle, error = %e, "Failed to undeploy worker before redeploy");
      }
    }

    match self.cluster.deploy(&spec).await {
      Ok(handle) => {
        self.record(spec, handle.clone(), generation).await?;
        info!(address = %address, handle = %handle, "Worker redeployed");
        Ok(handle)
      }
      Err(e) => {
        error!(address = %address, error = %e, "Worker redeployment failed");
        Err(e)
      }
    }
  }

  /// Records a fresh deployment, or undeploys it when the network moved on
  /// while it was being deployed.
  async fn record(&self, spec: WorkerSpec, handle: DeploymentHandle, generation: u64) -> Result<(), DeploymentError> {
    let stale = {
      let mut state = self.state.lock().await;
      if state.generation == generation && !state.shutting_down {
        state.deployments.insert(spec.address.clone(), handle.clone());
        state.specs.insert(spec.address.clone(), spec.clone());
        None
      } else {
        Some(if state.shutting_down {
          "shutting down".to_string()
        } else {
          state.status.to_string()
        })
      }
    };
    let Some(actual) = stale else {
      return Ok(());
    };

    warn!(address = %spec.address, handle = %handle, state = %actual, "Network changed during deployment, undeploying worker");
    if let Err(e) = self.cluster.undeploy(&handle).await {
      error!(address = %spec.address, handle = %handle, error = %e, "Failed to undeploy stale worker");
    }
    Err(DeploymentError::InvalidState {
      expected: NetworkStatus::Running.to_string(),
      actual,
    })
  }

  async fn undeploy_worker(&self, address: &str) -> Result<(), DeploymentError> {
    let handle = self.state.lock().await.deployments.remove(address);
    let Some(handle) = handle else {
      debug!(address = %address, "Worker not deployed, nothing to undeploy");
      return Ok(());
    };
    match self.cluster.undeploy(&handle).await {
      Ok(()) => {
        info!(address = %address, handle = %handle, "Worker undeployed");
        Ok(())
      }
      Err(DeploymentError::NotDeployed(_)) => {
        debug!(address = %address, handle = %handle, "Worker already gone");
        Ok(())
      }
      Err(e) => {
        error!(address = %address, handle = %handle, error = %e, "Worker undeployment failed");
        Err(e)
      }
    }
  }
}

pub(super) fn first_error<T>(results: Vec<Result<T, DeploymentError>>) -> Result<(), DeploymentError> {
  match results.into_iter().find_map(Result::err) {
    Some(e) => Err(e),
    None => Ok(()),
  }
}
