//! Tests for network deployment and heartbeat recovery.

use crate::cluster::{Cluster, DeploymentHandle};
use crate::coordinator::{CoordinatorConfig, NetworkCoordinator, NetworkStatus};
use crate::error::DeploymentError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatEmitter};
use crate::topology::{ComponentConfig, ConnectionConfig, NetworkConfig, NetworkTopology, WorkerSpec};
use crate::transport::{LocalTransport, Transport};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
  Deploy(String),
  Undeploy(String),
}

#[derive(Default)]
struct MockCluster {
  calls: Mutex<Vec<Call>>,
  refuse: Mutex<HashSet<String>>,
  handles: Mutex<HashMap<DeploymentHandle, String>>,
  live: Mutex<HashSet<DeploymentHandle>>,
  deploy_delay: Mutex<Duration>,
}

impl MockCluster {
  fn refusing(addresses: &[&str]) -> Self {
    let cluster = Self::default();
    cluster
      .refuse
      .lock()
      .unwrap()
      .extend(addresses.iter().map(|a| a.to_string()));
    cluster
  }

  fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  fn clear(&self) {
    self.calls.lock().unwrap().clear();
  }

  fn set_deploy_delay(&self, delay: Duration) {
    *self.deploy_delay.lock().unwrap() = delay;
  }

  fn live(&self) -> usize {
    self.live.lock().unwrap().len()
  }
}

#[async_trait]
impl Cluster for MockCluster {
  async fn deploy(&self, spec: &WorkerSpec) -> Result<DeploymentHandle, DeploymentError> {
    let delay = *self.deploy_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    self
      .calls
      .lock()
      .unwrap()
      .push(Call::Deploy(spec.address.clone()));
    if self.refuse.lock().unwrap().contains(&spec.address) {
      return Err(DeploymentError::Refused {
        address: spec.address.clone(),
        reason: "no capacity".to_string(),
      });
    }
    let mut handles = self.handles.lock().unwrap();
    let handle = DeploymentHandle::new(format!("h-{}", handles.len() + 1));
    handles.insert(handle.clone(), spec.address.clone());
    self.live.lock().unwrap().insert(handle.clone());
    Ok(handle)
  }

  async fn undeploy(&self, handle: &DeploymentHandle) -> Result<(), DeploymentError> {
    let address = self
      .handles
      .lock()
      .unwrap()
      .get(handle)
      .cloned()
      .ok_or_else(|| DeploymentError::NotDeployed(handle.to_string()))?;
    self.calls.lock().unwrap().push(Call::Undeploy(address));
    self.live.lock().unwrap().remove(handle);
    Ok(())
  }
}

fn topology() -> NetworkTopology {
  NetworkConfig::new("net")
    .with_component("a", ComponentConfig::new("worker").with_instances(2))
    .with_component("b", ComponentConfig::new("worker"))
    .with_connection(ConnectionConfig::new(("a", "out"), ("b", "in")))
    .build()
    .unwrap()
}

fn coordinator(cluster: Arc<MockCluster>, transport: Arc<dyn Transport>) -> NetworkCoordinator {
  let config = CoordinatorConfig::default().with_heartbeat(
    HeartbeatConfig::default()
      .with_interval(Duration::from_millis(100))
      .with_missed_threshold(2),
  );
  NetworkCoordinator::new(topology(), cluster, transport, config)
}

fn deploys(calls: &[Call]) -> Vec<&str> {
  calls
    .iter()
    .filter_map(|c| match c {
      Call::Deploy(a) => Some(a.as_str()),
      Call::Undeploy(_) => None,
    })
    .collect()
}

#[tokio::test]
async fn test_deploy_completes_after_every_worker() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);

  coordinator.deploy().await.unwrap();

  assert_eq!(coordinator.status().await, NetworkStatus::Running);
  assert_eq!(coordinator.deployment_count().await, 3);
  let mut deployed = deploys(&cluster.calls()).into_iter().map(str::to_string).collect::<Vec<_>>();
  deployed.sort();
  assert_eq!(deployed, vec!["net.a-1", "net.a-2", "net.b-1"]);
}

#[tokio::test]
async fn test_failed_worker_fails_deploy_without_rollback() {
  let cluster = Arc::new(MockCluster::refusing(&["net.a-2"]));
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));

  let err = coordinator.deploy().await.unwrap_err();
  assert_eq!(
    err,
    DeploymentError::Refused {
      address: "net.a-2".to_string(),
      reason: "no capacity".to_string(),
    }
  );
  assert!(coordinator.handle("net.a-1").await.is_some());
  assert!(coordinator.handle("net.a-2").await.is_none());
  assert!(coordinator.handle("net.b-1").await.is_some());
  assert_eq!(coordinator.status().await, NetworkStatus::Running);
  assert!(!cluster.calls().iter().any(|c| matches!(c, Call::Undeploy(_))));
}

#[tokio::test]
async fn test_undeploy_skips_workers_without_handle() {
  let cluster = Arc::new(MockCluster::refusing(&["net.a-2"]));
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  let _ = coordinator.deploy().await;
  cluster.clear();

  coordinator.undeploy().await.unwrap();

  let mut undeployed: Vec<Call> = cluster.calls();
  undeployed.sort_by_key(|c| format!("{:?}", c));
  assert_eq!(
    undeployed,
    vec![
      Call::Undeploy("net.a-1".to_string()),
      Call::Undeploy("net.b-1".to_string()),
    ]
  );
  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);
  assert_eq!(coordinator.deployment_count().await, 0);
}

#[tokio::test]
async fn test_state_machine_rejects_out_of_order_calls() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster, Arc::new(LocalTransport::new()));

  assert!(matches!(
    coordinator.undeploy().await,
    Err(DeploymentError::InvalidState { .. })
  ));
  coordinator.deploy().await.unwrap();
  assert_eq!(
    coordinator.deploy().await,
    Err(DeploymentError::InvalidState {
      expected: "undeployed".to_string(),
      actual: "running".to_string(),
    })
  );
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_redeploys_only_that_worker() {
  let cluster = Arc::new(MockCluster::default());
  let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
  let coordinator = coordinator(cluster.clone(), transport.clone());
  coordinator.deploy().await.unwrap();
  let old_handle = coordinator.handle("net.a-1").await.unwrap();

  let silent = coordinator.register("net.a-1").await.unwrap();
  let healthy = coordinator.register("net.a-2").await.unwrap();
  assert_ne!(silent, healthy);
  let emitter = HeartbeatEmitter::start(healthy, transport.clone(), Duration::from_millis(100));
  cluster.clear();

  tokio::time::sleep(Duration::from_secs(2)).await;

  assert_eq!(
    cluster.calls(),
    vec![
      Call::Undeploy("net.a-1".to_string()),
      Call::Deploy("net.a-1".to_string()),
    ]
  );
  let new_handle = coordinator.handle("net.a-1").await.unwrap();
  assert_ne!(new_handle, old_handle);
  assert!(coordinator.heartbeat_address("net.a-1").await.is_none());
  assert!(coordinator.heartbeat_address("net.a-2").await.is_some());
  emitter.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reregistration_replaces_monitor() {
  let cluster = Arc::new(MockCluster::default());
  let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
  let coordinator = coordinator(cluster.clone(), transport.clone());
  coordinator.deploy().await.unwrap();

  let first = coordinator.register("net.b-1").await.unwrap();
  let second = coordinator.register("net.b-1").await.unwrap();
  assert_ne!(first, second);
  let emitter = HeartbeatEmitter::start(second.clone(), transport, Duration::from_millis(100));
  cluster.clear();

  tokio::time::sleep(Duration::from_secs(2)).await;

  assert!(cluster.calls().is_empty());
  assert_eq!(coordinator.heartbeat_address("net.b-1").await, Some(second));
  emitter.stop().await;
}

#[tokio::test]
async fn test_unregister_redeploys_worker() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  coordinator.deploy().await.unwrap();
  coordinator.register("net.b-1").await.unwrap();
  cluster.clear();

  coordinator.unregister("net.b-1").await.unwrap();

  assert_eq!(
    cluster.calls(),
    vec![
      Call::Undeploy("net.b-1".to_string()),
      Call::Deploy("net.b-1".to_string()),
    ]
  );
  assert!(coordinator.heartbeat_address("net.b-1").await.is_none());

  cluster.clear();
  coordinator.unregister("net.b-1").await.unwrap();
  assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_unregister_during_shutdown_does_not_redeploy() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  coordinator.deploy().await.unwrap();
  coordinator.register("net.a-1").await.unwrap();
  coordinator.register("net.b-1").await.unwrap();
  cluster.clear();

  coordinator.shutdown().await.unwrap();
  coordinator.unregister("net.a-1").await.unwrap();
  coordinator.unregister("net.b-1").await.unwrap();

  let calls = cluster.calls();
  assert_eq!(calls.len(), 3);
  assert!(deploys(&calls).is_empty());
  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_worker_recovery_leaves_nothing_deployed() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  coordinator.deploy().await.unwrap();
  coordinator.register("net.a-1").await.unwrap();
  cluster.set_deploy_delay(Duration::from_millis(500));

  let recovery = tokio::spawn({
    let coordinator = coordinator.clone();
    async move { coordinator.redeploy_worker("net.a-1").await }
  });
  // The replacement is still deploying when the shutdown lands.
  tokio::time::sleep(Duration::from_millis(100)).await;
  coordinator.shutdown().await.unwrap();

  let result = recovery.await.unwrap();
  assert!(matches!(result, Err(DeploymentError::InvalidState { .. })));
  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);
  assert_eq!(coordinator.deployment_count().await, 0);
  assert!(coordinator.handle("net.a-1").await.is_none());
  assert_eq!(cluster.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_recovery_racing_shutdown_leaves_nothing_deployed() {
  let cluster = Arc::new(MockCluster::default());
  let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
  let coordinator = coordinator(cluster.clone(), transport);
  coordinator.deploy().await.unwrap();
  coordinator.register("net.a-1").await.unwrap();
  cluster.set_deploy_delay(Duration::from_secs(1));
  cluster.clear();

  // Long enough for the silent worker to be declared lost, short of its
  // replacement finishing.
  tokio::time::sleep(Duration::from_millis(700)).await;
  assert_eq!(cluster.calls(), vec![Call::Undeploy("net.a-1".to_string())]);
  coordinator.shutdown().await.unwrap();
  tokio::time::sleep(Duration::from_secs(2)).await;

  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);
  assert_eq!(coordinator.deployment_count().await, 0);
  assert_eq!(cluster.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_deploy_pass_leaves_nothing_deployed() {
  let cluster = Arc::new(MockCluster::default());
  cluster.set_deploy_delay(Duration::from_millis(500));
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));

  let deploy = tokio::spawn({
    let coordinator = coordinator.clone();
    async move { coordinator.deploy().await }
  });
  tokio::time::sleep(Duration::from_millis(100)).await;
  coordinator.shutdown().await.unwrap();

  assert!(deploy.await.unwrap().is_err());
  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);
  assert_eq!(coordinator.deployment_count().await, 0);
  assert_eq!(cluster.live(), 0);
}

#[tokio::test]
async fn test_merge_touches_only_new_and_changed_workers() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  coordinator.deploy().await.unwrap();
  let beat = coordinator.register("net.a-1").await.unwrap();
  let a1 = coordinator.handle("net.a-1").await.unwrap();
  let b1 = coordinator.handle("net.b-1").await.unwrap();
  cluster.clear();

  let grown = NetworkConfig::new("net")
    .with_component("a", ComponentConfig::new("worker").with_instances(2))
    .with_component("b", ComponentConfig::new("worker").with_config(json!({"window": 5})))
    .with_component("c", ComponentConfig::new("worker"))
    .with_connection(ConnectionConfig::new(("a", "out"), ("b", "in")))
    .build()
    .unwrap();
  coordinator.merge(grown).await.unwrap();

  let mut calls = cluster.calls();
  calls.sort_by_key(|c| format!("{:?}", c));
  assert_eq!(
    calls,
    vec![
      Call::Deploy("net.b-1".to_string()),
      Call::Deploy("net.c-1".to_string()),
      Call::Undeploy("net.b-1".to_string()),
    ]
  );
  assert_eq!(coordinator.deployment_count().await, 4);
  assert_eq!(coordinator.handle("net.a-1").await, Some(a1));
  assert_ne!(coordinator.handle("net.b-1").await, Some(b1));
  assert_eq!(coordinator.heartbeat_address("net.a-1").await, Some(beat));
  assert_eq!(coordinator.topology().await.workers().count(), 4);
}

#[tokio::test]
async fn test_merge_requires_running_network() {
  let coordinator = coordinator(Arc::new(MockCluster::default()), Arc::new(LocalTransport::new()));
  assert!(matches!(
    coordinator.merge(topology()).await,
    Err(DeploymentError::InvalidState { .. })
  ));
}

#[tokio::test]
async fn test_register_unknown_worker_is_rejected() {
  let coordinator = coordinator(Arc::new(MockCluster::default()), Arc::new(LocalTransport::new()));
  assert_eq!(
    coordinator.register("net.z-1").await,
    Err(DeploymentError::NotDeployed("net.z-1".to_string()))
  );
}

#[tokio::test]
async fn test_redeploy_all_replaces_topology() {
  let cluster = Arc::new(MockCluster::default());
  let coordinator = coordinator(cluster.clone(), Arc::new(LocalTransport::new()));
  coordinator.deploy().await.unwrap();
  cluster.clear();

  let smaller = NetworkConfig::new("net")
    .with_component("a", ComponentConfig::new("worker"))
    .build()
    .unwrap();
  coordinator.redeploy_all(Some(smaller)).await.unwrap();

  let calls = cluster.calls();
  assert_eq!(calls.iter().filter(|c| matches!(c, Call::Undeploy(_))).count(), 3);
  assert_eq!(deploys(&calls), vec!["net.a-1"]);
  assert_eq!(coordinator.status().await, NetworkStatus::Running);
  assert_eq!(coordinator.deployment_count().await, 1);
  assert_eq!(coordinator.topology().await.workers().count(), 1);
}

#[tokio::test]
async fn test_control_surface_over_transport() {
  let cluster = Arc::new(MockCluster::default());
  let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
  let coordinator = coordinator(cluster.clone(), transport.clone());
  coordinator.start().await.unwrap();
  assert_eq!(coordinator.deployment_count().await, 3);

  let reply = transport
    .send("net", json!({"action": "register", "address": "net.a-1"}))
    .await
    .unwrap();
  assert_eq!(reply["status"], json!("ok"));
  assert!(reply["address"].as_str().unwrap().starts_with("net.a-1.__heartbeat."));
  assert_eq!(reply["interval"], json!(100));

  cluster.clear();
  let reply = transport.send("net", json!({"action": "explode"})).await.unwrap();
  assert_eq!(reply["status"], json!("error"));
  assert_eq!(reply["message"], json!("Invalid action explode."));
  let reply = transport.send("net", json!({})).await.unwrap();
  assert_eq!(reply["message"], json!("No action specified."));
  assert!(cluster.calls().is_empty());
  assert_eq!(coordinator.deployment_count().await, 3);

  let reply = transport.send("net", json!({"action": "shutdown"})).await.unwrap();
  assert_eq!(reply["status"], json!("ok"));
  assert_eq!(coordinator.status().await, NetworkStatus::Undeployed);
  assert!(transport.send("net", json!({"action": "shutdown"})).await.is_err());
}
