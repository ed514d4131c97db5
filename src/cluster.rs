//! Cluster deploy/undeploy capability.
//!
//! The coordinator drives the cluster through two calls only: deploy a
//! [`WorkerSpec`] and get a [`DeploymentHandle`] back, or undeploy a handle.
//! Placement, process management and resource accounting belong to the
//! implementation.
//!
//! [`LocalCluster`] runs every deployment as a tokio task inside the current
//! process. Executables are resolved through registered [`WorkerFactory`]s.
//! A worker whose future returns on its own is forgotten at once; one that was
//! aborted or panicked stays recorded until it is undeployed.

use crate::error::DeploymentError;
use crate::topology::WorkerSpec;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque identifier of one running deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentHandle(String);

impl DeploymentHandle {
  /// Wraps a cluster-assigned deployment id.
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// The deployment id.
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Display for DeploymentHandle {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Deploy capability of a cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
  /// Starts one instance described by `spec`.
  async fn deploy(&self, spec: &WorkerSpec) -> Result<DeploymentHandle, DeploymentError>;

  /// Stops the deployment identified by `handle`.
  async fn undeploy(&self, handle: &DeploymentHandle) -> Result<(), DeploymentError>;
}

/// Starts the code behind an executable reference.
///
/// The returned future runs for the worker's lifetime and must finish promptly
/// once `shutdown` is cancelled.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
  /// Runs one worker instance until shutdown.
  async fn run(&self, spec: WorkerSpec, transport: Arc<dyn Transport>, shutdown: CancellationToken);
}

type BoxedRun = Pin<Box<dyn Future<Output = ()> + Send>>;

struct WorkerFactoryWrapper<F> {
  function: F,
}

#[async_trait]
impl<F> WorkerFactory for WorkerFactoryWrapper<F>
where
  F: Fn(WorkerSpec, Arc<dyn Transport>, CancellationToken) -> BoxedRun + Send + Sync,
{
  async fn run(&self, spec: WorkerSpec, transport: Arc<dyn Transport>, shutdown: CancellationToken) {
    (self.function)(spec, transport, shutdown).await
  }
}

/// Creates a [`WorkerFactory`] from an async closure.
pub fn worker_fn<F, Fut>(function: F) -> Arc<dyn WorkerFactory>
where
  F: Fn(WorkerSpec, Arc<dyn Transport>, CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  Arc::new(WorkerFactoryWrapper {
    function: move |spec, transport, shutdown| Box::pin(function(spec, transport, shutdown)) as BoxedRun,
  })
}

struct LocalDeployment {
  address: String,
  shutdown: CancellationToken,
  task: JoinHandle<()>,
}

/// In-process cluster running each deployment as a tokio task.
#[derive(Clone)]
pub struct LocalCluster {
  transport: Arc<dyn Transport>,
  factories: Arc<RwLock<HashMap<String, Arc<dyn WorkerFactory>>>>,
  deployments: Arc<Mutex<HashMap<DeploymentHandle, LocalDeployment>>>,
  shutdown_grace: Duration,
}

impl LocalCluster {
  /// Creates a cluster whose workers talk over `transport`.
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self {
      transport,
      factories: Arc::new(RwLock::new(HashMap::new())),
      deployments: Arc::new(Mutex::new(HashMap::new())),
      shutdown_grace: Duration::from_secs(5),
    }
  }

  /// Sets how long undeploy waits for a worker before aborting it.
  #[must_use]
  pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  /// Registers the factory behind an executable reference.
  pub async fn register_factory(&self, executable_ref: impl Into<String>, factory: Arc<dyn WorkerFactory>) {
    self
      .factories
      .write()
      .await
      .insert(executable_ref.into(), factory);
  }

  /// Number of recorded deployments.
  pub async fn deployment_count(&self) -> usize {
    self.deployments.lock().await.len()
  }

  /// Handles of the deployments running at `address`.
  pub async fn handles_for(&self, address: &str) -> Vec<DeploymentHandle> {
    self
      .deployments
      .lock()
      .await
      .iter()
      .filter(|(_, d)| d.address == address)
      .map(|(h, _)| h.clone())
      .collect()
  }

  /// Kills a deployment's task without a graceful shutdown.
  ///
  /// The deployment stays recorded, the way a crashed process keeps its
  /// deployment id until someone undeploys it.
  pub async fn abort(&self, handle: &DeploymentHandle) -> Result<(), DeploymentError> {
    let deployments = self.deployments.lock().await;
    let deployment = deployments
      .get(handle)
      .ok_or_else(|| DeploymentError::NotDeployed(handle.to_string()))?;
    warn!(address = %deployment.address, handle = %handle, "Aborting worker");
    deployment.task.abort();
    Ok(())
  }
}

#[async_trait]
impl Cluster for LocalCluster {
  async fn deploy(&self, spec: &WorkerSpec) -> Result<DeploymentHandle, DeploymentError> {
    let factory = self
      .factories
      .read()
      .await
      .get(&spec.executable_ref)
      .cloned()
      .ok_or_else(|| DeploymentError::UnknownExecutable(spec.executable_ref.clone()))?;

    let handle = DeploymentHandle::new(Uuid::new_v4().to_string());
    let shutdown = CancellationToken::new();
    let transport = self.transport.clone();
    let worker_spec = spec.clone();
    let token = shutdown.clone();
    let registry = self.deployments.clone();
    let own = handle.clone();

    // Held across the spawn so the record exists before the task can finish.
    let mut deployments = self.deployments.lock().await;
    let task = tokio::spawn(async move {
      factory.run(worker_spec, transport, token).await;
      if let Some(finished) = registry.lock().await.remove(&own) {
        debug!(address = %finished.address, handle = %own, "Worker exited");
      }
    });
    deployments.insert(
      handle.clone(),
      LocalDeployment {
        address: spec.address.clone(),
        shutdown,
        task,
      },
    );
    debug!(address = %spec.address, handle = %handle, "Deployed worker");
    Ok(handle)
  }

  async fn undeploy(&self, handle: &DeploymentHandle) -> Result<(), DeploymentError> {
    let deployment = self
      .deployments
      .lock()
      .await
      .remove(handle)
      .ok_or_else(|| DeploymentError::NotDeployed(handle.to_string()))?;

    deployment.shutdown.cancel();
    let abort = deployment.task.abort_handle();
    if tokio::time::timeout(self.shutdown_grace, deployment.task)
      .await
      .is_err()
    {
      warn!(address = %deployment.address, handle = %handle, "Worker ignored shutdown, aborting");
      abort.abort();
    }
    debug!(address = %deployment.address, handle = %handle, "Undeployed worker");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::LocalTransport;
  use serde_json::Value;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn spec(address: &str, executable_ref: &str) -> WorkerSpec {
    WorkerSpec {
      address: address.to_string(),
      executable_ref: executable_ref.to_string(),
      config: Value::Null,
      group_id: None,
      heartbeat_address: None,
      network: "net".to_string(),
      auditor: "net.__auditor".to_string(),
      component: "c".to_string(),
      instance: 1,
      instances: 1,
      outputs: Vec::new(),
    }
  }

  #[tokio::test]
  async fn test_deploy_unknown_executable_fails() {
    let cluster = LocalCluster::new(Arc::new(LocalTransport::new()));
    let err = cluster.deploy(&spec("net.c-1", "missing")).await.unwrap_err();
    assert_eq!(err, DeploymentError::UnknownExecutable("missing".to_string()));
  }

  #[tokio::test]
  async fn test_deploy_and_undeploy_runs_worker_until_shutdown() {
    let cluster = LocalCluster::new(Arc::new(LocalTransport::new()));
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = stopped.clone();
    cluster
      .register_factory(
        "sleeper",
        worker_fn(move |_spec, _transport, shutdown| {
          let counter = counter.clone();
          async move {
            shutdown.cancelled().await;
            counter.fetch_add(1, Ordering::SeqCst);
          }
        }),
      )
      .await;

    let handle = cluster.deploy(&spec("net.c-1", "sleeper")).await.unwrap();
    assert_eq!(cluster.deployment_count().await, 1);
    assert_eq!(cluster.handles_for("net.c-1").await, vec![handle.clone()]);

    cluster.undeploy(&handle).await.unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.deployment_count().await, 0);

    let err = cluster.undeploy(&handle).await.unwrap_err();
    assert!(matches!(err, DeploymentError::NotDeployed(_)));
  }

  #[tokio::test]
  async fn test_worker_that_exits_is_forgotten() {
    let cluster = LocalCluster::new(Arc::new(LocalTransport::new()));
    cluster
      .register_factory("oneshot", worker_fn(|_spec, _transport, _shutdown| async {}))
      .await;

    for _ in 0..3 {
      cluster.deploy(&spec("net.c-1", "oneshot")).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), async {
      while cluster.deployment_count().await > 0 {
        tokio::task::yield_now().await;
      }
    })
    .await
    .unwrap();
    assert!(cluster.handles_for("net.c-1").await.is_empty());
  }

  #[tokio::test]
  async fn test_aborted_worker_stays_recorded_until_undeployed() {
    let cluster = LocalCluster::new(Arc::new(LocalTransport::new()));
    cluster
      .register_factory(
        "sleeper",
        worker_fn(|_spec, _transport, shutdown| async move { shutdown.cancelled().await }),
      )
      .await;

    let handle = cluster.deploy(&spec("net.c-1", "sleeper")).await.unwrap();
    cluster.abort(&handle).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.deployment_count().await, 1);

    cluster.undeploy(&handle).await.unwrap();
    assert_eq!(cluster.deployment_count().await, 0);
  }
}
