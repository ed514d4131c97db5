//! # Network Coordinator
//!
//! Deploys a [`NetworkTopology`] onto a [`Cluster`] and keeps it running.
//!
//! ```text
//! Undeployed --deploy--> Deploying --> Running --undeploy--> Undeploying --> Undeployed
//!                            ^            |
//!                            +--redeploy--+
//! ```
//!
//! The coordinator owns the network's control address. Deployed workers call
//! `register` there and receive a private heartbeat address; a
//! [`HeartbeatMonitor`] on that address triggers recovery of exactly that
//! worker when its beats stop. A worker that unregisters while the network is
//! running is redeployed at once, unless a shutdown is in progress.
//! A grown topology can be merged into a running network without touching
//! the workers it leaves unchanged.
//!
//! Coordinator state is guarded by a single async mutex that is never held
//! while the cluster is being called.

mod control;
mod deployer;

pub use control::ControlAction;

use crate::auditor::{Auditor, AuditorConfig, AuditorService};
use crate::cluster::{Cluster, DeploymentHandle};
use crate::error::DeploymentError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, heartbeat_address};
use crate::topology::{NetworkTopology, WorkerSpec};
use crate::transport::Transport;
use deployer::first_error;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  /// Nothing deployed.
  Undeployed,
  /// A deploy pass is in progress.
  Deploying,
  /// Deployed; heartbeat recovery is active.
  Running,
  /// An undeploy pass is in progress.
  Undeploying,
}

impl Display for NetworkStatus {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let name = match self {
      NetworkStatus::Undeployed => "undeployed",
      NetworkStatus::Deploying => "deploying",
      NetworkStatus::Running => "running",
      NetworkStatus::Undeploying => "undeploying",
    };
    f.write_str(name)
  }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
  /// Configuration of the network's auditor.
  pub auditor: AuditorConfig,
  /// Heartbeat timing expected from workers.
  pub heartbeat: HeartbeatConfig,
}

impl CoordinatorConfig {
  /// Sets the auditor configuration.
  #[must_use]
  pub fn with_auditor(mut self, auditor: AuditorConfig) -> Self {
    self.auditor = auditor;
    self
  }

  /// Sets the heartbeat configuration.
  #[must_use]
  pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
    self.heartbeat = heartbeat;
    self
  }
}

struct CoordinatorState {
  status: NetworkStatus,
  topology: NetworkTopology,
  deployments: HashMap<String, DeploymentHandle>,
  specs: HashMap<String, WorkerSpec>,
  heartbeats: HashMap<String, Arc<HeartbeatMonitor>>,
  shutting_down: bool,
  generation: u64,
}

impl CoordinatorState {
  fn stop_monitors(&mut self) {
    for (_, monitor) in self.heartbeats.drain() {
      monitor.unlisten();
    }
  }

  fn require(&self, expected: NetworkStatus) -> Result<(), DeploymentError> {
    if self.status == expected {
      Ok(())
    } else {
      Err(DeploymentError::InvalidState {
        expected: expected.to_string(),
        actual: self.status.to_string(),
      })
    }
  }

  fn require_running(&self) -> Result<(), DeploymentError> {
    if self.shutting_down {
      return Err(DeploymentError::InvalidState {
        expected: NetworkStatus::Running.to_string(),
        actual: "shutting down".to_string(),
      });
    }
    self.require(NetworkStatus::Running)
  }

  /// Starts a new deployment generation, orphaning every deploy in flight.
  fn advance(&mut self) -> u64 {
    self.generation += 1;
    self.generation
  }
}

struct Services {
  auditor: AuditorService,
  control: CancellationToken,
}

struct Inner {
  name: String,
  cluster: Arc<dyn Cluster>,
  transport: Arc<dyn Transport>,
  config: CoordinatorConfig,
  state: Mutex<CoordinatorState>,
  services: Mutex<Option<Services>>,
}

/// Deploys and supervises one network. Clones share the same coordinator.
#[derive(Clone)]
pub struct NetworkCoordinator {
  inner: Arc<Inner>,
}

impl NetworkCoordinator {
  /// Creates a coordinator for `topology`. Nothing is deployed yet.
  pub fn new(
    topology: NetworkTopology,
    cluster: Arc<dyn Cluster>,
    transport: Arc<dyn Transport>,
    config: CoordinatorConfig,
  ) -> Self {
    let state = CoordinatorState {
      status: NetworkStatus::Undeployed,
      specs: topology
        .workers()
        .map(|w| (w.address.clone(), w.clone()))
        .collect(),
      topology: topology.clone(),
      deployments: HashMap::new(),
      heartbeats: HashMap::new(),
      shutting_down: false,
      generation: 0,
    };
    Self {
      inner: Arc::new(Inner {
        name: topology.name().to_string(),
        cluster,
        transport,
        config,
        state: Mutex::new(state),
        services: Mutex::new(None),
      }),
    }
  }

  /// Network name, which is also its control address.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Current lifecycle state.
  pub async fn status(&self) -> NetworkStatus {
    self.inner.state.lock().await.status
  }

  /// Snapshot of the topology being coordinated.
  pub async fn topology(&self) -> NetworkTopology {
    self.inner.state.lock().await.topology.clone()
  }

  /// Deployment handle currently recorded for a worker.
  pub async fn handle(&self, address: &str) -> Option<DeploymentHandle> {
    self.inner.state.lock().await.deployments.get(address).cloned()
  }

  /// Number of workers with a recorded deployment.
  pub async fn deployment_count(&self) -> usize {
    self.inner.state.lock().await.deployments.len()
  }

  /// Heartbeat address of a registered worker.
  pub async fn heartbeat_address(&self, address: &str) -> Option<String> {
    self
      .inner
      .state
      .lock()
      .await
      .heartbeats
      .get(address)
      .map(|m| m.address().to_string())
  }

  /// Starts the auditor service and control loop, then deploys the network.
  pub async fn start(&self) -> Result<(), DeploymentError> {
    {
      let mut services = self.inner.services.lock().await;
      if services.is_some() {
        return Err(DeploymentError::InvalidState {
          expected: "stopped".to_string(),
          actual: "started".to_string(),
        });
      }
      let topology = self.topology().await;
      let auditor = Auditor::spawn(topology.audit_address(), self.inner.config.auditor.clone());
      let auditor = AuditorService::start(auditor, self.inner.transport.clone()).await?;
      let subscription = self.inner.transport.register(topology.address()).await?;
      let control = CancellationToken::new();
      control::spawn_control_loop(Arc::downgrade(&self.inner), subscription, control.clone());
      *services = Some(Services { auditor, control });
      info!(network = %self.inner.name, "Network started");
    }
    self.deploy().await
  }

  /// Deploys every worker of every node.
  ///
  /// Nodes and the workers within a node deploy concurrently. Workers that
  /// deployed stay deployed when a sibling fails; the first failure is
  /// returned and the network is running with what did deploy.
  pub async fn deploy(&self) -> Result<(), DeploymentError> {
    let (topology, generation) = {
      let mut state = self.inner.state.lock().await;
      state.require(NetworkStatus::Undeployed)?;
      state.status = NetworkStatus::Deploying;
      state.shutting_down = false;
      (state.topology.clone(), state.advance())
    };
    info!(network = %self.inner.name, "Deploying network");
    let result = self.inner.deploy_topology(&topology, generation).await;
    self.finish_deploy().await?;
    match &result {
      Ok(()) => info!(network = %self.inner.name, "Network deployed"),
      Err(e) => error!(network = %self.inner.name, error = %e, "Network deployed with failures"),
    }
    result
  }

  /// Marks a deploy pass finished. A shutdown that arrived during the pass
  /// found nothing running to undeploy, so whatever the pass recorded is
  /// undeployed here.
  async fn finish_deploy(&self) -> Result<(), DeploymentError> {
    let shutting_down = {
      let mut state = self.inner.state.lock().await;
      state.status = NetworkStatus::Running;
      state.shutting_down
    };
    if shutting_down {
      warn!(network = %self.inner.name, "Shutdown requested during deploy, undeploying");
      self.undeploy().await?;
      return Err(DeploymentError::InvalidState {
        expected: NetworkStatus::Running.to_string(),
        actual: "shutting down".to_string(),
      });
    }
    Ok(())
  }

  /// Undeploys every worker. Workers without a recorded handle are skipped.
  pub async fn undeploy(&self) -> Result<(), DeploymentError> {
    let topology = {
      let mut state = self.inner.state.lock().await;
      state.require(NetworkStatus::Running)?;
      state.status = NetworkStatus::Undeploying;
      state.stop_monitors();
      state.advance();
      state.topology.clone()
    };
    info!(network = %self.inner.name, "Undeploying network");
    let result = self.inner.undeploy_topology(&topology).await;
    self.inner.state.lock().await.status = NetworkStatus::Undeployed;
    match &result {
      Ok(()) => info!(network = %self.inner.name, "Network undeployed"),
      Err(e) => error!(network = %self.inner.name, error = %e, "Network undeployed with failures"),
    }
    result
  }

  /// Undeploys the network and stops its auditor service and control loop.
  ///
  /// Heartbeat recovery and unregister redeploys are disabled before anything
  /// is undeployed.
  pub async fn shutdown(&self) -> Result<(), DeploymentError> {
    let status = {
      let mut state = self.inner.state.lock().await;
      state.shutting_down = true;
      state.stop_monitors();
      state.advance();
      state.status
    };
    let result = if status == NetworkStatus::Running {
      self.undeploy().await
    } else {
      Ok(())
    };
    self.stop_services().await;
    info!(network = %self.inner.name, "Network shut down");
    result
  }

  /// Undeploys and deploys the whole network again.
  ///
  /// When `topology` is given it replaces the current one before the deploy
  /// pass.
  pub async fn redeploy_all(&self, topology: Option<NetworkTopology>) -> Result<(), DeploymentError> {
    let current = {
      let mut state = self.inner.state.lock().await;
      state.require_running()?;
      state.status = NetworkStatus::Undeploying;
      state.stop_monitors();
      state.advance();
      state.topology.clone()
    };
    info!(network = %self.inner.name, "Redeploying network");
    if let Err(e) = self.inner.undeploy_topology(&current).await {
      warn!(network = %self.inner.name, error = %e, "Undeploy before redeploy failed");
    }

    let (next, generation) = {
      let mut state = self.inner.state.lock().await;
      if let Some(topology) = topology {
        state.specs = topology
          .workers()
          .map(|w| (w.address.clone(), w.clone()))
          .collect();
        state.topology = topology;
      }
      state.status = NetworkStatus::Deploying;
      (state.topology.clone(), state.generation)
    };
    let result = self.inner.deploy_topology(&next, generation).await;
    self.finish_deploy().await?;
    result
  }

  /// Merges a grown topology into the running network.
  ///
  /// Workers the network does not have yet are deployed and workers whose
  /// spec changed are replaced. Unchanged workers keep running, and workers
  /// missing from `topology` are left alone.
  pub async fn merge(&self, topology: NetworkTopology) -> Result<(), DeploymentError> {
    if topology.name() != self.inner.name {
      return Err(DeploymentError::InvalidState {
        expected: self.inner.name.clone(),
        actual: topology.name().to_string(),
      });
    }
    let changed: Vec<WorkerSpec> = {
      let mut state = self.inner.state.lock().await;
      state.require_running()?;
      let changed = topology
        .workers()
        .filter(|w| match state.specs.get(&w.address) {
          Some(current) => !same_spec(current, w),
          None => true,
        })
        .cloned()
        .collect();
      state.topology = topology;
      changed
    };
    info!(network = %self.inner.name, workers = changed.len(), "Merging network");
    first_error(join_all(changed.into_iter().map(|spec| self.inner.replace_worker(spec))).await)
  }

  /// Registers a running worker and returns its heartbeat address.
  ///
  /// Every registration gets a new monitor on a new address; a previous
  /// monitor for the same worker is stopped.
  pub async fn register(&self, address: &str) -> Result<String, DeploymentError> {
    let beat_address = heartbeat_address(address);
    let monitor = Arc::new(HeartbeatMonitor::new(
      beat_address.clone(),
      self.inner.transport.clone(),
      self.inner.config.heartbeat.clone(),
    ));
    {
      let mut state = self.inner.state.lock().await;
      let spec = state
        .specs
        .get_mut(address)
        .ok_or_else(|| DeploymentError::NotDeployed(address.to_string()))?;
      spec.heartbeat_address = Some(beat_address.clone());
      if let Some(previous) = state.heartbeats.insert(address.to_string(), monitor.clone()) {
        previous.unlisten();
      }
    }

    let coordinator = Arc::downgrade(&self.inner);
    let worker = address.to_string();
    let lost = beat_address.clone();
    monitor
      .listen(move || {
        if let Some(inner) = coordinator.upgrade() {
          tokio::spawn(async move {
            NetworkCoordinator { inner }.heartbeat_lost(&worker, &lost).await;
          });
        }
      })
      .await?;

    info!(address = %address, heartbeat = %beat_address, "Worker registered");
    Ok(beat_address)
  }

  /// Unregisters a worker and redeploys it unless the network is shutting down.
  ///
  /// Only a registered worker is redeployed; an unregister from an instance
  /// that is already being replaced stops nothing else.
  pub async fn unregister(&self, address: &str) -> Result<(), DeploymentError> {
    let redeploy = {
      let mut state = self.inner.state.lock().await;
      let monitor = state.heartbeats.remove(address);
      if let Some(monitor) = &monitor {
        monitor.unlisten();
      }
      monitor.is_some() && !state.shutting_down && state.status == NetworkStatus::Running
    };
    debug!(address = %address, redeploy, "Worker unregistered");
    if redeploy {
      info!(address = %address, "Redeploying unregistered worker");
      self.redeploy_worker(address).await?;
    }
    Ok(())
  }

  /// Replaces one worker: undeploys its current handle, ignoring failure, and
  /// deploys a fresh instance from its last known spec.
  ///
  /// The network must be running. If it is undeployed, redeployed or shut
  /// down while the fresh instance is deploying, that instance is undeployed
  /// again and an error is returned.
  pub async fn redeploy_worker(&self, address: &str) -> Result<DeploymentHandle, DeploymentError> {
    let spec = self
      .inner
      .state
      .lock()
      .await
      .specs
      .get(address)
      .cloned()
      .ok_or_else(|| DeploymentError::NotDeployed(address.to_string()))?;
    self.inner.replace_worker(spec).await
  }

  async fn heartbeat_lost(&self, address: &str, beat_address: &str) {
    {
      let mut state = self.inner.state.lock().await;
      if state.shutting_down || state.status != NetworkStatus::Running {
        debug!(address = %address, "Ignoring heartbeat loss outside running network");
        return;
      }
      match state.heartbeats.get(address) {
        Some(monitor) if monitor.address() == beat_address => {
          state.heartbeats.remove(address);
        }
        _ => {
          debug!(address = %address, heartbeat = %beat_address, "Ignoring stale heartbeat loss");
          return;
        }
      }
    }
    warn!(address = %address, "Worker lost, redeploying");
    if let Err(e) = self.redeploy_worker(address).await {
      error!(address = %address, error = %e, "Failed to redeploy lost worker");
    }
  }

  async fn stop_services(&self) {
    let services = self.inner.services.lock().await.take();
    if let Some(services) = services {
      services.control.cancel();
      if let Err(e) = self.inner.transport.unregister(&self.inner.name).await {
        warn!(network = %self.inner.name, error = %e, "Failed to unregister control address");
      }
      services.auditor.stop().await;
    }
  }
}

/// Whether a running worker already matches `spec`, ignoring its heartbeat
/// registration.
fn same_spec(current: &WorkerSpec, spec: &WorkerSpec) -> bool {
  let mut current = current.clone();
  current.heartbeat_address = spec.heartbeat_address.clone();
  current == *spec
}
