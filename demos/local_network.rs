//! Word count on the in-process transport and cluster.
//!
//! A feeder emits words on a fixed cadence, grouped by word onto two counter
//! workers. Every feed waits for the full message tree before the next one.
//!
//! Run with `RUST_LOG=debug cargo run --example local_network` for per-message
//! output.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use weavenet::cluster::{LocalCluster, worker_fn};
use weavenet::component::{ComponentWorker, Feeder, MessageHandler, WorkerContext};
use weavenet::coordination::InMemoryCoordination;
use weavenet::dispatch::Grouping;
use weavenet::error::ProcessError;
use weavenet::manager::ClusterManager;
use weavenet::message::JsonMessage;
use weavenet::topology::{ComponentConfig, ConnectionConfig, NetworkConfig};
use weavenet::transport::{LocalTransport, Transport};

const WORDS: [&str; 6] = ["apple", "banana", "cherry", "apple", "banana", "apple"];

#[derive(Default)]
struct Counter {
  counts: Mutex<HashMap<String, u64>>,
}

#[async_trait]
impl MessageHandler for Counter {
  async fn handle(&self, worker: &ComponentWorker, message: &JsonMessage) -> Result<(), ProcessError> {
    let word = message.body["word"]
      .as_str()
      .ok_or_else(|| ProcessError::Rejected("missing word".to_string()))?;
    let count = {
      let mut counts = self.counts.lock().map_err(|_| ProcessError::Rejected("poisoned".to_string()))?;
      let count = counts.entry(word.to_string()).or_default();
      *count += 1;
      *count
    };
    info!(worker = %worker.context().address(), word, count, "Counted");
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();

  let transport: Arc<dyn Transport> = Arc::new(LocalTransport::new());
  let cluster = Arc::new(LocalCluster::new(transport.clone()));

  cluster
    .register_factory(
      "word-feeder",
      worker_fn(|spec, transport, shutdown| async move {
        let context = WorkerContext::new(spec, transport);
        let feeder = match Feeder::start(context.clone()).await {
          Ok(feeder) => feeder,
          Err(e) => {
            warn!(error = %e, "Feeder failed to start");
            return;
          }
        };
        let emitter = context.register().await.ok();
        // Let the counters come up before the first feed.
        tokio::time::sleep(Duration::from_millis(200)).await;

        for word in WORDS.iter().cycle() {
          tokio::select! {
            _ = shutdown.cancelled() => break,
            result = feeder.feed(json!({ "word": word })) => match result {
              Ok(id) => info!(%id, word, "Fully processed"),
              Err(e) => warn!(error = %e, word, "Feed did not complete"),
            },
          }
          tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
          }
        }

        if let Some(emitter) = emitter {
          emitter.stop().await;
          let _ = context.unregister().await;
        }
        feeder.stop().await;
      }),
    )
    .await;

  cluster
    .register_factory(
      "word-counter",
      worker_fn(|spec, transport, shutdown| async move {
        let worker = ComponentWorker::new(WorkerContext::new(spec, transport));
        if let Err(e) = worker.run(Counter::default(), shutdown).await {
          warn!(error = %e, "Counter stopped");
        }
      }),
    )
    .await;

  let manager = ClusterManager::new(cluster, transport, Arc::new(InMemoryCoordination::new()));
  let network = NetworkConfig::new("wordcount")
    .with_component("feeder", ComponentConfig::new("word-feeder"))
    .with_component("counter", ComponentConfig::new("word-counter").with_instances(2))
    .with_connection(
      ConnectionConfig::new(("feeder", "out"), ("counter", "in")).with_grouping(Grouping::fields(["word"])),
    );

  let coordinator = manager.deploy_network(network).await?;
  info!(network = %coordinator.name(), status = %coordinator.status().await, "Network deployed");

  tokio::time::sleep(Duration::from_secs(3)).await;

  manager.undeploy_network("wordcount").await?;
  info!("Network undeployed");
  Ok(())
}
