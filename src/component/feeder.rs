//! Root-message source.

use super::{OutputCollector, WorkerContext};
use crate::auditor::{AuditNotice, Completion};
use crate::error::{AuditError, ConnectionError};
use crate::message::MessageId;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Pause between polls that produced nothing.
pub const DEFAULT_FEED_DELAY: Duration = Duration::from_millis(100);

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Result<MessageId, AuditError>>>>>;

/// Emits root messages and reports how their trees resolved.
///
/// The feeder's own address is the owner of every root it creates; the
/// auditor publishes resolution notices there.
pub struct Feeder {
  context: WorkerContext,
  outputs: OutputCollector,
  waiters: Waiters,
  shutdown: CancellationToken,
  listener: JoinHandle<()>,
  feed_delay: Duration,
}

impl Feeder {
  /// Starts listening for resolution notices on the worker's address.
  pub async fn start(context: WorkerContext) -> Result<Self, ConnectionError> {
    let mut subscription = context.transport().register(context.address()).await?;
    let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let pending = waiters.clone();
    let address = context.address().to_string();

    let listener = tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          delivery = subscription.recv() => {
            let Some(delivery) = delivery else { break };
            match serde_json::from_value::<AuditNotice>(delivery.body().clone()) {
              Ok(notice) => resolve(&pending, notice),
              Err(e) => warn!(address = %address, error = %e, "Ignoring unexpected message"),
            }
          }
        }
      }
    });

    Ok(Self {
      outputs: context.outputs(),
      context,
      waiters,
      shutdown,
      listener,
      feed_delay: DEFAULT_FEED_DELAY,
    })
  }

  /// Sets how long [`poll`](Self::poll) waits after an empty turn.
  #[must_use]
  pub fn with_feed_delay(mut self, delay: Duration) -> Self {
    self.feed_delay = delay;
    self
  }

  /// Pause after an empty poll.
  pub fn feed_delay(&self) -> Duration {
    self.feed_delay
  }

  /// The worker context.
  pub fn context(&self) -> &WorkerContext {
    &self.context
  }

  /// Emits `body` as a new root message on every output channel.
  ///
  /// Returns the root id and a future for the tree's resolution. A failed
  /// dispatch fails the tree, which the returned future reports.
  pub async fn emit(&self, body: Value) -> Result<(MessageId, Completion), AuditError> {
    let auditor = self.context.auditor();
    let root = auditor.create(self.context.address()).await?;
    let (tx, rx) = oneshot::channel();
    if let Ok(mut waiters) = self.waiters.lock() {
      waiters.insert(root.id().to_string(), tx);
    }

    let settled = match self.outputs.emit(&root, body).await {
      Ok(channels) => {
        trace!(root = %root, channels, "Fed root message");
        auditor.ack(&root).await
      }
      Err(e) => {
        warn!(root = %root, error = %e, "Failed to feed root message");
        auditor.fail(&root).await
      }
    };
    if let Err(e) = settled {
      // No notice will ever arrive for this root.
      if let Ok(mut waiters) = self.waiters.lock() {
        waiters.remove(root.id());
      }
      return Err(e);
    }
    Ok((root, Completion::new(rx)))
  }

  /// Feeds from `next` until `shutdown` is cancelled and returns how many
  /// roots were emitted.
  ///
  /// Every turn asks `next` for a body. A body is emitted at once and its
  /// resolution is logged when it arrives; `None`, or a failed emit, waits
  /// one feed delay before the next turn.
  pub async fn poll<F, Fut>(&self, shutdown: &CancellationToken, mut next: F) -> usize
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<Value>>,
  {
    let mut emitted = 0;
    loop {
      let body = tokio::select! {
        _ = shutdown.cancelled() => break,
        body = next() => body,
      };
      let Some(body) = body else {
        if !self.pause(shutdown).await {
          break;
        }
        continue;
      };
      match self.emit(body).await {
        Ok((root, completion)) => {
          emitted += 1;
          tokio::spawn(async move {
            match completion.await {
              Ok(_) => debug!(root = %root, "Feed processed"),
              Err(e) => warn!(root = %root, error = %e, "Feed did not complete"),
            }
          });
        }
        Err(e) => {
          warn!(address = %self.context.address(), error = %e, "Failed to emit feed");
          if !self.pause(shutdown).await {
            break;
          }
        }
      }
    }
    debug!(address = %self.context.address(), emitted, "Polling stopped");
    emitted
  }

  /// Sleeps one feed delay. Returns false if `shutdown` fired first.
  async fn pause(&self, shutdown: &CancellationToken) -> bool {
    tokio::select! {
      _ = shutdown.cancelled() => false,
      _ = tokio::time::sleep(self.feed_delay) => true,
    }
  }

  /// Emits `body` and waits until its tree resolves.
  pub async fn feed(&self, body: Value) -> Result<MessageId, AuditError> {
    let (_, completion) = self.emit(body).await?;
    completion.await
  }

  /// Number of roots still waiting for a resolution notice.
  pub fn pending(&self) -> usize {
    self.waiters.lock().map(|w| w.len()).unwrap_or(0)
  }

  /// Stops listening. Outstanding completions resolve as closed.
  pub async fn stop(self) {
    self.shutdown.cancel();
    let _ = self.listener.await;
    if let Err(e) = self.context.transport().unregister(self.context.address()).await {
      debug!(address = %self.context.address(), error = %e, "Failed to unregister feeder");
    }
    if let Ok(mut waiters) = self.waiters.lock() {
      waiters.clear();
    }
  }
}

fn resolve(waiters: &Waiters, notice: AuditNotice) {
  let waiter = waiters
    .lock()
    .ok()
    .and_then(|mut w| w.remove(notice.id.id()));
  match waiter {
    Some(tx) => {
      let _ = tx.send(notice.into_result());
    }
    None => debug!(root = %notice.id, "Notice for unknown root"),
  }
}
