//! Per-node worker runtime.
//!
//! Every worker is a tokio task owning `(component, strategy, deployment
//! data, tag, state)` plus a bounded mailbox. A worker processes one message
//! at a time; each message dispatches the strategy's `receive` hook, applies
//! the returned state, and routes the returned publishes. Sends into a full
//! mailbox wait, which is how backpressure reaches the publisher.
//!
//! Supervision is in-loop: a crashed `receive` (panic or hook failure)
//! restarts the worker with a fresh empty state, bounded by a
//! max-restarts-per-interval budget; an exhausted budget stops the worker
//! and logs the escalation.

use crate::component::FieldsState;
use crate::deployment::{DeploymentId, InstalledInstance, InstanceScope};
use crate::error::Error;
use crate::remote::NodeId;
use crate::runtime::Runtime;
use crate::strategy::{Context, Hook, InvocationData};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Node-local worker identifier.
pub type WorkerId = u64;

/// Cluster-wide reference to one worker: owning node plus local id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerRef {
  pub node: NodeId,
  pub id: WorkerId,
}

impl std::fmt::Display for WorkerRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/w{}", self.node, self.id)
  }
}

enum WorkerMsg {
  Deliver(Value),
  Stop,
}

struct WorkerHandle {
  tx: mpsc::Sender<WorkerMsg>,
  task: JoinHandle<()>,
  scope: InstanceScope,
}

/// Owns every worker running on this node.
pub struct WorkerPool {
  workers: RwLock<HashMap<WorkerId, WorkerHandle>>,
  next_id: AtomicU64,
}

impl WorkerPool {
  pub(crate) fn new() -> Self {
    Self {
      workers: RwLock::new(HashMap::new()),
      next_id: AtomicU64::new(1),
    }
  }

  /// Number of live workers on this node.
  pub fn alive_count(&self) -> usize {
    self.workers.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  /// Spawns a worker for `instance` and returns its ref.
  pub(crate) fn spawn(
    &self,
    runtime: Runtime,
    scope: InstanceScope,
    instance: Arc<InstalledInstance>,
    tag: String,
    state: FieldsState,
  ) -> WorkerRef {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let worker = WorkerRef {
      node: runtime.node_id().clone(),
      id,
    };
    let (tx, rx) = mpsc::channel(runtime.config().mailbox_capacity);

    tracing::debug!(worker = %worker, instance = %scope.instance, tag = %tag, "worker spawned");
    let task = tokio::spawn(worker_loop(
      runtime,
      scope.clone(),
      instance,
      tag,
      state,
      rx,
      worker.clone(),
    ));
    self
      .workers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, WorkerHandle { tx, task, scope });
    worker
  }

  /// Delivers a message to a worker's mailbox, waiting when it is full.
  pub(crate) async fn deliver(&self, id: WorkerId, message: Value) -> Result<(), Error> {
    let tx = self
      .workers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(&id)
      .map(|h| h.tx.clone())
      .ok_or_else(|| Error::Transport(format!("no worker w{} on this node", id)))?;
    tx.send(WorkerMsg::Deliver(message))
      .await
      .map_err(|_| Error::Transport(format!("worker w{} stopped", id)))
  }

  /// Stops one worker, waiting for its `drop_invocation` to finish.
  pub(crate) async fn stop(&self, id: WorkerId) {
    let handle = self
      .workers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id);
    if let Some(handle) = handle {
      let _ = handle.tx.send(WorkerMsg::Stop).await;
      let _ = handle.task.await;
    }
  }

  /// Stops every worker belonging to `deployment`.
  pub(crate) async fn stop_deployment(&self, deployment: DeploymentId) {
    let ids: Vec<WorkerId> = self
      .workers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .filter(|(_, h)| h.scope.deployment == deployment)
      .map(|(id, _)| *id)
      .collect();
    for id in ids {
      self.stop(id).await;
    }
  }

  /// Removes a worker that finished on its own (crash escalation).
  fn finish(&self, id: WorkerId) {
    self
      .workers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id);
  }
}

async fn worker_loop(
  runtime: Runtime,
  scope: InstanceScope,
  instance: Arc<InstalledInstance>,
  tag: String,
  mut state: FieldsState,
  mut rx: mpsc::Receiver<WorkerMsg>,
  worker: WorkerRef,
) {
  let max_restarts = runtime.config().max_restarts;
  let restart_interval = runtime.config().restart_interval;
  let mut restarts: VecDeque<Instant> = VecDeque::new();

  while let Some(message) = rx.recv().await {
    let message = match message {
      WorkerMsg::Stop => break,
      WorkerMsg::Deliver(message) => message,
    };

    let mut ctx = Context::new(
      instance.component.clone(),
      instance.strategy.clone(),
      runtime.clone(),
    )
    .with_scope(scope.clone())
    .with_invocation(InvocationData {
      worker: worker.clone(),
      tag: tag.clone(),
    });
    if let Some(data) = instance.deployment_data() {
      ctx = ctx.with_deployment(data);
    }

    let dispatch = instance
      .strategy
      .dispatch(Hook::Receive, ctx, state.clone(), vec![message]);
    let crash_reason = match AssertUnwindSafe(dispatch).catch_unwind().await {
      Ok(Ok(result)) => {
        if let Some(new_state) = result.state {
          state = new_state;
        }
        match result.value {
          Ok(_) => {
            if let Some(published) = result.published {
              if let Err(e) =
                crate::router::route(&runtime, scope.deployment, &scope.instance, published).await
              {
                tracing::warn!(worker = %worker, error = %e, "publish routing failed");
              }
            }
            None
          }
          Err(failure) => Some(failure.to_string()),
        }
      }
      Ok(Err(e)) => Some(e.to_string()),
      Err(_) => Some("receive hook panicked".to_string()),
    };

    if let Some(reason) = crash_reason {
      let now = Instant::now();
      while restarts
        .front()
        .is_some_and(|t| now.duration_since(*t) > restart_interval)
      {
        restarts.pop_front();
      }
      restarts.push_back(now);

      if restarts.len() as u32 > max_restarts {
        tracing::error!(
          worker = %worker,
          instance = %scope.instance,
          reason = %reason,
          "restart budget exhausted; stopping worker"
        );
        runtime.pool().finish(worker.id);
        return;
      }

      tracing::warn!(
        worker = %worker,
        instance = %scope.instance,
        reason = %reason,
        "worker crashed; restarting with empty state"
      );
      state = instance.component.empty_state();
    }
  }

  // draining: give the strategy its per-invocation cleanup
  let mut ctx = Context::new(
    instance.component.clone(),
    instance.strategy.clone(),
    runtime.clone(),
  )
  .with_scope(scope.clone())
  .with_invocation(InvocationData {
    worker: worker.clone(),
    tag: tag.clone(),
  });
  if let Some(data) = instance.deployment_data() {
    ctx = ctx.with_deployment(data);
  }
  let drained = instance
    .strategy
    .dispatch(Hook::DropInvocation, ctx, state, vec![])
    .await;
  if let Err(e) = drained {
    tracing::debug!(worker = %worker, error = %e, "drop_invocation dispatch failed");
  }
  tracing::debug!(worker = %worker, "worker stopped");
  runtime.pool().finish(worker.id);
}
