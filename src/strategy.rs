//! Strategies: composable bundles of hooks governing component materialization.
//!
//! A strategy carries up to seven hooks. Partial strategies are merged into
//! complete ones with child-wins precedence; completeness is checked at
//! deploy time. Hooks are ordinary [`Callback`]s dispatched through the
//! invocation engine with a [`Context`] argument that exposes the runtime
//! services a hook may need (worker spawning, member selection, forwarding).

use crate::component::{Callback, CallbackArgs, CallbackResult, Component, FieldsState};
use crate::deployment::{CancelFlag, InstanceDeployment, InstanceScope};
use crate::error::Error;
use crate::remote::NodeId;
use crate::runtime::Runtime;
use crate::worker::WorkerRef;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// The seven strategy hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hook {
  Define,
  Deploy,
  Prepare,
  Send,
  Receive,
  DropDeployment,
  DropInvocation,
}

impl Hook {
  /// All hooks, in dispatch-lifecycle order.
  pub const ALL: [Hook; 7] = [
    Hook::Define,
    Hook::Deploy,
    Hook::Prepare,
    Hook::Send,
    Hook::Receive,
    Hook::DropDeployment,
    Hook::DropInvocation,
  ];
}

impl std::fmt::Display for Hook {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Hook::Define => "define",
      Hook::Deploy => "deploy",
      Hook::Prepare => "prepare",
      Hook::Send => "send",
      Hook::Receive => "receive",
      Hook::DropDeployment => "drop_deployment",
      Hook::DropInvocation => "drop_invocation",
    };
    write!(f, "{}", name)
  }
}

/// A bundle of optional hooks plus an optional name.
///
/// Strategies are immutable; composition goes through [`Strategy::merge`].
#[derive(Clone, Default)]
pub struct Strategy {
  name: Option<String>,
  merged: bool,
  define: Option<Callback>,
  deploy: Option<Callback>,
  prepare: Option<Callback>,
  send: Option<Callback>,
  receive: Option<Callback>,
  drop_deployment: Option<Callback>,
  drop_invocation: Option<Callback>,
}

impl Strategy {
  pub fn builder() -> StrategyBuilder {
    StrategyBuilder::default()
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  /// Name for log lines and errors; anonymous strategies get a placeholder.
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or("<anonymous>")
  }

  pub fn hook(&self, hook: Hook) -> Option<&Callback> {
    match hook {
      Hook::Define => self.define.as_ref(),
      Hook::Deploy => self.deploy.as_ref(),
      Hook::Prepare => self.prepare.as_ref(),
      Hook::Send => self.send.as_ref(),
      Hook::Receive => self.receive.as_ref(),
      Hook::DropDeployment => self.drop_deployment.as_ref(),
      Hook::DropInvocation => self.drop_invocation.as_ref(),
    }
  }

  /// True iff every hook is present.
  pub fn is_complete(&self) -> bool {
    Hook::ALL.iter().all(|h| self.hook(*h).is_some())
  }

  /// Hooks still missing, in lifecycle order.
  pub fn missing_hooks(&self) -> Vec<Hook> {
    Hook::ALL
      .iter()
      .copied()
      .filter(|h| self.hook(*h).is_none())
      .collect()
  }

  /// Merges `child` over `parent`: for every hook the child's value wins when
  /// present. The result carries the parent's name, unless the child is
  /// itself a merge product (internal merges strip the name).
  pub fn merge(child: &Strategy, parent: &Strategy) -> Strategy {
    let name = if child.merged {
      None
    } else {
      parent.name.clone()
    };
    Strategy {
      name,
      merged: true,
      define: child.define.clone().or_else(|| parent.define.clone()),
      deploy: child.deploy.clone().or_else(|| parent.deploy.clone()),
      prepare: child.prepare.clone().or_else(|| parent.prepare.clone()),
      send: child.send.clone().or_else(|| parent.send.clone()),
      receive: child.receive.clone().or_else(|| parent.receive.clone()),
      drop_deployment: child
        .drop_deployment
        .clone()
        .or_else(|| parent.drop_deployment.clone()),
      drop_invocation: child
        .drop_invocation
        .clone()
        .or_else(|| parent.drop_invocation.clone()),
    }
  }

  /// Left fold of [`merge`](Self::merge) over `parents`: for each hook the
  /// result is the first present value scanning child, parents[0], ...
  pub fn merge_with(child: &Strategy, parents: &[Arc<Strategy>]) -> Strategy {
    parents
      .iter()
      .fold(child.clone(), |acc, parent| Strategy::merge(&acc, parent))
  }

  /// Dispatches `hook` through the invocation engine.
  ///
  /// A missing hook is `Error::StrategyIncomplete`; the deployment engine
  /// checks completeness up front, so at runtime this only trips for
  /// strategies that bypassed deployment.
  pub async fn dispatch(
    &self,
    hook: Hook,
    ctx: Context,
    state: FieldsState,
    args: Vec<Value>,
  ) -> Result<CallbackResult, Error> {
    let cb = self.hook(hook).ok_or_else(|| Error::StrategyIncomplete {
      strategy: self.display_name().to_string(),
      hook,
    })?;
    Ok(cb.invoke(state, CallbackArgs::new(args).with_context(ctx)).await)
  }
}

impl std::fmt::Debug for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let present: Vec<String> = Hook::ALL
      .iter()
      .filter(|h| self.hook(**h).is_some())
      .map(|h| h.to_string())
      .collect();
    f.debug_struct("Strategy")
      .field("name", &self.name)
      .field("hooks", &present)
      .finish()
  }
}

/// Builder for [`Strategy`].
#[derive(Default)]
pub struct StrategyBuilder {
  inner: Strategy,
}

impl StrategyBuilder {
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.inner.name = Some(name.into());
    self
  }

  pub fn define(mut self, cb: Callback) -> Self {
    self.inner.define = Some(cb);
    self
  }

  pub fn deploy(mut self, cb: Callback) -> Self {
    self.inner.deploy = Some(cb);
    self
  }

  pub fn prepare(mut self, cb: Callback) -> Self {
    self.inner.prepare = Some(cb);
    self
  }

  pub fn send(mut self, cb: Callback) -> Self {
    self.inner.send = Some(cb);
    self
  }

  pub fn receive(mut self, cb: Callback) -> Self {
    self.inner.receive = Some(cb);
    self
  }

  pub fn drop_deployment(mut self, cb: Callback) -> Self {
    self.inner.drop_deployment = Some(cb);
    self
  }

  pub fn drop_invocation(mut self, cb: Callback) -> Self {
    self.inner.drop_invocation = Some(cb);
    self
  }

  pub fn build(self) -> Strategy {
    self.inner
  }
}

/// Invocation-scoped data available to `receive` and `drop_invocation`.
#[derive(Clone, Debug)]
pub struct InvocationData {
  /// The worker the message was delivered to.
  pub worker: WorkerRef,
  /// The strategy-chosen role label of that worker.
  pub tag: String,
}

/// Dispatch context handed to every hook invocation.
///
/// Carries the component/strategy pair, deployment and invocation data when
/// available, and the runtime services hooks are allowed to use.
#[derive(Clone)]
pub struct Context {
  component: Arc<Component>,
  strategy: Arc<Strategy>,
  deployment: Option<InstanceDeployment>,
  invocation: Option<InvocationData>,
  scope: Option<InstanceScope>,
  runtime: Runtime,
  cancel: CancelFlag,
  spawned: Option<Arc<Mutex<Vec<WorkerRef>>>>,
}

impl Context {
  pub(crate) fn new(
    component: Arc<Component>,
    strategy: Arc<Strategy>,
    runtime: Runtime,
  ) -> Self {
    Self {
      component,
      strategy,
      deployment: None,
      invocation: None,
      scope: None,
      runtime,
      cancel: CancelFlag::default(),
      spawned: None,
    }
  }

  pub(crate) fn with_scope(mut self, scope: InstanceScope) -> Self {
    self.scope = Some(scope);
    self
  }

  pub(crate) fn with_deployment(mut self, deployment: InstanceDeployment) -> Self {
    self.deployment = Some(deployment);
    self
  }

  pub(crate) fn with_invocation(mut self, invocation: InvocationData) -> Self {
    self.invocation = Some(invocation);
    self
  }

  pub(crate) fn with_cancel(mut self, cancel: CancelFlag) -> Self {
    self.cancel = cancel;
    self
  }

  pub(crate) fn with_spawn_tracker(mut self, tracker: Arc<Mutex<Vec<WorkerRef>>>) -> Self {
    self.spawned = Some(tracker);
    self
  }

  pub fn component(&self) -> &Arc<Component> {
    &self.component
  }

  pub fn strategy(&self) -> &Arc<Strategy> {
    &self.strategy
  }

  /// Deployment data; present from `prepare` onwards.
  pub fn deployment(&self) -> Option<&InstanceDeployment> {
    self.deployment.as_ref()
  }

  /// Invocation data; present inside `receive` and `drop_invocation`.
  pub fn invocation(&self) -> Option<&InvocationData> {
    self.invocation.as_ref()
  }

  /// True once the surrounding deployment has been cancelled. `deploy` hooks
  /// observe this between their own steps.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Currently connected worker nodes (the local node when undistributed).
  pub fn members(&self) -> Vec<NodeId> {
    self.runtime.members()
  }

  /// Stable node choice for workers that hold persistent state.
  pub fn select_permanent(&self, key: &str) -> Result<NodeId, Error> {
    self.runtime.select_permanent(key)
  }

  /// Round-robin node choice over currently alive workers.
  pub fn select_transient(&self) -> Result<NodeId, Error> {
    self.runtime.select_transient()
  }

  /// Spawns a worker for this component instance on `node`.
  ///
  /// Only meaningful inside `deploy`; the ref is recorded in the instance's
  /// deployment data.
  pub async fn spawn_worker(
    &self,
    node: &NodeId,
    tag: &str,
    state: FieldsState,
  ) -> Result<WorkerRef, Error> {
    let scope = self
      .scope
      .clone()
      .ok_or_else(|| Error::Transport("spawn_worker outside a deployment".to_string()))?;
    let worker = self.runtime.spawn_worker(node, scope, tag, state).await?;
    if let Some(tracker) = &self.spawned {
      tracker.lock().unwrap_or_else(|e| e.into_inner()).push(worker.clone());
    }
    Ok(worker)
  }

  /// Forwards a message to a concrete worker's mailbox.
  pub async fn forward(&self, worker: &WorkerRef, message: Value) -> Result<(), Error> {
    self.runtime.forward(worker, message).await
  }
}
