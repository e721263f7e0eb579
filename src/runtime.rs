//! The per-node runtime: transport server, membership, worker pool, broker.
//!
//! A [`Runtime`] is a cheap-to-clone handle over one node's state. Nodes come
//! in three shapes: `start(config, NodeRole::Master)` and `start(config,
//! NodeRole::Worker)` bind the cluster transport; [`Runtime::local`] builds an
//! undistributed runtime whose only member is itself, where every remote call
//! short-circuits to the local dispatcher. Strategies run identically in all
//! three.

use crate::component::FieldsState;
use crate::config::Config;
use crate::deployment::{
  instance_from_spec, DeployedWorkflow, DeploymentId, InstalledDeployment, InstanceDeployment,
  InstanceScope, InstanceSpec, Route,
};
use crate::error::Error;
use crate::membership::{MasterLink, MemberEvents, Membership, SubscriptionId, SubscriptionPolicy};
use crate::registry::Registry;
use crate::remote::connection::{read_frame, write_frame, Connection};
use crate::remote::protocol::{
  decode, encode, tags, DropDeployment, Verify, VerifyAck, InstallDeployment, InstallRouting,
  RegisterMaster, RegisterOutcome, RemoveMaster, Reply, Request, SendToWorker, SpawnWorker,
  SpawnedWorker, TaskInvoke,
};
use crate::remote::{Dispatcher, Handler, LoadBalancer, NodeId, NodeRole, PeerMap, TaskRegistry};
use crate::worker::{WorkerPool, WorkerRef};
use crate::workflow::Workflow;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Names of the built-in broker tasks every node registers at start.
pub mod task_names {
  /// Returns the number of live workers on the target node.
  pub const WORKER_COUNT: &str = "meshweave.worker_count";
  /// Asks a master to run the connect handshake against the caller.
  pub const CONNECT_WORKER: &str = "meshweave.connect_worker";
}

struct Inner {
  config: Config,
  id: NodeId,
  role: NodeRole,
  distributed: bool,
  registry: Arc<Registry>,
  peers: PeerMap,
  dispatcher: Dispatcher,
  tasks: TaskRegistry,
  membership: Membership,
  master_link: MasterLink,
  pool: WorkerPool,
  balancer: LoadBalancer,
  deployments: RwLock<HashMap<DeploymentId, Arc<InstalledDeployment>>>,
  next_deployment: AtomicU64,
  server: Mutex<Option<JoinHandle<()>>>,
  shutdown: tokio::sync::Notify,
  shutting_down: AtomicBool,
}

/// Handle to one node's runtime.
#[derive(Clone)]
pub struct Runtime {
  inner: Arc<Inner>,
}

impl Runtime {
  /// Builds an undistributed runtime: no transport, the local node is the
  /// single member, deployments spawn workers in-process.
  pub fn local(config: Config) -> Runtime {
    Self::local_with_registry(config, Registry::global())
  }

  /// Builds a local runtime against a private registry (tests mostly).
  pub fn local_with_registry(config: Config, registry: Arc<Registry>) -> Runtime {
    let name = config
      .node_name
      .clone()
      .unwrap_or_else(|| "local".to_string());
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("literal address");
    Self::build(config, NodeRole::Master, NodeId::new(name, addr), false, registry)
  }

  /// Binds the cluster transport and starts serving.
  ///
  /// Masters connect their configured workers (failing the start on a failed
  /// handshake); workers announce themselves to their configured master
  /// (best-effort, the master drives the handshake back).
  pub async fn start(config: Config, role: NodeRole) -> Result<Runtime, Error> {
    let bind = config.bind.ok_or(Error::NotDistributed)?;
    let listener = TcpListener::bind(bind)
      .await
      .map_err(|e| Error::Transport(format!("bind {}: {}", bind, e)))?;
    let addr = listener
      .local_addr()
      .map_err(|e| Error::Transport(e.to_string()))?;
    let name = config
      .node_name
      .clone()
      .unwrap_or_else(|| role.to_string());
    let runtime = Self::build(config, role, NodeId::new(name, addr), true, Registry::global());

    let server = tokio::spawn(serve(runtime.clone(), listener));
    *runtime
      .inner
      .server
      .lock()
      .unwrap_or_else(|e| e.into_inner()) = Some(server);
    tracing::info!(node = %runtime.node_id(), role = %role, "node listening");

    match role {
      NodeRole::Master => {
        let workers = runtime.config().workers.clone();
        if !workers.is_empty() {
          runtime.connect(&workers).await?;
        }
      }
      NodeRole::Worker => {
        if let Some(master) = runtime.config().master.clone() {
          let announce = runtime
            .on(&master, task_names::CONNECT_WORKER, json!(runtime.node_id()))
            .await;
          if let Err(e) = announce {
            tracing::warn!(master = %master, error = %e, "master announce failed");
          }
        }
      }
    }

    Ok(runtime)
  }

  fn build(
    config: Config,
    role: NodeRole,
    id: NodeId,
    distributed: bool,
    registry: Arc<Registry>,
  ) -> Runtime {
    let request_deadline = config.request_deadline;
    let runtime = Runtime {
      inner: Arc::new(Inner {
        config,
        id,
        role,
        distributed,
        registry,
        peers: PeerMap::new(request_deadline),
        dispatcher: Dispatcher::new(),
        tasks: TaskRegistry::new(),
        membership: Membership::new(),
        master_link: MasterLink::new(),
        pool: WorkerPool::new(),
        balancer: LoadBalancer::new(),
        deployments: RwLock::new(HashMap::new()),
        next_deployment: AtomicU64::new(1),
        server: Mutex::new(None),
        shutdown: tokio::sync::Notify::new(),
        shutting_down: AtomicBool::new(false),
      }),
    };
    register_builtins(&runtime);
    runtime
  }

  pub fn node_id(&self) -> &NodeId {
    &self.inner.id
  }

  pub fn role(&self) -> NodeRole {
    self.inner.role
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  pub fn registry(&self) -> &Registry {
    &self.inner.registry
  }

  pub fn is_distributed(&self) -> bool {
    self.inner.distributed
  }

  pub(crate) fn peers(&self) -> &PeerMap {
    &self.inner.peers
  }

  pub(crate) fn dispatcher(&self) -> &Dispatcher {
    &self.inner.dispatcher
  }

  pub fn tasks(&self) -> &TaskRegistry {
    &self.inner.tasks
  }

  pub fn membership(&self) -> &Membership {
    &self.inner.membership
  }

  pub(crate) fn master_link(&self) -> &MasterLink {
    &self.inner.master_link
  }

  pub(crate) fn pool(&self) -> &WorkerPool {
    &self.inner.pool
  }

  /// Live workers on this node.
  pub fn local_worker_count(&self) -> usize {
    self.inner.pool.alive_count()
  }

  /// Connected worker nodes; the local node itself when undistributed.
  pub fn members(&self) -> Vec<NodeId> {
    if self.inner.distributed {
      self.inner.membership.members()
    } else {
      vec![self.inner.id.clone()]
    }
  }

  /// Runs the membership handshake against `nodes`. See the membership
  /// module for the per-node steps and failure aggregation.
  pub async fn connect(&self, nodes: &[NodeId]) -> Result<(), Error> {
    if !self.inner.distributed {
      // local-mode: "connecting" the local node alone is a no-op success
      if nodes.len() == 1 && nodes[0] == self.inner.id {
        return Ok(());
      }
      return Err(Error::NotDistributed);
    }
    self.inner.membership.connect(self, nodes).await
  }

  /// Removes a worker from the cluster (leave reason `Removed`).
  pub async fn disconnect(&self, node: &NodeId) -> Result<(), Error> {
    if !self.inner.distributed {
      return Err(Error::NotDistributed);
    }
    self.inner.membership.disconnect(self, node).await
  }

  pub fn subscribe_join(&self, policy: SubscriptionPolicy) -> (SubscriptionId, MemberEvents) {
    self.inner.membership.subscribe_join(policy)
  }

  pub fn subscribe_leave(&self, policy: SubscriptionPolicy) -> (SubscriptionId, MemberEvents) {
    self.inner.membership.subscribe_leave(policy)
  }

  pub fn unsubscribe_join(&self, id: SubscriptionId) {
    self.inner.membership.unsubscribe_join(id)
  }

  pub fn unsubscribe_leave(&self, id: SubscriptionId) {
    self.inner.membership.unsubscribe_leave(id)
  }

  /// Runs a registered task on `node` and returns its value.
  pub async fn on(&self, node: &NodeId, task: &str, args: Value) -> Result<Value, Error> {
    let payload = encode(&TaskInvoke {
      task: task.to_string(),
      args,
    })?;
    self.request(node, tags::TASK_INVOKE, payload).await
  }

  /// Runs a registered task on every member, in parallel, collecting one
  /// `(node, outcome)` pair per member in member order. Stragglers past the
  /// deadline contribute a timeout error; nothing here crashes the caller.
  pub async fn on_all(&self, task: &str, args: Value) -> Vec<(NodeId, Result<Value, Error>)> {
    let members = self.members();
    let calls = members.into_iter().map(|node| {
      let runtime = self.clone();
      let task = task.to_string();
      let args = args.clone();
      async move {
        let outcome = runtime.on(&node, &task, args).await;
        (node, outcome)
      }
    });
    futures::future::join_all(calls).await
  }

  /// Live worker count on `node`, via the built-in broker task.
  pub async fn workers_alive_on(&self, node: &NodeId) -> Result<usize, Error> {
    let value = self.on(node, task_names::WORKER_COUNT, Value::Null).await?;
    Ok(value.as_u64().unwrap_or(0) as usize)
  }

  /// Stable node choice for a key (consistent while membership is stable).
  pub fn select_permanent(&self, key: &str) -> Result<NodeId, Error> {
    self
      .inner
      .balancer
      .select_permanent(key, &self.members())
      .ok_or_else(|| Error::Transport("no worker nodes available".to_string()))
  }

  /// Round-robin node choice over the currently alive members.
  pub fn select_transient(&self) -> Result<NodeId, Error> {
    self
      .inner
      .balancer
      .select_transient(&self.members())
      .ok_or_else(|| Error::Transport("no worker nodes available".to_string()))
  }

  /// Deploys a workflow across the current member set.
  pub async fn deploy(&self, workflow: &Workflow) -> Result<DeployedWorkflow, Error> {
    crate::deployment::deploy(self, workflow).await
  }

  /// Sends a tagged request to `node`; requests to self short-circuit to the
  /// local dispatcher.
  pub(crate) async fn request(
    &self,
    node: &NodeId,
    tag: &str,
    payload: Value,
  ) -> Result<Value, Error> {
    if *node == self.inner.id {
      return self.inner.dispatcher.dispatch(self, tag, payload).await;
    }
    if !self.inner.distributed {
      return Err(Error::NotDistributed);
    }
    let peer = self.inner.peers.get(node).await?;
    peer
      .request(tag, payload, self.inner.config.request_deadline)
      .await
  }

  /// Asks `node` to accept this runtime as its master. `Ok(false)` means the
  /// node already has a different master.
  pub(crate) async fn register_on(&self, node: &NodeId) -> Result<bool, Error> {
    let payload = encode(&RegisterMaster {
      master: self.inner.id.clone(),
    })?;
    let value = self.request(node, tags::REGISTER_MASTER, payload).await?;
    match decode::<RegisterOutcome>(value)? {
      RegisterOutcome::Registered => Ok(true),
      RegisterOutcome::AlreadyConnected { .. } => Ok(false),
    }
  }

  /// Releases this runtime's registration on `node`.
  pub(crate) async fn release_on(&self, node: &NodeId) -> Result<(), Error> {
    let payload = encode(&RemoveMaster {
      master: self.inner.id.clone(),
    })?;
    self.request(node, tags::REMOVE_MASTER, payload).await?;
    Ok(())
  }

  /// Spawns a worker for a deployed instance on `node`.
  pub(crate) async fn spawn_worker(
    &self,
    node: &NodeId,
    scope: InstanceScope,
    tag: &str,
    state: FieldsState,
  ) -> Result<WorkerRef, Error> {
    let payload = encode(&SpawnWorker {
      deployment: scope.deployment,
      instance: scope.instance,
      tag: tag.to_string(),
      state,
    })?;
    let value = self.request(node, tags::SPAWN_WORKER, payload).await?;
    let spawned: SpawnedWorker = decode(value)?;
    Ok(spawned.worker)
  }

  /// Delivers a message to a worker's mailbox, local or remote.
  pub(crate) async fn forward(&self, worker: &WorkerRef, message: Value) -> Result<(), Error> {
    if worker.node == self.inner.id {
      return self.inner.pool.deliver(worker.id, message).await;
    }
    let payload = encode(&SendToWorker {
      worker: worker.clone(),
      message,
    })?;
    self
      .request(&worker.node, tags::SEND_TO_WORKER, payload)
      .await
      .map(|_| ())
  }

  pub(crate) fn next_deployment_id(&self) -> DeploymentId {
    DeploymentId(self.inner.next_deployment.fetch_add(1, Ordering::Relaxed))
  }

  pub(crate) fn install_deployment_local(&self, installed: InstalledDeployment) {
    self
      .inner
      .deployments
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(installed.id, Arc::new(installed));
  }

  pub(crate) fn deployment(&self, id: DeploymentId) -> Option<Arc<InstalledDeployment>> {
    self
      .inner
      .deployments
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(&id)
      .cloned()
  }

  pub(crate) async fn drop_deployment_local(&self, id: DeploymentId) {
    self.inner.pool.stop_deployment(id).await;
    self
      .inner
      .deployments
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id);
  }

  fn remote_members(&self) -> Vec<NodeId> {
    self
      .members()
      .into_iter()
      .filter(|m| *m != self.inner.id)
      .collect()
  }

  pub(crate) async fn install_deployment_remote(
    &self,
    id: DeploymentId,
    specs: &[InstanceSpec],
  ) -> Result<(), Error> {
    let payload = encode(&InstallDeployment {
      deployment: id,
      instances: specs.to_vec(),
    })?;
    for node in self.remote_members() {
      self
        .request(&node, tags::INSTALL_DEPLOYMENT, payload.clone())
        .await?;
    }
    Ok(())
  }

  pub(crate) async fn install_routing_remote(
    &self,
    id: DeploymentId,
    routes: &[Route],
    deployments: &[(String, InstanceDeployment)],
  ) -> Result<(), Error> {
    let payload = encode(&InstallRouting {
      deployment: id,
      routes: routes.to_vec(),
      deployments: deployments.to_vec(),
    })?;
    for node in self.remote_members() {
      self
        .request(&node, tags::INSTALL_ROUTING, payload.clone())
        .await?;
    }
    Ok(())
  }

  /// Drops a deployment on every node, local last. Best-effort: remote
  /// failures are logged, not raised.
  pub(crate) async fn uninstall_deployment_everywhere(&self, id: DeploymentId) {
    let payload = match encode(&DropDeployment { deployment: id }) {
      Ok(payload) => payload,
      Err(e) => {
        tracing::error!(error = %e, "drop_deployment encode failed");
        return;
      }
    };
    for node in self.remote_members() {
      if let Err(e) = self.request(&node, tags::DROP_DEPLOYMENT, payload.clone()).await {
        tracing::warn!(node = %node, deployment = %id, error = %e, "remote drop failed");
      }
    }
    self.drop_deployment_local(id).await;
  }

  /// Flags the runtime as shutting down and wakes [`wait_shutdown`] waiters.
  pub fn trigger_shutdown(&self) {
    self.inner.shutting_down.store(true, Ordering::SeqCst);
    self.inner.shutdown.notify_waiters();
  }

  pub fn is_shutting_down(&self) -> bool {
    self.inner.shutting_down.load(Ordering::SeqCst)
  }

  /// Resolves once shutdown has been triggered (e.g. master loss with
  /// `shutdown_with_master`).
  pub async fn wait_shutdown(&self) {
    let notified = self.inner.shutdown.notified();
    if self.is_shutting_down() {
      return;
    }
    notified.await;
  }

  /// Stops serving and tears down local workers.
  pub async fn shutdown(&self) {
    self.trigger_shutdown();
    if let Some(server) = self
      .inner
      .server
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take()
    {
      server.abort();
    }
    let ids: Vec<DeploymentId> = self
      .inner
      .deployments
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .keys()
      .copied()
      .collect();
    for id in ids {
      self.drop_deployment_local(id).await;
    }
    tracing::info!(node = %self.inner.id, "node stopped");
  }
}

/// Accept loop for the node's listener.
async fn serve(runtime: Runtime, listener: TcpListener) {
  loop {
    match listener.accept().await {
      Ok((stream, peer_addr)) => {
        tokio::spawn(handle_connection(runtime.clone(), stream, peer_addr));
      }
      Err(e) => {
        tracing::warn!(error = %e, "accept failed");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
      }
    }
  }
}

/// Serves one inbound connection.
///
/// Replies go through a writer task so slow handlers cannot interleave
/// partial frames. `send_to_worker` is handled inline (not spawned): that is
/// what preserves per-sender delivery order and propagates mailbox
/// backpressure to the publishing node.
async fn handle_connection(runtime: Runtime, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
  let conn = Connection::from_stream(stream, peer_addr);
  let (mut read, mut write) = conn.into_split();
  let (reply_tx, mut reply_rx) = mpsc::channel::<Reply>(64);

  let writer = tokio::spawn(async move {
    while let Some(reply) = reply_rx.recv().await {
      let bytes = match serde_json::to_vec(&reply) {
        Ok(bytes) => bytes,
        Err(e) => {
          tracing::error!(error = %e, "reply encode failed");
          continue;
        }
      };
      if write_frame(&mut write, &bytes).await.is_err() {
        break;
      }
    }
  });

  loop {
    let frame = match read_frame(&mut read).await {
      Ok(frame) => frame,
      Err(_) => break,
    };
    let request: Request = match serde_json::from_slice(&frame) {
      Ok(request) => request,
      Err(e) => {
        tracing::warn!(peer = %peer_addr, error = %e, "undecodable request frame");
        break;
      }
    };
    if runtime.is_shutting_down() {
      break;
    }

    if request.tag == tags::SEND_TO_WORKER {
      let outcome = runtime
        .dispatcher()
        .dispatch(&runtime, &request.tag, request.payload)
        .await;
      let reply = Reply {
        id: request.id,
        outcome: outcome.map_err(|e| e.wire_message()),
      };
      if reply_tx.send(reply).await.is_err() {
        break;
      }
    } else {
      let runtime = runtime.clone();
      let reply_tx = reply_tx.clone();
      tokio::spawn(async move {
        let outcome = runtime
          .dispatcher()
          .dispatch(&runtime, &request.tag, request.payload)
          .await;
        let _ = reply_tx
          .send(Reply {
            id: request.id,
            outcome: outcome.map_err(|e| e.wire_message()),
          })
          .await;
      });
    }
  }

  drop(reply_tx);
  let _ = writer.await;
}

struct VerifyHandler;

#[async_trait]
impl Handler for VerifyHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let verify: Verify = decode(payload)?;
    encode(&VerifyAck {
      name: runtime.node_id().name.clone(),
      role: runtime.role(),
      cookie_ok: verify.cookie == runtime.config().cookie,
    })
  }
}

struct RegisterMasterHandler;

#[async_trait]
impl Handler for RegisterMasterHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let register: RegisterMaster = decode(payload)?;
    let outcome = match runtime.master_link().register(runtime, register.master) {
      Ok(()) => RegisterOutcome::Registered,
      Err(current) => RegisterOutcome::AlreadyConnected { current },
    };
    encode(&outcome)
  }
}

struct RemoveMasterHandler;

#[async_trait]
impl Handler for RemoveMasterHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let remove: RemoveMaster = decode(payload)?;
    runtime.master_link().remove(&remove.master);
    Ok(Value::Null)
  }
}

struct SpawnWorkerHandler;

#[async_trait]
impl Handler for SpawnWorkerHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let spawn: SpawnWorker = decode(payload)?;
    let installed = runtime
      .deployment(spawn.deployment)
      .ok_or_else(|| Error::UnknownName(format!("deployment {}", spawn.deployment)))?;
    let instance = installed
      .instance(&spawn.instance)
      .ok_or_else(|| Error::UnknownName(format!("instance {}", spawn.instance)))?;
    let worker = runtime.pool().spawn(
      runtime.clone(),
      InstanceScope {
        deployment: spawn.deployment,
        instance: spawn.instance,
      },
      instance,
      spawn.tag,
      spawn.state,
    );
    encode(&SpawnedWorker { worker })
  }
}

struct SendToWorkerHandler;

#[async_trait]
impl Handler for SendToWorkerHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let send: SendToWorker = decode(payload)?;
    runtime.pool().deliver(send.worker.id, send.message).await?;
    Ok(Value::Null)
  }
}

struct TaskInvokeHandler;

#[async_trait]
impl Handler for TaskInvokeHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let invoke: TaskInvoke = decode(payload)?;
    runtime.tasks().invoke(runtime, &invoke.task, invoke.args).await
  }
}

struct InstallDeploymentHandler;

#[async_trait]
impl Handler for InstallDeploymentHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let install: InstallDeployment = decode(payload)?;
    let mut instances = HashMap::new();
    for spec in &install.instances {
      instances.insert(
        spec.id.clone(),
        Arc::new(instance_from_spec(runtime.registry(), spec)?),
      );
    }
    runtime.install_deployment_local(InstalledDeployment::new(install.deployment, instances));
    Ok(Value::Null)
  }
}

struct InstallRoutingHandler;

#[async_trait]
impl Handler for InstallRoutingHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let routing: InstallRouting = decode(payload)?;
    let installed = runtime
      .deployment(routing.deployment)
      .ok_or_else(|| Error::UnknownName(format!("deployment {}", routing.deployment)))?;
    installed.install_routes(&routing.routes);
    for (instance, data) in routing.deployments {
      installed.set_deployment_data(&instance, data);
    }
    Ok(Value::Null)
  }
}

struct DropDeploymentHandler;

#[async_trait]
impl Handler for DropDeploymentHandler {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error> {
    let drop: DropDeployment = decode(payload)?;
    runtime.drop_deployment_local(drop.deployment).await;
    Ok(Value::Null)
  }
}

fn register_builtins(runtime: &Runtime) {
  let dispatcher = runtime.dispatcher();
  dispatcher.register(tags::VERIFY, Arc::new(VerifyHandler));
  dispatcher.register(tags::REGISTER_MASTER, Arc::new(RegisterMasterHandler));
  dispatcher.register(tags::REMOVE_MASTER, Arc::new(RemoveMasterHandler));
  dispatcher.register(tags::SPAWN_WORKER, Arc::new(SpawnWorkerHandler));
  dispatcher.register(tags::SEND_TO_WORKER, Arc::new(SendToWorkerHandler));
  dispatcher.register(tags::TASK_INVOKE, Arc::new(TaskInvokeHandler));
  dispatcher.register(tags::INSTALL_DEPLOYMENT, Arc::new(InstallDeploymentHandler));
  dispatcher.register(tags::INSTALL_ROUTING, Arc::new(InstallRoutingHandler));
  dispatcher.register(tags::DROP_DEPLOYMENT, Arc::new(DropDeploymentHandler));

  let tasks = runtime.tasks();
  tasks.register_fn(task_names::WORKER_COUNT, |runtime, _args| {
    Box::pin(async move { Ok(json!(runtime.local_worker_count())) })
  });
  tasks.register_fn(task_names::CONNECT_WORKER, |runtime, args| {
    Box::pin(async move {
      let node: NodeId = serde_json::from_value(args)?;
      runtime.connect(&[node]).await?;
      Ok(Value::Null)
    })
  });
}
