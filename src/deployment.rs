//! Workflow deployment: flatten, resolve, deploy, route, prepare.
//!
//! The engine walks a flattened workflow, resolves each component's strategy
//! (node override merged over the component's own, complete or rejected
//! before anything is spawned), installs the instance table on every member
//! node, drives the `deploy` hooks in topological order, builds the routing
//! table, and gives each strategy a `prepare` pass over its own routes.
//! Failures tear down what was already spawned and report per-component
//! outcomes.

use crate::component::{Component, Port};
use crate::error::{DefinitionError, Error};
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::strategy::{Context, Hook, Strategy};
use crate::worker::WorkerRef;
use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Identifier of one deployed workflow, unique per master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId(pub u64);

impl std::fmt::Display for DeploymentId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "d{}", self.0)
  }
}

/// Where a hook invocation lives: which deployment, which instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceScope {
  pub deployment: DeploymentId,
  pub instance: String,
}

/// Cooperative cancellation flag observed by `deploy` hooks between steps.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Per-instance deployment data: the workers the strategy spawned plus
/// whatever opaque value its `deploy` hook returned.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceDeployment {
  pub workers: Vec<WorkerRef>,
  pub data: Value,
}

/// Wire form of one instance: definitions referenced by registry name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceSpec {
  pub id: String,
  pub component: String,
  pub strategy_override: Option<String>,
  pub args: Value,
}

/// One routing table entry: a source out-port and its destinations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
  /// `(instance id, out-port index)`.
  pub source: (String, usize),
  /// Ordered `(instance id, in-port index)` destinations.
  pub dests: Vec<(String, usize)>,
}

/// A deployed instance as installed on a node.
pub(crate) struct InstalledInstance {
  pub component: Arc<Component>,
  pub strategy: Arc<Strategy>,
  pub args: Value,
  pub deployment: RwLock<Option<InstanceDeployment>>,
}

impl InstalledInstance {
  pub fn deployment_data(&self) -> Option<InstanceDeployment> {
    self
      .deployment
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}

/// Per-node view of one deployment: instance table plus routing index.
pub(crate) struct InstalledDeployment {
  pub id: DeploymentId,
  pub instances: HashMap<String, Arc<InstalledInstance>>,
  pub routing: RwLock<HashMap<(String, usize), Vec<(String, usize)>>>,
}

impl InstalledDeployment {
  pub fn new(id: DeploymentId, instances: HashMap<String, Arc<InstalledInstance>>) -> Self {
    Self {
      id,
      instances,
      routing: RwLock::new(HashMap::new()),
    }
  }

  pub fn instance(&self, id: &str) -> Option<Arc<InstalledInstance>> {
    self.instances.get(id).cloned()
  }

  pub fn install_routes(&self, routes: &[Route]) {
    let mut table = self.routing.write().unwrap_or_else(|e| e.into_inner());
    table.clear();
    for route in routes {
      table
        .entry(route.source.clone())
        .or_default()
        .extend(route.dests.iter().cloned());
    }
  }

  pub fn destinations(&self, source: &str, out_port: usize) -> Vec<(String, usize)> {
    self
      .routing
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(&(source.to_string(), out_port))
      .cloned()
      .unwrap_or_default()
  }

  pub fn set_deployment_data(&self, instance: &str, data: InstanceDeployment) {
    if let Some(installed) = self.instances.get(instance) {
      *installed.deployment.write().unwrap_or_else(|e| e.into_inner()) = Some(data);
    }
  }
}

/// Resolves a node's effective strategy: override merged over the
/// component's own. Deterministic, so master and workers agree on it.
pub(crate) fn resolve_strategy(
  component: &Arc<Component>,
  strategy_override: Option<&Arc<Strategy>>,
) -> Arc<Strategy> {
  match strategy_override {
    Some(over) => Arc::new(Strategy::merge(over, component.strategy())),
    None => component.strategy().clone(),
  }
}

/// Rebuilds an [`InstalledInstance`] from its wire spec via the registry.
pub(crate) fn instance_from_spec(
  registry: &Registry,
  spec: &InstanceSpec,
) -> Result<InstalledInstance, Error> {
  let component = registry.get_component(&spec.component)?;
  let strategy_override = match &spec.strategy_override {
    Some(name) => Some(registry.get_strategy(name)?),
    None => None,
  };
  let strategy = resolve_strategy(&component, strategy_override.as_ref());
  Ok(InstalledInstance {
    component,
    strategy,
    args: spec.args.clone(),
    deployment: RwLock::new(None),
  })
}

struct ResolvedNode {
  id: String,
  component: Arc<Component>,
  strategy: Arc<Strategy>,
  args: Value,
  override_name: Option<String>,
}

/// A live deployment handle held by the master.
pub struct DeployedWorkflow {
  runtime: Runtime,
  id: DeploymentId,
  instances: Vec<String>,
  workers: Vec<WorkerRef>,
  inputs: HashMap<Port, Vec<(String, usize)>>,
  cancel: CancelFlag,
}

impl std::fmt::Debug for DeployedWorkflow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeployedWorkflow")
      .field("id", &self.id)
      .field("instances", &self.instances)
      .field("workers", &self.workers)
      .finish()
  }
}

impl DeployedWorkflow {
  pub fn id(&self) -> DeploymentId {
    self.id
  }

  /// Instance ids, in deployment order.
  pub fn instances(&self) -> &[String] {
    &self.instances
  }

  /// Every worker spawned by the deployment's strategies.
  pub fn workers(&self) -> &[WorkerRef] {
    &self.workers
  }

  /// Drives a token into the workflow through one of its boundary in-ports.
  ///
  /// The value goes through the destination strategies' `send` hooks exactly
  /// as an internally published value would.
  pub async fn send(&self, port: impl Into<Port>, value: Value) -> Result<(), Error> {
    let port = port.into();
    let dests = self
      .inputs
      .get(&port)
      .ok_or_else(|| Error::UnknownName(format!("workflow in-port {}", port)))?
      .clone();
    for (instance, in_port) in dests {
      crate::router::dispatch_send(&self.runtime, self.id, &instance, in_port, value.clone())
        .await?;
    }
    Ok(())
  }

  /// Tears the deployment down: `drop_deployment` per component
  /// (best-effort, failures logged), then workers stopped and the deployment
  /// uninstalled on every node.
  pub async fn destroy(self) -> Result<(), Error> {
    self.cancel.cancel();
    let Some(installed) = self.runtime.deployment(self.id) else {
      return Ok(());
    };

    for instance_id in &self.instances {
      let Some(instance) = installed.instance(instance_id) else {
        continue;
      };
      let mut ctx = Context::new(
        instance.component.clone(),
        instance.strategy.clone(),
        self.runtime.clone(),
      )
      .with_scope(InstanceScope {
        deployment: self.id,
        instance: instance_id.clone(),
      })
      .with_cancel(self.cancel.clone());
      if let Some(data) = instance.deployment_data() {
        ctx = ctx.with_deployment(data);
      }
      let result = instance
        .strategy
        .dispatch(Hook::DropDeployment, ctx, instance.component.empty_state(), vec![])
        .await;
      match result {
        Ok(outcome) if outcome.is_failure() => {
          tracing::warn!(instance = %instance_id, "drop_deployment hook failed");
        }
        Err(e) => tracing::warn!(instance = %instance_id, error = %e, "drop_deployment dispatch failed"),
        Ok(_) => {}
      }
    }

    self.runtime.uninstall_deployment_everywhere(self.id).await;
    tracing::info!(deployment = %self.id, "deployment destroyed");
    Ok(())
  }
}

/// Deploys a workflow across the current member set. See the module docs for
/// the pipeline; this is the only place workers come into existence.
pub(crate) async fn deploy(runtime: &Runtime, workflow: &Workflow) -> Result<DeployedWorkflow, Error> {
  let flat = workflow.flatten()?;
  let members = runtime.members();
  let has_remote = members.iter().any(|m| m != runtime.node_id());

  // resolve strategies up front: nothing is spawned for an incomplete one
  let mut resolved = Vec::with_capacity(flat.nodes.len());
  for node in &flat.nodes {
    let strategy = resolve_strategy(&node.component, node.strategy_override.as_ref());
    if !strategy.is_complete() {
      return Err(Error::StrategyIncomplete {
        strategy: strategy.display_name().to_string(),
        hook: strategy.missing_hooks()[0],
      });
    }
    let override_name = match &node.strategy_override {
      Some(over) => {
        let name = over.name().map(str::to_owned);
        if has_remote && name.is_none() {
          return Err(
            DefinitionError::Unregistered {
              node: node.id.clone(),
              kind: "strategy".to_string(),
            }
            .into(),
          );
        }
        name
      }
      None => None,
    };
    if has_remote && node.component.name().is_none() {
      return Err(
        DefinitionError::Unregistered {
          node: node.id.clone(),
          kind: "component".to_string(),
        }
        .into(),
      );
    }
    resolved.push(ResolvedNode {
      id: node.id.clone(),
      component: node.component.clone(),
      strategy,
      args: node.args.clone(),
      override_name,
    });
  }

  // define hooks: the strategy's chance to validate or reject its component
  for node in &resolved {
    let ctx = Context::new(node.component.clone(), node.strategy.clone(), runtime.clone());
    let result = node
      .strategy
      .dispatch(Hook::Define, ctx, node.component.empty_state(), vec![node.args.clone()])
      .await?;
    if let Err(failure) = result.value {
      return Err(failure.into());
    }
  }

  let id = runtime.next_deployment_id();
  let cancel = CancelFlag::default();

  // install the instance table on every node before anything spawns
  let local_instances: HashMap<String, Arc<InstalledInstance>> = resolved
    .iter()
    .map(|node| {
      (
        node.id.clone(),
        Arc::new(InstalledInstance {
          component: node.component.clone(),
          strategy: node.strategy.clone(),
          args: node.args.clone(),
          deployment: RwLock::new(None),
        }),
      )
    })
    .collect();
  runtime.install_deployment_local(InstalledDeployment::new(id, local_instances));

  if has_remote {
    let specs: Vec<InstanceSpec> = resolved
      .iter()
      .map(|node| InstanceSpec {
        id: node.id.clone(),
        component: node.component.name().unwrap_or_default().to_string(),
        strategy_override: node.override_name.clone(),
        args: node.args.clone(),
      })
      .collect();
    if let Err(e) = runtime.install_deployment_remote(id, &specs).await {
      runtime.uninstall_deployment_everywhere(id).await;
      return Err(e);
    }
  }

  let by_id: HashMap<&str, &ResolvedNode> =
    resolved.iter().map(|node| (node.id.as_str(), node)).collect();
  let installed = runtime
    .deployment(id)
    .expect("deployment installed on this node");

  // deploy hooks, topological order (advisory)
  let mut succeeded: Vec<String> = Vec::new();
  let mut all_workers: Vec<WorkerRef> = Vec::new();
  for instance_id in flat.topo_order() {
    let node = by_id[instance_id.as_str()];
    if cancel.is_cancelled() {
      teardown(runtime, id, &succeeded).await;
      return Err(Error::DeploymentPartial {
        succeeded,
        failed: vec![(instance_id, "deployment cancelled".to_string())],
      });
    }

    let tracker = Arc::new(Mutex::new(Vec::new()));
    let ctx = Context::new(node.component.clone(), node.strategy.clone(), runtime.clone())
      .with_scope(InstanceScope {
        deployment: id,
        instance: instance_id.clone(),
      })
      .with_cancel(cancel.clone())
      .with_spawn_tracker(tracker.clone());

    let outcome = node
      .strategy
      .dispatch(
        Hook::Deploy,
        ctx,
        node.component.empty_state(),
        vec![node.args.clone()],
      )
      .await;

    let spawned: Vec<WorkerRef> = tracker.lock().unwrap_or_else(|e| e.into_inner()).clone();
    match outcome {
      Ok(result) => match result.value {
        Ok(data) => {
          all_workers.extend(spawned.iter().cloned());
          installed.set_deployment_data(
            &instance_id,
            InstanceDeployment {
              workers: spawned,
              data,
            },
          );
          succeeded.push(instance_id);
        }
        Err(failure) => {
          teardown(runtime, id, &succeeded).await;
          return Err(Error::DeploymentPartial {
            succeeded,
            failed: vec![(instance_id, failure.to_string())],
          });
        }
      },
      Err(e) => {
        teardown(runtime, id, &succeeded).await;
        return Err(Error::DeploymentPartial {
          succeeded,
          failed: vec![(instance_id, e.to_string())],
        });
      }
    }
  }

  // routing table from the flattened links
  let mut route_index: HashMap<(String, usize), Vec<(String, usize)>> = HashMap::new();
  for link in &flat.links {
    let source_node = by_id[link.source.0.as_str()];
    let dest_node = by_id[link.dest.0.as_str()];
    let out_port = source_node
      .component
      .out_port_index(&link.source.1)
      .expect("validated out-port");
    let in_port = dest_node
      .component
      .in_port_index(&link.dest.1)
      .expect("validated in-port");
    route_index
      .entry((link.source.0.clone(), out_port))
      .or_default()
      .push((link.dest.0.clone(), in_port));
  }

  // prepare: each strategy sees (and may rewrite) its own routes
  let mut final_routes: Vec<Route> = Vec::new();
  for instance_id in &succeeded {
    let node = by_id[instance_id.as_str()];
    let fragment: Vec<Route> = route_index
      .iter()
      .filter(|((source, _), _)| source == instance_id)
      .map(|((source, out_port), dests)| Route {
        source: (source.clone(), *out_port),
        dests: dests.clone(),
      })
      .collect();

    let instance = installed.instance(instance_id).expect("instance installed");
    let mut ctx = Context::new(node.component.clone(), node.strategy.clone(), runtime.clone())
      .with_scope(InstanceScope {
        deployment: id,
        instance: instance_id.clone(),
      })
      .with_cancel(cancel.clone());
    if let Some(data) = instance.deployment_data() {
      ctx = ctx.with_deployment(data);
    }

    let outcome = node
      .strategy
      .dispatch(
        Hook::Prepare,
        ctx,
        node.component.empty_state(),
        vec![serde_json::to_value(&fragment)?],
      )
      .await;

    match outcome {
      Ok(result) => match result.value {
        // an array result replaces the instance's routes
        Ok(value @ Value::Array(_)) => match serde_json::from_value::<Vec<Route>>(value) {
          Ok(replaced) => final_routes.extend(replaced),
          Err(e) => {
            teardown(runtime, id, &succeeded).await;
            return Err(Error::DeploymentPartial {
              succeeded: succeeded.clone(),
              failed: vec![(instance_id.clone(), format!("prepare returned bad routes: {}", e))],
            });
          }
        },
        Ok(_) => final_routes.extend(fragment),
        Err(failure) => {
          teardown(runtime, id, &succeeded).await;
          return Err(Error::DeploymentPartial {
            succeeded: succeeded.clone(),
            failed: vec![(instance_id.clone(), failure.to_string())],
          });
        }
      },
      Err(e) => {
        teardown(runtime, id, &succeeded).await;
        return Err(Error::DeploymentPartial {
          succeeded: succeeded.clone(),
          failed: vec![(instance_id.clone(), e.to_string())],
        });
      }
    }
  }

  installed.install_routes(&final_routes);
  if has_remote {
    let data: Vec<(String, InstanceDeployment)> = succeeded
      .iter()
      .filter_map(|instance_id| {
        installed
          .instance(instance_id)
          .and_then(|i| i.deployment_data())
          .map(|d| (instance_id.clone(), d))
      })
      .collect();
    if let Err(e) = runtime.install_routing_remote(id, &final_routes, &data).await {
      teardown(runtime, id, &succeeded).await;
      return Err(e);
    }
  }

  // boundary in-ports → concrete destinations, for DeployedWorkflow::send
  let mut inputs = HashMap::new();
  for (port, dests) in &flat.inputs {
    let mapped: Vec<(String, usize)> = dests
      .iter()
      .map(|(instance, in_port)| {
        let in_idx = by_id[instance.as_str()]
          .component
          .in_port_index(in_port)
          .expect("validated in-port");
        (instance.clone(), in_idx)
      })
      .collect();
    inputs.insert(port.clone(), mapped);
  }

  tracing::info!(
    deployment = %id,
    instances = succeeded.len(),
    workers = all_workers.len(),
    "workflow deployed"
  );

  Ok(DeployedWorkflow {
    runtime: runtime.clone(),
    id,
    instances: succeeded,
    workers: all_workers,
    inputs,
    cancel,
  })
}

/// Rolls back a failing deployment: `drop_deployment` for every component
/// that had deployed, then workers stopped and state uninstalled everywhere.
async fn teardown(runtime: &Runtime, id: DeploymentId, succeeded: &[String]) {
  let Some(installed) = runtime.deployment(id) else {
    return;
  };
  for instance_id in succeeded {
    let Some(instance) = installed.instance(instance_id) else {
      continue;
    };
    let mut ctx = Context::new(
      instance.component.clone(),
      instance.strategy.clone(),
      runtime.clone(),
    )
    .with_scope(InstanceScope {
      deployment: id,
      instance: instance_id.clone(),
    });
    if let Some(data) = instance.deployment_data() {
      ctx = ctx.with_deployment(data);
    }
    if let Err(e) = instance
      .strategy
      .dispatch(Hook::DropDeployment, ctx, instance.component.empty_state(), vec![])
      .await
    {
      tracing::warn!(instance = %instance_id, error = %e, "teardown drop_deployment failed");
    }
  }
  runtime.uninstall_deployment_everywhere(id).await;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancel_flag_flips_once() {
    let flag = CancelFlag::default();
    assert!(!flag.is_cancelled());
    flag.cancel();
    assert!(flag.is_cancelled());
    let clone = flag.clone();
    assert!(clone.is_cancelled());
  }

  #[test]
  fn routing_index_groups_and_orders_destinations() {
    let installed = InstalledDeployment::new(DeploymentId(1), HashMap::new());
    installed.install_routes(&[
      Route {
        source: ("a".to_string(), 0),
        dests: vec![("b".to_string(), 0), ("c".to_string(), 1)],
      },
      Route {
        source: ("a".to_string(), 1),
        dests: vec![("c".to_string(), 0)],
      },
    ]);

    assert_eq!(
      installed.destinations("a", 0),
      vec![("b".to_string(), 0), ("c".to_string(), 1)]
    );
    assert_eq!(installed.destinations("a", 1), vec![("c".to_string(), 0)]);
    assert!(installed.destinations("a", 2).is_empty());
    assert!(installed.destinations("x", 0).is_empty());
  }

  #[test]
  fn route_serializes_to_plain_json() {
    let route = Route {
      source: ("avg".to_string(), 0),
      dests: vec![("sink".to_string(), 0)],
    };
    let json = serde_json::to_value(&route).unwrap();
    assert_eq!(json["source"][0], "avg");
    let back: Route = serde_json::from_value(json).unwrap();
    assert_eq!(back, route);
  }
}
