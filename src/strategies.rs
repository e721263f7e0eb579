//! Stock strategies.
//!
//! Three complete strategies covering the common materialization shapes:
//! one worker on a stable node, stateless replicas with round-robin
//! dispatch, and key-partitioned state. They share a receive hook that
//! invokes the user callback named after the arriving in-port, and a message
//! convention of `{"port": <in-port index>, "value": <token>}`.
//!
//! Besides being useful defaults, these exist to exercise the full hook
//! surface; user strategies compose over them with
//! [`Strategy::merge`](crate::Strategy::merge).

use crate::component::{
  Callback, CallbackArgs, CallbackBody, CallbackEnv, CallbackFailure, FieldsState,
};
use crate::strategy::{Context, Strategy};
use crate::worker::WorkerRef;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn context(args: &CallbackArgs) -> Result<&Context, CallbackFailure> {
  args
    .context()
    .ok_or_else(|| CallbackFailure::failed("hook invoked without a context"))
}

/// Initial worker state: the component's empty state, refined by its `init`
/// callback when one is defined.
async fn initial_state(ctx: &Context) -> Result<FieldsState, CallbackFailure> {
  let component = ctx.component();
  let mut state = component.empty_state();
  if component.callback("init").is_some() {
    let result = component
      .call("init", state.clone(), CallbackArgs::new(vec![]))
      .await
      .map_err(|e| CallbackFailure::failed(e.to_string()))?;
    result.value?;
    if let Some(new_state) = result.state {
      state = new_state;
    }
  }
  Ok(state)
}

fn workers(ctx: &Context) -> Result<Vec<WorkerRef>, CallbackFailure> {
  let deployment = ctx
    .deployment()
    .ok_or_else(|| CallbackFailure::failed("send hook before deployment data"))?;
  if deployment.workers.is_empty() {
    return Err(CallbackFailure::failed("no workers deployed"));
  }
  Ok(deployment.workers.clone())
}

fn wrap_message(args: &CallbackArgs) -> Result<Value, CallbackFailure> {
  let value = args
    .arg(0)
    .cloned()
    .ok_or_else(|| CallbackFailure::failed("send hook without a value"))?;
  let in_port = args
    .arg(1)
    .and_then(Value::as_u64)
    .ok_or_else(|| CallbackFailure::failed("send hook without an in-port"))?;
  Ok(json!({ "port": in_port, "value": value }))
}

/// Spawns one worker on a stable node chosen by the component name.
struct DeploySingle;

#[async_trait]
impl CallbackBody for DeploySingle {
  async fn run(&self, _env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    let ctx = context(args)?;
    let node = ctx
      .select_permanent(ctx.component().display_name())
      .map_err(|e| CallbackFailure::failed(e.to_string()))?;
    let state = initial_state(ctx).await?;
    ctx
      .spawn_worker(&node, "single", state)
      .await
      .map_err(|e| CallbackFailure::failed(e.to_string()))?;
    Ok(Value::Null)
  }
}

/// Spawns one worker per member node.
struct DeployPerMember {
  tag: &'static str,
}

#[async_trait]
impl CallbackBody for DeployPerMember {
  async fn run(&self, _env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    let ctx = context(args)?;
    let members = ctx.members();
    if members.is_empty() {
      return Err(CallbackFailure::failed("no worker nodes available"));
    }
    for node in members {
      if ctx.is_cancelled() {
        return Err(CallbackFailure::failed("deployment cancelled"));
      }
      let state = initial_state(ctx).await?;
      ctx
        .spawn_worker(&node, self.tag, state)
        .await
        .map_err(|e| CallbackFailure::failed(e.to_string()))?;
    }
    Ok(Value::Null)
  }
}

/// Forwards every token to the single deployed worker.
struct SendToSingle;

#[async_trait]
impl CallbackBody for SendToSingle {
  async fn run(&self, _env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    let ctx = context(args)?;
    let workers = workers(ctx)?;
    let message = wrap_message(args)?;
    ctx
      .forward(&workers[0], message)
      .await
      .map_err(|e| CallbackFailure::failed(e.to_string()))
      .map(|_| Value::Null)
  }
}

/// Distributes tokens across replicas in round-robin order.
struct SendRoundRobin {
  next: AtomicUsize,
}

#[async_trait]
impl CallbackBody for SendRoundRobin {
  async fn run(&self, _env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    let ctx = context(args)?;
    let workers = workers(ctx)?;
    let index = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
    let message = wrap_message(args)?;
    ctx
      .forward(&workers[index], message)
      .await
      .map_err(|e| CallbackFailure::failed(e.to_string()))
      .map(|_| Value::Null)
  }
}

/// Routes tokens by key: same key, same worker, while membership is stable.
struct SendKeyed {
  key_field: &'static str,
}

impl SendKeyed {
  fn key_of(&self, value: &Value) -> String {
    match value.get(self.key_field).and_then(Value::as_str) {
      Some(key) => key.to_string(),
      None => value.to_string(),
    }
  }
}

#[async_trait]
impl CallbackBody for SendKeyed {
  async fn run(&self, _env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    let ctx = context(args)?;
    let workers = workers(ctx)?;
    let value = args
      .arg(0)
      .ok_or_else(|| CallbackFailure::failed("send hook without a value"))?;
    let mut hasher = DefaultHasher::new();
    self.key_of(value).hash(&mut hasher);
    let index = (hasher.finish() as usize) % workers.len();
    let message = wrap_message(args)?;
    ctx
      .forward(&workers[index], message)
      .await
      .map_err(|e| CallbackFailure::failed(e.to_string()))
      .map(|_| Value::Null)
  }
}

/// Invokes the user callback named after the arriving in-port and
/// republishes whatever it published. A failing user callback fails the
/// hook, which restarts the worker with fresh state.
struct ReceivePortCallback;

#[async_trait]
impl CallbackBody for ReceivePortCallback {
  async fn run(&self, env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    let ctx = context(args)?;
    let message = args
      .arg(0)
      .ok_or_else(|| CallbackFailure::failed("receive without a message"))?;
    let port_index = message
      .get("port")
      .and_then(Value::as_u64)
      .ok_or_else(|| CallbackFailure::failed("message without a port"))? as usize;
    let value = message.get("value").cloned().unwrap_or(Value::Null);

    let component = ctx.component();
    let port = component
      .in_ports()
      .get(port_index)
      .ok_or_else(|| CallbackFailure::failed(format!("no in-port at index {}", port_index)))?;

    let result = component
      .call(port.as_str(), env.state().clone(), CallbackArgs::new(vec![value]))
      .await
      .map_err(|e| CallbackFailure::failed(e.to_string()))?;
    result.value?;

    if let Some(new_state) = result.state {
      env.replace_state(new_state);
    }
    if let Some(published) = result.published {
      for (out_port, value) in published {
        env.publish(out_port, value)?;
      }
    }
    Ok(Value::Null)
  }
}

fn noop() -> Callback {
  Callback::unrestricted_fn(|_env, _args| Ok(Value::Null))
}

/// One worker on one stable node; every token goes to it.
pub fn on_single_worker() -> Arc<Strategy> {
  Arc::new(
    Strategy::builder()
      .name("on_single_worker")
      .define(noop())
      .deploy(Callback::unrestricted(DeploySingle))
      .prepare(noop())
      .send(Callback::unrestricted(SendToSingle))
      .receive(Callback::unrestricted(ReceivePortCallback))
      .drop_deployment(noop())
      .drop_invocation(noop())
      .build(),
  )
}

/// One stateless replica per member node, tokens round-robined across them.
pub fn replicated_stateless() -> Arc<Strategy> {
  Arc::new(
    Strategy::builder()
      .name("replicated_stateless")
      .define(noop())
      .deploy(Callback::unrestricted(DeployPerMember { tag: "replica" }))
      .prepare(noop())
      .send(Callback::unrestricted(SendRoundRobin {
        next: AtomicUsize::new(0),
      }))
      .receive(Callback::unrestricted(ReceivePortCallback))
      .drop_deployment(noop())
      .drop_invocation(noop())
      .build(),
  )
}

/// One partition per member node; tokens routed by their `key` field (the
/// whole value when absent), so per-key state stays on one worker.
pub fn keyed_state() -> Arc<Strategy> {
  Arc::new(
    Strategy::builder()
      .name("keyed_state")
      .define(noop())
      .deploy(Callback::unrestricted(DeployPerMember { tag: "partition" }))
      .prepare(noop())
      .send(Callback::unrestricted(SendKeyed { key_field: "key" }))
      .receive(Callback::unrestricted(ReceivePortCallback))
      .drop_deployment(noop())
      .drop_invocation(noop())
      .build(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::strategy::Hook;

  #[test]
  fn stock_strategies_are_complete() {
    for strategy in [on_single_worker(), replicated_stateless(), keyed_state()] {
      assert!(strategy.is_complete(), "{:?} incomplete", strategy.name());
    }
  }

  #[test]
  fn stock_strategies_are_merge_parents() {
    let child = Strategy::builder()
      .receive(Callback::unrestricted_fn(|_, _| Ok(Value::Null)))
      .build();
    let parent = on_single_worker();
    let merged = Strategy::merge(&child, &parent);
    assert!(merged.is_complete());
    assert_eq!(merged.name(), Some("on_single_worker"));
    assert!(merged
      .hook(Hook::Receive)
      .unwrap()
      .same_body(child.hook(Hook::Receive).unwrap()));
    assert!(merged
      .hook(Hook::Deploy)
      .unwrap()
      .same_body(parent.hook(Hook::Deploy).unwrap()));
  }

  #[test]
  fn keyed_send_extracts_keys() {
    let send = SendKeyed { key_field: "key" };
    assert_eq!(send.key_of(&json!({"key": "user-1", "n": 1})), "user-1");
    // values without the field fall back to the whole value
    assert_eq!(send.key_of(&json!(42)), "42");
  }
}
