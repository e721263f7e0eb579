//! Task registry for the cluster broker.
//!
//! Function values cannot travel between nodes, so "run this closure over
//! there" becomes "invoke this named task over there": every node registers
//! the same task set at start (same-release clusters), and `task_invoke`
//! requests resolve the name locally. The broker entry points live on the
//! runtime ([`Runtime::on`](crate::Runtime::on) and
//! [`Runtime::on_all`](crate::Runtime::on_all)).

use crate::error::Error;
use crate::runtime::Runtime;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A named operation invocable on any node of the cluster.
#[async_trait]
pub trait RemoteTask: Send + Sync {
  async fn run(&self, runtime: &Runtime, args: Value) -> Result<Value, Error>;
}

struct FnTask<F>(F);

#[async_trait]
impl<F> RemoteTask for FnTask<F>
where
  F: Fn(Runtime, Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync,
{
  async fn run(&self, runtime: &Runtime, args: Value) -> Result<Value, Error> {
    (self.0)(runtime.clone(), args).await
  }
}

/// Name → task directory, populated at node start.
pub struct TaskRegistry {
  tasks: RwLock<HashMap<String, Arc<dyn RemoteTask>>>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self {
      tasks: RwLock::new(HashMap::new()),
    }
  }

  /// Registers a task, replacing any previous binding.
  pub fn register(&self, name: impl Into<String>, task: Arc<dyn RemoteTask>) {
    self
      .tasks
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(name.into(), task);
  }

  /// Registers a closure-backed task.
  pub fn register_fn<F>(&self, name: impl Into<String>, f: F)
  where
    F: Fn(Runtime, Value) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync + 'static,
  {
    self.register(name, Arc::new(FnTask(f)));
  }

  /// Runs a registered task locally.
  pub async fn invoke(&self, runtime: &Runtime, name: &str, args: Value) -> Result<Value, Error> {
    let task = self
      .tasks
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(name)
      .cloned()
      .ok_or_else(|| Error::UnknownName(name.to_string()))?;
    task.run(runtime, args).await
  }

  pub fn names(&self) -> Vec<String> {
    self
      .tasks
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .keys()
      .cloned()
      .collect()
  }
}

impl Default for TaskRegistry {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use serde_json::json;

  #[tokio::test]
  async fn invoke_runs_registered_closure() {
    let runtime = Runtime::local(Config::default());
    let registry = TaskRegistry::new();
    registry.register_fn("sum", |_rt, args| {
      Box::pin(async move {
        let total: i64 = args
          .as_array()
          .map(|xs| xs.iter().filter_map(Value::as_i64).sum())
          .unwrap_or(0);
        Ok(json!(total))
      })
    });

    let value = registry
      .invoke(&runtime, "sum", json!([1, 2, 3]))
      .await
      .unwrap();
    assert_eq!(value, json!(6));
  }

  #[tokio::test]
  async fn unknown_task_is_unknown_name() {
    let runtime = Runtime::local(Config::default());
    let registry = TaskRegistry::new();
    let err = registry.invoke(&runtime, "ghost", Value::Null).await.unwrap_err();
    assert!(matches!(err, Error::UnknownName(n) if n == "ghost"));
  }
}
