//! Token routing: from a publish to the destination strategies' `send` hooks.
//!
//! When a worker's `receive` publishes values, the local runtime looks up the
//! routing table entry for each `(instance, out-port)` and dispatches the
//! destination strategy's `send` hook once per value, in publish order. The
//! hook picks the concrete worker and forwards the message; delivery order
//! per destination worker follows publish order because each dispatch is
//! awaited before the next.

use crate::component::Port;
use crate::deployment::{DeploymentId, InstanceScope};
use crate::error::Error;
use crate::runtime::Runtime;
use crate::strategy::{Context, Hook};
use serde_json::{json, Value};

/// Routes one invocation's publishes to their destinations.
pub(crate) async fn route(
  runtime: &Runtime,
  deployment: DeploymentId,
  source: &str,
  published: Vec<(Port, Value)>,
) -> Result<(), Error> {
  let installed = runtime
    .deployment(deployment)
    .ok_or_else(|| Error::UnknownName(format!("deployment {}", deployment)))?;
  let source_instance = installed
    .instance(source)
    .ok_or_else(|| Error::UnknownName(format!("instance {}", source)))?;

  for (port, value) in published {
    let Some(out_port) = source_instance.component.out_port_index(&port) else {
      // unchecked hook published an undeclared port; nothing is wired to it
      tracing::warn!(instance = %source, port = %port, "publish to unknown out-port dropped");
      continue;
    };
    for (dest, in_port) in installed.destinations(source, out_port) {
      dispatch_send(runtime, deployment, &dest, in_port, value.clone()).await?;
    }
  }
  Ok(())
}

/// Dispatches one value to one destination's `send` hook.
///
/// The hook receives `[value, in_port_index]` and the destination's context
/// (component, strategy, deployment data); it chooses the concrete worker.
pub(crate) async fn dispatch_send(
  runtime: &Runtime,
  deployment: DeploymentId,
  dest: &str,
  in_port: usize,
  value: Value,
) -> Result<(), Error> {
  let installed = runtime
    .deployment(deployment)
    .ok_or_else(|| Error::UnknownName(format!("deployment {}", deployment)))?;
  let instance = installed
    .instance(dest)
    .ok_or_else(|| Error::UnknownName(format!("instance {}", dest)))?;

  let mut ctx = Context::new(
    instance.component.clone(),
    instance.strategy.clone(),
    runtime.clone(),
  )
  .with_scope(InstanceScope {
    deployment,
    instance: dest.to_string(),
  });
  if let Some(data) = instance.deployment_data() {
    ctx = ctx.with_deployment(data);
  }

  let result = instance
    .strategy
    .dispatch(
      Hook::Send,
      ctx,
      instance.component.empty_state(),
      vec![value, json!(in_port)],
    )
    .await?;
  if let Err(failure) = result.value {
    return Err(failure.into());
  }
  Ok(())
}
