//! End-to-end scenarios on an undistributed runtime: deploy a workflow,
//! drive tokens through it, observe callback effects, tear it down.

use meshweave::strategies::{on_single_worker, replicated_stateless};
use meshweave::{
  Callback, CallbackArgs, Component, Config, Endpoint, Error, FieldsState, Runtime,
  StateCapability, Workflow,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn average() -> Arc<Component> {
  Arc::new(
    Component::builder()
      .name("average")
      .fields(["total", "count"])
      .in_port("value")
      .out_port("current")
      .strategy(on_single_worker())
      .callback(
        "init",
        Callback::from_fn(|env, _| {
          env.write("total", json!(0.0))?;
          env.write("count", json!(0.0))?;
          Ok(Value::Null)
        })
        .with_write(["total", "count"])
        .with_state_capability(StateCapability::ReadWrite),
      )
      .callback(
        "value",
        Callback::from_fn(|env, args| {
          let v = args.arg(0).and_then(Value::as_f64).unwrap_or(0.0);
          let count = env.read("count")?.as_f64().unwrap_or(0.0) + 1.0;
          let total = env.read("total")?.as_f64().unwrap_or(0.0) + v;
          env.write("count", json!(count))?;
          env.write("total", json!(total))?;
          env.publish("current", json!(total / count))?;
          Ok(Value::Null)
        })
        .with_read(["total", "count"])
        .with_write(["total", "count"])
        .with_publish(["current"])
        .with_state_capability(StateCapability::ReadWrite)
        .with_publish_capability(true),
      )
      .build()
      .unwrap(),
  )
}

/// A sink that records every arriving value into a shared log.
fn collector(log: Arc<Mutex<Vec<Value>>>) -> Arc<Component> {
  Arc::new(
    Component::builder()
      .name("collector")
      .in_port("in")
      .strategy(on_single_worker())
      .callback(
        "in",
        Callback::from_fn(move |_env, args| {
          log
            .lock()
            .unwrap()
            .push(args.arg(0).cloned().unwrap_or(Value::Null));
          Ok(Value::Null)
        }),
      )
      .build()
      .unwrap(),
  )
}

async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while !check() {
    assert!(
      tokio::time::Instant::now() < deadline,
      "timed out waiting for {}",
      what
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

#[tokio::test]
async fn average_callback_matches_the_arithmetic() {
  let component = average();
  let mut state = FieldsState::new();
  state.insert("total".to_string(), json!(0.0));
  state.insert("count".to_string(), json!(0.0));

  let result = component
    .call("value", state, CallbackArgs::new(vec![json!(10.0)]))
    .await
    .unwrap();

  let state = result.state.unwrap();
  assert_eq!(state["total"], json!(10.0));
  assert_eq!(state["count"], json!(1.0));
  let published = result.published.unwrap();
  assert_eq!(published.len(), 1);
  assert_eq!(published[0].0.as_str(), "current");
  assert_eq!(published[0].1, json!(10.0));
}

#[tokio::test]
async fn tokens_flow_boundary_to_sink_through_the_graph() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let workflow = Workflow::builder()
    .in_port("readings")
    .component("avg", average(), json!({}))
    .component("out", collector(log.clone()), json!({}))
    .link(Endpoint::boundary("readings"), Endpoint::node("avg", "value"))
    .link(Endpoint::node("avg", "current"), Endpoint::node("out", "in"))
    .build()
    .unwrap();

  let runtime = Runtime::local(Config::default());
  let deployed = runtime.deploy(&workflow).await.unwrap();
  assert_eq!(deployed.workers().len(), 2);

  deployed.send("readings", json!(10.0)).await.unwrap();
  deployed.send("readings", json!(20.0)).await.unwrap();

  wait_until(|| log.lock().unwrap().len() == 2, "two averages").await;
  let seen = log.lock().unwrap().clone();
  assert_eq!(seen, vec![json!(10.0), json!(15.0)]);

  deployed.destroy().await.unwrap();
}

#[tokio::test]
async fn deploy_destroy_leaves_no_residual_workers() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let workflow = Workflow::builder()
    .in_port("feed")
    .component("avg", average(), json!({}))
    .component("out", collector(log), json!({}))
    .link(Endpoint::boundary("feed"), Endpoint::node("avg", "value"))
    .link(Endpoint::node("avg", "current"), Endpoint::node("out", "in"))
    .build()
    .unwrap();

  let runtime = Runtime::local(Config::default());
  let self_id = runtime.node_id().clone();
  let baseline = runtime.workers_alive_on(&self_id).await.unwrap();

  let deployed = runtime.deploy(&workflow).await.unwrap();
  assert_eq!(deployed.workers().len(), 2);
  assert_eq!(runtime.workers_alive_on(&self_id).await.unwrap(), baseline + 2);

  deployed.destroy().await.unwrap();
  assert_eq!(runtime.workers_alive_on(&self_id).await.unwrap(), baseline);
}

#[tokio::test]
async fn per_worker_delivery_is_fifo() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let workflow = Workflow::builder()
    .in_port("feed")
    .component("out", collector(log.clone()), json!({}))
    .link(Endpoint::boundary("feed"), Endpoint::node("out", "in"))
    .build()
    .unwrap();

  let runtime = Runtime::local(Config::default());
  let deployed = runtime.deploy(&workflow).await.unwrap();

  for i in 1..=5 {
    deployed.send("feed", json!(i)).await.unwrap();
  }

  wait_until(|| log.lock().unwrap().len() == 5, "five deliveries").await;
  let seen = log.lock().unwrap().clone();
  assert_eq!(seen, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);

  deployed.destroy().await.unwrap();
}

#[tokio::test]
async fn incomplete_strategy_fails_before_any_spawn() {
  // default (empty) strategy: nothing is complete about it
  let bare = Arc::new(
    Component::builder()
      .name("bare")
      .in_port("in")
      .callback("in", Callback::from_fn(|_, _| Ok(Value::Null)))
      .build()
      .unwrap(),
  );
  let workflow = Workflow::builder()
    .component("b", bare, json!({}))
    .build()
    .unwrap();

  let runtime = Runtime::local(Config::default());
  let self_id = runtime.node_id().clone();
  let err = runtime.deploy(&workflow).await.unwrap_err();
  assert!(matches!(err, Error::StrategyIncomplete { .. }));
  assert_eq!(runtime.workers_alive_on(&self_id).await.unwrap(), 0);
}

#[tokio::test]
async fn replicated_strategy_spawns_one_worker_per_member() {
  // a single-member local runtime: one replica
  let log = Arc::new(Mutex::new(Vec::new()));
  let replicated = Arc::new(
    Component::builder()
      .name("replicated_sink")
      .in_port("in")
      .strategy(replicated_stateless())
      .callback("in", {
        let log = log.clone();
        Callback::from_fn(move |_env, args| {
          log
            .lock()
            .unwrap()
            .push(args.arg(0).cloned().unwrap_or(Value::Null));
          Ok(Value::Null)
        })
      })
      .build()
      .unwrap(),
  );
  let workflow = Workflow::builder()
    .in_port("feed")
    .component("r", replicated, json!({}))
    .link(Endpoint::boundary("feed"), Endpoint::node("r", "in"))
    .build()
    .unwrap();

  let runtime = Runtime::local(Config::default());
  let deployed = runtime.deploy(&workflow).await.unwrap();
  assert_eq!(deployed.workers().len(), runtime.members().len());

  deployed.send("feed", json!("x")).await.unwrap();
  wait_until(|| log.lock().unwrap().len() == 1, "one delivery").await;
  deployed.destroy().await.unwrap();
}

#[tokio::test]
async fn crashed_worker_restarts_with_empty_state() {
  // counts invocations in state; panics on the value 13; later messages see
  // reset state
  let log = Arc::new(Mutex::new(Vec::new()));
  let touchy = Arc::new(
    Component::builder()
      .name("touchy")
      .field("seen")
      .in_port("in")
      .strategy(on_single_worker())
      .callback("in", {
        let log = log.clone();
        Callback::from_fn(move |env, args| {
          let v = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
          if v == 13 {
            panic!("unlucky");
          }
          let seen = env.read("seen")?.as_i64().unwrap_or(0) + 1;
          env.write("seen", json!(seen))?;
          log.lock().unwrap().push(json!(seen));
          Ok(Value::Null)
        })
        .with_read(["seen"])
        .with_write(["seen"])
        .with_state_capability(StateCapability::ReadWrite)
      })
      .build()
      .unwrap(),
  );
  let workflow = Workflow::builder()
    .in_port("feed")
    .component("t", touchy, json!({}))
    .link(Endpoint::boundary("feed"), Endpoint::node("t", "in"))
    .build()
    .unwrap();

  let runtime = Runtime::local(Config::default());
  let deployed = runtime.deploy(&workflow).await.unwrap();

  deployed.send("feed", json!(1)).await.unwrap();
  deployed.send("feed", json!(2)).await.unwrap();
  deployed.send("feed", json!(13)).await.unwrap(); // crash
  deployed.send("feed", json!(3)).await.unwrap();

  wait_until(|| log.lock().unwrap().len() == 3, "three survivors").await;
  let seen = log.lock().unwrap().clone();
  // counter reached 2, the crash reset the state, then counting restarted
  assert_eq!(seen, vec![json!(1), json!(2), json!(1)]);

  deployed.destroy().await.unwrap();
}

#[tokio::test]
async fn duplicate_destination_is_a_definition_error() {
  let log = Arc::new(Mutex::new(Vec::new()));
  let err = Workflow::builder()
    .component("a", average(), json!({}))
    .component("b", average(), json!({}))
    .component("x", collector(log), json!({}))
    .link(Endpoint::node("a", "current"), Endpoint::node("x", "in"))
    .link(Endpoint::node("b", "current"), Endpoint::node("x", "in"))
    .build()
    .unwrap_err();

  assert!(matches!(
    err,
    Error::Definition(meshweave::DefinitionError::DuplicateDestination { node, port })
      if node == "x" && port == "in"
  ));
}

#[tokio::test]
async fn no_publish_capability_means_no_publishes() {
  let silent = Arc::new(
    Component::builder()
      .name("silent")
      .in_port("in")
      .callback(
        "in",
        Callback::from_fn(|_env, _| Ok(json!("ran"))),
      )
      .build()
      .unwrap(),
  );
  let result = silent
    .call("in", FieldsState::new(), CallbackArgs::new(vec![json!(1)]))
    .await
    .unwrap();
  assert_eq!(result.published, None);
  assert_eq!(result.value.unwrap(), json!("ran"));
}
