//! Cluster scenarios over loopback TCP: handshake success and failure
//! aggregation, membership events, and cross-node deployment.

use meshweave::strategies::on_single_worker;
use meshweave::{
  Callback, Component, Config, ConnectFailure, Endpoint, Entity, Error, MemberEvent, NodeRole,
  Registry, Runtime, SubscriptionPolicy, Workflow,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn any_port() -> SocketAddr {
  "127.0.0.1:0".parse().unwrap()
}

fn init_tracing() {
  static INIT: std::sync::Once = std::sync::Once::new();
  INIT.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .try_init();
  });
}

async fn start_worker(cookie: &str, name: &str) -> Runtime {
  Runtime::start(
    Config::default()
      .with_cookie(cookie)
      .with_bind(any_port())
      .with_node_name(name),
    NodeRole::Worker,
  )
  .await
  .unwrap()
}

async fn start_master(cookie: &str, name: &str) -> Runtime {
  Runtime::start(
    Config::default()
      .with_cookie(cookie)
      .with_bind(any_port())
      .with_node_name(name),
    NodeRole::Master,
  )
  .await
  .unwrap()
}

/// An address nothing listens on.
async fn dead_node(name: &str) -> meshweave::NodeId {
  let listener = tokio::net::TcpListener::bind(any_port()).await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);
  meshweave::NodeId::new(name, addr)
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
async fn handshake_failures_are_aggregated_per_node() {
  init_tracing();
  let cookie = "c-handshake";
  let master = start_master(cookie, "m").await;
  let worker_a = start_worker(cookie, "a").await;
  let not_a_worker = start_master(cookie, "imposter").await;
  let unreachable = dead_node("ghost").await;

  let (_sub, mut joins) = master.subscribe_join(SubscriptionPolicy::Block);

  let targets = vec![
    worker_a.node_id().clone(),
    not_a_worker.node_id().clone(),
    unreachable.clone(),
  ];
  let err = master.connect(&targets).await.unwrap_err();

  match err {
    Error::Connect(failures) => {
      assert_eq!(
        failures,
        vec![
          ConnectFailure::NotAWorker(not_a_worker.node_id().clone()),
          ConnectFailure::NotConnected(unreachable),
        ]
      );
    }
    other => panic!("expected Connect, got {:?}", other),
  }

  // the good worker is in anyway, with exactly one join delivered
  assert_eq!(master.members(), vec![worker_a.node_id().clone()]);
  assert_eq!(
    joins.recv().await,
    Some(MemberEvent::Join(worker_a.node_id().clone()))
  );
  assert_eq!(joins.try_recv(), None);
}

#[tokio::test]
async fn wrong_cookie_is_reported_as_such() {
  let master = start_master("right", "m").await;
  let worker = start_worker("wrong", "w").await;

  let err = master.connect(&[worker.node_id().clone()]).await.unwrap_err();
  match err {
    Error::Connect(failures) => {
      assert_eq!(
        failures,
        vec![ConnectFailure::WrongCookie(worker.node_id().clone())]
      );
    }
    other => panic!("expected Connect, got {:?}", other),
  }
  assert!(master.members().is_empty());
}

#[tokio::test]
async fn second_master_is_turned_away() {
  let cookie = "c-second";
  let master1 = start_master(cookie, "m1").await;
  let master2 = start_master(cookie, "m2").await;
  let worker = start_worker(cookie, "w").await;

  master1.connect(&[worker.node_id().clone()]).await.unwrap();

  let err = master2.connect(&[worker.node_id().clone()]).await.unwrap_err();
  match err {
    Error::Connect(failures) => {
      assert_eq!(
        failures,
        vec![ConnectFailure::AlreadyConnected(worker.node_id().clone())]
      );
    }
    other => panic!("expected Connect, got {:?}", other),
  }
}

#[tokio::test]
async fn disconnect_then_reconnect_round_trips() {
  let cookie = "c-rejoin";
  let master = start_master(cookie, "m").await;
  let worker = start_worker(cookie, "w").await;
  let worker_id = worker.node_id().clone();

  let (_js, mut joins) = master.subscribe_join(SubscriptionPolicy::Block);
  let (_ls, mut leaves) = master.subscribe_leave(SubscriptionPolicy::Block);

  master.connect(&[worker_id.clone()]).await.unwrap();
  assert_eq!(joins.recv().await, Some(MemberEvent::Join(worker_id.clone())));

  master.disconnect(&worker_id).await.unwrap();
  assert_eq!(
    leaves.recv().await,
    Some(MemberEvent::Leave(
      worker_id.clone(),
      meshweave::LeaveReason::Removed
    ))
  );
  assert!(master.members().is_empty());

  // the worker is free again: a second connect re-establishes the same state
  master.connect(&[worker_id.clone()]).await.unwrap();
  assert_eq!(joins.recv().await, Some(MemberEvent::Join(worker_id.clone())));
  assert_eq!(master.members(), vec![worker_id]);
}

#[tokio::test]
async fn on_all_with_no_workers_is_empty() {
  let master = start_master("c-empty", "m").await;
  let results = master
    .on_all(meshweave::runtime::task_names::WORKER_COUNT, Value::Null)
    .await;
  assert!(results.is_empty());
}

#[tokio::test]
async fn worker_announce_connects_it_to_the_master() {
  let cookie = "c-announce";
  let master = start_master(cookie, "m").await;

  let worker = Runtime::start(
    Config {
      master: Some(master.node_id().clone()),
      ..Config::default().with_cookie(cookie).with_bind(any_port())
    },
    NodeRole::Worker,
  )
  .await
  .unwrap();

  wait_until(|| !master.members().is_empty(), "announced worker to join").await;
  assert_eq!(master.members(), vec![worker.node_id().clone()]);
}

fn registered_collector(name: &str, log: Arc<Mutex<Vec<Value>>>) -> Arc<Component> {
  let component = Arc::new(
    Component::builder()
      .name(name)
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
  );
  Registry::global().put_if_named(Entity::Component(component.clone()));
  component
}

#[tokio::test]
async fn deployment_spans_worker_nodes_and_destroys_cleanly() {
  let cookie = "c-deploy";
  let master = start_master(cookie, "m").await;
  let worker1 = start_worker(cookie, "w1").await;
  let worker2 = start_worker(cookie, "w2").await;
  master
    .connect(&[worker1.node_id().clone(), worker2.node_id().clone()])
    .await
    .unwrap();

  Registry::global().put_if_named(Entity::Strategy(on_single_worker()));
  let log_a = Arc::new(Mutex::new(Vec::new()));
  let log_b = Arc::new(Mutex::new(Vec::new()));
  let stage_a = registered_collector("cluster_stage_a", log_a.clone());
  let stage_b = registered_collector("cluster_stage_b", log_b.clone());

  let workflow = Workflow::builder()
    .in_port("feed")
    .component("a", stage_a, json!({}))
    .component("b", stage_b, json!({}))
    .link(Endpoint::boundary("feed"), Endpoint::node("a", "in"))
    .link(Endpoint::boundary("feed"), Endpoint::node("b", "in"))
    .build()
    .unwrap();

  let deployed = master.deploy(&workflow).await.unwrap();
  assert_eq!(deployed.workers().len(), 2);
  // every spawned worker lives on a member node, none on the master
  for worker in deployed.workers() {
    assert_ne!(&worker.node, master.node_id());
    assert!(master.members().contains(&worker.node));
  }

  for i in 1..=5 {
    deployed.send("feed", json!(i)).await.unwrap();
  }
  wait_until(|| log_a.lock().unwrap().len() == 5, "five on stage a").await;
  wait_until(|| log_b.lock().unwrap().len() == 5, "five on stage b").await;
  // per-worker FIFO holds across the wire
  let expected: Vec<Value> = (1..=5).map(|i| json!(i)).collect();
  assert_eq!(log_a.lock().unwrap().clone(), expected);
  assert_eq!(log_b.lock().unwrap().clone(), expected);

  deployed.destroy().await.unwrap();
  let mut remaining = 0;
  for node in master.members() {
    remaining += master.workers_alive_on(&node).await.unwrap();
  }
  assert_eq!(remaining, 0);
}

#[tokio::test]
async fn worker_shuts_down_with_its_master_when_configured() {
  init_tracing();
  let cookie = "c-shutdown";
  let fast = || Config {
    heartbeat_interval: Duration::from_millis(100),
    heartbeat_misses: 2,
    request_deadline: Duration::from_millis(500),
    ..Config::default().with_cookie(cookie).with_bind(any_port())
  };

  let master = Runtime::start(fast(), NodeRole::Master).await.unwrap();
  let worker = Runtime::start(
    Config {
      shutdown_with_master: true,
      ..fast()
    },
    NodeRole::Worker,
  )
  .await
  .unwrap();

  master.connect(&[worker.node_id().clone()]).await.unwrap();
  assert!(!worker.is_shutting_down());

  master.shutdown().await;
  tokio::time::timeout(Duration::from_secs(5), worker.wait_shutdown())
    .await
    .expect("worker should notice master loss and shut down");
  assert!(worker.is_shutting_down());
}

#[tokio::test]
async fn anonymous_components_cannot_deploy_across_nodes() {
  let cookie = "c-anon";
  let master = start_master(cookie, "m").await;
  let worker = start_worker(cookie, "w").await;
  master.connect(&[worker.node_id().clone()]).await.unwrap();

  let anonymous = Arc::new(
    Component::builder()
      .in_port("in")
      .strategy(on_single_worker())
      .callback("in", Callback::from_fn(|_, _| Ok(Value::Null)))
      .build()
      .unwrap(),
  );
  let workflow = Workflow::builder()
    .component("x", anonymous, json!({}))
    .build()
    .unwrap();

  let err = master.deploy(&workflow).await.unwrap_err();
  assert!(matches!(
    err,
    Error::Definition(meshweave::DefinitionError::Unregistered { .. })
  ));
}
