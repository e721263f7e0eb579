//! Cluster membership.
//!
//! The master side owns the worker connection lifecycle: the `connect`
//! handshake (reach, verify, register, monitor, notify), liveness monitoring
//! with a miss budget, explicit `disconnect`, and join/leave fan-out to
//! subscribers. The worker side accepts at most one master at a time and
//! watches it with its own monitor.
//!
//! A node is either fully connected (handshake complete, monitor installed,
//! join notified) or absent; the per-target lock in [`Membership::connect`]
//! keeps concurrent handshakes to the same node from observing anything in
//! between.

use crate::error::{ConnectFailure, Error};
use crate::remote::{verify, NodeId, NodeRole};
use crate::runtime::Runtime;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Why a node left the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveReason {
  /// The master explicitly disconnected it.
  Removed,
  /// Its liveness monitor gave up on it.
  Down,
}

/// A membership notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberEvent {
  Join(NodeId),
  Leave(NodeId, LeaveReason),
}

/// What to do when a subscriber's queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionPolicy {
  /// Apply backpressure: membership waits for the subscriber.
  Block,
  /// Drop the event for this subscriber and log it.
  Lossy,
}

/// Handle identifying one subscription for `unsubscribe_*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription.
pub struct MemberEvents {
  rx: mpsc::Receiver<MemberEvent>,
}

impl MemberEvents {
  /// Next event, `None` once unsubscribed and drained.
  pub async fn recv(&mut self) -> Option<MemberEvent> {
    self.rx.recv().await
  }

  /// Non-blocking variant for tests and polling callers.
  pub fn try_recv(&mut self) -> Option<MemberEvent> {
    self.rx.try_recv().ok()
  }
}

struct Subscriber {
  tx: mpsc::Sender<MemberEvent>,
  policy: SubscriptionPolicy,
}

struct NodeEntry {
  tags: BTreeSet<String>,
  monitor: JoinHandle<()>,
  connected_at: chrono::DateTime<chrono::Utc>,
}

const SUBSCRIBER_QUEUE: usize = 64;

/// Master-side membership state.
pub struct Membership {
  entries: RwLock<HashMap<NodeId, NodeEntry>>,
  joins: Mutex<HashMap<u64, Subscriber>>,
  leaves: Mutex<HashMap<u64, Subscriber>>,
  next_subscription: AtomicU64,
  handshakes: tokio::sync::Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Membership {
  pub(crate) fn new() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      joins: Mutex::new(HashMap::new()),
      leaves: Mutex::new(HashMap::new()),
      next_subscription: AtomicU64::new(1),
      handshakes: tokio::sync::Mutex::new(HashMap::new()),
    }
  }

  /// Connected members, in name order.
  pub fn members(&self) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .keys()
      .cloned()
      .collect();
    nodes.sort();
    nodes
  }

  pub fn is_member(&self, node: &NodeId) -> bool {
    self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .contains_key(node)
  }

  /// Tags recorded for a connected node.
  pub fn tags(&self, node: &NodeId) -> Option<BTreeSet<String>> {
    self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(node)
      .map(|e| e.tags.clone())
  }

  /// Adds a tag to a connected node. Returns false for unknown nodes.
  pub fn tag(&self, node: &NodeId, tag: impl Into<String>) -> bool {
    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .get_mut(node)
      .map(|e| {
        e.tags.insert(tag.into());
      })
      .is_some()
  }

  /// Runs the connect handshake against every node, in parallel across
  /// distinct targets and serialized per target.
  ///
  /// Returns `Ok` iff every node ended up connected; otherwise the per-node
  /// failure list. Nodes that succeeded stay connected either way.
  pub(crate) async fn connect(&self, runtime: &Runtime, nodes: &[NodeId]) -> Result<(), Error> {
    let attempts = nodes.iter().map(|node| self.connect_one(runtime, node));
    let results = futures::future::join_all(attempts).await;

    let failures: Vec<ConnectFailure> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
      Ok(())
    } else {
      Err(Error::Connect(failures))
    }
  }

  async fn connect_one(&self, runtime: &Runtime, node: &NodeId) -> Result<(), ConnectFailure> {
    let lock = {
      let mut locks = self.handshakes.lock().await;
      locks.entry(node.clone()).or_default().clone()
    };
    let _guard = lock.lock().await;

    if self.is_member(node) {
      return Ok(());
    }

    let config = runtime.config();
    verify(
      runtime.peers(),
      node,
      NodeRole::Worker,
      &config.cookie,
      config.request_deadline,
    )
    .await
    .map_err(|e| match e {
      Error::NotAWorker(n) => ConnectFailure::NotAWorker(n),
      Error::WrongCookie(n) => ConnectFailure::WrongCookie(n),
      _ => ConnectFailure::NotConnected(node.clone()),
    })?;

    match runtime.register_on(node).await {
      Ok(true) => {}
      Ok(false) => return Err(ConnectFailure::AlreadyConnected(node.clone())),
      Err(_) => return Err(ConnectFailure::NotConnected(node.clone())),
    }

    let monitor = tokio::spawn(monitor_node(runtime.clone(), node.clone()));
    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(
        node.clone(),
        NodeEntry {
          tags: BTreeSet::new(),
          monitor,
          connected_at: chrono::Utc::now(),
        },
      );
    tracing::info!(node = %node, "worker joined");
    self.notify(&self.joins, MemberEvent::Join(node.clone())).await;
    Ok(())
  }

  /// Removes `node` from the cluster and notifies leave subscribers.
  pub(crate) async fn disconnect(&self, runtime: &Runtime, node: &NodeId) -> Result<(), Error> {
    let entry = self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(node)
      .ok_or_else(|| Error::NotConnected(node.clone()))?;
    entry.monitor.abort();

    // best-effort release; the worker also notices via its own monitor
    if let Err(e) = runtime.release_on(node).await {
      tracing::debug!(node = %node, error = %e, "remove_master failed");
    }
    runtime.peers().drop_peer(node).await;

    tracing::info!(node = %node, uptime = %format_uptime(entry.connected_at), "worker removed");
    self
      .notify(&self.leaves, MemberEvent::Leave(node.clone(), LeaveReason::Removed))
      .await;
    Ok(())
  }

  /// Monitor verdict: the node stopped answering. Runs on the monitor task
  /// itself, which exits right after, so the handle is dropped, not aborted.
  pub(crate) async fn node_down(&self, runtime: &Runtime, node: &NodeId) {
    let removed = self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(node);
    let Some(_entry) = removed else {
      return;
    };
    runtime.peers().drop_peer(node).await;

    tracing::warn!(node = %node, "worker lost");
    self
      .notify(&self.leaves, MemberEvent::Leave(node.clone(), LeaveReason::Down))
      .await;
  }

  pub fn subscribe_join(&self, policy: SubscriptionPolicy) -> (SubscriptionId, MemberEvents) {
    Self::subscribe(&self.joins, &self.next_subscription, policy)
  }

  pub fn subscribe_leave(&self, policy: SubscriptionPolicy) -> (SubscriptionId, MemberEvents) {
    Self::subscribe(&self.leaves, &self.next_subscription, policy)
  }

  pub fn unsubscribe_join(&self, id: SubscriptionId) {
    self.joins.lock().unwrap_or_else(|e| e.into_inner()).remove(&id.0);
  }

  pub fn unsubscribe_leave(&self, id: SubscriptionId) {
    self.leaves.lock().unwrap_or_else(|e| e.into_inner()).remove(&id.0);
  }

  fn subscribe(
    subscribers: &Mutex<HashMap<u64, Subscriber>>,
    counter: &AtomicU64,
    policy: SubscriptionPolicy,
  ) -> (SubscriptionId, MemberEvents) {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    let id = counter.fetch_add(1, Ordering::Relaxed);
    subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, Subscriber { tx, policy });
    (SubscriptionId(id), MemberEvents { rx })
  }

  /// Delivers `event` to every subscriber, honoring its policy. Events reach
  /// each subscriber in notification order.
  async fn notify(&self, subscribers: &Mutex<HashMap<u64, Subscriber>>, event: MemberEvent) {
    let targets: Vec<(u64, mpsc::Sender<MemberEvent>, SubscriptionPolicy)> = subscribers
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(id, s)| (*id, s.tx.clone(), s.policy))
      .collect();

    let mut closed = Vec::new();
    for (id, tx, policy) in targets {
      match policy {
        SubscriptionPolicy::Block => {
          if tx.send(event.clone()).await.is_err() {
            closed.push(id);
          }
        }
        SubscriptionPolicy::Lossy => match tx.try_send(event.clone()) {
          Ok(()) => {}
          Err(mpsc::error::TrySendError::Full(ev)) => {
            tracing::warn!(event = ?ev, subscriber = id, "subscriber lagging; event dropped");
          }
          Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
        },
      }
    }
    if !closed.is_empty() {
      let mut subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
      for id in closed {
        subscribers.remove(&id);
      }
    }
  }
}

fn format_uptime(connected_at: chrono::DateTime<chrono::Utc>) -> String {
  let elapsed = chrono::Utc::now().signed_duration_since(connected_at);
  format!("{}s", elapsed.num_seconds().max(0))
}

/// Heartbeats one worker until it misses the budget, then reports it down.
async fn monitor_node(runtime: Runtime, node: NodeId) {
  let config = runtime.config();
  let mut ticker = tokio::time::interval(config.heartbeat_interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker.tick().await; // first tick fires immediately

  let mut misses = 0u32;
  loop {
    ticker.tick().await;
    let ping = verify(
      runtime.peers(),
      &node,
      NodeRole::Worker,
      &config.cookie,
      config.request_deadline,
    )
    .await;
    match ping {
      Ok(()) => misses = 0,
      Err(e) => {
        misses += 1;
        tracing::debug!(node = %node, misses, error = %e, "heartbeat miss");
        if misses >= config.heartbeat_misses {
          break;
        }
      }
    }
  }
  runtime.membership().node_down(&runtime, &node).await;
}

/// Worker-side master registration: at most one master at a time.
pub struct MasterLink {
  current: Mutex<Option<NodeId>>,
  monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MasterLink {
  pub(crate) fn new() -> Self {
    Self {
      current: Mutex::new(None),
      monitor: Mutex::new(None),
    }
  }

  pub fn current(&self) -> Option<NodeId> {
    self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Accepts `master` unless a different master is already registered.
  /// Re-registering the same master is idempotent.
  pub(crate) fn register(&self, runtime: &Runtime, master: NodeId) -> Result<(), NodeId> {
    let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
    match current.as_ref() {
      None => {
        tracing::info!(master = %master, "master registered");
        *current = Some(master.clone());
        let handle = tokio::spawn(monitor_master(runtime.clone(), master));
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = monitor.replace(handle) {
          old.abort();
        }
        Ok(())
      }
      Some(existing) if *existing == master => Ok(()),
      Some(existing) => Err(existing.clone()),
    }
  }

  /// Releases the registration if held by `master`.
  pub(crate) fn remove(&self, master: &NodeId) {
    let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
    if current.as_ref() == Some(master) {
      *current = None;
      tracing::info!(master = %master, "master removed");
      if let Some(handle) = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
        handle.abort();
      }
    }
  }

  fn clear_after_loss(&self) -> Option<NodeId> {
    let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
    current.take()
  }
}

/// Worker-side monitor of the registered master.
async fn monitor_master(runtime: Runtime, master: NodeId) {
  let config = runtime.config();
  let mut ticker = tokio::time::interval(config.heartbeat_interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker.tick().await;

  let mut misses = 0u32;
  loop {
    ticker.tick().await;
    let ping = verify(
      runtime.peers(),
      &master,
      NodeRole::Master,
      &config.cookie,
      config.request_deadline,
    )
    .await;
    match ping {
      Ok(()) => misses = 0,
      Err(_) => {
        misses += 1;
        if misses >= config.heartbeat_misses {
          break;
        }
      }
    }
  }

  if let Some(lost) = runtime.master_link().clear_after_loss() {
    tracing::warn!(master = %lost, "master lost");
    if runtime.config().shutdown_with_master {
      runtime.trigger_shutdown();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn node(i: u16) -> NodeId {
    NodeId::parse(&format!("n{}@127.0.0.1:{}", i, 9000 + i)).unwrap()
  }

  #[tokio::test]
  async fn subscribers_see_events_in_order() {
    let membership = Membership::new();
    let (_id, mut events) = membership.subscribe_join(SubscriptionPolicy::Block);

    membership
      .notify(&membership.joins, MemberEvent::Join(node(1)))
      .await;
    membership
      .notify(&membership.joins, MemberEvent::Join(node(2)))
      .await;

    assert_eq!(events.recv().await, Some(MemberEvent::Join(node(1))));
    assert_eq!(events.recv().await, Some(MemberEvent::Join(node(2))));
  }

  #[tokio::test]
  async fn lossy_subscriber_drops_when_full() {
    let membership = Membership::new();
    let (_id, mut events) = membership.subscribe_leave(SubscriptionPolicy::Lossy);

    for i in 0..(SUBSCRIBER_QUEUE + 10) {
      membership
        .notify(
          &membership.leaves,
          MemberEvent::Leave(node(i as u16), LeaveReason::Down),
        )
        .await;
    }

    // queue holds at most SUBSCRIBER_QUEUE events; the rest were dropped
    let mut seen = 0;
    while events.try_recv().is_some() {
      seen += 1;
    }
    assert_eq!(seen, SUBSCRIBER_QUEUE);
  }

  #[tokio::test]
  async fn unsubscribed_receivers_get_nothing_more() {
    let membership = Membership::new();
    let (id, mut events) = membership.subscribe_join(SubscriptionPolicy::Block);
    membership.unsubscribe_join(id);

    membership
      .notify(&membership.joins, MemberEvent::Join(node(1)))
      .await;
    assert_eq!(events.try_recv(), None);
  }

  #[test]
  fn member_listing_is_sorted_and_tagged() {
    let membership = Membership::new();
    assert!(membership.members().is_empty());
    assert!(!membership.tag(&node(1), "gpu"));
    assert_eq!(membership.tags(&node(1)), None);
  }
}
