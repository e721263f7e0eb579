//! Worker node selection.
//!
//! Two policies: `permanent` gives a stable node for a key (workers holding
//! persistent state keep landing on the same node while the member set is
//! unchanged), `transient` round-robins over the currently alive members.

use crate::remote::NodeId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Node selector shared by all deployments on one runtime.
pub struct LoadBalancer {
  next: AtomicUsize,
}

impl LoadBalancer {
  pub fn new() -> Self {
    // random start so restarted masters do not all hammer the first worker
    Self {
      next: AtomicUsize::new(rand::random::<usize>()),
    }
  }

  /// Stable choice: same key and member set give the same node.
  pub fn select_permanent(&self, key: &str, members: &[NodeId]) -> Option<NodeId> {
    if members.is_empty() {
      return None;
    }
    let mut sorted: Vec<&NodeId> = members.iter().collect();
    sorted.sort();
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let index = (hasher.finish() as usize) % sorted.len();
    Some(sorted[index].clone())
  }

  /// Round-robin over the given members.
  pub fn select_transient(&self, members: &[NodeId]) -> Option<NodeId> {
    if members.is_empty() {
      return None;
    }
    let index = self.next.fetch_add(1, Ordering::Relaxed) % members.len();
    Some(members[index].clone())
  }
}

impl Default for LoadBalancer {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn members(n: usize) -> Vec<NodeId> {
    (0..n)
      .map(|i| NodeId::parse(&format!("w{}@127.0.0.1:{}", i, 7000 + i)).unwrap())
      .collect()
  }

  #[test]
  fn permanent_is_stable_per_key() {
    let balancer = LoadBalancer::new();
    let nodes = members(5);
    let first = balancer.select_permanent("user-42", &nodes).unwrap();
    for _ in 0..10 {
      assert_eq!(balancer.select_permanent("user-42", &nodes).unwrap(), first);
    }
    // member order must not matter
    let mut shuffled = nodes.clone();
    shuffled.reverse();
    assert_eq!(balancer.select_permanent("user-42", &shuffled).unwrap(), first);
  }

  #[test]
  fn transient_cycles_through_members() {
    let balancer = LoadBalancer::new();
    let nodes = members(3);
    let picks: Vec<NodeId> = (0..6).map(|_| balancer.select_transient(&nodes).unwrap()).collect();
    // every member shows up within one full cycle
    for node in &nodes {
      assert!(picks.contains(node));
    }
    // consecutive full cycles repeat the same order
    assert_eq!(picks[0], picks[3]);
    assert_eq!(picks[1], picks[4]);
  }

  #[test]
  fn empty_member_set_yields_none() {
    let balancer = LoadBalancer::new();
    assert!(balancer.select_permanent("k", &[]).is_none());
    assert!(balancer.select_transient(&[]).is_none());
  }
}
