//! Node-to-node messaging: framed transport, beacon handshake, handler
//! dispatch, typed requests, task broker, and worker selection.
//!
//! The wire format is length-prefixed JSON frames over TCP. Every request
//! carries a `(tag, payload)` pair; handlers are registered per tag. One
//! multiplexed connection is kept per peer so that request order is preserved
//! per sender→receiver pair.

pub mod balancer;
pub mod beacon;
pub mod connection;
pub mod dispatcher;
pub mod peer;
pub mod protocol;
pub mod task;

pub use balancer::LoadBalancer;
pub use beacon::verify;
pub use connection::Connection;
pub use dispatcher::{Dispatcher, Handler};
pub use peer::{Peer, PeerMap};
pub use protocol::{tags, Reply, Request, Verify, VerifyAck};
pub use task::{RemoteTask, TaskRegistry};

use crate::error::{DefinitionError, Error};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Network identity of a cluster node: symbolic name plus address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
  pub name: String,
  pub addr: SocketAddr,
}

impl NodeId {
  pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
    Self {
      name: name.into(),
      addr,
    }
  }

  /// Parses the `name@host:port` form used in configuration.
  pub fn parse(s: &str) -> Result<Self, Error> {
    let (name, addr) = s.split_once('@').ok_or_else(|| DefinitionError::InvalidConfig {
      name: "node identity".to_string(),
      reason: format!("`{}` is not of the form name@host:port", s),
    })?;
    let addr: SocketAddr = addr.parse().map_err(|e| DefinitionError::InvalidConfig {
      name: "node identity".to_string(),
      reason: format!("bad address in `{}`: {}", s, e),
    })?;
    if name.is_empty() {
      return Err(
        DefinitionError::InvalidConfig {
          name: "node identity".to_string(),
          reason: format!("empty node name in `{}`", s),
        }
        .into(),
      );
    }
    Ok(NodeId::new(name, addr))
  }
}

impl std::fmt::Display for NodeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}@{}", self.name, self.addr)
  }
}

/// Role a node answers with during the beacon handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
  Master,
  Worker,
}

impl std::fmt::Display for NodeRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      NodeRole::Master => write!(f, "master"),
      NodeRole::Worker => write!(f, "worker"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn node_id_parse_round_trip() {
    let id = NodeId::parse("w1@127.0.0.1:7700").unwrap();
    assert_eq!(id.name, "w1");
    assert_eq!(id.addr.port(), 7700);
    assert_eq!(NodeId::parse(&id.to_string()).unwrap(), id);
  }

  #[test]
  fn node_id_parse_rejects_garbage() {
    assert!(NodeId::parse("no-at-sign").is_err());
    assert!(NodeId::parse("@127.0.0.1:1").is_err());
    assert!(NodeId::parse("w@nonsense").is_err());
  }

  #[test]
  fn role_serializes_lowercase() {
    assert_eq!(serde_json::to_string(&NodeRole::Worker).unwrap(), "\"worker\"");
  }
}
