//! Node configuration, environment-driven.
//!
//! Every knob can be set programmatically (tests do) or read from the
//! environment via [`Config::from_env`]:
//!
//! | variable | meaning |
//! |---|---|
//! | `MESHWEAVE_NODE_NAME` | node name override |
//! | `MESHWEAVE_BIND` | listen address (`host:port`) enabling distribution |
//! | `MESHWEAVE_COOKIE` | shared handshake secret |
//! | `MESHWEAVE_WORKERS` | space-separated worker identities a master connects at start |
//! | `MESHWEAVE_MASTER` | master identity a worker contacts at start |
//! | `MESHWEAVE_SHUTDOWN_WITH_MASTER` | worker terminates on master loss |

use crate::error::{DefinitionError, Error};
use crate::remote::NodeId;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for one node.
#[derive(Clone, Debug)]
pub struct Config {
  /// Node name; defaults to the role name when unset.
  pub node_name: Option<String>,
  /// Listen address. `None` means no transport (local-only runtime).
  pub bind: Option<SocketAddr>,
  /// Shared secret exchanged in the beacon handshake.
  pub cookie: String,
  /// Worker identities a master connects to at start.
  pub workers: Vec<NodeId>,
  /// Master identity a worker announces itself to at start.
  pub master: Option<NodeId>,
  /// Terminate the worker when its master is lost.
  pub shutdown_with_master: bool,
  /// Deadline applied to every remote call.
  pub request_deadline: Duration,
  /// Liveness probe interval.
  pub heartbeat_interval: Duration,
  /// Consecutive misses before a node counts as down.
  pub heartbeat_misses: u32,
  /// Bounded mailbox size per worker; sends block when full.
  pub mailbox_capacity: usize,
  /// Worker restarts allowed within `restart_interval` before escalation.
  pub max_restarts: u32,
  /// Window for the restart budget.
  pub restart_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      node_name: None,
      bind: None,
      cookie: "meshweave".to_string(),
      workers: Vec::new(),
      master: None,
      shutdown_with_master: false,
      request_deadline: Duration::from_secs(5),
      heartbeat_interval: Duration::from_secs(2),
      heartbeat_misses: 3,
      mailbox_capacity: 128,
      max_restarts: 3,
      restart_interval: Duration::from_secs(10),
    }
  }
}

impl Config {
  /// Reads the environment, falling back to defaults for unset variables.
  pub fn from_env() -> Result<Self, Error> {
    let mut config = Config::default();

    if let Some(name) = env_var("MESHWEAVE_NODE_NAME") {
      config.node_name = Some(name);
    }
    if let Some(bind) = env_var("MESHWEAVE_BIND") {
      config.bind = Some(bind.parse().map_err(|e| DefinitionError::InvalidConfig {
        name: "MESHWEAVE_BIND".to_string(),
        reason: format!("{}", e),
      })?);
    }
    if let Some(cookie) = env_var("MESHWEAVE_COOKIE") {
      config.cookie = cookie;
    }
    if let Some(workers) = env_var("MESHWEAVE_WORKERS") {
      config.workers = parse_node_list(&workers)?;
    }
    if let Some(master) = env_var("MESHWEAVE_MASTER") {
      config.master = Some(NodeId::parse(&master)?);
    }
    if let Some(flag) = env_var("MESHWEAVE_SHUTDOWN_WITH_MASTER") {
      config.shutdown_with_master = parse_bool("MESHWEAVE_SHUTDOWN_WITH_MASTER", &flag)?;
    }

    Ok(config)
  }

  pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
    self.cookie = cookie.into();
    self
  }

  pub fn with_bind(mut self, bind: SocketAddr) -> Self {
    self.bind = Some(bind);
    self
  }

  pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
    self.node_name = Some(name.into());
    self
  }

  pub fn with_workers(mut self, workers: Vec<NodeId>) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_shutdown_with_master(mut self, flag: bool) -> Self {
    self.shutdown_with_master = flag;
    self
  }
}

fn env_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parses the space-separated `name@host:port` list of `MESHWEAVE_WORKERS`.
pub fn parse_node_list(raw: &str) -> Result<Vec<NodeId>, Error> {
  raw
    .split_whitespace()
    .map(NodeId::parse)
    .collect::<Result<Vec<_>, _>>()
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, Error> {
  match raw.to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    other => Err(
      DefinitionError::InvalidConfig {
        name: name.to_string(),
        reason: format!("`{}` is not a boolean", other),
      }
      .into(),
    ),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn node_list_parses_in_order() {
    let nodes = parse_node_list("a@127.0.0.1:7001  b@127.0.0.1:7002").unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].name, "a");
    assert_eq!(nodes[1].addr.port(), 7002);
  }

  #[test]
  fn node_list_rejects_malformed_entries() {
    let err = parse_node_list("a@127.0.0.1:7001 oops").unwrap_err();
    assert!(matches!(
      err,
      Error::Definition(DefinitionError::InvalidConfig { .. })
    ));
  }

  #[test]
  fn bool_parsing_accepts_common_spellings() {
    assert!(parse_bool("X", "true").unwrap());
    assert!(parse_bool("X", "1").unwrap());
    assert!(!parse_bool("X", "off").unwrap());
    assert!(parse_bool("X", "maybe").is_err());
  }

  #[test]
  fn defaults_are_sane() {
    let config = Config::default();
    assert!(config.bind.is_none());
    assert!(config.workers.is_empty());
    assert!(!config.shutdown_with_master);
    assert!(config.mailbox_capacity > 0);
  }
}
