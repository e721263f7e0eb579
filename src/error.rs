//! Crate-wide error types.
//!
//! Errors are grouped by kind rather than by module: definition errors are
//! raised while descriptions are being built (before anything is deployed),
//! membership and transport errors carry the node they concern, and runtime
//! callback failures are delivered as error-tagged results so the owning
//! strategy can decide what to do with them.

use crate::component::CallbackFailure;
use crate::remote::NodeId;
use crate::strategy::Hook;
use crate::worker::WorkerRef;
use thiserror::Error;

/// An invalid component or workflow description, reported at build time.
///
/// Every variant carries enough position information (node id, port, link
/// index) to point at the offending part of the description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
  /// A component declared the same field twice.
  #[error("component {component}: duplicate field `{field}`")]
  DuplicateField { component: String, field: String },

  /// A component declared the same port twice on one side.
  #[error("component {component}: duplicate port `{port}`")]
  DuplicatePort { component: String, port: String },

  /// Components must have at least one in-port.
  #[error("component {component}: no in-ports declared")]
  NoInPorts { component: String },

  /// A callback read or write set references an undeclared field.
  #[error("component {component}, callback {callback}: unknown field `{field}`")]
  UnknownField {
    component: String,
    callback: String,
    field: String,
  },

  /// A callback publish set references a port outside `out_ports`.
  #[error("component {component}, callback {callback}: `{port}` is not an out-port")]
  UnknownPublishPort {
    component: String,
    callback: String,
    port: String,
  },

  /// Two workflow nodes share an id.
  #[error("workflow: duplicate node id `{node}`")]
  DuplicateNode { node: String },

  /// A link endpoint references a node that does not exist.
  #[error("workflow link {link}: unknown node `{node}`")]
  UnknownNode { link: usize, node: String },

  /// A link endpoint references a port that does not exist on its node
  /// (or on the workflow boundary).
  #[error("workflow link {link}: `{node}` has no {side} port `{port}`")]
  UnknownPort {
    link: usize,
    node: String,
    port: String,
    side: PortSide,
  },

  /// Two links target the same in-port of the same node.
  #[error("workflow: duplicate destination ({node}, {port})")]
  DuplicateDestination { node: String, port: String },

  /// The flattened graph contains a cycle spanning more than one node.
  #[error("workflow: cycle through nodes {nodes:?}")]
  Cycle { nodes: Vec<String> },

  /// Cross-node deployment requires registered (named) definitions.
  #[error("node `{node}` uses an unnamed {kind}; cluster deployment resolves definitions by registry name")]
  Unregistered { node: String, kind: String },

  /// A configuration value could not be parsed.
  #[error("configuration `{name}`: {reason}")]
  InvalidConfig { name: String, reason: String },
}

/// Which side of a node a port was looked up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
  In,
  Out,
}

impl std::fmt::Display for PortSide {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      PortSide::In => write!(f, "in"),
      PortSide::Out => write!(f, "out"),
    }
  }
}

/// One failed target of a [`connect`](crate::Runtime::connect) call.
///
/// `connect` keeps going after individual failures and reports them all at
/// once; each entry names the node and what went wrong with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
  /// The node could not be reached at all.
  NotConnected(NodeId),
  /// The node answered the handshake but is not a worker.
  NotAWorker(NodeId),
  /// The node rejected our cookie.
  WrongCookie(NodeId),
  /// The node already has a master registered.
  AlreadyConnected(NodeId),
}

impl ConnectFailure {
  /// The node this failure concerns.
  pub fn node(&self) -> &NodeId {
    match self {
      ConnectFailure::NotConnected(n)
      | ConnectFailure::NotAWorker(n)
      | ConnectFailure::WrongCookie(n)
      | ConnectFailure::AlreadyConnected(n) => n,
    }
  }
}

impl std::fmt::Display for ConnectFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectFailure::NotConnected(n) => write!(f, "not_connected: {}", n),
      ConnectFailure::NotAWorker(n) => write!(f, "not_a_worker: {}", n),
      ConnectFailure::WrongCookie(n) => write!(f, "wrong_cookie: {}", n),
      ConnectFailure::AlreadyConnected(n) => write!(f, "already_connected: {}", n),
    }
  }
}

/// Top-level error type for runtime operations.
#[derive(Debug, Error)]
pub enum Error {
  /// Invalid component or workflow description.
  #[error("definition error: {0}")]
  Definition(#[from] DefinitionError),

  /// Registry lookup failed.
  #[error("unknown name: {0}")]
  UnknownName(String),

  /// A component has no callback under the requested name.
  #[error("component {component} has no callback `{callback}`")]
  NoSuchCallback {
    component: String,
    callback: String,
  },

  /// A deployed component's strategy is missing a hook.
  #[error("strategy {strategy} is incomplete: missing hook `{hook}`")]
  StrategyIncomplete { strategy: String, hook: Hook },

  /// Distribution is not enabled on this node.
  #[error("this node has no cluster transport")]
  NotDistributed,

  /// A node could not be reached.
  #[error("node {0} could not be reached")]
  NotConnected(NodeId),

  /// The node already has a master registered.
  #[error("node {0} already has a master")]
  AlreadyConnected(NodeId),

  /// The node answered the handshake but is not a worker.
  #[error("node {0} is not a worker")]
  NotAWorker(NodeId),

  /// The node rejected our cookie.
  #[error("node {0} rejected the handshake cookie")]
  WrongCookie(NodeId),

  /// A remote call exceeded its deadline.
  #[error("request to node {0} timed out")]
  Timeout(NodeId),

  /// A worker process crashed.
  #[error("worker {worker} crashed: {reason}")]
  WorkerCrash { worker: WorkerRef, reason: String },

  /// `connect` finished with at least one per-node failure.
  #[error("connect failed for {} node(s)", .0.len())]
  Connect(Vec<ConnectFailure>),

  /// A deployment failed part-way through; lists per-component outcomes.
  #[error("deployment partially failed ({} ok, {} failed)", succeeded.len(), failed.len())]
  DeploymentPartial {
    succeeded: Vec<String>,
    failed: Vec<(String, String)>,
  },

  /// A callback body failed and the failure escaped the owning strategy.
  #[error(transparent)]
  Callback(#[from] CallbackFailure),

  /// Low-level transport failure (socket, framing, peer loss).
  #[error("transport: {0}")]
  Transport(String),

  /// A value could not be encoded or decoded.
  #[error("serialization: {0}")]
  Serialization(String),
}

impl Error {
  /// Collapses the error into the wire form carried in reply envelopes.
  pub(crate) fn wire_message(&self) -> String {
    self.to_string()
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}
