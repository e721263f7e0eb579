//! Wire protocol: request/reply envelopes and typed payloads.
//!
//! Every frame is a JSON-encoded [`Request`] or [`Reply`]. Requests are
//! tagged; the dispatcher routes on the tag and handlers decode the payload
//! into the typed structs below. Compatibility is only required among nodes
//! built from the same release.

use crate::component::FieldsState;
use crate::deployment::{DeploymentId, InstanceSpec, Route};
use crate::remote::{NodeId, NodeRole};
use crate::worker::WorkerRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The request tags understood by every node.
pub mod tags {
  /// Beacon handshake: role and cookie exchange.
  pub const VERIFY: &str = "verify";
  /// Master asks a worker to accept it as its master.
  pub const REGISTER_MASTER: &str = "register_master";
  /// Master releases a worker.
  pub const REMOVE_MASTER: &str = "remove_master";
  /// Spawn a worker process for a deployed component instance.
  pub const SPAWN_WORKER: &str = "spawn_worker";
  /// Deliver a message to a worker's mailbox.
  pub const SEND_TO_WORKER: &str = "send_to_worker";
  /// Run a registered task and return its value.
  pub const TASK_INVOKE: &str = "task_invoke";
  /// Install a deployment's instance table on a node.
  pub const INSTALL_DEPLOYMENT: &str = "install_deployment";
  /// Install or replace a deployment's routing table on a node.
  pub const INSTALL_ROUTING: &str = "install_routing";
  /// Tear a deployment down on a node.
  pub const DROP_DEPLOYMENT: &str = "drop_deployment";
}

/// A request envelope. `id` correlates the reply on the same connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  pub id: u64,
  pub tag: String,
  pub payload: Value,
}

/// A reply envelope; `outcome` is the handler's value or its error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
  pub id: u64,
  pub outcome: Result<Value, String>,
}

/// Beacon request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verify {
  pub cookie: String,
}

/// Beacon answer: who the node is and what it believes the cookie to be.
///
/// The cookie is echoed rather than judged so that the caller can distinguish
/// `wrong_cookie` from `wrong_role` in one round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAck {
  pub name: String,
  pub role: NodeRole,
  pub cookie_ok: bool,
}

/// `register_master` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMaster {
  pub master: NodeId,
}

/// `register_master` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RegisterOutcome {
  Registered,
  AlreadyConnected { current: NodeId },
}

/// `remove_master` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMaster {
  pub master: NodeId,
}

/// `spawn_worker` payload. The target node resolves the instance from its
/// installed deployment table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnWorker {
  pub deployment: DeploymentId,
  pub instance: String,
  pub tag: String,
  pub state: FieldsState,
}

/// `spawn_worker` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedWorker {
  pub worker: WorkerRef,
}

/// `send_to_worker` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendToWorker {
  pub worker: WorkerRef,
  pub message: Value,
}

/// `task_invoke` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInvoke {
  pub task: String,
  pub args: Value,
}

/// `install_deployment` payload: the instance table, by registry name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallDeployment {
  pub deployment: DeploymentId,
  pub instances: Vec<InstanceSpec>,
}

/// `install_routing` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRouting {
  pub deployment: DeploymentId,
  pub routes: Vec<Route>,
  /// Per-instance deployment data produced by the `deploy` hooks.
  pub deployments: Vec<(String, crate::deployment::InstanceDeployment)>,
}

/// `drop_deployment` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropDeployment {
  pub deployment: DeploymentId,
}

/// Encodes a typed payload into the envelope value.
pub fn encode<T: Serialize>(payload: &T) -> Result<Value, crate::error::Error> {
  Ok(serde_json::to_value(payload)?)
}

/// Decodes an envelope value into a typed payload.
pub fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, crate::error::Error> {
  Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_envelope_round_trip() {
    let request = Request {
      id: 7,
      tag: tags::VERIFY.to_string(),
      payload: encode(&Verify {
        cookie: "secret".to_string(),
      })
      .unwrap(),
    };
    let bytes = serde_json::to_vec(&request).unwrap();
    let back: Request = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(back.id, 7);
    assert_eq!(back.tag, "verify");
    let verify: Verify = decode(back.payload).unwrap();
    assert_eq!(verify.cookie, "secret");
  }

  #[test]
  fn register_outcome_tags_variants() {
    let json = serde_json::to_value(&RegisterOutcome::Registered).unwrap();
    assert_eq!(json["result"], "registered");

    let master = NodeId::parse("m@127.0.0.1:1").unwrap();
    let json = serde_json::to_value(&RegisterOutcome::AlreadyConnected { current: master }).unwrap();
    assert_eq!(json["result"], "already_connected");
  }

  #[test]
  fn reply_outcome_serializes_both_arms() {
    let ok = Reply {
      id: 1,
      outcome: Ok(Value::Null),
    };
    let err = Reply {
      id: 2,
      outcome: Err("nope".to_string()),
    };
    let ok_json = serde_json::to_string(&ok).unwrap();
    let err_json = serde_json::to_string(&err).unwrap();
    let ok_back: Reply = serde_json::from_str(&ok_json).unwrap();
    let err_back: Reply = serde_json::from_str(&err_json).unwrap();
    assert!(ok_back.outcome.is_ok());
    assert_eq!(err_back.outcome.unwrap_err(), "nope");
  }
}
