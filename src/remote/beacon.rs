//! Beacon handshake: role and cookie verification.
//!
//! Every node answers `verify` with its name, role, and whether the caller's
//! cookie matched. [`verify`] performs the round trip and maps the answer to
//! the membership error kinds. Liveness monitors reuse the same request as a
//! heartbeat.

use crate::error::Error;
use crate::remote::protocol::{decode, encode, tags, Verify, VerifyAck};
use crate::remote::{NodeId, NodeRole, PeerMap};
use std::time::Duration;

/// Checks that `node` is reachable, shares our cookie, and plays `expected`.
///
/// Failure modes: [`Error::NotConnected`] when the node cannot be reached or
/// does not answer in time, [`Error::WrongCookie`] on a cookie mismatch, and
/// [`Error::NotAWorker`] when the role differs from `expected`.
pub async fn verify(
  peers: &PeerMap,
  node: &NodeId,
  expected: NodeRole,
  cookie: &str,
  deadline: Duration,
) -> Result<(), Error> {
  let peer = peers.get(node).await?;
  let payload = encode(&Verify {
    cookie: cookie.to_string(),
  })?;
  let answer = peer
    .request(tags::VERIFY, payload, deadline)
    .await
    .map_err(|e| match e {
      Error::Timeout(_) => Error::NotConnected(node.clone()),
      other => other,
    })?;
  let ack: VerifyAck = decode(answer)?;

  if !ack.cookie_ok {
    return Err(Error::WrongCookie(node.clone()));
  }
  if ack.role != expected {
    return Err(Error::NotAWorker(node.clone()));
  }
  Ok(())
}
