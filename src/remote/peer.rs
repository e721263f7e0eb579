//! Multiplexed peer connections.
//!
//! One connection is kept per remote node: a writer task drains an outbound
//! queue (preserving send order per peer) and a reader task resolves replies
//! against pending requests by correlation id. A dead peer fails all pending
//! requests and is dropped from the map; the next request reconnects.

use crate::error::Error;
use crate::remote::connection::{read_frame, write_frame, Connection};
use crate::remote::protocol::{Reply, Request};
use crate::remote::NodeId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// A live connection to one remote node.
pub struct Peer {
  node: NodeId,
  tx: mpsc::Sender<Vec<u8>>,
  pending: Pending,
  next_id: AtomicU64,
  alive: Arc<AtomicBool>,
}

impl Peer {
  /// Opens a connection and starts the reader/writer tasks.
  pub async fn connect(node: NodeId, connect_deadline: Duration) -> Result<Arc<Peer>, Error> {
    let conn = Connection::connect(node.addr, connect_deadline)
      .await
      .map_err(|_| Error::NotConnected(node.clone()))?;
    let (mut read, mut write) = conn.into_split();

    let (tx, mut outbound) = mpsc::channel::<Vec<u8>>(64);
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let alive = Arc::new(AtomicBool::new(true));

    let writer_alive = alive.clone();
    let writer_node = node.clone();
    tokio::spawn(async move {
      while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut write, &frame).await {
          tracing::debug!(node = %writer_node, error = %e, "peer write failed");
          writer_alive.store(false, Ordering::SeqCst);
          break;
        }
      }
    });

    let reader_pending = pending.clone();
    let reader_alive = alive.clone();
    let reader_node = node.clone();
    tokio::spawn(async move {
      loop {
        let frame = match read_frame(&mut read).await {
          Ok(frame) => frame,
          Err(e) => {
            tracing::debug!(node = %reader_node, error = %e, "peer connection lost");
            break;
          }
        };
        let reply: Reply = match serde_json::from_slice(&frame) {
          Ok(reply) => reply,
          Err(e) => {
            tracing::warn!(node = %reader_node, error = %e, "undecodable reply frame");
            break;
          }
        };
        let waiter = reader_pending
          .lock()
          .unwrap_or_else(|e| e.into_inner())
          .remove(&reply.id);
        if let Some(waiter) = waiter {
          let _ = waiter.send(reply.outcome);
        }
      }
      reader_alive.store(false, Ordering::SeqCst);
      let waiters: Vec<_> = reader_pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();
      for (_, waiter) in waiters {
        let _ = waiter.send(Err("peer connection lost".to_string()));
      }
    });

    Ok(Arc::new(Peer {
      node,
      tx,
      pending,
      next_id: AtomicU64::new(1),
      alive,
    }))
  }

  pub fn node(&self) -> &NodeId {
    &self.node
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::SeqCst)
  }

  /// Sends a tagged request and awaits its reply, bounded by `deadline`.
  pub async fn request(
    &self,
    tag: &str,
    payload: Value,
    deadline: Duration,
  ) -> Result<Value, Error> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .insert(id, reply_tx);

    let request = Request {
      id,
      tag: tag.to_string(),
      payload,
    };
    let frame = match serde_json::to_vec(&request) {
      Ok(frame) => frame,
      Err(e) => {
        self.forget(id);
        return Err(Error::Serialization(e.to_string()));
      }
    };
    if self.tx.send(frame).await.is_err() {
      self.forget(id);
      return Err(Error::NotConnected(self.node.clone()));
    }

    match timeout(deadline, reply_rx).await {
      Err(_) => {
        self.forget(id);
        Err(Error::Timeout(self.node.clone()))
      }
      Ok(Err(_)) => Err(Error::NotConnected(self.node.clone())),
      Ok(Ok(Ok(value))) => Ok(value),
      Ok(Ok(Err(message))) => Err(Error::Transport(format!(
        "remote error from {}: {}",
        self.node, message
      ))),
    }
  }

  fn forget(&self, id: u64) {
    self
      .pending
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&id);
  }
}

/// Lazily connected peer directory.
pub struct PeerMap {
  peers: tokio::sync::Mutex<HashMap<NodeId, Arc<Peer>>>,
  connect_deadline: Duration,
}

impl PeerMap {
  pub fn new(connect_deadline: Duration) -> Self {
    Self {
      peers: tokio::sync::Mutex::new(HashMap::new()),
      connect_deadline,
    }
  }

  /// Returns the live peer for `node`, reconnecting if needed.
  pub async fn get(&self, node: &NodeId) -> Result<Arc<Peer>, Error> {
    let mut peers = self.peers.lock().await;
    if let Some(peer) = peers.get(node) {
      if peer.is_alive() {
        return Ok(peer.clone());
      }
      peers.remove(node);
    }
    let peer = Peer::connect(node.clone(), self.connect_deadline).await?;
    peers.insert(node.clone(), peer.clone());
    Ok(peer)
  }

  /// Forgets the peer; the next request reconnects.
  pub async fn drop_peer(&self, node: &NodeId) {
    self.peers.lock().await.remove(node);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::protocol::Reply;
  use serde_json::json;
  use tokio::net::TcpListener;

  /// Minimal echo server speaking the envelope protocol.
  async fn echo_server(listener: TcpListener) {
    loop {
      let Ok((stream, peer)) = listener.accept().await else {
        return;
      };
      tokio::spawn(async move {
        let conn = Connection::from_stream(stream, peer);
        let (mut read, mut write) = conn.into_split();
        while let Ok(frame) = read_frame(&mut read).await {
          let request: Request = serde_json::from_slice(&frame).unwrap();
          let reply = Reply {
            id: request.id,
            outcome: Ok(request.payload),
          };
          let bytes = serde_json::to_vec(&reply).unwrap();
          if write_frame(&mut write, &bytes).await.is_err() {
            break;
          }
        }
      });
    }
  }

  #[tokio::test]
  async fn request_reply_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(echo_server(listener));

    let node = NodeId::new("echo", addr);
    let peer = Peer::connect(node, Duration::from_secs(1)).await.unwrap();
    let value = peer
      .request("anything", json!({"x": 1}), Duration::from_secs(1))
      .await
      .unwrap();
    assert_eq!(value, json!({"x": 1}));
  }

  #[tokio::test]
  async fn concurrent_requests_multiplex() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(echo_server(listener));

    let peer = Peer::connect(NodeId::new("echo", addr), Duration::from_secs(1))
      .await
      .unwrap();
    let mut handles = Vec::new();
    for i in 0..16 {
      let peer = peer.clone();
      handles.push(tokio::spawn(async move {
        peer
          .request("t", json!(i), Duration::from_secs(1))
          .await
          .unwrap()
      }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
      assert_eq!(handle.await.unwrap(), json!(i));
    }
  }

  #[tokio::test]
  async fn unreachable_peer_reports_not_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let node = NodeId::new("ghost", addr);
    let result = Peer::connect(node.clone(), Duration::from_millis(200)).await;
    assert!(matches!(result, Err(Error::NotConnected(n)) if n == node));
  }
}
