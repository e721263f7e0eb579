//! Framed TCP connections: length-prefixed JSON messages.

use crate::error::Error;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Frames larger than this are treated as protocol corruption.
const MAX_FRAME: u32 = 8 * 1024 * 1024;

/// A framed connection to one remote node.
pub struct Connection {
  stream: TcpStream,
  remote_addr: SocketAddr,
}

impl Connection {
  /// Opens an outbound connection with a connect timeout.
  pub async fn connect(addr: SocketAddr, deadline: Duration) -> Result<Self, Error> {
    let stream = timeout(deadline, TcpStream::connect(addr))
      .await
      .map_err(|_| Error::Transport(format!("connect to {} timed out", addr)))?
      .map_err(|e| Error::Transport(format!("connect to {}: {}", addr, e)))?;
    stream
      .set_nodelay(true)
      .map_err(|e| Error::Transport(e.to_string()))?;
    Ok(Self {
      stream,
      remote_addr: addr,
    })
  }

  /// Wraps an accepted stream.
  pub fn from_stream(stream: TcpStream, remote_addr: SocketAddr) -> Self {
    let _ = stream.set_nodelay(true);
    Self {
      stream,
      remote_addr,
    }
  }

  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }

  /// Sends one message as a length-prefixed JSON frame.
  pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), Error> {
    let payload = serde_json::to_vec(message)?;
    write_frame(&mut self.stream, &payload).await
  }

  /// Receives one message, waiting at most `deadline`.
  pub async fn recv<T: DeserializeOwned>(&mut self, deadline: Duration) -> Result<T, Error> {
    let payload = timeout(deadline, read_frame(&mut self.stream))
      .await
      .map_err(|_| Error::Transport(format!("read from {} timed out", self.remote_addr)))??;
    Ok(serde_json::from_slice(&payload)?)
  }

  /// Splits into independently owned read and write halves.
  pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
    self.stream.into_split()
  }
}

/// Writes a `u32` length prefix followed by the payload.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), Error>
where
  W: AsyncWriteExt + Unpin,
{
  let len = payload.len() as u32;
  if len > MAX_FRAME {
    return Err(Error::Transport(format!("frame of {} bytes exceeds limit", len)));
  }
  writer
    .write_u32(len)
    .await
    .map_err(|e| Error::Transport(e.to_string()))?;
  writer
    .write_all(payload)
    .await
    .map_err(|e| Error::Transport(e.to_string()))?;
  writer
    .flush()
    .await
    .map_err(|e| Error::Transport(e.to_string()))?;
  Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<BytesMut, Error>
where
  R: AsyncReadExt + Unpin,
{
  let len = reader
    .read_u32()
    .await
    .map_err(|e| Error::Transport(format!("read length: {}", e)))?;
  if len > MAX_FRAME {
    return Err(Error::Transport(format!("frame of {} bytes exceeds limit", len)));
  }
  let mut buffer = BytesMut::zeroed(len as usize);
  reader
    .read_exact(&mut buffer)
    .await
    .map_err(|e| Error::Transport(format!("read body: {}", e)))?;
  Ok(buffer)
}
