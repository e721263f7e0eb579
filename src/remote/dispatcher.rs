//! Tag-keyed request dispatch.
//!
//! Handlers are registered per request tag. Each one is stateless behind an
//! `Arc`, so recovery from a panic is simply answering the request with an
//! error and serving the next one; the panic is logged and never takes the
//! server loop down.

use crate::error::Error;
use crate::runtime::Runtime;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

/// A request handler for one tag.
#[async_trait]
pub trait Handler: Send + Sync {
  async fn handle(&self, runtime: &Runtime, payload: Value) -> Result<Value, Error>;
}

/// Routes typed requests to registered handlers by tag.
pub struct Dispatcher {
  handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Dispatcher {
  pub fn new() -> Self {
    Self {
      handlers: RwLock::new(HashMap::new()),
    }
  }

  /// Registers `handler` under `tag`, replacing any previous registration.
  pub fn register(&self, tag: impl Into<String>, handler: Arc<dyn Handler>) {
    self
      .handlers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(tag.into(), handler);
  }

  /// Dispatches one request. Unknown tags and handler panics come back as
  /// errors; panics are additionally logged.
  pub async fn dispatch(&self, runtime: &Runtime, tag: &str, payload: Value) -> Result<Value, Error> {
    let handler = self
      .handlers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(tag)
      .cloned()
      .ok_or_else(|| Error::Transport(format!("no handler for tag `{}`", tag)))?;

    match AssertUnwindSafe(handler.handle(runtime, payload))
      .catch_unwind()
      .await
    {
      Ok(result) => result,
      Err(_) => {
        tracing::error!(tag = %tag, "request handler panicked");
        Err(Error::Transport(format!("handler for `{}` panicked", tag)))
      }
    }
  }
}

impl Default for Dispatcher {
  fn default() -> Self {
    Self::new()
  }
}
