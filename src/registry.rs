//! Process-wide directory of named components and strategies.
//!
//! The registry doubles as the code-distribution seam of the cluster: function
//! values cannot travel between nodes, so deployment requests refer to
//! components and strategies by registered name and every node resolves them
//! against its own registry. All nodes of a cluster run the same release and
//! register the same definitions at start.
//!
//! Reads take a snapshot pointer and never block behind writers; writes clone
//! the map, mutate the clone, and swap the pointer under the write lock.

use crate::component::Component;
use crate::error::Error;
use crate::strategy::Strategy;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// A registrable entity: a component or a strategy.
#[derive(Clone)]
pub enum Entity {
  Component(Arc<Component>),
  Strategy(Arc<Strategy>),
}

impl Entity {
  /// The entity's name, if it has one. Unnamed entities cannot be registered.
  pub fn name(&self) -> Option<&str> {
    match self {
      Entity::Component(c) => c.name(),
      Entity::Strategy(s) => s.name(),
    }
  }

  /// Short kind label used in log lines.
  pub fn kind(&self) -> &'static str {
    match self {
      Entity::Component(_) => "component",
      Entity::Strategy(_) => "strategy",
    }
  }
}

impl std::fmt::Debug for Entity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}({})", self.kind(), self.name().unwrap_or("<anonymous>"))
  }
}

impl From<Arc<Component>> for Entity {
  fn from(c: Arc<Component>) -> Self {
    Entity::Component(c)
  }
}

impl From<Arc<Strategy>> for Entity {
  fn from(s: Arc<Strategy>) -> Self {
    Entity::Strategy(s)
  }
}

/// Name → entity directory with snapshot reads and serialized writes.
pub struct Registry {
  inner: RwLock<Arc<HashMap<String, Entity>>>,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
  /// Creates an empty registry. Tests use private instances; production code
  /// usually goes through [`Registry::global`].
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(Arc::new(HashMap::new())),
    }
  }

  /// The process-wide registry.
  pub fn global() -> Arc<Registry> {
    GLOBAL.get_or_init(|| Arc::new(Registry::new())).clone()
  }

  fn snapshot(&self) -> Arc<HashMap<String, Entity>> {
    self
      .inner
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Registers the entity under its name, replacing any prior binding.
  /// A no-op for unnamed entities. Returns the entity for chaining.
  pub fn put_if_named(&self, entity: Entity) -> Entity {
    if let Some(name) = entity.name().map(str::to_owned) {
      let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
      let mut map = HashMap::clone(&guard);
      if map.insert(name.clone(), entity.clone()).is_some() {
        tracing::debug!(name = %name, kind = entity.kind(), "replaced registry binding");
      }
      *guard = Arc::new(map);
    }
    entity
  }

  /// Looks up an entity by name.
  pub fn get(&self, name: &str) -> Result<Entity, Error> {
    self
      .snapshot()
      .get(name)
      .cloned()
      .ok_or_else(|| Error::UnknownName(name.to_string()))
  }

  /// Looks up a component by name; a strategy under that name is a miss.
  pub fn get_component(&self, name: &str) -> Result<Arc<Component>, Error> {
    match self.get(name)? {
      Entity::Component(c) => Ok(c),
      Entity::Strategy(_) => Err(Error::UnknownName(name.to_string())),
    }
  }

  /// Looks up a strategy by name; a component under that name is a miss.
  pub fn get_strategy(&self, name: &str) -> Result<Arc<Strategy>, Error> {
    match self.get(name)? {
      Entity::Strategy(s) => Ok(s),
      Entity::Component(_) => Err(Error::UnknownName(name.to_string())),
    }
  }

  /// Snapshot of all registered entities, in arbitrary order.
  pub fn all(&self) -> Vec<Entity> {
    self.snapshot().values().cloned().collect()
  }

  /// Number of registered entities.
  pub fn len(&self) -> usize {
    self.snapshot().len()
  }

  /// True when nothing is registered.
  pub fn is_empty(&self) -> bool {
    self.snapshot().is_empty()
  }
}

impl Default for Registry {
  fn default() -> Self {
    Self::new()
  }
}
