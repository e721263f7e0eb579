//! Component descriptions and the callback invocation engine.
//!
//! A [`Component`] is an immutable description of a reactive processing unit:
//! state fields, named in/out ports, and named [`Callback`]s. Callbacks are
//! plain function values over an explicit environment; each one declares which
//! fields it reads and writes and which ports it publishes to, and the
//! environment enforces those declarations at invocation time.
//!
//! The invocation engine ([`Callback::invoke`], [`Component::call`]) never
//! lets a body failure escape: panics and errors are caught and returned as an
//! error-tagged [`CallbackResult`], leaving the owning strategy to decide
//! whether the failure is fatal.

use crate::error::{DefinitionError, Error};
use crate::strategy::{Context, Strategy};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A symbolic port name, scoped to one component.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(String);

impl Port {
  pub fn new(name: impl Into<String>) -> Self {
    Port(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for Port {
  fn from(s: &str) -> Self {
    Port(s.to_string())
  }
}

impl From<String> for Port {
  fn from(s: String) -> Self {
    Port(s)
  }
}

impl std::fmt::Display for Port {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Field state of one worker or invocation: field name → value.
pub type FieldsState = BTreeMap<String, Value>;

/// How much of the state a callback may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCapability {
  /// The callback never observes state; any returned state is discarded.
  None,
  /// The callback reads state but its mutations are discarded.
  Read,
  /// The callback reads and replaces state.
  ReadWrite,
}

/// A failure produced while running a callback body.
///
/// Capability violations and body errors both land here; the invocation
/// engine tags the [`CallbackResult`] with the failure instead of unwinding.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallbackFailure {
  #[error("field `{0}` is not in this callback's read set")]
  FieldNotReadable(String),
  #[error("field `{0}` is not in this callback's write set")]
  FieldNotWritable(String),
  #[error("port `{0}` is not in this callback's publish set")]
  PortNotPublishable(String),
  /// The body returned an error or panicked.
  #[error("{0}")]
  Failed(String),
}

impl CallbackFailure {
  /// Convenience constructor for body errors.
  pub fn failed(reason: impl Into<String>) -> Self {
    CallbackFailure::Failed(reason.into())
  }
}

/// Arguments handed to one callback invocation.
///
/// User callbacks receive token values only; strategy hooks additionally
/// receive the dispatch [`Context`].
#[derive(Clone, Default)]
pub struct CallbackArgs {
  context: Option<Context>,
  args: Vec<Value>,
}

impl CallbackArgs {
  pub fn new(args: Vec<Value>) -> Self {
    Self { context: None, args }
  }

  pub(crate) fn with_context(mut self, context: Context) -> Self {
    self.context = Some(context);
    self
  }

  /// The dispatch context, present when the callback runs as a strategy hook.
  pub fn context(&self) -> Option<&Context> {
    self.context.as_ref()
  }

  pub fn args(&self) -> &[Value] {
    &self.args
  }

  /// Positional argument, `None` when absent.
  pub fn arg(&self, index: usize) -> Option<&Value> {
    self.args.get(index)
  }
}

/// Mutable per-invocation environment: state view plus publish accumulator.
pub struct CallbackEnv {
  state: FieldsState,
  published: Vec<(Port, Value)>,
  state_touched: bool,
  read: Arc<BTreeSet<String>>,
  write: Arc<BTreeSet<String>>,
  publish: Arc<BTreeSet<Port>>,
  checked: bool,
}

impl CallbackEnv {
  /// Reads a field; missing fields read as null.
  pub fn read(&self, field: &str) -> Result<Value, CallbackFailure> {
    if self.checked && !self.read.contains(field) {
      return Err(CallbackFailure::FieldNotReadable(field.to_string()));
    }
    Ok(self.state.get(field).cloned().unwrap_or(Value::Null))
  }

  /// Writes a field, subject to the callback's write set.
  pub fn write(&mut self, field: &str, value: Value) -> Result<(), CallbackFailure> {
    if self.checked && !self.write.contains(field) {
      return Err(CallbackFailure::FieldNotWritable(field.to_string()));
    }
    self.state.insert(field.to_string(), value);
    self.state_touched = true;
    Ok(())
  }

  /// Appends `(port, value)` to the publish accumulator, in call order.
  pub fn publish(&mut self, port: impl Into<Port>, value: Value) -> Result<(), CallbackFailure> {
    let port = port.into();
    if self.checked && !self.publish.contains(&port) {
      return Err(CallbackFailure::PortNotPublishable(port.to_string()));
    }
    self.published.push((port, value));
    Ok(())
  }

  /// Replaces the whole state map. Used by hooks that manage opaque state.
  pub fn replace_state(&mut self, state: FieldsState) {
    self.state = state;
    self.state_touched = true;
  }

  /// Read-only view of the current state.
  pub fn state(&self) -> &FieldsState {
    &self.state
  }
}

/// A callback body. Most user callbacks are synchronous closures wrapped via
/// [`Callback::from_fn`]; strategy hooks that await remote calls implement
/// this trait directly (the same way the stock strategies do).
#[async_trait]
pub trait CallbackBody: Send + Sync {
  async fn run(&self, env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure>;
}

struct SyncFn<F>(F);

#[async_trait]
impl<F> CallbackBody for SyncFn<F>
where
  F: Fn(&mut CallbackEnv, &CallbackArgs) -> Result<Value, CallbackFailure> + Send + Sync,
{
  async fn run(&self, env: &mut CallbackEnv, args: &CallbackArgs) -> Result<Value, CallbackFailure> {
    (self.0)(env, args)
  }
}

/// One user-defined operation of a component, with declared capabilities.
#[derive(Clone)]
pub struct Callback {
  body: Arc<dyn CallbackBody>,
  read: Arc<BTreeSet<String>>,
  write: Arc<BTreeSet<String>>,
  publish: Arc<BTreeSet<Port>>,
  state_capability: StateCapability,
  publish_capability: bool,
  checked: bool,
}

impl Callback {
  /// Wraps a body with empty capability sets. Chain the `with_*` methods to
  /// declare what the body touches.
  pub fn new(body: Arc<dyn CallbackBody>) -> Self {
    Self {
      body,
      read: Arc::new(BTreeSet::new()),
      write: Arc::new(BTreeSet::new()),
      publish: Arc::new(BTreeSet::new()),
      state_capability: StateCapability::None,
      publish_capability: false,
      checked: true,
    }
  }

  /// Wraps a synchronous closure as a callback body.
  pub fn from_fn<F>(f: F) -> Self
  where
    F: Fn(&mut CallbackEnv, &CallbackArgs) -> Result<Value, CallbackFailure>
      + Send
      + Sync
      + 'static,
  {
    Self::new(Arc::new(SyncFn(f)))
  }

  /// Wraps a body with all capabilities and no set checks. Strategy hooks
  /// manage arbitrary state, so their environments are unrestricted.
  pub fn unrestricted<B>(body: B) -> Self
  where
    B: CallbackBody + 'static,
  {
    let mut cb = Self::new(Arc::new(body));
    cb.state_capability = StateCapability::ReadWrite;
    cb.publish_capability = true;
    cb.checked = false;
    cb
  }

  /// [`unrestricted`](Self::unrestricted) over a synchronous closure.
  pub fn unrestricted_fn<F>(f: F) -> Self
  where
    F: Fn(&mut CallbackEnv, &CallbackArgs) -> Result<Value, CallbackFailure>
      + Send
      + Sync
      + 'static,
  {
    Self::unrestricted(SyncFn(f))
  }

  pub fn with_read<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.read = Arc::new(fields.into_iter().map(Into::into).collect());
    self
  }

  pub fn with_write<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.write = Arc::new(fields.into_iter().map(Into::into).collect());
    self
  }

  pub fn with_publish<I, P>(mut self, ports: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<Port>,
  {
    self.publish = Arc::new(ports.into_iter().map(Into::into).collect());
    self
  }

  pub fn with_state_capability(mut self, cap: StateCapability) -> Self {
    self.state_capability = cap;
    self
  }

  pub fn with_publish_capability(mut self, cap: bool) -> Self {
    self.publish_capability = cap;
    self
  }

  pub fn read_set(&self) -> &BTreeSet<String> {
    &self.read
  }

  pub fn write_set(&self) -> &BTreeSet<String> {
    &self.write
  }

  pub fn publish_set(&self) -> &BTreeSet<Port> {
    &self.publish
  }

  pub fn state_capability(&self) -> StateCapability {
    self.state_capability
  }

  pub fn publish_capability(&self) -> bool {
    self.publish_capability
  }

  /// True when both callbacks share the same body value.
  pub fn same_body(&self, other: &Callback) -> bool {
    Arc::ptr_eq(&self.body, &other.body)
  }

  /// Runs the callback: the invocation engine.
  ///
  /// Builds the environment from `state` (missing fields stay absent and read
  /// as null), runs the body, catches panics, and applies capability forcing:
  /// without `ReadWrite` the returned state is null, without
  /// `publish_capability` the published sequence is null.
  pub async fn invoke(&self, state: FieldsState, args: CallbackArgs) -> CallbackResult {
    let mut env = CallbackEnv {
      state,
      published: Vec::new(),
      state_touched: false,
      read: self.read.clone(),
      write: self.write.clone(),
      publish: self.publish.clone(),
      checked: self.checked,
    };

    let outcome = match AssertUnwindSafe(self.body.run(&mut env, &args))
      .catch_unwind()
      .await
    {
      Ok(result) => result,
      Err(panic) => Err(CallbackFailure::Failed(panic_message(panic))),
    };

    if outcome.is_err() {
      return CallbackResult {
        state: None,
        published: None,
        value: outcome,
      };
    }

    let state = if env.state_touched && self.state_capability == StateCapability::ReadWrite {
      Some(env.state)
    } else {
      None
    };
    let published = if self.publish_capability && !env.published.is_empty() {
      Some(env.published)
    } else {
      None
    };

    CallbackResult {
      state,
      published,
      value: outcome,
    }
  }
}

impl std::fmt::Debug for Callback {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Callback")
      .field("read", &self.read)
      .field("write", &self.write)
      .field("publish", &self.publish)
      .field("state_capability", &self.state_capability)
      .field("publish_capability", &self.publish_capability)
      .finish_non_exhaustive()
  }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    format!("callback body panicked: {}", s)
  } else if let Some(s) = panic.downcast_ref::<String>() {
    format!("callback body panicked: {}", s)
  } else {
    "callback body panicked".to_string()
  }
}

/// Outcome of one callback invocation.
///
/// `state = None` means state unchanged; `published = None` means nothing was
/// published. A failed body yields `value = Err(..)` with both forced to
/// `None`.
#[derive(Debug)]
pub struct CallbackResult {
  pub state: Option<FieldsState>,
  pub published: Option<Vec<(Port, Value)>>,
  pub value: Result<Value, CallbackFailure>,
}

impl CallbackResult {
  pub fn is_failure(&self) -> bool {
    self.value.is_err()
  }
}

/// Immutable description of a reactive processing unit.
pub struct Component {
  name: Option<String>,
  fields: Vec<String>,
  in_ports: Vec<Port>,
  out_ports: Vec<Port>,
  callbacks: BTreeMap<String, Callback>,
  strategy: Arc<Strategy>,
}

impl Component {
  pub fn builder() -> ComponentBuilder {
    ComponentBuilder::default()
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  /// Name for log lines and errors; anonymous components get a placeholder.
  pub fn display_name(&self) -> &str {
    self.name.as_deref().unwrap_or("<anonymous>")
  }

  pub fn fields(&self) -> &[String] {
    &self.fields
  }

  pub fn in_ports(&self) -> &[Port] {
    &self.in_ports
  }

  pub fn out_ports(&self) -> &[Port] {
    &self.out_ports
  }

  pub fn strategy(&self) -> &Arc<Strategy> {
    &self.strategy
  }

  pub fn callback(&self, name: &str) -> Option<&Callback> {
    self.callbacks.get(name)
  }

  pub fn callback_names(&self) -> impl Iterator<Item = &str> {
    self.callbacks.keys().map(String::as_str)
  }

  pub fn in_port_index(&self, port: &Port) -> Option<usize> {
    self.in_ports.iter().position(|p| p == port)
  }

  pub fn out_port_index(&self, port: &Port) -> Option<usize> {
    self.out_ports.iter().position(|p| p == port)
  }

  /// A state mapping every declared field to null.
  pub fn empty_state(&self) -> FieldsState {
    self
      .fields
      .iter()
      .map(|f| (f.clone(), Value::Null))
      .collect()
  }

  /// Invokes the named callback with the given state and arguments.
  ///
  /// Fields the caller left out of `state` are filled in as null before the
  /// body runs. Fails only when the callback does not exist; body failures
  /// come back inside the [`CallbackResult`].
  pub async fn call(
    &self,
    callback: &str,
    mut state: FieldsState,
    args: CallbackArgs,
  ) -> Result<CallbackResult, Error> {
    let cb = self.callback(callback).ok_or_else(|| Error::NoSuchCallback {
      component: self.display_name().to_string(),
      callback: callback.to_string(),
    })?;
    for field in &self.fields {
      state.entry(field.clone()).or_insert(Value::Null);
    }
    Ok(cb.invoke(state, args).await)
  }
}

impl std::fmt::Debug for Component {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Component")
      .field("name", &self.name)
      .field("fields", &self.fields)
      .field("in_ports", &self.in_ports)
      .field("out_ports", &self.out_ports)
      .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
      .finish_non_exhaustive()
  }
}

/// Builder for [`Component`]. Validation happens in [`build`](Self::build);
/// all description problems are reported as [`DefinitionError`]s.
#[derive(Default)]
pub struct ComponentBuilder {
  name: Option<String>,
  fields: Vec<String>,
  in_ports: Vec<Port>,
  out_ports: Vec<Port>,
  callbacks: BTreeMap<String, Callback>,
  strategy: Option<Arc<Strategy>>,
}

impl ComponentBuilder {
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn field(mut self, field: impl Into<String>) -> Self {
    self.fields.push(field.into());
    self
  }

  pub fn fields<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.fields.extend(fields.into_iter().map(Into::into));
    self
  }

  pub fn in_port(mut self, port: impl Into<Port>) -> Self {
    self.in_ports.push(port.into());
    self
  }

  pub fn out_port(mut self, port: impl Into<Port>) -> Self {
    self.out_ports.push(port.into());
    self
  }

  pub fn callback(mut self, name: impl Into<String>, callback: Callback) -> Self {
    self.callbacks.insert(name.into(), callback);
    self
  }

  pub fn strategy(mut self, strategy: Arc<Strategy>) -> Self {
    self.strategy = Some(strategy);
    self
  }

  pub fn build(self) -> Result<Component, Error> {
    let display = self.name.clone().unwrap_or_else(|| "<anonymous>".to_string());

    let mut seen_fields = BTreeSet::new();
    for field in &self.fields {
      if !seen_fields.insert(field.clone()) {
        return Err(
          DefinitionError::DuplicateField {
            component: display,
            field: field.clone(),
          }
          .into(),
        );
      }
    }

    if self.in_ports.is_empty() {
      return Err(DefinitionError::NoInPorts { component: display }.into());
    }

    let mut seen_ports = BTreeSet::new();
    for port in self.in_ports.iter().chain(self.out_ports.iter()) {
      if !seen_ports.insert(port.clone()) {
        return Err(
          DefinitionError::DuplicatePort {
            component: display,
            port: port.to_string(),
          }
          .into(),
        );
      }
    }

    let out_ports: BTreeSet<&Port> = self.out_ports.iter().collect();
    for (cb_name, cb) in &self.callbacks {
      for field in cb.read_set().iter().chain(cb.write_set().iter()) {
        if !seen_fields.contains(field) {
          return Err(
            DefinitionError::UnknownField {
              component: display,
              callback: cb_name.clone(),
              field: field.clone(),
            }
            .into(),
          );
        }
      }
      for port in cb.publish_set() {
        if !out_ports.contains(port) {
          return Err(
            DefinitionError::UnknownPublishPort {
              component: display,
              callback: cb_name.clone(),
              port: port.to_string(),
            }
            .into(),
          );
        }
      }
    }

    Ok(Component {
      name: self.name,
      fields: self.fields,
      in_ports: self.in_ports,
      out_ports: self.out_ports,
      callbacks: self.callbacks,
      strategy: self.strategy.unwrap_or_else(|| Arc::new(Strategy::builder().build())),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn average() -> Component {
    let init = Callback::from_fn(|env, _args| {
      env.write("total", json!(0.0))?;
      env.write("count", json!(0.0))?;
      Ok(Value::Null)
    })
    .with_write(["total", "count"])
    .with_state_capability(StateCapability::ReadWrite);

    let react = Callback::from_fn(|env, args| {
      let v = args.arg(0).and_then(Value::as_f64).unwrap_or(0.0);
      let count = env.read("count")?.as_f64().unwrap_or(0.0) + 1.0;
      let total = env.read("total")?.as_f64().unwrap_or(0.0) + v;
      env.write("count", json!(count))?;
      env.write("total", json!(total))?;
      env.publish("current", json!(total / count))?;
      Ok(Value::Null)
    })
    .with_read(["total", "count"])
    .with_write(["total", "count"])
    .with_publish(["current"])
    .with_state_capability(StateCapability::ReadWrite)
    .with_publish_capability(true);

    Component::builder()
      .name("average")
      .fields(["total", "count"])
      .in_port("value")
      .out_port("current")
      .callback("init", init)
      .callback("react", react)
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn average_react_updates_state_and_publishes() {
    let component = average();
    let mut state = FieldsState::new();
    state.insert("total".to_string(), json!(0.0));
    state.insert("count".to_string(), json!(0.0));

    let result = component
      .call("react", state, CallbackArgs::new(vec![json!(10.0)]))
      .await
      .unwrap();

    let new_state = result.state.expect("state changed");
    assert_eq!(new_state["total"], json!(10.0));
    assert_eq!(new_state["count"], json!(1.0));
    assert_eq!(
      result.published,
      Some(vec![(Port::from("current"), json!(10.0))])
    );
  }

  #[tokio::test]
  async fn empty_state_maps_every_field_to_null() {
    let component = average();
    let state = component.empty_state();
    assert_eq!(state.len(), 2);
    assert!(state.values().all(Value::is_null));

    // init from empty state works
    let result = component
      .call("init", state, CallbackArgs::default())
      .await
      .unwrap();
    assert!(!result.is_failure());
    assert_eq!(result.state.unwrap()["count"], json!(0.0));
  }

  #[tokio::test]
  async fn missing_callback_is_reported() {
    let component = average();
    let err = component
      .call("nope", FieldsState::new(), CallbackArgs::default())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::NoSuchCallback { callback, .. } if callback == "nope"));
  }

  #[tokio::test]
  async fn capability_forcing_discards_state_and_publish() {
    let cb = Callback::from_fn(|env, _| {
      env.write("x", json!(1))?;
      Ok(json!("done"))
    })
    .with_write(["x"])
    .with_state_capability(StateCapability::None);

    let component = Component::builder()
      .name("quiet")
      .field("x")
      .in_port("in")
      .callback("go", cb)
      .build()
      .unwrap();

    let result = component
      .call("go", component.empty_state(), CallbackArgs::default())
      .await
      .unwrap();
    // write happened but state capability forces null; no publish capability
    assert_eq!(result.state, None);
    assert_eq!(result.published, None);
    assert_eq!(result.value.unwrap(), json!("done"));
  }

  #[tokio::test]
  async fn set_violations_are_error_tagged() {
    let cb = Callback::from_fn(|env, _| {
      env.write("not_mine", json!(1))?;
      Ok(Value::Null)
    })
    .with_state_capability(StateCapability::ReadWrite);

    let component = Component::builder()
      .name("strict")
      .field("not_mine")
      .in_port("in")
      .callback("go", cb)
      .build()
      .unwrap();

    let result = component
      .call("go", component.empty_state(), CallbackArgs::default())
      .await
      .unwrap();
    assert!(result.is_failure());
    assert_eq!(result.state, None);
    assert!(matches!(
      result.value,
      Err(CallbackFailure::FieldNotWritable(f)) if f == "not_mine"
    ));
  }

  #[tokio::test]
  async fn body_panic_is_caught() {
    let cb = Callback::from_fn(|_env, _| panic!("boom"));
    let result = cb.invoke(FieldsState::new(), CallbackArgs::default()).await;
    assert!(matches!(
      result.value,
      Err(CallbackFailure::Failed(msg)) if msg.contains("boom")
    ));
  }

  #[test]
  fn builder_rejects_bad_descriptions() {
    let err = Component::builder()
      .name("c")
      .field("a")
      .field("a")
      .in_port("in")
      .build()
      .unwrap_err();
    assert!(matches!(
      err,
      Error::Definition(DefinitionError::DuplicateField { field, .. }) if field == "a"
    ));

    let err = Component::builder().name("c").build().unwrap_err();
    assert!(matches!(
      err,
      Error::Definition(DefinitionError::NoInPorts { .. })
    ));

    let cb = Callback::from_fn(|_, _| Ok(Value::Null)).with_publish(["nowhere"]);
    let err = Component::builder()
      .name("c")
      .in_port("in")
      .callback("go", cb)
      .build()
      .unwrap_err();
    assert!(matches!(
      err,
      Error::Definition(DefinitionError::UnknownPublishPort { port, .. }) if port == "nowhere"
    ));
  }
}
