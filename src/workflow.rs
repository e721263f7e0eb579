//! Workflow descriptions: graphs of component and sub-workflow nodes linked
//! port to port.
//!
//! A workflow is built through [`WorkflowBuilder`], validated at build time
//! (unique node ids, resolvable endpoints, single writer per in-port), and
//! flattened before deployment: nested sub-workflows expand into their
//! children under a scoped id prefix, and boundary ports dissolve into direct
//! component-to-component links.

use crate::component::{Component, Port};
use crate::error::{DefinitionError, Error, PortSide};
use crate::strategy::Strategy;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// One end of a link: a port on an internal node, or a workflow boundary port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
  Node { node: String, port: Port },
  Boundary { port: Port },
}

impl Endpoint {
  pub fn node(node: impl Into<String>, port: impl Into<Port>) -> Self {
    Endpoint::Node {
      node: node.into(),
      port: port.into(),
    }
  }

  pub fn boundary(port: impl Into<Port>) -> Self {
    Endpoint::Boundary { port: port.into() }
  }
}

impl std::fmt::Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Endpoint::Node { node, port } => write!(f, "{}.{}", node, port),
      Endpoint::Boundary { port } => write!(f, ".{}", port),
    }
  }
}

/// A publish→receive edge.
#[derive(Clone, Debug)]
pub struct Link {
  pub source: Endpoint,
  pub dest: Endpoint,
}

/// A component instance inside a workflow.
#[derive(Clone)]
pub struct ComponentNode {
  pub component: Arc<Component>,
  pub args: Value,
  /// Merged over the component's own strategy at deploy time.
  pub strategy_override: Option<Arc<Strategy>>,
}

/// A nested workflow instance.
#[derive(Clone)]
pub struct WorkflowNode {
  pub workflow: Arc<Workflow>,
  pub args: Value,
}

/// A workflow node: component or nested sub-workflow.
#[derive(Clone)]
pub enum Node {
  Component(ComponentNode),
  Workflow(WorkflowNode),
}

impl Node {
  fn has_in_port(&self, port: &Port) -> bool {
    match self {
      Node::Component(c) => c.component.in_port_index(port).is_some(),
      Node::Workflow(w) => w.workflow.in_ports.contains(port),
    }
  }

  fn has_out_port(&self, port: &Port) -> bool {
    match self {
      Node::Component(c) => c.component.out_port_index(port).is_some(),
      Node::Workflow(w) => w.workflow.out_ports.contains(port),
    }
  }
}

/// An immutable, validated workflow description.
#[derive(Clone)]
pub struct Workflow {
  name: Option<String>,
  in_ports: Vec<Port>,
  out_ports: Vec<Port>,
  nodes: BTreeMap<String, Node>,
  node_order: Vec<String>,
  links: Vec<Link>,
}

impl Workflow {
  pub fn builder() -> WorkflowBuilder {
    WorkflowBuilder::default()
  }

  pub fn name(&self) -> Option<&str> {
    self.name.as_deref()
  }

  pub fn in_ports(&self) -> &[Port] {
    &self.in_ports
  }

  pub fn out_ports(&self) -> &[Port] {
    &self.out_ports
  }

  pub fn node(&self, id: &str) -> Option<&Node> {
    self.nodes.get(id)
  }

  /// Node ids in insertion order.
  pub fn node_ids(&self) -> &[String] {
    &self.node_order
  }

  pub fn links(&self) -> &[Link] {
    &self.links
  }

  /// Re-runs the build-time validation rules.
  pub fn validate(&self) -> Result<(), Error> {
    validate(
      &self.in_ports,
      &self.out_ports,
      &self.nodes,
      &self.links,
    )
  }

  /// Flattens nested sub-workflows into a single-level component graph.
  ///
  /// Sub-workflow children get ids scoped under the sub-workflow's node id
  /// (`outer/inner`); boundary ports dissolve so that every remaining link
  /// connects two component ports. Fails when the expanded graph has a cycle
  /// spanning more than one component.
  pub fn flatten(&self) -> Result<FlatWorkflow, Error> {
    let mut flat = Flattening::default();
    flat.expand("", self);
    flat.finish(self)
  }
}

impl std::fmt::Debug for Workflow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workflow")
      .field("name", &self.name)
      .field("in_ports", &self.in_ports)
      .field("out_ports", &self.out_ports)
      .field("nodes", &self.node_order)
      .field("links", &self.links.len())
      .finish()
  }
}

/// Builder for [`Workflow`]; validation happens in [`build`](Self::build).
#[derive(Default)]
pub struct WorkflowBuilder {
  name: Option<String>,
  in_ports: Vec<Port>,
  out_ports: Vec<Port>,
  nodes: Vec<(String, Node)>,
  links: Vec<Link>,
}

impl WorkflowBuilder {
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
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

  pub fn component(self, id: impl Into<String>, component: Arc<Component>, args: Value) -> Self {
    self.component_node(id, component, args, None)
  }

  pub fn component_with_strategy(
    self,
    id: impl Into<String>,
    component: Arc<Component>,
    args: Value,
    strategy: Arc<Strategy>,
  ) -> Self {
    self.component_node(id, component, args, Some(strategy))
  }

  fn component_node(
    mut self,
    id: impl Into<String>,
    component: Arc<Component>,
    args: Value,
    strategy_override: Option<Arc<Strategy>>,
  ) -> Self {
    self.nodes.push((
      id.into(),
      Node::Component(ComponentNode {
        component,
        args,
        strategy_override,
      }),
    ));
    self
  }

  pub fn workflow(mut self, id: impl Into<String>, workflow: Arc<Workflow>, args: Value) -> Self {
    self
      .nodes
      .push((id.into(), Node::Workflow(WorkflowNode { workflow, args })));
    self
  }

  pub fn link(mut self, source: Endpoint, dest: Endpoint) -> Self {
    self.links.push(Link { source, dest });
    self
  }

  pub fn build(self) -> Result<Workflow, Error> {
    let mut nodes = BTreeMap::new();
    let mut node_order = Vec::with_capacity(self.nodes.len());
    for (id, node) in self.nodes {
      if nodes.insert(id.clone(), node).is_some() {
        return Err(DefinitionError::DuplicateNode { node: id }.into());
      }
      node_order.push(id);
    }

    validate(&self.in_ports, &self.out_ports, &nodes, &self.links)?;

    Ok(Workflow {
      name: self.name,
      in_ports: self.in_ports,
      out_ports: self.out_ports,
      nodes,
      node_order,
      links: self.links,
    })
  }
}

fn validate(
  in_ports: &[Port],
  out_ports: &[Port],
  nodes: &BTreeMap<String, Node>,
  links: &[Link],
) -> Result<(), Error> {
  let mut taken: BTreeSet<(String, Port)> = BTreeSet::new();

  for (index, link) in links.iter().enumerate() {
    match &link.source {
      Endpoint::Node { node, port } => {
        let n = nodes.get(node).ok_or_else(|| DefinitionError::UnknownNode {
          link: index,
          node: node.clone(),
        })?;
        if !n.has_out_port(port) {
          return Err(
            DefinitionError::UnknownPort {
              link: index,
              node: node.clone(),
              port: port.to_string(),
              side: PortSide::Out,
            }
            .into(),
          );
        }
      }
      // the workflow's own in-ports act as sources inside the link set
      Endpoint::Boundary { port } => {
        if !in_ports.contains(port) {
          return Err(
            DefinitionError::UnknownPort {
              link: index,
              node: "<boundary>".to_string(),
              port: port.to_string(),
              side: PortSide::In,
            }
            .into(),
          );
        }
      }
    }

    match &link.dest {
      Endpoint::Node { node, port } => {
        let n = nodes.get(node).ok_or_else(|| DefinitionError::UnknownNode {
          link: index,
          node: node.clone(),
        })?;
        if !n.has_in_port(port) {
          return Err(
            DefinitionError::UnknownPort {
              link: index,
              node: node.clone(),
              port: port.to_string(),
              side: PortSide::In,
            }
            .into(),
          );
        }
        if !taken.insert((node.clone(), port.clone())) {
          return Err(
            DefinitionError::DuplicateDestination {
              node: node.clone(),
              port: port.to_string(),
            }
            .into(),
          );
        }
      }
      Endpoint::Boundary { port } => {
        if !out_ports.contains(port) {
          return Err(
            DefinitionError::UnknownPort {
              link: index,
              node: "<boundary>".to_string(),
              port: port.to_string(),
              side: PortSide::Out,
            }
            .into(),
          );
        }
      }
    }
  }

  Ok(())
}

/// A component node of the flattened graph.
#[derive(Clone, Debug)]
pub struct FlatNode {
  /// Globally unique scoped id (`sub/inner` for nested nodes).
  pub id: String,
  pub component: Arc<Component>,
  pub args: Value,
  pub strategy_override: Option<Arc<Strategy>>,
}

/// A component-to-component edge of the flattened graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatLink {
  pub source: (String, Port),
  pub dest: (String, Port),
}

/// The result of [`Workflow::flatten`]: a single-level component graph.
#[derive(Debug)]
pub struct FlatWorkflow {
  pub nodes: Vec<FlatNode>,
  pub links: Vec<FlatLink>,
  /// Root boundary in-port → component destinations, for driving tokens in.
  pub inputs: Vec<(Port, Vec<(String, Port)>)>,
  /// Component sources wired to root boundary out-ports.
  pub outputs: Vec<((String, Port), Port)>,
}

impl FlatWorkflow {
  /// Node ids in a topological order of the flat graph (self-loops ignored).
  /// The order is advisory: deployment must tolerate predecessors that do
  /// not exist yet.
  pub fn topo_order(&self) -> Vec<String> {
    let ids: Vec<&String> = self.nodes.iter().map(|n| &n.id).collect();
    let index: HashMap<&String, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut indegree = vec![0usize; ids.len()];
    let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for link in &self.links {
      let (s, d) = (index[&link.source.0], index[&link.dest.0]);
      if s == d {
        continue;
      }
      adjacent[s].push(d);
      indegree[d] += 1;
    }

    let mut queue: VecDeque<usize> = (0..ids.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(i) = queue.pop_front() {
      order.push(ids[i].clone());
      for &next in &adjacent[i] {
        indegree[next] -= 1;
        if indegree[next] == 0 {
          queue.push_back(next);
        }
      }
    }
    order
  }
}

/// Pins are the connection points of the expansion graph: component ports
/// plus the boundary ports of every (sub-)workflow scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Pin {
  CompOut(String, Port),
  CompIn(String, Port),
  BoundIn(String, Port),
  BoundOut(String, Port),
}

#[derive(Default)]
struct Flattening {
  nodes: Vec<FlatNode>,
  edges: HashMap<Pin, Vec<Pin>>,
}

fn scoped(prefix: &str, id: &str) -> String {
  if prefix.is_empty() {
    id.to_string()
  } else {
    format!("{}/{}", prefix, id)
  }
}

impl Flattening {
  fn expand(&mut self, prefix: &str, wf: &Workflow) {
    for id in &wf.node_order {
      let scoped_id = scoped(prefix, id);
      match &wf.nodes[id] {
        Node::Component(c) => self.nodes.push(FlatNode {
          id: scoped_id,
          component: c.component.clone(),
          args: c.args.clone(),
          strategy_override: c.strategy_override.clone(),
        }),
        Node::Workflow(w) => self.expand(&scoped_id, &w.workflow),
      }
    }

    for link in &wf.links {
      let source = self.source_pin(prefix, wf, &link.source);
      let dest = self.dest_pin(prefix, wf, &link.dest);
      self.edges.entry(source).or_default().push(dest);
    }
  }

  fn source_pin(&self, prefix: &str, wf: &Workflow, endpoint: &Endpoint) -> Pin {
    match endpoint {
      Endpoint::Node { node, port } => match &wf.nodes[node] {
        Node::Component(_) => Pin::CompOut(scoped(prefix, node), port.clone()),
        Node::Workflow(_) => Pin::BoundOut(scoped(prefix, node), port.clone()),
      },
      Endpoint::Boundary { port } => Pin::BoundIn(prefix.to_string(), port.clone()),
    }
  }

  fn dest_pin(&self, prefix: &str, wf: &Workflow, endpoint: &Endpoint) -> Pin {
    match endpoint {
      Endpoint::Node { node, port } => match &wf.nodes[node] {
        Node::Component(_) => Pin::CompIn(scoped(prefix, node), port.clone()),
        Node::Workflow(_) => Pin::BoundIn(scoped(prefix, node), port.clone()),
      },
      Endpoint::Boundary { port } => Pin::BoundOut(prefix.to_string(), port.clone()),
    }
  }

  /// Follows edges from `pin` through boundary pins to component in-ports,
  /// preserving link order.
  fn resolve_dests(&self, pin: &Pin, visited: &mut Vec<Pin>) -> Vec<(String, Port)> {
    if visited.contains(pin) {
      return Vec::new();
    }
    visited.push(pin.clone());
    let mut found = Vec::new();
    for next in self.edges.get(pin).into_iter().flatten() {
      match next {
        Pin::CompIn(id, port) => found.push((id.clone(), port.clone())),
        other => found.extend(self.resolve_dests(other, visited)),
      }
    }
    found
  }

  fn finish(self, root: &Workflow) -> Result<FlatWorkflow, Error> {
    let mut links = Vec::new();
    for node in &self.nodes {
      for port in node.component.out_ports() {
        let pin = Pin::CompOut(node.id.clone(), port.clone());
        for dest in self.resolve_dests(&pin, &mut Vec::new()) {
          links.push(FlatLink {
            source: (node.id.clone(), port.clone()),
            dest,
          });
        }
      }
    }

    let inputs = root
      .in_ports
      .iter()
      .map(|port| {
        let pin = Pin::BoundIn(String::new(), port.clone());
        (port.clone(), self.resolve_dests(&pin, &mut Vec::new()))
      })
      .collect();

    // component sources reaching a root boundary out-port
    let mut outputs = Vec::new();
    for node in &self.nodes {
      for port in node.component.out_ports() {
        let pin = Pin::CompOut(node.id.clone(), port.clone());
        for root_out in self.reachable_root_outs(&pin, root) {
          outputs.push(((node.id.clone(), port.clone()), root_out));
        }
      }
    }

    let flat = FlatWorkflow {
      nodes: self.nodes,
      links,
      inputs,
      outputs,
    };
    check_acyclic(&flat)?;
    Ok(flat)
  }

  fn reachable_root_outs(&self, pin: &Pin, _root: &Workflow) -> Vec<Port> {
    let mut found = Vec::new();
    let mut visited = Vec::new();
    let mut stack = vec![pin.clone()];
    while let Some(current) = stack.pop() {
      if visited.contains(&current) {
        continue;
      }
      visited.push(current.clone());
      for next in self.edges.get(&current).into_iter().flatten() {
        match next {
          Pin::BoundOut(scope, port) if scope.is_empty() => found.push(port.clone()),
          Pin::CompIn(..) => {}
          other => stack.push(other.clone()),
        }
      }
    }
    found
  }
}

fn check_acyclic(flat: &FlatWorkflow) -> Result<(), Error> {
  // Kahn over the flat graph; whatever cannot be ordered sits on a cycle.
  // Self-loops on one component are permitted (the strategy handles them).
  let ordered = flat.topo_order();
  if ordered.len() == flat.nodes.len() {
    return Ok(());
  }
  let ordered: BTreeSet<String> = ordered.into_iter().collect();
  let cyclic: Vec<String> = flat
    .nodes
    .iter()
    .map(|n| n.id.clone())
    .filter(|id| !ordered.contains(id))
    .collect();
  Err(DefinitionError::Cycle { nodes: cyclic }.into())
}
