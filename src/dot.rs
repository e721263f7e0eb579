//! GraphViz DOT rendering of workflow descriptions.
//!
//! The diagnostic export interface: components render as record-shaped nodes
//! with their in-ports on the left and out-ports on the right, nested
//! workflows render as clusters, and boundary ports as plain ellipses. The
//! output feeds straight into `dot -Tsvg`.

use crate::workflow::{Endpoint, Node, Workflow};
use std::fmt::Write;

/// Renders a workflow as a GraphViz digraph.
pub fn to_dot(workflow: &Workflow) -> String {
  let mut out = String::new();
  writeln!(out, "digraph workflow {{").unwrap();
  writeln!(out, "  rankdir=LR;").unwrap();
  writeln!(out, "  node [shape=record];").unwrap();
  render_body(&mut out, workflow, "", 1);
  writeln!(out, "}}").unwrap();
  out
}

impl Workflow {
  /// See [`to_dot`].
  pub fn to_dot(&self) -> String {
    to_dot(self)
  }
}

fn render_body(out: &mut String, workflow: &Workflow, scope: &str, depth: usize) {
  let pad = "  ".repeat(depth);

  for port in workflow.in_ports() {
    writeln!(
      out,
      "{}{} [shape=ellipse, label=\"{}\"];",
      pad,
      boundary_id(scope, "in", port.as_str()),
      escape(port.as_str())
    )
    .unwrap();
  }
  for port in workflow.out_ports() {
    writeln!(
      out,
      "{}{} [shape=ellipse, label=\"{}\"];",
      pad,
      boundary_id(scope, "out", port.as_str()),
      escape(port.as_str())
    )
    .unwrap();
  }

  for id in workflow.node_ids() {
    let scoped = scoped_id(scope, id);
    match workflow.node(id).expect("listed node exists") {
      Node::Component(c) => {
        let ins = c
          .component
          .in_ports()
          .iter()
          .map(|p| format!("<i_{}> {}", sanitize(p.as_str()), escape(p.as_str())))
          .collect::<Vec<_>>()
          .join(" | ");
        let outs = c
          .component
          .out_ports()
          .iter()
          .map(|p| format!("<o_{}> {}", sanitize(p.as_str()), escape(p.as_str())))
          .collect::<Vec<_>>()
          .join(" | ");
        let title = format!(
          "{} : {}",
          escape(id),
          escape(c.component.display_name())
        );
        writeln!(
          out,
          "{}{} [label=\"{{ {{ {} }} | {} | {{ {} }} }}\"];",
          pad,
          sanitize(&scoped),
          ins,
          title,
          outs
        )
        .unwrap();
      }
      Node::Workflow(w) => {
        writeln!(out, "{}subgraph cluster_{} {{", pad, sanitize(&scoped)).unwrap();
        writeln!(out, "{}  label=\"{}\";", pad, escape(id)).unwrap();
        render_body(out, &w.workflow, &scoped, depth + 1);
        writeln!(out, "{}}}", pad).unwrap();
      }
    }
  }

  for link in workflow.links() {
    let from = endpoint_ref(workflow, scope, &link.source, true);
    let to = endpoint_ref(workflow, scope, &link.dest, false);
    writeln!(out, "{}{} -> {};", pad, from, to).unwrap();
  }
}

fn endpoint_ref(workflow: &Workflow, scope: &str, endpoint: &Endpoint, source: bool) -> String {
  match endpoint {
    Endpoint::Node { node, port } => {
      let scoped = scoped_id(scope, node);
      match workflow.node(node) {
        Some(Node::Component(_)) => {
          let side = if source { "o" } else { "i" };
          format!("{}:{}_{}", sanitize(&scoped), side, sanitize(port.as_str()))
        }
        // edges into a nested workflow land on its boundary ellipses
        Some(Node::Workflow(_)) => {
          let side = if source { "out" } else { "in" };
          boundary_id(&scoped, side, port.as_str())
        }
        None => sanitize(&scoped),
      }
    }
    Endpoint::Boundary { port } => {
      let side = if source { "in" } else { "out" };
      boundary_id(scope, side, port.as_str())
    }
  }
}

fn scoped_id(scope: &str, id: &str) -> String {
  if scope.is_empty() {
    id.to_string()
  } else {
    format!("{}_{}", scope, id)
  }
}

fn boundary_id(scope: &str, side: &str, port: &str) -> String {
  if scope.is_empty() {
    format!("boundary_{}_{}", side, sanitize(port))
  } else {
    format!("{}_boundary_{}_{}", sanitize(scope), side, sanitize(port))
  }
}

fn sanitize(id: &str) -> String {
  id.chars()
    .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
    .collect()
}

fn escape(s: &str) -> String {
  s.replace('\\', "\\\\").replace('"', "\\\"")
}
