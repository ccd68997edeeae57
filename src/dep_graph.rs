//! Dependency graph over expression bindings
//!
//! Built fresh per validation or execute call: nodes are canonical paths
//! (both binding outputs and the paths their expressions reference), held
//! as dense integer indices; edges point from output to input. Cycle
//! detection and the evaluation order share one constructed graph.
//!
//! Uses FxHashMap for the node index and SmallVec for adjacency: most
//! bindings reference 0-4 paths.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::document::Document;
use crate::error::EngineError;
use crate::expr::Expr;
use crate::path::PropertyPath;

/// Stack-allocated adjacency list
pub type AdjVec = SmallVec<[usize; 4]>;

/// Which bindings participate, keyed on the target property's Output flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFilter {
    /// Every binding
    All,
    /// Only bindings whose target lacks the Output flag
    NonOutput,
    /// Only bindings whose target carries the Output flag
    Output,
}

impl OutputFilter {
    pub fn admits(self, is_output: bool) -> bool {
        match self {
            Self::All => true,
            Self::NonOutput => !is_output,
            Self::Output => is_output,
        }
    }
}

/// Directed graph with dense node indices
pub struct DepGraph {
    index_of: FxHashMap<PropertyPath, usize>,
    path_of: Vec<PropertyPath>,
    /// Indices that are binding outputs (the rest are input-only)
    outputs: FxHashSet<usize>,
    adjacency: Vec<AdjVec>,
}

impl DepGraph {
    /// Build the graph for the given bindings
    ///
    /// With a filter other than [`OutputFilter::All`], every admitted
    /// binding's target must resolve so its Output flag can be read;
    /// unresolvable targets fail with `PathInvalid`. Dependency paths are
    /// canonicalized before indexing; whole-object dependencies (empty
    /// property name) contribute no edge. Unresolvable dependency paths
    /// become nodes but never sources of edges.
    pub fn build<'a>(
        doc: &Document,
        owner: &Arc<str>,
        bindings: impl IntoIterator<Item = (&'a PropertyPath, &'a Expr)>,
        filter: OutputFilter,
    ) -> Result<Self, EngineError> {
        let mut graph = Self {
            index_of: FxHashMap::default(),
            path_of: Vec::new(),
            outputs: FxHashSet::default(),
            adjacency: Vec::new(),
        };

        for (path, expr) in bindings {
            if filter != OutputFilter::All {
                let property =
                    doc.property_at(path)
                        .ok_or_else(|| EngineError::PathInvalid {
                            path: path.to_string(),
                            reason: path.resolve_error(),
                        })?;
                if !filter.admits(property.is_output()) {
                    continue;
                }
            }

            let out = graph.node(path);
            graph.outputs.insert(out);

            for properties in expr.deps(owner).values() {
                for (property, dep_paths) in properties {
                    // Whole-object dependencies carry no path-level edge
                    if property.is_empty() {
                        continue;
                    }
                    for dep in dep_paths {
                        let target = graph.node(dep);
                        graph.adjacency[out].push(target);
                    }
                }
            }
        }

        Ok(graph)
    }

    fn node(&mut self, path: &PropertyPath) -> usize {
        if let Some(&index) = self.index_of.get(path) {
            return index;
        }
        let index = self.path_of.len();
        self.index_of.insert(path.clone(), index);
        self.path_of.push(path.clone());
        self.adjacency.push(AdjVec::new());
        index
    }

    pub fn node_count(&self) -> usize {
        self.path_of.len()
    }

    /// Depth-first cycle check
    ///
    /// Reports the source endpoint of the first back edge found, quoted in
    /// the diagnostic. If that endpoint is an input-only node, the edge
    /// target is quoted instead so the message always names a real path.
    pub fn validate_acyclic(&self) -> Result<(), EngineError> {
        let n = self.path_of.len();
        let mut color = vec![0u8; n]; // 0 white, 1 gray, 2 black

        for start in 0..n {
            if color[start] != 0 {
                continue;
            }
            color[start] = 1;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if next < self.adjacency[node].len() {
                    frame.1 += 1;
                    let child = self.adjacency[node][next];
                    match color[child] {
                        0 => {
                            color[child] = 1;
                            stack.push((child, 0));
                        }
                        1 => {
                            let quoted = if self.outputs.contains(&node) {
                                &self.path_of[node]
                            } else {
                                &self.path_of[child]
                            };
                            return Err(EngineError::CyclicDependency(format!(
                                "{} reference creates a cyclic dependency",
                                quoted
                            )));
                        }
                        _ => {}
                    }
                } else {
                    color[node] = 2;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Topological evaluation order: dependencies first, restricted to
    /// binding outputs (input-only nodes need no evaluation)
    pub fn evaluation_order(&self) -> Vec<PropertyPath> {
        let n = self.path_of.len();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(self.outputs.len());

        for start in 0..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if next < self.adjacency[node].len() {
                    frame.1 += 1;
                    let child = self.adjacency[node][next];
                    if !visited[child] {
                        visited[child] = true;
                        stack.push((child, 0));
                    }
                } else {
                    if self.outputs.contains(&node) {
                        order.push(self.path_of[node].clone());
                    }
                    stack.pop();
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::intern;
    use crate::parser::parse_expression;
    use serde_json::json;

    fn doc() -> Document {
        let mut doc = Document::new();
        doc.add_object("Calc")
            .add_property("A", json!(0.0))
            .add_property("B", json!(0.0))
            .add_property("C", json!(3.0))
            .add_output_property("Out", json!(0.0));
        doc
    }

    fn bindings(doc: &Document, pairs: &[(&str, &str)]) -> Vec<(PropertyPath, Expr)> {
        let owner = intern("Calc");
        pairs
            .iter()
            .map(|(path, text)| {
                (
                    doc.parse_path(path).unwrap().canonical(&owner),
                    parse_expression(doc, &owner, text).unwrap(),
                )
            })
            .collect()
    }

    fn build(doc: &Document, pairs: &[(PropertyPath, Expr)], filter: OutputFilter) -> DepGraph {
        let owner = intern("Calc");
        DepGraph::build(doc, &owner, pairs.iter().map(|(p, e)| (p, e)), filter).unwrap()
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let doc = doc();
        let pairs = bindings(&doc, &[("A", "B + 1"), ("B", "C * 2")]);
        let graph = build(&doc, &pairs, OutputFilter::All);

        graph.validate_acyclic().unwrap();
        let order = graph.evaluation_order();
        let rendered: Vec<String> = order.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["Calc.B", "Calc.A"]);
    }

    #[test]
    fn diamond_is_acyclic_and_complete() {
        let doc = doc();
        let pairs = bindings(&doc, &[("A", "B + C"), ("B", "C * 2"), ("Out", "A + B")]);
        let graph = build(&doc, &pairs, OutputFilter::All);

        graph.validate_acyclic().unwrap();
        let order = graph.evaluation_order();
        let pos = |name: &str| {
            order
                .iter()
                .position(|p| p.to_string() == name)
                .unwrap_or_else(|| panic!("{} missing from order", name))
        };
        assert!(pos("Calc.B") < pos("Calc.A"));
        assert!(pos("Calc.A") < pos("Calc.Out"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn cycle_is_reported_with_offending_path() {
        let doc = doc();
        let pairs = bindings(&doc, &[("A", "B + 1"), ("B", "A - 1")]);
        let graph = build(&doc, &pairs, OutputFilter::All);

        let err = graph.validate_acyclic().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cyclic dependency"), "{}", message);
        assert!(
            message.contains("Calc.A") || message.contains("Calc.B"),
            "{}",
            message
        );
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let doc = doc();
        let pairs = bindings(&doc, &[("A", "A + 1")]);
        let graph = build(&doc, &pairs, OutputFilter::All);
        assert!(graph.validate_acyclic().is_err());
    }

    #[test]
    fn output_filter_splits_bindings() {
        let doc = doc();
        let pairs = bindings(&doc, &[("A", "C + 1"), ("Out", "C * 2")]);

        let only_out = build(&doc, &pairs, OutputFilter::Output).evaluation_order();
        assert_eq!(only_out.len(), 1);
        assert_eq!(only_out[0].to_string(), "Calc.Out");

        let non_out = build(&doc, &pairs, OutputFilter::NonOutput).evaluation_order();
        assert_eq!(non_out.len(), 1);
        assert_eq!(non_out[0].to_string(), "Calc.A");
    }

    #[test]
    fn filtered_build_requires_resolvable_targets() {
        let doc = doc();
        let owner = intern("Calc");
        let missing = PropertyPath::new("Calc", "Ghost");
        let expr = parse_expression(&doc, &owner, "1 + 1").unwrap();

        let result = DepGraph::build(
            &doc,
            &owner,
            [(&missing, &expr)],
            OutputFilter::Output,
        );
        assert!(matches!(result, Err(EngineError::PathInvalid { .. })));

        // All-filter build records the node without resolving it
        let graph = DepGraph::build(&doc, &owner, [(&missing, &expr)], OutputFilter::All).unwrap();
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn whole_object_dependency_contributes_no_edge() {
        let mut doc = doc();
        doc.add_object("Label");
        let pairs = bindings(&doc, &[("A", "\"tag \" + Label")]);
        let graph = build(&doc, &pairs, OutputFilter::All);

        graph.validate_acyclic().unwrap();
        // One node for the output; the whole-object dep adds none
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn unknown_dependency_becomes_node_without_outgoing_edges() {
        let doc = doc();
        // "D" does not resolve anywhere, still participates as a node
        let pairs = bindings(&doc, &[("A", "D + 1")]);
        let graph = build(&doc, &pairs, OutputFilter::All);

        graph.validate_acyclic().unwrap();
        assert_eq!(graph.node_count(), 2);
        let order = graph.evaluation_order();
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].to_string(), "Calc.A");
    }
}
