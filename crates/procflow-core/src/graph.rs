//! Variable dependency analysis for parallel groups.
//!
//! Parallel children are not assumed independent: a child that consumes a
//! sibling's `produces` variable must not launch until that sibling is
//! terminal. Uses `petgraph` to order same-level parallel children by
//! variable dependency; a resolvable dependency cycle between siblings is a
//! definition-time error, detected before any step runs.

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use procflow_types::error::DefinitionError;
use procflow_types::workflow::{GroupNode, WorkflowNode};

use crate::expression::condition_variables;

// ---------------------------------------------------------------------------
// Subtree variable sets
// ---------------------------------------------------------------------------

/// Variable names produced anywhere in a subtree, fallback branches
/// included.
pub fn produced_vars(node: &WorkflowNode) -> HashSet<String> {
    let mut produced = HashSet::new();
    collect_produced(node, &mut produced);
    produced
}

fn collect_produced(node: &WorkflowNode, out: &mut HashSet<String>) {
    match node {
        WorkflowNode::Step(step) => {
            if let Some(name) = &step.produces {
                out.insert(name.clone());
            }
            if let Some(fallback) = &step.on_failure {
                collect_produced(fallback, out);
            }
        }
        WorkflowNode::Group(group) => {
            for child in &group.steps {
                collect_produced(child, out);
            }
        }
    }
}

/// Variables a subtree needs from its surroundings before it can start.
///
/// The union of every contained step's input references and condition
/// references, minus everything the subtree itself produces (internal
/// sequencing satisfies those). Fallback branches count on both sides: a
/// fallback may run at any point after its step fails, so its requirements
/// gate the subtree like any other step's.
pub fn required_vars(node: &WorkflowNode) -> HashSet<String> {
    let mut required = HashSet::new();
    collect_required(node, &mut required);
    for name in produced_vars(node) {
        required.remove(&name);
    }
    required
}

fn collect_required(node: &WorkflowNode, out: &mut HashSet<String>) {
    match node {
        WorkflowNode::Step(step) => {
            for name in step.input_variables() {
                out.insert(name.to_string());
            }
            if let Some(condition) = &step.condition {
                out.extend(condition_variables(condition));
            }
            if let Some(fallback) = &step.on_failure {
                collect_required(fallback, out);
            }
        }
        WorkflowNode::Group(group) => {
            for child in &group.steps {
                collect_required(child, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sibling ordering
// ---------------------------------------------------------------------------

/// For each child of a parallel group, the sibling-produced variables it
/// must wait for before launching.
///
/// Index-aligned with `group.steps`. A child with an empty set is ready
/// immediately; the scheduler launches the rest as their producer siblings
/// reach a terminal state.
pub fn sibling_dependencies(group: &GroupNode) -> Vec<HashSet<String>> {
    let produced: Vec<HashSet<String>> = group.steps.iter().map(produced_vars).collect();
    let required: Vec<HashSet<String>> = group.steps.iter().map(required_vars).collect();

    (0..group.steps.len())
        .map(|child| {
            let mut pool = HashSet::new();
            for (sibling, names) in produced.iter().enumerate() {
                if sibling != child {
                    pool.extend(names.iter().cloned());
                }
            }
            &required[child] & &pool
        })
        .collect()
}

/// Check a parallel group's children for variable dependency cycles.
///
/// Builds a directed graph with an edge from producer to consumer for every
/// sibling pair where one child requires a variable another produces, then
/// topologically sorts it.
pub fn check_sibling_cycles(group: &GroupNode) -> Result<(), DefinitionError> {
    let produced: Vec<HashSet<String>> = group.steps.iter().map(produced_vars).collect();
    let required: Vec<HashSet<String>> = group.steps.iter().map(required_vars).collect();

    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<_> = (0..group.steps.len()).map(|i| graph.add_node(i)).collect();

    for (consumer, requires) in required.iter().enumerate() {
        for (producer, produces) in produced.iter().enumerate() {
            if producer != consumer && !requires.is_disjoint(produces) {
                graph.add_edge(node_indices[producer], node_indices[consumer], ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let child = graph[cycle.node_id()];
        DefinitionError::CyclicDependency {
            cycle: node_label(&group.steps[child]),
        }
    })?;

    Ok(())
}

/// Human-readable label for a node in diagnostics.
pub(crate) fn node_label(node: &WorkflowNode) -> String {
    match node {
        WorkflowNode::Step(step) => step.id.clone(),
        WorkflowNode::Group(group) => group
            .id
            .clone()
            .unwrap_or_else(|| "<anonymous group>".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
