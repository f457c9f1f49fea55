//! Workflow definition parsing and preflight validation.
//!
//! Converts between YAML/JSON text and the canonical `WorkflowDefinition`
//! tree and validates it in two passes:
//!
//! - [`validate_structure`] is context-free (identifier formats, group
//!   shapes, retry and timeout bounds, fallback nesting) and runs as part
//!   of [`parse_workflow_yaml`] / [`parse_workflow_json`].
//! - [`validate_definition`] additionally needs the registered capability
//!   names and the caller's initial variables; the runner applies it before
//!   any step of a run executes, so execution always starts from a
//!   fully-checked tree and never discovers a definition error mid-run.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use procflow_types::error::DefinitionError;
use procflow_types::workflow::{
    GroupKind, GroupNode, StepDefinition, WorkflowDefinition, WorkflowNode, is_valid_identifier,
    is_valid_var_name,
};

use crate::expression::condition_variables;
use crate::graph;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum nesting of `on_failure` subtrees. A step whose rescue chain is
/// already this deep may not declare another fallback.
pub const MAX_FALLBACK_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced when loading a workflow definition from text.
#[derive(Debug, Error)]
pub enum WorkflowLoadError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error(transparent)]
    Invalid(#[from] DefinitionError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a structurally valid `WorkflowDefinition`.
///
/// Runs [`validate_structure`] after deserialization. Capability names and
/// variable resolvability are checked later by the runner, which knows the
/// registry and the run's initial variables.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowLoadError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowLoadError::ParseError(e.to_string()))?;
    validate_structure(&def)?;
    Ok(def)
}

/// Parse a JSON string into a structurally valid `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowLoadError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowLoadError::ParseError(e.to_string()))?;
    validate_structure(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowLoadError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowLoadError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Structural validation (context-free)
// ---------------------------------------------------------------------------

/// Validate everything that can be checked from the definition alone.
///
/// Checks:
/// - workflow name format
/// - workflow timeout and concurrency bounds
/// - the root group and every nested group have at least one child
/// - step and group ids are well-formed and unique across the whole tree
/// - `produces` names are well-formed and unique, except that a fallback
///   step may re-declare the name of the step it rescues (the two are
///   mutually exclusive at runtime)
/// - retry bounds (`max_attempts >= 1`, `max_delay_ms >= delay_ms`)
/// - step timeouts are positive
/// - conditions are non-empty
/// - `on_failure` nesting stays within [`MAX_FALLBACK_DEPTH`]
pub fn validate_structure(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if !is_valid_identifier(&def.name) {
        return Err(DefinitionError::InvalidWorkflowName(def.name.clone()));
    }

    if let Some(t) = def.timeout_secs {
        if t == 0 {
            return Err(DefinitionError::InvalidWorkflowTimeout(
                "timeout_secs must be positive".to_string(),
            ));
        }
    }
    if let Some(c) = def.concurrency {
        if c == 0 {
            return Err(DefinitionError::InvalidConcurrency(
                "concurrency must be at least 1".to_string(),
            ));
        }
    }

    if def.root.steps.is_empty() {
        return Err(DefinitionError::EmptyWorkflow);
    }

    let mut walk = StructureWalk::default();
    walk.group(&def.root, 0, &HashMap::new())?;
    Ok(())
}

#[derive(Default)]
struct StructureWalk<'a> {
    seen_ids: HashSet<&'a str>,
    produces_owner: HashMap<&'a str, &'a str>,
}

impl<'a> StructureWalk<'a> {
    fn group(
        &mut self,
        group: &'a GroupNode,
        depth: usize,
        exempt: &HashMap<&'a str, &'a str>,
    ) -> Result<(), DefinitionError> {
        if let Some(id) = &group.id {
            self.claim_id(id)?;
        }
        if group.steps.is_empty() {
            let label = group.id.clone().unwrap_or_else(|| "<anonymous>".to_string());
            return Err(DefinitionError::EmptyGroup(label));
        }
        for child in &group.steps {
            self.node(child, depth, exempt)?;
        }
        Ok(())
    }

    fn node(
        &mut self,
        node: &'a WorkflowNode,
        depth: usize,
        exempt: &HashMap<&'a str, &'a str>,
    ) -> Result<(), DefinitionError> {
        match node {
            WorkflowNode::Group(group) => self.group(group, depth, exempt),
            WorkflowNode::Step(step) => self.step(step, depth, exempt),
        }
    }

    fn step(
        &mut self,
        step: &'a StepDefinition,
        depth: usize,
        exempt: &HashMap<&'a str, &'a str>,
    ) -> Result<(), DefinitionError> {
        self.claim_id(&step.id)?;

        if let Some(name) = &step.produces {
            if !is_valid_var_name(name) {
                return Err(DefinitionError::InvalidVariableName {
                    step_id: step.id.clone(),
                    name: name.clone(),
                });
            }
            if let Some(&first) = self.produces_owner.get(name.as_str()) {
                // A fallback step may take over the name of the step it
                // rescues; any other duplication is an error, including a
                // second takeover of the same name.
                let rescued_owner = exempt.get(name.as_str()).copied();
                if rescued_owner != Some(first) {
                    return Err(DefinitionError::DuplicateProduces {
                        name: name.clone(),
                        first: first.to_string(),
                        second: step.id.clone(),
                    });
                }
            }
            self.produces_owner.insert(name, &step.id);
        }

        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(DefinitionError::InvalidRetry {
                    step_id: step.id.clone(),
                    reason: "max_attempts must be at least 1".to_string(),
                });
            }
            if let Some(max_delay) = retry.max_delay_ms {
                if max_delay < retry.delay_ms {
                    return Err(DefinitionError::InvalidRetry {
                        step_id: step.id.clone(),
                        reason: format!(
                            "max_delay_ms ({max_delay}) must be >= delay_ms ({})",
                            retry.delay_ms
                        ),
                    });
                }
            }
        }

        if let Some(t) = step.timeout_secs {
            if t == 0 {
                return Err(DefinitionError::InvalidTimeout {
                    step_id: step.id.clone(),
                    reason: "timeout_secs must be positive".to_string(),
                });
            }
        }

        if let Some(condition) = &step.condition {
            if condition.trim().is_empty() {
                return Err(DefinitionError::InvalidCondition {
                    step_id: step.id.clone(),
                    reason: "condition is empty".to_string(),
                });
            }
        }

        if let Some(fallback) = &step.on_failure {
            if depth >= MAX_FALLBACK_DEPTH {
                return Err(DefinitionError::FallbackTooDeep {
                    step_id: step.id.clone(),
                    max_depth: MAX_FALLBACK_DEPTH,
                });
            }
            let mut inner = exempt.clone();
            if let Some(name) = &step.produces {
                inner.insert(name.as_str(), step.id.as_str());
            }
            self.node(fallback, depth + 1, &inner)?;
        }

        Ok(())
    }

    fn claim_id(&mut self, id: &'a str) -> Result<(), DefinitionError> {
        if !is_valid_identifier(id) {
            return Err(DefinitionError::InvalidStepId(id.to_string()));
        }
        if !self.seen_ids.insert(id) {
            return Err(DefinitionError::DuplicateStepId(id.to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Full preflight validation
// ---------------------------------------------------------------------------

/// Validate a definition against the world it will run in.
///
/// Runs [`validate_structure`], then checks that every step's capability is
/// registered and that every `$name` reference (inputs and conditions) can
/// resolve to an initial variable, a sequential predecessor's `produces`,
/// or a parallel sibling ordered before the step by dependency analysis.
/// Parallel sibling dependency cycles are rejected here.
///
/// Availability is optimistic: a producer that fails or is skipped at
/// runtime simply never publishes, and the consumer fails at input
/// resolution instead.
pub fn validate_definition(
    def: &WorkflowDefinition,
    initial_vars: &HashSet<String>,
    capability_names: &HashSet<String>,
) -> Result<(), DefinitionError> {
    validate_structure(def)?;

    for step in def.all_steps() {
        if !capability_names.contains(&step.capability) {
            return Err(DefinitionError::UnknownCapability {
                step_id: step.id.clone(),
                capability: step.capability.clone(),
            });
        }
    }

    let mut available: HashSet<String> = initial_vars.iter().cloned().collect();
    check_group(&def.root, &mut available)?;
    Ok(())
}

/// Check a group's references; on success, extend `available` with every
/// variable the group's subtree can produce.
fn check_group(group: &GroupNode, available: &mut HashSet<String>) -> Result<(), DefinitionError> {
    match group.kind {
        GroupKind::Sequential => {
            for child in &group.steps {
                check_node(child, available)?;
            }
        }
        GroupKind::Parallel => {
            graph::check_sibling_cycles(group)?;
            // Each child may see anything its siblings can produce; the
            // cycle check above guarantees a consistent launch order
            // exists, and the scheduler enforces it at runtime.
            let subtree_produced: Vec<HashSet<String>> =
                group.steps.iter().map(graph::produced_vars).collect();
            for (index, child) in group.steps.iter().enumerate() {
                let mut child_avail = available.clone();
                for (sibling, names) in subtree_produced.iter().enumerate() {
                    if sibling != index {
                        child_avail.extend(names.iter().cloned());
                    }
                }
                check_node(child, &mut child_avail)?;
            }
            for names in subtree_produced {
                available.extend(names);
            }
        }
    }
    Ok(())
}

fn check_node(node: &WorkflowNode, available: &mut HashSet<String>) -> Result<(), DefinitionError> {
    match node {
        WorkflowNode::Group(group) => check_group(group, available),
        WorkflowNode::Step(step) => check_step(step, available),
    }
}

fn check_step(step: &StepDefinition, available: &mut HashSet<String>) -> Result<(), DefinitionError> {
    for variable in step.input_variables() {
        if !available.contains(variable) {
            return Err(DefinitionError::UnresolvedVariable {
                step_id: step.id.clone(),
                variable: variable.to_string(),
            });
        }
    }
    if let Some(condition) = &step.condition {
        for variable in condition_variables(condition) {
            if !available.contains(&variable) {
                return Err(DefinitionError::UnresolvedVariable {
                    step_id: step.id.clone(),
                    variable,
                });
            }
        }
    }

    // The fallback sees what its step saw, never the step's own output.
    if let Some(fallback) = &step.on_failure {
        let mut fallback_avail = available.clone();
        check_node(fallback, &mut fallback_avail)?;
        available.extend(fallback_avail);
    }

    if let Some(name) = &step.produces {
        available.insert(name.clone());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
