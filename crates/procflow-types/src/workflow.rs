//! Workflow domain types for Procflow.
//!
//! Defines the canonical representation of a workflow: an immutable tree of
//! sequential and parallel groups whose leaves are capability-invoking steps.
//! Loaders (YAML files, programmatic builders) all converge on
//! `WorkflowDefinition`; the engine never mutates it. This module also
//! contains the execution-side record types (`StepResult`, `ExecutionTrace`)
//! and the status enums shared between them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DefinitionError, ErrorKind};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable workflow definition.
///
/// The single source of truth for a workflow's shape. Constructed once by an
/// external loader, validated by preflight, then only read during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name. Also the concurrency-limiting key.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional freeform version label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whole-run deadline in seconds (None = engine default applies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum concurrent runs of this workflow name (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// The root group. Execution starts here.
    pub root: GroupNode,
    /// Extensible metadata (custom integrations, provenance).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Every step in the tree, depth-first, including `on_failure` subtrees.
    pub fn all_steps(&self) -> Vec<&StepDefinition> {
        let mut steps = Vec::new();
        for child in &self.root.steps {
            collect_steps(child, &mut steps);
        }
        steps
    }

    /// Looks up a step by id anywhere in the tree.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.all_steps().into_iter().find(|s| s.id == step_id)
    }
}

fn collect_steps<'a>(node: &'a WorkflowNode, out: &mut Vec<&'a StepDefinition>) {
    match node {
        WorkflowNode::Step(step) => {
            out.push(step);
            if let Some(fallback) = &step.on_failure {
                collect_steps(fallback, out);
            }
        }
        WorkflowNode::Group(group) => {
            for child in &group.steps {
                collect_steps(child, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node Tree
// ---------------------------------------------------------------------------

/// One node in the workflow tree: a group or a step.
///
/// Untagged on the wire: a mapping with a `group` key is a group, a mapping
/// with a `capability` key is a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowNode {
    Group(GroupNode),
    Step(StepDefinition),
}

/// A sequential or parallel composition of child nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupNode {
    /// Optional label used in logs; never referenced by other nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Scheduling mode for the children.
    #[serde(rename = "group")]
    pub kind: GroupKind,
    /// Child nodes. Order is execution order for sequential groups.
    pub steps: Vec<WorkflowNode>,
}

/// Scheduling mode of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Children run strictly in order; each waits for the previous one to
    /// reach a terminal, non-aborting state.
    Sequential,
    /// Children run concurrently, ordered only by variable dependencies.
    Parallel,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single unit of work bound to one capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step id (e.g. "gather-data"). Unique within a workflow.
    pub id: String,
    /// Name of the registered capability this step invokes.
    pub capability: String,
    /// Parameter name -> literal or `$var` reference.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputValue>,
    /// Variable name the step's output is published under on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<String>,
    /// Optional JEXL expression; `$name` references workflow variables.
    /// False means the step is skipped, not failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Retry configuration. Absent means exactly one attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    /// Fallback step or group run if every attempt fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<WorkflowNode>>,
    /// Whether this step's terminal failure aborts the whole workflow.
    #[serde(default)]
    pub critical: bool,
    /// Per-attempt timeout in seconds (None = engine default applies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    /// Effective attempt budget: 1 when no retry block is declared.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts)
    }

    /// Root variable names this step reads through its `inputs`.
    pub fn input_variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .inputs
            .values()
            .filter_map(|value| match value {
                InputValue::Var(reference) => Some(reference.name.as_str()),
                InputValue::Literal(_) => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

// ---------------------------------------------------------------------------
// Input Values
// ---------------------------------------------------------------------------

/// One `inputs` entry: a literal value or a variable reference.
///
/// String form on the wire:
/// - `"$report"` is a reference to variable `report`
/// - `"$report.size"` navigates into the structured value
/// - `"$$cash"` escapes to the literal string `"$cash"`
/// - any non-string value is always a literal
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// Copied into the capability call as-is.
    Literal(serde_json::Value),
    /// Resolved against the variable store when the step starts.
    Var(VarRef),
}

impl InputValue {
    /// Parses the string form described on the type.
    pub fn parse_text(text: &str) -> Result<Self, DefinitionError> {
        if let Some(rest) = text.strip_prefix("$$") {
            return Ok(InputValue::Literal(serde_json::Value::String(format!(
                "${rest}"
            ))));
        }
        if let Some(reference) = text.strip_prefix('$') {
            return Ok(InputValue::Var(VarRef::parse(reference)?));
        }
        Ok(InputValue::Literal(serde_json::Value::String(
            text.to_string(),
        )))
    }
}

impl Serialize for InputValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            InputValue::Var(reference) => serializer.serialize_str(&format!("${reference}")),
            InputValue::Literal(serde_json::Value::String(text)) if text.starts_with('$') => {
                serializer.serialize_str(&format!("${text}"))
            }
            InputValue::Literal(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(text) => {
                InputValue::parse_text(&text).map_err(serde::de::Error::custom)
            }
            other => Ok(InputValue::Literal(other)),
        }
    }
}

/// A parsed `$name[.segment...]` variable reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    /// Root variable name looked up in the store.
    pub name: String,
    /// Path segments navigated below the root value. Numeric segments index
    /// into arrays.
    pub path: Vec<String>,
}

impl VarRef {
    /// Parses `name[.segment...]` (without the leading `$`).
    pub fn parse(reference: &str) -> Result<Self, DefinitionError> {
        let invalid = |reason: &str| DefinitionError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = reference.split('.');
        let name = segments.next().unwrap_or_default();
        if name.is_empty() {
            return Err(invalid("empty variable name"));
        }
        if !is_valid_var_name(name) {
            return Err(invalid(
                "variable names must start with a letter or underscore and contain only alphanumerics or underscores",
            ));
        }

        let mut path = Vec::new();
        for segment in segments {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(invalid("path segments may only contain alphanumerics, underscores, or dashes"));
            }
            path.push(segment.to_string());
        }

        Ok(VarRef {
            name: name.to_string(),
            path,
        })
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// Whether `name` is usable as a workflow variable (and thus as a `vars.*`
/// identifier in condition expressions).
pub fn is_valid_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Whether `id` is usable as a workflow or step identifier. Dashes are
/// allowed here but not in variable names, which double as expression
/// identifiers.
pub fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a step. Attempts are 1-based: `max_attempts: 3`
/// means the step runs at most three times in total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Maximum number of attempts (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts, in milliseconds (default 1000).
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// How the delay grows across attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Upper bound on a single delay for exponential backoff (None = engine
    /// default applies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

/// Delay growth policy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// `delay * 2^(attempt-1)`, capped at `max_delay_ms`.
    Exponential,
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }
}

/// Why a step ended `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's `condition` evaluated to false.
    ConditionFalse,
    /// The run was cancelled before or while the step ran.
    Cancelled,
}

/// Aggregate status of a completed run.
///
/// Aborted runs never produce a trace, so there is no `Aborted` variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded or was skipped by its condition.
    Succeeded,
    /// At least one non-critical step failed; the rest of the run completed.
    PartialFailure,
    /// The run was cancelled cooperatively.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Step Result & Trace
// ---------------------------------------------------------------------------

/// Terminal record of one step's execution, emitted on the trace stream.
///
/// Immutable once the step reaches `Succeeded`, `Failed`, or `Skipped`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id matching `StepDefinition.id`.
    pub step_id: String,
    /// Terminal state.
    pub state: StepState,
    /// Attempts actually started (0 for steps that never ran).
    pub attempts: u32,
    /// Output value returned by the capability (present on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Variable name the output was published under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced: Option<String>,
    /// Final error message (present on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Transient/permanent classification of the final error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Why the step was skipped (present when `state` is `Skipped`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// When the first attempt started (None for steps that never ran).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached its terminal state.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration across all attempts, in milliseconds.
    pub duration_ms: u64,
}

impl StepResult {
    /// Record for a step that never ran (condition false, or cancelled while
    /// still pending).
    pub fn skipped(step_id: impl Into<String>, reason: SkipReason) -> Self {
        StepResult {
            step_id: step_id.into(),
            state: StepState::Skipped,
            attempts: 0,
            output: None,
            produced: None,
            error: None,
            error_kind: None,
            skip_reason: Some(reason),
            started_at: None,
            finished_at: Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Complete record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// UUIDv7 run id.
    pub run_id: Uuid,
    /// Name of the workflow that ran.
    pub workflow_name: String,
    /// Aggregate status over the whole trace.
    pub status: RunStatus,
    /// Terminal step results in completion order.
    pub results: Vec<StepResult>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionTrace {
    /// The result for a step id, if it reached a terminal state.
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    /// Ids of steps that ended `Failed`.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.state == StepState::Failed)
            .map(|r| r.step_id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PIPELINE_YAML: &str = r#"
name: daily-report
description: Gather, lint, publish
version: "1.2"
timeout_secs: 600
concurrency: 2
root:
  group: sequential
  steps:
    - id: fetch
      capability: http_get
      inputs:
        url: "https://example.com/data"
      produces: report
      retry:
        max_attempts: 3
        delay_ms: 200
        backoff: exponential
    - group: parallel
      id: checks
      steps:
        - id: lint
          capability: run_linter
          inputs:
            body: "$report"
        - id: spellcheck
          capability: run_spellcheck
          inputs:
            body: "$report.text"
            strict: true
    - id: publish
      capability: publisher
      condition: "$report.size > 0"
      inputs:
        body: "$report"
        prefix: "$$USD"
      critical: true
      on_failure:
        id: notify-failure
        capability: notifier
        inputs:
          message: "publish failed"
"#;

    #[test]
    fn test_parse_full_pipeline_yaml() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        assert_eq!(def.name, "daily-report");
        assert_eq!(def.timeout_secs, Some(600));
        assert_eq!(def.concurrency, Some(2));
        assert_eq!(def.root.kind, GroupKind::Sequential);
        assert_eq!(def.root.steps.len(), 3);

        let fetch = def.step("fetch").unwrap();
        assert_eq!(fetch.capability, "http_get");
        assert_eq!(fetch.produces.as_deref(), Some("report"));
        let retry = fetch.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay_ms, 200);
        assert_eq!(retry.backoff, BackoffPolicy::Exponential);

        match &def.root.steps[1] {
            WorkflowNode::Group(group) => {
                assert_eq!(group.kind, GroupKind::Parallel);
                assert_eq!(group.id.as_deref(), Some("checks"));
                assert_eq!(group.steps.len(), 2);
            }
            WorkflowNode::Step(_) => panic!("expected the checks group"),
        }

        let publish = def.step("publish").unwrap();
        assert!(publish.critical);
        assert_eq!(publish.condition.as_deref(), Some("$report.size > 0"));
        assert!(publish.on_failure.is_some());
        // fallback steps are visible through all_steps
        assert!(def.step("notify-failure").is_some());
    }

    #[test]
    fn test_all_steps_walks_groups_and_fallbacks() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        let ids: Vec<&str> = def.all_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["fetch", "lint", "spellcheck", "publish", "notify-failure"]
        );
    }

    #[test]
    fn test_input_value_variable_reference() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        let spellcheck = def.step("spellcheck").unwrap();
        match &spellcheck.inputs["body"] {
            InputValue::Var(reference) => {
                assert_eq!(reference.name, "report");
                assert_eq!(reference.path, vec!["text".to_string()]);
            }
            InputValue::Literal(_) => panic!("expected a variable reference"),
        }
        assert_eq!(spellcheck.inputs["strict"], InputValue::Literal(json!(true)));
    }

    #[test]
    fn test_input_value_dollar_escape() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        let publish = def.step("publish").unwrap();
        assert_eq!(
            publish.inputs["prefix"],
            InputValue::Literal(json!("$USD"))
        );
    }

    #[test]
    fn test_input_value_serialize_roundtrip() {
        let values = vec![
            InputValue::Literal(json!("plain")),
            InputValue::Literal(json!("$needs-escaping")),
            InputValue::Literal(json!(42)),
            InputValue::Literal(json!({"nested": [1, 2]})),
            InputValue::Var(VarRef::parse("report").unwrap()),
            InputValue::Var(VarRef::parse("report.items.0.name").unwrap()),
        ];
        for value in values {
            let json = serde_json::to_string(&value).unwrap();
            let parsed: InputValue = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, value, "round-trip failed for {json}");
        }
    }

    #[test]
    fn test_input_value_escape_wire_form() {
        let literal = InputValue::Literal(json!("$USD"));
        assert_eq!(serde_json::to_string(&literal).unwrap(), "\"$$USD\"");

        let reference = InputValue::Var(VarRef::parse("report.size").unwrap());
        assert_eq!(
            serde_json::to_string(&reference).unwrap(),
            "\"$report.size\""
        );
    }

    #[test]
    fn test_var_ref_rejects_bad_references() {
        assert!(VarRef::parse("").is_err());
        assert!(VarRef::parse("9lives").is_err());
        assert!(VarRef::parse("has space").is_err());
        assert!(VarRef::parse("report..size").is_err());
        assert!(VarRef::parse("report.").is_err());
        // dashes are fine in path segments but not in root names
        assert!(VarRef::parse("my-var").is_err());
        assert!(VarRef::parse("report.dash-key").is_ok());
    }

    #[test]
    fn test_var_ref_display() {
        let reference = VarRef::parse("report.items.0").unwrap();
        assert_eq!(reference.to_string(), "report.items.0");
    }

    #[test]
    fn test_bad_reference_fails_deserialization() {
        let result: Result<InputValue, _> = serde_json::from_str("\"$9bad\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_is_valid_var_name() {
        assert!(is_valid_var_name("report"));
        assert!(is_valid_var_name("_hidden"));
        assert!(is_valid_var_name("snake_case_2"));
        assert!(!is_valid_var_name(""));
        assert!(!is_valid_var_name("2fast"));
        assert!(!is_valid_var_name("dash-name"));
    }

    #[test]
    fn test_retry_spec_defaults() {
        let retry: RetrySpec = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay_ms, 1000);
        assert_eq!(retry.backoff, BackoffPolicy::Fixed);
        assert_eq!(retry.max_delay_ms, None);
    }

    #[test]
    fn test_max_attempts_defaults_to_one_without_retry_block() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        assert_eq!(def.step("lint").unwrap().max_attempts(), 1);
        assert_eq!(def.step("fetch").unwrap().max_attempts(), 3);
    }

    #[test]
    fn test_input_variables_deduplicates() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        let publish = def.step("publish").unwrap();
        assert_eq!(publish.input_variables(), vec!["report"]);
    }

    #[test]
    fn test_step_state_terminality() {
        assert!(StepState::Succeeded.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(!StepState::Retrying.is_terminal());
    }

    #[test]
    fn test_status_enums_serde() {
        assert_eq!(
            serde_json::to_string(&StepState::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::PartialFailure).unwrap(),
            "\"partial_failure\""
        );
        assert_eq!(
            serde_json::to_string(&SkipReason::ConditionFalse).unwrap(),
            "\"condition_false\""
        );
        assert_eq!(
            serde_json::to_string(&GroupKind::Parallel).unwrap(),
            "\"parallel\""
        );
    }

    #[test]
    fn test_step_result_serde_omits_empty_fields() {
        let result = StepResult::skipped("lint", SkipReason::ConditionFalse);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"state\":\"skipped\""));
        assert!(json.contains("\"skip_reason\":\"condition_false\""));
        assert!(!json.contains("output"));
        assert!(!json.contains("error"));
        assert!(!json.contains("started_at"));

        let parsed: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, StepState::Skipped);
        assert_eq!(parsed.attempts, 0);
    }

    #[test]
    fn test_execution_trace_lookup() {
        let now = Utc::now();
        let trace = ExecutionTrace {
            run_id: Uuid::now_v7(),
            workflow_name: "daily-report".to_string(),
            status: RunStatus::PartialFailure,
            results: vec![
                StepResult {
                    step_id: "fetch".to_string(),
                    state: StepState::Succeeded,
                    attempts: 1,
                    output: Some(json!({"size": 5})),
                    produced: Some("report".to_string()),
                    error: None,
                    error_kind: None,
                    skip_reason: None,
                    started_at: Some(now),
                    finished_at: now,
                    duration_ms: 12,
                },
                StepResult {
                    step_id: "lint".to_string(),
                    state: StepState::Failed,
                    attempts: 3,
                    output: None,
                    produced: None,
                    error: Some("transient capability failure: flaky".to_string()),
                    error_kind: Some(ErrorKind::Transient),
                    skip_reason: None,
                    started_at: Some(now),
                    finished_at: now,
                    duration_ms: 40,
                },
            ],
            started_at: now,
            finished_at: now,
            duration_ms: 60,
        };

        assert_eq!(
            trace.result("fetch").unwrap().produced.as_deref(),
            Some("report")
        );
        assert!(trace.result("missing").is_none());
        assert_eq!(trace.failed_steps(), vec!["lint"]);
    }

    #[test]
    fn test_definition_yaml_roundtrip() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(PIPELINE_YAML).unwrap();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let reparsed: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(reparsed.name, def.name);
        assert_eq!(reparsed.all_steps().len(), def.all_steps().len());
        // the $$ escape survives a serialize/parse cycle
        assert_eq!(
            reparsed.step("publish").unwrap().inputs["prefix"],
            InputValue::Literal(json!("$USD"))
        );
    }
}
