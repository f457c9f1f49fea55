//! Node scheduling: sequential ordering, parallel launch gating, and
//! subtree result aggregation.
//!
//! A workflow tree is executed by walking it from the root. Sequential
//! groups run children strictly in declaration order. Parallel groups
//! launch every child whose sibling-produced variables are available and
//! hold the rest back until their producers finish, using the same
//! dependency analysis that validation ran at load time. Aborts (critical
//! step failure) propagate upward immediately and drop in-flight siblings.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use procflow_types::error::WorkflowAborted;
use procflow_types::workflow::{GroupKind, GroupNode, StepResult, StepState, WorkflowNode};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::context::VariableStore;
use crate::event::EventBus;
use crate::expression::ConditionEvaluator;
use crate::graph;
use crate::step::run_step;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Everything a node needs to execute, cheap to clone per spawned child.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub store: VariableStore,
    pub registry: Arc<CapabilityRegistry>,
    pub evaluator: Arc<ConditionEvaluator>,
    pub bus: EventBus,
    /// Per-run stream of terminal step records, in completion order.
    pub results_tx: mpsc::Sender<StepResult>,
    pub cancel: CancellationToken,
    pub default_step_timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// NodeOutcome
// ---------------------------------------------------------------------------

/// Aggregate result of one executed node (step or group subtree).
#[derive(Debug)]
pub(crate) struct NodeOutcome {
    /// Terminal records for every step in the subtree, in completion order.
    pub results: Vec<StepResult>,
    /// Aggregate state: a step's own terminal state, or for groups the
    /// fold of the children (sequential: last child; parallel: failed if
    /// any child failed, skipped only if all children skipped).
    pub state: StepState,
}

// ---------------------------------------------------------------------------
// Node execution
// ---------------------------------------------------------------------------

/// Execute one workflow node to completion.
///
/// Boxed because groups recurse through fallback branches and nested
/// groups of arbitrary shape. `Err` means the whole run must abort; the
/// caller stops scheduling further work.
pub(crate) fn run_node(
    ctx: RunContext,
    node: WorkflowNode,
) -> Pin<Box<dyn Future<Output = Result<NodeOutcome, WorkflowAborted>> + Send>> {
    Box::pin(async move {
        match node {
            WorkflowNode::Step(step) => run_step(ctx, step).await,
            WorkflowNode::Group(group) => match group.kind {
                GroupKind::Sequential => run_sequential(ctx, group).await,
                GroupKind::Parallel => run_parallel(ctx, group).await,
            },
        }
    })
}

/// Run children one after another. A cancelled run still walks the rest of
/// the children so every step lands in the trace as skipped.
async fn run_sequential(
    ctx: RunContext,
    group: GroupNode,
) -> Result<NodeOutcome, WorkflowAborted> {
    let mut results = Vec::new();
    let mut state = StepState::Succeeded;

    for child in group.steps {
        let outcome = run_node(ctx.clone(), child).await?;
        state = outcome.state;
        results.extend(outcome.results);
    }

    Ok(NodeOutcome { results, state })
}

/// Run children concurrently, gating each child on the variables its
/// siblings produce.
///
/// A child becomes launchable once every sibling-produced variable it
/// reads is either published or owned by a child that already reached a
/// terminal state. The second case covers producers that failed or were
/// skipped: their consumers run anyway and fail at input resolution, which
/// is the observable error the author can act on. A gate variable that is
/// already bound when the group starts is an initial default a sibling
/// shadows; it waits on the producer alone, since store presence would
/// hand the consumer the stale default.
async fn run_parallel(
    ctx: RunContext,
    group: GroupNode,
) -> Result<NodeOutcome, WorkflowAborted> {
    let dependencies = graph::sibling_dependencies(&group);
    let produced: Vec<HashSet<String>> = group.steps.iter().map(graph::produced_vars).collect();
    let shadowed: HashSet<String> = dependencies
        .iter()
        .flatten()
        .filter(|name| ctx.store.contains(name))
        .cloned()
        .collect();
    let label = group
        .id
        .clone()
        .unwrap_or_else(|| "<anonymous group>".to_string());

    tracing::debug!(
        run_id = %ctx.run_id,
        group = label.as_str(),
        children = group.steps.len(),
        "scheduling parallel group"
    );

    let mut slots: Vec<Option<WorkflowNode>> = group.steps.into_iter().map(Some).collect();
    let mut released: HashSet<String> = HashSet::new();
    let mut join_set: JoinSet<(usize, Result<NodeOutcome, WorkflowAborted>)> = JoinSet::new();

    let mut results = Vec::new();
    let mut any_failed = false;
    let mut any_ran = false;

    loop {
        // Launch every waiting child whose gate variables are satisfied.
        for index in 0..slots.len() {
            if slots[index].is_none() {
                continue;
            }
            let ready = dependencies[index].iter().all(|name| {
                released.contains(name)
                    || (!shadowed.contains(name) && ctx.store.contains(name))
            });
            if !ready {
                continue;
            }
            if let Some(node) = slots[index].take() {
                let task_ctx = ctx.clone();
                join_set.spawn(async move { (index, run_node(task_ctx, node).await) });
            }
        }

        let Some(joined) = join_set.join_next().await else {
            if slots.iter().all(Option::is_none) {
                break;
            }
            // Nothing in flight and nothing launchable, yet children remain.
            // Cycle validation makes this unreachable; release every gate so
            // the stragglers run and report their missing inputs instead of
            // spinning here.
            for gate in &dependencies {
                released.extend(gate.iter().cloned());
            }
            continue;
        };

        match joined {
            Ok((index, outcome)) => {
                // Terminal children release their variables whether or not
                // they published them, so blocked consumers do not wait
                // forever on a producer that failed.
                released.extend(produced[index].iter().cloned());

                match outcome {
                    Ok(child) => {
                        if child.state == StepState::Failed {
                            any_failed = true;
                        }
                        if child.state != StepState::Skipped {
                            any_ran = true;
                        }
                        results.extend(child.results);
                    }
                    // Dropping the join set aborts in-flight siblings.
                    Err(aborted) => return Err(aborted),
                }
            }
            Err(join_error) => {
                return Err(WorkflowAborted::CriticalStepFailed {
                    step_id: label,
                    error: format!("step task panicked: {join_error}"),
                });
            }
        }
    }

    let state = if any_failed {
        StepState::Failed
    } else if any_ran {
        StepState::Succeeded
    } else {
        StepState::Skipped
    };

    Ok(NodeOutcome { results, state })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
