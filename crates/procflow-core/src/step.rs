//! Single-step lifecycle: condition gate, input resolution, the attempt
//! loop with per-attempt timeout and retry delays, output publication,
//! fallback execution, and criticality handling.
//!
//! Exactly one terminal record per step reaches the trace stream. Steps
//! that never run (condition false, run cancelled) still produce a record
//! so the trace covers the whole workflow tree.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use procflow_types::error::{CapabilityError, WorkflowAborted};
use procflow_types::event::RunEvent;
use procflow_types::workflow::{SkipReason, StepDefinition, StepResult, StepState};

use crate::capability::Invocation;
use crate::retry::{RetryDecision, RetryEngine};
use crate::scheduler::{NodeOutcome, RunContext, run_node};

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Run one step to a terminal state.
///
/// `Err` aborts the run: the step failed terminally (after any fallback)
/// and was marked critical. Everything else, including failure of a
/// non-critical step, is an `Ok` outcome for the scheduler to aggregate.
pub(crate) async fn run_step(
    ctx: RunContext,
    step: StepDefinition,
) -> Result<NodeOutcome, WorkflowAborted> {
    // A cancelled run skips pending steps without an attempt.
    if ctx.cancel.is_cancelled() {
        let record = StepResult::skipped(&step.id, SkipReason::Cancelled);
        return Ok(emit(&ctx, record).await);
    }

    if let Some(condition) = &step.condition {
        let eval_ctx = ctx.store.eval_context(&ctx.workflow_name, ctx.run_id);
        match ctx.evaluator.evaluate_condition(condition, &eval_ctx) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    run_id = %ctx.run_id,
                    step_id = step.id.as_str(),
                    "condition false, skipping step"
                );
                let record = StepResult::skipped(&step.id, SkipReason::ConditionFalse);
                return Ok(emit(&ctx, record).await);
            }
            // A condition that cannot be evaluated is a permanent step
            // failure, not a skip: the author must fix the expression.
            Err(e) => {
                let error = CapabilityError::permanent(e.to_string());
                return conclude_failure(ctx, step, error, 0, None, Instant::now()).await;
            }
        }
    }

    let inputs = match ctx.store.resolve_inputs(&step.inputs) {
        Ok(inputs) => inputs,
        Err(e) => {
            let error = CapabilityError::permanent(e.to_string());
            return conclude_failure(ctx, step, error, 0, None, Instant::now()).await;
        }
    };

    let started_at = Utc::now();
    let begun = Instant::now();
    let attempt_timeout = Duration::from_secs(
        step.timeout_secs.unwrap_or(ctx.default_step_timeout_secs),
    );
    let mut attempt: u32 = 1;

    let failure: CapabilityError = loop {
        ctx.bus.publish(RunEvent::StepStarted {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            capability: step.capability.clone(),
            attempt,
        });
        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = step.id.as_str(),
            capability = step.capability.as_str(),
            attempt,
            "invoking capability"
        );

        // Preflight validation guarantees registration; guard anyway.
        let Some(capability) = ctx.registry.get(&step.capability) else {
            break CapabilityError::permanent(format!(
                "capability '{}' is not registered",
                step.capability
            ));
        };

        let invocation = Invocation {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            inputs: inputs.clone(),
            cancel: ctx.cancel.clone(),
        };

        let outcome = tokio::select! {
            invoked = tokio::time::timeout(attempt_timeout, capability.invoke(invocation)) => {
                match invoked {
                    Ok(result) => result,
                    Err(_elapsed) => Err(CapabilityError::transient(format!(
                        "attempt timed out after {}s",
                        attempt_timeout.as_secs()
                    ))),
                }
            }
            _ = ctx.cancel.cancelled() => {
                // The in-flight attempt is dropped; its work does not count.
                let record = cancelled_midflight(&step, attempt, started_at, begun);
                return Ok(emit(&ctx, record).await);
            }
        };

        match outcome {
            Ok(output) => {
                let mut produced = None;
                if let Some(name) = &step.produces {
                    match ctx.store.publish(name.clone(), output.clone()) {
                        Ok(()) => produced = Some(name.clone()),
                        // Oversized or overflowing outputs fail the step;
                        // a fallback may still rescue it.
                        Err(e) => break CapabilityError::permanent(e.to_string()),
                    }
                }

                let record = StepResult {
                    step_id: step.id.clone(),
                    state: StepState::Succeeded,
                    attempts: attempt,
                    output: Some(output),
                    produced,
                    error: None,
                    error_kind: None,
                    skip_reason: None,
                    started_at: Some(started_at),
                    finished_at: Utc::now(),
                    duration_ms: begun.elapsed().as_millis() as u64,
                };
                tracing::debug!(
                    run_id = %ctx.run_id,
                    step_id = step.id.as_str(),
                    attempts = attempt,
                    "step succeeded"
                );
                return Ok(emit(&ctx, record).await);
            }
            Err(error) => match RetryEngine::decide(step.retry.as_ref(), attempt, &error) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        step_id = step.id.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    ctx.bus.publish(RunEvent::StepRetrying {
                        run_id: ctx.run_id,
                        step_id: step.id.clone(),
                        next_attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {
                            let record = cancelled_midflight(&step, attempt, started_at, begun);
                            return Ok(emit(&ctx, record).await);
                        }
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp => break error,
            },
        }
    };

    conclude_failure(ctx, step, failure, attempt, Some(started_at), begun).await
}

/// Finish a step whose attempts are exhausted: run the fallback if one is
/// declared, write the terminal record, and abort the run if the step is
/// critical and stayed failed.
///
/// A fallback that reaches a non-failed terminal state rescues the step:
/// its final state becomes `Succeeded` and the error is dropped from the
/// record. The fallback's own records precede the rescued step's in the
/// trace. A critical step whose fallback rescued it does not abort.
async fn conclude_failure(
    ctx: RunContext,
    step: StepDefinition,
    error: CapabilityError,
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    begun: Instant,
) -> Result<NodeOutcome, WorkflowAborted> {
    tracing::warn!(
        run_id = %ctx.run_id,
        step_id = step.id.as_str(),
        attempts,
        error = %error,
        "step failed"
    );

    let mut results = Vec::new();
    let mut final_state = StepState::Failed;

    if let Some(fallback) = step.on_failure.clone() {
        tracing::info!(
            run_id = %ctx.run_id,
            step_id = step.id.as_str(),
            "running fallback for failed step"
        );
        let fallback_outcome = run_node(ctx.clone(), *fallback).await?;
        if fallback_outcome.state != StepState::Failed {
            final_state = StepState::Succeeded;
        }
        results = fallback_outcome.results;
    }

    let failed = final_state == StepState::Failed;
    let record = StepResult {
        step_id: step.id.clone(),
        state: final_state,
        attempts,
        output: None,
        produced: None,
        error: failed.then(|| error.to_string()),
        error_kind: failed.then(|| error.kind()),
        skip_reason: None,
        started_at,
        finished_at: Utc::now(),
        duration_ms: begun.elapsed().as_millis() as u64,
    };
    send_result(&ctx, record.clone()).await;
    ctx.bus.publish(RunEvent::StepFinished {
        run_id: ctx.run_id,
        step_id: record.step_id.clone(),
        state: record.state,
        attempts: record.attempts,
        duration_ms: record.duration_ms,
    });
    results.push(record);

    if failed && step.critical {
        return Err(WorkflowAborted::CriticalStepFailed {
            step_id: step.id,
            error: error.to_string(),
        });
    }

    Ok(NodeOutcome {
        results,
        state: final_state,
    })
}

/// Record for an attempt interrupted by run cancellation.
fn cancelled_midflight(
    step: &StepDefinition,
    attempt: u32,
    started_at: DateTime<Utc>,
    begun: Instant,
) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        state: StepState::Skipped,
        attempts: attempt,
        output: None,
        produced: None,
        error: None,
        error_kind: None,
        skip_reason: Some(SkipReason::Cancelled),
        started_at: Some(started_at),
        finished_at: Utc::now(),
        duration_ms: begun.elapsed().as_millis() as u64,
    }
}

/// Send the terminal record to the trace stream, publish `StepFinished`,
/// and wrap it as a single-step outcome.
async fn emit(ctx: &RunContext, record: StepResult) -> NodeOutcome {
    send_result(ctx, record.clone()).await;
    ctx.bus.publish(RunEvent::StepFinished {
        run_id: ctx.run_id,
        step_id: record.step_id.clone(),
        state: record.state,
        attempts: record.attempts,
        duration_ms: record.duration_ms,
    });
    NodeOutcome {
        state: record.state,
        results: vec![record],
    }
}

/// A dropped trace receiver means the caller detached from the run; the
/// run keeps executing regardless.
async fn send_result(ctx: &RunContext, record: StepResult) {
    let _ = ctx.results_tx.send(record).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use procflow_types::error::ErrorKind;
    use procflow_types::workflow::{
        BackoffPolicy, GroupKind, GroupNode, InputValue, RetrySpec, WorkflowNode,
    };
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::capability::{BoxCapability, Capability, CapabilityRegistry};
    use crate::context::VariableStore;
    use crate::event::EventBus;
    use crate::expression::ConditionEvaluator;

    struct Echo;

    impl Capability for Echo {
        async fn invoke(&self, invocation: Invocation) -> Result<Value, CapabilityError> {
            Ok(invocation
                .input("value")
                .cloned()
                .unwrap_or_else(|| json!(null)))
        }
    }

    /// Fails transiently until `succeed_on` attempts have been made.
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    impl Capability for Flaky {
        async fn invoke(&self, _invocation: Invocation) -> Result<Value, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                Err(CapabilityError::transient("connection reset"))
            } else {
                Ok(json!({ "call": call }))
            }
        }
    }

    struct AlwaysPermanent;

    impl Capability for AlwaysPermanent {
        async fn invoke(&self, _invocation: Invocation) -> Result<Value, CapabilityError> {
            Err(CapabilityError::permanent("schema rejected"))
        }
    }

    struct Slow;

    impl Capability for Slow {
        async fn invoke(&self, _invocation: Invocation) -> Result<Value, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!("too late"))
        }
    }

    fn ctx_with(
        registry: CapabilityRegistry,
    ) -> (RunContext, mpsc::Receiver<StepResult>) {
        let (results_tx, results_rx) = mpsc::channel(64);
        let ctx = RunContext {
            run_id: Uuid::now_v7(),
            workflow_name: "test".to_string(),
            store: VariableStore::new(),
            registry: Arc::new(registry),
            evaluator: Arc::new(ConditionEvaluator::new()),
            bus: EventBus::new(16),
            results_tx,
            cancel: CancellationToken::new(),
            default_step_timeout_secs: 5,
        };
        (ctx, results_rx)
    }

    fn base_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register("echo", BoxCapability::new(Echo));
        registry
    }

    fn step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            capability: "echo".to_string(),
            inputs: HashMap::from([(
                "value".to_string(),
                InputValue::parse_text("hello").unwrap(),
            )]),
            produces: None,
            condition: None,
            retry: None,
            on_failure: None,
            critical: false,
            timeout_secs: None,
        }
    }

    // -- success and skips ------------------------------------------------

    #[tokio::test]
    async fn success_publishes_produced_variable() {
        let (ctx, _rx) = ctx_with(base_registry());
        let definition = StepDefinition {
            produces: Some("greeting".to_string()),
            ..step("greet")
        };
        let outcome = run_step(ctx.clone(), definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Succeeded);
        let record = &outcome.results[0];
        assert_eq!(record.attempts, 1);
        assert_eq!(record.produced.as_deref(), Some("greeting"));
        assert_eq!(ctx.store.get("greeting"), Some(json!("hello")));
    }

    #[tokio::test]
    async fn condition_false_skips_without_invoking() {
        let (ctx, _rx) = ctx_with(base_registry());
        ctx.store.publish("enabled", json!(false)).unwrap();
        let definition = StepDefinition {
            condition: Some("$enabled".to_string()),
            ..step("gated")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Skipped);
        let record = &outcome.results[0];
        assert_eq!(record.skip_reason, Some(SkipReason::ConditionFalse));
        assert_eq!(record.attempts, 0);
        assert!(record.started_at.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start_skips() {
        let (ctx, _rx) = ctx_with(base_registry());
        ctx.cancel.cancel();
        let outcome = run_step(ctx, step("never")).await.unwrap();

        assert_eq!(outcome.state, StepState::Skipped);
        assert_eq!(
            outcome.results[0].skip_reason,
            Some(SkipReason::Cancelled)
        );
    }

    #[tokio::test]
    async fn unbound_condition_variable_fails_step() {
        let (ctx, _rx) = ctx_with(base_registry());
        let definition = StepDefinition {
            condition: Some("$never_bound".to_string()),
            ..step("gated")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Failed);
        let record = &outcome.results[0];
        assert_eq!(record.attempts, 0);
        assert_eq!(record.error_kind, Some(ErrorKind::Permanent));
        assert!(record.error.as_deref().unwrap().contains("never_bound"));
    }

    #[tokio::test]
    async fn unresolved_input_fails_step() {
        let (ctx, _rx) = ctx_with(base_registry());
        let definition = StepDefinition {
            inputs: HashMap::from([(
                "value".to_string(),
                InputValue::parse_text("$vanished").unwrap(),
            )]),
            ..step("reader")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Failed);
        assert!(
            outcome.results[0]
                .error
                .as_deref()
                .unwrap()
                .contains("vanished")
        );
    }

    // -- retries ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = CapabilityRegistry::new();
        registry.register(
            "flaky",
            BoxCapability::new(Flaky {
                calls: Arc::clone(&calls),
                succeed_on: 3,
            }),
        );
        let (ctx, _rx) = ctx_with(registry);
        let definition = StepDefinition {
            capability: "flaky".to_string(),
            retry: Some(RetrySpec {
                max_attempts: 5,
                delay_ms: 100,
                backoff: BackoffPolicy::Fixed,
                max_delay_ms: None,
            }),
            ..step("flaky-step")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Succeeded);
        assert_eq!(outcome.results[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_transient_kind() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = CapabilityRegistry::new();
        registry.register(
            "flaky",
            BoxCapability::new(Flaky {
                calls: Arc::clone(&calls),
                succeed_on: 100,
            }),
        );
        let (ctx, _rx) = ctx_with(registry);
        let definition = StepDefinition {
            capability: "flaky".to_string(),
            retry: Some(RetrySpec {
                max_attempts: 3,
                delay_ms: 10,
                backoff: BackoffPolicy::Fixed,
                max_delay_ms: None,
            }),
            ..step("flaky-step")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Failed);
        let record = &outcome.results[0];
        assert_eq!(record.attempts, 3);
        assert_eq!(record.error_kind, Some(ErrorKind::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_never_retries() {
        let mut registry = CapabilityRegistry::new();
        registry.register("doomed", BoxCapability::new(AlwaysPermanent));
        let (ctx, _rx) = ctx_with(registry);
        let definition = StepDefinition {
            capability: "doomed".to_string(),
            retry: Some(RetrySpec {
                max_attempts: 5,
                delay_ms: 10,
                backoff: BackoffPolicy::Fixed,
                max_delay_ms: None,
            }),
            ..step("doomed-step")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Failed);
        assert_eq!(outcome.results[0].attempts, 1);
        assert_eq!(outcome.results[0].error_kind, Some(ErrorKind::Permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_transient() {
        let mut registry = CapabilityRegistry::new();
        registry.register("slow", BoxCapability::new(Slow));
        let (ctx, _rx) = ctx_with(registry);
        let definition = StepDefinition {
            capability: "slow".to_string(),
            timeout_secs: Some(1),
            retry: Some(RetrySpec {
                max_attempts: 2,
                delay_ms: 10,
                backoff: BackoffPolicy::Fixed,
                max_delay_ms: None,
            }),
            ..step("slow-step")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Failed);
        let record = &outcome.results[0];
        assert_eq!(record.attempts, 2);
        assert_eq!(record.error_kind, Some(ErrorKind::Transient));
        assert!(record.error.as_deref().unwrap().contains("timed out"));
    }

    // -- fallbacks and criticality ----------------------------------------

    #[tokio::test]
    async fn fallback_rescues_failed_step() {
        let mut registry = base_registry();
        registry.register("doomed", BoxCapability::new(AlwaysPermanent));
        let (ctx, _rx) = ctx_with(registry);

        let rescue = WorkflowNode::Step(StepDefinition {
            produces: Some("result".to_string()),
            ..step("rescue")
        });
        let definition = StepDefinition {
            capability: "doomed".to_string(),
            produces: Some("result".to_string()),
            on_failure: Some(Box::new(rescue)),
            ..step("primary")
        };
        let outcome = run_step(ctx.clone(), definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Succeeded);
        // Fallback record first, rescued step's terminal record last.
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["rescue", "primary"]);
        let primary = &outcome.results[1];
        assert_eq!(primary.state, StepState::Succeeded);
        assert!(primary.error.is_none());
        assert_eq!(ctx.store.get("result"), Some(json!("hello")));
    }

    #[tokio::test]
    async fn failed_fallback_keeps_original_error() {
        let mut registry = CapabilityRegistry::new();
        registry.register("doomed", BoxCapability::new(AlwaysPermanent));
        let (ctx, _rx) = ctx_with(registry);

        let rescue = WorkflowNode::Step(StepDefinition {
            capability: "doomed".to_string(),
            ..step("rescue")
        });
        let definition = StepDefinition {
            capability: "doomed".to_string(),
            on_failure: Some(Box::new(rescue)),
            ..step("primary")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Failed);
        let primary = outcome
            .results
            .iter()
            .find(|r| r.step_id == "primary")
            .unwrap();
        assert_eq!(primary.state, StepState::Failed);
        assert!(primary.error.as_deref().unwrap().contains("schema rejected"));
    }

    #[tokio::test]
    async fn critical_failure_aborts() {
        let mut registry = CapabilityRegistry::new();
        registry.register("doomed", BoxCapability::new(AlwaysPermanent));
        let (ctx, mut rx) = ctx_with(registry);
        let definition = StepDefinition {
            capability: "doomed".to_string(),
            critical: true,
            ..step("vital")
        };
        let aborted = run_step(ctx, definition).await.unwrap_err();

        match aborted {
            WorkflowAborted::CriticalStepFailed { step_id, error } => {
                assert_eq!(step_id, "vital");
                assert!(error.contains("schema rejected"));
            }
            other => panic!("unexpected abort: {other:?}"),
        }
        // The terminal record still reached the stream before the abort.
        let record = rx.recv().await.unwrap();
        assert_eq!(record.step_id, "vital");
        assert_eq!(record.state, StepState::Failed);
    }

    #[tokio::test]
    async fn critical_step_rescued_by_fallback_does_not_abort() {
        let mut registry = base_registry();
        registry.register("doomed", BoxCapability::new(AlwaysPermanent));
        let (ctx, _rx) = ctx_with(registry);

        let rescue = WorkflowNode::Step(step("rescue"));
        let definition = StepDefinition {
            capability: "doomed".to_string(),
            critical: true,
            on_failure: Some(Box::new(rescue)),
            ..step("vital")
        };
        let outcome = run_step(ctx, definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Succeeded);
    }

    #[tokio::test]
    async fn fallback_group_rescues_when_not_failed() {
        let mut registry = base_registry();
        registry.register("doomed", BoxCapability::new(AlwaysPermanent));
        let (ctx, _rx) = ctx_with(registry);

        // A fallback can be a whole group; sequential aggregate follows the
        // last child.
        let rescue = WorkflowNode::Group(GroupNode {
            id: None,
            kind: GroupKind::Sequential,
            steps: vec![
                WorkflowNode::Step(step("notify")),
                WorkflowNode::Step(StepDefinition {
                    produces: Some("out".to_string()),
                    ..step("substitute")
                }),
            ],
        });
        let definition = StepDefinition {
            capability: "doomed".to_string(),
            on_failure: Some(Box::new(rescue)),
            ..step("primary")
        };
        let outcome = run_step(ctx.clone(), definition).await.unwrap();

        assert_eq!(outcome.state, StepState::Succeeded);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(ctx.store.get("out"), Some(json!("hello")));
    }
}
