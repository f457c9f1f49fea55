//! Workflow runner: the public entry point for executing definitions.
//!
//! `WorkflowRunner` validates a definition against the registered
//! capabilities, spawns a worker task per run, and hands back a
//! `RunHandle` carrying the run id, a stream of terminal step records,
//! and the final `ExecutionTrace`.
//!
//! # Run lifecycle
//!
//! 1. `start` validates the definition and acquires a concurrency permit.
//! 2. The worker publishes `RunStarted`, arms the deadline watchdog, and
//!    walks the workflow tree via the scheduler.
//! 3. Terminal step records stream through the handle as they happen.
//! 4. The worker publishes `RunFinished` (or `RunAborted`) and resolves
//!    the handle with the trace or the abort error.
//!
//! Cancellation is cooperative: `cancel` trips the run's token, in-flight
//! steps wind down, and pending steps land in the trace as skipped.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::Stream;
use procflow_types::error::{DefinitionError, WorkflowAborted};
use procflow_types::event::RunEvent;
use procflow_types::workflow::{
    ExecutionTrace, RunStatus, StepResult, StepState, WorkflowDefinition, WorkflowNode,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::context::{StoreError, VariableStore};
use crate::definition::validate_definition;
use crate::event::EventBus;
use crate::expression::ConditionEvaluator;
use crate::scheduler::{RunContext, run_node};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-attempt step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default workflow-level deadline (30 minutes).
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Default buffer size of each run's step-record stream.
pub const DEFAULT_TRACE_CAPACITY: usize = 256;

/// Default capacity of the broadcast event bus.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Tunable engine defaults. Workflow and step definitions override the
/// timeouts per run and per step.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied to steps without their own `timeout_secs`.
    pub default_step_timeout_secs: u64,
    /// Applied to workflows without their own `timeout_secs`.
    pub default_workflow_timeout_secs: u64,
    /// Buffer size of each run's step-record stream. The engine applies
    /// backpressure when a consumer falls this far behind.
    pub trace_capacity: usize,
    /// Capacity of the broadcast event bus shared by all runs.
    pub bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            default_workflow_timeout_secs: DEFAULT_WORKFLOW_TIMEOUT_SECS,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// RunError
// ---------------------------------------------------------------------------

/// Errors surfaced by the runner.
#[derive(Debug, Error)]
pub enum RunError {
    /// The definition failed validation against the registry and initial
    /// variables.
    #[error("invalid workflow definition: {0}")]
    Definition(#[from] DefinitionError),

    /// An initial variable could not be stored (oversized value).
    #[error("invalid initial variable: {0}")]
    InitialVariable(#[from] StoreError),

    /// The run aborted (critical step failure or deadline expiry).
    #[error(transparent)]
    Aborted(#[from] WorkflowAborted),

    /// The workflow's concurrency limit is already saturated.
    #[error("concurrency limit reached for workflow '{0}'")]
    ConcurrencyLimitReached(String),

    /// No active run with the given id (for cancel).
    #[error("no active run with id {0}")]
    RunNotFound(Uuid),

    /// The worker task died without resolving the run.
    #[error("run worker terminated unexpectedly")]
    WorkerGone,
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes workflow definitions against a capability registry.
///
/// One runner serves many concurrent runs; per-workflow concurrency
/// limits are enforced across them by name.
pub struct WorkflowRunner {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    event_bus: EventBus,
    /// Per-workflow concurrency semaphores keyed by workflow name.
    concurrency_semaphores: DashMap<String, Arc<Semaphore>>,
    /// Cancellation tokens for active runs, keyed by run id.
    cancellation_tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl WorkflowRunner {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: CapabilityRegistry, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.bus_capacity);
        Self {
            config,
            registry: Arc::new(registry),
            evaluator: Arc::new(ConditionEvaluator::new()),
            event_bus,
            concurrency_semaphores: DashMap::new(),
            cancellation_tokens: Arc::new(DashMap::new()),
        }
    }

    /// The broadcast bus carrying lifecycle events for every run.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Subscribe to lifecycle events across all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    /// Validate and launch a run, returning its handle immediately.
    ///
    /// Must be called within a Tokio runtime: the run executes on a
    /// spawned worker task. Dropping the handle detaches from the run
    /// without cancelling it.
    pub fn start(
        &self,
        definition: WorkflowDefinition,
        initial: HashMap<String, Value>,
    ) -> Result<RunHandle, RunError> {
        let initial_names: HashSet<String> = initial.keys().cloned().collect();
        let capability_names: HashSet<String> = self
            .registry
            .list_names()
            .into_iter()
            .map(String::from)
            .collect();
        validate_definition(&definition, &initial_names, &capability_names)?;

        let store = VariableStore::with_initial(initial)?;
        let permit = self.acquire_concurrency_permit(&definition)?;

        let run_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, cancel.clone());

        let (results_tx, results_rx) = mpsc::channel(self.config.trace_capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let worker = RunWorker {
            definition,
            run_id,
            store,
            registry: Arc::clone(&self.registry),
            evaluator: Arc::clone(&self.evaluator),
            bus: self.event_bus.clone(),
            results_tx,
            cancel,
            config: self.config.clone(),
            tokens: Arc::clone(&self.cancellation_tokens),
        };
        tokio::spawn(async move {
            let outcome = worker.execute(permit).await;
            let _ = outcome_tx.send(outcome);
        });

        Ok(RunHandle {
            run_id,
            results: results_rx,
            outcome: outcome_rx,
        })
    }

    /// Run a workflow to completion and return its trace.
    pub async fn run(
        &self,
        definition: WorkflowDefinition,
        initial: HashMap<String, Value>,
    ) -> Result<ExecutionTrace, RunError> {
        self.start(definition, initial)?.wait().await
    }

    /// Request cooperative cancellation of an active run.
    ///
    /// In-flight steps wind down and pending steps are skipped; the run
    /// still resolves with a trace (status `Cancelled`). Completed runs
    /// and unknown ids report `RunNotFound`.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), RunError> {
        if let Some((_, token)) = self.cancellation_tokens.remove(&run_id) {
            tracing::info!(run_id = %run_id, "cancelling workflow run");
            self.event_bus.publish(RunEvent::CancelRequested { run_id });
            token.cancel();
            Ok(())
        } else {
            Err(RunError::RunNotFound(run_id))
        }
    }

    /// Acquire a concurrency permit for the workflow (if limited).
    ///
    /// The semaphore for a name is sized by the first definition seen
    /// under that name; the permit is held for the whole run and released
    /// on drop.
    fn acquire_concurrency_permit(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Option<OwnedSemaphorePermit>, RunError> {
        let Some(max) = definition.concurrency else {
            return Ok(None);
        };
        let semaphore = self
            .concurrency_semaphores
            .entry(definition.name.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(max as usize)))
            .clone();
        let permit = semaphore
            .try_acquire_owned()
            .map_err(|_| RunError::ConcurrencyLimitReached(definition.name.clone()))?;
        Ok(Some(permit))
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Live handle to a started run.
pub struct RunHandle {
    run_id: Uuid,
    results: mpsc::Receiver<StepResult>,
    outcome: oneshot::Receiver<Result<ExecutionTrace, RunError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Terminal step records in completion order, as they happen.
    ///
    /// The stream is finite: it ends when the run's last record has been
    /// delivered. Consume it promptly or use [`RunHandle::wait`], which
    /// drains internally; the engine blocks on a full buffer.
    pub fn events(&mut self) -> Pin<Box<dyn Stream<Item = StepResult> + Send + '_>> {
        Box::pin(async_stream::stream! {
            while let Some(record) = self.results.recv().await {
                yield record;
            }
        })
    }

    /// Wait for the run to finish and return its trace.
    ///
    /// Aborted runs resolve to the abort error instead of a trace; the
    /// records streamed before the abort are the partial trace.
    pub async fn wait(mut self) -> Result<ExecutionTrace, RunError> {
        while self.results.recv().await.is_some() {}
        self.outcome.await.map_err(|_| RunError::WorkerGone)?
    }
}

// ---------------------------------------------------------------------------
// RunWorker
// ---------------------------------------------------------------------------

/// State moved onto the spawned task that owns one run.
struct RunWorker {
    definition: WorkflowDefinition,
    run_id: Uuid,
    store: VariableStore,
    registry: Arc<CapabilityRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    bus: EventBus,
    results_tx: mpsc::Sender<StepResult>,
    cancel: CancellationToken,
    config: EngineConfig,
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

/// Removes a run's cancellation token entry when the worker ends, so a
/// capability panic that unwinds the task cannot leak the entry.
struct TokenCleanup {
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
    run_id: Uuid,
}

impl Drop for TokenCleanup {
    fn drop(&mut self) {
        self.tokens.remove(&self.run_id);
    }
}

impl RunWorker {
    async fn execute(
        self,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<ExecutionTrace, RunError> {
        // Held until the run resolves.
        let _permit = permit;
        let _tracked = TokenCleanup {
            tokens: Arc::clone(&self.tokens),
            run_id: self.run_id,
        };

        let started_at = Utc::now();
        let begun = Instant::now();

        tracing::info!(
            run_id = %self.run_id,
            workflow = self.definition.name.as_str(),
            "starting workflow run"
        );
        self.bus.publish(RunEvent::RunStarted {
            run_id: self.run_id,
            workflow_name: self.definition.name.clone(),
        });

        // The watchdog trips the run's cancellation token at the deadline;
        // the tree then winds down cooperatively and the stragglers land in
        // the trace as skipped before the abort is reported.
        let deadline = Duration::from_secs(
            self.definition
                .timeout_secs
                .unwrap_or(self.config.default_workflow_timeout_secs),
        );
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let watchdog = tokio::spawn({
            let cancel = self.cancel.clone();
            let deadline_hit = Arc::clone(&deadline_hit);
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        deadline_hit.store(true, Ordering::Release);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            }
        });

        let ctx = RunContext {
            run_id: self.run_id,
            workflow_name: self.definition.name.clone(),
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            evaluator: Arc::clone(&self.evaluator),
            bus: self.bus.clone(),
            results_tx: self.results_tx.clone(),
            cancel: self.cancel.clone(),
            default_step_timeout_secs: self.config.default_step_timeout_secs,
        };
        let root = WorkflowNode::Group(self.definition.root.clone());
        let executed = run_node(ctx, root).await;

        watchdog.abort();

        let finished_at = Utc::now();
        let duration_ms = begun.elapsed().as_millis() as u64;

        let executed = match executed {
            Ok(_) if deadline_hit.load(Ordering::Acquire) => {
                Err(WorkflowAborted::DeadlineExceeded {
                    timeout_secs: deadline.as_secs(),
                })
            }
            other => other,
        };

        match executed {
            Ok(outcome) => {
                let status = if self.cancel.is_cancelled() {
                    RunStatus::Cancelled
                } else if outcome
                    .results
                    .iter()
                    .any(|r| r.state == StepState::Failed)
                {
                    RunStatus::PartialFailure
                } else {
                    RunStatus::Succeeded
                };
                tracing::info!(
                    run_id = %self.run_id,
                    workflow = self.definition.name.as_str(),
                    status = ?status,
                    steps = outcome.results.len(),
                    duration_ms,
                    "workflow run finished"
                );
                self.bus.publish(RunEvent::RunFinished {
                    run_id: self.run_id,
                    workflow_name: self.definition.name.clone(),
                    status,
                    duration_ms,
                });
                Ok(ExecutionTrace {
                    run_id: self.run_id,
                    workflow_name: self.definition.name.clone(),
                    status,
                    results: outcome.results,
                    started_at,
                    finished_at,
                    duration_ms,
                })
            }
            Err(aborted) => {
                tracing::error!(
                    run_id = %self.run_id,
                    workflow = self.definition.name.as_str(),
                    error = %aborted,
                    "workflow run aborted"
                );
                self.bus.publish(RunEvent::RunAborted {
                    run_id: self.run_id,
                    workflow_name: self.definition.name.clone(),
                    error: aborted.to_string(),
                });
                Err(RunError::Aborted(aborted))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
