//! Event types for the Procflow run event bus.
//!
//! `RunEvent` is the unified event type broadcast during workflow execution.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.
//! Terminal step records additionally travel the per-run trace stream; the
//! bus exists for cross-run observers (UIs, log sinks, metrics).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{RunStatus, StepState};

/// Events emitted during a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A workflow run has started.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
    },

    /// A step attempt has started executing.
    StepStarted {
        run_id: Uuid,
        step_id: String,
        capability: String,
        /// 1-based attempt number.
        attempt: u32,
    },

    /// A failed attempt will be retried after a delay.
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        /// 1-based number of the attempt about to run.
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A step reached a terminal state.
    StepFinished {
        run_id: Uuid,
        step_id: String,
        state: StepState,
        attempts: u32,
        duration_ms: u64,
    },

    /// The run completed and produced a trace.
    RunFinished {
        run_id: Uuid,
        workflow_name: String,
        status: RunStatus,
        duration_ms: u64,
    },

    /// The run was aborted (critical failure or deadline expiry).
    RunAborted {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },

    /// Cooperative cancellation was requested for the run.
    CancelRequested { run_id: Uuid },
}

impl RunEvent {
    /// The run this event belongs to. Every variant carries one.
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepRetrying { run_id, .. }
            | RunEvent::StepFinished { run_id, .. }
            | RunEvent::RunFinished { run_id, .. }
            | RunEvent::RunAborted { run_id, .. }
            | RunEvent::CancelRequested { run_id } => *run_id,
        }
    }
}
