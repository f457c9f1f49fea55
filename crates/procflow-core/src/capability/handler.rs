//! Capability trait definition.
//!
//! A capability is the unit of side-effectful work a workflow step invokes:
//! an HTTP call, a shell command, a data transform. Steps name capabilities
//! by their registry key; the engine resolves the step's inputs, invokes the
//! capability once per attempt, and feeds its output back into the run.

use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use procflow_types::error::CapabilityError;

/// Everything a capability receives for a single step attempt.
///
/// Inputs arrive fully resolved: `$var` references have already been
/// replaced by the referenced values, so implementations only ever see
/// plain JSON. The cancellation token fires when the run is cancelled;
/// long-running implementations should select against it and bail out.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Run this attempt belongs to.
    pub run_id: Uuid,
    /// Step being executed.
    pub step_id: String,
    /// Resolved input map (literals and dereferenced variables).
    pub inputs: HashMap<String, Value>,
    /// Cooperative cancellation signal for the run.
    pub cancel: CancellationToken,
}

impl Invocation {
    /// Look up a single resolved input by name.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }
}

/// Trait for step capability backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Because of
/// that, the trait is not object-safe; `BoxCapability` provides the
/// type-erased wrapper the registry stores.
///
/// Implementations classify every failure: [`CapabilityError::transient`]
/// for conditions that may clear on retry (timeouts, 5xx responses, lock
/// contention) and [`CapabilityError::permanent`] for conditions that will
/// not (malformed input, 4xx responses). Only transient failures are
/// eligible for retry.
pub trait Capability: Send + Sync {
    /// Execute one attempt of a step and return its output value.
    fn invoke(
        &self,
        invocation: Invocation,
    ) -> impl std::future::Future<Output = Result<Value, CapabilityError>> + Send;
}
