//! BoxCapability -- object-safe dynamic dispatch wrapper for Capability.
//!
//! 1. Define an object-safe `CapabilityDyn` trait with a boxed future
//! 2. Blanket-impl `CapabilityDyn` for all `T: Capability`
//! 3. `BoxCapability` wraps `Box<dyn CapabilityDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use procflow_types::error::CapabilityError;

use super::handler::{Capability, Invocation};

/// Object-safe version of [`Capability`] with a boxed future.
///
/// This trait exists solely to enable dynamic dispatch (`dyn CapabilityDyn`).
/// A blanket implementation is provided for all types implementing
/// `Capability`.
pub trait CapabilityDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        invocation: Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + '_>>;
}

/// Blanket implementation: any `Capability` automatically implements
/// `CapabilityDyn`.
impl<T: Capability> CapabilityDyn for T {
    fn invoke_boxed(
        &self,
        invocation: Invocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + '_>> {
        Box::pin(self.invoke(invocation))
    }
}

/// Type-erased capability for runtime lookup by name.
///
/// Since `Capability` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxCapability` provides an equivalent `invoke` that delegates
/// to the inner `CapabilityDyn` trait object, which is what the registry
/// stores.
pub struct BoxCapability {
    inner: Box<dyn CapabilityDyn + Send + Sync>,
}

impl BoxCapability {
    /// Wrap a concrete `Capability` in a type-erased box.
    pub fn new<T: Capability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    /// Execute one attempt of a step and return its output value.
    pub async fn invoke(&self, invocation: Invocation) -> Result<Value, CapabilityError> {
        self.inner.invoke_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapability").finish_non_exhaustive()
    }
}
