//! Capability abstractions for workflow steps.
//!
//! This module defines the seam between the engine and the work it invokes:
//! - `Capability`: RPITIT trait for concrete capability implementations
//! - `BoxCapability`: Object-safe wrapper for dynamic dispatch
//! - `CapabilityRegistry`: name-to-capability lookup used at execution time

pub mod boxed;
pub mod handler;
pub mod registry;

pub use boxed::BoxCapability;
pub use handler::{Capability, Invocation};
pub use registry::CapabilityRegistry;
