//! Shared domain types for Procflow.
//!
//! This crate contains the core domain types used across the Procflow engine:
//! the workflow definition tree, run/step status enums, execution results,
//! run events, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod workflow;
