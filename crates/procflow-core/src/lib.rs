//! Workflow execution engine for Procflow.
//!
//! This crate turns declarative workflow definitions (sequential and
//! parallel step groups, `$name` variable flow, conditions, retries,
//! fallbacks) into runs against a registry of host-provided capabilities.
//! It depends only on `procflow-types` for its wire types -- capability
//! implementations live with the embedding application.

pub mod capability;
pub mod context;
pub mod definition;
pub mod event;
pub mod expression;
pub mod graph;
pub mod retry;
pub mod runner;

mod scheduler;
mod step;
