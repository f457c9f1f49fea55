//! Observability wiring for Procflow.
//!
//! Embedding applications call `tracing_setup::init_tracing` once at
//! startup; the engine crates only emit `tracing` events and never touch
//! the global subscriber themselves.

pub mod tracing_setup;
