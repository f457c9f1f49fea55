//! Event bus for run lifecycle observation.
//!
//! Provides an `EventBus` that distributes `RunEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
