//! Capability registry for runtime lookup by step capability name.

use std::collections::HashMap;

use super::boxed::BoxCapability;

/// Registry of capabilities keyed by the name steps reference them with.
///
/// The registry is assembled once at startup and handed to the runner;
/// preflight validation rejects any workflow that names a capability the
/// registry does not contain, so execution never encounters a miss.
#[derive(Debug)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, BoxCapability>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability under a name. Replaces any existing capability
    /// with the same name.
    pub fn register(&mut self, name: impl Into<String>, capability: BoxCapability) {
        self.capabilities.insert(name.into(), capability);
    }

    /// Look up a capability by name.
    pub fn get(&self, name: &str) -> Option<&BoxCapability> {
        self.capabilities.get(name)
    }

    /// Whether a capability is registered under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Names of all registered capabilities.
    pub fn list_names(&self) -> Vec<&str> {
        self.capabilities.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
