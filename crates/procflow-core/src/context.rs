//! Variable store shared by all steps of a run.
//!
//! The store is the only channel through which steps exchange data: a step
//! that declares `produces` publishes its output here, and any later step
//! resolves `$name` input references against it. Publishing is atomic with
//! respect to readers; a value is either absent or complete, never partial,
//! and a value read back always equals the value written. Size limits guard
//! against unbounded growth; an oversized publish fails the publishing step
//! rather than storing a truncated value.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde_json::{Value, json};
use uuid::Uuid;

use procflow_types::workflow::{InputValue, VarRef};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single published value (1 MB).
pub const MAX_VALUE_SIZE: usize = 1_048_576;

/// Maximum total serialized size of all variables in a run (10 MB).
pub const MAX_STORE_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by variable publication and resolution.
///
/// All of these are permanent step failures; none are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("value for '{name}' is {size} bytes, over the {limit} byte limit")]
    ValueTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("publishing '{name}' would grow the variable store past {limit} bytes")]
    StoreFull { name: String, limit: usize },

    #[error("unresolved variable '{name}'")]
    Unresolved { name: String },

    #[error("path '{path}' not found under variable '{name}'")]
    PathNotFound { name: String, path: String },

    #[error("failed to serialize value for '{name}': {message}")]
    Serialization { name: String, message: String },
}

// ---------------------------------------------------------------------------
// VariableStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredValue {
    value: Value,
    bytes: usize,
}

/// Concurrent name-to-value map for one workflow run.
///
/// Cloning the store is cheap and shares the underlying map, which is how
/// parallel step tasks all see the same variables. Uniqueness of `produces`
/// names is enforced at validation time, so each key has exactly one writer
/// per run; readers never race a rewrite of the value they resolve.
#[derive(Debug, Clone)]
pub struct VariableStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    entries: DashMap<String, StoredValue>,
    total_bytes: AtomicUsize,
}

impl VariableStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                total_bytes: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a store seeded with the caller's initial variables.
    ///
    /// Initial values go through the same size guards as published step
    /// outputs.
    pub fn with_initial(initial: HashMap<String, Value>) -> Result<Self, StoreError> {
        let store = Self::new();
        for (name, value) in initial {
            store.publish(name, value)?;
        }
        Ok(store)
    }

    /// Publish a value under a name, replacing any previous value.
    ///
    /// Enforces [`MAX_VALUE_SIZE`] per value and [`MAX_STORE_SIZE`] in
    /// total. The store budget is reserved with a compare-exchange before
    /// insertion, so concurrent publishes cannot both pass the cap check
    /// against the same stale total. On failure nothing is stored, no
    /// budget is consumed, and any previous value remains visible.
    pub fn publish(&self, name: impl Into<String>, value: Value) -> Result<(), StoreError> {
        let name = name.into();
        let serialized = serde_json::to_string(&value).map_err(|e| StoreError::Serialization {
            name: name.clone(),
            message: e.to_string(),
        })?;
        let bytes = serialized.len();

        if bytes > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                name,
                size: bytes,
                limit: MAX_VALUE_SIZE,
            });
        }

        // One writer per name, so `previous_bytes` cannot change under us;
        // only the shared total is contended.
        let previous_bytes = self
            .inner
            .entries
            .get(&name)
            .map(|entry| entry.bytes)
            .unwrap_or(0);
        let reserved =
            self.inner
                .total_bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                    let projected = total + bytes - previous_bytes;
                    (projected <= MAX_STORE_SIZE).then_some(projected)
                });
        if reserved.is_err() {
            return Err(StoreError::StoreFull {
                name,
                limit: MAX_STORE_SIZE,
            });
        }

        self.inner.entries.insert(name, StoredValue { value, bytes });
        Ok(())
    }

    /// Fetch a variable's value by name.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner
            .entries
            .get(name)
            .map(|entry| entry.value.clone())
    }

    /// Whether a variable is present.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.entries.contains_key(name)
    }

    /// Resolve a `$name.path` reference to its value.
    ///
    /// Path segments index into objects by key and into arrays by numeric
    /// position. A missing root is [`StoreError::Unresolved`]; a missing
    /// segment under a present root is [`StoreError::PathNotFound`].
    pub fn resolve(&self, var: &VarRef) -> Result<Value, StoreError> {
        let root = self.get(&var.name).ok_or_else(|| StoreError::Unresolved {
            name: var.name.clone(),
        })?;

        let mut current = &root;
        for (depth, segment) in var.path.iter().enumerate() {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index)),
                _ => None,
            };
            current = next.ok_or_else(|| StoreError::PathNotFound {
                name: var.name.clone(),
                path: var.path[..=depth].join("."),
            })?;
        }
        Ok(current.clone())
    }

    /// Resolve a step's declared inputs into plain values.
    ///
    /// Literals pass through unchanged; `$name` references are dereferenced
    /// against the current store contents. The first failing reference
    /// aborts resolution.
    pub fn resolve_inputs(
        &self,
        inputs: &HashMap<String, InputValue>,
    ) -> Result<HashMap<String, Value>, StoreError> {
        let mut resolved = HashMap::with_capacity(inputs.len());
        for (key, input) in inputs {
            let value = match input {
                InputValue::Literal(value) => value.clone(),
                InputValue::Var(var) => self.resolve(var)?,
            };
            resolved.insert(key.clone(), value);
        }
        Ok(resolved)
    }

    /// Snapshot all variables as a JSON object map.
    pub fn snapshot(&self) -> serde_json::Map<String, Value> {
        self.inner
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Build the JSON context object that conditions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "vars": { "<name>": <value>, ... },
    ///   "workflow": { "name": "...", "run_id": "..." }
    /// }
    /// ```
    pub fn eval_context(&self, workflow_name: &str, run_id: Uuid) -> Value {
        json!({
            "vars": Value::Object(self.snapshot()),
            "workflow": {
                "name": workflow_name,
                "run_id": run_id.to_string(),
            }
        })
    }

    /// Number of variables currently present.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store holds no variables.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Total serialized size of all present values, in bytes.
    pub fn total_bytes(&self) -> usize {
        self.inner.total_bytes.load(Ordering::Acquire)
    }
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
