use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::event::{EventSink, NoopEventSink};
use crate::metrics::{MetricsSink, NoopMetricsSink};

/// A scalar value storable in a [`Context`].
///
/// Kept to a closed, cheaply-cloneable set rather than `Box<dyn Any>` so that
/// `fork()` can deep-copy the map without requiring every stored type to be
/// `Clone` and downcastable. Serializable so a sink can ship a context
/// snapshot out as structured logs without a bespoke encoder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

type ValueMap = HashMap<String, Value>;

/// Mutable key -> value map carried alongside a command through a dispatch,
/// plus the observer and metrics sinks middleware report through.
///
/// Shared among every middleware in a single dispatch: writes to scalar keys
/// are last-writer-wins. Callers that need read-modify-write semantics on a
/// collection should serialize access by holding the write lock for the
/// whole critical section rather than issuing separate `get`/`set` calls.
#[derive(Clone)]
pub struct Context {
    values: Arc<RwLock<ValueMap>>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

/// Convenience alias for the common case of a context shared by reference
/// across spawned branches.
pub type SharedContext = Context;

impl Context {
    /// Create an empty context with no-op observability sinks.
    pub fn new() -> Self {
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(NoopEventSink),
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    /// Create a context wired to caller-supplied observability sinks.
    pub fn with_sinks(events: Arc<dyn EventSink>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            values: Arc::new(RwLock::new(HashMap::new())),
            events,
            metrics,
        }
    }

    /// Read a value, if present.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    /// Last-writer-wins insert.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.write().await.insert(key.into(), value.into());
    }

    /// Observer registry for this dispatch.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Metrics sink for this dispatch.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Produce an independent snapshot: a deep copy of the current scalar
    /// map that shares no lock with `self`, used by the parallel wrapper so
    /// concurrent branches can mutate without contending on one lock.
    ///
    /// The forked context shares the same event and metrics sinks — those
    /// are append-only observers, not mutable state, so sharing them across
    /// branches is safe.
    pub async fn fork(&self) -> Self {
        let snapshot = self.values.read().await.clone();
        Self {
            values: Arc::new(RwLock::new(snapshot)),
            events: Arc::clone(&self.events),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Merge another context's values into `self`, last-writer-wins per key.
    ///
    /// Used by `ParallelWrapper`'s `SideEffectsWithMerge` strategy to fold a
    /// forked branch's writes back into the shared context after it
    /// completes.
    pub async fn merge_from(&self, other: &Context) {
        let other_values = other.values.read().await.clone();
        self.values.write().await.extend(other_values);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let ctx = Context::new();
        ctx.set("k", 42i64).await;
        assert_eq!(ctx.get("k").await, Some(Value::Int(42)));
    }

    #[tokio::test]
    async fn fork_is_independent_of_parent() {
        let ctx = Context::new();
        ctx.set("k", "before").await;
        let forked = ctx.fork().await;
        ctx.set("k", "after").await;

        assert_eq!(forked.get("k").await, Some(Value::Text("before".into())));
        assert_eq!(ctx.get("k").await, Some(Value::Text("after".into())));
    }

    #[tokio::test]
    async fn merge_from_is_last_writer_wins() {
        let ctx = Context::new();
        ctx.set("shared", "base").await;
        let branch = ctx.fork().await;
        branch.set("shared", "branch").await;
        branch.set("only_in_branch", 1i64).await;

        ctx.merge_from(&branch).await;

        assert_eq!(ctx.get("shared").await, Some(Value::Text("branch".into())));
        assert_eq!(ctx.get("only_in_branch").await, Some(Value::Int(1)));
    }
}
