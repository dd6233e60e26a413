//! Write-once deferred task results.
//!
//! Every task gets a [`PromiseCell`] when it is added to a graph; the engine
//! resolves the cell when the task completes, or abandons it when the run
//! fails before the task could produce a value. Any number of [`Promise`]s
//! read the same cell.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::TaskId;

/// JSON key marking an embedded promise placeholder
pub const PLACEHOLDER_KEY: &str = "$promise";

/// Errors reading a promise
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromiseError {
    #[error("promise of task {0} read before the task completed")]
    Unresolved(TaskId),

    #[error("task {0} will never complete; its promise was abandoned")]
    Abandoned(TaskId),
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Resolved(Arc<Value>),
    Abandoned,
}

/// Engine-side write end of a promise
#[derive(Debug)]
pub(crate) struct PromiseCell {
    producer: TaskId,
    tx: watch::Sender<Slot>,
}

impl PromiseCell {
    pub(crate) fn new(producer: TaskId) -> Self {
        let (tx, _) = watch::channel(Slot::Pending);
        Self { producer, tx }
    }

    pub(crate) fn promise(&self) -> Promise {
        Promise {
            producer: self.producer,
            rx: self.tx.subscribe(),
        }
    }

    /// Store the value. Returns false if the cell was already settled.
    pub(crate) fn resolve(&self, value: Arc<Value>) -> bool {
        self.tx.send_if_modified(move |slot| match slot {
            Slot::Pending => {
                *slot = Slot::Resolved(value);
                true
            }
            _ => false,
        })
    }

    /// Mark the value as never arriving. No-op on a settled cell.
    pub(crate) fn abandon(&self) -> bool {
        self.tx.send_if_modified(|slot| match slot {
            Slot::Pending => {
                *slot = Slot::Abandoned;
                true
            }
            _ => false,
        })
    }
}

/// Read end of a task's eventual output
#[derive(Debug, Clone)]
pub struct Promise {
    producer: TaskId,
    rx: watch::Receiver<Slot>,
}

impl Promise {
    /// Task that produces the value
    pub fn producer(&self) -> TaskId {
        self.producer
    }

    /// Read the value if the producer has completed
    pub fn try_get(&self) -> Result<Arc<Value>, PromiseError> {
        match &*self.rx.borrow() {
            Slot::Pending => Err(PromiseError::Unresolved(self.producer)),
            Slot::Resolved(value) => Ok(Arc::clone(value)),
            Slot::Abandoned => Err(PromiseError::Abandoned(self.producer)),
        }
    }

    /// Suspend until the producer completes
    pub async fn wait(&self) -> Result<Arc<Value>, PromiseError> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(|slot| !matches!(slot, Slot::Pending)).await {
            Ok(slot) => match &*slot {
                Slot::Resolved(value) => Ok(Arc::clone(value)),
                _ => Err(PromiseError::Abandoned(self.producer)),
            },
            Err(_) => Err(PromiseError::Abandoned(self.producer)),
        };
        outcome
    }

    /// Placeholder to embed in a task output; consumers see the resolved value
    pub fn to_value(&self) -> Value {
        json!({ PLACEHOLDER_KEY: self.producer.0 })
    }
}

/// Task referenced by a placeholder object, if `value` is one
pub fn placeholder(value: &Value) -> Option<TaskId> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(PLACEHOLDER_KEY)?.as_u64().map(TaskId)
}

/// Replace every embedded placeholder in `value` with the producer's output.
///
/// Outputs substituted in are themselves expanded, so a placeholder for a
/// task whose output holds further placeholders resolves all the way down.
pub fn substitute<F>(value: &Value, lookup: &F) -> Result<Value, PromiseError>
where
    F: Fn(TaskId) -> Option<Arc<Value>>,
{
    if let Some(producer) = placeholder(value) {
        let resolved = lookup(producer).ok_or(PromiseError::Unresolved(producer))?;
        return substitute(&resolved, lookup);
    }

    Ok(match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, lookup))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, field) in fields {
                out.insert(key.clone(), substitute(field, lookup)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_try_get_before_resolution() {
        let cell = PromiseCell::new(TaskId(3));
        let promise = cell.promise();

        assert_eq!(promise.try_get(), Err(PromiseError::Unresolved(TaskId(3))));
        assert!(cell.resolve(Arc::new(json!(42))));
        assert_eq!(*promise.try_get().unwrap(), json!(42));
    }

    #[test]
    fn test_cell_is_write_once() {
        let cell = PromiseCell::new(TaskId(1));
        assert!(cell.resolve(Arc::new(json!("first"))));
        assert!(!cell.resolve(Arc::new(json!("second"))));
        assert!(!cell.abandon());
        assert_eq!(*cell.promise().try_get().unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_wait_blocks_until_resolved() {
        let cell = PromiseCell::new(TaskId(9));
        let promise = cell.promise();

        let reader = tokio::spawn(async move { promise.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        cell.resolve(Arc::new(json!({"reads": 12})));
        let value = reader.await.unwrap().unwrap();
        assert_eq!(value["reads"], 12);
    }

    #[tokio::test]
    async fn test_wait_on_abandoned_cell() {
        let cell = PromiseCell::new(TaskId(4));
        let promise = cell.promise();
        cell.abandon();
        assert_eq!(promise.wait().await, Err(PromiseError::Abandoned(TaskId(4))));
    }

    #[tokio::test]
    async fn test_wait_after_cell_dropped() {
        let cell = PromiseCell::new(TaskId(5));
        let promise = cell.promise();
        drop(cell);
        assert_eq!(promise.wait().await, Err(PromiseError::Abandoned(TaskId(5))));
    }

    #[test]
    fn test_substitute_nested_placeholders() {
        let outputs: HashMap<TaskId, Arc<Value>> = [
            (TaskId(1), Arc::new(json!([{ "$promise": 2 }, { "$promise": 3 }]))),
            (TaskId(2), Arc::new(json!("a"))),
            (TaskId(3), Arc::new(json!({ "name": "b" }))),
        ]
        .into_iter()
        .collect();
        let lookup = |id: TaskId| outputs.get(&id).cloned();

        let value = json!({ "parts": { "$promise": 1 }, "keep": true });
        let resolved = substitute(&value, &lookup).unwrap();
        assert_eq!(resolved, json!({ "parts": ["a", { "name": "b" }], "keep": true }));
    }

    #[test]
    fn test_substitute_missing_producer() {
        let lookup = |_: TaskId| -> Option<Arc<Value>> { None };
        let err = substitute(&json!([{ "$promise": 8 }]), &lookup).unwrap_err();
        assert_eq!(err, PromiseError::Unresolved(TaskId(8)));
    }

    #[test]
    fn test_placeholder_requires_exact_shape() {
        assert_eq!(placeholder(&json!({ "$promise": 7 })), Some(TaskId(7)));
        assert_eq!(placeholder(&json!({ "$promise": 7, "x": 1 })), None);
        assert_eq!(placeholder(&json!({ "$promise": "7" })), None);
    }
}
