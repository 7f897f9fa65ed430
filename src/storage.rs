/// Durable key-value storage contract (chrome.storage.local) and the queue
/// structure persisted in it

use crate::error::{SyncError, SyncResult};
use crate::pending::PendingOperation;
use crate::transport::{Sleeper, Subscription};
use async_trait::async_trait;
use futures::future::{self, Either};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;

/// One key changed in storage: (key, new value or None when removed)
pub type ChangeListener = Rc<dyn Fn(&str, Option<&Value>)>;

#[async_trait(?Send)]
pub trait KeyValueStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> SyncResult<()>;

    async fn remove(&self, keys: &[String]) -> SyncResult<()>;

    async fn keys(&self) -> SyncResult<Vec<String>>;

    fn on_changed(&self, listener: ChangeListener) -> Subscription;
}

/// Run `work` unless `timeout_ms` passes first; `None` on timeout
pub async fn with_timeout<T>(
    sleeper: &dyn Sleeper,
    timeout_ms: u32,
    work: impl Future<Output = T>,
) -> Option<T> {
    let work = pin!(work);

    match future::select(work, sleeper.sleep(timeout_ms)).await {
        Either::Left((value, _)) => Some(value),
        Either::Right(((), _)) => None,
    }
}

/// Read one key, giving up after `timeout_ms`. Timeouts and read errors both
/// come back as `None`.
pub async fn timed_get(
    store: &dyn KeyValueStore,
    sleeper: &dyn Sleeper,
    key: &str,
    timeout_ms: u32,
) -> Option<Value> {
    match with_timeout(sleeper, timeout_ms, store.get(key)).await {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            log::warn!("Storage read of {} failed: {}", key, e);
            None
        }
        None => {
            log::warn!("Storage read of {} timed out after {}ms", key, timeout_ms);
            None
        }
    }
}

/// Write one key, giving up after `timeout_ms`
pub async fn timed_set(
    store: &dyn KeyValueStore,
    sleeper: &dyn Sleeper,
    key: &str,
    value: Value,
    timeout_ms: u32,
) -> SyncResult<()> {
    with_timeout(sleeper, timeout_ms, store.set(key, value))
        .await
        .unwrap_or_else(|| {
            Err(SyncError::Storage(format!(
                "write of {} timed out after {}ms",
                key, timeout_ms
            )))
        })
}

/// In-memory mirror of the persisted pending-operation list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingQueue {
    pub operations: Vec<PendingOperation>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue {
            operations: Vec::new(),
        }
    }

    pub fn push(&mut self, op: PendingOperation) {
        self.operations.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = PendingOperation>) {
        self.operations.extend(ops);
    }

    /// Hand out everything queued so far and leave the queue empty
    pub fn take_all(&mut self) -> Vec<PendingOperation> {
        std::mem::take(&mut self.operations)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn to_value(&self) -> SyncResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a queue from whatever was persisted. Missing or non-array data
    /// gives an empty queue; entries that don't parse are skipped.
    pub fn decode(value: Option<Value>) -> Self {
        let Some(Value::Array(items)) = value else {
            return PendingQueue::new();
        };

        let total = items.len();
        let operations: Vec<PendingOperation> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();

        if operations.len() < total {
            log::warn!(
                "Dropped {} malformed pending operation(s) while loading queue",
                total - operations.len()
            );
        }

        PendingQueue { operations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, RecordingSleeper};
    use crate::pending::OperationKind;
    use futures::executor::block_on;
    use serde_json::json;

    fn create_test_op(id: &str, timestamp: u64) -> PendingOperation {
        PendingOperation::new(OperationKind::SaveWord, json!({ "id": id }), timestamp)
    }

    #[test]
    fn test_pending_queue_new() {
        let queue = PendingQueue::new();
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_and_take_all() {
        let mut queue = PendingQueue::new();
        queue.push(create_test_op("w1", 1));
        queue.push(create_test_op("w2", 2));

        let taken = queue.take_all();

        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].entity_id(), Some("w1"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let mut queue = PendingQueue::new();
        queue.push(create_test_op("w1", 7));

        let value = queue.to_value().unwrap();

        assert_eq!(
            value,
            json!([{"type": "saveWord", "data": {"id": "w1"}, "timestamp": 7}])
        );
    }

    #[test]
    fn test_decode_missing_or_wrong_shape() {
        assert!(PendingQueue::decode(None).is_empty());
        assert!(PendingQueue::decode(Some(json!({"type": "saveWord"}))).is_empty());
        assert!(PendingQueue::decode(Some(json!("[]"))).is_empty());
    }

    #[test]
    fn test_decode_skips_malformed_entries() {
        let queue = PendingQueue::decode(Some(json!([
            {"type": "saveWord", "data": {"id": "w1"}, "timestamp": 1},
            {"type": "saveNote"},
            42,
            {"type": "deleteNote", "data": {"noteId": "n1"}, "timestamp": 3}
        ])));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.operations[1].kind, OperationKind::DeleteNote);
    }

    #[test]
    fn test_timed_get_returns_value() {
        let store = MemoryStore::new();
        block_on(store.set("settings", json!({"lang": "he"}))).unwrap();
        let sleeper = RecordingSleeper::new();

        let value = block_on(timed_get(&store, &sleeper, "settings", 5_000));

        assert_eq!(value, Some(json!({"lang": "he"})));
    }

    #[test]
    fn test_timed_get_times_out_as_not_found() {
        let store = MemoryStore::new();
        block_on(store.set("settings", json!(1))).unwrap();
        store.stall_reads(true);
        let sleeper = RecordingSleeper::new();

        let value = block_on(timed_get(&store, &sleeper, "settings", 5_000));

        assert_eq!(value, None);
        assert_eq!(sleeper.delays(), vec![5_000]);
    }

    #[test]
    fn test_timed_set_gives_up_on_stalled_store() {
        let store = MemoryStore::new();
        store.stall_writes(true);
        let sleeper = RecordingSleeper::new();

        let result = block_on(timed_set(&store, &sleeper, "settings", json!(1), 5_000));

        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_timed_get_read_error_is_not_found() {
        let store = MemoryStore::new();
        store.fail_reads(true);
        let sleeper = RecordingSleeper::new();

        assert_eq!(block_on(timed_get(&store, &sleeper, "anything", 5_000)), None);
    }
}
