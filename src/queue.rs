/// Offline operation queue for writes that can't reach the backend yet
use crate::error::{SyncError, SyncResult};
use crate::operations::{order_for_replay, split_by_known_kind};
use crate::pending::{OperationKind, PendingOperation};
use crate::storage::{KeyValueStore, PendingQueue, timed_get, timed_set};
use crate::transport::{Clock, Connectivity, Sleeper};
use async_trait::async_trait;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

/// Performs one kind of write against the backend. Writes are keyed by a
/// stable id, so running the same operation twice must be harmless.
#[async_trait(?Send)]
pub trait OperationHandler {
    async fn handle(&self, op: &PendingOperation) -> SyncResult<()>;
}

/// Adapts an async closure into an `OperationHandler`
pub struct FnHandler<F>(pub F);

#[async_trait(?Send)]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(PendingOperation) -> Fut,
    Fut: Future<Output = SyncResult<()>> + 'static,
{
    async fn handle(&self, op: &PendingOperation) -> SyncResult<()> {
        (self.0)(op.clone()).await
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Rc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: OperationKind, handler: Rc<dyn OperationHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: &OperationKind) -> Option<Rc<dyn OperationHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.handlers.keys().cloned().collect()
    }
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Operations whose handler succeeded, in the order they ran
    pub replayed: Vec<PendingOperation>,
    /// Operations put back on the queue (handler failed, missing or unknown kind)
    pub requeued: usize,
    /// True when the pass didn't run (offline or another pass in progress)
    pub skipped: bool,
}

impl ReplayReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Mirrored to durable storage after every mutation and replayed in timestamp
/// order once connectivity returns. Persistence failures are only logged; the
/// queue keeps working from memory.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Rc<dyn KeyValueStore>,
    sleeper: Rc<dyn Sleeper>,
    clock: Rc<dyn Clock>,
    key: String,
    storage_timeout_ms: u32,
    pending: Rc<RefCell<PendingQueue>>,
    replaying: Rc<Cell<bool>>,
}

impl OfflineQueue {
    pub fn new(
        store: Rc<dyn KeyValueStore>,
        sleeper: Rc<dyn Sleeper>,
        clock: Rc<dyn Clock>,
        key: impl Into<String>,
        storage_timeout_ms: u32,
    ) -> Self {
        Self {
            store,
            sleeper,
            clock,
            key: key.into(),
            storage_timeout_ms,
            pending: Rc::new(RefCell::new(PendingQueue::new())),
            replaying: Rc::new(Cell::new(false)),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingOperation> {
        self.pending.borrow().operations.clone()
    }

    /// Queue a write for later. No de-duplication: the same logical write may
    /// be queued more than once and replay tolerates it.
    pub async fn enqueue(&self, kind: OperationKind, data: Value) -> PendingOperation {
        let op = PendingOperation::new(kind, data, self.clock.now_ms());
        self.pending.borrow_mut().push(op.clone());
        log::info!("Queued {} for later ({} pending)", op.kind, self.len());

        self.persist().await;
        op
    }

    /// Load whatever a previous run left in storage. Anything enqueued in
    /// this process before the load finished is kept after the loaded entries.
    pub async fn load_pending(&self) -> usize {
        let stored = timed_get(
            self.store.as_ref(),
            self.sleeper.as_ref(),
            &self.key,
            self.storage_timeout_ms,
        )
        .await;
        let loaded = PendingQueue::decode(stored);

        let (count, had_local) = {
            let mut pending = self.pending.borrow_mut();
            let local = pending.take_all();
            let had_local = !local.is_empty();
            pending.extend(loaded.operations);
            pending.extend(local);
            (pending.len(), had_local)
        };

        if had_local {
            self.persist().await;
        }
        log::info!("Loaded offline queue: {} pending operation(s)", count);
        count
    }

    /// Run every queued operation through its handler.
    ///
    /// The queue is snapshotted and cleared before any handler runs, so a
    /// second trigger arriving mid-pass finds nothing to do. Failures, kinds
    /// without a handler and unknown kinds go back on the queue.
    pub async fn replay_pending(
        &self,
        connectivity: &dyn Connectivity,
        handlers: &HandlerRegistry,
    ) -> ReplayReport {
        if !connectivity.is_online() {
            log::debug!("Still offline, replay skipped");
            return ReplayReport::skipped();
        }
        if self.replaying.replace(true) {
            log::debug!("Replay already running, skipped");
            return ReplayReport::skipped();
        }

        let snapshot = self.pending.borrow_mut().take_all();
        if snapshot.is_empty() {
            self.replaying.set(false);
            return ReplayReport::default();
        }
        self.persist().await;
        log::info!("Replaying {} pending operation(s)", snapshot.len());

        let (known, mut failed) = split_by_known_kind(snapshot);
        for op in &failed {
            log::warn!("Unknown operation type {}, keeping it queued", op.kind);
        }

        let mut replayed = Vec::new();
        for op in order_for_replay(known) {
            match self.dispatch(handlers, &op).await {
                Ok(()) => replayed.push(op),
                Err(e) => {
                    log::warn!("Replay of {} failed: {}", op.kind, e);
                    failed.push(op);
                }
            }
        }

        let requeued = failed.len();
        if requeued > 0 {
            self.pending.borrow_mut().extend(failed);
            self.persist().await;
        }
        self.replaying.set(false);

        log::info!("Replay finished: {} done, {} requeued", replayed.len(), requeued);
        ReplayReport {
            replayed,
            requeued,
            skipped: false,
        }
    }

    async fn dispatch(&self, handlers: &HandlerRegistry, op: &PendingOperation) -> SyncResult<()> {
        let handler = handlers
            .get(&op.kind)
            .ok_or_else(|| SyncError::NoHandler(op.kind.to_string()))?;
        handler.handle(op).await
    }

    async fn persist(&self) {
        let value = match self.pending.borrow().to_value() {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Could not serialize offline queue: {}", e);
                return;
            }
        };

        let written = timed_set(
            self.store.as_ref(),
            self.sleeper.as_ref(),
            &self.key,
            value,
            self.storage_timeout_ms,
        )
        .await;
        if let Err(e) = written {
            log::warn!("Could not persist offline queue: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ManualClock, MemoryStore, RecordingSleeper, StaticConnectivity};
    use futures::executor::block_on;
    use serde_json::json;

    const KEY: &str = "wordstream_pending_operations";

    type Calls = Rc<RefCell<Vec<PendingOperation>>>;

    fn create_queue(store: &MemoryStore, clock: &ManualClock) -> OfflineQueue {
        OfflineQueue::new(
            Rc::new(store.clone()),
            Rc::new(RecordingSleeper::new()),
            Rc::new(clock.clone()),
            KEY,
            5_000,
        )
    }

    fn recording_handler(calls: &Calls) -> Rc<dyn OperationHandler> {
        let calls = calls.clone();
        Rc::new(FnHandler(move |op: PendingOperation| {
            calls.borrow_mut().push(op);
            async { Ok::<(), SyncError>(()) }
        }))
    }

    fn failing_handler() -> Rc<dyn OperationHandler> {
        Rc::new(FnHandler(|op: PendingOperation| async move {
            Err::<(), _>(SyncError::Handler {
                kind: op.kind.to_string(),
                reason: "permission-denied".to_string(),
            })
        }))
    }

    fn stored_len(store: &MemoryStore) -> usize {
        store
            .snapshot()
            .get(KEY)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    #[test]
    fn test_save_word_scenario() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(1_000);
        let queue = create_queue(&store, &clock);
        let connectivity = StaticConnectivity::new(false);
        let calls: Calls = Rc::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SaveWord, recording_handler(&calls));
        let payload = json!({"id": "w1", "originalWord": "hello", "targetWord": "שלום"});

        block_on(queue.enqueue(OperationKind::SaveWord, payload.clone()));
        assert_eq!(queue.len(), 1);
        assert_eq!(stored_len(&store), 1);

        connectivity.set_online(true);
        let report = block_on(queue.replay_pending(&connectivity, &handlers));

        assert_eq!(queue.len(), 0);
        assert_eq!(stored_len(&store), 0);
        assert_eq!(report.replayed.len(), 1);
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0].data, payload);
    }

    #[test]
    fn test_replay_skipped_while_offline() {
        let store = MemoryStore::new();
        let queue = create_queue(&store, &ManualClock::new(0));
        let calls: Calls = Rc::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SaveNote, recording_handler(&calls));

        block_on(queue.enqueue(OperationKind::SaveNote, json!({"id": "n1"})));
        let report = block_on(queue.replay_pending(&StaticConnectivity::new(false), &handlers));

        assert!(report.skipped);
        assert_eq!(queue.len(), 1);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_replay_runs_in_timestamp_order() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(500);
        let queue = create_queue(&store, &clock);
        let calls: Calls = Rc::default();
        let mut handlers = HandlerRegistry::new();
        for kind in [OperationKind::SaveWord, OperationKind::SaveNote, OperationKind::DeleteWord] {
            handlers.register(kind, recording_handler(&calls));
        }

        // storage written by another context with out-of-order entries
        block_on(store.set(
            KEY,
            json!([
                {"type": "deleteWord", "data": {"id": "w1"}, "timestamp": 300},
                {"type": "saveWord", "data": {"id": "w1"}, "timestamp": 100},
                {"type": "saveNote", "data": {"id": "n1"}, "timestamp": 200}
            ]),
        ))
        .unwrap();
        block_on(queue.load_pending());
        block_on(queue.enqueue(OperationKind::SaveWord, json!({"id": "w2"})));

        block_on(queue.replay_pending(&StaticConnectivity::new(true), &handlers));

        let stamps: Vec<u64> = calls.borrow().iter().map(|op| op.timestamp).collect();
        assert_eq!(stamps, vec![100, 200, 300, 500]);
    }

    #[test]
    fn test_failed_and_unknown_operations_are_requeued() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(10);
        let queue = create_queue(&store, &clock);
        let calls: Calls = Rc::default();
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SaveWord, recording_handler(&calls));
        handlers.register(OperationKind::SaveChat, failing_handler());

        block_on(queue.enqueue(OperationKind::SaveWord, json!({"id": "w1"})));
        block_on(queue.enqueue(OperationKind::SaveChat, json!({"id": "c1"})));
        block_on(queue.enqueue(OperationKind::from("pinWord"), json!({"id": "w1"})));
        block_on(queue.enqueue(OperationKind::DeleteNote, json!({"noteId": "n1"})));

        let report = block_on(queue.replay_pending(&StaticConnectivity::new(true), &handlers));

        assert_eq!(report.replayed.len(), 1);
        assert_eq!(report.requeued, 3);
        assert_eq!(queue.len(), 3);
        assert_eq!(stored_len(&store), 3);
        let kinds: Vec<String> = queue.snapshot().iter().map(|op| op.kind.to_string()).collect();
        assert!(kinds.contains(&"pinWord".to_string()));
        assert!(kinds.contains(&"saveChat".to_string()));
        assert!(kinds.contains(&"deleteNote".to_string()));
    }

    #[test]
    fn test_duplicate_replay_is_harmless() {
        let store = MemoryStore::new();
        let queue = create_queue(&store, &ManualClock::new(1));
        let words: Rc<RefCell<HashMap<String, Value>>> = Rc::default();
        let mut handlers = HandlerRegistry::new();
        {
            let words = words.clone();
            handlers.register(
                OperationKind::SaveWord,
                Rc::new(FnHandler(move |op: PendingOperation| {
                    let id = op.entity_id().unwrap_or_default().to_string();
                    words.borrow_mut().insert(id, op.data.clone());
                    async { Ok::<(), SyncError>(()) }
                })),
            );
        }
        let payload = json!({"id": "w1", "originalWord": "hello", "targetWord": "שלום"});

        // same write queued twice, as after a crash between persist and dequeue
        block_on(queue.enqueue(OperationKind::SaveWord, payload.clone()));
        block_on(queue.enqueue(OperationKind::SaveWord, payload.clone()));
        let report = block_on(queue.replay_pending(&StaticConnectivity::new(true), &handlers));

        assert_eq!(report.replayed.len(), 2);
        assert_eq!(words.borrow().len(), 1);
        assert_eq!(words.borrow()["w1"], payload);
    }

    #[test]
    fn test_load_pending_survives_restart() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(42);
        let first_run = create_queue(&store, &clock);
        block_on(first_run.enqueue(OperationKind::SaveNote, json!({"id": "n1"})));

        let second_run = create_queue(&store, &clock);
        let count = block_on(second_run.load_pending());

        assert_eq!(count, 1);
        assert_eq!(second_run.snapshot()[0].kind, OperationKind::SaveNote);
    }

    #[test]
    fn test_load_pending_malformed_or_unreadable() {
        let store = MemoryStore::new();
        block_on(store.set(KEY, json!({"not": "a list"}))).unwrap();
        let queue = create_queue(&store, &ManualClock::new(0));
        assert_eq!(block_on(queue.load_pending()), 0);

        store.fail_reads(true);
        assert_eq!(block_on(queue.load_pending()), 0);
    }

    #[test]
    fn test_enqueue_survives_storage_failure() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let queue = create_queue(&store, &ManualClock::new(0));

        block_on(queue.enqueue(OperationKind::SaveWord, json!({"id": "w1"})));

        assert_eq!(queue.len(), 1);
        assert_eq!(stored_len(&store), 0);
    }

    #[test]
    fn test_enqueue_survives_stalled_storage() {
        let store = MemoryStore::new();
        store.stall_writes(true);
        let queue = create_queue(&store, &ManualClock::new(0));

        let op = block_on(queue.enqueue(OperationKind::SaveNote, json!({"id": "n1"})));

        assert_eq!(op.kind, OperationKind::SaveNote);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_concurrent_trigger_finds_nothing() {
        let store = MemoryStore::new();
        let queue = create_queue(&store, &ManualClock::new(0));
        let connectivity = StaticConnectivity::new(true);
        let second_pass: Rc<RefCell<Option<ReplayReport>>> = Rc::default();
        let mut handlers = HandlerRegistry::new();
        {
            let queue = queue.clone();
            let second_pass = second_pass.clone();
            let connectivity = connectivity.clone();
            handlers.register(
                OperationKind::SaveWord,
                Rc::new(FnHandler(move |_op: PendingOperation| {
                    let queue = queue.clone();
                    let second_pass = second_pass.clone();
                    let connectivity = connectivity.clone();
                    async move {
                        let report = queue
                            .replay_pending(&connectivity, &HandlerRegistry::new())
                            .await;
                        *second_pass.borrow_mut() = Some(report);
                        Ok::<(), SyncError>(())
                    }
                })),
            );
        }

        block_on(queue.enqueue(OperationKind::SaveWord, json!({"id": "w1"})));
        let report = block_on(queue.replay_pending(&connectivity, &handlers));

        assert_eq!(report.replayed.len(), 1);
        assert!(second_pass.borrow().as_ref().unwrap().skipped);
        assert!(queue.is_empty());
    }
}
