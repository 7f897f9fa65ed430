/// Cross-context broadcast of state-change events
use crate::message::{BroadcastMessage, Handshake, Timestamp};
use crate::storage::{KeyValueStore, timed_set, with_timeout};
use crate::transport::{
    Clock, DeliveryOutcome, MessageBus, Sleeper, Subscription, TabId, WindowChannel,
};
use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use uuid::Uuid;

/// Marks window messages as ours; pages post arbitrary data on the same channel
pub const WINDOW_SOURCE: &str = "wordstream-broadcast";
const DEDUP_CAPACITY: usize = 64;
const SEQUENCE_WRAP: u64 = 1_000_000;

pub type BroadcastCallback = Rc<dyn Fn(&BroadcastMessage)>;

/// Per-path result of one broadcast. `window` is None where no window exists.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastReport {
    pub message: BroadcastMessage,
    pub storage_key: String,
    pub storage: DeliveryOutcome,
    pub window: Option<DeliveryOutcome>,
    pub runtime: DeliveryOutcome,
}

impl BroadcastReport {
    pub fn reached_any(&self) -> bool {
        self.storage.is_delivered()
            || self.runtime.is_delivered()
            || self.window.as_ref().is_some_and(DeliveryOutcome::is_delivered)
    }
}

/// Sends each state change down three independent paths: a uniquely keyed
/// storage write, a window post and a runtime message. A failure or stall on
/// one never holds up the others. Delivery is at-least-once; use
/// `subscribe_deduplicated` to see each event once.
#[derive(Clone)]
pub struct Broadcaster {
    store: Rc<dyn KeyValueStore>,
    bus: Rc<dyn MessageBus>,
    window: Rc<dyn WindowChannel>,
    clock: Rc<dyn Clock>,
    sleeper: Rc<dyn Sleeper>,
    prefix: String,
    max_entries: usize,
    storage_timeout_ms: u32,
    sequence: Rc<Cell<u64>>,
}

impl Broadcaster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Rc<dyn KeyValueStore>,
        bus: Rc<dyn MessageBus>,
        window: Rc<dyn WindowChannel>,
        clock: Rc<dyn Clock>,
        sleeper: Rc<dyn Sleeper>,
        prefix: impl Into<String>,
        max_entries: usize,
        storage_timeout_ms: u32,
    ) -> Self {
        Self {
            store,
            bus,
            window,
            clock,
            sleeper,
            prefix: prefix.into(),
            max_entries,
            storage_timeout_ms,
            sequence: Rc::new(Cell::new(0)),
        }
    }

    /// Fan a message out on every path. Never fails; see the report for what
    /// each path did. Storage calls are bounded by the storage timeout.
    pub async fn broadcast(&self, mut message: BroadcastMessage) -> BroadcastReport {
        let now = self.clock.now_ms();
        if message.timestamp.is_none() {
            message.timestamp = Some(Timestamp::Iso(self.clock.now_iso()));
        }
        if message.message_id.is_none() {
            message.message_id = Some(Uuid::new_v4().to_string());
        }
        let value = message.to_value();
        let storage_key = self.next_key(now);

        let window = if self.window.is_available() {
            Some(self.window.post(&json!({ "source": WINDOW_SOURCE, "message": value.clone() })))
        } else {
            None
        };

        let (storage, runtime) = futures::join!(
            self.write_to_storage(&storage_key, value.clone(), &message.action),
            self.bus.send_runtime(&value)
        );
        match &runtime {
            DeliveryOutcome::TransportError(e) => {
                log::warn!("Broadcast {} runtime send failed: {}", message.action, e)
            }
            DeliveryOutcome::NoReceiver => {
                log::debug!("Broadcast {}: no runtime listener", message.action)
            }
            DeliveryOutcome::Delivered(_) => {}
        }

        BroadcastReport {
            message,
            storage_key,
            storage,
            window,
            runtime,
        }
    }

    /// Listen on all three paths. The returned handle removes every listener.
    pub fn subscribe(&self, callback: BroadcastCallback) -> Subscription {
        let from_storage = {
            let callback = callback.clone();
            let prefix = self.prefix.clone();
            self.store.on_changed(Rc::new(move |key: &str, value: Option<&Value>| {
                if !key.starts_with(&prefix) {
                    return;
                }
                if let Some(message) = value.and_then(BroadcastMessage::from_value) {
                    callback(&message);
                }
            }))
        };

        let from_window = {
            let callback = callback.clone();
            self.window.on_message(Rc::new(move |value: &Value| {
                if let Some(message) = unwrap_window_message(value) {
                    callback(&message);
                }
            }))
        };

        let from_runtime = self.bus.on_message(Rc::new(move |value: &Value, _: Option<TabId>| {
            if Handshake::is_handshake(value) {
                return false;
            }
            match BroadcastMessage::from_value(value) {
                Some(message) => {
                    callback(&message);
                    true
                }
                None => false,
            }
        }));

        from_storage.merge(from_window).merge(from_runtime)
    }

    /// Like `subscribe`, but each `messageId` reaches the callback at most
    /// once (within the last 64 ids seen)
    pub fn subscribe_deduplicated(&self, callback: BroadcastCallback) -> Subscription {
        let seen = Rc::new(RefCell::new(VecDeque::with_capacity(DEDUP_CAPACITY)));
        self.subscribe(Rc::new(move |message: &BroadcastMessage| {
            if let Some(id) = &message.message_id {
                let mut seen = seen.borrow_mut();
                if seen.contains(id) {
                    return;
                }
                if seen.len() == DEDUP_CAPACITY {
                    seen.pop_front();
                }
                seen.push_back(id.clone());
            }
            callback(message);
        }))
    }

    /// Keys embed a zero-padded timestamp and sequence, so sorting the keys
    /// sorts the broadcasts by age
    fn next_key(&self, now_ms: u64) -> String {
        let seq = self.sequence.get();
        self.sequence.set((seq + 1) % SEQUENCE_WRAP);
        format!("{}{:013}_{:06}", self.prefix, now_ms, seq)
    }

    async fn write_to_storage(&self, key: &str, value: Value, action: &str) -> DeliveryOutcome {
        let written = timed_set(
            self.store.as_ref(),
            self.sleeper.as_ref(),
            key,
            value,
            self.storage_timeout_ms,
        )
        .await;

        match written {
            Ok(()) => {
                self.prune().await;
                DeliveryOutcome::Delivered(None)
            }
            Err(e) => {
                log::warn!("Broadcast {} not written to storage: {}", action, e);
                DeliveryOutcome::TransportError(e.to_string())
            }
        }
    }

    async fn prune(&self) {
        let timeout_ms = self.storage_timeout_ms;
        let keys = match with_timeout(self.sleeper.as_ref(), timeout_ms, self.store.keys()).await {
            Some(Ok(keys)) => keys,
            Some(Err(e)) => {
                log::warn!("Broadcast cleanup skipped: {}", e);
                return;
            }
            None => {
                log::warn!("Broadcast cleanup skipped: key listing timed out");
                return;
            }
        };

        let stale = stale_broadcast_keys(keys, &self.prefix, self.max_entries);
        if stale.is_empty() {
            return;
        }
        match with_timeout(self.sleeper.as_ref(), timeout_ms, self.store.remove(&stale)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => log::warn!("Broadcast cleanup failed: {}", e),
            None => log::warn!("Broadcast cleanup timed out"),
        }
    }
}

/// Broadcast keys beyond the newest `keep`, oldest first
pub fn stale_broadcast_keys(keys: Vec<String>, prefix: &str, keep: usize) -> Vec<String> {
    let mut ours: Vec<String> = keys.into_iter().filter(|k| k.starts_with(prefix)).collect();
    ours.sort();

    let excess = ours.len().saturating_sub(keep);
    ours.truncate(excess);
    ours
}

fn unwrap_window_message(value: &Value) -> Option<BroadcastMessage> {
    if value.get("source")?.as_str()? != WINDOW_SOURCE {
        return None;
    }
    BroadcastMessage::from_value(value.get("message")?)
}
