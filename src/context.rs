/// Per-surface sync context tying the queue, broadcast and delivery together
use crate::broadcast::{BroadcastCallback, BroadcastReport, Broadcaster};
use crate::config::SyncConfig;
use crate::delivery::ReliableSender;
use crate::error::SyncError;
use crate::message::{AUTH_STATE_CHANGED, BroadcastMessage, Handshake, Timestamp};
use crate::pending::{OperationKind, PendingOperation};
use crate::queue::{HandlerRegistry, OfflineQueue, OperationHandler, ReplayReport};
use crate::readiness::{ReadinessTracker, ReadyTarget};
use crate::storage::{KeyValueStore, timed_get};
use crate::transport::{
    AuthState, Clock, Connectivity, DeliveryOutcome, MessageBus, Sleeper, Subscription, TabId,
    WindowChannel,
};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;

const RESERVED_FIELDS: [&str; 3] = ["action", "timestamp", "messageId"];

/// The browser collaborators a context talks to
#[derive(Clone)]
pub struct Ports {
    pub store: Rc<dyn KeyValueStore>,
    pub bus: Rc<dyn MessageBus>,
    pub window: Rc<dyn WindowChannel>,
    pub connectivity: Rc<dyn Connectivity>,
    pub auth: Rc<dyn AuthState>,
    pub sleeper: Rc<dyn Sleeper>,
    pub clock: Rc<dyn Clock>,
}

/// What happened to a write request
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Persisted directly and announced to the other contexts
    Written(BroadcastReport),
    /// Parked in the offline queue, with the reason the direct write didn't happen
    Queued {
        operation: PendingOperation,
        reason: SyncError,
    },
}

/// One per extension surface, built from the `Ports` it is handed. Separate
/// instances share nothing unless they are given the same adapters.
#[derive(Clone)]
pub struct SyncContext {
    config: SyncConfig,
    ports: Ports,
    queue: OfflineQueue,
    broadcaster: Broadcaster,
    sender: ReliableSender,
    handlers: Rc<RefCell<HandlerRegistry>>,
}

impl SyncContext {
    pub fn new(config: SyncConfig, ports: Ports) -> Self {
        let queue = OfflineQueue::new(
            ports.store.clone(),
            ports.sleeper.clone(),
            ports.clock.clone(),
            config.queue_key.clone(),
            config.storage_timeout_ms,
        );
        let broadcaster = Broadcaster::new(
            ports.store.clone(),
            ports.bus.clone(),
            ports.window.clone(),
            ports.clock.clone(),
            ports.sleeper.clone(),
            config.broadcast_prefix.clone(),
            config.max_broadcast_entries,
            config.storage_timeout_ms,
        );
        let sender = ReliableSender::new(
            ports.bus.clone(),
            ports.sleeper.clone(),
            ReadinessTracker::new(),
            config.readiness,
            config.auth_retry,
        );

        Self {
            config,
            ports,
            queue,
            broadcaster,
            sender,
            handlers: Rc::new(RefCell::new(HandlerRegistry::new())),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn readiness(&self) -> &ReadinessTracker {
        self.sender.readiness()
    }

    pub fn register_handler(&self, kind: OperationKind, handler: Rc<dyn OperationHandler>) {
        self.handlers.borrow_mut().register(kind, handler);
    }

    /// Load the persisted queue and, if already online, replay it
    pub async fn start(&self) -> ReplayReport {
        self.queue.load_pending().await;
        self.replay().await
    }

    /// Write now if possible, otherwise queue for later. Successful writes
    /// are announced to the other contexts.
    pub async fn write(&self, kind: OperationKind, data: Value) -> WriteOutcome {
        match self.try_direct(&kind, &data).await {
            Ok(()) => WriteOutcome::Written(self.announce(&kind, &data).await),
            Err(reason) => {
                log::info!("{} queued: {}", kind, reason);
                let operation = self.queue.enqueue(kind, data).await;
                WriteOutcome::Queued { operation, reason }
            }
        }
    }

    pub async fn enqueue(&self, kind: OperationKind, data: Value) -> PendingOperation {
        self.queue.enqueue(kind, data).await
    }

    /// Replay the queue and announce every operation that went through
    pub async fn replay(&self) -> ReplayReport {
        let handlers = self.handlers.borrow().clone();
        let report = self
            .queue
            .replay_pending(self.ports.connectivity.as_ref(), &handlers)
            .await;

        for op in &report.replayed {
            self.announce(&op.kind, &op.data).await;
        }
        report
    }

    /// Feed connectivity changes (online event or periodic poll) in here
    pub async fn on_connectivity_changed(&self, online: bool) -> Option<ReplayReport> {
        if !online {
            log::info!("Connectivity lost, writes will be queued");
            return None;
        }
        Some(self.replay().await)
    }

    pub async fn broadcast(&self, message: BroadcastMessage) -> BroadcastReport {
        self.broadcaster.broadcast(message).await
    }

    pub fn subscribe(&self, callback: BroadcastCallback) -> Subscription {
        self.broadcaster.subscribe(callback)
    }

    pub fn subscribe_deduplicated(&self, callback: BroadcastCallback) -> Subscription {
        self.broadcaster.subscribe_deduplicated(callback)
    }

    /// Route an incoming runtime message. Returns true when it was a
    /// readiness handshake and has been consumed.
    pub fn handle_message(&self, message: &Value, sender_tab: Option<TabId>) -> bool {
        match Handshake::parse(message, sender_tab) {
            Some(handshake) => {
                let target = self.readiness().apply(handshake);
                log::info!("Handshake received from {:?}", target);
                true
            }
            None => false,
        }
    }

    pub fn tab_closed(&self, tab: TabId) {
        self.readiness().forget_tab(tab);
    }

    pub async fn send(&self, target: ReadyTarget, message: &Value) -> DeliveryOutcome {
        self.sender.send(target, message).await
    }

    pub async fn send_with_readiness_check(
        &self,
        target: ReadyTarget,
        message: &Value,
        max_attempts: u32,
    ) -> DeliveryOutcome {
        self.sender
            .send_with_readiness_check(target, message, max_attempts)
            .await
    }

    /// Push an auth change to the given tabs (every ready tab when empty)
    pub async fn send_auth_state(
        &self,
        tabs: &[TabId],
        fields: Map<String, Value>,
    ) -> Vec<(TabId, DeliveryOutcome)> {
        let tabs = if tabs.is_empty() {
            self.readiness().ready_tabs()
        } else {
            tabs.to_vec()
        };

        let mut message = BroadcastMessage::new(AUTH_STATE_CHANGED);
        message.fields = fields
            .into_iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .collect();
        message.timestamp = Some(Timestamp::Iso(self.ports.clock.now_iso()));

        self.sender.send_auth_state(&tabs, &message.to_value()).await
    }

    /// Read a cached-state key with the configured timeout
    pub async fn read_cached(&self, key: &str) -> Option<Value> {
        timed_get(
            self.ports.store.as_ref(),
            self.ports.sleeper.as_ref(),
            key,
            self.config.storage_timeout_ms,
        )
        .await
    }

    async fn try_direct(&self, kind: &OperationKind, data: &Value) -> Result<(), SyncError> {
        if !self.ports.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        if !self.ports.auth.is_authenticated() {
            return Err(SyncError::Unauthenticated);
        }

        let handler = self
            .handlers
            .borrow()
            .get(kind)
            .ok_or_else(|| SyncError::NoHandler(kind.to_string()))?;
        let op = PendingOperation::new(kind.clone(), data.clone(), self.ports.clock.now_ms());
        handler.handle(&op).await
    }

    async fn announce(&self, kind: &OperationKind, data: &Value) -> BroadcastReport {
        let action = kind.broadcast_action().unwrap_or(kind.as_str());
        self.broadcaster.broadcast(announcement(action, data)).await
    }
}

/// Build the state-change event for a write: the payload's fields are lifted
/// onto the message, except the ones the envelope owns
fn announcement(action: &str, data: &Value) -> BroadcastMessage {
    let mut message = BroadcastMessage::new(action);
    match data {
        Value::Object(fields) => {
            for (key, value) in fields {
                if !RESERVED_FIELDS.contains(&key.as_str()) {
                    message.fields.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Null => {}
        other => {
            message.fields.insert("data".to_string(), other.clone());
        }
    }
    message
}
