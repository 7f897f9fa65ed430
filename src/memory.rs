/// In-memory storage and transport adapters
use crate::error::{SyncError, SyncResult};
use crate::storage::{ChangeListener, KeyValueStore};
use crate::transport::{
    AuthState, Clock, Connectivity, DeliveryOutcome, MessageBus, MessageListener, Sleeper,
    Subscription, TabId, WindowChannel,
};
use async_trait::async_trait;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

#[derive(Default)]
struct StoreInner {
    entries: BTreeMap<String, Value>,
    listeners: Vec<(u64, ChangeListener)>,
    next_listener: u64,
    fail_reads: bool,
    fail_writes: bool,
    stall_reads: bool,
    stall_writes: bool,
}

/// Clones share state, so two clones behave like two extension contexts
/// looking at the same chrome.storage area
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.borrow_mut().fail_reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }

    /// Make every read hang forever, like a wedged chrome.storage call
    pub fn stall_reads(&self, stall: bool) {
        self.inner.borrow_mut().stall_reads = stall;
    }

    /// Same for `set` and `remove`
    pub fn stall_writes(&self, stall: bool) {
        self.inner.borrow_mut().stall_writes = stall;
    }

    async fn wait_if_stalled(&self, writing: bool) {
        let stalled = {
            let inner = self.inner.borrow();
            if writing { inner.stall_writes } else { inner.stall_reads }
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.borrow().entries.clone()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .borrow()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let listeners: Vec<ChangeListener> = self
            .inner
            .borrow()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(key, value);
        }
    }
}

#[async_trait(?Send)]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        self.wait_if_stalled(false).await;
        let inner = self.inner.borrow();
        if inner.fail_reads {
            return Err(SyncError::Storage("read failed".to_string()));
        }
        Ok(inner.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> SyncResult<()> {
        self.wait_if_stalled(true).await;
        {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_writes {
                return Err(SyncError::Storage("QUOTA_BYTES quota exceeded".to_string()));
            }
            inner.entries.insert(key.to_string(), value.clone());
        }
        self.notify(key, Some(&value));
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> SyncResult<()> {
        self.wait_if_stalled(true).await;
        let removed: Vec<String> = {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_writes {
                return Err(SyncError::Storage("remove failed".to_string()));
            }
            keys.iter()
                .filter(|k| inner.entries.remove(k.as_str()).is_some())
                .cloned()
                .collect()
        };
        for key in removed {
            self.notify(&key, None);
        }
        Ok(())
    }

    async fn keys(&self) -> SyncResult<Vec<String>> {
        self.wait_if_stalled(false).await;
        let inner = self.inner.borrow();
        if inner.fail_reads {
            return Err(SyncError::Storage("read failed".to_string()));
        }
        Ok(inner.entries.keys().cloned().collect())
    }

    fn on_changed(&self, listener: ChangeListener) -> Subscription {
        let id = {
            let mut inner = self.inner.borrow_mut();
            inner.next_listener += 1;
            let id = inner.next_listener;
            inner.listeners.push((id, listener));
            id
        };

        let inner = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.borrow_mut().listeners.retain(|(l, _)| *l != id);
            }
        })
    }
}

/// A message recorded by `MemoryBus`; `tab` is None for runtime sends
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub tab: Option<TabId>,
    pub message: Value,
}

#[derive(Default)]
struct BusInner {
    runtime_listeners: Vec<(u64, MessageListener)>,
    window_listeners: Vec<(u64, Rc<dyn Fn(&Value)>)>,
    next_listener: u64,
    window_available: bool,
    runtime_error: Option<String>,
    connected_tabs: HashMap<TabId, Value>,
    scripted: HashMap<TabId, VecDeque<DeliveryOutcome>>,
    sent: Vec<SentMessage>,
    posted: Vec<Value>,
}

/// Runtime messaging plus a window channel, shared by every clone
#[derive(Clone)]
pub struct MemoryBus {
    inner: Rc<RefCell<BusInner>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let inner = BusInner {
            window_available: true,
            ..BusInner::default()
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// A bus for worker contexts, where there is no window to post to
    pub fn without_window() -> Self {
        let bus = Self::new();
        bus.inner.borrow_mut().window_available = false;
        bus
    }

    /// Give the tab a content script that answers every message with `response`
    pub fn connect_tab(&self, tab: TabId, response: Value) {
        self.inner.borrow_mut().connected_tabs.insert(tab, response);
    }

    pub fn disconnect_tab(&self, tab: TabId) {
        self.inner.borrow_mut().connected_tabs.remove(&tab);
    }

    /// Queue outcomes returned (in order) by the next sends to `tab`, before
    /// falling back to the connected/disconnected behaviour
    pub fn script_tab(&self, tab: TabId, outcomes: Vec<DeliveryOutcome>) {
        self.inner
            .borrow_mut()
            .scripted
            .entry(tab)
            .or_default()
            .extend(outcomes);
    }

    pub fn fail_runtime(&self, error: Option<&str>) {
        self.inner.borrow_mut().runtime_error = error.map(str::to_string);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner.borrow().sent.clone()
    }

    pub fn sent_to_tab(&self, tab: TabId) -> Vec<Value> {
        self.inner
            .borrow()
            .sent
            .iter()
            .filter(|s| s.tab == Some(tab))
            .map(|s| s.message.clone())
            .collect()
    }

    pub fn posted(&self) -> Vec<Value> {
        self.inner.borrow().posted.clone()
    }

    /// Deliver a message to runtime listeners as if it came from `sender`.
    /// True when at least one listener acknowledged it.
    pub fn inject_runtime(&self, message: &Value, sender: Option<TabId>) -> bool {
        let listeners: Vec<MessageListener> = self
            .inner
            .borrow()
            .runtime_listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        listeners
            .iter()
            .fold(false, |acked, listener| listener(message, sender) || acked)
    }

    fn next_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.next_listener += 1;
        inner.next_listener
    }
}

#[async_trait(?Send)]
impl MessageBus for MemoryBus {
    async fn send_runtime(&self, message: &Value) -> DeliveryOutcome {
        let error = {
            let mut inner = self.inner.borrow_mut();
            inner.sent.push(SentMessage {
                tab: None,
                message: message.clone(),
            });
            inner.runtime_error.clone()
        };
        if let Some(error) = error {
            return DeliveryOutcome::from_error_message(&error);
        }

        if self.inject_runtime(message, None) {
            DeliveryOutcome::Delivered(None)
        } else {
            DeliveryOutcome::NoReceiver
        }
    }

    async fn send_to_tab(&self, tab: TabId, message: &Value) -> DeliveryOutcome {
        let mut inner = self.inner.borrow_mut();
        inner.sent.push(SentMessage {
            tab: Some(tab),
            message: message.clone(),
        });

        if let Some(outcome) = inner.scripted.get_mut(&tab).and_then(VecDeque::pop_front) {
            return outcome;
        }

        match inner.connected_tabs.get(&tab) {
            Some(response) => DeliveryOutcome::Delivered(Some(response.clone())),
            None => DeliveryOutcome::NoReceiver,
        }
    }

    fn on_message(&self, listener: MessageListener) -> Subscription {
        let id = self.next_id();
        self.inner.borrow_mut().runtime_listeners.push((id, listener));

        let inner = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.borrow_mut().runtime_listeners.retain(|(l, _)| *l != id);
            }
        })
    }
}

impl WindowChannel for MemoryBus {
    fn is_available(&self) -> bool {
        self.inner.borrow().window_available
    }

    fn post(&self, message: &Value) -> DeliveryOutcome {
        let listeners: Vec<Rc<dyn Fn(&Value)>> = {
            let mut inner = self.inner.borrow_mut();
            if !inner.window_available {
                return DeliveryOutcome::NoReceiver;
            }
            inner.posted.push(message.clone());
            inner.window_listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in listeners {
            listener(message);
        }
        DeliveryOutcome::Delivered(None)
    }

    fn on_message(&self, listener: Rc<dyn Fn(&Value)>) -> Subscription {
        if !self.is_available() {
            return Subscription::empty();
        }

        let id = self.next_id();
        self.inner.borrow_mut().window_listeners.push((id, listener));

        let inner = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.borrow_mut().window_listeners.retain(|(l, _)| *l != id);
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

/// Returns immediately from every sleep and records the requested delays.
/// An optional hook runs on each sleep, letting tests change the world
/// between retries.
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    delays: Rc<RefCell<Vec<u32>>>,
    hook: Option<Rc<dyn Fn(u32)>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: impl Fn(u32) + 'static) -> Self {
        Self {
            delays: Rc::default(),
            hook: Some(Rc::new(hook)),
        }
    }

    pub fn delays(&self) -> Vec<u32> {
        self.delays.borrow().clone()
    }
}

#[async_trait(?Send)]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, ms: u32) {
        self.delays.borrow_mut().push(ms);
        if let Some(hook) = &self.hook {
            hook(ms);
        }
    }
}

#[derive(Clone)]
pub struct StaticConnectivity {
    online: Rc<Cell<bool>>,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Rc::new(Cell::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.set(online);
    }
}

impl Connectivity for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.online.get()
    }
}

#[derive(Clone)]
pub struct StaticAuth {
    signed_in: Rc<Cell<bool>>,
}

impl StaticAuth {
    pub fn new(signed_in: bool) -> Self {
        Self {
            signed_in: Rc::new(Cell::new(signed_in)),
        }
    }

    pub fn set_signed_in(&self, signed_in: bool) {
        self.signed_in.set(signed_in);
    }
}

impl AuthState for StaticAuth {
    fn is_authenticated(&self) -> bool {
        self.signed_in.get()
    }
}
