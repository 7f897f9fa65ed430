/// Ports to the browser: messaging, window channel, connectivity, timers, clock.
///
/// Everything here runs on one event loop per context, so the traits are
/// `?Send` and shared state lives in `Rc<RefCell<_>>`.
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

pub type TabId = i32;

/// Callback for a pushed message: (payload, sender tab if any). Returns true
/// when it handled the message and the sender should get an acknowledgement;
/// messages meant for someone else must return false and stay unanswered.
pub type MessageListener = Rc<dyn Fn(&Value, Option<TabId>) -> bool>;

/// Result of a single send. A missing listener on the other end is an
/// expected condition and is reported as `NoReceiver`, not as an error.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered(Option<Value>),
    NoReceiver,
    TransportError(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }

    pub fn response(&self) -> Option<&Value> {
        match self {
            DeliveryOutcome::Delivered(response) => response.as_ref(),
            _ => None,
        }
    }

    /// Sort a raw `lastError` message into `NoReceiver` or `TransportError`
    pub fn from_error_message(message: &str) -> Self {
        if is_missing_receiver(message) {
            DeliveryOutcome::NoReceiver
        } else {
            DeliveryOutcome::TransportError(message.to_string())
        }
    }
}

/// Chrome reports an absent listener through these phrases
pub fn is_missing_receiver(message: &str) -> bool {
    message.contains("Receiving end does not exist")
        || message.contains("Could not establish connection")
        || message.contains("message port closed before a response was received")
}

/// Consumable unsubscribe handle; several handles can be merged into one
#[derive(Default)]
pub struct Subscription {
    cancels: Vec<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancels: vec![Box::new(cancel)],
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn merge(mut self, other: Subscription) -> Self {
        self.cancels.extend(other.cancels);
        self
    }

    pub fn len(&self) -> usize {
        self.cancels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty()
    }

    pub fn unsubscribe(self) {
        for cancel in self.cancels {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("listeners", &self.cancels.len())
            .finish()
    }
}

/// Inter-process request/response messaging (runtime.sendMessage / tabs.sendMessage)
#[async_trait(?Send)]
pub trait MessageBus {
    /// Send to the extension runtime (background, popup)
    async fn send_runtime(&self, message: &Value) -> DeliveryOutcome;

    /// Send to the content script of one tab
    async fn send_to_tab(&self, tab: TabId, message: &Value) -> DeliveryOutcome;

    fn on_message(&self, listener: MessageListener) -> Subscription;
}

/// Same-process window messaging (postMessage). Worker contexts have none.
pub trait WindowChannel {
    fn is_available(&self) -> bool;

    fn post(&self, message: &Value) -> DeliveryOutcome;

    fn on_message(&self, listener: Rc<dyn Fn(&Value)>) -> Subscription;
}

pub trait Connectivity {
    fn is_online(&self) -> bool;
}

pub trait AuthState {
    fn is_authenticated(&self) -> bool;
}

#[async_trait(?Send)]
pub trait Sleeper {
    async fn sleep(&self, ms: u32);
}

pub trait Clock {
    fn now_ms(&self) -> u64;

    /// ISO-8601 with millisecond precision, matching `Date.prototype.toISOString`
    fn now_iso(&self) -> String {
        iso_from_millis(self.now_ms())
    }
}

pub fn iso_from_millis(ms: u64) -> String {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
