/// Browser adapters for the sync ports, backed by chrome.* through bridge.js
use crate::context::Ports;
use crate::error::{SyncError, SyncResult};
use crate::pending::PendingOperation;
use crate::queue::OperationHandler;
use crate::storage::{ChangeListener, KeyValueStore};
use crate::transport::{
    AuthState, Clock, Connectivity, DeliveryOutcome, MessageBus, MessageListener, Sleeper,
    Subscription, TabId, WindowChannel,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

#[wasm_bindgen(module = "/bridge.js")]
extern "C" {
    #[wasm_bindgen(catch)]
    async fn storageGet(key: &str) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(catch)]
    async fn storageSet(key: &str, value: JsValue) -> Result<(), JsValue>;

    #[wasm_bindgen(catch)]
    async fn storageRemove(keys: JsValue) -> Result<(), JsValue>;

    #[wasm_bindgen(catch)]
    async fn storageKeys() -> Result<JsValue, JsValue>;

    fn onStorageChanged(callback: &js_sys::Function) -> js_sys::Function;

    #[wasm_bindgen(catch)]
    async fn runtimeSendMessage(message: JsValue) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(catch)]
    async fn tabsSendMessage(tab_id: i32, message: JsValue) -> Result<JsValue, JsValue>;

    fn onRuntimeMessage(callback: &js_sys::Function) -> js_sys::Function;

    fn onTabRemoved(callback: &js_sys::Function) -> js_sys::Function;

    fn hasWindow() -> bool;

    #[wasm_bindgen(catch)]
    fn postWindowMessage(message: JsValue) -> Result<(), JsValue>;

    fn onWindowMessage(callback: &js_sys::Function) -> js_sys::Function;
}

/// Plain JS objects rather than `Map`s, so chrome.storage and postMessage
/// see the same shape a JS caller would have produced
pub fn to_js<T: Serialize + ?Sized>(value: &T) -> SyncResult<JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| SyncError::Serialization(format!("{:?}", e)))
}

/// `undefined` and `null` both read as absent
pub fn from_js(value: JsValue) -> SyncResult<Option<Value>> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    serde_wasm_bindgen::from_value(value)
        .map(Some)
        .map_err(|e| SyncError::Serialization(format!("{:?}", e)))
}

pub fn js_error_message(error: &JsValue) -> String {
    error.as_string().unwrap_or_else(|| format!("{:?}", error))
}

fn js_subscription(unsubscribe: js_sys::Function) -> Subscription {
    Subscription::new(move || {
        if let Err(e) = unsubscribe.call0(&JsValue::NULL) {
            log::warn!("Failed to remove listener: {}", js_error_message(&e));
        }
    })
}

/// chrome.storage.local
#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeStorage;

#[async_trait(?Send)]
impl KeyValueStore for ChromeStorage {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        let value = storageGet(key)
            .await
            .map_err(|e| SyncError::Storage(js_error_message(&e)))?;
        from_js(value)
    }

    async fn set(&self, key: &str, value: Value) -> SyncResult<()> {
        storageSet(key, to_js(&value)?)
            .await
            .map_err(|e| SyncError::Storage(js_error_message(&e)))
    }

    async fn remove(&self, keys: &[String]) -> SyncResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        storageRemove(to_js(keys)?)
            .await
            .map_err(|e| SyncError::Storage(js_error_message(&e)))
    }

    async fn keys(&self) -> SyncResult<Vec<String>> {
        let keys = storageKeys()
            .await
            .map_err(|e| SyncError::Storage(js_error_message(&e)))?;
        serde_wasm_bindgen::from_value(keys)
            .map_err(|e| SyncError::Serialization(format!("{:?}", e)))
    }

    fn on_changed(&self, listener: ChangeListener) -> Subscription {
        let callback = Closure::wrap(Box::new(move |key: String, value: JsValue| {
            match from_js(value) {
                Ok(value) => listener(&key, value.as_ref()),
                Err(e) => log::debug!("Ignoring unreadable change to {}: {}", key, e),
            }
        }) as Box<dyn Fn(String, JsValue)>)
        .into_js_value();

        js_subscription(onStorageChanged(callback.unchecked_ref()))
    }
}

#[derive(Deserialize)]
struct SendResult {
    ok: bool,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn outcome_from_send(result: Result<JsValue, JsValue>) -> DeliveryOutcome {
    let result = match result {
        Ok(result) => result,
        Err(e) => return DeliveryOutcome::from_error_message(&js_error_message(&e)),
    };

    match serde_wasm_bindgen::from_value::<SendResult>(result) {
        Ok(SendResult { ok: true, response, .. }) => DeliveryOutcome::Delivered(response),
        Ok(SendResult { error, .. }) => {
            DeliveryOutcome::from_error_message(error.as_deref().unwrap_or("Unknown error"))
        }
        Err(e) => DeliveryOutcome::TransportError(format!("Unreadable send result: {:?}", e)),
    }
}

/// chrome.runtime / chrome.tabs messaging
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeBus;

#[async_trait(?Send)]
impl MessageBus for RuntimeBus {
    async fn send_runtime(&self, message: &Value) -> DeliveryOutcome {
        match to_js(message) {
            Ok(message) => outcome_from_send(runtimeSendMessage(message).await),
            Err(e) => DeliveryOutcome::TransportError(e.to_string()),
        }
    }

    async fn send_to_tab(&self, tab: TabId, message: &Value) -> DeliveryOutcome {
        match to_js(message) {
            Ok(message) => outcome_from_send(tabsSendMessage(tab, message).await),
            Err(e) => DeliveryOutcome::TransportError(e.to_string()),
        }
    }

    fn on_message(&self, listener: MessageListener) -> Subscription {
        let callback = Closure::wrap(Box::new(move |message: JsValue, sender_tab: JsValue| {
            let tab = sender_tab.as_f64().map(|tab| tab as TabId);
            match from_js(message) {
                Ok(Some(message)) => listener(&message, tab),
                _ => false,
            }
        }) as Box<dyn Fn(JsValue, JsValue) -> bool>)
        .into_js_value();

        js_subscription(onRuntimeMessage(callback.unchecked_ref()))
    }
}

/// Calls `callback` with the id of every tab that closes
pub fn on_tab_removed(callback: impl Fn(TabId) + 'static) -> Subscription {
    let callback = Closure::wrap(Box::new(move |tab: i32| callback(tab)) as Box<dyn Fn(i32)>)
        .into_js_value();

    js_subscription(onTabRemoved(callback.unchecked_ref()))
}

/// window.postMessage within the current page
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowBridge;

impl WindowChannel for WindowBridge {
    fn is_available(&self) -> bool {
        hasWindow()
    }

    fn post(&self, message: &Value) -> DeliveryOutcome {
        let message = match to_js(message) {
            Ok(message) => message,
            Err(e) => return DeliveryOutcome::TransportError(e.to_string()),
        };
        match postWindowMessage(message) {
            Ok(()) => DeliveryOutcome::Delivered(None),
            Err(e) => DeliveryOutcome::TransportError(js_error_message(&e)),
        }
    }

    fn on_message(&self, listener: Rc<dyn Fn(&Value)>) -> Subscription {
        let callback = Closure::wrap(Box::new(move |data: JsValue| {
            if let Ok(Some(data)) = from_js(data) {
                listener(&data);
            }
        }) as Box<dyn Fn(JsValue)>)
        .into_js_value();

        js_subscription(onWindowMessage(callback.unchecked_ref()))
    }
}

/// navigator.onLine, read from the window or the worker global scope
#[derive(Debug, Clone, Copy, Default)]
pub struct NavigatorConnectivity;

impl Connectivity for NavigatorConnectivity {
    fn is_online(&self) -> bool {
        if let Some(window) = web_sys::window() {
            return window.navigator().on_line();
        }

        js_sys::Reflect::get(&js_sys::global(), &JsValue::from_str("navigator"))
            .ok()
            .and_then(|navigator| js_sys::Reflect::get(&navigator, &JsValue::from_str("onLine")).ok())
            .and_then(|on_line| on_line.as_bool())
            .unwrap_or(true)
    }
}

/// Signed-in flag pushed in by the extension's auth code
#[derive(Debug, Clone, Default)]
pub struct SessionAuth {
    signed_in: Rc<Cell<bool>>,
}

impl SessionAuth {
    pub fn set_signed_in(&self, signed_in: bool) {
        self.signed_in.set(signed_in);
    }
}

impl AuthState for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.signed_in.get()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GlooSleeper;

#[async_trait(?Send)]
impl Sleeper for GlooSleeper {
    async fn sleep(&self, ms: u32) {
        gloo_timers::future::TimeoutFuture::new(ms).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsClock;

impl Clock for JsClock {
    fn now_ms(&self) -> u64 {
        js_sys::Date::now() as u64
    }

    fn now_iso(&self) -> String {
        js_sys::Date::new_0().to_iso_string().into()
    }
}

/// An operation handler written in JS: called with the operation, may
/// return a Promise. A throw or a rejection counts as failure.
pub struct JsHandler {
    callback: js_sys::Function,
}

impl JsHandler {
    pub fn new(callback: js_sys::Function) -> Self {
        Self { callback }
    }
}

#[async_trait(?Send)]
impl OperationHandler for JsHandler {
    async fn handle(&self, op: &PendingOperation) -> SyncResult<()> {
        let failed = |e: JsValue| SyncError::Handler {
            kind: op.kind.to_string(),
            reason: js_error_message(&e),
        };

        let result = self.callback.call1(&JsValue::NULL, &to_js(op)?).map_err(failed)?;
        if let Some(promise) = result.dyn_ref::<js_sys::Promise>() {
            JsFuture::from(promise.clone()).await.map_err(failed)?;
        }
        Ok(())
    }
}

pub fn browser_ports(auth: Rc<dyn AuthState>) -> Ports {
    Ports {
        store: Rc::new(ChromeStorage),
        bus: Rc::new(RuntimeBus),
        window: Rc::new(WindowBridge),
        connectivity: Rc::new(NavigatorConnectivity),
        auth,
        sleeper: Rc::new(GlooSleeper),
        clock: Rc::new(JsClock),
    }
}
