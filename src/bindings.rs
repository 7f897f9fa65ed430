/// The `WordStreamSync` class exported to the extension's JS
use crate::broadcast::BroadcastReport;
use crate::chrome::{
    self, JsHandler, NavigatorConnectivity, SessionAuth, from_js, js_error_message, to_js,
};
use crate::config::SyncConfig;
use crate::context::{Ports, SyncContext, WriteOutcome};
use crate::message::BroadcastMessage;
use crate::pending::OperationKind;
use crate::queue::ReplayReport;
use crate::readiness::ReadyTarget;
use crate::transport::{Connectivity, DeliveryOutcome, MessageBus, Subscription, TabId};
use gloo_timers::callback::Interval;
use serde_json::{Map, Value, json};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::Display;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{future_to_promise, spawn_local};

fn js_error(e: impl Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

fn to_js_result(value: &Value) -> Result<JsValue, JsValue> {
    to_js(value).map_err(js_error)
}

fn read_json(value: JsValue) -> Result<Value, JsValue> {
    from_js(value).map(Option::unwrap_or_default).map_err(js_error)
}

fn outcome_json(outcome: &DeliveryOutcome) -> Value {
    match outcome {
        DeliveryOutcome::Delivered(response) => json!({ "status": "delivered", "response": response }),
        DeliveryOutcome::NoReceiver => json!({ "status": "noReceiver" }),
        DeliveryOutcome::TransportError(error) => json!({ "status": "error", "error": error }),
    }
}

fn report_json(report: &BroadcastReport) -> Value {
    json!({
        "message": report.message.to_value(),
        "storageKey": report.storage_key,
        "storage": outcome_json(&report.storage),
        "window": report.window.as_ref().map(outcome_json),
        "runtime": outcome_json(&report.runtime),
    })
}

fn replay_json(report: &ReplayReport) -> Value {
    json!({
        "replayed": report.replayed.len(),
        "requeued": report.requeued,
        "skipped": report.skipped,
    })
}

#[wasm_bindgen]
pub struct WordStreamSync {
    context: SyncContext,
    ports: Ports,
    auth: SessionAuth,
    subscriptions: RefCell<HashMap<u32, Subscription>>,
    next_subscription: Cell<u32>,
    listeners: RefCell<Vec<Subscription>>,
    poller: RefCell<Option<Interval>>,
}

#[wasm_bindgen]
impl WordStreamSync {
    /// `config_json` may be empty for defaults
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<WordStreamSync, JsValue> {
        let config = SyncConfig::from_json(config_json).map_err(js_error)?;
        let auth = SessionAuth::default();
        let ports = chrome::browser_ports(Rc::new(auth.clone()));

        Ok(WordStreamSync {
            context: SyncContext::new(config, ports.clone()),
            ports,
            auth,
            subscriptions: RefCell::new(HashMap::new()),
            next_subscription: Cell::new(1),
            listeners: RefCell::new(Vec::new()),
            poller: RefCell::new(None),
        })
    }

    #[wasm_bindgen(js_name = setAuthenticated)]
    pub fn set_authenticated(&self, signed_in: bool) {
        self.auth.set_signed_in(signed_in);
    }

    #[wasm_bindgen(js_name = registerHandler)]
    pub fn register_handler(&self, kind: &str, handler: js_sys::Function) {
        self.context
            .register_handler(OperationKind::from(kind), Rc::new(JsHandler::new(handler)));
    }

    /// Hook up message routing, tab tracking and connectivity recovery, then
    /// load and replay the persisted queue. Safe to call more than once.
    pub fn start(&self) -> js_sys::Promise {
        if self.listeners.borrow().is_empty() {
            self.install_listeners();
        }

        let context = self.context.clone();
        future_to_promise(async move {
            let report = context.start().await;
            to_js_result(&replay_json(&report))
        })
    }

    /// Resolves `{ status: "written" | "queued", ... }`
    pub fn write(&self, kind: &str, data: JsValue) -> Result<js_sys::Promise, JsValue> {
        let kind = OperationKind::from(kind);
        let data = read_json(data)?;
        let context = self.context.clone();

        Ok(future_to_promise(async move {
            let result = match context.write(kind, data).await {
                WriteOutcome::Written(report) => {
                    json!({ "status": "written", "broadcast": report_json(&report) })
                }
                WriteOutcome::Queued { operation, reason } => json!({
                    "status": "queued",
                    "operation": operation,
                    "reason": reason.to_string(),
                }),
            };
            to_js_result(&result)
        }))
    }

    pub fn enqueue(&self, kind: &str, data: JsValue) -> Result<js_sys::Promise, JsValue> {
        let kind = OperationKind::from(kind);
        let data = read_json(data)?;
        let context = self.context.clone();

        Ok(future_to_promise(async move {
            let operation = context.enqueue(kind, data).await;
            to_js(&operation).map_err(js_error)
        }))
    }

    pub fn replay(&self) -> js_sys::Promise {
        let context = self.context.clone();
        future_to_promise(async move {
            let report = context.replay().await;
            to_js_result(&replay_json(&report))
        })
    }

    /// Throws when `message` has no string `action`
    pub fn broadcast(&self, message: JsValue) -> Result<js_sys::Promise, JsValue> {
        let message = BroadcastMessage::from_value(&read_json(message)?)
            .ok_or_else(|| js_error("Broadcast message needs a string action"))?;
        let context = self.context.clone();

        Ok(future_to_promise(async move {
            let report = context.broadcast(message).await;
            to_js_result(&report_json(&report))
        }))
    }

    /// Returns an id for `unsubscribe`. With `deduplicate`, a message seen on
    /// several paths is delivered once.
    pub fn subscribe(&self, callback: js_sys::Function, deduplicate: Option<bool>) -> u32 {
        let forward = Rc::new(move |message: &BroadcastMessage| {
            let value = match to_js(&message.to_value()) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("Could not hand {} to subscriber: {}", message.action, e);
                    return;
                }
            };
            if let Err(e) = callback.call1(&JsValue::NULL, &value) {
                log::error!("Subscriber threw on {}: {}", message.action, js_error_message(&e));
            }
        });

        let subscription = if deduplicate.unwrap_or(false) {
            self.context.subscribe_deduplicated(forward)
        } else {
            self.context.subscribe(forward)
        };

        let id = self.next_subscription.get();
        self.next_subscription.set(id.wrapping_add(1));
        self.subscriptions.borrow_mut().insert(id, subscription);
        id
    }

    pub fn unsubscribe(&self, id: u32) -> bool {
        match self.subscriptions.borrow_mut().remove(&id) {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// True when `message` was a readiness handshake
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, message: JsValue, sender_tab: Option<i32>) -> bool {
        match from_js(message) {
            Ok(Some(message)) => self.context.handle_message(&message, sender_tab),
            _ => false,
        }
    }

    #[wasm_bindgen(js_name = sendToTab)]
    pub fn send_to_tab(
        &self,
        tab_id: i32,
        message: JsValue,
        max_attempts: Option<u32>,
    ) -> Result<js_sys::Promise, JsValue> {
        self.send_gated(ReadyTarget::Tab(tab_id), message, max_attempts)
    }

    #[wasm_bindgen(js_name = sendToPopup)]
    pub fn send_to_popup(
        &self,
        message: JsValue,
        max_attempts: Option<u32>,
    ) -> Result<js_sys::Promise, JsValue> {
        self.send_gated(ReadyTarget::Popup, message, max_attempts)
    }

    /// `tabs` defaults to every tab that has completed its handshake
    #[wasm_bindgen(js_name = broadcastAuthState)]
    pub fn broadcast_auth_state(
        &self,
        fields: JsValue,
        tabs: JsValue,
    ) -> Result<js_sys::Promise, JsValue> {
        let fields: Map<String, Value> = match read_json(fields)? {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            _ => return Err(js_error("Auth state fields must be an object")),
        };
        let tabs: Vec<TabId> = match from_js(tabs).map_err(js_error)? {
            Some(tabs) => serde_json::from_value(tabs).map_err(js_error)?,
            None => Vec::new(),
        };
        let context = self.context.clone();

        Ok(future_to_promise(async move {
            let outcomes = context.send_auth_state(&tabs, fields).await;
            let result: Vec<Value> = outcomes
                .iter()
                .map(|(tab, outcome)| json!({ "tabId": tab, "outcome": outcome_json(outcome) }))
                .collect();
            to_js_result(&Value::Array(result))
        }))
    }

    #[wasm_bindgen(js_name = pendingCount)]
    pub fn pending_count(&self) -> usize {
        self.context.queue().len()
    }

    #[wasm_bindgen(js_name = isTabReady)]
    pub fn is_tab_ready(&self, tab_id: i32) -> bool {
        self.context.readiness().is_ready(ReadyTarget::Tab(tab_id))
    }
}

impl WordStreamSync {
    fn send_gated(
        &self,
        target: ReadyTarget,
        message: JsValue,
        max_attempts: Option<u32>,
    ) -> Result<js_sys::Promise, JsValue> {
        let message = read_json(message)?;
        let max_attempts = max_attempts.unwrap_or(self.context.config().readiness.max_attempts);
        let context = self.context.clone();

        Ok(future_to_promise(async move {
            let outcome = context
                .send_with_readiness_check(target, &message, max_attempts)
                .await;
            to_js_result(&outcome_json(&outcome))
        }))
    }

    fn install_listeners(&self) {
        let mut listeners = self.listeners.borrow_mut();

        let context = self.context.clone();
        listeners.push(MessageBus::on_message(
            self.ports.bus.as_ref(),
            Rc::new(move |message: &Value, sender_tab: Option<TabId>| {
                context.handle_message(message, sender_tab)
            }),
        ));

        let context = self.context.clone();
        listeners.push(chrome::on_tab_removed(move |tab| context.tab_closed(tab)));

        match web_sys::window() {
            Some(window) => watch_connectivity_events(&window, &self.context),
            None => {
                let interval = poll_connectivity(self.context.clone());
                self.poller.replace(Some(interval));
            }
        }
    }
}

/// Replay as soon as the page reports it is back online
fn watch_connectivity_events(window: &web_sys::Window, context: &SyncContext) {
    for (event, online) in [("online", true), ("offline", false)] {
        let context = context.clone();
        let handler = Closure::wrap(Box::new(move |_: web_sys::Event| {
            let context = context.clone();
            spawn_local(async move {
                context.on_connectivity_changed(online).await;
            });
        }) as Box<dyn Fn(web_sys::Event)>);

        if let Err(e) = window.add_event_listener_with_callback(event, handler.as_ref().unchecked_ref()) {
            log::error!("Failed to watch {} events: {}", event, js_error_message(&e));
        }
        handler.forget();
    }
}

/// Workers get no connectivity events, so check on a timer instead
fn poll_connectivity(context: SyncContext) -> Interval {
    let interval_ms = context.config().replay_interval_ms;
    Interval::new(interval_ms, move || {
        let context = context.clone();
        spawn_local(async move {
            let online = NavigatorConnectivity.is_online();
            context.on_connectivity_changed(online).await;
        });
    })
}
