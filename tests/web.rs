#![cfg(target_arch = "wasm32")]

use serde_json::json;
use wasm_bindgen::JsCast;
use wasm_bindgen_test::*;
use wordstream_sync::chrome::{GlooSleeper, JsClock, SessionAuth, from_js, to_js};
use wordstream_sync::transport::{AuthState, Clock, Sleeper};

wasm_bindgen_test_configure!(run_in_browser);

#[wasm_bindgen_test]
fn test_js_clock_matches_iso_format() {
    let clock = JsClock;
    let iso = clock.now_iso();

    assert!(clock.now_ms() > 1_600_000_000_000);
    assert_eq!(iso.len(), "2024-01-01T00:00:00.000Z".len());
    assert!(iso.ends_with('Z'));
}

#[wasm_bindgen_test]
async fn test_gloo_sleeper_waits() {
    let clock = JsClock;
    let before = clock.now_ms();

    GlooSleeper.sleep(20).await;

    assert!(clock.now_ms() >= before + 15);
}

#[wasm_bindgen_test]
fn test_values_cross_the_boundary_as_plain_objects() {
    let value = json!({"action": "WORD_ADDED", "word": {"id": "w1", "tags": ["a"]}});

    let js = to_js(&value).unwrap();
    assert!(js.is_object());
    assert!(!js.is_instance_of::<js_sys::Map>());
    assert_eq!(from_js(js).unwrap(), Some(value));
}

#[wasm_bindgen_test]
fn test_undefined_reads_as_absent() {
    assert_eq!(from_js(wasm_bindgen::JsValue::UNDEFINED).unwrap(), None);
    assert_eq!(from_js(wasm_bindgen::JsValue::NULL).unwrap(), None);
}

#[wasm_bindgen_test]
fn test_session_auth_follows_sign_in() {
    let auth = SessionAuth::default();
    let shared = auth.clone();
    assert!(!shared.is_authenticated());

    auth.set_signed_in(true);
    assert!(shared.is_authenticated());

    auth.set_signed_in(false);
    assert!(!shared.is_authenticated());
}
