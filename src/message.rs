/// Wire format of state-change events and readiness handshakes
use crate::transport::TabId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const CONTENT_SCRIPT_READY: &str = "CONTENT_SCRIPT_READY";
pub const POPUP_READY: &str = "POPUP_READY";
pub const BACKGROUND_READY: &str = "BACKGROUND_READY";
pub const AUTH_STATE_CHANGED: &str = "AUTH_STATE_CHANGED";

/// Producers send either an ISO string or epoch-ms; both are accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Iso(String),
    Millis(f64),
}

/// A state-change event fanned out to every context.
///
/// Unknown fields are kept in `fields` so consumers can forward messages
/// they don't understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub action: String,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl BroadcastMessage {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            timestamp: None,
            message_id: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Read a message off the wire; anything without a string `action` is ignored
    pub fn from_value(value: &Value) -> Option<Self> {
        value.get("action")?.as_str()?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// An envelope field of the wrong type reads as absent instead of losing the event
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// A context announcing that it has finished initialising
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    ContentScript(TabId),
    Popup,
    Background,
}

impl Handshake {
    /// Content scripts identify themselves by the sender tab; an explicit
    /// `tabId` field is accepted when the message was relayed.
    pub fn parse(message: &Value, sender_tab: Option<TabId>) -> Option<Self> {
        match message.get("action")?.as_str()? {
            CONTENT_SCRIPT_READY => {
                let explicit = message
                    .get("tabId")
                    .and_then(Value::as_i64)
                    .and_then(|id| TabId::try_from(id).ok());
                sender_tab.or(explicit).map(Handshake::ContentScript)
            }
            POPUP_READY => Some(Handshake::Popup),
            BACKGROUND_READY => Some(Handshake::Background),
            _ => None,
        }
    }

    /// True for any readiness action, whether or not it names a tab
    pub fn is_handshake(message: &Value) -> bool {
        matches!(
            message.get("action").and_then(Value::as_str),
            Some(CONTENT_SCRIPT_READY | POPUP_READY | BACKGROUND_READY)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extra_fields_are_flattened() {
        let message = BroadcastMessage::new("NOTE_DELETED").with_field("noteId", "n1");

        let value = message.to_value();

        assert_eq!(value, json!({"action": "NOTE_DELETED", "noteId": "n1"}));
    }

    #[test]
    fn test_from_value_accepts_both_timestamp_forms() {
        let iso = BroadcastMessage::from_value(
            &json!({"action": "WORD_ADDED", "timestamp": "2024-01-01T00:00:00.000Z"}),
        )
        .unwrap();
        let millis =
            BroadcastMessage::from_value(&json!({"action": "WORD_ADDED", "timestamp": 1700000000000u64}))
                .unwrap();

        assert_eq!(
            iso.timestamp,
            Some(Timestamp::Iso("2024-01-01T00:00:00.000Z".to_string()))
        );
        assert_eq!(millis.timestamp, Some(Timestamp::Millis(1_700_000_000_000.0)));
    }

    #[test]
    fn test_from_value_tolerates_unknown_fields() {
        let message = BroadcastMessage::from_value(&json!({
            "action": "SETTINGS_UPDATED",
            "messageId": "abc",
            "settings": {"targetLanguage": "he"},
            "version": 7
        }))
        .unwrap();

        assert_eq!(message.message_id.as_deref(), Some("abc"));
        assert_eq!(message.field("version"), Some(&json!(7)));
    }

    #[test]
    fn test_from_value_drops_mistyped_envelope_fields() {
        let message = BroadcastMessage::from_value(&json!({
            "action": "WORD_ADDED",
            "messageId": 5,
            "timestamp": true,
            "wordId": "w1"
        }))
        .unwrap();

        assert_eq!(message.message_id, None);
        assert_eq!(message.timestamp, None);
        assert_eq!(message.field("wordId"), Some(&json!("w1")));
    }

    #[test]
    fn test_is_handshake() {
        assert!(Handshake::is_handshake(&json!({"action": CONTENT_SCRIPT_READY})));
        assert!(Handshake::is_handshake(&json!({"action": BACKGROUND_READY})));
        assert!(!Handshake::is_handshake(&json!({"action": "WORD_ADDED"})));
        assert!(!Handshake::is_handshake(&json!({})));
    }

    #[test]
    fn test_from_value_requires_action() {
        assert!(BroadcastMessage::from_value(&json!({"noteId": "n1"})).is_none());
        assert!(BroadcastMessage::from_value(&json!({"action": 4})).is_none());
        assert!(BroadcastMessage::from_value(&json!("WORD_ADDED")).is_none());
    }

    #[test]
    fn test_handshake_parse() {
        assert_eq!(
            Handshake::parse(&json!({"action": CONTENT_SCRIPT_READY}), Some(12)),
            Some(Handshake::ContentScript(12))
        );
        assert_eq!(
            Handshake::parse(&json!({"action": CONTENT_SCRIPT_READY, "tabId": 4}), None),
            Some(Handshake::ContentScript(4))
        );
        assert_eq!(Handshake::parse(&json!({"action": CONTENT_SCRIPT_READY}), None), None);
        assert_eq!(Handshake::parse(&json!({"action": POPUP_READY}), None), Some(Handshake::Popup));
        assert_eq!(Handshake::parse(&json!({"action": "WORD_ADDED"}), Some(1)), None);
    }
}
