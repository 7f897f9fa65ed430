/// Data structures for queued writes
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of write held in the offline queue.
///
/// Kinds this build doesn't know about are kept verbatim in `Other` so they
/// survive a load/persist cycle and are re-queued instead of dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    SaveWord,
    SaveNote,
    SaveChat,
    DeleteWord,
    DeleteNote,
    UpdateChat,
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::SaveWord => "saveWord",
            OperationKind::SaveNote => "saveNote",
            OperationKind::SaveChat => "saveChat",
            OperationKind::DeleteWord => "deleteWord",
            OperationKind::DeleteNote => "deleteNote",
            OperationKind::UpdateChat => "updateChat",
            OperationKind::Other(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, OperationKind::Other(_))
    }

    /// Event announced to the other contexts once a write of this kind lands
    pub fn broadcast_action(&self) -> Option<&'static str> {
        match self {
            OperationKind::SaveWord => Some("WORD_ADDED"),
            OperationKind::SaveNote => Some("NOTE_ADDED"),
            OperationKind::SaveChat => Some("CHAT_SAVED"),
            OperationKind::DeleteWord => Some("WORD_DELETED"),
            OperationKind::DeleteNote => Some("NOTE_DELETED"),
            OperationKind::UpdateChat => Some("CHAT_UPDATED"),
            OperationKind::Other(_) => None,
        }
    }
}

impl From<String> for OperationKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "saveWord" => OperationKind::SaveWord,
            "saveNote" => OperationKind::SaveNote,
            "saveChat" => OperationKind::SaveChat,
            "deleteWord" => OperationKind::DeleteWord,
            "deleteNote" => OperationKind::DeleteNote,
            "updateChat" => OperationKind::UpdateChat,
            _ => OperationKind::Other(s),
        }
    }
}

impl From<&str> for OperationKind {
    fn from(s: &str) -> Self {
        OperationKind::from(s.to_string())
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write that could not be persisted directly and waits for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, data: Value, timestamp: u64) -> PendingOperation {
        PendingOperation {
            kind,
            data,
            timestamp,
        }
    }

    /// Stable id of the entity the payload targets, when it carries one
    pub fn entity_id(&self) -> Option<&str> {
        ["id", "wordId", "noteId", "chatId"]
            .iter()
            .find_map(|field| self.data.get(*field).and_then(Value::as_str))
    }
}
