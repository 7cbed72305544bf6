//! Assistant lifecycle hook payloads.
//!
//! The assistant runs a configured command at lifecycle points and pipes a
//! JSON object to it; the forwarder relays that object verbatim as the body
//! of `POST /hook`. Only the session id and the event name are interpreted,
//! the rest travels through as an opaque payload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Hook events the receiver registers for and forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEventName {
    SessionStart,
    UserPromptSubmit,
    PostToolUse,
    PermissionRequest,
    Stop,
    SessionEnd,
}

impl HookEventName {
    pub const ALL: [HookEventName; 6] = [
        HookEventName::SessionStart,
        HookEventName::UserPromptSubmit,
        HookEventName::PostToolUse,
        HookEventName::PermissionRequest,
        HookEventName::Stop,
        HookEventName::SessionEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::PostToolUse => "PostToolUse",
            Self::PermissionRequest => "PermissionRequest",
            Self::Stop => "Stop",
            Self::SessionEnd => "SessionEnd",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// A normalized hook notification.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub session_id: Option<String>,
    pub kind: HookEventName,
    pub payload: Value,
}

impl HookEvent {
    /// Parse a hook POST body.
    ///
    /// Malformed or non-object bodies are treated as an empty object, which
    /// carries no event name and therefore yields `None`.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let payload = serde_json::from_slice::<Value>(body)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));

        let kind = string_field(&payload, &["hook_event_name", "hookEventName"])
            .and_then(HookEventName::parse)?;
        let session_id = string_field(&payload, &["session_id", "sessionId"])
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        Some(Self {
            session_id,
            kind,
            payload,
        })
    }

    /// The shape relayed to the cloud inside a `claude_event` frame.
    pub fn to_forwarded(&self) -> Value {
        json!({
            "type": "hook",
            "hook_event_name": self.kind.as_str(),
            "session_id": self.session_id,
            "payload": self.payload,
        })
    }
}

fn string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
}
