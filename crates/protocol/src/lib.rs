//! Switchyard Protocol
//!
//! Wire types exchanged between the session orchestrator and its
//! collaborators: the cloud relay (JSON frames over a websocket), the
//! assistant's lifecycle hooks (JSON POST bodies) and the assistant's
//! append-only transcript files (JSON lines).

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

// Re-exports
pub mod hook;
pub mod inbound;
pub mod outbound;
pub mod transcript;
pub mod types;

pub use hook::{HookEvent, HookEventName};
pub use inbound::InboundMessage;
pub use outbound::OutboundMessage;
pub use transcript::{EntryKind, LineParse, TranscriptEntry};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the unix epoch, used for outbound frame timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
