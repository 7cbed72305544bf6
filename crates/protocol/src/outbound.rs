//! Session → cloud messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_millis;
use crate::types::Mode;

/// Frames sent to the cloud collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A transcript entry, stream message or hook event from the assistant.
    ClaudeEvent { event: Value, timestamp: u64 },
    Thinking { thinking: bool, timestamp: u64 },
    ModeChange { mode: Mode, timestamp: u64 },
    Ping,
    Pong,
}

impl OutboundMessage {
    pub fn claude_event(event: Value) -> Self {
        Self::ClaudeEvent {
            event,
            timestamp: now_millis(),
        }
    }

    pub fn thinking(thinking: bool) -> Self {
        Self::Thinking {
            thinking,
            timestamp: now_millis(),
        }
    }

    pub fn mode_change(mode: Mode) -> Self {
        Self::ModeChange {
            mode,
            timestamp: now_millis(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClaudeEvent { .. } => "claude_event",
            Self::Thinking { .. } => "thinking",
            Self::ModeChange { .. } => "mode_change",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}
