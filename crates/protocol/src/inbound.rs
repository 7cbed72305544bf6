//! Cloud → session messages

use serde::{Deserialize, Serialize};

use crate::types::{Mode, PermissionDecision, PermissionResponse, WireAttachment};

/// Frames received from the cloud collaborator.
///
/// Anything with an unrecognized `type` tag deserializes to `Unknown` and is
/// swallowed by the transport together with keep-alive frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    UserInput {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<WireAttachment>,
    },
    PermissionResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        decision: PermissionDecision,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Switch {
        /// Target mode. Absent means "the other mode".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<Mode>,
    },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Whether this frame is handed to the message observer.
    pub fn is_forwarded(&self) -> bool {
        matches!(
            self,
            Self::UserInput { .. } | Self::PermissionResponse { .. } | Self::Switch { .. }
        )
    }

    /// Extract the permission response carried by a `permission_response` frame.
    pub fn permission_response(&self) -> Option<PermissionResponse> {
        match self {
            Self::PermissionResponse {
                request_id,
                decision,
                message,
            } => Some(PermissionResponse {
                request_id: request_id.clone(),
                decision: *decision,
                message: message.clone(),
            }),
            _ => None,
        }
    }
}
