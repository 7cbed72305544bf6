//! Switchyard Connector Core
//!
//! Event, error and trait types shared by assistant connectors. The remote
//! driver is written against [`ConnectorFactory`] / [`AssistantConnector`]
//! so the subprocess-backed connector can be swapped for a scripted one.

use std::future::Future;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;
use switchyard_protocol::{PermissionDecision, WireAttachment};
use thiserror::Error;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Resume of session {0} failed")]
    ResumeFailed(String),
}

/// Events emitted by connectors
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    /// The assistant disclosed its session id (fresh start or resume).
    SessionInitialized { session_id: String },

    /// First assistant output of a turn.
    TurnStarted,

    /// A raw stream message, relayed to the cloud as-is.
    Message(Value),

    /// The assistant wants to run a tool and is waiting for a decision.
    PermissionRequested {
        request_id: String,
        tool_name: String,
        input: Value,
    },

    /// Turn completed
    TurnCompleted,

    /// Turn aborted
    TurnAborted { reason: String },

    /// The assistant process is gone.
    SessionEnded { reason: String },
}

impl ConnectorEvent {
    /// Terminal response events end an exchange; the driver goes back to the queue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnCompleted | Self::TurnAborted { .. })
    }
}

/// A decoded binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub data: Bytes,
    pub name: Option<String>,
}

impl Attachment {
    pub fn from_wire(wire: &WireAttachment) -> Result<Self, base64::DecodeError> {
        let data = STANDARD.decode(wire.data.as_bytes())?;
        Ok(Self {
            mime_type: wire.mime_type.clone(),
            data: Bytes::from(data),
            name: wire.name.clone(),
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

/// How to launch the assistant.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: PathBuf,
    /// Assistant session to resume; `None` starts fresh.
    pub resume_id: Option<String>,
    /// Generated hook settings file, when hooks should reach this process.
    pub settings_path: Option<PathBuf>,
}

/// A running, message-driven assistant.
pub trait AssistantConnector: Send {
    /// Submit a user message, starting or continuing a turn.
    fn send_message(
        &mut self,
        content: &str,
        attachments: &[Attachment],
    ) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Answer a pending `PermissionRequested`.
    fn respond_permission(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        message: Option<&str>,
    ) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Abort the in-flight turn.
    fn interrupt(&mut self) -> impl Future<Output = Result<(), ConnectorError>> + Send;

    /// Next event; `None` once the event stream is exhausted.
    fn next_event(&mut self) -> impl Future<Output = Option<ConnectorEvent>> + Send;

    /// Terminate the assistant and wait for it to go away.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Launches assistants.
pub trait ConnectorFactory: Send + Sync {
    type Connector: AssistantConnector;

    fn spawn(
        &self,
        options: SpawnOptions,
    ) -> impl Future<Output = Result<Self::Connector, ConnectorError>> + Send;
}
