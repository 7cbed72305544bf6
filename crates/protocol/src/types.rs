//! Core types shared across the protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which driver currently owns the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// The operator drives the assistant from the local terminal.
    Local,
    /// The cloud client drives the assistant through the message queue.
    Remote,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Remote => "remote",
        }
    }

    /// The mode a bare switch request moves to.
    pub fn other(&self) -> Mode {
        match self {
            Mode::Local => Mode::Remote,
            Mode::Remote => Mode::Local,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "remote" => Ok(Mode::Remote),
            other => Err(format!("unknown mode '{other}' (expected local or remote)")),
        }
    }
}

/// Operator decision for a tool permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionDecision {
    AllowOnce,
    Deny,
    AllowAlways,
}

impl PermissionDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

/// A permission decision as delivered by the cloud client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub decision: PermissionDecision,
    /// Free-form reason shown to the assistant on deny.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResponse {
    pub fn new(decision: PermissionDecision) -> Self {
        Self {
            request_id: None,
            decision,
            message: None,
        }
    }
}

/// Binary attachment as carried in JSON frames (base64 payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttachment {
    #[serde(alias = "mimeType", alias = "media_type")]
    pub mime_type: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
