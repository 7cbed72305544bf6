//! Claude CLI connector
//!
//! Spawns the `claude` CLI as a subprocess and drives it over stdin/stdout
//! using the NDJSON stream-json protocol. Permission prompts arrive as
//! `can_use_tool` control requests and are answered with control responses.
//!
//! Also owns the argument layout for the interactive (terminal) launch so
//! both ways of starting the assistant stay in one place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use switchyard_connector_core::{
    AssistantConnector, Attachment, ConnectorError, ConnectorEvent, ConnectorFactory,
    SpawnOptions,
};
use switchyard_protocol::PermissionDecision;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Stdin messages (Rust → CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        session_id: String,
        message: UserMessagePayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    ControlResponse {
        response: ControlResponsePayload,
    },
}

#[derive(Debug, Serialize)]
struct UserMessagePayload {
    role: &'static str,
    content: Vec<UserContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    Initialize {},
    Interrupt,
}

#[derive(Debug, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponsePayload {
    Success { request_id: String, response: Value },
}

// ---------------------------------------------------------------------------
// Stdout translation (CLI → Rust)
// ---------------------------------------------------------------------------

/// Stores the `input` and `tool_use_id` from a `can_use_tool` control request
/// so they can be echoed back in the approval response.
#[derive(Debug, Clone, PartialEq)]
struct PendingApproval {
    input: Value,
    tool_use_id: Option<String>,
}

#[derive(Debug, PartialEq)]
enum SideEffect {
    ResolveControl { request_id: String, response: Value },
    StoreApproval {
        request_id: String,
        approval: PendingApproval,
    },
    CancelApproval { request_id: String },
}

#[derive(Debug, Default)]
struct StreamState {
    in_turn: bool,
    initialized: bool,
}

#[derive(Debug, Default)]
struct Translation {
    events: Vec<ConnectorEvent>,
    effects: Vec<SideEffect>,
}

/// Translate one stdout message by its `type` field.
fn translate(raw: &Value, state: &mut StreamState) -> Translation {
    let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
    let mut out = Translation::default();

    if !state.in_turn && msg_type == "assistant" {
        state.in_turn = true;
        out.events.push(ConnectorEvent::TurnStarted);
    }

    match msg_type {
        "system" => {
            if raw.get("subtype").and_then(Value::as_str) == Some("init") {
                if let Some(sid) = raw.get("session_id").and_then(Value::as_str) {
                    state.initialized = true;
                    out.events.push(ConnectorEvent::SessionInitialized {
                        session_id: sid.to_string(),
                    });
                }
            }
            out.events.push(ConnectorEvent::Message(raw.clone()));
        }

        "assistant" => out.events.push(ConnectorEvent::Message(raw.clone())),

        "user" => {
            let replay = raw
                .get("isReplay")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !replay {
                out.events.push(ConnectorEvent::Message(raw.clone()));
            }
        }

        "result" => {
            state.in_turn = false;
            out.events.push(ConnectorEvent::Message(raw.clone()));

            let subtype = raw.get("subtype").and_then(Value::as_str).unwrap_or("");
            let is_error = raw
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if is_error || subtype.starts_with("error") {
                let reason = if subtype.is_empty() {
                    "error".to_string()
                } else {
                    subtype.to_string()
                };
                out.events.push(ConnectorEvent::TurnAborted { reason });
            } else {
                out.events.push(ConnectorEvent::TurnCompleted);
            }
        }

        "control_request" => translate_control_request(raw, &mut out),

        "control_cancel_request" => {
            if let Some(req_id) = raw.get("request_id").and_then(Value::as_str) {
                out.effects.push(SideEffect::CancelApproval {
                    request_id: req_id.to_string(),
                });
            }
        }

        "control_response" => {
            if let Some(response) = raw.get("response") {
                let request_id = response
                    .get("request_id")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !request_id.is_empty() {
                    out.effects.push(SideEffect::ResolveControl {
                        request_id: request_id.to_string(),
                        response: response.clone(),
                    });
                }
            }
        }

        "stream_event" | "keep_alive" | "auth_status" | "tool_progress" => {}

        _ => {
            debug!(
                component = "claude_connector",
                event = "claude.stdout.unknown_type",
                msg_type = %msg_type,
                "Unknown stdout message type"
            );
        }
    }

    out
}

fn translate_control_request(raw: &Value, out: &mut Translation) {
    let Some(request) = raw.get("request") else {
        return;
    };
    let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");
    if subtype != "can_use_tool" {
        debug!(
            component = "claude_connector",
            event = "claude.control_request.unhandled",
            subtype = %subtype,
            "Unhandled CLI control request subtype"
        );
        return;
    }

    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let tool_name = request
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = request
        .get("tool_use_id")
        .and_then(Value::as_str)
        .map(String::from);

    out.effects.push(SideEffect::StoreApproval {
        request_id: request_id.clone(),
        approval: PendingApproval {
            input: input.clone(),
            tool_use_id,
        },
    });
    out.events.push(ConnectorEvent::PermissionRequested {
        request_id,
        tool_name,
        input,
    });
}

/// Build the `can_use_tool` answer payload.
fn permission_payload(
    decision: PermissionDecision,
    message: Option<&str>,
    pending: Option<&PendingApproval>,
) -> Value {
    let mut payload = if decision.is_allow() {
        json!({
            "behavior": "allow",
            "updatedInput": pending.map(|p| p.input.clone()).unwrap_or_else(|| json!({})),
        })
    } else {
        json!({
            "behavior": "deny",
            "message": message.unwrap_or("User denied this operation"),
            "interrupt": false,
        })
    };
    if let Some(id) = pending.and_then(|p| p.tool_use_id.as_ref()) {
        payload["toolUseID"] = json!(id);
    }
    payload
}

// ---------------------------------------------------------------------------
// ClaudeConnector
// ---------------------------------------------------------------------------

type PendingControls = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;
type PendingApprovals = Arc<Mutex<HashMap<String, PendingApproval>>>;

pub struct ClaudeConnector {
    stdin_tx: Option<mpsc::Sender<String>>,
    child: Child,
    event_rx: mpsc::Receiver<ConnectorEvent>,
    pending_controls: PendingControls,
    pending_approvals: PendingApprovals,
}

impl ClaudeConnector {
    /// Spawn a new `claude` CLI subprocess in stream-json mode.
    pub async fn spawn(claude_bin: &Path, options: &SpawnOptions) -> Result<Self, ConnectorError> {
        let args = stream_args(options);

        info!(
            component = "claude_connector",
            event = "claude.spawn",
            cwd = %options.cwd.display(),
            claude_bin = %claude_bin.display(),
            resume_id = ?options.resume_id,
            "Spawning Claude CLI in stream-json mode"
        );

        let mut child = tokio::process::Command::new(claude_bin)
            .args(&args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("CLAUDE_CODE_ENTRYPOINT", "sdk-ts")
            .spawn()
            .map_err(|e| ConnectorError::Spawn(format!("Failed to spawn claude CLI: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::Provider("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Provider("No stdout on child".into()))?;

        let (event_tx, event_rx) = mpsc::channel::<ConnectorEvent>(256);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let pending_controls: PendingControls = Arc::new(Mutex::new(HashMap::new()));
        let pending_approvals: PendingApprovals = Arc::new(Mutex::new(HashMap::new()));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "claude_connector",
                        event = "claude.stderr",
                        line = %line,
                        "Claude CLI stderr"
                    );
                }
            });
        }

        tokio::spawn(stdin_writer(stdin, stdin_rx));
        tokio::spawn(event_loop(
            stdout,
            event_tx,
            options.resume_id.is_some(),
            pending_controls.clone(),
            pending_approvals.clone(),
        ));

        let connector = Self {
            stdin_tx: Some(stdin_tx),
            child,
            event_rx,
            pending_controls,
            pending_approvals,
        };

        if let Err(e) = connector
            .send_control_request(ControlRequestBody::Initialize {})
            .await
        {
            debug!(
                component = "claude_connector",
                event = "claude.initialize.failed",
                error = %e,
                "Initialize control request did not complete"
            );
        }

        Ok(connector)
    }

    /// Send a control request and wait for the response.
    async fn send_control_request(
        &self,
        body: ControlRequestBody,
    ) -> Result<Value, ConnectorError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_controls.lock().await.insert(id.clone(), tx);

        self.write_stdin_message(&StdinMessage::ControlRequest {
            request_id: id.clone(),
            request: body,
        })
        .await?;

        match tokio::time::timeout(CONTROL_TIMEOUT, rx).await {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(_)) => {
                self.pending_controls.lock().await.remove(&id);
                Err(ConnectorError::ChannelClosed)
            }
            Err(_) => {
                self.pending_controls.lock().await.remove(&id);
                Err(ConnectorError::Provider(format!(
                    "Control request timed out after {}s",
                    CONTROL_TIMEOUT.as_secs()
                )))
            }
        }
    }

    /// Serialize and send a message to the stdin channel.
    async fn write_stdin_message(&self, msg: &StdinMessage) -> Result<(), ConnectorError> {
        let json = serde_json::to_string(msg)?;
        debug!(
            component = "claude_connector",
            event = "claude.stdin.write",
            payload_len = json.len(),
            "Writing to CLI stdin"
        );
        let Some(tx) = self.stdin_tx.as_ref() else {
            return Err(ConnectorError::ChannelClosed);
        };
        tx.send(json).await.map_err(|_| ConnectorError::ChannelClosed)
    }
}

impl AssistantConnector for ClaudeConnector {
    async fn send_message(
        &mut self,
        content: &str,
        attachments: &[Attachment],
    ) -> Result<(), ConnectorError> {
        let mut blocks = vec![UserContentBlock::Text {
            text: content.to_string(),
        }];
        blocks.extend(attachments.iter().map(|a| UserContentBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: a.mime_type.clone(),
                data: a.to_base64(),
            },
        }));

        let msg = StdinMessage::User {
            session_id: String::new(),
            message: UserMessagePayload {
                role: "user",
                content: blocks,
            },
            parent_tool_use_id: None,
        };
        self.write_stdin_message(&msg).await
    }

    async fn respond_permission(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        message: Option<&str>,
    ) -> Result<(), ConnectorError> {
        let pending = self.pending_approvals.lock().await.remove(request_id);
        let msg = StdinMessage::ControlResponse {
            response: ControlResponsePayload::Success {
                request_id: request_id.to_string(),
                response: permission_payload(decision, message, pending.as_ref()),
            },
        };
        self.write_stdin_message(&msg).await
    }

    async fn interrupt(&mut self) -> Result<(), ConnectorError> {
        self.send_control_request(ControlRequestBody::Interrupt)
            .await
            .map(|_| ())
    }

    async fn next_event(&mut self) -> Option<ConnectorEvent> {
        self.event_rx.recv().await
    }

    async fn shutdown(&mut self) {
        // Closing stdin asks the CLI to finish; kill if it lingers.
        self.stdin_tx.take();
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    component = "claude_connector",
                    event = "claude.shutdown.kill",
                    "Claude CLI did not exit after stdin closed, killing"
                );
                let _ = self.child.kill().await;
            }
        }
    }
}

/// Dedicated stdin writer task: reads from the channel and writes to child stdin.
async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.write_error",
                error = %e,
                "Failed to write to CLI stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "claude_connector",
                event = "claude.stdin.flush_error",
                error = %e,
                "Failed to flush CLI stdin"
            );
            break;
        }
    }
    debug!(
        component = "claude_connector",
        event = "claude.stdin.closed",
        "Stdin writer task ended"
    );
}

/// Read stdout line-by-line, parse JSON, translate to ConnectorEvent.
async fn event_loop(
    stdout: tokio::process::ChildStdout,
    event_tx: mpsc::Sender<ConnectorEvent>,
    resuming: bool,
    pending_controls: PendingControls,
    pending_approvals: PendingApprovals,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut state = StreamState::default();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let raw: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            component = "claude_connector",
                            event = "claude.stdout.parse_error",
                            error = %e,
                            line_preview = %line.chars().take(200).collect::<String>(),
                            "Failed to parse stdout JSON"
                        );
                        continue;
                    }
                };

                let translation = translate(&raw, &mut state);
                for effect in translation.effects {
                    match effect {
                        SideEffect::ResolveControl {
                            request_id,
                            response,
                        } => {
                            if let Some(tx) = pending_controls.lock().await.remove(&request_id) {
                                let _ = tx.send(response);
                            }
                        }
                        SideEffect::StoreApproval {
                            request_id,
                            approval,
                        } => {
                            pending_approvals.lock().await.insert(request_id, approval);
                        }
                        SideEffect::CancelApproval { request_id } => {
                            pending_approvals.lock().await.remove(&request_id);
                        }
                    }
                }
                for ev in translation.events {
                    if event_tx.send(ev).await.is_err() {
                        info!(
                            component = "claude_connector",
                            event = "claude.event_loop.channel_closed",
                            "Event channel closed, stopping reader"
                        );
                        return;
                    }
                }
            }
            Ok(None) => break "cli_exited".to_string(),
            Err(e) => {
                error!(
                    component = "claude_connector",
                    event = "claude.stdout.read_error",
                    error = %e,
                    "Error reading CLI stdout"
                );
                break format!("read_error: {}", e);
            }
        }
    };

    // Unblock anyone waiting on a control response from a dead process.
    pending_controls.lock().await.clear();

    let reason = if resuming && !state.initialized {
        "resume_failed".to_string()
    } else {
        reason
    };
    info!(
        component = "claude_connector",
        event = "claude.stdout.eof",
        reason = %reason,
        "Claude CLI output ended"
    );
    let _ = event_tx.send(ConnectorEvent::SessionEnded { reason }).await;
}

// ---------------------------------------------------------------------------
// Launch arguments
// ---------------------------------------------------------------------------

fn stream_args(options: &SpawnOptions) -> Vec<String> {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
        "--permission-prompt-tool",
        "stdio",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    append_common_args(&mut args, options);
    args
}

/// Arguments for an interactive launch that owns the terminal.
pub fn interactive_args(options: &SpawnOptions) -> Vec<String> {
    let mut args = Vec::new();
    append_common_args(&mut args, options);
    args
}

fn append_common_args(args: &mut Vec<String>, options: &SpawnOptions) {
    if let Some(sid) = &options.resume_id {
        args.push("--resume".to_string());
        args.push(sid.clone());
    }
    if let Some(path) = &options.settings_path {
        args.push("--settings".to_string());
        args.push(path.to_string_lossy().to_string());
    }
}

/// Resolve the claude binary path.
/// 1. Explicit path (flag or CLAUDE_BIN)
/// 2. <home>/.claude/local/claude
/// 3. Search PATH via `which`
pub fn resolve_claude_binary(
    explicit: Option<&Path>,
    home: Option<&Path>,
) -> Result<PathBuf, ConnectorError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        warn!(
            component = "claude_connector",
            event = "claude.binary.explicit_not_found",
            path = %path.display(),
            "Configured claude path does not exist, trying fallbacks"
        );
    }

    if let Some(home) = home {
        let local_path = home.join(".claude/local/claude");
        if local_path.exists() {
            return Ok(local_path);
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg("claude").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && Path::new(&path).exists() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    Err(ConnectorError::Spawn(
        "Claude CLI binary not found. Install Claude Code or set CLAUDE_BIN.".to_string(),
    ))
}

/// Launches [`ClaudeConnector`]s from a fixed binary.
#[derive(Debug, Clone)]
pub struct ClaudeFactory {
    claude_bin: PathBuf,
}

impl ClaudeFactory {
    pub fn new(claude_bin: PathBuf) -> Self {
        Self { claude_bin }
    }
}

impl ConnectorFactory for ClaudeFactory {
    type Connector = ClaudeConnector;

    async fn spawn(&self, options: SpawnOptions) -> Result<ClaudeConnector, ConnectorError> {
        ClaudeConnector::spawn(&self.claude_bin, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_message_discloses_session_id() {
        let mut state = StreamState::default();
        let raw = json!({
            "type": "system",
            "subtype": "init",
            "session_id": "sess-1",
            "model": "opus"
        });
        let out = translate(&raw, &mut state);

        assert!(state.initialized);
        assert_eq!(
            out.events[0],
            ConnectorEvent::SessionInitialized {
                session_id: "sess-1".to_string()
            }
        );
        assert!(matches!(out.events[1], ConnectorEvent::Message(_)));
    }

    #[test]
    fn first_assistant_message_starts_turn_and_result_ends_it() {
        let mut state = StreamState::default();
        let assistant = json!({"type": "assistant", "message": {"content": []}});

        let first = translate(&assistant, &mut state);
        assert_eq!(first.events[0], ConnectorEvent::TurnStarted);
        let second = translate(&assistant, &mut state);
        assert_eq!(second.events.len(), 1);

        let result = translate(&json!({"type": "result", "subtype": "success"}), &mut state);
        assert!(!state.in_turn);
        assert_eq!(result.events.last(), Some(&ConnectorEvent::TurnCompleted));
    }

    #[test]
    fn error_result_aborts_turn() {
        let mut state = StreamState::default();
        let out = translate(
            &json!({"type": "result", "subtype": "error_during_execution", "is_error": true}),
            &mut state,
        );
        assert_eq!(
            out.events.last(),
            Some(&ConnectorEvent::TurnAborted {
                reason: "error_during_execution".to_string()
            })
        );
    }

    #[test]
    fn can_use_tool_becomes_permission_request() {
        let mut state = StreamState::default();
        let raw = json!({
            "type": "control_request",
            "request_id": "req-7",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "ls"},
                "tool_use_id": "toolu_1"
            }
        });
        let out = translate(&raw, &mut state);

        assert_eq!(
            out.events,
            vec![ConnectorEvent::PermissionRequested {
                request_id: "req-7".to_string(),
                tool_name: "Bash".to_string(),
                input: json!({"command": "ls"}),
            }]
        );
        assert_eq!(
            out.effects,
            vec![SideEffect::StoreApproval {
                request_id: "req-7".to_string(),
                approval: PendingApproval {
                    input: json!({"command": "ls"}),
                    tool_use_id: Some("toolu_1".to_string()),
                },
            }]
        );
    }

    #[test]
    fn replayed_user_messages_are_dropped() {
        let mut state = StreamState::default();
        let out = translate(&json!({"type": "user", "isReplay": true}), &mut state);
        assert!(out.events.is_empty());
    }

    #[test]
    fn allow_payload_echoes_original_input() {
        let pending = PendingApproval {
            input: json!({"command": "ls"}),
            tool_use_id: Some("toolu_1".to_string()),
        };
        let allow = permission_payload(PermissionDecision::AllowOnce, None, Some(&pending));
        assert_eq!(allow["behavior"], "allow");
        assert_eq!(allow["updatedInput"]["command"], "ls");
        assert_eq!(allow["toolUseID"], "toolu_1");

        let deny = permission_payload(PermissionDecision::Deny, Some("not now"), None);
        assert_eq!(deny["behavior"], "deny");
        assert_eq!(deny["message"], "not now");
    }

    #[test]
    fn launch_args_carry_resume_and_settings() {
        let options = SpawnOptions {
            cwd: PathBuf::from("/tmp"),
            resume_id: Some("abc".to_string()),
            settings_path: Some(PathBuf::from("/tmp/hooks.json")),
        };
        assert_eq!(
            interactive_args(&options),
            vec!["--resume", "abc", "--settings", "/tmp/hooks.json"]
        );
        let stream = stream_args(&options);
        assert!(stream.starts_with(&["--output-format".to_string(), "stream-json".to_string()]));
        assert!(stream.ends_with(&["--settings".to_string(), "/tmp/hooks.json".to_string()]));
    }

    #[test]
    fn image_attachments_serialize_as_base64_blocks() {
        let attachment = Attachment {
            mime_type: "image/png".to_string(),
            data: bytes::Bytes::from_static(b"png"),
            name: None,
        };
        let block = UserContentBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: attachment.mime_type.clone(),
                data: attachment.to_base64(),
            },
        };
        let json = serde_json::to_value(block).expect("serialize");
        assert_eq!(json["type"], "image");
        assert_eq!(json["source"]["type"], "base64");
        assert_eq!(json["source"]["media_type"], "image/png");
    }
}
