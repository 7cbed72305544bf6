//! The orchestrated session.
//!
//! One `Session` is shared (behind an `Arc`) by the transport inbound pump,
//! the hook receiver, the drivers and the mode loop. Every mutation is a short
//! non-async critical section, so one call applies one whole transition.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use switchyard_connector_core::Attachment;
use switchyard_protocol::{InboundMessage, Mode, PermissionResponse, WireAttachment};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::observer::{EventChannel, ObserverError};
use crate::permission::{Delivery, PermissionPolicy, PermissionRelay};
use crate::queue::{MessageQueue, QueueError};
use crate::transcript_sync::TranscriptCursor;
use crate::transport::TransportSender;

#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub cwd: PathBuf,
}

/// Requests that steer the mode loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Switch request from the cloud; `None` means "the other mode".
    SwitchRequested(Option<Mode>),
    /// A permission response was parked with nobody waiting for it.
    PermissionParked,
    /// Tear everything down.
    Exit,
}

/// Operator-facing notices, rendered on stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationEvent {
    ModeChanged(Mode),
    AssistantText(String),
    Notice(String),
}

pub struct Session {
    identity: SessionIdentity,
    mode: Mutex<Mode>,
    assistant_session_id: watch::Sender<Option<String>>,
    thinking: AtomicBool,
    exit_requested: AtomicBool,
    permissions: PermissionRelay,
    queue: MessageQueue,
    transcript: Arc<TranscriptCursor>,
    transport: TransportSender,
    signals: EventChannel<SessionSignal>,
    presentation: EventChannel<PresentationEvent>,
}

impl Session {
    pub fn new(
        identity: SessionIdentity,
        initial_mode: Mode,
        policy: PermissionPolicy,
        transport: TransportSender,
    ) -> Self {
        let (assistant_session_id, _) = watch::channel(None);
        Self {
            identity,
            mode: Mutex::new(initial_mode),
            assistant_session_id,
            thinking: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            permissions: PermissionRelay::new(policy),
            queue: MessageQueue::new(),
            transcript: Arc::new(TranscriptCursor::new()),
            transport,
            signals: EventChannel::new("session_signals"),
            presentation: EventChannel::new("presentation"),
        }
    }

    fn mode_slot(&self) -> MutexGuard<'_, Mode> {
        self.mode
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn mode(&self) -> Mode {
        *self.mode_slot()
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn permissions(&self) -> &PermissionRelay {
        &self.permissions
    }

    /// Ids already relayed to the cloud, shared by every local run.
    pub fn transcript_cursor(&self) -> Arc<TranscriptCursor> {
        self.transcript.clone()
    }

    pub fn transport(&self) -> &TransportSender {
        &self.transport
    }

    /// Route one inbound cloud message.
    pub fn handle_inbound(&self, msg: InboundMessage) {
        match msg {
            InboundMessage::UserInput {
                message,
                attachments,
            } => {
                let attachments = decode_attachments(&attachments);
                match self.queue.push(message, attachments) {
                    Ok(()) => {}
                    Err(QueueError::Closed) => debug!(
                        component = "session",
                        event = "session.user_input.dropped",
                        "Queue closed, dropping user input"
                    ),
                    Err(err) => warn!(
                        component = "session",
                        event = "session.user_input.rejected",
                        error = %err,
                        "User input rejected"
                    ),
                }
            }
            InboundMessage::PermissionResponse {
                request_id,
                decision,
                message,
            } => {
                let response = PermissionResponse {
                    request_id,
                    decision,
                    message,
                };
                info!(
                    component = "session",
                    event = "session.permission.response",
                    decision = ?response.decision,
                    request_id = response.request_id.as_deref().unwrap_or(""),
                    "Permission response received"
                );
                if self.permissions.respond(response) == Delivery::Parked {
                    self.signals.emit(SessionSignal::PermissionParked);
                }
            }
            InboundMessage::Switch { mode } => {
                info!(
                    component = "session",
                    event = "session.switch.requested",
                    target = mode.map(|m| m.as_str()).unwrap_or("toggle"),
                    "Cloud requested a mode switch"
                );
                self.signals.emit(SessionSignal::SwitchRequested(mode));
            }
            InboundMessage::Ping | InboundMessage::Pong | InboundMessage::Unknown => {}
        }
    }

    /// Record the new mode and announce it to the cloud and the operator.
    pub fn enter_mode(&self, mode: Mode) {
        *self.mode_slot() = mode;
        info!(
            component = "session",
            event = "session.mode.entered",
            mode = %mode,
            "Entered mode"
        );
        self.transport.send_mode_change(mode);
        self.presentation.emit(PresentationEvent::ModeChanged(mode));
    }

    pub fn forward_event(&self, event: Value) {
        self.transport.forward_event(event);
    }

    /// Send the thinking flag, but only when it actually changes.
    pub fn set_thinking(&self, thinking: bool) {
        if self.thinking.swap(thinking, Ordering::AcqRel) != thinking {
            self.transport.send_thinking(thinking);
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking.load(Ordering::Acquire)
    }

    /// Record the assistant's session id. Observers only wake on a change.
    pub fn set_assistant_session_id(&self, id: &str) {
        let changed = self.assistant_session_id.send_if_modified(|current| {
            if current.as_deref() == Some(id) {
                return false;
            }
            *current = Some(id.to_string());
            true
        });
        if changed {
            info!(
                component = "session",
                event = "session.assistant_id.discovered",
                assistant_session_id = %id,
                "Assistant session id discovered"
            );
        }
    }

    pub fn assistant_session_id(&self) -> Option<String> {
        self.assistant_session_id.borrow().clone()
    }

    /// Any number of observers may follow session-id discovery.
    pub fn subscribe_assistant_session_id(&self) -> watch::Receiver<Option<String>> {
        self.assistant_session_id.subscribe()
    }

    pub fn request_exit(&self) {
        if !self.exit_requested.swap(true, Ordering::AcqRel) {
            info!(
                component = "session",
                event = "session.exit.requested",
                "Exit requested"
            );
        }
        self.signals.emit(SessionSignal::Exit);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn notify(&self, event: PresentationEvent) {
        self.presentation.emit(event);
    }

    pub fn take_signal_receiver(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<SessionSignal>, ObserverError> {
        self.signals.take_receiver()
    }

    pub fn take_presentation_receiver(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<PresentationEvent>, ObserverError> {
        self.presentation.take_receiver()
    }
}

fn decode_attachments(wire: &[WireAttachment]) -> Vec<Attachment> {
    wire.iter()
        .filter_map(|attachment| match Attachment::from_wire(attachment) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(
                    component = "session",
                    event = "session.attachment.invalid",
                    mime_type = %attachment.mime_type,
                    error = %err,
                    "Dropping undecodable attachment"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_protocol::{OutboundMessage, PermissionDecision};
    use tokio_util::sync::CancellationToken;

    pub(crate) fn test_session(
        mode: Mode,
    ) -> (Session, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (transport, outbound) = TransportSender::new(true);
        let identity = SessionIdentity {
            session_id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            device_id: "dev-1".to_string(),
            cwd: PathBuf::from("/work/project"),
        };
        (
            Session::new(identity, mode, PermissionPolicy::default(), transport),
            outbound,
        )
    }

    fn permission_frame(decision: PermissionDecision) -> InboundMessage {
        InboundMessage::PermissionResponse {
            request_id: Some("req-9".to_string()),
            decision,
            message: None,
        }
    }

    #[tokio::test]
    async fn user_input_is_queued_with_decoded_attachments() {
        let (session, _out) = test_session(Mode::Local);
        session.handle_inbound(InboundMessage::UserInput {
            message: "look at this".to_string(),
            attachments: vec![
                WireAttachment {
                    mime_type: "image/png".to_string(),
                    data: "aGVsbG8=".to_string(),
                    name: Some("shot.png".to_string()),
                },
                WireAttachment {
                    mime_type: "image/png".to_string(),
                    data: "%%%".to_string(),
                    name: None,
                },
            ],
        });

        let msg = session
            .queue()
            .wait_for_message()
            .await
            .expect("wait")
            .expect("message");
        assert_eq!(msg.message, "look at this");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].data.as_ref(), b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_permission_response_is_parked_and_signalled() {
        let (session, _out) = test_session(Mode::Local);
        let mut signals = session.take_signal_receiver().expect("signals");

        session.handle_inbound(permission_frame(PermissionDecision::AllowOnce));
        assert_eq!(signals.recv().await, Some(SessionSignal::PermissionParked));

        // Entering remote within the TTL consumes it exactly once.
        tokio::time::advance(Duration::from_secs(5)).await;
        let parked = session.permissions().take_parked().expect("parked");
        assert_eq!(parked.decision, PermissionDecision::AllowOnce);
        assert_eq!(parked.request_id.as_deref(), Some("req-9"));
        assert!(session.permissions().take_parked().is_none());
    }

    #[tokio::test]
    async fn awaited_permission_response_is_delivered_without_signal() {
        let (session, _out) = test_session(Mode::Remote);
        let mut signals = session.take_signal_receiver().expect("signals");
        let cancel = CancellationToken::new();

        let wait = session.permissions().begin_wait().expect("wait");
        session.handle_inbound(permission_frame(PermissionDecision::Deny));
        let response = wait.wait(&cancel).await.expect("response");
        assert_eq!(response.decision, PermissionDecision::Deny);
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn switch_requests_become_signals() {
        let (session, _out) = test_session(Mode::Remote);
        let mut signals = session.take_signal_receiver().expect("signals");

        session.handle_inbound(InboundMessage::Switch {
            mode: Some(Mode::Local),
        });
        session.handle_inbound(InboundMessage::Switch { mode: None });
        session.handle_inbound(InboundMessage::Ping);

        assert_eq!(
            signals.recv().await,
            Some(SessionSignal::SwitchRequested(Some(Mode::Local)))
        );
        assert_eq!(
            signals.recv().await,
            Some(SessionSignal::SwitchRequested(None))
        );
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn thinking_is_sent_only_on_change() {
        let (session, mut out) = test_session(Mode::Remote);
        session.set_thinking(true);
        session.set_thinking(true);
        session.set_thinking(false);
        session.set_thinking(false);

        assert!(matches!(
            out.try_recv(),
            Ok(OutboundMessage::Thinking { thinking: true, .. })
        ));
        assert!(matches!(
            out.try_recv(),
            Ok(OutboundMessage::Thinking { thinking: false, .. })
        ));
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn entering_a_mode_announces_it_everywhere() {
        let (session, mut out) = test_session(Mode::Local);
        let mut presentation = session.take_presentation_receiver().expect("presentation");

        session.enter_mode(Mode::Remote);
        assert_eq!(session.mode(), Mode::Remote);
        assert!(matches!(
            out.try_recv(),
            Ok(OutboundMessage::ModeChange {
                mode: Mode::Remote,
                ..
            })
        ));
        assert_eq!(
            presentation.recv().await,
            Some(PresentationEvent::ModeChanged(Mode::Remote))
        );
    }

    #[tokio::test]
    async fn session_id_observers_wake_only_on_change() {
        let (session, _out) = test_session(Mode::Local);
        let mut first = session.subscribe_assistant_session_id();
        let mut second = session.subscribe_assistant_session_id();

        session.set_assistant_session_id("a1");
        assert!(first.has_changed().expect("open"));
        assert_eq!(first.borrow_and_update().as_deref(), Some("a1"));
        assert_eq!(second.borrow_and_update().as_deref(), Some("a1"));

        session.set_assistant_session_id("a1");
        assert!(!first.has_changed().expect("open"));

        session.set_assistant_session_id("b2");
        assert!(second.has_changed().expect("open"));
        assert_eq!(session.assistant_session_id().as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn exit_sets_flag_and_signals() {
        let (session, _out) = test_session(Mode::Local);
        let mut signals = session.take_signal_receiver().expect("signals");
        assert!(!session.exit_requested());

        session.request_exit();
        assert!(session.exit_requested());
        assert_eq!(signals.recv().await, Some(SessionSignal::Exit));
    }
}
