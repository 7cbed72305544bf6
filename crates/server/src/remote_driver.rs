//! Remote mode: the cloud client drives the assistant through the queue.
//!
//! Each queued message becomes one exchange with a stream-json connector.
//! The connector is spawned lazily on the first message and kept across
//! exchanges; it is shut down when the driver returns.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use switchyard_connector_core::{
    AssistantConnector, ConnectorError, ConnectorEvent, ConnectorFactory, SpawnOptions,
};
use switchyard_protocol::PermissionDecision;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mode_loop::{DriverOutcome, ModeDriver};
use crate::permission::{PermissionError, PrimedResponse};
use crate::queue::{QueueError, QueuedMessage};
use crate::session::{PresentationEvent, Session};
use crate::terminal::wait_for_keypress;

pub struct RemoteDriver<F: ConnectorFactory> {
    factory: F,
    session: Arc<Session>,
    watch_terminal: bool,
}

struct Live<C> {
    connector: C,
    /// Resume id the connector was spawned with, until the assistant confirms it.
    resuming: Option<String>,
}

struct RemoteState<C> {
    live: Option<Live<C>>,
    /// Parked response consumed on entry. Only the first exchange may use it,
    /// and only for a matching prompt inside its TTL.
    primed: Option<PrimedResponse>,
    in_turn: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeEnd {
    Done,
    Cancelled,
}

#[derive(Debug)]
enum Step {
    Done,
    Cancelled,
    Ended { resume_failed: Option<ConnectorError> },
}

impl<F: ConnectorFactory> RemoteDriver<F> {
    pub fn new(factory: F, session: Arc<Session>, watch_terminal: bool) -> Self {
        Self {
            factory,
            session,
            watch_terminal,
        }
    }

    async fn serve(
        &self,
        state: &mut RemoteState<F::Connector>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DriverOutcome> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(DriverOutcome::Cancelled),
                next = self.session.queue().wait_for_message() => next,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) | Err(QueueError::Closed) => {
                    return Ok(if self.session.exit_requested() {
                        DriverOutcome::Exit
                    } else {
                        DriverOutcome::Cancelled
                    });
                }
                Err(err) => return Err(err).context("waiting for queued message"),
            };

            let end = self.exchange(state, &message, cancel).await?;
            if let Some(primed) = state.primed.take() {
                debug!(
                    component = "remote_driver",
                    event = "remote_driver.permission.primed_unused",
                    decision = ?primed.response.decision,
                    "Parked permission response not used by the first exchange, dropped"
                );
            }
            if end == ExchangeEnd::Cancelled {
                return Ok(DriverOutcome::Cancelled);
            }
        }
    }

    /// Submit one message and stream until the turn ends.
    async fn exchange(
        &self,
        state: &mut RemoteState<F::Connector>,
        message: &QueuedMessage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExchangeEnd> {
        let mut allow_resume = true;
        loop {
            if state.live.is_none() {
                let resume_id = allow_resume
                    .then(|| self.session.assistant_session_id())
                    .flatten();
                match self.connect(resume_id.clone()).await {
                    Ok(live) => state.live = Some(live),
                    Err(err) if resume_id.is_some() => {
                        warn!(
                            component = "remote_driver",
                            event = "remote_driver.resume.spawn_failed",
                            error = %err,
                            "Resume failed, starting a fresh assistant session"
                        );
                        allow_resume = false;
                        continue;
                    }
                    Err(err) => {
                        warn!(
                            component = "remote_driver",
                            event = "remote_driver.spawn_failed",
                            error = %err,
                            "Failed to start assistant"
                        );
                        self.session.notify(PresentationEvent::Notice(format!(
                            "could not start assistant: {err}"
                        )));
                        return Ok(ExchangeEnd::Done);
                    }
                }
            }
            let Some(live) = state.live.as_mut() else {
                return Ok(ExchangeEnd::Done);
            };

            if let Err(err) = live
                .connector
                .send_message(&message.message, &message.attachments)
                .await
            {
                warn!(
                    component = "remote_driver",
                    event = "remote_driver.send_failed",
                    error = %err,
                    "Failed to submit message"
                );
                let resume_failed = live.resuming.is_some();
                self.discard(state).await;
                if resume_failed && allow_resume {
                    allow_resume = false;
                    continue;
                }
                return Ok(ExchangeEnd::Done);
            }
            state.in_turn = true;
            self.session.set_thinking(true);

            match self.stream(state, cancel).await? {
                Step::Done => return Ok(ExchangeEnd::Done),
                Step::Cancelled => return Ok(ExchangeEnd::Cancelled),
                Step::Ended { resume_failed } => {
                    self.discard(state).await;
                    match resume_failed {
                        Some(err) if allow_resume => {
                            info!(
                                component = "remote_driver",
                                event = "remote_driver.resume.failed",
                                error = %err,
                                "Resumed session ended before starting, retrying fresh"
                            );
                            allow_resume = false;
                            continue;
                        }
                        _ => return Ok(ExchangeEnd::Done),
                    }
                }
            }
        }
    }

    async fn connect(
        &self,
        resume_id: Option<String>,
    ) -> Result<Live<F::Connector>, ConnectorError> {
        let resuming = resume_id.clone();
        let options = SpawnOptions {
            cwd: self.session.identity().cwd.clone(),
            resume_id,
            settings_path: None,
        };
        let connector = self.factory.spawn(options).await?;
        Ok(Live {
            connector,
            resuming,
        })
    }

    /// Relay connector events until the turn is over.
    async fn stream(
        &self,
        state: &mut RemoteState<F::Connector>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Step> {
        let Some(live) = state.live.as_mut() else {
            return Ok(Step::Ended {
                resume_failed: None,
            });
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = live.connector.next_event() => Some(event),
            };
            let Some(event) = event else {
                interrupt(&mut live.connector).await;
                state.in_turn = false;
                return Ok(Step::Cancelled);
            };
            let Some(event) = event else {
                return Ok(Step::Ended {
                    resume_failed: live.resuming.take().map(ConnectorError::ResumeFailed),
                });
            };

            if event.is_terminal() {
                if let ConnectorEvent::TurnAborted { reason } = &event {
                    debug!(
                        component = "remote_driver",
                        event = "remote_driver.turn.aborted",
                        reason = %reason,
                        "Turn aborted"
                    );
                }
                state.in_turn = false;
                self.session.set_thinking(false);
                return Ok(Step::Done);
            }

            match event {
                ConnectorEvent::SessionInitialized { session_id } => {
                    live.resuming = None;
                    self.session.set_assistant_session_id(&session_id);
                }
                ConnectorEvent::TurnStarted => self.session.set_thinking(true),
                ConnectorEvent::Message(value) => {
                    // The same record lands in the transcript; a later local run skips it.
                    if let Some(uuid) = value.get("uuid").and_then(Value::as_str) {
                        self.session.transcript_cursor().mark_seen(uuid);
                    }
                    if let Some(text) = assistant_text(&value) {
                        self.session.notify(PresentationEvent::AssistantText(text));
                    }
                    self.session.forward_event(value);
                }
                ConnectorEvent::PermissionRequested {
                    request_id,
                    tool_name,
                    input,
                } => {
                    self.session.forward_event(json!({
                        "type": "permission_request",
                        "request_id": request_id,
                        "tool_name": tool_name,
                        "input": input,
                    }));

                    let primed = state.primed.take().filter(|primed| {
                        let applies = primed.applies_to(&request_id);
                        if !applies {
                            debug!(
                                component = "remote_driver",
                                event = "remote_driver.permission.primed_stale",
                                request_id = %request_id,
                                "Parked permission response does not match this prompt, dropped"
                            );
                        }
                        applies
                    });
                    let permissions = self.session.permissions();
                    let response = match primed {
                        Some(PrimedResponse { response, .. }) => {
                            debug!(
                                component = "remote_driver",
                                event = "remote_driver.permission.primed",
                                tool = %tool_name,
                                "Answering with parked permission response"
                            );
                            if response.decision == PermissionDecision::AllowAlways {
                                permissions.allow_always(&tool_name);
                            }
                            response
                        }
                        None => match permissions.request(&tool_name, cancel).await {
                            Ok(response) => response,
                            Err(PermissionError::Cancelled) => {
                                interrupt(&mut live.connector).await;
                                state.in_turn = false;
                                return Ok(Step::Cancelled);
                            }
                            Err(err) => return Err(err).context("waiting for permission decision"),
                        },
                    };

                    let message = response.message.as_deref();
                    if let Err(err) = live
                        .connector
                        .respond_permission(&request_id, response.decision, message)
                        .await
                    {
                        warn!(
                            component = "remote_driver",
                            event = "remote_driver.permission.respond_failed",
                            request_id = %request_id,
                            error = %err,
                            "Failed to deliver permission decision"
                        );
                    }
                }
                ConnectorEvent::TurnCompleted | ConnectorEvent::TurnAborted { .. } => {}
                ConnectorEvent::SessionEnded { reason } => {
                    info!(
                        component = "remote_driver",
                        event = "remote_driver.assistant.ended",
                        reason = %reason,
                        "Assistant session ended"
                    );
                    return Ok(Step::Ended {
                        resume_failed: live.resuming.take().map(ConnectorError::ResumeFailed),
                    });
                }
            }
        }
    }

    /// Drop the current connector after an end or failure.
    async fn discard(&self, state: &mut RemoteState<F::Connector>) {
        if let Some(mut live) = state.live.take() {
            live.connector.shutdown().await;
        }
        state.in_turn = false;
        self.session.set_thinking(false);
    }
}

impl<F: ConnectorFactory> ModeDriver for RemoteDriver<F> {
    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<DriverOutcome> {
        let mut state = RemoteState {
            live: None,
            primed: self.session.permissions().take_primed(),
            in_turn: false,
        };
        if state.primed.is_some() {
            info!(
                component = "remote_driver",
                event = "remote_driver.permission.parked_taken",
                "Parked permission response carried into remote mode"
            );
        }

        let reclaim_cancel = cancel.child_token();
        let mut reclaim = self
            .watch_terminal
            .then(|| tokio::spawn(wait_for_keypress(reclaim_cancel.clone())));

        let outcome = tokio::select! {
            outcome = self.serve(&mut state, &cancel) => outcome,
            pressed = join_reclaim(&mut reclaim) => Ok(if pressed {
                DriverOutcome::Switch(switchyard_protocol::Mode::Local)
            } else {
                DriverOutcome::Cancelled
            }),
        };

        reclaim_cancel.cancel();
        if let Some(handle) = reclaim.take() {
            let _ = handle.await;
        }
        if let Some(mut live) = state.live.take() {
            if state.in_turn {
                interrupt(&mut live.connector).await;
            }
            live.connector.shutdown().await;
        }
        self.session.set_thinking(false);

        debug!(
            component = "remote_driver",
            event = "remote_driver.torn_down",
            outcome = ?outcome.as_ref().ok(),
            "Remote driver torn down"
        );
        outcome
    }
}

async fn join_reclaim(handle: &mut Option<JoinHandle<bool>>) -> bool {
    match handle {
        Some(task) => {
            let pressed = task.await.unwrap_or(false);
            *handle = None;
            pressed
        }
        None => std::future::pending().await,
    }
}

async fn interrupt<C: AssistantConnector>(connector: &mut C) {
    if let Err(err) = connector.interrupt().await {
        debug!(
            component = "remote_driver",
            event = "remote_driver.interrupt_failed",
            error = %err,
            "Interrupt failed"
        );
    }
}

/// Text blocks of an assistant stream message, joined.
pub(crate) fn assistant_text(value: &Value) -> Option<String> {
    if value.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let text = value
        .pointer("/message/content")?
        .as_array()?
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    (!text.trim().is_empty()).then_some(text)
}
