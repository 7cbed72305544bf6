//! Local mode: the assistant runs interactively in this terminal.
//!
//! The driver wires hooks and the transcript synchronizer to the process,
//! relays both to the cloud, and restarts the process when it fails on its
//! own. A clean exit of the assistant ends the session.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use switchyard_connector_claude::interactive_args;
use switchyard_connector_core::SpawnOptions;
use switchyard_protocol::HookEventName;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hook_server::{HookServer, HookSignal};
use crate::hook_settings::HookSettingsFile;
use crate::mode_loop::{DriverOutcome, ModeDriver};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::session::{PresentationEvent, Session};
use crate::transcript_sync::{spawn_transcript_sync, SyncTarget, SyncTiming, TranscriptEvent};

#[derive(Debug, Clone)]
pub struct LocalDriverConfig {
    pub claude_bin: PathBuf,
    /// Binary whose `hook-forward` subcommand the hooks invoke.
    pub forwarder: PathBuf,
    pub hook_dir: PathBuf,
    pub transcript_root: PathBuf,
    pub sync_timing: SyncTiming,
    pub hook_timeout: Duration,
    pub retry: RetryPolicy,
    pub restart_delay: Duration,
    /// How long the assistant gets after SIGTERM before it is killed.
    pub terminate_grace: Duration,
}

pub struct LocalDriver {
    config: LocalDriverConfig,
    session: Arc<Session>,
}

/// Everything the running assistant is wired to.
struct Wiring {
    hook_rx: mpsc::UnboundedReceiver<HookSignal>,
    transcript_rx: mpsc::UnboundedReceiver<TranscriptEvent>,
}

impl LocalDriver {
    pub fn new(config: LocalDriverConfig, session: Arc<Session>) -> Self {
        Self { config, session }
    }

    async fn supervise(
        &self,
        settings: &HookSettingsFile,
        wiring: &mut Wiring,
        cancel: &CancellationToken,
    ) -> anyhow::Result<DriverOutcome> {
        let mut failures = 0u32;
        loop {
            let options = SpawnOptions {
                cwd: self.session.identity().cwd.clone(),
                resume_id: self.session.assistant_session_id(),
                settings_path: Some(settings.path().to_path_buf()),
            };

            let status = match self.spawn(&options) {
                Ok(mut child) => {
                    info!(
                        component = "local_driver",
                        event = "local_driver.assistant.started",
                        pid = child.id().unwrap_or(0),
                        resume = options.resume_id.as_deref().unwrap_or(""),
                        "Assistant started in terminal"
                    );
                    match self.watch(&mut child, wiring, cancel).await {
                        Some(status) => status,
                        None => {
                            terminate(&mut child, self.config.terminate_grace).await;
                            return Ok(DriverOutcome::Cancelled);
                        }
                    }
                }
                Err(err) => Err(err),
            };

            match status {
                Ok(status) if status.success() => {
                    info!(
                        component = "local_driver",
                        event = "local_driver.assistant.exited",
                        "Assistant exited cleanly"
                    );
                    return Ok(DriverOutcome::Exit);
                }
                Ok(status) => warn!(
                    component = "local_driver",
                    event = "local_driver.assistant.failed",
                    status = %status,
                    "Assistant exited with failure"
                ),
                Err(err) => warn!(
                    component = "local_driver",
                    event = "local_driver.assistant.spawn_failed",
                    error = %err,
                    "Assistant failed to start"
                ),
            }

            failures += 1;
            let teardown = self.session.exit_requested() || cancel.is_cancelled();
            match self.config.retry.decide(teardown, failures) {
                RetryDecision::Restart => {
                    self.session.notify(PresentationEvent::Notice(
                        "assistant stopped unexpectedly, restarting".to_string(),
                    ));
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(DriverOutcome::Cancelled),
                        _ = tokio::time::sleep(self.config.restart_delay) => {}
                    }
                }
                RetryDecision::Teardown => {
                    return Ok(if cancel.is_cancelled() {
                        DriverOutcome::Cancelled
                    } else {
                        DriverOutcome::Exit
                    });
                }
                RetryDecision::GiveUp => {
                    error!(
                        component = "local_driver",
                        event = "local_driver.assistant.gave_up",
                        failures = failures,
                        "Assistant keeps failing, giving up"
                    );
                    self.session.notify(PresentationEvent::Notice(format!(
                        "assistant failed {failures} times, giving up"
                    )));
                    return Ok(DriverOutcome::Exit);
                }
            }
        }
    }

    fn spawn(&self, options: &SpawnOptions) -> std::io::Result<Child> {
        Command::new(&self.config.claude_bin)
            .args(interactive_args(options))
            .current_dir(&options.cwd)
            .kill_on_drop(true)
            .spawn()
    }

    /// Relay hooks and transcript entries until the child exits (`Some`)
    /// or the run is cancelled (`None`).
    async fn watch(
        &self,
        child: &mut Child,
        wiring: &mut Wiring,
        cancel: &CancellationToken,
    ) -> Option<std::io::Result<ExitStatus>> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                Some(signal) = wiring.hook_rx.recv() => apply_hook(&self.session, signal),
                Some(event) = wiring.transcript_rx.recv() => apply_transcript(&self.session, event),
                status = child.wait() => return Some(status),
            }
        }
    }
}

impl ModeDriver for LocalDriver {
    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<DriverOutcome> {
        let hooks = HookServer::start(self.config.hook_timeout)
            .await
            .context("starting hook receiver")?;
        let hook_rx = hooks.take_signal_receiver()?;
        let settings =
            HookSettingsFile::write(&self.config.hook_dir, &self.config.forwarder, hooks.port())
                .context("writing hook settings")?;

        let sync_cancel = cancel.child_token();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
        let target = SyncTarget {
            root: self.config.transcript_root.clone(),
            cwd: self.session.identity().cwd.clone(),
            timing: self.config.sync_timing,
        };
        let sync = spawn_transcript_sync(
            target,
            self.session.transcript_cursor(),
            self.session.subscribe_assistant_session_id(),
            transcript_tx,
            sync_cancel.clone(),
        );

        let mut wiring = Wiring {
            hook_rx,
            transcript_rx,
        };
        let outcome = self.supervise(&settings, &mut wiring, &cancel).await;

        sync_cancel.cancel();
        let _ = sync.await;
        // Entries read by the final pass still belong to the cloud.
        while let Ok(event) = wiring.transcript_rx.try_recv() {
            apply_transcript(&self.session, event);
        }
        hooks.stop().await;
        drop(settings);

        debug!(
            component = "local_driver",
            event = "local_driver.torn_down",
            outcome = ?outcome.as_ref().ok(),
            "Local driver torn down"
        );
        outcome
    }
}

pub(crate) fn apply_hook(session: &Session, signal: HookSignal) {
    match signal {
        HookSignal::SessionId(id) => session.set_assistant_session_id(&id),
        HookSignal::Event(event) => {
            match event.kind {
                HookEventName::UserPromptSubmit => session.set_thinking(true),
                HookEventName::Stop | HookEventName::SessionEnd => session.set_thinking(false),
                _ => {}
            }
            session.forward_event(event.to_forwarded());
        }
    }
}

pub(crate) fn apply_transcript(session: &Session, event: TranscriptEvent) {
    match event {
        TranscriptEvent::Entry(entry) => session.forward_event(entry.raw),
        TranscriptEvent::Idle => session.set_thinking(false),
    }
}

/// SIGTERM, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if send_sigterm(child) && tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    warn!(
        component = "local_driver",
        event = "local_driver.assistant.kill",
        pid = child.id().unwrap_or(0),
        "Assistant did not stop on SIGTERM, killing"
    );
    let _ = child.kill().await;
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    match child.id() {
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
