//! Local/remote mode state machine.
//!
//! Exactly one driver runs at a time. A transition cancels the running
//! driver and waits for it to return before the next mode is announced and
//! entered, so the previous assistant process and watchers are gone first.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use switchyard_protocol::Mode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionSignal};

/// How a driver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    /// The session is over.
    Exit,
    /// The driver itself asks for another mode.
    Switch(Mode),
    /// The run was cancelled by the loop.
    Cancelled,
}

/// One side of the loop. `run` must return promptly once `cancel` fires,
/// after its own cleanup is complete.
pub trait ModeDriver: Send {
    fn run(
        &mut self,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<DriverOutcome>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopTrigger {
    Signal(SessionSignal),
    MessageQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Stay,
    Enter(Mode),
    Exit,
}

/// Pure transition table.
pub fn transition_for(mode: Mode, trigger: &LoopTrigger) -> Transition {
    match (mode, trigger) {
        (_, LoopTrigger::Signal(SessionSignal::Exit)) => Transition::Exit,
        (Mode::Local, LoopTrigger::MessageQueued)
        | (Mode::Local, LoopTrigger::Signal(SessionSignal::PermissionParked)) => {
            Transition::Enter(Mode::Remote)
        }
        (mode, LoopTrigger::Signal(SessionSignal::SwitchRequested(target))) => {
            let target = target.unwrap_or_else(|| mode.other());
            if target == mode {
                Transition::Stay
            } else {
                Transition::Enter(target)
            }
        }
        (Mode::Remote, LoopTrigger::MessageQueued)
        | (Mode::Remote, LoopTrigger::Signal(SessionSignal::PermissionParked)) => Transition::Stay,
    }
}

pub struct ModeLoop {
    session: Arc<Session>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    pushes: mpsc::UnboundedReceiver<usize>,
}

impl ModeLoop {
    pub fn new(session: Arc<Session>) -> anyhow::Result<Self> {
        let signals = session
            .take_signal_receiver()
            .context("subscribing to session signals")?;
        let pushes = session
            .queue()
            .take_push_receiver()
            .context("subscribing to queue pushes")?;
        Ok(Self {
            session,
            signals,
            pushes,
        })
    }

    /// Alternate drivers until one of them, or a signal, ends the session.
    pub async fn run<L, R>(
        mut self,
        initial: Mode,
        local: &mut L,
        remote: &mut R,
    ) -> anyhow::Result<()>
    where
        L: ModeDriver,
        R: ModeDriver,
    {
        let mut mode = initial;
        let result = loop {
            if self.session.exit_requested() {
                break Ok(());
            }
            self.session.enter_mode(mode);

            let next = match mode {
                Mode::Local => self.drive(mode, local).await,
                Mode::Remote => self.drive(mode, remote).await,
            };
            match next {
                Ok(Transition::Stay) => {}
                Ok(Transition::Enter(target)) => mode = target,
                Ok(Transition::Exit) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.session.queue().close();
        info!(
            component = "mode_loop",
            event = "mode_loop.finished",
            "Mode loop finished"
        );
        result
    }

    /// Whether a trigger still describes the current state. Push and park
    /// notifications can outlive the message or response they announced.
    fn is_current(&self, trigger: &LoopTrigger) -> bool {
        match trigger {
            LoopTrigger::MessageQueued => !self.session.queue().is_empty(),
            LoopTrigger::Signal(SessionSignal::PermissionParked) => {
                self.session.permissions().has_parked()
            }
            LoopTrigger::Signal(_) => true,
        }
    }

    async fn drive<D: ModeDriver>(
        &mut self,
        mode: Mode,
        driver: &mut D,
    ) -> anyhow::Result<Transition> {
        let cancel = CancellationToken::new();
        let run = driver.run(cancel.clone());
        tokio::pin!(run);

        let mut requested: Option<Transition> = None;
        let mut signals_open = true;
        let mut pushes_open = true;

        let outcome = loop {
            let trigger = tokio::select! {
                outcome = &mut run => break outcome,
                signal = self.signals.recv(), if signals_open => match signal {
                    Some(signal) => LoopTrigger::Signal(signal),
                    None => {
                        signals_open = false;
                        continue;
                    }
                },
                push = self.pushes.recv(), if pushes_open => match push {
                    Some(_) => LoopTrigger::MessageQueued,
                    None => {
                        pushes_open = false;
                        continue;
                    }
                },
            };

            if !self.is_current(&trigger) {
                continue;
            }
            let transition = transition_for(mode, &trigger);
            debug!(
                component = "mode_loop",
                event = "mode_loop.trigger",
                mode = %mode,
                trigger = ?trigger,
                transition = ?transition,
                "Mode loop trigger"
            );
            match (transition, requested) {
                (Transition::Stay, _) => continue,
                (_, Some(Transition::Exit)) => continue,
                (transition, _) => requested = Some(transition),
            }

            if !cancel.is_cancelled() {
                cancel.cancel();
                if mode == Mode::Remote {
                    self.session.queue().reset();
                }
            }
        };

        let transition = match (outcome, requested) {
            (_, Some(Transition::Exit)) => Transition::Exit,
            (Ok(DriverOutcome::Exit), _) => Transition::Exit,
            (Ok(DriverOutcome::Switch(target)), _) if target != mode => {
                if mode == Mode::Remote {
                    self.session.queue().reset();
                }
                Transition::Enter(target)
            }
            (Ok(_), Some(requested)) => requested,
            (Ok(_), None) => Transition::Stay,
            (Err(err), Some(requested)) => {
                warn!(
                    component = "mode_loop",
                    event = "mode_loop.driver_failed",
                    mode = %mode,
                    error = %err,
                    "Driver failed during teardown"
                );
                requested
            }
            (Err(err), None) => return Err(err.context(format!("{mode} driver failed"))),
        };

        info!(
            component = "mode_loop",
            event = "mode_loop.transition",
            from = %mode,
            transition = ?transition,
            "Driver finished"
        );
        Ok(transition)
    }
}
