//! Switchyard
//!
//! Runs one coding-assistant session that can be driven either from this
//! terminal or from a remote client over the cloud channel.

mod config;
mod hook_forward;
mod hook_server;
mod hook_settings;
mod local_driver;
mod logging;
mod mode_loop;
mod observer;
mod permission;
mod queue;
mod remote_driver;
mod retry;
mod session;
mod terminal;
mod transcript_sync;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use console::{style, StyledObject, Term};
use switchyard_connector_claude::ClaudeFactory;
use switchyard_protocol::Mode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Cli, Command, Config};
use crate::local_driver::LocalDriver;
use crate::mode_loop::ModeLoop;
use crate::remote_driver::RemoteDriver;
use crate::session::{PresentationEvent, Session};
use crate::transport::Transport;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    match cli.command {
        // Runs inside the assistant's hook; stays silent and never fails.
        Command::HookForward { port } => runtime.block_on(hook_forward::run(port)),
        Command::Run(args) => {
            let config = Config::resolve(args, dirs::home_dir().as_deref())?;
            let logging = logging::init_logging(&config.log_dir).context("initializing logging")?;
            info!(
                component = "main",
                event = "main.starting",
                run_id = %logging.run_id,
                session_id = %config.session_id,
                cwd = %config.cwd.display(),
                start_mode = %config.start_mode,
                "Starting switchyard session"
            );
            let result = runtime.block_on(run(config));
            if let Err(err) = &result {
                tracing::error!(
                    component = "main",
                    event = "main.failed",
                    error = %format!("{err:#}"),
                    "Session failed"
                );
            }
            drop(logging);
            result
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let transport = Transport::start(config.transport()).context("starting cloud transport")?;
    let session = Arc::new(Session::new(
        config.identity(),
        config.start_mode,
        config.permission.clone(),
        transport.sender(),
    ));
    if let Some(id) = &config.resume {
        session.set_assistant_session_id(id);
    }

    let background = CancellationToken::new();
    let tasks = vec![
        spawn_inbound_pump(&transport, session.clone())?,
        spawn_close_watch(&transport, session.clone())?,
        spawn_presenter(&session)?,
        tokio::spawn(watch_signals(session.clone(), background.clone())),
    ];

    let forwarder = std::env::current_exe().context("locating own executable")?;
    let mut local = LocalDriver::new(config.local_driver(forwarder), session.clone());
    let mut remote = RemoteDriver::new(
        ClaudeFactory::new(config.claude_bin.clone()),
        session.clone(),
        true,
    );
    let result = ModeLoop::new(session.clone())?
        .run(config.start_mode, &mut local, &mut remote)
        .await;

    background.cancel();
    for task in tasks {
        task.abort();
        let _ = task.await;
    }
    transport.close().await;
    info!(
        component = "main",
        event = "main.finished",
        session_id = %config.session_id,
        "Session finished"
    );
    result
}

fn spawn_inbound_pump(
    transport: &Transport,
    session: Arc<Session>,
) -> anyhow::Result<JoinHandle<()>> {
    let mut inbound = transport
        .take_inbound_receiver()
        .context("subscribing to inbound messages")?;
    Ok(tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            session.handle_inbound(msg);
        }
    }))
}

/// A transport that gave up reconnecting ends the session.
fn spawn_close_watch(
    transport: &Transport,
    session: Arc<Session>,
) -> anyhow::Result<JoinHandle<()>> {
    let mut closed = transport
        .take_closed_receiver()
        .context("subscribing to transport close")?;
    Ok(tokio::spawn(async move {
        if let Some(closed) = closed.recv().await {
            warn!(
                component = "main",
                event = "main.transport_lost",
                attempts = closed.attempts,
                "Cloud connection lost for good, exiting"
            );
            session.notify(PresentationEvent::Notice(format!(
                "lost the cloud connection after {} attempts",
                closed.attempts
            )));
            session.request_exit();
        }
    }))
}

fn spawn_presenter(session: &Session) -> anyhow::Result<JoinHandle<()>> {
    let mut events = session
        .take_presentation_receiver()
        .context("subscribing to presentation events")?;
    Ok(tokio::spawn(async move {
        let term = Term::stderr();
        while let Some(event) = events.recv().await {
            let _ = term.write_line(&render(&event));
        }
    }))
}

fn render(event: &PresentationEvent) -> String {
    let tag = paint("switchyard").cyan().bold();
    match event {
        PresentationEvent::ModeChanged(Mode::Local) => {
            format!("{tag} {}", paint("local mode, the assistant is yours").green())
        }
        PresentationEvent::ModeChanged(Mode::Remote) => format!(
            "{tag} {} {}",
            paint("remote mode").magenta(),
            paint("(press any key to take back control)").dim()
        ),
        PresentationEvent::AssistantText(text) => format!("{} {text}", paint("assistant").dim()),
        PresentationEvent::Notice(text) => format!("{tag} {}", paint(text).yellow()),
    }
}

fn paint<D>(value: D) -> StyledObject<D> {
    style(value).for_stderr()
}

/// SIGTERM and SIGHUP always end the session. Ctrl-C only does in remote
/// mode; in local mode the assistant owns the terminal and handles it.
#[cfg(unix)]
async fn watch_signals(session: Arc<Session>, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = (signal(SignalKind::terminate()), signal(SignalKind::hangup()));
    let (mut term, mut hup) = match handlers {
        (Ok(term), Ok(hup)) => (term, hup),
        (Err(err), _) | (_, Err(err)) => {
            warn!(
                component = "main",
                event = "main.signals.unavailable",
                error = %err,
                "Failed to install signal handlers"
            );
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = term.recv() => session.request_exit(),
            _ = hup.recv() => session.request_exit(),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() && session.mode() == Mode::Remote {
                    session.request_exit();
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn watch_signals(session: Arc<Session>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() && session.mode() == Mode::Remote {
                    session.request_exit();
                }
            }
        }
    }
}
