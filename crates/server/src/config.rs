//! Command line and resolved configuration.
//!
//! Every filesystem root is resolved here once and handed to constructors.
//! Priority for each root: flag > env > default under the home directory.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use switchyard_connector_claude::resolve_claude_binary;
use switchyard_protocol::Mode;
use tracing::info;

use crate::hook_server::DEFAULT_READ_TIMEOUT;
use crate::local_driver::LocalDriverConfig;
use crate::permission::PermissionPolicy;
use crate::retry::RetryPolicy;
use crate::session::SessionIdentity;
use crate::transcript_sync::SyncTiming;
use crate::transport::{ReconnectPolicy, TransportConfig};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const RESTART_DELAY: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DEVICE_ID_FILE: &str = "device-id";

#[derive(Debug, Parser)]
#[command(name = "switchyard", version)]
#[command(about = "Hand one coding-assistant session between this terminal and a remote client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start an orchestrated session in the current directory
    Run(RunArgs),
    /// Relay a hook payload on stdin to the local receiver (invoked by the assistant)
    #[command(hide = true)]
    HookForward {
        #[arg(long)]
        port: u16,
    },
}

#[derive(Debug, Clone, Args)]
#[command(rename_all = "kebab-case")]
pub struct RunArgs {
    /// Data directory (logs, hook settings, device id)
    #[arg(long, env = "SWITCHYARD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Where the assistant writes per-project transcripts
    #[arg(long, env = "SWITCHYARD_TRANSCRIPT_ROOT")]
    pub transcript_root: Option<PathBuf>,

    /// Cloud websocket endpoint
    #[arg(long, env = "SWITCHYARD_SERVER_URL")]
    pub server_url: String,

    #[arg(long, env = "SWITCHYARD_TOKEN", hide_env_values = true)]
    pub token: String,

    #[arg(long, env = "SWITCHYARD_USER_ID")]
    pub user_id: String,

    /// Defaults to an id persisted in the data directory
    #[arg(long, env = "SWITCHYARD_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Defaults to a fresh id
    #[arg(long, env = "SWITCHYARD_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "CLAUDE_BIN")]
    pub claude_bin: Option<PathBuf>,

    /// Assistant session to resume
    #[arg(long)]
    pub resume: Option<String>,

    #[arg(long, default_value = "local")]
    pub start_mode: Mode,

    /// Give up after this many consecutive local crashes (default: never)
    #[arg(long)]
    pub max_local_restarts: Option<u32>,

    /// Working directory for the assistant (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub hook_dir: PathBuf,
    pub transcript_root: PathBuf,
    pub cwd: PathBuf,

    pub server_url: String,
    pub token: String,
    pub user_id: String,
    pub device_id: String,
    pub session_id: String,

    pub claude_bin: PathBuf,
    pub resume: Option<String>,
    pub start_mode: Mode,

    pub permission: PermissionPolicy,
    pub reconnect: ReconnectPolicy,
    pub keepalive: Duration,
    pub sync_timing: SyncTiming,
    pub hook_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn resolve(args: RunArgs, home: Option<&Path>) -> anyhow::Result<Self> {
        let data_dir = match args.data_dir {
            Some(dir) => dir,
            None => home
                .map(|home| home.join(".switchyard"))
                .context("no home directory; pass --data-dir")?,
        };
        let transcript_root = match args.transcript_root {
            Some(dir) => dir,
            None => home
                .map(|home| home.join(".claude").join("projects"))
                .context("no home directory; pass --transcript-root")?,
        };
        let cwd = match args.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir().context("reading current directory")?,
        };

        let device_id = match args.device_id {
            Some(id) => id,
            None => load_or_create_device_id(&data_dir).context("loading device id")?,
        };
        let claude_bin = resolve_claude_binary(args.claude_bin.as_deref(), home)
            .context("resolving assistant binary")?;

        Ok(Self {
            log_dir: data_dir.join("logs"),
            hook_dir: data_dir.join("tmp").join("hooks"),
            data_dir,
            transcript_root,
            cwd,
            server_url: args.server_url,
            token: args.token,
            user_id: args.user_id,
            device_id,
            session_id: args.session_id.unwrap_or_else(switchyard_protocol::new_id),
            claude_bin,
            resume: args.resume,
            start_mode: args.start_mode,
            permission: PermissionPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            keepalive: KEEPALIVE_INTERVAL,
            sync_timing: SyncTiming::default(),
            hook_timeout: DEFAULT_READ_TIMEOUT,
            retry: RetryPolicy::from_limit(args.max_local_restarts),
        })
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            cwd: self.cwd.clone(),
        }
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.server_url.clone(),
            token: self.token.clone(),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            keepalive: self.keepalive,
            reconnect: self.reconnect.clone(),
        }
    }

    /// `forwarder` is the binary the generated hooks call back into.
    pub fn local_driver(&self, forwarder: PathBuf) -> LocalDriverConfig {
        LocalDriverConfig {
            claude_bin: self.claude_bin.clone(),
            forwarder,
            hook_dir: self.hook_dir.clone(),
            transcript_root: self.transcript_root.clone(),
            sync_timing: self.sync_timing,
            hook_timeout: self.hook_timeout,
            retry: self.retry,
            restart_delay: RESTART_DELAY,
            terminate_grace: TERMINATE_GRACE,
        }
    }
}

/// Stable per-machine id, created on first run.
pub fn load_or_create_device_id(data_dir: &Path) -> io::Result<String> {
    let path = data_dir.join(DEVICE_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    std::fs::create_dir_all(data_dir)?;
    let id = switchyard_protocol::new_id();
    std::fs::write(&path, format!("{id}\n"))?;
    info!(
        component = "config",
        event = "config.device_id.created",
        path = %path.display(),
        "Created device id"
    );
    Ok(id)
}
