//! Generated assistant hook settings.
//!
//! Each supported hook event runs `<switchyard> hook-forward --port N`,
//! which relays the hook body to the loopback receiver. The file lives at a
//! per-process unique path and is removed when the handle drops.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use switchyard_protocol::HookEventName;
use tracing::{debug, warn};

/// Hooks whose entries need a tool matcher.
fn is_tool_hook(kind: HookEventName) -> bool {
    matches!(
        kind,
        HookEventName::PostToolUse | HookEventName::PermissionRequest
    )
}

pub fn forward_command(forwarder: &Path, port: u16) -> String {
    format!("{} hook-forward --port {port}", shell_quote(&forwarder.to_string_lossy()))
}

fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@".contains(c))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// The settings document handed to the assistant via `--settings`.
pub fn hook_settings(forwarder: &Path, port: u16) -> Value {
    let command = forward_command(forwarder, port);
    let mut hooks = Map::new();
    for kind in HookEventName::ALL {
        let mut entry = json!({
            "hooks": [{
                "type": "command",
                "command": command,
            }]
        });
        if is_tool_hook(kind) {
            entry["matcher"] = json!("*");
        }
        hooks.insert(kind.as_str().to_string(), json!([entry]));
    }
    json!({ "hooks": hooks })
}

/// A written settings file, deleted on drop.
#[derive(Debug)]
pub struct HookSettingsFile {
    path: PathBuf,
}

impl HookSettingsFile {
    pub fn write(hook_dir: &Path, forwarder: &Path, port: u16) -> io::Result<Self> {
        std::fs::create_dir_all(hook_dir)?;
        let path = hook_dir.join(format!(
            "switchyard-hooks-{}-{}.json",
            std::process::id(),
            switchyard_protocol::new_id()
        ));
        let contents = serde_json::to_string_pretty(&hook_settings(forwarder, port))?;
        std::fs::write(&path, contents)?;
        debug!(
            component = "hook_settings",
            event = "hook_settings.written",
            path = %path.display(),
            port = port,
            "Hook settings written"
        );
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HookSettingsFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    component = "hook_settings",
                    event = "hook_settings.remove_failed",
                    path = %self.path.display(),
                    error = %err,
                    "Failed to remove hook settings"
                );
            }
        }
    }
}
