//! Per-VM terminal sessions.
//!
//! Every VM gets one multiplexer session named `vm-<sanitized-name>` with
//! two windows: `console` (the hypervisor's serial console) and `status`
//! (a small key/value block). Operators can find these with plain `tmux`
//! commands, and any number of them may attach at once.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;

use crate::error::VmError;
use crate::util::shell_quote;

pub const CONSOLE_WINDOW: &str = "console";
pub const STATUS_WINDOW: &str = "status";

/// Session name for a VM. Letters, digits and `-` pass through; `_`
/// escapes everything else (`__` for `_`, `_d` for `.`, `_xHH` per byte
/// otherwise), so distinct VM names never share a session.
pub fn session_name(vm: &str) -> String {
    let mut sanitized = String::with_capacity(vm.len());
    for c in vm.chars() {
        match c {
            c if c.is_ascii_alphanumeric() || c == '-' => sanitized.push(c),
            '_' => sanitized.push_str("__"),
            '.' => sanitized.push_str("_d"),
            other => {
                let mut buf = [0u8; 4];
                for byte in other.encode_utf8(&mut buf).bytes() {
                    sanitized.push_str(&format!("_x{byte:02x}"));
                }
            }
        }
    }
    format!("vm-{sanitized}")
}

/// Render the status block shown in the `status` window.
pub fn render_status(fields: &[(String, String)]) -> String {
    let width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    fields
        .iter()
        .map(|(k, v)| format!("{k:<width$}  {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create the session with its `console` and `status` windows. A
    /// session that already exists is left as is.
    async fn create_session(&self, vm: &str) -> Result<(), VmError>;

    /// Replace whatever runs in the console window with `command`.
    async fn run_console_command(&self, vm: &str, command: &str) -> Result<(), VmError>;

    async fn update_status(&self, vm: &str, fields: &[(String, String)]) -> Result<(), VmError>;

    /// Idempotent: closing a session that does not exist succeeds.
    async fn close_session(&self, vm: &str) -> Result<(), VmError>;

    /// Attach the caller's terminal. Best effort.
    async fn attach_session(&self, vm: &str) -> Result<(), VmError>;

    async fn has_session(&self, vm: &str) -> Result<bool, VmError>;
}

/// [`Multiplexer`] driving the `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    binary: PathBuf,
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxMultiplexer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output, VmError> {
        tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VmError::SessionError {
                message: format!("running {}: {e}", self.binary.display()),
            })
    }

    async fn tmux_ok(&self, args: &[&str]) -> Result<(), VmError> {
        let output = self.tmux(args).await?;
        if !output.status.success() {
            return Err(VmError::SessionError {
                message: format!(
                    "tmux {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn create_session(&self, vm: &str) -> Result<(), VmError> {
        if self.has_session(vm).await? {
            return Ok(());
        }
        let session = session_name(vm);
        self.tmux_ok(&["new-session", "-d", "-s", &session, "-n", CONSOLE_WINDOW])
            .await?;
        self.tmux_ok(&["new-window", "-d", "-t", &session, "-n", STATUS_WINDOW])
            .await?;
        tracing::info!(vm, session, "created terminal session");
        Ok(())
    }

    async fn run_console_command(&self, vm: &str, command: &str) -> Result<(), VmError> {
        let target = format!("{}:{CONSOLE_WINDOW}", session_name(vm));
        self.tmux_ok(&["respawn-pane", "-k", "-t", &target, command])
            .await
    }

    async fn update_status(&self, vm: &str, fields: &[(String, String)]) -> Result<(), VmError> {
        let target = format!("{}:{STATUS_WINDOW}", session_name(vm));
        let script = format!(
            "clear; printf '%s\\n' {}; exec tail -f /dev/null",
            shell_quote(&render_status(fields))
        );
        self.tmux_ok(&["respawn-pane", "-k", "-t", &target, &script])
            .await
    }

    async fn close_session(&self, vm: &str) -> Result<(), VmError> {
        if !self.has_session(vm).await? {
            return Ok(());
        }
        let session = session_name(vm);
        self.tmux_ok(&["kill-session", "-t", &session]).await?;
        tracing::info!(vm, session, "closed terminal session");
        Ok(())
    }

    async fn attach_session(&self, vm: &str) -> Result<(), VmError> {
        let session = session_name(vm);
        // Inside tmux, attaching would nest; switch the client instead.
        let verb = if std::env::var_os("TMUX").is_some() {
            "switch-client"
        } else {
            "attach-session"
        };
        let status = tokio::process::Command::new(&self.binary)
            .args([verb, "-t", &session])
            .status()
            .await
            .map_err(|e| VmError::SessionError {
                message: format!("running {}: {e}", self.binary.display()),
            })?;
        if !status.success() {
            return Err(VmError::SessionError {
                message: format!("could not attach to session {session}"),
            });
        }
        Ok(())
    }

    async fn has_session(&self, vm: &str) -> Result<bool, VmError> {
        // `=` forces an exact match instead of a prefix match.
        let target = format!("={}", session_name(vm));
        let output = self.tmux(&["has-session", "-t", &target]).await?;
        Ok(output.status.success())
    }
}
