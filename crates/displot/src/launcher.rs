//! Display server launching.
//!
//! The allocator never talks to processes itself. A [`DisplayLauncher`] starts
//! a server on a given display number and stops it again at teardown.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::config::{DEFAULT_COMMAND, DisplayConfig};
use crate::slot::Slot;

/// Environment variable carrying a per-launch identifier.
pub const COOKIE_ENV: &str = "XVNC_COOKIE";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("command is empty after expanding the display number")]
    EmptyCommand,
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to run '{command}' ({})", describe_exit(.code))]
    Exit { command: String, code: Option<i32> },
    #[error("failed to stop display server: {0}")]
    Stop(String),
}

impl LaunchError {
    /// The command itself cannot run, whatever display it is given.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::EmptyCommand | Self::Spawn(_))
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Starts and stops display servers.
#[async_trait]
pub trait DisplayLauncher: Send + Sync {
    /// Whatever is needed to stop the server later.
    type Handle: Send;

    async fn launch(&self, slot: Slot) -> Result<Self::Handle, LaunchError>;

    async fn stop(&self, handle: Self::Handle) -> Result<(), LaunchError>;

    /// Best-effort removal of servers and lock files left by earlier runs.
    async fn clean_up_host(&self) -> Result<(), LaunchError> {
        Ok(())
    }
}

/// A running display server started by [`CommandLauncher`].
#[derive(Debug)]
pub struct DisplayHandle {
    slot: Slot,
    cookie: String,
    server: ServerProcess,
}

#[derive(Debug)]
enum ServerProcess {
    /// `vncserver` forked the server and exited; stop with `-kill`.
    Daemonized { vncserver: String },
    /// The spawned process is the server.
    Foreground { child: Child },
}

impl DisplayHandle {
    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn is_daemonized(&self) -> bool {
        matches!(self.server, ServerProcess::Daemonized { .. })
    }
}

/// Launches a display server from a command template.
///
/// `$DISPLAY_NUMBER` in the template is replaced with the allocated slot.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    template: String,
    workdir: Option<PathBuf>,
}

impl Default for CommandLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND)
    }
}

impl CommandLauncher {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            workdir: None,
        }
    }

    pub fn from_config(config: &DisplayConfig) -> Self {
        Self::new(config.command_line())
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, slot: Slot) -> String {
        expand_display_number(&self.template, slot)
    }

    /// `vncserver :N` forks the real server and exits with its status.
    fn daemonizes(&self, program: &str) -> bool {
        program.ends_with("vncserver") && self.template.contains(":$DISPLAY_NUMBER")
    }

    fn command(&self, program: &str, cookie: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env(COOKIE_ENV, cookie).stdin(Stdio::null());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl DisplayLauncher for CommandLauncher {
    type Handle = DisplayHandle;

    async fn launch(&self, slot: Slot) -> Result<DisplayHandle, LaunchError> {
        let rendered = self.render(slot);
        let argv = tokenize(&rendered);
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;
        let cookie = uuid::Uuid::new_v4().to_string();

        tracing::info!(slot, command = %rendered, "Starting display server");
        let mut child = self.command(program, &cookie).args(args).spawn()?;

        if !self.daemonizes(program) {
            tracing::debug!(slot, pid = ?child.id(), "Display server running in foreground");
            return Ok(DisplayHandle {
                slot,
                cookie,
                server: ServerProcess::Foreground { child },
            });
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(LaunchError::Exit {
                command: rendered,
                code: status.code(),
            });
        }
        Ok(DisplayHandle {
            slot,
            cookie,
            server: ServerProcess::Daemonized {
                vncserver: program.clone(),
            },
        })
    }

    async fn stop(&self, handle: DisplayHandle) -> Result<(), LaunchError> {
        let DisplayHandle {
            slot,
            cookie,
            server,
        } = handle;
        tracing::info!(slot, "Terminating display server");

        match server {
            ServerProcess::Daemonized { vncserver } => {
                let display = format!(":{slot}");
                let status = self
                    .command(&vncserver, &cookie)
                    .args(["-kill", display.as_str()])
                    .status()
                    .await?;
                log_nonzero(&vncserver, status);
                Ok(())
            }
            ServerProcess::Foreground { mut child } => {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::debug!(slot, ?status, "Display server already exited");
                    return Ok(());
                }
                child
                    .kill()
                    .await
                    .map_err(|e| LaunchError::Stop(e.to_string()))
            }
        }
    }

    async fn clean_up_host(&self) -> Result<(), LaunchError> {
        if !cfg!(unix) {
            tracing::warn!("Clean up not implemented for non-Unix hosts; skipping");
            return Ok(());
        }

        let commands: [&[&str]; 3] = [
            &["pkill", "Xvnc"],
            &["pkill", "Xrealvnc"],
            &["sh", "-c", "rm -f /tmp/.X*-lock /tmp/.X11-unix/X*"],
        ];
        for argv in commands {
            // Exit codes are ignored; pkill fails when nothing matched.
            match Command::new(argv[0])
                .args(&argv[1..])
                .stdin(Stdio::null())
                .status()
                .await
            {
                Ok(status) => tracing::debug!(command = ?argv, ?status, "Clean up step finished"),
                Err(e) => tracing::warn!(command = ?argv, error = %e, "Clean up step failed"),
            }
        }
        Ok(())
    }
}

fn log_nonzero(program: &str, status: ExitStatus) {
    if !status.success() {
        tracing::warn!(%program, ?status, "Display server stop command exited non-zero");
    }
}

/// Replace `$DISPLAY_NUMBER` and `${DISPLAY_NUMBER}` with `slot`.
pub fn expand_display_number(template: &str, slot: Slot) -> String {
    let n = slot.to_string();
    template
        .replace("${DISPLAY_NUMBER}", &n)
        .replace("$DISPLAY_NUMBER", &n)
}

/// Split a command line on whitespace, honouring single and double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
