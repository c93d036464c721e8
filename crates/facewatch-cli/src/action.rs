//! Trigger actions — lock the workstation or run configured commands.

use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("no lock command for platform: {0}")]
    UnsupportedPlatform(String),
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// Fired when the debounce counter reaches its threshold.
pub trait TriggerAction {
    fn fire(&mut self) -> Result<(), ActionError>;
}

/// Runs the configured command lines as independent processes.
pub struct ActionExecutor {
    commands: Vec<String>,
}

impl ActionExecutor {
    /// Action that locks the workstation. The platform command is resolved
    /// here, at startup, so an unsupported OS fails before the loop begins.
    pub fn lock_screen() -> Result<Self, ActionError> {
        Ok(Self {
            commands: vec![lock_command()?.to_string()],
        })
    }

    /// Action that runs an arbitrary command list.
    pub fn from_commands(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

fn lock_command() -> Result<&'static str, ActionError> {
    if cfg!(target_os = "linux") {
        Ok("loginctl lock-session")
    } else if cfg!(target_os = "macos") {
        Ok("/System/Library/CoreServices/Menu\\ Extras/user.menu/Contents/Resources/CGSession -suspend")
    } else if cfg!(target_os = "windows") {
        Ok("rundll32.exe user32.dll,LockWorkStation")
    } else {
        Err(ActionError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ))
    }
}

impl TriggerAction for ActionExecutor {
    /// Spawn every configured command. Issuance is the only guarantee —
    /// exit status is not collected. All commands are attempted even when
    /// an earlier spawn fails; the first failure is reported.
    fn fire(&mut self) -> Result<(), ActionError> {
        let mut first_err = None;
        for line in &self.commands {
            tracing::info!(command = %line, "running trigger command");
            if let Err(e) = spawn_detached(line) {
                tracing::error!(error = %e, "spawn failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_detached(line: &str) -> Result<(), ActionError> {
    let (shell, flag) = if cfg!(target_os = "windows") {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };
    Command::new(shell)
        .arg(flag)
        .arg(line)
        .spawn()
        .map(drop)
        .map_err(|source| ActionError::Spawn {
            command: line.to_string(),
            source,
        })
}
