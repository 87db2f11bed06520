// ABOUTME: Command execution boundary - runs git with a fixed working directory and surfaces full stderr

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to launch git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git produced non-UTF8 output")]
    NonUtf8Output,
}

/// Captured output of one git invocation.
///
/// Full stderr is always preserved so callers can classify failures by their
/// message text (conflict markers, "no tracking branch" phrasing, etc.).
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if non-empty, else stdout. Git spreads diagnostics across both.
    pub fn combined_message(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Runs git commands against one fixed working directory.
///
/// Implementations never change the process-wide current directory; the
/// working directory is part of the executor's identity. That is what keeps
/// concurrently open repositories from contaminating each other.
pub trait CommandExecutor: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<CommandOutput, ExecError>;

    /// The working directory this executor is bound to.
    fn workdir(&self) -> &Path;
}

/// Real CLI-git executor.
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

impl CommandExecutor for GitCli {
    fn run(&self, args: &[&str]) -> Result<CommandOutput, ExecError> {
        debug!("git {} (cwd: {})", args.join(" "), self.workdir.display());

        let output = Command::new("git")
            .current_dir(&self.workdir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0") // Disable interactive prompts
            .env("GIT_ASKPASS", "echo") // Provide dummy askpass to avoid hanging
            .output()?;

        let stdout = String::from_utf8(output.stdout).map_err(|_| ExecError::NonUtf8Output)?;
        let stderr = String::from_utf8(output.stderr).map_err(|_| ExecError::NonUtf8Output)?;
        let exit_code = output.status.code().unwrap_or(-1);

        if exit_code != 0 {
            debug!("git {} exited {}: {}", args.join(" "), exit_code, stderr.trim());
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn workdir(&self) -> &Path {
        &self.workdir
    }
}
