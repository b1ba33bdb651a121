//! Validated invocation of the `wg` tool.
//!
//! Arguments are passed directly to the program, never through a shell, and
//! secrets are fed over stdin so they never show up in the process table.

use std::io::ErrorKind;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, WireGuardError};

/// Characters that are never allowed in command arguments.
const FORBIDDEN_CHARS: &[char] = &['\0', '\n', '\r'];

/// Stderr fragments that mean the daemon could not be reached at all.
const UNAVAILABLE_MARKERS: &[&str] = &[
    "Unable to access interface",
    "Operation not permitted",
    "Permission denied",
    "No such device",
    "Protocol not supported",
];

/// Output from a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
    /// Exit status code (-1 when killed by a signal).
    pub exit_code: i32,
}

impl CommandOutput {
    /// Get stdout as a UTF-8 string, replacing invalid characters.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as a UTF-8 string, replacing invalid characters.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if the command succeeded (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A `wg` invocation under construction.
#[derive(Debug)]
pub struct WgCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    invalid: Option<String>,
}

impl WgCommand {
    /// Starts a command for the given program path.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let invalid = (program.is_empty() || program.contains(FORBIDDEN_CHARS))
            .then(|| format!("program path {program:?}"));
        Self {
            program,
            args: Vec::new(),
            stdin: None,
            invalid,
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        if arg.contains(FORBIDDEN_CHARS) && self.invalid.is_none() {
            self.invalid = Some(format!("argument {arg:?}"));
        }
        self.args.push(arg);
        self
    }

    /// Feeds the given bytes to the command's stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Describes the command for logs (stdin is never included).
    #[must_use]
    pub fn description(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Runs the command and requires a zero exit status.
    ///
    /// Spawn failures and stderr that indicates a missing interface or a
    /// permission problem map to [`WireGuardError::DaemonUnavailable`]; any
    /// other non-zero exit maps to [`WireGuardError::DaemonRejected`].
    pub async fn run(self) -> Result<CommandOutput> {
        let description = self.description();
        let output = self.run_unchecked().await?;

        if output.success() {
            return Ok(output);
        }

        let stderr = output.stderr_lossy();
        let message = format!(
            "`{description}` exited with code {}: {}",
            output.exit_code,
            stderr.trim()
        );
        if UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
            Err(WireGuardError::DaemonUnavailable(message))
        } else {
            Err(WireGuardError::DaemonRejected(message))
        }
    }

    /// Runs the command without checking the exit status.
    pub async fn run_unchecked(mut self) -> Result<CommandOutput> {
        if let Some(what) = self.invalid.take() {
            return Err(WireGuardError::InvalidArgument(what));
        }

        debug!(command = %self.description(), "running wg command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            WireGuardError::DaemonUnavailable(format!("failed to spawn {}: {e}", self.program))
        })?;

        if let (Some(input), Some(mut pipe)) = (self.stdin.take(), child.stdin.take()) {
            match pipe.write_all(&input).await {
                // The program may exit before reading stdin; its exit status decides.
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(WireGuardError::DaemonUnavailable(format!(
                        "failed to write stdin of {}: {e}",
                        self.program
                    )));
                }
            }
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            WireGuardError::DaemonUnavailable(format!("failed to wait for {}: {e}", self.program))
        })?;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
