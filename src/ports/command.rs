//! External command execution with a hard timeout
//!
//! A stuck child is killed when its timeout expires and the call is
//! reported as failed, so one hung tool never wedges the next pass.

use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to run {program}: {source}")]
    SpawnError { program: String, source: io::Error },
    #[error("{program} timed out after {}s", timeout.as_secs_f32())]
    TimedOut { program: String, timeout: Duration },
    #[error("{program} exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Same runner with a different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run and capture output, whatever the exit status
    pub async fn output<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput, CommandError> {
        self.execute(program, args, None).await
    }

    /// Run and require exit status 0
    pub async fn run<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput, CommandError> {
        let output = self.execute(program, args, None).await?;
        check(program, output)
    }

    /// Run with `input` on stdin and require exit status 0
    pub async fn run_with_stdin<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        input: &str,
    ) -> Result<CommandOutput, CommandError> {
        let output = self.execute(program, args, Some(input)).await?;
        check(program, output)
    }

    /// Exit status 0 within the timeout; every failure reads as false
    pub async fn succeeds<S: AsRef<str>>(&self, program: &str, args: &[S]) -> bool {
        match self.execute(program, args, None).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    async fn execute<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        input: Option<&str>,
    ) -> Result<CommandOutput, CommandError> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        debug!("exec: {} {}", program, args.join(" "));

        let spawn_error = |source| CommandError::SpawnError {
            program: program.to_string(),
            source,
        };

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(spawn_error)?;
        let stdin = child.stdin.take();

        let run = async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result.map_err(spawn_error)?,
            Err(_) => {
                warn!("{} did not finish within {:?}, killed", program, self.timeout);
                return Err(CommandError::TimedOut {
                    program: program.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn check(program: &str, output: CommandOutput) -> Result<CommandOutput, CommandError> {
    if output.success() {
        Ok(output)
    } else {
        Err(CommandError::Failed {
            program: program.to_string(),
            code: output.code,
            stderr: output.stderr,
        })
    }
}
