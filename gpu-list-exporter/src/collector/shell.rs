use std::{future::Future, process::Stdio, time::Duration};

use log::debug;
use tokio::process::Command;

use super::CollectError;

/// One external command invocation with its own deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ShellCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }
}

/// Runs external commands and hands back their stdout.
///
/// Implementations must not retry; the caller decides whether a failure is
/// fatal, cycle-local or tolerated.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        command: &ShellCommand,
    ) -> impl Future<Output = Result<Vec<u8>, CollectError>> + Send;
}

/// Spawns real OS processes via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, command: &ShellCommand) -> Result<Vec<u8>, CollectError> {
        debug!("exec {} {}", command.program, command.args.join(" "));

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child.
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollectError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(command.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CollectError::Spawn {
                program: command.program.clone(),
                source,
            })?,
            Err(_) => {
                return Err(CollectError::Timeout {
                    program: command.program.clone(),
                    timeout: command.timeout,
                });
            }
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(CollectError::CommandFailed {
                program: command.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
