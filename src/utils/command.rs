//! Utilities for running external tools with timeouts and cancellation

use super::cancel::{CancelToken, Cancelled};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error};

/// How often a running child checks the cancel token
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fully described external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment variables; values are never logged
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value of a `--flag=value` style argument
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let prefix = format!("{}=", flag);
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }

    /// Command line without environment, safe for logs
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with exit code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Run a command to completion.
///
/// The child is killed if the timeout elapses or the token is cancelled
/// before it exits; a non-zero exit status is an error.
pub fn run_command(spec: &CommandSpec, cancel: &CancelToken) -> Result<CommandOutput, CommandError> {
    cancel.check()?;

    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    debug!("Running command: {}", spec.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    let timeout = spec.timeout.map(|t| cancel.clamp(t)).or_else(|| cancel.remaining());

    let output = runtime.block_on(async {
        let expiry = async {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = cmd.output() => result.map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            }),
            reason = wait_for_cancel(cancel) => Err(CommandError::Cancelled(reason)),
            _ = expiry => match cancel.check() {
                Err(reason) => Err(CommandError::Cancelled(reason)),
                Ok(()) => Err(CommandError::TimedOut {
                    program: spec.program.clone(),
                    after: timeout.unwrap_or_default(),
                }),
            },
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!("Command failed: {}", spec.display());
        error!("Stderr: {}", stderr);
        return Err(CommandError::Failed {
            program: spec.program.clone(),
            code: output.status.code(),
            stderr,
        });
    }

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

async fn wait_for_cancel(cancel: &CancelToken) -> Cancelled {
    loop {
        if let Err(reason) = cancel.check() {
            return reason;
        }
        tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
    }
}
