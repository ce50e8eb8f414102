use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use log::trace;
use tokio::process::Command;

use crate::provider::ProviderError;

const SSH_TRANSIENT_MESSAGES: [&str; 6] = [
    "connection timed out",
    "operation timed out",
    "ssh: connect to host",
    "connection reset by peer",
    "kex_exchange_identification",
    "connection closed by remote host",
];

/// One run of the git executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInvocation {
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl GitInvocation {
    pub fn new(working_dir: &Path, args: &[&str], timeout: Duration) -> Self {
        Self {
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
            working_dir: working_dir.to_path_buf(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn with_env(mut self, env: &[(String, String)]) -> Self {
        self.env.extend_from_slice(env);
        self
    }

    /// The git subcommand, e.g. `fetch`.
    pub fn operation(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Turns a failed run into `ProviderError::Git`.
    pub fn check(self, invocation: &GitInvocation) -> Result<GitOutput, ProviderError> {
        if self.success {
            return Ok(self);
        }
        Err(ProviderError::Git {
            command: invocation.args.join(" "),
            status: match self.code {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_owned(),
            },
            stderr: self.stderr.trim().to_owned(),
        })
    }

    /// Whether the failure looks like a network hiccup of the SSH transport.
    pub fn is_ssh_transient(&self) -> bool {
        if self.success {
            return false;
        }
        let stderr = self.stderr.to_ascii_lowercase();
        SSH_TRANSIENT_MESSAGES
            .iter()
            .any(|message| stderr.contains(message))
    }
}

/// Runs git processes. A run that exits unsuccessfully is still `Ok`; only a
/// run that cannot be started or exceeds its timeout is an error.
#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn run(&self, invocation: &GitInvocation) -> Result<GitOutput, ProviderError>;
}

/// Executes the git binary as a child process.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

#[async_trait]
impl GitExecutor for GitCli {
    async fn run(&self, invocation: &GitInvocation) -> Result<GitOutput, ProviderError> {
        trace!(
            "Running git {} in {}",
            invocation.args.join(" "),
            invocation.working_dir.display()
        );
        let mut command = Command::new(&self.binary);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(invocation.timeout, command.output())
            .await
            .map_err(|_| ProviderError::Timeout {
                operation: invocation.operation().to_owned(),
                timeout: invocation.timeout,
            })??;

        Ok(GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
