mod auth;
mod command;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::{
    config::GitConfig,
    model::{Repository, RepositoryRef},
    provider::{bundled::CLASSPATH_SCHEME, resolve_sub_path, ProviderError, RepositoryProvider},
    secret::Secret,
};

use auth::GitAuth;

pub use command::{GitCli, GitExecutor, GitInvocation, GitOutput};

const REMOTE: &str = "origin";
const END_OF_OPTIONS: &str = "--end-of-options";

/// Fetches remote repositories by driving the `git` executable.
pub struct GitCliRepositoryProvider {
    config: GitConfig,
    executor: Arc<dyn GitExecutor>,
    temp_root: Option<PathBuf>,
}

impl GitCliRepositoryProvider {
    pub fn new(config: GitConfig) -> Self {
        let executor = Arc::new(GitCli::new(config.binary.clone()));
        Self::with_executor(config, executor)
    }

    pub fn with_executor(config: GitConfig, executor: Arc<dyn GitExecutor>) -> Self {
        Self {
            config,
            executor,
            temp_root: None,
        }
    }

    /// Directory in which identity files and askpass scripts are created.
    pub fn with_temp_root(mut self, temp_root: Option<PathBuf>) -> Self {
        self.temp_root = temp_root;
        self
    }

    async fn run(
        &self,
        auth: &GitAuth,
        destination: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> Result<GitOutput, ProviderError> {
        let invocation = GitInvocation::new(destination, args, timeout).with_env(auth.env());
        self.executor.run(&invocation).await?.check(&invocation)
    }

    /// Runs a fetch, repeating it while it fails with an SSH transport error
    /// and retries are left.
    async fn run_fetch(
        &self,
        auth: &GitAuth,
        destination: &Path,
        args: &[&str],
    ) -> Result<GitOutput, ProviderError> {
        let invocation = GitInvocation::new(destination, args, self.config.fetch_timeout)
            .with_env(auth.env());
        let mut attempt = 0;
        loop {
            let output = self.executor.run(&invocation).await?;
            if output.is_ssh_transient() && attempt < self.config.ssh_timeout_retry_count {
                attempt += 1;
                warn!(
                    "git {} failed with a transient SSH error, retrying ({}/{}): {}",
                    invocation.operation(),
                    attempt,
                    self.config.ssh_timeout_retry_count,
                    output.stderr.trim()
                );
                tokio::time::sleep(self.config.ssh_retry_delay).await;
                continue;
            }
            return output.check(&invocation);
        }
    }

    async fn init_remote(
        &self,
        auth: &GitAuth,
        destination: &Path,
        url: &str,
    ) -> Result<(), ProviderError> {
        let timeout = self.config.default_operation_timeout;
        if destination.join(".git").exists() {
            debug!("Updating the remote of {}", destination.display());
            self.run(auth, destination, &["remote", "set-url", REMOTE, url], timeout)
                .await?;
        } else {
            debug!("Initializing a repository in {}", destination.display());
            self.run(auth, destination, &["init", "--quiet"], timeout).await?;
            self.run(auth, destination, &["remote", "add", REMOTE, url], timeout)
                .await?;
        }
        Ok(())
    }

    /// Fetches what `reference` points at and returns the revision to check
    /// out. A commit id wins over a branch.
    async fn fetch_revision(
        &self,
        auth: &GitAuth,
        destination: &Path,
        reference: &RepositoryRef,
    ) -> Result<String, ProviderError> {
        let branch_refspec = reference
            .branch()
            .map(|branch| format!("+refs/heads/{branch}:refs/remotes/{REMOTE}/{branch}"));

        if let Some(commit_id) = reference.commit_id() {
            let args = self.fetch_args(&[commit_id], true);
            match self.run_fetch(auth, destination, &args).await {
                Ok(_) => {}
                Err(ProviderError::Git { stderr, .. }) => {
                    info!(
                        "Fetching commit {} of {} directly failed, fetching the full history: {}",
                        commit_id,
                        reference.url(),
                        stderr
                    );
                    let refspec = branch_refspec
                        .unwrap_or_else(|| format!("+refs/heads/*:refs/remotes/{REMOTE}/*"));
                    let args = self.fetch_args(&[refspec.as_str()], false);
                    self.run_fetch(auth, destination, &args).await?;
                }
                Err(error) => return Err(error),
            }
            return Ok(commit_id.to_owned());
        }

        match (reference.branch(), branch_refspec) {
            (Some(branch), Some(refspec)) => {
                let args = self.fetch_args(&[refspec.as_str()], true);
                self.run_fetch(auth, destination, &args).await?;
                Ok(format!("refs/remotes/{REMOTE}/{branch}"))
            }
            _ => {
                let args = self.fetch_args(&["HEAD"], true);
                self.run_fetch(auth, destination, &args).await?;
                Ok("FETCH_HEAD".to_owned())
            }
        }
    }

    fn fetch_args<'a>(&self, refspecs: &[&'a str], allow_shallow: bool) -> Vec<&'a str> {
        let mut args = vec!["fetch", "--no-tags", "--quiet"];
        if allow_shallow && self.config.shallow_clone {
            args.extend(["--depth", "1"]);
        }
        args.extend([END_OF_OPTIONS, REMOTE]);
        args.extend_from_slice(refspecs);
        args
    }
}

#[async_trait]
impl RepositoryProvider for GitCliRepositoryProvider {
    fn supports(&self, reference: &RepositoryRef) -> bool {
        !reference.url().is_empty() && !reference.url().starts_with(CLASSPATH_SCHEME)
    }

    async fn fetch(
        &self,
        reference: &RepositoryRef,
        secret: Option<&Secret>,
        destination: &Path,
    ) -> Result<Repository, ProviderError> {
        check_reference(reference)?;
        tokio::fs::create_dir_all(destination).await?;
        let auth = GitAuth::prepare(
            reference.url(),
            secret,
            &self.config,
            self.temp_root.as_deref(),
        )?;

        self.init_remote(&auth, destination, reference.url()).await?;
        let revision = self.fetch_revision(&auth, destination, reference).await?;

        let timeout = self.config.default_operation_timeout;
        self.run(
            &auth,
            destination,
            &[
                "checkout",
                "--quiet",
                "--force",
                "--detach",
                END_OF_OPTIONS,
                revision.as_str(),
            ],
            timeout,
        )
        .await?;
        self.run(&auth, destination, &["clean", "-ffdx", "--quiet"], timeout)
            .await?;
        drop(auth);

        let commit_id = head_commit(destination)?;
        debug!("Checked out {} at {}", reference, commit_id);

        let path = match reference.path() {
            Some(sub_path) => resolve_sub_path(destination, sub_path)?,
            None => destination.to_path_buf(),
        };
        Ok(Repository::new(path, Some(commit_id)))
    }
}

/// Rejects URLs, branches and commit ids that git could read as options or
/// as something other than a single ref.
fn check_reference(reference: &RepositoryRef) -> Result<(), ProviderError> {
    let invalid = |field, value: &str, reason| ProviderError::InvalidReference {
        field,
        value: value.to_owned(),
        reason,
    };

    if reference.url().starts_with('-') {
        return Err(invalid("url", reference.url(), "must not start with '-'"));
    }
    if let Some(branch) = reference.branch() {
        if !is_valid_branch(branch) {
            return Err(invalid("branch", branch, "not a valid branch name"));
        }
    }
    if let Some(commit_id) = reference.commit_id() {
        if !is_commit_id(commit_id) {
            return Err(invalid(
                "commit id",
                commit_id,
                "expected 4 to 40 hexadecimal characters",
            ));
        }
    }
    Ok(())
}

fn is_commit_id(value: &str) -> bool {
    (4..=40).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit())
}

// A subset of git-check-ref-format(1), enough to keep the refspec intact.
fn is_valid_branch(branch: &str) -> bool {
    !branch.is_empty()
        && !branch.starts_with(['-', '/', '.'])
        && !branch.ends_with(['/', '.'])
        && !branch.ends_with(".lock")
        && !branch.contains("..")
        && !branch.contains("@{")
        && !branch.contains("//")
        && !branch
            .chars()
            .any(|c| c.is_ascii_control() || c.is_whitespace() || "~^:?*[\\".contains(c))
}

fn head_commit(path: &Path) -> Result<String, git2::Error> {
    let repository = git2::Repository::open(path)?;
    let commit = repository.head()?.peel_to_commit()?;
    Ok(commit.id().to_string())
}
