use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use crate::model::RepositoryRef;

/// Fetches and caches Concord process repositories.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// TOML configuration file; `CONCORD_*` variables override its values
    #[clap(short, long, env = "CONCORD_CONFIG")]
    pub config: Option<PathBuf>,
    /// TOML file with the secrets repositories may reference
    #[clap(short, long, env = "CONCORD_SECRETS")]
    pub secrets: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    ///Fetches a repository into the cache and prints its location
    Fetch {
        #[clap(flatten)]
        reference: ReferenceArgs,
        /// Project the secret belongs to
        #[clap(long, default_value_t = Uuid::nil())]
        project: Uuid,
    },
    ///Checks that a repository can be fetched and contains a process definition
    TestConnection {
        #[clap(flatten)]
        reference: ReferenceArgs,
        #[clap(long, default_value_t = Uuid::nil())]
        project: Uuid,
        /// Organization of the secret, the project's organization by default
        #[clap(long)]
        org: Option<Uuid>,
    },
    ///Removes a repository from the cache
    Invalidate { url: String },
    ///Removes stale and orphaned repositories from the cache
    Cleanup,
}

#[derive(Debug, Args)]
pub struct ReferenceArgs {
    /// Repository URL, e.g. `https://github.com/org/repo.git` or `classpath://name`
    pub url: String,
    #[clap(short, long)]
    pub branch: Option<String>,
    /// Commit id, takes precedence over the branch
    #[clap(long)]
    pub commit: Option<String>,
    /// Sub-directory of the repository
    #[clap(short, long)]
    pub path: Option<String>,
    /// Name of the secret used to access the repository
    #[clap(long)]
    pub secret: Option<String>,
}

impl ReferenceArgs {
    pub fn to_reference(&self) -> RepositoryRef {
        let mut reference = RepositoryRef::new(self.url.as_str());
        if let Some(branch) = &self.branch {
            reference = reference.with_branch(branch.as_str());
        }
        if let Some(commit) = &self.commit {
            reference = reference.with_commit_id(commit.as_str());
        }
        if let Some(path) = &self.path {
            reference = reference.with_path(path.as_str());
        }
        if let Some(secret) = &self.secret {
            reference = reference.with_secret_name(secret.as_str());
        }
        reference
    }
}
