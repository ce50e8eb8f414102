pub mod bundled;
pub mod git;

use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::{
    model::{Repository, RepositoryRef},
    secret::Secret,
};

pub use bundled::{BundledRepositoryProvider, CLASSPATH_SCHEME};
pub use git::{GitCli, GitCliRepositoryProvider, GitExecutor, GitInvocation, GitOutput};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("No repository provider supports {url}")]
    NoProvider { url: String },
    #[error("Bundled resource {name} not found")]
    ResourceNotFound { name: String },
    #[error("Path {path} not found in the repository")]
    SubPathNotFound { path: String },
    #[error("git {command} failed ({status}): {stderr}")]
    Git {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("git {operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("Invalid {field} {value:?}: {reason}")]
    InvalidReference {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("Invalid secret: {0}")]
    InvalidSecret(String),
    #[error("Could not resolve the checked out revision: {0}")]
    Revision(#[from] git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Fetches repository content of one kind of URL into a local directory.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    fn supports(&self, reference: &RepositoryRef) -> bool;

    /// Materializes `reference` under `destination`. The returned path
    /// includes the requested sub-path.
    async fn fetch(
        &self,
        reference: &RepositoryRef,
        secret: Option<&Secret>,
        destination: &Path,
    ) -> Result<Repository, ProviderError>;
}

/// Ordered list of providers; the first one supporting a reference wins.
pub struct RepositoryProviders {
    providers: Vec<Box<dyn RepositoryProvider>>,
}

impl RepositoryProviders {
    pub fn new(providers: Vec<Box<dyn RepositoryProvider>>) -> Self {
        Self { providers }
    }

    pub fn supports(&self, reference: &RepositoryRef) -> bool {
        self.providers.iter().any(|p| p.supports(reference))
    }

    pub async fn fetch(
        &self,
        reference: &RepositoryRef,
        secret: Option<&Secret>,
        destination: &Path,
    ) -> Result<Repository, ProviderError> {
        let provider = self
            .providers
            .iter()
            .find(|provider| provider.supports(reference))
            .ok_or_else(|| ProviderError::NoProvider {
                url: reference.url().to_owned(),
            })?;
        debug!("Fetching {} into {}", reference, destination.display());
        provider.fetch(reference, secret, destination).await
    }
}

/// Joins `sub_path` to `root`, refusing paths that leave `root` and paths that
/// do not exist.
pub(crate) fn resolve_sub_path(root: &Path, sub_path: &str) -> Result<PathBuf, ProviderError> {
    let not_found = || ProviderError::SubPathNotFound {
        path: sub_path.to_owned(),
    };
    let mut resolved = root.to_path_buf();
    for component in Path::new(sub_path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(not_found())
            }
        }
    }
    if resolved.exists() {
        Ok(resolved)
    } else {
        Err(not_found())
    }
}
