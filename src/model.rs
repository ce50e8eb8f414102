use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

/// Identifies what to fetch: a repository URL plus the revision, sub-path and
/// secret to fetch it with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    url: String,
    branch: Option<String>,
    commit_id: Option<String>,
    path: Option<String>,
    secret_name: Option<String>,
}

impl RepositoryRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: None,
            commit_id: None,
            path: None,
            secret_name: None,
        }
    }

    pub fn with_branch(self, branch: impl Into<String>) -> Self {
        Self {
            branch: non_empty(branch.into()),
            ..self
        }
    }

    pub fn with_commit_id(self, commit_id: impl Into<String>) -> Self {
        Self {
            commit_id: non_empty(commit_id.into()),
            ..self
        }
    }

    /// Restricts the fetch to a sub-directory of the repository.
    pub fn with_path(self, path: impl Into<String>) -> Self {
        Self {
            path: non_empty(path.into()),
            ..self
        }
    }

    pub fn with_secret_name(self, secret_name: impl Into<String>) -> Self {
        Self {
            secret_name: non_empty(secret_name.into()),
            ..self
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn commit_id(&self) -> Option<&str> {
        self.commit_id.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn secret_name(&self) -> Option<&str> {
        self.secret_name.as_deref()
    }

    /// Describes the content a cache directory holds for this reference.
    ///
    /// Two references with the same URL but a different fingerprint cannot
    /// share a cached checkout.
    pub fn fingerprint(&self) -> String {
        format!(
            "branch={};commit={};path={}",
            self.branch().unwrap_or_default(),
            self.commit_id().unwrap_or_default(),
            self.path().unwrap_or_default()
        )
    }
}

impl Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)?;
        if let Some(branch) = &self.branch {
            write!(f, "@{branch}")?;
        }
        if let Some(commit_id) = &self.commit_id {
            write!(f, "#{commit_id}")?;
        }
        if let Some(path) = &self.path {
            write!(f, ":{path}")?;
        }
        Ok(())
    }
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// A fetched working copy.
///
/// For cache-backed fetches the directory is shared: only the cache may
/// remove it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    path: PathBuf,
    revision: Option<String>,
}

impl Repository {
    pub fn new(path: impl Into<PathBuf>, revision: Option<String>) -> Self {
        Self {
            path: path.into(),
            revision,
        }
    }

    /// Local path of the fetched content, sub-path included.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Commit id of the checkout. `None` for bundled resources.
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Moves the handle from `from` to `to`, keeping the relative sub-path.
    pub(crate) fn relocate(self, from: &Path, to: &Path) -> Self {
        let path = match self.path.strip_prefix(from) {
            Ok(relative) if relative.as_os_str().is_empty() => to.to_path_buf(),
            Ok(relative) => to.join(relative),
            Err(_) => self.path,
        };
        Self {
            path,
            revision: self.revision,
        }
    }
}
