use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, trace};

use crate::{
    model::{Repository, RepositoryRef},
    provider::{resolve_sub_path, ProviderError, RepositoryProvider},
    secret::Secret,
};

pub const CLASSPATH_SCHEME: &str = "classpath://";

/// Serves `classpath://<name>` references from a directory of resources
/// shipped with the server.
pub struct BundledRepositoryProvider {
    root: PathBuf,
}

impl BundledRepositoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resource(&self, url: &str) -> Result<PathBuf, ProviderError> {
        let name = url
            .strip_prefix(CLASSPATH_SCHEME)
            .unwrap_or(url)
            .trim_matches('/');
        let not_found = || ProviderError::ResourceNotFound {
            name: name.to_owned(),
        };
        if name.is_empty() {
            return Err(not_found());
        }
        match resolve_sub_path(&self.root, name) {
            Ok(path) if path.is_dir() => Ok(path),
            _ => Err(not_found()),
        }
    }
}

#[async_trait]
impl RepositoryProvider for BundledRepositoryProvider {
    fn supports(&self, reference: &RepositoryRef) -> bool {
        reference.url().starts_with(CLASSPATH_SCHEME)
    }

    async fn fetch(
        &self,
        reference: &RepositoryRef,
        _secret: Option<&Secret>,
        destination: &Path,
    ) -> Result<Repository, ProviderError> {
        let source = self.resource(reference.url())?;
        debug!(
            "Copying bundled resource {} into {}",
            source.display(),
            destination.display()
        );

        let target = destination.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|error| ProviderError::IO(std::io::Error::other(error)))??;

        let path = match reference.path() {
            Some(sub_path) => resolve_sub_path(destination, sub_path)?,
            None => destination.to_path_buf(),
        };
        Ok(Repository::new(path, None))
    }
}

pub(crate) fn copy_tree(source: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            trace!("Copying {}", from.display());
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
