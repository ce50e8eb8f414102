use std::{future::Future, path::Path, sync::Arc};

use log::{error, info, warn};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    cache::{CleanupReport, RepositoryCache},
    config::RepositoryConfig,
    error::RepositoryError,
    model::{Repository, RepositoryRef},
    provider::RepositoryProviders,
    secret::{AccessScope, ProjectDirectory, Secret, SecretStore, DEFAULT_ORG_ID},
    validation::DefinitionValidator,
};

mod builder;

pub use builder::RepositoryManagerBuilder;

/// Entry point for fetching process repositories.
///
/// Combines the providers, the on-disk cache and secret resolution. Cheap
/// operations like `directory` lookups go straight to [`RepositoryManager::cache`].
pub struct RepositoryManager {
    config: RepositoryConfig,
    providers: RepositoryProviders,
    cache: Arc<RepositoryCache>,
    secrets: Arc<dyn SecretStore>,
    projects: Arc<dyn ProjectDirectory>,
    validator: Arc<dyn DefinitionValidator>,
    cleanup_task: Option<JoinHandle<()>>,
}

impl RepositoryManager {
    pub fn builder(config: RepositoryConfig) -> RepositoryManagerBuilder {
        RepositoryManagerBuilder::new(config)
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<RepositoryCache> {
        &self.cache
    }

    /// Checks that `reference` can be fetched with its secret and, unless
    /// disabled, that it contains a process definition.
    ///
    /// The content is fetched into a temporary directory that is removed
    /// before returning. Without `org_id` the project's organization is used,
    /// falling back to [`DEFAULT_ORG_ID`].
    pub async fn test_connection(
        &self,
        org_id: Option<Uuid>,
        project_id: Uuid,
        reference: &RepositoryRef,
    ) -> Result<(), RepositoryError> {
        let result = self.try_connection(org_id, project_id, reference).await;
        match &result {
            Ok(()) => info!("Connection test of {} succeeded", reference),
            Err(error) => error!("Connection test of {} failed: {}", reference, error),
        }
        result
    }

    /// Fetches `reference` into its cache directory, reusing a fresh checkout.
    ///
    /// Does not lock the repository; wrap the call in [`RepositoryManager::with_lock`]
    /// when other tasks may fetch the same URL.
    pub async fn fetch(
        &self,
        reference: &RepositoryRef,
        secret: Option<&Secret>,
    ) -> Result<Repository, RepositoryError> {
        let result = self
            .cache
            .fetch(reference, |staging| async move {
                self.providers
                    .fetch(reference, secret, &staging)
                    .await
                    .map_err(|source| RepositoryError::fetch(reference, source))
            })
            .await;
        if let Err(error) = &result {
            error!("Fetching {} failed: {}", reference, error);
        }
        result
    }

    /// Resolves the project's organization and the reference's secret, then
    /// fetches like [`RepositoryManager::fetch`].
    pub async fn fetch_for_project(
        &self,
        project_id: Uuid,
        reference: &RepositoryRef,
    ) -> Result<Repository, RepositoryError> {
        let secret = match self.project_secret(project_id, reference).await {
            Ok(secret) => secret,
            Err(error) => {
                error!("Fetching {} failed: {}", reference, error);
                return Err(error);
            }
        };
        self.fetch(reference, secret.as_ref()).await
    }

    /// Runs `operation` while holding the repository lock of `url`.
    pub async fn with_lock<F, Fut, T>(&self, url: &str, operation: F) -> Result<T, RepositoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        self.cache.with_lock(url, operation).await
    }

    /// Drops the cached checkout of `url`. Returns whether anything was removed.
    pub async fn invalidate(&self, url: &str) -> Result<bool, RepositoryError> {
        Ok(self.cache.invalidate(url).await?)
    }

    pub async fn cleanup(&self) -> Result<CleanupReport, RepositoryError> {
        Ok(self.cache.cleanup().await?)
    }

    async fn try_connection(
        &self,
        org_id: Option<Uuid>,
        project_id: Uuid,
        reference: &RepositoryRef,
    ) -> Result<(), RepositoryError> {
        let org_id = match org_id {
            Some(org_id) => org_id,
            None => self.org_id(project_id).await?,
        };
        let secret = self.resolve_secret(project_id, org_id, reference).await?;

        let temp_dir = self.temp_dir()?;
        let result = self
            .fetch_and_validate(reference, secret.as_ref(), temp_dir.path())
            .await;
        let location = temp_dir.path().to_path_buf();
        if let Err(error) = temp_dir.close() {
            warn!(
                "Could not remove temporary directory {}: {}",
                location.display(),
                error
            );
        }
        result
    }

    async fn fetch_and_validate(
        &self,
        reference: &RepositoryRef,
        secret: Option<&Secret>,
        destination: &Path,
    ) -> Result<(), RepositoryError> {
        let repository = self
            .providers
            .fetch(reference, secret, destination)
            .await
            .map_err(|source| RepositoryError::fetch(reference, source))?;

        if self.config.validate_definition
            && !self.validator.has_definition_marker(repository.path())
        {
            return Err(RepositoryError::InvalidRepositoryPath {
                reference: reference.to_string(),
                path: reference.path().unwrap_or("/").to_owned(),
            });
        }
        Ok(())
    }

    async fn project_secret(
        &self,
        project_id: Uuid,
        reference: &RepositoryRef,
    ) -> Result<Option<Secret>, RepositoryError> {
        if reference.secret_name().is_none() {
            return Ok(None);
        }
        let org_id = self.org_id(project_id).await?;
        self.resolve_secret(project_id, org_id, reference).await
    }

    async fn org_id(&self, project_id: Uuid) -> Result<Uuid, RepositoryError> {
        let org_id = self
            .projects
            .org_id(project_id)
            .await
            .map_err(RepositoryError::Project)?;
        Ok(org_id.unwrap_or_else(|| {
            warn!(
                "Organization of project {} not found, using the default organization {}",
                project_id, DEFAULT_ORG_ID
            );
            DEFAULT_ORG_ID
        }))
    }

    async fn resolve_secret(
        &self,
        project_id: Uuid,
        org_id: Uuid,
        reference: &RepositoryRef,
    ) -> Result<Option<Secret>, RepositoryError> {
        let Some(name) = reference.secret_name() else {
            return Ok(None);
        };
        let scope = AccessScope::Project(project_id);
        let secret = self
            .secrets
            .get_secret(scope, org_id, name)
            .await
            .map_err(|source| RepositoryError::SecretResolution {
                name: name.to_owned(),
                source,
            })?;
        match secret {
            Some(secret) => Ok(Some(secret)),
            None => Err(RepositoryError::SecretNotFound {
                name: name.to_owned(),
                scope,
                org_id,
            }),
        }
    }

    fn temp_dir(&self) -> Result<TempDir, RepositoryError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("concord-repository-");
        let dir = match &self.config.temp_dir {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

impl Drop for RepositoryManager {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.take() {
            task.abort();
        }
    }
}
