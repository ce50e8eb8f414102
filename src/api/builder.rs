use std::{sync::Arc, time::Duration};

use log::debug;

use crate::{
    cache::RepositoryCache,
    config::{GitConfig, RepositoryConfig},
    error::RepositoryError,
    provider::{
        BundledRepositoryProvider, GitCliRepositoryProvider, GitExecutor, RepositoryProvider,
        RepositoryProviders,
    },
    secret::{FileSecretStore, NoProjects, ProjectDirectory, SecretStore},
    validation::{ConcordFileValidator, DefinitionValidator},
    RepositoryManager,
};

pub struct RepositoryManagerBuilder {
    config: RepositoryConfig,
    git_config: GitConfig,
    secrets: Option<Arc<dyn SecretStore>>,
    projects: Option<Arc<dyn ProjectDirectory>>,
    validator: Option<Arc<dyn DefinitionValidator>>,
    git_executor: Option<Arc<dyn GitExecutor>>,
    cleanup_period: Option<Duration>,
}

impl RepositoryManagerBuilder {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            config,
            git_config: GitConfig::default(),
            secrets: None,
            projects: None,
            validator: None,
            git_executor: None,
            cleanup_period: None,
        }
    }

    /// Settings of the git provider.
    ///
    /// Defaults to [`GitConfig::default`].
    pub fn git_config(mut self, git_config: GitConfig) -> Self {
        self.git_config = git_config;
        self
    }

    /// Where named secrets are resolved.
    ///
    /// Defaults to a store without secrets.
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Where the organization of a project is looked up.
    ///
    /// Defaults to a directory without projects, so the default organization
    /// is always used.
    pub fn project_directory(mut self, projects: Arc<dyn ProjectDirectory>) -> Self {
        self.projects = Some(projects);
        self
    }

    /// Check applied to fetched content by `test_connection`.
    ///
    /// Defaults to [`ConcordFileValidator`].
    pub fn validator(mut self, validator: Arc<dyn DefinitionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replaces the git process runner.
    pub fn git_executor(mut self, executor: Arc<dyn GitExecutor>) -> Self {
        self.git_executor = Some(executor);
        self
    }

    /// Runs a cache cleanup every `period`.
    pub fn cleanup_period(mut self, period: Duration) -> Self {
        self.cleanup_period = Some(period);
        self
    }

    /// Opens the cache, waiting up to the lock timeout for another process to
    /// release it.
    pub async fn try_build(self) -> Result<RepositoryManager, RepositoryError> {
        let Self {
            config,
            git_config,
            secrets,
            projects,
            validator,
            git_executor,
            cleanup_period,
        } = self;

        if let Some(temp_dir) = &config.temp_dir {
            tokio::fs::create_dir_all(temp_dir).await?;
        }

        let git = match git_executor {
            Some(executor) => GitCliRepositoryProvider::with_executor(git_config, executor),
            None => GitCliRepositoryProvider::new(git_config),
        }
        .with_temp_root(config.temp_dir.clone());
        let providers: Vec<Box<dyn RepositoryProvider>> = vec![
            Box::new(BundledRepositoryProvider::new(config.bundled_dir.clone())),
            Box::new(git),
        ];

        let cache = Arc::new(RepositoryCache::open(config.clone()).await?);
        debug!("Using repository cache at {}", cache.location().display());

        let cleanup_task = cleanup_period.map(|period| cache.spawn_cleanup(period));

        Ok(RepositoryManager {
            config,
            providers: RepositoryProviders::new(providers),
            cache,
            secrets: secrets.unwrap_or_else(|| Arc::new(FileSecretStore::default())),
            projects: projects.unwrap_or_else(|| Arc::new(NoProjects)),
            validator: validator.unwrap_or_else(|| Arc::new(ConcordFileValidator)),
            cleanup_task,
        })
    }
}
