use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::{
    cache::CacheError,
    provider::ProviderError,
    secret::AccessScope,
};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("No repository provider supports {url}")]
    NoProvider { url: String },
    #[error("Secret {name} not found in {scope} of organization {org_id}")]
    SecretNotFound {
        name: String,
        scope: AccessScope,
        org_id: Uuid,
    },
    #[error("Could not resolve secret {name}: {source}")]
    SecretResolution {
        name: String,
        source: anyhow::Error,
    },
    #[error("Timed out after {timeout:?} waiting for the lock on {url}")]
    LockTimeout { url: String, timeout: Duration },
    #[error("Repository {reference} has no concord.yml or .concord.yml at {path}")]
    InvalidRepositoryPath { reference: String, path: String },
    #[error("Error while fetching {reference}: {source}")]
    Fetch {
        reference: String,
        source: ProviderError,
    },
    #[error("Repository cache error: {0}")]
    Cache(CacheError),
    #[error("Project directory error: {0}")]
    Project(anyhow::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl From<CacheError> for RepositoryError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::LockTimeout { url, timeout } => RepositoryError::LockTimeout { url, timeout },
            other => RepositoryError::Cache(other),
        }
    }
}

impl RepositoryError {
    pub(crate) fn fetch(reference: &crate::model::RepositoryRef, source: ProviderError) -> Self {
        match source {
            ProviderError::NoProvider { url } => RepositoryError::NoProvider { url },
            source => RepositoryError::Fetch {
                reference: reference.to_string(),
                source,
            },
        }
    }
}
