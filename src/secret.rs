use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Organization used when a project's organization cannot be determined.
pub const DEFAULT_ORG_ID: Uuid = Uuid::from_u128(0x0fac1b18_d179_11e7_b3e7_d7df4543ed4f);

/// Decrypted credential material. Lives in memory only.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    KeyPair {
        public_key: Vec<u8>,
        private_key: Vec<u8>,
    },
    UsernamePassword {
        username: String,
        password: String,
    },
    Token(String),
}

impl Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Secret::KeyPair { .. } => f.write_str("KeyPair(**)"),
            Secret::UsernamePassword { username, .. } => {
                write!(f, "UsernamePassword({username}, **)")
            }
            Secret::Token(_) => f.write_str("Token(**)"),
        }
    }
}

/// Access scope a secret is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessScope {
    Project(Uuid),
}

impl Display for AccessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessScope::Project(id) => write!(f, "project {id}"),
        }
    }
}

/// Resolves decrypted secrets by name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` when no secret with that name exists in the scope.
    async fn get_secret(
        &self,
        scope: AccessScope,
        org_id: Uuid,
        name: &str,
    ) -> anyhow::Result<Option<Secret>>;
}

/// Resolves the organization a project belongs to.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn org_id(&self, project_id: Uuid) -> anyhow::Result<Option<Uuid>>;
}

/// Project directory that knows no project, so every lookup falls back to the
/// default organization.
pub struct NoProjects;

#[async_trait]
impl ProjectDirectory for NoProjects {
    async fn org_id(&self, _project_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        Ok(None)
    }
}

#[derive(Error, Debug)]
pub enum SecretFileError {
    #[error("IO error reading secrets file {path}: {source}")]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parsing error in secrets file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SecretSpec {
    KeyPair {
        private_key: PathBuf,
        public_key: Option<PathBuf>,
    },
    UsernamePassword {
        username: String,
        password: String,
    },
    Token {
        token: String,
    },
}

#[derive(Debug, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    secrets: HashMap<String, SecretSpec>,
}

/// Secret store backed by a TOML file, used by the command line tool.
///
/// ```toml
/// [secrets.deploy-key]
/// type = "key_pair"
/// private_key = "/home/concord/.ssh/id_ed25519"
///
/// [secrets.github]
/// type = "token"
/// token = "ghp_..."
/// ```
///
/// Key file paths are resolved relative to the secrets file. Scopes and
/// organizations are not modelled: every name is visible everywhere.
#[derive(Default)]
pub struct FileSecretStore {
    root: PathBuf,
    secrets: HashMap<String, SecretSpec>,
}

impl FileSecretStore {
    pub fn from_file(path: &Path) -> Result<Self, SecretFileError> {
        let content = std::fs::read_to_string(path).map_err(|source| SecretFileError::IO {
            path: path.to_path_buf(),
            source,
        })?;
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(root, &content)
    }

    pub fn from_toml_str(root: PathBuf, content: &str) -> Result<Self, SecretFileError> {
        let file = toml::from_str::<SecretsFile>(content)?;
        Ok(Self {
            root,
            secrets: file.secrets,
        })
    }

    fn read_key(&self, path: &Path) -> Result<Vec<u8>, SecretFileError> {
        let path = self.root.join(path);
        std::fs::read(&path).map_err(|source| SecretFileError::IO { path, source })
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(
        &self,
        _scope: AccessScope,
        _org_id: Uuid,
        name: &str,
    ) -> anyhow::Result<Option<Secret>> {
        let secret = match self.secrets.get(name) {
            None => return Ok(None),
            Some(SecretSpec::KeyPair {
                private_key,
                public_key,
            }) => Secret::KeyPair {
                private_key: self.read_key(private_key)?,
                public_key: match public_key {
                    Some(path) => self.read_key(path)?,
                    None => Vec::new(),
                },
            },
            Some(SecretSpec::UsernamePassword { username, password }) => {
                Secret::UsernamePassword {
                    username: username.clone(),
                    password: password.clone(),
                }
            }
            Some(SecretSpec::Token { token }) => Secret::Token(token.clone()),
        };
        Ok(Some(secret))
    }
}
