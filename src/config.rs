use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const DEFAULT_LOCK_TIMEOUT: u64 = 180;
const DEFAULT_MAX_AGE: u64 = 24 * 60 * 60;
const DEFAULT_LOCK_COUNT: usize = 256;
const DEFAULT_OPERATION_TIMEOUT: u64 = 600;
const DEFAULT_FETCH_TIMEOUT: u64 = 600;
const DEFAULT_HTTP_LOW_SPEED_LIMIT: u32 = 1;
const DEFAULT_HTTP_LOW_SPEED_TIME: u64 = 600;
const DEFAULT_SSH_TIMEOUT: u64 = 600;
const DEFAULT_SSH_TIMEOUT_RETRY_COUNT: u32 = 1;
const DEFAULT_SSH_RETRY_DELAY: u64 = 1;

/// Settings of the repository cache and of the manager facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Root of the per-URL cache directories.
    pub cache_dir: PathBuf,
    /// Directory holding the cache index and the cache ownership lock.
    pub cache_info_dir: PathBuf,
    /// Upper bound on waiting for a repository lock.
    pub lock_timeout: Duration,
    /// Age after which a cached checkout is fetched again.
    pub max_age: Duration,
    /// Maximum number of repositories locked at the same time.
    pub lock_count: usize,
    /// Require a process definition file in `test_connection`.
    pub validate_definition: bool,
    /// Root of the bundled (`classpath://`) repositories.
    pub bundled_dir: PathBuf,
    /// Parent of the temporary directories; the system default when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl RepositoryConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            cache_info_dir: cache_dir.join(".info"),
            cache_dir,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT),
            max_age: Duration::from_secs(DEFAULT_MAX_AGE),
            lock_count: DEFAULT_LOCK_COUNT,
            validate_definition: true,
            bundled_dir: PathBuf::from("resources"),
            temp_dir: None,
        }
    }
}

/// Settings of the `git` based provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitConfig {
    pub binary: PathBuf,
    /// Token used for HTTPS repositories fetched without a secret.
    pub oauth_token: Option<String>,
    pub shallow_clone: bool,
    pub default_operation_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Bytes per second below which a transfer counts as stalled.
    pub http_low_speed_limit: u32,
    /// How long a transfer may stay below the limit before it is aborted.
    pub http_low_speed_time: Duration,
    pub ssh_timeout: Duration,
    pub ssh_timeout_retry_count: u32,
    pub ssh_retry_delay: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            oauth_token: None,
            shallow_clone: true,
            default_operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT),
            http_low_speed_limit: DEFAULT_HTTP_LOW_SPEED_LIMIT,
            http_low_speed_time: Duration::from_secs(DEFAULT_HTTP_LOW_SPEED_TIME),
            ssh_timeout: Duration::from_secs(DEFAULT_SSH_TIMEOUT),
            ssh_timeout_retry_count: DEFAULT_SSH_TIMEOUT_RETRY_COUNT,
            ssh_retry_delay: Duration::from_secs(DEFAULT_SSH_RETRY_DELAY),
        }
    }
}

/// Complete configuration loaded from a file and `CONCORD_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcordConfig {
    pub repository: RepositoryConfig,
    pub git: GitConfig,
}

impl ConcordConfig {
    /// Loads the configuration from the optional TOML `file` and the
    /// environment, e.g. `CONCORD_REPOSITORY__CACHE_DIR=/var/cache/concord`.
    pub fn load(file: Option<PathBuf>) -> anyhow::Result<Self> {
        let raw_config = RawConfig::load(file, None)?;
        raw_config.into_config()
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    repository: RawRepositoryConfig,
    #[serde(default)]
    git: RawGitConfig,
}

// Durations are expressed in seconds.
#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawRepositoryConfig {
    cache_dir: Option<PathBuf>,
    cache_info_dir: Option<PathBuf>,
    lock_timeout: Option<u64>,
    max_age: Option<u64>,
    lock_count: Option<usize>,
    validate_definition: Option<bool>,
    bundled_dir: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawGitConfig {
    binary: Option<PathBuf>,
    oauth_token: Option<String>,
    shallow_clone: Option<bool>,
    default_operation_timeout: Option<u64>,
    fetch_timeout: Option<u64>,
    http_low_speed_limit: Option<u32>,
    http_low_speed_time: Option<u64>,
    ssh_timeout: Option<u64>,
    ssh_timeout_retry_count: Option<u32>,
    ssh_retry_delay: Option<u64>,
}

impl RawConfig {
    fn load(file: Option<PathBuf>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix("CONCORD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }

    fn into_config(self) -> anyhow::Result<ConcordConfig> {
        let Self { repository, git } = self;

        let cache_dir = match repository.cache_dir {
            Some(dir) => dir,
            None => default_cache_directory()?,
        };
        let mut repository_config = RepositoryConfig::new(cache_dir);
        if let Some(dir) = repository.cache_info_dir {
            repository_config.cache_info_dir = dir;
        }
        if let Some(secs) = repository.lock_timeout {
            repository_config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = repository.max_age {
            repository_config.max_age = Duration::from_secs(secs);
        }
        if let Some(count) = repository.lock_count {
            if count == 0 {
                anyhow::bail!("repository.lock_count must be greater than zero");
            }
            repository_config.lock_count = count;
        }
        if let Some(validate) = repository.validate_definition {
            repository_config.validate_definition = validate;
        }
        if let Some(dir) = repository.bundled_dir {
            repository_config.bundled_dir = dir;
        }
        repository_config.temp_dir = repository.temp_dir;

        let defaults = GitConfig::default();
        let git_config = GitConfig {
            binary: git.binary.unwrap_or(defaults.binary),
            oauth_token: git.oauth_token.filter(|token| !token.is_empty()),
            shallow_clone: git.shallow_clone.unwrap_or(defaults.shallow_clone),
            default_operation_timeout: git
                .default_operation_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_operation_timeout),
            fetch_timeout: git
                .fetch_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            http_low_speed_limit: git
                .http_low_speed_limit
                .unwrap_or(defaults.http_low_speed_limit),
            http_low_speed_time: git
                .http_low_speed_time
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_low_speed_time),
            ssh_timeout: git
                .ssh_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.ssh_timeout),
            ssh_timeout_retry_count: git
                .ssh_timeout_retry_count
                .unwrap_or(defaults.ssh_timeout_retry_count),
            ssh_retry_delay: git
                .ssh_retry_delay
                .map(Duration::from_secs)
                .unwrap_or(defaults.ssh_retry_delay),
        };

        Ok(ConcordConfig {
            repository: repository_config,
            git: git_config,
        })
    }
}

fn default_cache_directory() -> anyhow::Result<PathBuf> {
    let mut cache_directory = home::home_dir().ok_or_else(|| {
        anyhow::anyhow!("Could not find home dir. Please define $HOME env variable.")
    })?;
    cache_directory.push(".concord/repositories");
    Ok(cache_directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn load_empty() {
        let env = HashMap::from([]);
        let config = RawConfig::load(None, Some(env)).unwrap();
        assert_eq!(config, RawConfig::default())
    }

    #[test]
    fn load_environment() {
        let env = HashMap::from([
            (
                "CONCORD_REPOSITORY__CACHE_DIR".to_owned(),
                "/cache".to_owned(),
            ),
            ("CONCORD_REPOSITORY__LOCK_COUNT".to_owned(), "8".to_owned()),
            ("CONCORD_GIT__SHALLOW_CLONE".to_owned(), "false".to_owned()),
            ("CONCORD_GIT__FETCH_TIMEOUT".to_owned(), "30".to_owned()),
        ]);
        let config = RawConfig::load(None, Some(env)).unwrap();
        assert_eq!(
            config,
            RawConfig {
                repository: RawRepositoryConfig {
                    cache_dir: Some("/cache".into()),
                    lock_count: Some(8),
                    ..Default::default()
                },
                git: RawGitConfig {
                    shallow_clone: Some(false),
                    fetch_timeout: Some(30),
                    ..Default::default()
                },
            }
        )
    }

    #[test]
    fn load_file_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("concord.toml");
        std::fs::write(
            &file,
            r#"
            [repository]
            cache_dir = "/from-file"
            max_age = 60

            [git]
            ssh_timeout_retry_count = 3
            "#,
        )
        .unwrap();
        let env = HashMap::from([(
            "CONCORD_REPOSITORY__CACHE_DIR".to_owned(),
            "/from-env".to_owned(),
        )]);
        let config = RawConfig::load(Some(file), Some(env))
            .unwrap()
            .into_config()
            .unwrap();

        assert_eq!(config.repository.cache_dir, PathBuf::from("/from-env"));
        assert_eq!(
            config.repository.cache_info_dir,
            PathBuf::from("/from-env/.info")
        );
        assert_eq!(config.repository.max_age, Duration::from_secs(60));
        assert_eq!(config.git.ssh_timeout_retry_count, 3);
        assert_eq!(config.git.fetch_timeout, Duration::from_secs(600));
    }

    #[test]
    fn zero_lock_count_is_rejected() {
        let raw = RawConfig {
            repository: RawRepositoryConfig {
                cache_dir: Some("/cache".into()),
                lock_count: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        raw.into_config().expect_err("lock count of zero should fail");
    }
}
