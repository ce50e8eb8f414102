mod index;
mod key;
mod lock;

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    config::RepositoryConfig,
    flock::{self, FileLock},
    model::{Repository, RepositoryRef},
    provider::bundled::copy_tree,
};

pub use index::{CacheEntry, IndexError, INDEX_FILE_NAME};
pub use key::CacheKey;
pub use lock::{LockPool, LockToken};

use index::{unix_seconds, CacheIndex};

const PROCESS_LOCK_FILE_NAME: &str = ".lock";
const STAGING_MARKER: &str = ".staging-";
const RETIRED_MARKER: &str = ".old-";
const GIT_DIR: &str = ".git";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache location {location} is not a directory")]
    BadLocation { location: String },
    #[error("Timed out after {timeout:?} waiting for the lock on {url}")]
    LockTimeout { url: String, timeout: Duration },
    #[error("Cache lock cannot be acquired: {0}")]
    ProcessLock(#[from] flock::LockError),
    #[error("Cache index error: {0}")]
    Index(#[from] IndexError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Result of a `cleanup` pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted: Vec<String>,
    pub orphans_removed: usize,
    /// Staging and retired directories no running fetch owns.
    pub leftovers_removed: usize,
    /// Repositories skipped because they were locked or being fetched.
    pub skipped_locked: usize,
}

/// Maps repository URLs to stable directories under the cache root.
///
/// The cache owns its directory tree: an exclusive file lock on the info
/// directory is held for the lifetime of the value.
pub struct RepositoryCache {
    location: PathBuf,
    index: CacheIndex,
    locks: LockPool,
    max_age: Duration,
    staging_sequence: AtomicU64,
    // Directory names with a managed fetch in progress, with their count.
    fetching: DashMap<String, usize>,
    // Held while a fetch swaps its directory in and records it, and for a
    // whole cleanup pass.
    swap: Mutex<()>,
    _lock: FileLock,
}

impl RepositoryCache {
    /// Opens the cache, blocking the current thread while another process
    /// holds it. Use [`RepositoryCache::open`] from async code.
    pub fn new(config: &RepositoryConfig) -> Result<RepositoryCache, CacheError> {
        let location = config.cache_dir.clone();
        ensure_directory(&location)?;
        ensure_directory(&config.cache_info_dir)?;

        let lock = Self::acquire_lock(&config.cache_info_dir, config.lock_timeout)?;
        let index = CacheIndex::load(&config.cache_info_dir);

        let cache = RepositoryCache {
            location,
            index,
            locks: LockPool::new(config.lock_count.max(1), config.lock_timeout),
            max_age: config.max_age,
            staging_sequence: AtomicU64::new(0),
            fetching: DashMap::new(),
            swap: Mutex::new(()),
            _lock: lock,
        };
        cache.remove_leftovers()?;
        Ok(cache)
    }

    /// Opens the cache on the blocking thread pool.
    pub async fn open(config: RepositoryConfig) -> Result<RepositoryCache, CacheError> {
        blocking(move || Self::new(&config)).await?
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Returns the directory for `url`, creating it if missing.
    ///
    /// Never fetches content; the same URL always yields the same path.
    pub fn directory(&self, url: &str) -> Result<PathBuf, CacheError> {
        let key = CacheKey::new(url);
        let path = self.location.join(key.directory_name());
        if !path.exists() {
            trace!("Creating cache directory {} for {}", path.display(), key.url());
            std::fs::create_dir_all(&path)?;
        }
        Ok(path)
    }

    /// Index entry of `url`, if it was fetched through the cache.
    pub fn entry(&self, url: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = CacheKey::new(url);
        Ok(self.index.get(key.directory_name())?)
    }

    /// Runs `operation` while holding the lock of `url`.
    ///
    /// Waiting is bounded by the configured lock timeout; the lock is released
    /// however `operation` ends.
    pub async fn with_lock<F, Fut, T, E>(&self, url: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let _token = self.lock(url).await?;
        operation().await
    }

    /// Acquires the lock of `url` for the lifetime of the returned token.
    pub async fn lock(&self, url: &str) -> Result<LockToken, CacheError> {
        let key = CacheKey::new(url);
        debug!("Acquiring the repository lock for {}", key.url());
        self.locks
            .acquire(key.directory_name())
            .await
            .map_err(|_| CacheError::LockTimeout {
                url: key.url().to_owned(),
                timeout: self.locks.timeout(),
            })
    }

    /// Fetches `reference` through the cache.
    ///
    /// A fresh entry for the same branch, commit and path is returned as is.
    /// Otherwise `fetcher` fills a staging directory which then replaces the
    /// cached one; if `fetcher` fails the previous directory and entry are
    /// left untouched. The staging directory starts with the `.git` directory
    /// of the previous checkout, so git only fetches what changed.
    pub async fn fetch<F, Fut, E>(&self, reference: &RepositoryRef, fetcher: F) -> Result<Repository, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<Repository, E>>,
        E: From<CacheError>,
    {
        let key = CacheKey::new(reference.url());
        let _fetching = Fetching::enter(&self.fetching, key.directory_name());
        let directory = self.location.join(key.directory_name());
        let fingerprint = reference.fingerprint();

        let entry = self.index.get(key.directory_name()).map_err(CacheError::from)?;
        if let Some(entry) = &entry {
            if self.is_hit(entry, &fingerprint, &directory).await {
                debug!(
                    "Cache hit for {} (fetched {:?} ago)",
                    reference,
                    entry.age(SystemTime::now())
                );
                let path = match reference.path() {
                    Some(path) => directory.join(path),
                    None => directory,
                };
                return Ok(Repository::new(path, entry.revision.clone()));
            }
            debug!("Cache entry for {} is stale or does not match", reference);
        }

        // A directory without an entry may be half written; never seed from it.
        let seed = entry.is_some().then(|| directory.join(GIT_DIR));
        let staging = self.staging_directory(&key, seed).await?;
        let repository = match fetcher(staging.clone()).await {
            Ok(repository) => repository,
            Err(error) => {
                remove_quietly(&staging).await;
                return Err(error);
            }
        };

        let retired = self.sibling(&key, RETIRED_MARKER);
        let swap = self.swap.lock().await;
        if let Err(error) = replace_directory(&staging, &directory, &retired).await {
            drop(swap);
            remove_quietly(&staging).await;
            remove_quietly(&retired).await;
            return Err(CacheError::from(error).into());
        }
        let repository = repository.relocate(&staging, &directory);

        let inserted = self.index.insert(CacheEntry {
            url_hash: key.directory_name().to_owned(),
            directory_name: key.directory_name().to_owned(),
            last_fetched_at: unix_seconds(SystemTime::now()),
            url: key.url().to_owned(),
            revision: repository.revision().map(str::to_owned),
            fingerprint,
        });
        drop(swap);
        remove_quietly(&retired).await;
        inserted.map_err(CacheError::from)?;

        info!("Cached {} in {}", reference, directory.display());
        Ok(repository)
    }

    /// Removes the directory and the entry of `url`, under its lock.
    pub async fn invalidate(&self, url: &str) -> Result<bool, CacheError> {
        let key = CacheKey::new(url);
        let _token = self.lock(url).await?;
        let removed = self.index.remove(key.directory_name())?.is_some();
        let directory = self.location.join(key.directory_name());
        let existed = tokio::fs::try_exists(&directory).await?;
        if existed {
            tokio::fs::remove_dir_all(&directory).await?;
        }
        info!("Invalidated cache of {}", key.url());
        Ok(removed || existed)
    }

    /// Evicts entries older than the maximum age, removes directories that
    /// have no index entry and staging or retired directories left by
    /// fetches that are no longer running. Locked repositories and
    /// repositories being fetched are skipped.
    pub async fn cleanup(&self) -> Result<CleanupReport, CacheError> {
        let _swap = self.swap.lock().await;
        let mut report = CleanupReport::default();
        let now = SystemTime::now();

        for entry in self.index.entries()? {
            if !entry.is_stale(now, self.max_age) {
                continue;
            }
            let token = self.locks.try_acquire(&entry.url_hash);
            if token.is_none() || self.fetching.contains_key(&entry.url_hash) {
                report.skipped_locked += 1;
                continue;
            }
            let directory = self.location.join(&entry.directory_name);
            remove_existing(&directory).await?;
            self.index.remove(&entry.url_hash)?;
            debug!("Evicted {} from the cache", entry.url);
            report.evicted.push(entry.url);
        }

        let mut dir_entries = tokio::fs::read_dir(&self.location).await?;
        while let Some(dir_entry) = dir_entries.next_entry().await? {
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if let Some(owner) = leftover_owner(&name) {
                if self.fetching.contains_key(owner) {
                    continue;
                }
                debug!("Removing leftover directory {}", dir_entry.path().display());
                remove_existing(&dir_entry.path()).await?;
                report.leftovers_removed += 1;
                continue;
            }
            if !is_cache_directory_name(&name) || self.index.get(&name)?.is_some() {
                continue;
            }
            let token = self.locks.try_acquire(&name);
            if token.is_none() || self.fetching.contains_key(&name) {
                report.skipped_locked += 1;
                continue;
            }
            // An empty directory is what `directory` creates before a fetch.
            if !has_content(&dir_entry.path()).await {
                continue;
            }
            debug!("Removing orphan cache directory {}", dir_entry.path().display());
            remove_existing(&dir_entry.path()).await?;
            report.orphans_removed += 1;
        }

        info!(
            "Cache cleanup evicted {} repositories, removed {} orphan and {} leftover directories",
            report.evicted.len(),
            report.orphans_removed,
            report.leftovers_removed
        );
        Ok(report)
    }

    /// Runs `cleanup` every `period` until the returned handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(error) = cache.cleanup().await {
                    warn!("Cache cleanup failed: {}", error);
                }
            }
        })
    }

    fn acquire_lock(location: &Path, timeout: Duration) -> Result<FileLock, CacheError> {
        let location = location.join(PROCESS_LOCK_FILE_NAME);
        debug!(
            "Acquiring a lock on the cache location: {}",
            location.display()
        );
        let lock = FileLock::new(&location, timeout)?;
        info!("Acquired a lock on the cache location");
        Ok(lock)
    }

    async fn is_hit(&self, entry: &CacheEntry, fingerprint: &str, directory: &Path) -> bool {
        entry.fingerprint == fingerprint
            && !entry.is_stale(SystemTime::now(), self.max_age)
            && has_content(directory).await
    }

    fn sibling(&self, key: &CacheKey, marker: &str) -> PathBuf {
        let sequence = self.staging_sequence.fetch_add(1, Ordering::Relaxed);
        self.location.join(format!(
            "{}{}{}-{}",
            key.directory_name(),
            marker,
            std::process::id(),
            sequence
        ))
    }

    async fn staging_directory(
        &self,
        key: &CacheKey,
        seed: Option<PathBuf>,
    ) -> Result<PathBuf, CacheError> {
        let path = self.sibling(key, STAGING_MARKER);
        let staging = path.clone();
        blocking(move || {
            std::fs::create_dir_all(&staging)?;
            if let Some(seed) = seed.filter(|seed| seed.is_dir()) {
                trace!("Seeding {} from {}", staging.display(), seed.display());
                let target = staging.join(GIT_DIR);
                if let Err(error) = copy_tree(&seed, &target) {
                    warn!("Could not reuse {}, fetching from scratch: {}", seed.display(), error);
                    std::fs::remove_dir_all(&target)?;
                }
            }
            Ok::<_, std::io::Error>(())
        })
        .await??;
        Ok(path)
    }

    // Staging and retired directories only outlive a fetch when the process
    // died mid-way; this process owns the cache, so they can go.
    fn remove_leftovers(&self) -> Result<(), CacheError> {
        for dir_entry in std::fs::read_dir(&self.location)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if leftover_owner(&name).is_some() {
                info!("Removing leftover cache directory {}", dir_entry.path().display());
                remove_best_effort(&dir_entry.path());
            }
        }
        Ok(())
    }
}

/// Marks a directory name as being fetched while alive.
struct Fetching<'a> {
    fetching: &'a DashMap<String, usize>,
    name: String,
}

impl<'a> Fetching<'a> {
    fn enter(fetching: &'a DashMap<String, usize>, name: &str) -> Self {
        *fetching.entry(name.to_owned()).or_insert(0) += 1;
        Self {
            fetching,
            name: name.to_owned(),
        }
    }
}

impl Drop for Fetching<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.fetching.get_mut(&self.name) {
            *count -= 1;
        }
        self.fetching.remove_if(&self.name, |_, count| *count == 0);
    }
}

/// Moves `staging` to `directory`, parking the current content at `retired`.
/// On failure the current content is put back.
async fn replace_directory(staging: &Path, directory: &Path, retired: &Path) -> std::io::Result<()> {
    let (staging, directory, retired) = (
        staging.to_path_buf(),
        directory.to_path_buf(),
        retired.to_path_buf(),
    );
    blocking(move || {
        if directory.exists() {
            std::fs::rename(&directory, &retired)?;
        }
        if let Err(error) = std::fs::rename(&staging, &directory) {
            if retired.exists() {
                if let Err(restore) = std::fs::rename(&retired, &directory) {
                    warn!(
                        "Could not restore {} from {}: {}",
                        directory.display(),
                        retired.display(),
                        restore
                    );
                }
            }
            return Err(error);
        }
        Ok(())
    })
    .await?
}

async fn blocking<F, T>(operation: F) -> std::io::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(std::io::Error::other)
}

fn ensure_directory(location: &Path) -> Result<(), CacheError> {
    if location.exists() {
        if !location.is_dir() {
            return Err(CacheError::BadLocation {
                location: location.to_string_lossy().to_string(),
            });
        }
    } else {
        std::fs::create_dir_all(location)?;
    }
    Ok(())
}

fn is_cache_directory_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_hexdigit())
}

/// Directory name a staging or retired directory belongs to.
fn leftover_owner(name: &str) -> Option<&str> {
    name.split_once(STAGING_MARKER)
        .or_else(|| name.split_once(RETIRED_MARKER))
        .map(|(owner, _)| owner)
}

async fn has_content(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

async fn remove_existing(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = remove_existing(path).await {
        warn!("Could not remove {}: {}", path.display(), error);
    }
}

fn remove_best_effort(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(error) = std::fs::remove_dir_all(path) {
        warn!("Could not remove {}: {}", path.display(), error);
    }
}
