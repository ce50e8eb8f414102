use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const VERSION: i64 = 1;
pub const INDEX_FILE_NAME: &str = "index.toml";

/// Record of one cached repository directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub url_hash: String,
    pub directory_name: String,
    /// Seconds since the Unix epoch.
    pub last_fetched_at: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub fingerprint: String,
}

impl CacheEntry {
    pub fn age(&self, now: SystemTime) -> Duration {
        let fetched_at = UNIX_EPOCH + Duration::from_secs(self.last_fetched_at);
        now.duration_since(fetched_at).unwrap_or_default()
    }

    pub fn is_stale(&self, now: SystemTime, max_age: Duration) -> bool {
        self.age(now) >= max_age
    }
}

pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error writing cache index {path}: {source}")]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Error while serializing cache index: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Cache index lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct IndexContent {
    #[serde(default)]
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Serialize)]
struct VersionedIndex<'a> {
    version: i64,
    #[serde(flatten)]
    content: &'a IndexContent,
}

/// Index of cached directories keyed by URL hash, mirrored to a TOML file.
pub struct CacheIndex {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
    writes: AtomicU64,
}

impl CacheIndex {
    /// Loads the index stored in `dir`. Missing or unreadable files yield an
    /// empty index.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(INDEX_FILE_NAME);
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match parse(&content) {
                Ok(content) => content
                    .entries
                    .into_iter()
                    .map(|entry| (entry.url_hash.clone(), entry))
                    .collect(),
                Err(error) => {
                    warn!(
                        "Ignoring unreadable cache index {}: {}",
                        path.display(),
                        error
                    );
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("No cache index at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(error) => {
                warn!("Could not read cache index {}: {}", path.display(), error);
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
            writes: AtomicU64::new(0),
        }
    }

    pub fn get(&self, url_hash: &str) -> Result<Option<CacheEntry>, IndexError> {
        Ok(self.lock()?.get(url_hash).cloned())
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>, IndexError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    pub fn insert(&self, entry: CacheEntry) -> Result<(), IndexError> {
        let mut entries = self.lock()?;
        entries.insert(entry.url_hash.clone(), entry);
        self.persist(&entries)
    }

    pub fn remove(&self, url_hash: &str) -> Result<Option<CacheEntry>, IndexError> {
        let mut entries = self.lock()?;
        let removed = entries.remove(url_hash);
        if removed.is_some() {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, CacheEntry>>, IndexError> {
        self.entries.lock().map_err(|_| IndexError::Poisoned)
    }

    // Written while holding the entries mutex: the file always reflects a
    // complete in-memory state and readers never observe a partial file.
    fn persist(&self, entries: &BTreeMap<String, CacheEntry>) -> Result<(), IndexError> {
        let content = IndexContent {
            entries: entries.values().cloned().collect(),
        };
        let text = toml::to_string_pretty(&VersionedIndex {
            version: VERSION,
            content: &content,
        })?;

        let sequence = self.writes.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .path
            .with_extension(format!("toml.tmp-{}-{}", std::process::id(), sequence));
        let io_error = |source| IndexError::IO {
            path: self.path.clone(),
            source,
        };
        std::fs::write(&temp_path, text).map_err(io_error)?;
        if let Err(error) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(io_error(error));
        }
        Ok(())
    }
}

fn parse(content: &str) -> Result<IndexContent, String> {
    let mut table = toml::from_str::<toml::Table>(content).map_err(|e| e.to_string())?;
    match table.remove("version") {
        Some(toml::Value::Integer(VERSION)) => {
            table.try_into::<IndexContent>().map_err(|e| e.to_string())
        }
        Some(other) => Err(format!("unsupported index version {other}")),
        None => Err("missing index version".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn entry(hash: &str, fetched_at: u64) -> CacheEntry {
        CacheEntry {
            url_hash: hash.to_owned(),
            directory_name: hash.to_owned(),
            last_fetched_at: fetched_at,
            url: format!("https://example.com/{hash}"),
            revision: Some("0123abcd".to_owned()),
            fingerprint: "branch=main;commit=;path=".to_owned(),
        }
    }

    #[test]
    fn entries_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::load(dir.path());
        index.insert(entry("aaa", 10)).unwrap();
        index.insert(entry("bbb", 20)).unwrap();
        index.remove("aaa").unwrap();

        let reloaded = CacheIndex::load(dir.path());
        assert_eq!(reloaded.entries().unwrap(), vec![entry("bbb", 20)]);
        assert_eq!(reloaded.get("aaa").unwrap(), None);
    }

    #[test]
    fn no_temporary_files_are_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::load(dir.path());
        index.insert(entry("aaa", 10)).unwrap();
        index.insert(entry("aaa", 11)).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![INDEX_FILE_NAME.to_owned()]);
    }

    #[test]
    fn corrupt_index_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE_NAME), "not = [valid").unwrap();
        let index = CacheIndex::load(dir.path());
        assert!(index.entries().unwrap().is_empty());
    }

    #[test]
    fn foreign_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE_NAME), "version = 7\nentries = []\n").unwrap();
        let index = CacheIndex::load(dir.path());
        assert!(index.entries().unwrap().is_empty());
    }

    #[test]
    fn staleness_uses_max_age() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = entry("aaa", 900);
        assert_eq!(entry.age(now), Duration::from_secs(100));
        assert!(entry.is_stale(now, Duration::from_secs(100)));
        assert!(!entry.is_stale(now, Duration::from_secs(101)));
        assert!(entry.is_stale(now, Duration::ZERO));
    }
}
