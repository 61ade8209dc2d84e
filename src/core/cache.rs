//! Local translation cache keyed by item id
//!
//! The cache only saves network calls; a failing cache never fails a
//! translation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::errors::{Result, TranslationError};

/// String-keyed store of translated text
#[async_trait]
pub trait TranslationCache: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<String>>;

    /// Last write wins
    async fn set(&self, id: &str, text: &str) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    /// Look up many ids; individual failures are logged and treated as misses
    async fn get_many(&self, ids: &[String]) -> HashMap<String, String> {
        let mut hits = HashMap::new();
        for id in ids {
            match self.get(id).await {
                Ok(Some(text)) => {
                    hits.insert(id.clone(), text);
                }
                Ok(None) => {}
                Err(e) => warn!(id = %id, "Cache lookup failed: {}", e),
            }
        }
        hits
    }
}

/// Process-local cache
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranslationCache for MemoryCache {
    async fn get(&self, id: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(id).cloned())
    }

    async fn set(&self, id: &str, text: &str) -> Result<()> {
        self.entries.lock().insert(id.to_string(), text.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }
}

/// Cache persisted as a JSON object on disk.
///
/// Entries are loaded lazily on first access and the whole map is rewritten
/// after every `set`.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    entries: tokio::sync::Mutex<Option<BTreeMap<String, String>>>,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_error(&self, err: impl std::fmt::Display) -> TranslationError {
        TranslationError::FileError {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| self.file_error(e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.file_error(e)),
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.file_error(e))?;
        }
        let raw = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| self.file_error(e))
    }
}

#[async_trait]
impl TranslationCache for FileCache {
    async fn get(&self, id: &str) -> Result<Option<String>> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().and_then(|entries| entries.get(id).cloned()))
    }

    async fn set(&self, id: &str, text: &str) -> Result<()> {
        let mut guard = self.entries.lock().await;
        let mut entries = match guard.take() {
            Some(entries) => entries,
            None => self.load().await.unwrap_or_else(|e| {
                warn!("Discarding unreadable cache file: {}", e);
                BTreeMap::new()
            }),
        };
        entries.insert(id.to_string(), text.to_string());
        let result = self.persist(&entries).await;
        *guard = Some(entries);
        result
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.entries.lock().await;
        *guard = Some(BTreeMap::new());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Cache file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.file_error(e)),
        }
    }

    async fn len(&self) -> Result<usize> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().map_or(0, BTreeMap::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    struct BrokenCache;

    #[async_trait]
    impl TranslationCache for BrokenCache {
        async fn get(&self, id: &str) -> Result<Option<String>> {
            if id == "bad" {
                Err(TranslationError::FileError {
                    path: "cache.json".to_string(),
                    message: "disk on fire".to_string(),
                })
            } else {
                Ok(Some(format!("t:{}", id)))
            }
        }

        async fn set(&self, _id: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }

        async fn len(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_memory_cache_last_write_wins() {
        let cache = MemoryCache::new();
        assert_eq!(assert_ok!(cache.get("a").await), None);
        cache.set("a", "one").await.unwrap();
        cache.set("a", "two").await.unwrap();
        assert_eq!(assert_ok!(cache.get("a").await).as_deref(), Some("two"));
        assert_eq!(cache.len().await.unwrap(), 1);

        cache.clear().await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_many_tolerates_failures() {
        let ids = vec!["a".to_string(), "bad".to_string(), "c".to_string()];
        let hits = BrokenCache.get_many(&ids).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits["a"], "t:a");
        assert!(!hits.contains_key("bad"));
    }

    #[tokio::test]
    async fn test_file_cache_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = FileCache::new(&path);
        assert_eq!(cache.get("x").await.unwrap(), None);
        cache.set("x", "ecks").await.unwrap();
        cache.set("y", "why").await.unwrap();

        let reopened = FileCache::new(&path);
        assert_eq!(reopened.get("x").await.unwrap().as_deref(), Some("ecks"));
        assert_eq!(reopened.len().await.unwrap(), 2);

        reopened.clear().await.unwrap();
        assert!(!path.exists());
        assert_eq!(FileCache::new(&path).len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_cache_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let cache = FileCache::new(&path);
        assert!(matches!(cache.get("x").await, Err(TranslationError::FileError { .. })));
        assert!(cache.get_many(&["x".to_string()]).await.is_empty());

        // A write replaces the unreadable file.
        cache.set("x", "ok").await.unwrap();
        assert_eq!(FileCache::new(&path).get("x").await.unwrap().as_deref(), Some("ok"));
    }
}
