//! Content-addressable build cache

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fingerprint::Fingerprint;
use crate::operation::OperationId;

/// A cached operation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint the result was recorded under
    pub fingerprint: Fingerprint,
    /// Operation that produced it
    pub operation: OperationId,
    /// Captured log output
    pub log: String,
    /// Original run duration
    pub duration_ms: u64,
    /// When this entry was created (RFC 3339)
    pub created_at: String,
}

impl CacheEntry {
    /// Create an entry stamped with the current time
    pub fn new(
        fingerprint: Fingerprint,
        operation: OperationId,
        log: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            fingerprint,
            operation,
            log: log.into(),
            duration_ms: duration.as_millis() as u64,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Storage for previously successful results.
///
/// A miss is `Ok(None)`, never an error.
pub trait CacheStore: Send + Sync {
    /// Look up a result recorded for `operation` under `fingerprint`
    fn try_get(
        &self,
        fingerprint: &Fingerprint,
        operation: &OperationId,
    ) -> Result<Option<CacheEntry>, CacheError>;

    /// Record a result
    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
}

/// Cache stored as one directory per fingerprint
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    /// Cache directory
    cache_dir: PathBuf,
}

impl LocalCacheStore {
    /// Create a new cache store
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Create cache with default directory
    pub fn default_dir(root: &Path) -> Self {
        Self::new(root.join(".relay").join("cache"))
    }

    fn metadata_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir.join(fingerprint.as_str()).join("metadata.json")
    }

    /// Remove old cache entries
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        info!(max_age_secs = max_age.as_secs(), "pruning cache");
        let mut stats = PruneStats::default();

        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            stats.total += 1;

            let created = fs::read_to_string(path.join("metadata.json"))
                .ok()
                .and_then(|contents| serde_json::from_str::<CacheEntry>(&contents).ok())
                .and_then(|entry| chrono::DateTime::parse_from_rfc3339(&entry.created_at).ok());

            match created {
                Some(created) if created < cutoff => {
                    fs::remove_dir_all(&path)?;
                    stats.removed += 1;
                }
                _ => stats.kept += 1,
            }
        }

        info!(total = stats.total, removed = stats.removed, kept = stats.kept, "cache prune complete");
        Ok(stats)
    }

    /// Get cache statistics
    pub fn status(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            stats.entries += 1;

            for file in fs::read_dir(&path)?.flatten() {
                if let Ok(meta) = file.metadata() {
                    stats.total_size += meta.len();
                }
            }
        }

        Ok(stats)
    }

    /// Remove every entry
    pub fn clean(&self) -> Result<(), CacheError> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
        }
        info!(dir = %self.cache_dir.display(), "cache cleared");
        Ok(())
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl CacheStore for LocalCacheStore {
    fn try_get(
        &self,
        fingerprint: &Fingerprint,
        operation: &OperationId,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let metadata_path = self.metadata_path(fingerprint);
        if !metadata_path.exists() {
            debug!(%operation, "cache miss");
            return Ok(None);
        }

        let contents = fs::read_to_string(&metadata_path)?;
        let entry: CacheEntry = serde_json::from_str(&contents)?;

        if &entry.operation != operation {
            debug!(%operation, recorded = %entry.operation, "cache entry belongs to another operation");
            return Ok(None);
        }

        debug!(%operation, "cache hit");
        Ok(Some(entry))
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        debug!(operation = %entry.operation, "storing result in cache");
        let metadata_path = self.metadata_path(&entry.fingerprint);
        if let Some(dir) = metadata_path.parent() {
            fs::create_dir_all(dir)?;
        }

        // Write then rename so readers never observe a partial file
        let tmp_path = metadata_path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(entry)?)?;
        fs::rename(&tmp_path, &metadata_path)?;
        Ok(())
    }
}

/// In-process cache, discarded with the store
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCacheStore {
    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheStore for MemoryCacheStore {
    fn try_get(
        &self,
        fingerprint: &Fingerprint,
        operation: &OperationId,
    ) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .lock()
            .get(fingerprint)
            .filter(|e| &e.operation == operation)
            .cloned())
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.lock().insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else if self.total_size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        } else {
            format!(
                "{:.1} GB",
                self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )
        }
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
