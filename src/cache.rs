//! Stage result cache.
//!
//! Maps a stage cache key to the layer it produced. Records are small JSON
//! files under `cache/stages/<key-hex>.json`; the layer itself lives in the
//! blob store. A record is only honored while its blob still exists, so
//! garbage collection can never make the builder reuse a missing layer.

use crate::constants::STAGE_CACHE_DIR;
use crate::error::{Error, Result};
use crate::layer::LayerDescriptor;
use crate::storage::BlobStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheRecord {
    key: String,
    stage: String,
    layer: LayerDescriptor,
}

/// Persistent stage-key to layer index.
pub struct LayerCache {
    dir: PathBuf,
}

impl LayerCache {
    /// Opens the cache under a hubpack root directory.
    pub fn under_root(root: &Path) -> Result<Self> {
        let dir = root.join(STAGE_CACHE_DIR);
        fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let hex: String = key
            .strip_prefix("sha256:")
            .unwrap_or(key)
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .collect();
        self.dir.join(format!("{}.json", hex))
    }

    /// Returns the layer recorded for `key`, if its blob is still present.
    pub fn lookup(&self, key: &str, blobs: &BlobStore) -> Option<LayerDescriptor> {
        let path = self.record_path(key);
        let data = fs::read(&path).ok()?;
        let record: CacheRecord = match serde_json::from_slice(&data) {
            Ok(r) => r,
            Err(e) => {
                warn!("Ignoring corrupt cache record {}: {}", path.display(), e);
                return None;
            }
        };
        if record.key != key {
            return None;
        }
        if !blobs.has_blob(&record.layer.digest) {
            debug!("Cache record for {} points at a missing blob", record.stage);
            return None;
        }
        Some(record.layer)
    }

    /// Records the layer produced for `key`.
    pub fn record(&self, key: &str, stage: &str, layer: &LayerDescriptor) -> Result<()> {
        let record = CacheRecord {
            key: key.to_string(),
            stage: stage.to_string(),
            layer: layer.clone(),
        };
        let data = serde_json::to_vec_pretty(&record)?;

        let path = self.record_path(key);
        let temp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp, &path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("Cached stage {} as {}", stage, key);
        Ok(())
    }

    /// Removes records whose layer blob no longer exists.
    pub fn prune(&self, blobs: &BlobStore) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let keep = fs::read(&path)
                .ok()
                .and_then(|d| serde_json::from_slice::<CacheRecord>(&d).ok())
                .is_some_and(|r| blobs.has_blob(&r.layer.digest));
            if !keep {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        debug!("Pruned {} stale cache records", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::PackedLayer;
    use tempfile::TempDir;

    #[test]
    fn test_record_requires_live_blob() {
        let temp = TempDir::new().unwrap();
        let blobs = BlobStore::under_root(temp.path()).unwrap();
        let cache = LayerCache::under_root(temp.path()).unwrap();

        let layer = PackedLayer::from_tar(&[0u8; 1024]).unwrap().store(&blobs).unwrap();
        cache.record("sha256:00ff", "source", &layer).unwrap();
        assert_eq!(cache.lookup("sha256:00ff", &blobs), Some(layer.clone()));

        blobs.remove_blob(&layer.digest).unwrap();
        assert_eq!(cache.lookup("sha256:00ff", &blobs), None);
        assert_eq!(cache.prune(&blobs).unwrap(), 1);
    }
}
