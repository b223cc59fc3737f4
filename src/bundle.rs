//! Image bundles.
//!
//! A bundle is an image unpacked onto disk for launching:
//!
//! ```text
//! ~/.hubpack/bundles/sha256-<hex>/
//! ├── image.json   (image config)
//! └── rootfs/      (all layers applied bottom-up)
//! ```
//!
//! Bundles are keyed by image id and built once. Extraction happens in a
//! uniquely named scratch directory that is renamed into place, so a
//! half-extracted bundle is never mistaken for a complete one.

use crate::constants::BUNDLE_DIR;
use crate::error::{Error, Result};
use crate::image::StoredImage;
use crate::layer::extract_layers_to_rootfs;
use crate::storage::BlobStore;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File holding the image config inside a bundle.
const BUNDLE_CONFIG_FILE: &str = "image.json";

/// A materialized image.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Bundle directory.
    pub path: PathBuf,
    /// Root filesystem.
    pub rootfs: PathBuf,
}

/// Materializes images into bundles.
pub struct BundleBuilder {
    /// Base directory for bundles.
    base_dir: PathBuf,
    /// Blob storage for layer access.
    storage: Arc<BlobStore>,
}

impl BundleBuilder {
    /// Creates a bundle builder under a hubpack root directory.
    pub fn under_root(root: &Path, storage: Arc<BlobStore>) -> Result<Self> {
        Self::with_path(root.join(BUNDLE_DIR), storage)
    }

    /// Creates a bundle builder with a specific base path.
    pub fn with_path(base_dir: PathBuf, storage: Arc<BlobStore>) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { base_dir, storage })
    }

    /// Returns the bundle directory for an image id.
    pub fn bundle_path(&self, digest: &str) -> PathBuf {
        let safe_digest = digest.replace([':', '/'], "-");
        self.base_dir.join(safe_digest)
    }

    /// Unpacks an image, reusing an existing bundle for the same id.
    pub fn materialize(&self, image: &StoredImage) -> Result<Bundle> {
        let bundle_dir = self.bundle_path(&image.digest);
        let rootfs = bundle_dir.join("rootfs");

        if rootfs.is_dir() && bundle_dir.join(BUNDLE_CONFIG_FILE).is_file() {
            debug!("Bundle already exists: {}", bundle_dir.display());
            return Ok(Bundle {
                path: bundle_dir,
                rootfs,
            });
        }

        let scratch = self
            .base_dir
            .join(format!(".partial-{}", uuid::Uuid::now_v7()));
        let result = self.populate(image, &scratch).and_then(|()| {
            if bundle_dir.exists() {
                fs::remove_dir_all(&bundle_dir)?;
            }
            fs::rename(&scratch, &bundle_dir)?;
            Ok(())
        });
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&scratch);
            return Err(e);
        }

        info!("Materialized {} at {}", image.digest, bundle_dir.display());
        Ok(Bundle {
            path: bundle_dir,
            rootfs,
        })
    }

    fn populate(&self, image: &StoredImage, dir: &Path) -> Result<()> {
        let layers = image.layers()?;
        extract_layers_to_rootfs(&layers, &dir.join("rootfs"), &self.storage)?;
        let config = serde_json::to_vec_pretty(&image.config)?;
        fs::write(dir.join(BUNDLE_CONFIG_FILE), config)?;
        Ok(())
    }

    /// Removes bundles whose image is not in `live`. Returns the count.
    pub fn prune(&self, live: &HashSet<String>) -> Result<usize> {
        let keep: HashSet<PathBuf> = live.iter().map(|d| self.bundle_path(d)).collect();
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_dir() || keep.contains(&path) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove bundle {}: {}", path.display(), e),
            }
        }
        debug!("Pruned {} bundles", removed);
        Ok(removed)
    }
}
