//! # Image Store
//!
//! Images are stored the OCI way: a manifest blob listing a config blob and
//! layer blobs, all content-addressed in the [`BlobStore`]. The image id is
//! the manifest digest. Human-readable tags map to image ids through a
//! single index file, `refs/index.json`.
//!
//! ## Layout
//!
//! ```text
//! ~/.hubpack/
//! ├── blobs/sha256/..        manifests, configs, layers
//! └── refs/index.json        { "tags": { "data-import-hub:0.1.0": "sha256:..." } }
//! ```
//!
//! ## Atomicity
//!
//! [`ImageStore::commit`] writes the config blob, then the manifest blob,
//! and only then replaces the index (temp file + rename). A build that
//! fails at any earlier point leaves the index untouched, so a tag always
//! names a complete image.
//!
//! ## Base Images
//!
//! Base images enter the store through [`ImageStore::import_base`], which
//! wraps a root filesystem archive as a single-layer image tagged with its
//! pinned reference. Builds resolve their base only from the local store.

use crate::constants::{
    DEFAULT_PATH, IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN, MAX_LAYERS, MAX_ROOTFS_SIZE,
    OCI_IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE, REFS_DIR, REFS_INDEX_FILE,
};
use crate::error::{Error, Result};
use crate::layer::{LayerDescriptor, PackedLayer};
use crate::reference::{ImageReference, Pin};
use crate::storage::{BlobStore, GcStats};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

// =============================================================================
// OCI Image Types
// =============================================================================

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// Blob digest.
    pub digest: String,
    /// Blob size in bytes.
    pub size: u64,
}

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2.
    pub schema_version: u32,
    /// Manifest media type.
    pub media_type: String,
    /// Config blob.
    pub config: Descriptor,
    /// Layer blobs, bottom first.
    pub layers: Vec<Descriptor>,
}

/// Empty JSON object, as used by `ExposedPorts` values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Execution parameters recorded in the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// `KEY=value` environment entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Service command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    /// Arguments appended to the entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Advertised ports (`8501/tcp`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Empty>,
    /// Free-form labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Layer chain by uncompressed digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Uncompressed layer digests, bottom first.
    pub diff_ids: Vec<String>,
}

/// One history entry per layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// Creation time.
    pub created: DateTime<Utc>,
    /// What produced the layer.
    pub created_by: String,
}

/// OCI image configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Creation time; pinned for reproducibility.
    pub created: DateTime<Utc>,
    /// CPU architecture (`amd64`, `arm64`).
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Execution parameters.
    #[serde(default)]
    pub config: ContainerConfig,
    /// Layer chain.
    pub rootfs: RootFs,
    /// Layer history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// Returns the OCI architecture name of the host.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// A loaded image.
#[derive(Debug, Clone)]
pub struct StoredImage {
    /// Image id (manifest digest).
    pub digest: String,
    /// Parsed manifest.
    pub manifest: ImageManifest,
    /// Parsed config.
    pub config: ImageConfig,
}

impl StoredImage {
    /// Returns the layer chain with diff ids attached.
    pub fn layers(&self) -> Result<Vec<LayerDescriptor>> {
        let diff_ids = &self.config.rootfs.diff_ids;
        if diff_ids.len() != self.manifest.layers.len() {
            return Err(Error::Serialization(format!(
                "image {} lists {} layers but {} diff ids",
                self.digest,
                self.manifest.layers.len(),
                diff_ids.len()
            )));
        }
        Ok(self
            .manifest
            .layers
            .iter()
            .zip(diff_ids)
            .map(|(d, diff_id)| LayerDescriptor {
                digest: d.digest.clone(),
                diff_id: diff_id.clone(),
                size: d.size,
                media_type: d.media_type.clone(),
            })
            .collect())
    }

    /// Total compressed size of config and layers.
    pub fn size(&self) -> u64 {
        self.manifest.config.size + self.manifest.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

/// Tag listing entry.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    /// Tag name.
    pub tag: String,
    /// Image id.
    pub digest: String,
    /// Compressed size.
    pub size: u64,
    /// Layer count.
    pub layers: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagIndex {
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

// =============================================================================
// Image Store
// =============================================================================

/// Tagged image store over a blob store.
pub struct ImageStore {
    root: PathBuf,
    blobs: Arc<BlobStore>,
    index_lock: Mutex<()>,
}

impl ImageStore {
    /// Opens the store under a hubpack root directory.
    pub fn open(root: &Path) -> Result<Self> {
        let blobs = Arc::new(BlobStore::under_root(root)?);
        Self::with_blobs(root, blobs)
    }

    /// Opens the store with existing blob storage.
    pub fn with_blobs(root: &Path, blobs: Arc<BlobStore>) -> Result<Self> {
        let refs = root.join(REFS_DIR);
        fs::create_dir_all(&refs).map_err(|e| Error::StorageInitFailed {
            path: refs.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            blobs,
            index_lock: Mutex::new(()),
        })
    }

    /// Returns the hubpack root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the underlying blob store.
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(REFS_DIR).join(REFS_INDEX_FILE)
    }

    fn load_index(&self) -> Result<TagIndex> {
        match fs::read(self.index_path()) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TagIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, index: &TagIndex) -> Result<()> {
        let path = self.index_path();
        let data = serde_json::to_vec_pretty(index)?;
        let temp = path.with_extension(format!("json.tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp, &path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            Error::StorageWriteFailed(e.to_string())
        })
    }

    fn update_index(&self, update: impl FnOnce(&mut TagIndex) -> Result<()>) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.load_index()?;
        update(&mut index)?;
        self.save_index(&index)
    }

    /// Loads an image by manifest digest.
    pub fn load(&self, digest: &str) -> Result<StoredImage> {
        let manifest: ImageManifest = serde_json::from_slice(&self.blobs.get_blob(digest)?)?;
        let config: ImageConfig =
            serde_json::from_slice(&self.blobs.get_blob(&manifest.config.digest)?)?;
        Ok(StoredImage {
            digest: digest.to_string(),
            manifest,
            config,
        })
    }

    /// Resolves a tag or image id.
    pub fn resolve(&self, name: &str) -> Result<StoredImage> {
        if name.starts_with("sha256:") && self.blobs.has_blob(name) {
            return self.load(name);
        }
        let index = self.load_index()?;
        let digest = index
            .tags
            .get(name)
            .ok_or_else(|| Error::ImageNotFound(name.to_string()))?;
        self.load(digest)
    }

    /// Resolves a pinned base reference.
    ///
    /// A digest-pinned reference also matches an image whose id equals the
    /// digest.
    pub fn resolve_base(&self, reference: &ImageReference) -> Result<StoredImage> {
        let by_tag = self.resolve(&reference.to_string());
        match (by_tag, reference.pin()) {
            (Ok(image), _) => Ok(image),
            (Err(_), Pin::Digest(digest)) if self.blobs.has_blob(digest) => self.load(digest),
            (Err(_), _) => Err(Error::BaseImageNotFound(reference.to_string())),
        }
    }

    /// Writes config and manifest blobs for a layer chain and tags the
    /// result. Returns the image id.
    pub fn commit(&self, tag: &str, layers: &[LayerDescriptor], config: &ImageConfig) -> Result<String> {
        validate_tag(tag)?;
        if layers.len() > MAX_LAYERS {
            return Err(Error::StorageWriteFailed(format!(
                "image has {} layers, limit is {}",
                layers.len(),
                MAX_LAYERS
            )));
        }
        let diff_ids: Vec<&String> = layers.iter().map(|l| &l.diff_id).collect();
        if config.rootfs.diff_ids.iter().collect::<Vec<_>>() != diff_ids {
            return Err(Error::Serialization(
                "config rootfs does not match the layer chain".to_string(),
            ));
        }

        let config_bytes = serde_json::to_vec(config)?;
        let config_digest = self.blobs.put_bytes(&config_bytes)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_bytes.len() as u64,
            },
            layers: layers
                .iter()
                .map(|l| Descriptor {
                    media_type: l.media_type.clone(),
                    digest: l.digest.clone(),
                    size: l.size,
                })
                .collect(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = self.blobs.put_bytes(&manifest_bytes)?;

        self.tag(tag, &digest)?;
        Ok(digest)
    }

    /// Points a tag at an existing image.
    pub fn tag(&self, tag: &str, digest: &str) -> Result<()> {
        validate_tag(tag)?;
        if !self.blobs.has_blob(digest) {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        }
        self.update_index(|index| {
            index.tags.insert(tag.to_string(), digest.to_string());
            Ok(())
        })?;
        info!("Tagged {} as {}", digest, tag);
        Ok(())
    }

    /// Removes a tag. Blobs are left for [`ImageStore::gc`].
    pub fn untag(&self, tag: &str) -> Result<String> {
        let mut removed = None;
        self.update_index(|index| {
            removed = index.tags.remove(tag);
            Ok(())
        })?;
        let digest = removed.ok_or_else(|| Error::ImageNotFound(tag.to_string()))?;
        info!("Untagged {} ({})", tag, digest);
        Ok(digest)
    }

    /// Lists tagged images, sorted by tag.
    pub fn list(&self) -> Result<Vec<ImageSummary>> {
        let index = self.load_index()?;
        let mut out = Vec::with_capacity(index.tags.len());
        for (tag, digest) in index.tags {
            let image = self.load(&digest)?;
            out.push(ImageSummary {
                size: image.size(),
                layers: image.manifest.layers.len(),
                tag,
                digest,
            });
        }
        Ok(out)
    }

    /// Returns every blob reachable from a tag, plus the image ids.
    pub fn referenced_blobs(&self) -> Result<(HashSet<String>, HashSet<String>)> {
        let index = self.load_index()?;
        let mut blobs = HashSet::new();
        let mut images = HashSet::new();
        for digest in index.tags.values() {
            let image = self.load(digest)?;
            blobs.insert(digest.clone());
            blobs.insert(image.manifest.config.digest.clone());
            blobs.extend(image.manifest.layers.iter().map(|l| l.digest.clone()));
            images.insert(digest.clone());
        }
        Ok((blobs, images))
    }

    /// Removes blobs unreachable from any tag.
    pub fn gc(&self) -> Result<GcStats> {
        let (referenced, _) = self.referenced_blobs()?;
        self.blobs.gc(&referenced)
    }

    /// Imports a root filesystem archive (tar or tar.gz) as a base image.
    ///
    /// The result is a single-layer image tagged with the reference.
    pub fn import_base(&self, reference: &ImageReference, archive: &Path) -> Result<String> {
        let raw = fs::read(archive).map_err(|_| Error::InputMissing {
            name: "base archive".to_string(),
            path: archive.to_path_buf(),
        })?;

        let tar = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut out = Vec::new();
            GzDecoder::new(&raw[..])
                .take(MAX_ROOTFS_SIZE + 1)
                .read_to_end(&mut out)
                .map_err(|e| Error::LayerExtractionFailed {
                    digest: archive.display().to_string(),
                    reason: e.to_string(),
                })?;
            out
        } else {
            raw
        };
        if tar.len() as u64 > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: tar.len() as u64,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        let mut entries = 0usize;
        for entry in tar::Archive::new(&tar[..])
            .entries()
            .map_err(|e| Error::LayerExtractionFailed {
                digest: archive.display().to_string(),
                reason: e.to_string(),
            })?
        {
            entry.map_err(|e| Error::LayerExtractionFailed {
                digest: archive.display().to_string(),
                reason: e.to_string(),
            })?;
            entries += 1;
        }
        debug!("Base archive {} has {} entries", archive.display(), entries);

        let layer = PackedLayer::from_tar(&tar)?.store(&self.blobs)?;

        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let config = ImageConfig {
            created: epoch,
            architecture: host_architecture().to_string(),
            os: "linux".to_string(),
            config: ContainerConfig {
                env: vec![format!("PATH={}", DEFAULT_PATH)],
                working_dir: "/".to_string(),
                ..Default::default()
            },
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![layer.diff_id.clone()],
            },
            history: vec![History {
                created: epoch,
                created_by: format!("hubpack import {}", reference),
            }],
        };

        let digest = self.commit(&reference.to_string(), &[layer], &config)?;
        info!("Imported base image {} as {}", reference, digest);
        Ok(digest)
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidImageReference {
        reference: tag.to_string(),
        reason: reason.to_string(),
    };
    if tag.is_empty() {
        return Err(invalid("empty tag"));
    }
    if tag.len() > MAX_IMAGE_REF_LEN {
        return Err(invalid("tag too long"));
    }
    if !tag.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err(invalid("contains invalid characters"));
    }
    if tag.starts_with("sha256:") {
        return Err(invalid("tags must not look like image ids"));
    }
    Ok(())
}
