//! # Content-Addressed Blob Storage
//!
//! Stores image layers, image configs and image manifests by their
//! cryptographic digest for deduplication, integrity verification and
//! layer-cache reuse across builds.
//!
//! ## Storage Model
//!
//! Blobs are stored in a two-level directory structure:
//!
//! ```text
//! ~/.hubpack/blobs/
//! └── sha256/
//!     ├── ab/
//!     │   ├── abcd1234...  (blob content)
//!     │   └── ab9f8e7d...  (blob content)
//!     └── cd/
//!         └── cdef5678...  (blob content)
//! ```
//!
//! The first two hex characters form a "shard" directory to prevent
//! filesystem performance degradation with many files.
//!
//! ## Digest Verification
//!
//! [`BlobStore::put_blob`] recomputes the content hash and rejects data that
//! does not match the provided digest. [`BlobStore::put_bytes`] computes the
//! digest itself and returns it.
//!
//! ## Atomic Writes
//!
//! Blobs are written via a uniquely named temp file + rename, so a crashed
//! or failed build never leaves a truncated blob under a valid digest.
//!
//! ## Garbage Collection
//!
//! [`BlobStore::gc`] removes blobs not listed by the caller. The image store
//! computes the referenced set from all tagged manifests.
//!
//! **Warning**: GC is not safe during a concurrent build.

use crate::constants::BLOB_STORE_DIR;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Computes the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Content-addressed blob store.
///
/// `BlobStore` is safe to share between concurrently executing stages. Each
/// blob operation is independent, and identical content written twice ends
/// up as one file.
pub struct BlobStore {
    /// Base directory for blob storage.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store under a hubpack root directory.
    pub fn under_root(root: &Path) -> Result<Self> {
        Self::with_path(root.join(BLOB_STORE_DIR))
    }

    /// Creates a blob store at the specified path.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        debug!("Blob store initialized at: {}", base_dir.display());

        Ok(Self { base_dir })
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Gets a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Returns the size of a stored blob.
    pub fn blob_size(&self, digest: &str) -> Result<u64> {
        fs::metadata(self.blob_path(digest))
            .map(|m| m.len())
            .map_err(|_| Error::BlobNotFound {
                digest: digest.to_string(),
            })
    }

    /// Gets a blob path without reading it.
    ///
    /// # Security
    ///
    /// The digest is sanitized before it becomes a path:
    /// - Algorithm must be sha256, sha384, or sha512
    /// - Hash must contain only hexadecimal characters
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!("Invalid digest algorithm '{}', defaulting to sha256", algo);
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();

        if safe_hash.len() != hash.len() {
            warn!(
                "Digest hash contained non-hex characters, sanitized: {} -> {}",
                hash, safe_hash
            );
        }

        if safe_hash.is_empty() {
            // A path that can never exist
            return self.base_dir.join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir.join(safe_algo).join(prefix).join(&safe_hash)
    }

    /// Stores a blob after verifying its content matches the digest.
    ///
    /// Only SHA-256 digests are accepted.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected_hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        if algo != "sha256" {
            return Err(Error::StorageWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                algo
            )));
        }

        let computed_hash = hex::encode(Sha256::digest(data));

        if computed_hash != expected_hash {
            return Err(Error::StorageWriteFailed(format!(
                "digest mismatch: expected {}, computed {}",
                expected_hash, computed_hash
            )));
        }

        self.write_verified(digest, data)
    }

    /// Stores a blob and returns its computed digest.
    pub fn put_bytes(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_digest(data);
        self.write_verified(&digest, data)?;
        Ok(digest)
    }

    fn write_verified(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);

        if path.exists() {
            debug!("Blob {} already exists", digest);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        // Unique temp names let concurrent writers of the same digest race
        // safely: the rename is atomic and the content is identical.
        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("Stored blob {} ({} bytes, verified)", digest, data.len());
        Ok(())
    }

    /// Removes a blob.
    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Returns the total size of all blobs.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        Self::walk_dir(&self.base_dir, &mut |path| {
            if let Ok(meta) = fs::metadata(path)
                && meta.is_file()
            {
                total += meta.len();
            }
        })?;
        Ok(total)
    }

    /// Lists all blob digests.
    pub fn list_blobs(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();

        let sha256_dir = self.base_dir.join("sha256");
        if sha256_dir.exists() {
            Self::walk_dir(&sha256_dir, &mut |path| {
                if path.is_file()
                    && let Some(hash) = path.file_name().and_then(|n| n.to_str())
                    && hash.chars().all(|c| c.is_ascii_hexdigit())
                {
                    digests.push(format!("sha256:{}", hash));
                }
            })?;
        }

        digests.sort();
        Ok(digests)
    }

    fn walk_dir(dir: &Path, callback: &mut impl FnMut(&Path)) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(dir).map_err(|e| Error::StorageWriteFailed(e.to_string()))? {
            let entry = entry.map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
            let path = entry.path();

            if path.is_dir() {
                Self::walk_dir(&path, callback)?;
            } else {
                callback(&path);
            }
        }

        Ok(())
    }

    /// Garbage collects unreferenced blobs.
    pub fn gc(&self, referenced: &HashSet<String>) -> Result<GcStats> {
        let mut removed = 0u64;
        let mut freed = 0u64;

        for digest in self.list_blobs()? {
            if referenced.contains(&digest) {
                continue;
            }
            let path = self.blob_path(&digest);
            if let Ok(meta) = fs::metadata(&path) {
                freed += meta.len();
                removed += 1;
                let _ = fs::remove_file(&path);
            }
        }

        info!("GC: removed {} blobs, freed {} bytes", removed, freed);
        Ok(GcStats {
            removed_count: removed,
            freed_bytes: freed,
        })
    }
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Number of blobs removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}
