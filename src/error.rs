//! Error types for the build and launch layers.

use std::path::PathBuf;

/// Result type alias for hubpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or launching an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Base Image Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image reference does not pin a version.
    #[error("image reference '{0}' is not pinned (use an explicit version tag or digest)")]
    UnpinnedImageReference(String),

    /// Base image could not be resolved in the local store.
    #[error("base image not found: {0}")]
    BaseImageNotFound(String),

    // =========================================================================
    // Dependency Manifest Errors
    // =========================================================================
    /// Manifest file does not exist.
    #[error("dependency manifest not found at {0}")]
    ManifestMissing(PathBuf),

    /// Manifest exists but lists no requirements.
    #[error("dependency manifest at {0} lists no requirements")]
    ManifestEmpty(PathBuf),

    /// Manifest line could not be parsed.
    #[error("dependency manifest line {line}: {reason}")]
    ManifestParse { line: usize, reason: String },

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// Build file is malformed or inconsistent.
    #[error("invalid build file {path}: {reason}")]
    InvalidBuildFile { path: PathBuf, reason: String },

    /// A required build input is missing.
    #[error("build input '{name}' not found at {path}")]
    InputMissing { name: String, path: PathBuf },

    /// Stage graph is invalid (duplicate, unknown dependency, cycle).
    #[error("invalid build pipeline: {0}")]
    PipelineInvalid(String),

    /// A run stage exited unsuccessfully.
    #[error("stage '{stage}' failed: {reason}")]
    StageFailed { stage: String, reason: String },

    /// Packing a directory into a layer failed.
    #[error("failed to pack layer for '{stage}': {reason}")]
    LayerPackFailed { stage: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    /// No image is tagged with this name.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    // =========================================================================
    // Launch Errors
    // =========================================================================
    /// Launch parameters are unusable.
    #[error("invalid launch spec: {0}")]
    InvalidLaunchSpec(String),

    /// The service process could not be started.
    #[error("failed to start '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
