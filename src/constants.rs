//! # Build and Launch Constants
//!
//! Defines resource limits, storage layout, media types and the defaults of
//! the stock build definition. These constants are the **single source of
//! truth** for bounds used throughout the codebase.
//!
//! ## Cross-References
//!
//! - [`crate::layer`]: Uses size limits for packing and extraction
//! - [`crate::reference`]: Uses reference length and character allowlist
//! - [`crate::storage`]: Uses the blob directory layout
//! - [`crate::buildfile`]: Uses the stock defaults
//! - [`crate::launcher`]: Uses the bind defaults

// =============================================================================
// Size Limits
// =============================================================================
//
// Limits bound the disk and memory used by a single build or extraction.
// Layers are held in memory while being hashed, so MAX_LAYER_SIZE also caps
// peak memory per concurrently executing stage.
// =============================================================================

/// Maximum image reference length in bytes.
///
/// **Security**: Prevents pathological references from reaching the store
/// index or filesystem paths.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (2 GiB).
///
/// **Rationale**: Dependency layers of data-science stacks (pandas, OpenCV)
/// routinely exceed 500 MiB uncompressed; 2 GiB compressed leaves headroom.
pub const MAX_LAYER_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Maximum total extracted rootfs size (8 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum number of layers in an image (base layers included).
pub const MAX_LAYERS: usize = 128;

/// Maximum dependency manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Storage Paths
// =============================================================================
//
// Subdirectories of the hubpack root (default `~/.hubpack`).
// =============================================================================

/// Subdirectory for content-addressed blobs.
///
/// Structure: `blobs/sha256/<2-char-prefix>/<full-hash>`
pub const BLOB_STORE_DIR: &str = "blobs";

/// Subdirectory for stage cache records.
///
/// Structure: `cache/stages/<cache-key-hex>.json`
pub const STAGE_CACHE_DIR: &str = "cache/stages";

/// Subdirectory holding the tag index.
pub const REFS_DIR: &str = "refs";

/// File name of the tag index inside [`REFS_DIR`].
pub const REFS_INDEX_FILE: &str = "index.json";

/// Subdirectory for materialized bundles.
///
/// Structure: `bundles/<digest>/rootfs/`
pub const BUNDLE_DIR: &str = "bundles";

/// Subdirectory for per-stage staging directories.
pub const TMP_DIR: &str = "tmp";

/// Name of the root directory under the user's home.
pub const DEFAULT_ROOT_DIR_NAME: &str = ".hubpack";

/// Environment variable overriding the root directory.
pub const ROOT_ENV_VAR: &str = "HUBPACK_ROOT";

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Config media type.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (gzip-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

// =============================================================================
// Build Defaults
// =============================================================================
//
// The stock build definition reproduces the original container definition of
// the data import hub: a slim Python base, OCR and OpenCV system libraries,
// pinned pip requirements, the Streamlit config directory and the app source.
// =============================================================================

/// Default build file name, looked up in the build context.
pub const DEFAULT_BUILD_FILE: &str = "hubpack.toml";

/// Default ignore file name, looked up in the build context.
pub const IGNORE_FILE: &str = ".hubpackignore";

/// Default base runtime image.
pub const DEFAULT_BASE_IMAGE: &str = "python:3.11-slim";

/// Default tag for built images.
pub const DEFAULT_IMAGE_TAG: &str = "data-import-hub:0.1.0";

/// Default working directory inside the image.
pub const DEFAULT_WORKDIR: &str = "/app";

/// Default dependency manifest path, relative to the build context.
pub const DEFAULT_MANIFEST: &str = "requirements.txt";

/// Default static configuration directory, relative to the build context.
pub const DEFAULT_CONFIG_DIR: &str = ".streamlit";

/// Default OS packages installed by the system stage.
pub const DEFAULT_SYSTEM_PACKAGES: &[&str] = &[
    "tesseract-ocr",
    "libgl1",
    "libglib2.0-0",
    "default-libmysqlclient-dev",
    "build-essential",
    "pkg-config",
];

/// Package-manager state removed after the system stage.
///
/// Glob entries (`dir/*`, `dir/*.deb`) remove matching children and keep the
/// directory itself.
pub const DEFAULT_SYSTEM_CLEANUP: &[&str] = &["var/lib/apt/lists/*", "var/cache/apt/archives/*.deb"];

/// Paths never copied by the source stage.
pub const ALWAYS_EXCLUDED: &[&str] = &[".git", DEFAULT_BUILD_FILE, IGNORE_FILE];

// =============================================================================
// Stage Execution
// =============================================================================
//
// Run stages execute inside a rootfs assembled from the base image and
// earlier stage layers. The paths below are scratch or host-provided while
// a stage runs and are never captured into its layer.
// =============================================================================

/// Rootfs directory holding stage inputs such as the dependency manifest.
pub const STAGE_INPUT_DIR: &str = ".hubpack";

/// Host directories bind-mounted into the stage rootfs.
pub const STAGE_BIND_MOUNTS: &[&str] = &["/dev", "/proc"];

/// Host files copied into the stage rootfs for name resolution.
pub const STAGE_HOST_FILES: &[&str] = &["/etc/resolv.conf", "/etc/hosts"];

/// Rootfs paths excluded from change capture.
pub const STAGE_TRANSIENT_PATHS: &[&str] = &[
    STAGE_INPUT_DIR,
    "dev",
    "proc",
    "sys",
    "tmp",
    "etc/resolv.conf",
    "etc/hosts",
];

// =============================================================================
// Launch Defaults
// =============================================================================

/// Documented service port, advertised as `8501/tcp`.
pub const DEFAULT_PORT: u16 = 8501;

/// Default bind address.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

/// Flag forwarded to the service carrying the bind port.
pub const DEFAULT_PORT_FLAG: &str = "--server.port";

/// Flag forwarded to the service carrying the bind address.
pub const DEFAULT_ADDRESS_FLAG: &str = "--server.address";

/// PATH applied when neither the base image nor the build file set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Process-wide toggles fixed at build time.
///
/// Bytecode-cache suppression, unbuffered output and dependency-manager
/// cache suppression.
pub const DEFAULT_ENV: &[(&str, &str)] = &[
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONUNBUFFERED", "1"),
    ("PIP_NO_CACHE_DIR", "1"),
];

// =============================================================================
// Image Labels
// =============================================================================

/// Label carrying the flag name used to forward the bind port.
pub const LABEL_PORT_FLAG: &str = "io.hubpack.launch.port-flag";

/// Label carrying the flag name used to forward the bind address.
pub const LABEL_ADDRESS_FLAG: &str = "io.hubpack.launch.address-flag";

/// Label carrying the default bind port.
pub const LABEL_PORT: &str = "io.hubpack.launch.port";

/// Label carrying the default bind address.
pub const LABEL_ADDRESS: &str = "io.hubpack.launch.address";

/// Prefix of labels recording each stage's cache key.
pub const LABEL_STAGE_PREFIX: &str = "io.hubpack.stage.";

/// Label carrying the base image reference.
pub const LABEL_BASE: &str = "io.hubpack.base";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`, `/`, `:`, `@`
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";

/// Valid characters for stage names.
pub const STAGE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum stage name length.
pub const MAX_STAGE_NAME_LEN: usize = 64;

/// Validates a stage name for use in labels and logs.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked"]
pub fn validate_stage_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("stage name cannot be empty");
    }
    if name.len() > MAX_STAGE_NAME_LEN {
        return Err("stage name exceeds maximum length");
    }
    if !name.chars().all(|c| STAGE_NAME_VALID_CHARS.contains(c)) {
        return Err("stage name contains invalid characters");
    }
    Ok(())
}
