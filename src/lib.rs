//! # hubpack
//!
//! **Reproducible Layered Image Builder and Process-of-Record Launcher**
//!
//! hubpack builds a content-addressed container image for a single web
//! service and starts that service as the one foreground process of the
//! container, bound to a fixed, documented endpoint (`0.0.0.0:8501` by
//! default).
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             hubpack                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      ImageBuilder                           │    │
//! │  │  BuildFile → Pipeline (DAG) → stages → layers → image       │    │
//! │  │ StageRunner (chroot in base + deps) │ pack_directory (copy) │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │   LayerCache              │            ImageStore         │      │
//! │  │   stage key → layer       │   tags → manifest → config    │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┴───────────────────────────────┐      │
//! │  │               Content-Addressed Storage                   │      │
//! │  │  Digest verification │ Deduplication │ Atomic writes      │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  BundleBuilder (image → rootfs)  →  Launcher (one child process)    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Build Guarantees
//!
//! - **Pinned base**: base references must carry a version tag or digest
//!   and must resolve in the local store before any stage runs.
//! - **Fail fast**: a missing or empty dependency manifest aborts the build
//!   before any stage runs.
//! - **Stage caching**: each stage's cache key covers its definition, its
//!   inputs and its dependencies' keys. Unchanged stages are never re-run.
//! - **Determinism**: layers are packed with sorted entries and zeroed
//!   metadata, so identical inputs yield identical image ids.
//! - **No partial images**: the tag index is replaced atomically after all
//!   blobs are written.
//!
//! # Launch Guarantees
//!
//! - The service receives `--server.port=<port>` and
//!   `--server.address=<address>`.
//! - Its environment is the image's [`RuntimeConfig`], fixed at build time.
//! - Its exit code is the launcher's exit code (`128 + signo` when killed).
//!
//! # Example
//!
//! ```rust,ignore
//! use hubpack::{BuildFile, BuildRequest, ChrootRunner, ImageBuilder, ImageStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> hubpack::Result<()> {
//!     let store = Arc::new(ImageStore::open("/var/lib/hubpack".as_ref())?);
//!     let builder = ImageBuilder::new(store, Arc::new(ChrootRunner::new()))?;
//!     let report = builder
//!         .build(&BuildRequest {
//!             context: ".".into(),
//!             build_file: BuildFile::default(),
//!             tag: None,
//!         })
//!         .await?;
//!     println!("{}", report.image_id);
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod buildfile;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod image;
pub mod launcher;
pub mod layer;
pub mod manifest;
pub mod pipeline;
pub mod reference;
pub mod runner;
pub mod storage;

// Re-exports
pub use builder::{BuildReport, BuildRequest, ImageBuilder, StageReport};
pub use buildfile::BuildFile;
pub use bundle::{Bundle, BundleBuilder};
pub use cache::LayerCache;
pub use config::RuntimeConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use image::{ImageConfig, ImageManifest, ImageStore, StoredImage};
pub use launcher::{
    LaunchOutcome, LaunchOverrides, LaunchSpec, Launcher, ProcessState, spawn_failure_code,
};
pub use layer::{Excludes, LayerDescriptor, PackedLayer, RootfsSnapshot};
pub use manifest::{DependencyManifest, Requirement};
pub use pipeline::{Pipeline, Stage, StageKey, StageKind};
pub use reference::{ImageReference, Pin};
pub use runner::{ChrootRunner, RunInvocation, StageRunner};
pub use storage::BlobStore;
