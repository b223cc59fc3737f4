//! # Image Builder
//!
//! Turns a build context and a [`BuildFile`] into a tagged image.
//!
//! ## Build Sequence
//!
//! ```text
//! validate build file
//!   → resolve base image          (BaseImageNotFound: nothing has run)
//!   → check manifest + config dir (ManifestMissing/Empty, InputMissing)
//!   → plan stage DAG
//!   → for each level: run stages concurrently, reusing cached layers
//!   → write config blob → write manifest blob → update tag index
//! ```
//!
//! ## Run Stages
//!
//! A run stage executes inside a rootfs extracted from the base image
//! layers followed by the layers of every stage it depends on. The rootfs
//! is snapshotted, the command runs through the [`StageRunner`], cleanup
//! paths are applied, and the stage's layer is the difference against the
//! snapshot. Scratch and host-provided paths ([`STAGE_TRANSIENT_PATHS`])
//! never enter a layer. The dependency manifest is visible to the command
//! under `/.hubpack/`.
//!
//! Every failure before the final index update leaves existing tags as
//! they were. Stage results that completed before a failure stay in the
//! layer cache and are reused by the next attempt.
//!
//! ## Reproducibility
//!
//! Layers are packed deterministically, the image `created` timestamp
//! comes from `SOURCE_DATE_EPOCH` (or the Unix epoch), and labels and env
//! are ordered maps. Building unchanged inputs twice yields the same image
//! id without executing any stage the second time.

use crate::buildfile::BuildFile;
use crate::cache::LayerCache;
use crate::config::RuntimeConfig;
use crate::constants::{
    LABEL_ADDRESS, LABEL_ADDRESS_FLAG, LABEL_BASE, LABEL_PORT, LABEL_PORT_FLAG, LABEL_STAGE_PREFIX,
    STAGE_INPUT_DIR, STAGE_TRANSIENT_PATHS, TMP_DIR,
};
use crate::error::{Error, Result};
use crate::image::{ContainerConfig, Empty, History, ImageConfig, ImageStore, RootFs, StoredImage};
use crate::layer::{
    Excludes, LayerDescriptor, PackedLayer, RootfsSnapshot, extract_layers_to_rootfs, pack_changes,
    pack_directory, tree_digest,
};
use crate::manifest::DependencyManifest;
use crate::pipeline::{Stage, StageKey, StageKind};
use crate::reference::ImageReference;
use crate::runner::{ArgVars, RunInvocation, StageRunner, expand_argv, remove_cleanup_paths};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Environment variable pinning the image creation time.
pub const SOURCE_DATE_EPOCH_ENV: &str = "SOURCE_DATE_EPOCH";

/// Inputs of one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Build context directory.
    pub context: PathBuf,
    /// Build definition.
    pub build_file: BuildFile,
    /// Output tag; defaults to `[image].tag`.
    pub tag: Option<String>,
}

/// Outcome of one stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Stage cache key.
    pub cache_key: String,
    /// Produced (or reused) layer.
    pub layer: LayerDescriptor,
    /// True if the layer came from the cache.
    pub cached: bool,
}

/// Outcome of a build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Image id (manifest digest).
    pub image_id: String,
    /// Tag written.
    pub tag: String,
    /// Stage outcomes in layer order.
    pub stages: Vec<StageReport>,
}

impl BuildReport {
    /// Names of stages that actually executed.
    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| !s.cached)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns a stage report by name.
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Per-build state shared by concurrently running stages.
struct BuildContext {
    context: PathBuf,
    base_digest: String,
    base_env: Vec<String>,
    manifest: DependencyManifest,
}

/// Staging directory removed on drop.
struct StagingDir(PathBuf);

impl StagingDir {
    fn create(tmp_dir: &Path, stage: &str) -> Result<Self> {
        let path = tmp_dir.join(format!("{}-{}", stage, uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            warn!("Failed to remove staging dir {}: {}", self.0.display(), e);
        }
    }
}

/// Builds images from build files.
pub struct ImageBuilder {
    store: Arc<ImageStore>,
    cache: LayerCache,
    runner: Arc<dyn StageRunner>,
    tmp_dir: PathBuf,
}

impl ImageBuilder {
    /// Creates a builder over an image store.
    ///
    /// The stage cache and staging area live under the store's root.
    pub fn new(store: Arc<ImageStore>, runner: Arc<dyn StageRunner>) -> Result<Self> {
        let cache = LayerCache::under_root(store.root())?;
        let tmp_dir = store.root().join(TMP_DIR);
        std::fs::create_dir_all(&tmp_dir).map_err(|e| Error::StorageInitFailed {
            path: tmp_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            store,
            cache,
            runner,
            tmp_dir,
        })
    }

    /// Returns the image store.
    pub fn store(&self) -> &Arc<ImageStore> {
        &self.store
    }

    /// Returns the stage cache.
    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Runs a build.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildReport> {
        let file = &request.build_file;
        file.validate()?;

        let context = request
            .context
            .canonicalize()
            .map_err(|_| Error::InputMissing {
                name: "build context".to_string(),
                path: request.context.clone(),
            })?;
        let tag = request.tag.clone().unwrap_or_else(|| file.image.tag.clone());

        let base_ref = ImageReference::parse(&file.image.base)?;
        let base = self.store.resolve_base(&base_ref)?;
        info!("Base image {} resolved to {}", base_ref, base.digest);

        let manifest = DependencyManifest::load(&context.join(&file.dependencies.manifest))?;
        info!(
            "Dependency manifest {} lists {} packages",
            file.dependencies.manifest,
            manifest.packages().count()
        );
        for (name, dir) in [
            ("config directory", &file.config.dir),
            ("source directory", &file.source.dir),
        ] {
            let path = context.join(dir);
            if !path.is_dir() {
                return Err(Error::InputMissing {
                    name: name.to_string(),
                    path,
                });
            }
        }

        let pipeline = file.plan(&context)?;
        let ctx = BuildContext {
            context,
            base_digest: base.digest.clone(),
            base_env: base.config.config.env.clone(),
            manifest,
        };
        let base_layers = base.layers()?;

        let mut keys: HashMap<String, String> = HashMap::new();
        let mut reports: HashMap<String, StageReport> = HashMap::new();
        for (depth, level) in pipeline.levels().into_iter().enumerate() {
            debug!(
                "Level {}: {}",
                depth,
                level.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
            );
            let runs = level.iter().map(|stage| {
                let dep_keys: Vec<String> = stage
                    .depends_on
                    .iter()
                    .filter_map(|d| keys.get(d).cloned())
                    .collect();
                let mut lower = base_layers.clone();
                lower.extend(
                    pipeline
                        .ancestors(&stage.name)
                        .iter()
                        .filter_map(|a| reports.get(&a.name))
                        .map(|r| r.layer.clone()),
                );
                self.run_stage(stage, &ctx, dep_keys, lower)
            });
            for report in try_join_all(runs).await? {
                keys.insert(report.name.clone(), report.cache_key.clone());
                reports.insert(report.name.clone(), report);
            }
        }

        let stages: Vec<StageReport> = pipeline
            .order()
            .iter()
            .filter_map(|s| reports.remove(&s.name))
            .collect();

        let mut layers = base_layers;
        layers.extend(stages.iter().map(|s| s.layer.clone()));

        let config = image_config(file, &base_ref, &base, &stages, &layers);
        let image_id = self.store.commit(&tag, &layers, &config)?;

        info!(
            "Built {} ({}); {} of {} stages executed",
            tag,
            image_id,
            stages.iter().filter(|s| !s.cached).count(),
            stages.len()
        );

        Ok(BuildReport {
            image_id,
            tag,
            stages,
        })
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        ctx: &BuildContext,
        dep_keys: Vec<String>,
        lower: Vec<LayerDescriptor>,
    ) -> Result<StageReport> {
        let input_digest = self.input_digest(stage, ctx).await?;
        let dep_refs: Vec<&str> = dep_keys.iter().map(String::as_str).collect();
        let key = StageKey::derive(stage, &input_digest, &dep_refs, &ctx.base_digest)?;

        if let Some(layer) = self.cache.lookup(&key, self.store.blobs()) {
            info!("Stage {}: cached ({})", stage.name, short_key(&key));
            return Ok(StageReport {
                name: stage.name.clone(),
                cache_key: key,
                layer,
                cached: true,
            });
        }

        info!("Stage {}: executing ({})", stage.name, short_key(&key));
        let packed = match &stage.kind {
            StageKind::Run {
                command,
                env,
                packages,
                manifest,
                cleanup,
            } => {
                let staging = StagingDir::create(&self.tmp_dir, &stage.name)?;
                let rootfs = staging.0.join("rootfs");

                let blobs = self.store.blobs().clone();
                let target = rootfs.clone();
                let layer_count = lower.len();
                blocking(&stage.name, move || {
                    extract_layers_to_rootfs(&lower, &target, &blobs)
                })
                .await?;
                debug!("Stage {} rootfs assembled from {} layers", stage.name, layer_count);

                let manifest = match manifest {
                    Some(rel) => Some(stage_input(&rootfs, &ctx.context.join(rel))?),
                    None => None,
                };

                let transient = transient_excludes();
                let root = rootfs.clone();
                let excludes = transient.clone();
                let snapshot = blocking(&stage.name, move || RootfsSnapshot::capture(&root, &excludes)).await?;

                let vars = ArgVars {
                    manifest,
                    packages: packages.clone(),
                };
                let invocation = RunInvocation {
                    stage: stage.name.clone(),
                    argv: expand_argv(command, &vars),
                    env: RuntimeConfig::compose(&ctx.base_env, env)
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    rootfs: rootfs.clone(),
                    workdir: PathBuf::from("/"),
                };
                debug!("Stage {} runs via {} runner", stage.name, self.runner.name());
                self.runner.run(&invocation).await?;
                remove_cleanup_paths(&rootfs, cleanup)?;

                let name = stage.name.clone();
                let packed = blocking(&stage.name, move || {
                    pack_changes(&name, &rootfs, &snapshot, &transient)
                })
                .await?;
                drop(staging);
                packed
            }
            StageKind::Copy { src, dest, exclude } => {
                let dir = ctx.context.join(src);
                let dest = dest.clone();
                let excludes = Excludes::new(exclude);
                let name = stage.name.clone();
                blocking(&stage.name, move || pack_directory(&name, &dir, &dest, &excludes)).await?
            }
        };

        let layer = self.store_layer(packed)?;
        self.cache.record(&key, &stage.name, &layer)?;
        info!(
            "Stage {}: layer {} ({} bytes)",
            stage.name, layer.digest, layer.size
        );

        Ok(StageReport {
            name: stage.name.clone(),
            cache_key: key,
            layer,
            cached: false,
        })
    }

    async fn input_digest(&self, stage: &Stage, ctx: &BuildContext) -> Result<String> {
        match &stage.kind {
            StageKind::Run {
                manifest: Some(_), ..
            } => Ok(ctx.manifest.digest().to_string()),
            StageKind::Run { .. } => Ok("none".to_string()),
            StageKind::Copy { src, exclude, .. } => {
                let dir = ctx.context.join(src);
                let excludes = Excludes::new(exclude);
                blocking(&stage.name, move || tree_digest(&dir, &excludes)).await
            }
        }
    }

    fn store_layer(&self, packed: PackedLayer) -> Result<LayerDescriptor> {
        packed.store(self.store.blobs())
    }
}

async fn blocking<T, F>(stage: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::StageFailed {
            stage: stage.to_string(),
            reason: format!("worker task failed: {}", e),
        })?
}

fn transient_excludes() -> Excludes {
    let mut excludes = Excludes::default();
    for path in STAGE_TRANSIENT_PATHS {
        excludes.add_anchored(path);
    }
    excludes
}

/// Copies a build input into the stage rootfs and returns its path as the
/// command sees it.
fn stage_input(rootfs: &Path, source: &Path) -> Result<String> {
    let dir = rootfs.join(STAGE_INPUT_DIR);
    if let Ok(meta) = std::fs::symlink_metadata(&dir)
        && !meta.is_dir()
    {
        std::fs::remove_file(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string());
    let target = dir.join(&name);
    if std::fs::symlink_metadata(&target).is_ok() {
        std::fs::remove_file(&target)?;
    }
    std::fs::copy(source, &target)?;
    Ok(format!("/{}/{}", STAGE_INPUT_DIR, name))
}

fn short_key(key: &str) -> &str {
    key.get(7..19).unwrap_or(key)
}

/// Returns the reproducible image creation time.
///
/// Honors `SOURCE_DATE_EPOCH`; falls back to the Unix epoch.
pub fn build_timestamp() -> DateTime<Utc> {
    std::env::var(SOURCE_DATE_EPOCH_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn image_config(
    file: &BuildFile,
    base_ref: &ImageReference,
    base: &StoredImage,
    stages: &[StageReport],
    layers: &[LayerDescriptor],
) -> ImageConfig {
    let created = build_timestamp();
    let launch = &file.launch;
    let runtime = RuntimeConfig::compose(&base.config.config.env, &file.build_env());

    let mut labels = base.config.config.labels.clone();
    labels.insert(LABEL_PORT_FLAG.to_string(), launch.port_flag.clone());
    labels.insert(LABEL_ADDRESS_FLAG.to_string(), launch.address_flag.clone());
    labels.insert(LABEL_PORT.to_string(), launch.port.to_string());
    labels.insert(LABEL_ADDRESS.to_string(), launch.address.clone());
    labels.insert(LABEL_BASE.to_string(), base_ref.to_string());
    for stage in stages {
        labels.insert(
            format!("{}{}", LABEL_STAGE_PREFIX, stage.name),
            stage.cache_key.clone(),
        );
    }

    let mut exposed_ports = BTreeMap::new();
    exposed_ports.insert(format!("{}/tcp", launch.port), Empty {});

    let mut history = base.config.history.clone();
    history.extend(stages.iter().map(|s| History {
        created,
        created_by: format!("hubpack stage {} {}", s.name, s.cache_key),
    }));

    ImageConfig {
        created,
        architecture: base.config.architecture.clone(),
        os: base.config.os.clone(),
        config: ContainerConfig {
            env: runtime.to_env_list(),
            entrypoint: launch.command.clone(),
            cmd: vec![
                format!("{}={}", launch.port_flag, launch.port),
                format!("{}={}", launch.address_flag, launch.address),
            ],
            working_dir: file.image.workdir.clone(),
            exposed_ports,
            labels,
        },
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids: layers.iter().map(|l| l.diff_id.clone()).collect(),
        },
        history,
    }
}
