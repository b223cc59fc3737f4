//! # Build File
//!
//! The build definition is a TOML file (`hubpack.toml`) in the build
//! context. Every field has a default, so an absent file or an empty one
//! describes the stock data import hub image:
//!
//! ```toml
//! [image]
//! base = "python:3.11-slim"
//! workdir = "/app"
//! tag = "data-import-hub:0.1.0"
//!
//! [system]
//! packages = ["tesseract-ocr", "libgl1", "libglib2.0-0", "..."]
//!
//! [dependencies]
//! manifest = "requirements.txt"
//!
//! [config]
//! dir = ".streamlit"
//!
//! [source]
//! dir = "."
//! exclude = ["__pycache__", "*.pyc"]
//!
//! [env]
//! TZ = "UTC"
//!
//! [launch]
//! command = ["streamlit", "run", "app.py"]
//! port = 8501
//! address = "0.0.0.0"
//! ```
//!
//! [`BuildFile::plan`] turns the definition into a [`Pipeline`].

use crate::constants::{
    ALWAYS_EXCLUDED, DEFAULT_ADDRESS, DEFAULT_ADDRESS_FLAG, DEFAULT_BASE_IMAGE, DEFAULT_BUILD_FILE,
    DEFAULT_CONFIG_DIR, DEFAULT_ENV, DEFAULT_IMAGE_TAG, DEFAULT_MANIFEST, DEFAULT_PORT,
    DEFAULT_PORT_FLAG, DEFAULT_SYSTEM_CLEANUP, DEFAULT_SYSTEM_PACKAGES, DEFAULT_WORKDIR,
    IGNORE_FILE,
};
use crate::error::{Error, Result};
use crate::layer::Excludes;
use crate::pipeline::{Pipeline, Stage, StageKind, names};
use crate::reference::ImageReference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// A complete build definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildFile {
    /// Base image, working directory and output tag.
    pub image: ImageSection,
    /// OS package stage.
    pub system: SystemSection,
    /// Dependency installation stage.
    pub dependencies: DependenciesSection,
    /// Configuration directory copy stage.
    pub config: ConfigSection,
    /// Application source copy stage.
    pub source: SourceSection,
    /// Extra runtime environment, applied over the fixed defaults.
    pub env: BTreeMap<String, String>,
    /// Service launch parameters.
    pub launch: LaunchSection,
}

/// `[image]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSection {
    /// Pinned base image reference.
    pub base: String,
    /// Working directory inside the image.
    pub workdir: String,
    /// Default tag for the built image.
    pub tag: String,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_IMAGE.to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            tag: DEFAULT_IMAGE_TAG.to_string(),
        }
    }
}

/// `[system]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemSection {
    /// OS packages; an empty list omits the stage.
    pub packages: Vec<String>,
    /// Install command template.
    pub command: Vec<String>,
    /// Rootfs paths removed after install.
    pub cleanup: Vec<String>,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            packages: DEFAULT_SYSTEM_PACKAGES.iter().map(|s| s.to_string()).collect(),
            command: [
                "/bin/sh",
                "-c",
                "export DEBIAN_FRONTEND=noninteractive && apt-get update && \
                 apt-get install --yes --no-install-recommends {packages}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            cleanup: DEFAULT_SYSTEM_CLEANUP.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// `[dependencies]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependenciesSection {
    /// Manifest path relative to the build context.
    pub manifest: String,
    /// Install command template.
    pub command: Vec<String>,
}

impl Default for DependenciesSection {
    fn default() -> Self {
        Self {
            manifest: DEFAULT_MANIFEST.to_string(),
            command: ["pip", "install", "--no-cache-dir", "-r", "{manifest}"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// `[config]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigSection {
    /// Directory relative to the build context.
    pub dir: String,
    /// Destination in the image; defaults to `<workdir>/<dir>`.
    pub dest: Option<String>,
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            dir: DEFAULT_CONFIG_DIR.to_string(),
            dest: None,
        }
    }
}

/// `[source]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    /// Directory relative to the build context.
    pub dir: String,
    /// Destination in the image; defaults to the workdir.
    pub dest: Option<String>,
    /// Exclusion patterns, merged with `.hubpackignore`.
    pub exclude: Vec<String>,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            dir: ".".to_string(),
            dest: None,
            exclude: vec!["__pycache__".to_string(), "*.pyc".to_string()],
        }
    }
}

/// `[launch]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchSection {
    /// Service command, recorded as the image entrypoint.
    pub command: Vec<String>,
    /// Bind address.
    pub address: String,
    /// Bind port; also the exposed port.
    pub port: u16,
    /// Flag carrying the port.
    pub port_flag: String,
    /// Flag carrying the address.
    pub address_flag: String,
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            command: vec!["streamlit".to_string(), "run".to_string(), "app.py".to_string()],
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            port_flag: DEFAULT_PORT_FLAG.to_string(),
            address_flag: DEFAULT_ADDRESS_FLAG.to_string(),
        }
    }
}

impl BuildFile {
    /// Parses a build file from TOML text.
    pub fn from_toml(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidBuildFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Loads a build file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidBuildFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file = Self::from_toml(&text, path)?;
        debug!("Loaded build file {}", path.display());
        Ok(file)
    }

    /// Finds the build file for a context.
    ///
    /// An explicit path must exist. Otherwise `<context>/hubpack.toml` is
    /// used when present, and the built-in defaults when not.
    pub fn discover(context: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = context.join(DEFAULT_BUILD_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            info!(
                "No {} in {}, using built-in defaults",
                DEFAULT_BUILD_FILE,
                context.display()
            );
            Ok(Self::default())
        }
    }

    /// Checks field-level consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidBuildFile {
            path: PathBuf::from(DEFAULT_BUILD_FILE),
            reason,
        };

        ImageReference::parse(&self.image.base)?;

        if !self.image.workdir.starts_with('/') {
            return Err(invalid(format!(
                "image.workdir must be absolute, got '{}'",
                self.image.workdir
            )));
        }
        for (field, dest) in [
            ("config.dest", self.config.dest.as_deref()),
            ("source.dest", self.source.dest.as_deref()),
        ] {
            if let Some(dest) = dest
                && !dest.starts_with('/')
            {
                return Err(invalid(format!("{} must be absolute, got '{}'", field, dest)));
            }
        }
        for (field, dir) in [
            ("dependencies.manifest", self.dependencies.manifest.as_str()),
            ("config.dir", self.config.dir.as_str()),
            ("source.dir", self.source.dir.as_str()),
        ] {
            if !is_context_relative(dir) {
                return Err(invalid(format!(
                    "{} must stay inside the build context, got '{}'",
                    field, dir
                )));
            }
        }
        if !self.system.packages.is_empty() && self.system.command.is_empty() {
            return Err(invalid("system.command is empty".to_string()));
        }
        if self.dependencies.command.is_empty() {
            return Err(invalid("dependencies.command is empty".to_string()));
        }
        if self.launch.command.is_empty() {
            return Err(invalid("launch.command is empty".to_string()));
        }
        if self.launch.port == 0 {
            return Err(invalid("launch.port must be non-zero".to_string()));
        }
        self.launch
            .address
            .parse::<IpAddr>()
            .map_err(|_| invalid(format!("launch.address '{}' is not an IP address", self.launch.address)))?;
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(format!("invalid env key '{}'", key)));
            }
        }

        Ok(())
    }

    /// Returns the build-time environment: fixed defaults overlaid with
    /// `[env]`.
    pub fn build_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = DEFAULT_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Destination of the config directory in the image.
    pub fn config_dest(&self) -> String {
        self.config.dest.clone().unwrap_or_else(|| {
            let dir = self.config.dir.trim_start_matches("./").trim_matches('/');
            format!("{}/{}", self.image.workdir.trim_end_matches('/'), dir)
        })
    }

    /// Destination of the source tree in the image.
    pub fn source_dest(&self) -> String {
        self.source
            .dest
            .clone()
            .unwrap_or_else(|| self.image.workdir.clone())
    }

    /// Exclusion patterns for the source copy, relative to the source dir.
    ///
    /// Combines `[source].exclude`, the context's `.hubpackignore`, the
    /// always-excluded paths and, when it lies inside the source tree, the
    /// config directory.
    pub fn source_excludes(&self, context: &Path) -> Result<Vec<String>> {
        let mut patterns: Vec<String> = ALWAYS_EXCLUDED.iter().map(|s| s.to_string()).collect();
        patterns.extend(self.source.exclude.iter().cloned());

        let ignore = context.join(IGNORE_FILE);
        if ignore.is_file() {
            let text = std::fs::read_to_string(&ignore)?;
            patterns.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }

        let source = normalize(&self.source.dir);
        let config = normalize(&self.config.dir);
        if let Ok(rel) = config.strip_prefix(&source)
            && !rel.as_os_str().is_empty()
        {
            patterns.push(rel.to_string_lossy().to_string());
        }

        Ok(patterns)
    }

    /// Returns compiled source excludes.
    pub fn source_exclude_rules(&self, context: &Path) -> Result<Excludes> {
        Ok(Excludes::new(self.source_excludes(context)?))
    }

    /// Builds the stage graph.
    ///
    /// `system` is omitted when no packages are listed; `dependencies` is
    /// then a root stage.
    pub fn plan(&self, context: &Path) -> Result<Pipeline> {
        let env = self.build_env();
        let mut stages = Vec::with_capacity(4);

        let has_system = !self.system.packages.is_empty();
        if has_system {
            stages.push(Stage::new(
                names::SYSTEM,
                StageKind::Run {
                    command: self.system.command.clone(),
                    env: env.clone(),
                    packages: self.system.packages.clone(),
                    manifest: None,
                    cleanup: self.system.cleanup.clone(),
                },
            ));
        }

        let mut dependencies = Stage::new(
            names::DEPENDENCIES,
            StageKind::Run {
                command: self.dependencies.command.clone(),
                env,
                packages: Vec::new(),
                manifest: Some(self.dependencies.manifest.clone()),
                cleanup: Vec::new(),
            },
        );
        if has_system {
            dependencies = dependencies.after(names::SYSTEM);
        }
        stages.push(dependencies);

        stages.push(Stage::new(
            names::CONFIG,
            StageKind::Copy {
                src: self.config.dir.clone(),
                dest: self.config_dest(),
                exclude: Vec::new(),
            },
        ));

        stages.push(
            Stage::new(
                names::SOURCE,
                StageKind::Copy {
                    src: self.source.dir.clone(),
                    dest: self.source_dest(),
                    exclude: self.source_excludes(context)?,
                },
            )
            .after(names::DEPENDENCIES),
        );

        Pipeline::new(stages)
    }
}

fn is_context_relative(path: &str) -> bool {
    let p = Path::new(path);
    !p.as_os_str().is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn normalize(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
