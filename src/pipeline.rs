//! # Build Pipeline
//!
//! An image build is a directed acyclic graph of named stages. Each stage
//! declares its inputs (a command and manifest, or a directory to copy) and
//! the stages it depends on, and produces exactly one layer.
//!
//! ```text
//!   system ──► dependencies ──► source
//!                                        (layer order: system,
//!   config                                dependencies, config, source)
//! ```
//!
//! ## Ordering
//!
//! [`Pipeline::order`] is a topological order in which ties are broken by
//! declaration order, so the layer stack is stable across runs.
//! [`Pipeline::levels`] groups stages by dependency depth; stages within a
//! level are independent and may execute concurrently.
//!
//! ## Cache Keys
//!
//! A stage's cache key ([`StageKey::derive`]) hashes its definition, the
//! digest of its inputs and the keys of the stages it depends on. Root
//! stages additionally hash the base image digest. Editing the source tree
//! therefore changes only the `source` key, while a manifest edit changes
//! `dependencies` and everything downstream of it.

use crate::constants::validate_stage_name;
use crate::error::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Well-known stage names of the stock pipeline.
pub mod names {
    /// OS package installation.
    pub const SYSTEM: &str = "system";
    /// Dependency installation from the manifest.
    pub const DEPENDENCIES: &str = "dependencies";
    /// Static configuration directory copy.
    pub const CONFIG: &str = "config";
    /// Application source copy.
    pub const SOURCE: &str = "source";
}

/// What a stage does.
///
/// Serialized (canonical JSON) as part of the stage cache key, so every
/// field that influences the produced layer must live here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    /// Run a command inside a rootfs built from the base image and the
    /// stage's dependencies; the layer is the filesystem delta it leaves.
    Run {
        /// Command template (see [`crate::runner::expand_argv`]).
        command: Vec<String>,
        /// Environment for the command.
        env: BTreeMap<String, String>,
        /// Packages substituted for `{packages}`.
        packages: Vec<String>,
        /// Manifest path (context-relative) substituted for `{manifest}`.
        manifest: Option<String>,
        /// Rootfs paths removed after the command succeeds (`dir/*` empties
        /// the directory).
        cleanup: Vec<String>,
    },
    /// Copy a context directory into the image.
    Copy {
        /// Context-relative source directory.
        src: String,
        /// Absolute destination in the image.
        dest: String,
        /// Exclusion patterns.
        exclude: Vec<String>,
    },
}

/// A named pipeline node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Unique stage name.
    pub name: String,
    /// What the stage does.
    pub kind: StageKind,
    /// Names of stages that must complete first.
    pub depends_on: Vec<String>,
}

impl Stage {
    /// Creates a stage with no dependencies.
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            depends_on: Vec::new(),
        }
    }

    /// Adds a dependency.
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }
}

/// A validated stage graph.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    order: Vec<usize>,
}

impl Pipeline {
    /// Validates stages and computes the execution order.
    ///
    /// # Errors
    ///
    /// [`Error::PipelineInvalid`] on an invalid or duplicate name, an
    /// unknown or self dependency, or a cycle.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            validate_stage_name(&stage.name)
                .map_err(|r| Error::PipelineInvalid(format!("stage '{}': {}", stage.name, r)))?;
            if index.insert(stage.name.as_str(), i).is_some() {
                return Err(Error::PipelineInvalid(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        let mut indegree = vec![0usize; stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    return Err(Error::PipelineInvalid(format!(
                        "stage '{}' depends on itself",
                        stage.name
                    )));
                }
                let &j = index.get(dep.as_str()).ok_or_else(|| {
                    Error::PipelineInvalid(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    ))
                })?;
                if seen.insert(j) {
                    indegree[i] += 1;
                    dependents[j].push(i);
                }
            }
        }

        // Kahn's algorithm; the ready set is ordered by declaration index.
        let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(stages.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() != stages.len() {
            let stuck: Vec<&str> = stages
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.name.as_str())
                .collect();
            return Err(Error::PipelineInvalid(format!(
                "dependency cycle among stages: {}",
                stuck.join(", ")
            )));
        }

        Ok(Self { stages, order })
    }

    /// Returns stages in declaration order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Looks up a stage by name.
    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns stages in layer order.
    pub fn order(&self) -> Vec<&Stage> {
        self.order.iter().map(|&i| &self.stages[i]).collect()
    }

    /// Returns every stage `name` transitively depends on, in layer order.
    pub fn ancestors(&self, name: &str) -> Vec<&Stage> {
        let mut wanted: BTreeSet<&str> = BTreeSet::new();
        let mut pending: Vec<&str> = self
            .get(name)
            .map(|s| s.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(dep) = pending.pop() {
            if wanted.insert(dep)
                && let Some(stage) = self.get(dep)
            {
                pending.extend(stage.depends_on.iter().map(String::as_str));
            }
        }
        self.order()
            .into_iter()
            .filter(|s| wanted.contains(s.name.as_str()))
            .collect()
    }

    /// Groups stages by dependency depth.
    ///
    /// Every stage's dependencies live in strictly earlier levels. Within a
    /// level, stages keep layer order.
    pub fn levels(&self) -> Vec<Vec<&Stage>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<&Stage>> = Vec::new();

        for stage in self.order() {
            let d = stage
                .depends_on
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(stage.name.as_str(), d);
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(stage);
        }

        levels
    }
}

/// Cache key derivation.
pub struct StageKey;

impl StageKey {
    /// Derives a stage cache key.
    ///
    /// `dependency_keys` must be given in the stage's declared dependency
    /// order. `base_digest` is hashed only for root stages.
    pub fn derive(
        stage: &Stage,
        input_digest: &str,
        dependency_keys: &[&str],
        base_digest: &str,
    ) -> Result<String> {
        let fingerprint = serde_json::to_vec(&stage.kind)?;

        let mut hasher = Sha256::new();
        hasher.update(b"hubpack-stage-v1\n");
        hasher.update(stage.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(&fingerprint);
        hasher.update(b"\n");
        hasher.update(input_digest.as_bytes());
        hasher.update(b"\n");
        if stage.depends_on.is_empty() {
            hasher.update(b"base ");
            hasher.update(base_digest.as_bytes());
            hasher.update(b"\n");
        }
        for key in dependency_keys {
            hasher.update(b"dep ");
            hasher.update(key.as_bytes());
            hasher.update(b"\n");
        }

        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(src: &str) -> StageKind {
        StageKind::Copy {
            src: src.to_string(),
            dest: "/app".to_string(),
            exclude: vec![],
        }
    }

    #[test]
    fn test_tie_break_follows_declaration_order() {
        let pipeline = Pipeline::new(vec![
            Stage::new("b", copy("b")),
            Stage::new("a", copy("a")),
            Stage::new("c", copy("c")).after("a"),
        ])
        .unwrap();

        let names: Vec<&str> = pipeline.order().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_duplicate_dependency_counted_once() {
        let pipeline = Pipeline::new(vec![
            Stage::new("a", copy("a")),
            Stage::new("b", copy("b")).after("a").after("a"),
        ])
        .unwrap();
        assert_eq!(pipeline.order().len(), 2);
    }
}
