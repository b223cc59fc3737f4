//! Tests for the stage DAG and cache key derivation.

use hubpack::pipeline::names;
use hubpack::{BuildFile, Error, Pipeline, Stage, StageKey, StageKind};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn copy(src: &str) -> StageKind {
    StageKind::Copy {
        src: src.to_string(),
        dest: "/app".to_string(),
        exclude: vec![],
    }
}

fn run(command: &str) -> StageKind {
    StageKind::Run {
        command: vec![command.to_string()],
        env: BTreeMap::new(),
        packages: vec![],
        manifest: None,
        cleanup: vec![],
    }
}

fn names_of(stages: &[&Stage]) -> Vec<String> {
    stages.iter().map(|s| s.name.clone()).collect()
}

// =============================================================================
// Stock Pipeline
// =============================================================================

#[test]
fn test_stock_pipeline_layer_order() {
    let temp = TempDir::new().unwrap();
    let pipeline = BuildFile::default().plan(temp.path()).unwrap();

    assert_eq!(
        names_of(&pipeline.order()),
        vec!["system", "dependencies", "config", "source"]
    );
}

#[test]
fn test_stock_pipeline_levels() {
    let temp = TempDir::new().unwrap();
    let pipeline = BuildFile::default().plan(temp.path()).unwrap();
    let levels: Vec<Vec<String>> = pipeline.levels().iter().map(|l| names_of(l)).collect();

    assert_eq!(
        levels,
        vec![
            vec!["system".to_string(), "config".to_string()],
            vec!["dependencies".to_string()],
            vec!["source".to_string()],
        ]
    );
}

#[test]
fn test_system_stage_omitted_without_packages() {
    let temp = TempDir::new().unwrap();
    let mut file = BuildFile::default();
    file.system.packages.clear();

    let pipeline = file.plan(temp.path()).unwrap();

    assert!(pipeline.get(names::SYSTEM).is_none());
    assert!(pipeline.get(names::DEPENDENCIES).unwrap().depends_on.is_empty());
    assert_eq!(
        names_of(&pipeline.order()),
        vec!["dependencies", "config", "source"]
    );
}

#[test]
fn test_ancestors_are_transitive_in_layer_order() {
    let ctx = TempDir::new().unwrap();
    let pipeline = BuildFile::default().plan(ctx.path()).unwrap();

    let names_of = |name: &str| -> Vec<String> {
        pipeline
            .ancestors(name)
            .iter()
            .map(|s| s.name.clone())
            .collect()
    };
    assert_eq!(names_of(names::SOURCE), vec!["system", "dependencies"]);
    assert_eq!(names_of(names::DEPENDENCIES), vec!["system"]);
    assert!(names_of(names::SYSTEM).is_empty());
    assert!(names_of(names::CONFIG).is_empty());
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_cycle_rejected() {
    let err = Pipeline::new(vec![
        Stage::new("a", copy("a")).after("c"),
        Stage::new("b", copy("b")).after("a"),
        Stage::new("c", copy("c")).after("b"),
        Stage::new("d", copy("d")),
    ])
    .unwrap_err();

    match err {
        Error::PipelineInvalid(msg) => {
            assert!(msg.contains("cycle"));
            assert!(msg.contains("a, b, c"));
            assert!(!msg.contains(", d"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_unknown_and_self_dependencies_rejected() {
    let unknown = Pipeline::new(vec![Stage::new("a", copy("a")).after("missing")]);
    assert!(matches!(unknown, Err(Error::PipelineInvalid(m)) if m.contains("unknown stage 'missing'")));

    let itself = Pipeline::new(vec![Stage::new("a", copy("a")).after("a")]);
    assert!(matches!(itself, Err(Error::PipelineInvalid(m)) if m.contains("itself")));
}

#[test]
fn test_duplicate_and_invalid_names_rejected() {
    let dup = Pipeline::new(vec![Stage::new("a", copy("a")), Stage::new("a", copy("b"))]);
    assert!(matches!(dup, Err(Error::PipelineInvalid(m)) if m.contains("duplicate")));

    let bad = Pipeline::new(vec![Stage::new("bad name", copy("a"))]);
    assert!(matches!(bad, Err(Error::PipelineInvalid(_))));
}

#[test]
fn test_diamond_levels() {
    let pipeline = Pipeline::new(vec![
        Stage::new("root", run("true")),
        Stage::new("left", run("true")).after("root"),
        Stage::new("right", run("true")).after("root"),
        Stage::new("join", run("true")).after("right").after("left"),
    ])
    .unwrap();

    let levels: Vec<Vec<String>> = pipeline.levels().iter().map(|l| names_of(l)).collect();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[1], vec!["left".to_string(), "right".to_string()]);
}

// =============================================================================
// Cache Keys
// =============================================================================

#[test]
fn test_cache_key_is_stable() {
    let stage = Stage::new("source", copy("."));
    let a = StageKey::derive(&stage, "sha256:in", &[], "sha256:base").unwrap();
    let b = StageKey::derive(&stage, "sha256:in", &[], "sha256:base").unwrap();

    assert_eq!(a, b);
    assert!(a.starts_with("sha256:"));
    assert_eq!(a.len(), "sha256:".len() + 64);
}

#[test]
fn test_cache_key_covers_inputs_definition_and_dependencies() {
    let stage = Stage::new("deps", run("pip")).after("system");
    let base = StageKey::derive(&stage, "sha256:m1", &["sha256:k1"], "sha256:b").unwrap();

    let other_input = StageKey::derive(&stage, "sha256:m2", &["sha256:k1"], "sha256:b").unwrap();
    let other_dep = StageKey::derive(&stage, "sha256:m1", &["sha256:k2"], "sha256:b").unwrap();
    let other_cmd = StageKey::derive(
        &Stage::new("deps", run("uv")).after("system"),
        "sha256:m1",
        &["sha256:k1"],
        "sha256:b",
    )
    .unwrap();

    assert_ne!(base, other_input);
    assert_ne!(base, other_dep);
    assert_ne!(base, other_cmd);
}

#[test]
fn test_base_digest_only_affects_root_stages() {
    let root = Stage::new("system", run("apt-get"));
    assert_ne!(
        StageKey::derive(&root, "none", &[], "sha256:b1").unwrap(),
        StageKey::derive(&root, "none", &[], "sha256:b2").unwrap()
    );

    let child = Stage::new("deps", run("pip")).after("system");
    assert_eq!(
        StageKey::derive(&child, "x", &["sha256:k"], "sha256:b1").unwrap(),
        StageKey::derive(&child, "x", &["sha256:k"], "sha256:b2").unwrap()
    );
}
