//! Tests for build file parsing, validation and planning.

use hubpack::pipeline::names;
use hubpack::{BuildFile, Error, StageKind};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn parse(text: &str) -> hubpack::Result<BuildFile> {
    BuildFile::from_toml(text, Path::new("hubpack.toml"))
}

// =============================================================================
// Defaults
// =============================================================================

#[test]
fn test_empty_file_is_stock_definition() {
    let file = parse("").unwrap();
    assert_eq!(file, BuildFile::default());
    assert_eq!(file.image.base, "python:3.11-slim");
    assert_eq!(file.image.workdir, "/app");
    assert_eq!(file.dependencies.manifest, "requirements.txt");
    assert_eq!(file.launch.port, 8501);
    assert_eq!(file.launch.address, "0.0.0.0");
    assert!(file.validate().is_ok());
}

#[test]
fn test_discover_without_file_uses_defaults() {
    let ctx = TempDir::new().unwrap();
    let file = BuildFile::discover(ctx.path(), None).unwrap();
    assert_eq!(file, BuildFile::default());
}

#[test]
fn test_discover_reads_context_file() {
    let ctx = TempDir::new().unwrap();
    fs::write(
        ctx.path().join("hubpack.toml"),
        "[image]\ntag = \"hub:2.0.0\"\n",
    )
    .unwrap();

    let file = BuildFile::discover(ctx.path(), None).unwrap();
    assert_eq!(file.image.tag, "hub:2.0.0");
    assert_eq!(file.image.base, "python:3.11-slim");
}

#[test]
fn test_discover_explicit_path_must_exist() {
    let ctx = TempDir::new().unwrap();
    let missing = ctx.path().join("other.toml");
    let err = BuildFile::discover(ctx.path(), Some(&missing)).unwrap_err();
    assert!(matches!(err, Error::InvalidBuildFile { .. }));
}

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_parse_full_file() {
    let file = parse(
        r#"
[image]
base = "python:3.12.4-slim"
workdir = "/srv/hub"
tag = "hub:1.0.0"

[system]
packages = ["tesseract-ocr"]

[source]
exclude = ["data"]

[env]
TZ = "UTC"
PYTHONUNBUFFERED = "0"

[launch]
command = ["python", "-m", "streamlit", "run", "main.py"]
port = 9000
"#,
    )
    .unwrap();

    assert!(file.validate().is_ok());
    assert_eq!(file.system.packages, vec!["tesseract-ocr"]);
    assert_eq!(file.source.exclude, vec!["data"]);
    assert_eq!(file.launch.port, 9000);
    assert_eq!(file.launch.port_flag, "--server.port");
    assert_eq!(file.source_dest(), "/srv/hub");
    assert_eq!(file.config_dest(), "/srv/hub/.streamlit");
}

#[test]
fn test_unknown_keys_rejected() {
    let err = parse("[image]\nbase_image = \"python:3.11\"\n").unwrap_err();
    assert!(matches!(err, Error::InvalidBuildFile { reason, .. } if reason.contains("base_image")));

    assert!(parse("[network]\nmode = \"host\"\n").is_err());
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_unpinned_base_rejected() {
    let file = parse("[image]\nbase = \"python:latest\"\n").unwrap();
    assert!(matches!(
        file.validate(),
        Err(Error::UnpinnedImageReference(_))
    ));
}

#[test]
fn test_invalid_fields_rejected() {
    for text in [
        "[image]\nworkdir = \"app\"\n",
        "[config]\ndest = \"relative\"\n",
        "[dependencies]\nmanifest = \"../requirements.txt\"\n",
        "[source]\ndir = \"/abs\"\n",
        "[launch]\ncommand = []\n",
        "[launch]\nport = 0\n",
        "[launch]\naddress = \"localhost\"\n",
        "[dependencies]\ncommand = []\n",
        "[env]\n\"A=B\" = \"x\"\n",
    ] {
        let file = parse(text).unwrap();
        assert!(
            matches!(file.validate(), Err(Error::InvalidBuildFile { .. })),
            "{:?} should fail validation",
            text
        );
    }
}

// =============================================================================
// Environment
// =============================================================================

#[test]
fn test_build_env_extends_defaults() {
    let file = parse("[env]\nTZ = \"UTC\"\nPYTHONUNBUFFERED = \"0\"\n").unwrap();
    let env = file.build_env();

    assert_eq!(env.get("TZ").map(String::as_str), Some("UTC"));
    assert_eq!(env.get("PYTHONUNBUFFERED").map(String::as_str), Some("0"));
    assert_eq!(env.get("PYTHONDONTWRITEBYTECODE").map(String::as_str), Some("1"));
    assert_eq!(env.get("PIP_NO_CACHE_DIR").map(String::as_str), Some("1"));
}

// =============================================================================
// Source Excludes
// =============================================================================

#[test]
fn test_source_excludes_merge_ignore_file_and_config_dir() {
    let ctx = TempDir::new().unwrap();
    fs::write(ctx.path().join(".hubpackignore"), "# local data\ndata/\n\nnotebooks\n").unwrap();

    let file = BuildFile::default();
    let rules = file.source_exclude_rules(ctx.path()).unwrap();

    assert!(rules.matches("data/raw.csv"));
    assert!(rules.matches("notebooks"));
    assert!(rules.matches(".streamlit/config.toml"));
    assert!(rules.matches("hubpack.toml"));
    assert!(rules.matches("pages/__pycache__"));
    assert!(rules.matches("util.pyc"));
    assert!(!rules.matches("app.py"));
}

#[test]
fn test_config_dir_outside_source_not_excluded() {
    let ctx = TempDir::new().unwrap();
    let file = parse("[source]\ndir = \"src\"\n[config]\ndir = \"conf\"\n").unwrap();

    let patterns = file.source_excludes(ctx.path()).unwrap();
    assert!(!patterns.iter().any(|p| p == "conf"));
}

// =============================================================================
// Planning
// =============================================================================

#[test]
fn test_plan_stage_definitions() {
    let ctx = TempDir::new().unwrap();
    let file = BuildFile::default();
    let pipeline = file.plan(ctx.path()).unwrap();

    match &pipeline.get(names::DEPENDENCIES).unwrap().kind {
        StageKind::Run { manifest, env, .. } => {
            assert_eq!(manifest.as_deref(), Some("requirements.txt"));
            assert_eq!(env.get("PIP_NO_CACHE_DIR").map(String::as_str), Some("1"));
        }
        other => panic!("unexpected kind: {:?}", other),
    }

    match &pipeline.get(names::CONFIG).unwrap().kind {
        StageKind::Copy { src, dest, .. } => {
            assert_eq!(src, ".streamlit");
            assert_eq!(dest, "/app/.streamlit");
        }
        other => panic!("unexpected kind: {:?}", other),
    }

    let source = pipeline.get(names::SOURCE).unwrap();
    assert_eq!(source.depends_on, vec![names::DEPENDENCIES.to_string()]);
}
