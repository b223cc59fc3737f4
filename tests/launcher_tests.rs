//! Tests for the service launcher.
//!
//! Services are stood in for by `/bin/sh -c` scripts. The launcher appends
//! the bind flags, which the shell receives as `$0` and `$1`.

use chrono::{DateTime, Utc};
use hubpack::image::{ContainerConfig, Empty, RootFs};
use hubpack::{
    BuildFile, Error, ImageConfig, LABEL_PORT, LaunchOverrides, LaunchSpec, Launcher,
    ProcessState, RuntimeConfig, spawn_failure_code,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tempfile::TempDir;

fn script(body: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), body.to_string()]
}

fn env(pairs: &[(&str, &str)]) -> RuntimeConfig {
    let vars: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    RuntimeConfig::compose(&[], &vars)
}

async fn run(spec: LaunchSpec) -> (hubpack::Result<hubpack::LaunchOutcome>, ProcessState) {
    let mut launcher = Launcher::new(spec);
    assert_eq!(launcher.state(), ProcessState::Starting);
    let result = launcher.run().await;
    (result, launcher.state())
}

fn image_config(labels: &[(&str, &str)], env: &[&str]) -> ImageConfig {
    let mut exposed_ports = BTreeMap::new();
    exposed_ports.insert("8501/tcp".to_string(), Empty {});
    ImageConfig {
        created: DateTime::<Utc>::UNIX_EPOCH,
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config: ContainerConfig {
            env: env.iter().map(|s| s.to_string()).collect(),
            entrypoint: vec!["streamlit".to_string(), "run".to_string(), "app.py".to_string()],
            working_dir: "/app".to_string(),
            exposed_ports,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        },
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids: vec![],
        },
        history: vec![],
    }
}

// =============================================================================
// Launch Spec
// =============================================================================

#[test]
fn test_default_bind_endpoint() {
    let spec = LaunchSpec::new(vec!["streamlit".to_string()], RuntimeConfig::default()).unwrap();

    assert_eq!(spec.port(), 8501);
    assert_eq!(spec.address(), "0.0.0.0".parse::<IpAddr>().unwrap());
    assert_eq!(
        spec.argv(),
        vec!["streamlit", "--server.port=8501", "--server.address=0.0.0.0"]
    );
}

#[test]
fn test_empty_program_rejected() {
    let err = LaunchSpec::new(vec![], RuntimeConfig::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidLaunchSpec(_)));
}

#[test]
fn test_spec_from_image_applies_overrides() {
    let config = image_config(&[(LABEL_PORT, "8501")], &["PYTHONUNBUFFERED=1", "PATH=/usr/bin"]);
    let overrides = LaunchOverrides {
        port: Some(8600),
        address: Some("127.0.0.1".parse().unwrap()),
    };
    let spec = LaunchSpec::from_image(&config, overrides).unwrap();

    assert_eq!(
        spec.argv(),
        vec![
            "streamlit",
            "run",
            "app.py",
            "--server.port=8600",
            "--server.address=127.0.0.1"
        ]
    );
    assert_eq!(spec.env().get("PYTHONUNBUFFERED"), Some("1"));
    assert_eq!(spec.env().len(), 2);
    assert!(spec.root().is_none());
}

#[test]
fn test_spec_from_image_rejects_bad_labels() {
    let config = image_config(&[(LABEL_PORT, "http")], &[]);
    let err = LaunchSpec::from_image(&config, LaunchOverrides::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidLaunchSpec(_)));
}

#[test]
fn test_spec_from_build_file() {
    let ctx = TempDir::new().unwrap();
    let spec = LaunchSpec::from_build_file(&BuildFile::default(), ctx.path(), LaunchOverrides::default())
        .unwrap();

    assert_eq!(
        spec.argv(),
        vec![
            "streamlit",
            "run",
            "app.py",
            "--server.port=8501",
            "--server.address=0.0.0.0"
        ]
    );
    assert_eq!(spec.env().get("PIP_NO_CACHE_DIR"), Some("1"));
    // The ambient PATH is inherited, not replaced.
    assert_eq!(spec.env().get("PATH"), None);
}

// =============================================================================
// Process Lifecycle
// =============================================================================

#[tokio::test]
async fn test_clean_exit() {
    let spec = LaunchSpec::new(script("exit 0"), env(&[])).unwrap();
    let (result, state) = run(spec).await;

    let outcome = result.unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.signal, None);
    assert_eq!(state, ProcessState::ExitedClean);
}

#[tokio::test]
async fn test_exit_code_propagates() {
    let spec = LaunchSpec::new(script("exit 3"), env(&[])).unwrap();
    let (result, state) = run(spec).await;

    assert_eq!(result.unwrap().exit_code, 3);
    assert_eq!(state, ProcessState::ExitedFailed { code: 3 });
}

#[tokio::test]
async fn test_bind_flags_reach_the_service() {
    let body = r#"test "$0" = "--server.port=9100" && test "$1" = "--server.address=127.0.0.1""#;
    let spec = LaunchSpec::new(script(body), env(&[]))
        .unwrap()
        .with_port(9100)
        .with_address("127.0.0.1".parse().unwrap());

    let (result, _) = run(spec).await;
    assert_eq!(result.unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_custom_flag_names() {
    let body = r#"test "$0" = "--port=8501" && test "$1" = "--host=0.0.0.0""#;
    let spec = LaunchSpec::new(script(body), env(&[]))
        .unwrap()
        .with_flags("--port", "--host");

    let (result, _) = run(spec).await;
    assert_eq!(result.unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_runtime_config_is_the_environment() {
    // HOME is set in the test harness environment but not in the config.
    let body = r#"test "$PYTHONUNBUFFERED" = "1" && test -z "$HOME""#;
    let spec = LaunchSpec::new(script(body), env(&[("PYTHONUNBUFFERED", "1")]))
        .unwrap()
        .isolated();

    let (result, _) = run(spec).await;
    assert_eq!(result.unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_working_directory_applied() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("app.py"), "").unwrap();

    let spec = LaunchSpec::new(script("test -f app.py"), env(&[]))
        .unwrap()
        .with_working_dir(dir.path());

    let (result, _) = run(spec).await;
    assert_eq!(result.unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_port_mismatch_still_launches() {
    let spec = LaunchSpec::new(script("exit 0"), env(&[]))
        .unwrap()
        .with_exposed_port(8501)
        .with_port(9000);

    let (result, _) = run(spec).await;
    assert_eq!(result.unwrap().exit_code, 0);
}

#[tokio::test]
async fn test_missing_working_dir_in_root_is_invalid_spec() {
    let rootfs = TempDir::new().unwrap();
    let spec = LaunchSpec::new(script("exit 0"), env(&[]))
        .unwrap()
        .with_root(rootfs.path())
        .with_working_dir("/app");

    let (result, state) = run(spec).await;
    assert!(matches!(result, Err(Error::InvalidLaunchSpec(msg)) if msg.contains("/app")));
    assert_eq!(state, ProcessState::Starting);
}

#[cfg(unix)]
#[tokio::test]
async fn test_signal_death_maps_to_128_plus_signal() {
    let spec = LaunchSpec::new(script("kill -9 $$"), env(&[])).unwrap();
    let (result, state) = run(spec).await;

    let outcome = result.unwrap();
    assert_eq!(outcome.signal, Some(9));
    assert_eq!(outcome.exit_code, 137);
    assert_eq!(state, ProcessState::ExitedFailed { code: 137 });
}

#[tokio::test]
async fn test_missing_program_is_spawn_failure() {
    let spec = LaunchSpec::new(
        vec!["/nonexistent/hubpack-service".to_string()],
        env(&[]),
    )
    .unwrap();
    let (result, state) = run(spec).await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::SpawnFailed { ref program, .. } if program == "/nonexistent/hubpack-service"));
    assert_eq!(spawn_failure_code(&err), 127);
    assert_eq!(state, ProcessState::ExitedFailed { code: 127 });
}
