//! # Stage Runners
//!
//! Run stages execute through the [`StageRunner`] trait. For each run stage
//! the builder extracts a root filesystem from the base image layers and the
//! layers of the stages it depends on, snapshots it, hands it to the runner
//! and packs what the command changed as the stage's layer.
//!
//! [`ChrootRunner`] executes the command confined to that rootfs: a private
//! mount namespace with the host's `/dev` and `/proc` bound in, the host's
//! resolver files copied in, then `chroot`. Interpreters, package databases
//! and install prefixes are therefore the base image's, never the build
//! host's. It needs root (or `CAP_SYS_ADMIN` and `CAP_SYS_CHROOT`).
//!
//! ## Placeholders
//!
//! | Placeholder  | Expands to                                       |
//! |--------------|--------------------------------------------------|
//! | `{manifest}` | dependency manifest, as seen inside the rootfs   |
//! | `{packages}` | package list; one argument each when bare        |

use crate::constants::{STAGE_BIND_MOUNTS, STAGE_HOST_FILES};
use crate::error::{Error, Result};
use crate::launcher::confine;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info};

/// Values substituted into command templates.
#[derive(Debug, Clone, Default)]
pub struct ArgVars {
    /// Manifest path inside the rootfs, if the stage has one.
    pub manifest: Option<String>,
    /// Packages for `{packages}`.
    pub packages: Vec<String>,
}

/// Expands placeholders in a command template.
///
/// An argument that is exactly `{packages}` becomes one argument per
/// package; embedded occurrences are joined with spaces.
pub fn expand_argv(template: &[String], vars: &ArgVars) -> Vec<String> {
    let manifest = vars.manifest.clone().unwrap_or_default();
    let packages = vars.packages.join(" ");

    let mut argv = Vec::with_capacity(template.len() + vars.packages.len());
    for arg in template {
        if arg == "{packages}" {
            argv.extend(vars.packages.iter().cloned());
            continue;
        }
        argv.push(
            arg.replace("{manifest}", &manifest)
                .replace("{packages}", &packages),
        );
    }
    argv
}

/// A fully expanded run-stage command.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    /// Stage name.
    pub stage: String,
    /// Program and arguments, with paths as seen inside the rootfs.
    pub argv: Vec<String>,
    /// Complete environment of the command.
    pub env: BTreeMap<String, String>,
    /// Host path of the stage's root filesystem.
    pub rootfs: PathBuf,
    /// Working directory inside the rootfs.
    pub workdir: PathBuf,
}

/// Executes run stages.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &str;

    /// Runs the invocation to completion.
    ///
    /// # Errors
    ///
    /// [`Error::StageFailed`] if the command cannot start or exits
    /// unsuccessfully.
    async fn run(&self, invocation: &RunInvocation) -> Result<()>;
}

/// Runs stage commands chrooted into the stage rootfs.
#[derive(Debug, Clone, Default)]
pub struct ChrootRunner;

impl ChrootRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageRunner for ChrootRunner {
    fn name(&self) -> &str {
        "chroot"
    }

    async fn run(&self, invocation: &RunInvocation) -> Result<()> {
        let failed = |reason: String| Error::StageFailed {
            stage: invocation.stage.clone(),
            reason,
        };

        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| failed("empty command".to_string()))?;

        prepare_rootfs(&invocation.rootfs).map_err(|e| failed(e.to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        confine(&mut cmd, &invocation.rootfs, &invocation.workdir, STAGE_BIND_MOUNTS)
            .map_err(|e| failed(e.to_string()))?;

        info!("[{}] {}", invocation.stage, invocation.argv.join(" "));
        let status = cmd
            .status()
            .await
            .map_err(|e| failed(format!("failed to start '{}': {}", program, e)))?;

        if !status.success() {
            return Err(failed(match status.code() {
                Some(code) => format!("'{}' exited with status {}", program, code),
                None => format!("'{}' was terminated by a signal", program),
            }));
        }

        debug!("[{}] completed", invocation.stage);
        Ok(())
    }
}

/// Creates the bind-mount targets and copies the host's resolver files.
///
/// Every path touched here is excluded from change capture. Existing
/// entries are unlinked rather than written through, so a symlink in the
/// image cannot redirect the copy onto the host.
fn prepare_rootfs(rootfs: &Path) -> std::io::Result<()> {
    for mount in STAGE_BIND_MOUNTS {
        let target = real_dir(rootfs, mount.trim_start_matches('/'))?;
        std::fs::create_dir_all(target)?;
    }
    for file in STAGE_HOST_FILES {
        let host = Path::new(file);
        if !host.is_file() {
            continue;
        }
        let rel = file.trim_start_matches('/');
        if let Some(parent) = Path::new(rel).parent() {
            std::fs::create_dir_all(real_dir(rootfs, &parent.to_string_lossy())?)?;
        }
        let target = rootfs.join(rel);
        if std::fs::symlink_metadata(&target).is_ok() {
            std::fs::remove_file(&target)?;
        }
        std::fs::copy(host, &target)?;
    }
    Ok(())
}

/// Joins `rel` under `rootfs`, refusing symlinked components.
fn real_dir(rootfs: &Path, rel: &str) -> std::io::Result<PathBuf> {
    let mut path = rootfs.to_path_buf();
    for part in rel.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
        if let Ok(meta) = std::fs::symlink_metadata(&path)
            && meta.file_type().is_symlink()
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is a symlink in the stage rootfs", path.display()),
            ));
        }
    }
    Ok(path)
}

/// Applies cleanup paths to a stage rootfs.
///
/// Paths are relative to the rootfs root. `dir/*` empties `dir` and keeps
/// it, `dir/*.ext` removes the matching entries of `dir`, and any other
/// path is removed outright. Paths that would leave the rootfs or pass
/// through a symlink are skipped.
pub fn remove_cleanup_paths(rootfs: &Path, cleanup: &[String]) -> Result<()> {
    for rel in cleanup {
        let rel = rel.trim_start_matches('/');
        let (rel, suffix) = match rel.rsplit_once('/') {
            Some((dir, last)) if last.starts_with('*') => (dir, Some(&last[1..])),
            _ => (rel, None),
        };
        if Path::new(rel)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            debug!("Skipping cleanup path outside the rootfs: {}", rel);
            continue;
        }
        let Ok(path) = real_dir(rootfs, rel) else {
            debug!("Skipping cleanup path through a symlink: {}", rel);
            continue;
        };
        match suffix {
            Some(suffix) => {
                let Ok(entries) = std::fs::read_dir(&path) else {
                    continue;
                };
                for entry in entries {
                    let entry = entry?;
                    if entry.file_name().to_string_lossy().ends_with(suffix) {
                        remove_entry(&entry.path())?;
                    }
                }
            }
            None => remove_entry(&path)?,
        }
        debug!("Cleaned {}", path.display());
    }
    Ok(())
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_packages_expand_to_arguments() {
        let vars = ArgVars {
            manifest: Some("/.hubpack/requirements.txt".to_string()),
            packages: vec!["libgl1".to_string(), "tesseract-ocr".to_string()],
        };
        let template: Vec<String> = ["install", "{packages}", "-r", "{manifest}", "x {packages}"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(
            expand_argv(&template, &vars),
            vec![
                "install",
                "libgl1",
                "tesseract-ocr",
                "-r",
                "/.hubpack/requirements.txt",
                "x libgl1 tesseract-ocr"
            ]
        );
    }

    #[test]
    fn test_cleanup_empties_or_removes() {
        let root = tempfile::TempDir::new().unwrap();
        let lists = root.path().join("var/lib/apt/lists");
        std::fs::create_dir_all(lists.join("partial")).unwrap();
        std::fs::write(lists.join("deb.debian.org_Packages"), "x").unwrap();
        let archives = root.path().join("var/cache/apt/archives");
        std::fs::create_dir_all(archives.join("partial")).unwrap();
        std::fs::write(archives.join("libgl1_1.6.0_amd64.deb"), "x").unwrap();
        std::fs::write(root.path().join("var/cache/apt/pkgcache.bin"), "x").unwrap();

        let cleanup = vec![
            "var/lib/apt/lists/*".to_string(),
            "var/cache/apt/archives/*.deb".to_string(),
            "/var/cache/apt/pkgcache.bin".to_string(),
            "../outside".to_string(),
        ];
        remove_cleanup_paths(root.path(), &cleanup).unwrap();

        assert!(lists.is_dir());
        assert_eq!(std::fs::read_dir(&lists).unwrap().count(), 0);
        assert!(archives.join("partial").is_dir());
        assert!(!archives.join("libgl1_1.6.0_amd64.deb").exists());
        assert!(!root.path().join("var/cache/apt/pkgcache.bin").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_does_not_follow_symlinks() {
        let root = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("keep"), "x").unwrap();
        std::fs::create_dir_all(root.path().join("var")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("var/cache")).unwrap();

        remove_cleanup_paths(root.path(), &["var/cache/*".to_string()]).unwrap();
        assert!(outside.path().join("keep").exists());
    }
}
