//! Dependency manifest parsing.
//!
//! The manifest is a pip-style requirements file: one requirement per line,
//! `#` comments, blank lines ignored. Installer options (`--index-url ...`)
//! are carried through untouched so the install command sees the file as
//! written. The manifest's raw bytes feed the dependency stage cache key, so
//! even a comment edit re-runs installation.

use crate::constants::MAX_MANIFEST_SIZE;
use crate::error::{Error, Result};
use crate::storage::sha256_digest;
use std::fmt;
use std::path::{Path, PathBuf};

/// Version comparison operators, longest first so `===` wins over `==`.
const OPERATORS: &[&str] = &["===", "==", ">=", "<=", "~=", "!=", ">", "<"];

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// A named package with an optional version constraint.
    Package {
        /// Distribution name, extras included (`uvicorn[standard]`).
        name: String,
        /// Everything after the name (`==1.2.0`, `>=2; python_version<'3.12'`).
        constraint: String,
    },
    /// An installer option line (`--index-url`, `-r other.txt`).
    Option(String),
}

impl Requirement {
    /// Returns the package name, if this is a package line.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Package { name, .. } => Some(name),
            Self::Option(_) => None,
        }
    }

    /// Returns true if the package carries an exact `==` pin.
    pub fn is_pinned(&self) -> bool {
        match self {
            Self::Package { constraint, .. } => {
                constraint.starts_with("==") || constraint.starts_with('@')
            }
            Self::Option(_) => false,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Package { name, constraint } => write!(f, "{}{}", name, constraint),
            Self::Option(opt) => f.write_str(opt),
        }
    }
}

/// A parsed dependency manifest.
#[derive(Debug, Clone)]
pub struct DependencyManifest {
    path: PathBuf,
    entries: Vec<Requirement>,
    digest: String,
}

impl DependencyManifest {
    /// Loads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// - [`Error::ManifestMissing`] if the file does not exist
    /// - [`Error::ManifestEmpty`] if it lists no packages
    /// - [`Error::ManifestParse`] on a malformed line
    pub fn load(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|_| Error::ManifestMissing(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(Error::ManifestMissing(path.to_path_buf()));
        }
        if meta.len() > MAX_MANIFEST_SIZE {
            return Err(Error::ManifestParse {
                line: 0,
                reason: format!("manifest exceeds {} bytes", MAX_MANIFEST_SIZE),
            });
        }

        let bytes = std::fs::read(path)?;
        let text = String::from_utf8(bytes.clone()).map_err(|_| Error::ManifestParse {
            line: 0,
            reason: "manifest is not valid UTF-8".to_string(),
        })?;

        let entries = parse(&text)?;
        if !entries.iter().any(|e| e.name().is_some()) {
            return Err(Error::ManifestEmpty(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            digest: sha256_digest(&bytes),
        })
    }

    /// Returns the manifest path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns all entries in file order.
    pub fn entries(&self) -> &[Requirement] {
        &self.entries
    }

    /// Returns the package entries only.
    pub fn packages(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.iter().filter(|e| e.name().is_some())
    }

    /// Returns the `sha256:` digest of the raw file.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Parses manifest text into requirements.
pub fn parse(text: &str) -> Result<Vec<Requirement>> {
    let mut entries = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('-') {
            entries.push(Requirement::Option(line.to_string()));
            continue;
        }

        entries.push(parse_requirement(line).map_err(|reason| Error::ManifestParse {
            line: line_no,
            reason,
        })?);
    }

    Ok(entries)
}

fn strip_comment(line: &str) -> &str {
    // pip treats '#' as a comment only at line start or after whitespace,
    // so URL fragments (`pkg @ https://host/x.whl#sha256=...`) survive.
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn parse_requirement(line: &str) -> std::result::Result<Requirement, String> {
    let mut name_end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        .unwrap_or(line.len());

    if name_end == 0 {
        return Err(format!("expected a package name in '{}'", line));
    }

    // Extras: name[extra1,extra2]
    if line[name_end..].starts_with('[') {
        let close = line[name_end..]
            .find(']')
            .ok_or_else(|| format!("unclosed extras in '{}'", line))?;
        name_end += close + 1;
    }

    let name = line[..name_end].to_string();
    let rest = line[name_end..].trim_start();

    if rest.is_empty() {
        return Ok(Requirement::Package {
            name,
            constraint: String::new(),
        });
    }

    let valid_start = rest.starts_with(';')
        || rest.starts_with('@')
        || OPERATORS.iter().any(|op| rest.starts_with(op));
    if !valid_start {
        return Err(format!("unexpected text after '{}': '{}'", name, rest));
    }

    Ok(Requirement::Package {
        name,
        constraint: rest.to_string(),
    })
}
