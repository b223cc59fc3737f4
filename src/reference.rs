//! Base image references.
//!
//! A build must resolve its base deterministically, so references are only
//! accepted when they pin a version: either a digest (`repo@sha256:<hex>`)
//! or a tag that names a version (`python:3.11-slim`). Missing tags and
//! floating tags like `latest` are rejected at parse time.

use crate::constants::{IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Tags that never pin anything.
const FLOATING_TAGS: &[&str] = &["latest", "stable", "edge", "nightly", "main", "master"];

/// How a reference pins its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pin {
    /// Version tag, e.g. `3.11-slim`.
    Tag(String),
    /// Content digest, e.g. `sha256:abcd...`.
    Digest(String),
}

/// A validated, pinned image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    repository: String,
    pin: Pin,
}

impl ImageReference {
    /// Parses and validates a reference.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!("exceeds {} bytes", MAX_IMAGE_REF_LEN)));
        }
        if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(invalid("contains invalid characters"));
        }

        if let Some((repository, digest)) = reference.split_once('@') {
            validate_repository(repository).map_err(|r| invalid(r))?;
            let hash = digest
                .strip_prefix("sha256:")
                .ok_or_else(|| invalid("digest must use sha256"))?;
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid("digest must be 64 hex characters"));
            }
            return Ok(Self {
                repository: repository.to_string(),
                pin: Pin::Digest(digest.to_ascii_lowercase()),
            });
        }

        // The tag separator is the last ':' after the last '/', so registry
        // ports (`host:5000/repo:tag`) are not mistaken for tags.
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        let Some(colon) = reference[last_slash..].rfind(':').map(|i| i + last_slash) else {
            return Err(Error::UnpinnedImageReference(reference.to_string()));
        };

        let repository = &reference[..colon];
        let tag = &reference[colon + 1..];
        validate_repository(repository).map_err(|r| invalid(r))?;

        if tag.is_empty() {
            return Err(invalid("empty tag"));
        }
        if FLOATING_TAGS.contains(&tag.to_ascii_lowercase().as_str())
            || !tag.chars().any(|c| c.is_ascii_digit())
        {
            return Err(Error::UnpinnedImageReference(reference.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            pin: Pin::Tag(tag.to_string()),
        })
    }

    /// Returns the repository part (`registry/name`).
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Returns how the reference is pinned.
    pub fn pin(&self) -> &Pin {
        &self.pin
    }
}

fn validate_repository(repository: &str) -> std::result::Result<(), &'static str> {
    if repository.is_empty() {
        return Err("empty repository");
    }
    if repository.starts_with('/') || repository.ends_with('/') || repository.contains("//") {
        return Err("malformed repository path");
    }
    if repository.split('/').any(|part| part == "." || part == "..") {
        return Err("relative path component in repository");
    }
    Ok(())
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pin {
            Pin::Tag(tag) => write!(f, "{}:{}", self.repository, tag),
            Pin::Digest(digest) => write!(f, "{}@{}", self.repository, digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let r = ImageReference::parse("registry.local:5000/python:3.11-slim").unwrap();
        assert_eq!(r.repository(), "registry.local:5000/python");
        assert_eq!(r.pin(), &Pin::Tag("3.11-slim".to_string()));

        let err = ImageReference::parse("registry.local:5000/python").unwrap_err();
        assert!(matches!(err, Error::UnpinnedImageReference(_)));
    }
}
