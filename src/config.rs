//! Runtime configuration.
//!
//! The process environment of the service is fixed when the image is
//! built: base image env, then the build defaults, then the build file's
//! `[env]`, later layers winning. [`RuntimeConfig`] is assembled once and
//! has no mutation API; launch-time flags cannot change it.

use crate::constants::DEFAULT_PATH;
use std::collections::BTreeMap;
use tracing::warn;

/// Immutable, ordered environment of the service process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    vars: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Composes the configuration from base image env (`KEY=value`
    /// entries) and build env. Build keys win. `PATH` falls back to a
    /// standard search path when neither source sets it.
    pub fn compose(base_env: &[String], build_env: &BTreeMap<String, String>) -> Self {
        let mut vars = parse_env_list(base_env);
        vars.extend(build_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());
        Self { vars }
    }

    /// Reads a configuration recorded in an image (`Env` entries).
    pub fn from_env_list(env: &[String]) -> Self {
        Self {
            vars: parse_env_list(env),
        }
    }

    /// Returns a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Renders `KEY=value` entries in key order.
    pub fn to_env_list(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

impl From<BTreeMap<String, String>> for RuntimeConfig {
    fn from(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }
}

fn parse_env_list(env: &[String]) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for entry in env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                vars.insert(key.to_string(), value.to_string());
            }
            _ => warn!("Ignoring malformed env entry '{}'", entry),
        }
    }
    vars
}
