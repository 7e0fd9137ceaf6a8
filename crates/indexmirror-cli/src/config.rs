//! TOML config-file loading. Deserializes into a plain, unvalidated struct;
//! the only validation that matters (`workers` in range) happens in
//! `MirrorConfig::validate_workers` at `Orchestrator::new` time, not here, so
//! a caller can load several candidate configs before picking one to run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use indexmirror_core::MirrorConfig;
use serde::Deserialize;

/// On-disk shape of a config file. Every field is optional so a file only
/// needs to mention what it wants to override from [`MirrorConfig::default`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub workers: Option<u8>,
    pub stop_on_error: Option<bool>,
    pub hash_index: Option<bool>,
    pub keep_index_versions: Option<usize>,
    pub root_uri: Option<String>,
    pub digest_name: Option<String>,
    pub save_json: Option<bool>,
    pub cleanup: Option<bool>,
    pub metadata_attempts: Option<u32>,
    pub request_timeout: Option<String>,
    pub global_timeout: Option<String>,
    pub lock_timeout: Option<String>,
    pub diff_file: Option<PathBuf>,
    pub diff_file_append_epoch: Option<bool>,
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Layers this file's overrides onto `base` (normally
    /// `MirrorConfig::default()`), leaving fields this file doesn't mention
    /// untouched.
    pub fn apply(self, mut base: MirrorConfig) -> Result<MirrorConfig> {
        if let Some(workers) = self.workers {
            base.workers = workers;
        }
        if let Some(v) = self.stop_on_error {
            base.stop_on_error = v;
        }
        if let Some(v) = self.hash_index {
            base.hash_index = v;
        }
        if let Some(v) = self.keep_index_versions {
            base.keep_index_versions = v;
        }
        if let Some(v) = self.root_uri {
            base.root_uri = v;
        }
        if let Some(v) = self.digest_name {
            base.digest_name = v;
        }
        if let Some(v) = self.save_json {
            base.save_json = v;
        }
        if let Some(v) = self.cleanup {
            base.cleanup = v;
        }
        if let Some(v) = self.metadata_attempts {
            base.metadata_attempts = v;
        }
        if let Some(v) = self.request_timeout {
            base.request_timeout = parse_duration(&v)?;
        }
        if let Some(v) = self.global_timeout {
            base.global_timeout = Some(parse_duration(&v)?);
        }
        if let Some(v) = self.lock_timeout {
            base.lock_timeout = parse_duration(&v)?;
        }
        if let Some(v) = self.diff_file {
            base.diff_file = Some(v);
        }
        if let Some(v) = self.diff_file_append_epoch {
            base.diff_file_append_epoch = v;
        }
        Ok(base)
    }
}
