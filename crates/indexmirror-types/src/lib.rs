//! Core domain types shared by every indexmirror crate.
//!
//! This crate has no I/O of its own: it defines the package/release/serial
//! data model and the typed error taxonomy that the storage, client,
//! writer, sync, and orchestrator crates build on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// On-disk layout version. A mismatch with a mirror's persisted `generation`
/// file forces a full resync.
pub const CURRENT_GENERATION: u32 = 5;

/// Canonicalize a package name per PEP 503: lowercase, runs of `-_.`
/// collapsed to a single `-`.
pub fn normalize_name(raw_name: &str) -> String {
    let mut out = String::with_capacity(raw_name.len());
    let mut last_was_sep = false;
    for ch in raw_name.chars() {
        if ch == '-' || ch == '_' || ch == '.' {
            if !last_was_sep {
                out.push('-');
            }
            last_was_sep = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        }
    }
    out
}

/// A package name that has already passed through [`normalize_name`].
///
/// Keeping this as a distinct type stops writer/state code from
/// accidentally keying a directory or todo-list entry by the raw name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedName(String);

impl NormalizedName {
    pub fn new(raw_name: &str) -> Self {
        Self(normalize_name(raw_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First character, used for hash-sharded simple directories.
    pub fn shard_char(&self) -> char {
        self.0.chars().next().unwrap_or('_')
    }
}

impl fmt::Display for NormalizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NormalizedName {
    fn from(raw_name: &str) -> Self {
        Self::new(raw_name)
    }
}

impl From<String> for NormalizedName {
    fn from(raw_name: String) -> Self {
        Self::new(&raw_name)
    }
}

/// `{algo -> hex digest}`. `sha256` must always be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digests(pub BTreeMap<String, String>);

impl Digests {
    pub fn sha256(&self) -> Option<&str> {
        self.0.get("sha256").map(String::as_str)
    }

    pub fn get(&self, algo: &str) -> Option<&str> {
        self.0.get(algo).map(String::as_str)
    }
}

/// A single downloadable artifact belonging to one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFile {
    pub url: String,
    pub filename: String,
    pub digests: Digests,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// One package's identity, fetched metadata, and release files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub raw_name: String,
    pub normalized_name: NormalizedName,
    /// The serial this package's metadata was fetched at. Rendered into the
    /// `<!--SERIAL n-->` trailer of the simple page.
    pub serial: u64,
    /// Opaque upstream metadata document (the JSON body mirrored verbatim to
    /// `web/json/<name>` when `save_json` is enabled).
    pub metadata: serde_json::Value,
    /// `version string -> release files`.
    pub releases: BTreeMap<String, Vec<ReleaseFile>>,
}

impl Package {
    pub fn new(raw_name: impl Into<String>, serial: u64, metadata: serde_json::Value) -> Self {
        let raw_name = raw_name.into();
        Self {
            normalized_name: NormalizedName::new(&raw_name),
            raw_name,
            serial,
            metadata,
            releases: BTreeMap::new(),
        }
    }

    /// All release files across all versions, flattened. Used by the writer
    /// when rendering a simple page (which lists files, not versions).
    pub fn release_files(&self) -> Vec<&ReleaseFile> {
        self.releases.values().flatten().collect()
    }

    pub fn release_files_mut(&mut self) -> Vec<&mut ReleaseFile> {
        self.releases.values_mut().flatten().collect()
    }
}

/// Durable record of a run's intended work set plus the serial it targets.
/// Written only by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoList {
    pub target_serial: u64,
    /// `normalized_name -> serial_hint`
    pub packages: BTreeMap<String, u64>,
}

/// In-memory, per-run record of what changed on disk, exposed to the
/// diff-file emitter.
pub type AlteredPackages = BTreeMap<String, std::collections::BTreeSet<String>>;

/// The typed error taxonomy shared across the workspace. Orchestrator code
/// matches on these variants directly rather than string-sniffing an
/// `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("could not acquire lock on {path}: another instance may be running")]
    LockBusy { path: String },

    #[error("unknown generation {found} (expected {expected})")]
    UnknownGeneration { found: u32, expected: u32 },

    #[error("package not found upstream: {name}")]
    PackageNotFound { name: String },

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("invalid download URL (not rooted at /packages): {url}")]
    InvalidDownloadUrl { url: String },

    #[error("todo file is corrupt and was discarded")]
    CorruptTodo,

    #[error("I/O error: {0}")]
    Io(String),
}
