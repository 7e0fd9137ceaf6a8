//! The filter chain: four predicate traits the orchestrator consults during
//! FILTER and SYNC. A package or one of its parts survives only if *every*
//! predicate in the relevant list returns `true` — plugins combine by
//! conjunction, never by voting.

use indexmirror_types::{Package, ReleaseFile};
use regex::Regex;

/// Predicate over a bare (already-normalized) package name, run during
/// FILTER before any metadata has been fetched.
pub trait ProjectFilter: Send + Sync {
    fn filter(&self, normalized_name: &str) -> bool;
}

/// Predicate over a package's freshly-fetched metadata, run right after
/// `get_metadata` and before any files are touched.
pub trait MetadataFilter: Send + Sync {
    fn filter(&self, package: &Package) -> bool;
}

/// Predicate over one version of a package. Versions that fail this are
/// dropped from `package.releases` before files are synced. Takes the
/// package's normalized name rather than the live `&Package` so the chain
/// can apply it while holding `package.releases` mutably.
pub trait ReleaseFilter: Send + Sync {
    fn filter(&self, normalized_name: &str, version: &str) -> bool;
}

/// Predicate over one release file. Files that fail this are dropped from
/// their version's file list before download.
pub trait ReleaseFileFilter: Send + Sync {
    fn filter(&self, normalized_name: &str, version: &str, file: &ReleaseFile) -> bool;
}

/// The four predicate lists the orchestrator walks, bundled together so
/// `run_sync` only has one thing to pass around.
#[derive(Default)]
pub struct FilterChain {
    project: Vec<Box<dyn ProjectFilter>>,
    metadata: Vec<Box<dyn MetadataFilter>>,
    release: Vec<Box<dyn ReleaseFilter>>,
    release_file: Vec<Box<dyn ReleaseFileFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project_filter(mut self, filter: impl ProjectFilter + 'static) -> Self {
        self.project.push(Box::new(filter));
        self
    }

    pub fn with_metadata_filter(mut self, filter: impl MetadataFilter + 'static) -> Self {
        self.metadata.push(Box::new(filter));
        self
    }

    pub fn with_release_filter(mut self, filter: impl ReleaseFilter + 'static) -> Self {
        self.release.push(Box::new(filter));
        self
    }

    pub fn with_release_file_filter(mut self, filter: impl ReleaseFileFilter + 'static) -> Self {
        self.release_file.push(Box::new(filter));
        self
    }

    /// FILTER: `name_set.retain(|name| filter_chain.accepts_project(name))`.
    pub fn accepts_project(&self, normalized_name: &str) -> bool {
        self.project.iter().all(|f| f.filter(normalized_name))
    }

    pub fn accepts_metadata(&self, package: &Package) -> bool {
        self.metadata.iter().all(|f| f.filter(package))
    }

    /// Drops versions and release files the chain rejects, in place. Called
    /// after metadata filters pass, before SYNC downloads anything.
    pub fn apply_to_releases(&self, package: &mut Package) {
        let name = package.normalized_name.as_str().to_string();

        package
            .releases
            .retain(|version, _| self.release.iter().all(|f| f.filter(&name, version)));

        for (version, files) in package.releases.iter_mut() {
            files.retain(|file| {
                self.release_file
                    .iter()
                    .all(|f| f.filter(&name, version, file))
            });
        }
    }
}

/// Rejects pre-release versions (`aN`, `bN`, `rcN`, `.devN`, `.postN` is
/// allowed through) by PEP 440's lightweight textual markers, matching
/// bandersnatch's built-in `prerelease` filter plugin.
pub struct PrereleaseFilter {
    pattern: Regex,
}

impl Default for PrereleaseFilter {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"(?i)(a|b|rc)[0-9]*$|\.dev[0-9]*$").unwrap(),
        }
    }
}

impl PrereleaseFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReleaseFilter for PrereleaseFilter {
    fn filter(&self, _normalized_name: &str, version: &str) -> bool {
        !self.pattern.is_match(version)
    }
}

/// Allowlist/blocklist over normalized package names by regex, matching
/// bandersnatch's built-in `allowlist_project`/`blocklist_project` plugins.
pub struct NameRegexFilter {
    pattern: Regex,
    allow_matches: bool,
}

impl NameRegexFilter {
    /// Only names matching `pattern` are accepted.
    pub fn allowlist(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            allow_matches: true,
        })
    }

    /// Names matching `pattern` are rejected.
    pub fn blocklist(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            allow_matches: false,
        })
    }
}

impl ProjectFilter for NameRegexFilter {
    fn filter(&self, normalized_name: &str) -> bool {
        self.pattern.is_match(normalized_name) == self.allow_matches
    }
}
