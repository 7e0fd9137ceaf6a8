//! Runtime configuration the orchestrator and session driver need: one
//! flat, `Clone`-able struct owned by the caller, with no I/O of its own.
//! Loading this from a TOML file is the CLI's job (`indexmirror-cli`'s
//! config loader), not this crate's.

use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on `workers`.
pub const MAX_WORKERS: u8 = 10;

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Bounded worker pool size, 1..=10. Default 3.
    pub workers: u8,
    /// Abort the run with a non-zero exit as soon as one package fails,
    /// rather than continuing with the rest.
    pub stop_on_error: bool,
    /// Shard `web/simple/<name>` one level by first character.
    pub hash_index: bool,
    /// When > 0, rotate simple pages through `versions/` instead of
    /// overwriting `index.html` in place.
    pub keep_index_versions: usize,
    /// Absolute prefix for download links in simple pages. Empty means the
    /// relative `../../packages/...` form.
    pub root_uri: String,
    /// Which digest algorithm is embedded in simple-page anchor fragments.
    /// `sha256` must always be present in a package's digests regardless.
    pub digest_name: String,
    /// Also mirror upstream's raw JSON metadata under `web/json/<name>`.
    pub save_json: bool,
    /// Prune legacy (pre-PEP-503) simple directories after each package.
    pub cleanup: bool,
    /// Attempts per `get_metadata` call before giving up on a package.
    pub metadata_attempts: u32,
    /// Per-request timeout passed down to the `Master` implementation.
    pub request_timeout: Duration,
    /// Optional wall-clock budget for the whole run.
    pub global_timeout: Option<Duration>,
    /// How long to wait to acquire the exclusive session lock.
    pub lock_timeout: Duration,
    /// Where to write the newline-separated list of altered files. `None`
    /// disables the diff file entirely.
    pub diff_file: Option<PathBuf>,
    /// Append the run's start time (epoch seconds) to `diff_file`'s name.
    pub diff_file_append_epoch: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            stop_on_error: false,
            hash_index: false,
            keep_index_versions: 0,
            root_uri: String::new(),
            digest_name: "sha256".to_string(),
            save_json: false,
            cleanup: false,
            metadata_attempts: 3,
            request_timeout: Duration::from_secs(60),
            global_timeout: None,
            lock_timeout: Duration::from_secs(1),
            diff_file: None,
            diff_file_append_epoch: false,
        }
    }
}

impl MirrorConfig {
    /// `workers` must be in `1..=MAX_WORKERS`. Called by
    /// `Orchestrator::new`, not at config-parse time, since a caller may
    /// build several configs before deciding which to actually run.
    pub fn validate_workers(&self) -> Result<(), crate::OrchestratorError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(crate::OrchestratorError::InvalidWorkerCount {
                requested: self.workers,
                max: MAX_WORKERS,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_count_is_valid() {
        assert!(MirrorConfig::default().validate_workers().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = MirrorConfig {
            workers: 0,
            ..MirrorConfig::default()
        };
        assert!(cfg.validate_workers().is_err());
    }

    #[test]
    fn eleven_workers_is_rejected() {
        let cfg = MirrorConfig {
            workers: 11,
            ..MirrorConfig::default()
        };
        assert!(cfg.validate_workers().is_err());
    }

    #[test]
    fn ten_workers_is_the_allowed_max() {
        let cfg = MirrorConfig {
            workers: 10,
            ..MirrorConfig::default()
        };
        assert!(cfg.validate_workers().is_ok());
    }

    proptest::proptest! {
        #[test]
        fn any_worker_count_up_to_max_is_accepted(workers in 1u8..=MAX_WORKERS) {
            let cfg = MirrorConfig { workers, ..MirrorConfig::default() };
            proptest::prop_assert!(cfg.validate_workers().is_ok());
        }

        #[test]
        fn any_worker_count_above_max_is_rejected(workers in (MAX_WORKERS + 1)..=u8::MAX) {
            let cfg = MirrorConfig { workers, ..MirrorConfig::default() };
            proptest::prop_assert!(cfg.validate_workers().is_err());
        }
    }
}
