//! The session driver: the actual entry point a caller reaches for,
//! wrapping one [`Orchestrator::run`] with diff-file reporting.
//!
//! Computing the diff-file path and writing it out is kept separate from the
//! orchestrator itself so a caller that only wants the sync (no diff report)
//! can drive [`Orchestrator`] directly.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use indexmirror_client::Master;
use indexmirror_filter::FilterChain;
use indexmirror_storage::Storage;
use tokio_util::sync::CancellationToken;

use crate::config::MirrorConfig;
use crate::orchestrator::{Orchestrator, OrchestratorError, SyncOutcome};
use crate::reporter::Reporter;

const DEFAULT_DIFF_FILE_NAME: &str = "mirrored-files";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("failed to write diff file {path:?}: {source}")]
    DiffFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What one `run_sync` call produced: the underlying sync outcome plus where
/// (if anywhere) the diff-file report landed.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub sync: SyncOutcome,
    pub diff_file_written: Option<PathBuf>,
}

/// Resolves the configured diff-file destination into a concrete file path:
/// a directory is coerced to `<dir>/mirrored-files`, and
/// `diff_file_append_epoch` appends the run's start time in epoch seconds to
/// the file name.
fn resolve_diff_file_path(configured: &Path, append_epoch: bool, started_at_epoch: u64) -> PathBuf {
    let base = if configured.is_dir() {
        configured.join(DEFAULT_DIFF_FILE_NAME)
    } else {
        configured.to_path_buf()
    };
    if !append_epoch {
        return base;
    }
    let file_name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_DIFF_FILE_NAME.to_string());
    base.with_file_name(format!("{file_name}-{started_at_epoch}"))
}

fn write_diff_file(path: &Path, lines: &[String]) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SessionError::DiffFile {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let body = lines.join("\n");
    std::fs::write(path, body).map_err(|source| SessionError::DiffFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs one sync and, if `config.diff_file` is set, writes the newline-
/// separated list of every path the run wrote (the writer's own commits plus
/// every downloaded release file) to it.
pub async fn run_sync(
    storage: &dyn Storage,
    master: &dyn Master,
    filters: &FilterChain,
    config: MirrorConfig,
    explicit_packages: Option<Vec<String>>,
    reporter: &mut dyn Reporter,
    cancel: CancellationToken,
) -> Result<SessionOutcome, SessionError> {
    let started_at_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let diff_file = config.diff_file.clone();
    let append_epoch = config.diff_file_append_epoch;
    let global_timeout = config.global_timeout;

    let orchestrator = Orchestrator::new(storage, master, filters, config)?;

    let sync = if let Some(budget) = global_timeout {
        let watchdog_cancel = cancel.clone();
        let run = orchestrator.run(reporter, explicit_packages, cancel.clone());
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome?,
            _ = tokio::time::sleep(budget) => {
                // The run keeps draining in-flight work after cancellation
                // (no partial file is ever renamed into place), so we still
                // await it rather than abandoning the future outright.
                watchdog_cancel.cancel();
                run.await?
            }
        }
    } else {
        orchestrator.run(reporter, explicit_packages, cancel).await?
    };

    let diff_file_written = match diff_file {
        None => None,
        Some(configured) => {
            let path = resolve_diff_file_path(&configured, append_epoch, started_at_epoch);
            let mut lines: Vec<String> = orchestrator
                .diff_file_list()
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            for paths in sync.altered_packages.values() {
                lines.extend(paths.iter().cloned());
            }
            lines.sort();
            lines.dedup();
            write_diff_file(&path, &lines)?;
            reporter.info(&format!("wrote diff file {}", path.display()));
            Some(path)
        }
    };

    Ok(SessionOutcome {
        sync,
        diff_file_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use indexmirror_client::ByteStream;
    use indexmirror_storage::FileStorage;
    use indexmirror_types::{MirrorError, Package};
    use std::collections::BTreeMap;

    struct SlowMaster;

    #[async_trait]
    impl Master for SlowMaster {
        async fn all_packages(&self) -> anyhow::Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::from([("slow".to_string(), 1u64)]))
        }
        async fn changed_packages(&self, _since: u64) -> anyhow::Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }
        async fn get_metadata(&self, _name: &str, _attempts: u32) -> Result<Package, MirrorError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(Package::new("slow", 1, serde_json::json!({})))
        }
        async fn stream(&self, _url: &str, _required_serial: Option<u64>) -> anyhow::Result<ByteStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn global_timeout_aborts_a_run_stuck_on_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let master = SlowMaster;
        let filters = FilterChain::new();
        let config = MirrorConfig {
            global_timeout: Some(std::time::Duration::from_millis(50)),
            ..MirrorConfig::default()
        };
        let mut reporter = crate::reporter::NullReporter;

        let outcome = run_sync(
            &storage,
            &master,
            &filters,
            config,
            None,
            &mut reporter,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.sync.errors, "a timed-out run must be reported as failed");
        assert!(!storage.exists(Path::new("status")));
    }

    #[test]
    fn directory_destination_is_coerced_to_default_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_diff_file_path(dir.path(), false, 0);
        assert_eq!(resolved, dir.path().join(DEFAULT_DIFF_FILE_NAME));
    }

    #[test]
    fn file_destination_is_used_as_is_without_epoch() {
        let resolved = resolve_diff_file_path(Path::new("/tmp/report.txt"), false, 0);
        assert_eq!(resolved, PathBuf::from("/tmp/report.txt"));
    }

    #[test]
    fn epoch_suffix_is_appended_to_the_file_name() {
        let resolved = resolve_diff_file_path(Path::new("/tmp/report.txt"), true, 1_700_000_000);
        assert_eq!(resolved, PathBuf::from("/tmp/report.txt-1700000000"));
    }

    #[test]
    fn write_diff_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("diff.txt");
        write_diff_file(&path, &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb");
    }
}
