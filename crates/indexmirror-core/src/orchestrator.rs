//! The orchestrator: the state machine that figures out which packages
//! changed, drives a bounded worker pool over them, and finalizes the
//! synced serial. One cooperative event loop (a fixed number of logical
//! workers over a shared queue) built on `futures::stream::for_each_concurrent`
//! over `tokio` tasks rather than OS threads, since the per-package work
//! here is genuinely I/O-bound async.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use indexmirror_client::Master;
use indexmirror_filter::FilterChain;
use indexmirror_state::StateStore;
use indexmirror_storage::Storage;
use indexmirror_sync::PackageSyncer;
use indexmirror_types::{AlteredPackages, MirrorError, Package, TodoList};
use indexmirror_writer::{MetadataWriter, WriterConfig};

use crate::config::MirrorConfig;
use crate::reporter::Reporter;

const LOCK_FILE: &str = ".lock";
const LAST_MODIFIED_FILE: &str = "web/last-modified";

/// Errors the orchestrator itself can raise, distinct from the per-package
/// errors it isolates and tolerates.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid worker count {requested} (must be 1..={max})")]
    InvalidWorkerCount { requested: u8, max: u8 },
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What one call to [`Orchestrator::run`] accomplished.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    /// The serial persisted to `status` at the end of the run. Unchanged
    /// from the pre-run value if `errors` is true or an explicit package
    /// list was supplied (FINALIZE is skipped in both cases).
    pub synced_serial: u64,
    /// The serial this run was trying to catch up to.
    pub target_serial: u64,
    /// Whether any package failed. A true value means the run is
    /// considered failed even though individual packages may have
    /// succeeded and been removed from the todo list.
    pub errors: bool,
    /// Paths newly written per raw package name, for the diff-file report.
    pub altered_packages: AlteredPackages,
}

/// Drives one sync run: DISCOVER → FILTER → SYNC → WRITE_INDEX → FINALIZE.
pub struct Orchestrator<'a> {
    storage: &'a dyn Storage,
    master: &'a dyn Master,
    filters: &'a FilterChain,
    writer: MetadataWriter<'a>,
    state: StateStore<'a>,
    config: MirrorConfig,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        master: &'a dyn Master,
        filters: &'a FilterChain,
        config: MirrorConfig,
    ) -> Result<Self, OrchestratorError> {
        config
            .validate_workers()
            .map_err(|_| OrchestratorError::InvalidWorkerCount {
                requested: config.workers,
                max: crate::config::MAX_WORKERS,
            })?;

        let writer_config = WriterConfig {
            hash_index: config.hash_index,
            root_uri: config.root_uri.clone(),
            save_json: config.save_json,
            digest_name: config.digest_name.clone(),
            keep_index_versions: config.keep_index_versions,
        };

        Ok(Self {
            storage,
            master,
            filters,
            writer: MetadataWriter::new(storage, writer_config),
            state: StateStore::new(storage),
            config,
        })
    }

    /// Every path this run's writer has committed so far (for the session
    /// driver's diff-file report).
    pub fn diff_file_list(&self) -> Vec<std::path::PathBuf> {
        self.writer.diff_file_list()
    }

    /// Runs one sync. `explicit_packages`, when set, bypasses DISCOVER and
    /// FINALIZE entirely: every named package is synced with
    /// `serial_hint=0` and the synced serial is never advanced.
    pub async fn run(
        &self,
        reporter: &mut dyn Reporter,
        explicit_packages: Option<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<SyncOutcome, OrchestratorError> {
        let explicit_mode = explicit_packages.is_some();

        let _lock_guard = self
            .storage
            .get_lock(Path::new(LOCK_FILE), self.config.lock_timeout)?;

        self.state
            .init_dirs(self.config.save_json)
            .context("failed to bootstrap web/ directories")?;

        let synced_serial = self
            .state
            .reconcile_generation_and_serial()
            .map_err(OrchestratorError::Mirror)?;

        // DISCOVER
        let (target_serial, mut packages_to_sync, need_index_sync) =
            if let Some(names) = explicit_packages {
                let packages = names
                    .into_iter()
                    .map(|name| (indexmirror_types::normalize_name(&name), 0))
                    .collect::<BTreeMap<_, _>>();
                reporter.info(&format!("explicit run over {} package(s)", packages.len()));
                (synced_serial, packages, true)
            } else if let Some(todo) = self.state.load_todofile().context("failed to load todo")? {
                reporter.info(&format!(
                    "resuming: {} package(s) outstanding toward serial {}",
                    todo.packages.len(),
                    todo.target_serial
                ));
                (todo.target_serial, todo.packages, true)
            } else if synced_serial == 0 {
                let all = self
                    .master
                    .all_packages()
                    .await
                    .context("failed to fetch all_packages from upstream")?;
                let max_serial = all.values().copied().max().unwrap_or(synced_serial);
                reporter.info(&format!("cold start: {} package(s) known upstream", all.len()));
                (synced_serial.max(max_serial), all, true)
            } else {
                let changed = self
                    .master
                    .changed_packages(synced_serial)
                    .await
                    .context("failed to fetch changed_packages from upstream")?;
                let max_serial = changed.values().copied().max().unwrap_or(synced_serial);
                let need_index = !changed.is_empty();
                reporter.info(&format!(
                    "incremental: {} package(s) changed since serial {}",
                    changed.len(),
                    synced_serial
                ));
                (synced_serial.max(max_serial), changed, need_index)
            };

        // FILTER
        let before = packages_to_sync.len();
        packages_to_sync.retain(|name, _| self.filters.accepts_project(name));
        if packages_to_sync.len() != before {
            reporter.info(&format!(
                "project filters dropped {} package(s)",
                before - packages_to_sync.len()
            ));
        }

        if !explicit_mode {
            self.state
                .update_todofile(&TodoList {
                    target_serial,
                    packages: packages_to_sync.clone(),
                })
                .context("failed to persist todo before starting sync")?;
        }

        // SYNC
        let errors = AtomicBool::new(false);
        let packages_to_sync_shared = StdMutex::new(packages_to_sync);
        let altered_packages: StdMutex<AlteredPackages> = StdMutex::new(AlteredPackages::new());
        let finish_lock = AsyncMutex::new(());
        let reporter_ref = StdMutex::new(reporter);

        let queue: Vec<(String, u64)> = {
            let guard = packages_to_sync_shared.lock().unwrap();
            let mut v: Vec<(String, u64)> = guard.iter().map(|(k, v)| (k.clone(), *v)).collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };

        let concurrency = self.config.workers as usize;
        stream::iter(queue)
            .for_each_concurrent(concurrency, |(name, serial_hint)| {
                let errors = &errors;
                let packages_to_sync_shared = &packages_to_sync_shared;
                let altered_packages = &altered_packages;
                let finish_lock = &finish_lock;
                let reporter_ref = &reporter_ref;
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return;
                    }

                    match self
                        .process_package(&name, serial_hint, altered_packages)
                        .await
                    {
                        Ok(()) => {}
                        Err(MirrorError::PackageNotFound { .. }) => {
                            reporter_ref.lock().unwrap().info(&format!("{name}: not found upstream, skipping"));
                        }
                        Err(err @ MirrorError::InvalidDownloadUrl { .. }) => {
                            reporter_ref
                                .lock()
                                .unwrap()
                                .error(&format!("{name}: {err} (fatal, aborting run)"));
                            errors.store(true, Ordering::SeqCst);
                            cancel.cancel();
                        }
                        Err(err) => {
                            reporter_ref.lock().unwrap().error(&format!("{name}: {err}"));
                            errors.store(true, Ordering::SeqCst);
                            if self.config.stop_on_error {
                                cancel.cancel();
                            }
                        }
                    }

                    let _finish_guard = finish_lock.lock().await;
                    packages_to_sync_shared.lock().unwrap().remove(&name);
                    if !explicit_mode {
                        let snapshot = packages_to_sync_shared.lock().unwrap().clone();
                        if let Err(e) = self.state.update_todofile(&TodoList {
                            target_serial,
                            packages: snapshot,
                        }) {
                            reporter_ref
                                .lock()
                                .unwrap()
                                .error(&format!("failed to persist todo after {name}: {e}"));
                            errors.store(true, Ordering::SeqCst);
                        }
                    }
                }
            })
            .await;

        if cancel.is_cancelled() {
            // An externally-triggered cancellation (signal, global timeout)
            // may have skipped packages that were never attempted; the run
            // is incomplete regardless of whether any individual package
            // raised. The serial must not advance and the todo must survive.
            errors.store(true, Ordering::SeqCst);
        }

        let errors = errors.into_inner();
        let altered_packages = altered_packages.into_inner().unwrap();

        // WRITE_INDEX
        self.writer
            .write_index_page(need_index_sync)
            .context("failed to write global simple index")?;

        // FINALIZE
        if !errors && !explicit_mode {
            self.state
                .update_status(target_serial)
                .context("failed to persist synced serial")?;
            self.state.clean_todo().context("failed to clear todo")?;
            let mut sink = self.storage.rewrite(Path::new(LAST_MODIFIED_FILE))?;
            std::io::Write::write_all(
                &mut sink,
                format!("{}\n", Utc::now().format("%Y%m%dT%H:%M:%S")).as_bytes(),
            )?;
            sink.commit()?;
        }
        // On error or an explicit run, `status`/`todo` are left untouched: a
        // later run resumes from `synced_serial` plus whatever is still in
        // `todo`. `target_serial` still reports what this run was trying to
        // reach, for the caller's progress reporting.

        Ok(SyncOutcome {
            synced_serial: if !errors && !explicit_mode {
                target_serial
            } else {
                synced_serial
            },
            target_serial,
            errors,
            altered_packages,
        })
    }

    async fn process_package(
        &self,
        name: &str,
        _serial_hint: u64,
        altered_packages: &StdMutex<AlteredPackages>,
    ) -> Result<(), MirrorError> {
        let mut package: Package = self
            .master
            .get_metadata(name, self.config.metadata_attempts)
            .await?;

        if !self.filters.accepts_metadata(&package) {
            return Ok(());
        }

        if self.config.save_json {
            self.writer
                .save_json_metadata_for_package(&package)
                .map_err(|e| MirrorError::Io(e.to_string()))?;
        }

        self.filters.apply_to_releases(&mut package);

        let syncer = PackageSyncer::new(self.storage, self.master, &self.writer);
        let written = syncer.sync_release_files_for_package(&package).await?;
        if !written.is_empty() {
            altered_packages
                .lock()
                .unwrap()
                .entry(package.raw_name.clone())
                .or_default()
                .extend(written);
        }

        self.writer.write_simple_page(&package)?;

        if self.config.cleanup {
            // Best-effort: a leftover legacy directory is cosmetic, not worth
            // failing the package over.
            let _ = self.writer.cleanup_non_pep_503_paths(&package);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use indexmirror_client::ByteStream;
    use indexmirror_storage::FileStorage;
    use std::sync::Mutex;

    struct FakeMaster {
        packages: Mutex<BTreeMap<String, u64>>,
        metadata: Mutex<BTreeMap<String, Package>>,
    }

    #[async_trait]
    impl Master for FakeMaster {
        async fn all_packages(&self) -> anyhow::Result<BTreeMap<String, u64>> {
            Ok(self.packages.lock().unwrap().clone())
        }
        async fn changed_packages(&self, _since: u64) -> anyhow::Result<BTreeMap<String, u64>> {
            Ok(self.packages.lock().unwrap().clone())
        }
        async fn get_metadata(&self, name: &str, _attempts: u32) -> Result<Package, MirrorError> {
            self.metadata
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| MirrorError::PackageNotFound {
                    name: name.to_string(),
                })
        }
        async fn stream(&self, _url: &str, _required_serial: Option<u64>) -> anyhow::Result<ByteStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    fn package_no_files(raw_name: &str, serial: u64) -> Package {
        Package::new(raw_name, serial, serde_json::json!({}))
    }

    #[tokio::test]
    async fn cold_start_writes_status_and_clears_todo() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters = FilterChain::new();

        let mut packages = BTreeMap::new();
        packages.insert("alpha".to_string(), 1u64);
        packages.insert("beta".to_string(), 2u64);
        let mut metadata = BTreeMap::new();
        metadata.insert("alpha".to_string(), package_no_files("alpha", 1));
        metadata.insert("beta".to_string(), package_no_files("beta", 2));
        let master = FakeMaster {
            packages: Mutex::new(packages),
            metadata: Mutex::new(metadata),
        };

        let config = MirrorConfig {
            workers: 2,
            ..MirrorConfig::default()
        };
        let orchestrator = Orchestrator::new(&storage, &master, &filters, config).unwrap();
        let mut reporter = crate::reporter::NullReporter;

        let outcome = orchestrator
            .run(&mut reporter, None, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.errors);
        assert_eq!(outcome.synced_serial, 2);
        assert!(storage.exists(Path::new("status")));
        assert!(!storage.exists(Path::new("todo")));
        assert!(storage.exists(Path::new("web/simple/alpha/index.html")));
        assert!(storage.exists(Path::new("web/simple/beta/index.html")));
        assert!(storage.exists(Path::new("web/simple/index.html")));
    }

    #[tokio::test]
    async fn package_not_found_is_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters = FilterChain::new();

        let mut packages = BTreeMap::new();
        packages.insert("ghost".to_string(), 1u64);
        let master = FakeMaster {
            packages: Mutex::new(packages),
            metadata: Mutex::new(BTreeMap::new()),
        };

        let orchestrator =
            Orchestrator::new(&storage, &master, &filters, MirrorConfig::default()).unwrap();
        let mut reporter = crate::reporter::NullReporter;
        let outcome = orchestrator
            .run(&mut reporter, None, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.errors, "PackageNotFound must not count as an error");
    }

    #[tokio::test]
    async fn eleven_workers_is_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters = FilterChain::new();
        let master = FakeMaster {
            packages: Mutex::new(BTreeMap::new()),
            metadata: Mutex::new(BTreeMap::new()),
        };
        let config = MirrorConfig {
            workers: 11,
            ..MirrorConfig::default()
        };
        let err = Orchestrator::new(&storage, &master, &filters, config).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkerCount { .. }));
    }

    #[tokio::test]
    async fn explicit_package_list_never_advances_serial() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters = FilterChain::new();

        let mut metadata = BTreeMap::new();
        metadata.insert("alpha".to_string(), package_no_files("alpha", 5));
        let master = FakeMaster {
            packages: Mutex::new(BTreeMap::new()),
            metadata: Mutex::new(metadata),
        };

        let orchestrator =
            Orchestrator::new(&storage, &master, &filters, MirrorConfig::default()).unwrap();
        let mut reporter = crate::reporter::NullReporter;
        let outcome = orchestrator
            .run(
                &mut reporter,
                Some(vec!["alpha".to_string()]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.synced_serial, 0);
        assert!(!storage.exists(Path::new("status")));
        assert!(storage.exists(Path::new("web/simple/alpha/index.html")));
    }

    #[tokio::test]
    async fn explicit_package_list_still_regenerates_the_global_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters = FilterChain::new();

        let mut metadata = BTreeMap::new();
        metadata.insert("alpha".to_string(), package_no_files("alpha", 5));
        let master = FakeMaster {
            packages: Mutex::new(BTreeMap::new()),
            metadata: Mutex::new(metadata),
        };

        let orchestrator =
            Orchestrator::new(&storage, &master, &filters, MirrorConfig::default()).unwrap();
        let mut reporter = crate::reporter::NullReporter;
        orchestrator
            .run(
                &mut reporter,
                Some(vec!["alpha".to_string()]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // DISCOVER/FINALIZE are skipped in explicit mode, but WRITE_INDEX
        // isn't: bandersnatch's own `synchronize()` still regenerates the
        // global index after an explicit-package run.
        assert!(storage.exists(Path::new("web/simple/index.html")));
    }

    #[tokio::test]
    async fn filtered_out_project_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters =
            FilterChain::new().with_project_filter(indexmirror_filter::NameRegexFilter::blocklist("^blocked").unwrap());

        let mut packages = BTreeMap::new();
        packages.insert("blocked-pkg".to_string(), 1u64);
        let mut metadata = BTreeMap::new();
        metadata.insert("blocked-pkg".to_string(), package_no_files("blocked-pkg", 1));
        let master = FakeMaster {
            packages: Mutex::new(packages),
            metadata: Mutex::new(metadata),
        };

        let orchestrator =
            Orchestrator::new(&storage, &master, &filters, MirrorConfig::default()).unwrap();
        let mut reporter = crate::reporter::NullReporter;
        orchestrator
            .run(&mut reporter, None, CancellationToken::new())
            .await
            .unwrap();

        assert!(!storage.exists(Path::new("web/simple/blocked-pkg/index.html")));
    }

    #[tokio::test]
    async fn pre_cancelled_token_leaves_serial_unadvanced() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let filters = FilterChain::new();

        let mut packages = BTreeMap::new();
        packages.insert("alpha".to_string(), 1u64);
        let mut metadata = BTreeMap::new();
        metadata.insert("alpha".to_string(), package_no_files("alpha", 1));
        let master = FakeMaster {
            packages: Mutex::new(packages),
            metadata: Mutex::new(metadata),
        };

        let orchestrator =
            Orchestrator::new(&storage, &master, &filters, MirrorConfig::default()).unwrap();
        let mut reporter = crate::reporter::NullReporter;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator.run(&mut reporter, None, cancel).await.unwrap();

        assert!(outcome.errors, "a cancelled run must be reported as failed");
        assert!(!storage.exists(Path::new("status")));
        assert!(storage.exists(Path::new("todo")), "todo must survive so the next run resumes");
    }
}
