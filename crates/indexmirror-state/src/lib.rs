//! Generation / status / todo persistence.
//!
//! Three small files under the mirror's home directory carry a run across a
//! crash: `generation` pins the on-disk layout version, `status` records the
//! last serial fully synced, and `todo` records an in-flight run's target
//! serial plus the packages still outstanding. All three live behind a
//! single exclusive `.lock` file so two mirror processes never race on them.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use indexmirror_storage::Storage;
use indexmirror_types::{MirrorError, TodoList, CURRENT_GENERATION};

const GENERATION_FILE: &str = "generation";
const STATUS_FILE: &str = "status";
const TODO_FILE: &str = "todo";
const LOCK_FILE: &str = ".lock";

/// Older layout versions known to be safely migratable by discarding
/// `status`/`todo` and letting the next run do a full resync, rather than
/// refusing to start.
const MIGRATABLE_GENERATIONS: &[u32] = &[2, 3, 4];

fn io_err(context: &str, err: anyhow::Error) -> MirrorError {
    MirrorError::Io(format!("{context}: {err}"))
}

/// Parses a todo file body: first line is the target serial, remaining
/// non-empty lines are `"<normalized_name> <serial>"`.
fn parse_todofile(text: &str) -> Option<TodoList> {
    let mut lines = text.lines();
    let target_serial: u64 = lines.next()?.trim().parse().ok()?;
    let mut packages = std::collections::BTreeMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, serial) = line.split_once(' ')?;
        packages.insert(name.to_string(), serial.trim().parse().ok()?);
    }
    Some(TodoList {
        target_serial,
        packages,
    })
}

/// Handle onto a mirror's generation/status/todo/lock files.
pub struct StateStore<'s> {
    storage: &'s dyn Storage,
}

impl<'s> StateStore<'s> {
    pub fn new(storage: &'s dyn Storage) -> Self {
        Self { storage }
    }

    /// Bootstraps the `web/` tree's top-level directories. Safe to call on
    /// every run: `Storage::mkdir` is idempotent.
    pub fn init_dirs(&self, save_json: bool) -> Result<()> {
        self.storage
            .mkdir(Path::new("web/simple"))
            .context("failed to create web/simple")?;
        self.storage
            .mkdir(Path::new("web/packages"))
            .context("failed to create web/packages")?;
        if save_json {
            self.storage
                .mkdir(Path::new("web/json"))
                .context("failed to create web/json")?;
            self.storage
                .mkdir(Path::new("web/pypi"))
                .context("failed to create web/pypi")?;
        }
        Ok(())
    }

    /// Discards `status` and `todo`, forcing the next run to start from
    /// serial 0. Used on generation mismatch and on a corrupt todo file.
    pub fn reset(&self) -> Result<()> {
        self.storage
            .unlink(Path::new(STATUS_FILE))
            .context("failed to remove status file")?;
        self.storage
            .unlink(Path::new(TODO_FILE))
            .context("failed to remove todo file")?;
        Ok(())
    }

    pub fn clean_todo(&self) -> Result<()> {
        self.storage
            .unlink(Path::new(TODO_FILE))
            .context("failed to remove todo file")
    }

    /// Removes the todo file if it doesn't parse. A todo file is only ever
    /// truncated mid-write by a process that died between `rewrite` and
    /// `commit`, so treating anything unparseable as absent is safe.
    fn validate_todofile(&self) -> Result<()> {
        if !self.storage.exists(Path::new(TODO_FILE)) {
            return Ok(());
        }
        let bytes = self.storage.read(Path::new(TODO_FILE))?;
        let text = String::from_utf8_lossy(&bytes);
        if parse_todofile(&text).is_none() {
            self.storage
                .unlink(Path::new(TODO_FILE))
                .context("failed to remove inconsistent todo file")?;
        }
        Ok(())
    }

    /// The todo list left behind by an interrupted run, if any.
    pub fn load_todofile(&self) -> Result<Option<TodoList>> {
        self.validate_todofile()?;
        if !self.storage.exists(Path::new(TODO_FILE)) {
            return Ok(None);
        }
        let bytes = self.storage.read(Path::new(TODO_FILE))?;
        Ok(parse_todofile(&String::from_utf8_lossy(&bytes)))
    }

    pub fn update_todofile(&self, todo: &TodoList) -> Result<()> {
        let mut sink = self.storage.rewrite(Path::new(TODO_FILE))?;
        writeln!(sink, "{}", todo.target_serial)?;
        let lines: Vec<String> = todo
            .packages
            .iter()
            .map(|(name, serial)| format!("{name} {serial}"))
            .collect();
        write!(sink, "{}", lines.join("\n"))?;
        sink.commit()
    }

    pub fn get_status(&self) -> Result<Option<u64>> {
        if !self.storage.exists(Path::new(STATUS_FILE)) {
            return Ok(None);
        }
        let bytes = self.storage.read(Path::new(STATUS_FILE))?;
        let trimmed = String::from_utf8_lossy(&bytes).trim().to_string();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let serial: u64 = trimmed
            .parse()
            .with_context(|| format!("corrupt status file: {trimmed:?}"))?;
        Ok(if serial == 0 { None } else { Some(serial) })
    }

    pub fn update_status(&self, new_serial: u64) -> Result<()> {
        let mut sink = self.storage.rewrite(Path::new(STATUS_FILE))?;
        write!(sink, "{new_serial}")?;
        sink.commit()
    }

    fn get_generation(&self) -> Result<u32> {
        let bytes = self.storage.read(Path::new(GENERATION_FILE))?;
        String::from_utf8_lossy(&bytes)
            .trim()
            .parse::<u32>()
            .context("generation file does not contain an integer")
    }

    fn update_generation(&self, generation: u32) -> Result<()> {
        let mut sink = self.storage.rewrite(Path::new(GENERATION_FILE))?;
        write!(sink, "{generation}")?;
        sink.commit()
    }

    /// Acquires the exclusive lock, reconciles the on-disk generation
    /// (resetting status/todo on a migratable or missing generation), and
    /// returns the serial the previous run finished at (0 for a cold start).
    ///
    /// The lock is released when this call returns; it only guards the
    /// generation/status reconciliation, not the sync that follows.
    pub fn load_serial(&self, lock_timeout: Duration) -> Result<u64, MirrorError> {
        let _guard = self.storage.get_lock(Path::new(LOCK_FILE), lock_timeout)?;
        self.reconcile_generation_and_serial()
    }

    /// Same generation-reconciliation and serial-read as [`Self::load_serial`],
    /// but without acquiring the lock itself. For a caller that is already
    /// holding the session's exclusive lock for the whole run and would
    /// self-deadlock calling `load_serial` a second time.
    pub fn reconcile_generation_and_serial(&self) -> Result<u64, MirrorError> {
        let generation = if !self.storage.exists(Path::new(GENERATION_FILE)) {
            self.reset().map_err(|e| io_err("failed to reset state", e))?;
            CURRENT_GENERATION
        } else {
            match self.get_generation() {
                Ok(g) => g,
                Err(_) => {
                    self.reset().map_err(|e| io_err("failed to reset state", e))?;
                    CURRENT_GENERATION
                }
            }
        };

        let generation = if MIGRATABLE_GENERATIONS.contains(&generation) {
            self.reset().map_err(|e| io_err("failed to reset state", e))?;
            CURRENT_GENERATION
        } else {
            generation
        };

        if generation != CURRENT_GENERATION {
            return Err(MirrorError::UnknownGeneration {
                found: generation,
                expected: CURRENT_GENERATION,
            });
        }

        self.update_generation(CURRENT_GENERATION)
            .map_err(|e| io_err("failed to persist generation", e))?;

        self.get_status()
            .map_err(|e| io_err("failed to read status file", e))
            .map(|status| status.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmirror_storage::FileStorage;
    use std::collections::BTreeMap;

    fn store(dir: &std::path::Path) -> FileStorage {
        FileStorage::new(dir)
    }

    #[test]
    fn cold_start_has_no_status_and_serial_zero() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);
        assert_eq!(state.load_serial(Duration::from_millis(100)).unwrap(), 0);
        assert!(storage.exists(Path::new(GENERATION_FILE)));
    }

    #[test]
    fn status_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);
        state.update_status(42).unwrap();
        assert_eq!(state.get_status().unwrap(), Some(42));
    }

    #[test]
    fn todofile_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);

        let mut packages = BTreeMap::new();
        packages.insert("requests".to_string(), 100);
        packages.insert("flask".to_string(), 205);
        let todo = TodoList {
            target_serial: 999,
            packages,
        };
        state.update_todofile(&todo).unwrap();

        let loaded = state.load_todofile().unwrap().unwrap();
        assert_eq!(loaded, todo);
    }

    #[test]
    fn corrupt_todofile_is_discarded_not_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);

        let mut sink = storage.rewrite(Path::new(TODO_FILE)).unwrap();
        write!(sink, "not-a-number\ngarbage").unwrap();
        sink.commit().unwrap();

        assert_eq!(state.load_todofile().unwrap(), None);
        assert!(!storage.exists(Path::new(TODO_FILE)));
    }

    #[test]
    fn known_old_generation_triggers_reset_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);

        let mut sink = storage.rewrite(Path::new(GENERATION_FILE)).unwrap();
        write!(sink, "3").unwrap();
        sink.commit().unwrap();
        state.update_status(500).unwrap();

        let serial = state.load_serial(Duration::from_millis(100)).unwrap();
        assert_eq!(serial, 0, "migratable generation forces a full resync");

        let bytes = storage.read(Path::new(GENERATION_FILE)).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap().trim(), "5");
    }

    #[test]
    fn unknown_future_generation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);

        let mut sink = storage.rewrite(Path::new(GENERATION_FILE)).unwrap();
        write!(sink, "99").unwrap();
        sink.commit().unwrap();

        let err = state.load_serial(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            MirrorError::UnknownGeneration {
                found: 99,
                expected: 5
            }
        ));
    }

    #[test]
    fn init_dirs_creates_json_pypi_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);

        state.init_dirs(false).unwrap();
        assert!(storage.is_dir(Path::new("web/simple")));
        assert!(storage.is_dir(Path::new("web/packages")));
        assert!(!storage.exists(Path::new("web/json")));

        state.init_dirs(true).unwrap();
        assert!(storage.is_dir(Path::new("web/json")));
        assert!(storage.is_dir(Path::new("web/pypi")));
    }

    #[test]
    fn concurrent_load_serial_respects_lock() {
        let dir = tempfile::tempdir().unwrap();
        let storage = store(dir.path());
        let state = StateStore::new(&storage);

        let _first = storage
            .get_lock(Path::new(LOCK_FILE), Duration::from_millis(50))
            .unwrap();
        let err = state.load_serial(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, MirrorError::LockBusy { .. }));
    }
}
