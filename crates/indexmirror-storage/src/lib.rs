//! The `Storage` trait: the path abstraction, atomic-rewrite, hashing, and
//! locking primitives every other indexmirror crate is built on.
//! `FileStorage` is the shipped local-filesystem implementation.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmirror_types::MirrorError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Diagnostic sidecar written alongside an acquired lock, purely so an
/// operator hitting `LockBusy` can tell who's holding it and since when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
        }
    }
}

fn lock_info_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".info.json");
    PathBuf::from(name)
}

/// A scoped writable sink returned by [`Storage::rewrite`]. Bytes written go
/// to a temporary file; the destination path is only replaced when
/// [`RewriteSink::commit`] is called. Dropping the sink without committing
/// discards the temporary file, so a verification failure never leaves a
/// partial file at the destination.
pub trait RewriteSink: Write {
    fn commit(self: Box<Self>) -> Result<()>;
}

/// An exclusive lock held for the lifetime of the guard. Released on drop.
pub trait LockGuard: Send {}

/// Path + atomic-rewrite + hash + lock abstraction over a storage backend.
///
/// Everything the mirroring engine needs from disk (or, for a future
/// non-filesystem backend, from whatever the backend fronts) goes through
/// this trait so the engine never calls `std::fs` directly.
pub trait Storage: Send + Sync {
    /// Root directory this storage is scoped to (`HOMEDIR`).
    fn root(&self) -> &Path;

    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;

    /// Non-recursive directory listing. Empty if `path` doesn't exist.
    fn iterdir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    fn unlink(&self, path: &Path) -> Result<()>;

    /// Create `path` and all missing parent directories.
    fn mkdir(&self, path: &Path) -> Result<()>;

    /// Remove the (expected to be empty) directory at `path`. A no-op if
    /// `path` doesn't exist.
    fn rmdir(&self, path: &Path) -> Result<()>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Hex-encoded sha256 of the file at `path`.
    fn get_hash(&self, path: &Path) -> Result<String>;

    /// Open a scoped atomic-write sink for `path`. Creates parent
    /// directories as needed. The destination is replaced only on
    /// `commit()`.
    fn rewrite(&self, path: &Path) -> Result<Box<dyn RewriteSink + '_>>;

    /// Replace `link` with a symlink pointing at `target`, removing any
    /// existing file/symlink at `link` first.
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    /// Acquire an exclusive lock on `path`, waiting up to `timeout`.
    fn get_lock(&self, path: &Path, timeout: Duration) -> Result<Box<dyn LockGuard>, MirrorError>;
}

/// The default, local-filesystem `Storage` implementation.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

struct FileRewriteSink {
    tmp_path: PathBuf,
    dest_path: PathBuf,
    file: fs::File,
}

impl Write for FileRewriteSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl RewriteSink for FileRewriteSink {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.file.flush().context("failed to flush temp file")?;
        self.file.sync_all().context("failed to fsync temp file")?;
        fs::rename(&self.tmp_path, &self.dest_path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                self.tmp_path.display(),
                self.dest_path.display()
            )
        })?;
        Ok(())
    }
}

impl Drop for FileRewriteSink {
    fn drop(&mut self) {
        // Best-effort: an uncommitted sink never leaves a file at the
        // destination path, only (possibly) an orphaned temp file.
        let _ = fs::remove_file(&self.tmp_path);
    }
}

struct FileLockGuard {
    _file: fs::File,
    path: PathBuf,
}

impl LockGuard for FileLockGuard {}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        use fs2::FileExt;
        let _ = FileExt::unlock(&self._file);
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(lock_info_path(&self.path));
    }
}

impl Storage for FileStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    fn exists(&self, path: &Path) -> bool {
        self.full(path).exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.full(path).is_dir()
    }

    fn iterdir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let full = self.full(path);
        if !full.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full)
            .with_context(|| format!("failed to read directory {}", full.display()))?
        {
            entries.push(entry?.path());
        }
        Ok(entries)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        let full = self.full(path);
        if full.exists() || full.symlink_metadata().is_ok() {
            fs::remove_file(&full)
                .with_context(|| format!("failed to remove {}", full.display()))?;
        }
        Ok(())
    }

    fn mkdir(&self, path: &Path) -> Result<()> {
        let full = self.full(path);
        fs::create_dir_all(&full)
            .with_context(|| format!("failed to create directory {}", full.display()))
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        let full = self.full(path);
        if full.exists() {
            fs::remove_dir(&full)
                .with_context(|| format!("failed to remove directory {}", full.display()))?;
        }
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.full(path);
        fs::read(&full).with_context(|| format!("failed to read {}", full.display()))
    }

    fn get_hash(&self, path: &Path) -> Result<String> {
        let full = self.full(path);
        let bytes = fs::read(&full).with_context(|| format!("failed to hash {}", full.display()))?;
        let digest = Sha256::digest(&bytes);
        Ok(hex::encode(digest))
    }

    fn rewrite(&self, path: &Path) -> Result<Box<dyn RewriteSink + '_>> {
        let dest_path = self.full(path);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let tmp_name = format!(
            ".{}.tmp-{}",
            dest_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("rewrite"),
            std::process::id()
        );
        let tmp_path = dest_path.with_file_name(tmp_name);
        let file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file {}", tmp_path.display()))?;
        Ok(Box::new(FileRewriteSink {
            tmp_path,
            dest_path,
            file,
        }))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let full_link = self.full(link);
        if let Some(parent) = full_link.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        if full_link.exists() || full_link.symlink_metadata().is_ok() {
            fs::remove_file(&full_link)
                .with_context(|| format!("failed to remove existing {}", full_link.display()))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &full_link).with_context(|| {
            format!(
                "failed to symlink {} -> {}",
                full_link.display(),
                target.display()
            )
        })?;
        #[cfg(not(unix))]
        fs::copy(target, &full_link).with_context(|| {
            format!(
                "failed to copy {} -> {} (non-unix symlink fallback)",
                target.display(),
                full_link.display()
            )
        })
        .map(|_| ())?;
        Ok(())
    }

    fn get_lock(&self, path: &Path, timeout: Duration) -> Result<Box<dyn LockGuard>, MirrorError> {
        use fs2::FileExt;

        let full = self.full(path);
        if let Some(parent) = full.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&full)
            .map_err(|_| MirrorError::LockBusy {
                path: full.display().to_string(),
            })?;

        let deadline = Instant::now() + timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    if let Ok(json) = serde_json::to_vec_pretty(&LockInfo::current()) {
                        let _ = fs::write(lock_info_path(&full), json);
                    }
                    return Ok(Box::new(FileLockGuard { _file: file, path: full }));
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(_) => {
                    return Err(MirrorError::LockBusy {
                        path: full.display().to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_commit_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let rel = Path::new("web/simple/foo/index.html");

        {
            let mut sink = storage.rewrite(rel).unwrap();
            sink.write_all(b"hello").unwrap();
            sink.commit().unwrap();
        }

        assert_eq!(storage.read(rel).unwrap(), b"hello");
    }

    #[test]
    fn rewrite_without_commit_leaves_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let rel = Path::new("web/simple/foo/index.html");

        {
            let mut sink = storage.rewrite(rel).unwrap();
            sink.write_all(b"half-written").unwrap();
            // Dropped without commit.
        }

        assert!(!storage.exists(rel));
        // No leftover temp files either.
        let parent = dir.path().join("web/simple/foo");
        let leftovers: Vec<_> = fs::read_dir(&parent).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn rewrite_overwrites_existing_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let rel = Path::new("status");

        storage.rewrite(rel).unwrap().write_all(b"1").map(|_| ()).unwrap();
        let mut sink = storage.rewrite(rel).unwrap();
        sink.write_all(b"1").unwrap();
        sink.commit().unwrap();

        let mut sink2 = storage.rewrite(rel).unwrap();
        sink2.write_all(b"2").unwrap();
        sink2.commit().unwrap();

        assert_eq!(storage.read(rel).unwrap(), b"2");
    }

    #[test]
    fn get_hash_matches_sha256_of_contents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let rel = Path::new("pkg.tgz");
        let mut sink = storage.rewrite(rel).unwrap();
        sink.write_all(b"package bytes").unwrap();
        sink.commit().unwrap();

        let expected = hex::encode(Sha256::digest(b"package bytes"));
        assert_eq!(storage.get_hash(rel).unwrap(), expected);
    }

    #[test]
    fn iterdir_on_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.iterdir(Path::new("nope")).unwrap().is_empty());
    }

    #[test]
    fn lock_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let lock_path = Path::new(".lock");

        let _first = storage.get_lock(lock_path, Duration::from_millis(50)).unwrap();
        let second = storage.get_lock(lock_path, Duration::from_millis(100));
        assert!(matches!(second, Err(MirrorError::LockBusy { .. })));
    }

    #[test]
    fn lock_writes_and_cleans_up_info_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let lock_path = Path::new(".lock");
        let info_path = dir.path().join(".lock.info.json");

        {
            let _guard = storage.get_lock(lock_path, Duration::from_millis(50)).unwrap();
            let contents = fs::read_to_string(&info_path).unwrap();
            assert!(contents.contains("\"pid\""));
        }
        assert!(!info_path.exists());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let lock_path = Path::new(".lock");

        {
            let _guard = storage.get_lock(lock_path, Duration::from_millis(50)).unwrap();
        }
        let second = storage.get_lock(lock_path, Duration::from_millis(50));
        assert!(second.is_ok());
    }
}
