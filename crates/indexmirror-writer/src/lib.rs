//! The metadata writer: renders PEP-503 simple pages and JSON metadata to
//! disk, byte-for-byte compatible with what the upstream mirror tooling
//! this was modeled on emits, since the on-disk layout is itself a stable
//! contract consumed by real package managers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use indexmirror_storage::Storage;
use indexmirror_types::{MirrorError, NormalizedName, Package};

/// Writer behavior that would otherwise be scattered `bool`/`Option`
/// parameters across every method.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Shard `web/simple/<name>` one level by the name's first character.
    pub hash_index: bool,
    /// Absolute prefix for download links; empty means the relative `../..`
    /// bandersnatch uses when serving the mirror from its own root.
    pub root_uri: String,
    /// Also mirror the raw upstream JSON metadata under `web/json/<name>`.
    pub save_json: bool,
    /// Which digest algorithm's hash is embedded in the simple-page anchor
    /// fragment (`#sha256=...`).
    pub digest_name: String,
    /// When > 0, simple pages are rotated into `versions/` and served via a
    /// symlink instead of being overwritten in place.
    pub keep_index_versions: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            hash_index: false,
            root_uri: String::new(),
            save_json: false,
            digest_name: "sha256".to_string(),
            keep_index_versions: 0,
        }
    }
}

/// Renders package metadata to the on-disk `web/` tree.
pub struct MetadataWriter<'s> {
    storage: &'s dyn Storage,
    config: WriterConfig,
    /// Every path this writer has committed, across all its methods, for
    /// the session driver's optional diff-file report.
    diff_file_list: std::sync::Mutex<Vec<PathBuf>>,
}

impl<'s> MetadataWriter<'s> {
    pub fn new(storage: &'s dyn Storage, config: WriterConfig) -> Self {
        Self {
            storage,
            config,
            diff_file_list: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn record_written(&self, path: &Path) {
        self.diff_file_list.lock().unwrap().push(path.to_path_buf());
    }

    /// Every path committed by this writer so far, in commit order.
    pub fn diff_file_list(&self) -> Vec<PathBuf> {
        self.diff_file_list.lock().unwrap().clone()
    }

    fn webdir(&self) -> PathBuf {
        PathBuf::from("web")
    }

    fn package_simple_directory(&self, name: &NormalizedName) -> PathBuf {
        let simple = self.webdir().join("simple");
        if self.config.hash_index {
            simple.join(name.shard_char().to_string()).join(name.as_str())
        } else {
            simple.join(name.as_str())
        }
    }

    /// Removes pre-PEP-503 simple directories left over from older mirror
    /// layouts: the raw (un-normalized) name, and the legacy "safe name"
    /// variant (`[^A-Za-z0-9.]+` collapsed to `-`, case preserved, distinct
    /// from PEP 503's all-lowercase normalization) — if they differ from the
    /// current PEP-503 directory.
    pub fn cleanup_non_pep_503_paths(&self, package: &Package) -> Result<()> {
        let current = self.package_simple_directory(&package.normalized_name);

        let shard_dir = |name: &str| -> PathBuf {
            let simple = self.webdir().join("simple");
            if self.config.hash_index {
                let shard = name.chars().next().unwrap_or('_').to_string();
                simple.join(shard).join(name)
            } else {
                simple.join(name)
            }
        };

        let raw_dir = shard_dir(&package.raw_name);
        let legacy_safe_dir = shard_dir(&legacy_safe_name(&package.raw_name));

        for candidate in [raw_dir, legacy_safe_dir] {
            if candidate == current {
                continue;
            }
            if self.storage.is_dir(&candidate) {
                self.remove_dir_recursive(&candidate)?;
            }
        }
        Ok(())
    }

    fn remove_dir_recursive(&self, dir: &Path) -> Result<()> {
        for entry in self.storage.iterdir(dir)? {
            if self.storage.is_dir(&entry) {
                self.remove_dir_recursive(&entry)?;
            } else {
                self.storage.unlink(&entry)?;
            }
        }
        self.storage.rmdir(dir)
    }

    fn gen_data_requires_python(requires_python: Option<&str>) -> String {
        match requires_python {
            Some(value) => format!(r#" data-requires-python="{}""#, html_escape_attr(value)),
            None => String::new(),
        }
    }

    /// Serializes `package.metadata` as sorted, 4-space-indented JSON to
    /// `web/json/<name>`, and points `web/pypi/<name>/json` at it via
    /// symlink. Returns the path written so the caller can fold it into the
    /// run's diff file list.
    pub fn save_json_metadata_for_package(&self, package: &Package) -> Result<PathBuf> {
        let json_path = self
            .webdir()
            .join("json")
            .join(package.normalized_name.as_str());

        let body = serde_json::to_vec_pretty(&sorted_json(&package.metadata))
            .context("failed to serialize package metadata")?;
        let mut sink = self.storage.rewrite(&json_path)?;
        std::io::Write::write_all(&mut sink, &body)?;
        sink.commit()?;

        let symlink_path = self
            .webdir()
            .join("pypi")
            .join(package.normalized_name.as_str())
            .join("json");
        self.storage.symlink(&json_path, &symlink_path)?;
        self.record_written(&json_path);

        Ok(json_path)
    }

    /// Builds the simple-page HTML body for one package, byte-exact
    /// (indentation, `<br/>`, trailing `<!--SERIAL n-->` with no newline
    /// after it) with what real Simple API consumers expect.
    pub fn generate_simple_page_for_package(&self, package: &Package) -> Result<String, MirrorError> {
        let mut files = package.release_files();
        files.sort_by(|a, b| a.filename.cmp(&b.filename));

        let mut body = format!(
            "<!DOCTYPE html>\n<html>\n  <head>\n    <title>Links for {0}</title>\n  </head>\n  <body>\n    <h1>Links for {0}</h1>\n",
            package.raw_name
        );

        let lines: Result<Vec<String>, MirrorError> = files
            .iter()
            .map(|file| {
                let local_url = self.file_url_to_local_url(&file.url)?;
                let digest = file
                    .digests
                    .get(&self.config.digest_name)
                    .unwrap_or_default();
                Ok(format!(
                    r#"    <a href="{}#{}={}"{}>{}</a><br/>"#,
                    local_url,
                    self.config.digest_name,
                    digest,
                    Self::gen_data_requires_python(file.requires_python.as_deref()),
                    file.filename
                ))
            })
            .collect();
        body.push_str(&lines?.join("\n"));
        body.push_str(&format!("\n  </body>\n</html>\n<!--SERIAL {}-->", package.serial));
        Ok(body)
    }

    /// Writes the package's simple page, rotating through `versions/` when
    /// `keep_index_versions > 0`. Returns the path(s) written.
    pub fn write_simple_page(&self, package: &Package) -> Result<Vec<PathBuf>, MirrorError> {
        let content = self.generate_simple_page_for_package(package)?;
        let dir = self.package_simple_directory(&package.normalized_name);
        self.storage
            .mkdir(&dir)
            .map_err(|e| MirrorError::Io(e.to_string()))?;

        if self.config.keep_index_versions > 0 {
            self.save_simple_page_version(&content, package, &dir)
        } else {
            let simple_page = dir.join("index.html");
            let mut sink = self
                .storage
                .rewrite(&simple_page)
                .map_err(|e| MirrorError::Io(e.to_string()))?;
            std::io::Write::write_all(&mut sink, content.as_bytes())
                .map_err(|e| MirrorError::Io(e.to_string()))?;
            sink.commit().map_err(|e| MirrorError::Io(e.to_string()))?;
            self.record_written(&simple_page);
            Ok(vec![simple_page])
        }
    }

    fn save_simple_page_version(
        &self,
        content: &str,
        package: &Package,
        package_dir: &Path,
    ) -> Result<Vec<PathBuf>, MirrorError> {
        let versions_path = self
            .prepare_versions_path(package_dir)
            .map_err(|e| MirrorError::Io(e.to_string()))?;

        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let version_file = versions_path.join(format!("index_{}_{timestamp}.html", package.serial));

        let mut sink = self
            .storage
            .rewrite(&version_file)
            .map_err(|e| MirrorError::Io(e.to_string()))?;
        std::io::Write::write_all(&mut sink, content.as_bytes())
            .map_err(|e| MirrorError::Io(e.to_string()))?;
        sink.commit().map_err(|e| MirrorError::Io(e.to_string()))?;

        let symlink_path = package_dir.join("index.html");
        self.storage
            .symlink(&version_file, &symlink_path)
            .map_err(|e| MirrorError::Io(e.to_string()))?;
        self.record_written(&version_file);

        Ok(vec![version_file])
    }

    /// Ensures `<package_dir>/versions/` exists and holds at most
    /// `keep_index_versions` files *after* the new one lands: existing
    /// files are sorted by name and `len - keep + 1` are deleted from the
    /// front *before* the caller writes the new file, so the directory
    /// holds exactly `keep_index_versions` once the new file is written.
    fn prepare_versions_path(&self, package_dir: &Path) -> Result<PathBuf> {
        let versions_path = package_dir.join("versions");
        if !self.storage.exists(&versions_path) {
            self.storage.mkdir(&versions_path)?;
        } else {
            let mut version_files = self.storage.iterdir(&versions_path)?;
            version_files.sort();
            let keep = self.config.keep_index_versions as i64;
            let to_remove = (version_files.len() as i64 - keep + 1).max(0) as usize;
            for path in version_files.into_iter().take(to_remove) {
                self.storage.unlink(&path)?;
            }
        }
        Ok(versions_path)
    }

    /// Rewrites a `/packages/...` download URL into a link relative to the
    /// simple page (or absolute, under `root_uri`). Any URL not rooted at
    /// `/packages` is rejected as corrupt upstream data.
    pub fn file_url_to_local_url(&self, url: &str) -> Result<String, MirrorError> {
        let parsed = url::Url::parse(url).map_err(|_| MirrorError::InvalidDownloadUrl {
            url: url.to_string(),
        })?;
        let path = parsed.path();
        if !path.starts_with("/packages") {
            return Err(MirrorError::InvalidDownloadUrl {
                url: url.to_string(),
            });
        }
        let prefix = if self.config.root_uri.is_empty() {
            "../.."
        } else {
            self.config.root_uri.as_str()
        };
        Ok(format!("{prefix}{path}"))
    }

    /// Resolves a `/packages/...` download URL to the local path it should
    /// be written to, under `web/`.
    pub fn file_url_to_local_path(&self, url: &str) -> Result<PathBuf, MirrorError> {
        let parsed = url::Url::parse(url).map_err(|_| MirrorError::InvalidDownloadUrl {
            url: url.to_string(),
        })?;
        let path = parsed.path();
        if !path.starts_with("/packages") {
            return Err(MirrorError::InvalidDownloadUrl {
                url: url.to_string(),
            });
        }
        Ok(self.webdir().join(path.trim_start_matches('/')))
    }

    /// Simple-index subdirectories to scan when building the global index:
    /// one level of shard directories under `hash_index`, or the `simple`
    /// directory itself otherwise.
    fn simple_dirs(&self, simple_dir: &Path) -> Result<Vec<PathBuf>> {
        if self.config.hash_index {
            Ok(self
                .storage
                .iterdir(simple_dir)?
                .into_iter()
                .filter(|p| self.storage.is_dir(p))
                .collect())
        } else {
            Ok(vec![simple_dir.to_path_buf()])
        }
    }

    /// Normalized package names found as subdirectories of `dir`, sorted.
    fn package_indexes_in_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .storage
            .iterdir(dir)?
            .into_iter()
            .filter(|p| self.storage.is_dir(p))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .map(|raw| indexmirror_types::normalize_name(&raw))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Writes `web/simple/index.html`: one `<a href="<name>/">` per
    /// normalized package name found on disk, sorted. Returns the path
    /// written, or `None` if `need_index_sync` was false.
    pub fn write_index_page(&self, need_index_sync: bool) -> Result<Option<PathBuf>> {
        if !need_index_sync {
            return Ok(None);
        }
        let simple_dir = self.webdir().join("simple");
        let mut body = String::from(
            "<!DOCTYPE html>\n<html>\n  <head>\n    <title>Simple Index</title>\n  </head>\n  <body>\n",
        );
        for subdir in self.simple_dirs(&simple_dir)? {
            for name in self.package_indexes_in_dir(&subdir)? {
                body.push_str(&format!("    <a href=\"{name}/\">{name}</a><br/>\n"));
            }
        }
        body.push_str("  </body>\n</html>");

        let index_path = simple_dir.join("index.html");
        let mut sink = self.storage.rewrite(&index_path)?;
        std::io::Write::write_all(&mut sink, body.as_bytes())?;
        sink.commit()?;
        self.record_written(&index_path);
        Ok(Some(index_path))
    }
}

/// Recursively sorts object keys so `serde_json::to_vec_pretty` produces a
/// stable, sorted-keys document (`serde_json::Value`'s default `Map` is
/// insertion-ordered, not sorted).
fn sorted_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sorted_json(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sorted_json).collect())
        }
        other => other.clone(),
    }
}

/// Pre-PEP-503 "safe name" normalization: runs of anything but
/// `[A-Za-z0-9.]` collapsed to a single `-`, case preserved. Distinct from
/// [`indexmirror_types::normalize_name`], which also lowercases — mirrors
/// the legacy directory a pre-4.0 mirror left on disk for clients that
/// hadn't caught up to PEP 503 yet.
fn legacy_safe_name(raw_name: &str) -> String {
    let mut out = String::with_capacity(raw_name.len());
    let mut last_was_sep = false;
    for ch in raw_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    out
}

fn html_escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
