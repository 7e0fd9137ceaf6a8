//! The upstream client: a `Master` trait abstracting "ask an index what
//! changed" and "fetch one package's metadata/files", plus `HttpMaster`,
//! the shipped implementation against a PyPI-Simple-API-shaped upstream.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use indexmirror_retry::{calculate_delay, RetryStrategyConfig};
use indexmirror_types::{MirrorError, Package};

/// A boxed, owned byte stream — what `Master::stream` hands to the
/// synchronizer for chunked, hashed writing to storage.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, anyhow::Error>> + Send>>;

/// The upstream collaborator the orchestrator drives. Implementations must
/// be safe to share across concurrent workers.
#[async_trait]
pub trait Master: Send + Sync {
    /// Every known package and a serial hint for it. Called once, on a cold
    /// start (`synced_serial == 0`).
    async fn all_packages(&self) -> anyhow::Result<BTreeMap<String, u64>>;

    /// Packages that changed since `since`, and a serial hint for each.
    /// Called on every incremental run.
    async fn changed_packages(&self, since: u64) -> anyhow::Result<BTreeMap<String, u64>>;

    /// Fetches one package's metadata, retrying transient failures up to
    /// `attempts` times. A definitive "this package doesn't exist upstream"
    /// response surfaces as `MirrorError::PackageNotFound` so the
    /// orchestrator can skip it silently rather than count it as an error.
    async fn get_metadata(&self, name: &str, attempts: u32) -> Result<Package, MirrorError>;

    /// Streams the body at `url`. When `required_serial` is set, the
    /// implementation should verify the response reflects at least that
    /// serial (e.g. via an `X-PyPI-Last-Serial`-style header) before handing
    /// back the stream, to avoid mirroring a file against a stale replica.
    async fn stream(&self, url: &str, required_serial: Option<u64>) -> anyhow::Result<ByteStream>;
}

const LAST_SERIAL_HEADER: &str = "x-pypi-last-serial";

/// `HttpMaster`'s default retry behavior for `get_metadata`/`stream`.
fn default_retry() -> RetryStrategyConfig {
    indexmirror_retry::RetryPolicy::Default.to_config()
}

/// The shipped [`Master`] implementation: talks to a PyPI-Simple-API-shaped
/// upstream over HTTP.
pub struct HttpMaster {
    base_url: String,
    http: reqwest::Client,
    retry: RetryStrategyConfig,
}

impl HttpMaster {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(60))
    }

    /// Builds a client whose per-request timeout (connect + body, matching
    /// §5's "a per-request timeout ... bound the run") is `request_timeout`
    /// rather than the default 60s.
    pub fn with_timeout(base_url: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("indexmirror/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            retry: default_retry(),
        })
    }

    pub fn with_retry(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    fn last_serial(resp: &reqwest::Response) -> Option<u64> {
        resp.headers()
            .get(LAST_SERIAL_HEADER)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

#[derive(serde::Deserialize)]
struct SimpleIndexProject {
    name: String,
}

#[derive(serde::Deserialize)]
struct SimpleIndexResponse {
    projects: Vec<SimpleIndexProject>,
}

#[derive(serde::Deserialize)]
struct ChangelogEntry {
    name: String,
    serial: u64,
}

#[async_trait]
impl Master for HttpMaster {
    async fn all_packages(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        let url = format!("{}/simple/", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("accept", "application/vnd.pypi.simple.v1+json")
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("non-success status from {url}"))?;

        // A package's individual serial isn't known from the index listing
        // alone; the upstream's current global serial is a safe upper-bound
        // hint (the authoritative per-package serial is established when
        // `get_metadata` is called during SYNC).
        let serial_hint = Self::last_serial(&resp).unwrap_or(0);
        let body: SimpleIndexResponse = resp
            .json()
            .await
            .with_context(|| format!("failed to parse simple index JSON from {url}"))?;

        Ok(body
            .projects
            .into_iter()
            .map(|p| (indexmirror_types::normalize_name(&p.name), serial_hint))
            .collect())
    }

    async fn changed_packages(&self, since: u64) -> anyhow::Result<BTreeMap<String, u64>> {
        let url = format!("{}/changelog/since/{since}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("non-success status from {url}"))?;

        let entries: Vec<ChangelogEntry> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse changelog JSON from {url}"))?;

        let mut out = BTreeMap::new();
        for entry in entries {
            let name = indexmirror_types::normalize_name(&entry.name);
            out.entry(name)
                .and_modify(|s: &mut u64| *s = (*s).max(entry.serial))
                .or_insert(entry.serial);
        }
        Ok(out)
    }

    async fn get_metadata(&self, name: &str, attempts: u32) -> Result<Package, MirrorError> {
        let url = format!("{}/pypi/{}/json", self.base_url, name);
        let attempts = attempts.max(1);

        let mut attempt = 1;
        loop {
            let outcome = async {
                let resp = self
                    .http
                    .get(&url)
                    .header("accept", "application/json")
                    .send()
                    .await
                    .map_err(|e| MirrorError::Io(format!("request to {url} failed: {e}")))?;

                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(MirrorError::PackageNotFound {
                        name: name.to_string(),
                    });
                }
                let resp = resp.error_for_status().map_err(|e| {
                    MirrorError::Io(format!("non-success status from {url}: {e}"))
                })?;

                let serial = Self::last_serial(&resp).unwrap_or(0);
                let metadata: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| MirrorError::Io(format!("invalid JSON from {url}: {e}")))?;

                parse_package(name, serial, metadata)
            }
            .await;

            match outcome {
                Ok(package) => return Ok(package),
                Err(MirrorError::PackageNotFound { name }) => {
                    return Err(MirrorError::PackageNotFound { name })
                }
                Err(err) if attempt >= attempts => return Err(err),
                Err(_) => {
                    tokio::time::sleep(calculate_delay(&self.retry, attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn stream(&self, url: &str, required_serial: Option<u64>) -> anyhow::Result<ByteStream> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to GET {url}"))?
            .error_for_status()
            .with_context(|| format!("non-success status from {url}"))?;

        if let Some(required) = required_serial {
            let actual = Self::last_serial(&resp).unwrap_or(0);
            anyhow::ensure!(
                actual >= required,
                "stale response from {url}: serial {actual} < required {required}"
            );
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }
}

/// Builds a [`Package`] from an upstream JSON document shaped like PyPI's
/// `GET /pypi/<name>/json` response: `{"info": {...}, "releases": {version:
/// [{"url", "filename", "digests", "requires_python", "size"}]}}`.
fn parse_package(
    raw_name: &str,
    serial: u64,
    metadata: serde_json::Value,
) -> Result<Package, MirrorError> {
    let display_name = metadata
        .get("info")
        .and_then(|info| info.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or(raw_name);
    let mut package = Package::new(display_name, serial, metadata.clone());

    let releases = metadata
        .get("releases")
        .and_then(|v| v.as_object())
        .ok_or_else(|| MirrorError::Io(format!("{raw_name}: metadata has no 'releases' object")))?;

    for (version, files) in releases {
        let Some(files) = files.as_array() else {
            continue;
        };
        let mut parsed_files = Vec::with_capacity(files.len());
        for file in files {
            let release_file: indexmirror_types::ReleaseFile = serde_json::from_value(file.clone())
                .map_err(|e| {
                    MirrorError::Io(format!(
                        "{raw_name} {version}: malformed release file entry: {e}"
                    ))
                })?;
            parsed_files.push(release_file);
        }
        package.releases.insert(version.clone(), parsed_files);
    }

    Ok(package)
}
