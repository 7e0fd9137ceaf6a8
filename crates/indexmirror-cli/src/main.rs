mod config;
mod progress;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use indexmirror_client::HttpMaster;
use indexmirror_core::{MirrorConfig, NullReporter, Reporter};
use indexmirror_filter::{FilterChain, NameRegexFilter, PrereleaseFilter};
use indexmirror_state::StateStore;
use indexmirror_storage::{FileStorage, Storage};

use crate::config::FileConfig;
use crate::progress::CliReporter;

#[derive(Parser, Debug)]
#[command(name = "indexmirror", version)]
#[command(about = "Incremental, crash-safe mirror of a PyPI-Simple-API-shaped package index")]
struct Cli {
    /// Directory the mirror's `web/` tree and state files live under.
    #[arg(long, default_value = ".")]
    home_dir: PathBuf,

    /// Upstream index base URL.
    #[arg(long, default_value = "https://pypi.org")]
    upstream: String,

    /// Path to a TOML config file layered on top of built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bounded worker pool size, 1..=10.
    #[arg(long)]
    workers: Option<u8>,

    /// Abort as soon as one package fails instead of continuing.
    #[arg(long)]
    stop_on_error: bool,

    /// Shard `web/simple/<name>` one level by first character.
    #[arg(long)]
    hash_index: bool,

    /// Also mirror upstream's raw JSON metadata under `web/json/<name>`.
    #[arg(long)]
    save_json: bool,

    /// Prune legacy (pre-PEP-503) simple directories after each package.
    #[arg(long)]
    cleanup: bool,

    /// Drop pre-release versions (alpha/beta/rc/dev) from every package.
    #[arg(long)]
    exclude_prerelease: bool,

    /// Only mirror packages whose normalized name matches this regex
    /// (repeatable; a name must match at least one to pass).
    #[arg(long = "allow-project")]
    allow_projects: Vec<String>,

    /// Never mirror packages whose normalized name matches this regex
    /// (repeatable).
    #[arg(long = "block-project")]
    block_projects: Vec<String>,

    /// Where to write the newline-separated list of files this run altered.
    #[arg(long)]
    diff_file: Option<PathBuf>,

    /// Append the run's start time (epoch seconds) to `--diff-file`'s name.
    #[arg(long)]
    diff_file_append_epoch: bool,

    /// Suppress the progress spinner even on a TTY.
    #[arg(long)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync pass (incremental unless the mirror is empty).
    Sync {
        /// Sync only these packages, ignoring the changelog and todo file,
        /// without advancing the recorded serial.
        #[arg(long = "package")]
        packages: Vec<String>,
    },
    /// Print the last serial this mirror fully synced.
    Status,
    /// Discard `status`/`todo`, forcing the next sync to start from scratch.
    Reset,
}

fn build_filters(cli: &Cli) -> Result<FilterChain> {
    let mut chain = FilterChain::new();
    if cli.exclude_prerelease {
        chain = chain.with_release_filter(PrereleaseFilter::new());
    }
    for pattern in &cli.allow_projects {
        chain = chain.with_project_filter(
            NameRegexFilter::allowlist(pattern)
                .with_context(|| format!("invalid --allow-project regex: {pattern}"))?,
        );
    }
    for pattern in &cli.block_projects {
        chain = chain.with_project_filter(
            NameRegexFilter::blocklist(pattern)
                .with_context(|| format!("invalid --block-project regex: {pattern}"))?,
        );
    }
    Ok(chain)
}

fn build_config(cli: &Cli) -> Result<MirrorConfig> {
    let mut config = match &cli.config {
        Some(path) => FileConfig::load(path)?.apply(MirrorConfig::default())?,
        None => MirrorConfig::default(),
    };

    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.stop_on_error = config.stop_on_error || cli.stop_on_error;
    config.hash_index = config.hash_index || cli.hash_index;
    config.save_json = config.save_json || cli.save_json;
    config.cleanup = config.cleanup || cli.cleanup;
    if let Some(diff_file) = &cli.diff_file {
        config.diff_file = Some(diff_file.clone());
    }
    config.diff_file_append_epoch = config.diff_file_append_epoch || cli.diff_file_append_epoch;

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.cmd {
        Commands::Sync { packages } => run_sync_command(&cli, packages.clone()).await,
        Commands::Status => run_status(&cli),
        Commands::Reset => run_reset(&cli),
    }
}

async fn run_sync_command(cli: &Cli, packages: Vec<String>) -> Result<()> {
    let storage = FileStorage::new(cli.home_dir.clone());
    let filters = build_filters(cli)?;
    let config = build_config(cli)?;
    let master = HttpMaster::with_timeout(cli.upstream.clone(), config.request_timeout)
        .context("failed to build upstream client")?;
    let explicit_packages = if packages.is_empty() { None } else { Some(packages) };

    let cancel = tokio_util::sync::CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    let mut reporter: Box<dyn Reporter> = if cli.quiet {
        Box::new(NullReporter)
    } else {
        Box::new(CliReporter::new())
    };

    let outcome = indexmirror_core::run_sync(
        &storage,
        &master,
        &filters,
        config,
        explicit_packages,
        reporter.as_mut(),
        cancel,
    )
    .await
    .context("sync failed")?;

    println!("synced_serial: {}", outcome.sync.synced_serial);
    println!("target_serial: {}", outcome.sync.target_serial);
    println!("errors: {}", outcome.sync.errors);
    if let Some(path) = &outcome.diff_file_written {
        println!("diff_file: {}", path.display());
    }

    if outcome.sync.errors {
        anyhow::bail!("one or more packages failed to sync");
    }
    Ok(())
}

fn run_status(cli: &Cli) -> Result<()> {
    let storage = FileStorage::new(cli.home_dir.clone());
    let state = StateStore::new(&storage);
    match state.get_status().context("failed to read status file")? {
        Some(serial) => println!("last synced serial: {serial}"),
        None => println!("no successful sync recorded yet"),
    }
    Ok(())
}

fn run_reset(cli: &Cli) -> Result<()> {
    let storage = FileStorage::new(cli.home_dir.clone());
    let _lock = storage
        .get_lock(std::path::Path::new(".lock"), Duration::from_secs(5))
        .context("failed to acquire session lock")?;
    let state = StateStore::new(&storage);
    state.reset().context("failed to reset mirror state")?;
    println!("state reset; the next sync will start from serial 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_filters_rejects_invalid_regex() {
        let cli = Cli::parse_from([
            "indexmirror",
            "--allow-project",
            "(unclosed",
            "sync",
        ]);
        assert!(build_filters(&cli).is_err());
    }

    #[test]
    fn build_filters_accepts_valid_allow_and_block_patterns() {
        let cli = Cli::parse_from([
            "indexmirror",
            "--allow-project",
            "^allowed-",
            "--block-project",
            "^blocked-",
            "sync",
        ]);
        let chain = build_filters(&cli).unwrap();
        assert!(chain.accepts_project("allowed-pkg"));
        assert!(!chain.accepts_project("blocked-thing"));
        assert!(!chain.accepts_project("neither-allowed-nor-blocked"));
    }

    #[test]
    fn build_config_applies_cli_flags_on_top_of_defaults() {
        let cli = Cli::parse_from([
            "indexmirror",
            "--workers",
            "7",
            "--save-json",
            "sync",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.workers, 7);
        assert!(config.save_json);
    }

    #[test]
    fn build_config_rejects_unreadable_config_file() {
        let cli = Cli::parse_from([
            "indexmirror",
            "--config",
            "/definitely/not/a/real/path.toml",
            "sync",
        ]);
        assert!(build_config(&cli).is_err());
    }

    proptest::proptest! {
        /// Any anchored prefix pattern accepts names sharing that prefix and
        /// rejects names that don't, regardless of what the prefix actually is.
        #[test]
        fn allow_project_prefix_pattern_matches_only_that_prefix(prefix in "[a-z][a-z0-9-]{0,12}") {
            let pattern = format!("^{prefix}-");
            let cli = Cli::parse_from([
                "indexmirror",
                "--allow-project",
                &pattern,
                "sync",
            ]);
            let chain = build_filters(&cli).unwrap();
            proptest::prop_assert!(chain.accepts_project(&format!("{prefix}-anything")));
            proptest::prop_assert!(!chain.accepts_project(&format!("not-{prefix}-anything")));
        }

        /// `--workers` always round-trips verbatim into the resulting config.
        #[test]
        fn build_config_workers_round_trips(workers in 1u8..=255) {
            let cli = Cli::parse_from([
                "indexmirror",
                "--workers",
                &workers.to_string(),
                "sync",
            ]);
            let config = build_config(&cli).unwrap();
            proptest::prop_assert_eq!(config.workers, workers);
        }
    }
}
