//! Progress reporting with TTY detection.
//!
//! Mirrors a package index one project at a time, and unlike a fixed-length
//! publish queue the total isn't known until DISCOVER and FILTER have run, so
//! this shows a spinner with the latest status line rather than a bar with a
//! known denominator.

use std::time::Instant;

use atty::Stream;
use indexmirror_core::Reporter;
use indicatif::{ProgressBar, ProgressStyle};

pub fn is_tty() -> bool {
    atty::is(Stream::Stderr)
}

/// [`Reporter`] that drives an `indicatif` spinner in TTY mode and falls back
/// to plain `eprintln!` lines otherwise.
pub struct CliReporter {
    is_tty: bool,
    spinner: Option<ProgressBar>,
    start_time: Instant,
}

impl CliReporter {
    pub fn new() -> Self {
        let is_tty = is_tty();
        let spinner = if is_tty {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            spinner,
            start_time: Instant::now(),
        }
    }

    /// Disables the spinner regardless of TTY, for `--quiet` runs.
    pub fn silent() -> Self {
        Self {
            is_tty: false,
            spinner: None,
            start_time: Instant::now(),
        }
    }

    pub fn finish(self) {
        let elapsed = self.start_time.elapsed();
        if let Some(pb) = self.spinner {
            pb.finish_with_message(format!("done in {elapsed:?}"));
        } else if self.is_tty {
            // unreachable: is_tty implies spinner is Some
        } else {
            eprintln!("[status] done in {elapsed:?}");
        }
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if let Some(ref pb) = self.spinner {
            pb.set_message(msg.to_string());
        } else {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        if let Some(ref pb) = self.spinner {
            pb.println(format!("[warn] {msg}"));
        } else {
            eprintln!("[warn] {msg}");
        }
    }

    fn error(&mut self, msg: &str) {
        if let Some(ref pb) = self.spinner {
            pb.println(format!("[error] {msg}"));
        } else {
            eprintln!("[error] {msg}");
        }
    }
}
