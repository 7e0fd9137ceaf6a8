//! Orchestration layer: ties the storage, client, filter, state, and
//! writer crates together into a runnable sync.
//!
//! [`orchestrator::Orchestrator`] drives one DISCOVER → FILTER → SYNC →
//! WRITE_INDEX → FINALIZE pass; [`session::run_sync`] is the entry point a
//! caller (the CLI, or any embedder) actually calls, adding diff-file
//! reporting and cancellation wiring around one or more orchestrator runs.

pub mod config;
pub mod orchestrator;
pub mod reporter;
pub mod session;

pub use config::MirrorConfig;
pub use orchestrator::{Orchestrator, OrchestratorError, SyncOutcome};
pub use reporter::{NullReporter, RecordingReporter, Reporter};
pub use session::{run_sync, SessionError, SessionOutcome};
