//! # fedlab: Federated-Learning Experiment Runner
//!
//! **Version**: 0.1.0
//!
//! fedlab runs one federated-learning experiment end to end: it loads the
//! user's model, dataset, strategy and config uploads as sandboxed Rhai
//! modules, drives a multi-round simulation across virtual clients, and
//! persists checkpoints, per-round metrics, final results and the run log
//! to the experiment store.
//!
//! ## Design Principles
//!
//! - **Validate before execute**: uploads are checked against their
//!   category's export contract on the syntax tree before any code runs
//! - **Degrade, then decide**: the loader never fails a run by itself;
//!   the orchestrator decides which missing components are fatal
//! - **Record every outcome**: a run ends `completed` or `failed` with a
//!   `{kind}: {message}` error, and its log is always saved
//! - **Round barriers**: round `k` is persisted before round `k + 1`
//!   samples clients
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use fedlab::experiment::SqliteStore;
//! use fedlab::orchestrator::RoundOrchestrator;
//! use fedlab::settings::RunnerSettings;
//!
//! let settings = RunnerSettings::from_env()?;
//! let store = SqliteStore::new(&settings.database_url);
//! let mut orchestrator = RoundOrchestrator::new(42, store, settings)?;
//! let summary = orchestrator.run()?;
//! println!("final accuracy: {:?}", summary.final_accuracy);
//! # Ok::<(), fedlab::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod checkpoint;
pub mod client;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod nn;
pub mod orchestrator;
pub mod settings;
pub mod tensor;

pub use error::{Error, Result};
