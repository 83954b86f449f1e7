//! Experiment data model and persistence
//!
//! ## Schema Overview
//!
//! ```text
//! ExperimentRecord (1) ──< RoundMetrics (N)      [one per round, immutable]
//!                     └──< CheckpointRecord (N)  [points at round_{n}.ckpt]
//! ```
//!
//! Experiments are created outside the runner. A run only moves the
//! record through `pending → running → completed | failed` and appends
//! round metrics and checkpoint pointers.
//!
//! ## Usage
//!
//! ```rust
//! use fedlab::experiment::{ConfigStore, ExperimentRecord, ExperimentStatus, MemoryStore};
//!
//! let mut store = MemoryStore::new();
//! store.add_experiment(ExperimentRecord::builder(1, "baseline").num_rounds(3).build());
//!
//! store.connect().unwrap();
//! store.update_status(1, ExperimentStatus::Running, None).unwrap();
//! assert_eq!(store.load_config(1).unwrap().status(), ExperimentStatus::Running);
//! store.close().unwrap();
//! ```

mod checkpoint_record;
mod experiment_record;
mod round_metrics;
mod sqlite;
mod store;

pub use checkpoint_record::CheckpointRecord;
pub use experiment_record::{ExperimentRecord, ExperimentRecordBuilder, ExperimentStatus};
pub use round_metrics::{ClientMetric, RoundMetrics, RoundMetricsBuilder};
pub use sqlite::SqliteStore;
pub use store::{ConfigStore, MemoryStore};
