//! Experiment Store - the persistence contract of a run and its in-memory backend
//!
//! The orchestrator talks to storage only through [`ConfigStore`]. Every
//! write is committed immediately; the connection is opened with
//! [`ConfigStore::connect`] before a run and released with
//! [`ConfigStore::close`] after it.

use std::collections::HashMap;

use super::{CheckpointRecord, ExperimentRecord, ExperimentStatus, RoundMetrics};
use crate::{Error, Result};

/// Storage contract for experiment configuration, status, metrics and checkpoints.
pub trait ConfigStore {
    /// Open the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be reached.
    fn connect(&mut self) -> Result<()>;

    /// Read the experiment's configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] if no row exists.
    fn load_config(&self, experiment_id: i64) -> Result<ExperimentRecord>;

    /// Apply a status transition and stamp its timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the experiment does not exist.
    fn update_status(
        &mut self,
        experiment_id: i64,
        status: ExperimentStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Append one round's merged metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_round_metrics(&mut self, experiment_id: i64, metrics: &RoundMetrics) -> Result<()>;

    /// Store final accuracy and loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the experiment does not exist.
    fn save_final_results(&mut self, experiment_id: i64, accuracy: f64, loss: f64) -> Result<()>;

    /// Record a pointer row for a checkpoint file that was already written.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn record_checkpoint(&mut self, experiment_id: i64, checkpoint: &CheckpointRecord)
        -> Result<()>;

    /// Replace the experiment's execution log text.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_logs(&mut self, experiment_id: i64, logs: &str) -> Result<()>;

    /// Release the connection. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to shut down cleanly.
    fn close(&mut self) -> Result<()>;
}

/// In-memory [`ConfigStore`].
///
/// ## Design
///
/// Experiments live in a hash map keyed by id; metrics and checkpoint
/// pointers are append-only vectors per experiment, read back sorted by
/// round. The connection flag mirrors the relational backend so misuse
/// outside `connect()`/`close()` fails the same way.
#[derive(Debug, Default)]
pub struct MemoryStore {
    experiments: HashMap<i64, ExperimentRecord>,
    metrics: HashMap<i64, Vec<RoundMetrics>>,
    checkpoints: HashMap<i64, Vec<CheckpointRecord>>,
    connected: bool,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an experiment (rows are created outside the runner).
    pub fn add_experiment(&mut self, experiment: ExperimentRecord) {
        self.experiments.insert(experiment.id(), experiment);
    }

    /// Get an experiment by ID.
    #[must_use]
    pub fn experiment(&self, experiment_id: i64) -> Option<&ExperimentRecord> {
        self.experiments.get(&experiment_id)
    }

    /// Round metrics for an experiment, ordered by round.
    #[must_use]
    pub fn round_metrics(&self, experiment_id: i64) -> Vec<RoundMetrics> {
        let mut rows = self.metrics.get(&experiment_id).cloned().unwrap_or_default();
        rows.sort_by_key(RoundMetrics::round);
        rows
    }

    /// Checkpoint pointer rows for an experiment, ordered by round.
    #[must_use]
    pub fn checkpoint_records(&self, experiment_id: i64) -> Vec<CheckpointRecord> {
        let mut rows = self
            .checkpoints
            .get(&experiment_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(CheckpointRecord::round);
        rows
    }

    /// Whether `connect()` has been called without a matching `close()`.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn experiment_mut(&mut self, experiment_id: i64) -> Result<&mut ExperimentRecord> {
        self.ensure_connected()?;
        self.experiments
            .get_mut(&experiment_id)
            .ok_or(Error::ExperimentNotFound(experiment_id))
    }
}

impl ConfigStore for MemoryStore {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn load_config(&self, experiment_id: i64) -> Result<ExperimentRecord> {
        self.ensure_connected()?;
        self.experiments
            .get(&experiment_id)
            .cloned()
            .ok_or(Error::ExperimentNotFound(experiment_id))
    }

    fn update_status(
        &mut self,
        experiment_id: i64,
        status: ExperimentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.experiment_mut(experiment_id)?
            .transition(status, error_message);
        Ok(())
    }

    fn save_round_metrics(&mut self, experiment_id: i64, metrics: &RoundMetrics) -> Result<()> {
        self.ensure_connected()?;
        self.metrics
            .entry(experiment_id)
            .or_default()
            .push(metrics.clone());
        Ok(())
    }

    fn save_final_results(&mut self, experiment_id: i64, accuracy: f64, loss: f64) -> Result<()> {
        self.experiment_mut(experiment_id)?
            .set_final_results(accuracy, loss);
        Ok(())
    }

    fn record_checkpoint(
        &mut self,
        experiment_id: i64,
        checkpoint: &CheckpointRecord,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.checkpoints
            .entry(experiment_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn save_logs(&mut self, experiment_id: i64, logs: &str) -> Result<()> {
        self.experiment_mut(experiment_id)?.set_logs(logs);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}
