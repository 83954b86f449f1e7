//! Experiment Record - configuration and lifecycle of one federated run

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Created, not yet picked up by a runner.
    Pending,
    /// A runner is executing rounds.
    Running,
    /// All rounds finished and final results were saved.
    Completed,
    /// The run aborted; `error_message` says why.
    Failed,
}

impl ExperimentStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// True for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Storage(format!("unknown experiment status '{other}'"))),
        }
    }
}

/// Experiment Record is one row of the `experiments` table.
///
/// Rows are created outside the runner; the runner only reads the
/// configuration and moves the record through its status transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentRecord {
    id: i64,
    name: String,
    framework: String,
    num_clients: usize,
    num_rounds: u32,
    client_fraction: f64,
    learning_rate: f64,
    local_epochs: u32,
    model_path: Option<String>,
    dataset_path: Option<String>,
    algorithm_path: Option<String>,
    config_path: Option<String>,
    use_gpu: bool,
    status: ExperimentStatus,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    final_accuracy: Option<f64>,
    final_loss: Option<f64>,
    logs: Option<String>,
}

impl ExperimentRecord {
    /// Create a pending experiment with default hyperparameters.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        ExperimentRecordBuilder::new(id, name).build()
    }

    /// Create a builder for constructing an experiment record with optional fields.
    #[must_use]
    pub fn builder(id: i64, name: impl Into<String>) -> ExperimentRecordBuilder {
        ExperimentRecordBuilder::new(id, name)
    }

    /// Get the experiment ID.
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the ML framework label (e.g. "pytorch").
    #[must_use]
    pub fn framework(&self) -> &str {
        &self.framework
    }

    /// Total number of virtual clients.
    #[must_use]
    pub const fn num_clients(&self) -> usize {
        self.num_clients
    }

    /// Number of federated rounds.
    #[must_use]
    pub const fn num_rounds(&self) -> u32 {
        self.num_rounds
    }

    /// Fraction of clients sampled per round.
    #[must_use]
    pub const fn client_fraction(&self) -> f64 {
        self.client_fraction
    }

    /// Client learning rate.
    #[must_use]
    pub const fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Local epochs per fit call.
    #[must_use]
    pub const fn local_epochs(&self) -> u32 {
        self.local_epochs
    }

    /// Uploaded model module, relative to the project root.
    #[must_use]
    pub fn model_path(&self) -> Option<&str> {
        non_empty(self.model_path.as_deref())
    }

    /// Uploaded dataset module.
    #[must_use]
    pub fn dataset_path(&self) -> Option<&str> {
        non_empty(self.dataset_path.as_deref())
    }

    /// Uploaded strategy module.
    #[must_use]
    pub fn algorithm_path(&self) -> Option<&str> {
        non_empty(self.algorithm_path.as_deref())
    }

    /// Uploaded configuration (module, JSON or YAML).
    #[must_use]
    pub fn config_path(&self) -> Option<&str> {
        non_empty(self.config_path.as_deref())
    }

    /// Whether the experiment asks for an accelerator.
    #[must_use]
    pub const fn use_gpu(&self) -> bool {
        self.use_gpu
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Failure message, set when the status is `Failed`.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Set when the run starts.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Set when the run completes or fails.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Final distributed accuracy.
    #[must_use]
    pub const fn final_accuracy(&self) -> Option<f64> {
        self.final_accuracy
    }

    /// Final distributed loss.
    #[must_use]
    pub const fn final_loss(&self) -> Option<f64> {
        self.final_loss
    }

    /// Captured execution log.
    #[must_use]
    pub fn logs(&self) -> Option<&str> {
        self.logs.as_deref()
    }

    /// Apply a status transition, stamping the matching timestamps.
    ///
    /// `running` sets `started_at`; `completed` and `failed` set
    /// `completed_at`; `failed` also stores the error message.
    pub fn transition(&mut self, status: ExperimentStatus, error_message: Option<&str>) {
        let now = Utc::now();
        match status {
            ExperimentStatus::Running => self.started_at = Some(now),
            ExperimentStatus::Completed => self.completed_at = Some(now),
            ExperimentStatus::Failed => {
                self.completed_at = Some(now);
                self.error_message = error_message.map(str::to_string);
            }
            ExperimentStatus::Pending => {}
        }
        self.status = status;
    }

    /// Record the final accuracy and loss.
    pub fn set_final_results(&mut self, accuracy: f64, loss: f64) {
        self.final_accuracy = Some(accuracy);
        self.final_loss = Some(loss);
    }

    /// Replace the captured execution log.
    pub fn set_logs(&mut self, logs: impl Into<String>) {
        self.logs = Some(logs.into());
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Builder for `ExperimentRecord`.
#[derive(Debug)]
pub struct ExperimentRecordBuilder {
    record: ExperimentRecord,
}

impl ExperimentRecordBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            record: ExperimentRecord {
                id,
                name: name.into(),
                framework: "pytorch".to_string(),
                num_clients: 2,
                num_rounds: 3,
                client_fraction: 0.5,
                learning_rate: 0.01,
                local_epochs: 1,
                model_path: None,
                dataset_path: None,
                algorithm_path: None,
                config_path: None,
                use_gpu: false,
                status: ExperimentStatus::Pending,
                error_message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                final_accuracy: None,
                final_loss: None,
                logs: None,
            },
        }
    }

    /// Set the framework label.
    #[must_use]
    pub fn framework(mut self, framework: impl Into<String>) -> Self {
        self.record.framework = framework.into();
        self
    }

    /// Set the client count.
    #[must_use]
    pub const fn num_clients(mut self, num_clients: usize) -> Self {
        self.record.num_clients = num_clients;
        self
    }

    /// Set the round count.
    #[must_use]
    pub const fn num_rounds(mut self, num_rounds: u32) -> Self {
        self.record.num_rounds = num_rounds;
        self
    }

    /// Set the per-round client sample fraction.
    #[must_use]
    pub const fn client_fraction(mut self, fraction: f64) -> Self {
        self.record.client_fraction = fraction;
        self
    }

    /// Set the learning rate.
    #[must_use]
    pub const fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.record.learning_rate = learning_rate;
        self
    }

    /// Set the local epoch count.
    #[must_use]
    pub const fn local_epochs(mut self, epochs: u32) -> Self {
        self.record.local_epochs = epochs;
        self
    }

    /// Set the model module path.
    #[must_use]
    pub fn model_path(mut self, path: impl Into<String>) -> Self {
        self.record.model_path = Some(path.into());
        self
    }

    /// Set the dataset module path.
    #[must_use]
    pub fn dataset_path(mut self, path: impl Into<String>) -> Self {
        self.record.dataset_path = Some(path.into());
        self
    }

    /// Set the strategy module path.
    #[must_use]
    pub fn algorithm_path(mut self, path: impl Into<String>) -> Self {
        self.record.algorithm_path = Some(path.into());
        self
    }

    /// Set the configuration file path.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<String>) -> Self {
        self.record.config_path = Some(path.into());
        self
    }

    /// Request an accelerator.
    #[must_use]
    pub const fn use_gpu(mut self, use_gpu: bool) -> Self {
        self.record.use_gpu = use_gpu;
        self
    }

    /// Set the status (useful when loading rows from storage).
    #[must_use]
    pub const fn status(mut self, status: ExperimentStatus) -> Self {
        self.record.status = status;
        self
    }

    /// Set the error message.
    #[must_use]
    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.record.error_message = message;
        self
    }

    /// Set a custom creation timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.record.created_at = created_at;
        self
    }

    /// Set run timestamps.
    #[must_use]
    pub const fn run_times(
        mut self,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.record.started_at = started_at;
        self.record.completed_at = completed_at;
        self
    }

    /// Set final results.
    #[must_use]
    pub const fn final_results(mut self, accuracy: Option<f64>, loss: Option<f64>) -> Self {
        self.record.final_accuracy = accuracy;
        self.record.final_loss = loss;
        self
    }

    /// Set the captured log text.
    #[must_use]
    pub fn logs(mut self, logs: Option<String>) -> Self {
        self.record.logs = logs;
        self
    }

    /// Build the `ExperimentRecord`.
    #[must_use]
    pub fn build(self) -> ExperimentRecord {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_record_new() {
        let record = ExperimentRecord::new(1, "cifar-baseline");
        assert_eq!(record.id(), 1);
        assert_eq!(record.name(), "cifar-baseline");
        assert_eq!(record.status(), ExperimentStatus::Pending);
        assert!(record.model_path().is_none());
    }

    #[test]
    fn test_blank_paths_count_as_unset() {
        let record = ExperimentRecord::builder(1, "x").model_path("  ").build();
        assert!(record.model_path().is_none());
    }

    #[test]
    fn test_failed_transition_stores_message() {
        let mut record = ExperimentRecord::new(1, "x");
        record.transition(ExperimentStatus::Running, None);
        assert!(record.started_at().is_some());
        record.transition(ExperimentStatus::Failed, Some("EngineError: boom"));
        assert_eq!(record.status(), ExperimentStatus::Failed);
        assert_eq!(record.error_message(), Some("EngineError: boom"));
        assert!(record.completed_at().is_some());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExperimentStatus::Pending,
            ExperimentStatus::Running,
            ExperimentStatus::Completed,
            ExperimentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExperimentStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ExperimentStatus>().is_err());
    }
}
