//! Checkpoint Record - database pointer to a parameter snapshot file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Checkpoint Record is one row of the `model_checkpoints` table.
///
/// The snapshot file is always written before this record, so every
/// stored record points at a readable file. `file_path` is relative to
/// the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    round: u32,
    file_path: String,
    accuracy: Option<f64>,
    loss: Option<f64>,
    created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Create a checkpoint record.
    ///
    /// # Arguments
    ///
    /// * `round` - Round the snapshot was aggregated in
    /// * `file_path` - Snapshot path relative to the project root
    /// * `accuracy` - Aggregated training accuracy of that round, if reported
    /// * `loss` - Aggregated training loss of that round, if reported
    #[must_use]
    pub fn new(
        round: u32,
        file_path: impl Into<String>,
        accuracy: Option<f64>,
        loss: Option<f64>,
    ) -> Self {
        Self {
            round,
            file_path: file_path.into(),
            accuracy,
            loss,
            created_at: Utc::now(),
        }
    }

    /// Override the creation time (rows read back from storage).
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Round number.
    #[must_use]
    pub const fn round(&self) -> u32 {
        self.round
    }

    /// Relative snapshot path.
    #[must_use]
    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Training accuracy at this checkpoint.
    #[must_use]
    pub const fn accuracy(&self) -> Option<f64> {
        self.accuracy
    }

    /// Training loss at this checkpoint.
    #[must_use]
    pub const fn loss(&self) -> Option<f64> {
        self.loss
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
