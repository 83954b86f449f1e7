//! Round Metrics - one merged fit/evaluate record per federated round

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;

/// Metrics one client reported for a round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientMetric {
    /// Partition / client index.
    pub client_id: usize,
    /// Local sample count (aggregation weight).
    pub num_examples: usize,
    /// Scalar metrics as reported by the client.
    pub metrics: Metrics,
}

/// Round Metrics is one row of the `metrics` table.
///
/// Built once per round after the evaluation aggregate is known, by
/// merging it with the training aggregate cached from the same round.
/// Immutable after it is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundMetrics {
    round: u32,
    train_loss: Option<f64>,
    train_accuracy: Option<f64>,
    eval_loss: Option<f64>,
    eval_accuracy: Option<f64>,
    client_metrics: Vec<ClientMetric>,
    created_at: DateTime<Utc>,
}

impl RoundMetrics {
    /// Create an empty record for `round` (1-indexed).
    #[must_use]
    pub fn new(round: u32) -> Self {
        RoundMetricsBuilder::new(round).build()
    }

    /// Create a builder for constructing a round record with optional fields.
    #[must_use]
    pub fn builder(round: u32) -> RoundMetricsBuilder {
        RoundMetricsBuilder::new(round)
    }

    /// Round number.
    #[must_use]
    pub const fn round(&self) -> u32 {
        self.round
    }

    /// Aggregated training loss.
    #[must_use]
    pub const fn train_loss(&self) -> Option<f64> {
        self.train_loss
    }

    /// Aggregated training accuracy.
    #[must_use]
    pub const fn train_accuracy(&self) -> Option<f64> {
        self.train_accuracy
    }

    /// Aggregated evaluation loss.
    #[must_use]
    pub const fn eval_loss(&self) -> Option<f64> {
        self.eval_loss
    }

    /// Aggregated evaluation accuracy.
    #[must_use]
    pub const fn eval_accuracy(&self) -> Option<f64> {
        self.eval_accuracy
    }

    /// Per-client entries.
    #[must_use]
    pub fn client_metrics(&self) -> &[ClientMetric] {
        &self.client_metrics
    }

    /// When the record was built.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Builder for `RoundMetrics`.
#[derive(Debug)]
pub struct RoundMetricsBuilder {
    record: RoundMetrics,
}

impl RoundMetricsBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(round: u32) -> Self {
        Self {
            record: RoundMetrics {
                round,
                train_loss: None,
                train_accuracy: None,
                eval_loss: None,
                eval_accuracy: None,
                client_metrics: Vec::new(),
                created_at: Utc::now(),
            },
        }
    }

    /// Set training aggregates.
    #[must_use]
    pub const fn train(mut self, loss: Option<f64>, accuracy: Option<f64>) -> Self {
        self.record.train_loss = loss;
        self.record.train_accuracy = accuracy;
        self
    }

    /// Set evaluation aggregates.
    #[must_use]
    pub const fn eval(mut self, loss: Option<f64>, accuracy: Option<f64>) -> Self {
        self.record.eval_loss = loss;
        self.record.eval_accuracy = accuracy;
        self
    }

    /// Set per-client entries.
    #[must_use]
    pub fn client_metrics(mut self, clients: Vec<ClientMetric>) -> Self {
        self.record.client_metrics = clients;
        self
    }

    /// Set a custom timestamp.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.record.created_at = created_at;
        self
    }

    /// Build the `RoundMetrics`.
    #[must_use]
    pub fn build(self) -> RoundMetrics {
        self.record
    }
}
