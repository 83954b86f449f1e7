//! Federated-learning engine contracts and the reference simulation
//!
//! The orchestrator drives training through three seams:
//!
//! - [`Client`]: one participant's local fit/evaluate over its partition
//! - [`Strategy`]: server-side sampling and aggregation
//! - [`Simulation`]: the round loop that dispatches clients and enforces
//!   round barriers
//!
//! ```text
//! round n:  configure_fit ─► fit × k (workers) ─► aggregate_fit
//!           configure_evaluate ─► evaluate × k ─► aggregate_evaluate
//! round n+1 starts only after both aggregate hooks returned
//! ```

mod simulation;
mod strategy;

use std::collections::BTreeMap;

pub use simulation::{Simulation, SimulationConfig};
pub use strategy::{
    aggregate_median, aggregate_weighted, FedAvg, FedAvgBuilder, FedMedian, MetricsAggregationFn,
    RoundConfigFn,
};

use crate::metrics::{ConfigRecord, Metrics, Scalar};
use crate::tensor::{Parameters, Tensor};
use crate::Result;

/// Result of a client's local training.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRes {
    /// Updated local parameters.
    pub parameters: Parameters,
    /// Training samples used (aggregation weight).
    pub num_examples: usize,
    /// Client-reported metrics.
    pub metrics: Metrics,
}

/// Result of a client's local evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateRes {
    /// Mean loss over the held-out partition.
    pub loss: f64,
    /// Held-out samples (aggregation weight).
    pub num_examples: usize,
    /// Client-reported metrics.
    pub metrics: Metrics,
}

/// Instructions for one client's fit call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitIns {
    /// Global parameters to start from.
    pub parameters: Parameters,
    /// Per-round configuration.
    pub config: ConfigRecord,
}

/// Instructions for one client's evaluate call.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateIns {
    /// Global parameters to evaluate.
    pub parameters: Parameters,
    /// Per-round configuration.
    pub config: ConfigRecord,
}

/// A client call that returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFailure {
    /// Client that failed.
    pub client_id: usize,
    /// Error text.
    pub error: String,
}

/// A federated participant.
pub trait Client: Send {
    /// Current local parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters cannot be exported.
    fn get_parameters(&self, config: &ConfigRecord) -> Result<Parameters>;

    /// Replace local parameters.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ParameterMismatch`] on count or shape mismatch.
    fn set_parameters(&mut self, parameters: &[Tensor]) -> Result<()>;

    /// Train locally starting from `parameters`.
    ///
    /// # Errors
    ///
    /// Returns an error if training fails.
    fn fit(&mut self, parameters: &[Tensor], config: &ConfigRecord) -> Result<FitRes>;

    /// Evaluate `parameters` on the local held-out data.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation fails.
    fn evaluate(&mut self, parameters: &[Tensor], config: &ConfigRecord) -> Result<EvaluateRes>;
}

/// Builds the client for a partition index. Called once per client call.
pub type ClientFn = dyn Fn(usize) -> Result<Box<dyn Client>> + Send + Sync;

/// Server-side federated algorithm.
///
/// Aggregation hooks return `Result` so that decorators whose side effects
/// fail (e.g. persistence) abort the run instead of being ignored.
pub trait Strategy {
    /// Display name for logs.
    fn name(&self) -> String;

    /// Initial global parameters, or `None` to ask a client.
    fn initialize_parameters(&mut self) -> Option<Parameters>;

    /// Select clients and build fit instructions for `round`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Engine`] if the strategy's minimum client
    /// requirements can never be met.
    fn configure_fit(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut rand::rngs::StdRng,
    ) -> Result<Vec<(usize, FitIns)>>;

    /// Aggregate fit results into new global parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if aggregation (or a decorator's side effect) fails.
    fn aggregate_fit(
        &mut self,
        round: u32,
        results: &[(usize, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(Parameters, Metrics)>>;

    /// Select clients and build evaluate instructions for `round`.
    ///
    /// # Errors
    ///
    /// Same as [`Strategy::configure_fit`].
    fn configure_evaluate(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut rand::rngs::StdRng,
    ) -> Result<Vec<(usize, EvaluateIns)>>;

    /// Aggregate evaluation results into a loss and metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if aggregation (or a decorator's side effect) fails.
    fn aggregate_evaluate(
        &mut self,
        round: u32,
        results: &[(usize, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(f64, Metrics)>>;
}

/// Per-round results of a simulation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    /// `(round, loss)` from distributed evaluation.
    pub losses_distributed: Vec<(u32, f64)>,
    /// Aggregated fit metrics by key.
    pub metrics_distributed_fit: BTreeMap<String, Vec<(u32, Scalar)>>,
    /// Aggregated evaluation metrics by key.
    pub metrics_distributed: BTreeMap<String, Vec<(u32, Scalar)>>,
}

impl History {
    /// Record a round's distributed loss.
    pub fn add_loss_distributed(&mut self, round: u32, loss: f64) {
        self.losses_distributed.push((round, loss));
    }

    /// Record a round's aggregated fit metrics.
    pub fn add_metrics_distributed_fit(&mut self, round: u32, metrics: &Metrics) {
        for (key, value) in metrics {
            self.metrics_distributed_fit
                .entry(key.clone())
                .or_default()
                .push((round, value.clone()));
        }
    }

    /// Record a round's aggregated evaluation metrics.
    pub fn add_metrics_distributed(&mut self, round: u32, metrics: &Metrics) {
        for (key, value) in metrics {
            self.metrics_distributed
                .entry(key.clone())
                .or_default()
                .push((round, value.clone()));
        }
    }

    /// Loss of the last evaluated round.
    #[must_use]
    pub fn last_loss(&self) -> Option<f64> {
        self.losses_distributed.last().map(|(_, loss)| *loss)
    }

    /// Last value of the first evaluation metric whose key contains `needle`.
    #[must_use]
    pub fn last_metric_containing(&self, needle: &str) -> Option<f64> {
        self.metrics_distributed
            .iter()
            .find(|(key, _)| key.contains(needle))
            .and_then(|(_, values)| values.last())
            .and_then(|(_, value)| value.as_f64())
    }

    /// Number of rounds that produced a distributed loss.
    #[must_use]
    pub fn rounds_evaluated(&self) -> usize {
        self.losses_distributed.len()
    }
}
