//! Built-in strategies: FedAvg and FedMedian

use rand::rngs::StdRng;
use tracing::{info, warn};

use super::{ClientFailure, EvaluateIns, EvaluateRes, FitIns, FitRes, Strategy};
use crate::metrics::{weighted_average, weighted_loss, ConfigRecord, Metrics};
use crate::tensor::{Parameters, Tensor};
use crate::{Error, Result};

/// Aggregates `(num_examples, metrics)` pairs into one mapping.
pub type MetricsAggregationFn = Box<dyn Fn(&[(usize, Metrics)]) -> Metrics + Send + Sync>;

/// Builds the config sent to clients for a round.
pub type RoundConfigFn = Box<dyn Fn(u32) -> ConfigRecord + Send + Sync>;

/// Federated averaging.
///
/// Samples `max(floor(available * fraction), min_clients)` clients per
/// phase and averages their parameters weighted by sample count.
pub struct FedAvg {
    fraction_fit: f64,
    fraction_evaluate: f64,
    min_fit_clients: usize,
    min_evaluate_clients: usize,
    min_available_clients: usize,
    accept_failures: bool,
    initial_parameters: Option<Parameters>,
    fit_metrics_aggregation: Option<MetricsAggregationFn>,
    evaluate_metrics_aggregation: Option<MetricsAggregationFn>,
    on_fit_config: Option<RoundConfigFn>,
    on_evaluate_config: Option<RoundConfigFn>,
}

impl std::fmt::Debug for FedAvg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FedAvg")
            .field("fraction_fit", &self.fraction_fit)
            .field("fraction_evaluate", &self.fraction_evaluate)
            .field("min_fit_clients", &self.min_fit_clients)
            .field("min_evaluate_clients", &self.min_evaluate_clients)
            .field("min_available_clients", &self.min_available_clients)
            .field("accept_failures", &self.accept_failures)
            .finish_non_exhaustive()
    }
}

impl Default for FedAvg {
    fn default() -> Self {
        FedAvgBuilder::new().build()
    }
}

impl FedAvg {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> FedAvgBuilder {
        FedAvgBuilder::new()
    }

    /// Default averaging strategy for `num_clients` sampled at `fraction`.
    ///
    /// Minimum fit and evaluate counts are `max(1, floor(num_clients *
    /// fraction))`; every client must be available.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn for_clients(num_clients: usize, fraction: f64) -> FedAvgBuilder {
        let min_clients = ((num_clients as f64 * fraction).floor() as usize).max(1);
        FedAvgBuilder::new()
            .fraction_fit(fraction)
            .fraction_evaluate(fraction)
            .min_fit_clients(min_clients)
            .min_evaluate_clients(min_clients)
            .min_available_clients(num_clients)
    }

    /// Fit sample fraction.
    #[must_use]
    pub const fn fraction_fit(&self) -> f64 {
        self.fraction_fit
    }

    /// Minimum fit clients.
    #[must_use]
    pub const fn min_fit_clients(&self) -> usize {
        self.min_fit_clients
    }

    /// Minimum available clients.
    #[must_use]
    pub const fn min_available_clients(&self) -> usize {
        self.min_available_clients
    }

    /// Clients to sample for a phase with `fraction` and `minimum`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn sample_size(fraction: f64, minimum: usize, num_available: usize) -> usize {
        ((num_available as f64 * fraction).floor() as usize).max(minimum)
    }

    fn sample(
        &self,
        phase: &str,
        fraction: f64,
        minimum: usize,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<usize>> {
        if num_available < self.min_available_clients {
            return Err(Error::Engine(format!(
                "{phase}: strategy requires {} available clients, simulation has {num_available}",
                self.min_available_clients
            )));
        }
        let size = Self::sample_size(fraction, minimum, num_available);
        if size > num_available {
            warn!(phase, requested = size, num_available, "sampling failed, skipping phase");
            return Ok(Vec::new());
        }
        let mut chosen = rand::seq::index::sample(rng, num_available, size).into_vec();
        chosen.sort_unstable();
        Ok(chosen)
    }

    fn fit_config(&self, round: u32) -> ConfigRecord {
        self.on_fit_config
            .as_ref()
            .map_or_else(ConfigRecord::new, |f| f(round))
    }

    fn evaluate_config(&self, round: u32) -> ConfigRecord {
        self.on_evaluate_config
            .as_ref()
            .map_or_else(ConfigRecord::new, |f| f(round))
    }

    fn aggregate_fit_metrics(&self, results: &[(usize, FitRes)]) -> Metrics {
        self.fit_metrics_aggregation.as_ref().map_or_else(Metrics::new, |f| {
            let pairs: Vec<(usize, Metrics)> = results
                .iter()
                .map(|(_, r)| (r.num_examples, r.metrics.clone()))
                .collect();
            f(&pairs)
        })
    }

    /// Shared preconditions of every aggregation: `Some(results)` when
    /// aggregation should proceed.
    fn accept<'r, T>(
        &self,
        round: u32,
        results: &'r [(usize, T)],
        failures: &[ClientFailure],
    ) -> Option<&'r [(usize, T)]> {
        if results.is_empty() {
            return None;
        }
        if !self.accept_failures && !failures.is_empty() {
            warn!(round, failures = failures.len(), "failures not accepted, skipping aggregation");
            return None;
        }
        Some(results)
    }
}

impl Strategy for FedAvg {
    fn name(&self) -> String {
        "FedAvg".to_string()
    }

    fn initialize_parameters(&mut self) -> Option<Parameters> {
        self.initial_parameters.take()
    }

    fn configure_fit(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<(usize, FitIns)>> {
        let clients = self.sample(
            "configure_fit",
            self.fraction_fit,
            self.min_fit_clients,
            num_available,
            rng,
        )?;
        let config = self.fit_config(round);
        Ok(clients
            .into_iter()
            .map(|cid| {
                (
                    cid,
                    FitIns {
                        parameters: parameters.clone(),
                        config: config.clone(),
                    },
                )
            })
            .collect())
    }

    fn aggregate_fit(
        &mut self,
        round: u32,
        results: &[(usize, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(Parameters, Metrics)>> {
        let Some(results) = self.accept(round, results, failures) else {
            return Ok(None);
        };
        let weighted: Vec<(usize, &[Tensor])> = results
            .iter()
            .map(|(_, r)| (r.num_examples, r.parameters.as_slice()))
            .collect();
        let Some(parameters) = aggregate_weighted(&weighted)? else {
            warn!(round, "clients reported zero training examples");
            return Ok(None);
        };
        Ok(Some((parameters, self.aggregate_fit_metrics(results))))
    }

    fn configure_evaluate(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<(usize, EvaluateIns)>> {
        if self.fraction_evaluate <= 0.0 {
            return Ok(Vec::new());
        }
        let clients = self.sample(
            "configure_evaluate",
            self.fraction_evaluate,
            self.min_evaluate_clients,
            num_available,
            rng,
        )?;
        let config = self.evaluate_config(round);
        Ok(clients
            .into_iter()
            .map(|cid| {
                (
                    cid,
                    EvaluateIns {
                        parameters: parameters.clone(),
                        config: config.clone(),
                    },
                )
            })
            .collect())
    }

    fn aggregate_evaluate(
        &mut self,
        round: u32,
        results: &[(usize, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(f64, Metrics)>> {
        let Some(results) = self.accept(round, results, failures) else {
            return Ok(None);
        };
        let losses: Vec<(usize, f64)> = results
            .iter()
            .map(|(_, r)| (r.num_examples, r.loss))
            .collect();
        let Some(loss) = weighted_loss(&losses) else {
            return Ok(None);
        };
        let metrics = self
            .evaluate_metrics_aggregation
            .as_ref()
            .map_or_else(Metrics::new, |f| {
                let pairs: Vec<(usize, Metrics)> = results
                    .iter()
                    .map(|(_, r)| (r.num_examples, r.metrics.clone()))
                    .collect();
                f(&pairs)
            });
        Ok(Some((loss, metrics)))
    }
}

/// Builder for [`FedAvg`].
pub struct FedAvgBuilder {
    strategy: FedAvg,
}

impl Default for FedAvgBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FedAvgBuilder {
    /// Flower's defaults: sample everyone, at least two clients, weighted
    /// metric averaging.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategy: FedAvg {
                fraction_fit: 1.0,
                fraction_evaluate: 1.0,
                min_fit_clients: 2,
                min_evaluate_clients: 2,
                min_available_clients: 2,
                accept_failures: true,
                initial_parameters: None,
                fit_metrics_aggregation: Some(Box::new(weighted_average)),
                evaluate_metrics_aggregation: Some(Box::new(weighted_average)),
                on_fit_config: None,
                on_evaluate_config: None,
            },
        }
    }

    /// Fraction of available clients sampled for training.
    #[must_use]
    pub const fn fraction_fit(mut self, fraction: f64) -> Self {
        self.strategy.fraction_fit = fraction;
        self
    }

    /// Fraction of available clients sampled for evaluation; 0 disables it.
    #[must_use]
    pub const fn fraction_evaluate(mut self, fraction: f64) -> Self {
        self.strategy.fraction_evaluate = fraction;
        self
    }

    /// Minimum clients per fit phase.
    #[must_use]
    pub const fn min_fit_clients(mut self, n: usize) -> Self {
        self.strategy.min_fit_clients = n;
        self
    }

    /// Minimum clients per evaluate phase.
    #[must_use]
    pub const fn min_evaluate_clients(mut self, n: usize) -> Self {
        self.strategy.min_evaluate_clients = n;
        self
    }

    /// Clients that must exist before a round starts.
    #[must_use]
    pub const fn min_available_clients(mut self, n: usize) -> Self {
        self.strategy.min_available_clients = n;
        self
    }

    /// Aggregate even when some clients failed.
    #[must_use]
    pub const fn accept_failures(mut self, accept: bool) -> Self {
        self.strategy.accept_failures = accept;
        self
    }

    /// Start from these parameters instead of asking a client.
    #[must_use]
    pub fn initial_parameters(mut self, parameters: Parameters) -> Self {
        self.strategy.initial_parameters = Some(parameters);
        self
    }

    /// Fit metric aggregation.
    #[must_use]
    pub fn fit_metrics_aggregation(mut self, f: MetricsAggregationFn) -> Self {
        self.strategy.fit_metrics_aggregation = Some(f);
        self
    }

    /// Evaluation metric aggregation.
    #[must_use]
    pub fn evaluate_metrics_aggregation(mut self, f: MetricsAggregationFn) -> Self {
        self.strategy.evaluate_metrics_aggregation = Some(f);
        self
    }

    /// Per-round fit config.
    #[must_use]
    pub fn on_fit_config(mut self, f: RoundConfigFn) -> Self {
        self.strategy.on_fit_config = Some(f);
        self
    }

    /// Per-round evaluate config.
    #[must_use]
    pub fn on_evaluate_config(mut self, f: RoundConfigFn) -> Self {
        self.strategy.on_evaluate_config = Some(f);
        self
    }

    /// Build the strategy.
    #[must_use]
    pub fn build(self) -> FedAvg {
        let s = &self.strategy;
        info!(
            fraction_fit = s.fraction_fit,
            min_fit_clients = s.min_fit_clients,
            min_available_clients = s.min_available_clients,
            "configured FedAvg"
        );
        self.strategy
    }
}

/// Coordinate-wise median aggregation with FedAvg's sampling.
#[derive(Debug, Default)]
pub struct FedMedian {
    base: FedAvg,
}

impl FedMedian {
    /// Wrap a configured FedAvg, reusing its sampling and callbacks.
    #[must_use]
    pub const fn new(base: FedAvg) -> Self {
        Self { base }
    }
}

impl Strategy for FedMedian {
    fn name(&self) -> String {
        "FedMedian".to_string()
    }

    fn initialize_parameters(&mut self) -> Option<Parameters> {
        self.base.initialize_parameters()
    }

    fn configure_fit(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<(usize, FitIns)>> {
        self.base.configure_fit(round, parameters, num_available, rng)
    }

    fn aggregate_fit(
        &mut self,
        round: u32,
        results: &[(usize, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(Parameters, Metrics)>> {
        let Some(results) = self.base.accept(round, results, failures) else {
            return Ok(None);
        };
        let updates: Vec<&[Tensor]> = results.iter().map(|(_, r)| r.parameters.as_slice()).collect();
        let parameters = aggregate_median(&updates)?;
        Ok(Some((parameters, self.base.aggregate_fit_metrics(results))))
    }

    fn configure_evaluate(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<(usize, EvaluateIns)>> {
        self.base
            .configure_evaluate(round, parameters, num_available, rng)
    }

    fn aggregate_evaluate(
        &mut self,
        round: u32,
        results: &[(usize, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(f64, Metrics)>> {
        self.base.aggregate_evaluate(round, results, failures)
    }
}

fn check_layout(reference: &[Tensor], update: &[Tensor]) -> Result<()> {
    if reference.len() != update.len() {
        return Err(Error::ParameterMismatch(format!(
            "client update has {} tensors, expected {}",
            update.len(),
            reference.len()
        )));
    }
    for (i, (a, b)) in reference.iter().zip(update).enumerate() {
        if a.shape() != b.shape() {
            return Err(Error::ParameterMismatch(format!(
                "client update tensor {i} has shape {:?}, expected {:?}",
                b.shape(),
                a.shape()
            )));
        }
    }
    Ok(())
}

/// Sample-count-weighted mean of parameter lists.
///
/// Returns `Ok(None)` for no updates or a zero total sample count.
///
/// # Errors
///
/// Returns [`Error::ParameterMismatch`] if updates disagree in layout.
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_weighted(updates: &[(usize, &[Tensor])]) -> Result<Option<Parameters>> {
    let Some((_, reference)) = updates.first() else {
        return Ok(None);
    };
    let total: usize = updates.iter().map(|(n, _)| n).sum();
    if total == 0 {
        return Ok(None);
    }

    let mut acc: Vec<Vec<f64>> = reference.iter().map(|t| vec![0.0; t.len()]).collect();
    for (num_examples, params) in updates {
        check_layout(reference, params)?;
        let weight = *num_examples as f64 / total as f64;
        for (sum, tensor) in acc.iter_mut().zip(params.iter()) {
            for (s, v) in sum.iter_mut().zip(tensor.data()) {
                *s += f64::from(*v) * weight;
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    let averaged = reference
        .iter()
        .zip(acc)
        .map(|(t, sum)| Tensor::from_parts(t.shape().to_vec(), sum.into_iter().map(|v| v as f32).collect()))
        .collect();
    Ok(Some(averaged))
}

/// Coordinate-wise median of parameter lists (mean of the middle pair for
/// an even count).
///
/// # Errors
///
/// Returns [`Error::ParameterMismatch`] if updates disagree in layout, or
/// [`Error::Engine`] when there are no updates.
pub fn aggregate_median(updates: &[&[Tensor]]) -> Result<Parameters> {
    let Some(reference) = updates.first() else {
        return Err(Error::Engine("median of zero updates".to_string()));
    };
    for params in updates {
        check_layout(reference, params)?;
    }

    let mut column = Vec::with_capacity(updates.len());
    Ok(reference
        .iter()
        .enumerate()
        .map(|(ti, t)| {
            let data = (0..t.len())
                .map(|j| {
                    column.clear();
                    column.extend(updates.iter().map(|p| p[ti].data()[j]));
                    column.sort_unstable_by(f32::total_cmp);
                    let mid = column.len() / 2;
                    if column.len() % 2 == 0 {
                        (column[mid - 1] + column[mid]) / 2.0
                    } else {
                        column[mid]
                    }
                })
                .collect();
            Tensor::from_parts(t.shape().to_vec(), data)
        })
        .collect())
}
