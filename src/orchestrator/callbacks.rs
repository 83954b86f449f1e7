//! Strategy decorator persisting checkpoints and round metrics

use rand::rngs::StdRng;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::engine::{ClientFailure, EvaluateIns, EvaluateRes, FitIns, FitRes, Strategy};
use crate::experiment::{CheckpointRecord, ClientMetric, ConfigStore, RoundMetrics};
use crate::metrics::{metric_f64, Metrics};
use crate::tensor::{parameters_to_state_dict, Parameters, StateDict};
use crate::Result;

/// Wraps the strategy in effect and persists each round as it completes.
///
/// After `aggregate_fit` the aggregated parameters are written as the
/// round's checkpoint, a pointer row is recorded, and the training
/// aggregates are cached. After `aggregate_evaluate` the cached training
/// aggregates are merged with the evaluation result into one
/// [`RoundMetrics`] row. Both hooks run inside the engine's round barrier,
/// so round `k` is persisted before round `k + 1` samples clients.
///
/// Persistence failures are returned as errors and abort the run.
pub struct PersistingStrategy<'a, S: ConfigStore + ?Sized> {
    inner: Box<dyn Strategy + 'a>,
    experiment_id: i64,
    store: &'a mut S,
    checkpoints: &'a CheckpointStore,
    template: StateDict,
    last_fit: Option<(Option<f64>, Option<f64>)>,
    client_metrics: Vec<ClientMetric>,
    persisted: Vec<RoundMetrics>,
}

impl<'a, S: ConfigStore + ?Sized> PersistingStrategy<'a, S> {
    /// Decorate `inner`. `template` supplies the parameter names used to
    /// turn aggregated parameters into a checkpoint state dict.
    pub fn new(
        inner: Box<dyn Strategy + 'a>,
        experiment_id: i64,
        store: &'a mut S,
        checkpoints: &'a CheckpointStore,
        template: StateDict,
    ) -> Self {
        Self {
            inner,
            experiment_id,
            store,
            checkpoints,
            template,
            last_fit: None,
            client_metrics: Vec::new(),
            persisted: Vec::new(),
        }
    }

    /// Rows written so far, in round order.
    #[must_use]
    pub fn persisted(&self) -> &[RoundMetrics] {
        &self.persisted
    }

    /// Consume the decorator, returning the rows it wrote.
    #[must_use]
    pub fn into_persisted(self) -> Vec<RoundMetrics> {
        self.persisted
    }

    fn checkpoint(&mut self, round: u32, parameters: &Parameters, metrics: &Metrics) -> Result<()> {
        let state = parameters_to_state_dict(&self.template, parameters)?;
        let path = self.checkpoints.save(round, &state, metrics, None)?;
        let record = CheckpointRecord::new(
            round,
            self.checkpoints.relative_path(&path),
            metric_f64(metrics, "train_accuracy"),
            metric_f64(metrics, "train_loss"),
        );
        self.store.record_checkpoint(self.experiment_id, &record)
    }
}

impl<S: ConfigStore + ?Sized> Strategy for PersistingStrategy<'_, S> {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn initialize_parameters(&mut self) -> Option<Parameters> {
        self.inner.initialize_parameters()
    }

    fn configure_fit(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<(usize, FitIns)>> {
        self.inner.configure_fit(round, parameters, num_available, rng)
    }

    fn aggregate_fit(
        &mut self,
        round: u32,
        results: &[(usize, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(Parameters, Metrics)>> {
        let aggregated = self.inner.aggregate_fit(round, results, failures)?;
        self.client_metrics = results
            .iter()
            .map(|(cid, res)| ClientMetric {
                client_id: *cid,
                num_examples: res.num_examples,
                metrics: res.metrics.clone(),
            })
            .collect();

        if let Some((parameters, metrics)) = &aggregated {
            self.checkpoint(round, parameters, metrics)?;
            // Empty metrics keep the previous round's training aggregates
            if !metrics.is_empty() {
                self.last_fit = Some((
                    metric_f64(metrics, "train_loss"),
                    metric_f64(metrics, "train_accuracy"),
                ));
            }
            info!(
                round,
                train_loss = metric_f64(metrics, "train_loss"),
                train_accuracy = metric_f64(metrics, "train_accuracy"),
                "fit completed"
            );
        }
        Ok(aggregated)
    }

    fn configure_evaluate(
        &mut self,
        round: u32,
        parameters: &Parameters,
        num_available: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<(usize, EvaluateIns)>> {
        self.inner
            .configure_evaluate(round, parameters, num_available, rng)
    }

    fn aggregate_evaluate(
        &mut self,
        round: u32,
        results: &[(usize, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<Option<(f64, Metrics)>> {
        let aggregated = self.inner.aggregate_evaluate(round, results, failures)?;
        if let Some((loss, metrics)) = &aggregated {
            let (train_loss, train_accuracy) = self.last_fit.unwrap_or((None, None));
            let row = RoundMetrics::builder(round)
                .train(train_loss, train_accuracy)
                .eval(Some(*loss), metric_f64(metrics, "eval_accuracy"))
                .client_metrics(std::mem::take(&mut self.client_metrics))
                .build();
            self.store.save_round_metrics(self.experiment_id, &row)?;
            info!(
                round,
                eval_loss = *loss,
                eval_accuracy = row.eval_accuracy(),
                "evaluate completed"
            );
            self.persisted.push(row);
        }
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FedAvg;
    use crate::experiment::{ExperimentRecord, MemoryStore};
    use crate::metrics::Scalar;
    use crate::tensor::Tensor;
    use rand::SeedableRng;

    fn template() -> StateDict {
        let mut state = StateDict::new();
        state.insert("fc0.weight", Tensor::zeros(vec![2]));
        state
    }

    fn fit_res(acc: f64, loss: f64) -> FitRes {
        let mut metrics = Metrics::new();
        metrics.insert("train_accuracy".to_string(), Scalar::Float(acc));
        metrics.insert("train_loss".to_string(), Scalar::Float(loss));
        FitRes {
            parameters: vec![Tensor::new(vec![2], vec![1.0, 2.0]).unwrap()],
            num_examples: 10,
            metrics,
        }
    }

    fn eval_res(loss: f64, acc: f64) -> EvaluateRes {
        let mut metrics = Metrics::new();
        metrics.insert("eval_accuracy".to_string(), Scalar::Float(acc));
        EvaluateRes {
            loss,
            num_examples: 5,
            metrics,
        }
    }

    fn connected_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_experiment(ExperimentRecord::new(1, "merge"));
        store.connect().unwrap();
        store
    }

    #[test]
    fn test_fit_then_evaluate_merges_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path(), 1);
        let mut store = connected_store();
        {
            let mut strategy = PersistingStrategy::new(
                Box::new(FedAvg::default()),
                1,
                &mut store,
                &checkpoints,
                template(),
            );
            strategy.aggregate_fit(3, &[(0, fit_res(0.4, 1.2))], &[]).unwrap();
            strategy.aggregate_evaluate(3, &[(0, eval_res(0.9, 0.6))], &[]).unwrap();
            assert_eq!(strategy.persisted().len(), 1);
        }

        let rows = store.round_metrics(1);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.round(), 3);
        assert_eq!(row.train_loss(), Some(1.2));
        assert_eq!(row.train_accuracy(), Some(0.4));
        assert_eq!(row.eval_loss(), Some(0.9));
        assert_eq!(row.eval_accuracy(), Some(0.6));
        assert_eq!(row.client_metrics().len(), 1);

        let pointers = store.checkpoint_records(1);
        assert_eq!(pointers.len(), 1);
        assert_eq!(pointers[0].file_path(), "checkpoints-data/exp_1/round_3.ckpt");
        assert_eq!(pointers[0].accuracy(), Some(0.4));
        assert!(checkpoints.load(3).unwrap().is_some());
    }

    #[test]
    fn test_skipped_aggregation_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path(), 1);
        let mut store = connected_store();
        {
            let mut strategy = PersistingStrategy::new(
                Box::new(FedAvg::default()),
                1,
                &mut store,
                &checkpoints,
                template(),
            );
            assert!(strategy.aggregate_fit(1, &[], &[]).unwrap().is_none());
            assert!(strategy.aggregate_evaluate(1, &[], &[]).unwrap().is_none());
        }
        assert!(store.round_metrics(1).is_empty());
        assert!(checkpoints.list().unwrap().is_empty());
    }

    #[test]
    fn test_store_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path(), 1);
        let mut store = MemoryStore::new();
        let mut strategy = PersistingStrategy::new(
            Box::new(FedAvg::default()),
            1,
            &mut store,
            &checkpoints,
            template(),
        );
        let err = strategy.aggregate_fit(1, &[(0, fit_res(0.5, 1.0))], &[]).unwrap_err();
        assert_eq!(err.kind(), "ConnectionError");
    }

    #[test]
    fn test_forwards_configure() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::new(dir.path(), 1);
        let mut store = connected_store();
        let mut strategy = PersistingStrategy::new(
            Box::new(FedAvg::for_clients(4, 0.5).build()),
            1,
            &mut store,
            &checkpoints,
            template(),
        );
        let mut rng = StdRng::seed_from_u64(7);
        let ins = strategy.configure_fit(1, &vec![], 4, &mut rng).unwrap();
        assert_eq!(ins.len(), 2);
        assert_eq!(strategy.name(), "FedAvg");
    }
}
