//! Client adapter: local training and evaluation over one data partition

use std::sync::Arc;

use tracing::debug;

use crate::engine::{Client, ClientFn, EvaluateRes, FitRes};
use crate::metrics::{ConfigRecord, Metrics, Scalar};
use crate::nn::{DataLoader, Model, OptimizerKind};
use crate::tensor::{parameters_to_state_dict, Parameters, Tensor};
use crate::{Error, Result};

/// Builds a fresh model instance.
pub type ModelFn = dyn Fn() -> Result<Box<dyn Model>> + Send + Sync;

/// Loads `(train, test)` for `(partition_id, num_partitions)`.
pub type DataFn = dyn Fn(usize, usize) -> Result<(DataLoader, DataLoader)> + Send + Sync;

/// Local training settings; `fit` config keys override epochs and learning rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalTraining {
    /// Epochs per fit call.
    pub local_epochs: u32,
    /// Optimizer learning rate.
    pub learning_rate: f64,
    /// Optimizer family.
    pub optimizer: OptimizerKind,
    /// SGD momentum.
    pub momentum: f64,
}

impl Default for LocalTraining {
    fn default() -> Self {
        Self {
            local_epochs: 1,
            learning_rate: 0.01,
            optimizer: OptimizerKind::Sgd,
            momentum: 0.9,
        }
    }
}

/// A client wrapping a model and its partition.
pub struct TrainingClient {
    cid: usize,
    model: Box<dyn Model>,
    train: DataLoader,
    test: DataLoader,
    training: LocalTraining,
}

impl std::fmt::Debug for TrainingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingClient")
            .field("cid", &self.cid)
            .field("train", &self.train.len())
            .field("test", &self.test.len())
            .field("training", &self.training)
            .finish_non_exhaustive()
    }
}

impl TrainingClient {
    /// Create a client.
    #[must_use]
    pub fn new(
        cid: usize,
        model: Box<dyn Model>,
        train: DataLoader,
        test: DataLoader,
        training: LocalTraining,
    ) -> Self {
        Self {
            cid,
            model,
            train,
            test,
            training,
        }
    }

    /// Returns (average batch loss, accuracy).
    #[allow(clippy::cast_precision_loss)]
    fn train_epochs(&mut self, epochs: u32, learning_rate: f64) -> Result<(f64, f64)> {
        if self.train.is_empty() {
            return Err(Error::Training(format!(
                "client {} has no training samples",
                self.cid
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let mut optimizer = self
            .training
            .optimizer
            .build(learning_rate as f32, self.training.momentum as f32);

        let mut total_loss = 0.0;
        let mut correct = 0;
        let mut seen = 0;
        for epoch in 0..epochs {
            for batch in self.train.epoch(epoch) {
                let stats = self.model.train_step(batch, optimizer.as_mut())?;
                total_loss += stats.loss;
                correct += stats.correct;
                seen += stats.count;
            }
        }

        let batches = (self.train.num_batches() * epochs as usize).max(1);
        let accuracy = if seen == 0 { 0.0 } else { correct as f64 / seen as f64 };
        Ok((total_loss / batches as f64, accuracy))
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate_local(&self) -> Result<(f64, f64)> {
        if self.test.is_empty() {
            return Err(Error::Training(format!(
                "client {} has no evaluation samples",
                self.cid
            )));
        }
        let mut total_loss = 0.0;
        let mut correct = 0;
        let mut seen = 0;
        for batch in self.test.batches() {
            let stats = self.model.evaluate(batch)?;
            total_loss += stats.loss;
            correct += stats.correct;
            seen += stats.count;
        }
        Ok((
            total_loss / self.test.num_batches() as f64,
            correct as f64 / seen as f64,
        ))
    }
}

impl Client for TrainingClient {
    fn get_parameters(&self, _config: &ConfigRecord) -> Result<Parameters> {
        Ok(self.model.state_dict().to_parameters())
    }

    fn set_parameters(&mut self, parameters: &[Tensor]) -> Result<()> {
        let state = parameters_to_state_dict(&self.model.state_dict(), parameters)?;
        self.model.load_state_dict(&state)
    }

    fn fit(&mut self, parameters: &[Tensor], config: &ConfigRecord) -> Result<FitRes> {
        self.set_parameters(parameters)?;

        let epochs = config
            .get("local_epochs")
            .and_then(Scalar::as_i64)
            .and_then(|e| u32::try_from(e).ok())
            .unwrap_or(self.training.local_epochs);
        let learning_rate = config
            .get("learning_rate")
            .and_then(Scalar::as_f64)
            .unwrap_or(self.training.learning_rate);

        let (loss, accuracy) = self.train_epochs(epochs, learning_rate)?;
        debug!(client = self.cid, epochs, loss, accuracy, "local training done");

        let mut metrics = Metrics::new();
        metrics.insert("train_loss".to_string(), Scalar::Float(loss));
        metrics.insert("train_accuracy".to_string(), Scalar::Float(accuracy));
        Ok(FitRes {
            parameters: self.get_parameters(&ConfigRecord::new())?,
            num_examples: self.train.len(),
            metrics,
        })
    }

    fn evaluate(&mut self, parameters: &[Tensor], _config: &ConfigRecord) -> Result<EvaluateRes> {
        self.set_parameters(parameters)?;
        let (loss, accuracy) = self.evaluate_local()?;
        debug!(client = self.cid, loss, accuracy, "local evaluation done");

        let mut metrics = Metrics::new();
        metrics.insert("eval_accuracy".to_string(), Scalar::Float(accuracy));
        Ok(EvaluateRes {
            loss,
            num_examples: self.test.len(),
            metrics,
        })
    }
}

/// Client factory for the engine: a fresh model and the client's partition
/// per call.
#[must_use]
pub fn client_fn(
    model_fn: Arc<ModelFn>,
    data_fn: Arc<DataFn>,
    num_clients: usize,
    training: LocalTraining,
) -> Box<ClientFn> {
    Box::new(move |cid| {
        let partition = cid % num_clients.max(1);
        let model = model_fn()?;
        let (train, test) = data_fn(partition, num_clients)?;
        Ok(Box::new(TrainingClient::new(partition, model, train, test, training)) as Box<dyn Client>)
    })
}
