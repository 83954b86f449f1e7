//! Components extracted from loaded modules

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::config_file::UserConfig;
use super::LoadedModule;
use crate::engine::{FedAvgBuilder, FedMedian, Strategy};
use crate::nn::{DataLoader, Mlp, Model, ModelSpec, Sample};
use crate::{Error, Result};

/// A resolved user upload.
#[derive(Debug)]
pub enum Component {
    /// Model factory
    Model(ModelFactory),
    /// Per-partition dataset loader
    Dataset(DatasetLoader),
    /// Strategy factory
    Strategy(StrategyFactory),
    /// Configuration mapping
    Config(UserConfig),
    /// The upload could not be resolved
    Invalid(String),
}

impl Component {
    /// Reason for an invalid component.
    #[must_use]
    pub fn invalid_reason(&self) -> Option<&str> {
        match self {
            Self::Invalid(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelSource {
    Function(&'static str),
    Constant(&'static str),
}

/// Builds models from a user module's `get_model`, `Net` or `Model`.
#[derive(Debug, Clone)]
pub struct ModelFactory {
    module: Arc<LoadedModule>,
    source: ModelSource,
}

impl ModelFactory {
    /// Resolve in order: `get_model` function, then `Net`, then `Model`
    /// (each as a constructor function or a constant map).
    pub(crate) fn resolve(module: Arc<LoadedModule>) -> Option<Self> {
        let source = if module.has_function("get_model") {
            ModelSource::Function("get_model")
        } else {
            ["Net", "Model"].into_iter().find_map(|name| {
                if module.has_function(name) {
                    Some(ModelSource::Function(name))
                } else if module.global(name).is_some() {
                    Some(ModelSource::Constant(name))
                } else {
                    None
                }
            })?
        };
        Some(Self { module, source })
    }

    /// Name of the export the factory uses.
    #[must_use]
    pub const fn origin(&self) -> &'static str {
        match self.source {
            ModelSource::Function(name) | ModelSource::Constant(name) => name,
        }
    }

    /// Evaluate the export into a model spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleExecution`] if the script fails or does not
    /// return a valid spec map.
    pub fn spec(&self) -> Result<ModelSpec> {
        let value = match self.source {
            ModelSource::Function(name) => self.module.call(name, ())?,
            ModelSource::Constant(name) => self
                .module
                .global(name)
                .cloned()
                .ok_or_else(|| self.module.execution_error(format!("{name} is not defined")))?,
        };
        let spec: ModelSpec = self.module.convert(self.origin(), &value)?;
        spec.validate()?;
        Ok(spec)
    }

    /// A fresh model instance.
    ///
    /// # Errors
    ///
    /// Same as [`ModelFactory::spec`].
    pub fn build(&self) -> Result<Box<dyn Model>> {
        let spec = self.spec()?;
        Ok(Box::new(Mlp::new(&spec)?))
    }
}

#[derive(Debug, Deserialize)]
struct PartitionData {
    train: Vec<Sample>,
    test: Vec<Sample>,
    #[serde(default)]
    batch_size: Option<usize>,
}

/// Calls a user module's `load_data(partition_id, num_partitions)`.
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    module: Arc<LoadedModule>,
    default_batch_size: usize,
    seed: u64,
}

impl DatasetLoader {
    pub(crate) fn resolve(module: Arc<LoadedModule>) -> Option<Self> {
        module.has_function("load_data").then(|| Self {
            module,
            default_batch_size: 32,
            seed: 42,
        })
    }

    /// Batch size used when the script does not return one.
    #[must_use]
    pub const fn with_default_batch_size(mut self, batch_size: usize) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    /// Base seed for shuffling training batches.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Train and test loaders for one partition; training batches are
    /// reshuffled every epoch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleExecution`] if the call fails or returns a
    /// malformed partition.
    pub fn load(&self, partition_id: usize, num_partitions: usize) -> Result<(DataLoader, DataLoader)> {
        let args = (
            i64::try_from(partition_id).map_err(|e| Error::Other(e.to_string()))?,
            i64::try_from(num_partitions).map_err(|e| Error::Other(e.to_string()))?,
        );
        let value = self.module.call("load_data", args)?;
        let data: PartitionData = self.module.convert("load_data", &value)?;
        let batch_size = data.batch_size.unwrap_or(self.default_batch_size);
        debug!(
            partition_id,
            train = data.train.len(),
            test = data.test.len(),
            batch_size,
            "user partition loaded"
        );
        Ok((
            DataLoader::new(data.train, batch_size)
                .shuffled(self.seed.wrapping_add(partition_id as u64)),
            DataLoader::new(data.test, batch_size),
        ))
    }
}

/// Strategy settings returned by `get_strategy()`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StrategySpec {
    /// `fedavg` or `fedmedian`
    pub name: String,
    /// Fit sample fraction
    pub fraction_fit: Option<f64>,
    /// Evaluate sample fraction
    pub fraction_evaluate: Option<f64>,
    /// Minimum fit clients
    pub min_fit_clients: Option<usize>,
    /// Minimum evaluate clients
    pub min_evaluate_clients: Option<usize>,
    /// Minimum available clients
    pub min_available_clients: Option<usize>,
    /// Aggregate despite failed clients
    pub accept_failures: Option<bool>,
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self {
            name: "fedavg".to_string(),
            fraction_fit: None,
            fraction_evaluate: None,
            min_fit_clients: None,
            min_evaluate_clients: None,
            min_available_clients: None,
            accept_failures: None,
        }
    }
}

impl StrategySpec {
    /// Apply the set fields on top of `base`.
    #[must_use]
    pub fn apply(&self, mut base: FedAvgBuilder) -> FedAvgBuilder {
        if let Some(v) = self.fraction_fit {
            base = base.fraction_fit(v);
        }
        if let Some(v) = self.fraction_evaluate {
            base = base.fraction_evaluate(v);
        }
        if let Some(v) = self.min_fit_clients {
            base = base.min_fit_clients(v);
        }
        if let Some(v) = self.min_evaluate_clients {
            base = base.min_evaluate_clients(v);
        }
        if let Some(v) = self.min_available_clients {
            base = base.min_available_clients(v);
        }
        if let Some(v) = self.accept_failures {
            base = base.accept_failures(v);
        }
        base
    }

    /// Build the named strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown strategy name.
    pub fn build(&self, base: FedAvgBuilder) -> Result<Box<dyn Strategy>> {
        let strategy = self.apply(base).build();
        match self.name.to_ascii_lowercase().as_str() {
            "fedavg" => Ok(Box::new(strategy)),
            "fedmedian" => Ok(Box::new(FedMedian::new(strategy))),
            other => Err(Error::Config(format!(
                "unknown strategy '{other}', expected fedavg or fedmedian"
            ))),
        }
    }
}

/// Calls a user module's `get_strategy()`.
#[derive(Debug, Clone)]
pub struct StrategyFactory {
    module: Arc<LoadedModule>,
}

impl StrategyFactory {
    pub(crate) fn resolve(module: Arc<LoadedModule>) -> Option<Self> {
        module.has_function("get_strategy").then(|| Self { module })
    }

    /// Evaluate `get_strategy()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleExecution`] if the call fails or returns a
    /// malformed spec.
    pub fn spec(&self) -> Result<StrategySpec> {
        let value = self.module.call("get_strategy", ())?;
        self.module.convert("get_strategy", &value)
    }

    /// Build the user's strategy on top of the orchestrator's defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory fails or names an unknown strategy.
    pub fn build(&self, base: FedAvgBuilder) -> Result<Box<dyn Strategy>> {
        self.spec()?.build(base)
    }
}
