//! Round Orchestrator - one experiment run, end to end
//!
//! ## State machine
//!
//! ```text
//! Init ─► LoadingModules ─► Running ─► Completed
//!   └──────────┴───────────────┴─────► Failed
//! ```
//!
//! - `Init → LoadingModules` once the experiment is marked `running`
//! - `LoadingModules → Running` once model, dataset and strategy are
//!   resolved and the compute device is selected
//! - `Running → Completed` once every round ran and final results are saved
//! - any error moves to `Failed`: the status and `{kind}: {message}` are
//!   written to the store, then the error is returned
//!
//! Whatever the outcome, the captured run log is saved and the store is
//! closed afterwards. A failure to save logs is only logged.
//!
//! ## Module resolution
//!
//! A category with a configured path must resolve, or the run fails. The
//! built-in defaults are only used when no path is configured.

mod callbacks;
mod device;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn};

pub use callbacks::PersistingStrategy;
pub use device::{AcceleratorInfo, Device, SystemResources};

use crate::checkpoint::{CheckpointStore, Codec};
use crate::client::{client_fn, DataFn, LocalTraining, ModelFn};
use crate::engine::{FedAvg, FedAvgBuilder, History, Simulation, SimulationConfig, Strategy};
use crate::experiment::{ConfigStore, ExperimentRecord, ExperimentStatus, RoundMetrics};
use crate::loader::{Category, Component, ModuleLoader, StrategyFactory, UserConfig, UPLOAD_HINT};
use crate::logging::LogCapture;
use crate::metrics::{ConfigRecord, Scalar};
use crate::nn::{defaults, synthetic_partition, OptimizerKind, SyntheticSpec};
use crate::settings::RunnerSettings;
use crate::{Error, Result};

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started
    Init,
    /// Resolving user modules and the compute device
    LoadingModules,
    /// Rounds in progress
    Running,
    /// All rounds finished and results saved
    Completed,
    /// Ended with an error
    Failed,
}

impl Phase {
    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::LoadingModules => "loading_modules",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Experiment that ran
    pub experiment_id: i64,
    /// Rows persisted by the round callbacks
    pub rounds: Vec<RoundMetrics>,
    /// Saved final accuracy
    pub final_accuracy: Option<f64>,
    /// Saved final loss
    pub final_loss: Option<f64>,
    /// Device the run used
    pub device: Device,
    /// Defaults merged with the user config
    pub config: ConfigRecord,
    /// Engine history
    pub history: History,
}

/// Components the run trains with.
struct ResolvedModules {
    model_fn: Arc<ModelFn>,
    data_fn: Arc<DataFn>,
    strategy: Option<StrategyFactory>,
    config: ConfigRecord,
}

/// Coordinates one experiment run against a [`ConfigStore`].
///
/// Owns the store connection and the log buffer for the duration of the
/// run; neither is shared with other experiments.
pub struct RoundOrchestrator<S: ConfigStore> {
    experiment_id: i64,
    settings: RunnerSettings,
    store: S,
    loader: ModuleLoader,
    checkpoints: CheckpointStore,
    log_capture: LogCapture,
    resources: Option<SystemResources>,
    phase: Phase,
}

impl<S: ConfigStore> fmt::Debug for RoundOrchestrator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundOrchestrator")
            .field("experiment_id", &self.experiment_id)
            .field("phase", &self.phase)
            .field("project_root", &self.settings.project_root)
            .finish_non_exhaustive()
    }
}

impl<S: ConfigStore> RoundOrchestrator<S> {
    /// Prepare a run of `experiment_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the module cache directory cannot be created.
    pub fn new(experiment_id: i64, store: S, settings: RunnerSettings) -> Result<Self> {
        let loader = ModuleLoader::new(&settings.project_root)?;
        let checkpoints = CheckpointStore::new(&settings.project_root, experiment_id);
        Ok(Self {
            experiment_id,
            settings,
            store,
            loader,
            checkpoints,
            log_capture: LogCapture::new(),
            resources: None,
            phase: Phase::Init,
        })
    }

    /// Use a fixed resource inventory instead of probing the host.
    #[must_use]
    pub fn with_resources(mut self, resources: SystemResources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// The store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Give back the store (e.g. to inspect it after a run).
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// The module loader.
    #[must_use]
    pub const fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// The checkpoint store.
    #[must_use]
    pub const fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Log text captured so far.
    #[must_use]
    pub fn logs(&self) -> String {
        self.log_capture.contents()
    }

    /// Run the experiment.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run after recording it on the
    /// experiment. Errors from `connect()` cannot be recorded.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.store.connect()?;

        let dispatch = self
            .log_capture
            .dispatch(&self.settings.log_filter, self.settings.echo_logs);
        let outcome = tracing::dispatcher::with_default(&dispatch, || {
            let _span = info_span!("experiment", id = self.experiment_id).entered();
            let outcome = self.execute();
            if let Err(e) = &outcome {
                self.record_failure(e);
            }
            outcome
        });

        let logs = self.log_capture.contents();
        if !logs.is_empty() {
            if let Err(e) = self.store.save_logs(self.experiment_id, &logs) {
                warn!(experiment = self.experiment_id, error = %e, "failed to save logs");
            }
        }
        if let Err(e) = self.store.close() {
            warn!(experiment = self.experiment_id, error = %e, "failed to close store");
        }
        outcome
    }

    fn record_failure(&mut self, e: &Error) {
        self.phase = Phase::Failed;
        let message = e.status_message();
        error!(error = %message, "experiment failed");
        if let Err(status_error) =
            self.store
                .update_status(self.experiment_id, ExperimentStatus::Failed, Some(&message))
        {
            error!(error = %status_error, "failed to record failure status");
        }
    }

    fn execute(&mut self) -> Result<RunSummary> {
        let record = self.store.load_config(self.experiment_id)?;
        self.store
            .update_status(self.experiment_id, ExperimentStatus::Running, None)?;
        self.phase = Phase::LoadingModules;
        info!(name = record.name(), framework = record.framework(), "experiment running");

        let modules = self.load_modules(&record)?;
        let resources = self
            .resources
            .clone()
            .unwrap_or_else(SystemResources::detect);
        let device = Device::select(record.use_gpu(), &resources);

        self.phase = Phase::Running;
        let config = modules.config.clone();
        let (history, rounds) = self.run_simulation(&record, modules, &resources, &device)?;

        let final_accuracy = history
            .last_metric_containing("accuracy")
            .or_else(|| rounds.last().and_then(RoundMetrics::eval_accuracy));
        let final_loss = history
            .last_loss()
            .or_else(|| rounds.last().and_then(RoundMetrics::eval_loss));
        if final_accuracy.is_some() || final_loss.is_some() {
            self.store.save_final_results(
                self.experiment_id,
                final_accuracy.unwrap_or(0.0),
                final_loss.unwrap_or(0.0),
            )?;
        }
        info!(?final_accuracy, ?final_loss, rounds = rounds.len(), "experiment completed");

        self.store
            .update_status(self.experiment_id, ExperimentStatus::Completed, None)?;
        self.phase = Phase::Completed;
        Ok(RunSummary {
            experiment_id: self.experiment_id,
            rounds,
            final_accuracy,
            final_loss,
            device,
            config,
            history,
        })
    }

    fn load_modules(&self, record: &ExperimentRecord) -> Result<ResolvedModules> {
        let config = self.merged_config(record);
        let batch_size = config_usize(&config, "batch_size").unwrap_or(32);
        let seed = config_u64(&config, "seed").unwrap_or(42);

        let model_fn: Arc<ModelFn> = match record.model_path() {
            Some(path) => match self.loader.resolve(path, Category::Model) {
                Component::Model(factory) => {
                    info!(path, origin = factory.origin(), "using uploaded model");
                    Arc::new(move || factory.build())
                }
                other => return Err(resolution_error(Category::Model, path, &other)),
            },
            None => {
                info!("using default model");
                Arc::new(defaults::get_model)
            }
        };

        let data_fn: Arc<DataFn> = match record.dataset_path() {
            Some(path) => match self.loader.resolve(path, Category::Dataset) {
                Component::Dataset(dataset) => {
                    info!(path, "using uploaded dataset");
                    let dataset = dataset.with_default_batch_size(batch_size).with_seed(seed);
                    Arc::new(move |pid, n| dataset.load(pid, n))
                }
                other => return Err(resolution_error(Category::Dataset, path, &other)),
            },
            None => {
                info!(batch_size, "using default synthetic dataset");
                let spec = SyntheticSpec {
                    batch_size,
                    seed,
                    ..SyntheticSpec::default()
                };
                Arc::new(move |pid, n| synthetic_partition(pid, n, &spec))
            }
        };

        let strategy = match record.algorithm_path() {
            Some(path) => match self.loader.resolve(path, Category::Strategy) {
                Component::Strategy(factory) => {
                    info!(path, "using uploaded strategy");
                    Some(factory)
                }
                other => return Err(resolution_error(Category::Strategy, path, &other)),
            },
            None => None,
        };

        Ok(ResolvedModules {
            model_fn,
            data_fn,
            strategy,
            config,
        })
    }

    /// Built-in defaults overlaid with the scalar values of the user config.
    fn merged_config(&self, record: &ExperimentRecord) -> ConfigRecord {
        let mut config = defaults::default_config();
        let Some(path) = record.config_path() else {
            return config;
        };
        let user = match self.loader.resolve(path, Category::Config) {
            Component::Config(user) => user,
            _ => UserConfig::new(),
        };
        info!(path, keys = user.len(), "user config loaded");
        for (key, value) in user {
            match serde_json::from_value::<Scalar>(value) {
                Ok(scalar) => {
                    config.insert(key, scalar);
                }
                Err(_) => debug!(key, "ignoring non-scalar config value"),
            }
        }
        config
    }

    fn run_simulation(
        &mut self,
        record: &ExperimentRecord,
        modules: ResolvedModules,
        resources: &SystemResources,
        device: &Device,
    ) -> Result<(History, Vec<RoundMetrics>)> {
        let num_clients = record.num_clients();
        let num_rounds = record.num_rounds();
        let fraction = record.client_fraction();
        let local_epochs = record.local_epochs();
        let learning_rate = record.learning_rate();
        let config = &modules.config;

        let optimizer = match config.get("optimizer") {
            Some(Scalar::Str(name)) => name.parse::<OptimizerKind>()?,
            _ => OptimizerKind::default(),
        };
        let training = LocalTraining {
            local_epochs,
            learning_rate,
            optimizer,
            momentum: config
                .get("momentum")
                .and_then(Scalar::as_f64)
                .unwrap_or(defaults::MOMENTUM),
        };

        let codec = match config.get("checkpoint_codec") {
            Some(Scalar::Str(name)) => name.parse::<Codec>()?,
            _ => Codec::default(),
        };
        self.checkpoints = self.checkpoints.clone().with_codec(codec);

        let cpus_per_client = config_usize(config, "cpus_per_client").unwrap_or(1);
        let workers = self
            .settings
            .workers
            .unwrap_or_else(|| resources.workers_for(cpus_per_client));
        let seed = config_u64(config, "seed").unwrap_or(42);

        info!(
            experiment = self.experiment_id,
            framework = record.framework(),
            num_clients,
            num_rounds,
            client_fraction = fraction,
            local_epochs,
            learning_rate,
            optimizer = optimizer.as_str(),
            checkpoint_codec = codec.as_str(),
            %device,
            cpus_per_client,
            workers,
            "starting simulation"
        );

        let initial_model = (modules.model_fn)()?;
        let template = initial_model.state_dict();
        let initial_parameters = template.to_parameters();

        let base = move || {
            FedAvg::for_clients(num_clients, fraction)
                .initial_parameters(initial_parameters.clone())
                .on_fit_config(Box::new(move |round| {
                    fit_config(round, local_epochs, learning_rate)
                }))
                .on_evaluate_config(Box::new(evaluate_config))
        };
        let strategy = build_strategy(modules.strategy.as_ref(), base);

        let clients = client_fn(
            Arc::clone(&modules.model_fn),
            Arc::clone(&modules.data_fn),
            num_clients,
            training,
        );
        let simulation = Simulation::new(
            SimulationConfig::new(num_clients, num_rounds)
                .with_workers(workers)
                .with_seed(seed),
        )?;

        let mut persisting = PersistingStrategy::new(
            strategy,
            self.experiment_id,
            &mut self.store,
            &self.checkpoints,
            template,
        );
        let history = simulation.run(&*clients, &mut persisting)?;
        Ok((history, persisting.into_persisted()))
    }
}

/// The user's strategy on top of `base`, or plain FedAvg when there is
/// none or its factory fails.
fn build_strategy(
    factory: Option<&StrategyFactory>,
    base: impl Fn() -> FedAvgBuilder,
) -> Box<dyn Strategy> {
    if let Some(factory) = factory {
        match factory.build(base()) {
            Ok(strategy) => {
                info!(strategy = %strategy.name(), "using custom strategy");
                return strategy;
            }
            Err(e) => {
                warn!(error = %e, "failed to create custom strategy, falling back to FedAvg");
            }
        }
    }
    Box::new(base().build())
}

/// Config sent with every `fit` call.
#[must_use]
pub fn fit_config(round: u32, local_epochs: u32, learning_rate: f64) -> ConfigRecord {
    [
        ("server_round", Scalar::from(round)),
        ("local_epochs", Scalar::from(local_epochs)),
        ("learning_rate", Scalar::Float(learning_rate)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Config sent with every `evaluate` call.
#[must_use]
pub fn evaluate_config(round: u32) -> ConfigRecord {
    std::iter::once(("server_round".to_string(), Scalar::from(round))).collect()
}

fn resolution_error(category: Category, path: &str, component: &Component) -> Error {
    let reason = component
        .invalid_reason()
        .unwrap_or("unexpected component type")
        .trim_end_matches(UPLOAD_HINT)
        .trim_end()
        .trim_end_matches('.');
    Error::ModuleResolution(format!(
        "Failed to load {category} module from '{path}': {reason}. {UPLOAD_HINT}"
    ))
}

fn config_usize(config: &ConfigRecord, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Scalar::as_i64)
        .and_then(|v| usize::try_from(v).ok())
        .filter(|&v| v > 0)
}

fn config_u64(config: &ConfigRecord, key: &str) -> Option<u64> {
    config
        .get(key)
        .and_then(Scalar::as_i64)
        .and_then(|v| u64::try_from(v).ok())
}
