//! Round loop with a client worker pool

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, info_span, warn, Dispatch};

use super::{ClientFailure, ClientFn, EvaluateIns, EvaluateRes, FitIns, FitRes, History, Strategy};
use crate::metrics::ConfigRecord;
use crate::{Error, Result};

/// Explicit engine configuration; nothing is read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Virtual clients (partitions).
    pub num_clients: usize,
    /// Rounds to run.
    pub num_rounds: u32,
    /// Worker threads for client calls; 0 or 1 runs clients inline.
    pub workers: usize,
    /// Seed for client sampling.
    pub seed: u64,
}

impl SimulationConfig {
    /// Config with one worker per CPU and seed 42.
    #[must_use]
    pub fn new(num_clients: usize, num_rounds: u32) -> Self {
        Self {
            num_clients,
            num_rounds,
            workers: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            seed: 42,
        }
    }

    /// Override the worker count.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Override the sampling seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Synchronous federated simulation.
///
/// Round `n + 1` never starts before both of round `n`'s aggregation
/// hooks have returned. Within a phase, client calls run on the worker
/// pool and results are collected in sampling order.
pub struct Simulation {
    config: SimulationConfig,
    #[cfg(feature = "rayon")]
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Call {
    Fit(FitIns),
    Evaluate(EvaluateIns),
}

enum Outcome {
    Fit(FitRes),
    Evaluate(EvaluateRes),
}

impl Simulation {
    /// Create a simulation and its worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Engine`] for zero clients or if the worker pool
    /// cannot be started.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.num_clients == 0 {
            return Err(Error::Engine("simulation needs at least one client".to_string()));
        }

        #[cfg(feature = "rayon")]
        let pool = if config.workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.workers)
                    .thread_name(|i| format!("fedlab-client-{i}"))
                    .build()
                    .map_err(|e| Error::Engine(format!("failed to start worker pool: {e}")))?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            #[cfg(feature = "rayon")]
            pool,
        })
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run every round.
    ///
    /// # Errors
    ///
    /// Returns an error if initial parameters cannot be obtained, a
    /// strategy hook fails, or every client of a phase fails.
    pub fn run(&self, client_fn: &ClientFn, strategy: &mut dyn Strategy) -> Result<History> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut history = History::default();
        let num_clients = self.config.num_clients;

        info!(
            strategy = %strategy.name(),
            num_clients,
            num_rounds = self.config.num_rounds,
            workers = self.config.workers,
            "starting simulation"
        );

        let mut parameters = if let Some(initial) = strategy.initialize_parameters() {
            info!("using initial parameters provided by strategy");
            initial
        } else {
            info!("requesting initial parameters from client 0");
            client_fn(0)?.get_parameters(&ConfigRecord::new())?
        };

        for round in 1..=self.config.num_rounds {
            let _span = info_span!("round", round).entered();

            let instructions = strategy.configure_fit(round, &parameters, num_clients, &mut rng)?;
            if instructions.is_empty() {
                warn!("configure_fit: no clients selected, skipping fit");
            } else {
                let sampled = instructions.len();
                let calls = instructions
                    .into_iter()
                    .map(|(cid, ins)| (cid, Call::Fit(ins)))
                    .collect();
                let (results, failures) = self.dispatch(client_fn, calls);
                let results: Vec<(usize, FitRes)> = results
                    .into_iter()
                    .filter_map(|(cid, outcome)| match outcome {
                        Outcome::Fit(res) => Some((cid, res)),
                        Outcome::Evaluate(_) => None,
                    })
                    .collect();
                info!(sampled, succeeded = results.len(), failed = failures.len(), "fit round finished");
                check_phase("fit", round, sampled, results.is_empty(), &failures)?;

                if let Some((new_parameters, metrics)) =
                    strategy.aggregate_fit(round, &results, &failures)?
                {
                    parameters = new_parameters;
                    history.add_metrics_distributed_fit(round, &metrics);
                }
            }

            let instructions =
                strategy.configure_evaluate(round, &parameters, num_clients, &mut rng)?;
            if instructions.is_empty() {
                debug!("configure_evaluate: no clients selected, skipping evaluation");
                continue;
            }
            let sampled = instructions.len();
            let calls = instructions
                .into_iter()
                .map(|(cid, ins)| (cid, Call::Evaluate(ins)))
                .collect();
            let (results, failures) = self.dispatch(client_fn, calls);
            let results: Vec<(usize, EvaluateRes)> = results
                .into_iter()
                .filter_map(|(cid, outcome)| match outcome {
                    Outcome::Evaluate(res) => Some((cid, res)),
                    Outcome::Fit(_) => None,
                })
                .collect();
            info!(sampled, succeeded = results.len(), failed = failures.len(), "evaluate round finished");
            check_phase("evaluate", round, sampled, results.is_empty(), &failures)?;

            if let Some((loss, metrics)) = strategy.aggregate_evaluate(round, &results, &failures)? {
                history.add_loss_distributed(round, loss);
                history.add_metrics_distributed(round, &metrics);
            }
        }

        info!(rounds = self.config.num_rounds, "simulation finished");
        Ok(history)
    }

    fn dispatch(
        &self,
        client_fn: &ClientFn,
        calls: Vec<(usize, Call)>,
    ) -> (Vec<(usize, Outcome)>, Vec<ClientFailure>) {
        // Worker threads log into whatever subscriber the caller runs under
        let dispatch = tracing::dispatcher::get_default(Dispatch::clone);
        let run_one = |(cid, call): (usize, Call)| {
            tracing::dispatcher::with_default(&dispatch, || (cid, execute(client_fn, cid, call)))
        };

        #[cfg(feature = "rayon")]
        let outcomes: Vec<(usize, Result<Outcome>)> = match &self.pool {
            Some(pool) => {
                use rayon::prelude::*;
                pool.install(|| calls.into_par_iter().map(run_one).collect())
            }
            None => calls.into_iter().map(run_one).collect(),
        };
        #[cfg(not(feature = "rayon"))]
        let outcomes: Vec<(usize, Result<Outcome>)> = calls.into_iter().map(run_one).collect();

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (cid, outcome) in outcomes {
            match outcome {
                Ok(outcome) => results.push((cid, outcome)),
                Err(e) => {
                    warn!(client = cid, error = %e, "client call failed");
                    failures.push(ClientFailure {
                        client_id: cid,
                        error: e.to_string(),
                    });
                }
            }
        }
        (results, failures)
    }
}

fn execute(client_fn: &ClientFn, cid: usize, call: Call) -> Result<Outcome> {
    let mut client = client_fn(cid)?;
    match call {
        Call::Fit(ins) => client.fit(&ins.parameters, &ins.config).map(Outcome::Fit),
        Call::Evaluate(ins) => client
            .evaluate(&ins.parameters, &ins.config)
            .map(Outcome::Evaluate),
    }
}

fn check_phase(
    phase: &str,
    round: u32,
    sampled: usize,
    no_results: bool,
    failures: &[ClientFailure],
) -> Result<()> {
    if !no_results {
        return Ok(());
    }
    let first = failures
        .first()
        .map_or_else(String::new, |f| format!(": client {}: {}", f.client_id, f.error));
    Err(Error::Engine(format!(
        "round {round}: all {sampled} sampled clients failed during {phase}{first}"
    )))
}
