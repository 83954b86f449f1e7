//! SQLite-backed [`ConfigStore`]
//!
//! Tables:
//!
//! ```text
//! experiments (1) ──< metrics (N)            [one row per round]
//!                └──< model_checkpoints (N)  [pointer to round_{n}.ckpt]
//! ```
//!
//! Integers cross the SQL boundary as `i64`; round and client counts are
//! range-checked when rows are read back.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{
    CheckpointRecord, ClientMetric, ConfigStore, ExperimentRecord, ExperimentStatus, RoundMetrics,
};
use crate::{Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    id              INTEGER PRIMARY KEY,
    name            TEXT NOT NULL,
    framework       TEXT NOT NULL DEFAULT 'pytorch',
    num_clients     INTEGER NOT NULL,
    num_rounds      INTEGER NOT NULL,
    client_fraction REAL NOT NULL DEFAULT 0.5,
    learning_rate   REAL NOT NULL DEFAULT 0.01,
    local_epochs    INTEGER NOT NULL DEFAULT 1,
    model_path      TEXT,
    dataset_path    TEXT,
    algorithm_path  TEXT,
    config_path     TEXT,
    use_gpu         INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'pending',
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    final_accuracy  REAL,
    final_loss      REAL,
    logs            TEXT
);
CREATE TABLE IF NOT EXISTS metrics (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id   INTEGER NOT NULL REFERENCES experiments(id),
    round           INTEGER NOT NULL,
    train_loss      REAL,
    train_accuracy  REAL,
    eval_loss       REAL,
    eval_accuracy   REAL,
    client_metrics  TEXT NOT NULL DEFAULT '[]',
    created_at      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS model_checkpoints (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id   INTEGER NOT NULL REFERENCES experiments(id),
    round           INTEGER NOT NULL,
    file_path       TEXT NOT NULL,
    accuracy        REAL,
    loss            REAL,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_experiment ON metrics(experiment_id, round);
CREATE INDEX IF NOT EXISTS idx_checkpoints_experiment ON model_checkpoints(experiment_id, round);
";

const SELECT_EXPERIMENT: &str = "SELECT id, name, framework, num_clients, num_rounds,
    client_fraction, learning_rate, local_epochs, model_path, dataset_path, algorithm_path,
    config_path, use_gpu, status, error_message, created_at, started_at, completed_at,
    final_accuracy, final_loss, logs FROM experiments WHERE id = ?1";

/// Experiment store over a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    path: String,
    conn: Option<Connection>,
}

impl SqliteStore {
    /// Create a store for the database at `path` (`:memory:` for a private
    /// in-memory database). Nothing is opened until `connect()`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    /// Database location.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::NotConnected)
    }

    /// Insert an experiment row. Experiments are normally created by the
    /// web application; this exists for seeding and tests.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the insert fails.
    pub fn insert_experiment(&self, record: &ExperimentRecord) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO experiments (id, name, framework, num_clients, num_rounds,
                client_fraction, learning_rate, local_epochs, model_path, dataset_path,
                algorithm_path, config_path, use_gpu, status, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.id(),
                record.name(),
                record.framework(),
                to_sql_int(record.num_clients())?,
                i64::from(record.num_rounds()),
                record.client_fraction(),
                record.learning_rate(),
                i64::from(record.local_epochs()),
                record.model_path(),
                record.dataset_path(),
                record.algorithm_path(),
                record.config_path(),
                record.use_gpu(),
                record.status().as_str(),
                record.error_message(),
                record.created_at(),
            ],
        )?;
        Ok(())
    }

    /// Read an experiment row, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the row is malformed.
    pub fn experiment(&self, experiment_id: i64) -> Result<Option<ExperimentRecord>> {
        let raw = self
            .conn()?
            .query_row(SELECT_EXPERIMENT, params![experiment_id], RawExperiment::from_row)
            .optional()?;
        raw.map(RawExperiment::into_record).transpose()
    }

    /// Round metrics for an experiment, ordered by round.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or a row is malformed.
    pub fn round_metrics(&self, experiment_id: i64) -> Result<Vec<RoundMetrics>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT round, train_loss, train_accuracy, eval_loss, eval_accuracy,
                    client_metrics, created_at
             FROM metrics WHERE experiment_id = ?1 ORDER BY round, id",
        )?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, DateTime<Utc>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (round, train_loss, train_acc, eval_loss, eval_acc, clients, created_at) = row?;
            let clients: Vec<ClientMetric> = serde_json::from_str(&clients)?;
            out.push(
                RoundMetrics::builder(from_sql_u32(round, "round")?)
                    .train(train_loss, train_acc)
                    .eval(eval_loss, eval_acc)
                    .client_metrics(clients)
                    .created_at(created_at)
                    .build(),
            );
        }
        Ok(out)
    }

    /// Checkpoint pointer rows for an experiment, ordered by round.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or a row is malformed.
    pub fn checkpoint_records(&self, experiment_id: i64) -> Result<Vec<CheckpointRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT round, file_path, accuracy, loss, created_at
             FROM model_checkpoints WHERE experiment_id = ?1 ORDER BY round, id",
        )?;
        let rows = stmt.query_map(params![experiment_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (round, path, accuracy, loss, created_at) = row?;
            out.push(
                CheckpointRecord::new(from_sql_u32(round, "round")?, path, accuracy, loss)
                    .with_created_at(created_at),
            );
        }
        Ok(out)
    }

    fn expect_one_row(changed: usize, experiment_id: i64) -> Result<()> {
        if changed == 0 {
            Err(Error::ExperimentNotFound(experiment_id))
        } else {
            Ok(())
        }
    }
}

impl ConfigStore for SqliteStore {
    fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %self.path, "connected to experiment database");
        self.conn = Some(conn);
        Ok(())
    }

    fn load_config(&self, experiment_id: i64) -> Result<ExperimentRecord> {
        self.experiment(experiment_id)?
            .ok_or(Error::ExperimentNotFound(experiment_id))
    }

    fn update_status(
        &mut self,
        experiment_id: i64,
        status: ExperimentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now();
        let changed = match status {
            ExperimentStatus::Running => conn.execute(
                "UPDATE experiments SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, experiment_id],
            )?,
            ExperimentStatus::Completed => conn.execute(
                "UPDATE experiments SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, experiment_id],
            )?,
            ExperimentStatus::Failed => conn.execute(
                "UPDATE experiments SET status = ?1, completed_at = ?2, error_message = ?3
                 WHERE id = ?4",
                params![status.as_str(), now, error_message, experiment_id],
            )?,
            ExperimentStatus::Pending => conn.execute(
                "UPDATE experiments SET status = ?1 WHERE id = ?2",
                params![status.as_str(), experiment_id],
            )?,
        };
        Self::expect_one_row(changed, experiment_id)
    }

    fn save_round_metrics(&mut self, experiment_id: i64, metrics: &RoundMetrics) -> Result<()> {
        let clients = serde_json::to_string(metrics.client_metrics())?;
        self.conn()?.execute(
            "INSERT INTO metrics (experiment_id, round, train_loss, train_accuracy,
                eval_loss, eval_accuracy, client_metrics, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                experiment_id,
                i64::from(metrics.round()),
                metrics.train_loss(),
                metrics.train_accuracy(),
                metrics.eval_loss(),
                metrics.eval_accuracy(),
                clients,
                metrics.created_at(),
            ],
        )?;
        Ok(())
    }

    fn save_final_results(&mut self, experiment_id: i64, accuracy: f64, loss: f64) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE experiments SET final_accuracy = ?1, final_loss = ?2 WHERE id = ?3",
            params![accuracy, loss, experiment_id],
        )?;
        Self::expect_one_row(changed, experiment_id)
    }

    fn record_checkpoint(
        &mut self,
        experiment_id: i64,
        checkpoint: &CheckpointRecord,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO model_checkpoints (experiment_id, round, file_path, accuracy, loss,
                created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                experiment_id,
                i64::from(checkpoint.round()),
                checkpoint.file_path(),
                checkpoint.accuracy(),
                checkpoint.loss(),
                checkpoint.created_at(),
            ],
        )?;
        Ok(())
    }

    fn save_logs(&mut self, experiment_id: i64, logs: &str) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE experiments SET logs = ?1 WHERE id = ?2",
            params![logs, experiment_id],
        )?;
        Self::expect_one_row(changed, experiment_id)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
            debug!(path = %self.path, "closed experiment database");
        }
        Ok(())
    }
}

/// Column values of one `experiments` row before range checks.
struct RawExperiment {
    id: i64,
    name: String,
    framework: String,
    num_clients: i64,
    num_rounds: i64,
    client_fraction: f64,
    learning_rate: f64,
    local_epochs: i64,
    paths: [Option<String>; 4],
    use_gpu: bool,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    final_accuracy: Option<f64>,
    final_loss: Option<f64>,
    logs: Option<String>,
}

impl RawExperiment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            framework: row.get(2)?,
            num_clients: row.get(3)?,
            num_rounds: row.get(4)?,
            client_fraction: row.get(5)?,
            learning_rate: row.get(6)?,
            local_epochs: row.get(7)?,
            paths: [row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?],
            use_gpu: row.get(12)?,
            status: row.get(13)?,
            error_message: row.get(14)?,
            created_at: row.get(15)?,
            started_at: row.get(16)?,
            completed_at: row.get(17)?,
            final_accuracy: row.get(18)?,
            final_loss: row.get(19)?,
            logs: row.get(20)?,
        })
    }

    fn into_record(self) -> Result<ExperimentRecord> {
        let num_clients = usize::try_from(self.num_clients)
            .map_err(|_| Error::Storage(format!("invalid num_clients {}", self.num_clients)))?;
        let [model, dataset, algorithm, config] = self.paths;

        let mut builder = ExperimentRecord::builder(self.id, self.name)
            .framework(self.framework)
            .num_clients(num_clients)
            .num_rounds(from_sql_u32(self.num_rounds, "num_rounds")?)
            .client_fraction(self.client_fraction)
            .learning_rate(self.learning_rate)
            .local_epochs(from_sql_u32(self.local_epochs, "local_epochs")?)
            .use_gpu(self.use_gpu)
            .status(self.status.parse()?)
            .error_message(self.error_message)
            .created_at(self.created_at)
            .run_times(self.started_at, self.completed_at)
            .final_results(self.final_accuracy, self.final_loss)
            .logs(self.logs);
        if let Some(path) = model {
            builder = builder.model_path(path);
        }
        if let Some(path) = dataset {
            builder = builder.dataset_path(path);
        }
        if let Some(path) = algorithm {
            builder = builder.algorithm_path(path);
        }
        if let Some(path) = config {
            builder = builder.config_path(path);
        }
        Ok(builder.build())
    }
}

fn from_sql_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Storage(format!("invalid {column} {value}")))
}

fn to_sql_int(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Storage(format!("value {value} out of range")))
}
