//! Error types for fedlab
//!
//! Every fatal failure of a run ends up here. The orchestrator records
//! `Error::status_message()` on the experiment before surfacing the error.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// fedlab error types
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid runner configuration (environment, settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Experiment row does not exist
    #[error("Experiment {0} not found")]
    ExperimentNotFound(i64),

    /// Store used before `connect()` or after `close()`
    #[error("Not connected to the experiment store. Call connect() first.")]
    NotConnected,

    /// A configured user module could not be resolved into a component
    #[error("{0}")]
    ModuleResolution(String),

    /// A user module raised while being executed or called
    #[error("Module '{module}' failed: {message}")]
    ModuleExecution {
        /// Cache name of the module (e.g. `user_model`)
        module: String,
        /// Script error text
        message: String,
    },

    /// Parameter count or shape does not match the model
    #[error("Parameter mismatch: {0}\nThe checkpoint or update is incompatible with the current model.")]
    ParameterMismatch(String),

    /// Checkpoint file could not be written or decoded
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Local training or evaluation failed
    #[error("Training error: {0}")]
    Training(String),

    /// Federated engine failure (sampling, dispatch, aggregation)
    #[error("Engine error: {0}")]
    Engine(String),

    /// Experiment store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable name of the error category, used as `{errorKind}` in status messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigurationError",
            Self::ExperimentNotFound(_) => "NotFoundError",
            Self::NotConnected => "ConnectionError",
            Self::ModuleResolution(_) => "ModuleResolutionError",
            Self::ModuleExecution { .. } => "ModuleExecutionError",
            Self::ParameterMismatch(_) => "ParameterMismatchError",
            Self::Checkpoint(_) => "CheckpointError",
            Self::Training(_) => "TrainingError",
            Self::Engine(_) => "EngineError",
            Self::Storage(_) => "StorageError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
            Self::Sqlite(_) => "SqliteError",
            Self::Other(_) => "Error",
        }
    }

    /// Message persisted on a failed experiment: `{errorKind}: {message}`.
    #[must_use]
    pub fn status_message(&self) -> String {
        format!("{}: {self}", self.kind())
    }
}
