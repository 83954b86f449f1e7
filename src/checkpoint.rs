//! Round-indexed parameter snapshots on disk
//!
//! Layout: `{project_root}/checkpoints-data/exp_{id}/round_{n}.ckpt`.
//!
//! File format:
//!
//! ```text
//! ┌──────────┬───────┬──────────────────────────────┐
//! │ "FLCK"   │ codec │ payload (JSON Snapshot)      │
//! │ 4 bytes  │ 1 byte│ raw, LZ4 or ZSTD compressed  │
//! └──────────┴───────┴──────────────────────────────┘
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never sees a half-written snapshot. Saving a round again
//! overwrites its file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::tensor::StateDict;
use crate::{Error, Result};

/// Directory under the project root holding all experiments' checkpoints.
pub const CHECKPOINT_DIR: &str = "checkpoints-data";

const MAGIC: &[u8; 4] = b"FLCK";
const EXTENSION: &str = "ckpt";

/// Payload encoding of a checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Uncompressed JSON (default)
    #[default]
    Raw,
    /// LZ4 - fast, moderate ratio
    #[cfg(feature = "compression")]
    Lz4,
    /// ZSTD - better ratio, slower
    #[cfg(feature = "compression")]
    Zstd,
}

impl Codec {
    /// Get codec name as string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            #[cfg(feature = "compression")]
            Self::Lz4 => "lz4",
            #[cfg(feature = "compression")]
            Self::Zstd => "zstd",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Self::Raw => 0,
            #[cfg(feature = "compression")]
            Self::Lz4 => 1,
            #[cfg(feature = "compression")]
            Self::Zstd => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Raw),
            #[cfg(feature = "compression")]
            1 => Ok(Self::Lz4),
            #[cfg(feature = "compression")]
            2 => Ok(Self::Zstd),
            #[cfg(not(feature = "compression"))]
            1 | 2 => Err(Error::Checkpoint(
                "checkpoint is compressed; rebuild with the `compression` feature".to_string(),
            )),
            other => Err(Error::Checkpoint(format!("unknown codec tag {other}"))),
        }
    }

    fn encode(self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::Raw => Ok(data),
            #[cfg(feature = "compression")]
            Self::Lz4 => Ok(lz4_flex::compress_prepend_size(&data)),
            #[cfg(feature = "compression")]
            Self::Zstd => zstd::encode_all(data.as_slice(), 3)
                .map_err(|e| Error::Checkpoint(format!("ZSTD compression failed: {e}"))),
        }
    }

    fn decode(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Raw => Ok(data.to_vec()),
            #[cfg(feature = "compression")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Checkpoint(format!("LZ4 decompression failed: {e}"))),
            #[cfg(feature = "compression")]
            Self::Zstd => zstd::decode_all(data)
                .map_err(|e| Error::Checkpoint(format!("ZSTD decompression failed: {e}"))),
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "none" => Ok(Self::Raw),
            #[cfg(feature = "compression")]
            "lz4" => Ok(Self::Lz4),
            #[cfg(feature = "compression")]
            "zstd" => Ok(Self::Zstd),
            #[cfg(not(feature = "compression"))]
            "lz4" | "zstd" => Err(Error::Config(format!(
                "checkpoint codec '{s}' requires the `compression` feature"
            ))),
            other => Err(Error::Config(format!("unknown checkpoint codec '{other}'"))),
        }
    }
}

/// Contents of one checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Round the parameters were aggregated in.
    pub round: u32,
    /// Named global model parameters.
    pub model_state: StateDict,
    /// Aggregated training metrics of the round.
    pub metrics: Metrics,
    /// Caller-supplied extra fields.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

/// Checkpoint directory of one experiment.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    project_root: PathBuf,
    dir: PathBuf,
    codec: Codec,
}

impl CheckpointStore {
    /// Store for `experiment_id` under `project_root`. Nothing is created
    /// on disk until the first save.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>, experiment_id: i64) -> Self {
        let project_root = project_root.into();
        let dir = project_root
            .join(CHECKPOINT_DIR)
            .join(format!("exp_{experiment_id}"));
        Self {
            project_root,
            dir,
            codec: Codec::default(),
        }
    }

    /// Use `codec` for subsequent saves. Loads detect the codec per file.
    #[must_use]
    pub const fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Codec used for saves.
    #[must_use]
    pub const fn codec(&self) -> Codec {
        self.codec
    }

    /// Experiment-scoped directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic file path for `round`.
    #[must_use]
    pub fn path_for(&self, round: u32) -> PathBuf {
        self.dir.join(format!("round_{round}.{EXTENSION}"))
    }

    /// `path` relative to the project root, with `/` separators. Paths
    /// outside the root are returned as given.
    #[must_use]
    pub fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_root).map_or_else(
            |_| path.display().to_string(),
            |rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            },
        )
    }

    /// Write the snapshot for `round` and return its absolute path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be encoded or written.
    pub fn save(
        &self,
        round: u32,
        state: &StateDict,
        metrics: &Metrics,
        extra: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let snapshot = Snapshot {
            round,
            model_state: state.clone(),
            metrics: metrics.clone(),
            extra: extra.unwrap_or_default(),
            created_at: Utc::now(),
        };
        let payload = self.codec.encode(serde_json::to_vec(&snapshot)?)?;

        let mut bytes = Vec::with_capacity(MAGIC.len() + 1 + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(self.codec.tag());
        bytes.extend_from_slice(&payload);

        let path = self.path_for(round);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &path)?;

        debug!(round, path = %path.display(), codec = self.codec.as_str(), bytes = bytes.len(), "checkpoint saved");
        Ok(path)
    }

    /// Read the snapshot for `round`; `None` if no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Checkpoint`] if the file exists but is not a valid
    /// snapshot.
    pub fn load(&self, round: u32) -> Result<Option<Snapshot>> {
        let path = self.path_for(round);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_snapshot(&bytes)
            .map(Some)
            .map_err(|e| Error::Checkpoint(format!("{}: {e}", path.display())))
    }

    /// Snapshot with the numerically highest round; `None` if there are none.
    ///
    /// # Errors
    ///
    /// Same as [`CheckpointStore::load`].
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        match self.list()?.last() {
            Some(&round) => self.load(round),
            None => Ok(None),
        }
    }

    /// Rounds present on disk, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be read.
    pub fn list(&self) -> Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rounds = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            let parsed = name
                .strip_prefix("round_")
                .and_then(|rest| rest.strip_suffix(".ckpt"))
                .map(str::parse::<u32>);
            match parsed {
                Some(Ok(round)) => rounds.push(round),
                Some(Err(_)) => warn!(file = %name, "ignoring malformed checkpoint name"),
                None => {}
            }
        }
        rounds.sort_unstable();
        Ok(rounds)
    }
}

fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    if bytes.len() <= MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::Checkpoint("not a checkpoint file".to_string()));
    }
    let codec = Codec::from_tag(bytes[MAGIC.len()])?;
    let payload = codec.decode(&bytes[MAGIC.len() + 1..])?;
    Ok(serde_json::from_slice(&payload)?)
}
