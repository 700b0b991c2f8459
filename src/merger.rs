pub mod buffer;
pub mod engine;

use log::info;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

use crate::capture::{calibrate, CaptureError, CaptureSettings};
use crate::consts::{MERGE_BATCH_SIZE, MERGE_TIMEOUT_LIMIT_MS};
use crate::flow::ParseError;
use crate::storage::{FlowStore, StorageError};

pub use engine::{FileSummary, FlowMergeEngine, MergeOutcome};

/// How the counters of a fragment merged into an existing flow are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumePolicy {
    /// Counters stay those of the first fragment, only the duration grows.
    #[default]
    KeepFirst,
    /// Counters of every merged fragment are added up.
    Accumulate,
}

fn default_timeout_limit_ms() -> i64 {
    MERGE_TIMEOUT_LIMIT_MS
}

fn default_batch_size() -> usize {
    MERGE_BATCH_SIZE
}

fn default_skip_malformed() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MergeSettings {
    /// Largest silence, in ms, after which a fragment starts a new flow.
    #[serde(default = "default_timeout_limit_ms")]
    pub timeout_limit_ms: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub volume_policy: VolumePolicy,
    #[serde(default)]
    pub allow_ipv6: bool,
    #[serde(default = "default_skip_malformed")]
    pub skip_malformed: bool,
    /// Capture whose first packet is the zero of the merged timeline.
    #[serde(default)]
    pub base_capture: String,
    #[serde(default)]
    pub captures: Vec<CaptureSettings>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            timeout_limit_ms: default_timeout_limit_ms(),
            batch_size: default_batch_size(),
            volume_policy: VolumePolicy::default(),
            allow_ipv6: false,
            skip_malformed: default_skip_malformed(),
            base_capture: String::new(),
            captures: vec![],
        }
    }
}

#[derive(Debug)]
pub enum MergeError {
    OutOfOrder { previous: String, next: String },
    UnknownBase(String),
    Timestamp(String),
    Parse {
        file: String,
        line: usize,
        source: ParseError,
    },
    Storage(StorageError),
    Io(std::io::Error),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfOrder { previous, next } => write!(
                f,
                "capture '{next}' starts before '{previous}', captures must be merged in start order"
            ),
            Self::UnknownBase(b) => write!(f, "base capture '{b}' is not in the calibration table"),
            Self::Timestamp(e) => write!(f, "{e}"),
            Self::Parse { file, line, source } => write!(f, "{file}, line {line}: {source}"),
            Self::Storage(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MergeError {}

impl From<CaptureError> for MergeError {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::OutOfOrder { previous, next } => Self::OutOfOrder { previous, next },
            CaptureError::UnknownBase(base) => Self::UnknownBase(base),
            e @ (CaptureError::Timestamp(_) | CaptureError::EndBeforeStart(_)) => {
                Self::Timestamp(e.to_string())
            }
        }
    }
}

impl From<StorageError> for MergeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<std::io::Error> for MergeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub files: Vec<FileSummary>,
}

impl MergeSummary {
    pub fn inserted(&self) -> u64 {
        self.files.iter().map(|f| f.inserted).sum()
    }

    pub fn merged(&self) -> u64 {
        self.files.iter().map(|f| f.merged).sum()
    }
}

/// Calibrates the configured captures and merges every one of them that is
/// not already in storage.
pub async fn merge_captures<S: FlowStore>(
    store: Arc<S>,
    settings: &MergeSettings,
) -> Result<MergeSummary, MergeError> {
    let captures = calibrate(&settings.captures, &settings.base_capture)?;
    let mut engine = FlowMergeEngine::new(store, settings.clone());
    let summary = engine.run(&captures).await?;

    info!(
        "merge finished: {} files, {} flows inserted, {} fragments merged",
        summary.files.len(),
        summary.inserted(),
        summary.merged()
    );
    Ok(summary)
}
