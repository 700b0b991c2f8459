use log::{debug, info, warn};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::consts::LOADER_BATCH_SIZE;
use crate::flow::{parse, FlowRecord, ParseError, ParsedLine};
use crate::storage::{FlowStore, StorageError, StoredFlow};

fn default_batch_size() -> usize {
    LOADER_BATCH_SIZE
}

fn default_skip_malformed() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoaderSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub allow_ipv6: bool,
    #[serde(default = "default_skip_malformed")]
    pub skip_malformed: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            allow_ipv6: false,
            skip_malformed: default_skip_malformed(),
        }
    }
}

#[derive(Debug)]
pub enum LoadError {
    NotEmpty(u64),
    Parse { line: usize, source: ParseError },
    Storage(StorageError),
    Io(std::io::Error),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotEmpty(n) => write!(
                f,
                "storage already holds {n} flows, pass --replace to overwrite them"
            ),
            Self::Parse { line, source } => write!(f, "line {line}: {source}"),
            Self::Storage(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<StorageError> for LoadError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Buffers flows and hands them to storage one batch at a time.
///
/// A failed flush leaves earlier batches in place.
pub struct BatchLoader<S: FlowStore> {
    store: Arc<S>,
    buffer: Vec<StoredFlow>,
    batch_size: usize,
    inserted: u64,
}

impl<S: FlowStore> BatchLoader<S> {
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            buffer: Vec::with_capacity(batch_size.min(LOADER_BATCH_SIZE)),
            batch_size,
            inserted: 0,
        }
    }

    pub async fn push(&mut self, flow: FlowRecord) -> Result<(), StorageError> {
        self.buffer.push(StoredFlow::new(flow));
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = self.buffer.drain(..).collect::<Vec<StoredFlow>>();
        let len = batch.len() as u64;
        self.store.insert_many(batch).await?;
        self.inserted += len;
        debug!("flushed batch of {len} flows, {} so far", self.inserted);
        Ok(())
    }

    /// Flushes the partial batch and returns how many flows were inserted.
    pub async fn finish(mut self) -> Result<u64, StorageError> {
        self.flush().await?;
        Ok(self.inserted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub inserted: u64,
    pub ipv6_skipped: u64,
    pub malformed: u64,
    pub elapsed: Duration,
}

/// Loads one capture file as is, without any timeline shift or merging.
pub async fn load_file<S: FlowStore>(
    store: Arc<S>,
    path: &Path,
    settings: &LoaderSettings,
    replace: bool,
) -> Result<LoadSummary, LoadError> {
    let started = Instant::now();

    store.create_index().await?;
    let existing = store.count().await?;
    if existing > 0 {
        if !replace {
            return Err(LoadError::NotEmpty(existing));
        }
        warn!("dropping {existing} stored flows before loading");
        store.truncate().await?;
    }

    let mut lines = BufReader::new(File::open(path).await?).lines();
    let mut loader = BatchLoader::new(store, settings.batch_size);
    let mut summary = LoadSummary::default();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        match parse(&line, settings.allow_ipv6) {
            Ok(ParsedLine::Flow(flow)) => loader.push(flow).await?,
            Ok(ParsedLine::Ipv6Skipped) => summary.ipv6_skipped += 1,
            Err(e) if settings.skip_malformed => {
                warn!("skipping line {line_no} of {}: {e}", path.display());
                summary.malformed += 1;
            }
            Err(e) => {
                return Err(LoadError::Parse {
                    line: line_no,
                    source: e,
                })
            }
        }
    }

    summary.inserted = loader.finish().await?;
    summary.elapsed = started.elapsed();
    info!(
        "loaded {} flows from {} in {:.2?} ({} ipv6 skipped, {} malformed)",
        summary.inserted,
        path.display(),
        summary.elapsed,
        summary.ipv6_skipped,
        summary.malformed
    );

    Ok(summary)
}
