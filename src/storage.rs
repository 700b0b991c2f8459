pub mod clickhouse;
pub mod memory;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::error;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::classification::stats::{PopulationStats, StatsCollector};
use crate::flow::{FlowKey, FlowRecord};

pub type FlowId = String;

/// Stream of stored flows handed out by [`FlowStore::scan`].
pub type FlowStream = BoxStream<'static, Result<StoredFlow, StorageError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Database(String),
    Decode(String),
    Unsupported(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Decode(e) => write!(f, "unable to decode stored flow: {e}"),
            Self::Unsupported(e) => write!(f, "unsupported storage operation: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<clickhouse_rs::errors::Error> for StorageError {
    fn from(e: clickhouse_rs::errors::Error) -> Self {
        error!(target: "clickhouse_errors", "{e}");
        Self::Database(e.to_string())
    }
}

/// A flow as persisted, carrying the identity used to target updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFlow {
    pub id: FlowId,
    #[serde(flatten)]
    pub flow: FlowRecord,
}

impl StoredFlow {
    pub fn new(flow: FlowRecord) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow,
        }
    }
}

/// Packet and byte counters of a flow, written back when fragments are
/// accumulated into an existing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume {
    pub packets_src: u64,
    pub bytes_src: u64,
    pub packets_dst: u64,
    pub bytes_dst: u64,
    pub packets_total: u64,
    pub bytes_total: u64,
}

impl From<&FlowRecord> for Volume {
    fn from(f: &FlowRecord) -> Self {
        Self {
            packets_src: f.packets_src,
            bytes_src: f.bytes_src,
            packets_dst: f.packets_dst,
            bytes_dst: f.bytes_dst,
            packets_total: f.packets_total,
            bytes_total: f.bytes_total,
        }
    }
}

impl Volume {
    pub fn apply(&self, f: &mut FlowRecord) {
        f.packets_src = self.packets_src;
        f.bytes_src = self.bytes_src;
        f.packets_dst = self.packets_dst;
        f.bytes_dst = self.bytes_dst;
        f.packets_total = self.packets_total;
        f.bytes_total = self.bytes_total;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowUpdate {
    pub id: FlowId,
    pub duration_ms: u64,
    pub volume: Option<Volume>,
}

impl FlowUpdate {
    pub fn apply(&self, f: &mut FlowRecord) {
        f.duration_ms = self.duration_ms;
        if let Some(volume) = &self.volume {
            volume.apply(f);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Insert(StoredFlow),
    Update(FlowUpdate),
}

/// Lower bounds (inclusive) selecting the population a statistic or a scan
/// runs over. Unset bounds select everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PopulationFilter {
    #[serde(default)]
    pub min_bytes: Option<u64>,
    #[serde(default)]
    pub min_duration_ms: Option<u64>,
    #[serde(default)]
    pub min_packets: Option<u64>,
}

impl PopulationFilter {
    /// Flows with a duration, as needed wherever a rate is ranked.
    pub fn with_duration() -> Self {
        Self {
            min_duration_ms: Some(1),
            ..Self::default()
        }
    }

    pub fn matches(&self, f: &FlowRecord) -> bool {
        self.min_bytes.map_or(true, |min| f.bytes_total >= min)
            && self.min_duration_ms.map_or(true, |min| f.duration_ms >= min)
            && self.min_packets.map_or(true, |min| f.packets_total >= min)
    }

    /// Tightens every bound of `self` with the bounds of `other`.
    pub fn and(&self, other: &PopulationFilter) -> Self {
        let max = |a: Option<u64>, b: Option<u64>| match (a, b) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Self {
            min_bytes: max(self.min_bytes, other.min_bytes),
            min_duration_ms: max(self.min_duration_ms, other.min_duration_ms),
            min_packets: max(self.min_packets, other.min_packets),
        }
    }
}

/// Orders flows by rate, highest first.
pub fn by_rate_desc(a: &StoredFlow, b: &StoredFlow) -> Ordering {
    b.flow
        .rate()
        .partial_cmp(&a.flow.rate())
        .unwrap_or(Ordering::Equal)
}

#[async_trait]
pub trait FlowStore: Send + Sync + 'static {
    /// Prepares the lookup path used by [`FlowStore::find_latest`].
    async fn create_index(&self) -> Result<(), StorageError>;

    async fn count(&self) -> Result<u64, StorageError>;

    async fn truncate(&self) -> Result<(), StorageError>;

    /// Flow with the given key and the highest start, if any.
    async fn find_latest(&self, key: &FlowKey) -> Result<Option<StoredFlow>, StorageError>;

    async fn insert_many(&self, flows: Vec<StoredFlow>) -> Result<(), StorageError>;

    async fn bulk_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError>;

    fn scan(&self, filter: &PopulationFilter) -> FlowStream;

    async fn population_stats(
        &self,
        filter: &PopulationFilter,
    ) -> Result<PopulationStats, StorageError> {
        let mut flows = self.scan(filter);
        let mut collector = StatsCollector::default();
        while let Some(stored) = flows.next().await {
            collector.push(&stored?.flow);
        }

        Ok(collector.finish())
    }

    async fn top_rates(
        &self,
        filter: &PopulationFilter,
        limit: usize,
    ) -> Result<Vec<StoredFlow>, StorageError> {
        let mut flows = self.scan(&filter.and(&PopulationFilter::with_duration()));
        let mut top: Vec<StoredFlow> = Vec::with_capacity(limit + 1);
        while let Some(stored) = flows.next().await {
            let stored = stored?;
            let position = top
                .binary_search_by(|existing| by_rate_desc(existing, &stored).then(Ordering::Less))
                .unwrap_or_else(|p| p);
            if position < limit {
                top.insert(position, stored);
                top.truncate(limit);
            }
        }

        Ok(top)
    }
}
