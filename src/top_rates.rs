use serde::Serialize;
use std::fmt::Write;

use crate::report::Render;
use crate::storage::{FlowStore, PopulationFilter, StorageError, StoredFlow};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateEntry {
    pub id: String,
    pub src: String,
    pub dst: String,
    pub packets_total: u64,
    pub bytes_total: u64,
    pub duration_ms: u64,
    pub rate: f64,
}

impl From<StoredFlow> for RateEntry {
    fn from(stored: StoredFlow) -> Self {
        let f = &stored.flow;
        Self {
            src: format!("{}:{}", f.src, f.src_port),
            dst: format!("{}:{}", f.dst, f.dst_port),
            packets_total: f.packets_total,
            bytes_total: f.bytes_total,
            duration_ms: f.duration_ms,
            rate: f.rate(),
            id: stored.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopRates(pub Vec<RateEntry>);

impl Render for TopRates {
    fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:<24} {:>12} {:>16} {:>14} {:>18}",
            "source", "destination", "packets", "bytes", "duration ms", "rate B/s"
        );
        for entry in &self.0 {
            let _ = writeln!(
                out,
                "{:<24} {:<24} {:>12} {:>16} {:>14} {:>18.2}",
                entry.src,
                entry.dst,
                entry.packets_total,
                entry.bytes_total,
                entry.duration_ms,
                entry.rate
            );
        }
        out
    }
}

/// Fastest `limit` flows among those with a duration.
pub async fn top_rates<S: FlowStore>(
    store: &S,
    filter: &PopulationFilter,
    limit: usize,
) -> Result<TopRates, StorageError> {
    let flows = store.top_rates(filter, limit).await?;
    Ok(TopRates(flows.into_iter().map(RateEntry::from).collect()))
}
