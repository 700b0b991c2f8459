use clap::ValueEnum;
use futures::StreamExt;
use log::info;
use serde::Serialize;
use std::fmt::Write;

use crate::flow::FlowRecord;
use crate::report::Render;
use crate::storage::{FlowStore, PopulationFilter, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HistogramMetric {
    Duration,
    Volume,
}

impl HistogramMetric {
    fn value(&self, f: &FlowRecord) -> f64 {
        match self {
            Self::Duration => f.duration_ms as f64,
            Self::Volume => f.bytes_total as f64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub centre: f64,
    pub flows: u64,
    pub packets: u64,
    pub bytes: u64,
    /// Bytes per packet, zero for bins without packets.
    pub mean_packet_size: f64,
}

/// Equal width bins over `[min, max]`, the last bin closed on both ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub metric: HistogramMetric,
    pub min: f64,
    pub max: f64,
    pub bins: Vec<HistogramBin>,
}

impl Histogram {
    pub fn new(metric: HistogramMetric, min: f64, max: f64, bins: usize) -> Self {
        let count = bins.max(1);
        let width = (max - min) / count as f64;
        let bins = (0..count)
            .map(|i| {
                let lower = min + i as f64 * width;
                let upper = if i + 1 == count { max } else { lower + width };
                HistogramBin {
                    lower,
                    upper,
                    centre: (lower + upper) / 2.0,
                    ..Default::default()
                }
            })
            .collect();

        Self {
            metric,
            min,
            max,
            bins,
        }
    }

    fn index(&self, value: f64) -> usize {
        let last = self.bins.len() - 1;
        let width = (self.max - self.min) / self.bins.len() as f64;
        if width <= 0.0 || value <= self.min {
            return 0;
        }

        (((value - self.min) / width) as usize).min(last)
    }

    pub fn push(&mut self, f: &FlowRecord) {
        let index = self.index(self.metric.value(f));
        let bin = &mut self.bins[index];
        bin.flows += 1;
        bin.packets += f.packets_total;
        bin.bytes += f.bytes_total;
    }

    fn finish(mut self) -> Self {
        for bin in &mut self.bins {
            if bin.packets > 0 {
                bin.mean_packet_size = bin.bytes as f64 / bin.packets as f64;
            }
        }
        self
    }
}

impl Render for Histogram {
    fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<28} {:>12} {:>14} {:>18} {:>16}",
            "interval", "flows", "packets", "bytes", "mean packet size"
        );
        for bin in &self.bins {
            let _ = writeln!(
                out,
                "{:<28} {:>12} {:>14} {:>18} {:>16.2}",
                format!("[{:.0}, {:.0}]", bin.lower, bin.upper),
                bin.flows,
                bin.packets,
                bin.bytes,
                bin.mean_packet_size
            );
        }
        out
    }
}

/// Bins the population by `metric`: one aggregation for the range, one scan
/// to fill the bins.
pub async fn build<S: FlowStore>(
    store: &S,
    metric: HistogramMetric,
    bins: usize,
    filter: &PopulationFilter,
) -> Result<Histogram, StorageError> {
    let stats = store.population_stats(filter).await?;
    let range = match metric {
        HistogramMetric::Duration => stats.duration,
        HistogramMetric::Volume => stats.bytes,
    };

    let mut histogram = Histogram::new(metric, range.min, range.max, bins);
    let mut flows = store.scan(filter);
    while let Some(stored) = flows.next().await {
        histogram.push(&stored?.flow);
    }

    info!(
        "{:?} histogram of {} flows over [{}, {}]",
        metric, stats.count, range.min, range.max
    );
    Ok(histogram.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowAddr;
    use crate::storage::memory::MemoryStore;
    use crate::storage::StoredFlow;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn flow(bytes_total: u64, duration_ms: u64, packets_total: u64) -> FlowRecord {
        FlowRecord {
            src: FlowAddr::V4(1),
            src_port: 1,
            dst: FlowAddr::V4(2),
            dst_port: 2,
            packets_src: packets_total,
            bytes_src: bytes_total,
            packets_dst: 0,
            bytes_dst: 0,
            packets_total,
            bytes_total,
            start_ms: 0,
            duration_ms,
        }
    }

    #[test_case(0.0, 0; "minimum")]
    #[test_case(9.9, 0; "inside first bin")]
    #[test_case(10.0, 1; "lower edge is inclusive")]
    #[test_case(99.0, 9; "inside last bin")]
    #[test_case(100.0, 9; "maximum lands in last bin")]
    fn test_index(value: f64, expected: usize) {
        let histogram = Histogram::new(HistogramMetric::Duration, 0.0, 100.0, 10);
        assert_eq!(histogram.index(value), expected);
    }

    #[test]
    fn test_degenerate_range() {
        let mut histogram = Histogram::new(HistogramMetric::Volume, 5.0, 5.0, 60);
        histogram.push(&flow(5, 0, 1));
        assert_eq!(histogram.bins[0].flows, 1);
        assert_eq!(histogram.bins.len(), 60);
    }

    #[tokio::test]
    async fn test_build_from_store() {
        let store = MemoryStore::new();
        store
            .insert_many(
                vec![flow(100, 0, 2), flow(300, 10, 4), flow(50, 40, 0)]
                    .into_iter()
                    .map(StoredFlow::new)
                    .collect(),
            )
            .await
            .unwrap();

        let histogram = build(
            &store,
            HistogramMetric::Duration,
            4,
            &PopulationFilter::default(),
        )
        .await
        .unwrap();

        let summary = histogram
            .bins
            .iter()
            .map(|b| (b.lower, b.flows, b.packets, b.bytes, b.mean_packet_size))
            .collect::<Vec<(f64, u64, u64, u64, f64)>>();
        assert_eq!(
            summary,
            vec![
                (0.0, 1, 2, 100, 50.0),
                (10.0, 1, 4, 300, 75.0),
                (20.0, 0, 0, 0, 0.0),
                (30.0, 1, 0, 50, 0.0),
            ]
        );
    }
}
