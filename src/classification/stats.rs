use serde::Serialize;
use statrs::statistics::Statistics;

use crate::flow::FlowRecord;

/// Mean, population standard deviation and range of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        Self {
            mean: Statistics::mean(values),
            std_dev: Statistics::population_std_dev(values),
            min: Statistics::min(values),
            max: Statistics::max(values),
        }
    }
}

/// Result of the aggregation pass over a population of flows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PopulationStats {
    pub count: u64,
    pub bytes: MetricSummary,
    pub duration: MetricSummary,
    pub packets: MetricSummary,
    pub rate: MetricSummary,
}

/// Collects metric values of a scanned population.
#[derive(Debug, Default)]
pub struct StatsCollector {
    bytes: Vec<f64>,
    duration: Vec<f64>,
    packets: Vec<f64>,
    rate: Vec<f64>,
}

impl StatsCollector {
    pub fn push(&mut self, f: &FlowRecord) {
        self.bytes.push(f.bytes_total as f64);
        self.duration.push(f.duration_ms as f64);
        self.packets.push(f.packets_total as f64);
        self.rate.push(f.rate());
    }

    pub fn finish(self) -> PopulationStats {
        PopulationStats {
            count: self.bytes.len() as u64,
            bytes: MetricSummary::from_values(&self.bytes),
            duration: MetricSummary::from_values(&self.duration),
            packets: MetricSummary::from_values(&self.packets),
            rate: MetricSummary::from_values(&self.rate),
        }
    }
}

/// Per category figures reported after classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CategoryStats {
    pub count: u64,
    pub mean_duration_ms: f64,
    pub mean_bytes: f64,
    pub mean_packets: f64,
    pub mean_rate: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryAccumulator {
    count: u64,
    duration_ms: f64,
    bytes: f64,
    packets: f64,
    rate: f64,
}

impl CategoryAccumulator {
    pub fn push(&mut self, f: &FlowRecord) {
        self.count += 1;
        self.duration_ms += f.duration_ms as f64;
        self.bytes += f.bytes_total as f64;
        self.packets += f.packets_total as f64;
        self.rate += f.rate();
    }

    pub fn finish(&self) -> CategoryStats {
        if self.count == 0 {
            return CategoryStats::default();
        }

        let n = self.count as f64;
        CategoryStats {
            count: self.count,
            mean_duration_ms: self.duration_ms / n,
            mean_bytes: self.bytes / n,
            mean_packets: self.packets / n,
            mean_rate: self.rate / n,
        }
    }
}
