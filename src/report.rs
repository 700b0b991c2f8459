use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Write;

use crate::classification::stats::{CategoryStats, PopulationStats};
use crate::classification::thresholds::{Archetype, Dimension, DimensionThresholds};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryReport {
    pub category: Archetype,
    #[serde(flatten)]
    pub stats: CategoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionReport {
    pub dimension: Dimension,
    pub thresholds: DimensionThresholds,
    pub categories: Vec<CategoryReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub generated_at: DateTime<Utc>,
    pub population: PopulationStats,
    pub dimensions: Vec<DimensionReport>,
}

/// Output that can be printed either as aligned text or as JSON.
pub trait Render: Serialize {
    fn to_text(&self) -> String;

    fn render(&self, format: ReportFormat) -> Result<String, serde_json::Error> {
        match format {
            ReportFormat::Text => Ok(self.to_text()),
            ReportFormat::Json => serde_json::to_string_pretty(self),
        }
    }
}

impl Render for ClassificationReport {
    fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "classification of {} flows, generated at {}",
            self.population.count,
            self.generated_at.to_rfc3339()
        );

        for dimension in &self.dimensions {
            let _ = writeln!(
                out,
                "\n{} (high >= {:.2}, low < {:.2})",
                dimension.dimension, dimension.thresholds.high.value, dimension.thresholds.low.value
            );
            let _ = writeln!(
                out,
                "{:<10} {:>12} {:>18} {:>16} {:>14} {:>16}",
                "category", "count", "mean duration ms", "mean bytes", "mean packets", "mean rate B/s"
            );
            for category in &dimension.categories {
                let s = &category.stats;
                let _ = writeln!(
                    out,
                    "{:<10} {:>12} {:>18.2} {:>16.2} {:>14.2} {:>16.2}",
                    category.category.to_string(),
                    s.count,
                    s.mean_duration_ms,
                    s.mean_bytes,
                    s.mean_packets,
                    s.mean_rate
                );
            }
        }

        out
    }
}
