use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::classification::{ClassificationEngine, Dimension};
use crate::config::{ConfigCache, ConfigErr};
use crate::errors::AppError;
use crate::histogram::{self, Histogram, HistogramMetric};
use crate::loader::{load_file, LoadSummary};
use crate::merger::{merge_captures, MergeSummary};
use crate::report::ClassificationReport;
use crate::settings::Configuration;
use crate::storage::clickhouse::ClickhouseStore;
use crate::storage::FlowStore;
use crate::top_rates::{self, TopRates};

/// Validated configuration together with the store every command runs
/// against.
pub struct ApplicationState<S: FlowStore> {
    pub config: Configuration,
    store: Arc<S>,
}

impl ApplicationState<ClickhouseStore> {
    pub fn from_config_path(config_path: &str) -> Result<Self, ConfigErr> {
        let config = ConfigCache::new(config_path)?.configuration()?;
        info!(
            "using clickhouse at {}:{}, table {}.{}",
            config.clickhouse.host,
            config.clickhouse.port,
            config.clickhouse.database,
            config.clickhouse.table
        );
        let store = Arc::new(ClickhouseStore::new(config.clickhouse.clone()));

        Ok(Self::new(config, store))
    }
}

impl<S: FlowStore> ApplicationState<S> {
    pub fn new(config: Configuration, store: Arc<S>) -> Self {
        Self { config, store }
    }

    pub async fn load(&self, path: &Path, replace: bool) -> Result<LoadSummary, AppError> {
        info!("loading {}", path.display());
        Ok(load_file(self.store.clone(), path, &self.config.loader, replace).await?)
    }

    pub async fn merge(&self) -> Result<MergeSummary, AppError> {
        info!(
            "merging {} captures on the timeline of '{}'",
            self.config.merge.captures.len(),
            self.config.merge.base_capture
        );
        Ok(merge_captures(self.store.clone(), &self.config.merge).await?)
    }

    /// Classifies along `dimensions`, every dimension when none is given.
    pub async fn classify(
        &self,
        dimensions: &[Dimension],
    ) -> Result<ClassificationReport, AppError> {
        let dimensions = match dimensions {
            [] => &Dimension::ALL[..],
            d => d,
        };
        let engine =
            ClassificationEngine::new(self.store.clone(), self.config.classification.clone());

        Ok(engine.run(dimensions).await?)
    }

    pub async fn histogram(
        &self,
        metric: HistogramMetric,
        bins: Option<usize>,
    ) -> Result<Histogram, AppError> {
        let bins = bins.unwrap_or(self.config.reporting.histogram_bins);
        Ok(histogram::build(
            self.store.as_ref(),
            metric,
            bins,
            &self.config.classification.filter,
        )
        .await?)
    }

    pub async fn top_rates(&self, limit: Option<usize>) -> Result<TopRates, AppError> {
        let limit = limit.unwrap_or(self.config.reporting.top_rates_limit);
        Ok(top_rates::top_rates(
            self.store.as_ref(),
            &self.config.classification.filter,
            limit,
        )
        .await?)
    }
}
