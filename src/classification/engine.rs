use chrono::Utc;
use futures::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use super::stats::{CategoryAccumulator, PopulationStats};
use super::thresholds::{Archetype, ClassificationThresholds, Dimension};
use super::{ClassificationError, ClassificationSettings};
use crate::flow::FlowRecord;
use crate::report::{CategoryReport, ClassificationReport, DimensionReport};
use crate::storage::FlowStore;

/// Archetype of one flow for every requested dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub volume: Option<Archetype>,
    pub duration: Option<Archetype>,
    pub packets: Option<Archetype>,
    pub rate: Option<Archetype>,
}

impl Classification {
    pub fn get(&self, dimension: Dimension) -> Option<Archetype> {
        match dimension {
            Dimension::Volume => self.volume,
            Dimension::Duration => self.duration,
            Dimension::Packets => self.packets,
            Dimension::Rate => self.rate,
        }
    }

    fn set(&mut self, dimension: Dimension, archetype: Archetype) {
        match dimension {
            Dimension::Volume => self.volume = Some(archetype),
            Dimension::Duration => self.duration = Some(archetype),
            Dimension::Packets => self.packets = Some(archetype),
            Dimension::Rate => self.rate = Some(archetype),
        }
    }
}

fn metric(dimension: Dimension, f: &FlowRecord) -> f64 {
    match dimension {
        Dimension::Volume => f.bytes_total as f64,
        Dimension::Duration => f.duration_ms as f64,
        Dimension::Packets => f.packets_total as f64,
        Dimension::Rate => f.rate(),
    }
}

pub struct ClassificationEngine<S: FlowStore> {
    store: Arc<S>,
    settings: ClassificationSettings,
}

impl<S: FlowStore> ClassificationEngine<S> {
    pub fn new(store: Arc<S>, settings: ClassificationSettings) -> Self {
        Self { store, settings }
    }

    /// Aggregation pass: population statistics and the thresholds derived
    /// from them.
    pub async fn thresholds(
        &self,
        dimensions: &[Dimension],
    ) -> Result<(PopulationStats, ClassificationThresholds), ClassificationError> {
        let stats = self.store.population_stats(&self.settings.filter).await?;
        if stats.count == 0 {
            return Err(ClassificationError::EmptyPopulation);
        }

        let thresholds = ClassificationThresholds::derive(&stats, &self.settings, dimensions);
        info!(
            "population of {} flows, thresholds: {:?}",
            stats.count, thresholds
        );

        Ok((stats, thresholds))
    }

    pub fn classify(&self, thresholds: &ClassificationThresholds, f: &FlowRecord) -> Classification {
        let mut classification = Classification::default();
        let guarded = f.packets_total < self.settings.min_packets;

        for dimension in Dimension::ALL {
            if let Some(bounds) = thresholds.get(dimension) {
                let archetype = if guarded {
                    Archetype::Normal
                } else {
                    dimension.archetype(bounds.level(metric(dimension, f)))
                };
                classification.set(dimension, archetype);
            }
        }

        classification
    }

    /// Both passes over the configured population, reported per dimension
    /// and category.
    pub async fn run(
        &self,
        dimensions: &[Dimension],
    ) -> Result<ClassificationReport, ClassificationError> {
        let started = Instant::now();
        let mut dimensions = dimensions.to_vec();
        dimensions.sort();
        dimensions.dedup();

        let (stats, thresholds) = self.thresholds(&dimensions).await?;

        let mut categories: HashMap<(Dimension, Archetype), CategoryAccumulator> = HashMap::new();
        let mut flows = self.store.scan(&self.settings.filter);
        let mut scanned: u64 = 0;
        while let Some(stored) = flows.next().await {
            let stored = stored?;
            let classification = self.classify(&thresholds, &stored.flow);
            for &dimension in &dimensions {
                if let Some(archetype) = classification.get(dimension) {
                    categories
                        .entry((dimension, archetype))
                        .or_default()
                        .push(&stored.flow);
                }
            }
            scanned += 1;
        }
        debug!("classified {} flows", scanned);

        let mut report = Vec::with_capacity(dimensions.len());
        for dimension in dimensions {
            let bounds = match thresholds.get(dimension) {
                Some(bounds) => *bounds,
                None => continue,
            };
            report.push(DimensionReport {
                dimension,
                thresholds: bounds,
                categories: dimension
                    .archetypes()
                    .into_iter()
                    .map(|category| CategoryReport {
                        category,
                        stats: categories
                            .get(&(dimension, category))
                            .map(CategoryAccumulator::finish)
                            .unwrap_or_default(),
                    })
                    .collect(),
            });
        }

        info!(
            "classification of {} flows done in {:.2?}",
            scanned,
            started.elapsed()
        );

        Ok(ClassificationReport {
            generated_at: Utc::now(),
            population: stats,
            dimensions: report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::stats::{CategoryStats, MetricSummary};
    use crate::classification::RateHigh;
    use crate::flow::FlowAddr;
    use crate::storage::memory::MemoryStore;
    use crate::storage::mock::MockStore;
    use crate::storage::{StorageError, StoredFlow};
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

    async fn store_with(flows: Vec<FlowRecord>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_many(flows.into_iter().map(StoredFlow::new).collect())
            .await
            .unwrap();
        store
    }

    fn settings() -> ClassificationSettings {
        let mut settings = ClassificationSettings::default();
        settings.sigma_multiplier = 1.0;
        settings.volume.low_threshold_bytes = 100;
        settings.duration.short_threshold_ms = 100;
        settings
    }

    #[tokio::test]
    async fn test_empty_population_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let engine = ClassificationEngine::new(store, settings());

        let result = engine.run(&Dimension::ALL).await;
        assert_eq!(result.err(), Some(ClassificationError::EmptyPopulation));
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let mut store = MockStore::new();
        store
            .expect_population_stats()
            .times(1)
            .returning(|_| Err(StorageError::Database(String::from("connection refused"))));
        store.expect_scan().never();

        let engine = ClassificationEngine::new(Arc::new(store), settings());
        let result = engine.run(&[Dimension::Volume]).await;

        assert_eq!(
            result.err(),
            Some(ClassificationError::Storage(StorageError::Database(
                String::from("connection refused")
            )))
        );
    }

    #[test_case(flow(10, 10, 2), Archetype::Normal; "guarded flow stays normal")]
    #[test_case(flow(10, 500, 3), Archetype::Mouse; "small flow is a mouse")]
    #[test_case(flow(5_000, 500, 3), Archetype::Elephant; "large flow is an elephant")]
    #[test_case(flow(500, 500, 3), Archetype::Normal; "between bounds")]
    fn test_volume_archetype(f: FlowRecord, expected: Archetype) {
        let engine = ClassificationEngine::new(Arc::new(MemoryStore::new()), settings());
        let thresholds = ClassificationThresholds::derive(
            &PopulationStats {
                count: 3,
                bytes: MetricSummary {
                    mean: 1_000.0,
                    std_dev: 1_000.0,
                    min: 0.0,
                    max: 0.0,
                },
                ..Default::default()
            },
            &settings(),
            &[Dimension::Volume],
        );

        let classification = engine.classify(&thresholds, &f);
        assert_eq!(classification.volume, Some(expected));
        assert_eq!(classification.duration, None);
    }

    #[test_case(flow(500, 50, 3), Archetype::Dragonfly; "short flow is a dragonfly")]
    #[test_case(flow(500, 99, 3), Archetype::Dragonfly; "just under the short threshold")]
    #[test_case(flow(500, 100, 3), Archetype::Normal; "exactly the short threshold is not short")]
    #[test_case(flow(500, 1_999, 3), Archetype::Normal; "just under the long threshold")]
    #[test_case(flow(500, 2_000, 3), Archetype::Tortoise; "exactly the long threshold")]
    #[test_case(flow(500, 60_000, 3), Archetype::Tortoise; "long flow is a tortoise")]
    fn test_duration_archetype(f: FlowRecord, expected: Archetype) {
        let engine = ClassificationEngine::new(Arc::new(MemoryStore::new()), settings());
        // k = 1 puts the tortoise bound at 2 000 ms.
        let thresholds = ClassificationThresholds::derive(
            &PopulationStats {
                count: 3,
                duration: MetricSummary {
                    mean: 1_500.0,
                    std_dev: 500.0,
                    min: 0.0,
                    max: 0.0,
                },
                ..Default::default()
            },
            &settings(),
            &[Dimension::Duration],
        );

        let classification = engine.classify(&thresholds, &f);
        assert_eq!(classification.duration, Some(expected));
        assert_eq!(classification.volume, None);
        assert_eq!(classification.rate, None);
    }

    #[test_case(flow(u64::MAX / 2, 86_400_000, 2); "extreme bytes and duration")]
    #[test_case(flow(1_000_000_000, 1, 1); "extreme rate")]
    #[test_case(flow(0, 0, 0); "no packets at all")]
    fn test_guarded_flow_is_normal_in_every_dimension(f: FlowRecord) {
        let engine = ClassificationEngine::new(Arc::new(MemoryStore::new()), settings());
        let summary = MetricSummary {
            mean: 10.0,
            std_dev: 1.0,
            min: 0.0,
            max: 0.0,
        };
        let thresholds = ClassificationThresholds::derive(
            &PopulationStats {
                count: 10,
                bytes: summary,
                duration: summary,
                packets: summary,
                rate: summary,
            },
            &settings(),
            &Dimension::ALL,
        );

        let classification = engine.classify(&thresholds, &f);
        for dimension in Dimension::ALL {
            assert_eq!(
                classification.get(dimension),
                Some(Archetype::Normal),
                "{dimension}"
            );
        }
    }

    #[tokio::test]
    async fn test_run_packets_dimension() {
        let store = store_with(vec![
            flow(100, 1_000, 3),
            flow(100, 1_000, 3),
            flow(100, 1_000, 10),
            flow(100, 1_000, 1),
        ])
        .await;
        let engine = ClassificationEngine::new(store, settings());

        // mean of 4.25 packets, the single-packet flow stays normal
        let report = engine.run(&[Dimension::Packets]).await.unwrap();
        let counts = report.dimensions[0]
            .categories
            .iter()
            .map(|c| (c.category, c.stats.count, c.stats.mean_packets))
            .collect::<Vec<(Archetype, u64, f64)>>();
        assert_eq!(
            counts,
            vec![
                (Archetype::Tortoise, 1, 10.0),
                (Archetype::Dragonfly, 2, 3.0),
                (Archetype::Normal, 1, 1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_reports_every_category() {
        // k = 1 puts the elephant bound near 1 577 bytes.
        let store = store_with(vec![
            flow(0, 50, 3),
            flow(1_000, 1_000, 3),
            flow(2_000, 1_000, 3),
            flow(1_000, 1_000, 1),
            flow(1_000, 1_000, 3),
            flow(1_000, 1_000, 3),
        ])
        .await;
        let mut settings = settings();
        settings.rate.high = RateHigh::Fixed(1_500.0);
        settings.rate.low_floor = 10.0;
        let engine = ClassificationEngine::new(store, settings);

        let report = engine.run(&[Dimension::Volume, Dimension::Rate]).await.unwrap();
        assert_eq!(report.population.count, 6);
        assert_eq!(
            report
                .dimensions
                .iter()
                .map(|d| d.dimension)
                .collect::<Vec<Dimension>>(),
            vec![Dimension::Volume, Dimension::Rate]
        );

        let volume = &report.dimensions[0];
        let counts = volume
            .categories
            .iter()
            .map(|c| (c.category, c.stats.count))
            .collect::<Vec<(Archetype, u64)>>();
        assert_eq!(
            counts,
            vec![
                (Archetype::Elephant, 1),
                (Archetype::Mouse, 1),
                (Archetype::Normal, 4),
            ]
        );

        let rate = &report.dimensions[1];
        assert_eq!(
            rate.categories[0],
            CategoryReport {
                category: Archetype::Cheetah,
                stats: CategoryStats {
                    count: 1,
                    mean_duration_ms: 1_000.0,
                    mean_bytes: 2_000.0,
                    mean_packets: 3.0,
                    mean_rate: 2_000.0,
                },
            }
        );
    }

    #[tokio::test]
    async fn test_filter_restricts_population() {
        let store = store_with(vec![flow(0, 0, 3), flow(100, 1_000, 3)]).await;
        let mut settings = settings();
        settings.filter.min_bytes = Some(1);
        settings.filter.min_duration_ms = Some(1);
        let engine = ClassificationEngine::new(store, settings);

        let (stats, _) = engine.thresholds(&[Dimension::Rate]).await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.rate.mean, 100.0);
    }
}
