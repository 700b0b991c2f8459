use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::stats::{MetricSummary, PopulationStats};
use super::ClassificationSettings;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Volume,
    Duration,
    Packets,
    Rate,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Volume,
        Dimension::Duration,
        Dimension::Packets,
        Dimension::Rate,
    ];

    /// Archetypes of the dimension in report order: high, low, normal.
    pub fn archetypes(&self) -> [Archetype; 3] {
        [
            self.archetype(Level::High),
            self.archetype(Level::Low),
            Archetype::Normal,
        ]
    }

    pub fn archetype(&self, level: Level) -> Archetype {
        match (self, level) {
            (_, Level::Normal) => Archetype::Normal,
            (Self::Volume, Level::High) => Archetype::Elephant,
            (Self::Volume, Level::Low) => Archetype::Mouse,
            (Self::Duration, Level::High) => Archetype::Tortoise,
            (Self::Duration, Level::Low) => Archetype::Dragonfly,
            (Self::Packets, Level::High) => Archetype::Tortoise,
            (Self::Packets, Level::Low) => Archetype::Dragonfly,
            (Self::Rate, Level::High) => Archetype::Cheetah,
            (Self::Rate, Level::Low) => Archetype::Snail,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Volume => write!(f, "volume"),
            Self::Duration => write!(f, "duration"),
            Self::Packets => write!(f, "packets"),
            Self::Rate => write!(f, "rate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    High,
    Low,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Elephant,
    Mouse,
    Tortoise,
    Dragonfly,
    Cheetah,
    Snail,
    Normal,
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Elephant => "elephant",
            Self::Mouse => "mouse",
            Self::Tortoise => "tortoise",
            Self::Dragonfly => "dragonfly",
            Self::Cheetah => "cheetah",
            Self::Snail => "snail",
            Self::Normal => "normal",
        };
        f.write_str(name)
    }
}

/// Which bound is tested first when a value satisfies both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// A fixed low bound goes first, otherwise the high bound does.
    /// Both fixed tests low first, both derived tests high first.
    #[default]
    Auto,
    HighFirst,
    LowFirst,
}

/// Source of the high rate bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateHigh {
    #[default]
    Derived,
    Fixed(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bound {
    pub value: f64,
    pub fixed: bool,
}

impl Bound {
    pub fn fixed(value: f64) -> Self {
        Self { value, fixed: true }
    }

    pub fn derived(value: f64) -> Self {
        Self {
            value,
            fixed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DimensionThresholds {
    pub high: Bound,
    pub low: Bound,
    #[serde(skip)]
    pub precedence: Precedence,
}

impl DimensionThresholds {
    fn high_first(&self) -> bool {
        match self.precedence {
            Precedence::HighFirst => true,
            Precedence::LowFirst => false,
            Precedence::Auto => !self.low.fixed,
        }
    }

    /// High when `value >= high`, low when `value < low`.
    pub fn level(&self, value: f64) -> Level {
        let high = value >= self.high.value;
        let low = value < self.low.value;

        match (high, low) {
            (true, true) if self.high_first() => Level::High,
            (true, true) => Level::Low,
            (true, false) => Level::High,
            (false, true) => Level::Low,
            (false, false) => Level::Normal,
        }
    }
}

fn upper(summary: &MetricSummary, k: f64) -> f64 {
    summary.mean + k * summary.std_dev
}

/// Thresholds of one classification run, only for the requested dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClassificationThresholds {
    pub volume: Option<DimensionThresholds>,
    pub duration: Option<DimensionThresholds>,
    pub packets: Option<DimensionThresholds>,
    pub rate: Option<DimensionThresholds>,
}

impl ClassificationThresholds {
    pub fn derive(
        stats: &PopulationStats,
        settings: &ClassificationSettings,
        dimensions: &[Dimension],
    ) -> Self {
        let k = settings.sigma_multiplier;
        let mut thresholds = Self::default();

        for dimension in dimensions {
            match dimension {
                Dimension::Volume => {
                    thresholds.volume = Some(DimensionThresholds {
                        high: Bound::derived(upper(&stats.bytes, k)),
                        low: Bound::fixed(settings.volume.low_threshold_bytes as f64),
                        precedence: settings.volume.precedence,
                    })
                }
                Dimension::Duration => {
                    thresholds.duration = Some(DimensionThresholds {
                        high: Bound::derived(upper(&stats.duration, k)),
                        low: Bound::fixed(settings.duration.short_threshold_ms as f64),
                        precedence: settings.duration.precedence,
                    })
                }
                Dimension::Packets => {
                    let low = match settings.packets.low_threshold_packets {
                        Some(packets) => Bound::fixed(packets as f64),
                        None => Bound::derived(stats.packets.mean),
                    };
                    thresholds.packets = Some(DimensionThresholds {
                        high: Bound::derived(upper(
                            &stats.packets,
                            settings.packets.sigma_multiplier,
                        )),
                        low,
                        precedence: settings.packets.precedence,
                    })
                }
                Dimension::Rate => {
                    let high = match settings.rate.high {
                        RateHigh::Derived => Bound::derived(upper(&stats.rate, k)),
                        RateHigh::Fixed(value) => Bound::fixed(value),
                    };
                    let low = stats.rate.mean - stats.rate.std_dev;
                    let low = if low < 0.0 {
                        Bound::fixed(settings.rate.low_floor)
                    } else {
                        Bound::derived(low)
                    };
                    thresholds.rate = Some(DimensionThresholds {
                        high,
                        low,
                        precedence: settings.rate.precedence,
                    })
                }
            }
        }

        thresholds
    }

    pub fn get(&self, dimension: Dimension) -> Option<&DimensionThresholds> {
        match dimension {
            Dimension::Volume => self.volume.as_ref(),
            Dimension::Duration => self.duration.as_ref(),
            Dimension::Packets => self.packets.as_ref(),
            Dimension::Rate => self.rate.as_ref(),
        }
    }
}
