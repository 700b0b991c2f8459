pub mod engine;
pub mod stats;
pub mod thresholds;

use serde::Deserialize;
use std::fmt;

use crate::consts::{MIN_PACKETS, RATE_LOW_FLOOR, SIGMA_MULTIPLIER};
use crate::storage::{PopulationFilter, StorageError};

pub use engine::{Classification, ClassificationEngine};
pub use thresholds::{Archetype, ClassificationThresholds, Dimension, Precedence, RateHigh};

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationError {
    EmptyPopulation,
    Storage(StorageError),
}

impl fmt::Display for ClassificationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EmptyPopulation => write!(f, "no flows match the population filter"),
            Self::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClassificationError {}

impl From<StorageError> for ClassificationError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

fn default_sigma_multiplier() -> f64 {
    SIGMA_MULTIPLIER
}

fn default_min_packets() -> u64 {
    MIN_PACKETS
}

fn default_low_threshold_bytes() -> u64 {
    10 * 1024
}

fn default_short_threshold_ms() -> u64 {
    2_000
}

fn default_low_floor() -> f64 {
    RATE_LOW_FLOOR
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VolumeSettings {
    #[serde(default = "default_low_threshold_bytes")]
    pub low_threshold_bytes: u64,
    #[serde(default)]
    pub precedence: Precedence,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            low_threshold_bytes: default_low_threshold_bytes(),
            precedence: Precedence::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DurationSettings {
    #[serde(default = "default_short_threshold_ms")]
    pub short_threshold_ms: u64,
    #[serde(default)]
    pub precedence: Precedence,
}

impl Default for DurationSettings {
    fn default() -> Self {
        Self {
            short_threshold_ms: default_short_threshold_ms(),
            precedence: Precedence::default(),
        }
    }
}

/// Packet count bounds. With the defaults the population splits at the mean
/// packet count: at or above is a tortoise, below is a dragonfly.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PacketsSettings {
    /// Deviations above the mean for the high bound.
    #[serde(default)]
    pub sigma_multiplier: f64,
    /// Fixed low bound, the mean when unset.
    #[serde(default)]
    pub low_threshold_packets: Option<u64>,
    #[serde(default)]
    pub precedence: Precedence,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateSettings {
    #[serde(default)]
    pub high: RateHigh,
    /// Low rate bound used when mean minus one deviation is negative.
    #[serde(default = "default_low_floor")]
    pub low_floor: f64,
    #[serde(default)]
    pub precedence: Precedence,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            high: RateHigh::default(),
            low_floor: default_low_floor(),
            precedence: Precedence::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassificationSettings {
    #[serde(default = "default_sigma_multiplier")]
    pub sigma_multiplier: f64,
    /// Flows with fewer packets are normal in every dimension.
    #[serde(default = "default_min_packets")]
    pub min_packets: u64,
    #[serde(default)]
    pub filter: PopulationFilter,
    #[serde(default)]
    pub volume: VolumeSettings,
    #[serde(default)]
    pub duration: DurationSettings,
    #[serde(default)]
    pub packets: PacketsSettings,
    #[serde(default)]
    pub rate: RateSettings,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            sigma_multiplier: default_sigma_multiplier(),
            min_packets: default_min_packets(),
            filter: PopulationFilter::default(),
            volume: VolumeSettings::default(),
            duration: DurationSettings::default(),
            packets: PacketsSettings::default(),
            rate: RateSettings::default(),
        }
    }
}
