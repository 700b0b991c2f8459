//! Calibration of capture files onto a single timeline.
//!
//! Each capture file reports flow start times relative to its own first
//! packet. The calibration table carries the absolute start and end of every
//! capture so those relative times can be shifted onto the timeline of a
//! designated base capture.

use log::debug;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// One row of the calibration table as written in the configuration.
///
/// Timestamps are decimal seconds kept as text (quote them in yaml) so that
/// nanosecond digits survive.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaptureSettings {
    pub name: String,
    pub path: PathBuf,
    pub start: String,
    pub end: String,
    /// Already present in storage (loaded on its own), used only as a time
    /// reference.
    #[serde(default)]
    pub preloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    Timestamp(String),
    UnknownBase(String),
    EndBeforeStart(String),
    OutOfOrder { previous: String, next: String },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timestamp(t) => write!(f, "invalid capture timestamp '{t}'"),
            Self::UnknownBase(b) => write!(f, "base capture '{b}' is not in the calibration table"),
            Self::EndBeforeStart(n) => write!(f, "capture '{n}' ends before it starts"),
            Self::OutOfOrder { previous, next } => write!(
                f,
                "capture '{next}' starts before '{previous}', captures must be in start order"
            ),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Absolute capture timestamp in nanoseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaptureTimestamp(i64);

impl CaptureTimestamp {
    pub fn parse(text: &str) -> Result<Self, CaptureError> {
        let invalid = || CaptureError::Timestamp(text.to_owned());
        let text = text.trim();

        let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
        if whole.is_empty()
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
            || fraction.len() > 9
        {
            return Err(invalid());
        }

        let secs = whole.parse::<i64>().map_err(|_| invalid())?;
        let nanos = format!("{:0<9}", fraction)
            .parse::<i64>()
            .map_err(|_| invalid())?;

        secs.checked_mul(NANOS_PER_SEC)
            .and_then(|s| s.checked_add(nanos))
            .map(Self)
            .ok_or_else(invalid)
    }

    /// Whole milliseconds from `base` to `self`, truncated toward zero.
    pub fn millis_since(&self, base: &CaptureTimestamp) -> i64 {
        (self.0 - base.0) / NANOS_PER_MILLI
    }
}

/// A capture file placed on the merged timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFileDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub start: CaptureTimestamp,
    pub end: CaptureTimestamp,
    pub offset_ms: i64,
    pub preloaded: bool,
}

/// Builds descriptors for every capture of the table, in table order.
///
/// The merge relies on files being consumed in non-decreasing start order,
/// a table violating that is rejected instead of being reordered.
pub fn calibrate(
    captures: &[CaptureSettings],
    base: &str,
) -> Result<Vec<CaptureFileDescriptor>, CaptureError> {
    let base_capture = captures
        .iter()
        .find(|c| c.name == base)
        .ok_or_else(|| CaptureError::UnknownBase(base.to_owned()))?;
    let base_start = CaptureTimestamp::parse(&base_capture.start)?;

    let mut descriptors: Vec<CaptureFileDescriptor> = Vec::with_capacity(captures.len());
    for capture in captures {
        let start = CaptureTimestamp::parse(&capture.start)?;
        let end = CaptureTimestamp::parse(&capture.end)?;
        if end < start {
            return Err(CaptureError::EndBeforeStart(capture.name.clone()));
        }

        if let Some(previous) = descriptors.last() {
            if start < previous.start {
                return Err(CaptureError::OutOfOrder {
                    previous: previous.name.clone(),
                    next: capture.name.clone(),
                });
            }
        }

        let offset_ms = start.millis_since(&base_start);
        debug!("capture {} offset {}ms", capture.name, offset_ms);

        descriptors.push(CaptureFileDescriptor {
            name: capture.name.clone(),
            path: capture.path.clone(),
            start,
            end,
            offset_ms,
            preloaded: capture.preloaded,
        });
    }

    Ok(descriptors)
}
