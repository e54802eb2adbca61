//! Height ranges and gap detection.
//!
//! A gap is an inclusive range of heights missing from the replica. Gaps
//! are derived fresh on every run and never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{ConfigError, ReplicaError};

/// Inclusive `[start, end]` range of heights. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HeightRange {
    start: u64,
    end: u64,
}

/// A missing range in the replica.
pub type Gap = HeightRange;

/// Rejected `start > end` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid height range: start {start} > end {end}")]
pub struct InvalidRange {
    pub start: u64,
    pub end: u64,
}

impl HeightRange {
    pub fn new(start: u64, end: u64) -> Result<Self, InvalidRange> {
        if start > end {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub const fn single(height: u64) -> Self {
        Self {
            start: height,
            end: height,
        }
    }

    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    /// Number of heights covered (`end - start + 1`).
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub const fn contains(&self, height: u64) -> bool {
        self.start <= height && height <= self.end
    }

    /// Ascending iterator over every height.
    pub fn heights(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }

    /// Split into consecutive sub-ranges of at most `window` heights.
    pub fn windows(&self, window: u64) -> impl Iterator<Item = Self> + use<> {
        let window = window.max(1);
        let end = self.end;
        let mut next = Some(self.start);
        std::iter::from_fn(move || {
            let start = next?;
            let stop = start.saturating_add(window - 1).min(end);
            next = if stop == end { None } else { Some(stop + 1) };
            Some(Self { start, end: stop })
        })
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl<'de> Deserialize<'de> for HeightRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            start: u64,
            end: u64,
        }
        let raw = Raw::deserialize(deserializer)?;
        Self::new(raw.start, raw.end).map_err(serde::de::Error::custom)
    }
}

/// Source of populated heights for gap detection.
pub trait ReplicaIndex {
    /// Interior gaps between populated heights, ascending.
    fn query_gaps(&self) -> Result<Vec<Gap>, ReplicaError>;

    /// Lowest populated height, `None` when empty.
    fn min_height(&self) -> Result<Option<u64>, ReplicaError>;

    /// Whether any block exists at `height`.
    fn height_exists(&self, height: u64) -> Result<bool, ReplicaError>;
}

/// Derive every missing range of the replica.
///
/// Prepends `[0, lowest - 1]` when `from_genesis` is set and the lowest
/// populated height is above zero. An empty replica has no gaps.
pub fn detect_gaps(index: &impl ReplicaIndex, from_genesis: bool) -> Result<Vec<Gap>, ReplicaError> {
    let Some(lowest) = index.min_height()? else {
        return Ok(Vec::new());
    };

    let interior = index.query_gaps()?;
    let mut gaps = Vec::with_capacity(interior.len() + 1);
    if from_genesis && lowest > 0 {
        gaps.push(HeightRange {
            start: 0,
            end: lowest - 1,
        });
    }
    gaps.extend(interior);

    validate_gaps(&gaps).map_err(ReplicaError::GapOrder)?;
    Ok(gaps)
}

/// Same rule as [`detect_gaps`] over an in-memory ascending height list.
/// Duplicates are tolerated.
#[must_use]
pub fn gaps_from_sorted_heights(heights: &[u64], from_genesis: bool) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let Some(&first) = heights.first() else {
        return gaps;
    };
    if from_genesis && first > 0 {
        gaps.push(HeightRange {
            start: 0,
            end: first - 1,
        });
    }
    for pair in heights.windows(2) {
        let (h, next) = (pair[0], pair[1]);
        if next > h.saturating_add(1) {
            gaps.push(HeightRange {
                start: h + 1,
                end: next - 1,
            });
        }
    }
    gaps
}

/// Check that gaps are ascending and separated by at least one height.
pub fn validate_gaps(gaps: &[Gap]) -> Result<(), String> {
    for pair in gaps.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.start <= prev.end.saturating_add(1) {
            return Err(format!("{prev} followed by {next}"));
        }
    }
    Ok(())
}

/// Total number of missing heights.
#[must_use]
pub fn total_missing(gaps: &[Gap]) -> u64 {
    gaps.iter().map(HeightRange::size).sum()
}

/// Collapse an unordered height list into ascending contiguous ranges.
#[must_use]
pub fn ranges_from_heights(mut heights: Vec<u64>) -> Vec<HeightRange> {
    heights.sort_unstable();
    heights.dedup();

    let mut ranges: Vec<HeightRange> = Vec::new();
    for height in heights {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(height) => last.end = height,
            _ => ranges.push(HeightRange::single(height)),
        }
    }
    ranges
}

/// Parse a heights file: one height per line, blank lines and `#` comments skipped.
pub fn parse_heights(text: &str) -> Result<Vec<u64>, ConfigError> {
    let mut heights = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let height = line.parse::<u64>().map_err(|err| {
            ConfigError::ValidationError(format!(
                "heights file line {}: {line:?} is not a height ({err})",
                index + 1
            ))
        })?;
        heights.push(height);
    }
    Ok(heights)
}

/// Load a heights file and collapse it into manual ranges.
pub fn load_heights_file(path: &Path) -> Result<Vec<HeightRange>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        ConfigError::ReadFailed(path.display().to_string(), err.to_string())
    })?;
    let heights = parse_heights(&text)?;
    if heights.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "heights file {} contains no heights",
            path.display()
        )));
    }
    Ok(ranges_from_heights(heights))
}
