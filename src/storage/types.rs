//! Core data types for the local TSDB
//!
//! This module defines the fundamental types shared by the storage layer and
//! the shipping pipeline:
//! - `Label` / `Labels`: the identity of a series
//! - `Sample`: a single `(timestamp, value)` pair
//! - `TimeRange`: a window of time used to bound a query
//! - `BlockMeta` / `BlockStats`: the immutable description of a persisted block

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The label set identifying a series
///
/// Labels are kept sorted by name so that two sets with the same pairs compare
/// equal and iterate in the same order on every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set, sorting by name. Later duplicates of a name win.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        // Stable sort: the last occurrence of a name is the one kept
        let mut deduped: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match deduped.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => deduped.push(label),
            }
        }
        Self(deduped)
    }

    /// Build a label set from `(name, value)` pairs
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a label value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// A single measurement of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Time range for queries (half-open interval: [mint, maxt))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub mint: i64,
    /// End timestamp (exclusive), in milliseconds
    pub maxt: i64,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// `mint == maxt` is allowed and describes an empty window.
    pub fn new(mint: i64, maxt: i64) -> Self {
        debug_assert!(mint <= maxt, "TimeRange: mint must not exceed maxt");
        Self { mint, maxt }
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(mint: i64, maxt: i64) -> Option<Self> {
        if mint <= maxt {
            Some(Self { mint, maxt })
        } else {
            None
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.mint && timestamp < self.maxt
    }

    /// Check if a closed interval `[min, max]` of data overlaps this range
    pub fn overlaps_closed(&self, min: i64, max: i64) -> bool {
        min < self.maxt && max >= self.mint
    }

    /// Get the duration in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.maxt.saturating_sub(self.mint)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.mint, self.maxt)
    }
}

/// Per-block statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub num_samples: u64,
    pub num_chunks: u64,
    pub num_series: u64,
}

/// Immutable description of one persisted block
///
/// `min_time` and `max_time` are the smallest and largest sample timestamps
/// stored in the block, both inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: Uuid,
    pub min_time: i64,
    pub max_time: i64,
    pub stats: BlockStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduped() {
        let labels = Labels::new(vec![
            Label::new("job", "node"),
            Label::new("__name__", "up"),
            Label::new("job", "api"),
        ]);

        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "job"]);
        assert_eq!(labels.get("job"), Some("api"));
        assert_eq!(labels.get("missing"), None);
    }

    #[test]
    fn test_labels_display() {
        let labels = Labels::from_pairs([("__name__", "up"), ("job", "node")]);
        assert_eq!(labels.to_string(), r#"{__name__="up", job="node"}"#);
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(1000, 2000);

        assert!(!range.contains(999));
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
    }

    #[test]
    fn test_time_range_overlaps_closed() {
        let range = TimeRange::new(1000, 2000);

        assert!(range.overlaps_closed(500, 1000));
        assert!(range.overlaps_closed(1999, 3000));
        assert!(!range.overlaps_closed(2000, 3000));
        assert!(!range.overlaps_closed(0, 999));
    }

    #[test]
    fn test_try_new_rejects_inverted() {
        assert!(TimeRange::try_new(5, 4).is_none());
        assert!(TimeRange::try_new(5, 5).is_some());
    }
}
