//! Series to wire conversion and size-bounded batching

use crate::ship::encode::{self, TimeSeries};
use crate::ship::error::ShipResult;
use crate::storage::Series;
use serde::{Deserialize, Serialize};

/// What to do when an external label has the same name as a series label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LabelCollision {
    /// Ship both pairs, external first; the remote decides
    #[default]
    Keep,
    /// Drop the series' own label
    PreferExternal,
    /// Drop the external label
    PreferSeries,
}

/// Convert one series into a wire time series, draining its samples
///
/// External labels come first, in configured order, followed by the
/// series' labels. Returns the record and the number of samples read.
pub fn series_to_wire(
    series: Series<'_>,
    external: &[encode::Label],
    collision: LabelCollision,
) -> ShipResult<(TimeSeries, u64)> {
    let intrinsic = series.labels();
    let mut labels = Vec::with_capacity(external.len() + intrinsic.len());

    for label in external {
        if collision == LabelCollision::PreferSeries && intrinsic.get(&label.name).is_some() {
            continue;
        }
        labels.push(label.clone());
    }

    for label in intrinsic {
        if collision == LabelCollision::PreferExternal
            && external.iter().any(|e| e.name == label.name)
        {
            continue;
        }
        labels.push(encode::Label {
            name: label.name.clone(),
            value: label.value.clone(),
        });
    }

    let mut samples = Vec::new();
    for sample in series {
        let sample = sample?;
        samples.push(encode::Sample {
            value: sample.value,
            timestamp: sample.timestamp,
        });
    }

    let count = samples.len() as u64;
    Ok((TimeSeries { labels, samples }, count))
}

/// A batch taken out of the assembler
#[derive(Debug, Clone, PartialEq)]
pub struct SealedBatch {
    pub series: Vec<TimeSeries>,
    /// Sum of the series' approximate wire sizes at seal time
    pub bytes: usize,
}

/// Accumulates wire series into batches bounded by a byte budget
///
/// The budget is checked after each series is added, so a sealed batch
/// overshoots it by at most the size of its last series.
#[derive(Debug)]
pub struct BatchAssembler {
    max_batch_bytes: usize,
    external: Vec<encode::Label>,
    collision: LabelCollision,
    current: Vec<TimeSeries>,
    current_bytes: usize,
    total_series: u64,
    total_samples: u64,
}

impl BatchAssembler {
    pub fn new(max_batch_bytes: usize, external: Vec<encode::Label>, collision: LabelCollision) -> Self {
        Self {
            max_batch_bytes,
            external,
            collision,
            current: Vec::new(),
            current_bytes: 0,
            total_series: 0,
            total_samples: 0,
        }
    }

    /// Convert and add a series, returning a batch if this sealed one
    pub fn add_series(&mut self, series: Series<'_>) -> ShipResult<Option<SealedBatch>> {
        let (ts, samples) = series_to_wire(series, &self.external, self.collision)?;
        self.total_samples += samples;
        Ok(self.push(ts))
    }

    /// Add an already converted series
    pub fn push(&mut self, ts: TimeSeries) -> Option<SealedBatch> {
        self.current_bytes += ts.wire_size();
        self.current.push(ts);
        self.total_series += 1;

        (self.current_bytes > self.max_batch_bytes).then(|| self.seal())
    }

    /// Take whatever is pending, even if nothing is
    pub fn finish(&mut self) -> SealedBatch {
        self.seal()
    }

    fn seal(&mut self) -> SealedBatch {
        SealedBatch {
            series: std::mem::take(&mut self.current),
            bytes: std::mem::replace(&mut self.current_bytes, 0),
        }
    }

    pub fn pending_series(&self) -> usize {
        self.current.len()
    }

    pub fn total_series(&self) -> u64 {
        self.total_series
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }
}
