//! In-memory head of a writable store
//!
//! The head holds samples that have been committed to the WAL but not yet
//! flushed into a block. Samples of a series must arrive in strictly
//! increasing timestamp order.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Labels, Sample, TimeRange};
use crate::storage::wal::{WalRecord, WriteAheadLog};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Head {
    series: BTreeMap<Labels, Vec<Sample>>,
    min_time: i64,
    max_time: i64,
    num_samples: u64,
}

impl Head {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `samples` can be appended to the series without reordering
    fn validate(&self, labels: &Labels, samples: &[Sample]) -> StorageResult<()> {
        let mut last = self
            .series
            .get(labels)
            .and_then(|s| s.last())
            .map(|s| s.timestamp);

        for sample in samples {
            if let Some(last) = last {
                if sample.timestamp <= last {
                    return Err(StorageError::OutOfOrder {
                        labels: labels.to_string(),
                        timestamp: sample.timestamp,
                        last,
                    });
                }
            }
            last = Some(sample.timestamp);
        }

        Ok(())
    }

    fn append(&mut self, labels: Labels, samples: Vec<Sample>) {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return;
        };

        if self.num_samples == 0 {
            self.min_time = first.timestamp;
            self.max_time = last.timestamp;
        } else {
            self.min_time = self.min_time.min(first.timestamp);
            self.max_time = self.max_time.max(last.timestamp);
        }

        self.num_samples += samples.len() as u64;
        self.series.entry(labels).or_default().extend(samples);
    }

    /// Live `(min_time, max_time)`, or `None` while the head is empty
    pub fn bounds(&self) -> Option<(i64, i64)> {
        (self.num_samples > 0).then_some((self.min_time, self.max_time))
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Copy out the samples of every series that fall inside `range`
    pub fn snapshot(&self, range: TimeRange) -> Vec<(Labels, Vec<Sample>)> {
        self.series
            .iter()
            .filter_map(|(labels, samples)| {
                let start = samples.partition_point(|s| s.timestamp < range.mint);
                let end = samples.partition_point(|s| s.timestamp < range.maxt);
                (start < end).then(|| (labels.clone(), samples[start..end].to_vec()))
            })
            .collect()
    }

    pub fn series(&self) -> impl Iterator<Item = (&Labels, &[Sample])> {
        self.series.iter().map(|(l, s)| (l, s.as_slice()))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Head and WAL guarded together so a commit is atomic for readers
pub struct HeadState {
    pub(crate) head: Head,
    pub(crate) wal: WriteAheadLog,
}

impl HeadState {
    /// Rebuild the head from the WAL
    pub fn recover(mut wal: WriteAheadLog) -> StorageResult<Self> {
        let mut head = Head::new();

        for record in wal.replay()? {
            // Entries that no longer apply cleanly are skipped, not fatal
            match head.validate(&record.labels, &record.samples) {
                Ok(()) => head.append(record.labels, record.samples),
                Err(e) => tracing::warn!(error = %e, "Skipping WAL record"),
            }
        }

        if let Some((min, max)) = head.bounds() {
            tracing::info!(
                series = head.num_series(),
                samples = head.num_samples(),
                min_time = min,
                max_time = max,
                "Recovered head from WAL"
            );
        }

        Ok(Self { head, wal })
    }

    pub fn head(&self) -> &Head {
        &self.head
    }
}

pub(crate) fn lock_state(state: &Mutex<HeadState>) -> StorageResult<std::sync::MutexGuard<'_, HeadState>> {
    state
        .lock()
        .map_err(|e| StorageError::Lock(format!("head lock poisoned: {}", e)))
}

/// Stages samples and commits them to the WAL and then the head
pub struct Appender<'a> {
    state: &'a Mutex<HeadState>,
    staged: BTreeMap<Labels, Vec<Sample>>,
}

impl<'a> Appender<'a> {
    pub(crate) fn new(state: &'a Mutex<HeadState>) -> Self {
        Self {
            state,
            staged: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, labels: &Labels, timestamp: i64, value: f64) {
        self.staged
            .entry(labels.clone())
            .or_default()
            .push(Sample::new(timestamp, value));
    }

    /// Persist staged samples, returning how many were committed
    ///
    /// Nothing is written if any series would go out of order.
    pub fn commit(self) -> StorageResult<u64> {
        if self.staged.is_empty() {
            return Ok(0);
        }

        let mut state = lock_state(self.state)?;

        for (labels, samples) in &self.staged {
            state.head.validate(labels, samples)?;
        }

        let records: Vec<WalRecord> = self
            .staged
            .into_iter()
            .map(|(labels, samples)| WalRecord { labels, samples })
            .collect();

        state.wal.append(&records)?;

        let mut committed = 0;
        for record in records {
            committed += record.samples.len() as u64;
            state.head.append(record.labels, record.samples);
        }

        Ok(committed)
    }
}
