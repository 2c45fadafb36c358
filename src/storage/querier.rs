//! Range queries over blocks and the head
//!
//! A query produces a [`FetchHandle`] owning a [`SeriesSet`]. Series are
//! lent out one at a time: each [`Series`] borrows the handle, so a handle
//! cannot be closed while one of its cursors is still alive.

use crate::storage::block::{BlockReader, ChunkReader, ChunkRef};
use crate::storage::error::StorageResult;
use crate::storage::types::{Labels, Sample, TimeRange};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type SampleCursor<'a> = Box<dyn Iterator<Item = StorageResult<Sample>> + 'a>;

/// One series of a query result: its labels and a forward-only sample cursor
pub struct Series<'a> {
    labels: &'a Labels,
    samples: SampleCursor<'a>,
}

impl<'a> Series<'a> {
    pub fn new(labels: &'a Labels, samples: SampleCursor<'a>) -> Self {
        Self { labels, samples }
    }

    pub fn labels(&self) -> &'a Labels {
        self.labels
    }
}

impl Iterator for Series<'_> {
    type Item = StorageResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.samples.next()
    }
}

impl fmt::Debug for Series<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Series").field("labels", self.labels).finish()
    }
}

/// A multi-series query result, iterated in label order
pub trait SeriesSet: Send {
    /// Lend the next series, or `None` once the set is exhausted
    fn next_series(&mut self) -> StorageResult<Option<Series<'_>>>;
}

/// Counts queriers that have been handed out and not yet released
#[derive(Debug, Clone, Default)]
pub struct QuerierTracker(Arc<AtomicUsize>);

impl QuerierTracker {
    pub fn open_queriers(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> QuerierGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        QuerierGuard(self.0.clone())
    }
}

struct QuerierGuard(Arc<AtomicUsize>);

impl Drop for QuerierGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns one window's query resources and its series cursors
///
/// Call [`FetchHandle::close`] once every series has been drained. A handle
/// that is dropped instead (for example when a pipeline is cancelled) is
/// released all the same.
pub struct FetchHandle {
    range: TimeRange,
    set: Box<dyn SeriesSet>,
    _guard: Option<QuerierGuard>,
}

impl FetchHandle {
    /// Wrap a series set that is not tracked by any store
    pub fn new(range: TimeRange, set: Box<dyn SeriesSet>) -> Self {
        Self {
            range,
            set,
            _guard: None,
        }
    }

    pub(crate) fn tracked(range: TimeRange, set: Box<dyn SeriesSet>, tracker: &QuerierTracker) -> Self {
        Self {
            range,
            set,
            _guard: Some(tracker.acquire()),
        }
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn next_series(&mut self) -> StorageResult<Option<Series<'_>>> {
        self.set.next_series()
    }

    /// Release the handle and everything it holds
    pub fn close(self) -> StorageResult<()> {
        tracing::trace!(range = %self.range, "Querier released");
        Ok(())
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

/// A piece of one series' data, from a block chunk or from the head
#[derive(Debug)]
enum Segment {
    Chunk { reader: usize, chunk: ChunkRef },
    Samples(Vec<Sample>),
}

impl Segment {
    fn min_time(&self) -> i64 {
        match self {
            Segment::Chunk { chunk, .. } => chunk.min_time,
            Segment::Samples(samples) => samples.first().map(|s| s.timestamp).unwrap_or(i64::MAX),
        }
    }
}

/// Read position inside the current series
///
/// Segments may overlap in time (blocks flushed out of order, or a block and
/// the head), so their samples are merged by timestamp. A segment is decoded
/// only once the merge reaches its first timestamp.
struct CursorState {
    range: TimeRange,
    pending: std::iter::Peekable<std::vec::IntoIter<Segment>>,
    active: Vec<std::iter::Peekable<std::vec::IntoIter<Sample>>>,
    /// Next timestamp of each active segment; ties go to the earlier segment
    heap: BinaryHeap<Reverse<(i64, usize)>>,
    last: Option<i64>,
    peeked: Option<Sample>,
}

impl CursorState {
    fn new(range: TimeRange, segments: Vec<Segment>) -> Self {
        Self {
            range,
            pending: segments.into_iter().peekable(),
            active: Vec::new(),
            heap: BinaryHeap::new(),
            last: None,
            peeked: None,
        }
    }

    /// Decode every pending segment that starts at or before the merge front
    fn activate(&mut self, readers: &mut [ChunkReader]) -> StorageResult<()> {
        while let Some(segment) = self.pending.peek() {
            if let Some(Reverse((next, _))) = self.heap.peek() {
                if segment.min_time() > *next {
                    break;
                }
            }

            let samples = match self.pending.next() {
                Some(Segment::Chunk { reader, chunk }) => readers[reader].read(&chunk)?,
                Some(Segment::Samples(samples)) => samples,
                None => break,
            };

            let idx = self.active.len();
            let mut samples = samples.into_iter().peekable();
            if let Some(first) = samples.peek() {
                self.heap.push(Reverse((first.timestamp, idx)));
            }
            self.active.push(samples);
        }
        Ok(())
    }

    /// Next sample inside the range and after the last one emitted
    fn advance(&mut self, readers: &mut [ChunkReader]) -> Option<StorageResult<Sample>> {
        loop {
            if let Err(e) = self.activate(readers) {
                self.pending = Vec::new().into_iter().peekable();
                self.heap.clear();
                return Some(Err(e));
            }

            let Reverse((_, idx)) = self.heap.pop()?;
            let source = &mut self.active[idx];
            let sample = source.next()?;
            if let Some(next) = source.peek() {
                self.heap.push(Reverse((next.timestamp, idx)));
            }

            if !self.range.contains(sample.timestamp) {
                continue;
            }
            // Overlapping sources: keep the first sample seen per timestamp
            if self.last.is_some_and(|last| sample.timestamp <= last) {
                continue;
            }
            self.last = Some(sample.timestamp);
            return Some(Ok(sample));
        }
    }
}

struct SeriesCursor<'a> {
    readers: &'a mut [ChunkReader],
    state: &'a mut CursorState,
}

impl Iterator for SeriesCursor<'_> {
    type Item = StorageResult<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(sample) = self.state.peeked.take() {
            return Some(Ok(sample));
        }
        self.state.advance(self.readers)
    }
}

struct Current {
    labels: Labels,
    state: CursorState,
}

/// Series set merging blocks and head data for one range
///
/// Series with equal labels in several sources come out as one series.
/// Chunks are decoded only when the cursor reaches them.
pub struct MergedSeriesSet {
    range: TimeRange,
    readers: Vec<ChunkReader>,
    pending: std::collections::btree_map::IntoIter<Labels, Vec<Segment>>,
    current: Option<Current>,
}

impl MergedSeriesSet {
    pub fn new(
        range: TimeRange,
        blocks: &[Arc<BlockReader>],
        head: Vec<(Labels, Vec<Sample>)>,
    ) -> StorageResult<Self> {
        let mut readers = Vec::new();
        let mut series: BTreeMap<Labels, Vec<Segment>> = BTreeMap::new();

        for block in blocks {
            let meta = block.meta();
            if !range.overlaps_closed(meta.min_time, meta.max_time) {
                continue;
            }

            let reader = readers.len();
            readers.push(block.chunk_reader()?);

            for entry in block.series() {
                let mut chunks = entry
                    .chunks
                    .iter()
                    .filter(|c| range.overlaps_closed(c.min_time, c.max_time))
                    .map(|&chunk| Segment::Chunk { reader, chunk })
                    .peekable();

                if chunks.peek().is_some() {
                    series.entry(entry.labels.clone()).or_default().extend(chunks);
                }
            }
        }

        for (labels, samples) in head {
            if !samples.is_empty() {
                series.entry(labels).or_default().push(Segment::Samples(samples));
            }
        }

        for segments in series.values_mut() {
            segments.sort_by_key(Segment::min_time);
        }

        Ok(Self {
            range,
            readers,
            pending: series.into_iter(),
            current: None,
        })
    }

    /// Series set over in-memory data only
    pub fn from_samples(range: TimeRange, series: Vec<(Labels, Vec<Sample>)>) -> Self {
        let mut merged: BTreeMap<Labels, Vec<Segment>> = BTreeMap::new();
        for (labels, samples) in series {
            merged.entry(labels).or_default().push(Segment::Samples(samples));
        }
        for segments in merged.values_mut() {
            segments.sort_by_key(Segment::min_time);
        }

        Self {
            range,
            readers: Vec::new(),
            pending: merged.into_iter(),
            current: None,
        }
    }
}

impl SeriesSet for MergedSeriesSet {
    fn next_series(&mut self) -> StorageResult<Option<Series<'_>>> {
        loop {
            let Some((labels, segments)) = self.pending.next() else {
                self.current = None;
                return Ok(None);
            };

            let mut state = CursorState::new(self.range, segments);
            match state.advance(&mut self.readers) {
                // Every sample was clipped away
                None => continue,
                Some(Err(e)) => return Err(e),
                Some(Ok(first)) => {
                    state.peeked = Some(first);
                    let current = self.current.insert(Current { labels, state });
                    let cursor = SeriesCursor {
                        readers: &mut self.readers,
                        state: &mut current.state,
                    };
                    return Ok(Some(Series::new(&current.labels, Box::new(cursor))));
                }
            }
        }
    }
}
