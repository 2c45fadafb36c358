//! Chunk encoding for block files
//!
//! A chunk holds up to [`MAX_SAMPLES_PER_CHUNK`] consecutive samples of one
//! series.
//!
//! Strategy:
//! 1. Delta-encode timestamps (store differences from the previous sample)
//! 2. Store values as-is
//! 3. Serialize to compact binary format (bincode)
//! 4. LZ4 compress the result

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Sample;
use serde::{Deserialize, Serialize};

/// Upper bound on samples per chunk
pub const MAX_SAMPLES_PER_CHUNK: usize = 120;

/// Intermediate format for delta-encoded samples
#[derive(Debug, Serialize, Deserialize)]
struct EncodedChunk {
    /// Base timestamp (first sample's timestamp)
    base_timestamp: i64,
    /// Delta-encoded timestamps (differences from previous)
    timestamp_deltas: Vec<i64>,
    values: Vec<f64>,
}

/// Compress a run of samples into a chunk payload
///
/// Samples must already be ordered by timestamp.
pub fn encode_chunk(samples: &[Sample]) -> StorageResult<Vec<u8>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let base_timestamp = samples[0].timestamp;
    let mut timestamp_deltas = Vec::with_capacity(samples.len());
    let mut prev_ts = base_timestamp;

    for sample in samples {
        timestamp_deltas.push(sample.timestamp - prev_ts);
        prev_ts = sample.timestamp;
    }

    let chunk = EncodedChunk {
        base_timestamp,
        timestamp_deltas,
        values: samples.iter().map(|s| s.value).collect(),
    };

    let serialized =
        bincode::serialize(&chunk).map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress a chunk payload back to samples
pub fn decode_chunk(data: &[u8]) -> StorageResult<Vec<Sample>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let chunk: EncodedChunk = bincode::deserialize(&decompressed)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    if chunk.timestamp_deltas.len() != chunk.values.len() {
        return Err(StorageError::Corruption(format!(
            "chunk has {} timestamps but {} values",
            chunk.timestamp_deltas.len(),
            chunk.values.len()
        )));
    }

    let mut samples = Vec::with_capacity(chunk.values.len());
    let mut current = chunk.base_timestamp;

    for (delta, value) in chunk.timestamp_deltas.iter().zip(chunk.values) {
        current += delta;
        samples.push(Sample::new(current, value));
    }

    Ok(samples)
}
