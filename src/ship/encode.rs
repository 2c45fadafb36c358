//! Remote-write wire messages and payload compression
//!
//! Messages are defined by hand against the Prometheus remote-write protobuf
//! schema (`prometheus/prompb/types.proto` and `remote.proto`). A batch is
//! serialized into one `WriteRequest` and compressed with the snappy block
//! format (not the framed stream format).

use crate::ship::error::{ShipError, ShipResult};
use prost::Message;

/// A write request: the batch's series
#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// One series with its labels and samples, both in order
#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,

    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,

    /// Milliseconds since epoch
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl TimeSeries {
    /// Approximate wire size, used against the batch byte budget
    pub fn wire_size(&self) -> usize {
        self.encoded_len()
    }
}

/// A sealed, serialized and compressed batch ready to be sent
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub data: Vec<u8>,
    pub series: usize,
    pub samples: u64,
}

impl CompressedPayload {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Serialize a batch into one write request and snappy-compress it
pub fn encode_batch(timeseries: Vec<TimeSeries>) -> ShipResult<CompressedPayload> {
    let series = timeseries.len();
    let samples = timeseries.iter().map(|ts| ts.samples.len() as u64).sum();

    let request = WriteRequest { timeseries };
    let mut buf = Vec::with_capacity(request.encoded_len());
    request
        .encode(&mut buf)
        .map_err(|e| ShipError::Encoding(format!("protobuf encoding failed: {}", e)))?;

    let data = snap::raw::Encoder::new()
        .compress_vec(&buf)
        .map_err(|e| ShipError::Encoding(format!("snappy compression failed: {}", e)))?;

    Ok(CompressedPayload {
        data,
        series,
        samples,
    })
}

/// Decompress and decode a payload produced by [`encode_batch`]
pub fn decode_payload(data: &[u8]) -> ShipResult<WriteRequest> {
    let buf = snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| ShipError::Encoding(format!("snappy decompression failed: {}", e)))?;

    WriteRequest::decode(buf.as_slice())
        .map_err(|e| ShipError::Encoding(format!("protobuf decoding failed: {}", e)))
}
