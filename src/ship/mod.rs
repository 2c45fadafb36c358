//! Windowed extraction and shipping
//!
//! - **range**: Clamp the requested range to the store's data
//! - **window**: Split the resolved range into fixed-width windows
//! - **fetch**: One querier per window, fed to the assembler in order
//! - **convert**: Series to wire records, size-bounded batches
//! - **encode**: Remote-write protobuf messages and snappy compression
//! - **sender**: HTTP client and the bounded sender pool
//! - **pipeline**: Wiring, backpressure and fail-fast cancellation
//! - **error**: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsdb_shipper::ship::{ShipOptions, Shipper};
//! use tsdb_shipper::storage::{open_store, OpenMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = open_store("./data", OpenMode::ReadOnly)?;
//!     let url = "http://localhost:9090/api/v1/write".parse()?;
//!
//!     let report = Shipper::new(Arc::from(store), ShipOptions::new(url)).run().await?;
//!     println!("{}", report);
//!
//!     Ok(())
//! }
//! ```

pub mod convert;
pub mod encode;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod range;
pub mod sender;
pub mod window;

pub use convert::{series_to_wire, BatchAssembler, LabelCollision, SealedBatch};
pub use encode::{decode_payload, encode_batch, CompressedPayload, WriteRequest};
pub use error::{ShipError, ShipResult};
pub use fetch::fetch_window;
pub use pipeline::{ShipOptions, ShipReport, Shipper};
pub use range::{resolve_time_range, ResolvedRange};
pub use sender::RemoteWriteClient;
pub use window::{window_width, windows, Windows};
