//! # tsdb-shipper
//!
//! Ships historical data from a local time-series store to a Prometheus-style
//! remote-write endpoint.
//!
//! The requested time range is clamped to the data the store holds, cut into
//! fixed-width windows and read one window at a time. Series are packed into
//! size-bounded batches, encoded as snappy-compressed protobuf and posted by
//! a pool of concurrent senders. Queues between the stages are bounded, and
//! the first failure anywhere stops the whole run.
//!
//! ## Modules
//!
//! - [`storage`]: Block/WAL/head store the data is read from
//! - [`ship`]: Windowing, batching, encoding and the sender pool
//! - [`config`]: TOML and environment configuration
//! - [`listing`]: Block listing output
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tsdb_shipper::{open_store, OpenMode, ShipOptions, Shipper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = open_store("./data", OpenMode::ReadOnly)?;
//!
//!     let mut options = ShipOptions::new("http://localhost:9090/api/v1/write".parse()?);
//!     options.partition_secs = 7200;
//!     options.external_labels = vec![("cluster".into(), "eu-1".into())];
//!
//!     let report = Shipper::new(Arc::from(store), options).run().await?;
//!     println!("shipped {} samples", report.samples);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod listing;
pub mod ship;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    open_store, BlockMeta, Labels, OpenMode, Sample, Store, StorageError, StorageResult,
    TimeRange, WritableStore,
};

pub use ship::{ShipError, ShipOptions, ShipReport, ShipResult, Shipper};

pub use config::{Config, ConfigError};
