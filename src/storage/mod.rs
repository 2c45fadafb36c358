//! Local time-series store
//!
//! The store the shipper reads from:
//!
//! - **types**: Core data structures (Labels, Sample, TimeRange, BlockMeta)
//! - **chunk**: Delta encoding + LZ4 compression of sample runs
//! - **block**: Immutable block file format
//! - **wal**: Write-ahead log backing the head
//! - **head**: In-memory samples not yet flushed to a block
//! - **querier**: Range queries, fetch handles and series cursors
//! - **store**: Read-only and writable store handles
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path (writable stores):
//!   Appender → WAL (fsync) → Head → flush_head → Block
//!
//! Read Path:
//!   querier(range) → Blocks + Head snapshot → Merge by labels → Clip → Series
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tsdb_shipper::storage::{open_store, OpenMode, TimeRange};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = open_store("./data", OpenMode::ReadOnly)?;
//!
//!     for meta in store.block_metas()? {
//!         println!("{} [{}, {}]", meta.id, meta.min_time, meta.max_time);
//!     }
//!
//!     let mut handle = store.querier(TimeRange::new(0, 3_600_000))?;
//!     while let Some(series) = handle.next_series()? {
//!         println!("{}", series.labels());
//!     }
//!     handle.close()?;
//!
//!     store.close()?;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod chunk;
pub mod error;
pub mod head;
pub mod querier;
pub mod store;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use block::{BlockReader, BlockWriter, ChunkRef, SeriesEntry};
pub use error::{StorageError, StorageResult};
pub use head::{Appender, Head};
pub use querier::{FetchHandle, MergedSeriesSet, Series, SeriesSet};
pub use store::{open_store, OpenMode, ReadOnlyStore, Store, WritableStore};
pub use types::{BlockMeta, BlockStats, Label, Labels, Sample, TimeRange};
pub use wal::WriteAheadLog;
