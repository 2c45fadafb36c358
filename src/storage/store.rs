//! Store handles
//!
//! A store directory holds finished blocks (`<uuid>.block`), and for a
//! writable store also a WAL and a `LOCK` file:
//!
//! ```text
//! data/
//! ├── 6f1c…e2.block
//! ├── 9a07…41.block
//! ├── wal/current.wal
//! └── LOCK
//! ```
//!
//! Callers select the variant once through [`open_store`] and then only talk
//! to the [`Store`] trait.
//!
//! A process killed while holding a writable store leaves its `LOCK` file
//! behind, and later writable opens fail with [`StorageError::Locked`]. Remove
//! the file by hand, or open with [`OpenMode::WritableUnlocked`].

use crate::storage::block::{block_paths, BlockReader, BlockWriter};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::head::{lock_state, Appender, HeadState};
use crate::storage::querier::{FetchHandle, MergedSeriesSet, QuerierTracker};
use crate::storage::types::{BlockMeta, TimeRange};
use crate::storage::wal::WriteAheadLog;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

const LOCK_FILE: &str = "LOCK";

/// How a store directory is opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Blocks only, no head, no lock
    #[default]
    ReadOnly,
    /// Blocks plus the WAL-backed head; takes the directory lock
    Writable,
    /// Like `Writable`, but neither takes nor checks the directory lock
    WritableUnlocked,
}

/// Capabilities shared by every store variant
pub trait Store: Send + Sync {
    /// Metadata of every persisted block, ordered by min time
    fn block_metas(&self) -> StorageResult<Vec<BlockMeta>>;

    /// Bounds of the in-memory head, if there is one and it holds samples
    fn head_bounds(&self) -> StorageResult<Option<(i64, i64)>>;

    /// Open a querier over `range`, clipped half-open to `[mint, maxt)`
    fn querier(&self, range: TimeRange) -> StorageResult<FetchHandle>;

    /// Number of fetch handles handed out and not yet released
    fn open_queriers(&self) -> usize;

    fn close(&self) -> StorageResult<()>;
}

/// Open the store at `path` in the given mode
pub fn open_store(path: impl AsRef<Path>, mode: OpenMode) -> StorageResult<Box<dyn Store>> {
    match mode {
        OpenMode::ReadOnly => Ok(Box::new(ReadOnlyStore::open(path)?)),
        OpenMode::Writable => Ok(Box::new(WritableStore::open(path)?)),
        OpenMode::WritableUnlocked => Ok(Box::new(WritableStore::open_unlocked(path)?)),
    }
}

fn load_blocks(dir: &Path) -> StorageResult<Vec<Arc<BlockReader>>> {
    let mut blocks = Vec::new();

    for path in block_paths(dir)? {
        match BlockReader::open(&path) {
            Ok(reader) => blocks.push(Arc::new(reader)),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to open block");
                return Err(e);
            }
        }
    }

    blocks.sort_by_key(|b| (b.meta().min_time, b.meta().max_time));
    tracing::debug!(dir = %dir.display(), blocks = blocks.len(), "Loaded blocks");

    Ok(blocks)
}

fn check_range(range: TimeRange) -> StorageResult<()> {
    if range.mint > range.maxt {
        return Err(StorageError::InvalidTimeRange {
            mint: range.mint,
            maxt: range.maxt,
        });
    }
    Ok(())
}

/// Store over persisted blocks only
pub struct ReadOnlyStore {
    dir: PathBuf,
    blocks: Vec<Arc<BlockReader>>,
    tracker: QuerierTracker,
    closed: AtomicBool,
}

impl ReadOnlyStore {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = path.as_ref().to_path_buf();

        if !dir.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store directory {} does not exist", dir.display()),
            )));
        }

        let blocks = load_blocks(&dir)?;

        Ok(Self {
            dir,
            blocks,
            tracker: QuerierTracker::default(),
            closed: AtomicBool::new(false),
        })
    }
}

impl Store for ReadOnlyStore {
    fn block_metas(&self) -> StorageResult<Vec<BlockMeta>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(self.blocks.iter().map(|b| b.meta().clone()).collect())
    }

    fn head_bounds(&self) -> StorageResult<Option<(i64, i64)>> {
        Ok(None)
    }

    fn querier(&self, range: TimeRange) -> StorageResult<FetchHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        check_range(range)?;

        let set = MergedSeriesSet::new(range, &self.blocks, Vec::new())?;
        Ok(FetchHandle::tracked(range, Box::new(set), &self.tracker))
    }

    fn open_queriers(&self) -> usize {
        self.tracker.open_queriers()
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl fmt::Debug for ReadOnlyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyStore")
            .field("dir", &self.dir)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// Store with a WAL-backed head that accepts appends
pub struct WritableStore {
    dir: PathBuf,
    blocks: RwLock<Vec<Arc<BlockReader>>>,
    state: std::sync::Mutex<HeadState>,
    tracker: QuerierTracker,
    closed: AtomicBool,
    locked: bool,
}

impl WritableStore {
    /// Open for writing, taking the directory lock
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path.as_ref(), true)
    }

    /// Open for writing without the directory lock
    ///
    /// Nothing stops a second writer; the caller must know there is none.
    pub fn open_unlocked(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path.as_ref(), false)
    }

    fn open_with(path: &Path, locked: bool) -> StorageResult<Self> {
        let dir = path.to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        if locked {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(StorageError::Locked(lock_path.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let opened = load_blocks(&dir).and_then(|blocks| {
            let wal = WriteAheadLog::open(dir.join("wal").join("current.wal"))?;
            Ok((blocks, HeadState::recover(wal)?))
        });

        let (blocks, state) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if locked {
                    let _ = std::fs::remove_file(&lock_path);
                }
                return Err(e);
            }
        };

        Ok(Self {
            dir,
            blocks: RwLock::new(blocks),
            state: std::sync::Mutex::new(state),
            tracker: QuerierTracker::default(),
            closed: AtomicBool::new(false),
            locked,
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn read_blocks(&self) -> StorageResult<Vec<Arc<BlockReader>>> {
        self.blocks
            .read()
            .map(|b| b.clone())
            .map_err(|e| StorageError::Lock(format!("blocks lock poisoned: {}", e)))
    }

    /// Start staging samples for the head
    pub fn appender(&self) -> StorageResult<Appender<'_>> {
        self.ensure_open()?;
        Ok(Appender::new(&self.state))
    }

    /// Persist the head as a new block and truncate the WAL
    ///
    /// Returns the new block's metadata, or `None` if the head was empty.
    pub fn flush_head(&self) -> StorageResult<Option<BlockMeta>> {
        self.ensure_open()?;
        let mut state = lock_state(&self.state)?;

        if state.head.is_empty() {
            return Ok(None);
        }

        let mut writer = BlockWriter::create(&self.dir)?;
        for (labels, samples) in state.head.series() {
            writer.add_series(labels, samples)?;
        }

        let Some(meta) = writer.finish()? else {
            return Ok(None);
        };

        let reader = BlockReader::open(self.dir.join(format!("{}.block", meta.id)))?;
        {
            let mut blocks = self
                .blocks
                .write()
                .map_err(|e| StorageError::Lock(format!("blocks lock poisoned: {}", e)))?;
            blocks.push(Arc::new(reader));
            blocks.sort_by_key(|b| (b.meta().min_time, b.meta().max_time));
        }

        state.wal.truncate()?;
        state.head.clear();

        tracing::info!(
            block = %meta.id,
            series = meta.stats.num_series,
            samples = meta.stats.num_samples,
            "Flushed head to block"
        );

        Ok(Some(meta))
    }

    fn release_lock(&self) {
        if !self.locked {
            return;
        }
        if let Err(e) = std::fs::remove_file(self.dir.join(LOCK_FILE)) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to remove lock file");
        }
    }
}

impl Store for WritableStore {
    fn block_metas(&self) -> StorageResult<Vec<BlockMeta>> {
        self.ensure_open()?;
        Ok(self
            .read_blocks()?
            .iter()
            .map(|b| b.meta().clone())
            .collect())
    }

    fn head_bounds(&self) -> StorageResult<Option<(i64, i64)>> {
        Ok(lock_state(&self.state)?.head.bounds())
    }

    fn querier(&self, range: TimeRange) -> StorageResult<FetchHandle> {
        self.ensure_open()?;
        check_range(range)?;

        let blocks = self.read_blocks()?;
        let head = lock_state(&self.state)?.head.snapshot(range);

        let set = MergedSeriesSet::new(range, &blocks, head)?;
        Ok(FetchHandle::tracked(range, Box::new(set), &self.tracker))
    }

    fn open_queriers(&self) -> usize {
        self.tracker.open_queriers()
    }

    fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        lock_state(&self.state)?.wal.sync()?;
        self.release_lock();
        Ok(())
    }
}

impl Drop for WritableStore {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release_lock();
        }
    }
}

impl fmt::Debug for WritableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
