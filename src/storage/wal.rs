//! Write-Ahead Log for the head of a writable store
//!
//! Every committed append is persisted here before it becomes visible in the
//! head. Opening a writable store replays the log; flushing the head into a
//! block truncates it.
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode `WalRecord`)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Labels, Sample};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Largest entry accepted on replay
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Samples committed for one series in one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

pub struct WriteAheadLog {
    writer: BufWriter<File>,
    path: PathBuf,
    entry_count: u64,
}

impl WriteAheadLog {
    /// Open or create a WAL file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            entry_count: 0,
        })
    }

    /// Append the records of one commit and sync them to disk
    pub fn append(&mut self, records: &[WalRecord]) -> StorageResult<()> {
        for record in records {
            let data = bincode::serialize(record)?;
            let len = (data.len() as u32).to_le_bytes();

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&len);
            hasher.update(&data);
            let crc = hasher.finalize();

            self.writer.write_all(&len)?;
            self.writer.write_all(&data)?;
            self.writer.write_all(&crc.to_le_bytes())?;

            self.entry_count += 1;
        }

        self.sync()
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Read every intact entry
    ///
    /// Replay stops at the first torn or corrupt entry; anything after it is
    /// dropped and the file is cut back to the last good entry.
    pub fn replay(&mut self) -> StorageResult<Vec<WalRecord>> {
        self.writer.flush()?;

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        let mut good_len = 0u64;

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some((record, size))) => {
                    records.push(record);
                    good_len += size;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        entries = records.len(),
                        error = %e,
                        "WAL replay stopped at torn entry"
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(&self.path)?
                        .set_len(good_len)?;
                    break;
                }
            }
        }

        self.entry_count = records.len() as u64;
        Ok(records)
    }

    /// Read a single entry, returning it with its on-disk size
    fn read_entry_from<R: Read>(reader: &mut R) -> StorageResult<Option<(WalRecord, u64)>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(StorageError::WalError(format!(
                "Entry length too large: {}",
                len
            )));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(StorageError::Corruption(format!(
                "CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            )));
        }

        let record: WalRecord = bincode::deserialize(&data)?;
        Ok(Some((record, len as u64 + 8)))
    }

    /// Drop every entry (after the head was flushed to a block)
    pub fn truncate(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(0)?;
        self.writer.get_ref().sync_all()?;
        self.entry_count = 0;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str, ts: &[i64]) -> WalRecord {
        WalRecord {
            labels: Labels::from_pairs([("__name__", name)]),
            samples: ts.iter().map(|&t| Sample::new(t, t as f64)).collect(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.append(&[record("up", &[1, 2]), record("load1", &[3])])
                .unwrap();
            assert_eq!(wal.entry_count(), 2);
        }

        let mut wal = WriteAheadLog::open(&path).unwrap();
        let records = wal.replay().unwrap();

        assert_eq!(records, vec![record("up", &[1, 2]), record("load1", &[3])]);
        assert_eq!(wal.entry_count(), 2);
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        let mut wal = WriteAheadLog::open(&path).unwrap();
        wal.append(&[record("up", &[1, 2, 3])]).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.entry_count(), 0);
        assert!(wal.replay().unwrap().is_empty());

        // Appends after truncation land at the start of the file
        wal.append(&[record("up", &[4])]).unwrap();
        assert_eq!(wal.replay().unwrap(), vec![record("up", &[4])]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.append(&[record("up", &[1]), record("up", &[2])]).unwrap();
        }

        // Cut the last entry in half
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 6)
            .unwrap();

        let mut wal = WriteAheadLog::open(&path).unwrap();
        assert_eq!(wal.replay().unwrap(), vec![record("up", &[1])]);

        // The file now ends at the last good entry
        wal.append(&[record("up", &[3])]).unwrap();
        assert_eq!(
            wal.replay().unwrap(),
            vec![record("up", &[1]), record("up", &[3])]
        );
    }

    #[test]
    fn test_crc_corruption_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        {
            let mut wal = WriteAheadLog::open(&path).unwrap();
            wal.append(&[record("up", &[1])]).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let mut wal = WriteAheadLog::open(&path).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }
}
