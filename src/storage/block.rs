//! Block file format
//!
//! A block is an immutable file holding every series of a time slice.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "TSBK"               │
//! │   version: u16                          │
//! │   id: [u8; 16] (uuid)                   │
//! │   min_time: i64                         │
//! │   max_time: i64                         │
//! │   num_samples: u64                      │
//! │   num_series: u32                       │
//! │   num_chunks: u32                       │
//! │   reserved: [u8; 6]                     │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ CHUNKS (variable)                       │
//! │   For each chunk:                       │
//! │     chunk_size: u32                     │
//! │     compressed_data: [u8; chunk_size]   │
//! │     chunk_checksum: u32                 │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   index: lz4(bincode(Vec<SeriesEntry>)) │
//! │   index_size: u32                       │
//! │   index_checksum: u32                   │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::chunk::{decode_chunk, encode_chunk, MAX_SAMPLES_PER_CHUNK};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlockMeta, BlockStats, Labels, Sample};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Magic bytes for block file identification
const BLOCK_MAGIC: [u8; 4] = *b"TSBK";

/// Current block format version
const BLOCK_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// File extension of a finished block
pub const BLOCK_EXTENSION: &str = "block";

/// Location and bounds of one chunk inside a block file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Offset of the chunk record from start of file
    pub offset: u64,
    /// Size of compressed data
    pub size: u32,
    pub min_time: i64,
    pub max_time: i64,
    pub num_samples: u32,
}

/// Index entry: one series and its chunks, ordered by time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub labels: Labels,
    pub chunks: Vec<ChunkRef>,
}

fn encode_header(meta: &BlockMeta) -> [u8; HEADER_SIZE] {
    let mut buf = [0u8; HEADER_SIZE];

    buf[0..4].copy_from_slice(&BLOCK_MAGIC);
    buf[4..6].copy_from_slice(&BLOCK_VERSION.to_le_bytes());
    buf[6..22].copy_from_slice(meta.id.as_bytes());
    buf[22..30].copy_from_slice(&meta.min_time.to_le_bytes());
    buf[30..38].copy_from_slice(&meta.max_time.to_le_bytes());
    buf[38..46].copy_from_slice(&meta.stats.num_samples.to_le_bytes());
    buf[46..50].copy_from_slice(&(meta.stats.num_series as u32).to_le_bytes());
    buf[50..54].copy_from_slice(&(meta.stats.num_chunks as u32).to_le_bytes());
    // bytes 54-59 reserved

    let checksum = crc32fast::hash(&buf[0..60]);
    buf[60..64].copy_from_slice(&checksum.to_le_bytes());

    buf
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn decode_header(buf: &[u8; HEADER_SIZE]) -> StorageResult<BlockMeta> {
    let stored_checksum = read_u32(buf, 60);
    let computed_checksum = crc32fast::hash(&buf[0..60]);

    if stored_checksum != computed_checksum {
        return Err(StorageError::Corruption(format!(
            "Header checksum mismatch: stored={}, computed={}",
            stored_checksum, computed_checksum
        )));
    }

    if buf[0..4] != BLOCK_MAGIC {
        return Err(StorageError::InvalidBlock(format!(
            "Invalid magic: {:?}",
            &buf[0..4]
        )));
    }

    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version > BLOCK_VERSION {
        return Err(StorageError::InvalidBlock(format!(
            "Unsupported version: {}",
            version
        )));
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[6..22]);

    let mut num_samples = [0u8; 8];
    num_samples.copy_from_slice(&buf[38..46]);

    Ok(BlockMeta {
        id: Uuid::from_bytes(id),
        min_time: read_i64(buf, 22),
        max_time: read_i64(buf, 30),
        stats: BlockStats {
            num_samples: u64::from_le_bytes(num_samples),
            num_series: read_u32(buf, 46) as u64,
            num_chunks: read_u32(buf, 50) as u64,
        },
    })
}

/// Writes a new block, chunk by chunk, then seals it with the series index
///
/// The block is written to a temporary file and only renamed into place by
/// [`BlockWriter::finish`], so readers never observe a partial block.
pub struct BlockWriter {
    dir: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    meta: BlockMeta,
    offset: u64,
    index: BTreeMap<Labels, Vec<ChunkRef>>,
}

impl BlockWriter {
    /// Start a new block in `dir`
    pub fn create(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let id = Uuid::new_v4();
        let tmp_path = dir.join(format!("{}.{}.tmp", id, BLOCK_EXTENSION));

        let meta = BlockMeta {
            id,
            min_time: i64::MAX,
            max_time: i64::MIN,
            stats: BlockStats::default(),
        };

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&encode_header(&meta))?;

        Ok(Self {
            dir,
            tmp_path,
            writer,
            meta,
            offset: HEADER_SIZE as u64,
            index: BTreeMap::new(),
        })
    }

    /// Append all samples of a series
    ///
    /// Samples must be ordered by timestamp. Adding the same label set twice
    /// appends to the existing series.
    pub fn add_series(&mut self, labels: &Labels, samples: &[Sample]) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut refs = Vec::with_capacity(samples.len().div_ceil(MAX_SAMPLES_PER_CHUNK));

        for chunk in samples.chunks(MAX_SAMPLES_PER_CHUNK) {
            let compressed = encode_chunk(chunk)?;
            let checksum = crc32fast::hash(&compressed);

            self.writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
            self.writer.write_all(&compressed)?;
            self.writer.write_all(&checksum.to_le_bytes())?;

            let chunk_ref = ChunkRef {
                offset: self.offset,
                size: compressed.len() as u32,
                min_time: chunk[0].timestamp,
                max_time: chunk[chunk.len() - 1].timestamp,
                num_samples: chunk.len() as u32,
            };

            self.offset += compressed.len() as u64 + 8;
            self.meta.min_time = self.meta.min_time.min(chunk_ref.min_time);
            self.meta.max_time = self.meta.max_time.max(chunk_ref.max_time);
            self.meta.stats.num_samples += chunk.len() as u64;
            self.meta.stats.num_chunks += 1;
            refs.push(chunk_ref);
        }

        self.index.entry(labels.clone()).or_default().extend(refs);
        Ok(())
    }

    /// Seal the block and move it into place
    ///
    /// Returns `None` (and leaves nothing behind) if no samples were added.
    pub fn finish(mut self) -> StorageResult<Option<BlockMeta>> {
        if self.index.is_empty() {
            drop(self.writer);
            std::fs::remove_file(&self.tmp_path)?;
            return Ok(None);
        }

        self.meta.stats.num_series = self.index.len() as u64;

        let entries: Vec<SeriesEntry> = std::mem::take(&mut self.index)
            .into_iter()
            .map(|(labels, chunks)| SeriesEntry { labels, chunks })
            .collect();

        let serialized = bincode::serialize(&entries)?;
        let footer = lz4_flex::compress_prepend_size(&serialized);
        let checksum = crc32fast::hash(&footer);

        self.writer.write_all(&footer)?;
        self.writer.write_all(&(footer.len() as u32).to_le_bytes())?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        // Rewrite header with final bounds and stats
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&encode_header(&self.meta))?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let final_path = self
            .dir
            .join(format!("{}.{}", self.meta.id, BLOCK_EXTENSION));
        std::fs::rename(&self.tmp_path, &final_path)?;

        tracing::debug!(
            block = %self.meta.id,
            series = self.meta.stats.num_series,
            samples = self.meta.stats.num_samples,
            "Block written"
        );

        Ok(Some(self.meta))
    }
}

/// An opened block: metadata plus series index, chunks read on demand
#[derive(Debug)]
pub struct BlockReader {
    path: PathBuf,
    meta: BlockMeta,
    index: Vec<SeriesEntry>,
}

impl BlockReader {
    /// Open a block file, validating header and index checksums
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufReader::new(File::open(&path)?);

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let meta = decode_header(&header_buf)?;

        let index = Self::read_index(&mut file)?;

        Ok(Self { path, meta, index })
    }

    fn read_index(file: &mut BufReader<File>) -> StorageResult<Vec<SeriesEntry>> {
        file.seek(SeekFrom::End(-8))?;

        let mut trailer = [0u8; 8];
        file.read_exact(&mut trailer)?;
        let index_size = read_u32(&trailer, 0);
        let stored_checksum = read_u32(&trailer, 4);

        file.seek(SeekFrom::End(-(index_size as i64) - 8))?;

        let mut footer = vec![0u8; index_size as usize];
        file.read_exact(&mut footer)?;

        let computed_checksum = crc32fast::hash(&footer);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption("Index checksum mismatch".into()));
        }

        let decompressed = lz4_flex::decompress_size_prepended(&footer)
            .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

        Ok(bincode::deserialize(&decompressed)?)
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Series index, ordered by labels
    pub fn series(&self) -> &[SeriesEntry] {
        &self.index
    }

    /// Open an independent file handle for reading chunks of this block
    pub fn chunk_reader(&self) -> StorageResult<ChunkReader> {
        Ok(ChunkReader {
            file: BufReader::new(File::open(&self.path)?),
        })
    }
}

/// File handle used by a querier to decode chunks lazily
#[derive(Debug)]
pub struct ChunkReader {
    file: BufReader<File>,
}

impl ChunkReader {
    /// Read and decompress a single chunk
    pub fn read(&mut self, chunk: &ChunkRef) -> StorageResult<Vec<Sample>> {
        self.file.seek(SeekFrom::Start(chunk.offset))?;

        let mut size_buf = [0u8; 4];
        self.file.read_exact(&mut size_buf)?;
        let size = u32::from_le_bytes(size_buf);

        if size != chunk.size {
            return Err(StorageError::Corruption(format!(
                "Chunk at offset {} has size {}, index says {}",
                chunk.offset, size, chunk.size
            )));
        }

        let mut data = vec![0u8; size as usize];
        self.file.read_exact(&mut data)?;

        let mut checksum_buf = [0u8; 4];
        self.file.read_exact(&mut checksum_buf)?;
        let stored_checksum = u32::from_le_bytes(checksum_buf);

        if stored_checksum != crc32fast::hash(&data) {
            return Err(StorageError::Corruption(format!(
                "Chunk at offset {} checksum mismatch",
                chunk.offset
            )));
        }

        decode_chunk(&data)
    }
}

/// List finished block files in a directory, ignoring temporaries
pub fn block_paths(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut paths = Vec::new();

    if !dir.exists() {
        return Ok(paths);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == BLOCK_EXTENSION).unwrap_or(false) {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}
