//! Block listing output for the `ls` command
//!
//! Block ids are random UUIDs and say nothing about when a block was
//! written. Blocks are listed in the order the store reports them, which is
//! by time range (min time, then max time), not by creation.

use crate::storage::BlockMeta;

/// Output format of a listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ListFormat {
    #[default]
    Table,
    Json,
}

const HEADERS: [&str; 6] = [
    "BLOCK ID",
    "MIN TIME",
    "MAX TIME",
    "NUM SAMPLES",
    "NUM CHUNKS",
    "NUM SERIES",
];

/// Column gap, in spaces
const PADDING: usize = 2;

/// Millisecond timestamp as raw digits, or as a UTC date when `human_readable`
pub fn format_time(timestamp: i64, human_readable: bool) -> String {
    if !human_readable {
        return timestamp.to_string();
    }

    chrono::DateTime::from_timestamp(timestamp.div_euclid(1000), 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Render block metadata in the requested format
pub fn render_blocks(
    blocks: &[BlockMeta],
    format: ListFormat,
    human_readable: bool,
) -> Result<String, serde_json::Error> {
    match format {
        ListFormat::Table => Ok(render_table(blocks, human_readable)),
        ListFormat::Json => serde_json::to_string_pretty(blocks),
    }
}

/// Left-aligned columns separated by at least two spaces
pub fn render_table(blocks: &[BlockMeta], human_readable: bool) -> String {
    let rows: Vec<[String; 6]> = blocks
        .iter()
        .map(|meta| {
            [
                meta.id.to_string(),
                format_time(meta.min_time, human_readable),
                format_time(meta.max_time, human_readable),
                meta.stats.num_samples.to_string(),
                meta.stats.num_chunks.to_string(),
                meta.stats.num_series.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(str::to_string);
    for row in std::iter::once(&header).chain(&rows) {
        let last = row.len() - 1;
        for (i, cell) in row.iter().enumerate() {
            out.push_str(cell);
            if i < last {
                out.push_str(&" ".repeat(widths[i] - cell.len() + PADDING));
            }
        }
        out.push('\n');
    }

    out
}
