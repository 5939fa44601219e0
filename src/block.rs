//! In-memory blocks and the streaming collaborator interfaces.
//!
//! A [`Block`] is a set of equally-long named columns — the unit of data
//! exchange between writers, readers, merges, and ALTER conversions. The
//! engine pulls blocks through the [`BlockInputStream`] trait: a plain
//! iterator-style interface (`read()` returns `None` at end of stream)
//! that may block on I/O. The concurrency unit is the OS thread running
//! the pipeline, not the block.
//!
//! Compression is an external collaborator behind [`CompressionCodec`];
//! the built-in [`PassthroughCodec`] stores payloads verbatim, which keeps
//! the on-disk block framing (and its checksums) exercised without binding
//! the engine to a codec crate.

use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::types::{ColumnDescription, DataType};

/// A set of named, typed columns of equal length.
#[derive(Debug, Clone, Default)]
pub struct Block {
    columns: Vec<(ColumnDescription, Vec<Field>)>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column. The first column fixes the row count; later ones
    /// must match it.
    pub fn add_column(
        &mut self,
        description: ColumnDescription,
        values: Vec<Field>,
    ) -> Result<()> {
        if let Some((_, first)) = self.columns.first()
            && first.len() != values.len()
        {
            return Err(MergeTreeError::TypeMismatch {
                column: description.name.clone(),
                expected: format!("{} rows", first.len()),
                found: format!("{} rows", values.len()),
            });
        }
        for value in &values {
            if !description.data_type.accepts(value) {
                return Err(MergeTreeError::TypeMismatch {
                    column: description.name.clone(),
                    expected: description.data_type.to_string(),
                    found: value.type_name().into(),
                });
            }
        }
        self.columns.push((description, values));
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, v)| v.len())
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column_descriptions(&self) -> Vec<ColumnDescription> {
        self.columns.iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn column_values(&self, name: &str) -> Result<&[Field]> {
        self.columns
            .iter()
            .find(|(d, _)| d.name == name)
            .map(|(_, v)| v.as_slice())
            .ok_or_else(|| MergeTreeError::MissingColumn(name.into()))
    }

    pub fn column_type(&self, name: &str) -> Result<&DataType> {
        self.columns
            .iter()
            .find(|(d, _)| d.name == name)
            .map(|(d, _)| &d.data_type)
            .ok_or_else(|| MergeTreeError::MissingColumn(name.into()))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(d, _)| d.name == name)
    }

    /// The values of the named columns at one row, as a key tuple.
    pub fn key_tuple(&self, row: usize, key_columns: &[String]) -> Result<Vec<Field>> {
        key_columns
            .iter()
            .map(|name| {
                self.column_values(name)
                    .map(|values| values[row].clone())
            })
            .collect()
    }

    /// One whole row, in column order.
    pub fn row(&self, row: usize) -> Vec<Field> {
        self.columns.iter().map(|(_, v)| v[row].clone()).collect()
    }

    /// Rebuild a block with the same schema from whole rows.
    pub fn from_rows(schema: &[ColumnDescription], rows: &[Vec<Field>]) -> Result<Block> {
        let mut block = Block::new();
        for (idx, description) in schema.iter().enumerate() {
            let values = rows.iter().map(|r| r[idx].clone()).collect();
            block.add_column(description.clone(), values)?;
        }
        Ok(block)
    }

    /// Whether rows are sorted (non-strictly) by the given key columns.
    pub fn is_sorted_by(&self, key_columns: &[String]) -> Result<bool> {
        let keys: Vec<&[Field]> = key_columns
            .iter()
            .map(|name| self.column_values(name))
            .collect::<Result<_>>()?;
        for row in 1..self.num_rows() {
            let prev: Vec<&Field> = keys.iter().map(|col| &col[row - 1]).collect();
            let curr: Vec<&Field> = keys.iter().map(|col| &col[row]).collect();
            if prev > curr {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sort rows by the given key columns (stable).
    pub fn sort_by(&mut self, key_columns: &[String]) -> Result<()> {
        if self.is_sorted_by(key_columns)? {
            return Ok(());
        }
        let mut order: Vec<usize> = (0..self.num_rows()).collect();
        {
            let keys: Vec<&[Field]> = key_columns
                .iter()
                .map(|name| self.column_values(name))
                .collect::<Result<_>>()?;
            order.sort_by(|&a, &b| {
                let ka: Vec<&Field> = keys.iter().map(|col| &col[a]).collect();
                let kb: Vec<&Field> = keys.iter().map(|col| &col[b]).collect();
                ka.cmp(&kb)
            });
        }
        for (_, values) in &mut self.columns {
            let reordered: Vec<Field> = order.iter().map(|&i| values[i].clone()).collect();
            *values = reordered;
        }
        Ok(())
    }
}

// ── Streaming interface ────────────────────────────────────────────────────

/// Pull-based block source.
///
/// `read()` returns `None` at end of stream and may block on disk I/O.
pub trait BlockInputStream {
    /// Called once before the first `read`.
    fn read_prefix(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next block, or `None` at end of stream.
    fn read(&mut self) -> Result<Option<Block>>;

    /// Called once after the last `read`.
    fn read_suffix(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A stream over an in-memory list of blocks. Used by inserts and tests.
pub struct BlocksListStream {
    blocks: std::vec::IntoIter<Block>,
}

impl BlocksListStream {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks: blocks.into_iter(),
        }
    }
}

impl BlockInputStream for BlocksListStream {
    fn read(&mut self) -> Result<Option<Block>> {
        Ok(self.blocks.next())
    }
}

// ── Compression collaborator ───────────────────────────────────────────────

/// Block payload compression, supplied by the embedder.
pub trait CompressionCodec: Send + Sync {
    /// One-byte tag written into each block header.
    fn tag(&self) -> u8;

    fn compress(&self, raw: &[u8]) -> Vec<u8>;

    /// `raw_size` is the expected decompressed length from the header.
    fn decompress(&self, compressed: &[u8], raw_size: usize) -> Result<Vec<u8>>;
}

/// Stores payloads verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCodec;

impl CompressionCodec for PassthroughCodec {
    fn tag(&self) -> u8 {
        0
    }

    fn compress(&self, raw: &[u8]) -> Vec<u8> {
        raw.to_vec()
    }

    fn decompress(&self, compressed: &[u8], raw_size: usize) -> Result<Vec<u8>> {
        if compressed.len() != raw_size {
            return Err(MergeTreeError::CorruptedMetadata {
                part: String::new(),
                detail: format!(
                    "passthrough block: {} bytes stored, {} promised",
                    compressed.len(),
                    raw_size
                ),
            });
        }
        Ok(compressed.to_vec())
    }
}
