//! Mark files (`.mrk`) and the sparse primary-key index (`primary.idx`).
//!
//! Every `index_granularity` rows a writer cuts a *mark*: the position of
//! that row in the column's compressed stream, as
//! `(compressed_block_offset, uncompressed_offset_within_block)`. A reader
//! seeks to the block at `compressed_block_offset`, decompresses it, and
//! skips `uncompressed_offset` bytes — so a mark addresses any row without
//! decompressing the whole file.
//!
//! `primary.idx` holds the primary-key tuple of the first row of each
//! granule, in [`Field`] binary form. Marks and index entries correspond
//! one-to-one by position.

use std::fs;
use std::path::Path;

use crate::error::{MergeTreeError, Result};
use crate::field::Field;

/// One sparse-index entry of a single column stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    /// Byte offset of the compressed block this granule starts in.
    pub compressed_offset: u64,
    /// Byte offset of the granule's first row inside the decompressed block.
    pub uncompressed_offset: u64,
}

const MARK_SIZE: usize = 16;

/// Serialize marks as fixed 16-byte little-endian entries.
pub fn format_marks(marks: &[Mark]) -> Vec<u8> {
    let mut out = Vec::with_capacity(marks.len() * MARK_SIZE);
    for mark in marks {
        out.extend_from_slice(&mark.compressed_offset.to_le_bytes());
        out.extend_from_slice(&mark.uncompressed_offset.to_le_bytes());
    }
    out
}

pub fn parse_marks(bytes: &[u8], part_name: &str) -> Result<Vec<Mark>> {
    if bytes.len() % MARK_SIZE != 0 {
        return Err(MergeTreeError::CorruptedMetadata {
            part: part_name.into(),
            detail: format!("marks file length {} not a multiple of {MARK_SIZE}", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(MARK_SIZE)
        .map(|chunk| Mark {
            compressed_offset: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
            uncompressed_offset: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
        })
        .collect())
}

pub fn read_marks(path: &Path, part_name: &str) -> Result<Vec<Mark>> {
    let bytes = fs::read(path).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?;
    parse_marks(&bytes, part_name)
}

pub fn write_marks(path: &Path, marks: &[Mark]) -> Result<()> {
    fs::write(path, format_marks(marks)).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))
}

// ── primary.idx ────────────────────────────────────────────────────────────

/// Name of the sparse-index file inside a part directory.
pub const PRIMARY_INDEX_FILE_NAME: &str = "primary.idx";

/// Serialize one key tuple per mark.
pub fn format_index(index: &[Vec<Field>]) -> Vec<u8> {
    let mut out = Vec::new();
    for tuple in index {
        for field in tuple {
            // Vec<u8> writes cannot fail.
            field.write_binary(&mut out).expect("in-memory write");
        }
    }
    out
}

/// Parse `primary.idx` given the key width. The byte stream must contain a
/// whole number of `key_size`-wide tuples.
pub fn parse_index(bytes: &[u8], key_size: usize, part_name: &str) -> Result<Vec<Vec<Field>>> {
    let corrupted = |detail: String| MergeTreeError::CorruptedMetadata {
        part: part_name.into(),
        detail,
    };
    if key_size == 0 {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        return Err(corrupted("index bytes present for an empty key".into()));
    }
    let mut cursor = bytes;
    let mut tuples = Vec::new();
    let mut fields = Vec::with_capacity(key_size);
    while !cursor.is_empty() {
        let field = Field::read_binary(&mut cursor)
            .map_err(|e| corrupted(format!("primary.idx: {e}")))?;
        fields.push(field);
        if fields.len() == key_size {
            tuples.push(std::mem::take(&mut fields));
            fields.reserve(key_size);
        }
    }
    if !fields.is_empty() {
        return Err(corrupted(format!(
            "primary.idx: trailing {}-field fragment of a {key_size}-field tuple",
            fields.len()
        )));
    }
    Ok(tuples)
}

pub fn read_index(path: &Path, key_size: usize, part_name: &str) -> Result<Vec<Vec<Field>>> {
    let bytes = fs::read(path).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?;
    parse_index(&bytes, key_size, part_name)
}

pub fn write_index(path: &Path, index: &[Vec<Field>]) -> Result<()> {
    fs::write(path, format_index(index)).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))
}
