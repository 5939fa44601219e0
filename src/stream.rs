//! On-disk column stream format.
//!
//! A `<column>.bin` file is a sequence of framed blocks:
//!
//! ```text
//! +----------------+-----+----------------+----------+- - - - - -+
//! | checksum (u64) | tag | compressed u32 | raw u32  | payload   |
//! +----------------+-----+----------------+----------+- - - - - -+
//! ```
//!
//! The checksum is xxHash3 over everything after it (tag, sizes, payload),
//! so a flipped bit anywhere in the frame is caught before decompression.
//! `tag` names the [`CompressionCodec`] that produced the payload.
//!
//! Values are serialized at their *declared* width: a `UInt16` column costs
//! two bytes per row regardless of the in-memory lane. Strings are
//! length-prefixed. Array cells do not appear here at all — their sizes
//! live in the sibling `.size0` stream and their elements are flattened
//! into the main stream.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

use crate::block::CompressionCodec;
use crate::checksums::FileChecksum;
use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::marks::Mark;
use crate::types::DataType;

/// Frame header length: checksum + tag + compressed size + raw size.
pub const BLOCK_HEADER_SIZE: u64 = 8 + 1 + 4 + 4;

/// Raw bytes accumulated before a frame is cut.
pub const DEFAULT_BLOCK_SIZE: usize = 65_536;

// ── Value codec ────────────────────────────────────────────────────────────

/// Append one value at the declared width of `data_type`.
///
/// Callers have already lane-checked the field against the type
/// ([`DataType::accepts`]); a mismatch here is a programming error.
pub fn serialize_value(raw: &mut Vec<u8>, data_type: &DataType, value: &Field) -> Result<()> {
    let mismatch = || MergeTreeError::TypeMismatch {
        column: String::new(),
        expected: data_type.to_string(),
        found: value.type_name().into(),
    };
    match data_type {
        DataType::UInt8 => raw.push(unsigned(value).ok_or_else(mismatch)? as u8),
        DataType::UInt16 | DataType::Date => {
            raw.extend_from_slice(&(unsigned(value).ok_or_else(mismatch)? as u16).to_le_bytes())
        }
        DataType::UInt32 | DataType::DateTime => {
            raw.extend_from_slice(&(unsigned(value).ok_or_else(mismatch)? as u32).to_le_bytes())
        }
        DataType::UInt64 => {
            raw.extend_from_slice(&unsigned(value).ok_or_else(mismatch)?.to_le_bytes())
        }
        DataType::Int8 | DataType::Enum8(_) => {
            raw.push((signed(value).ok_or_else(mismatch)? as i8) as u8)
        }
        DataType::Int16 | DataType::Enum16(_) => {
            raw.extend_from_slice(&(signed(value).ok_or_else(mismatch)? as i16).to_le_bytes())
        }
        DataType::Int32 => {
            raw.extend_from_slice(&(signed(value).ok_or_else(mismatch)? as i32).to_le_bytes())
        }
        DataType::Int64 => {
            raw.extend_from_slice(&signed(value).ok_or_else(mismatch)?.to_le_bytes())
        }
        DataType::Float32 => match value {
            Field::Float64(v) => raw.extend_from_slice(&(*v as f32).to_le_bytes()),
            _ => return Err(mismatch()),
        },
        DataType::Float64 => match value {
            Field::Float64(v) => raw.extend_from_slice(&v.to_le_bytes()),
            _ => return Err(mismatch()),
        },
        DataType::String => match value {
            Field::String(bytes) => {
                raw.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                raw.extend_from_slice(bytes);
            }
            _ => return Err(mismatch()),
        },
        DataType::Array(_) => return Err(mismatch()),
    }
    Ok(())
}

/// Read one value of `data_type` from a cursor over decompressed bytes.
pub fn deserialize_value(cursor: &mut &[u8], data_type: &DataType) -> Result<Field> {
    let truncated = || MergeTreeError::CorruptedMetadata {
        part: String::new(),
        detail: format!("column stream truncated while reading {data_type}"),
    };
    fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
        if cursor.len() < n {
            return None;
        }
        let (head, tail) = cursor.split_at(n);
        *cursor = tail;
        Some(head)
    }

    let field = match data_type {
        DataType::UInt8 => Field::UInt64(take(cursor, 1).ok_or_else(truncated)?[0] as u64),
        DataType::UInt16 | DataType::Date => {
            let b = take(cursor, 2).ok_or_else(truncated)?;
            Field::UInt64(u16::from_le_bytes(b.try_into().unwrap()) as u64)
        }
        DataType::UInt32 | DataType::DateTime => {
            let b = take(cursor, 4).ok_or_else(truncated)?;
            Field::UInt64(u32::from_le_bytes(b.try_into().unwrap()) as u64)
        }
        DataType::UInt64 => {
            let b = take(cursor, 8).ok_or_else(truncated)?;
            Field::UInt64(u64::from_le_bytes(b.try_into().unwrap()))
        }
        DataType::Int8 | DataType::Enum8(_) => {
            Field::Int64(take(cursor, 1).ok_or_else(truncated)?[0] as i8 as i64)
        }
        DataType::Int16 | DataType::Enum16(_) => {
            let b = take(cursor, 2).ok_or_else(truncated)?;
            Field::Int64(i16::from_le_bytes(b.try_into().unwrap()) as i64)
        }
        DataType::Int32 => {
            let b = take(cursor, 4).ok_or_else(truncated)?;
            Field::Int64(i32::from_le_bytes(b.try_into().unwrap()) as i64)
        }
        DataType::Int64 => {
            let b = take(cursor, 8).ok_or_else(truncated)?;
            Field::Int64(i64::from_le_bytes(b.try_into().unwrap()))
        }
        DataType::Float32 => {
            let b = take(cursor, 4).ok_or_else(truncated)?;
            Field::Float64(f32::from_le_bytes(b.try_into().unwrap()) as f64)
        }
        DataType::Float64 => {
            let b = take(cursor, 8).ok_or_else(truncated)?;
            Field::Float64(f64::from_le_bytes(b.try_into().unwrap()))
        }
        DataType::String => {
            let b = take(cursor, 8).ok_or_else(truncated)?;
            let len = u64::from_le_bytes(b.try_into().unwrap()) as usize;
            Field::String(take(cursor, len).ok_or_else(truncated)?.to_vec())
        }
        DataType::Array(_) => {
            return Err(MergeTreeError::CorruptedMetadata {
                part: String::new(),
                detail: "array cells have no direct stream representation".into(),
            });
        }
    };
    Ok(field)
}

// ── Writing ────────────────────────────────────────────────────────────────

/// A file-backed compressed stream: accumulates raw bytes, frames them into
/// blocks at row boundaries, and records marks at granule boundaries.
pub struct CompressedStreamWriter<'a> {
    path: PathBuf,
    file: BufWriter<File>,
    codec: &'a dyn CompressionCodec,
    block_size: usize,
    /// Raw bytes of the block being accumulated.
    raw: Vec<u8>,
    /// File offset where the current (unflushed) block will begin.
    file_offset: u64,
    hasher: Xxh3,
    marks: Vec<Mark>,
}

impl<'a> CompressedStreamWriter<'a> {
    pub fn create(path: &Path, codec: &'a dyn CompressionCodec, block_size: usize) -> Result<Self> {
        let file = File::create(path).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            codec,
            block_size,
            raw: Vec::with_capacity(block_size),
            file_offset: 0,
            hasher: Xxh3::new(),
            marks: Vec::new(),
        })
    }

    /// Record a granule boundary at the current position.
    pub fn cut_mark(&mut self) {
        self.marks.push(Mark {
            compressed_offset: self.file_offset,
            uncompressed_offset: self.raw.len() as u64,
        });
    }

    /// Append one serialized value.
    pub fn write_value(&mut self, data_type: &DataType, value: &Field) -> Result<()> {
        serialize_value(&mut self.raw, data_type, value)
    }

    /// Frame the accumulated raw bytes if the block is full. Call at row
    /// boundaries only, so no value straddles a frame.
    pub fn maybe_flush(&mut self) -> Result<()> {
        if self.raw.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.raw.is_empty() {
            return Ok(());
        }
        let compressed = self.codec.compress(&self.raw);
        let mut frame = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + compressed.len());
        frame.push(self.codec.tag());
        frame.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        frame.extend_from_slice(&(self.raw.len() as u32).to_le_bytes());
        frame.extend_from_slice(&compressed);
        let checksum = crate::checksums::hash_bytes(&frame);

        let io = |e| MergeTreeError::io(self.path.clone(), e);
        self.file.write_all(&checksum.to_le_bytes()).map_err(io)?;
        self.file.write_all(&frame).map_err(io)?;
        self.hasher.update(&checksum.to_le_bytes());
        self.hasher.update(&frame);

        self.file_offset += 8 + frame.len() as u64;
        self.raw.clear();
        Ok(())
    }

    /// Flush the trailing partial block and return `(marks, checksum)`.
    pub fn finalize(mut self) -> Result<(Vec<Mark>, FileChecksum)> {
        self.flush_block()?;
        self.file
            .flush()
            .map_err(|e| MergeTreeError::io(self.path.clone(), e))?;
        let checksum = FileChecksum {
            size: self.file_offset,
            hash: self.hasher.digest(),
        };
        Ok((self.marks, checksum))
    }
}

// ── Reading ────────────────────────────────────────────────────────────────

/// Sequential reader over a compressed column stream, positioned by mark.
pub struct CompressedStreamReader<'a> {
    path: PathBuf,
    file: File,
    codec: &'a dyn CompressionCodec,
    part_name: String,
    /// Decompressed bytes of the current block.
    buffer: Vec<u8>,
    /// Read position inside `buffer`.
    position: usize,
    /// File offset of the next frame.
    next_frame_offset: u64,
    file_size: u64,
}

impl<'a> CompressedStreamReader<'a> {
    pub fn open(path: &Path, codec: &'a dyn CompressionCodec, part_name: &str) -> Result<Self> {
        let file = File::open(path).map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?;
        let file_size = file
            .metadata()
            .map_err(|e| MergeTreeError::io(path.to_path_buf(), e))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            codec,
            part_name: part_name.to_string(),
            buffer: Vec::new(),
            position: 0,
            next_frame_offset: 0,
            file_size,
        })
    }

    /// Position the reader at a mark.
    pub fn seek_to_mark(&mut self, mark: Mark) -> Result<()> {
        self.next_frame_offset = mark.compressed_offset;
        self.buffer.clear();
        self.position = 0;
        self.read_next_block()?;
        if mark.uncompressed_offset as usize > self.buffer.len() {
            return Err(self.corrupted(format!(
                "mark points {} bytes into a {}-byte block",
                mark.uncompressed_offset,
                self.buffer.len()
            )));
        }
        self.position = mark.uncompressed_offset as usize;
        Ok(())
    }

    /// Read one value, crossing into the next block if needed.
    pub fn read_value(&mut self, data_type: &DataType) -> Result<Field> {
        if self.position == self.buffer.len() {
            self.read_next_block()?;
        }
        // Values never straddle frames (writers flush at row boundaries),
        // so the whole value is available in the current buffer.
        let mut cursor = &self.buffer[self.position..];
        let before = cursor.len();
        let field = deserialize_value(&mut cursor, data_type).map_err(|e| match e {
            MergeTreeError::CorruptedMetadata { detail, .. } => self.corrupted(detail),
            other => other,
        })?;
        self.position += before - cursor.len();
        Ok(field)
    }

    fn read_next_block(&mut self) -> Result<()> {
        if self.next_frame_offset >= self.file_size {
            return Err(self.corrupted("read past end of stream".into()));
        }
        let io = |path: &PathBuf| {
            let path = path.clone();
            move |e| MergeTreeError::io(path, e)
        };
        self.file
            .seek(SeekFrom::Start(self.next_frame_offset))
            .map_err(io(&self.path))?;

        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        self.file.read_exact(&mut header).map_err(io(&self.path))?;
        let stored_checksum = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let tag = header[8];
        let compressed_size = u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize;
        let raw_size = u32::from_le_bytes(header[13..17].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; compressed_size];
        self.file.read_exact(&mut payload).map_err(io(&self.path))?;

        let mut framed = Vec::with_capacity(9 + payload.len());
        framed.extend_from_slice(&header[8..]);
        framed.extend_from_slice(&payload);
        let actual = crate::checksums::hash_bytes(&framed);
        if actual != stored_checksum {
            return Err(MergeTreeError::ChecksumMismatch {
                part: self.part_name.clone(),
                detail: format!(
                    "block at offset {} in {}: {actual:016x} != {stored_checksum:016x}",
                    self.next_frame_offset,
                    self.path.display()
                ),
            });
        }
        if tag != self.codec.tag() {
            return Err(self.corrupted(format!("codec tag {tag} does not match reader codec")));
        }

        self.buffer = self.codec.decompress(&payload, raw_size)?;
        self.position = 0;
        self.next_frame_offset += BLOCK_HEADER_SIZE + compressed_size as u64;
        Ok(())
    }

    fn corrupted(&self, detail: String) -> MergeTreeError {
        MergeTreeError::CorruptedMetadata {
            part: self.part_name.clone(),
            detail: format!("{}: {detail}", self.path.display()),
        }
    }
}

fn unsigned(value: &Field) -> Option<u64> {
    match value {
        Field::UInt64(v) => Some(*v),
        _ => None,
    }
}

fn signed(value: &Field) -> Option<i64> {
    match value {
        Field::Int64(v) => Some(*v),
        _ => None,
    }
}
