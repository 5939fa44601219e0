//! Writing a part directory from a stream of blocks.
//!
//! A [`PartWriter`] is pointed at an (empty) temporary directory and fed
//! sorted blocks. It cuts a mark every `index_granularity` rows across all
//! column streams simultaneously, materializes the primary-key tuple of
//! each granule's first row into the sparse index, and accumulates file
//! checksums as it goes. `finalize` writes the metadata files; the caller
//! renames the directory into place (or abandons it for the reaper).

use std::path::{Path, PathBuf};

use crate::block::{Block, CompressionCodec};
use crate::checksums::{Checksums, hash_bytes};
use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::marks::{self, PRIMARY_INDEX_FILE_NAME};
use crate::part::{COLUMNS_FILE_NAME, COUNT_FILE_NAME};
use crate::stream::{CompressedStreamWriter, DEFAULT_BLOCK_SIZE};
use crate::types::{ColumnDescription, DataType, escape_for_file_name, format_columns};

/// Everything `finalize` leaves behind, for the caller to fold into a
/// loaded part without re-reading the directory.
#[derive(Debug)]
pub struct FinishedPart {
    pub checksums: Checksums,
    pub index: Vec<Vec<Field>>,
    pub marks_count: usize,
    pub rows: u64,
}

struct ColumnStreams<'a> {
    description: ColumnDescription,
    stem: String,
    data: CompressedStreamWriter<'a>,
    /// `.size0` stream for array columns.
    sizes: Option<CompressedStreamWriter<'a>>,
}

/// Streams sorted blocks into an on-disk part layout.
pub struct PartWriter<'a> {
    dir: PathBuf,
    key_columns: Vec<String>,
    index_granularity: usize,
    streams: Vec<ColumnStreams<'a>>,
    index: Vec<Vec<Field>>,
    rows_written: u64,
    rows_since_mark: usize,
}

impl<'a> PartWriter<'a> {
    pub fn new(
        dir: &Path,
        columns: &[ColumnDescription],
        key_columns: &[String],
        index_granularity: usize,
        codec: &'a dyn CompressionCodec,
    ) -> Result<Self> {
        let mut streams = Vec::with_capacity(columns.len());
        for description in columns {
            let stem = escape_for_file_name(&description.name);
            let data = CompressedStreamWriter::create(
                &dir.join(format!("{stem}.bin")),
                codec,
                DEFAULT_BLOCK_SIZE,
            )?;
            let sizes = if description.data_type.is_array() {
                Some(CompressedStreamWriter::create(
                    &dir.join(format!("{stem}.size0.bin")),
                    codec,
                    DEFAULT_BLOCK_SIZE,
                )?)
            } else {
                None
            };
            streams.push(ColumnStreams {
                description: description.clone(),
                stem,
                data,
                sizes,
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            key_columns: key_columns.to_vec(),
            index_granularity,
            streams,
            index: Vec::new(),
            rows_written: 0,
            rows_since_mark: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Append one block. Rows must already be sorted by the primary key
    /// and the block must carry every part column.
    pub fn write_block(&mut self, block: &Block) -> Result<()> {
        let mut column_values: Vec<&[Field]> = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            column_values.push(block.column_values(&stream.description.name)?);
        }

        for row in 0..block.num_rows() {
            if self.rows_since_mark == 0 {
                for stream in &mut self.streams {
                    stream.data.cut_mark();
                    if let Some(sizes) = &mut stream.sizes {
                        sizes.cut_mark();
                    }
                }
                self.index.push(block.key_tuple(row, &self.key_columns)?);
            }

            for (stream, values) in self.streams.iter_mut().zip(&column_values) {
                write_cell(stream, &values[row])?;
            }

            self.rows_written += 1;
            self.rows_since_mark += 1;
            if self.rows_since_mark == self.index_granularity {
                self.rows_since_mark = 0;
            }

            for stream in &mut self.streams {
                stream.data.maybe_flush()?;
                if let Some(sizes) = &mut stream.sizes {
                    sizes.maybe_flush()?;
                }
            }
        }
        Ok(())
    }

    /// Flush streams and write mark files, the sparse index, the row
    /// count, the column list, and the checksum document.
    pub fn finalize(self) -> Result<FinishedPart> {
        let mut checksums = Checksums::new();
        let columns: Vec<ColumnDescription> = self
            .streams
            .iter()
            .map(|s| s.description.clone())
            .collect();

        let mut marks_count = None;
        for stream in self.streams {
            let stem = stream.stem;
            let (data_marks, data_checksum) = stream.data.finalize()?;
            match marks_count {
                None => marks_count = Some(data_marks.len()),
                Some(count) => debug_assert_eq!(count, data_marks.len()),
            }
            let mark_bytes = marks::format_marks(&data_marks);
            let mark_file = format!("{stem}.mrk");
            write_file(&self.dir, &mark_file, &mark_bytes)?;
            checksums.insert(
                mark_file,
                crate::checksums::FileChecksum {
                    size: mark_bytes.len() as u64,
                    hash: hash_bytes(&mark_bytes),
                },
            );
            checksums.insert(format!("{stem}.bin"), data_checksum);

            if let Some(sizes) = stream.sizes {
                let (size_marks, size_checksum) = sizes.finalize()?;
                let mark_bytes = marks::format_marks(&size_marks);
                let mark_file = format!("{stem}.size0.mrk");
                write_file(&self.dir, &mark_file, &mark_bytes)?;
                checksums.insert(
                    mark_file,
                    crate::checksums::FileChecksum {
                        size: mark_bytes.len() as u64,
                        hash: hash_bytes(&mark_bytes),
                    },
                );
                checksums.insert(format!("{stem}.size0.bin"), size_checksum);
            }
        }

        let index_bytes = marks::format_index(&self.index);
        write_file(&self.dir, PRIMARY_INDEX_FILE_NAME, &index_bytes)?;
        checksums.insert(
            PRIMARY_INDEX_FILE_NAME,
            crate::checksums::FileChecksum {
                size: index_bytes.len() as u64,
                hash: hash_bytes(&index_bytes),
            },
        );

        let count_bytes = self.rows_written.to_string().into_bytes();
        write_file(&self.dir, COUNT_FILE_NAME, &count_bytes)?;
        checksums.insert(
            COUNT_FILE_NAME,
            crate::checksums::FileChecksum {
                size: count_bytes.len() as u64,
                hash: hash_bytes(&count_bytes),
            },
        );

        write_file(&self.dir, COLUMNS_FILE_NAME, format_columns(&columns).as_bytes())?;
        checksums.write_to(&self.dir, crate::checksums::CHECKSUMS_FILE_NAME)?;

        Ok(FinishedPart {
            checksums,
            index: self.index,
            marks_count: marks_count.unwrap_or(0),
            rows: self.rows_written,
        })
    }
}

fn write_cell(stream: &mut ColumnStreams<'_>, value: &Field) -> Result<()> {
    match (&stream.description.data_type, value) {
        (DataType::Array(inner), Field::Array(items)) => {
            let sizes = stream
                .sizes
                .as_mut()
                .expect("array column always has a size stream");
            sizes.write_value(&DataType::UInt64, &Field::UInt64(items.len() as u64))?;
            for item in items {
                stream.data.write_value(inner, item)?;
            }
            Ok(())
        }
        (DataType::Array(_), other) => Err(MergeTreeError::TypeMismatch {
            column: stream.description.name.clone(),
            expected: stream.description.data_type.to_string(),
            found: other.type_name().into(),
        }),
        (data_type, value) => stream.data.write_value(data_type, value),
    }
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let path = dir.join(name);
    std::fs::write(&path, bytes).map_err(|e| MergeTreeError::io(path, e))
}
