//! Reading a part back as a stream of blocks.
//!
//! A [`PartReader`] streams the rows of selected granules of one part,
//! one granule per `read()`. Which granules to visit comes from the mark
//! ranges the primary-key condition left alive; a reader over
//! `[0, marks_count)` yields the whole part in key order.

use std::sync::Arc;

use crate::block::{Block, BlockInputStream, CompressionCodec};
use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::marks::{self, Mark};
use crate::part::DataPart;
use crate::stream::CompressedStreamReader;
use crate::types::{ColumnDescription, DataType, escape_for_file_name};

/// A half-open range of marks (granules) within one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkRange {
    pub begin: usize,
    pub end: usize,
}

impl MarkRange {
    pub fn whole_part(part: &DataPart) -> Vec<MarkRange> {
        if part.marks_count() == 0 {
            Vec::new()
        } else {
            vec![MarkRange {
                begin: 0,
                end: part.marks_count(),
            }]
        }
    }
}

struct ColumnReader<'a> {
    description: ColumnDescription,
    data: CompressedStreamReader<'a>,
    data_marks: Vec<Mark>,
    sizes: Option<(CompressedStreamReader<'a>, Vec<Mark>)>,
}

impl<'a> std::fmt::Debug for ColumnReader<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnReader")
            .field("description", &self.description)
            .field("data_marks", &self.data_marks)
            .finish_non_exhaustive()
    }
}

/// Pull-based reader over the granules of one part.
pub struct PartReader<'a> {
    part: Arc<DataPart>,
    columns: Vec<ColumnDescription>,
    codec: &'a dyn CompressionCodec,
    index_granularity: usize,
    ranges: Vec<MarkRange>,
    readers: Vec<ColumnReader<'a>>,
    current_range: usize,
    current_mark: usize,
    need_seek: bool,
}

impl<'a> std::fmt::Debug for PartReader<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartReader")
            .field("columns", &self.columns)
            .field("index_granularity", &self.index_granularity)
            .field("ranges", &self.ranges)
            .field("current_range", &self.current_range)
            .field("current_mark", &self.current_mark)
            .field("need_seek", &self.need_seek)
            .finish_non_exhaustive()
    }
}

impl<'a> PartReader<'a> {
    /// `columns` selects what to read; every name must exist in the part.
    pub fn new(
        part: Arc<DataPart>,
        columns: Vec<ColumnDescription>,
        ranges: Vec<MarkRange>,
        index_granularity: usize,
        codec: &'a dyn CompressionCodec,
    ) -> Result<Self> {
        let part_columns = part.columns();
        for requested in &columns {
            let found = part_columns
                .iter()
                .find(|c| c.name == requested.name)
                .ok_or_else(|| MergeTreeError::MissingColumn(requested.name.clone()))?;
            if found.data_type != requested.data_type {
                return Err(MergeTreeError::TypeMismatch {
                    column: requested.name.clone(),
                    expected: requested.data_type.to_string(),
                    found: found.data_type.to_string(),
                });
            }
        }
        let first_mark = ranges.first().map(|r| r.begin);
        Ok(Self {
            part,
            columns,
            codec,
            index_granularity,
            ranges,
            readers: Vec::new(),
            current_range: 0,
            current_mark: first_mark.unwrap_or(0),
            need_seek: true,
        })
    }

    fn rows_in_granule(&self, mark: usize) -> usize {
        let begin = mark as u64 * self.index_granularity as u64;
        let end = ((mark as u64 + 1) * self.index_granularity as u64).min(self.part.rows());
        (end - begin) as usize
    }

    fn open_streams(&mut self) -> Result<()> {
        let dir = self.part.path();
        let part_name = self.part.name();
        for description in &self.columns {
            let stem = escape_for_file_name(&description.name);
            let data = CompressedStreamReader::open(
                &dir.join(format!("{stem}.bin")),
                self.codec,
                &part_name,
            )?;
            let data_marks = marks::read_marks(&dir.join(format!("{stem}.mrk")), &part_name)?;
            let sizes = if description.data_type.is_array() {
                let reader = CompressedStreamReader::open(
                    &dir.join(format!("{stem}.size0.bin")),
                    self.codec,
                    &part_name,
                )?;
                let size_marks =
                    marks::read_marks(&dir.join(format!("{stem}.size0.mrk")), &part_name)?;
                Some((reader, size_marks))
            } else {
                None
            };
            self.readers.push(ColumnReader {
                description: description.clone(),
                data,
                data_marks,
                sizes,
            });
        }
        Ok(())
    }

    fn seek_all(&mut self, mark: usize) -> Result<()> {
        let part_name = self.part.name();
        for reader in &mut self.readers {
            let data_mark = *reader.data_marks.get(mark).ok_or_else(|| {
                MergeTreeError::CorruptedMetadata {
                    part: part_name.clone(),
                    detail: format!(
                        "mark {mark} out of range for column {}",
                        reader.description.name
                    ),
                }
            })?;
            reader.data.seek_to_mark(data_mark)?;
            if let Some((sizes, size_marks)) = &mut reader.sizes {
                let size_mark = *size_marks.get(mark).ok_or_else(|| {
                    MergeTreeError::CorruptedMetadata {
                        part: part_name.clone(),
                        detail: format!(
                            "size mark {mark} out of range for column {}",
                            reader.description.name
                        ),
                    }
                })?;
                sizes.seek_to_mark(size_mark)?;
            }
        }
        Ok(())
    }
}

impl BlockInputStream for PartReader<'_> {
    fn read_prefix(&mut self) -> Result<()> {
        if self.readers.is_empty() && !self.columns.is_empty() && !self.ranges.is_empty() {
            self.open_streams()?;
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.current_range >= self.ranges.len() {
            return Ok(None);
        }
        if self.readers.is_empty() {
            self.read_prefix()?;
        }
        if self.need_seek {
            self.seek_all(self.current_mark)?;
            self.need_seek = false;
        }

        let rows = self.rows_in_granule(self.current_mark);
        let mut block = Block::new();
        for idx in 0..self.readers.len() {
            let reader = &mut self.readers[idx];
            let mut values = Vec::with_capacity(rows);
            for _ in 0..rows {
                values.push(read_cell(reader)?);
            }
            let description = reader.description.clone();
            block.add_column(description, values)?;
        }

        self.current_mark += 1;
        if self.current_mark >= self.ranges[self.current_range].end {
            self.current_range += 1;
            if let Some(range) = self.ranges.get(self.current_range) {
                self.current_mark = range.begin;
            }
            self.need_seek = true;
        }
        Ok(Some(block))
    }
}

fn read_cell(reader: &mut ColumnReader<'_>) -> Result<Field> {
    match &reader.description.data_type {
        DataType::Array(inner) => {
            let (sizes, _) = reader
                .sizes
                .as_mut()
                .expect("array column always has a size stream");
            let len = match sizes.read_value(&DataType::UInt64)? {
                Field::UInt64(n) => n as usize,
                _ => unreachable!("size stream is UInt64"),
            };
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(reader.data.read_value(inner)?);
            }
            Ok(Field::Array(items))
        }
        data_type => reader.data.read_value(data_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PassthroughCodec;
    use crate::writer::PartWriter;

    fn build_part(dir: &std::path::Path, rows: u64, granularity: usize) -> Arc<DataPart> {
        let name = "20240301_20240301_1_1_0";
        let part_dir = dir.join(name);
        std::fs::create_dir_all(&part_dir).unwrap();
        let codec = PassthroughCodec;
        let columns = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("word", DataType::String),
            ColumnDescription::new("tags", DataType::Array(Box::new(DataType::UInt32))),
        ];
        let key = vec!["id".to_string()];
        let mut writer = PartWriter::new(&part_dir, &columns, &key, granularity, &codec).unwrap();
        let mut block = Block::new();
        block
            .add_column(
                ColumnDescription::new("id", DataType::UInt64),
                (0..rows).map(Field::UInt64).collect(),
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new("word", DataType::String),
                (0..rows).map(|i| Field::from(format!("w{i}").as_str())).collect(),
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new("tags", DataType::Array(Box::new(DataType::UInt32))),
                (0..rows)
                    .map(|i| Field::Array((0..(i % 4)).map(Field::UInt64).collect()))
                    .collect(),
            )
            .unwrap();
        writer.write_block(&block).unwrap();
        writer.finalize().unwrap();
        Arc::new(DataPart::load(dir, name, 1).unwrap())
    }

    #[test]
    fn test_read_whole_part() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 10, 4);
        let codec = PassthroughCodec;

        let mut reader = PartReader::new(
            part.clone(),
            part.columns(),
            MarkRange::whole_part(&part),
            4,
            &codec,
        )
        .unwrap();
        reader.read_prefix().unwrap();

        let mut ids = Vec::new();
        let mut granules = 0;
        while let Some(block) = reader.read().unwrap() {
            granules += 1;
            ids.extend(block.column_values("id").unwrap().to_vec());
        }
        assert_eq!(granules, 3); // 4 + 4 + 2 rows
        assert_eq!(ids, (0..10).map(Field::UInt64).collect::<Vec<_>>());
    }

    #[test]
    fn test_read_single_range() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 10, 4);
        let codec = PassthroughCodec;

        // Only the middle granule: rows 4..8.
        let mut reader = PartReader::new(
            part.clone(),
            vec![ColumnDescription::new("id", DataType::UInt64)],
            vec![MarkRange { begin: 1, end: 2 }],
            4,
            &codec,
        )
        .unwrap();
        let block = reader.read().unwrap().unwrap();
        assert_eq!(
            block.column_values("id").unwrap(),
            &(4..8).map(Field::UInt64).collect::<Vec<_>>()[..]
        );
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_arrays_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 8, 3);
        let codec = PassthroughCodec;

        let mut reader = PartReader::new(
            part.clone(),
            part.columns(),
            MarkRange::whole_part(&part),
            3,
            &codec,
        )
        .unwrap();
        let mut tags = Vec::new();
        while let Some(block) = reader.read().unwrap() {
            tags.extend(block.column_values("tags").unwrap().to_vec());
        }
        assert_eq!(tags[0], Field::Array(vec![]));
        assert_eq!(tags[3], Field::Array(vec![Field::UInt64(0), Field::UInt64(1), Field::UInt64(2)]));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 4, 4);
        let codec = PassthroughCodec;
        let err = PartReader::new(
            part.clone(),
            vec![ColumnDescription::new("absent", DataType::UInt64)],
            MarkRange::whole_part(&part),
            4,
            &codec,
        )
        .unwrap_err();
        assert!(matches!(err, MergeTreeError::MissingColumn(_)));
    }
}
