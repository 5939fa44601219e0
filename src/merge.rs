//! Merge selection and execution.
//!
//! Selection picks a contiguous run of active parts inside one partition
//! whose combined size fits the configured budget; the run merges into a
//! single part named `(first.min_block, last.max_block, max(level) + 1)`,
//! which the commit protocol then atomically swaps in for its inputs.
//!
//! Execution is a k-way merge: every input part streams in primary-key
//! order, a heap yields globally ordered rows, and a [`PartWriter`]
//! produces the output in a `tmp_` directory. Inputs are never touched —
//! if anything fails (or shutdown is requested) the temp directory is
//! abandoned for the reaper and the inputs stay active.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use log::{info, warn};

use crate::block::{Block, BlockInputStream, CompressionCodec};
use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::part::DataPart;
use crate::reader::{MarkRange, PartReader};
use crate::settings::MergeTreeSettings;
use crate::types::ColumnDescription;
use crate::writer::{FinishedPart, PartWriter};

/// How rows with equal primary keys combine during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep every row.
    Ordinary,
    /// Sum numeric non-key columns of equal-key rows.
    Summing,
    /// Cancel +1/-1 sign pairs of equal-key rows.
    Collapsing,
    /// Declared for compatibility; semantics are not specified here.
    Graphite,
}

/// Rows the merge writes at a time.
const MERGE_BLOCK_ROWS: usize = 8192;

// ── Selection ──────────────────────────────────────────────────────────────

/// Pick a run of parts to merge, or `None` if nothing worthwhile exists.
///
/// `parts` must be the active snapshot in registry order. The policy
/// prefers the longest run that fits the count and byte budgets, breaking
/// ties toward fewer bytes (cheaper merges first).
pub fn select_parts_to_merge(
    parts: &[Arc<DataPart>],
    settings: &MergeTreeSettings,
) -> Option<Vec<Arc<DataPart>>> {
    let mut best: Option<(usize, u64, usize)> = None; // (len, bytes, start)
    let mut start = 0;
    while start < parts.len() {
        let partition = parts[start].partition_id();
        let mut bytes = 0u64;
        let mut end = start;
        while end < parts.len()
            && parts[end].partition_id() == partition
            && end - start < settings.max_parts_to_merge_at_once
            && bytes + parts[end].size_in_bytes() <= settings.max_bytes_to_merge_at_once
        {
            bytes += parts[end].size_in_bytes();
            end += 1;
        }
        let len = end - start;
        if len >= 2 {
            let better = match best {
                None => true,
                Some((best_len, best_bytes, _)) => {
                    len > best_len || (len == best_len && bytes < best_bytes)
                }
            };
            if better {
                best = Some((len, bytes, start));
            }
        }
        start += 1;
    }
    best.map(|(len, _, at)| parts[at..at + len].to_vec())
}

/// Name fields of the part a run of inputs merges into.
pub fn merged_part_bounds(parts: &[Arc<DataPart>]) -> (NaiveDate, NaiveDate, u64, u64, u32) {
    let left_date = parts
        .iter()
        .map(|p| p.info().left_date)
        .min()
        .expect("merge input is non-empty");
    let right_date = parts
        .iter()
        .map(|p| p.info().right_date)
        .max()
        .expect("merge input is non-empty");
    let min_block = parts[0].info().min_block;
    let max_block = parts[parts.len() - 1].info().max_block;
    let level = parts.iter().map(|p| p.info().level).max().unwrap_or(0) + 1;
    (left_date, right_date, min_block, max_block, level)
}

// ── Execution ──────────────────────────────────────────────────────────────

/// Everything a merge needs to know about the table.
pub struct MergeParams<'a> {
    pub table_dir: &'a Path,
    pub columns: &'a [ColumnDescription],
    pub key_columns: &'a [String],
    pub index_granularity: usize,
    pub codec: &'a dyn CompressionCodec,
    pub mode: MergeMode,
    /// Column holding +1/-1 for [`MergeMode::Collapsing`].
    pub sign_column: Option<&'a str>,
}

/// The finished temp directory of a merge, ready for commit.
#[derive(Debug)]
pub struct MergedOutput {
    pub temp_dir: PathBuf,
    pub finished: FinishedPart,
    pub left_date: NaiveDate,
    pub right_date: NaiveDate,
    /// `(min_block, max_block, level)` of the output name.
    pub block_range: (u64, u64, u32),
}

struct MergeSource<'a> {
    reader: PartReader<'a>,
    block: Option<Block>,
    row: usize,
}

impl MergeSource<'_> {
    fn current_key(&self, key_indices: &[usize]) -> Option<Vec<Field>> {
        let block = self.block.as_ref()?;
        let row = block.row(self.row);
        Some(key_indices.iter().map(|&i| row[i].clone()).collect())
    }

    fn take_row(&mut self) -> Result<Vec<Field>> {
        let block = self.block.as_ref().expect("take_row on exhausted source");
        let row = block.row(self.row);
        self.row += 1;
        if self.row >= block.num_rows() {
            self.block = self.reader.read()?;
            self.row = 0;
        }
        Ok(row)
    }
}

/// Merge the given parts into a new temp directory.
///
/// Polls `shutdown` between output blocks and aborts with
/// [`MergeTreeError::Cancelled`]; the partially-written temp directory is
/// left for the reaper.
pub fn execute_merge(
    params: &MergeParams<'_>,
    parts: &[Arc<DataPart>],
    shutdown: &AtomicBool,
) -> Result<MergedOutput> {
    if params.mode == MergeMode::Graphite {
        return Err(MergeTreeError::Unsupported(
            "Graphite merge mode".into(),
        ));
    }
    assert!(parts.len() >= 2, "a merge needs at least two inputs");

    let (left_date, right_date, min_block, max_block, level) = merged_part_bounds(parts);
    let result_name = crate::part_name::PartInfo {
        left_date,
        right_date,
        min_block,
        max_block,
        level,
    }
    .name();
    info!(
        "merging {} parts into {result_name}: {:?}",
        parts.len(),
        parts.iter().map(|p| p.name()).collect::<Vec<_>>()
    );

    let temp_dir = params.table_dir.join(format!("tmp_merge_{result_name}"));
    std::fs::create_dir_all(&temp_dir).map_err(|e| MergeTreeError::io(temp_dir.clone(), e))?;

    let key_indices: Vec<usize> = params
        .key_columns
        .iter()
        .map(|key| {
            params
                .columns
                .iter()
                .position(|c| c.name == *key)
                .ok_or_else(|| MergeTreeError::MissingColumn(key.clone()))
        })
        .collect::<Result<_>>()?;
    let sign_index = match (params.mode, params.sign_column) {
        (MergeMode::Collapsing, Some(name)) => Some(
            params
                .columns
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| MergeTreeError::MissingColumn(name.into()))?,
        ),
        (MergeMode::Collapsing, None) => {
            return Err(MergeTreeError::MissingColumn(
                "sign column for collapsing merge".into(),
            ));
        }
        _ => None,
    };

    let mut sources: Vec<MergeSource<'_>> = Vec::with_capacity(parts.len());
    for part in parts {
        let mut reader = PartReader::new(
            part.clone(),
            params.columns.to_vec(),
            MarkRange::whole_part(part),
            params.index_granularity,
            params.codec,
        )?;
        reader.read_prefix()?;
        let block = reader.read()?;
        sources.push(MergeSource {
            reader,
            block,
            row: 0,
        });
    }

    let mut writer = PartWriter::new(
        &temp_dir,
        params.columns,
        params.key_columns,
        params.index_granularity,
        params.codec,
    )?;

    // (key, input index): input order breaks ties so older rows stay first.
    let mut heap: BinaryHeap<Reverse<(Vec<Field>, usize)>> = BinaryHeap::new();
    for (idx, source) in sources.iter().enumerate() {
        if let Some(key) = source.current_key(&key_indices) {
            heap.push(Reverse((key, idx)));
        }
    }

    let mut combiner = RowCombiner::new(params.mode, key_indices.clone(), sign_index);
    let mut pending_rows: Vec<Vec<Field>> = Vec::with_capacity(MERGE_BLOCK_ROWS);
    while let Some(Reverse((key, idx))) = heap.pop() {
        let row = sources[idx].take_row()?;
        combiner.push(key, row, &mut pending_rows);
        if let Some(next_key) = sources[idx].current_key(&key_indices) {
            heap.push(Reverse((next_key, idx)));
        }

        if pending_rows.len() >= MERGE_BLOCK_ROWS {
            if shutdown.load(Ordering::Relaxed) {
                return Err(MergeTreeError::Cancelled);
            }
            let block = Block::from_rows(params.columns, &pending_rows)?;
            writer.write_block(&block)?;
            pending_rows.clear();
        }
    }
    combiner.finish(&mut pending_rows);
    if !pending_rows.is_empty() {
        let block = Block::from_rows(params.columns, &pending_rows)?;
        writer.write_block(&block)?;
    }

    let finished = writer.finalize()?;
    info!("merge into {result_name} produced {} rows", finished.rows);
    Ok(MergedOutput {
        temp_dir,
        finished,
        left_date,
        right_date,
        block_range: (min_block, max_block, level),
    })
}

// ── Mode-specific row combination ──────────────────────────────────────────

/// Folds the globally-ordered row stream according to the merge mode.
struct RowCombiner {
    mode: MergeMode,
    key_indices: Vec<usize>,
    sign_index: Option<usize>,
    current_key: Option<Vec<Field>>,
    /// Summing: the accumulated row of the current key group.
    summed: Option<Vec<Field>>,
    /// Collapsing state of the current key group.
    first_negative: Option<Vec<Field>>,
    last_positive: Option<Vec<Field>>,
    positive: i64,
    negative: i64,
}

impl RowCombiner {
    fn new(mode: MergeMode, key_indices: Vec<usize>, sign_index: Option<usize>) -> RowCombiner {
        RowCombiner {
            mode,
            key_indices,
            sign_index,
            current_key: None,
            summed: None,
            first_negative: None,
            last_positive: None,
            positive: 0,
            negative: 0,
        }
    }

    fn push(&mut self, key: Vec<Field>, row: Vec<Field>, out: &mut Vec<Vec<Field>>) {
        if self.mode == MergeMode::Ordinary {
            out.push(row);
            return;
        }
        if self.current_key.as_ref() != Some(&key) {
            self.flush_group(out);
            self.current_key = Some(key);
        }
        match self.mode {
            MergeMode::Ordinary | MergeMode::Graphite => unreachable!("handled above / rejected"),
            MergeMode::Summing => match &mut self.summed {
                None => self.summed = Some(row),
                Some(acc) => sum_into(acc, &row, &self.key_indices),
            },
            MergeMode::Collapsing => {
                let sign_index = self.sign_index.expect("collapsing has a sign column");
                match &row[sign_index] {
                    Field::Int64(1) => {
                        self.positive += 1;
                        self.last_positive = Some(row);
                    }
                    Field::Int64(-1) => {
                        self.negative += 1;
                        if self.first_negative.is_none() {
                            self.first_negative = Some(row);
                        }
                    }
                    other => {
                        warn!("collapsing merge: sign value {other} is not 1 or -1; row kept");
                        self.positive += 1;
                        self.last_positive = Some(row);
                    }
                }
            }
        }
    }

    fn flush_group(&mut self, out: &mut Vec<Vec<Field>>) {
        match self.mode {
            MergeMode::Ordinary | MergeMode::Graphite => {}
            MergeMode::Summing => {
                if let Some(row) = self.summed.take() {
                    out.push(row);
                }
            }
            MergeMode::Collapsing => {
                if self.positive + self.negative > 2 && (self.positive - self.negative).abs() > 1 {
                    warn!(
                        "collapsing merge: unbalanced group ({} positive, {} negative)",
                        self.positive, self.negative
                    );
                }
                match self.positive.cmp(&self.negative) {
                    std::cmp::Ordering::Greater => {
                        if let Some(row) = self.last_positive.take() {
                            out.push(row);
                        }
                    }
                    std::cmp::Ordering::Less => {
                        if let Some(row) = self.first_negative.take() {
                            out.push(row);
                        }
                    }
                    std::cmp::Ordering::Equal => {}
                }
                self.first_negative = None;
                self.last_positive = None;
                self.positive = 0;
                self.negative = 0;
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<Vec<Field>>) {
        self.flush_group(out);
    }
}

/// Add `row`'s numeric non-key cells into `acc`.
fn sum_into(acc: &mut [Field], row: &[Field], key_indices: &[usize]) {
    for (idx, cell) in row.iter().enumerate() {
        if key_indices.contains(&idx) {
            continue;
        }
        match (&mut acc[idx], cell) {
            (Field::UInt64(a), Field::UInt64(b)) => *a = a.wrapping_add(*b),
            (Field::Int64(a), Field::Int64(b)) => *a = a.wrapping_add(*b),
            (Field::Float64(a), Field::Float64(b)) => *a += *b,
            // Non-numeric columns keep the first row's value.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PassthroughCodec;
    use crate::types::DataType;

    fn part_with(
        dir: &Path,
        name: &str,
        rows: &[(u64, i64)],
        columns: &[ColumnDescription],
    ) -> Arc<DataPart> {
        let part_dir = dir.join(name);
        std::fs::create_dir_all(&part_dir).unwrap();
        let codec = PassthroughCodec;
        let key = vec!["id".to_string()];
        let mut writer = PartWriter::new(&part_dir, columns, &key, 4, &codec).unwrap();
        let mut block = Block::new();
        block
            .add_column(
                ColumnDescription::new("id", DataType::UInt64),
                rows.iter().map(|(id, _)| Field::UInt64(*id)).collect(),
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new("value", DataType::Int64),
                rows.iter().map(|(_, v)| Field::Int64(*v)).collect(),
            )
            .unwrap();
        writer.write_block(&block).unwrap();
        writer.finalize().unwrap();
        Arc::new(DataPart::load(dir, name, 1).unwrap())
    }

    fn schema() -> Vec<ColumnDescription> {
        vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("value", DataType::Int64),
        ]
    }

    fn read_rows(dir: &Path, output: &MergedOutput, columns: &[ColumnDescription]) -> Vec<(u64, i64)> {
        // Load through a part directory rename so the reader sees a part.
        let name = crate::part_name::PartInfo {
            left_date: output.left_date,
            right_date: output.right_date,
            min_block: output.block_range.0,
            max_block: output.block_range.1,
            level: output.block_range.2,
        }
        .name();
        std::fs::rename(&output.temp_dir, dir.join(&name)).unwrap();
        let part = Arc::new(DataPart::load(dir, &name, 1).unwrap());
        let codec = PassthroughCodec;
        let mut reader = PartReader::new(
            part.clone(),
            columns.to_vec(),
            MarkRange::whole_part(&part),
            4,
            &codec,
        )
        .unwrap();
        let mut rows = Vec::new();
        while let Some(block) = reader.read().unwrap() {
            let ids = block.column_values("id").unwrap();
            let values = block.column_values("value").unwrap();
            for (id, value) in ids.iter().zip(values) {
                match (id, value) {
                    (Field::UInt64(i), Field::Int64(v)) => rows.push((*i, *v)),
                    _ => unreachable!(),
                }
            }
        }
        rows
    }

    #[test]
    fn test_selection_respects_partition_and_budget() {
        let dir = tempfile::tempdir().unwrap();
        let columns = schema();
        let parts = vec![
            part_with(dir.path(), "20240301_20240301_1_1_0", &[(1, 1)], &columns),
            part_with(dir.path(), "20240302_20240302_2_2_0", &[(2, 1)], &columns),
            part_with(dir.path(), "20240401_20240401_3_3_0", &[(3, 1)], &columns),
        ];
        let settings = MergeTreeSettings::default();
        let selected = select_parts_to_merge(&parts, &settings).unwrap();
        // Only the two March parts form a run.
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].name(), "20240301_20240301_1_1_0");
        assert_eq!(selected[1].name(), "20240302_20240302_2_2_0");

        // A byte budget below any single part blocks selection entirely.
        let starved = MergeTreeSettings {
            max_bytes_to_merge_at_once: 10,
            ..Default::default()
        };
        assert!(select_parts_to_merge(&parts, &starved).is_none());

        // The count cap limits the run length.
        let capped = MergeTreeSettings {
            max_parts_to_merge_at_once: 2,
            ..Default::default()
        };
        let more = vec![
            parts[0].clone(),
            parts[1].clone(),
            part_with(dir.path(), "20240303_20240303_4_4_0", &[(4, 1)], &columns),
        ];
        assert_eq!(select_parts_to_merge(&more, &capped).unwrap().len(), 2);
    }

    #[test]
    fn test_merged_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let columns = schema();
        let parts = vec![
            part_with(dir.path(), "20240302_20240302_1_1_0", &[(1, 1)], &columns),
            part_with(dir.path(), "20240301_20240301_2_2_0", &[(2, 1)], &columns),
        ];
        let (left, right, min, max, level) = merged_part_bounds(&parts);
        assert_eq!(left.format("%Y%m%d").to_string(), "20240301");
        assert_eq!(right.format("%Y%m%d").to_string(), "20240302");
        assert_eq!((min, max, level), (1, 2, 1));
    }

    #[test]
    fn test_ordinary_merge_preserves_multiset() {
        let dir = tempfile::tempdir().unwrap();
        let columns = schema();
        let a = part_with(dir.path(), "20240301_20240301_1_1_0", &[(1, 10), (5, 50)], &columns);
        let b = part_with(dir.path(), "20240302_20240302_2_2_0", &[(2, 20), (5, 55)], &columns);
        let codec = PassthroughCodec;
        let key = vec!["id".to_string()];
        let params = MergeParams {
            table_dir: dir.path(),
            columns: &columns,
            key_columns: &key,
            index_granularity: 4,
            codec: &codec,
            mode: MergeMode::Ordinary,
            sign_column: None,
        };
        let shutdown = AtomicBool::new(false);
        let output = execute_merge(&params, &[a, b], &shutdown).unwrap();
        assert_eq!(output.block_range, (1, 2, 1));
        let rows = read_rows(dir.path(), &output, &columns);
        assert_eq!(rows, vec![(1, 10), (2, 20), (5, 50), (5, 55)]);
    }

    #[test]
    fn test_summing_merge_collapses_equal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let columns = schema();
        let a = part_with(dir.path(), "20240301_20240301_1_1_0", &[(1, 10), (2, 1)], &columns);
        let b = part_with(dir.path(), "20240302_20240302_2_2_0", &[(2, 2), (3, 30)], &columns);
        let codec = PassthroughCodec;
        let key = vec!["id".to_string()];
        let params = MergeParams {
            table_dir: dir.path(),
            columns: &columns,
            key_columns: &key,
            index_granularity: 4,
            codec: &codec,
            mode: MergeMode::Summing,
            sign_column: None,
        };
        let shutdown = AtomicBool::new(false);
        let output = execute_merge(&params, &[a, b], &shutdown).unwrap();
        let rows = read_rows(dir.path(), &output, &columns);
        assert_eq!(rows, vec![(1, 10), (2, 3), (3, 30)]);
    }

    #[test]
    fn test_collapsing_merge_cancels_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let columns = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("value", DataType::Int64),
            ColumnDescription::new("sign", DataType::Int8),
        ];
        // id 1: +1 then -1 -> gone. id 2: +1 twice -> last positive kept.
        let write = |name: &str, rows: &[(u64, i64, i64)]| {
            let part_dir = dir.path().join(name);
            std::fs::create_dir_all(&part_dir).unwrap();
            let codec = PassthroughCodec;
            let key = vec!["id".to_string()];
            let mut writer = PartWriter::new(&part_dir, &columns, &key, 4, &codec).unwrap();
            let mut block = Block::new();
            block
                .add_column(
                    ColumnDescription::new("id", DataType::UInt64),
                    rows.iter().map(|(i, _, _)| Field::UInt64(*i)).collect(),
                )
                .unwrap();
            block
                .add_column(
                    ColumnDescription::new("value", DataType::Int64),
                    rows.iter().map(|(_, v, _)| Field::Int64(*v)).collect(),
                )
                .unwrap();
            block
                .add_column(
                    ColumnDescription::new("sign", DataType::Int8),
                    rows.iter().map(|(_, _, s)| Field::Int64(*s)).collect(),
                )
                .unwrap();
            writer.write_block(&block).unwrap();
            writer.finalize().unwrap();
            Arc::new(DataPart::load(dir.path(), name, 1).unwrap())
        };
        let a = write("20240301_20240301_1_1_0", &[(1, 10, 1), (2, 20, 1)]);
        let b = write("20240302_20240302_2_2_0", &[(1, 10, -1), (2, 21, 1)]);

        let codec = PassthroughCodec;
        let key = vec!["id".to_string()];
        let params = MergeParams {
            table_dir: dir.path(),
            columns: &columns,
            key_columns: &key,
            index_granularity: 4,
            codec: &codec,
            mode: MergeMode::Collapsing,
            sign_column: Some("sign"),
        };
        let shutdown = AtomicBool::new(false);
        let output = execute_merge(&params, &[a, b], &shutdown).unwrap();
        assert_eq!(output.finished.rows, 1);

        let name = crate::part_name::PartInfo {
            left_date: output.left_date,
            right_date: output.right_date,
            min_block: 1,
            max_block: 2,
            level: 1,
        }
        .name();
        std::fs::rename(&output.temp_dir, dir.path().join(&name)).unwrap();
        let part = Arc::new(DataPart::load(dir.path(), &name, 1).unwrap());
        let mut reader = PartReader::new(
            part.clone(),
            columns.clone(),
            MarkRange::whole_part(&part),
            4,
            &codec,
        )
        .unwrap();
        let block = reader.read().unwrap().unwrap();
        assert_eq!(block.column_values("id").unwrap(), &[Field::UInt64(2)]);
        assert_eq!(block.column_values("value").unwrap(), &[Field::Int64(21)]);
    }

    #[test]
    fn test_merge_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let columns = schema();
        // Enough rows that at least one shutdown poll happens.
        let rows_a: Vec<(u64, i64)> = (0..MERGE_BLOCK_ROWS as u64 + 10).map(|i| (i * 2, 1)).collect();
        let rows_b: Vec<(u64, i64)> = (0..MERGE_BLOCK_ROWS as u64 + 10).map(|i| (i * 2 + 1, 1)).collect();
        let a = part_with(dir.path(), "20240301_20240301_1_1_0", &rows_a, &columns);
        let b = part_with(dir.path(), "20240302_20240302_2_2_0", &rows_b, &columns);
        let codec = PassthroughCodec;
        let key = vec!["id".to_string()];
        let params = MergeParams {
            table_dir: dir.path(),
            columns: &columns,
            key_columns: &key,
            index_granularity: 4,
            codec: &codec,
            mode: MergeMode::Ordinary,
            sign_column: None,
        };
        let shutdown = AtomicBool::new(true);
        let err = execute_merge(&params, &[a, b], &shutdown).unwrap_err();
        assert!(err.is_cancelled());

        let graphite = MergeParams {
            mode: MergeMode::Graphite,
            ..params
        };
        assert!(matches!(
            execute_merge(&graphite, &[], &AtomicBool::new(false)).unwrap_err(),
            MergeTreeError::Unsupported(_)
        ));
    }
}
