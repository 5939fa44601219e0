//! The per-part ALTER transaction.
//!
//! A schema change is applied to each part independently: compute what
//! files the change touches, stream the affected columns through a
//! conversion into `.tmp` staging files, then commit with a crash-safe
//! rename dance under the part's write lock. A crash at any point leaves
//! the original file set plus `.tmp`/`.tmp2` debris that the next load
//! resolves to the pre-alter or post-alter state — never a half-written
//! file under a valid name.
//!
//! Per-part scope:
//! - a dropped column deletes its `.bin`/`.mrk` (and `.size0` streams);
//! - a type change rewrites the column through a cast;
//! - an enum-to-enum change of the same width touches no data files,
//!   only the part's column metadata;
//! - an *added* column touches nothing here — parts that predate it
//!   simply do not list it.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};

use crate::block::{BlockInputStream, CompressionCodec};
use crate::checksums::{CHECKSUMS_FILE_NAME, Checksums, FileChecksum, hash_bytes};
use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::marks;
use crate::part::{COLUMNS_FILE_NAME, DataPart};
use crate::reader::{MarkRange, PartReader};
use crate::settings::MergeTreeSettings;
use crate::stream::{CompressedStreamWriter, DEFAULT_BLOCK_SIZE};
use crate::types::{ColumnDescription, DataType, escape_for_file_name, format_columns};

/// One planned file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOp {
    /// Remove an existing file.
    Delete { file: String },
    /// Rename a staged `.tmp` file over its target.
    Install { staged: String, target: String },
}

/// A prepared, uncommitted schema change for one part.
///
/// Staging files are already on disk when this exists. `commit` installs
/// them; dropping the transaction uncommitted deletes the staging files
/// and leaves the part untouched.
#[must_use = "an unprepared alter leaves staging files; commit or drop it"]
#[derive(Debug)]
pub struct AlterTransaction {
    part: Arc<DataPart>,
    ops: Vec<FileOp>,
    new_columns: Vec<ColumnDescription>,
    new_checksums: Option<Checksums>,
    committed: bool,
}

/// Plan and stage a schema change for one part.
///
/// `new_columns` is the target table schema. Returns `Ok(None)` when the
/// part needs no change (everything matches, or the change only adds
/// columns). Primary-key columns cannot be dropped or retyped.
pub fn alter_data_part(
    part: &Arc<DataPart>,
    new_columns: &[ColumnDescription],
    key_columns: &[String],
    settings: &MergeTreeSettings,
    codec: &dyn CompressionCodec,
    index_granularity: usize,
    skip_sanity_checks: bool,
) -> Result<Option<AlterTransaction>> {
    let old_columns = part.columns();
    let part_dir = part.path();
    let part_name = part.name();

    let mut ops: Vec<FileOp> = Vec::new();
    let mut conversions: Vec<(ColumnDescription, DataType)> = Vec::new();
    let mut force_update_metadata = false;
    let mut result_columns: Vec<ColumnDescription> = Vec::new();

    for old in &old_columns {
        let stem = escape_for_file_name(&old.name);
        match new_columns.iter().find(|c| c.name == old.name) {
            None => {
                if key_columns.contains(&old.name) {
                    return Err(MergeTreeError::Unsupported(format!(
                        "cannot drop primary-key column {}",
                        old.name
                    )));
                }
                ops.push(FileOp::Delete { file: format!("{stem}.bin") });
                ops.push(FileOp::Delete { file: format!("{stem}.mrk") });
                if old.data_type.is_array() {
                    ops.push(FileOp::Delete { file: format!("{stem}.size0.bin") });
                    ops.push(FileOp::Delete { file: format!("{stem}.size0.mrk") });
                }
            }
            Some(new) if new.data_type == old.data_type => {
                result_columns.push(old.clone());
            }
            Some(new) if new.data_type.same_enum_width(&old.data_type) => {
                // Same storage, new variant names: metadata-only change.
                force_update_metadata = true;
                result_columns.push(new.clone());
            }
            Some(new) => {
                if key_columns.contains(&old.name) {
                    return Err(MergeTreeError::Unsupported(format!(
                        "cannot change the type of primary-key column {}",
                        old.name
                    )));
                }
                if old.data_type.is_array() || new.data_type.is_array() {
                    return Err(MergeTreeError::Unsupported(format!(
                        "cannot convert column {} involving an array type",
                        old.name
                    )));
                }
                ops.push(FileOp::Install {
                    staged: format!("{stem}.bin.tmp"),
                    target: format!("{stem}.bin"),
                });
                ops.push(FileOp::Install {
                    staged: format!("{stem}.mrk.tmp"),
                    target: format!("{stem}.mrk"),
                });
                conversions.push((old.clone(), new.data_type.clone()));
                result_columns.push(new.clone());
            }
        }
    }

    if ops.is_empty() && !force_update_metadata {
        return Ok(None);
    }

    if !skip_sanity_checks && ops.len() > settings.max_files_to_modify_in_alter_columns {
        return Err(MergeTreeError::TooManyFilesToModify {
            part: part_name,
            count: ops.len(),
            limit: settings.max_files_to_modify_in_alter_columns,
        });
    }

    // Stage converted column files.
    let mut staged_checksums: Vec<(String, FileChecksum)> = Vec::new();
    for (old_column, new_type) in &conversions {
        let (bin, mrk) = convert_column(
            part,
            old_column,
            new_type,
            codec,
            index_granularity,
            &part_dir,
        )?;
        staged_checksums.push((format!("{}.bin", escape_for_file_name(&old_column.name)), bin));
        staged_checksums.push((format!("{}.mrk", escape_for_file_name(&old_column.name)), mrk));
    }

    // Compose the new checksum document from retained + staged entries.
    let new_checksums = match part.checksums() {
        None => None,
        Some(old) => {
            let mut checksums = old;
            for op in &ops {
                if let FileOp::Delete { file } = op {
                    checksums.remove(file);
                }
            }
            for (file, checksum) in &staged_checksums {
                checksums.insert(file.clone(), *checksum);
            }
            Some(checksums)
        }
    };

    // Stage the metadata documents; they commit through the same dance.
    let columns_text = format_columns(&result_columns);
    let staged_columns = part_dir.join(format!("{COLUMNS_FILE_NAME}.tmp"));
    std::fs::write(&staged_columns, &columns_text)
        .map_err(|e| MergeTreeError::io(staged_columns, e))?;
    ops.push(FileOp::Install {
        staged: format!("{COLUMNS_FILE_NAME}.tmp"),
        target: COLUMNS_FILE_NAME.into(),
    });
    if let Some(checksums) = &new_checksums {
        checksums.write_to(&part_dir, &format!("{CHECKSUMS_FILE_NAME}.tmp"))?;
        ops.push(FileOp::Install {
            staged: format!("{CHECKSUMS_FILE_NAME}.tmp"),
            target: CHECKSUMS_FILE_NAME.into(),
        });
    }

    info!(
        "prepared alter of part {}: {} file ops{}",
        part.name(),
        ops.len(),
        if force_update_metadata { " (metadata update)" } else { "" }
    );
    Ok(Some(AlterTransaction {
        part: part.clone(),
        ops,
        new_columns: result_columns,
        new_checksums,
        committed: false,
    }))
}

impl AlterTransaction {
    /// Files this transaction will modify (for logging and tests).
    pub fn files_to_modify(&self) -> usize {
        self.ops.len()
    }

    /// Install the staged files under the part's write lock.
    ///
    /// Three phases: rename every existing target aside to `*.tmp2`, then
    /// rename every staged file onto its target, then delete the `*.tmp2`
    /// backups. Load-time recovery inverts this: while any staged `.tmp`
    /// survives the backups are complete, so everything rolls back; once
    /// the staged files are all consumed, leftover backups just get
    /// purged. Either way a restart sees the pre-alter or post-alter file
    /// set, never a mix.
    pub fn commit(mut self) -> Result<()> {
        let part_dir = self.part.path();
        let mut meta = self.part.meta_for_alter();

        // Phase 1: move originals aside.
        for op in &self.ops {
            let target = match op {
                FileOp::Delete { file } => file,
                FileOp::Install { target, .. } => target,
            };
            let target_path = part_dir.join(target);
            if target_path.exists() {
                let tmp2 = part_dir.join(format!("{target}.tmp2"));
                std::fs::rename(&target_path, &tmp2)
                    .map_err(|e| MergeTreeError::io(tmp2, e))?;
            }
        }

        // Phase 2: install the staged files.
        for op in &self.ops {
            if let FileOp::Install { staged, target } = op {
                let staged_path = part_dir.join(staged);
                let target_path = part_dir.join(target);
                std::fs::rename(&staged_path, &target_path)
                    .map_err(|e| MergeTreeError::io(target_path, e))?;
            }
        }

        // Phase 3: purge the backups.
        for op in &self.ops {
            let target = match op {
                FileOp::Delete { file } => file,
                FileOp::Install { target, .. } => target,
            };
            let tmp2 = part_dir.join(format!("{target}.tmp2"));
            if tmp2.exists() {
                std::fs::remove_file(&tmp2).map_err(|e| MergeTreeError::io(tmp2, e))?;
            }
        }

        meta.columns = self.new_columns.clone();
        meta.size_in_bytes = match &self.new_checksums {
            Some(checksums) => checksums.total_size(),
            None => meta.size_in_bytes,
        };
        meta.checksums = self.new_checksums.take();
        drop(meta);

        info!("committed alter of part {}", self.part.name());
        self.committed = true;
        Ok(())
    }
}

impl Drop for AlterTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Rollback: the staged files go, the part stays as it was.
        let part_dir = self.part.path();
        for op in &self.ops {
            if let FileOp::Install { staged, .. } = op {
                let path = part_dir.join(staged);
                if path.exists()
                    && let Err(e) = std::fs::remove_file(&path)
                {
                    warn!("alter rollback: could not remove {}: {e}", path.display());
                }
            }
        }
        info!("rolled back alter of part {}", self.part.name());
    }
}

/// Stream one column through a cast into `.bin.tmp`/`.mrk.tmp` staging
/// files. Granule boundaries are re-cut at the same cadence, so the new
/// mark count equals the old one.
fn convert_column(
    part: &Arc<DataPart>,
    old_column: &ColumnDescription,
    new_type: &DataType,
    codec: &dyn CompressionCodec,
    index_granularity: usize,
    part_dir: &PathBuf,
) -> Result<(FileChecksum, FileChecksum)> {
    let stem = escape_for_file_name(&old_column.name);
    let bin_path = part_dir.join(format!("{stem}.bin.tmp"));
    let mut writer = CompressedStreamWriter::create(&bin_path, codec, DEFAULT_BLOCK_SIZE)?;

    let mut reader = PartReader::new(
        part.clone(),
        vec![old_column.clone()],
        MarkRange::whole_part(part),
        index_granularity,
        codec,
    )?;
    reader.read_prefix()?;

    let mut rows_since_mark = 0usize;
    while let Some(block) = reader.read()? {
        for value in block.column_values(&old_column.name)? {
            if rows_since_mark == 0 {
                writer.cut_mark();
            }
            let converted = convert_field(value, new_type).ok_or_else(|| {
                MergeTreeError::TypeMismatch {
                    column: old_column.name.clone(),
                    expected: new_type.to_string(),
                    found: value.type_name().into(),
                }
            })?;
            writer.write_value(new_type, &converted)?;
            rows_since_mark += 1;
            if rows_since_mark == index_granularity {
                rows_since_mark = 0;
            }
            writer.maybe_flush()?;
        }
    }
    reader.read_suffix()?;

    let (new_marks, bin_checksum) = writer.finalize()?;
    let mark_bytes = marks::format_marks(&new_marks);
    let mrk_path = part_dir.join(format!("{stem}.mrk.tmp"));
    std::fs::write(&mrk_path, &mark_bytes).map_err(|e| MergeTreeError::io(mrk_path, e))?;
    let mrk_checksum = FileChecksum {
        size: mark_bytes.len() as u64,
        hash: hash_bytes(&mark_bytes),
    };
    Ok((bin_checksum, mrk_checksum))
}

/// Move a value into the lane of a target type. `None` = not castable.
fn convert_field(value: &Field, target: &DataType) -> Option<Field> {
    let lane_of = |v: &Field| -> Option<Field> {
        match target {
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date
            | DataType::DateTime => Some(Field::UInt64(match v {
                Field::UInt64(x) => *x,
                Field::Int64(x) => *x as u64,
                Field::Float64(x) => *x as u64,
                _ => return None,
            })),
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Enum8(_)
            | DataType::Enum16(_) => Some(Field::Int64(match v {
                Field::UInt64(x) => *x as i64,
                Field::Int64(x) => *x,
                Field::Float64(x) => *x as i64,
                _ => return None,
            })),
            DataType::Float32 | DataType::Float64 => Some(Field::Float64(match v {
                Field::UInt64(x) => *x as f64,
                Field::Int64(x) => *x as f64,
                Field::Float64(x) => *x,
                _ => return None,
            })),
            DataType::String => Some(Field::String(v.to_string().into_bytes())),
            DataType::Array(_) => None,
        }
    };
    match value {
        Field::String(bytes) if target != &DataType::String && !target.is_array() => {
            // String to number parses decimal text.
            let text = std::str::from_utf8(bytes).ok()?;
            match target {
                DataType::Float32 | DataType::Float64 => {
                    lane_of(&Field::Float64(text.parse().ok()?))
                }
                DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::Enum8(_)
                | DataType::Enum16(_) => lane_of(&Field::Int64(text.parse().ok()?)),
                _ => lane_of(&Field::UInt64(text.parse().ok()?)),
            }
        }
        other => lane_of(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, PassthroughCodec};
    use crate::checksums::VerifyMode;
    use crate::writer::PartWriter;
    use std::path::Path;

    const GRANULARITY: usize = 3;

    fn schema() -> Vec<ColumnDescription> {
        vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("score", DataType::UInt32),
            ColumnDescription::new("note", DataType::String),
        ]
    }

    fn build_part(dir: &Path, rows: u64) -> Arc<DataPart> {
        let name = "20240301_20240301_1_1_0";
        let part_dir = dir.join(name);
        std::fs::create_dir_all(&part_dir).unwrap();
        let codec = PassthroughCodec;
        let key = vec!["id".to_string()];
        let mut writer = PartWriter::new(&part_dir, &schema(), &key, GRANULARITY, &codec).unwrap();
        let mut block = Block::new();
        block
            .add_column(
                ColumnDescription::new("id", DataType::UInt64),
                (0..rows).map(Field::UInt64).collect(),
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new("score", DataType::UInt32),
                (0..rows).map(|i| Field::UInt64(i * 10)).collect(),
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new("note", DataType::String),
                (0..rows).map(|i| Field::from(format!("n{i}").as_str())).collect(),
            )
            .unwrap();
        writer.write_block(&block).unwrap();
        writer.finalize().unwrap();
        Arc::new(DataPart::load(dir, name, 1).unwrap())
    }

    fn key() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_noop_when_schema_matches() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 5);
        let codec = PassthroughCodec;
        let txn = alter_data_part(
            &part,
            &schema(),
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap();
        assert!(txn.is_none());

        // Adding a column is also a per-part no-op.
        let mut wider = schema();
        wider.push(ColumnDescription::new("extra", DataType::UInt8));
        let txn = alter_data_part(
            &part,
            &wider,
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap();
        assert!(txn.is_none());
    }

    #[test]
    fn test_drop_column() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 5);
        let codec = PassthroughCodec;
        let new_schema = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("score", DataType::UInt32),
        ];
        let txn = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap()
        .unwrap();
        txn.commit().unwrap();

        assert!(!part.path().join("note.bin").exists());
        assert!(!part.path().join("note.mrk").exists());
        assert_eq!(part.columns().len(), 2);
        // The part still verifies cleanly after the change.
        part.check_not_broken(true, VerifyMode::FullHash).unwrap();

        // And survives a fresh load.
        let reloaded = DataPart::load(dir.path(), &part.name(), 1).unwrap();
        assert_eq!(reloaded.columns().len(), 2);
        reloaded.check_not_broken(true, VerifyMode::FullHash).unwrap();
    }

    #[test]
    fn test_type_conversion_rewrites_column() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 7);
        let codec = PassthroughCodec;
        let new_schema = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("score", DataType::Int64),
            ColumnDescription::new("note", DataType::String),
        ];
        let txn = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap()
        .unwrap();
        txn.commit().unwrap();
        part.check_not_broken(true, VerifyMode::FullHash).unwrap();

        // Read the converted column back.
        let mut reader = PartReader::new(
            part.clone(),
            vec![ColumnDescription::new("score", DataType::Int64)],
            MarkRange::whole_part(&part),
            GRANULARITY,
            &codec,
        )
        .unwrap();
        let mut values = Vec::new();
        while let Some(block) = reader.read().unwrap() {
            values.extend(block.column_values("score").unwrap().to_vec());
        }
        assert_eq!(
            values,
            (0..7).map(|i| Field::Int64(i * 10)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rollback_leaves_part_intact() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 5);
        let codec = PassthroughCodec;
        let new_schema = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("score", DataType::Int64),
            ColumnDescription::new("note", DataType::String),
        ];
        let txn = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap()
        .unwrap();
        assert!(part.path().join("score.bin.tmp").exists());
        drop(txn); // rollback

        assert!(!part.path().join("score.bin.tmp").exists());
        assert_eq!(part.columns()[1].data_type, DataType::UInt32);
        part.check_not_broken(true, VerifyMode::FullHash).unwrap();
    }

    #[test]
    fn test_enum_rename_is_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        let part_dir = dir.path().join(name);
        std::fs::create_dir_all(&part_dir).unwrap();
        let codec = PassthroughCodec;
        let old_schema = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new(
                "state",
                DataType::Enum8(vec![("new".into(), 1), ("old".into(), 2)]),
            ),
        ];
        let mut writer =
            PartWriter::new(&part_dir, &old_schema, &key(), GRANULARITY, &codec).unwrap();
        let mut block = Block::new();
        block
            .add_column(
                ColumnDescription::new("id", DataType::UInt64),
                vec![Field::UInt64(1)],
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new(
                    "state",
                    DataType::Enum8(vec![("new".into(), 1), ("old".into(), 2)]),
                ),
                vec![Field::Int64(1)],
            )
            .unwrap();
        writer.write_block(&block).unwrap();
        writer.finalize().unwrap();
        let part = Arc::new(DataPart::load(dir.path(), name, 1).unwrap());

        let bin_before = std::fs::read(part.path().join("state.bin")).unwrap();
        let new_schema = vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new(
                "state",
                DataType::Enum8(vec![("fresh".into(), 1), ("stale".into(), 2)]),
            ),
        ];
        let txn = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap()
        .unwrap();
        txn.commit().unwrap();

        // Data untouched, metadata updated.
        assert_eq!(std::fs::read(part.path().join("state.bin")).unwrap(), bin_before);
        assert_eq!(part.columns()[1].data_type.to_string(), "Enum8('fresh' = 1, 'stale' = 2)");
        part.check_not_broken(true, VerifyMode::FullHash).unwrap();
    }

    #[test]
    fn test_sanity_cap() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 5);
        let codec = PassthroughCodec;
        let settings = MergeTreeSettings {
            max_files_to_modify_in_alter_columns: 1,
            ..Default::default()
        };
        let new_schema = vec![ColumnDescription::new("id", DataType::UInt64)];
        let err = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &settings,
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, MergeTreeError::TooManyFilesToModify { .. }));

        // skip_sanity_checks bypasses the cap.
        let txn = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &settings,
            &codec,
            GRANULARITY,
            true,
        )
        .unwrap();
        assert!(txn.is_some());
    }

    #[test]
    fn test_key_column_protected() {
        let dir = tempfile::tempdir().unwrap();
        let part = build_part(dir.path(), 5);
        let codec = PassthroughCodec;
        let new_schema = vec![
            ColumnDescription::new("score", DataType::UInt32),
            ColumnDescription::new("note", DataType::String),
        ];
        let err = alter_data_part(
            &part,
            &new_schema,
            &key(),
            &MergeTreeSettings::default(),
            &codec,
            GRANULARITY,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, MergeTreeError::Unsupported(_)));
    }
}
