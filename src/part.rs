//! One immutable on-disk part.
//!
//! A [`DataPart`] is the loaded form of a part directory: parsed name,
//! column list, checksums, sparse index, row count, and the bookkeeping
//! the registry needs (modification time, remove time). The payload of a
//! part never changes after commit; the only mutable pieces are its
//! visibility bookkeeping and — under the per-part columns lock — the
//! metadata an ALTER rewrites.
//!
//! Parts are shared: the registry holds strong references, queries clone
//! them for their lifetime. `Arc`'s reference count doubles as the
//! "uniquely held" test during garbage collection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::checksums::{CHECKSUMS_FILE_NAME, Checksums, VerifyMode};
use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::marks::{self, PRIMARY_INDEX_FILE_NAME};
use crate::part_name::PartInfo;
use crate::types::{ColumnDescription, escape_for_file_name, parse_columns};
use crate::writer::FinishedPart;

/// Name of the column-list document inside a part directory.
pub const COLUMNS_FILE_NAME: &str = "columns.txt";

/// Name of the row-count document inside a part directory.
pub const COUNT_FILE_NAME: &str = "count.txt";

/// Metadata an ALTER may rewrite, guarded by the part's columns lock.
#[derive(Debug, Clone)]
pub struct PartMeta {
    pub columns: Vec<ColumnDescription>,
    /// Optional on disk; required for full integrity verification.
    pub checksums: Option<Checksums>,
    pub size_in_bytes: u64,
}

/// A loaded immutable part.
#[derive(Debug)]
pub struct DataPart {
    info: PartInfo,
    /// The table directory this part's directory lives in.
    table_dir: PathBuf,
    /// Columns + checksums, rewritten in place by ALTER. Queries hold the
    /// read side for their duration; `alter` holds the write side.
    meta: RwLock<PartMeta>,
    /// Primary-key tuple of the first row of each granule.
    index: Vec<Vec<Field>>,
    rows: u64,
    marks_count: usize,
    modification_time: SystemTime,
    /// Seconds since the epoch when the part became obsolete; 0 = active.
    remove_time: AtomicU64,
}

impl DataPart {
    /// Load a part directory. `key_size` is the width of the primary key
    /// (how many fields each `primary.idx` tuple carries).
    pub fn load(table_dir: &Path, dir_name: &str, key_size: usize) -> Result<DataPart> {
        let info = PartInfo::parse(dir_name)
            .ok_or_else(|| MergeTreeError::InvalidName(dir_name.into()))?;
        let part_dir = table_dir.join(dir_name);
        let with_part = |e: MergeTreeError| match e {
            MergeTreeError::CorruptedMetadata { detail, .. } => MergeTreeError::CorruptedMetadata {
                part: dir_name.into(),
                detail,
            },
            other => other,
        };

        // A metadata file that is absent is damage to this part, not an
        // environmental failure: it must classify as broken.
        let read_required = |file: &str| -> Result<String> {
            let path = part_dir.join(file);
            fs::read_to_string(&path).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MergeTreeError::MissingFile {
                        part: dir_name.into(),
                        file: file.into(),
                    }
                } else {
                    MergeTreeError::io(path, e)
                }
            })
        };

        let columns = parse_columns(&read_required(COLUMNS_FILE_NAME)?).map_err(with_part)?;

        let rows: u64 = read_required(COUNT_FILE_NAME)?
            .trim()
            .parse()
            .map_err(|_| MergeTreeError::CorruptedMetadata {
                part: dir_name.into(),
                detail: "count.txt is not a number".into(),
            })?;

        let checksums = Checksums::read_from(&part_dir).map_err(with_part)?;

        let index = if key_size > 0 {
            let index_path = part_dir.join(PRIMARY_INDEX_FILE_NAME);
            if !index_path.exists() {
                return Err(MergeTreeError::MissingFile {
                    part: dir_name.into(),
                    file: PRIMARY_INDEX_FILE_NAME.into(),
                });
            }
            marks::read_index(&index_path, key_size, dir_name)?
        } else {
            Vec::new()
        };
        let marks_count = if key_size > 0 {
            index.len()
        } else {
            marks_count_from_any_column(&part_dir, &columns, dir_name)?
        };

        let size_in_bytes = match &checksums {
            Some(c) => c.total_size(),
            None => directory_size(&part_dir)?,
        };
        let modification_time = fs::metadata(&part_dir)
            .and_then(|m| m.modified())
            .unwrap_or(UNIX_EPOCH);

        Ok(DataPart {
            info,
            table_dir: table_dir.to_path_buf(),
            meta: RwLock::new(PartMeta {
                columns,
                checksums,
                size_in_bytes,
            }),
            index,
            rows,
            marks_count,
            modification_time,
            remove_time: AtomicU64::new(0),
        })
    }

    /// Build a part from a writer's output without re-reading the
    /// directory. Used right after an insert or merge finishes its temp
    /// directory.
    pub fn from_finished(
        table_dir: &Path,
        info: PartInfo,
        columns: Vec<ColumnDescription>,
        finished: FinishedPart,
    ) -> DataPart {
        let size_in_bytes = finished.checksums.total_size();
        DataPart {
            info,
            table_dir: table_dir.to_path_buf(),
            meta: RwLock::new(PartMeta {
                columns,
                checksums: Some(finished.checksums),
                size_in_bytes,
            }),
            index: finished.index,
            rows: finished.rows,
            marks_count: finished.marks_count,
            modification_time: SystemTime::now(),
            remove_time: AtomicU64::new(0),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn info(&self) -> &PartInfo {
        &self.info
    }

    pub fn name(&self) -> String {
        self.info.name()
    }

    pub fn partition_id(&self) -> u32 {
        self.info.partition_id()
    }

    /// Absolute directory of this part.
    pub fn path(&self) -> PathBuf {
        self.table_dir.join(self.info.name())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn marks_count(&self) -> usize {
        self.marks_count
    }

    /// The sparse index: one key tuple per granule.
    pub fn index(&self) -> &[Vec<Field>] {
        &self.index
    }

    pub fn modification_time(&self) -> SystemTime {
        self.modification_time
    }

    pub fn columns(&self) -> Vec<ColumnDescription> {
        self.meta.read().expect("columns lock poisoned").columns.clone()
    }

    pub fn checksums(&self) -> Option<Checksums> {
        self.meta.read().expect("columns lock poisoned").checksums.clone()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.meta.read().expect("columns lock poisoned").size_in_bytes
    }

    /// Bytes attributable to one column, from the checksum document.
    pub fn column_size_in_bytes(&self, column: &str) -> u64 {
        let meta = self.meta.read().expect("columns lock poisoned");
        let Some(checksums) = &meta.checksums else {
            return 0;
        };
        let stem = escape_for_file_name(column);
        checksums
            .iter()
            .filter(|(file, _)| {
                file.as_str() == format!("{stem}.bin")
                    || file.as_str() == format!("{stem}.mrk")
                    || file.as_str() == format!("{stem}.size0.bin")
                    || file.as_str() == format!("{stem}.size0.mrk")
            })
            .map(|(_, c)| c.size)
            .sum()
    }

    /// Write access to the ALTER-mutable metadata. Held across the whole
    /// alter commit so readers never observe a half-renamed file set.
    pub(crate) fn meta_for_alter(&self) -> std::sync::RwLockWriteGuard<'_, PartMeta> {
        self.meta.write().expect("columns lock poisoned")
    }

    // ── Obsolescence bookkeeping ─────────────────────────────────────────

    /// Mark the part obsolete as of now.
    pub fn set_remove_time_now(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .max(1);
        self.remove_time.store(now, Ordering::SeqCst);
    }

    /// Make the part visible again (rollback, covering-sequence restore).
    pub fn clear_remove_time(&self) {
        self.remove_time.store(0, Ordering::SeqCst);
    }

    /// Epoch seconds at which the part became obsolete, if it has.
    pub fn remove_time(&self) -> Option<u64> {
        match self.remove_time.load(Ordering::SeqCst) {
            0 => None,
            t => Some(t),
        }
    }

    // ── Integrity ────────────────────────────────────────────────────────

    /// Verify the part against its on-disk files.
    ///
    /// With a checksum document present the file set must match exactly
    /// and every file must pass the requested strictness. Without one,
    /// verification degrades to existence and `.bin`/`.mrk` pairing —
    /// unless `require_part_metadata` insists the document be there.
    pub fn check_not_broken(&self, require_part_metadata: bool, mode: VerifyMode) -> Result<()> {
        let name = self.name();
        let dir = self.path();
        let meta = self.meta.read().expect("columns lock poisoned");

        match &meta.checksums {
            Some(checksums) => {
                checksums.verify(&dir, &name, mode)?;
                if let Some(file) = checksums.unexpected_files(&dir)?.first() {
                    return Err(MergeTreeError::UnexpectedFile {
                        part: name,
                        file: file.clone(),
                    });
                }
                Ok(())
            }
            None if require_part_metadata => Err(MergeTreeError::CorruptedMetadata {
                part: name,
                detail: format!("{CHECKSUMS_FILE_NAME} is required but absent"),
            }),
            None => {
                warn!("part {name} has no {CHECKSUMS_FILE_NAME}; existence checks only");
                for column in &meta.columns {
                    let stem = escape_for_file_name(&column.name);
                    for file in [format!("{stem}.bin"), format!("{stem}.mrk")] {
                        if !dir.join(&file).exists() {
                            return Err(MergeTreeError::MissingFile {
                                part: name,
                                file,
                            });
                        }
                    }
                }
                if !self.index.is_empty() && !dir.join(PRIMARY_INDEX_FILE_NAME).exists() {
                    return Err(MergeTreeError::MissingFile {
                        part: name,
                        file: PRIMARY_INDEX_FILE_NAME.into(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// What to do with a part that failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenPartAction {
    /// Delete it outright.
    Remove,
    /// Quarantine it under `detached/` for manual resolution.
    Detach,
}

/// Decide the fate of a broken part.
///
/// A level-0 part holds nothing that is not re-insertable, and a merged
/// part whose inputs are all still present (two or more covering parts)
/// can be reproduced by re-merging. An orphan merge result cannot, so it
/// is quarantined instead of dropped.
pub fn classify_broken(info: &PartInfo, covering_parts: usize) -> BrokenPartAction {
    if info.level == 0 || covering_parts >= 2 {
        BrokenPartAction::Remove
    } else {
        BrokenPartAction::Detach
    }
}

fn marks_count_from_any_column(
    part_dir: &Path,
    columns: &[ColumnDescription],
    part_name: &str,
) -> Result<usize> {
    let Some(first) = columns.first() else {
        return Ok(0);
    };
    let stem = escape_for_file_name(&first.name);
    let path = part_dir.join(format!("{stem}.mrk"));
    Ok(marks::read_marks(&path, part_name)?.len())
}

fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let entries = fs::read_dir(dir).map_err(|e| MergeTreeError::io(dir.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| MergeTreeError::io(dir.to_path_buf(), e))?;
        let metadata = entry
            .metadata()
            .map_err(|e| MergeTreeError::io(entry.path(), e))?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, PassthroughCodec};
    use crate::types::DataType;
    use crate::writer::PartWriter;

    /// Write a small two-column part and return its table dir.
    fn write_part(table_dir: &Path, name: &str, rows: u64) -> FinishedPart {
        let part_dir = table_dir.join(name);
        fs::create_dir_all(&part_dir).unwrap();
        let codec = PassthroughCodec;
        let columns = vec![
            ColumnDescription::new("date", DataType::Date),
            ColumnDescription::new("user_id", DataType::UInt64),
        ];
        let key = vec!["date".to_string(), "user_id".to_string()];
        let mut writer = PartWriter::new(&part_dir, &columns, &key, 3, &codec).unwrap();
        let mut block = Block::new();
        block
            .add_column(
                ColumnDescription::new("date", DataType::Date),
                (0..rows).map(|_| Field::UInt64(19_783)).collect(),
            )
            .unwrap();
        block
            .add_column(
                ColumnDescription::new("user_id", DataType::UInt64),
                (0..rows).map(Field::UInt64).collect(),
            )
            .unwrap();
        writer.write_block(&block).unwrap();
        writer.finalize().unwrap()
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        let finished = write_part(dir.path(), name, 7);

        let part = DataPart::load(dir.path(), name, 2).unwrap();
        assert_eq!(part.name(), name);
        assert_eq!(part.rows(), 7);
        assert_eq!(part.marks_count(), finished.marks_count);
        assert_eq!(part.index(), finished.index.as_slice());
        assert_eq!(part.columns().len(), 2);
        assert!(part.size_in_bytes() > 0);
        assert!(part.remove_time().is_none());

        part.check_not_broken(true, VerifyMode::FullHash).unwrap();
    }

    #[test]
    fn test_truncated_column_detected() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        write_part(dir.path(), name, 7);

        // Truncate user_id.bin.
        let victim = dir.path().join(name).join("user_id.bin");
        let bytes = fs::read(&victim).unwrap();
        fs::write(&victim, &bytes[..bytes.len() - 1]).unwrap();

        let part = DataPart::load(dir.path(), name, 2).unwrap();
        let err = part
            .check_not_broken(true, VerifyMode::SizesOnly)
            .unwrap_err();
        assert!(err.marks_part_broken());
    }

    #[test]
    fn test_unexpected_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        write_part(dir.path(), name, 3);
        fs::write(dir.path().join(name).join("stray.bin"), b"x").unwrap();

        let part = DataPart::load(dir.path(), name, 2).unwrap();
        let err = part
            .check_not_broken(true, VerifyMode::SizesOnly)
            .unwrap_err();
        assert!(matches!(err, MergeTreeError::UnexpectedFile { .. }));
    }

    #[test]
    fn test_missing_checksums_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        write_part(dir.path(), name, 3);
        fs::remove_file(dir.path().join(name).join("checksums.txt")).unwrap();

        let part = DataPart::load(dir.path(), name, 2).unwrap();
        // Required: an error. Not required: existence checks pass.
        assert!(part.check_not_broken(true, VerifyMode::FullHash).is_err());
        part.check_not_broken(false, VerifyMode::FullHash).unwrap();
    }

    #[test]
    fn test_column_size_accounting_input() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        write_part(dir.path(), name, 7);
        let part = DataPart::load(dir.path(), name, 2).unwrap();
        let user_id = part.column_size_in_bytes("user_id");
        let date = part.column_size_in_bytes("date");
        assert!(user_id > 0 && date > 0);
        assert!(user_id + date < part.size_in_bytes()); // index etc. remain
        assert_eq!(part.column_size_in_bytes("absent"), 0);
    }

    #[test]
    fn test_broken_classification() {
        let level0 = PartInfo::parse("20240301_20240301_1_1_0").unwrap();
        let merged = PartInfo::parse("20240301_20240331_1_5_1").unwrap();
        assert_eq!(classify_broken(&level0, 0), BrokenPartAction::Remove);
        assert_eq!(classify_broken(&merged, 2), BrokenPartAction::Remove);
        assert_eq!(classify_broken(&merged, 1), BrokenPartAction::Detach);
        assert_eq!(classify_broken(&merged, 0), BrokenPartAction::Detach);
    }

    #[test]
    fn test_remove_time() {
        let dir = tempfile::tempdir().unwrap();
        let name = "20240301_20240301_1_1_0";
        write_part(dir.path(), name, 1);
        let part = DataPart::load(dir.path(), name, 2).unwrap();
        assert!(part.remove_time().is_none());
        part.set_remove_time_now();
        assert!(part.remove_time().is_some());
    }
}
