//! Error types for the mergetree engine.
//!
//! All failures inside the engine are represented by [`MergeTreeError`].
//! Errors are propagated via `Result<T, MergeTreeError>` throughout the
//! crate; callers embedding the engine decide how to surface them.
//!
//! # Error Classification
//!
//! Errors are classified into kinds that determine how the engine reacts:
//! - **Schema** — missing columns, type mismatches, invalid settings.
//!   Fatal for the operation; no state change.
//! - **Corruption** — checksum mismatches, missing part files. Recovery is
//!   per-part (quarantine or removal), never fatal for the engine.
//! - **Conflict** — duplicate part name at commit time. Fatal for the
//!   commit; the temp part is left for the reaper.
//! - **Backpressure** — an insert exceeded the delay ceiling.
//! - **Filesystem** — rename/read/write failures. Propagate up; the active
//!   set is only mutated once the rename making a part visible succeeded.
//! - **Cancelled** — shutdown was requested. Not a failure: a normal
//!   control return path that releases locks and leaves temp files for
//!   startup cleanup.
//!
//! A filesystem error observed while *loading* a part must not mark the
//! part broken — only evidence of on-disk damage does. The
//! [`MergeTreeError::marks_part_broken`] predicate encodes that rule.

use std::fmt;
use std::path::PathBuf;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum MergeTreeError {
    // ── Schema errors — fail the operation, touch nothing ────────────────
    /// A required column is absent from a part or block.
    #[error("missing column: {0}")]
    MissingColumn(String),

    /// A column carried an unexpected type.
    #[error("type mismatch for column {column}: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    /// A settings value was outside its permitted range.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    /// A part, partition, or column name did not have the required shape.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A feature was requested that this build does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    // ── Corruption errors — per-part recovery ────────────────────────────
    /// A file hash or size disagreed with `checksums.txt`.
    #[error("checksum mismatch in part {part}: {detail}")]
    ChecksumMismatch { part: String, detail: String },

    /// A file the part metadata promises is absent on disk.
    #[error("part {part} is missing file {file}")]
    MissingFile { part: String, file: String },

    /// A file exists on disk that the part metadata does not know about.
    #[error("part {part} has unexpected file {file}")]
    UnexpectedFile { part: String, file: String },

    /// Part metadata (`columns.txt`, `checksums.txt`, marks, index) failed
    /// to parse or was internally inconsistent.
    #[error("corrupted metadata in part {part}: {detail}")]
    CorruptedMetadata { part: String, detail: String },

    /// Too many broken parts were found during load with sanity checks on.
    #[error("suspiciously many broken parts: {count} (limit {limit})")]
    TooManyBrokenParts { count: usize, limit: usize },

    // ── Conflict errors ──────────────────────────────────────────────────
    /// A part with this exact name already exists at commit time.
    #[error("duplicate part name: {0}")]
    DuplicatePartName(String),

    /// An ALTER would touch more files than the configured sanity cap.
    #[error("alter of part {part} would modify {count} files (limit {limit})")]
    TooManyFilesToModify {
        part: String,
        count: usize,
        limit: usize,
    },

    // ── Backpressure ─────────────────────────────────────────────────────
    /// The insert delay would exceed the hard ceiling.
    #[error("too many parts ({parts} in partition {partition}); insert rejected")]
    TooManyParts { partition: u32, parts: usize },

    // ── Filesystem ───────────────────────────────────────────────────────
    /// An underlying filesystem operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Cancellation — a control path, not a failure ─────────────────────
    /// Shutdown was requested; the operation stopped at a safe boundary.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MergeTreeError>;

impl MergeTreeError {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MergeTreeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is the cancellation control path.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeTreeError::Cancelled)
    }

    /// Whether observing this error while loading a part is evidence of
    /// on-disk damage.
    ///
    /// Filesystem errors are environmental (the disk may be unmounted, the
    /// process out of descriptors) and must re-raise without condemning the
    /// part; only corruption-kind errors mark it broken.
    pub fn marks_part_broken(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}

/// Classification of an error for recovery decisions and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Corruption,
    Conflict,
    Backpressure,
    Filesystem,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Schema => write!(f, "SCHEMA"),
            ErrorKind::Corruption => write!(f, "CORRUPTION"),
            ErrorKind::Conflict => write!(f, "CONFLICT"),
            ErrorKind::Backpressure => write!(f, "BACKPRESSURE"),
            ErrorKind::Filesystem => write!(f, "FILESYSTEM"),
            ErrorKind::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl MergeTreeError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeTreeError::MissingColumn(_)
            | MergeTreeError::TypeMismatch { .. }
            | MergeTreeError::InvalidSetting { .. }
            | MergeTreeError::InvalidName(_)
            | MergeTreeError::Unsupported(_) => ErrorKind::Schema,

            MergeTreeError::ChecksumMismatch { .. }
            | MergeTreeError::MissingFile { .. }
            | MergeTreeError::UnexpectedFile { .. }
            | MergeTreeError::CorruptedMetadata { .. }
            | MergeTreeError::TooManyBrokenParts { .. } => ErrorKind::Corruption,

            MergeTreeError::DuplicatePartName(_) | MergeTreeError::TooManyFilesToModify { .. } => {
                ErrorKind::Conflict
            }

            MergeTreeError::TooManyParts { .. } => ErrorKind::Backpressure,

            MergeTreeError::Io { .. } => ErrorKind::Filesystem,

            MergeTreeError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
