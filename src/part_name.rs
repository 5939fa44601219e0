//! Part names and the containment algebra over them.
//!
//! A part directory is named `YYYYMMDD_YYYYMMDD_min_max_level`:
//! the date range it covers, the block-number range assigned to its rows,
//! and the number of merges that produced it (0 = fresh insert). The name
//! is the *only* committed state of a part — everything the registry needs
//! to order, deduplicate, and supersede parts is derivable from it.
//!
//! Two relations matter:
//! - **containment** — same monthly partition and a block-range superset.
//!   A contained part is superseded by the containing one.
//! - **the registry order** — `(partition, min_block, max_block, level)`.
//!   Under this order the parts a new part could contain (or be contained
//!   by) are its immediate neighbors, so overlap resolution is a bounded
//!   scan around the insertion point.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{Datelike, NaiveDate};

use crate::error::{MergeTreeError, Result};

/// Parsed form of a part directory name.
#[derive(Debug, Clone, Copy)]
pub struct PartInfo {
    pub left_date: NaiveDate,
    pub right_date: NaiveDate,
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
}

impl PartInfo {
    /// Build an info for a fresh insert: one block number, level 0.
    pub fn new_insert(left_date: NaiveDate, right_date: NaiveDate, block: u64) -> Self {
        PartInfo {
            left_date,
            right_date,
            min_block: block,
            max_block: block,
            level: 0,
        }
    }

    /// Parse a directory name. `None` means "not a part — skip it".
    ///
    /// Rejects anything that is not exactly five `_`-separated fields,
    /// dates that do not parse or cross a month boundary, and inverted
    /// ranges. A directory carrying a prefix (`tmp_`, `broken_`, ...)
    /// therefore never parses, which is what makes prefixing a rename-out.
    pub fn parse(name: &str) -> Option<PartInfo> {
        let mut fields = name.split('_');
        let left = parse_date(fields.next()?)?;
        let right = parse_date(fields.next()?)?;
        let min_block: u64 = parse_decimal(fields.next()?)?;
        let max_block: u64 = parse_decimal(fields.next()?)?;
        let level: u32 = parse_decimal(fields.next()?)?;
        if fields.next().is_some() {
            return None;
        }
        if left > right || min_block > max_block {
            return None;
        }
        // All rows of a part belong to one monthly partition.
        if yyyymm(left) != yyyymm(right) {
            return None;
        }
        Some(PartInfo {
            left_date: left,
            right_date: right,
            min_block,
            max_block,
            level,
        })
    }

    /// Canonical directory name.
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.left_date.format("%Y%m%d"),
            self.right_date.format("%Y%m%d"),
            self.min_block,
            self.max_block,
            self.level
        )
    }

    /// The monthly partition this part belongs to, as `YYYYMM`.
    pub fn partition_id(&self) -> u32 {
        yyyymm(self.left_date)
    }

    /// Containment: same partition and a block-range superset.
    ///
    /// This is the only relation used to decide a part is obsolete.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id() == other.partition_id()
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
    }
}

/// Identity is `(partition, min_block, max_block, level)`; the exact dates
/// inside the month do not participate.
impl PartialEq for PartInfo {
    fn eq(&self, other: &Self) -> bool {
        self.partition_id() == other.partition_id()
            && self.min_block == other.min_block
            && self.max_block == other.max_block
            && self.level == other.level
    }
}

impl Eq for PartInfo {}

impl Hash for PartInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.partition_id().hash(state);
        self.min_block.hash(state);
        self.max_block.hash(state);
        self.level.hash(state);
    }
}

impl PartialOrd for PartInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.partition_id(), self.min_block, self.max_block, self.level).cmp(&(
            other.partition_id(),
            other.min_block,
            other.max_block,
            other.level,
        ))
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y%m%d").ok()
}

/// Strict decimal: digits only, no sign, no leading `+`.
fn parse_decimal<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

// ── Partition identifiers ──────────────────────────────────────────────────

/// `YYYYMM` of a date.
pub fn yyyymm(date: NaiveDate) -> u32 {
    date.year() as u32 * 100 + date.month()
}

/// `YYYYMMDD` of a date.
pub fn to_num_yyyymmdd(date: NaiveDate) -> u32 {
    date.year() as u32 * 10_000 + date.month() * 100 + date.day()
}

/// First day of the month a date falls in.
pub fn month_first_day(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month always exists")
}

/// Days-since-Unix-epoch to a calendar date (the `Date` column encoding).
pub fn date_from_days(days: u64) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(719_163 + i32::try_from(days).ok()?)
}

/// Calendar date to days since the Unix epoch.
pub fn days_from_date(date: NaiveDate) -> u64 {
    (date.num_days_from_ce() - 719_163).max(0) as u64
}

/// Validate a six-digit `YYYYMM` partition string.
///
/// The check is a round trip: the string must denote a real month whose
/// first day maps back to the same `YYYYMM` value.
pub fn parse_partition_id(s: &str) -> Result<u32> {
    let invalid = || MergeTreeError::InvalidName(format!("invalid partition: {s}"));
    if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u32 = s.parse().map_err(|_| invalid())?;
    let (year, month) = (value / 100, value % 100);
    let first = NaiveDate::from_ymd_opt(year as i32, month, 1).ok_or_else(invalid)?;
    if to_num_yyyymmdd(first) / 100 != value {
        return Err(invalid());
    }
    Ok(value)
}
