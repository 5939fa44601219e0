//! Column types and the `columns.txt` metadata format.
//!
//! Each part stores its logical schema in a `columns.txt` file:
//!
//! ```text
//! columns format version: 1
//! 3 columns:
//! `date` Date
//! `user_id` UInt64
//! `name` String
//! ```
//!
//! Column names are backtick-quoted with backslash escapes, so arbitrary
//! names round-trip. On-disk data files derive their names from the column
//! name via [`escape_for_file_name`], which percent-encodes anything
//! outside `[A-Za-z0-9_]`.

use std::fmt;

use crate::error::{MergeTreeError, Result};
use crate::field::Field;

/// Logical type of a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    /// Days since the Unix epoch, stored in the unsigned lane.
    Date,
    /// Seconds since the Unix epoch, stored in the unsigned lane.
    DateTime,
    Array(Box<DataType>),
    /// 8-bit enum: named variants over Int8 storage.
    Enum8(Vec<(String, i64)>),
    /// 16-bit enum: named variants over Int16 storage.
    Enum16(Vec<(String, i64)>),
}

impl DataType {
    /// Whether values of this type live in a numeric [`Field`] lane.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String | DataType::Array(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, DataType::Array(_))
    }

    /// Storage width in bytes for fixed-width types, `None` for variable.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            DataType::UInt8 | DataType::Int8 | DataType::Enum8(_) => Some(1),
            DataType::UInt16 | DataType::Int16 | DataType::Date | DataType::Enum16(_) => Some(2),
            DataType::UInt32 | DataType::Int32 | DataType::Float32 | DataType::DateTime => Some(4),
            DataType::UInt64 | DataType::Int64 | DataType::Float64 => Some(8),
            DataType::String | DataType::Array(_) => None,
        }
    }

    /// Two enum types share a representation iff their storage width
    /// matches. Renaming or adding variants is then a metadata-only change.
    pub fn same_enum_width(&self, other: &DataType) -> bool {
        matches!(
            (self, other),
            (DataType::Enum8(_), DataType::Enum8(_)) | (DataType::Enum16(_), DataType::Enum16(_))
        )
    }

    /// Whether a field value belongs to this type's lane.
    pub fn accepts(&self, value: &Field) -> bool {
        match self {
            DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date
            | DataType::DateTime => matches!(value, Field::UInt64(_)),
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Enum8(_)
            | DataType::Enum16(_) => matches!(value, Field::Int64(_)),
            DataType::Float32 | DataType::Float64 => matches!(value, Field::Float64(_)),
            DataType::String => matches!(value, Field::String(_)),
            DataType::Array(inner) => match value {
                Field::Array(items) => items.iter().all(|item| inner.accepts(item)),
                _ => false,
            },
        }
    }

    /// Parse a type name as written in `columns.txt`.
    pub fn parse(s: &str) -> Result<DataType> {
        let s = s.trim();
        let simple = match s {
            "UInt8" => Some(DataType::UInt8),
            "UInt16" => Some(DataType::UInt16),
            "UInt32" => Some(DataType::UInt32),
            "UInt64" => Some(DataType::UInt64),
            "Int8" => Some(DataType::Int8),
            "Int16" => Some(DataType::Int16),
            "Int32" => Some(DataType::Int32),
            "Int64" => Some(DataType::Int64),
            "Float32" => Some(DataType::Float32),
            "Float64" => Some(DataType::Float64),
            "String" => Some(DataType::String),
            "Date" => Some(DataType::Date),
            "DateTime" => Some(DataType::DateTime),
            _ => None,
        };
        if let Some(t) = simple {
            return Ok(t);
        }
        if let Some(inner) = s.strip_prefix("Array(").and_then(|r| r.strip_suffix(')')) {
            return Ok(DataType::Array(Box::new(DataType::parse(inner)?)));
        }
        if let Some(body) = s.strip_prefix("Enum8(").and_then(|r| r.strip_suffix(')')) {
            return Ok(DataType::Enum8(parse_enum_variants(body)?));
        }
        if let Some(body) = s.strip_prefix("Enum16(").and_then(|r| r.strip_suffix(')')) {
            return Ok(DataType::Enum16(parse_enum_variants(body)?));
        }
        Err(MergeTreeError::InvalidName(format!("unknown type: {s}")))
    }
}

fn parse_enum_variants(body: &str) -> Result<Vec<(String, i64)>> {
    let mut variants = Vec::new();
    for entry in split_top_level(body) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name_part, value_part) = entry.rsplit_once('=').ok_or_else(|| {
            MergeTreeError::InvalidName(format!("bad enum variant: {entry}"))
        })?;
        let name = name_part
            .trim()
            .strip_prefix('\'')
            .and_then(|n| n.strip_suffix('\''))
            .ok_or_else(|| MergeTreeError::InvalidName(format!("bad enum variant: {entry}")))?;
        let value: i64 = value_part
            .trim()
            .parse()
            .map_err(|_| MergeTreeError::InvalidName(format!("bad enum value: {entry}")))?;
        variants.push((name.to_string(), value));
    }
    if variants.is_empty() {
        return Err(MergeTreeError::InvalidName("empty enum".into()));
    }
    Ok(variants)
}

/// Split on commas that are not inside single quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    for (idx, ch) in s.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            ',' if !in_quote => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::UInt8 => write!(f, "UInt8"),
            DataType::UInt16 => write!(f, "UInt16"),
            DataType::UInt32 => write!(f, "UInt32"),
            DataType::UInt64 => write!(f, "UInt64"),
            DataType::Int8 => write!(f, "Int8"),
            DataType::Int16 => write!(f, "Int16"),
            DataType::Int32 => write!(f, "Int32"),
            DataType::Int64 => write!(f, "Int64"),
            DataType::Float32 => write!(f, "Float32"),
            DataType::Float64 => write!(f, "Float64"),
            DataType::String => write!(f, "String"),
            DataType::Date => write!(f, "Date"),
            DataType::DateTime => write!(f, "DateTime"),
            DataType::Array(inner) => write!(f, "Array({inner})"),
            DataType::Enum8(variants) => write_enum(f, "Enum8", variants),
            DataType::Enum16(variants) => write_enum(f, "Enum16", variants),
        }
    }
}

fn write_enum(f: &mut fmt::Formatter<'_>, kind: &str, variants: &[(String, i64)]) -> fmt::Result {
    write!(f, "{kind}(")?;
    for (i, (name, value)) in variants.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "'{name}' = {value}")?;
    }
    write!(f, ")")
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

// ── columns.txt ────────────────────────────────────────────────────────────

const COLUMNS_FORMAT_HEADER: &str = "columns format version: 1";

/// Render a column list in the `columns.txt` format.
pub fn format_columns(columns: &[ColumnDescription]) -> String {
    let mut out = String::new();
    out.push_str(COLUMNS_FORMAT_HEADER);
    out.push('\n');
    out.push_str(&format!("{} columns:\n", columns.len()));
    for col in columns {
        out.push_str(&format!("`{}` {}\n", escape_backticks(&col.name), col.data_type));
    }
    out
}

/// Parse the `columns.txt` format.
pub fn parse_columns(text: &str) -> Result<Vec<ColumnDescription>> {
    let mut lines = text.lines();
    let bad = |detail: &str| MergeTreeError::CorruptedMetadata {
        part: String::new(),
        detail: format!("columns.txt: {detail}"),
    };

    if lines.next().map(str::trim) != Some(COLUMNS_FORMAT_HEADER) {
        return Err(bad("missing format header"));
    }
    let count_line = lines.next().ok_or_else(|| bad("missing count line"))?;
    let count: usize = count_line
        .trim()
        .strip_suffix(" columns:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| bad("malformed count line"))?;

    let mut columns = Vec::with_capacity(count);
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rest = line
            .strip_prefix('`')
            .ok_or_else(|| bad("column line missing backtick"))?;
        let (name, type_str) = split_backticked(rest).ok_or_else(|| bad("unterminated name"))?;
        columns.push(ColumnDescription {
            name,
            data_type: DataType::parse(type_str)?,
        });
    }
    if columns.len() != count {
        return Err(bad(&format!(
            "count line says {count}, found {}",
            columns.len()
        )));
    }
    Ok(columns)
}

fn escape_backticks(name: &str) -> String {
    name.replace('\\', "\\\\").replace('`', "\\`")
}

/// Split `name` type` at the closing unescaped backtick. Returns the
/// unescaped name and the remaining type text.
fn split_backticked(rest: &str) -> Option<(String, &str)> {
    let mut name = String::new();
    let mut chars = rest.char_indices();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, escaped)) => name.push(escaped),
                None => return None,
            },
            '`' => return Some((name, rest[idx + 1..].trim())),
            other => name.push(other),
        }
    }
    None
}

// ── File-name escaping ─────────────────────────────────────────────────────

/// Escape a column name for use as an on-disk file stem.
///
/// Anything outside `[A-Za-z0-9_]` becomes `%XX`. The mapping is injective,
/// so distinct column names never collide on disk.
pub fn escape_for_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parse_roundtrip() {
        let types = [
            "UInt8",
            "UInt64",
            "Int32",
            "Float64",
            "String",
            "Date",
            "DateTime",
            "Array(UInt32)",
            "Array(Array(String))",
            "Enum8('a' = 1, 'b' = 2)",
            "Enum16('x, y' = -1, 'z' = 300)",
        ];
        for t in types {
            let parsed = DataType::parse(t).unwrap();
            assert_eq!(parsed.to_string(), t, "roundtrip of {t}");
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(DataType::parse("UInt128").is_err());
        assert!(DataType::parse("Array(").is_err());
    }

    #[test]
    fn test_columns_txt_roundtrip() {
        let columns = vec![
            ColumnDescription::new("date", DataType::Date),
            ColumnDescription::new("user id", DataType::UInt64),
            ColumnDescription::new("weird`name", DataType::String),
            ColumnDescription::new("tags", DataType::Array(Box::new(DataType::String))),
        ];
        let text = format_columns(&columns);
        let parsed = parse_columns(&text).unwrap();
        assert_eq!(parsed, columns);
    }

    #[test]
    fn test_columns_txt_count_mismatch_rejected() {
        let text = "columns format version: 1\n2 columns:\n`a` UInt8\n";
        assert!(parse_columns(text).is_err());
    }

    #[test]
    fn test_escape_for_file_name() {
        assert_eq!(escape_for_file_name("user_id"), "user_id");
        assert_eq!(escape_for_file_name("user id"), "user%20id");
        assert_eq!(escape_for_file_name("a.b"), "a%2Eb");
        // Injective: distinct names map to distinct stems.
        assert_ne!(escape_for_file_name("a b"), escape_for_file_name("a_b"));
    }

    #[test]
    fn test_enum_width_compat() {
        let a = DataType::Enum8(vec![("a".into(), 1)]);
        let b = DataType::Enum8(vec![("b".into(), 1), ("c".into(), 2)]);
        let c = DataType::Enum16(vec![("a".into(), 1)]);
        assert!(a.same_enum_width(&b));
        assert!(!a.same_enum_width(&c));
        assert!(!a.same_enum_width(&DataType::Int8));
    }

    #[test]
    fn test_accepts() {
        assert!(DataType::UInt32.accepts(&Field::UInt64(7)));
        assert!(!DataType::UInt32.accepts(&Field::Int64(7)));
        assert!(DataType::Array(Box::new(DataType::UInt8))
            .accepts(&Field::Array(vec![Field::UInt64(1)])));
        assert!(!DataType::Array(Box::new(DataType::UInt8))
            .accepts(&Field::Array(vec![Field::String(vec![])])));
    }
}
