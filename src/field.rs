//! Dynamically-typed field values.
//!
//! A [`Field`] is the engine's currency for individual values: primary-key
//! tuples in the sparse index, literals in predicates, and cell values in
//! in-memory blocks. Narrow integer widths (UInt8/16/32, Int8/16/32) are
//! carried in the widest lane of their sign class; the declared column type
//! ([`crate::types::DataType`]) remembers the width.
//!
//! # Accurate comparison
//!
//! Comparisons across numeric representations follow *value* semantics:
//! a signed and an unsigned integer compare via sign-aware promotion (a
//! negative signed value is below every unsigned value), and float-to-int
//! comparison is exact — no silent truncation of either operand. NaN sorts
//! above every other float and equals itself, which makes
//! [`Field::accurate_cmp`] a total order.

use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Write};

use crate::error::{MergeTreeError, Result};

/// A single dynamically-typed value.
#[derive(Debug, Clone)]
pub enum Field {
    /// Unsigned integers of any declared width.
    UInt64(u64),
    /// Signed integers of any declared width.
    Int64(i64),
    /// Float32 values are widened on entry.
    Float64(f64),
    /// Raw bytes; the engine does not assume an encoding.
    String(Vec<u8>),
    /// Array column cell.
    Array(Vec<Field>),
    /// Tuple value (e.g. a materialized primary-key prefix).
    Tuple(Vec<Field>),
}

impl Field {
    /// Short name of the value's lane, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Field::UInt64(_) => "UInt64",
            Field::Int64(_) => "Int64",
            Field::Float64(_) => "Float64",
            Field::String(_) => "String",
            Field::Array(_) => "Array",
            Field::Tuple(_) => "Tuple",
        }
    }

    /// Interpret the value as an unsigned integer, if it is one exactly.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Field::UInt64(v) => Some(*v),
            Field::Int64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Whether the value is any numeric lane.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Field::UInt64(_) | Field::Int64(_) | Field::Float64(_))
    }

    /// Whether a numeric value is exactly zero. Non-numerics are not zero.
    pub fn is_zero(&self) -> bool {
        match self {
            Field::UInt64(v) => *v == 0,
            Field::Int64(v) => *v == 0,
            Field::Float64(v) => *v == 0.0,
            _ => false,
        }
    }

    // ── Accurate comparison ──────────────────────────────────────────────

    /// Value-accurate equality. See module docs.
    pub fn accurate_equals(&self, other: &Field) -> bool {
        self.accurate_cmp(other) == Ordering::Equal
    }

    /// Value-accurate strict less-than. See module docs.
    pub fn accurate_less(&self, other: &Field) -> bool {
        self.accurate_cmp(other) == Ordering::Less
    }

    /// Total order over fields, accurate across numeric lanes.
    ///
    /// Heterogeneous non-numeric comparisons fall back to a fixed lane
    /// rank (numeric < String < Array < Tuple) so collections of mixed
    /// fields still sort deterministically.
    pub fn accurate_cmp(&self, other: &Field) -> Ordering {
        use Field::*;
        match (self, other) {
            (UInt64(a), UInt64(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Float64(a), Float64(b)) => cmp_f64(*a, *b),

            (UInt64(a), Int64(b)) => cmp_u64_i64(*a, *b),
            (Int64(a), UInt64(b)) => cmp_u64_i64(*b, *a).reverse(),

            (Float64(a), UInt64(b)) => cmp_f64_u64(*a, *b),
            (UInt64(a), Float64(b)) => cmp_f64_u64(*b, *a).reverse(),
            (Float64(a), Int64(b)) => cmp_f64_i64(*a, *b),
            (Int64(a), Float64(b)) => cmp_f64_i64(*b, *a).reverse(),

            (String(a), String(b)) => a.cmp(b),
            (Array(a), Array(b)) | (Tuple(a), Tuple(b)) => cmp_seq(a, b),

            _ => self.lane_rank().cmp(&other.lane_rank()),
        }
    }

    fn lane_rank(&self) -> u8 {
        match self {
            Field::UInt64(_) | Field::Int64(_) | Field::Float64(_) => 0,
            Field::String(_) => 1,
            Field::Array(_) => 2,
            Field::Tuple(_) => 3,
        }
    }

    // ── Binary form (primary.idx) ────────────────────────────────────────

    /// Serialize as a tag byte followed by a little-endian payload.
    pub fn write_binary<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            Field::UInt64(v) => {
                w.write_all(&[0])?;
                w.write_all(&v.to_le_bytes())
            }
            Field::Int64(v) => {
                w.write_all(&[1])?;
                w.write_all(&v.to_le_bytes())
            }
            Field::Float64(v) => {
                w.write_all(&[2])?;
                w.write_all(&v.to_le_bytes())
            }
            Field::String(bytes) => {
                w.write_all(&[3])?;
                w.write_all(&(bytes.len() as u64).to_le_bytes())?;
                w.write_all(bytes)
            }
            Field::Array(items) => {
                w.write_all(&[4])?;
                write_seq(w, items)
            }
            Field::Tuple(items) => {
                w.write_all(&[5])?;
                write_seq(w, items)
            }
        }
    }

    /// Inverse of [`Field::write_binary`].
    ///
    /// Used when loading `primary.idx`; a malformed stream is reported as
    /// corrupted metadata by the caller, so the error here is plain I/O.
    pub fn read_binary<R: Read>(r: &mut R) -> Result<Field> {
        let mut tag = [0u8; 1];
        read_exact(r, &mut tag)?;
        match tag[0] {
            0 => Ok(Field::UInt64(u64::from_le_bytes(read_8(r)?))),
            1 => Ok(Field::Int64(i64::from_le_bytes(read_8(r)?))),
            2 => Ok(Field::Float64(f64::from_le_bytes(read_8(r)?))),
            3 => {
                let len = u64::from_le_bytes(read_8(r)?) as usize;
                let mut bytes = vec![0u8; len];
                read_exact(r, &mut bytes)?;
                Ok(Field::String(bytes))
            }
            4 => Ok(Field::Array(read_seq(r)?)),
            5 => Ok(Field::Tuple(read_seq(r)?)),
            other => Err(MergeTreeError::CorruptedMetadata {
                part: String::new(),
                detail: format!("unknown field tag {other}"),
            }),
        }
    }
}

fn write_seq<W: Write>(w: &mut W, items: &[Field]) -> std::io::Result<()> {
    w.write_all(&(items.len() as u64).to_le_bytes())?;
    for item in items {
        item.write_binary(w)?;
    }
    Ok(())
}

fn read_seq<R: Read>(r: &mut R) -> Result<Vec<Field>> {
    let len = u64::from_le_bytes(read_8(r)?) as usize;
    let mut items = Vec::with_capacity(len.min(1 << 16));
    for _ in 0..len {
        items.push(Field::read_binary(r)?);
    }
    Ok(items)
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| MergeTreeError::Io {
        path: "<field stream>".into(),
        source: e,
    })
}

fn read_8<R: Read>(r: &mut R) -> Result<[u8; 8]> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

// ── Comparison kernels ─────────────────────────────────────────────────────

fn cmp_seq(a: &[Field], b: &[Field]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.accurate_cmp(y) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    a.len().cmp(&b.len())
}

/// Float total order with value semantics: -0.0 == 0.0, NaN above all.
fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn cmp_u64_i64(a: u64, b: i64) -> Ordering {
    if b < 0 {
        Ordering::Greater
    } else {
        a.cmp(&(b as u64))
    }
}

/// Exact f64 vs u64 comparison.
///
/// For `f` in `[0, 2^64)` the truncated value is an integer exactly
/// representable in both f64 and u64, so splitting into integer part and
/// fractional remainder loses nothing.
fn cmp_f64_u64(f: f64, u: u64) -> Ordering {
    if f.is_nan() {
        return Ordering::Greater;
    }
    if f < 0.0 {
        return Ordering::Less;
    }
    if f >= 18_446_744_073_709_551_616.0 {
        return Ordering::Greater;
    }
    let trunc = f.trunc();
    let ti = trunc as u64;
    match ti.cmp(&u) {
        Ordering::Equal if f > trunc => Ordering::Greater,
        other => other,
    }
}

/// Exact f64 vs i64 comparison. Same splitting argument as
/// [`cmp_f64_u64`]; the fractional remainder of a negative float pushes it
/// below its truncation.
fn cmp_f64_i64(f: f64, i: i64) -> Ordering {
    if f.is_nan() {
        return Ordering::Greater;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let trunc = f.trunc();
    let ti = trunc as i64;
    match ti.cmp(&i) {
        Ordering::Equal if f > trunc => Ordering::Greater,
        Ordering::Equal if f < trunc => Ordering::Less,
        other => other,
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.accurate_cmp(other) == Ordering::Equal
    }
}

impl Eq for Field {}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.accurate_cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        self.accurate_cmp(other)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::UInt64(v) => write!(f, "{v}"),
            Field::Int64(v) => write!(f, "{v}"),
            Field::Float64(v) => write!(f, "{v}"),
            Field::String(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => write!(f, "'{s}'"),
                Err(_) => write!(f, "0x{}", hex(bytes)),
            },
            Field::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Field::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl From<u64> for Field {
    fn from(v: u64) -> Self {
        Field::UInt64(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::Int64(v)
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Float64(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::String(v.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(v: f64) -> Field {
        Field::Float64(v)
    }
    fn u(v: u64) -> Field {
        Field::UInt64(v)
    }
    fn i(v: i64) -> Field {
        Field::Int64(v)
    }

    #[test]
    fn test_cross_sign_integer_compare() {
        assert!(i(-1).accurate_less(&u(0)));
        assert!(i(-1).accurate_less(&u(u64::MAX)));
        assert!(u(5).accurate_equals(&i(5)));
        assert!(u(u64::MAX).accurate_cmp(&i(i64::MAX)) == Ordering::Greater);
    }

    #[test]
    fn test_float_int_compare_is_exact() {
        // 2^53 + 1 is not representable in f64; casting would silently
        // equal 2^53. Value comparison must not.
        let big = (1u64 << 53) + 1;
        assert!(f(9_007_199_254_740_992.0).accurate_less(&u(big)));
        assert!(u(big).accurate_cmp(&f(9_007_199_254_740_992.0)) == Ordering::Greater);

        assert!(f(1.5).accurate_cmp(&u(1)) == Ordering::Greater);
        assert!(f(1.5).accurate_less(&u(2)));
        assert!(f(2.0).accurate_equals(&u(2)));
        assert!(f(-0.5).accurate_less(&i(0)));
        assert!(f(-0.5).accurate_cmp(&i(-1)) == Ordering::Greater);
        assert!(f(-1e300).accurate_less(&i(i64::MIN)));
        assert!(f(1e300).accurate_cmp(&u(u64::MAX)) == Ordering::Greater);
    }

    #[test]
    fn test_nan_totality() {
        let nan = f(f64::NAN);
        assert!(nan.accurate_equals(&f(f64::NAN)));
        assert!(f(f64::INFINITY).accurate_less(&nan.clone()));
        assert!(u(u64::MAX).accurate_less(&nan));
    }

    #[test]
    fn test_string_and_tuple_order() {
        let a = Field::from("abc");
        let b = Field::from("abd");
        assert!(a < b);

        let t1 = Field::Tuple(vec![u(1), Field::from("x")]);
        let t2 = Field::Tuple(vec![u(1), Field::from("y")]);
        let t3 = Field::Tuple(vec![u(1)]);
        assert!(t1 < t2);
        assert!(t3 < t1); // prefix sorts first
    }

    #[test]
    fn test_binary_roundtrip() {
        let values = vec![
            u(42),
            i(-42),
            f(2.5),
            Field::from("hello"),
            Field::Array(vec![u(1), u(2), u(3)]),
            Field::Tuple(vec![i(-1), Field::from("k")]),
        ];
        for v in values {
            let mut buf = Vec::new();
            v.write_binary(&mut buf).unwrap();
            let back = Field::read_binary(&mut buf.as_slice()).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn test_is_zero() {
        assert!(u(0).is_zero());
        assert!(i(0).is_zero());
        assert!(f(0.0).is_zero());
        assert!(!u(1).is_zero());
        assert!(!Field::from("0").is_zero());
    }
}
