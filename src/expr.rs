//! Predicate expressions and the function collaborator interface.
//!
//! The engine does not parse SQL. Query predicates arrive as a small
//! [`Expr`] tree (columns, literals, named function applications) produced
//! by whatever planner embeds the engine. The only semantic knowledge the
//! engine needs about a function is captured by [`FunctionDescriptor`]:
//! its return type, how to apply it to a constant, and whether it is
//! monotonic over a queried interval — that last answer is what lets a
//! primary-key condition see through `toStartOfHour(ts) >= X`.
//!
//! Boolean connectives and comparisons are structural: the key condition
//! recognizes them by name (`and`, `equals`, `less`, ...) and constant
//! folding evaluates them inline over [`Field`] values.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Datelike;

use crate::error::{MergeTreeError, Result};
use crate::field::Field;
use crate::types::DataType;

/// A predicate (or scalar) expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Reference to a named column.
    Column(String),
    /// A literal value.
    Literal(Field),
    /// Application of a named function to arguments.
    Function { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column(name.into())
    }

    pub fn lit(value: impl Into<Field>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Expr {
        Expr::func("and", vec![lhs, rhs])
    }

    pub fn or(lhs: Expr, rhs: Expr) -> Expr {
        Expr::func("or", vec![lhs, rhs])
    }

    pub fn not(arg: Expr) -> Expr {
        Expr::func("not", vec![arg])
    }

    pub fn equals(lhs: Expr, rhs: Expr) -> Expr {
        Expr::func("equals", vec![lhs, rhs])
    }

    pub fn less(lhs: Expr, rhs: Expr) -> Expr {
        Expr::func("less", vec![lhs, rhs])
    }

    pub fn greater(lhs: Expr, rhs: Expr) -> Expr {
        Expr::func("greater", vec![lhs, rhs])
    }

    pub fn in_set(lhs: Expr, values: Vec<Field>) -> Expr {
        let args = std::iter::once(lhs)
            .chain(values.into_iter().map(Expr::Literal))
            .collect();
        Expr::func("in", args)
    }
}

// ── Monotonicity ───────────────────────────────────────────────────────────

/// Answer to a monotonicity query over one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Monotonicity {
    /// The function is monotonic over the queried interval.
    pub is_monotonic: bool,
    /// Direction: `true` = non-decreasing, `false` = non-increasing.
    /// Meaningless when `is_monotonic` is false.
    pub is_positive: bool,
}

impl Monotonicity {
    pub const NOT_MONOTONIC: Monotonicity = Monotonicity {
        is_monotonic: false,
        is_positive: true,
    };

    pub const INCREASING: Monotonicity = Monotonicity {
        is_monotonic: true,
        is_positive: true,
    };

    pub const DECREASING: Monotonicity = Monotonicity {
        is_monotonic: true,
        is_positive: false,
    };
}

/// What the engine knows about one single-argument function.
pub trait FunctionDescriptor: Send + Sync {
    fn name(&self) -> &str;

    fn return_type(&self, arg: &DataType) -> Result<DataType>;

    /// Apply to a constant.
    fn execute(&self, arg: &Field) -> Result<Field>;

    /// Monotonicity over `[left, right]` of the argument type. `None`
    /// endpoints mean the interval is unbounded on that side.
    fn monotonicity(
        &self,
        _arg_type: &DataType,
        _left: Option<&Field>,
        _right: Option<&Field>,
    ) -> Monotonicity {
        Monotonicity::NOT_MONOTONIC
    }
}

/// Name-indexed set of function descriptors.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn FunctionDescriptor>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the stock date/hash helpers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ToStartOfHour));
        registry.register(Arc::new(ToStartOfDay));
        registry.register(Arc::new(ToMonday));
        registry.register(Arc::new(ToYyyymm));
        registry.register(Arc::new(Negate));
        registry.register(Arc::new(ToStringFn));
        registry.register(Arc::new(IntHash32));
        registry
    }

    pub fn register(&mut self, function: Arc<dyn FunctionDescriptor>) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FunctionDescriptor>> {
        self.functions.get(name).cloned()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

// ── Constant folding ───────────────────────────────────────────────────────

/// Evaluate an expression whose leaves are all literals.
///
/// Returns `None` as soon as a column reference (or an unknown function)
/// makes the subtree non-constant. Comparisons and boolean connectives
/// evaluate inline with accurate field semantics; registered unary
/// functions evaluate through their descriptor.
pub fn fold_constants(expr: &Expr, registry: &FunctionRegistry) -> Option<Field> {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Column(_) => None,
        Expr::Function { name, args } => {
            let mut folded = Vec::with_capacity(args.len());
            for arg in args {
                folded.push(fold_constants(arg, registry)?);
            }
            match (name.as_str(), folded.as_slice()) {
                ("equals", [a, b]) => Some(bool_field(a.accurate_equals(b))),
                ("notEquals", [a, b]) => Some(bool_field(!a.accurate_equals(b))),
                ("less", [a, b]) => Some(bool_field(a.accurate_less(b))),
                ("greater", [a, b]) => Some(bool_field(b.accurate_less(a))),
                ("lessOrEquals", [a, b]) => Some(bool_field(!b.accurate_less(a))),
                ("greaterOrEquals", [a, b]) => Some(bool_field(!a.accurate_less(b))),
                ("and", values) => Some(bool_field(values.iter().all(|v| !v.is_zero()))),
                ("or", values) => Some(bool_field(values.iter().any(|v| !v.is_zero()))),
                ("not", [a]) => Some(bool_field(a.is_zero())),
                (_, [a]) => registry.get(name).and_then(|f| f.execute(a).ok()),
                _ => None,
            }
        }
    }
}

fn bool_field(b: bool) -> Field {
    Field::UInt64(b as u64)
}

// ── Built-in descriptors ───────────────────────────────────────────────────

fn expect_unsigned(name: &str, value: &Field) -> Result<u64> {
    value.as_u64().ok_or_else(|| MergeTreeError::TypeMismatch {
        column: name.into(),
        expected: "unsigned integer".into(),
        found: value.type_name().into(),
    })
}

/// Round a DateTime down to the hour. Monotonic.
pub struct ToStartOfHour;

impl FunctionDescriptor for ToStartOfHour {
    fn name(&self) -> &str {
        "toStartOfHour"
    }

    fn return_type(&self, _arg: &DataType) -> Result<DataType> {
        Ok(DataType::DateTime)
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        let v = expect_unsigned(self.name(), arg)?;
        Ok(Field::UInt64(v - v % 3600))
    }

    fn monotonicity(
        &self,
        _arg_type: &DataType,
        _left: Option<&Field>,
        _right: Option<&Field>,
    ) -> Monotonicity {
        Monotonicity::INCREASING
    }
}

/// Round a DateTime down to midnight. Monotonic.
pub struct ToStartOfDay;

impl FunctionDescriptor for ToStartOfDay {
    fn name(&self) -> &str {
        "toStartOfDay"
    }

    fn return_type(&self, _arg: &DataType) -> Result<DataType> {
        Ok(DataType::DateTime)
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        let v = expect_unsigned(self.name(), arg)?;
        Ok(Field::UInt64(v - v % 86_400))
    }

    fn monotonicity(
        &self,
        _arg_type: &DataType,
        _left: Option<&Field>,
        _right: Option<&Field>,
    ) -> Monotonicity {
        Monotonicity::INCREASING
    }
}

/// Round a Date (days since epoch) down to its Monday. Monotonic.
pub struct ToMonday;

impl FunctionDescriptor for ToMonday {
    fn name(&self) -> &str {
        "toMonday"
    }

    fn return_type(&self, _arg: &DataType) -> Result<DataType> {
        Ok(DataType::Date)
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        let days = expect_unsigned(self.name(), arg)? as i64;
        // Day 0 (1970-01-01) is a Thursday; day -3 is the nearest Monday.
        let monday = days - (days + 3).rem_euclid(7);
        Ok(Field::UInt64(monday.max(0) as u64))
    }

    fn monotonicity(
        &self,
        _arg_type: &DataType,
        _left: Option<&Field>,
        _right: Option<&Field>,
    ) -> Monotonicity {
        Monotonicity::INCREASING
    }
}

/// Date (days since epoch) to its `YYYYMM` month number. Monotonic.
pub struct ToYyyymm;

impl FunctionDescriptor for ToYyyymm {
    fn name(&self) -> &str {
        "toYYYYMM"
    }

    fn return_type(&self, _arg: &DataType) -> Result<DataType> {
        Ok(DataType::UInt32)
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        let days = expect_unsigned(self.name(), arg)?;
        let date = chrono::NaiveDate::from_num_days_from_ce_opt(719_163 + days as i32)
            .ok_or_else(|| MergeTreeError::InvalidName(format!("day number {days}")))?;
        Ok(Field::UInt64(date.year() as u64 * 100 + date.month() as u64))
    }

    fn monotonicity(
        &self,
        _arg_type: &DataType,
        _left: Option<&Field>,
        _right: Option<&Field>,
    ) -> Monotonicity {
        Monotonicity::INCREASING
    }
}

/// Arithmetic negation. Monotonic, decreasing.
pub struct Negate;

impl FunctionDescriptor for Negate {
    fn name(&self) -> &str {
        "negate"
    }

    fn return_type(&self, arg: &DataType) -> Result<DataType> {
        match arg {
            DataType::Float32 | DataType::Float64 => Ok(DataType::Float64),
            t if t.is_numeric() => Ok(DataType::Int64),
            other => Err(MergeTreeError::TypeMismatch {
                column: self.name().into(),
                expected: "numeric".into(),
                found: other.to_string(),
            }),
        }
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        match arg {
            Field::UInt64(v) => Ok(Field::Int64((*v as i64).wrapping_neg())),
            Field::Int64(v) => Ok(Field::Int64(v.wrapping_neg())),
            Field::Float64(v) => Ok(Field::Float64(-v)),
            other => Err(MergeTreeError::TypeMismatch {
                column: self.name().into(),
                expected: "numeric".into(),
                found: other.type_name().into(),
            }),
        }
    }

    fn monotonicity(
        &self,
        _arg_type: &DataType,
        _left: Option<&Field>,
        _right: Option<&Field>,
    ) -> Monotonicity {
        Monotonicity::DECREASING
    }
}

/// Decimal rendering. NOT monotonic over numbers ("10" < "9").
pub struct ToStringFn;

impl FunctionDescriptor for ToStringFn {
    fn name(&self) -> &str {
        "toString"
    }

    fn return_type(&self, _arg: &DataType) -> Result<DataType> {
        Ok(DataType::String)
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        Ok(match arg {
            Field::String(bytes) => Field::String(bytes.clone()),
            other => Field::String(other.to_string().into_bytes()),
        })
    }
}

/// 32-bit integer hash. Deliberately not monotonic.
pub struct IntHash32;

impl FunctionDescriptor for IntHash32 {
    fn name(&self) -> &str {
        "intHash32"
    }

    fn return_type(&self, _arg: &DataType) -> Result<DataType> {
        Ok(DataType::UInt32)
    }

    fn execute(&self, arg: &Field) -> Result<Field> {
        let v = expect_unsigned(self.name(), arg)?;
        let hash = xxhash_rust::xxh64::xxh64(&v.to_le_bytes(), 0);
        Ok(Field::UInt64(hash & 0xFFFF_FFFF))
    }
}
