//! The primary-key condition: predicate analysis for range pruning.
//!
//! A [`KeyCondition`] is a query predicate compiled into a reverse-Polish
//! sequence whose atoms constrain individual primary-key columns with
//! ranges or sets. It answers one question, conservatively: *could any row
//! whose key lies between two tuples satisfy the predicate?* "Yes" may be
//! wrong (a false positive costs a read), "no" must never be.
//!
//! # Construction
//!
//! The predicate tree is walked bottom-up. Constant subtrees fold to
//! `ALWAYS_TRUE`/`ALWAYS_FALSE`; `and`/`or`/`not` emit operators;
//! recognized comparisons against a constant become range atoms via the
//! atom map (a constant on the left inverts the comparator); `in`/`notIn`
//! become set atoms; `like` constrains by its longest fixed prefix.
//! Anything else becomes `UNKNOWN`, which evaluates as "maybe".
//!
//! A key column may be wrapped in a chain of single-argument functions.
//! The atom keeps the chain; at evaluation time the queried key range is
//! pushed through it (endpoints swapped on negatively-monotonic steps),
//! and if any step reports itself non-monotonic over that interval the
//! atom degenerates to "maybe".
//!
//! # Evaluation
//!
//! The n-dimensional range between two key tuples is decomposed into
//! parallelograms (point prefix, open middle slab, two recursive tails).
//! Each parallelogram runs through the RPN over a two-bit
//! (`can_be_true`, `can_be_false`) mask; the range may match if any
//! parallelogram may.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::error::Result;
use crate::expr::{Expr, FunctionDescriptor, FunctionRegistry, fold_constants};
use crate::field::Field;
use crate::part::DataPart;
use crate::range::{Parallelogram, Range};
use crate::reader::MarkRange;
use crate::types::DataType;

// ── Boolean mask ───────────────────────────────────────────────────────────

/// Three-valued truth carried through RPN evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoolMask {
    pub can_be_true: bool,
    pub can_be_false: bool,
}

impl BoolMask {
    pub const UNKNOWN: BoolMask = BoolMask {
        can_be_true: true,
        can_be_false: true,
    };

    pub fn new(can_be_true: bool, can_be_false: bool) -> BoolMask {
        BoolMask {
            can_be_true,
            can_be_false,
        }
    }

    pub fn and(self, other: BoolMask) -> BoolMask {
        BoolMask {
            can_be_true: self.can_be_true && other.can_be_true,
            can_be_false: self.can_be_false || other.can_be_false,
        }
    }

    pub fn or(self, other: BoolMask) -> BoolMask {
        BoolMask {
            can_be_true: self.can_be_true || other.can_be_true,
            can_be_false: self.can_be_false && other.can_be_false,
        }
    }

    pub fn negate(self) -> BoolMask {
        BoolMask {
            can_be_true: self.can_be_false,
            can_be_false: self.can_be_true,
        }
    }
}

// ── Set collaborator ───────────────────────────────────────────────────────

/// Right-hand side of an `IN`, as the condition sees it.
pub trait SetLookup: Send + Sync {
    /// Could a value in `range` be a member / a non-member?
    fn may_be_true_in_range(&self, range: &Range) -> BoolMask;
}

/// A finite, ordered set of literal values.
#[derive(Debug, Clone)]
pub struct SortedSet {
    values: Vec<Field>,
}

impl SortedSet {
    pub fn new(mut values: Vec<Field>) -> SortedSet {
        values.sort();
        values.dedup();
        SortedSet { values }
    }

    fn contains(&self, value: &Field) -> bool {
        self.values.binary_search(value).is_ok()
    }
}

impl SetLookup for SortedSet {
    fn may_be_true_in_range(&self, range: &Range) -> BoolMask {
        // Membership is possible iff some element falls inside the range.
        let start = match &range.left {
            None => 0,
            Some(left) => self.values.partition_point(|v| v < left),
        };
        let can_be_member = self.values[start..]
            .iter()
            .take_while(|v| match &range.right {
                None => true,
                Some(right) => *v <= right,
            })
            .any(|v| range.contains_value(v));

        // Non-membership is impossible only when the whole range is inside
        // the set; for a finite set that means a single point.
        let is_point_in_set = matches!((&range.left, &range.right),
            (Some(l), Some(r))
                if range.left_included
                    && range.right_included
                    && l.accurate_equals(r)
                    && self.contains(l));

        BoolMask::new(can_be_member, !is_point_in_set)
    }
}

// ── RPN ────────────────────────────────────────────────────────────────────

type Chain = Vec<Arc<dyn FunctionDescriptor>>;

enum RpnElement {
    /// `chain(key[column]) ∈ range`.
    InRange {
        key_column: usize,
        range: Range,
        chain: Chain,
    },
    NotInRange {
        key_column: usize,
        range: Range,
        chain: Chain,
    },
    InSet {
        key_column: usize,
        set: Arc<dyn SetLookup>,
        chain: Chain,
    },
    NotInSet {
        key_column: usize,
        set: Arc<dyn SetLookup>,
        chain: Chain,
    },
    /// A subtree the analysis cannot constrain.
    Unknown,
    AlwaysTrue,
    AlwaysFalse,
    And,
    Or,
    Not,
}

impl std::fmt::Debug for RpnElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpnElement::InRange { key_column, range, chain } => {
                write!(f, "InRange(key[{key_column}], {range}, chain={})", chain.len())
            }
            RpnElement::NotInRange { key_column, range, chain } => {
                write!(f, "NotInRange(key[{key_column}], {range}, chain={})", chain.len())
            }
            RpnElement::InSet { key_column, .. } => write!(f, "InSet(key[{key_column}])"),
            RpnElement::NotInSet { key_column, .. } => write!(f, "NotInSet(key[{key_column}])"),
            RpnElement::Unknown => write!(f, "Unknown"),
            RpnElement::AlwaysTrue => write!(f, "AlwaysTrue"),
            RpnElement::AlwaysFalse => write!(f, "AlwaysFalse"),
            RpnElement::And => write!(f, "And"),
            RpnElement::Or => write!(f, "Or"),
            RpnElement::Not => write!(f, "Not"),
        }
    }
}

/// A compiled primary-key condition. Immutable once built; lives for one
/// query's planning.
#[derive(Debug)]
pub struct KeyCondition {
    rpn: Vec<RpnElement>,
    key_types: Vec<DataType>,
}

impl KeyCondition {
    /// Compile a predicate against an ordered primary key.
    ///
    /// `predicate` is the WHERE clause (with PREWHERE already conjoined by
    /// the caller); `None` compiles to an unconstraining condition.
    pub fn new(
        predicate: Option<&Expr>,
        key_columns: &[String],
        key_types: &[DataType],
        registry: &FunctionRegistry,
    ) -> KeyCondition {
        debug_assert_eq!(key_columns.len(), key_types.len());
        let key_index: HashMap<&str, usize> = key_columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut rpn = Vec::new();
        match predicate {
            None => rpn.push(RpnElement::Unknown),
            Some(expr) => build_rpn(expr, &key_index, registry, &mut rpn),
        }
        let condition = KeyCondition {
            rpn,
            key_types: key_types.to_vec(),
        };
        debug!("compiled key condition: {:?}", condition.rpn);
        condition
    }

    /// Could any row with key in `[left, right]` satisfy the predicate?
    ///
    /// `left` and `right` are key tuples (or equal-length prefixes of the
    /// key); dimensions past the tuples are unconstrained.
    pub fn may_be_true_in_range(&self, left: &[Field], right: &[Field]) -> bool {
        assert_eq!(left.len(), right.len(), "key tuples must have equal width");
        self.for_any_parallelogram(left, Some(right))
    }

    /// Could any row with key at or after `left` satisfy the predicate?
    /// Used for the trailing granule of a part, whose last key is unknown.
    pub fn may_be_true_after_start(&self, left: &[Field]) -> bool {
        self.for_any_parallelogram(left, None)
    }

    /// Whether the condition can prune anything at all. When true, index
    /// analysis can be skipped entirely.
    pub fn always_unknown_or_true(&self) -> bool {
        let mut stack: Vec<bool> = Vec::new();
        for element in &self.rpn {
            match element {
                RpnElement::Unknown | RpnElement::AlwaysTrue => stack.push(true),
                RpnElement::InRange { .. }
                | RpnElement::NotInRange { .. }
                | RpnElement::InSet { .. }
                | RpnElement::NotInSet { .. }
                | RpnElement::AlwaysFalse => stack.push(false),
                RpnElement::Not => {}
                RpnElement::And => {
                    let b = stack.pop().expect("malformed RPN");
                    let a = stack.pop().expect("malformed RPN");
                    stack.push(a && b);
                }
                RpnElement::Or => {
                    let b = stack.pop().expect("malformed RPN");
                    let a = stack.pop().expect("malformed RPN");
                    stack.push(a || b);
                }
            }
        }
        debug_assert_eq!(stack.len(), 1);
        stack.pop().unwrap_or(true)
    }

    /// Highest key-column index any atom constrains. Reading that prefix
    /// of the key into marks is enough to evaluate the condition.
    pub fn max_key_column(&self) -> Option<usize> {
        self.rpn
            .iter()
            .filter_map(|element| match element {
                RpnElement::InRange { key_column, .. }
                | RpnElement::NotInRange { key_column, .. }
                | RpnElement::InSet { key_column, .. }
                | RpnElement::NotInSet { key_column, .. } => Some(*key_column),
                _ => None,
            })
            .max()
    }

    // ── Decomposition ────────────────────────────────────────────────────

    fn for_any_parallelogram(&self, left: &[Field], right: Option<&[Field]>) -> bool {
        let used = left.len();
        assert!(used <= self.key_types.len(), "tuple wider than the key");
        let mut parallelogram: Parallelogram =
            vec![Range::whole_universe(); self.key_types.len()];
        self.decompose(used, left, right, true, right.is_some(), &mut parallelogram, 0)
    }

    /// Recursive decomposition of the lex-ordered tuple range into
    /// parallelograms; returns true as soon as one may match.
    #[allow(clippy::too_many_arguments)]
    fn decompose(
        &self,
        key_size: usize,
        left: &[Field],
        right: Option<&[Field]>,
        left_bounded: bool,
        right_bounded: bool,
        parallelogram: &mut Parallelogram,
        mut prefix_size: usize,
    ) -> bool {
        if !left_bounded && !right_bounded {
            return self.check(parallelogram);
        }

        if left_bounded && right_bounded {
            let right = right.expect("right tuple present when right-bounded");
            // Consume the shared prefix as point ranges.
            while prefix_size < key_size && left[prefix_size] == right[prefix_size] {
                parallelogram[prefix_size] = Range::single_point(left[prefix_size].clone());
                prefix_size += 1;
            }
        }

        if prefix_size == key_size {
            return self.check(parallelogram);
        }

        // Last dimension: a single closed/half-open range, no recursion.
        if prefix_size + 1 == key_size {
            parallelogram[prefix_size] = match (left_bounded, right_bounded) {
                (true, true) => Range::bounded(
                    left[prefix_size].clone(),
                    true,
                    right.expect("right-bounded")[prefix_size].clone(),
                    true,
                ),
                (true, false) => Range::left_bounded(left[prefix_size].clone(), true),
                (false, true) => {
                    Range::right_bounded(right.expect("right-bounded")[prefix_size].clone(), true)
                }
                (false, false) => unreachable!("handled above"),
            };
            return self.check(parallelogram);
        }

        // Middle slab: the first differing dimension open on the bounded
        // sides, everything below unconstrained.
        parallelogram[prefix_size] = match (left_bounded, right_bounded) {
            (true, true) => Range::bounded(
                left[prefix_size].clone(),
                false,
                right.expect("right-bounded")[prefix_size].clone(),
                false,
            ),
            (true, false) => Range::left_bounded(left[prefix_size].clone(), false),
            (false, true) => {
                Range::right_bounded(right.expect("right-bounded")[prefix_size].clone(), false)
            }
            (false, false) => unreachable!("handled above"),
        };
        for range in parallelogram.iter_mut().take(key_size).skip(prefix_size + 1) {
            *range = Range::whole_universe();
        }
        if self.check(parallelogram) {
            return true;
        }

        // Left tail: [x1] × [y1 ..).
        if left_bounded {
            parallelogram[prefix_size] = Range::single_point(left[prefix_size].clone());
            if self.decompose(key_size, left, right, true, false, parallelogram, prefix_size + 1) {
                return true;
            }
        }

        // Right tail: [x2] × (.. y2].
        if right_bounded {
            let right_tuple = right.expect("right-bounded");
            parallelogram[prefix_size] = Range::single_point(right_tuple[prefix_size].clone());
            if self.decompose(key_size, left, right, false, true, parallelogram, prefix_size + 1) {
                return true;
            }
        }

        false
    }

    fn check(&self, parallelogram: &Parallelogram) -> bool {
        self.may_be_true_in_parallelogram(parallelogram).can_be_true
    }

    // ── RPN evaluation ───────────────────────────────────────────────────

    /// Evaluate the condition over one parallelogram.
    pub fn may_be_true_in_parallelogram(&self, parallelogram: &Parallelogram) -> BoolMask {
        let mut stack: Vec<BoolMask> = Vec::new();
        for element in &self.rpn {
            let mask = match element {
                RpnElement::Unknown => BoolMask::UNKNOWN,
                RpnElement::AlwaysTrue => BoolMask::new(true, false),
                RpnElement::AlwaysFalse => BoolMask::new(false, true),
                RpnElement::InRange { key_column, range, chain }
                | RpnElement::NotInRange { key_column, range, chain } => {
                    let key_range = parallelogram
                        .get(*key_column)
                        .cloned()
                        .unwrap_or_else(Range::whole_universe);
                    let mask = match self.transform_key_range(key_range, *key_column, chain) {
                        None => BoolMask::UNKNOWN,
                        Some(transformed) => BoolMask::new(
                            range.intersects(&transformed),
                            !range.contains_range(&transformed),
                        ),
                    };
                    if matches!(element, RpnElement::NotInRange { .. }) {
                        mask.negate()
                    } else {
                        mask
                    }
                }
                RpnElement::InSet { key_column, set, chain }
                | RpnElement::NotInSet { key_column, set, chain } => {
                    let key_range = parallelogram
                        .get(*key_column)
                        .cloned()
                        .unwrap_or_else(Range::whole_universe);
                    let mask = match self.transform_key_range(key_range, *key_column, chain) {
                        None => BoolMask::UNKNOWN,
                        Some(transformed) => set.may_be_true_in_range(&transformed),
                    };
                    if matches!(element, RpnElement::NotInSet { .. }) {
                        mask.negate()
                    } else {
                        mask
                    }
                }
                RpnElement::And => {
                    let b = stack.pop().expect("malformed RPN");
                    let a = stack.pop().expect("malformed RPN");
                    a.and(b)
                }
                RpnElement::Or => {
                    let b = stack.pop().expect("malformed RPN");
                    let a = stack.pop().expect("malformed RPN");
                    a.or(b)
                }
                RpnElement::Not => stack.pop().expect("malformed RPN").negate(),
            };
            stack.push(mask);
        }
        debug_assert_eq!(stack.len(), 1, "RPN must reduce to one mask");
        stack.pop().unwrap_or(BoolMask::UNKNOWN)
    }

    /// Push a raw key range through an atom's monotonic-function chain.
    /// `None` means a step was not monotonic over the interval.
    fn transform_key_range(
        &self,
        mut range: Range,
        key_column: usize,
        chain: &Chain,
    ) -> Option<Range> {
        if chain.is_empty() {
            return Some(range);
        }
        let mut current_type = self.key_types.get(key_column)?.clone();
        // The chain is stored outermost-first; the innermost function
        // touches the raw column, so apply in reverse.
        for function in chain.iter().rev() {
            let monotonicity =
                function.monotonicity(&current_type, range.left.as_ref(), range.right.as_ref());
            if !monotonicity.is_monotonic {
                return None;
            }
            range.left = match range.left.take() {
                None => None,
                Some(value) => Some(function.execute(&value).ok()?),
            };
            range.right = match range.right.take() {
                None => None,
                Some(value) => Some(function.execute(&value).ok()?),
            };
            if !monotonicity.is_positive {
                range.swap_bounds();
            }
            current_type = function.return_type(&current_type).ok()?;
        }
        Some(range)
    }
}

// ── Construction ───────────────────────────────────────────────────────────

fn build_rpn(
    expr: &Expr,
    key_index: &HashMap<&str, usize>,
    registry: &FunctionRegistry,
    rpn: &mut Vec<RpnElement>,
) {
    // Constant subtrees short-circuit: `WHERE 0 AND ...` prunes everything.
    if let Some(value) = fold_constants(expr, registry) {
        rpn.push(if value.is_zero() {
            RpnElement::AlwaysFalse
        } else {
            RpnElement::AlwaysTrue
        });
        return;
    }

    if let Expr::Function { name, args } = expr {
        match (name.as_str(), args.len()) {
            ("not", 1) => {
                build_rpn(&args[0], key_index, registry, rpn);
                rpn.push(RpnElement::Not);
                return;
            }
            // `indexHint` is a planner no-op; analyze its arguments as a
            // conjunction.
            ("and", n) | ("indexHint", n) if n >= 1 => {
                for arg in args {
                    build_rpn(arg, key_index, registry, rpn);
                }
                for _ in 1..args.len() {
                    rpn.push(RpnElement::And);
                }
                return;
            }
            ("or", n) if n >= 1 => {
                for arg in args {
                    build_rpn(arg, key_index, registry, rpn);
                }
                for _ in 1..args.len() {
                    rpn.push(RpnElement::Or);
                }
                return;
            }
            _ => {}
        }
    }

    match try_parse_atom(expr, key_index, registry) {
        Some(element) => rpn.push(element),
        None => rpn.push(RpnElement::Unknown),
    }
}

/// The comparator as seen with the key on the left-hand side.
fn invert_comparator(name: &str) -> Option<&'static str> {
    Some(match name {
        "equals" => "equals",
        "notEquals" => "notEquals",
        "less" => "greater",
        "greater" => "less",
        "lessOrEquals" => "greaterOrEquals",
        "greaterOrEquals" => "lessOrEquals",
        // `in`, `notIn`, `like` have no inverted form: a constant on the
        // left is not constrainable.
        _ => return None,
    })
}

fn try_parse_atom(
    expr: &Expr,
    key_index: &HashMap<&str, usize>,
    registry: &FunctionRegistry,
) -> Option<RpnElement> {
    let Expr::Function { name, args } = expr else {
        return None;
    };

    // IN-family: first argument is the key side, the rest is the set.
    if name == "in" || name == "notIn" {
        if args.len() < 2 {
            return None;
        }
        let (key_column, chain) = unwrap_key_side(&args[0], key_index, registry)?;
        let values: Vec<Field> = args[1..]
            .iter()
            .map(|arg| fold_constants(arg, registry))
            .collect::<Option<_>>()?;
        let set: Arc<dyn SetLookup> = Arc::new(SortedSet::new(values));
        return Some(if name == "in" {
            RpnElement::InSet { key_column, set, chain }
        } else {
            RpnElement::NotInSet { key_column, set, chain }
        });
    }

    if args.len() != 2 {
        return None;
    }

    // Find the constant side; invert the comparator if it is on the left.
    let (function_name, key_side, constant) =
        if let Some(value) = fold_constants(&args[1], registry) {
            (name.as_str(), &args[0], value)
        } else if let Some(value) = fold_constants(&args[0], registry) {
            (invert_comparator(name)?, &args[1], value)
        } else {
            return None;
        };

    let (key_column, chain) = unwrap_key_side(key_side, key_index, registry)?;

    let range = match function_name {
        "equals" => Range::single_point(constant),
        "notEquals" => {
            return Some(RpnElement::NotInRange {
                key_column,
                range: Range::single_point(constant),
                chain,
            });
        }
        "less" => Range::right_bounded(constant, false),
        "greater" => Range::left_bounded(constant, false),
        "lessOrEquals" => Range::right_bounded(constant, true),
        "greaterOrEquals" => Range::left_bounded(constant, true),
        "like" => like_prefix_range(&constant)?,
        _ => return None,
    };
    Some(RpnElement::InRange {
        key_column,
        range,
        chain,
    })
}

/// Peel a chain of single-argument functions off a key-column reference.
/// Returns the column's key index and the chain, outermost first.
fn unwrap_key_side(
    expr: &Expr,
    key_index: &HashMap<&str, usize>,
    registry: &FunctionRegistry,
) -> Option<(usize, Chain)> {
    let mut chain: Chain = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Column(name) => {
                return key_index.get(name.as_str()).map(|&idx| (idx, chain));
            }
            Expr::Function { name, args } if args.len() == 1 => {
                chain.push(registry.get(name)?);
                current = &args[0];
            }
            _ => return None,
        }
    }
}

/// Range covering every string matching the fixed prefix of a LIKE
/// pattern: `[prefix, next_prefix)`, where `next_prefix` increments the
/// last non-0xFF byte and drops trailing 0xFF bytes. A pattern with no
/// fixed prefix constrains nothing.
fn like_prefix_range(pattern: &Field) -> Option<Range> {
    let Field::String(pattern) = pattern else {
        return None;
    };
    let mut prefix: Vec<u8> = Vec::new();
    let mut bytes = pattern.iter();
    while let Some(&b) = bytes.next() {
        match b {
            b'%' | b'_' => break,
            b'\\' => match bytes.next() {
                Some(&escaped) => prefix.push(escaped),
                None => break,
            },
            other => prefix.push(other),
        }
    }
    if prefix.is_empty() {
        return None;
    }

    let mut next = prefix.clone();
    while next.last() == Some(&0xFF) {
        next.pop();
    }
    Some(match next.last_mut() {
        None => Range::left_bounded(Field::String(prefix), true),
        Some(last) => {
            *last += 1;
            Range::bounded(Field::String(prefix), true, Field::String(next), false)
        }
    })
}

// ── Mark-range selection ───────────────────────────────────────────────────

/// Select the granule ranges of a part that may contain matching rows.
///
/// Binary-splits `[0, marks)` and discards any span whose key envelope
/// (first key of the span through first key of the following granule, or
/// open-ended for the trailing span) cannot match. Adjacent survivors are
/// coalesced.
pub fn select_mark_ranges(part: &DataPart, condition: &KeyCondition) -> Result<Vec<MarkRange>> {
    let marks_count = part.marks_count();
    if marks_count == 0 {
        return Ok(Vec::new());
    }
    if condition.always_unknown_or_true() {
        return Ok(vec![MarkRange {
            begin: 0,
            end: marks_count,
        }]);
    }

    let index = part.index();
    let mut result: Vec<MarkRange> = Vec::new();
    let mut stack = vec![(0usize, marks_count)];
    while let Some((begin, end)) = stack.pop() {
        let may_be_true = if end < marks_count {
            condition.may_be_true_in_range(&index[begin], &index[end])
        } else {
            condition.may_be_true_after_start(&index[begin])
        };
        if !may_be_true {
            continue;
        }
        if end - begin == 1 {
            match result.last_mut() {
                Some(last) if last.end == begin => last.end = end,
                _ => result.push(MarkRange { begin, end }),
            }
        } else {
            let mid = begin + (end - begin) / 2;
            // Push the right half first so the left half is processed
            // first and ranges come out in ascending order.
            stack.push((mid, end));
            stack.push((begin, mid));
        }
    }
    Ok(result)
}
