//! # Comparison Dispatch
//!
//! Evaluates one leaf comparison between a literal and an actual value by
//! matching on the pair of value variants:
//!
//! - integers of the same signedness compare directly, mixed signedness
//!   checks the signed operand's sign first
//! - integer vs float widens to `f64`, integer vs decimal widens to `Decimal`
//! - strings compare lexically and support SQL-style `like`
//! - keys compare by identity only
//! - `in` builds a normalized set from the literal list

use crate::predicate::CompareKind;
use crate::primitives::MAX_LIKE_PATTERNS;
use crate::types::MeshError;
use crate::value::Value;
use chrono::{DateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{OnceLock, RwLock};

// =============================================================================
// NUMERIC VIEWS
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Int {
    Signed(i64),
    Unsigned(u64),
}

fn int_of(value: &Value) -> Option<Int> {
    Some(match value {
        Value::I8(v) => Int::Signed(i64::from(*v)),
        Value::I16(v) => Int::Signed(i64::from(*v)),
        Value::I32(v) => Int::Signed(i64::from(*v)),
        Value::I64(v) => Int::Signed(*v),
        Value::U8(v) => Int::Unsigned(u64::from(*v)),
        Value::U16(v) => Int::Unsigned(u64::from(*v)),
        Value::U32(v) => Int::Unsigned(u64::from(*v)),
        Value::U64(v) => Int::Unsigned(*v),
        _ => return None,
    })
}

/// Any integer value widened to `i128`.
pub(crate) fn integer_of(value: &Value) -> Option<i128> {
    int_of(value).map(|int| match int {
        Int::Signed(v) => i128::from(v),
        Int::Unsigned(v) => i128::from(v),
    })
}

fn float_of(value: &Value) -> Option<f64> {
    match value {
        Value::F32(v) => Some(f64::from(*v)),
        Value::F64(v) => Some(*v),
        _ => None,
    }
}

fn int_as_f64(int: Int) -> f64 {
    match int {
        Int::Signed(v) => v as f64,
        Int::Unsigned(v) => v as f64,
    }
}

fn int_as_decimal(int: Int) -> Decimal {
    match int {
        Int::Signed(v) => Decimal::from(v),
        Int::Unsigned(v) => Decimal::from(v),
    }
}

fn cmp_ints(actual: Int, literal: Int) -> Ordering {
    match (actual, literal) {
        (Int::Signed(a), Int::Signed(b)) => a.cmp(&b),
        (Int::Unsigned(a), Int::Unsigned(b)) => a.cmp(&b),
        (Int::Signed(a), Int::Unsigned(b)) => {
            if a < 0 {
                Ordering::Less
            } else {
                a.unsigned_abs().cmp(&b)
            }
        }
        (Int::Unsigned(a), Int::Signed(b)) => {
            if b < 0 {
                Ordering::Greater
            } else {
                a.cmp(&b.unsigned_abs())
            }
        }
    }
}

// =============================================================================
// PAIR DISPATCH
// =============================================================================

/// Outcome of ordering two values.
enum Order {
    /// Both operands have a total order and this is it (actual vs literal).
    Ordered(Ordering),
    /// Comparable but unordered (NaN involved).
    Unordered,
    /// Equality-only pair (keys).
    Identity(bool),
    /// No entry in the dispatch table.
    Incomparable,
}

fn order(actual: &Value, literal: &Value) -> Order {
    if let (Some(a), Some(b)) = (int_of(actual), int_of(literal)) {
        return Order::Ordered(cmp_ints(a, b));
    }

    let float_pair = match (float_of(actual), float_of(literal)) {
        (Some(a), Some(b)) => Some((a, b)),
        (None, Some(b)) => int_of(actual).map(|a| (int_as_f64(a), b)),
        (Some(a), None) => int_of(literal).map(|b| (a, int_as_f64(b))),
        (None, None) => None,
    };
    if let Some((a, b)) = float_pair {
        return a.partial_cmp(&b).map_or(Order::Unordered, Order::Ordered);
    }

    match (actual, literal) {
        (Value::Decimal(a), Value::Decimal(b)) => Order::Ordered(a.cmp(b)),
        (Value::Decimal(a), other) | (other, Value::Decimal(a)) => {
            let flipped = !matches!(actual, Value::Decimal(_));
            let ordering = if let Some(int) = int_of(other) {
                Some(a.cmp(&int_as_decimal(int)))
            } else if let Some(float) = float_of(other) {
                a.to_f64().and_then(|d| d.partial_cmp(&float))
            } else {
                return Order::Incomparable;
            };
            match ordering {
                Some(o) if flipped => Order::Ordered(o.reverse()),
                Some(o) => Order::Ordered(o),
                None => Order::Unordered,
            }
        }
        (Value::Str(a), Value::Str(b)) => Order::Ordered(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Order::Ordered(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Order::Ordered(a.cmp(b)),
        (Value::Key(a), Value::Key(b)) => Order::Identity(a.equals_key(b)),
        _ => Order::Incomparable,
    }
}

fn incomparable(literal: &Value, actual: &Value, kind: CompareKind) -> MeshError {
    MeshError::IncomparableValues {
        literal: describe(literal),
        actual: describe(actual),
        kind: format!("{:?}", kind),
    }
}

fn describe(value: &Value) -> String {
    value
        .scalar_type()
        .map_or_else(|| "list".to_string(), |t| t.name().to_string())
}

/// Compare `actual` against `literal` for every kind except `In`.
pub fn compare(literal: &Value, actual: &Value, kind: CompareKind) -> Result<bool, MeshError> {
    if kind == CompareKind::Like {
        return match (literal, actual) {
            (Value::Str(pattern), Value::Str(text)) => Ok(like_regex(pattern)?.is_match(text)),
            _ => Err(incomparable(literal, actual, kind)),
        };
    }
    if kind == CompareKind::In {
        return Ok(InSet::build(literal)?.contains(actual));
    }

    match order(actual, literal) {
        Order::Ordered(ordering) => Ok(match kind {
            CompareKind::Equal => ordering == Ordering::Equal,
            CompareKind::NotEqual | CompareKind::Not => ordering != Ordering::Equal,
            CompareKind::Greater => ordering == Ordering::Greater,
            CompareKind::GreaterOrEqual => ordering != Ordering::Less,
            CompareKind::Less => ordering == Ordering::Less,
            CompareKind::LessOrEqual => ordering != Ordering::Greater,
            CompareKind::Like | CompareKind::In => false,
        }),
        Order::Unordered => Ok(matches!(kind, CompareKind::NotEqual | CompareKind::Not)),
        Order::Identity(same) => match kind {
            CompareKind::Equal => Ok(same),
            CompareKind::NotEqual | CompareKind::Not => Ok(!same),
            _ => Err(incomparable(literal, actual, kind)),
        },
        Order::Incomparable => match kind {
            CompareKind::Not => Ok(true),
            _ => Err(incomparable(literal, actual, kind)),
        },
    }
}

// =============================================================================
// LIKE
// =============================================================================

/// Compiled patterns. Entries depend only on the pattern text, so the cache
/// is shared by every repository in the process; it is emptied once it
/// holds `MAX_LIKE_PATTERNS` entries.
static LIKE_CACHE: OnceLock<RwLock<BTreeMap<String, Regex>>> = OnceLock::new();

fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

/// Compile (or fetch) the regex for a `like` pattern.
fn like_regex(pattern: &str) -> Result<Regex, MeshError> {
    let cache = LIKE_CACHE.get_or_init(|| RwLock::new(BTreeMap::new()));
    {
        let read = cache
            .read()
            .map_err(|_| MeshError::LockPoisoned("like pattern cache"))?;
        if let Some(compiled) = read.get(pattern) {
            return Ok(compiled.clone());
        }
    }

    let compiled = Regex::new(&like_to_regex(pattern))
        .map_err(|e| MeshError::MalformedPredicate(format!("like pattern '{pattern}': {e}")))?;
    let mut write = cache
        .write()
        .map_err(|_| MeshError::LockPoisoned("like pattern cache"))?;
    if write.len() >= MAX_LIKE_PATTERNS && !write.contains_key(pattern) {
        write.clear();
    }
    Ok(write
        .entry(pattern.to_string())
        .or_insert(compiled)
        .clone())
}

// =============================================================================
// IN
// =============================================================================

/// Width-independent form of a scalar, used as a set element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Normalized {
    Bool(bool),
    Int(i128),
    Float(u64),
    Decimal(Decimal),
    Str(String),
    Timestamp(DateTime<Utc>),
    Key(String),
}

fn normalize(value: &Value) -> Option<Normalized> {
    if let Some(int) = integer_of(value) {
        return Some(Normalized::Int(int));
    }
    Some(match value {
        Value::F32(_) | Value::F64(_) => {
            let float = float_of(value)?;
            let as_int = float as i128;
            if float.is_finite() && float.fract() == 0.0 && (as_int as f64) == float {
                Normalized::Int(as_int)
            } else {
                Normalized::Float(float.to_bits())
            }
        }
        Value::Decimal(d) => {
            if d.fract().is_zero() {
                match d.to_i128() {
                    Some(int) => Normalized::Int(int),
                    None => Normalized::Decimal(d.normalize()),
                }
            } else {
                Normalized::Decimal(d.normalize())
            }
        }
        Value::Bool(b) => Normalized::Bool(*b),
        Value::Str(s) => Normalized::Str(s.clone()),
        Value::Timestamp(t) => Normalized::Timestamp(*t),
        Value::Key(k) => Normalized::Key(k.as_str().to_string()),
        _ => return None,
    })
}

/// Membership set built from an `in` literal.
///
/// Numeric elements of any width are coerced to a common representation,
/// so `U8(3)` is a member of `[I64(3)]`.
#[derive(Debug, Clone, Default)]
pub struct InSet {
    members: BTreeSet<Normalized>,
}

impl InSet {
    /// Build from a list literal.
    pub fn build(literal: &Value) -> Result<Self, MeshError> {
        let items = literal.as_list().ok_or_else(|| {
            MeshError::MalformedPredicate("'in' comparison requires a list literal".to_string())
        })?;
        Ok(Self {
            members: items.iter().filter_map(normalize).collect(),
        })
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, value: &Value) -> bool {
        normalize(value).is_some_and(|n| self.members.contains(&n))
    }

    /// Number of distinct members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::MeshKey;

    fn check(literal: Value, actual: Value, kind: CompareKind) -> bool {
        compare(&literal, &actual, kind).expect("comparable")
    }

    #[test]
    fn same_signedness_integers() {
        assert!(check(Value::I32(5), Value::I64(7), CompareKind::Greater));
        assert!(check(Value::U8(5), Value::U64(5), CompareKind::Equal));
    }

    #[test]
    fn mixed_signedness_checks_sign_first() {
        assert!(check(Value::U64(u64::MAX), Value::I8(-1), CompareKind::Less));
        assert!(check(Value::I64(-1), Value::U64(0), CompareKind::Greater));
        assert!(check(Value::I64(10), Value::U32(10), CompareKind::Equal));
        assert!(check(Value::U64(3), Value::I16(4), CompareKind::GreaterOrEqual));
    }

    #[test]
    fn integers_widen_to_float() {
        assert!(check(Value::F64(2.5), Value::I32(3), CompareKind::Greater));
        assert!(check(Value::I32(3), Value::F32(2.5), CompareKind::Less));
        assert!(check(Value::F64(f64::NAN), Value::I32(3), CompareKind::NotEqual));
        assert!(!check(Value::F64(f64::NAN), Value::I32(3), CompareKind::Equal));
    }

    #[test]
    fn integers_widen_to_decimal() {
        let half = Value::Decimal(Decimal::new(25, 1));
        assert!(check(half.clone(), Value::U8(3), CompareKind::Greater));
        assert!(check(Value::I64(2), half, CompareKind::Greater));
    }

    #[test]
    fn strings_and_like() {
        assert!(check(Value::str("b"), Value::str("a"), CompareKind::Less));
        assert!(check(Value::str("vi%"), Value::str("vip"), CompareKind::Like));
        assert!(check(Value::str("v_p"), Value::str("vip"), CompareKind::Like));
        assert!(!check(Value::str("v_p"), Value::str("vp"), CompareKind::Like));
        assert!(check(Value::str("a.c"), Value::str("a.c"), CompareKind::Like));
        assert!(!check(Value::str("a.c"), Value::str("abc"), CompareKind::Like));
    }

    #[test]
    fn like_cache_stays_bounded() {
        for i in 0..MAX_LIKE_PATTERNS + 10 {
            let pattern = format!("bounded-{i}%");
            assert!(check(Value::Str(pattern), Value::str(format!("bounded-{i}x")), CompareKind::Like));
        }
        let cache = LIKE_CACHE.get().expect("cache").read().expect("read");
        assert!(cache.len() <= MAX_LIKE_PATTERNS);
    }

    #[test]
    fn keys_compare_by_identity_only() {
        let a = MeshKey::with_part("Unique", "a");
        let b = MeshKey::with_part("Unique", "b");
        assert!(check(Value::Key(a.clone()), Value::Key(a.clone()), CompareKind::Equal));
        assert!(check(Value::Key(a.clone()), Value::Key(b.clone()), CompareKind::NotEqual));
        assert!(compare(&Value::Key(a), &Value::Key(b), CompareKind::Greater).is_err());
    }

    #[test]
    fn incomparable_pairs() {
        assert!(compare(&Value::str("1"), &Value::I32(1), CompareKind::Equal).is_err());
        assert!(check(Value::str("1"), Value::I32(1), CompareKind::Not));
        assert!(compare(&Value::I32(1), &Value::str("x"), CompareKind::Like).is_err());
    }

    #[test]
    fn in_set_coerces_numeric_widths() {
        let set = InSet::build(&Value::List(vec![Value::I64(3), Value::F64(4.0)])).expect("set");
        assert!(set.contains(&Value::U8(3)));
        assert!(set.contains(&Value::I16(4)));
        assert!(set.contains(&Value::Decimal(Decimal::new(30, 1))));
        assert!(!set.contains(&Value::I32(5)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn in_requires_list_literal() {
        assert!(InSet::build(&Value::I32(1)).is_err());
    }
}
