//! # Predicate Algebra
//!
//! Boolean expression trees over typed leaf comparisons.
//!
//! A predicate is both a wire payload (it derives serde and carries no
//! backend vocabulary) and an executable filter evaluated against any
//! [`Subject`]: a domain object, a linker or a bare key.
//!
//! Leaf semantics:
//! - an absent actual value yields the leaf's `negated` flag
//! - otherwise the comparison result is XORed with `negated`
//!
//! [`Predicate::to_and_or`] rewrites the sixteen binary operators into an
//! equivalent tree that only uses AND, OR and NOT.

pub mod compare;

use crate::key::MeshKey;
use crate::types::{DomainLinker, DomainObject, MeshError};
use crate::value::Value;
use compare::InSet;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

// =============================================================================
// BINARY OPERATORS
// =============================================================================

/// The sixteen two-input boolean operators.
///
/// Names describe the truth table over `(left, right)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Always false.
    False,
    /// `l ∧ r`
    And,
    /// `l ∧ ¬r`
    Inhibit,
    /// `l`
    Left,
    /// `¬l ∧ r`
    InhibitedBy,
    /// `r`
    Right,
    /// `l ⊕ r`
    Xor,
    /// `l ∨ r`
    Or,
    /// `¬(l ∨ r)`
    Nor,
    /// `l ↔ r`
    Xnor,
    /// `¬r`
    NotRight,
    /// `l ∨ ¬r`
    ImpliedBy,
    /// `¬l`
    NotLeft,
    /// `¬l ∨ r`
    Implies,
    /// `¬(l ∧ r)`
    Nand,
    /// Always true.
    True,
}

impl BinaryOp {
    /// Every operator, in truth-table order.
    pub const ALL: [BinaryOp; 16] = [
        Self::False,
        Self::And,
        Self::Inhibit,
        Self::Left,
        Self::InhibitedBy,
        Self::Right,
        Self::Xor,
        Self::Or,
        Self::Nor,
        Self::Xnor,
        Self::NotRight,
        Self::ImpliedBy,
        Self::NotLeft,
        Self::Implies,
        Self::Nand,
        Self::True,
    ];

    /// Apply the operator to two truth values.
    #[must_use]
    pub const fn apply(self, l: bool, r: bool) -> bool {
        match self {
            Self::False => false,
            Self::And => l && r,
            Self::Inhibit => l && !r,
            Self::Left => l,
            Self::InhibitedBy => !l && r,
            Self::Right => r,
            Self::Xor => l != r,
            Self::Or => l || r,
            Self::Nor => !(l || r),
            Self::Xnor => l == r,
            Self::NotRight => !r,
            Self::ImpliedBy => l || !r,
            Self::NotLeft => !l,
            Self::Implies => !l || r,
            Self::Nand => !(l && r),
            Self::True => true,
        }
    }

    /// Whether swapping the operands preserves the result.
    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::False | Self::And | Self::Xor | Self::Or | Self::Nor | Self::Xnor | Self::Nand | Self::True
        )
    }
}

// =============================================================================
// LEAVES
// =============================================================================

/// What a leaf reads from its subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// A named property value.
    Property(String),
    /// The subject's own key.
    Key,
    /// A metadata field (`CreatedAt`, `UpdatedBy`, ...).
    Meta(String),
}

/// Comparison kinds available to a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareKind {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    /// SQL-style pattern match with `%` and `_`.
    Like,
    /// Membership in a list literal.
    In,
    /// Inverted equality; incomparable pairs count as "not equal".
    Not,
}

/// Deferred literal, resolved at evaluation time.
#[derive(Clone)]
pub struct ValueProvider(Arc<dyn Fn() -> Value + Send + Sync>);

impl ValueProvider {
    pub fn new(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn get(&self) -> Value {
        (self.0)()
    }
}

impl fmt::Debug for ValueProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueProvider(..)")
    }
}

/// A leaf comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub target: Target,
    pub kind: CompareKind,
    /// Stored literal.
    pub value: Option<Value>,
    /// Deferred literal; never serialized.
    #[serde(skip)]
    pub provider: Option<ValueProvider>,
    pub negated: bool,
    #[serde(skip)]
    in_set: OnceLock<Arc<InSet>>,
}

impl PartialEq for Comparison {
    fn eq(&self, other: &Self) -> bool {
        let same_provider = match (&self.provider, &other.provider) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.0, &b.0),
            (None, None) => true,
            _ => false,
        };
        self.target == other.target
            && self.kind == other.kind
            && self.value == other.value
            && self.negated == other.negated
            && same_provider
    }
}

impl Comparison {
    /// Leaf with a stored literal.
    #[must_use]
    pub fn new(target: Target, kind: CompareKind, value: impl Into<Value>) -> Self {
        Self {
            target,
            kind,
            value: Some(value.into()),
            provider: None,
            negated: false,
            in_set: OnceLock::new(),
        }
    }

    /// Leaf whose literal is computed when evaluated.
    #[must_use]
    pub fn deferred(target: Target, kind: CompareKind, provider: ValueProvider) -> Self {
        Self {
            target,
            kind,
            value: None,
            provider: Some(provider),
            negated: false,
            in_set: OnceLock::new(),
        }
    }

    fn literal(&self) -> Result<Cow<'_, Value>, MeshError> {
        if let Some(value) = &self.value {
            return Ok(Cow::Borrowed(value));
        }
        match &self.provider {
            Some(provider) => Ok(Cow::Owned(provider.get())),
            None => Err(MeshError::MalformedPredicate(format!(
                "{:?} comparison on {:?} has neither a value nor a provider",
                self.kind, self.target
            ))),
        }
    }

    fn membership(&self, literal: &Value) -> Result<Arc<InSet>, MeshError> {
        // Deferred literals may change between evaluations.
        if self.value.is_none() {
            return InSet::build(literal).map(Arc::new);
        }
        if let Some(set) = self.in_set.get() {
            return Ok(Arc::clone(set));
        }
        let set = Arc::new(InSet::build(literal)?);
        Ok(Arc::clone(self.in_set.get_or_init(|| set)))
    }

    /// Evaluate against a subject.
    pub fn evaluate(&self, subject: &dyn Subject) -> Result<bool, MeshError> {
        let literal = self.literal()?;
        let actual = match &self.target {
            Target::Property(name) => subject.property(name),
            Target::Key => subject.subject_key().map(|k| Cow::Owned(Value::Key(k.clone()))),
            Target::Meta(name) => subject.meta(name).map(Cow::Owned),
        };
        let Some(actual) = actual else {
            return Ok(self.negated);
        };
        let raw = match self.kind {
            CompareKind::In => self.membership(&literal)?.contains(&actual),
            kind => compare::compare(&literal, &actual, kind)?,
        };
        Ok(raw != self.negated)
    }
}

// =============================================================================
// SUBJECTS
// =============================================================================

/// Anything a predicate can be evaluated against.
pub trait Subject {
    /// The subject's key, if it has one.
    fn subject_key(&self) -> Option<&MeshKey>;
    /// A property value.
    fn property(&self, name: &str) -> Option<Cow<'_, Value>>;
    /// A metadata field.
    fn meta(&self, name: &str) -> Option<Value>;
}

impl Subject for DomainObject {
    fn subject_key(&self) -> Option<&MeshKey> {
        (!self.key.is_null()).then_some(&self.key)
    }

    fn property(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.values.get(name).map(Cow::Borrowed)
    }

    fn meta(&self, name: &str) -> Option<Value> {
        self.meta.get(name)
    }
}

/// Linkers expose `SKey`, `TKey`, `SMember`, `TMember` and `LinkExtra` as
/// properties; their key is the edge identity.
pub struct LinkerSubject<'a> {
    linker: &'a DomainLinker,
    key: MeshKey,
}

impl<'a> LinkerSubject<'a> {
    #[must_use]
    pub fn new(linker: &'a DomainLinker) -> Self {
        Self {
            linker,
            key: linker.key(),
        }
    }
}

impl Subject for LinkerSubject<'_> {
    fn subject_key(&self) -> Option<&MeshKey> {
        Some(&self.key)
    }

    fn property(&self, name: &str) -> Option<Cow<'_, Value>> {
        self.linker.field(name).map(Cow::Owned)
    }

    fn meta(&self, name: &str) -> Option<Value> {
        self.linker.meta(name)
    }
}

/// A bare key with no properties.
impl Subject for MeshKey {
    fn subject_key(&self) -> Option<&MeshKey> {
        (!self.is_null()).then_some(self)
    }

    fn property(&self, _name: &str) -> Option<Cow<'_, Value>> {
        None
    }

    fn meta(&self, _name: &str) -> Option<Value> {
        None
    }
}

// =============================================================================
// TREE
// =============================================================================

/// A predicate tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Binary {
        op: BinaryOp,
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
    Not(Box<Predicate>),
    Leaf(Comparison),
}

impl Predicate {
    // --- construction ------------------------------------------------------

    fn property(name: impl Into<String>, kind: CompareKind, value: impl Into<Value>) -> Self {
        Self::Leaf(Comparison::new(Target::Property(name.into()), kind, value))
    }

    /// `property = value`
    #[must_use]
    pub fn equal(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(name, CompareKind::Equal, value)
    }

    /// `property != value`
    #[must_use]
    pub fn not_equal(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(name, CompareKind::NotEqual, value)
    }

    /// `property > value`
    #[must_use]
    pub fn greater(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(name, CompareKind::Greater, value)
    }

    /// `property >= value`
    #[must_use]
    pub fn greater_or_equal(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(name, CompareKind::GreaterOrEqual, value)
    }

    /// `property < value`
    #[must_use]
    pub fn less(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(name, CompareKind::Less, value)
    }

    /// `property <= value`
    #[must_use]
    pub fn less_or_equal(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(name, CompareKind::LessOrEqual, value)
    }

    /// `property like pattern`
    #[must_use]
    pub fn like(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::property(name, CompareKind::Like, Value::Str(pattern.into()))
    }

    /// `property in (values)`
    #[must_use]
    pub fn is_in(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self::property(name, CompareKind::In, Value::List(values))
    }

    /// `key = key`
    #[must_use]
    pub fn key_eq(key: MeshKey) -> Self {
        Self::Leaf(Comparison::new(Target::Key, CompareKind::Equal, key))
    }

    /// `key in (keys)`
    #[must_use]
    pub fn keys_in<'a>(keys: impl IntoIterator<Item = &'a MeshKey>) -> Self {
        let list = keys.into_iter().cloned().map(Value::Key).collect();
        Self::Leaf(Comparison::new(Target::Key, CompareKind::In, Value::List(list)))
    }

    /// Comparison on a metadata field.
    #[must_use]
    pub fn meta(field: impl Into<String>, kind: CompareKind, value: impl Into<Value>) -> Self {
        Self::Leaf(Comparison::new(Target::Meta(field.into()), kind, value))
    }

    /// Combine two predicates with any binary operator.
    #[must_use]
    pub fn binary(op: BinaryOp, left: Predicate, right: Predicate) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        Self::binary(BinaryOp::Or, self, other)
    }

    /// Flip a leaf's `negated` flag, or wrap anything else in NOT.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Leaf(mut leaf) => {
                leaf.negated = !leaf.negated;
                Self::Leaf(leaf)
            }
            other => !other,
        }
    }

    /// AND together every present predicate. `None` when there are none.
    #[must_use]
    pub fn and_all(parts: impl IntoIterator<Item = Option<Predicate>>) -> Option<Predicate> {
        parts
            .into_iter()
            .flatten()
            .reduce(|acc, next| acc.and(next))
    }

    // --- evaluation --------------------------------------------------------

    /// Evaluate against a subject.
    pub fn evaluate(&self, subject: &dyn Subject) -> Result<bool, MeshError> {
        match self {
            Self::Binary { op, left, right } => {
                // Short-circuit where the left operand decides the result.
                let l = left.evaluate(subject)?;
                match (op, l) {
                    (BinaryOp::And, false) => Ok(false),
                    (BinaryOp::Or, true) => Ok(true),
                    (BinaryOp::False, _) => Ok(false),
                    (BinaryOp::True, _) => Ok(true),
                    _ => Ok(op.apply(l, right.evaluate(subject)?)),
                }
            }
            Self::Not(inner) => Ok(!inner.evaluate(subject)?),
            Self::Leaf(leaf) => leaf.evaluate(subject),
        }
    }

    /// Evaluate an optional filter; no filter accepts everything.
    pub fn accepts(filter: Option<&Predicate>, subject: &dyn Subject) -> Result<bool, MeshError> {
        filter.map_or(Ok(true), |p| p.evaluate(subject))
    }

    /// Check every leaf has a value or provider.
    pub fn validate(&self) -> Result<(), MeshError> {
        match self {
            Self::Binary { left, right, .. } => {
                left.validate()?;
                right.validate()
            }
            Self::Not(inner) => inner.validate(),
            Self::Leaf(leaf) => leaf.literal().map(|_| ()),
        }
    }

    // --- rewriting ---------------------------------------------------------

    /// Equivalent tree that uses only AND, OR and NOT.
    ///
    /// Operands referenced twice by the rewrite are cloned, so the output
    /// never shares nodes with `self`.
    #[must_use]
    pub fn to_and_or(&self) -> Predicate {
        match self {
            Self::Leaf(_) => self.clone(),
            Self::Not(inner) => !inner.to_and_or(),
            Self::Binary { op, left, right } => {
                let a = left.to_and_or();
                let b = right.to_and_or();
                match op {
                    BinaryOp::False => a.clone().and(!a),
                    BinaryOp::And => a.and(b),
                    BinaryOp::Inhibit => a.and(!b),
                    BinaryOp::Left => a,
                    BinaryOp::InhibitedBy => (!a.clone()).and(b),
                    BinaryOp::Right => b,
                    BinaryOp::Xor => a.clone().and(!b.clone()).or((!a).and(b)),
                    BinaryOp::Or => a.or(b),
                    BinaryOp::Nor => !a.or(b),
                    BinaryOp::Xnor => a.clone().and(b.clone()).or((!a).and(!b)),
                    BinaryOp::NotRight => !b,
                    BinaryOp::ImpliedBy => a.or(!b),
                    BinaryOp::NotLeft => !a,
                    BinaryOp::Implies => (!a).or(b),
                    BinaryOp::Nand => !a.and(b),
                    BinaryOp::True => a.clone().or(!a),
                }
            }
        }
    }

    /// Replace deferred providers with their current literal so the tree can
    /// cross a serialization boundary.
    #[must_use]
    pub fn resolve(&self) -> Predicate {
        match self {
            Self::Binary { op, left, right } => Self::binary(*op, left.resolve(), right.resolve()),
            Self::Not(inner) => !inner.resolve(),
            Self::Leaf(leaf) => {
                let mut resolved = leaf.clone();
                if resolved.value.is_none()
                    && let Some(provider) = resolved.provider.take()
                {
                    resolved.value = Some(provider.get());
                }
                resolved.in_set = OnceLock::new();
                Self::Leaf(resolved)
            }
        }
    }

    /// The key set this predicate is restricted to, when it is a conjunction
    /// containing at least one positive `key = ` / `key in` leaf.
    ///
    /// Stores use this to read candidate rows directly instead of scanning.
    #[must_use]
    pub fn key_restriction(&self) -> Option<BTreeSet<MeshKey>> {
        match self {
            Self::Leaf(leaf) if leaf.target == Target::Key && !leaf.negated => {
                let value = leaf.value.as_ref()?;
                match (leaf.kind, value) {
                    (CompareKind::Equal, Value::Key(key)) => Some(BTreeSet::from([key.clone()])),
                    (CompareKind::In, Value::List(items)) => {
                        items.iter().map(|v| v.as_key().cloned()).collect()
                    }
                    _ => None,
                }
            }
            Self::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => match (left.key_restriction(), right.key_restriction()) {
                (Some(l), Some(r)) => Some(l.intersection(&r).cloned().collect()),
                (Some(one), None) | (None, Some(one)) => Some(one),
                (None, None) => None,
            },
            _ => None,
        }
    }

    /// JSON wire form. Providers are resolved first.
    pub fn to_json(&self) -> Result<String, MeshError> {
        serde_json::to_string(&self.resolve()).map_err(|e| MeshError::Serialization(e.to_string()))
    }

    /// Parse the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        serde_json::from_str(json).map_err(|e| MeshError::Serialization(e.to_string()))
    }
}

impl std::ops::Not for Predicate {
    type Output = Predicate;

    /// Wrap in a NOT node.
    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

// =============================================================================
// TESTS
// =============================================================================
