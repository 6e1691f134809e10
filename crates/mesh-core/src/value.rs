//! # Values
//!
//! The closed set of runtime values a property, metadata field or predicate
//! literal can carry. Comparisons dispatch over pairs of these variants (see
//! `predicate::compare`), so adding a variant means extending that match.

use crate::key::MeshKey;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tagged runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(#[serde(with = "decimal_text")] Decimal),
    Str(String),
    Timestamp(DateTime<Utc>),
    Key(MeshKey),
    /// Homogeneous list: `in` literals and scalar collections.
    List(Vec<Value>),
}

impl Value {
    /// String helper.
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// The scalar type of this value. Lists have none.
    #[must_use]
    pub fn scalar_type(&self) -> Option<ScalarType> {
        Some(match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::I8(_) => ScalarType::I8,
            Self::I16(_) => ScalarType::I16,
            Self::I32(_) => ScalarType::I32,
            Self::I64(_) => ScalarType::I64,
            Self::U8(_) => ScalarType::U8,
            Self::U16(_) => ScalarType::U16,
            Self::U32(_) => ScalarType::U32,
            Self::U64(_) => ScalarType::U64,
            Self::F32(_) => ScalarType::F32,
            Self::F64(_) => ScalarType::F64,
            Self::Decimal(_) => ScalarType::Decimal,
            Self::Str(_) => ScalarType::Str,
            Self::Timestamp(_) => ScalarType::Timestamp,
            Self::Key(_) => ScalarType::Key,
            Self::List(_) => return None,
        })
    }

    /// Borrow as a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a key.
    #[must_use]
    pub fn as_key(&self) -> Option<&MeshKey> {
        match self {
            Self::Key(k) => Some(k),
            _ => None,
        }
    }

    /// Borrow list elements.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<MeshKey> for Value {
    fn from(k: MeshKey) -> Self {
        Self::Key(k)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

// =============================================================================
// SCALAR TYPES
// =============================================================================

/// Concrete scalar type of a property or generic binding.
///
/// The canonical name participates in realized-domain keys, so `Set<string>`
/// and `Set<i64>` address different storage shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Decimal,
    Str,
    Timestamp,
    Key,
}

impl ScalarType {
    /// Canonical type name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Decimal => "decimal",
            Self::Str => "string",
            Self::Timestamp => "timestamp",
            Self::Key => "key",
        }
    }

    /// Whether a value may be stored in a property of this type.
    ///
    /// Integers are accepted by any integer type as long as the value fits;
    /// everything else must match exactly.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match value.scalar_type() {
            Some(actual) if actual == self => true,
            Some(actual) if actual.is_integer() && self.is_integer() => {
                crate::predicate::compare::integer_of(value)
                    .is_some_and(|wide| self.integer_range().contains(&wide))
            }
            _ => false,
        }
    }

    fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::U8 | Self::U16 | Self::U32 | Self::U64
        )
    }

    fn integer_range(self) -> std::ops::RangeInclusive<i128> {
        match self {
            Self::I8 => i128::from(i8::MIN)..=i128::from(i8::MAX),
            Self::I16 => i128::from(i16::MIN)..=i128::from(i16::MAX),
            Self::I32 => i128::from(i32::MIN)..=i128::from(i32::MAX),
            Self::U8 => 0..=i128::from(u8::MAX),
            Self::U16 => 0..=i128::from(u16::MAX),
            Self::U32 => 0..=i128::from(u32::MAX),
            Self::U64 => 0..=i128::from(u64::MAX),
            _ => i128::from(i64::MIN)..=i128::from(i64::MAX),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decimals travel as their canonical text so non-self-describing formats
/// (postcard) round-trip them.
mod decimal_text {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let text = String::deserialize(deserializer)?;
        Decimal::from_str(&text).map_err(serde::de::Error::custom)
    }
}
