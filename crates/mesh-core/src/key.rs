//! # Mesh Keys
//!
//! Hierarchical, string-serializable identifiers used for every addressable
//! entity: domains, realized domains, objects and links.
//!
//! A key is an open map of named string parts. Its serialized form is
//! derived deterministically from the parts (sorted by name, separators
//! escaped) and is the key's sole identity: equality, ordering and hashing
//! all go through it.

use crate::primitives::{
    KEY_ESCAPE, KEY_NAME_SEPARATOR, KEY_PAIR_SEPARATOR, PART_DOMAIN, PART_LINK_EXTRA, PART_SKEY,
    PART_SMEMBER, PART_TKEY, PART_TMEMBER, PART_UNIQUE,
};
use crate::types::MeshError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// The well-known key parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    /// The owning (realized) domain.
    Domain,
    /// Per-object unique tag.
    Unique,
    /// Subject endpoint of a link.
    SKey,
    /// Target endpoint of a link.
    TKey,
    /// Subject-side role name.
    SMember,
    /// Target-side role name.
    TMember,
    /// Link discriminator.
    LinkExtra,
}

impl KeyPart {
    /// The part name used in serialized keys.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Domain => PART_DOMAIN,
            Self::Unique => PART_UNIQUE,
            Self::SKey => PART_SKEY,
            Self::TKey => PART_TKEY,
            Self::SMember => PART_SMEMBER,
            Self::TMember => PART_TMEMBER,
            Self::LinkExtra => PART_LINK_EXTRA,
        }
    }
}

/// A composite key.
///
/// The empty key (no parts) is the distinguished null key.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MeshKey {
    parts: BTreeMap<String, String>,
    text: String,
}

impl MeshKey {
    /// The null key ("no value").
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }

    /// Build a key from a single part.
    #[must_use]
    pub fn with_part(part: impl Into<String>, value: impl Into<String>) -> Self {
        let mut key = Self::null();
        key.set_part(part, value);
        key
    }

    /// Whether this is the null key.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.parts.is_empty()
    }

    /// Set a part and re-derive the serialized form.
    ///
    /// Unrecognized part names are accepted; parts are an open map.
    pub fn set_part(&mut self, part: impl Into<String>, value: impl Into<String>) {
        self.parts.insert(part.into(), value.into());
        self.text = serialize(&self.parts);
    }

    /// Builder-style variant of [`MeshKey::set_part`].
    #[must_use]
    pub fn and(mut self, part: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_part(part, value);
        self
    }

    /// Set a part whose value is itself a key.
    pub fn set_key_part(&mut self, part: impl Into<String>, value: &MeshKey) {
        self.set_part(part, value.as_str());
    }

    /// Remove a part. Returns the previous raw value.
    pub fn remove_part(&mut self, part: &str) -> Option<String> {
        let removed = self.parts.remove(part);
        if removed.is_some() {
            self.text = serialize(&self.parts);
        }
        removed
    }

    /// Raw string value of a part.
    #[must_use]
    pub fn part(&self, part: &str) -> Option<&str> {
        self.parts.get(part).map(String::as_str)
    }

    /// Extract a sub-key stored in a part.
    ///
    /// A part that was never set yields the null key.
    pub fn get_key_part(&self, part: &str) -> Result<MeshKey, MeshError> {
        match self.parts.get(part) {
            Some(raw) => raw.parse(),
            None => Ok(Self::null()),
        }
    }

    /// Typed accessor for the well-known parts.
    pub fn get(&self, part: KeyPart) -> Result<MeshKey, MeshError> {
        self.get_key_part(part.name())
    }

    /// Iterate parts in serialization order.
    pub fn parts(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parts.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Identity comparison (serialized-form equality).
    #[must_use]
    pub fn equals_key(&self, other: &MeshKey) -> bool {
        self.text == other.text
    }

    /// The serialized form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

// =============================================================================
// SERIALIZATION
// =============================================================================

fn escape_into(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        if ch == KEY_ESCAPE || ch == KEY_PAIR_SEPARATOR || ch == KEY_NAME_SEPARATOR {
            out.push(KEY_ESCAPE);
        }
        out.push(ch);
    }
}

fn serialize(parts: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (i, (name, value)) in parts.iter().enumerate() {
        if i > 0 {
            out.push(KEY_PAIR_SEPARATOR);
        }
        escape_into(&mut out, name);
        out.push(KEY_NAME_SEPARATOR);
        escape_into(&mut out, value);
    }
    out
}

fn finish_part(
    parts: &mut BTreeMap<String, String>,
    name: &mut String,
    value: &mut String,
    in_value: bool,
    text: &str,
) -> Result<(), MeshError> {
    if !in_value {
        return Err(MeshError::KeyParse(format!(
            "part '{}' has no '{}' separator in '{}'",
            name, KEY_NAME_SEPARATOR, text
        )));
    }
    parts.insert(std::mem::take(name), std::mem::take(value));
    Ok(())
}

fn parse(text: &str) -> Result<BTreeMap<String, String>, MeshError> {
    let mut parts = BTreeMap::new();
    if text.is_empty() {
        return Ok(parts);
    }

    let mut name = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        if ch == KEY_ESCAPE {
            let Some(escaped) = chars.next() else {
                return Err(MeshError::KeyParse(format!(
                    "dangling escape at end of '{}'",
                    text
                )));
            };
            if in_value {
                value.push(escaped);
            } else {
                name.push(escaped);
            }
        } else if ch == KEY_PAIR_SEPARATOR {
            finish_part(&mut parts, &mut name, &mut value, in_value, text)?;
            in_value = false;
        } else if ch == KEY_NAME_SEPARATOR {
            if in_value {
                return Err(MeshError::KeyParse(format!(
                    "unescaped '{}' inside value of '{}'",
                    KEY_NAME_SEPARATOR, text
                )));
            }
            in_value = true;
        } else if in_value {
            value.push(ch);
        } else {
            name.push(ch);
        }
    }
    finish_part(&mut parts, &mut name, &mut value, in_value, text)?;
    Ok(parts)
}

impl FromStr for MeshKey {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = parse(s)?;
        let text = serialize(&parts);
        Ok(Self { parts, text })
    }
}

impl TryFrom<String> for MeshKey {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MeshKey> for String {
    fn from(key: MeshKey) -> Self {
        key.text
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

impl PartialEq for MeshKey {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for MeshKey {}

impl PartialOrd for MeshKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MeshKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.text.cmp(&other.text)
    }
}

impl Hash for MeshKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl fmt::Debug for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshKey({:?})", self.text)
    }
}

impl fmt::Display for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
