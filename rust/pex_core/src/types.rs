//! Domain types shared across pex_core modules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PermissionError;

/// Subject identity: `(collection, identity)`, e.g. `group:admin`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SubjectRef {
    pub collection: String,
    pub identity: String,
}

impl SubjectRef {
    pub fn new(collection: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.identity)
    }
}

impl FromStr for SubjectRef {
    type Err = PermissionError;

    /// Parse `collection:identity`, splitting on the first `:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((collection, identity)) if !collection.is_empty() && !identity.is_empty() => {
                Ok(SubjectRef::new(collection, identity))
            }
            _ => Err(PermissionError::InvalidSubjectRef(s.to_string())),
        }
    }
}

/// A situational key-value qualifier, e.g. `world=nether`.
///
/// `exact` forces plain string comparison, bypassing any context definition
/// registered for the key.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ContextValue {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub exact: bool,
}

impl ContextValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            exact: false,
        }
    }

    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            exact: true,
            ..Self::new(key, value)
        }
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let eq = if self.exact { "==" } else { "=" };
        write!(f, "{}{}{}", self.key, eq, self.value)
    }
}

/// Unordered set of contexts, stored sorted and deduplicated so that
/// set-equal collections compare, hash and key identically.
///
/// Keys need not be unique: `world=a` and `world=b` may both be present.
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(from = "Vec<ContextValue>", into = "Vec<ContextValue>")]
pub struct ContextSet(Vec<ContextValue>);

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ContextValue> {
        self.0.iter()
    }

    /// Values present for `key`.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a ContextValue> + 'a {
        self.0.iter().filter(move |c| c.key == key)
    }

    pub fn insert(&mut self, value: ContextValue) {
        if let Err(pos) = self.0.binary_search(&value) {
            self.0.insert(pos, value);
        }
    }

    /// Union of two sets.
    pub fn union(&self, other: &ContextSet) -> ContextSet {
        self.0.iter().chain(other.0.iter()).cloned().collect()
    }
}

impl From<Vec<ContextValue>> for ContextSet {
    fn from(mut values: Vec<ContextValue>) -> Self {
        values.sort();
        values.dedup();
        ContextSet(values)
    }
}

impl From<ContextSet> for Vec<ContextValue> {
    fn from(set: ContextSet) -> Self {
        set.0
    }
}

impl FromIterator<ContextValue> for ContextSet {
    fn from_iter<I: IntoIterator<Item = ContextValue>>(iter: I) -> Self {
        ContextSet::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<'a> IntoIterator for &'a ContextSet {
    type Item = &'a ContextValue;
    type IntoIter = std::slice::Iter<'a, ContextValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for ContextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, ctx) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", ctx)?;
        }
        f.write_str("}")
    }
}

/// Effective outcome of a point query.
///
/// A valid denial is `Denied`, never an error; resolution failures are
/// reported through `PermissionError`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Decision {
    /// Positive rule value (magnitude kept).
    Granted(i32),
    /// Negative rule value (magnitude kept, still negative).
    Denied(i32),
    /// No rule matched, or the winning rule was an explicit zero reset.
    Undefined,
}

impl Decision {
    pub fn from_value(value: i32) -> Self {
        match value {
            v if v > 0 => Decision::Granted(v),
            v if v < 0 => Decision::Denied(v),
            _ => Decision::Undefined,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Decision::Undefined)
    }

    /// Raw rule value; `0` for `Undefined`.
    pub fn value(&self) -> i32 {
        match *self {
            Decision::Granted(v) | Decision::Denied(v) => v,
            Decision::Undefined => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_ref_round_trips_display() {
        let r: SubjectRef = "group:admin".parse().unwrap();
        assert_eq!(r, SubjectRef::new("group", "admin"));
        assert_eq!(r.to_string(), "group:admin");

        // identity may itself contain ':'
        let r: SubjectRef = "user:a:b".parse().unwrap();
        assert_eq!(r.identity, "a:b");
    }

    #[test]
    fn subject_ref_rejects_missing_parts() {
        assert!("admin".parse::<SubjectRef>().is_err());
        assert!(":admin".parse::<SubjectRef>().is_err());
        assert!("group:".parse::<SubjectRef>().is_err());
    }

    #[test]
    fn context_set_is_order_independent() {
        let a: ContextSet = vec![
            ContextValue::new("world", "nether"),
            ContextValue::new("server", "lobby"),
        ]
        .into();
        let b: ContextSet = vec![
            ContextValue::new("server", "lobby"),
            ContextValue::new("world", "nether"),
            ContextValue::new("world", "nether"),
        ]
        .into();
        assert_eq!(a, b);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn context_set_allows_repeated_keys() {
        let mut set = ContextSet::new();
        set.insert(ContextValue::new("world", "a"));
        set.insert(ContextValue::new("world", "b"));
        set.insert(ContextValue::new("world", "a"));
        assert_eq!(set.values("world").count(), 2);
    }

    #[test]
    fn decision_from_value() {
        assert_eq!(Decision::from_value(3), Decision::Granted(3));
        assert_eq!(Decision::from_value(-1), Decision::Denied(-1));
        assert_eq!(Decision::from_value(0), Decision::Undefined);
        assert_eq!(Decision::Denied(-4).value(), -4);
    }
}
