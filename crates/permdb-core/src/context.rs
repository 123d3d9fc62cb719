//! Context pairs and context-sets.
//!
//! A context is a single key/value pair such as `world=nether`. A set of
//! contexts identifies the scope a [`Segment`](crate::segment::Segment)
//! applies under; the empty set is the global scope.

use std::collections::BTreeSet;
use std::fmt;

/// A single key/value pair scoping permission data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Context {
    key: String,
    value: String,
}

impl Context {
    /// Creates a new context pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The context key, e.g. `world`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The context value, e.g. `nether`.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl From<(&str, &str)> for Context {
    fn from((key, value): (&str, &str)) -> Self {
        Self::new(key, value)
    }
}

impl From<(String, String)> for Context {
    fn from((key, value): (String, String)) -> Self {
        Self { key, value }
    }
}

/// The scope a segment applies under. Empty means global.
///
/// Keyed by structural equality: two sets with the same pairs identify the
/// same segment regardless of construction order.
pub type ContextSet = BTreeSet<Context>;

/// Builds a context set from key/value pairs.
#[must_use]
pub fn context_set<C: Into<Context>>(pairs: impl IntoIterator<Item = C>) -> ContextSet {
    pairs.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_set_is_order_insensitive() {
        let a = context_set([("world", "nether"), ("server", "lobby")]);
        let b = context_set([("server", "lobby"), ("world", "nether")]);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_set_is_global() {
        assert!(context_set::<Context>([]).is_empty());
    }
}
