//! Subject references.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::QueryError;

/// Sentinel id for refs and segments that have no database row yet.
pub(crate) const UNALLOCATED: i32 = i32::MIN;

/// Identity of an access-control subject: a (type, identifier) pair such as
/// `("group", "admin")`.
///
/// The row id is an implementation optimization, assigned lazily by the
/// data-access layer the first time the ref reaches the database. Equality
/// and hashing ignore it: two refs with the same type and identifier denote
/// the same subject. Because refs are shared behind `Arc`, the in-place id
/// assignment is visible to every holder once allocation happens.
pub struct SubjectRef {
    id: AtomicI32,
    subject_type: String,
    identifier: String,
}

impl SubjectRef {
    /// Creates a ref with no allocated row id.
    #[must_use]
    pub fn unresolved(subject_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            id: AtomicI32::new(UNALLOCATED),
            subject_type: subject_type.into(),
            identifier: identifier.into(),
        }
    }

    /// Creates a ref for a row already present in the database.
    pub(crate) fn resolved(
        id: i32,
        subject_type: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            id: AtomicI32::new(id),
            subject_type: subject_type.into(),
            identifier: identifier.into(),
        }
    }

    /// The allocated row id.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnallocatedReference`] if the ref has not been
    /// allocated yet.
    pub fn id(&self) -> Result<i32, QueryError> {
        match self.id.load(Ordering::SeqCst) {
            UNALLOCATED => Err(QueryError::UnallocatedReference),
            id => Ok(id),
        }
    }

    /// Whether the ref still has no database row.
    #[must_use]
    pub fn is_unallocated(&self) -> bool {
        self.id.load(Ordering::SeqCst) == UNALLOCATED
    }

    /// Writes the allocated row id. Single-assignment by the allocator
    /// inside the write transaction.
    pub(crate) fn set_id(&self, id: i32) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub(crate) fn raw_id(&self) -> i32 {
        self.id.load(Ordering::SeqCst)
    }

    /// The subject type, e.g. `group` or `user`.
    #[must_use]
    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    /// The subject identifier within its type.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The (type, identifier) pair.
    #[must_use]
    pub fn as_pair(&self) -> (&str, &str) {
        (&self.subject_type, &self.identifier)
    }
}

impl PartialEq for SubjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.subject_type == other.subject_type && self.identifier == other.identifier
    }
}

impl Eq for SubjectRef {}

impl Hash for SubjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.subject_type.hash(state);
        self.identifier.hash(state);
    }
}

impl fmt::Debug for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectRef")
            .field("subject_type", &self.subject_type)
            .field("identifier", &self.identifier)
            .field("id", &self.id.load(Ordering::SeqCst))
            .finish()
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_id() {
        let a = SubjectRef::unresolved("group", "admin");
        let b = SubjectRef::resolved(7, "group", "admin");
        assert_eq!(a, b);
    }

    #[test]
    fn unallocated_id_is_an_error() {
        let r = SubjectRef::unresolved("group", "admin");
        assert!(r.is_unallocated());
        assert!(matches!(r.id(), Err(QueryError::UnallocatedReference)));
    }

    #[test]
    fn allocation_is_observed() {
        let r = SubjectRef::unresolved("group", "admin");
        r.set_id(42);
        assert!(!r.is_unallocated());
        assert_eq!(r.id().expect("allocated"), 42);
    }
}
