//! Context-scoped permission segments.
//!
//! A segment is the unit of stored permission state for one subject under
//! one context-set: a permission map, an option map, an ordered parent
//! list, and an optional default value. Segments are immutable; every
//! `with_*` builder returns a new segment reflecting the change and appends
//! a [`SegmentUpdate`] describing how to replay that change against the
//! database. The flusher interprets the queued updates inside the write
//! transaction.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use im::HashMap;

use crate::context::ContextSet;
use crate::error::QueryError;
use crate::subject::{SubjectRef, UNALLOCATED};

/// One queued change against a segment's database rows.
#[derive(Debug, Clone)]
pub enum SegmentUpdate {
    /// Upsert one permission row.
    SetPermission {
        /// Permission key.
        key: String,
        /// Nonzero permission value.
        value: i32,
    },
    /// Delete one permission row.
    ClearPermission {
        /// Permission key.
        key: String,
    },
    /// Delete every permission row, then insert the given set.
    ReplacePermissions {
        /// The replacement permission map.
        values: HashMap<String, i32>,
    },
    /// Upsert one option row.
    SetOption {
        /// Option key.
        key: String,
        /// Option value.
        value: String,
    },
    /// Delete one option row.
    ClearOption {
        /// Option key.
        key: String,
    },
    /// Delete every option row, then insert the given set.
    ReplaceOptions {
        /// The replacement option map.
        values: HashMap<String, String>,
    },
    /// Insert one parent row.
    AddParent {
        /// The parent subject.
        parent: Arc<SubjectRef>,
    },
    /// Delete one parent row.
    RemoveParent {
        /// The parent subject.
        parent: Arc<SubjectRef>,
    },
    /// Delete every parent row, then insert the given list in order.
    ReplaceParents {
        /// The replacement parent list.
        parents: Vec<Arc<SubjectRef>>,
    },
    /// Update the segment row's default value.
    SetDefault {
        /// The new default, or `None` to clear it.
        value: Option<i32>,
    },
}

/// An immutable, context-scoped block of permission state with a queue of
/// pending per-field updates.
///
/// Like [`SubjectRef`](crate::subject::SubjectRef), a segment carries a
/// lazily-assigned row id in an atomic slot: an instance shared between
/// snapshots exposes the allocated id to every holder, while a `with_*`
/// derivative copies the raw id current at derivation time.
pub struct Segment {
    id: AtomicI32,
    contexts: ContextSet,
    permissions: HashMap<String, i32>,
    options: HashMap<String, String>,
    parents: Vec<Arc<SubjectRef>>,
    default_value: Option<i32>,
    updates: Mutex<Vec<SegmentUpdate>>,
}

impl Segment {
    /// Creates an empty segment with no database row, scoped to the given
    /// context-set.
    #[must_use]
    pub fn unallocated(contexts: ContextSet) -> Self {
        Self {
            id: AtomicI32::new(UNALLOCATED),
            contexts,
            permissions: HashMap::new(),
            options: HashMap::new(),
            parents: Vec::new(),
            default_value: None,
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Creates a segment from database rows. No updates are pending.
    pub(crate) fn resolved(
        id: i32,
        contexts: ContextSet,
        permissions: HashMap<String, i32>,
        options: HashMap<String, String>,
        parents: Vec<Arc<SubjectRef>>,
        default_value: Option<i32>,
    ) -> Self {
        Self {
            id: AtomicI32::new(id),
            contexts,
            permissions,
            options,
            parents,
            default_value,
            updates: Mutex::new(Vec::new()),
        }
    }

    /// Copies the payload and pending updates into a new instance carrying
    /// the raw id current at this moment.
    pub(crate) fn fork(&self) -> Self {
        Self {
            id: AtomicI32::new(self.raw_id()),
            contexts: self.contexts.clone(),
            permissions: self.permissions.clone(),
            options: self.options.clone(),
            parents: self.parents.clone(),
            default_value: self.default_value,
            updates: Mutex::new(self.updates.lock().unwrap().clone()),
        }
    }

    fn derive(&self, change: impl FnOnce(&mut Self), update: SegmentUpdate) -> Self {
        let mut next = self.fork();
        change(&mut next);
        next.updates.get_mut().unwrap().push(update);
        next
    }

    /// Returns a segment with the permission set to a nonzero value.
    #[must_use]
    pub fn with_permission(&self, key: impl Into<String>, value: i32) -> Self {
        let key = key.into();
        self.derive(
            |seg| {
                seg.permissions.insert(key.clone(), value);
            },
            SegmentUpdate::SetPermission {
                key: key.clone(),
                value,
            },
        )
    }

    /// Returns a segment with the permission cleared.
    #[must_use]
    pub fn without_permission(&self, key: &str) -> Self {
        self.derive(
            |seg| {
                seg.permissions.remove(key);
            },
            SegmentUpdate::ClearPermission { key: key.into() },
        )
    }

    /// Returns a segment whose permission map is replaced wholesale.
    #[must_use]
    pub fn with_permissions(&self, values: HashMap<String, i32>) -> Self {
        self.derive(
            |seg| {
                seg.permissions = values.clone();
            },
            SegmentUpdate::ReplacePermissions { values: values.clone() },
        )
    }

    /// Returns a segment with no permissions.
    #[must_use]
    pub fn without_permissions(&self) -> Self {
        self.with_permissions(HashMap::new())
    }

    /// Returns a segment with the option set.
    #[must_use]
    pub fn with_option(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        self.derive(
            |seg| {
                seg.options.insert(key.clone(), value.clone());
            },
            SegmentUpdate::SetOption {
                key: key.clone(),
                value: value.clone(),
            },
        )
    }

    /// Returns a segment with the option cleared.
    #[must_use]
    pub fn without_option(&self, key: &str) -> Self {
        self.derive(
            |seg| {
                seg.options.remove(key);
            },
            SegmentUpdate::ClearOption { key: key.into() },
        )
    }

    /// Returns a segment whose option map is replaced wholesale.
    #[must_use]
    pub fn with_options(&self, values: HashMap<String, String>) -> Self {
        self.derive(
            |seg| {
                seg.options = values.clone();
            },
            SegmentUpdate::ReplaceOptions { values: values.clone() },
        )
    }

    /// Returns a segment with no options.
    #[must_use]
    pub fn without_options(&self) -> Self {
        self.with_options(HashMap::new())
    }

    /// Returns a segment with the parent appended.
    #[must_use]
    pub fn with_added_parent(&self, parent: Arc<SubjectRef>) -> Self {
        self.derive(
            |seg| {
                seg.parents.push(parent.clone());
            },
            SegmentUpdate::AddParent { parent: parent.clone() },
        )
    }

    /// Returns a segment with the parent removed.
    #[must_use]
    pub fn with_removed_parent(&self, parent: &Arc<SubjectRef>) -> Self {
        self.derive(
            |seg| {
                seg.parents.retain(|p| p != parent);
            },
            SegmentUpdate::RemoveParent { parent: parent.clone() },
        )
    }

    /// Returns a segment whose parent list is replaced wholesale, in order.
    #[must_use]
    pub fn with_parents(&self, parents: Vec<Arc<SubjectRef>>) -> Self {
        self.derive(
            |seg| {
                seg.parents = parents.clone();
            },
            SegmentUpdate::ReplaceParents { parents: parents.clone() },
        )
    }

    /// Returns a segment with no parents.
    #[must_use]
    pub fn without_parents(&self) -> Self {
        self.with_parents(Vec::new())
    }

    /// Returns a segment with the default value set or cleared.
    #[must_use]
    pub fn with_default_value(&self, value: Option<i32>) -> Self {
        self.derive(
            |seg| {
                seg.default_value = value;
            },
            SegmentUpdate::SetDefault { value },
        )
    }

    /// The context-set scoping this segment.
    #[must_use]
    pub fn contexts(&self) -> &ContextSet {
        &self.contexts
    }

    /// The permission map.
    #[must_use]
    pub fn permissions(&self) -> &HashMap<String, i32> {
        &self.permissions
    }

    /// The option map.
    #[must_use]
    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    /// The ordered parent list.
    #[must_use]
    pub fn parents(&self) -> &[Arc<SubjectRef>] {
        &self.parents
    }

    /// The default value, if one is set.
    #[must_use]
    pub fn default_value(&self) -> Option<i32> {
        self.default_value
    }

    /// Whether the payload is empty: no permissions, options, parents, or
    /// default. Ignores the id; an empty segment's row is deleted on flush.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
            && self.options.is_empty()
            && self.parents.is_empty()
            && self.default_value.is_none()
    }

    /// Whether the segment has no database row yet. Checks only the id.
    #[must_use]
    pub fn is_unallocated(&self) -> bool {
        self.raw_id() == UNALLOCATED
    }

    /// The allocated row id.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnallocatedReference`] if the segment has not
    /// been allocated yet.
    pub fn id(&self) -> Result<i32, QueryError> {
        match self.raw_id() {
            UNALLOCATED => Err(QueryError::UnallocatedReference),
            id => Ok(id),
        }
    }

    pub(crate) fn raw_id(&self) -> i32 {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: i32) {
        self.id.store(id, Ordering::SeqCst);
    }

    /// Drains the pending update queue. Each queued change is applied at
    /// most once per flush; a full-segment write consumes the queue since
    /// the payload already reflects every queued change.
    pub(crate) fn take_updates(&self) -> Vec<SegmentUpdate> {
        std::mem::take(&mut *self.updates.lock().unwrap())
    }

    /// Number of queued but unflushed changes.
    #[must_use]
    pub fn pending_update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.raw_id())
            .field("contexts", &self.contexts)
            .field("permissions", &self.permissions)
            .field("options", &self.options)
            .field("parents", &self.parents)
            .field("default_value", &self.default_value)
            .field("pending_updates", &self.updates.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::context_set;

    fn seg() -> Segment {
        Segment::unallocated(context_set([("world", "nether")]))
    }

    #[test]
    fn builders_accumulate_updates() {
        let s = seg()
            .with_permission("build", 1)
            .with_option("prefix", "[admin]")
            .with_default_value(Some(1));
        assert_eq!(s.pending_update_count(), 3);
        assert_eq!(s.permissions().get("build"), Some(&1));
        assert_eq!(s.options().get("prefix").map(String::as_str), Some("[admin]"));
        assert_eq!(s.default_value(), Some(1));
    }

    #[test]
    fn empty_ignores_id() {
        let s = seg();
        s.set_id(9);
        assert!(s.is_empty());
        assert!(!s.is_unallocated());
    }

    #[test]
    fn replacing_collections_clears_payload() {
        let s = seg().with_permission("build", 1).without_permissions();
        assert!(s.permissions().is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn removed_parent_leaves_order_intact() {
        let a = Arc::new(SubjectRef::unresolved("group", "a"));
        let b = Arc::new(SubjectRef::unresolved("group", "b"));
        let c = Arc::new(SubjectRef::unresolved("group", "c"));
        let s = seg()
            .with_parents(vec![a.clone(), b.clone(), c.clone()])
            .with_removed_parent(&b);
        assert_eq!(s.parents(), &[a, c]);
    }

    #[test]
    fn take_updates_drains_once() {
        let s = seg().with_permission("build", 1);
        assert_eq!(s.take_updates().len(), 1);
        assert!(s.take_updates().is_empty());
    }
}
