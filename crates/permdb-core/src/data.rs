//! Immutable subject data snapshots.
//!
//! A [`SubjectData`] maps each context-set to its [`Segment`] for one
//! subject. Snapshots are immutable: every mutating operation returns a new
//! snapshot whose pending queue has one more entry describing the flush
//! work. Flushing drains the queue exactly once and replays it inside a
//! single transaction.

use std::collections::HashMap as StdHashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use im::HashMap;

use crate::context::ContextSet;
use crate::dao::DataAccess;
use crate::error::QueryError;
use crate::segment::Segment;
use crate::subject::SubjectRef;

/// A parent entry accepted by [`SubjectData::set_parents`]: either a raw
/// (type, identifier) pair, coerced into an unresolved ref, or an already
/// known ref.
pub enum ParentRef {
    /// A raw (type, identifier) pair.
    Pair(String, String),
    /// An existing subject reference.
    Ref(Arc<SubjectRef>),
}

impl ParentRef {
    fn into_ref(self) -> Arc<SubjectRef> {
        match self {
            Self::Pair(subject_type, identifier) => {
                Arc::new(SubjectRef::unresolved(subject_type, identifier))
            }
            Self::Ref(reference) => reference,
        }
    }
}

impl From<(&str, &str)> for ParentRef {
    fn from((subject_type, identifier): (&str, &str)) -> Self {
        Self::Pair(subject_type.into(), identifier.into())
    }
}

impl From<(String, String)> for ParentRef {
    fn from((subject_type, identifier): (String, String)) -> Self {
        Self::Pair(subject_type, identifier)
    }
}

impl From<Arc<SubjectRef>> for ParentRef {
    fn from(reference: Arc<SubjectRef>) -> Self {
        Self::Ref(reference)
    }
}

/// One queued flush action against the data-access layer.
#[derive(Debug, Clone)]
enum SubjectUpdate {
    /// Delete the captured segment's row.
    RemoveSegment { segment: Arc<Segment> },
    /// Write the segment stored under this key at flush time: insert it in
    /// full if it has no row yet, otherwise replay its own update queue.
    WriteSegment { key: ContextSet },
    /// Bulk pass over the given keys: delete empty allocated segments,
    /// discard empty unallocated ones, write the rest.
    BulkSegments { keys: Vec<ContextSet> },
}

/// Immutable permission state for one subject, plus the queue of pending
/// database work.
pub struct SubjectData {
    subject: Arc<SubjectRef>,
    segments: HashMap<ContextSet, Arc<Segment>>,
    pending: Mutex<Option<Vec<SubjectUpdate>>>,
}

impl SubjectData {
    /// Creates a snapshot over segments loaded from the database.
    pub(crate) fn new(subject: Arc<SubjectRef>, segments: HashMap<ContextSet, Arc<Segment>>) -> Self {
        Self {
            subject,
            segments,
            pending: Mutex::new(None),
        }
    }

    /// The subject this snapshot belongs to.
    #[must_use]
    pub fn subject(&self) -> &Arc<SubjectRef> {
        &self.subject
    }

    fn queued(&self) -> Vec<SubjectUpdate> {
        self.pending.lock().unwrap().clone().unwrap_or_default()
    }

    fn new_with_update(
        &self,
        segments: HashMap<ContextSet, Arc<Segment>>,
        update: Option<SubjectUpdate>,
    ) -> Self {
        let mut queue = self.queued();
        if let Some(update) = update {
            queue.push(update);
        }
        Self {
            subject: self.subject.clone(),
            segments,
            pending: Mutex::new(Some(queue)),
        }
    }

    /// Stores the mutated segment under its key and queues the flush action
    /// chosen by the segment's state transition.
    fn new_with_updated(&self, key: &ContextSet, segment: Segment) -> Self {
        let segment = Arc::new(segment);
        let update = if segment.is_empty() {
            if segment.is_unallocated() {
                // never written: nothing to delete
                None
            } else {
                Some(SubjectUpdate::RemoveSegment {
                    segment: segment.clone(),
                })
            }
        } else {
            Some(SubjectUpdate::WriteSegment { key: key.clone() })
        };
        self.new_with_update(self.segments.update(key.clone(), segment), update)
    }

    fn segment_or_new(&self, key: &ContextSet) -> Segment {
        match self.segments.get(key) {
            Some(segment) => segment.fork(),
            None => Segment::unallocated(key.clone()),
        }
    }

    fn unchanged(&self) -> Self {
        Self {
            subject: self.subject.clone(),
            segments: self.segments.clone(),
            pending: Mutex::new(self.pending.lock().unwrap().clone()),
        }
    }

    // -- Options

    /// Option maps for every context-set that has options.
    #[must_use]
    pub fn all_options(&self) -> StdHashMap<ContextSet, HashMap<String, String>> {
        self.segments
            .iter()
            .filter(|(_, segment)| !segment.options().is_empty())
            .map(|(key, segment)| (key.clone(), segment.options().clone()))
            .collect()
    }

    /// The option map under one context-set. Empty if none is stored.
    #[must_use]
    pub fn options(&self, contexts: &ContextSet) -> HashMap<String, String> {
        self.segments
            .get(contexts)
            .map(|segment| segment.options().clone())
            .unwrap_or_default()
    }

    /// Sets or clears one option. `None` clears.
    #[must_use]
    pub fn set_option(&self, contexts: &ContextSet, key: &str, value: Option<&str>) -> Self {
        let segment = match value {
            Some(value) => self.segment_or_new(contexts).with_option(key, value),
            None => self.segment_or_new(contexts).without_option(key),
        };
        self.new_with_updated(contexts, segment)
    }

    /// Replaces the option map under one context-set.
    #[must_use]
    pub fn set_options(
        &self,
        contexts: &ContextSet,
        values: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let values: HashMap<String, String> = values.into_iter().collect();
        self.new_with_updated(contexts, self.segment_or_new(contexts).with_options(values))
    }

    /// Clears the options under one context-set. A context with no stored
    /// segment is a no-op.
    #[must_use]
    pub fn clear_options(&self, contexts: &ContextSet) -> Self {
        if !self.segments.contains_key(contexts) {
            return self.unchanged();
        }
        self.new_with_updated(contexts, self.segment_or_new(contexts).without_options())
    }

    /// Clears the options under every context-set.
    #[must_use]
    pub fn clear_all_options(&self) -> Self {
        self.bulk(|segment| segment.without_options())
    }

    // -- Permissions

    /// Permission maps for every context-set that has permissions.
    #[must_use]
    pub fn all_permissions(&self) -> StdHashMap<ContextSet, HashMap<String, i32>> {
        self.segments
            .iter()
            .filter(|(_, segment)| !segment.permissions().is_empty())
            .map(|(key, segment)| (key.clone(), segment.permissions().clone()))
            .collect()
    }

    /// The permission map under one context-set. Empty if none is stored.
    #[must_use]
    pub fn permissions(&self, contexts: &ContextSet) -> HashMap<String, i32> {
        self.segments
            .get(contexts)
            .map(|segment| segment.permissions().clone())
            .unwrap_or_default()
    }

    /// Sets one permission. A value of 0 clears it.
    #[must_use]
    pub fn set_permission(&self, contexts: &ContextSet, key: &str, value: i32) -> Self {
        let segment = if value == 0 {
            self.segment_or_new(contexts).without_permission(key)
        } else {
            self.segment_or_new(contexts).with_permission(key, value)
        };
        self.new_with_updated(contexts, segment)
    }

    /// Replaces the permission map under one context-set. Entries with
    /// value 0 are dropped: 0 means "not set" and is never stored.
    #[must_use]
    pub fn set_permissions(
        &self,
        contexts: &ContextSet,
        values: impl IntoIterator<Item = (String, i32)>,
    ) -> Self {
        let values: HashMap<String, i32> =
            values.into_iter().filter(|(_, value)| *value != 0).collect();
        self.new_with_updated(
            contexts,
            self.segment_or_new(contexts).with_permissions(values),
        )
    }

    /// Clears the permissions under one context-set. A context with no
    /// stored segment is a no-op.
    #[must_use]
    pub fn clear_permissions(&self, contexts: &ContextSet) -> Self {
        if !self.segments.contains_key(contexts) {
            return self.unchanged();
        }
        self.new_with_updated(contexts, self.segment_or_new(contexts).without_permissions())
    }

    /// Clears the permissions under every context-set.
    #[must_use]
    pub fn clear_all_permissions(&self) -> Self {
        self.bulk(|segment| segment.without_permissions())
    }

    // -- Parents

    /// Parent lists for every context-set that has parents.
    #[must_use]
    pub fn all_parents(&self) -> StdHashMap<ContextSet, Vec<Arc<SubjectRef>>> {
        self.segments
            .iter()
            .filter(|(_, segment)| !segment.parents().is_empty())
            .map(|(key, segment)| (key.clone(), segment.parents().to_vec()))
            .collect()
    }

    /// The ordered parent list under one context-set.
    #[must_use]
    pub fn parents(&self, contexts: &ContextSet) -> Vec<Arc<SubjectRef>> {
        self.segments
            .get(contexts)
            .map(|segment| segment.parents().to_vec())
            .unwrap_or_default()
    }

    /// Appends a parent. Adding a parent already present is a no-op.
    #[must_use]
    pub fn add_parent(&self, contexts: &ContextSet, subject_type: &str, identifier: &str) -> Self {
        let parent = Arc::new(SubjectRef::unresolved(subject_type, identifier));
        if let Some(segment) = self.segments.get(contexts) {
            if segment.parents().iter().any(|p| **p == *parent) {
                return self.unchanged();
            }
        }
        self.new_with_updated(
            contexts,
            self.segment_or_new(contexts).with_added_parent(parent),
        )
    }

    /// Removes a parent. Removing a parent that is not present is a no-op.
    #[must_use]
    pub fn remove_parent(
        &self,
        contexts: &ContextSet,
        subject_type: &str,
        identifier: &str,
    ) -> Self {
        let Some(segment) = self.segments.get(contexts) else {
            return self.unchanged();
        };
        let parent = Arc::new(SubjectRef::unresolved(subject_type, identifier));
        if !segment.parents().iter().any(|p| **p == *parent) {
            return self.unchanged();
        }
        self.new_with_updated(contexts, segment.with_removed_parent(&parent))
    }

    /// Replaces the parent list under one context-set, in order. Raw
    /// (type, identifier) pairs are coerced into unresolved refs.
    #[must_use]
    pub fn set_parents<P: Into<ParentRef>>(
        &self,
        contexts: &ContextSet,
        parents: impl IntoIterator<Item = P>,
    ) -> Self {
        let parents: Vec<Arc<SubjectRef>> = parents
            .into_iter()
            .map(|parent| parent.into().into_ref())
            .collect();
        self.new_with_updated(contexts, self.segment_or_new(contexts).with_parents(parents))
    }

    /// Clears the parents under one context-set. A context with no stored
    /// segment is a no-op.
    #[must_use]
    pub fn clear_parents(&self, contexts: &ContextSet) -> Self {
        if !self.segments.contains_key(contexts) {
            return self.unchanged();
        }
        self.new_with_updated(contexts, self.segment_or_new(contexts).without_parents())
    }

    /// Clears the parents under every context-set.
    #[must_use]
    pub fn clear_all_parents(&self) -> Self {
        self.bulk(|segment| segment.without_parents())
    }

    // -- Default values

    /// The default value under one context-set, if set.
    #[must_use]
    pub fn default_value(&self, contexts: &ContextSet) -> Option<i32> {
        self.segments
            .get(contexts)
            .and_then(|segment| segment.default_value())
    }

    /// Default values for every context-set that has one.
    #[must_use]
    pub fn all_default_values(&self) -> StdHashMap<ContextSet, i32> {
        self.segments
            .iter()
            .filter_map(|(key, segment)| segment.default_value().map(|value| (key.clone(), value)))
            .collect()
    }

    /// Sets or clears the default value under one context-set. An absent
    /// default round-trips as absent.
    #[must_use]
    pub fn set_default_value(&self, contexts: &ContextSet, value: Option<i32>) -> Self {
        self.new_with_updated(
            contexts,
            self.segment_or_new(contexts).with_default_value(value),
        )
    }

    // -- Contexts

    /// Every context-set this snapshot holds a segment for.
    pub fn active_contexts(&self) -> impl Iterator<Item = &ContextSet> + '_ {
        self.segments.keys()
    }

    /// Number of queued but unflushed operations.
    #[must_use]
    pub fn pending_update_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, Vec::len)
    }

    fn bulk(&self, change: impl Fn(&Segment) -> Segment) -> Self {
        if self.segments.is_empty() {
            return self.unchanged();
        }
        let mut segments = self.segments.clone();
        for (key, segment) in &self.segments {
            segments = segments.update(key.clone(), Arc::new(change(segment)));
        }
        let keys = self.segments.keys().cloned().collect();
        self.new_with_update(segments, Some(SubjectUpdate::BulkSegments { keys }))
    }

    // -- Flushing

    /// Runs every queued operation inside one transaction. The queue is
    /// taken atomically before replay, so concurrent flushers drain it at
    /// most once; a snapshot with nothing queued flushes as a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first database error; the transaction rolls back and no
    /// partial effects remain.
    pub fn flush(&self, dao: &mut DataAccess) -> Result<(), QueryError> {
        let Some(updates) = self.pending.lock().unwrap().take() else {
            return Ok(());
        };
        dao.in_transaction(|dao| {
            for update in &updates {
                self.run_update(dao, update)?;
            }
            Ok(())
        })
    }

    fn run_update(&self, dao: &mut DataAccess, update: &SubjectUpdate) -> Result<(), QueryError> {
        match update {
            SubjectUpdate::RemoveSegment { segment } => {
                dao.remove_segment(segment)?;
                Ok(())
            }
            SubjectUpdate::WriteSegment { key } => self.flush_segment_at(dao, key),
            SubjectUpdate::BulkSegments { keys } => {
                for key in keys {
                    self.flush_segment_at(dao, key)?;
                }
                Ok(())
            }
        }
    }

    /// Writes the segment currently stored under `key`, following the
    /// state machine: an empty allocated segment loses its row, an empty
    /// unallocated one is discarded, an unallocated one is inserted in
    /// full, and an allocated one replays its own queue.
    fn flush_segment_at(&self, dao: &mut DataAccess, key: &ContextSet) -> Result<(), QueryError> {
        let Some(segment) = self.segments.get(key) else {
            return Ok(());
        };
        if segment.is_empty() {
            if !segment.is_unallocated() {
                dao.remove_segment(segment)?;
            }
            return Ok(());
        }
        if segment.is_unallocated() {
            segment.take_updates();
            dao.update_full_segment(&self.subject, segment)
        } else {
            dao.run_segment_updates(segment)
        }
    }
}

impl Clone for SubjectData {
    fn clone(&self) -> Self {
        self.unchanged()
    }
}

impl fmt::Debug for SubjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectData")
            .field("subject", &self.subject)
            .field("segments", &self.segments)
            .field("pending_updates", &self.pending_update_count())
            .finish()
    }
}

// -- Cross-backend views

/// Read access to the semantic content of any subject data snapshot,
/// regardless of backend. Used to migrate foreign snapshots into this
/// engine.
pub trait SubjectDataView {
    /// Permission maps keyed by context-set.
    fn permissions_by_context(&self) -> StdHashMap<ContextSet, StdHashMap<String, i32>>;
    /// Option maps keyed by context-set.
    fn options_by_context(&self) -> StdHashMap<ContextSet, StdHashMap<String, String>>;
    /// Ordered parent (type, identifier) pairs keyed by context-set.
    fn parents_by_context(&self) -> StdHashMap<ContextSet, Vec<(String, String)>>;
    /// Default values keyed by context-set.
    fn defaults_by_context(&self) -> StdHashMap<ContextSet, i32>;
}

impl SubjectDataView for SubjectData {
    fn permissions_by_context(&self) -> StdHashMap<ContextSet, StdHashMap<String, i32>> {
        self.all_permissions()
            .into_iter()
            .map(|(key, values)| (key, values.into_iter().collect()))
            .collect()
    }

    fn options_by_context(&self) -> StdHashMap<ContextSet, StdHashMap<String, String>> {
        self.all_options()
            .into_iter()
            .map(|(key, values)| (key, values.into_iter().collect()))
            .collect()
    }

    fn parents_by_context(&self) -> StdHashMap<ContextSet, Vec<(String, String)>> {
        self.all_parents()
            .into_iter()
            .map(|(key, parents)| {
                let pairs = parents
                    .iter()
                    .map(|parent| {
                        (
                            parent.subject_type().to_string(),
                            parent.identifier().to_string(),
                        )
                    })
                    .collect();
                (key, pairs)
            })
            .collect()
    }

    fn defaults_by_context(&self) -> StdHashMap<ContextSet, i32> {
        self.all_default_values()
    }
}

/// Owned copy of a snapshot's semantic content, capturable from any
/// [`SubjectDataView`] and applicable onto a freshly loaded snapshot.
#[derive(Debug, Clone, Default)]
pub(crate) struct SubjectDataContent {
    permissions: StdHashMap<ContextSet, StdHashMap<String, i32>>,
    options: StdHashMap<ContextSet, StdHashMap<String, String>>,
    parents: StdHashMap<ContextSet, Vec<(String, String)>>,
    defaults: StdHashMap<ContextSet, i32>,
}

impl SubjectDataContent {
    pub(crate) fn capture(view: &dyn SubjectDataView) -> Self {
        Self {
            permissions: view.permissions_by_context(),
            options: view.options_by_context(),
            parents: view.parents_by_context(),
            defaults: view.defaults_by_context(),
        }
    }

    /// Replays the captured content onto `data` through its mutation API,
    /// queueing the corresponding flush work.
    pub(crate) fn apply_to(&self, mut data: SubjectData) -> SubjectData {
        for (contexts, values) in &self.permissions {
            data = data.set_permissions(contexts, values.clone());
        }
        for (contexts, values) in &self.options {
            data = data.set_options(contexts, values.clone());
        }
        for (contexts, parents) in &self.parents {
            data = data.set_parents(contexts, parents.clone());
        }
        for (contexts, value) in &self.defaults {
            data = data.set_default_value(contexts, Some(*value));
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::context_set;

    fn snapshot() -> SubjectData {
        SubjectData::new(
            Arc::new(SubjectRef::unresolved("user", "alice")),
            HashMap::new(),
        )
    }

    #[test]
    fn mutation_returns_new_snapshot_with_queued_work() {
        let base = snapshot();
        let ctx = context_set([("world", "nether")]);
        let next = base.set_permission(&ctx, "build", 1);
        assert_eq!(base.pending_update_count(), 0);
        assert_eq!(next.pending_update_count(), 1);
        assert_eq!(next.permissions(&ctx).get("build"), Some(&1));
        assert!(base.permissions(&ctx).is_empty());
    }

    #[test]
    fn setting_permission_to_zero_clears_it() {
        let ctx = ContextSet::new();
        let data = snapshot()
            .set_permission(&ctx, "build", 1)
            .set_permission(&ctx, "build", 0);
        assert!(data.permissions(&ctx).is_empty());
    }

    #[test]
    fn set_permissions_drops_zero_entries() {
        let ctx = ContextSet::new();
        let data = snapshot().set_permissions(
            &ctx,
            [("build".to_string(), 1), ("fly".to_string(), 0)],
        );
        let perms = data.permissions(&ctx);
        assert_eq!(perms.get("build"), Some(&1));
        assert!(!perms.contains_key("fly"));
    }

    #[test]
    fn clearing_missing_context_queues_nothing() {
        let base = snapshot();
        let ctx = context_set([("world", "end")]);
        let next = base.clear_parents(&ctx);
        assert_eq!(next.pending_update_count(), 0);
        let next = base.clear_permissions(&ctx);
        assert_eq!(next.pending_update_count(), 0);
    }

    #[test]
    fn duplicate_parent_is_a_no_op() {
        let ctx = ContextSet::new();
        let once = snapshot().add_parent(&ctx, "group", "admin");
        let twice = once.add_parent(&ctx, "group", "admin");
        assert_eq!(once.pending_update_count(), twice.pending_update_count());
        assert_eq!(twice.parents(&ctx).len(), 1);
    }

    #[test]
    fn removing_missing_parent_is_a_no_op() {
        let ctx = ContextSet::new();
        let base = snapshot().add_parent(&ctx, "group", "admin");
        let next = base.remove_parent(&ctx, "group", "mod");
        assert_eq!(base.pending_update_count(), next.pending_update_count());
    }

    #[test]
    fn parent_order_is_preserved() {
        let ctx = ContextSet::new();
        let data = snapshot().set_parents(&ctx, [("group", "a"), ("group", "b"), ("group", "c")]);
        let names: Vec<String> = data
            .parents(&ctx)
            .iter()
            .map(|parent| parent.identifier().to_string())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn default_value_round_trips_as_option() {
        let ctx = ContextSet::new();
        let data = snapshot().set_default_value(&ctx, Some(1));
        assert_eq!(data.default_value(&ctx), Some(1));
        let cleared = data.set_default_value(&ctx, None);
        assert_eq!(cleared.default_value(&ctx), None);
    }

    #[test]
    fn bulk_clear_touches_every_context() {
        let global = ContextSet::new();
        let nether = context_set([("world", "nether")]);
        let data = snapshot()
            .set_permission(&global, "build", 1)
            .set_permission(&nether, "fly", 1)
            .clear_all_permissions();
        assert!(data.permissions(&global).is_empty());
        assert!(data.permissions(&nether).is_empty());
    }

    #[test]
    fn content_capture_and_apply_round_trips() {
        let ctx = context_set([("world", "nether")]);
        let source = snapshot()
            .set_permission(&ctx, "build", 1)
            .set_option(&ctx, "prefix", Some("[a]"))
            .set_parents(&ctx, [("group", "admin")])
            .set_default_value(&ctx, Some(-1));
        let content = SubjectDataContent::capture(&source);
        let copied = content.apply_to(snapshot());
        assert_eq!(copied.permissions(&ctx).get("build"), Some(&1));
        assert_eq!(
            copied.options(&ctx).get("prefix").map(String::as_str),
            Some("[a]")
        );
        assert_eq!(copied.parents(&ctx).len(), 1);
        assert_eq!(copied.default_value(&ctx), Some(-1));
    }
}
