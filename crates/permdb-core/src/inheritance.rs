//! Context inheritance snapshots.
//!
//! Maps each child context pair to the ordered list of parent context pairs
//! it inherits from, with the same deferred-update discipline as
//! [`SubjectData`](crate::data::SubjectData): mutations return a new
//! snapshot with one more queued operation, and flushing drains the queue
//! inside one transaction.

use std::fmt;
use std::sync::Mutex;

use im::HashMap;

use crate::context::Context;
use crate::dao::DataAccess;
use crate::error::QueryError;

#[derive(Debug, Clone)]
enum InheritanceUpdate {
    /// Delete every row for the child, then insert the parents in order.
    SetParents {
        child: Context,
        parents: Vec<Context>,
    },
}

/// Immutable view of the context inheritance mapping plus pending database
/// work.
pub struct ContextInheritance {
    inheritance: HashMap<Context, Vec<Context>>,
    pending: Mutex<Option<Vec<InheritanceUpdate>>>,
}

impl ContextInheritance {
    /// Creates a snapshot over rows loaded from the database.
    pub(crate) fn new(inheritance: HashMap<Context, Vec<Context>>) -> Self {
        Self {
            inheritance,
            pending: Mutex::new(None),
        }
    }

    /// Builds a snapshot from an externally sourced mapping, queueing a
    /// full write of every child so a flush persists the whole mapping.
    #[must_use]
    pub fn from_parents(parents: impl IntoIterator<Item = (Context, Vec<Context>)>) -> Self {
        let inheritance: HashMap<Context, Vec<Context>> = parents.into_iter().collect();
        let updates = inheritance
            .iter()
            .map(|(child, parents)| InheritanceUpdate::SetParents {
                child: child.clone(),
                parents: parents.clone(),
            })
            .collect();
        Self {
            inheritance,
            pending: Mutex::new(Some(updates)),
        }
    }

    /// The ordered parents of one child context. Empty if none are stored.
    #[must_use]
    pub fn parents(&self, child: &Context) -> Vec<Context> {
        self.inheritance.get(child).cloned().unwrap_or_default()
    }

    /// The whole child-to-parents mapping.
    #[must_use]
    pub fn all_parents(&self) -> HashMap<Context, Vec<Context>> {
        self.inheritance.clone()
    }

    /// Replaces the parents of one child context, in order. Queues a
    /// delete-by-child followed by ordered inserts.
    #[must_use]
    pub fn set_parents(&self, child: Context, parents: Vec<Context>) -> Self {
        let mut queue = self.pending.lock().unwrap().clone().unwrap_or_default();
        queue.push(InheritanceUpdate::SetParents {
            child: child.clone(),
            parents: parents.clone(),
        });
        let inheritance = if parents.is_empty() {
            self.inheritance.without(&child)
        } else {
            self.inheritance.update(child, parents)
        };
        Self {
            inheritance,
            pending: Mutex::new(Some(queue)),
        }
    }

    /// Number of queued but unflushed operations.
    #[must_use]
    pub fn pending_update_count(&self) -> usize {
        self.pending.lock().unwrap().as_ref().map_or(0, Vec::len)
    }

    /// Runs every queued operation inside one transaction, draining the
    /// queue exactly once.
    ///
    /// # Errors
    ///
    /// Returns the first database error; the transaction rolls back.
    pub fn flush(&self, dao: &mut DataAccess) -> Result<(), QueryError> {
        let Some(updates) = self.pending.lock().unwrap().take() else {
            return Ok(());
        };
        dao.in_transaction(|dao| {
            for update in &updates {
                match update {
                    InheritanceUpdate::SetParents { child, parents } => {
                        dao.set_context_inheritance(child, parents)?;
                    }
                }
            }
            Ok(())
        })
    }
}

impl Clone for ContextInheritance {
    fn clone(&self) -> Self {
        Self {
            inheritance: self.inheritance.clone(),
            pending: Mutex::new(self.pending.lock().unwrap().clone()),
        }
    }
}

impl fmt::Debug for ContextInheritance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInheritance")
            .field("inheritance", &self.inheritance)
            .field("pending_updates", &self.pending_update_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_parents_returns_new_snapshot() {
        let base = ContextInheritance::new(HashMap::new());
        let child = Context::new("world", "nether");
        let parents = vec![Context::new("world", "overworld")];
        let next = base.set_parents(child.clone(), parents.clone());
        assert!(base.parents(&child).is_empty());
        assert_eq!(next.parents(&child), parents);
        assert_eq!(next.pending_update_count(), 1);
    }

    #[test]
    fn empty_parent_list_removes_the_child() {
        let child = Context::new("world", "nether");
        let base = ContextInheritance::new(HashMap::new())
            .set_parents(child.clone(), vec![Context::new("world", "overworld")]);
        let next = base.set_parents(child.clone(), vec![]);
        assert!(next.parents(&child).is_empty());
        assert!(next.all_parents().is_empty());
    }

    #[test]
    fn from_parents_queues_a_full_write() {
        let child = Context::new("server", "lobby");
        let snapshot =
            ContextInheritance::from_parents([(child.clone(), vec![Context::new("server", "hub")])]);
        assert_eq!(snapshot.pending_update_count(), 1);
        assert_eq!(snapshot.parents(&child).len(), 1);
    }
}
