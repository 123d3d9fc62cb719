//! Rank ladders.

use std::sync::Arc;

use crate::subject::SubjectRef;

/// A named, ordered list of subjects. The position in the list is the rank;
/// persisted order follows insertion order.
#[derive(Debug, Clone)]
pub struct RankLadder {
    name: String,
    ranks: Vec<Arc<SubjectRef>>,
}

impl RankLadder {
    /// Creates a ladder with the given ranks, lowest first.
    #[must_use]
    pub fn new(name: impl Into<String>, ranks: Vec<Arc<SubjectRef>>) -> Self {
        Self {
            name: name.into(),
            ranks,
        }
    }

    /// The ladder name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered ranks.
    #[must_use]
    pub fn ranks(&self) -> &[Arc<SubjectRef>] {
        &self.ranks
    }

    /// Whether the ladder has no ranks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}
