//! Data-access layer.
//!
//! [`DataAccess`] is the dialect-abstract facade over one live connection:
//! it owns every SQL statement the engine runs, rewrites table prefixes,
//! nests transactions by counter, and allocates row ids lazily, writing
//! them back into refs and segments on the write path.
//!
//! Instances wrap a single connection and are not safe to share across
//! threads. A per-operation instance is the normal case; bulk operations
//! pin one instance to a thread for their duration.

// Row ids are i32 in the schema but i64 on the wire; values in this schema
// never exceed i32.
#![allow(clippy::cast_possible_truncation)]

mod dialect;
mod driver;
mod mysql;
mod sqlite;

#[cfg(test)]
mod tests;

pub use dialect::Dialect;
pub use driver::{SqlConnection, SqlRow, SqlValue};
pub use mysql::MysqlConnection;
pub use sqlite::SqliteConnection;

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use im::HashMap;
use tracing::debug;

use crate::context::{Context, ContextSet};
use crate::error::QueryError;
use crate::inheritance::ContextInheritance;
use crate::ladder::RankLadder;
use crate::segment::{Segment, SegmentUpdate};
use crate::subject::SubjectRef;

use dialect::queries;

/// Shared memo of prefix-substituted query strings.
///
/// Substitution replaces every `{}` in a template with the normalized table
/// prefix; results are cached per raw query string. The memo is shared by
/// every [`DataAccess`] the store opens and is safe for concurrent use.
pub(crate) struct QueryPrefixer {
    prefix: String,
    cache: RwLock<StdHashMap<String, String>>,
}

impl QueryPrefixer {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cache: RwLock::new(StdHashMap::new()),
        }
    }

    pub(crate) fn apply(&self, query: &str) -> String {
        if let Some(hit) = self.cache.read().unwrap().get(query) {
            return hit.clone();
        }
        let rewritten = query.replace("{}", &self.prefix);
        self.cache
            .write()
            .unwrap()
            .insert(query.to_string(), rewritten.clone());
        rewritten
    }

    pub(crate) fn clear(&self) {
        self.cache.write().unwrap().clear();
    }
}

/// Dialect-abstract access to one database connection.
pub struct DataAccess {
    conn: Box<dyn SqlConnection>,
    dialect: Dialect,
    prefixer: Arc<QueryPrefixer>,
    transaction_level: u32,
    hold_open: u32,
}

impl DataAccess {
    pub(crate) fn new(
        conn: Box<dyn SqlConnection>,
        dialect: Dialect,
        prefixer: Arc<QueryPrefixer>,
    ) -> Self {
        Self {
            conn,
            dialect,
            prefixer,
            transaction_level: 0,
            hold_open: 0,
        }
    }

    /// The dialect this instance speaks.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn prepare(&self, query: &str) -> String {
        self.prefixer.apply(query)
    }

    /// Bumps the hold-open counter; the store's bulk scope keeps the
    /// connection pinned while it is nonzero.
    pub(crate) fn acquire(&mut self) {
        self.hold_open += 1;
    }

    /// Drops one hold; returns true when the counter reaches zero and the
    /// physical connection may be released.
    pub(crate) fn release(&mut self) -> bool {
        self.hold_open -= 1;
        self.hold_open == 0
    }

    // -- Transactions

    /// Runs `body` inside a transaction, nesting by counter: the first
    /// entry opens the transaction, the innermost successful exit commits,
    /// and an error unwinds with a rollback at the outer frame. Nested
    /// bodies therefore commit exactly once, and an inner failure means no
    /// commit happens at all.
    ///
    /// # Errors
    ///
    /// Propagates the body's error, or the engine's error for the
    /// transaction statements themselves.
    pub fn in_transaction<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        if self.transaction_level == 0 {
            self.conn.begin()?;
        }
        self.transaction_level += 1;
        match body(self) {
            Ok(value) => {
                self.transaction_level -= 1;
                if self.transaction_level == 0 {
                    self.conn.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                self.transaction_level -= 1;
                if self.transaction_level == 0 {
                    let _ = self.conn.rollback();
                }
                Err(err)
            }
        }
    }

    // -- Global parameters

    /// Reads one global parameter.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn global_parameter(&mut self, key: &str) -> Result<Option<String>, QueryError> {
        let sql = self.prepare(queries::SELECT_GLOBAL_PARAMETER);
        let rows = self.conn.query(&sql, &[SqlValue::text(key)])?;
        rows.first()
            .map(|row| row.text(0).map(str::to_owned))
            .transpose()
    }

    /// Writes or deletes one global parameter. `None` deletes the row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn set_global_parameter(
        &mut self,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), QueryError> {
        match value {
            None => {
                let sql = self.prepare(queries::DELETE_GLOBAL_PARAMETER);
                self.conn.execute(&sql, &[SqlValue::text(key)])?;
            }
            Some(value) => {
                let sql = self.prepare(self.dialect.insert_global_parameter());
                self.conn
                    .execute(&sql, &[SqlValue::text(key), SqlValue::text(value)])?;
            }
        }
        Ok(())
    }

    // -- Subjects

    /// Resolves a subject ref by row id.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn subject_ref_by_id(&mut self, id: i32) -> Result<Option<Arc<SubjectRef>>, QueryError> {
        let sql = self.prepare(queries::SELECT_SUBJECT_BY_ID);
        let rows = self.conn.query(&sql, &[SqlValue::int(id)])?;
        rows.first()
            .map(|row| {
                Ok(Arc::new(SubjectRef::resolved(
                    id,
                    row.text(0)?,
                    row.text(1)?,
                )))
            })
            .transpose()
    }

    /// Resolves a subject ref by (type, identifier).
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn subject_ref(
        &mut self,
        subject_type: &str,
        identifier: &str,
    ) -> Result<Option<Arc<SubjectRef>>, QueryError> {
        let sql = self.prepare(queries::SELECT_SUBJECT_BY_NAME);
        let rows = self.conn.query(
            &sql,
            &[SqlValue::text(subject_type), SqlValue::text(identifier)],
        )?;
        rows.first()
            .map(|row| {
                Ok(Arc::new(SubjectRef::resolved(
                    row.int(0)? as i32,
                    subject_type,
                    identifier,
                )))
            })
            .transpose()
    }

    /// Deletes a subject row by (type, identifier). Returns whether a row
    /// was removed.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn remove_subject(
        &mut self,
        subject_type: &str,
        identifier: &str,
    ) -> Result<bool, QueryError> {
        let sql = self.prepare(queries::DELETE_SUBJECT_BY_NAME);
        let affected = self.conn.execute(
            &sql,
            &[SqlValue::text(subject_type), SqlValue::text(identifier)],
        )?;
        Ok(affected > 0)
    }

    /// Deletes a subject row by allocated id. Returns whether a row was
    /// removed.
    ///
    /// # Errors
    ///
    /// Fails with [`QueryError::UnallocatedReference`] for an unallocated
    /// ref, or the engine's error for the failing statement.
    pub fn remove_subject_ref(&mut self, subject: &SubjectRef) -> Result<bool, QueryError> {
        let sql = self.prepare(queries::DELETE_SUBJECT_BY_ID);
        let affected = self.conn.execute(&sql, &[SqlValue::int(subject.id()?)])?;
        Ok(affected > 0)
    }

    /// Resolves a subject ref, inserting its row if absent. Every call for
    /// the same (type, identifier) yields the same id.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn get_or_create_subject_ref(
        &mut self,
        subject_type: &str,
        identifier: &str,
    ) -> Result<Arc<SubjectRef>, QueryError> {
        let subject = Arc::new(SubjectRef::unresolved(subject_type, identifier));
        self.allocate_subject_ref(&subject)?;
        Ok(subject)
    }

    /// Allocates a row for the ref if it has none, writing the id back in
    /// place. Runs select-then-insert inside one transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`QueryError::MissingGeneratedKey`]
    /// if the insert produced no key.
    pub fn allocate_subject_ref(&mut self, subject: &SubjectRef) -> Result<(), QueryError> {
        self.in_transaction(|dao| {
            let select = dao.prepare(queries::SELECT_SUBJECT_BY_NAME);
            let rows = dao.conn.query(
                &select,
                &[
                    SqlValue::text(subject.subject_type()),
                    SqlValue::text(subject.identifier()),
                ],
            )?;
            if let Some(row) = rows.first() {
                subject.set_id(row.int(0)? as i32);
            } else {
                let insert = dao.prepare(queries::INSERT_SUBJECT);
                let id = dao.conn.insert_returning_id(
                    &insert,
                    &[
                        SqlValue::text(subject.subject_type()),
                        SqlValue::text(subject.identifier()),
                    ],
                )?;
                if id <= 0 {
                    return Err(QueryError::MissingGeneratedKey { table: "subjects" });
                }
                subject.set_id(id as i32);
            }
            Ok(())
        })
    }

    /// The ref's row id, allocating on first use.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the allocating statements.
    pub fn id_allocating(&mut self, subject: &SubjectRef) -> Result<i32, QueryError> {
        if subject.is_unallocated() {
            self.allocate_subject_ref(subject)?;
        }
        subject.id()
    }

    /// Every identifier registered under a type.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn all_identifiers(&mut self, subject_type: &str) -> Result<HashSet<String>, QueryError> {
        let sql = self.prepare(queries::SELECT_SUBJECT_IDENTIFIERS);
        let rows = self.conn.query(&sql, &[SqlValue::text(subject_type)])?;
        rows.iter()
            .map(|row| row.text(0).map(str::to_owned))
            .collect()
    }

    /// Every distinct registered subject type.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn registered_types(&mut self) -> Result<HashSet<String>, QueryError> {
        let sql = self.prepare(queries::SELECT_SUBJECT_TYPES);
        let rows = self.conn.query(&sql, &[])?;
        rows.iter()
            .map(|row| row.text(0).map(str::to_owned))
            .collect()
    }

    /// Every subject ref in the database.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn all_subject_refs(&mut self) -> Result<Vec<Arc<SubjectRef>>, QueryError> {
        let sql = self.prepare(queries::SELECT_ALL_SUBJECTS);
        let rows = self.conn.query(&sql, &[])?;
        rows.iter()
            .map(|row| {
                Ok(Arc::new(SubjectRef::resolved(
                    row.int(0)? as i32,
                    row.text(1)?,
                    row.text(2)?,
                )))
            })
            .collect()
    }

    // -- Segments

    fn segment_contexts(&mut self, segment_id: i32) -> Result<ContextSet, QueryError> {
        let sql = self.prepare(queries::SELECT_CONTEXTS_BY_SEGMENT);
        let rows = self.conn.query(&sql, &[SqlValue::int(segment_id)])?;
        rows.iter()
            .map(|row| Ok(Context::new(row.text(0)?, row.text(1)?)))
            .collect()
    }

    /// Loads every segment stored for the subject, allocating the ref if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn segments(&mut self, subject: &SubjectRef) -> Result<Vec<Arc<Segment>>, QueryError> {
        let subject_id = self.id_allocating(subject)?;
        let sql = self.prepare(queries::SELECT_SEGMENTS_BY_SUBJECT);
        let segment_rows = self.conn.query(&sql, &[SqlValue::int(subject_id)])?;

        let mut segments = Vec::with_capacity(segment_rows.len());
        for row in &segment_rows {
            let id = row.int(0)? as i32;
            let default_value = row.opt_int(1)?.map(|value| value as i32);
            let contexts = self.segment_contexts(id)?;

            let sql = self.prepare(queries::SELECT_PERMISSIONS_BY_SEGMENT);
            let permissions: HashMap<String, i32> = self
                .conn
                .query(&sql, &[SqlValue::int(id)])?
                .iter()
                .map(|row| Ok((row.text(0)?.to_owned(), row.int(1)? as i32)))
                .collect::<Result<_, QueryError>>()?;

            let sql = self.prepare(queries::SELECT_OPTIONS_BY_SEGMENT);
            let options: HashMap<String, String> = self
                .conn
                .query(&sql, &[SqlValue::int(id)])?
                .iter()
                .map(|row| Ok((row.text(0)?.to_owned(), row.text(1)?.to_owned())))
                .collect::<Result<_, QueryError>>()?;

            let sql = self.prepare(queries::SELECT_PARENTS_BY_SEGMENT);
            let mut parents = Vec::new();
            for row in &self.conn.query(&sql, &[SqlValue::int(id)])? {
                // a LEFT JOIN row with no subject means the parent row is
                // already gone; skip it
                let Some(parent_id) = row.opt_int(0)? else {
                    continue;
                };
                parents.push(Arc::new(SubjectRef::resolved(
                    parent_id as i32,
                    row.text(1)?,
                    row.text(2)?,
                )));
            }

            segments.push(Arc::new(Segment::resolved(
                id,
                contexts,
                permissions,
                options,
                parents,
                default_value,
            )));
        }
        Ok(segments)
    }

    /// Inserts a row for the segment if it has none, capturing the default
    /// value, writing the id back in place, and materializing the context
    /// rows that define the segment's scope. Allocated segments are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, or [`QueryError::MissingGeneratedKey`]
    /// if the insert produced no key.
    pub fn allocate_segment(
        &mut self,
        subject: &SubjectRef,
        segment: &Segment,
    ) -> Result<(), QueryError> {
        if !segment.is_unallocated() {
            return Ok(());
        }
        let subject_id = self.id_allocating(subject)?;
        let sql = self.prepare(queries::INSERT_SEGMENT);
        let id = self.conn.insert_returning_id(
            &sql,
            &[
                SqlValue::int(subject_id),
                SqlValue::opt_int(segment.default_value()),
            ],
        )?;
        if id <= 0 {
            return Err(QueryError::MissingGeneratedKey { table: "segments" });
        }
        segment.set_id(id as i32);
        self.set_contexts(segment, segment.contexts())
    }

    /// Inserts the segment (if needed) and writes its full payload:
    /// contexts, options, parents, permissions, and default value.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the enclosing transaction rolls back.
    pub fn update_full_segment(
        &mut self,
        subject: &SubjectRef,
        segment: &Segment,
    ) -> Result<(), QueryError> {
        self.in_transaction(|dao| {
            dao.allocate_segment(subject, segment)?;
            dao.set_contexts(segment, segment.contexts())?;
            dao.set_options(segment, segment.options())?;
            dao.set_parents(segment, segment.parents())?;
            dao.set_permissions(segment, segment.permissions())?;
            dao.set_default_value(segment, segment.default_value())?;
            Ok(())
        })
    }

    /// Deletes the segment's row. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Fails with [`QueryError::UnallocatedReference`] for an unallocated
    /// segment, or the engine's error for the failing statement.
    pub fn remove_segment(&mut self, segment: &Segment) -> Result<bool, QueryError> {
        let sql = self.prepare(queries::DELETE_SEGMENT);
        let affected = self.conn.execute(&sql, &[SqlValue::int(segment.id()?)])?;
        Ok(affected > 0)
    }

    /// Replaces the segment's context rows: delete-all, then insert each
    /// pair.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the transaction rolls back.
    pub fn set_contexts(
        &mut self,
        segment: &Segment,
        contexts: &ContextSet,
    ) -> Result<(), QueryError> {
        let segment_id = segment.id()?;
        self.in_transaction(|dao| {
            let delete = dao.prepare(queries::DELETE_CONTEXTS);
            dao.conn.execute(&delete, &[SqlValue::int(segment_id)])?;
            let insert = dao.prepare(queries::INSERT_CONTEXT);
            for context in contexts {
                dao.conn.execute(
                    &insert,
                    &[
                        SqlValue::int(segment_id),
                        SqlValue::text(context.key()),
                        SqlValue::text(context.value()),
                    ],
                )?;
            }
            Ok(())
        })
    }

    // -- Permissions

    /// Upserts one permission row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn set_permission(
        &mut self,
        segment: &Segment,
        key: &str,
        value: i32,
    ) -> Result<(), QueryError> {
        let sql = self.prepare(self.dialect.insert_permission());
        self.conn.execute(
            &sql,
            &[
                SqlValue::int(segment.id()?),
                SqlValue::text(key),
                SqlValue::int(value),
            ],
        )?;
        Ok(())
    }

    /// Deletes one permission row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn clear_permission(&mut self, segment: &Segment, key: &str) -> Result<(), QueryError> {
        let sql = self.prepare(queries::DELETE_PERMISSION_KEY);
        self.conn
            .execute(&sql, &[SqlValue::int(segment.id()?), SqlValue::text(key)])?;
        Ok(())
    }

    /// Replaces the segment's permission rows: delete-all, then insert the
    /// given map.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the transaction rolls back.
    pub fn set_permissions(
        &mut self,
        segment: &Segment,
        values: &HashMap<String, i32>,
    ) -> Result<(), QueryError> {
        let segment_id = segment.id()?;
        self.in_transaction(|dao| {
            let delete = dao.prepare(queries::DELETE_PERMISSIONS);
            dao.conn.execute(&delete, &[SqlValue::int(segment_id)])?;
            let insert = dao.prepare(dao.dialect.insert_permission());
            for (key, value) in values {
                dao.conn.execute(
                    &insert,
                    &[
                        SqlValue::int(segment_id),
                        SqlValue::text(key.as_str()),
                        SqlValue::int(*value),
                    ],
                )?;
            }
            Ok(())
        })
    }

    // -- Options

    /// Upserts one option row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn set_option(
        &mut self,
        segment: &Segment,
        key: &str,
        value: &str,
    ) -> Result<(), QueryError> {
        let sql = self.prepare(self.dialect.insert_option());
        self.conn.execute(
            &sql,
            &[
                SqlValue::int(segment.id()?),
                SqlValue::text(key),
                SqlValue::text(value),
            ],
        )?;
        Ok(())
    }

    /// Deletes one option row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn clear_option(&mut self, segment: &Segment, key: &str) -> Result<(), QueryError> {
        let sql = self.prepare(queries::DELETE_OPTION_KEY);
        self.conn
            .execute(&sql, &[SqlValue::int(segment.id()?), SqlValue::text(key)])?;
        Ok(())
    }

    /// Replaces the segment's option rows: delete-all, then insert the
    /// given map.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the transaction rolls back.
    pub fn set_options(
        &mut self,
        segment: &Segment,
        values: &HashMap<String, String>,
    ) -> Result<(), QueryError> {
        let segment_id = segment.id()?;
        self.in_transaction(|dao| {
            let delete = dao.prepare(queries::DELETE_OPTIONS);
            dao.conn.execute(&delete, &[SqlValue::int(segment_id)])?;
            let insert = dao.prepare(dao.dialect.insert_option());
            for (key, value) in values {
                dao.conn.execute(
                    &insert,
                    &[
                        SqlValue::int(segment_id),
                        SqlValue::text(key.as_str()),
                        SqlValue::text(value.as_str()),
                    ],
                )?;
            }
            Ok(())
        })
    }

    // -- Default values

    /// Updates the segment row's default value. `None` writes SQL NULL, so
    /// an absent default round-trips as absent.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn set_default_value(
        &mut self,
        segment: &Segment,
        value: Option<i32>,
    ) -> Result<(), QueryError> {
        let sql = self.prepare(queries::UPDATE_SEGMENT_DEFAULT);
        self.conn.execute(
            &sql,
            &[SqlValue::opt_int(value), SqlValue::int(segment.id()?)],
        )?;
        Ok(())
    }

    // -- Parents

    /// Inserts one parent row, allocating the parent ref if needed.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn add_parent(&mut self, segment: &Segment, parent: &SubjectRef) -> Result<(), QueryError> {
        let segment_id = segment.id()?;
        let parent_id = self.id_allocating(parent)?;
        let sql = self.prepare(queries::INSERT_PARENT);
        self.conn
            .execute(&sql, &[SqlValue::int(segment_id), SqlValue::int(parent_id)])?;
        Ok(())
    }

    /// Deletes one parent row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn remove_parent(
        &mut self,
        segment: &Segment,
        parent: &SubjectRef,
    ) -> Result<(), QueryError> {
        let segment_id = segment.id()?;
        let parent_id = self.id_allocating(parent)?;
        let sql = self.prepare(queries::DELETE_PARENT);
        self.conn
            .execute(&sql, &[SqlValue::int(segment_id), SqlValue::int(parent_id)])?;
        Ok(())
    }

    /// Replaces the segment's parent rows: delete-all, then insert the
    /// given list in order.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the transaction rolls back.
    pub fn set_parents(
        &mut self,
        segment: &Segment,
        parents: &[Arc<SubjectRef>],
    ) -> Result<(), QueryError> {
        let segment_id = segment.id()?;
        self.in_transaction(|dao| {
            let delete = dao.prepare(queries::DELETE_PARENTS);
            dao.conn.execute(&delete, &[SqlValue::int(segment_id)])?;
            let insert = dao.prepare(queries::INSERT_PARENT);
            for parent in parents {
                let parent_id = dao.id_allocating(parent)?;
                dao.conn
                    .execute(&insert, &[SqlValue::int(segment_id), SqlValue::int(parent_id)])?;
            }
            Ok(())
        })
    }

    // -- Queued segment updates

    /// Drains the segment's pending queue and interprets each operation.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the first failing operation.
    pub fn run_segment_updates(&mut self, segment: &Segment) -> Result<(), QueryError> {
        for update in segment.take_updates() {
            self.apply_segment_update(segment, &update)?;
        }
        Ok(())
    }

    fn apply_segment_update(
        &mut self,
        segment: &Segment,
        update: &SegmentUpdate,
    ) -> Result<(), QueryError> {
        match update {
            SegmentUpdate::SetPermission { key, value } => {
                self.set_permission(segment, key, *value)
            }
            SegmentUpdate::ClearPermission { key } => self.clear_permission(segment, key),
            SegmentUpdate::ReplacePermissions { values } => self.set_permissions(segment, values),
            SegmentUpdate::SetOption { key, value } => self.set_option(segment, key, value),
            SegmentUpdate::ClearOption { key } => self.clear_option(segment, key),
            SegmentUpdate::ReplaceOptions { values } => self.set_options(segment, values),
            SegmentUpdate::AddParent { parent } => self.add_parent(segment, parent),
            SegmentUpdate::RemoveParent { parent } => self.remove_parent(segment, parent),
            SegmentUpdate::ReplaceParents { parents } => self.set_parents(segment, parents),
            SegmentUpdate::SetDefault { value } => self.set_default_value(segment, *value),
        }
    }

    // -- Context inheritance

    /// Loads the whole context-inheritance mapping, parents ordered by
    /// insert id within each child.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn context_inheritance(&mut self) -> Result<ContextInheritance, QueryError> {
        let sql = self.prepare(queries::SELECT_CONTEXT_INHERITANCE);
        let rows = self.conn.query(&sql, &[])?;
        let mut ordered: Vec<Context> = Vec::new();
        let mut by_child: StdHashMap<Context, Vec<Context>> = StdHashMap::new();
        for row in &rows {
            let child = Context::new(row.text(0)?, row.text(1)?);
            let parent = Context::new(row.text(2)?, row.text(3)?);
            let parents = by_child.entry(child.clone()).or_insert_with(|| {
                ordered.push(child.clone());
                Vec::new()
            });
            parents.push(parent);
        }
        let mut mapping = HashMap::new();
        for child in ordered {
            if let Some(parents) = by_child.remove(&child) {
                mapping.insert(child, parents);
            }
        }
        Ok(ContextInheritance::new(mapping))
    }

    /// Replaces one child's inheritance rows: delete-by-child, then insert
    /// the parents in list order.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the transaction rolls back.
    pub fn set_context_inheritance(
        &mut self,
        child: &Context,
        parents: &[Context],
    ) -> Result<(), QueryError> {
        self.in_transaction(|dao| {
            let delete = dao.prepare(queries::DELETE_CONTEXT_INHERITANCE_CHILD);
            dao.conn.execute(
                &delete,
                &[SqlValue::text(child.key()), SqlValue::text(child.value())],
            )?;
            let insert = dao.prepare(queries::INSERT_CONTEXT_INHERITANCE);
            for parent in parents {
                dao.conn.execute(
                    &insert,
                    &[
                        SqlValue::text(child.key()),
                        SqlValue::text(child.value()),
                        SqlValue::text(parent.key()),
                        SqlValue::text(parent.value()),
                    ],
                )?;
            }
            Ok(())
        })
    }

    // -- Rank ladders

    /// Loads a ladder, ranks ordered by insert id.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn rank_ladder(&mut self, name: &str) -> Result<RankLadder, QueryError> {
        let sql = self.prepare(queries::SELECT_RANK_LADDER);
        let rows = self.conn.query(&sql, &[SqlValue::text(name)])?;
        let mut ranks = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(id) = row.opt_int(0)? else {
                continue;
            };
            ranks.push(Arc::new(SubjectRef::resolved(
                id as i32,
                row.text(1)?,
                row.text(2)?,
            )));
        }
        Ok(RankLadder::new(name, ranks))
    }

    /// Whether any entries exist under the ladder name.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn has_rank_ladder(&mut self, name: &str) -> Result<bool, QueryError> {
        let sql = self.prepare(queries::TEST_RANK_LADDER);
        let rows = self.conn.query(&sql, &[SqlValue::text(name)])?;
        Ok(!rows.is_empty())
    }

    /// Replaces a ladder: delete-all by name, then insert the ranks in
    /// order so insert ids convey rank order. `None` deletes the ladder.
    ///
    /// # Errors
    ///
    /// Returns the engine's error; the transaction rolls back.
    pub fn set_rank_ladder(
        &mut self,
        name: &str,
        ladder: Option<&RankLadder>,
    ) -> Result<(), QueryError> {
        self.in_transaction(|dao| {
            let delete = dao.prepare(queries::DELETE_RANK_LADDER);
            dao.conn.execute(&delete, &[SqlValue::text(name)])?;
            if let Some(ladder) = ladder {
                let insert = dao.prepare(queries::INSERT_RANK_LADDER);
                for rank in ladder.ranks() {
                    let subject_id = dao.id_allocating(rank)?;
                    dao.conn
                        .execute(&insert, &[SqlValue::text(name), SqlValue::int(subject_id)])?;
                }
            }
            Ok(())
        })
    }

    /// Every distinct ladder name.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing query.
    pub fn all_rank_ladder_names(&mut self) -> Result<HashSet<String>, QueryError> {
        let sql = self.prepare(queries::SELECT_RANK_LADDER_NAMES);
        let rows = self.conn.query(&sql, &[])?;
        rows.iter()
            .map(|row| row.text(0).map(str::to_owned))
            .collect()
    }

    // -- Schema deployment

    /// Deploys the initial schema if the (prefixed) permissions table is
    /// absent: the dialect's bundled script is stripped of `--` comment
    /// lines, split on statement-terminating `;`, prefix-rewritten, and run
    /// as a batch. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    pub fn initialize_tables(&mut self) -> Result<(), QueryError> {
        let probe = self.prepare("{}permissions");
        if self.conn.has_table(&probe)? {
            return Ok(());
        }
        debug!(dialect = self.dialect.name(), "deploying initial schema");
        let statements = parse_script(self.dialect.schema_script(), &self.prefixer);
        self.conn.execute_script(&statements)
    }
}

/// Splits a deployment script into prefix-rewritten statements. Lines
/// starting with `--` are dropped; a statement ends at a line whose last
/// character is `;`.
fn parse_script(script: &str, prefixer: &QueryPrefixer) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in script.lines() {
        if line.starts_with("--") {
            continue;
        }
        current.push_str(line);
        if line.trim_end().ends_with(';') {
            let statement = current.trim().trim_end_matches(';').trim().to_string();
            current.clear();
            if !statement.is_empty() {
                statements.push(prefixer.apply(&statement));
            }
        } else {
            current.push(' ');
        }
    }
    statements
}
