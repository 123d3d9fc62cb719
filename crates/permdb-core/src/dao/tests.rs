//! Tests for the data-access layer, run against SQLite.

use std::sync::Arc;

use tempfile::TempDir;

use super::dialect::queries;
use super::{DataAccess, Dialect, QueryPrefixer, SqliteConnection};
use crate::context::{context_set, Context, ContextSet};
use crate::error::QueryError;
use crate::ladder::RankLadder;
use crate::segment::Segment;
use crate::subject::SubjectRef;

fn memory_dao() -> DataAccess {
    memory_dao_with_prefix("perm_")
}

fn memory_dao_with_prefix(prefix: &str) -> DataAccess {
    let conn = SqliteConnection::open_in_memory().expect("failed to open in-memory database");
    let mut dao = DataAccess::new(
        Box::new(conn),
        Dialect::Sqlite,
        Arc::new(QueryPrefixer::new(prefix)),
    );
    dao.initialize_tables().expect("failed to deploy schema");
    dao
}

/// Helper to open two independent DAOs over one database file.
fn file_daos(dir: &TempDir) -> (DataAccess, DataAccess) {
    let path = dir.path().join("test.db");
    let prefixer = Arc::new(QueryPrefixer::new("perm_"));
    let open = |prefixer: Arc<QueryPrefixer>| {
        DataAccess::new(
            Box::new(SqliteConnection::open(&path).expect("failed to open database")),
            Dialect::Sqlite,
            prefixer,
        )
    };
    let mut first = open(prefixer.clone());
    first.initialize_tables().expect("failed to deploy schema");
    (first, open(prefixer))
}

#[test]
fn schema_deploys_once() {
    let mut dao = memory_dao();
    // second call must be a no-op, not a failed redeploy
    dao.initialize_tables().expect("re-init should be a no-op");
}

#[test]
fn get_or_create_is_idempotent() {
    let mut dao = memory_dao();
    assert!(dao
        .subject_ref("group", "admin")
        .expect("lookup failed")
        .is_none());

    let created = dao
        .get_or_create_subject_ref("group", "admin")
        .expect("create failed");
    let id = created.id().expect("created ref must be allocated");

    let fetched = dao
        .subject_ref("group", "admin")
        .expect("lookup failed")
        .expect("ref must exist");
    assert_eq!(fetched.id().expect("fetched ref is allocated"), id);

    let again = dao
        .get_or_create_subject_ref("group", "admin")
        .expect("create failed");
    assert_eq!(again.id().expect("allocated"), id);

    let by_id = dao
        .subject_ref_by_id(id)
        .expect("lookup failed")
        .expect("ref must exist");
    assert_eq!(by_id, created);
}

#[test]
fn remove_subject_by_name_and_ref() {
    let mut dao = memory_dao();
    let first = dao
        .get_or_create_subject_ref("group", "one")
        .expect("create failed");
    let second = dao
        .get_or_create_subject_ref("group", "two")
        .expect("create failed");

    assert!(dao.remove_subject("group", "one").expect("delete failed"));
    assert!(dao
        .subject_ref(first.subject_type(), first.identifier())
        .expect("lookup failed")
        .is_none());

    assert!(dao.remove_subject_ref(&second).expect("delete failed"));
    assert!(dao
        .subject_ref_by_id(second.id().expect("allocated"))
        .expect("lookup failed")
        .is_none());

    assert!(!dao.remove_subject("group", "one").expect("delete failed"));
}

#[test]
fn listing_identifiers_and_types() {
    let mut dao = memory_dao();
    dao.get_or_create_subject_ref("group", "admin")
        .expect("create failed");
    dao.get_or_create_subject_ref("group", "mod")
        .expect("create failed");
    dao.get_or_create_subject_ref("user", "alice")
        .expect("create failed");

    let groups = dao.all_identifiers("group").expect("listing failed");
    assert_eq!(groups.len(), 2);
    assert!(groups.contains("admin") && groups.contains("mod"));

    let types = dao.registered_types().expect("listing failed");
    assert_eq!(types.len(), 2);

    assert_eq!(dao.all_subject_refs().expect("listing failed").len(), 3);
}

#[test]
fn full_segment_round_trip() {
    let mut dao = memory_dao();
    let subject = dao
        .get_or_create_subject_ref("user", "alice")
        .expect("create failed");
    let parent = Arc::new(SubjectRef::unresolved("group", "admin"));

    let contexts = context_set([("world", "nether")]);
    let segment = Segment::unallocated(contexts.clone())
        .with_permission("build", 1)
        .with_option("prefix", "[a]")
        .with_added_parent(parent)
        .with_default_value(Some(-1));
    segment.take_updates();
    dao.update_full_segment(&subject, &segment)
        .expect("write failed");
    assert!(!segment.is_unallocated());

    let segments = dao.segments(&subject).expect("read failed");
    assert_eq!(segments.len(), 1);
    let loaded = &segments[0];
    assert_eq!(loaded.contexts(), &contexts);
    assert_eq!(loaded.permissions().get("build"), Some(&1));
    assert_eq!(
        loaded.options().get("prefix").map(String::as_str),
        Some("[a]")
    );
    assert_eq!(loaded.parents().len(), 1);
    assert_eq!(loaded.parents()[0].identifier(), "admin");
    assert_eq!(loaded.default_value(), Some(-1));
}

#[test]
fn permission_upsert_updates_in_place() {
    let mut dao = memory_dao();
    let subject = dao
        .get_or_create_subject_ref("user", "alice")
        .expect("create failed");
    let segment = Segment::unallocated(ContextSet::new());
    dao.allocate_segment(&subject, &segment).expect("allocate");

    dao.set_permission(&segment, "build", 1).expect("set");
    dao.set_permission(&segment, "build", -1).expect("upsert");

    let loaded = &dao.segments(&subject).expect("read failed")[0];
    assert_eq!(loaded.permissions().get("build"), Some(&-1));
    assert_eq!(loaded.permissions().len(), 1);
}

#[test]
fn option_upsert_updates_in_place() {
    let mut dao = memory_dao();
    let subject = dao
        .get_or_create_subject_ref("user", "alice")
        .expect("create failed");
    let segment = Segment::unallocated(ContextSet::new());
    dao.allocate_segment(&subject, &segment).expect("allocate");

    dao.set_option(&segment, "prefix", "[a]").expect("set");
    dao.set_option(&segment, "prefix", "[b]").expect("upsert");

    let loaded = &dao.segments(&subject).expect("read failed")[0];
    assert_eq!(
        loaded.options().get("prefix").map(String::as_str),
        Some("[b]")
    );
}

#[test]
fn removing_a_segment_cascades_to_rows() {
    let mut dao = memory_dao();
    let subject = dao
        .get_or_create_subject_ref("user", "alice")
        .expect("create failed");
    let segment = Segment::unallocated(ContextSet::new()).with_permission("build", 1);
    segment.take_updates();
    dao.update_full_segment(&subject, &segment)
        .expect("write failed");

    assert!(dao.remove_segment(&segment).expect("delete failed"));
    assert!(dao.segments(&subject).expect("read failed").is_empty());
    assert!(!dao.remove_segment(&segment).expect("second delete"));
}

#[test]
fn default_value_null_round_trips_as_absent() {
    let mut dao = memory_dao();
    let subject = dao
        .get_or_create_subject_ref("user", "alice")
        .expect("create failed");
    let segment = Segment::unallocated(ContextSet::new()).with_permission("keep", 1);
    segment.take_updates();
    dao.update_full_segment(&subject, &segment)
        .expect("write failed");

    dao.set_default_value(&segment, Some(1)).expect("set");
    assert_eq!(
        dao.segments(&subject).expect("read")[0].default_value(),
        Some(1)
    );

    dao.set_default_value(&segment, None).expect("clear");
    assert_eq!(dao.segments(&subject).expect("read")[0].default_value(), None);
}

#[test]
fn global_parameter_set_and_delete_on_none() {
    let mut dao = memory_dao();
    assert!(dao.global_parameter("motd").expect("read").is_none());

    dao.set_global_parameter("motd", Some("hello"))
        .expect("write failed");
    assert_eq!(
        dao.global_parameter("motd").expect("read").as_deref(),
        Some("hello")
    );

    dao.set_global_parameter("motd", Some("bye"))
        .expect("upsert failed");
    assert_eq!(
        dao.global_parameter("motd").expect("read").as_deref(),
        Some("bye")
    );

    dao.set_global_parameter("motd", None).expect("delete failed");
    assert!(dao.global_parameter("motd").expect("read").is_none());
}

#[test]
fn context_inheritance_round_trip_preserves_parent_order() {
    let mut dao = memory_dao();
    let child = Context::new("world", "nether");
    let parents = vec![
        Context::new("world", "overworld"),
        Context::new("server", "lobby"),
    ];
    dao.set_context_inheritance(&child, &parents)
        .expect("write failed");

    let loaded = dao.context_inheritance().expect("read failed");
    assert_eq!(loaded.parents(&child), parents);

    // replacing rewrites in the new order
    let reversed: Vec<Context> = parents.iter().rev().cloned().collect();
    dao.set_context_inheritance(&child, &reversed)
        .expect("write failed");
    let loaded = dao.context_inheritance().expect("read failed");
    assert_eq!(loaded.parents(&child), reversed);
}

#[test]
fn rank_ladder_round_trip_preserves_order() {
    let mut dao = memory_dao();
    let ladder = RankLadder::new(
        "staff",
        vec![
            Arc::new(SubjectRef::unresolved("group", "helper")),
            Arc::new(SubjectRef::unresolved("group", "mod")),
            Arc::new(SubjectRef::unresolved("group", "admin")),
        ],
    );
    assert!(!dao.has_rank_ladder("staff").expect("probe failed"));

    dao.set_rank_ladder("staff", Some(&ladder))
        .expect("write failed");
    assert!(dao.has_rank_ladder("staff").expect("probe failed"));

    let loaded = dao.rank_ladder("staff").expect("read failed");
    let names: Vec<&str> = loaded.ranks().iter().map(|r| r.identifier()).collect();
    assert_eq!(names, ["helper", "mod", "admin"]);

    let names = dao.all_rank_ladder_names().expect("listing failed");
    assert!(names.contains("staff"));

    dao.set_rank_ladder("staff", None).expect("delete failed");
    assert!(!dao.has_rank_ladder("staff").expect("probe failed"));
}

#[test]
fn nested_transaction_commits_once_at_the_outer_frame() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let (mut writer, mut reader) = file_daos(&dir);

    writer
        .in_transaction(|dao| {
            dao.set_global_parameter("outer", Some("1"))?;
            dao.in_transaction(|dao| dao.set_global_parameter("inner", Some("2")))?;
            // the inner exit must not have committed yet
            Ok(())
        })
        .expect("transaction failed");

    assert_eq!(
        reader.global_parameter("outer").expect("read").as_deref(),
        Some("1")
    );
    assert_eq!(
        reader.global_parameter("inner").expect("read").as_deref(),
        Some("2")
    );
}

#[test]
fn failed_inner_body_means_no_commit() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let (mut writer, mut reader) = file_daos(&dir);

    let result: Result<(), QueryError> = writer.in_transaction(|dao| {
        dao.set_global_parameter("outer", Some("1"))?;
        dao.in_transaction(|dao| {
            dao.set_global_parameter("inner", Some("2"))?;
            Err(QueryError::MissingGeneratedKey { table: "subjects" })
        })
    });
    assert!(result.is_err());

    assert!(reader.global_parameter("outer").expect("read").is_none());
    assert!(reader.global_parameter("inner").expect("read").is_none());
}

#[test]
fn prefix_substitution_covers_every_template() {
    let prefixer = QueryPrefixer::new("perm_");
    let templates = [
        queries::SELECT_GLOBAL_PARAMETER,
        queries::DELETE_GLOBAL_PARAMETER,
        queries::SELECT_SUBJECT_BY_ID,
        queries::SELECT_SUBJECT_BY_NAME,
        queries::INSERT_SUBJECT,
        queries::DELETE_SUBJECT_BY_ID,
        queries::DELETE_SUBJECT_BY_NAME,
        queries::SELECT_SUBJECT_IDENTIFIERS,
        queries::SELECT_SUBJECT_TYPES,
        queries::SELECT_ALL_SUBJECTS,
        queries::SELECT_SEGMENTS_BY_SUBJECT,
        queries::INSERT_SEGMENT,
        queries::DELETE_SEGMENT,
        queries::UPDATE_SEGMENT_DEFAULT,
        queries::SELECT_CONTEXTS_BY_SEGMENT,
        queries::INSERT_CONTEXT,
        queries::DELETE_CONTEXTS,
        queries::SELECT_PERMISSIONS_BY_SEGMENT,
        queries::DELETE_PERMISSION_KEY,
        queries::DELETE_PERMISSIONS,
        queries::SELECT_OPTIONS_BY_SEGMENT,
        queries::DELETE_OPTION_KEY,
        queries::DELETE_OPTIONS,
        queries::SELECT_PARENTS_BY_SEGMENT,
        queries::INSERT_PARENT,
        queries::DELETE_PARENT,
        queries::DELETE_PARENTS,
        queries::SELECT_CONTEXT_INHERITANCE,
        queries::INSERT_CONTEXT_INHERITANCE,
        queries::DELETE_CONTEXT_INHERITANCE_CHILD,
        queries::SELECT_RANK_LADDER,
        queries::TEST_RANK_LADDER,
        queries::INSERT_RANK_LADDER,
        queries::DELETE_RANK_LADDER,
        queries::SELECT_RANK_LADDER_NAMES,
        Dialect::Sqlite.insert_global_parameter(),
        Dialect::Sqlite.insert_permission(),
        Dialect::Sqlite.insert_option(),
        Dialect::Mysql.insert_global_parameter(),
        Dialect::Mysql.insert_permission(),
        Dialect::Mysql.insert_option(),
    ];
    for template in templates {
        let placeholders = template.matches("{}").count();
        assert!(placeholders > 0, "template has no table reference: {template}");
        let rewritten = prefixer.apply(template);
        assert!(
            !rewritten.contains("{}"),
            "placeholder survived substitution: {rewritten}"
        );
        assert_eq!(
            rewritten.matches("perm_").count(),
            placeholders,
            "each placeholder must be replaced exactly once: {rewritten}"
        );
    }
}

#[test]
fn prefix_memo_returns_cached_rewrites() {
    let prefixer = QueryPrefixer::new("perm_");
    let first = prefixer.apply("SELECT * FROM {}subjects");
    let second = prefixer.apply("SELECT * FROM {}subjects");
    assert_eq!(first, second);
    assert_eq!(first, "SELECT * FROM perm_subjects");
}

#[test]
fn empty_prefix_leaves_bare_table_names() {
    let mut dao = memory_dao_with_prefix("");
    dao.get_or_create_subject_ref("group", "admin")
        .expect("create failed");
    assert!(dao
        .subject_ref("group", "admin")
        .expect("lookup failed")
        .is_some());
}

#[test]
fn queued_segment_updates_replay_in_order() {
    let mut dao = memory_dao();
    let subject = dao
        .get_or_create_subject_ref("user", "alice")
        .expect("create failed");
    let base = Segment::unallocated(ContextSet::new()).with_permission("keep", 1);
    base.take_updates();
    dao.update_full_segment(&subject, &base)
        .expect("write failed");

    // set then clear: replaying in order must leave the permission gone
    let changed = base.with_permission("build", 1).without_permission("build");
    dao.run_segment_updates(&changed).expect("replay failed");

    let loaded = &dao.segments(&subject).expect("read failed")[0];
    assert!(!loaded.permissions().contains_key("build"));
    assert_eq!(loaded.permissions().get("keep"), Some(&1));
    // the queue drains on replay
    assert_eq!(changed.pending_update_count(), 0);
}
