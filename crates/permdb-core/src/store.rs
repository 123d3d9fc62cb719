//! The SQL store.
//!
//! [`SqlStore`] is the outward contract of the engine: it opens the data
//! source, normalizes the table prefix, probes the dialect, deploys the
//! schema once, serves snapshot reads, schedules writes on a bounded
//! worker, and offers bulk-operation scopes in which one [`DataAccess`] is
//! pinned to the calling thread.
//!
//! Reads may run on any thread. Writes return a [`WriteHandle`] that
//! completes when the transaction commits; no ordering is promised between
//! independently submitted writes, so callers needing ordering chain on the
//! handle.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::dao::{
    DataAccess, Dialect, MysqlConnection, QueryPrefixer, SqlConnection, SqliteConnection,
};
use crate::data::{SubjectData, SubjectDataContent, SubjectDataView};
use crate::error::{LoadError, QueryError, StoreError};
use crate::inheritance::ContextInheritance;
use crate::ladder::RankLadder;
use crate::subject::SubjectRef;

/// Depth of the write queue; submitters block once it is full.
const WRITE_QUEUE_DEPTH: usize = 64;

/// The configured data source. MySQL connections come out of a shared
/// pool; SQLite databases are files opened per checkout.
enum DataSource {
    Sqlite { path: PathBuf },
    Mysql { pool: mysql::Pool },
}

impl DataSource {
    fn connect(url: &str) -> Result<Self, LoadError> {
        if let Some(rest) = url.strip_prefix("sqlite:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            Ok(Self::Sqlite {
                path: PathBuf::from(path),
            })
        } else if url.starts_with("mysql://") {
            let opts =
                mysql::Opts::from_url(url).map_err(|err| LoadError::Connection(err.to_string()))?;
            let pool =
                mysql::Pool::new(opts).map_err(|err| LoadError::Connection(err.to_string()))?;
            Ok(Self::Mysql { pool })
        } else {
            Err(LoadError::Connection(format!(
                "unrecognized connection URL: {url}"
            )))
        }
    }

    fn open_connection(&self) -> Result<Box<dyn SqlConnection>, QueryError> {
        match self {
            Self::Sqlite { path } => Ok(Box::new(SqliteConnection::open(path)?)),
            Self::Mysql { pool } => Ok(Box::new(MysqlConnection::new(pool.get_conn()?))),
        }
    }
}

struct StoreInner {
    id: u64,
    source: DataSource,
    dialect: Dialect,
    prefixer: Arc<QueryPrefixer>,
}

impl StoreInner {
    fn open_dao(&self) -> Result<DataAccess, QueryError> {
        let conn = self.source.open_connection()?;
        Ok(DataAccess::new(conn, self.dialect, self.prefixer.clone()))
    }
}

fn next_store_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    /// The DataAccess pinned to this thread by an enclosing bulk scope,
    /// tagged with the owning store's id.
    static PINNED_DAO: RefCell<Option<(u64, Rc<RefCell<DataAccess>>)>> =
        const { RefCell::new(None) };
}

type WriteJob = Box<dyn FnOnce(&StoreInner) + Send + 'static>;

/// The bounded write worker: a dedicated thread draining a channel of
/// flush jobs so caller threads never block on database I/O.
struct WriteExecutor {
    sender: Option<SyncSender<WriteJob>>,
    worker: Option<JoinHandle<()>>,
}

impl WriteExecutor {
    fn start(inner: Arc<StoreInner>) -> Result<Self, LoadError> {
        let (sender, receiver) = mpsc::sync_channel::<WriteJob>(WRITE_QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("permdb-writer".to_string())
            .spawn(move || {
                for job in receiver {
                    job(&inner);
                }
                debug!("write worker drained and stopped");
            })
            .map_err(|err| LoadError::Worker(err.to_string()))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn submit(&self, job: WriteJob) -> Result<(), StoreError> {
        self.sender
            .as_ref()
            .ok_or(StoreError::Shutdown)?
            .send(job)
            .map_err(|_| StoreError::Shutdown)
    }
}

impl Drop for WriteExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Completion handle for a submitted write. Resolves once the write's
/// transaction commits (or fails). Await it, or block with
/// [`WriteHandle::wait`].
pub struct WriteHandle<T> {
    receiver: oneshot::Receiver<Result<T, StoreError>>,
}

impl<T> WriteHandle<T> {
    fn channel() -> (oneshot::Sender<Result<T, StoreError>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    fn failed(err: StoreError) -> Self {
        let (sender, handle) = Self::channel();
        let _ = sender.send(Err(err));
        handle
    }

    /// Blocks until the write completes.
    ///
    /// # Errors
    ///
    /// Returns the write's error, or [`StoreError::Shutdown`] if the worker
    /// stopped before completing it.
    pub fn wait(self) -> Result<T, StoreError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(StoreError::Shutdown))
    }
}

impl<T> Future for WriteHandle<T> {
    type Output = Result<T, StoreError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(StoreError::Shutdown)))
    }
}

/// SQL-backed store for permissions data.
pub struct SqlStore {
    inner: Arc<StoreInner>,
    writer: WriteExecutor,
    aliases: HashMap<String, String>,
}

impl SqlStore {
    /// Opens the data source, probes the dialect from the live
    /// connection's product name, and deploys the schema if it is absent.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] wrapped in [`StoreError`] for connection
    /// refusal, an unsupported dialect, or a failed schema deployment.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let prefix = normalize_prefix(&config.prefix);
        let source = DataSource::connect(&config.url)?;

        let probe = source
            .open_connection()
            .map_err(|err| LoadError::Connection(err.to_string()))?;
        let product = probe.product_name();
        let dialect = Dialect::for_product(product)
            .ok_or_else(|| LoadError::UnsupportedDialect(product.to_string()))?;
        drop(probe);

        let inner = Arc::new(StoreInner {
            id: next_store_id(),
            source,
            dialect,
            prefixer: Arc::new(QueryPrefixer::new(prefix.clone())),
        });

        let mut dao = inner
            .open_dao()
            .map_err(|err| LoadError::Connection(err.to_string()))?;
        dao.initialize_tables().map_err(LoadError::Deploy)?;
        drop(dao);

        info!(dialect = dialect.name(), prefix = %prefix, "sql store initialized");
        let writer = WriteExecutor::start(inner.clone())?;
        Ok(Self {
            inner,
            writer,
            aliases: config.aliases.clone(),
        })
    }

    /// The legacy alias mapping from the configuration. No active
    /// semantics.
    #[must_use]
    pub fn aliases(&self) -> &HashMap<String, String> {
        &self.aliases
    }

    /// Runs `f` against the thread-pinned DataAccess if a bulk scope is
    /// active on this thread, or a fresh per-operation instance otherwise.
    fn with_dao<T>(
        &self,
        f: impl FnOnce(&mut DataAccess) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        let pinned = PINNED_DAO.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|(id, dao)| (*id == self.inner.id).then(|| dao.clone()))
        });
        match pinned {
            Some(dao) => f(&mut dao.borrow_mut()),
            None => {
                let mut dao = self.inner.open_dao()?;
                f(&mut dao)
            }
        }
    }

    /// Runs `f` with one DataAccess pinned to the calling thread: every
    /// store call made inside the scope (on this thread) reuses the same
    /// connection and therefore participates in the same transaction when
    /// nested. Scopes nest; the connection is released when the outermost
    /// scope exits.
    ///
    /// # Errors
    ///
    /// Returns the scope body's error, or the connection checkout error.
    pub fn with_bulk<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let existing = PINNED_DAO.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|(id, dao)| (*id == self.inner.id).then(|| dao.clone()))
        });
        let (dao, previous) = match existing {
            Some(dao) => (dao, None),
            None => {
                let dao = Rc::new(RefCell::new(
                    self.inner.open_dao().map_err(StoreError::Query)?,
                ));
                let previous = PINNED_DAO.with(|slot| {
                    slot.borrow_mut()
                        .replace((self.inner.id, dao.clone()))
                });
                (dao, Some(previous))
            }
        };
        dao.borrow_mut().acquire();
        let _guard = BulkGuard { dao, previous };
        f(self)
    }

    // -- Subject data

    /// Loads the snapshot for a subject, creating its row if absent.
    ///
    /// # Errors
    ///
    /// Surfaces any database error: snapshot loads are essential reads.
    pub fn subject_data(
        &self,
        subject_type: &str,
        identifier: &str,
    ) -> Result<SubjectData, StoreError> {
        Ok(self.with_dao(|dao| {
            let subject = dao.get_or_create_subject_ref(subject_type, identifier)?;
            data_for_ref(dao, subject)
        })?)
    }

    /// Loads a snapshot for every subject in the database, assembled over
    /// one DataAccess.
    ///
    /// # Errors
    ///
    /// Surfaces any database error.
    pub fn all_subject_data(&self) -> Result<Vec<(Arc<SubjectRef>, SubjectData)>, StoreError> {
        Ok(self.with_dao(|dao| {
            let refs = dao.all_subject_refs()?;
            let mut out = Vec::with_capacity(refs.len());
            for subject in refs {
                let data = data_for_ref(dao, subject.clone())?;
                out.push((subject, data));
            }
            Ok(out)
        })?)
    }

    /// Schedules the snapshot's queued mutations on the write worker. The
    /// returned handle resolves with the flushed snapshot once its
    /// transaction commits.
    pub fn set_subject_data(&self, data: SubjectData) -> WriteHandle<SubjectData> {
        let (sender, handle) = WriteHandle::channel();
        let job: WriteJob = Box::new(move |inner| {
            let result = match inner.open_dao() {
                Ok(mut dao) => data
                    .flush(&mut dao)
                    .map(|()| data)
                    .map_err(StoreError::Query),
                Err(err) => Err(StoreError::Query(err)),
            };
            let _ = sender.send(result);
        });
        match self.writer.submit(job) {
            Ok(()) => handle,
            Err(err) => WriteHandle::failed(err),
        }
    }

    /// Imports a snapshot from another backend: captures the view's
    /// semantic content, copies it onto a freshly loaded snapshot for
    /// (type, identifier), and flushes, all on the write worker. Used for
    /// cross-backend migration.
    pub fn import_subject_data(
        &self,
        subject_type: &str,
        identifier: &str,
        source: &dyn SubjectDataView,
    ) -> WriteHandle<SubjectData> {
        let content = SubjectDataContent::capture(source);
        let subject_type = subject_type.to_string();
        let identifier = identifier.to_string();
        let (sender, handle) = WriteHandle::channel();
        let job: WriteJob = Box::new(move |inner| {
            let result = (|| {
                let mut dao = inner.open_dao()?;
                let subject = dao.get_or_create_subject_ref(&subject_type, &identifier)?;
                let data = content.apply_to(data_for_ref(&mut dao, subject)?);
                data.flush(&mut dao)?;
                Ok(data)
            })()
            .map_err(StoreError::Query);
            let _ = sender.send(result);
        });
        match self.writer.submit(job) {
            Ok(()) => handle,
            Err(err) => WriteHandle::failed(err),
        }
    }

    /// Whether a subject row exists. Degrades to `false` on database
    /// errors.
    #[must_use]
    pub fn is_registered(&self, subject_type: &str, identifier: &str) -> bool {
        match self.with_dao(|dao| dao.subject_ref(subject_type, identifier)) {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(%err, "is_registered degraded to false");
                false
            }
        }
    }

    /// Every identifier registered under a type. Degrades to empty on
    /// database errors.
    #[must_use]
    pub fn all_identifiers(&self, subject_type: &str) -> HashSet<String> {
        match self.with_dao(|dao| dao.all_identifiers(subject_type)) {
            Ok(identifiers) => identifiers,
            Err(err) => {
                warn!(%err, "identifier listing degraded to empty");
                HashSet::new()
            }
        }
    }

    /// Every distinct registered subject type. Degrades to empty on
    /// database errors.
    #[must_use]
    pub fn registered_types(&self) -> HashSet<String> {
        match self.with_dao(DataAccess::registered_types) {
            Ok(types) => types,
            Err(err) => {
                warn!(%err, "type listing degraded to empty");
                HashSet::new()
            }
        }
    }

    /// Deletes a subject row (cascading to its segments). Returns whether
    /// a row was removed.
    ///
    /// # Errors
    ///
    /// Surfaces any database error.
    pub fn remove_subject(
        &self,
        subject_type: &str,
        identifier: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.with_dao(|dao| dao.remove_subject(subject_type, identifier))?)
    }

    // -- Context inheritance

    /// Loads the context-inheritance snapshot.
    ///
    /// # Errors
    ///
    /// Surfaces any database error: this is an essential read.
    pub fn context_inheritance(&self) -> Result<ContextInheritance, StoreError> {
        Ok(self.with_dao(DataAccess::context_inheritance)?)
    }

    /// Schedules the inheritance snapshot's queued mutations on the write
    /// worker.
    pub fn set_context_inheritance(
        &self,
        inheritance: ContextInheritance,
    ) -> WriteHandle<ContextInheritance> {
        let (sender, handle) = WriteHandle::channel();
        let job: WriteJob = Box::new(move |inner| {
            let result = match inner.open_dao() {
                Ok(mut dao) => inheritance
                    .flush(&mut dao)
                    .map(|()| inheritance)
                    .map_err(StoreError::Query),
                Err(err) => Err(StoreError::Query(err)),
            };
            let _ = sender.send(result);
        });
        match self.writer.submit(job) {
            Ok(()) => handle,
            Err(err) => WriteHandle::failed(err),
        }
    }

    // -- Rank ladders

    /// Loads a ladder by name.
    ///
    /// # Errors
    ///
    /// Surfaces any database error: this is an essential read.
    pub fn rank_ladder(&self, name: &str) -> Result<RankLadder, StoreError> {
        Ok(self.with_dao(|dao| dao.rank_ladder(name))?)
    }

    /// Whether any entries exist under the ladder name. Degrades to
    /// `false` on database errors.
    #[must_use]
    pub fn has_rank_ladder(&self, name: &str) -> bool {
        match self.with_dao(|dao| dao.has_rank_ladder(name)) {
            Ok(exists) => exists,
            Err(err) => {
                warn!(%err, "rank ladder existence check degraded to false");
                false
            }
        }
    }

    /// Every distinct ladder name. Degrades to empty on database errors.
    #[must_use]
    pub fn all_rank_ladder_names(&self) -> HashSet<String> {
        match self.with_dao(DataAccess::all_rank_ladder_names) {
            Ok(names) => names,
            Err(err) => {
                warn!(%err, "rank ladder listing degraded to empty");
                HashSet::new()
            }
        }
    }

    /// Replaces a ladder on the write worker (`None` deletes it); order is
    /// conveyed by insert ids, so the rows are deleted and re-inserted in
    /// list order. The handle resolves with the ladder as re-read after
    /// the commit.
    pub fn set_rank_ladder(
        &self,
        name: &str,
        ladder: Option<RankLadder>,
    ) -> WriteHandle<RankLadder> {
        let name = name.to_string();
        let (sender, handle) = WriteHandle::channel();
        let job: WriteJob = Box::new(move |inner| {
            let result = (|| {
                let mut dao = inner.open_dao()?;
                dao.set_rank_ladder(&name, ladder.as_ref())?;
                dao.rank_ladder(&name)
            })()
            .map_err(StoreError::Query);
            let _ = sender.send(result);
        });
        match self.writer.submit(job) {
            Ok(()) => handle,
            Err(err) => WriteHandle::failed(err),
        }
    }

    // -- Global parameters

    /// Reads one global parameter.
    ///
    /// # Errors
    ///
    /// Surfaces any database error.
    pub fn global_parameter(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_dao(|dao| dao.global_parameter(key))?)
    }

    /// Writes or deletes one global parameter. `None` deletes the row.
    ///
    /// # Errors
    ///
    /// Surfaces any database error.
    pub fn set_global_parameter(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        Ok(self.with_dao(|dao| dao.set_global_parameter(key, value))?)
    }

    /// Shuts the store down: clears the prefix memo and joins the write
    /// worker after it drains the queued writes.
    pub fn close(self) {
        self.inner.prefixer.clear();
    }
}

/// Restores the thread's pin state when a bulk scope exits, even on
/// unwind. `previous` is `Some` only for the scope that installed the pin;
/// nested scopes reuse it and leave the slot alone.
struct BulkGuard {
    dao: Rc<RefCell<DataAccess>>,
    previous: Option<Option<(u64, Rc<RefCell<DataAccess>>)>>,
}

impl Drop for BulkGuard {
    fn drop(&mut self) {
        let _ = self.dao.borrow_mut().release();
        if let Some(previous) = self.previous.take() {
            PINNED_DAO.with(|slot| {
                *slot.borrow_mut() = previous;
            });
        }
    }
}

fn data_for_ref(dao: &mut DataAccess, subject: Arc<SubjectRef>) -> Result<SubjectData, QueryError> {
    let segments = dao.segments(&subject)?;
    let mut by_context = im::HashMap::new();
    for segment in segments {
        by_context.insert(segment.contexts().clone(), segment);
    }
    Ok(SubjectData::new(subject, by_context))
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('_') {
        prefix.to_string()
    } else {
        format!("{prefix}_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("perm"), "perm_");
        assert_eq!(normalize_prefix("perm_"), "perm_");
    }

    #[test]
    fn unrecognized_url_is_a_connection_error() {
        assert!(matches!(
            DataSource::connect("postgres://localhost/perms"),
            Err(LoadError::Connection(_))
        ));
    }
}
