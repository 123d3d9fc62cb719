//! # permdb-core
//!
//! SQL-backed persistence engine for hierarchical permissions data.
//!
//! The engine maps access-control entities (subjects, context-scoped
//! segments of permissions/options/parents, rank ladders, and context
//! inheritance) onto a normalized relational schema, speaking either
//! embedded SQLite or MySQL behind one contract.
//!
//! Three layers:
//!
//! - **Snapshots** ([`SubjectData`], [`ContextInheritance`]): immutable
//!   views of stored state. Every mutation returns a new snapshot and
//!   queues the database work it implies; flushing drains the queue inside
//!   one transaction.
//! - **Data access** ([`dao::DataAccess`]): the dialect-abstract SQL
//!   facade: schema bootstrap, table-prefix rewriting, nested
//!   transactions, and lazy id allocation.
//! - **Store** ([`SqlStore`]): connection lifetime, dialect selection,
//!   snapshot reads, asynchronous writes on a bounded worker, and bulk
//!   scopes that pin one connection to the calling thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use permdb_core::{context_set, SqlStore, StoreConfig};
//!
//! # fn example() -> Result<(), permdb_core::StoreError> {
//! let store = SqlStore::open(&StoreConfig::new("sqlite:perms.db"))?;
//!
//! let nether = context_set([("world", "nether")]);
//! let data = store.subject_data("user", "alice")?;
//! let data = data.set_permission(&nether, "build", 1);
//! store.set_subject_data(data).wait()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod dao;
pub mod data;
pub mod error;
pub mod inheritance;
pub mod ladder;
pub mod segment;
pub mod store;
pub mod subject;

pub use config::StoreConfig;
pub use context::{context_set, Context, ContextSet};
pub use data::{ParentRef, SubjectData, SubjectDataView};
pub use error::{LoadError, QueryError, StoreError};
pub use inheritance::ContextInheritance;
pub use ladder::RankLadder;
pub use segment::Segment;
pub use store::{SqlStore, WriteHandle};
pub use subject::SubjectRef;
