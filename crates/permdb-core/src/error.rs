//! Error types for the storage engine.

use thiserror::Error;

/// Errors that are fatal for store initialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    /// The database could not be reached or the URL was not usable.
    #[error("could not connect to the database: {0}")]
    Connection(String),

    /// The connected database reported a product this engine has no
    /// dialect adapter for.
    #[error("database implementation {0} is not supported")]
    UnsupportedDialect(String),

    /// The initial schema could not be deployed.
    #[error("error deploying initial schema: {0}")]
    Deploy(#[source] QueryError),

    /// The background write worker could not be started.
    #[error("could not start write worker: {0}")]
    Worker(String),
}

/// Errors surfaced by individual database operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// Database error from `SQLite`.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Database error from MySQL.
    #[error("mysql error: {0}")]
    Mysql(#[from] mysql::Error),

    /// A subject or segment reference was used before its row id was
    /// allocated. This is a programmer error on the write path.
    #[error("unallocated reference was used")]
    UnallocatedReference,

    /// An insert that must produce a generated key did not.
    #[error("no generated key returned for insert into {table}")]
    MissingGeneratedKey {
        /// The table the insert targeted.
        table: &'static str,
    },

    /// A result column held a value of an unexpected shape.
    #[error("unexpected value in result column {column}: expected {expected}")]
    Decode {
        /// Zero-based column index.
        column: usize,
        /// The value shape the caller asked for.
        expected: &'static str,
    },
}

/// Top-level store error: initialization or query failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Store initialization failed.
    #[error("store initialization failed: {0}")]
    Load(#[from] LoadError),

    /// A database operation failed.
    #[error("query failed: {0}")]
    Query(#[from] QueryError),

    /// The write worker was shut down before the write completed.
    #[error("write executor is shut down")]
    Shutdown,
}
