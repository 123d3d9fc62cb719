//! The narrow connection contract the data-access layer is written against.
//!
//! The schema only ever stores integers, strings, and NULLs, so the driver
//! surface is three value shapes, positional parameters, and materialized
//! result rows. Each engine implements [`SqlConnection`] over its own
//! client library.

use crate::error::QueryError;

/// A parameter or result value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Any integer column.
    Int(i64),
    /// Any text column.
    Text(String),
}

impl SqlValue {
    /// Builds a text value.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Builds an integer value.
    #[must_use]
    pub fn int(value: impl Into<i64>) -> Self {
        Self::Int(value.into())
    }

    /// Builds an integer value or NULL.
    #[must_use]
    pub fn opt_int(value: Option<impl Into<i64>>) -> Self {
        value.map_or(Self::Null, |v| Self::Int(v.into()))
    }
}

/// One materialized result row.
#[derive(Debug, Clone)]
pub struct SqlRow(Vec<SqlValue>);

impl SqlRow {
    /// Wraps decoded column values.
    #[must_use]
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self(values)
    }

    fn value(&self, column: usize) -> Result<&SqlValue, QueryError> {
        self.0.get(column).ok_or(QueryError::Decode {
            column,
            expected: "a value",
        })
    }

    /// Reads a non-NULL integer column.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Decode`] for NULL or non-integer values.
    pub fn int(&self, column: usize) -> Result<i64, QueryError> {
        match self.value(column)? {
            SqlValue::Int(value) => Ok(*value),
            _ => Err(QueryError::Decode {
                column,
                expected: "an integer",
            }),
        }
    }

    /// Reads a nullable integer column.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Decode`] for non-integer, non-NULL values.
    pub fn opt_int(&self, column: usize) -> Result<Option<i64>, QueryError> {
        match self.value(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Int(value) => Ok(Some(*value)),
            SqlValue::Text(_) => Err(QueryError::Decode {
                column,
                expected: "an integer or NULL",
            }),
        }
    }

    /// Reads a non-NULL text column.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Decode`] for NULL or non-text values.
    pub fn text(&self, column: usize) -> Result<&str, QueryError> {
        match self.value(column)? {
            SqlValue::Text(value) => Ok(value),
            _ => Err(QueryError::Decode {
                column,
                expected: "text",
            }),
        }
    }
}

/// One live database connection.
///
/// Implementations are not safe to share across threads; the data-access
/// layer owns one connection per instance and the store arbitrates reuse.
pub trait SqlConnection: Send {
    /// The engine's product name, lowercased (`sqlite`, `mysql`). Probed
    /// once at store initialization to select the dialect adapter.
    fn product_name(&self) -> &'static str;

    /// Runs a statement, returning the affected row count.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, QueryError>;

    /// Runs an insert, returning the generated key.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    fn insert_returning_id(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, QueryError>;

    /// Runs a query, materializing every result row.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the failing statement.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, QueryError>;

    /// Runs a list of parameterless statements as a batch.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for the first failing statement.
    fn execute_script(&mut self, statements: &[String]) -> Result<(), QueryError>;

    /// Whether a table exists, per the engine's catalog metadata.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the catalog cannot be read.
    fn has_table(&mut self, table: &str) -> Result<bool, QueryError>;

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the transaction cannot start.
    fn begin(&mut self) -> Result<(), QueryError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the commit fails.
    fn commit(&mut self) -> Result<(), QueryError>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if the rollback fails.
    fn rollback(&mut self) -> Result<(), QueryError>;
}
