//! `SQLite` driver.
//!
//! The embedded engine: databases are plain files opened per checkout, so
//! the "pool" for this driver is simply open-on-demand.

// SQLite reports row counts as usize and row ids as i64; both fit the
// driver contract without loss for this schema.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::path::Path;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};

use super::driver::{SqlConnection, SqlRow, SqlValue};
use crate::error::QueryError;

/// Connection pragmas applied at open. WAL keeps readers unblocked during
/// writes; foreign keys must be switched on per connection for the
/// ON DELETE CASCADE chains to fire.
const CONNECTION_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
";

/// A [`SqlConnection`] over `rusqlite`.
pub struct SqliteConnection {
    conn: Connection,
}

impl SqliteConnection {
    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or configured.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::configure(conn)
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn open_in_memory() -> Result<Self, QueryError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, QueryError> {
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        Ok(Self { conn })
    }

    fn bind(params: &[SqlValue]) -> Vec<Value> {
        params
            .iter()
            .map(|param| match param {
                SqlValue::Null => Value::Null,
                SqlValue::Int(value) => Value::Integer(*value),
                SqlValue::Text(value) => Value::Text(value.clone()),
            })
            .collect()
    }
}

impl SqlConnection for SqliteConnection {
    fn product_name(&self) -> &'static str {
        "sqlite"
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, QueryError> {
        Ok(self.conn.execute(sql, params_from_iter(Self::bind(params)))? as u64)
    }

    fn insert_returning_id(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, QueryError> {
        self.conn.execute(sql, params_from_iter(Self::bind(params)))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, QueryError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(Self::bind(params)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for column in 0..columns {
                values.push(match row.get_ref(column)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(value) => SqlValue::Int(value),
                    ValueRef::Real(value) => SqlValue::Int(value as i64),
                    ValueRef::Text(value) | ValueRef::Blob(value) => {
                        SqlValue::Text(String::from_utf8_lossy(value).into_owned())
                    }
                });
            }
            out.push(SqlRow::new(values));
        }
        Ok(out)
    }

    fn execute_script(&mut self, statements: &[String]) -> Result<(), QueryError> {
        for statement in statements {
            self.conn.execute_batch(statement)?;
        }
        Ok(())
    }

    fn has_table(&mut self, table: &str) -> Result<bool, QueryError> {
        let rows = self.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::text(table)],
        )?;
        Ok(!rows.is_empty())
    }

    fn begin(&mut self) -> Result<(), QueryError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), QueryError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), QueryError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
