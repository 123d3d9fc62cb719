//! MySQL driver.
//!
//! Connections are checked out of the shared `mysql::Pool` held by the
//! store's data source. Generated keys and affected-row counts are read
//! back through `LAST_INSERT_ID()` / `ROW_COUNT()` on the same connection.

// MySQL reports unsigned counters; this schema never exceeds i64.
#![allow(clippy::cast_possible_wrap)]

use mysql::prelude::Queryable;
use mysql::{Params, PooledConn, Row, Value};

use super::driver::{SqlConnection, SqlRow, SqlValue};
use crate::error::QueryError;

/// A [`SqlConnection`] over a pooled `mysql` connection.
pub struct MysqlConnection {
    conn: PooledConn,
}

impl MysqlConnection {
    /// Wraps a connection checked out of the pool.
    #[must_use]
    pub fn new(conn: PooledConn) -> Self {
        Self { conn }
    }

    fn bind(params: &[SqlValue]) -> Params {
        if params.is_empty() {
            return Params::Empty;
        }
        Params::Positional(
            params
                .iter()
                .map(|param| match param {
                    SqlValue::Null => Value::NULL,
                    SqlValue::Int(value) => Value::Int(*value),
                    SqlValue::Text(value) => Value::Bytes(value.clone().into_bytes()),
                })
                .collect(),
        )
    }

    fn decode(row: &Row) -> Result<SqlRow, QueryError> {
        let mut values = Vec::with_capacity(row.len());
        for column in 0..row.len() {
            let value = row.as_ref(column).ok_or(QueryError::Decode {
                column,
                expected: "a value",
            })?;
            values.push(match value {
                Value::NULL => SqlValue::Null,
                Value::Int(value) => SqlValue::Int(*value),
                Value::UInt(value) => SqlValue::Int(*value as i64),
                Value::Bytes(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
                _ => {
                    return Err(QueryError::Decode {
                        column,
                        expected: "an integer, text, or NULL",
                    })
                }
            });
        }
        Ok(SqlRow::new(values))
    }
}

impl SqlConnection for MysqlConnection {
    fn product_name(&self) -> &'static str {
        "mysql"
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, QueryError> {
        self.conn.exec_drop(sql, Self::bind(params))?;
        let affected: Option<i64> = self.conn.query_first("SELECT ROW_COUNT()")?;
        Ok(affected.unwrap_or(0).max(0) as u64)
    }

    fn insert_returning_id(&mut self, sql: &str, params: &[SqlValue]) -> Result<i64, QueryError> {
        self.conn.exec_drop(sql, Self::bind(params))?;
        let id: Option<i64> = self.conn.query_first("SELECT LAST_INSERT_ID()")?;
        Ok(id.unwrap_or(0))
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, QueryError> {
        let rows: Vec<Row> = self.conn.exec(sql, Self::bind(params))?;
        rows.iter().map(Self::decode).collect()
    }

    fn execute_script(&mut self, statements: &[String]) -> Result<(), QueryError> {
        for statement in statements {
            self.conn.query_drop(statement)?;
        }
        Ok(())
    }

    fn has_table(&mut self, table: &str) -> Result<bool, QueryError> {
        let rows = self.query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
            &[SqlValue::text(table)],
        )?;
        Ok(!rows.is_empty())
    }

    fn begin(&mut self) -> Result<(), QueryError> {
        self.conn.query_drop("START TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), QueryError> {
        self.conn.query_drop("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), QueryError> {
        self.conn.query_drop("ROLLBACK")?;
        Ok(())
    }
}
