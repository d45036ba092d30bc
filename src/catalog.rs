//! Injected catalog access.
//!
//! The registry persists nothing itself: every read and write goes through
//! the host system's internal SQL surface, injected as [`SqlExecutor`].
//! Tests supply the in-memory implementation from [`crate::testing`].

use std::time::Duration;

use thiserror::Error;

use crate::error::{Error, Transience};
use crate::time::WallTime;

/// A single SQL value crossing the executor boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Duration(Duration),
    Timestamp(WallTime),
    IntArray(Vec<i64>),
}

impl SqlValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SqlValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            SqlValue::Duration(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<WallTime> {
        match self {
            SqlValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }
}

static NULL: SqlValue = SqlValue::Null;

/// One result row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    /// The value at `idx`, or SQL NULL when the projection is narrower.
    pub fn col(&self, idx: usize) -> &SqlValue {
        self.0.get(idx).unwrap_or(&NULL)
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CatalogError {
    /// The catalog could not run the statement.
    #[error("catalog statement {op} failed: {message}")]
    Unavailable { op: &'static str, message: String },

    /// A statement expected to return a row returned none.
    #[error("catalog statement {op} returned no rows")]
    EmptyResult { op: &'static str },

    /// A returned row did not have the expected shape.
    #[error("catalog statement {op} returned a malformed row")]
    MalformedRow { op: &'static str },

    /// The node is shutting down; callers stay quiet about this one.
    #[error("catalog is shutting down")]
    ShuttingDown,
}

impl CatalogError {
    pub fn transience(&self) -> Transience {
        match self {
            CatalogError::Unavailable { .. } | CatalogError::ShuttingDown => {
                Transience::Retryable
            }
            CatalogError::EmptyResult { .. } | CatalogError::MalformedRow { .. } => {
                Transience::Permanent
            }
        }
    }
}

/// Statement execution inside one open catalog transaction.
pub trait SqlTxn {
    fn query(
        &mut self,
        op: &'static str,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Vec<SqlRow>, CatalogError>;

    /// Like `query`, for statements whose row count is all that matters.
    fn exec(
        &mut self,
        op: &'static str,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<u64, CatalogError>;
}

/// Executor for the host system's internal SQL surface.
///
/// Implementations may block on I/O; the registry never calls them while
/// holding its index mutex.
pub trait SqlExecutor: Send + Sync {
    /// Runs one statement outside any explicit transaction.
    fn query(
        &self,
        op: &'static str,
        stmt: &str,
        args: &[SqlValue],
    ) -> Result<Vec<SqlRow>, CatalogError>;

    /// Runs `body` inside a single transaction; commits iff it returns Ok.
    fn txn(
        &self,
        op: &'static str,
        body: &mut dyn FnMut(&mut dyn SqlTxn) -> Result<(), Error>,
    ) -> Result<(), Error>;
}

/// The single row of a result, or `EmptyResult`.
pub(crate) fn single_row(
    op: &'static str,
    rows: Vec<SqlRow>,
) -> Result<SqlRow, CatalogError> {
    rows.into_iter().next().ok_or(CatalogError::EmptyResult { op })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn col_beyond_projection_reads_null() {
        let row = SqlRow(vec![SqlValue::Int(7)]);
        assert_eq!(row.col(0).as_int(), Some(7));
        assert_eq!(*row.col(1), SqlValue::Null);
        assert_eq!(row.col(1).as_int(), None);
    }

    #[test]
    fn single_row_takes_the_first() {
        let rows = vec![SqlRow(vec![SqlValue::Int(1)]), SqlRow(vec![SqlValue::Int(2)])];
        assert_eq!(single_row("op", rows).unwrap().col(0).as_int(), Some(1));
        assert!(matches!(
            single_row("op", Vec::new()),
            Err(CatalogError::EmptyResult { op: "op" })
        ));
    }
}
