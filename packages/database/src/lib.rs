#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Embedded `SQLite` object mapper.
//!
//! A table schema is derived once per Rust type from an explicit
//! [`Model`](schema::Model) descriptor and cached for the lifetime of the
//! [`Connection`](connection::Connection). Predicates and orderings are
//! expression trees built with the functions in [`expr`] and compiled to
//! parameterized SQL only when a query is enumerated. Transactions nest via
//! savepoints tracked by an atomic depth counter.
//!
//! The `SQLite` engine itself is an external collaborator consumed through
//! `rusqlite`; this crate owns SQL text generation, value binding, row
//! materialization and transaction bookkeeping, nothing below that.

pub mod compiler;
pub mod connection;
pub mod expr;
pub mod query;
pub mod schema;
pub mod transaction;
pub mod types;

use thiserror::Error;

pub use connection::Connection;
pub use expr::{Expr, col, func, val, vals};
pub use query::QueryBuilder;
pub use rusqlite::OpenFlags;
pub use schema::{CreateFlags, FieldDef, Model, OnConflict, TableDescriptor, TableMapping};
pub use types::{Value, ValueKind};

#[derive(Debug, Error)]
pub enum DbError {
    /// The database file could not be opened.
    #[error("could not open database file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    /// Statement preparation failed.
    #[error("prepare failed: {0}")]
    Prepare(#[source] rusqlite::Error),
    /// The engine returned an error code while stepping a statement.
    #[error("step failed: {0}")]
    Step(#[source] rusqlite::Error),
    /// Any other engine-level failure, surfaced verbatim.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    /// A value could not be mapped to or from an SQL representation.
    #[error("no SQL mapping for {0}")]
    UnsupportedType(String),
    /// The expression compiler met a node or call it cannot translate.
    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),
    /// The model descriptor violates a mapping invariant.
    #[error("invalid schema: {0}")]
    Schema(String),
    /// An invalid savepoint identifier or transaction transition.
    #[error("invalid transaction state: {0}")]
    TransactionState(String),
    /// The connection's resources were already released.
    #[error("connection is closed")]
    Closed,
    /// A query expected to produce a row produced none.
    #[error("no row")]
    NoRow,
}

impl DbError {
    /// The engine result code carried by this error, if any.
    #[must_use]
    pub fn sqlite_error_code(&self) -> Option<rusqlite::ErrorCode> {
        match self {
            Self::Open { source, .. } | Self::Prepare(source) | Self::Step(source) => {
                source.sqlite_error_code()
            }
            Self::Sqlite(source) => source.sqlite_error_code(),
            _ => None,
        }
    }
}

/// A materialized result row: column names paired with their values in
/// select order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

impl Row {
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Value> {
        self.columns
            .iter()
            .find(|c| c.0 == column)
            .map(|c| c.1.clone())
    }

    /// Reads a column and converts it to a native type. A missing column
    /// reads as SQL NULL.
    ///
    /// # Errors
    ///
    /// * If the value cannot be converted to `T`
    pub fn try_get<T>(&self, column: &str) -> Result<T, DbError>
    where
        T: TryFrom<Value, Error = DbError>,
    {
        T::try_from(self.get(column).unwrap_or(Value::Null))
    }
}
