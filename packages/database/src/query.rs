//! Fluent typed queries over one table.
//!
//! A builder accumulates predicate, ordering, projection and paging
//! fragments; nothing touches the engine until the query is enumerated with
//! [`QueryBuilder::to_vec`], [`QueryBuilder::first`],
//! [`QueryBuilder::count`], [`QueryBuilder::rows`] or
//! [`QueryBuilder::for_each`], at which point the accumulated expression
//! graph is compiled to SQL text plus a positional argument list.

use std::marker::PhantomData;
use std::rc::Rc;

use crate::compiler::{Ordering, build_select};
use crate::connection::Connection;
use crate::expr::Expr;
use crate::schema::{Model, TableMapping};
use crate::types::Value;
use crate::{DbError, Row};

pub struct QueryBuilder<'conn, T: Model> {
    conn: &'conn Connection,
    mapping: Rc<TableMapping>,
    filters: Vec<Expr>,
    orderings: Vec<Ordering>,
    projection: Option<Vec<String>>,
    limit: Option<u32>,
    offset: Option<u32>,
    joined: bool,
    _marker: PhantomData<T>,
}

impl<'conn, T: Model + 'static> QueryBuilder<'conn, T> {
    pub(crate) fn new(conn: &'conn Connection, mapping: Rc<TableMapping>) -> Self {
        Self {
            conn,
            mapping,
            filters: Vec::new(),
            orderings: Vec::new(),
            projection: None,
            limit: None,
            offset: None,
            joined: false,
            _marker: PhantomData,
        }
    }

    /// Adds a predicate; multiple predicates accumulate under logical
    /// `and`.
    #[must_use]
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filters.push(predicate);
        self
    }

    /// Orders ascending by a field.
    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.orderings.push(Ordering {
            field: field.into(),
            ascending: true,
        });
        self
    }

    /// Orders descending by a field.
    #[must_use]
    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.orderings.push(Ordering {
            field: field.into(),
            ascending: false,
        });
        self
    }

    /// Limits the number of returned rows.
    #[must_use]
    pub const fn take(mut self, count: u32) -> Self {
        self.limit = Some(count);
        self
    }

    /// Skips the first `count` rows.
    #[must_use]
    pub const fn skip(mut self, count: u32) -> Self {
        self.offset = Some(count);
        self
    }

    /// Projects onto a subset of fields; enumerate with [`Self::rows`].
    #[must_use]
    pub fn columns(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(ToString::to_string).collect());
        self
    }

    /// Joining two query builders is not supported; the marker makes every
    /// later enumeration fail with [`DbError::UnsupportedExpression`].
    #[must_use]
    pub fn join<U: Model>(mut self, _inner: QueryBuilder<'conn, U>) -> Self {
        self.joined = true;
        self
    }

    fn generate(&self, selection: &str) -> Result<(String, Vec<Value>), DbError> {
        if self.joined {
            return Err(DbError::UnsupportedExpression(
                "joins are not supported".to_string(),
            ));
        }
        let mut args = Vec::new();
        let sql = build_select(
            &self.mapping,
            selection,
            &self.filters,
            &self.orderings,
            self.limit,
            self.offset,
            &mut args,
        )?;
        Ok((sql, args))
    }

    fn projection_list(&self) -> Result<String, DbError> {
        match self.projection.as_deref() {
            None | Some([]) => Ok("*".to_string()),
            Some(fields) => {
                let columns = fields
                    .iter()
                    .map(|field| {
                        self.mapping
                            .column_for_field(field)
                            .map(|c| format!("\"{}\"", c.name))
                            .ok_or_else(|| {
                                DbError::UnsupportedExpression(format!(
                                    "no mapped column for projected field \"{field}\" \
                                     on table \"{}\"",
                                    self.mapping.table_name
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(columns.join(", "))
            }
        }
    }

    /// Compiles and runs the query, materializing every row into `T`.
    ///
    /// # Errors
    ///
    /// * On compilation or engine failure
    pub fn to_vec(self) -> Result<Vec<T>, DbError> {
        let (sql, args) = self.generate("*")?;
        self.conn.query(&sql, &args)
    }

    /// Compiles and runs the query with a limit of one, returning the
    /// first row if any.
    ///
    /// # Errors
    ///
    /// * On compilation or engine failure
    pub fn first(self) -> Result<Option<T>, DbError> {
        let this = if self.limit.is_none() {
            self.take(1)
        } else {
            self
        };
        Ok(this.to_vec()?.into_iter().next())
    }

    /// Compiles and runs `select count(*)` over the same predicate.
    ///
    /// # Errors
    ///
    /// * On compilation or engine failure
    pub fn count(self) -> Result<i64, DbError> {
        let (sql, args) = self.generate("count(*)")?;
        Ok(self.conn.query_scalar(&sql, &args)?.unwrap_or(0))
    }

    /// Compiles and runs the query, returning untyped rows. Honors the
    /// projection set with [`Self::columns`].
    ///
    /// # Errors
    ///
    /// * On compilation or engine failure
    pub fn rows(self) -> Result<Vec<Row>, DbError> {
        let selection = self.projection_list()?;
        let (sql, args) = self.generate(&selection)?;
        self.conn.query_rows(&sql, &args)
    }

    /// Streams rows one at a time through `visit`; returning `false` stops
    /// the enumeration early and still finalizes the statement.
    ///
    /// # Errors
    ///
    /// * On compilation or engine failure
    pub fn for_each(self, visit: impl FnMut(T) -> bool) -> Result<(), DbError> {
        let (sql, args) = self.generate("*")?;
        self.conn.query_deferred(&sql, &args, visit)
    }
}
