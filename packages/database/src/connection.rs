//! The connection façade: CRUD, table creation and migration, raw SQL and
//! transactions, composed over one `rusqlite` connection.
//!
//! Statements follow scoped-acquisition discipline: prepared, bound,
//! stepped and finalized (dropped) on every exit path. Generated statements
//! go through the driver's prepared-statement cache so repeated inserts
//! reuse their compiled form; the cache is flushed explicitly on close.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use rusqlite::OpenFlags;
use uuid::Uuid;

use crate::query::QueryBuilder;
use crate::schema::{CreateFlags, Model, OnConflict, TableMapping};
use crate::transaction::{self, TransactionState};
use crate::types::{self, Value};
use crate::{DbError, Row};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(100);

/// An open database connection owning its table mappings and transaction
/// state. Intended for one logical workflow at a time; the transaction
/// depth counter is the only state hardened against concurrent use.
#[derive(Debug)]
pub struct Connection {
    conn: Option<rusqlite::Connection>,
    datetime_as_integer: bool,
    mappings: RefCell<HashMap<TypeId, Rc<TableMapping>>>,
    state: TransactionState,
}

impl Connection {
    /// Opens (creating if necessary) the database file at `path`, storing
    /// datetimes as text.
    ///
    /// # Errors
    ///
    /// * [`DbError::Open`] if the file cannot be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            false,
        )
    }

    /// Opens with explicit engine flags and the connection-wide switch for
    /// storing datetimes as integer timestamps.
    ///
    /// # Errors
    ///
    /// * [`DbError::Open`] if the file cannot be opened
    pub fn open_with_flags(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        datetime_as_integer: bool,
    ) -> Result<Self, DbError> {
        let conn =
            rusqlite::Connection::open_with_flags(&path, flags).map_err(|source| DbError::Open {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        Self::from_rusqlite(conn, datetime_as_integer)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// * [`DbError::Open`] if the engine refuses the connection
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|source| DbError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::from_rusqlite(conn, false)
    }

    fn from_rusqlite(
        conn: rusqlite::Connection,
        datetime_as_integer: bool,
    ) -> Result<Self, DbError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Some(conn),
            datetime_as_integer,
            mappings: RefCell::new(HashMap::new()),
            state: TransactionState::default(),
        })
    }

    /// Sets the engine's busy handler to sleep-and-retry up to `timeout`.
    ///
    /// # Errors
    ///
    /// * If the connection is closed or the engine rejects the setting
    pub fn busy_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        self.handle()?.busy_timeout(timeout).map_err(DbError::from)
    }

    /// Whether datetimes are stored as integer timestamps on this
    /// connection.
    #[must_use]
    pub const fn datetime_as_integer(&self) -> bool {
        self.datetime_as_integer
    }

    /// Releases the connection's resources, flushing the prepared-statement
    /// cache first. Closing an already-closed connection is a no-op.
    ///
    /// # Errors
    ///
    /// * If the engine reports a failure while closing
    pub fn close(&mut self) -> Result<(), DbError> {
        if let Some(conn) = self.conn.take() {
            conn.flush_prepared_statement_cache();
            conn.close().map_err(|(_, source)| DbError::from(source))?;
        }
        Ok(())
    }

    fn handle(&self) -> Result<&rusqlite::Connection, DbError> {
        self.conn.as_ref().ok_or(DbError::Closed)
    }

    /// The mapping for `T`, derived on first use (with `flags`) and cached
    /// for the connection's lifetime. Later calls reuse the first
    /// derivation regardless of flags.
    ///
    /// # Errors
    ///
    /// * [`DbError::Schema`] if the descriptor violates a mapping invariant
    pub fn mapping_with<T: Model + 'static>(
        &self,
        flags: CreateFlags,
    ) -> Result<Rc<TableMapping>, DbError> {
        let mut mappings = self.mappings.borrow_mut();
        if let Some(mapping) = mappings.get(&TypeId::of::<T>()) {
            return Ok(Rc::clone(mapping));
        }
        let mapping = Rc::new(TableMapping::derive(&T::table(), flags)?);
        mappings.insert(TypeId::of::<T>(), Rc::clone(&mapping));
        Ok(mapping)
    }

    /// The cached mapping for `T`, derived with no convention flags when
    /// absent.
    ///
    /// # Errors
    ///
    /// * [`DbError::Schema`] if the descriptor violates a mapping invariant
    pub fn mapping<T: Model + 'static>(&self) -> Result<Rc<TableMapping>, DbError> {
        self.mapping_with::<T>(CreateFlags::NONE)
    }

    // ===== raw SQL =====

    /// Executes a statement with positional `?` parameters, returning the
    /// affected-row count.
    ///
    /// # Errors
    ///
    /// * [`DbError::Prepare`] / [`DbError::Step`] on engine failure
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize, DbError> {
        log::trace!("execute: {sql} params: {params:?}");
        let conn = self.handle()?;
        let mut statement = conn.prepare(sql).map_err(DbError::Prepare)?;
        types::bind_values(&mut statement, params, self.datetime_as_integer)?;
        statement.raw_execute().map_err(DbError::Step)
    }

    /// Runs a query and materializes every row.
    ///
    /// # Errors
    ///
    /// * [`DbError::Prepare`] / [`DbError::Step`] on engine failure
    pub fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        log::trace!("query_rows: {sql} params: {params:?}");
        let conn = self.handle()?;
        let mut statement = conn.prepare(sql).map_err(DbError::Prepare)?;
        let column_names = column_names(&statement);
        types::bind_values(&mut statement, params, self.datetime_as_integer)?;

        let mut rows = statement.raw_query();
        let mut results = Vec::new();
        while let Some(row) = rows.next().map_err(DbError::Step)? {
            results.push(row_from(&column_names, row)?);
        }
        Ok(results)
    }

    /// Runs a query and materializes each row into `T`.
    ///
    /// # Errors
    ///
    /// * On engine failure or if a row cannot be converted
    pub fn query<T: Model + 'static>(&self, sql: &str, params: &[Value]) -> Result<Vec<T>, DbError> {
        self.query_rows(sql, params)?
            .iter()
            .map(T::from_row)
            .collect()
    }

    /// Runs a query and converts the first column of the first row, if any.
    ///
    /// # Errors
    ///
    /// * On engine failure or if the value cannot be converted
    pub fn query_scalar<T>(&self, sql: &str, params: &[Value]) -> Result<Option<T>, DbError>
    where
        T: TryFrom<Value, Error = DbError>,
    {
        log::trace!("query_scalar: {sql} params: {params:?}");
        let conn = self.handle()?;
        let mut statement = conn.prepare(sql).map_err(DbError::Prepare)?;
        types::bind_values(&mut statement, params, self.datetime_as_integer)?;

        let mut rows = statement.raw_query();
        match rows.next().map_err(DbError::Step)? {
            Some(row) => {
                let value: rusqlite::types::Value = row.get(0)?;
                T::try_from(Value::from(value)).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Streams rows one at a time through `visit` without materializing the
    /// result set. The statement stays open across the iteration and is
    /// finalized on every exit path; returning `false` from `visit` stops
    /// early and still triggers cleanup.
    ///
    /// # Errors
    ///
    /// * On engine failure or if a row cannot be converted
    pub fn query_deferred<T: Model>(
        &self,
        sql: &str,
        params: &[Value],
        mut visit: impl FnMut(T) -> bool,
    ) -> Result<(), DbError> {
        log::trace!("query_deferred: {sql} params: {params:?}");
        let conn = self.handle()?;
        let mut statement = conn.prepare(sql).map_err(DbError::Prepare)?;
        let column_names = column_names(&statement);
        types::bind_values(&mut statement, params, self.datetime_as_integer)?;

        let mut rows = statement.raw_query();
        while let Some(row) = rows.next().map_err(DbError::Step)? {
            let item = T::from_row(&row_from(&column_names, row)?)?;
            if !visit(item) {
                break;
            }
        }
        Ok(())
    }

    /// The rowid of the most recent successful insert.
    ///
    /// # Errors
    ///
    /// * [`DbError::Closed`] if the connection was closed
    pub fn last_insert_rowid(&self) -> Result<i64, DbError> {
        Ok(self.handle()?.last_insert_rowid())
    }

    // ===== schema =====

    /// Whether a table of this name exists in the live schema.
    ///
    /// # Errors
    ///
    /// * On engine failure
    pub fn table_exists(&self, table_name: &str) -> Result<bool, DbError> {
        let conn = self.handle()?;
        let mut statement = conn
            .prepare_cached("select name from sqlite_master where type='table' and name=?")
            .map_err(DbError::Prepare)?;
        statement.exists([table_name]).map_err(DbError::from)
    }

    /// The live column names of a table, in schema order.
    ///
    /// # Errors
    ///
    /// * On engine failure
    pub fn table_info(&self, table_name: &str) -> Result<Vec<String>, DbError> {
        let conn = self.handle()?;
        let mut statement = conn
            .prepare(&format!("pragma table_info(\"{table_name}\")"))
            .map_err(DbError::Prepare)?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(DbError::Step)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DbError::Step)?;
        Ok(names)
    }

    /// Creates the table for `T` if absent, and otherwise migrates it by
    /// adding any mapped columns missing from the live schema (additive
    /// only; nothing is dropped or altered). Declared and implicit indexes
    /// are created idempotently afterwards. Returns the number of
    /// table-creating or column-adding statements issued.
    ///
    /// # Errors
    ///
    /// * On engine failure or a schema invariant violation
    pub fn create_table<T: Model + 'static>(&self) -> Result<usize, DbError> {
        self.create_table_with::<T>(CreateFlags::NONE)
    }

    /// `create_table` with naming-convention flags applied to the first
    /// derivation of `T`'s mapping.
    ///
    /// # Errors
    ///
    /// * On engine failure or a schema invariant violation
    pub fn create_table_with<T: Model + 'static>(
        &self,
        flags: CreateFlags,
    ) -> Result<usize, DbError> {
        let mapping = self.mapping_with::<T>(flags)?;
        let mut changes = 0;

        // The engine reports zero affected rows for CREATE TABLE IF NOT
        // EXISTS either way, so the migrate-or-create decision comes from
        // the schema itself.
        if self.table_exists(&mapping.table_name)? {
            changes += self.migrate_table(&mapping)?;
        } else {
            self.execute(&mapping.create_table_sql(self.datetime_as_integer), &[])?;
            changes += 1;
        }

        for statement in mapping.index_statements()? {
            self.execute(&statement, &[])?;
        }

        Ok(changes)
    }

    fn migrate_table(&self, mapping: &TableMapping) -> Result<usize, DbError> {
        let existing = self.table_info(&mapping.table_name)?;
        let mut added = 0;

        for column in &mapping.columns {
            let present = existing
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&column.name));
            if !present {
                let sql = mapping.add_column_sql(column, self.datetime_as_integer);
                log::debug!(
                    "migrating \"{}\": adding column \"{}\"",
                    mapping.table_name,
                    column.name
                );
                self.execute(&sql, &[])?;
                added += 1;
            }
        }

        Ok(added)
    }

    /// Drops the table for `T` if it exists. Non-recoverable.
    ///
    /// # Errors
    ///
    /// * On engine failure
    pub fn drop_table<T: Model + 'static>(&self) -> Result<usize, DbError> {
        let mapping = self.mapping::<T>()?;
        self.execute(
            &format!("drop table if exists \"{}\"", mapping.table_name),
            &[],
        )
    }

    // ===== CRUD =====

    /// Inserts `record`, assigning its generated primary key (auto-increment
    /// rowid or fresh UUID) back onto it. Returns the affected-row count.
    ///
    /// # Errors
    ///
    /// * On engine failure or a mapping violation
    pub fn insert<T: Model + 'static>(&self, record: &mut T) -> Result<usize, DbError> {
        self.insert_with(record, OnConflict::Abort)
    }

    /// Inserts `record`, replacing any existing row that collides on a
    /// unique constraint.
    ///
    /// # Errors
    ///
    /// * On engine failure or a mapping violation
    pub fn insert_or_replace<T: Model + 'static>(&self, record: &mut T) -> Result<usize, DbError> {
        self.insert_with(record, OnConflict::Replace)
    }

    fn insert_with<T: Model + 'static>(
        &self,
        record: &mut T,
        on_conflict: OnConflict,
    ) -> Result<usize, DbError> {
        let mapping = self.mapping::<T>()?;
        let mut values = record.to_values();
        if values.len() != mapping.columns.len() {
            return Err(DbError::Schema(format!(
                "\"{}\" produced {} values for {} mapped columns",
                mapping.table_name,
                values.len(),
                mapping.columns.len()
            )));
        }

        if let Some(key_index) = mapping.key_index()
            && mapping.columns[key_index].auto_uuid
            && is_nil_key(&values[key_index])
        {
            let id = Uuid::new_v4();
            record.put_generated_key(Value::Uuid(id));
            values[key_index] = Value::Uuid(id);
        }

        let bound: Vec<Value> = mapping
            .columns
            .iter()
            .zip(values)
            .filter(|(column, _)| on_conflict == OnConflict::Replace || !column.auto_increment)
            .map(|(_, value)| value)
            .collect();

        let sql = mapping.insert_sql(on_conflict);
        log::trace!("insert: {sql} params: {bound:?}");

        let conn = self.handle()?;
        let mut statement = conn.prepare_cached(&sql).map_err(DbError::Prepare)?;
        types::bind_values(&mut statement, &bound, self.datetime_as_integer)?;
        let count = statement.raw_execute().map_err(DbError::Step)?;
        drop(statement);

        if mapping.key().is_some_and(|key| key.auto_increment) {
            record.put_generated_key(Value::Integer(conn.last_insert_rowid()));
        }

        Ok(count)
    }

    /// Inserts every record inside one savepoint transaction.
    ///
    /// # Errors
    ///
    /// * On any failed insert; everything already inserted is rolled back
    pub fn insert_all<T: Model + 'static>(&self, records: &mut [T]) -> Result<usize, DbError> {
        self.run_in_transaction(|db| {
            let mut count = 0;
            for record in records.iter_mut() {
                count += db.insert(record)?;
            }
            Ok(count)
        })
    }

    /// Updates every column of `record`'s row except the primary key,
    /// addressed by the primary key.
    ///
    /// # Errors
    ///
    /// * [`DbError::Schema`] if `T` has no primary key
    pub fn update<T: Model + 'static>(&self, record: &T) -> Result<usize, DbError> {
        let mapping = self.mapping::<T>()?;
        let Some(key_index) = mapping.key_index() else {
            return Err(DbError::Schema(format!(
                "cannot update \"{}\": it has no primary key",
                mapping.table_name
            )));
        };

        let values = record.to_values();
        if values.len() != mapping.columns.len() {
            return Err(DbError::Schema(format!(
                "\"{}\" produced {} values for {} mapped columns",
                mapping.table_name,
                values.len(),
                mapping.columns.len()
            )));
        }

        let mut sets = Vec::new();
        let mut params = Vec::new();
        let mut key_value = Value::Null;
        for (i, (column, value)) in mapping.columns.iter().zip(values).enumerate() {
            if i == key_index {
                key_value = value;
            } else {
                sets.push(format!("\"{}\" = ?", column.name));
                params.push(value);
            }
        }
        params.push(key_value);

        let sql = format!(
            "update \"{}\" set {} where \"{}\" = ?",
            mapping.table_name,
            sets.join(", "),
            mapping.columns[key_index].name
        );
        self.execute(&sql, &params)
    }

    /// Updates every record inside one savepoint transaction.
    ///
    /// # Errors
    ///
    /// * On any failed update; everything already updated is rolled back
    pub fn update_all<T: Model + 'static>(&self, records: &[T]) -> Result<usize, DbError> {
        self.run_in_transaction(|db| {
            let mut count = 0;
            for record in records {
                count += db.update(record)?;
            }
            Ok(count)
        })
    }

    /// Deletes `record`'s row by primary key.
    ///
    /// # Errors
    ///
    /// * [`DbError::Schema`] if `T` has no primary key
    pub fn delete<T: Model + 'static>(&self, record: &T) -> Result<usize, DbError> {
        let mapping = self.mapping::<T>()?;
        let Some(key_index) = mapping.key_index() else {
            return Err(DbError::Schema(format!(
                "cannot delete from \"{}\": it has no primary key",
                mapping.table_name
            )));
        };
        let key_value = record
            .to_values()
            .into_iter()
            .nth(key_index)
            .unwrap_or(Value::Null);
        self.delete_by_key::<T>(key_value)
    }

    /// Deletes the row with the given primary key.
    ///
    /// # Errors
    ///
    /// * [`DbError::Schema`] if `T` has no primary key
    pub fn delete_by_key<T: Model + 'static>(
        &self,
        key: impl Into<Value>,
    ) -> Result<usize, DbError> {
        let mapping = self.mapping::<T>()?;
        let Some(key_column) = mapping.key() else {
            return Err(DbError::Schema(format!(
                "cannot delete from \"{}\": it has no primary key",
                mapping.table_name
            )));
        };
        let sql = format!(
            "delete from \"{}\" where \"{}\" = ?",
            mapping.table_name, key_column.name
        );
        self.execute(&sql, &[key.into()])
    }

    /// Deletes every row of `T`'s table.
    ///
    /// # Errors
    ///
    /// * On engine failure
    pub fn delete_all<T: Model + 'static>(&self) -> Result<usize, DbError> {
        let mapping = self.mapping::<T>()?;
        self.execute(&format!("delete from \"{}\"", mapping.table_name), &[])
    }

    /// Fetches the row with the given primary key.
    ///
    /// # Errors
    ///
    /// * [`DbError::NoRow`] if no such row exists
    pub fn get<T: Model + 'static>(&self, key: impl Into<Value>) -> Result<T, DbError> {
        self.find(key)?.ok_or(DbError::NoRow)
    }

    /// Fetches the row with the given primary key, if present.
    ///
    /// # Errors
    ///
    /// * On engine failure or if the row cannot be converted
    pub fn find<T: Model + 'static>(&self, key: impl Into<Value>) -> Result<Option<T>, DbError> {
        let mapping = self.mapping::<T>()?;
        let rows = self.query_rows(mapping.select_by_key_sql(), &[key.into()])?;
        rows.first().map(T::from_row).transpose()
    }

    /// A fluent query over `T`'s table, compiled to SQL at enumeration
    /// time.
    ///
    /// # Errors
    ///
    /// * [`DbError::Schema`] if the descriptor violates a mapping invariant
    pub fn table<T: Model + 'static>(&self) -> Result<QueryBuilder<'_, T>, DbError> {
        Ok(QueryBuilder::new(self, self.mapping::<T>()?))
    }

    // ===== transactions =====

    /// Whether a transaction is open on this connection.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.state.depth() > 0
    }

    /// Begins a transaction. Fails with [`DbError::TransactionState`] when
    /// one is already open; savepoints are the nesting mechanism.
    ///
    /// # Errors
    ///
    /// * On engine failure; retryable failures trigger a full rollback
    ///   before the error is re-raised
    pub fn begin_transaction(&self) -> Result<(), DbError> {
        if !self.state.try_begin() {
            return Err(DbError::TransactionState(
                "cannot begin a transaction while already in a transaction".to_string(),
            ));
        }
        if let Err(error) = self.execute("begin transaction", &[]) {
            if transaction::forces_rollback(&error) {
                self.rollback_quietly();
            } else {
                // The transaction never started; nothing to roll back.
                self.state.reset();
            }
            return Err(error);
        }
        Ok(())
    }

    /// Creates a savepoint at the current point in the transaction
    /// timeline, beginning a transaction if none is open. Returns an
    /// identifier accepted by [`Self::rollback_to`] and [`Self::release`].
    ///
    /// # Errors
    ///
    /// * On engine failure; retryable failures trigger a full rollback
    ///   before the error is re-raised
    pub fn save_point(&self) -> Result<String, DbError> {
        let depth = self.state.push();
        let savepoint = transaction::savepoint_name(depth);

        if let Err(error) = self.execute(&format!("savepoint {savepoint}"), &[]) {
            if transaction::forces_rollback(&error) {
                self.rollback_quietly();
            } else {
                self.state.pop();
            }
            return Err(error);
        }
        Ok(savepoint)
    }

    /// Rolls back the whole transaction stack. A no-op when no transaction
    /// is open.
    ///
    /// # Errors
    ///
    /// * On engine failure
    pub fn rollback(&self) -> Result<(), DbError> {
        if self.state.reset() > 0 {
            self.execute("rollback", &[])?;
        }
        Ok(())
    }

    /// Rolls back to a savepoint returned by [`Self::save_point`], setting
    /// the depth to the one encoded in the identifier.
    ///
    /// # Errors
    ///
    /// * [`DbError::TransactionState`] for a malformed or out-of-range
    ///   identifier
    pub fn rollback_to(&self, savepoint: &str) -> Result<(), DbError> {
        let depth = self.state.validate(savepoint)?;
        self.state.set(depth);
        self.execute(&format!("rollback to {savepoint}"), &[])?;
        Ok(())
    }

    /// Releases a savepoint, making its changes permanent pending the outer
    /// commit. Depth bookkeeping stays with the caller via the depth
    /// encoded in the identifier.
    ///
    /// # Errors
    ///
    /// * [`DbError::TransactionState`] for a malformed or out-of-range
    ///   identifier
    pub fn release(&self, savepoint: &str) -> Result<(), DbError> {
        self.state.validate(savepoint)?;
        self.execute(&format!("release {savepoint}"), &[])?;
        Ok(())
    }

    /// Commits the open transaction. A no-op when none is open.
    ///
    /// # Errors
    ///
    /// * On engine failure
    pub fn commit(&self) -> Result<(), DbError> {
        if self.state.reset() != 0 {
            self.execute("commit", &[])?;
        }
        Ok(())
    }

    /// Runs `action` inside a savepoint: released on success, with the full
    /// transaction rolled back and the failure propagated on any error.
    ///
    /// # Errors
    ///
    /// * Whatever `action` returned, after the rollback
    pub fn run_in_transaction<R>(
        &self,
        action: impl FnOnce(&Self) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        let savepoint = self.save_point()?;

        let outcome = action(self).and_then(|result| {
            self.release(&savepoint)?;
            Ok(result)
        });

        match outcome {
            Ok(result) => {
                if let Some(depth) = transaction::encoded_depth(&savepoint) {
                    self.state.set(depth);
                }
                Ok(result)
            }
            Err(error) => {
                // Keep the action's failure even if the rollback fails too.
                let _ = self.rollback();
                Err(error)
            }
        }
    }

    /// Full rollback as a failsafe; errors are intentionally swallowed so
    /// the original failure propagates instead.
    fn rollback_quietly(&self) {
        if self.state.reset() > 0
            && let Ok(conn) = self.handle()
        {
            let _ = conn.execute("rollback", []);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn is_nil_key(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Uuid(id) => id.is_nil(),
        _ => false,
    }
}

fn column_names(statement: &rusqlite::Statement<'_>) -> Vec<String> {
    statement
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn row_from(column_names: &[String], row: &rusqlite::Row<'_>) -> Result<Row, DbError> {
    let mut columns = Vec::with_capacity(column_names.len());
    for (i, name) in column_names.iter().enumerate() {
        let value: rusqlite::types::Value = row.get(i)?;
        columns.push((name.clone(), Value::from(value)));
    }
    Ok(Row { columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, TableDescriptor};
    use crate::types::ValueKind;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Track {
        id: i32,
        name: String,
        album_id: Option<i32>,
    }

    impl Model for Track {
        fn table() -> TableDescriptor {
            TableDescriptor::new("tracks")
                .field(FieldDef::new("Id", ValueKind::Int32))
                .field(FieldDef::new("Name", ValueKind::Text))
                .field(FieldDef::new("AlbumId", ValueKind::Int32))
        }

        fn to_values(&self) -> Vec<Value> {
            vec![
                self.id.into(),
                self.name.as_str().into(),
                self.album_id.into(),
            ]
        }

        fn from_row(row: &Row) -> Result<Self, DbError> {
            Ok(Self {
                id: row.try_get("Id")?,
                name: row.try_get("Name")?,
                album_id: row.try_get("AlbumId")?,
            })
        }

        fn put_generated_key(&mut self, key: Value) {
            if let Value::Integer(id) = key {
                self.id = i32::try_from(id).unwrap_or_default();
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Tag {
        id: uuid::Uuid,
        label: String,
    }

    impl Model for Tag {
        fn table() -> TableDescriptor {
            TableDescriptor::new("tags")
                .field(FieldDef::new("Id", ValueKind::Uuid))
                .field(FieldDef::new("Label", ValueKind::Text))
        }

        fn to_values(&self) -> Vec<Value> {
            vec![self.id.into(), self.label.as_str().into()]
        }

        fn from_row(row: &Row) -> Result<Self, DbError> {
            Ok(Self {
                id: row.try_get("Id")?,
                label: row.try_get("Label")?,
            })
        }

        fn put_generated_key(&mut self, key: Value) {
            if let Value::Uuid(id) = key {
                self.id = id;
            }
        }
    }

    fn autoinc_flags() -> CreateFlags {
        CreateFlags::ALL_IMPLICIT | CreateFlags::AUTOINC_KEY
    }

    fn test_db() -> Connection {
        let db = Connection::open_in_memory().expect("in-memory database");
        db.create_table_with::<Track>(autoinc_flags())
            .expect("create tracks");
        db
    }

    #[test]
    fn insert_then_get_round_trips() {
        let db = test_db();

        let mut track = Track {
            id: 0,
            name: "Halleluhwah".to_string(),
            album_id: Some(4),
        };
        let count = db.insert(&mut track).unwrap();
        assert_eq!(count, 1);
        assert!(track.id > 0, "auto-increment key must be assigned");

        let loaded: Track = db.get(track.id).unwrap();
        assert_eq!(loaded, track);
    }

    #[test]
    fn find_returns_none_for_missing_keys() {
        let db = test_db();
        assert_eq!(db.find::<Track>(9999).unwrap(), None);
        assert!(matches!(db.get::<Track>(9999).unwrap_err(), DbError::NoRow));
    }

    #[test]
    fn insert_or_replace_overwrites_by_key() {
        let db = test_db();

        let mut track = Track {
            id: 0,
            name: "one".to_string(),
            album_id: None,
        };
        db.insert(&mut track).unwrap();

        let mut replacement = Track {
            id: track.id,
            name: "two".to_string(),
            album_id: Some(7),
        };
        db.insert_or_replace(&mut replacement).unwrap();

        let loaded: Track = db.get(track.id).unwrap();
        assert_eq!(loaded.name, "two");
        assert_eq!(loaded.album_id, Some(7));
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn generated_uuid_keys_are_assigned_on_insert() {
        let db = Connection::open_in_memory().unwrap();
        db.create_table_with::<Tag>(CreateFlags::IMPLICIT_KEY | CreateFlags::AUTOINC_KEY)
            .unwrap();

        let mut tag = Tag {
            id: uuid::Uuid::nil(),
            label: "krautrock".to_string(),
        };
        db.insert(&mut tag).unwrap();
        assert!(!tag.id.is_nil(), "generated identifier must be assigned");

        let loaded: Tag = db.get(tag.id).unwrap();
        assert_eq!(loaded, tag);
    }

    #[test]
    fn update_rewrites_every_non_key_column() {
        let db = test_db();

        let mut track = Track {
            id: 0,
            name: "before".to_string(),
            album_id: Some(1),
        };
        db.insert(&mut track).unwrap();

        track.name = "after".to_string();
        track.album_id = None;
        assert_eq!(db.update(&track).unwrap(), 1);

        let loaded: Track = db.get(track.id).unwrap();
        assert_eq!(loaded.name, "after");
        assert_eq!(loaded.album_id, None);
    }

    #[test]
    fn delete_and_delete_all_remove_rows() {
        let db = test_db();

        let mut a = Track {
            name: "a".to_string(),
            ..Track::default()
        };
        let mut b = Track {
            name: "b".to_string(),
            ..Track::default()
        };
        db.insert(&mut a).unwrap();
        db.insert(&mut b).unwrap();

        assert_eq!(db.delete(&a).unwrap(), 1);
        assert_eq!(db.find::<Track>(a.id).unwrap(), None);

        assert_eq!(db.delete_all::<Track>().unwrap(), 1);
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(0)
        );
    }

    #[test]
    fn insert_all_is_atomic() {
        let db = test_db();

        let mut records = vec![
            Track {
                name: "a".to_string(),
                ..Track::default()
            },
            Track {
                name: "b".to_string(),
                ..Track::default()
            },
        ];
        assert_eq!(db.insert_all(&mut records).unwrap(), 2);
        assert!(records.iter().all(|t| t.id > 0));
        assert!(!db.in_transaction());
    }

    #[test]
    fn repeated_create_table_issues_no_alters() {
        let db = test_db();
        // Identical model, second call: nothing to create, nothing to add.
        assert_eq!(db.create_table_with::<Track>(autoinc_flags()).unwrap(), 0);
    }

    #[test]
    fn migration_adds_missing_columns_only() {
        #[derive(Debug)]
        struct TrackV2;

        impl Model for TrackV2 {
            fn table() -> TableDescriptor {
                TableDescriptor::new("tracks")
                    .field(FieldDef::new("Id", ValueKind::Int32))
                    .field(FieldDef::new("Name", ValueKind::Text))
                    .field(FieldDef::new("AlbumId", ValueKind::Int32))
                    .field(FieldDef::new("Rating", ValueKind::Int32))
            }

            fn to_values(&self) -> Vec<Value> {
                vec![]
            }

            fn from_row(_row: &Row) -> Result<Self, DbError> {
                Ok(Self)
            }
        }

        let db = test_db();
        assert_eq!(db.create_table_with::<TrackV2>(autoinc_flags()).unwrap(), 1);
        assert!(
            db.table_info("tracks")
                .unwrap()
                .iter()
                .any(|c| c == "Rating")
        );

        // Idempotent once migrated.
        let db2 = Connection::open_in_memory().unwrap();
        db2.create_table_with::<TrackV2>(autoinc_flags()).unwrap();
        assert_eq!(
            db2.create_table_with::<TrackV2>(autoinc_flags()).unwrap(),
            0
        );
    }

    #[test]
    fn implicit_index_is_created_in_the_live_schema() {
        let db = test_db();
        let count = db
            .query_scalar::<i64>(
                "select count(*) from sqlite_master where type='index' and name='tracks_AlbumId'",
                &[],
            )
            .unwrap();
        assert_eq!(count, Some(1));
    }

    #[test]
    fn raw_query_binds_positional_parameters() {
        let db = test_db();
        let mut track = Track {
            name: "x".to_string(),
            album_id: Some(3),
            ..Track::default()
        };
        db.insert(&mut track).unwrap();

        let rows = db
            .query_rows(
                "select \"Name\" from \"tracks\" where \"AlbumId\" = ?",
                &[Value::Integer(3)],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("Name"), Some(Value::Text("x".to_string())));
    }

    #[test]
    fn deferred_query_stops_when_the_visitor_says_so() {
        let db = test_db();
        for name in ["a", "b", "c"] {
            db.insert(&mut Track {
                name: name.to_string(),
                ..Track::default()
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        db.query_deferred::<Track>("select * from \"tracks\" order by \"Id\"", &[], |t| {
            seen.push(t.name);
            seen.len() < 2
        })
        .unwrap();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);

        // The statement was finalized; the connection is still usable.
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(3)
        );
    }

    #[test]
    fn commit_makes_transactional_writes_visible() {
        let db = test_db();

        db.begin_transaction().unwrap();
        db.insert(&mut Track {
            name: "kept".to_string(),
            ..Track::default()
        })
        .unwrap();
        db.commit().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn rollback_discards_transactional_writes() {
        let db = test_db();

        db.begin_transaction().unwrap();
        db.insert(&mut Track {
            name: "gone".to_string(),
            ..Track::default()
        })
        .unwrap();
        db.rollback().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(0)
        );
    }

    #[test]
    fn begin_twice_is_an_invalid_state() {
        let db = test_db();
        db.begin_transaction().unwrap();
        assert!(matches!(
            db.begin_transaction().unwrap_err(),
            DbError::TransactionState(_)
        ));
        db.commit().unwrap();
    }

    #[test]
    fn commit_and_rollback_without_a_transaction_are_no_ops() {
        let db = test_db();
        db.commit().unwrap();
        db.rollback().unwrap();
        assert!(!db.in_transaction());
    }

    #[test]
    fn savepoint_nesting_rolls_back_to_the_encoded_depth() {
        let db = test_db();

        db.begin_transaction().unwrap();
        db.insert(&mut Track {
            name: "outer".to_string(),
            ..Track::default()
        })
        .unwrap();

        let sp1 = db.save_point().unwrap();
        db.insert(&mut Track {
            name: "inner".to_string(),
            ..Track::default()
        })
        .unwrap();
        let _sp2 = db.save_point().unwrap();

        db.rollback_to(&sp1).unwrap();
        assert_eq!(db.state.depth(), 1);

        db.commit().unwrap();
        let rows = db.query_rows("select \"Name\" from \"tracks\"", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("Name"), Some(Value::Text("outer".to_string())));
    }

    #[test]
    fn malformed_savepoint_identifiers_are_rejected() {
        let db = test_db();
        db.begin_transaction().unwrap();
        assert!(matches!(
            db.rollback_to("nonsense").unwrap_err(),
            DbError::TransactionState(_)
        ));
        assert!(matches!(
            db.release("S1D99").unwrap_err(),
            DbError::TransactionState(_)
        ));
        db.commit().unwrap();
    }

    #[test]
    fn run_in_transaction_rolls_back_on_error() {
        let db = test_db();

        let result: Result<(), DbError> = db.run_in_transaction(|tx| {
            tx.insert(&mut Track {
                name: "doomed".to_string(),
                ..Track::default()
            })?;
            Err(DbError::NoRow)
        });
        assert!(matches!(result.unwrap_err(), DbError::NoRow));
        assert!(!db.in_transaction());
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(0)
        );
    }

    #[test]
    fn run_in_transaction_restores_depth_after_release() {
        let db = test_db();

        db.run_in_transaction(|tx| {
            tx.insert(&mut Track {
                name: "kept".to_string(),
                ..Track::default()
            })
        })
        .unwrap();

        assert!(!db.in_transaction());
        assert_eq!(
            db.query_scalar::<i64>("select count(*) from \"tracks\"", &[])
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn close_is_idempotent_and_later_calls_fail_cleanly() {
        let mut db = test_db();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.execute("select 1", &[]).unwrap_err(),
            DbError::Closed
        ));
    }

    #[test]
    fn update_without_a_key_is_a_schema_error() {
        #[derive(Debug)]
        struct LogLine {
            line: String,
        }

        impl Model for LogLine {
            fn table() -> TableDescriptor {
                TableDescriptor::new("logs").field(FieldDef::new("line", ValueKind::Text))
            }

            fn to_values(&self) -> Vec<Value> {
                vec![self.line.as_str().into()]
            }

            fn from_row(row: &Row) -> Result<Self, DbError> {
                Ok(Self {
                    line: row.try_get("line")?,
                })
            }
        }

        let db = Connection::open_in_memory().unwrap();
        db.create_table::<LogLine>().unwrap();
        let entry = LogLine {
            line: "x".to_string(),
        };
        assert!(matches!(
            db.update(&entry).unwrap_err(),
            DbError::Schema(_)
        ));
        assert!(matches!(
            db.delete(&entry).unwrap_err(),
            DbError::Schema(_)
        ));
    }

    #[test]
    fn busy_timeout_is_configurable() {
        let db = test_db();
        db.busy_timeout(Duration::from_millis(250)).unwrap();
    }
}
