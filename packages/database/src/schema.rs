//! Schema derivation: model descriptors, table mappings and DDL text.
//!
//! A [`Model`] describes its fields explicitly at registration time; no
//! runtime introspection happens anywhere. [`TableMapping::derive`] turns a
//! descriptor plus [`CreateFlags`] conventions into the column/key/index
//! metadata every other module consumes.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::{DbError, Row, types::ValueKind};

pub const DEFAULT_MAX_TEXT_LENGTH: u32 = 140;
pub const IMPLICIT_KEY_NAME: &str = "Id";
pub const IMPLICIT_INDEX_SUFFIX: &str = "Id";

/// Naming-convention switches applied while deriving a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateFlags {
    /// A field literally named `Id` (case-insensitive) becomes the primary
    /// key.
    pub implicit_key: bool,
    /// Fields ending in `Id` (case-insensitive) get a default non-unique
    /// index when not the primary key and not explicitly indexed.
    pub implicit_index: bool,
    /// The primary key auto-increments; a `Uuid` key instead receives a
    /// generated identifier.
    pub autoinc_key: bool,
}

impl CreateFlags {
    pub const NONE: Self = Self {
        implicit_key: false,
        implicit_index: false,
        autoinc_key: false,
    };
    pub const IMPLICIT_KEY: Self = Self {
        implicit_key: true,
        implicit_index: false,
        autoinc_key: false,
    };
    pub const IMPLICIT_INDEX: Self = Self {
        implicit_key: false,
        implicit_index: true,
        autoinc_key: false,
    };
    pub const ALL_IMPLICIT: Self = Self {
        implicit_key: true,
        implicit_index: true,
        autoinc_key: false,
    };
    pub const AUTOINC_KEY: Self = Self {
        implicit_key: false,
        implicit_index: false,
        autoinc_key: true,
    };
}

impl std::ops::BitOr for CreateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            implicit_key: self.implicit_key || rhs.implicit_key,
            implicit_index: self.implicit_index || rhs.implicit_index,
            autoinc_key: self.autoinc_key || rhs.autoinc_key,
        }
    }
}

/// Conflict handling for generated INSERT statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnConflict {
    Abort,
    Replace,
}

/// Explicit index membership declared on a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedField {
    pub name: Option<&'static str>,
    pub unique: bool,
    pub order: u32,
}

impl Default for IndexedField {
    fn default() -> Self {
        Self {
            name: None,
            unique: false,
            order: 0,
        }
    }
}

/// One field of a model descriptor, with its declarative attributes.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: ValueKind,
    pub column: Option<&'static str>,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub ignored: bool,
    pub nullable: Option<bool>,
    pub max_length: Option<u32>,
    pub collation: Option<&'static str>,
    pub indices: Vec<IndexedField>,
}

impl FieldDef {
    #[must_use]
    pub const fn new(name: &'static str, kind: ValueKind) -> Self {
        Self {
            name,
            kind,
            column: None,
            primary_key: false,
            auto_increment: false,
            ignored: false,
            nullable: None,
            max_length: None,
            collation: None,
            indices: Vec::new(),
        }
    }

    #[must_use]
    pub const fn column(mut self, column: &'static str) -> Self {
        self.column = Some(column);
        self
    }

    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub const fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    #[must_use]
    pub const fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    #[must_use]
    pub const fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    #[must_use]
    pub const fn max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub const fn collation(mut self, collation: &'static str) -> Self {
        self.collation = Some(collation);
        self
    }

    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indices.push(IndexedField::default());
        self
    }

    #[must_use]
    pub fn indexed_as(mut self, name: &'static str, unique: bool, order: u32) -> Self {
        self.indices.push(IndexedField {
            name: Some(name),
            unique,
            order,
        });
        self
    }
}

/// Registration-time description of a mapped type.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub fields: Vec<FieldDef>,
}

impl TableDescriptor {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// A type that maps onto a table.
///
/// `to_values` must yield exactly one value per mapped (non-ignored) field,
/// in declaration order. `from_row` materializes an instance column by
/// column from a result row keyed by column names.
pub trait Model: Sized {
    fn table() -> TableDescriptor;

    fn to_values(&self) -> Vec<crate::Value>;

    /// # Errors
    ///
    /// * If a column value cannot be converted to the field's type
    fn from_row(row: &Row) -> Result<Self, DbError>;

    /// Receives the generated primary key after an insert: the new rowid
    /// for auto-increment keys, the fresh identifier for generated-uuid
    /// keys. Types without a generated key ignore it.
    fn put_generated_key(&mut self, key: crate::Value) {
        let _ = key;
    }
}

/// Resolved index membership on a mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub unique: bool,
    pub order: u32,
}

/// One column of a derived mapping.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub field: String,
    pub kind: ValueKind,
    pub nullable: bool,
    pub max_length: u32,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub auto_uuid: bool,
    pub collation: Option<String>,
    pub indices: Vec<IndexSpec>,
}

impl Column {
    /// Column declaration used by CREATE TABLE and ADD COLUMN: type,
    /// `primary key`, `autoincrement`, `not null`, `collate X`, in that
    /// order.
    #[must_use]
    pub fn decl(&self, datetime_as_integer: bool) -> String {
        let mut decl = format!(
            "\"{}\" {}",
            self.name,
            self.kind.sql_type(self.max_length, datetime_as_integer)
        );
        if self.primary_key {
            decl.push_str(" primary key");
        }
        if self.auto_increment {
            decl.push_str(" autoincrement");
        }
        if !self.nullable {
            decl.push_str(" not null");
        }
        if let Some(collation) = &self.collation {
            decl.push_str(" collate ");
            decl.push_str(collation);
        }
        decl
    }
}

/// The derived table metadata for one model type. Immutable after
/// derivation except for the owned insert-statement text cache.
#[derive(Debug)]
pub struct TableMapping {
    pub table_name: String,
    pub columns: Vec<Column>,
    key: Option<usize>,
    select_by_key: String,
    insert_sql: RefCell<Option<(OnConflict, String)>>,
}

impl TableMapping {
    /// Derives a mapping from a descriptor and convention flags.
    ///
    /// # Errors
    ///
    /// * If column names collide, more than one primary key is declared, or
    ///   auto-increment is requested off the primary key
    pub fn derive(descriptor: &TableDescriptor, flags: CreateFlags) -> Result<Self, DbError> {
        let table_name = descriptor.name.to_string();
        let mut columns = Vec::new();

        for field in descriptor.fields.iter().filter(|f| !f.ignored) {
            let name = field.column.unwrap_or(field.name).to_string();

            if columns
                .iter()
                .any(|c: &Column| c.name.eq_ignore_ascii_case(&name))
            {
                return Err(DbError::Schema(format!(
                    "duplicate column \"{name}\" on table \"{table_name}\""
                )));
            }

            let primary_key = field.primary_key
                || (flags.implicit_key && field.name.eq_ignore_ascii_case(IMPLICIT_KEY_NAME));
            let auto = field.auto_increment || (primary_key && flags.autoinc_key);
            let auto_uuid = auto && field.kind == ValueKind::Uuid;
            let auto_increment = auto && !auto_uuid;

            if auto_increment && !primary_key {
                return Err(DbError::Schema(format!(
                    "column \"{name}\" must be the primary key to auto increment"
                )));
            }

            let mut indices: Vec<IndexSpec> = field
                .indices
                .iter()
                .map(|i| IndexSpec {
                    name: i
                        .name
                        .map_or_else(|| format!("{table_name}_{name}"), ToString::to_string),
                    unique: i.unique,
                    order: i.order,
                })
                .collect();

            if indices.is_empty()
                && !primary_key
                && flags.implicit_index
                && name
                    .to_ascii_lowercase()
                    .ends_with(&IMPLICIT_INDEX_SUFFIX.to_ascii_lowercase())
            {
                indices.push(IndexSpec {
                    name: format!("{table_name}_{name}"),
                    unique: false,
                    order: 0,
                });
            }

            columns.push(Column {
                field: field.name.to_string(),
                kind: field.kind,
                nullable: if primary_key {
                    false
                } else {
                    field.nullable.unwrap_or(true)
                },
                max_length: field.max_length.unwrap_or(DEFAULT_MAX_TEXT_LENGTH),
                primary_key,
                auto_increment,
                auto_uuid,
                collation: field.collation.map(ToString::to_string),
                indices,
                name,
            });
        }

        let mut key = None;
        for (i, column) in columns.iter().enumerate() {
            if column.primary_key {
                if key.is_some() {
                    return Err(DbError::Schema(format!(
                        "table \"{table_name}\" declares more than one primary key"
                    )));
                }
                key = Some(i);
            }
        }

        let select_by_key = key.map_or_else(
            || format!("select * from \"{table_name}\" limit 1"),
            |i| {
                format!(
                    "select * from \"{table_name}\" where \"{}\" = ?",
                    columns[i].name
                )
            },
        );

        Ok(Self {
            table_name,
            columns,
            key,
            select_by_key,
            insert_sql: RefCell::new(None),
        })
    }

    #[must_use]
    pub fn key(&self) -> Option<&Column> {
        self.key.map(|i| &self.columns[i])
    }

    pub(crate) const fn key_index(&self) -> Option<usize> {
        self.key
    }

    #[must_use]
    pub fn find_column(&self, column_name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == column_name)
    }

    /// Resolves a logical field name to its mapped column.
    #[must_use]
    pub fn column_for_field(&self, field: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.field == field)
    }

    /// Precomputed select-by-primary-key SQL (`limit 1` fallback for tables
    /// without a key).
    #[must_use]
    pub fn select_by_key_sql(&self) -> &str {
        &self.select_by_key
    }

    /// Columns bound by an INSERT for the given conflict mode.
    /// Auto-increment keys are omitted except when replacing.
    #[must_use]
    pub fn insert_columns(&self, on_conflict: OnConflict) -> Vec<&Column> {
        self.columns
            .iter()
            .filter(|c| on_conflict == OnConflict::Replace || !c.auto_increment)
            .collect()
    }

    /// The generated INSERT text for this mapping, cached per conflict
    /// mode and regenerated when the mode changes.
    #[must_use]
    pub fn insert_sql(&self, on_conflict: OnConflict) -> String {
        let mut cache = self.insert_sql.borrow_mut();
        if let Some((mode, sql)) = cache.as_ref()
            && *mode == on_conflict
        {
            return sql.clone();
        }
        let sql = self.build_insert_sql(on_conflict);
        *cache = Some((on_conflict, sql.clone()));
        sql
    }

    fn build_insert_sql(&self, on_conflict: OnConflict) -> String {
        let extra = match on_conflict {
            OnConflict::Abort => "",
            OnConflict::Replace => "OR REPLACE ",
        };
        let cols = self.insert_columns(on_conflict);

        if cols.is_empty() && self.columns.len() == 1 && self.columns[0].auto_increment {
            return format!("insert {extra}into \"{}\" default values", self.table_name);
        }

        let names = cols
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(",");
        let placeholders = vec!["?"; cols.len()].join(",");

        format!(
            "insert {extra}into \"{}\"({names}) values ({placeholders})",
            self.table_name
        )
    }

    /// `CREATE TABLE IF NOT EXISTS` text for the full mapping.
    #[must_use]
    pub fn create_table_sql(&self, datetime_as_integer: bool) -> String {
        let decls = self
            .columns
            .iter()
            .map(|c| c.decl(datetime_as_integer))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "create table if not exists \"{}\"({decls})",
            self.table_name
        )
    }

    /// `ALTER TABLE ... ADD COLUMN` text for one column.
    #[must_use]
    pub fn add_column_sql(&self, column: &Column, datetime_as_integer: bool) -> String {
        format!(
            "alter table \"{}\" add column {}",
            self.table_name,
            column.decl(datetime_as_integer)
        )
    }

    /// One `CREATE INDEX IF NOT EXISTS` per distinct index name, columns
    /// ordered by their declared order value.
    ///
    /// # Errors
    ///
    /// * If columns sharing an index name disagree on uniqueness
    pub fn index_statements(&self) -> Result<Vec<String>, DbError> {
        let mut indexes: BTreeMap<String, (bool, Vec<(u32, String)>)> = BTreeMap::new();

        for column in &self.columns {
            for index in &column.indices {
                let entry = indexes
                    .entry(index.name.clone())
                    .or_insert_with(|| (index.unique, Vec::new()));
                if entry.0 != index.unique {
                    return Err(DbError::Schema(format!(
                        "all columns in index \"{}\" must agree on uniqueness",
                        index.name
                    )));
                }
                entry.1.push((index.order, column.name.clone()));
            }
        }

        Ok(indexes
            .into_iter()
            .map(|(name, (unique, mut columns))| {
                columns.sort_by_key(|(order, _)| *order);
                let cols = columns
                    .iter()
                    .map(|(_, c)| format!("\"{c}\""))
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "create {}index if not exists \"{name}\" on \"{}\"({cols})",
                    if unique { "unique " } else { "" },
                    self.table_name
                )
            })
            .collect())
    }
}
