//! Recursive expression-to-SQL compilation.
//!
//! Each compiled node yields a [`Fragment`]: SQL text plus, for parameter
//! leaves only, the captured value. The retained value is what lets a parent
//! binary node rewrite `= NULL` comparisons into the `is ?` form the engine
//! requires.

use crate::{
    DbError,
    expr::{BinaryOp, Expr},
    schema::TableMapping,
    types::Value,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub sql: String,
    /// Present only for parameter fragments; used for null-comparison
    /// rewriting in the parent node.
    pub value: Option<Value>,
}

impl Fragment {
    fn text(sql: String) -> Self {
        Self { sql, value: None }
    }

    fn is_null_parameter(&self) -> bool {
        self.sql == "?" && matches!(self.value, Some(Value::Null))
    }
}

/// An ordering entry; the field resolves to a column the same way predicate
/// member accesses do.
#[derive(Debug, Clone)]
pub struct Ordering {
    pub field: String,
    pub ascending: bool,
}

/// Compiles one expression node, appending captured values to `args` in
/// placeholder order.
///
/// # Errors
///
/// * [`DbError::UnsupportedExpression`] for nodes or calls with no SQL
///   translation, or fields with no mapped column
pub fn compile(
    expr: &Expr,
    mapping: &TableMapping,
    args: &mut Vec<Value>,
) -> Result<Fragment, DbError> {
    match expr {
        Expr::Binary { op, left, right } => {
            let l = compile(left, mapping, args)?;
            let r = compile(right, mapping, args)?;

            let sql = if l.is_null_parameter() {
                null_comparison(*op, &r)?
            } else if r.is_null_parameter() {
                null_comparison(*op, &l)?
            } else {
                format!("({} {} {})", l.sql, op.sql_token(), r.sql)
            };
            Ok(Fragment::text(sql))
        }
        Expr::Call {
            name,
            receiver,
            args: call_args,
        } => compile_call(name, receiver.as_deref(), call_args, mapping, args),
        Expr::Value(value) => {
            args.push(value.clone());
            Ok(Fragment {
                sql: "?".to_string(),
                value: Some(value.clone()),
            })
        }
        Expr::List(values) => {
            let placeholders = vec!["?"; values.len()].join(",");
            args.extend(values.iter().cloned());
            Ok(Fragment::text(format!("({placeholders})")))
        }
        Expr::Cast { inner, kind } => {
            let fragment = compile(inner, mapping, args)?;
            let value = fragment.value.map(|v| v.coerce(*kind)).transpose()?;
            Ok(Fragment {
                sql: fragment.sql,
                value,
            })
        }
        Expr::Column(field) => {
            let column = mapping.column_for_field(field).ok_or_else(|| {
                DbError::UnsupportedExpression(format!(
                    "no mapped column for field \"{field}\" on table \"{}\"",
                    mapping.table_name
                ))
            })?;
            Ok(Fragment::text(format!("\"{}\"", column.name)))
        }
    }
}

fn null_comparison(op: BinaryOp, other: &Fragment) -> Result<String, DbError> {
    match op {
        BinaryOp::Eq => Ok(format!("({} is ?)", other.sql)),
        BinaryOp::Ne => Ok(format!("({} is not ?)", other.sql)),
        _ => Err(DbError::UnsupportedExpression(format!(
            "cannot compare against NULL with {:?}",
            op.sql_token()
        ))),
    }
}

fn compile_call(
    name: &str,
    receiver: Option<&Expr>,
    call_args: &[Expr],
    mapping: &TableMapping,
    args: &mut Vec<Value>,
) -> Result<Fragment, DbError> {
    match (name, receiver, call_args) {
        ("like", None, [a, b]) => {
            let a = compile(a, mapping, args)?;
            let b = compile(b, mapping, args)?;
            Ok(Fragment::text(format!("({} like {})", a.sql, b.sql)))
        }
        ("contains", None, [collection, item]) => {
            let collection = compile(collection, mapping, args)?;
            let item = compile(item, mapping, args)?;
            Ok(Fragment::text(format!(
                "({} in {})",
                item.sql, collection.sql
            )))
        }
        ("contains", Some(receiver), [arg]) => {
            let recv = compile(receiver, mapping, args)?;
            let arg = compile(arg, mapping, args)?;
            if matches!(receiver, Expr::List(_)) {
                Ok(Fragment::text(format!("({} in {})", arg.sql, recv.sql)))
            } else {
                Ok(Fragment::text(format!(
                    "({} like ('%' || {} || '%'))",
                    recv.sql, arg.sql
                )))
            }
        }
        ("starts_with", Some(receiver), [arg]) => {
            let recv = compile(receiver, mapping, args)?;
            let arg = compile(arg, mapping, args)?;
            Ok(Fragment::text(format!(
                "({} like ({} || '%'))",
                recv.sql, arg.sql
            )))
        }
        ("ends_with", Some(receiver), [arg]) => {
            let recv = compile(receiver, mapping, args)?;
            let arg = compile(arg, mapping, args)?;
            Ok(Fragment::text(format!(
                "({} like ('%' || {}))",
                recv.sql, arg.sql
            )))
        }
        ("equals", Some(receiver), [arg]) => {
            let recv = compile(receiver, mapping, args)?;
            let arg = compile(arg, mapping, args)?;
            Ok(Fragment::text(format!("({} = ({}))", recv.sql, arg.sql)))
        }
        ("to_lower", Some(receiver), []) => {
            let recv = compile(receiver, mapping, args)?;
            Ok(Fragment::text(format!("(lower({}))", recv.sql)))
        }
        // Unrecognized calls map to an SQL function of the same
        // lowercased name; this is the deliberate escape hatch onto the
        // engine's built-ins.
        (name, None, call_args) => {
            let compiled = call_args
                .iter()
                .map(|a| compile(a, mapping, args).map(|f| f.sql))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Fragment::text(format!(
                "{}({})",
                name.to_lowercase(),
                compiled.join(",")
            )))
        }
        (name, Some(_), _) => Err(DbError::UnsupportedExpression(format!(
            "cannot translate method call \"{name}\" with this shape"
        ))),
    }
}

/// Assembles a full SELECT from compiled parts. Multiple filters accumulate
/// under logical `and`. An offset with no limit forces `limit -1`, which the
/// engine requires for offset-only queries.
///
/// # Errors
///
/// * If a filter or ordering fails to compile
pub fn build_select(
    mapping: &TableMapping,
    selection: &str,
    filters: &[Expr],
    orderings: &[Ordering],
    limit: Option<u32>,
    offset: Option<u32>,
    args: &mut Vec<Value>,
) -> Result<String, DbError> {
    let mut sql = format!("select {selection} from \"{}\"", mapping.table_name);

    if let Some(predicate) = filters.iter().cloned().reduce(Expr::and) {
        let compiled = compile(&predicate, mapping, args)?;
        sql.push_str(" where ");
        sql.push_str(&compiled.sql);
    }

    if !orderings.is_empty() {
        let entries = orderings
            .iter()
            .map(|o| {
                let column = mapping.column_for_field(&o.field).ok_or_else(|| {
                    DbError::UnsupportedExpression(format!(
                        "no mapped column for ordering field \"{}\" on table \"{}\"",
                        o.field, mapping.table_name
                    ))
                })?;
                Ok(format!(
                    "\"{}\"{}",
                    column.name,
                    if o.ascending { "" } else { " desc" }
                ))
            })
            .collect::<Result<Vec<_>, DbError>>()?;
        sql.push_str(" order by ");
        sql.push_str(&entries.join(", "));
    }

    if let Some(limit) = limit {
        sql.push_str(&format!(" limit {limit}"));
    }
    if let Some(offset) = offset {
        if limit.is_none() {
            sql.push_str(" limit -1");
        }
        sql.push_str(&format!(" offset {offset}"));
    }

    Ok(sql)
}
