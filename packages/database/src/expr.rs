//! Predicate and ordering expression trees.
//!
//! Expressions are an explicit tagged union built through fluent
//! combinators; the compiler in [`crate::compiler`] pattern-matches over the
//! variants to emit SQL. [`col`] refers to a logical field of the queried
//! row, [`val`] captures a concrete value, [`vals`] captures an in-memory
//! collection for membership tests.

use crate::types::{Value, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    And,
    Or,
    BitAnd,
    BitOr,
}

impl BinaryOp {
    pub(crate) const fn sql_token(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::And => "and",
            Self::Or => "or",
            Self::BitAnd => "&",
            Self::BitOr => "|",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    /// A column of the row being filtered, referenced by field name.
    Column(String),
    /// A captured scalar value, bound as a positional parameter.
    Value(Value),
    /// A captured collection of scalars, expanded to one placeholder per
    /// element for membership tests.
    List(Vec<Value>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// A method-style call. Recognized names get dedicated translations;
    /// anything else falls through to a literal SQL function call by
    /// lowercased name.
    Call {
        name: String,
        receiver: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
    /// A type conversion applied to the inner operand's captured value.
    Cast { inner: Box<Expr>, kind: ValueKind },
}

#[must_use]
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

#[must_use]
pub fn val(value: impl Into<Value>) -> Expr {
    Expr::Value(value.into())
}

#[must_use]
pub fn vals<I, T>(values: I) -> Expr
where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
{
    Expr::List(values.into_iter().map(Into::into).collect())
}

/// Escape hatch: an arbitrary SQL function call by name.
#[must_use]
pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Call {
        name: name.into(),
        receiver: None,
        args,
    }
}

impl Expr {
    fn binary(op: BinaryOp, left: Self, right: Self) -> Self {
        Self::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn call(name: &str, receiver: Self, args: Vec<Self>) -> Self {
        Self::Call {
            name: name.to_string(),
            receiver: Some(Box::new(receiver)),
            args,
        }
    }

    #[must_use]
    pub fn and(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::And, self, rhs)
    }

    #[must_use]
    pub fn or(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Or, self, rhs)
    }

    #[must_use]
    pub fn bit_and(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::BitAnd, self, rhs)
    }

    #[must_use]
    pub fn bit_or(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::BitOr, self, rhs)
    }

    #[must_use]
    pub fn gt(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Gt, self, rhs)
    }

    #[must_use]
    pub fn ge(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Ge, self, rhs)
    }

    #[must_use]
    pub fn lt(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Lt, self, rhs)
    }

    #[must_use]
    pub fn le(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Le, self, rhs)
    }

    #[must_use]
    pub fn sql_eq(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Eq, self, rhs)
    }

    #[must_use]
    pub fn sql_ne(self, rhs: Self) -> Self {
        Self::binary(BinaryOp::Ne, self, rhs)
    }

    /// `a like b`.
    #[must_use]
    pub fn like(self, pattern: Self) -> Self {
        Self::Call {
            name: "like".to_string(),
            receiver: None,
            args: vec![self, pattern],
        }
    }

    /// Substring match on a text receiver, membership test on a list
    /// receiver.
    #[must_use]
    pub fn contains(self, arg: Self) -> Self {
        Self::call("contains", self, vec![arg])
    }

    #[must_use]
    pub fn starts_with(self, arg: Self) -> Self {
        Self::call("starts_with", self, vec![arg])
    }

    #[must_use]
    pub fn ends_with(self, arg: Self) -> Self {
        Self::call("ends_with", self, vec![arg])
    }

    #[must_use]
    pub fn equals(self, arg: Self) -> Self {
        Self::call("equals", self, vec![arg])
    }

    #[must_use]
    pub fn to_lower(self) -> Self {
        Self::call("to_lower", self, vec![])
    }

    #[must_use]
    pub fn cast(self, kind: ValueKind) -> Self {
        Self::Cast {
            inner: Box::new(self),
            kind,
        }
    }
}
