//! Filter expressions over entity fields
//!
//! An [`Expr`] is evaluated against the entity's `serde_json::Value` tree.
//! Fields resolve through a [`FieldPath`]; a missing or non-scalar field
//! evaluates to `Null`.
//!
//! ```ignore
//! use rackdb_engine::query::{field, Expr};
//!
//! let adults_in_oslo = field("age").ge(18).and(field("address.city").eq("Oslo"));
//! ```

use rackdb_core::{FieldPath, Value};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    fn holds(self, ordering: Option<Ordering>) -> bool {
        match self {
            CmpOp::Eq => ordering == Some(Ordering::Equal),
            CmpOp::Ne => ordering != Some(Ordering::Equal),
            CmpOp::Lt => ordering == Some(Ordering::Less),
            CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            CmpOp::Gt => ordering == Some(Ordering::Greater),
            CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Boolean expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Value of a field
    Field(FieldPath),
    /// Constant
    Literal(Value),
    /// Binary comparison
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// Both sides true
    And(Box<Expr>, Box<Expr>),
    /// Either side true
    Or(Box<Expr>, Box<Expr>),
    /// Negation
    Not(Box<Expr>),
}

/// Reference a field by dotted path
pub fn field(path: &str) -> Expr {
    Expr::Field(FieldPath::parse(path))
}

/// A constant
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

#[allow(clippy::should_implement_trait)]
impl Expr {
    /// `lhs <op> rhs` for arbitrary sub-expressions
    pub fn compare(op: CmpOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Compare(op, Box::new(lhs), Box::new(rhs))
    }

    /// `self == value`
    pub fn eq(self, value: impl Into<Value>) -> Expr {
        Self::compare(CmpOp::Eq, self, lit(value))
    }

    /// `self != value`
    pub fn ne(self, value: impl Into<Value>) -> Expr {
        Self::compare(CmpOp::Ne, self, lit(value))
    }

    /// `self < value`
    pub fn lt(self, value: impl Into<Value>) -> Expr {
        Self::compare(CmpOp::Lt, self, lit(value))
    }

    /// `self <= value`
    pub fn le(self, value: impl Into<Value>) -> Expr {
        Self::compare(CmpOp::Le, self, lit(value))
    }

    /// `self > value`
    pub fn gt(self, value: impl Into<Value>) -> Expr {
        Self::compare(CmpOp::Gt, self, lit(value))
    }

    /// `self >= value`
    pub fn ge(self, value: impl Into<Value>) -> Expr {
        Self::compare(CmpOp::Ge, self, lit(value))
    }

    /// `self && other`
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    /// `self || other`
    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    /// `!self`
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Evaluate to a scalar
    pub fn value(&self, doc: &serde_json::Value) -> Value {
        match self {
            Expr::Field(path) => path.resolve_value(doc).unwrap_or(Value::Null),
            Expr::Literal(value) => value.clone(),
            Expr::Compare(op, lhs, rhs) => {
                Value::Bool(op.holds(lhs.value(doc).compare(&rhs.value(doc))))
            }
            Expr::And(lhs, rhs) => Value::Bool(lhs.matches(doc) && rhs.matches(doc)),
            Expr::Or(lhs, rhs) => Value::Bool(lhs.matches(doc) || rhs.matches(doc)),
            Expr::Not(inner) => Value::Bool(!inner.matches(doc)),
        }
    }

    /// True if the expression evaluates to `true`
    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        matches!(self.value(doc), Value::Bool(true))
    }

    /// Collect `field == literal` conjuncts usable for index lookups
    ///
    /// Only the top-level `And` chain is searched: a comparison under `Or`
    /// or `Not` does not restrict the result set.
    pub fn equality_candidates(&self, out: &mut Vec<(FieldPath, Value)>) {
        match self {
            Expr::Compare(CmpOp::Eq, lhs, rhs) => match (lhs.as_ref(), rhs.as_ref()) {
                (Expr::Field(path), Expr::Literal(value))
                | (Expr::Literal(value), Expr::Field(path)) => {
                    out.push((path.clone(), value.clone()));
                }
                _ => {}
            },
            Expr::And(lhs, rhs) => {
                lhs.equality_candidates(out);
                rhs.equality_candidates(out);
            }
            _ => {}
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(path) => write!(f, "{}", path),
            Expr::Literal(Value::String(s)) => write!(f, "{:?}", s),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Compare(op, lhs, rhs) => write!(f, "{} {} {}", lhs, op.symbol(), rhs),
            Expr::And(lhs, rhs) => write!(f, "({} && {})", lhs, rhs),
            Expr::Or(lhs, rhs) => write!(f, "({} || {})", lhs, rhs),
            Expr::Not(inner) => write!(f, "!{}", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> serde_json::Value {
        json!({
            "name": "Alice",
            "age": 30,
            "score": 4.5,
            "address": {"city": "Oslo"},
            "tags": ["admin"]
        })
    }

    #[test]
    fn test_comparisons() {
        let doc = person();
        assert!(field("name").eq("Alice").matches(&doc));
        assert!(field("age").gt(18).matches(&doc));
        assert!(field("age").le(30).matches(&doc));
        assert!(!field("age").lt(30).matches(&doc));
        assert!(field("score").ge(4).matches(&doc));
        assert!(field("address.city").ne("Rome").matches(&doc));
        assert!(field("tags.0").eq("admin").matches(&doc));
    }

    #[test]
    fn test_missing_field_is_null() {
        let doc = person();
        assert!(field("email").eq(()).matches(&doc));
        assert!(!field("email").eq("x").matches(&doc));
        assert!(field("email").ne("x").matches(&doc));
        assert!(!field("email").gt(1).matches(&doc));
    }

    #[test]
    fn test_mixed_kinds_never_order() {
        let doc = person();
        assert!(!field("name").gt(1).matches(&doc));
        assert!(!field("name").lt(1).matches(&doc));
    }

    #[test]
    fn test_boolean_connectives() {
        let doc = person();
        let expr = field("age").gt(40).or(field("name").eq("Alice"));
        assert!(expr.matches(&doc));
        assert!(!expr.clone().not().matches(&doc));
        assert!(!field("age").gt(40).and(field("name").eq("Alice")).matches(&doc));
    }

    #[test]
    fn test_equality_candidates_follow_and_chain() {
        let expr = field("name")
            .eq("Alice")
            .and(Expr::compare(CmpOp::Eq, lit(30), field("age")))
            .and(field("city").eq("Oslo").or(field("city").eq("Rome")))
            .and(field("score").gt(1));

        let mut out = Vec::new();
        expr.equality_candidates(&mut out);
        assert_eq!(
            out,
            vec![
                (FieldPath::parse("name"), Value::from("Alice")),
                (FieldPath::parse("age"), Value::Int(30)),
            ]
        );
    }

    #[test]
    fn test_display() {
        let expr = field("age").ge(18).and(field("name").eq("Bob"));
        assert_eq!(expr.to_string(), "(age >= 18 && name == \"Bob\")");
    }
}
