//! Declarative rule conditions: a small JSON-logic-like grammar.
//!
//! Conditions are data, never code. They are parsed into an [`Expr`] tree
//! and interpreted by [`Condition::evaluate`] against an entity field map.

mod eval;
mod parse;

pub use eval::resolve_path;

use crate::error::ConditionError;
use serde_json::{json, Map, Value};
use std::str::FromStr;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var {
        path: String,
        default: Option<Box<Expr>>,
    },
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        needle: Box<Expr>,
        haystack: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Array containing at least one non-literal element.
    List(Vec<Expr>),
}

impl Expr {
    /// Canonical JSON form.
    pub fn to_value(&self) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Var {
                path,
                default: None,
            } => json!({ "var": path }),
            Expr::Var {
                path,
                default: Some(d),
            } => json!({ "var": [path, d.to_value()] }),
            Expr::Compare { op, lhs, rhs } => {
                let mut m = Map::new();
                m.insert(
                    op.symbol().to_string(),
                    Value::Array(vec![lhs.to_value(), rhs.to_value()]),
                );
                Value::Object(m)
            }
            Expr::In { needle, haystack } => {
                json!({ "in": [needle.to_value(), haystack.to_value()] })
            }
            Expr::And(items) => json!({ "and": items.iter().map(Expr::to_value).collect::<Vec<_>>() }),
            Expr::Or(items) => json!({ "or": items.iter().map(Expr::to_value).collect::<Vec<_>>() }),
            Expr::Not(inner) => json!({ "not": [inner.to_value()] }),
            Expr::List(items) => Value::Array(items.iter().map(Expr::to_value).collect()),
        }
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var { path, default } => {
                if !out.contains(&path.as_str()) {
                    out.push(path);
                }
                if let Some(d) = default {
                    d.collect_paths(out);
                }
            }
            Expr::Compare { lhs, rhs, .. } => {
                lhs.collect_paths(out);
                rhs.collect_paths(out);
            }
            Expr::In { needle, haystack } => {
                needle.collect_paths(out);
                haystack.collect_paths(out);
            }
            Expr::And(items) | Expr::Or(items) | Expr::List(items) => {
                for e in items {
                    e.collect_paths(out);
                }
            }
            Expr::Not(inner) => inner.collect_paths(out),
        }
    }
}

/// A parsed rule condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    root: Expr,
}

impl Condition {
    /// The root must be an operation object or a boolean. A string is read
    /// as JSON text holding one of those.
    pub fn parse(value: &Value) -> Result<Self, ConditionError> {
        Ok(Self {
            root: parse::parse_root(value)?,
        })
    }

    /// True when the condition is truthy for the given fields. Never fails:
    /// absent fields make comparisons false and are never members.
    pub fn evaluate(&self, fields: &Map<String, Value>) -> bool {
        eval::truthy(eval::eval(&self.root, fields).as_deref())
    }

    /// Canonical form. Aliases are normalized (`!` becomes `not`, a
    /// single-element `var` array becomes a plain path), so only canonical
    /// input round-trips unchanged.
    pub fn to_value(&self) -> Value {
        self.root.to_value()
    }

    /// Variable paths referenced anywhere in the condition, first-seen order.
    pub fn referenced_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.root.collect_paths(&mut out);
        out
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value =
            serde_json::from_str(s).map_err(|e| ConditionError::Parse(e.to_string()))?;
        Condition::parse(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_conditions_round_trip() {
        let cases = [
            json!({ ">": [{ "var": "amount" }, 9000] }),
            json!({ "in": [{ "var": "receiverCountryCode" }, ["AF", "IR"]] }),
            json!({ "and": [
                { ">=": [{ "var": "sender.age" }, 18] },
                { "not": [{ "==": [{ "var": "kycStatus" }, "verified"] }] }
            ] }),
            json!({ "or": [{ "var": ["isPep", false] }, { "var": "isSanctioned" }] }),
            json!({ "in": [{ "var": "country" }, [{ "var": "home" }, "US"]] }),
        ];
        for case in cases {
            let parsed = Condition::parse(&case).unwrap();
            assert_eq!(parsed.to_value(), case);
        }
    }

    #[test]
    fn referenced_paths_are_deduplicated() {
        let c: Condition = r#"{"and":[{">":[{"var":"amount"},1]},{"<":[{"var":"amount"},5]},{"==":[{"var":"a.b"},1]}]}"#
            .parse()
            .unwrap();
        assert_eq!(c.referenced_paths(), vec!["amount", "a.b"]);
    }

    #[test]
    fn condition_stored_as_text_is_decoded() {
        let text = Value::String(r#"{">":[{"var":"amount"},9000]}"#.into());
        let c = Condition::parse(&text).unwrap();
        assert_eq!(c.to_value(), json!({ ">": [{ "var": "amount" }, 9000] }));

        let mut fields = Map::new();
        fields.insert("amount".into(), json!(5));
        assert!(!c.evaluate(&fields));
        fields.insert("amount".into(), json!(9500));
        assert!(c.evaluate(&fields));
    }

    #[test]
    fn free_text_condition_is_rejected() {
        let err = Condition::parse(&json!("amount > 9000")).unwrap_err();
        assert!(matches!(err, ConditionError::Parse(_)));
        // text that decodes to a non-boolean scalar is not a condition either
        let err = Condition::parse(&json!("\"yes\"")).unwrap_err();
        assert!(matches!(err, ConditionError::Parse(_)));
    }

    #[test]
    fn scalar_roots_other_than_booleans_are_rejected() {
        for root in [json!(1), json!(null), json!(["AF"]), json!(0.5)] {
            let err = Condition::parse(&root).unwrap_err();
            assert!(matches!(err, ConditionError::Parse(_)), "{root}");
        }
        assert!(Condition::parse(&json!(true)).is_ok());
        assert!(Condition::parse(&json!("false")).is_ok());
    }

    #[test]
    fn aliases_are_normalized() {
        let c = Condition::parse(&json!({ "!": { "var": ["isPep"] } })).unwrap();
        assert_eq!(c.to_value(), json!({ "not": [{ "var": "isPep" }] }));
    }

    #[test]
    fn invalid_json_text_is_parse_error() {
        let err = "{not json".parse::<Condition>().unwrap_err();
        assert!(matches!(err, ConditionError::Parse(_)));
    }
}
