//! JSON value -> `Expr`. Validates operators and arity up front so evaluation
//! cannot fail.

use super::{CompareOp, Expr, MAX_DEPTH};
use crate::error::ConditionError;
use serde_json::{Map, Value};

/// A whole rule condition: an operation object or a boolean. Conditions
/// kept as JSON text are decoded first; any other scalar is rejected.
pub(super) fn parse_root(value: &Value) -> Result<Expr, ConditionError> {
    match value {
        Value::String(text) => {
            let decoded: Value = serde_json::from_str(text)
                .map_err(|e| ConditionError::Parse(format!("condition text: {}", e)))?;
            match decoded {
                Value::Object(_) | Value::Bool(_) => parse_expr(&decoded, 0),
                other => Err(ConditionError::Parse(format!(
                    "condition text must encode an object or boolean, got {}",
                    kind(&other)
                ))),
            }
        }
        Value::Object(_) | Value::Bool(_) => parse_expr(value, 0),
        other => Err(ConditionError::Parse(format!(
            "condition must be an object or boolean, got {}",
            kind(other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(super) fn parse_expr(value: &Value, depth: usize) -> Result<Expr, ConditionError> {
    if depth > MAX_DEPTH {
        return Err(ConditionError::TooDeep { max: MAX_DEPTH });
    }
    match value {
        Value::Object(map) => parse_operation(map, depth),
        Value::Array(items) if items.iter().all(is_plain) => Ok(Expr::Literal(value.clone())),
        Value::Array(items) => items
            .iter()
            .map(|v| parse_expr(v, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::List),
        other => Ok(Expr::Literal(other.clone())),
    }
}

fn is_plain(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => items.iter().all(is_plain),
        _ => true,
    }
}

/// `{op: [a, b]}` or `{op: a}` (single operand).
fn operands(args: &Value) -> Vec<&Value> {
    match args {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn parse_operation(map: &Map<String, Value>, depth: usize) -> Result<Expr, ConditionError> {
    let mut entries = map.iter();
    let (op, args) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(ConditionError::Parse(format!(
                "operation must have exactly one key, found {}",
                map.len()
            )))
        }
    };

    if op == "var" {
        return parse_var(args, depth);
    }

    let ops = operands(args);
    let sub = |v: &Value| parse_expr(v, depth + 1).map(Box::new);

    if let Some(cmp) = CompareOp::from_symbol(op) {
        let [lhs, rhs] = exactly::<2>(op, &ops)?;
        return Ok(Expr::Compare {
            op: cmp,
            lhs: sub(lhs)?,
            rhs: sub(rhs)?,
        });
    }

    match op.as_str() {
        "in" => {
            let [needle, haystack] = exactly::<2>(op, &ops)?;
            Ok(Expr::In {
                needle: sub(needle)?,
                haystack: sub(haystack)?,
            })
        }
        "and" | "or" => {
            if ops.is_empty() {
                return Err(ConditionError::Arity {
                    op: op.clone(),
                    expected: "at least 1",
                    got: 0,
                });
            }
            let items = ops
                .into_iter()
                .map(|v| parse_expr(v, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if op == "and" {
                Expr::And(items)
            } else {
                Expr::Or(items)
            })
        }
        "not" | "!" => {
            let [inner] = exactly::<1>(op, &ops)?;
            Ok(Expr::Not(sub(inner)?))
        }
        other => Err(ConditionError::UnknownOperator(other.to_string())),
    }
}

fn exactly<'a, const N: usize>(
    op: &str,
    ops: &[&'a Value],
) -> Result<[&'a Value; N], ConditionError> {
    <[&Value; N]>::try_from(ops).map_err(|_| ConditionError::Arity {
        op: op.to_string(),
        expected: match N {
            1 => "exactly 1",
            _ => "exactly 2",
        },
        got: ops.len(),
    })
}

fn parse_var(args: &Value, depth: usize) -> Result<Expr, ConditionError> {
    let (path, default) = match args {
        Value::Array(items) => match items.as_slice() {
            [path] => (path, None),
            [path, default] => (path, Some(default)),
            _ => {
                return Err(ConditionError::Arity {
                    op: "var".to_string(),
                    expected: "1 or 2",
                    got: items.len(),
                })
            }
        },
        other => (other, None),
    };

    let path = match path {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ConditionError::InvalidVar(format!(
                "path must be a string, got {}",
                other
            )))
        }
    };
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(ConditionError::InvalidVar(format!("bad path `{}`", path)));
    }

    let default = match default {
        Some(d) => Some(Box::new(parse_expr(d, depth + 1)?)),
        None => None,
    };
    Ok(Expr::Var { path, default })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Result<Expr, ConditionError> {
        parse_expr(&v, 0)
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = parse(json!({ "regex": [{ "var": "name" }, ".*"] })).unwrap_err();
        assert_eq!(err, ConditionError::UnknownOperator("regex".into()));
    }

    #[test]
    fn comparison_arity_is_checked() {
        let err = parse(json!({ ">": [{ "var": "amount" }] })).unwrap_err();
        assert!(matches!(err, ConditionError::Arity { got: 1, .. }));
        let err = parse(json!({ "==": [1, 2, 3] })).unwrap_err();
        assert!(matches!(err, ConditionError::Arity { got: 3, .. }));
    }

    #[test]
    fn multi_key_object_is_rejected() {
        let err = parse(json!({ ">": [1, 2], "<": [1, 2] })).unwrap_err();
        assert!(matches!(err, ConditionError::Parse(_)));
        assert!(matches!(parse(json!({})), Err(ConditionError::Parse(_))));
    }

    #[test]
    fn empty_boolean_combinator_is_rejected() {
        assert!(matches!(
            parse(json!({ "and": [] })),
            Err(ConditionError::Arity { got: 0, .. })
        ));
    }

    #[test]
    fn bang_with_bare_operand_becomes_not() {
        let e = parse(json!({ "!": { "var": "isPep" } })).unwrap();
        assert!(matches!(e, Expr::Not(_)));
    }

    #[test]
    fn bad_var_paths() {
        assert!(matches!(parse(json!({ "var": "" })), Err(ConditionError::InvalidVar(_))));
        assert!(matches!(parse(json!({ "var": "a..b" })), Err(ConditionError::InvalidVar(_))));
        assert!(matches!(parse(json!({ "var": true })), Err(ConditionError::InvalidVar(_))));
        assert!(matches!(
            parse(json!({ "var": ["a", 1, 2] })),
            Err(ConditionError::Arity { .. })
        ));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut v = json!({ "var": "x" });
        for _ in 0..(MAX_DEPTH + 2) {
            v = json!({ "not": [v] });
        }
        assert_eq!(parse(v), Err(ConditionError::TooDeep { max: MAX_DEPTH }));
    }
}
