//! Interpreter for parsed conditions. `None` stands for an absent value.

use super::{CompareOp, Expr};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;

/// Resolve a dotted path (`a.b.0`) in a field map. Numeric segments index arrays.
pub fn resolve_path<'a>(fields: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = fields.get(segments.next()?)?;
    segments.try_fold(first, |current, seg| match current {
        Value::Object(m) => m.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub(super) fn eval<'a>(expr: &'a Expr, fields: &'a Map<String, Value>) -> Option<Cow<'a, Value>> {
    match expr {
        Expr::Literal(v) => Some(Cow::Borrowed(v)),
        Expr::Var { path, default } => match resolve_path(fields, path) {
            Some(v) => Some(Cow::Borrowed(v)),
            None => default.as_ref().and_then(|d| eval(d, fields)),
        },
        Expr::Compare { op, lhs, rhs } => {
            let l = eval(lhs, fields);
            let r = eval(rhs, fields);
            Some(bool_value(compare(*op, l.as_deref(), r.as_deref())))
        }
        Expr::In { needle, haystack } => {
            let n = eval(needle, fields);
            let h = eval(haystack, fields);
            Some(bool_value(contains(n.as_deref(), h.as_deref())))
        }
        Expr::And(items) => Some(bool_value(
            items.iter().all(|e| truthy(eval(e, fields).as_deref())),
        )),
        Expr::Or(items) => Some(bool_value(
            items.iter().any(|e| truthy(eval(e, fields).as_deref())),
        )),
        Expr::Not(inner) => Some(bool_value(!truthy(eval(inner, fields).as_deref()))),
        Expr::List(items) => Some(Cow::Owned(Value::Array(
            items
                .iter()
                .map(|e| eval(e, fields).map(Cow::into_owned).unwrap_or(Value::Null))
                .collect(),
        ))),
    }
}

fn bool_value(b: bool) -> Cow<'static, Value> {
    Cow::Owned(Value::Bool(b))
}

pub(super) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

/// Numbers, and strings that look like numbers.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        _ => None,
    }
}

impl CompareOp {
    fn holds(self, ord: Option<Ordering>) -> bool {
        let Some(ord) = ord else {
            return false;
        };
        match self {
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
        }
    }
}

fn compare(op: CompareOp, lhs: Option<&Value>, rhs: Option<&Value>) -> bool {
    let (Some(l), Some(r)) = (lhs, rhs) else {
        return false;
    };
    if l.is_null() || r.is_null() {
        return false;
    }
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return op.holds(a.partial_cmp(&b));
    }
    match (l, r) {
        (Value::String(a), Value::String(b)) => op.holds(Some(a.cmp(b))),
        _ => match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            _ => false,
        },
    }
}

fn contains(needle: Option<&Value>, haystack: Option<&Value>) -> bool {
    let Some(needle) = needle.filter(|v| !v.is_null()) else {
        return false;
    };
    match haystack {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(CompareOp::Eq, Some(needle), Some(item))),
        Some(Value::String(list)) => list
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .any(|part| {
                compare(
                    CompareOp::Eq,
                    Some(needle),
                    Some(&Value::String(part.to_string())),
                )
            }),
        _ => false,
    }
}
