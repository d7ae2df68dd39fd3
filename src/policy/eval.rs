//! Predicate evaluation against a candidate row.
//!
//! Evaluation is a pure function of (candidate, principal, post-state):
//! no side effects, no ambient lookups, and no runtime errors. Absent
//! values resolve to the null sentinel; ordered comparisons against null
//! are false and equality holds only for null == null. Predicates that
//! touch an anonymous principal evaluate false rather than erroring.

use serde_json::Value;

use crate::policy::expr::{BinOp, Expr, LitValue, Quantifier, AUTH_ROOT, FUTURE_ROOT};

/// Evaluation scope: the hydrated candidate row, the principal (null when
/// anonymous), and the post-update projection when deciding update rules.
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    pub row: &'a Value,
    pub auth: &'a Value,
    pub future: Option<&'a Value>,
}

impl<'a> EvalScope<'a> {
    /// Scope for a related row inside a quantifier: the related row becomes
    /// the candidate, the principal carries over, post-state does not.
    fn for_related(&self, related: &'a Value) -> EvalScope<'a> {
        EvalScope {
            row: related,
            auth: self.auth,
            future: None,
        }
    }
}

/// Evaluate a predicate to a boolean. Total: any type mismatch or absent
/// value yields `false`, never an error.
pub fn evaluate(expr: &Expr, scope: &EvalScope) -> bool {
    truthy(&eval_value(expr, scope))
}

#[derive(Debug, Clone)]
enum EvalResult {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Array(Vec<EvalResult>),
    /// Present but structured (e.g. the principal itself): non-null, but
    /// compares unequal to everything.
    Object,
    Null,
}

impl EvalResult {
    fn as_f64(&self) -> Option<f64> {
        match self {
            EvalResult::Int(n) => Some(*n as f64),
            EvalResult::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PartialEq for EvalResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EvalResult::Int(a), EvalResult::Int(b)) => a == b,
            (EvalResult::Float(a), EvalResult::Float(b)) => a == b,
            (EvalResult::Int(a), EvalResult::Float(b)) => (*a as f64) == *b,
            (EvalResult::Float(a), EvalResult::Int(b)) => *a == (*b as f64),
            (EvalResult::Str(a), EvalResult::Str(b)) => a == b,
            (EvalResult::Bool(a), EvalResult::Bool(b)) => a == b,
            (EvalResult::Null, EvalResult::Null) => true,
            _ => false,
        }
    }
}

fn truthy(value: &EvalResult) -> bool {
    matches!(value, EvalResult::Bool(true))
}

fn eval_value(expr: &Expr, scope: &EvalScope) -> EvalResult {
    match expr {
        Expr::Literal(lit) => match lit {
            LitValue::Int(n) => EvalResult::Int(*n),
            LitValue::Float(f) => EvalResult::Float(*f),
            LitValue::Str(s) => EvalResult::Str(s.clone()),
            LitValue::Bool(b) => EvalResult::Bool(*b),
            LitValue::Null => EvalResult::Null,
        },
        Expr::Path(segments) => {
            let (root, rest) = match segments.first().map(String::as_str) {
                Some(AUTH_ROOT) => (scope.auth, &segments[1..]),
                Some(FUTURE_ROOT) => (scope.future.unwrap_or(&Value::Null), &segments[1..]),
                _ => (scope.row, &segments[..]),
            };
            let mut current = root;
            for seg in rest {
                current = current.get(seg).unwrap_or(&Value::Null);
            }
            json_to_eval(current)
        }
        Expr::UnaryNot(inner) => EvalResult::Bool(!truthy(&eval_value(inner, scope))),
        Expr::In {
            element,
            collection,
        } => {
            if anonymous_auth_access(expr, scope) {
                return EvalResult::Bool(false);
            }
            let elem = eval_value(element, scope);
            match eval_value(collection, scope) {
                EvalResult::Array(items) => EvalResult::Bool(items.contains(&elem)),
                _ => EvalResult::Bool(false),
            }
        }
        Expr::Quantifier {
            kind,
            relation,
            predicate,
        } => {
            // Relations are hydrated into the row before evaluation; a
            // missing relation behaves as the empty set.
            let related = scope.row.get(relation).and_then(Value::as_array);
            let result = match (kind, related) {
                (Quantifier::Some, Some(rows)) => rows
                    .iter()
                    .any(|r| evaluate(predicate, &scope.for_related(r))),
                (Quantifier::Some, None) => false,
                (Quantifier::All, Some(rows)) => rows
                    .iter()
                    .all(|r| evaluate(predicate, &scope.for_related(r))),
                (Quantifier::All, None) => true,
            };
            EvalResult::Bool(result)
        }
        Expr::BinOp { op, left, right } => match op {
            BinOp::And => EvalResult::Bool(
                truthy(&eval_value(left, scope)) && truthy(&eval_value(right, scope)),
            ),
            BinOp::Or => EvalResult::Bool(
                truthy(&eval_value(left, scope)) || truthy(&eval_value(right, scope)),
            ),
            _ => {
                if anonymous_auth_access(expr, scope) {
                    return EvalResult::Bool(false);
                }
                let l = eval_value(left, scope);
                let r = eval_value(right, scope);
                match op {
                    BinOp::Eq => EvalResult::Bool(l == r),
                    BinOp::Ne => EvalResult::Bool(l != r),
                    _ => EvalResult::Bool(compare_ordered(*op, &l, &r)),
                }
            }
        },
    }
}

/// A comparison that reaches into a field of an absent principal is
/// false, whatever the operator — the bare `auth == null` sentinel check
/// is unaffected.
fn anonymous_auth_access(expr: &Expr, scope: &EvalScope) -> bool {
    scope.auth.is_null() && expr.references_auth_field()
}

/// Compare two plain JSON values with the evaluator's comparison
/// semantics. Used by the query rewriter to constant-fold comparisons
/// whose operands are both known at rewrite time.
pub fn compare_values(op: BinOp, l: &Value, r: &Value) -> bool {
    let l = json_to_eval(l);
    let r = json_to_eval(r);
    match op {
        BinOp::Eq => l == r,
        BinOp::Ne => l != r,
        BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => compare_ordered(op, &l, &r),
        BinOp::And | BinOp::Or => false,
    }
}

/// Membership test with the evaluator's equality semantics.
pub fn contains_value(collection: &Value, element: &Value) -> bool {
    match json_to_eval(collection) {
        EvalResult::Array(items) => items.contains(&json_to_eval(element)),
        _ => false,
    }
}

/// Ordered comparison: numeric when both sides are numeric, lexicographic
/// when both are strings, false otherwise (including any null operand).
fn compare_ordered(op: BinOp, l: &EvalResult, r: &EvalResult) -> bool {
    if let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) {
        return match op {
            BinOp::Gt => lf > rf,
            BinOp::Lt => lf < rf,
            BinOp::Ge => lf >= rf,
            BinOp::Le => lf <= rf,
            _ => unreachable!(),
        };
    }
    if let (EvalResult::Str(ls), EvalResult::Str(rs)) = (l, r) {
        return match op {
            BinOp::Gt => ls > rs,
            BinOp::Lt => ls < rs,
            BinOp::Ge => ls >= rs,
            BinOp::Le => ls <= rs,
            _ => unreachable!(),
        };
    }
    false
}

fn json_to_eval(value: &Value) -> EvalResult {
    match value {
        Value::Null => EvalResult::Null,
        Value::Bool(b) => EvalResult::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                EvalResult::Int(i)
            } else if let Some(f) = n.as_f64() {
                EvalResult::Float(f)
            } else {
                EvalResult::Null
            }
        }
        Value::String(s) => EvalResult::Str(s.clone()),
        Value::Array(arr) => EvalResult::Array(arr.iter().map(json_to_eval).collect()),
        Value::Object(_) => EvalResult::Object,
    }
}
