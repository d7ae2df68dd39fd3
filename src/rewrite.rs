//! Policy-aware query rewriting.
//!
//! Bulk operations must never materialize disallowed rows and filter them
//! client-side; instead the rule set for (model, operation) is compiled
//! into a SQL predicate tree and conjoined with the caller's own filter
//! before execution. The lowering mirrors the in-memory evaluator:
//!
//! - deny rules contribute their negation to a conjunction,
//! - allow rules form a disjunction (constant FALSE when none exist,
//!   keeping the model level default-closed),
//! - `auth` paths are constant-folded against the principal,
//! - `future` paths fold to the written value when the field is in the
//!   bulk write set, and to the column itself when it is not,
//! - quantifiers become correlated EXISTS / NOT EXISTS subqueries,
//! - comparisons against the null literal lower to IS [NOT] NULL.

use sea_orm::sea_query::{Alias, Condition, Expr as SqlExpr, Query, SimpleExpr, Value as SqlValue};
use serde_json::{Map, Value};

use crate::errors::PolicyError;
use crate::policy::eval::{compare_values, contains_value};
use crate::policy::expr::{self, BinOp, Expr, LitValue, Quantifier, AUTH_ROOT, FUTURE_ROOT};
use crate::policy::types::{Effect, ModelPolicy, Operation, PolicyState, Principal, Rule};
use crate::schema::RelationKind;

/// Narrow a caller-supplied filter with the policy-derived filter for
/// (model, operation, principal): the result admits exactly the rows the
/// decision engine would allow.
pub fn rewrite(
    state: &PolicyState,
    policy: &ModelPolicy,
    op: Operation,
    principal: &Principal,
    base: Condition,
    write_set: Option<&Map<String, Value>>,
) -> Result<Condition, PolicyError> {
    let mut cond = Condition::all().add(base).add(policy_condition(
        state, policy, op, principal, write_set,
    )?);
    if let Some(ws) = write_set {
        cond = cond.add(field_update_condition(state, policy, ws, principal)?);
    }
    Ok(cond)
}

/// Compile the model-level rule set for `op` into a single condition.
pub fn policy_condition(
    state: &PolicyState,
    policy: &ModelPolicy,
    op: Operation,
    principal: &Principal,
    write_set: Option<&Map<String, Value>>,
) -> Result<Condition, PolicyError> {
    let ctx = LowerCtx {
        state,
        policy,
        table: policy.model.name.clone(),
        auth: principal.as_value(),
        write_set,
        level: 0,
    };

    let rules: Vec<&Rule> = policy.rules_for(op).collect();
    let denies: Vec<&Rule> = rules
        .iter()
        .copied()
        .filter(|r| r.effect == Effect::Deny)
        .collect();
    let allows: Vec<&Rule> = rules
        .iter()
        .copied()
        .filter(|r| r.effect == Effect::Allow)
        .collect();

    let mut cond = Condition::all();
    for rule in denies {
        match lower_bool(&rule.predicate, &ctx)? {
            BoolSql::Const(true) => return Ok(const_condition(false)),
            BoolSql::Const(false) => {}
            BoolSql::Cond(c) => cond = cond.add(c.not()),
        }
    }

    match lower_allow_set(&allows, &ctx)? {
        AllowSet::Always => {}
        AllowSet::Never => return Ok(const_condition(false)),
        AllowSet::Cond(any) => cond = cond.add(any),
    }

    Ok(cond)
}

enum AllowSet {
    Always,
    Never,
    Cond(Condition),
}

/// Lower a set of allow rules into their disjunction. An empty or
/// unmatched set keeps its level's default: `Never` for the caller to map.
fn lower_allow_set(allows: &[&Rule], ctx: &LowerCtx) -> Result<AllowSet, PolicyError> {
    let mut any = Condition::any();
    let mut added = 0usize;
    for rule in allows {
        match lower_bool(&rule.predicate, ctx)? {
            BoolSql::Const(true) => return Ok(AllowSet::Always),
            BoolSql::Const(false) => {}
            BoolSql::Cond(c) => {
                any = any.add(c);
                added += 1;
            }
        }
    }
    if added == 0 {
        return Ok(AllowSet::Never);
    }
    Ok(AllowSet::Cond(any))
}

/// Field-level update rules for the fields present in the bulk write set,
/// compiled per the field decision table (deny wins, an unmatched allow
/// set denies, no rules is unconstrained).
pub fn field_update_condition(
    state: &PolicyState,
    policy: &ModelPolicy,
    write_set: &Map<String, Value>,
    principal: &Principal,
) -> Result<Condition, PolicyError> {
    let ctx = LowerCtx {
        state,
        policy,
        table: policy.model.name.clone(),
        auth: principal.as_value(),
        write_set: Some(write_set),
        level: 0,
    };

    let mut cond = Condition::all();
    for field in write_set.keys() {
        let rules = policy.field_rules_for(field, Operation::Update);
        if rules.is_empty() {
            continue;
        }

        for rule in rules.iter().filter(|r| r.effect == Effect::Deny) {
            match lower_bool(&rule.predicate, &ctx)? {
                BoolSql::Const(true) => return Ok(const_condition(false)),
                BoolSql::Const(false) => {}
                BoolSql::Cond(c) => cond = cond.add(c.not()),
            }
        }

        let allows: Vec<&Rule> = rules
            .iter()
            .copied()
            .filter(|r| r.effect == Effect::Allow)
            .collect();
        if allows.is_empty() {
            // No allow rules for this field: allow-by-default.
            continue;
        }
        match lower_allow_set(&allows, &ctx)? {
            AllowSet::Always => {}
            AllowSet::Never => return Ok(const_condition(false)),
            AllowSet::Cond(any) => cond = cond.add(any),
        }
    }
    Ok(cond)
}

/// Compile a caller-supplied filter expression (the same predicate
/// language rules use) into a condition on the model's table. `auth`
/// paths fold against the principal; `future` is not available here.
pub fn compile_filter(
    state: &PolicyState,
    policy: &ModelPolicy,
    source: &str,
    principal: &Principal,
) -> Result<Condition, PolicyError> {
    let parsed = expr::parse_condition(source)?;
    if parsed.references_future() {
        return Err(PolicyError::InvalidCondition(
            "filters cannot reference `future`".into(),
        ));
    }
    let ctx = LowerCtx {
        state,
        policy,
        table: policy.model.name.clone(),
        auth: principal.as_value(),
        write_set: None,
        level: 0,
    };
    match lower_bool(&parsed, &ctx)? {
        BoolSql::Const(b) => Ok(const_condition(b)),
        BoolSql::Cond(c) => Ok(c),
    }
}

// ─── Lowering ───────────────────────────────────────────────────────────

struct LowerCtx<'a> {
    state: &'a PolicyState,
    policy: &'a ModelPolicy,
    /// Table name or alias the current scope's columns belong to.
    table: String,
    auth: &'a Value,
    write_set: Option<&'a Map<String, Value>>,
    /// Subquery nesting level, used to generate unique aliases.
    level: usize,
}

enum BoolSql {
    Const(bool),
    Cond(Condition),
}

enum Scalar<'e> {
    /// Known at rewrite time (literal, or folded auth/future value).
    Val(Value),
    /// Column on the current table scope.
    Col(String),
    /// Field reached through a `one` relation.
    RelCol(&'e str, String),
}

fn const_condition(value: bool) -> Condition {
    if value {
        Condition::all()
    } else {
        Condition::all().add(SqlExpr::value(false))
    }
}

fn col(table: &str, column: &str) -> SqlExpr {
    SqlExpr::col((Alias::new(table), Alias::new(column)))
}

fn json_to_sql(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SqlValue::from(i))
            } else {
                n.as_f64().map(SqlValue::from)
            }
        }
        Value::String(s) => Some(SqlValue::from(s.clone())),
        Value::Bool(b) => Some(SqlValue::from(*b)),
        _ => None,
    }
}

fn lower_bool(expr: &Expr, ctx: &LowerCtx) -> Result<BoolSql, PolicyError> {
    match expr {
        Expr::Literal(LitValue::Bool(b)) => Ok(BoolSql::Const(*b)),
        Expr::Literal(_) => Ok(BoolSql::Const(false)),
        Expr::Path(_) => {
            // A bare path in boolean position tests a bool field.
            match lower_scalar(expr, ctx)? {
                Scalar::Val(v) => Ok(BoolSql::Const(v.as_bool().unwrap_or(false))),
                Scalar::Col(c) => Ok(BoolSql::Cond(
                    Condition::all().add(col(&ctx.table, &c).eq(true)),
                )),
                Scalar::RelCol(rel, c) => {
                    lower_rel_comparison(rel, ctx, |table| Ok(col(table, &c).eq(true)))
                }
            }
        }
        Expr::UnaryNot(inner) => Ok(match lower_bool(inner, ctx)? {
            BoolSql::Const(b) => BoolSql::Const(!b),
            BoolSql::Cond(c) => BoolSql::Cond(c.not()),
        }),
        Expr::BinOp {
            op: BinOp::And,
            left,
            right,
        } => {
            let l = lower_bool(left, ctx)?;
            let r = lower_bool(right, ctx)?;
            Ok(match (l, r) {
                (BoolSql::Const(false), _) | (_, BoolSql::Const(false)) => BoolSql::Const(false),
                (BoolSql::Const(true), other) | (other, BoolSql::Const(true)) => other,
                (BoolSql::Cond(a), BoolSql::Cond(b)) => {
                    BoolSql::Cond(Condition::all().add(a).add(b))
                }
            })
        }
        Expr::BinOp {
            op: BinOp::Or,
            left,
            right,
        } => {
            let l = lower_bool(left, ctx)?;
            let r = lower_bool(right, ctx)?;
            Ok(match (l, r) {
                (BoolSql::Const(true), _) | (_, BoolSql::Const(true)) => BoolSql::Const(true),
                (BoolSql::Const(false), other) | (other, BoolSql::Const(false)) => other,
                (BoolSql::Cond(a), BoolSql::Cond(b)) => {
                    BoolSql::Cond(Condition::any().add(a).add(b))
                }
            })
        }
        Expr::BinOp { op, left, right } => lower_comparison(*op, left, right, ctx),
        Expr::In {
            element,
            collection,
        } => lower_in(element, collection, ctx),
        Expr::Quantifier {
            kind,
            relation,
            predicate,
        } => lower_quantifier(*kind, relation, predicate, ctx),
    }
}

fn lower_comparison(
    op: BinOp,
    left: &Expr,
    right: &Expr,
    ctx: &LowerCtx,
) -> Result<BoolSql, PolicyError> {
    // Reaching into a field of an absent principal is constant false,
    // mirroring the evaluator.
    if ctx.auth.is_null() && (left.references_auth_field() || right.references_auth_field()) {
        return Ok(BoolSql::Const(false));
    }
    let l = lower_scalar(left, ctx)?;
    let r = lower_scalar(right, ctx)?;
    match (l, r) {
        (Scalar::Val(lv), Scalar::Val(rv)) => Ok(BoolSql::Const(compare_values(op, &lv, &rv))),
        (Scalar::Col(c), Scalar::Val(v)) => Ok(lower_col_value(op, &ctx.table, &c, &v)),
        (Scalar::Val(v), Scalar::Col(c)) => {
            Ok(lower_col_value(flip(op), &ctx.table, &c, &v))
        }
        (Scalar::Col(a), Scalar::Col(b)) => {
            let lhs = col(&ctx.table, &a);
            let rhs = col(&ctx.table, &b);
            Ok(BoolSql::Cond(Condition::all().add(apply_op(op, lhs, rhs))))
        }
        (Scalar::RelCol(rel, c), other) | (other, Scalar::RelCol(rel, c)) => {
            // Loader validation guarantees at most one relation path per
            // comparison; `other` is a value or a column on this table.
            // Normalize so the related column is the left operand.
            let op = if is_rel_path(left, ctx) { op } else { flip(op) };
            let outer = ctx.table.clone();
            lower_rel_comparison(rel, ctx, |table| {
                let lhs = col(table, &c);
                match &other {
                    Scalar::Val(v) if v.is_null() => Ok(match op {
                        BinOp::Eq => lhs.is_null(),
                        BinOp::Ne => lhs.is_not_null(),
                        _ => SqlExpr::value(false),
                    }),
                    Scalar::Val(v) => match json_to_sql(v) {
                        Some(sql) => Ok(apply_op(op, lhs, SqlExpr::value(sql))),
                        // Arrays and objects never equal a stored scalar.
                        None => Ok(SqlExpr::value(op == BinOp::Ne)),
                    },
                    Scalar::Col(c2) => Ok(apply_op(op, lhs, col(&outer, c2))),
                    Scalar::RelCol(..) => unreachable!("rejected at load time"),
                }
            })
        }
    }
}

/// Compare a column against a known value; null literals lower to
/// IS [NOT] NULL and ordered comparisons against null are constant false,
/// mirroring the evaluator.
fn lower_col_value(op: BinOp, table: &str, column: &str, value: &Value) -> BoolSql {
    let lhs = col(table, column);
    if value.is_null() {
        return match op {
            BinOp::Eq => BoolSql::Cond(Condition::all().add(lhs.is_null())),
            BinOp::Ne => BoolSql::Cond(Condition::all().add(lhs.is_not_null())),
            _ => BoolSql::Const(false),
        };
    }
    let Some(sql) = json_to_sql(value) else {
        // Arrays and objects never equal a stored scalar.
        return BoolSql::Const(op == BinOp::Ne);
    };
    BoolSql::Cond(Condition::all().add(apply_op(op, lhs, SqlExpr::value(sql))))
}

fn apply_op(op: BinOp, lhs: SqlExpr, rhs: impl Into<SimpleExpr>) -> SimpleExpr {
    match op {
        BinOp::Eq => lhs.eq(rhs),
        BinOp::Ne => lhs.ne(rhs),
        BinOp::Gt => lhs.gt(rhs),
        BinOp::Lt => lhs.lt(rhs),
        BinOp::Ge => lhs.gte(rhs),
        BinOp::Le => lhs.lte(rhs),
        BinOp::And | BinOp::Or => unreachable!("connectives are lowered separately"),
    }
}

/// Mirror a comparison operator for swapped operands.
fn flip(op: BinOp) -> BinOp {
    match op {
        BinOp::Gt => BinOp::Lt,
        BinOp::Lt => BinOp::Gt,
        BinOp::Ge => BinOp::Le,
        BinOp::Le => BinOp::Ge,
        other => other,
    }
}

fn is_rel_path(expr: &Expr, ctx: &LowerCtx) -> bool {
    match expr {
        Expr::Path(segments) => {
            segments.len() > 1
                && segments[0] != AUTH_ROOT
                && segments[0] != FUTURE_ROOT
                && ctx.policy.model.relation(&segments[0]).is_some()
        }
        _ => false,
    }
}

fn lower_in(element: &Expr, collection: &Expr, ctx: &LowerCtx) -> Result<BoolSql, PolicyError> {
    if ctx.auth.is_null()
        && (element.references_auth_field() || collection.references_auth_field())
    {
        return Ok(BoolSql::Const(false));
    }
    let coll = lower_scalar(collection, ctx)?;
    let values = match coll {
        Scalar::Val(Value::Array(items)) => items,
        // Membership in anything but a known array is false.
        _ => return Ok(BoolSql::Const(false)),
    };

    match lower_scalar(element, ctx)? {
        Scalar::Val(v) => Ok(BoolSql::Const(contains_value(&Value::Array(values), &v))),
        Scalar::Col(c) => {
            let sql_values: Vec<SqlValue> = values.iter().filter_map(json_to_sql).collect();
            if sql_values.is_empty() {
                return Ok(BoolSql::Const(false));
            }
            Ok(BoolSql::Cond(
                Condition::all().add(col(&ctx.table, &c).is_in(sql_values)),
            ))
        }
        Scalar::RelCol(rel, c) => {
            let sql_values: Vec<SqlValue> = values.iter().filter_map(json_to_sql).collect();
            if sql_values.is_empty() {
                return Ok(BoolSql::Const(false));
            }
            lower_rel_comparison(rel, ctx, move |table| {
                Ok(col(table, &c).is_in(sql_values.clone()))
            })
        }
    }
}

/// Lower a comparison that crosses a `one` relation into a correlated
/// EXISTS against the target table.
fn lower_rel_comparison(
    rel_name: &str,
    ctx: &LowerCtx,
    build: impl FnOnce(&str) -> Result<SimpleExpr, PolicyError>,
) -> Result<BoolSql, PolicyError> {
    let rel = ctx
        .policy
        .model
        .relation(rel_name)
        .expect("relation validated at load time");
    let target = ctx.state.model(&rel.target)?;
    let alias = format!("rel{}", ctx.level + 1);

    let mut subquery = Query::select();
    subquery
        .expr(SqlExpr::value(1))
        .from_as(Alias::new(&target.model.name), Alias::new(&alias));

    let pk = target.model.primary_key();
    let correlation = col(&alias, &pk.name).equals((Alias::new(&ctx.table), Alias::new(&rel.fk)));
    let inner = build(&alias)?;
    subquery.cond_where(Condition::all().add(correlation).add(inner));

    Ok(BoolSql::Cond(
        Condition::all().add(SqlExpr::exists(subquery)),
    ))
}

fn lower_quantifier(
    kind: Quantifier,
    relation: &str,
    predicate: &Expr,
    ctx: &LowerCtx,
) -> Result<BoolSql, PolicyError> {
    let rel = ctx
        .policy
        .model
        .relation(relation)
        .expect("relation validated at load time");
    debug_assert_eq!(rel.kind, RelationKind::Many);
    let target = ctx.state.model(&rel.target)?;
    let alias = format!("rel{}", ctx.level + 1);

    let sub_ctx = LowerCtx {
        state: ctx.state,
        policy: target,
        table: alias.clone(),
        auth: ctx.auth,
        // The post-state belongs to the row being updated, not to its
        // relations.
        write_set: None,
        level: ctx.level + 1,
    };
    let inner = lower_bool(predicate, &sub_ctx)?;

    let pk = ctx.policy.model.primary_key();
    let correlation =
        col(&alias, &rel.fk).equals((Alias::new(&ctx.table), Alias::new(&pk.name)));

    let exists_with = |extra: Option<Condition>| {
        let mut subquery = Query::select();
        subquery
            .expr(SqlExpr::value(1))
            .from_as(Alias::new(&target.model.name), Alias::new(&alias));
        let mut cond = Condition::all().add(correlation.clone());
        if let Some(extra) = extra {
            cond = cond.add(extra);
        }
        subquery.cond_where(cond);
        Condition::all().add(SqlExpr::exists(subquery))
    };

    match kind {
        Quantifier::Some => Ok(match inner {
            // some(rel, false) can never hold; some(rel, true) needs any row
            BoolSql::Const(false) => BoolSql::Const(false),
            BoolSql::Const(true) => BoolSql::Cond(exists_with(None)),
            BoolSql::Cond(p) => BoolSql::Cond(exists_with(Some(p))),
        }),
        Quantifier::All => Ok(match inner {
            // all(rel, true) holds vacuously; all(rel, false) means no rows
            BoolSql::Const(true) => BoolSql::Const(true),
            BoolSql::Const(false) => BoolSql::Cond(exists_with(None).not()),
            BoolSql::Cond(p) => BoolSql::Cond(exists_with(Some(p.not())).not()),
        }),
    }
}

fn lower_scalar<'e>(expr: &'e Expr, ctx: &LowerCtx) -> Result<Scalar<'e>, PolicyError> {
    match expr {
        Expr::Literal(lit) => Ok(Scalar::Val(match lit {
            LitValue::Int(n) => Value::from(*n),
            LitValue::Float(f) => Value::from(*f),
            LitValue::Str(s) => Value::from(s.clone()),
            LitValue::Bool(b) => Value::from(*b),
            LitValue::Null => Value::Null,
        })),
        Expr::Path(segments) => match segments[0].as_str() {
            AUTH_ROOT => {
                let mut current = ctx.auth;
                for seg in &segments[1..] {
                    current = current.get(seg).unwrap_or(&Value::Null);
                }
                Ok(Scalar::Val(current.clone()))
            }
            FUTURE_ROOT => {
                if segments.len() == 1 {
                    return Ok(Scalar::Val(Value::Null));
                }
                let field = &segments[1];
                match ctx.write_set.and_then(|ws| ws.get(field.as_str())) {
                    Some(v) => Ok(Scalar::Val(v.clone())),
                    // Not in the write set: the post-state equals the
                    // stored column.
                    None => Ok(Scalar::Col(field.clone())),
                }
            }
            head => {
                if segments.len() == 1 {
                    Ok(Scalar::Col(head.to_string()))
                } else {
                    Ok(Scalar::RelCol(head, segments[1].clone()))
                }
            }
        },
        _ => Err(PolicyError::InvalidCondition(
            "comparison operands must be fields, paths, or literals".into(),
        )),
    }
}
