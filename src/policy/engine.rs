//! The policy decision engine.
//!
//! Model-level decisions: any matching deny rule wins, then any matching
//! allow rule, then deny by default. Field-level decisions: any matching
//! deny rule wins, an unmatched non-empty allow set denies, and no rules
//! at all allows — the asymmetric default is intentional.
//!
//! Before a candidate is evaluated, the relations its rule set references
//! are hydrated into the row through the current connection, so decisions
//! inside a transaction observe that transaction's own writes and nothing
//! of concurrent ones. Traversal depth is bounded by configuration;
//! exceeding the bound is a reported error, not a silent denial.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use sea_orm::sea_query::{Alias, Condition, Expr as SqlExpr};
use sea_orm::ConnectionTrait;
use serde_json::{Map, Value};

use crate::errors::PolicyError;
use crate::policy::eval::{evaluate, EvalScope};
use crate::policy::expr::{Expr, AUTH_ROOT, FUTURE_ROOT};
use crate::policy::types::{Effect, ModelPolicy, Operation, PolicyState, Principal, Rule};
use crate::schema::RelationKind;
use crate::store;

/// Default relation traversal bound, overridable in settings.
pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct EngineOpts {
    pub max_relation_depth: usize,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            max_relation_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Decide a model-level operation for one candidate row.
pub async fn model_decision<C: ConnectionTrait>(
    conn: &C,
    state: &PolicyState,
    policy: &ModelPolicy,
    op: Operation,
    candidate: &Value,
    future: Option<&Value>,
    principal: &Principal,
    opts: EngineOpts,
) -> Result<bool, PolicyError> {
    let rules: Vec<&Rule> = policy.rules_for(op).collect();
    if rules.is_empty() {
        // Default-closed at the model level.
        return Ok(false);
    }

    let mut row = candidate.clone();
    let exprs: Vec<&Expr> = rules.iter().map(|r| &r.predicate).collect();
    hydrate_row(conn, state, policy, &mut row, exprs, 0, opts).await?;

    let scope = EvalScope {
        row: &row,
        auth: principal.as_value(),
        future,
    };

    for rule in rules.iter().filter(|r| r.effect == Effect::Deny) {
        if evaluate(&rule.predicate, &scope) {
            tracing::debug!(
                model = %policy.model.name,
                operation = %op,
                rule = %rule.name,
                "deny rule matched"
            );
            return Ok(false);
        }
    }
    for rule in rules.iter().filter(|r| r.effect == Effect::Allow) {
        if evaluate(&rule.predicate, &scope) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Field-level decision given an already-hydrated scope: deny wins, an
/// unmatched allow set denies, no rules allows.
pub fn field_decision(rules: &[&Rule], scope: &EvalScope) -> bool {
    for rule in rules.iter().filter(|r| r.effect == Effect::Deny) {
        if evaluate(&rule.predicate, scope) {
            return false;
        }
    }
    let allows: Vec<_> = rules.iter().filter(|r| r.effect == Effect::Allow).collect();
    if allows.is_empty() {
        return true;
    }
    allows.iter().any(|r| evaluate(&r.predicate, scope))
}

/// Apply field-level read visibility to a fetched row: fields denied by
/// their read rules are removed from the returned object.
pub async fn visible_row<C: ConnectionTrait>(
    conn: &C,
    state: &PolicyState,
    policy: &ModelPolicy,
    row: &Value,
    principal: &Principal,
    opts: EngineOpts,
) -> Result<Value, PolicyError> {
    let governed: Vec<(&String, Vec<&Rule>)> = policy
        .field_rules
        .keys()
        .map(|field| (field, policy.field_rules_for(field, Operation::Read)))
        .filter(|(_, rules)| !rules.is_empty())
        .collect();
    if governed.is_empty() {
        return Ok(row.clone());
    }

    let mut hydrated = row.clone();
    let exprs: Vec<&Expr> = governed
        .iter()
        .flat_map(|(_, rules)| rules.iter().map(|r| &r.predicate))
        .collect();
    hydrate_row(conn, state, policy, &mut hydrated, exprs, 0, opts).await?;

    let scope = EvalScope {
        row: &hydrated,
        auth: principal.as_value(),
        future: None,
    };

    let mut out = match row {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (field, rules) in governed {
        if !field_decision(&rules, &scope) {
            out.remove(field.as_str());
        }
    }
    Ok(Value::Object(out))
}

/// Field-level update check: rules for a field participate only when the
/// field is present in the attempted write set. Returns the name of the
/// first denied field, if any.
pub async fn denied_update_field<C: ConnectionTrait>(
    conn: &C,
    state: &PolicyState,
    policy: &ModelPolicy,
    pre: &Value,
    future: &Value,
    write_set: &Map<String, Value>,
    principal: &Principal,
    opts: EngineOpts,
) -> Result<Option<String>, PolicyError> {
    let active: Vec<(&str, Vec<&Rule>)> = write_set
        .keys()
        .map(|field| (field.as_str(), policy.field_rules_for(field, Operation::Update)))
        .filter(|(_, rules)| !rules.is_empty())
        .collect();
    if active.is_empty() {
        return Ok(None);
    }

    let mut hydrated = pre.clone();
    let exprs: Vec<&Expr> = active
        .iter()
        .flat_map(|(_, rules)| rules.iter().map(|r| &r.predicate))
        .collect();
    hydrate_row(conn, state, policy, &mut hydrated, exprs, 0, opts).await?;

    let scope = EvalScope {
        row: &hydrated,
        auth: principal.as_value(),
        future: Some(future),
    };

    for (field, rules) in active {
        if !field_decision(&rules, &scope) {
            return Ok(Some(field.to_string()));
        }
    }
    Ok(None)
}

/// Fetch every relation the given predicates reference into the row,
/// recursively for nested quantifiers, bounded by `max_relation_depth`.
pub fn hydrate_row<'a, C: ConnectionTrait>(
    conn: &'a C,
    state: &'a PolicyState,
    policy: &'a ModelPolicy,
    row: &'a mut Value,
    exprs: Vec<&'a Expr>,
    depth: usize,
    opts: EngineOpts,
) -> Pin<Box<dyn Future<Output = Result<(), PolicyError>> + Send + 'a>> {
    Box::pin(async move {
        let mut needs: HashMap<&str, Vec<&Expr>> = HashMap::new();
        for expr in exprs.iter().copied() {
            collect_relation_needs(expr, policy, &mut needs);
        }
        if needs.is_empty() {
            return Ok(());
        }
        if depth >= opts.max_relation_depth {
            return Err(PolicyError::RelationDepthExceeded {
                model: policy.model.name.clone(),
                limit: opts.max_relation_depth,
            });
        }

        for (rel_name, sub_exprs) in needs {
            let rel = policy
                .model
                .relation(rel_name)
                .expect("relation validated at load time");
            let target = state.model(&rel.target)?;

            let condition = match rel.kind {
                RelationKind::Many => {
                    let pk = store::row_pk(&policy.model, row)?;
                    Condition::all().add(
                        SqlExpr::col((Alias::new(&target.model.name), Alias::new(&rel.fk)))
                            .eq(pk),
                    )
                }
                RelationKind::One => {
                    let fk = row.get(&rel.fk).and_then(Value::as_i64);
                    let Some(fk) = fk else {
                        // Unset reference: hydrate as the null sentinel.
                        row[rel_name] = Value::Null;
                        continue;
                    };
                    store::pk_condition(&target.model, fk)
                }
            };

            let mut related = store::fetch_rows(conn, &target.model, condition).await?;
            for child in &mut related {
                hydrate_row(conn, state, target, child, sub_exprs.clone(), depth + 1, opts)
                    .await?;
            }

            row[rel_name] = match rel.kind {
                RelationKind::Many => Value::Array(related),
                RelationKind::One => related.into_iter().next().unwrap_or(Value::Null),
            };
        }
        Ok(())
    })
}

/// Which relations do these predicates touch, and with which sub-predicates.
fn collect_relation_needs<'e>(
    expr: &'e Expr,
    policy: &ModelPolicy,
    needs: &mut HashMap<&'e str, Vec<&'e Expr>>,
) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(segments) => {
            let head = segments[0].as_str();
            if head == AUTH_ROOT || head == FUTURE_ROOT {
                return;
            }
            if segments.len() > 1 && policy.model.relation(head).is_some() {
                needs.entry(head).or_default();
            }
        }
        Expr::UnaryNot(inner) => collect_relation_needs(inner, policy, needs),
        Expr::BinOp { left, right, .. } => {
            collect_relation_needs(left, policy, needs);
            collect_relation_needs(right, policy, needs);
        }
        Expr::In {
            element,
            collection,
        } => {
            collect_relation_needs(element, policy, needs);
            collect_relation_needs(collection, policy, needs);
        }
        Expr::Quantifier {
            relation,
            predicate,
            ..
        } => {
            needs.entry(relation.as_str()).or_default().push(predicate);
        }
    }
}
