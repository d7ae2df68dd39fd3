//! The enforced CRUD surface.
//!
//! Every mutating call wraps the entire logical operation — nested
//! creates included — in one transaction: pre-checks run in write order
//! against the transaction's own view, the first violation rolls
//! everything back, and a read-back check on the primary row decides
//! whether the (committed) result may be returned. Dropping a call's
//! future before commit rolls the transaction back; partial application
//! of nested writes is never visible.
//!
//! Reads go through the query rewriter so bulk fetches never materialize
//! disallowed rows; single-row fetches post-check the candidate and
//! collapse denial into absence.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sea_orm::sea_query::Condition;
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};
use serde_json::{Map, Value};

use crate::errors::PolicyError;
use crate::policy::engine::{self, EngineOpts};
use crate::policy::types::{ModelPolicy, Operation, PolicyState, Principal};
use crate::rewrite;
use crate::schema::RelationKind;
use crate::settings::Settings;
use crate::store;

pub struct Guard {
    db: DatabaseConnection,
    state: Arc<PolicyState>,
    opts: EngineOpts,
}

impl Guard {
    pub fn new(db: DatabaseConnection, state: Arc<PolicyState>, opts: EngineOpts) -> Self {
        Self { db, state, opts }
    }

    /// Wire up a guard from settings: connect, load the policy documents,
    /// and provision the model tables.
    pub async fn connect(settings: &Settings) -> Result<Self, PolicyError> {
        let db = store::init(&settings.database).await?;
        let state = Arc::new(crate::policy::loader::load_policies(&settings.policy.dir)?);
        store::provision(&db, &state).await?;
        Ok(Self::new(
            db,
            state,
            EngineOpts {
                max_relation_depth: settings.engine.max_relation_depth,
            },
        ))
    }

    pub fn state(&self) -> &PolicyState {
        &self.state
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Fetch all rows the principal may read, narrowed by an optional
    /// filter expression. The policy filter is pushed into the query.
    pub async fn find_many(
        &self,
        model: &str,
        filter: Option<&str>,
        principal: &Principal,
    ) -> Result<Vec<Value>, PolicyError> {
        let policy = self.state.model(model)?;
        let base = self.base_filter(policy, filter, principal)?;
        let cond = rewrite::rewrite(
            &self.state,
            policy,
            Operation::Read,
            principal,
            base,
            None,
        )?;

        let rows = store::fetch_rows(&self.db, &policy.model, cond).await?;
        let mut visible = Vec::with_capacity(rows.len());
        for row in &rows {
            visible.push(
                engine::visible_row(&self.db, &self.state, policy, row, principal, self.opts)
                    .await?,
            );
        }
        Ok(visible)
    }

    /// Fetch a single row by filter. A row that exists but fails its read
    /// rules is indistinguishable from an absent one.
    pub async fn find_unique(
        &self,
        model: &str,
        filter: &str,
        principal: &Principal,
    ) -> Result<Option<Value>, PolicyError> {
        let policy = self.state.model(model)?;
        let base = self.base_filter(policy, Some(filter), principal)?;

        // Fetch ignoring policy, then decide on the candidate.
        let Some(row) = store::fetch_one(&self.db, &policy.model, base).await? else {
            return Ok(None);
        };
        let readable = engine::model_decision(
            &self.db,
            &self.state,
            policy,
            Operation::Read,
            &row,
            None,
            principal,
            self.opts,
        )
        .await?;
        if !readable {
            tracing::debug!(model, "single fetch denied; reporting absence");
            return Ok(None);
        }
        let row =
            engine::visible_row(&self.db, &self.state, policy, &row, principal, self.opts).await?;
        Ok(Some(row))
    }

    /// Create a row (with any nested one-to-many creates) under policy.
    pub async fn create(
        &self,
        model: &str,
        data: Value,
        principal: &Principal,
    ) -> Result<Value, PolicyError> {
        let policy = self.state.model(model)?;
        let data = into_object(model, data)?;

        let txn = self.db.begin().await?;
        let pk = match create_in(&txn, &self.state, policy, data, principal, self.opts).await {
            Ok(pk) => pk,
            Err(err) => {
                txn.rollback().await?;
                return Err(err);
            }
        };

        let row = store::fetch_one(&txn, &policy.model, store::pk_condition(&policy.model, pk))
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                model: model.to_string(),
            })?;
        self.finish_mutation(txn, policy, Operation::Create, row, principal)
            .await
    }

    /// Update a single targeted row. Never silently narrowed: a target
    /// failing its update rules is rejected outright.
    pub async fn update(
        &self,
        model: &str,
        filter: &str,
        data: Value,
        principal: &Principal,
    ) -> Result<Value, PolicyError> {
        let policy = self.state.model(model)?;
        let write_set = self.validate_write_set(policy, data)?;

        let txn = self.db.begin().await?;
        let base = self.base_filter(policy, Some(filter), principal)?;
        let Some(pre) = store::fetch_one(&txn, &policy.model, base).await? else {
            txn.rollback().await?;
            return Err(PolicyError::NotFound {
                model: model.to_string(),
            });
        };

        // Post-state projection: the stored row with the write set applied.
        let mut merged = pre.as_object().cloned().unwrap_or_default();
        for (k, v) in &write_set {
            merged.insert(k.clone(), v.clone());
        }
        let future = Value::Object(merged);

        let allowed = engine::model_decision(
            &txn,
            &self.state,
            policy,
            Operation::Update,
            &pre,
            Some(&future),
            principal,
            self.opts,
        )
        .await?;
        if !allowed {
            txn.rollback().await?;
            return Err(PolicyError::PolicyViolation {
                model: model.to_string(),
                operation: Operation::Update,
            });
        }

        if let Some(field) = engine::denied_update_field(
            &txn,
            &self.state,
            policy,
            &pre,
            &future,
            &write_set,
            principal,
            self.opts,
        )
        .await?
        {
            tracing::debug!(model, field = %field, "field-level update rule denied write");
            txn.rollback().await?;
            return Err(PolicyError::PolicyViolation {
                model: model.to_string(),
                operation: Operation::Update,
            });
        }

        let pk = store::row_pk(&policy.model, &pre)?;
        store::update_rows(
            &txn,
            &policy.model,
            store::pk_condition(&policy.model, pk),
            &write_set,
        )
        .await?;

        let post = store::fetch_one(&txn, &policy.model, store::pk_condition(&policy.model, pk))
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                model: model.to_string(),
            })?;
        self.finish_mutation(txn, policy, Operation::Update, post, principal)
            .await
    }

    /// Bulk update: the caller's filter is narrowed by the update-rule
    /// filter before execution, so the affected count reflects only
    /// policy-permitted rows — legitimately zero even when the caller's
    /// own filter matches.
    pub async fn update_many(
        &self,
        model: &str,
        filter: Option<&str>,
        data: Value,
        principal: &Principal,
    ) -> Result<u64, PolicyError> {
        let policy = self.state.model(model)?;
        let write_set = self.validate_write_set(policy, data)?;

        let base = self.base_filter(policy, filter, principal)?;
        let cond = rewrite::rewrite(
            &self.state,
            policy,
            Operation::Update,
            principal,
            base,
            Some(&write_set),
        )?;

        let affected = store::update_rows(&self.db, &policy.model, cond, &write_set).await?;
        tracing::debug!(model, affected, "bulk update executed");
        Ok(affected)
    }

    /// Delete a single targeted row; rejected outright on rule failure.
    pub async fn delete(
        &self,
        model: &str,
        filter: &str,
        principal: &Principal,
    ) -> Result<Value, PolicyError> {
        let policy = self.state.model(model)?;

        let txn = self.db.begin().await?;
        let base = self.base_filter(policy, Some(filter), principal)?;
        let Some(pre) = store::fetch_one(&txn, &policy.model, base).await? else {
            txn.rollback().await?;
            return Err(PolicyError::NotFound {
                model: model.to_string(),
            });
        };

        let allowed = engine::model_decision(
            &txn,
            &self.state,
            policy,
            Operation::Delete,
            &pre,
            None,
            principal,
            self.opts,
        )
        .await?;
        if !allowed {
            txn.rollback().await?;
            return Err(PolicyError::PolicyViolation {
                model: model.to_string(),
                operation: Operation::Delete,
            });
        }

        let pk = store::row_pk(&policy.model, &pre)?;
        store::delete_rows(&txn, &policy.model, store::pk_condition(&policy.model, pk)).await?;

        // The "resulting row" of a delete is the pre-delete row.
        self.finish_mutation(txn, policy, Operation::Delete, pre, principal)
            .await
    }

    /// Bulk delete, narrowed like `update_many`.
    pub async fn delete_many(
        &self,
        model: &str,
        filter: Option<&str>,
        principal: &Principal,
    ) -> Result<u64, PolicyError> {
        let policy = self.state.model(model)?;
        let base = self.base_filter(policy, filter, principal)?;
        let cond = rewrite::rewrite(
            &self.state,
            policy,
            Operation::Delete,
            principal,
            base,
            None,
        )?;

        let affected = store::delete_rows(&self.db, &policy.model, cond).await?;
        tracing::debug!(model, affected, "bulk delete executed");
        Ok(affected)
    }

    /// Shared tail of every single-row mutation: evaluate the read-back
    /// decision inside the transaction, commit either way (the data
    /// change is real), and either return the visible row or report the
    /// committed-but-unreadable condition.
    async fn finish_mutation(
        &self,
        txn: sea_orm::DatabaseTransaction,
        policy: &ModelPolicy,
        op: Operation,
        row: Value,
        principal: &Principal,
    ) -> Result<Value, PolicyError> {
        let readable = engine::model_decision(
            &txn,
            &self.state,
            policy,
            Operation::Read,
            &row,
            None,
            principal,
            self.opts,
        )
        .await?;
        txn.commit().await?;

        if !readable {
            tracing::debug!(
                model = %policy.model.name,
                operation = %op,
                "mutation committed but result fails read rules"
            );
            return Err(PolicyError::ReadBackViolation {
                model: policy.model.name.clone(),
                operation: op,
            });
        }
        engine::visible_row(&self.db, &self.state, policy, &row, principal, self.opts).await
    }

    fn base_filter(
        &self,
        policy: &ModelPolicy,
        filter: Option<&str>,
        principal: &Principal,
    ) -> Result<Condition, PolicyError> {
        match filter {
            Some(src) => rewrite::compile_filter(&self.state, policy, src, principal),
            None => Ok(Condition::all()),
        }
    }

    /// An update write set may only touch declared non-key fields.
    fn validate_write_set(
        &self,
        policy: &ModelPolicy,
        data: Value,
    ) -> Result<Map<String, Value>, PolicyError> {
        let write_set = into_object(&policy.model.name, data)?;
        for key in write_set.keys() {
            match policy.model.field(key) {
                Some(f) if f.primary_key => {
                    return Err(PolicyError::InvalidPolicy(format!(
                        "primary key `{key}` of model `{}` cannot be updated",
                        policy.model.name
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(PolicyError::UnknownField {
                        model: policy.model.name.clone(),
                        field: key.clone(),
                    });
                }
            }
        }
        Ok(write_set)
    }
}

/// Insert one row and its nested one-to-many children, checking create
/// rules per entity in write order. Any violation aborts the whole
/// enclosing transaction via the returned error.
fn create_in<'a, C: ConnectionTrait>(
    conn: &'a C,
    state: &'a PolicyState,
    policy: &'a ModelPolicy,
    data: Map<String, Value>,
    principal: &'a Principal,
    opts: EngineOpts,
) -> Pin<Box<dyn Future<Output = Result<i64, PolicyError>> + Send + 'a>> {
    Box::pin(async move {
        let mut scalars = Map::new();
        let mut nested: Vec<(&crate::schema::RelationDef, Vec<Map<String, Value>>)> = Vec::new();

        for (key, value) in data {
            if policy.model.field(&key).is_some() {
                scalars.insert(key, value);
                continue;
            }
            match policy.model.relation(&key) {
                Some(rel) if rel.kind == RelationKind::Many => {
                    let Value::Array(items) = value else {
                        return Err(PolicyError::InvalidValue {
                            model: policy.model.name.clone(),
                            field: key,
                        });
                    };
                    let mut children = Vec::with_capacity(items.len());
                    for item in items {
                        children.push(into_object(&rel.target, item)?);
                    }
                    nested.push((rel, children));
                }
                Some(_) => {
                    return Err(PolicyError::InvalidPolicy(format!(
                        "nested create through reference relation `{key}` is not supported; set the foreign key instead"
                    )));
                }
                None => {
                    return Err(PolicyError::UnknownField {
                        model: policy.model.name.clone(),
                        field: key,
                    });
                }
            }
        }

        let pk = store::insert_row(conn, &policy.model, &scalars).await?;

        // The candidate for create rules is the stored post-create shape,
        // observed through this transaction.
        let row = store::fetch_one(conn, &policy.model, store::pk_condition(&policy.model, pk))
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                model: policy.model.name.clone(),
            })?;
        let allowed = engine::model_decision(
            conn,
            state,
            policy,
            Operation::Create,
            &row,
            None,
            principal,
            opts,
        )
        .await?;
        if !allowed {
            return Err(PolicyError::PolicyViolation {
                model: policy.model.name.clone(),
                operation: Operation::Create,
            });
        }

        for (rel, children) in nested {
            let target = state.model(&rel.target)?;
            for mut child in children {
                child.insert(rel.fk.clone(), Value::from(pk));
                create_in(conn, state, target, child, principal, opts).await?;
            }
        }

        Ok(pk)
    })
}

fn into_object(model: &str, data: Value) -> Result<Map<String, Value>, PolicyError> {
    match data {
        Value::Object(map) => Ok(map),
        _ => Err(PolicyError::InvalidValue {
            model: model.to_string(),
            field: "(row)".to_string(),
        }),
    }
}
