//! Policy-blind data access: schema provisioning and raw CRUD against the
//! transactional substrate.
//!
//! Tables are provisioned from the loaded model definitions at startup;
//! statements are built dynamically with sea-query and executed through
//! any sea-orm connection, so the same functions run inside or outside a
//! transaction. Nothing in this module consults policy — enforcement is
//! the guard's job.

use chrono::Utc;
use sea_orm::sea_query::{
    Alias, Asterisk, ColumnDef, Condition, Expr, Query, SimpleExpr, Table, Value as SqlValue,
};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, QueryResult};
use serde_json::{Map, Value};

use crate::errors::PolicyError;
use crate::policy::types::PolicyState;
use crate::schema::{FieldDef, FieldType, ModelDef};
use crate::settings::Database as DbCfg;

/// Row-creation timestamp column, stamped on every insert unless the
/// model declares its own `created_at` field.
const STAMP_COL: &str = "created_at";

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, PolicyError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Create one table per model (if not present already).
pub async fn provision<C: ConnectionTrait>(
    conn: &C,
    state: &PolicyState,
) -> Result<(), PolicyError> {
    for policy in state.models.values() {
        let model = &policy.model;
        let mut stmt = Table::create();
        stmt.table(Alias::new(&model.name)).if_not_exists();

        for field in &model.fields {
            let mut col = ColumnDef::new(Alias::new(&field.name));
            match field.ty {
                FieldType::Int => col.big_integer(),
                FieldType::Float => col.double(),
                FieldType::String => col.string(),
                FieldType::Bool => col.boolean(),
            };
            if field.primary_key {
                col.not_null().auto_increment().primary_key();
            } else if !field.nullable {
                col.not_null();
            }
            stmt.col(&mut col);
        }
        if model.field(STAMP_COL).is_none() {
            stmt.col(ColumnDef::new(Alias::new(STAMP_COL)).big_integer().not_null());
        }

        conn.execute(conn.get_database_backend().build(&stmt)).await?;
    }

    tracing::info!(tables = state.models.len(), "Provisioned model tables");
    Ok(())
}

/// Insert a row and return its primary key. `data` keys must be declared
/// fields; relation keys are the caller's business and must be stripped
/// beforehand.
pub async fn insert_row<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    data: &Map<String, Value>,
) -> Result<i64, PolicyError> {
    for key in data.keys() {
        if model.field(key).is_none() {
            return Err(PolicyError::UnknownField {
                model: model.name.clone(),
                field: key.clone(),
            });
        }
    }

    let mut columns = Vec::new();
    let mut values: Vec<SimpleExpr> = Vec::new();
    for field in &model.fields {
        if let Some(value) = data.get(&field.name) {
            columns.push(Alias::new(&field.name));
            values.push(Expr::value(json_to_db(model, field, value)?));
        }
    }
    if model.field(STAMP_COL).is_none() {
        columns.push(Alias::new(STAMP_COL));
        values.push(Expr::value(Utc::now().timestamp()));
    }

    let mut stmt = Query::insert();
    stmt.into_table(Alias::new(&model.name))
        .columns(columns)
        .values_panic(values);

    let result = conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(result.last_insert_id() as i64)
}

/// Fetch all rows matching the condition, decoded as JSON objects.
pub async fn fetch_rows<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    condition: Condition,
) -> Result<Vec<Value>, PolicyError> {
    let mut stmt = Query::select();
    stmt.column(Asterisk)
        .from(Alias::new(&model.name))
        .cond_where(condition);

    let rows = conn
        .query_all(conn.get_database_backend().build(&stmt))
        .await?;
    rows.iter().map(|row| decode_row(model, row)).collect()
}

/// Fetch a single row matching the condition, if any.
pub async fn fetch_one<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    condition: Condition,
) -> Result<Option<Value>, PolicyError> {
    let mut stmt = Query::select();
    stmt.column(Asterisk)
        .from(Alias::new(&model.name))
        .cond_where(condition)
        .limit(1);

    let row = conn
        .query_one(conn.get_database_backend().build(&stmt))
        .await?;
    row.as_ref().map(|r| decode_row(model, r)).transpose()
}

/// Update matching rows with the given write set; returns the affected count.
pub async fn update_rows<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    condition: Condition,
    data: &Map<String, Value>,
) -> Result<u64, PolicyError> {
    let mut stmt = Query::update();
    stmt.table(Alias::new(&model.name)).cond_where(condition);
    for field in &model.fields {
        if let Some(value) = data.get(&field.name) {
            stmt.value(
                Alias::new(&field.name),
                Expr::value(json_to_db(model, field, value)?),
            );
        }
    }

    let result = conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(result.rows_affected())
}

/// Delete matching rows; returns the affected count.
pub async fn delete_rows<C: ConnectionTrait>(
    conn: &C,
    model: &ModelDef,
    condition: Condition,
) -> Result<u64, PolicyError> {
    let mut stmt = Query::delete();
    stmt.from_table(Alias::new(&model.name)).cond_where(condition);

    let result = conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(result.rows_affected())
}

/// Condition selecting a single row by primary key, with table-qualified
/// column references (safe inside correlated subqueries too).
pub fn pk_condition(model: &ModelDef, id: i64) -> Condition {
    let pk = model.primary_key();
    Condition::all().add(Expr::col((Alias::new(&model.name), Alias::new(&pk.name))).eq(id))
}

/// Extract a row's primary key value.
pub fn row_pk(model: &ModelDef, row: &Value) -> Result<i64, PolicyError> {
    let pk = model.primary_key();
    row.get(&pk.name)
        .and_then(Value::as_i64)
        .ok_or_else(|| PolicyError::InvalidValue {
            model: model.name.clone(),
            field: pk.name.clone(),
        })
}

fn decode_row(model: &ModelDef, row: &QueryResult) -> Result<Value, PolicyError> {
    let mut obj = Map::new();
    for field in &model.fields {
        let value = match field.ty {
            FieldType::Int => row
                .try_get::<Option<i64>>("", &field.name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            FieldType::Float => row
                .try_get::<Option<f64>>("", &field.name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            FieldType::String => row
                .try_get::<Option<String>>("", &field.name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            FieldType::Bool => row
                .try_get::<Option<bool>>("", &field.name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
        };
        obj.insert(field.name.clone(), value);
    }
    Ok(Value::Object(obj))
}

/// Convert a JSON value to a typed database value for the given field.
pub fn json_to_db(
    model: &ModelDef,
    field: &FieldDef,
    value: &Value,
) -> Result<SqlValue, PolicyError> {
    let mismatch = || PolicyError::InvalidValue {
        model: model.name.clone(),
        field: field.name.clone(),
    };

    if value.is_null() {
        if !field.nullable {
            return Err(mismatch());
        }
        return Ok(match field.ty {
            FieldType::Int => SqlValue::BigInt(None),
            FieldType::Float => SqlValue::Double(None),
            FieldType::String => SqlValue::String(None),
            FieldType::Bool => SqlValue::Bool(None),
        });
    }

    match field.ty {
        FieldType::Int => value.as_i64().map(SqlValue::from).ok_or_else(mismatch),
        FieldType::Float => value.as_f64().map(SqlValue::from).ok_or_else(mismatch),
        FieldType::String => value
            .as_str()
            .map(|s| SqlValue::from(s.to_string()))
            .ok_or_else(mismatch),
        FieldType::Bool => value.as_bool().map(SqlValue::from).ok_or_else(mismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;

    fn int_field(name: &str, nullable: bool) -> FieldDef {
        FieldDef {
            name: name.into(),
            ty: FieldType::Int,
            nullable,
            primary_key: false,
        }
    }

    fn model() -> ModelDef {
        ModelDef {
            name: "post".into(),
            fields: vec![
                FieldDef {
                    name: "id".into(),
                    ty: FieldType::Int,
                    nullable: false,
                    primary_key: true,
                },
                int_field("value", false),
                int_field("score", true),
            ],
            relations: vec![],
        }
    }

    #[test]
    fn test_json_to_db_type_checks() {
        let m = model();
        let value = m.field("value").unwrap();
        assert!(json_to_db(&m, value, &Value::from(5)).is_ok());
        assert!(json_to_db(&m, value, &Value::from("five")).is_err());
        // null only for nullable fields
        assert!(json_to_db(&m, value, &Value::Null).is_err());
        assert!(json_to_db(&m, m.field("score").unwrap(), &Value::Null).is_ok());
    }

    #[test]
    fn test_row_pk() {
        let m = model();
        let row = serde_json::json!({ "id": 42, "value": 1 });
        assert_eq!(row_pk(&m, &row).unwrap(), 42);
        let bad = serde_json::json!({ "value": 1 });
        assert!(row_pk(&m, &bad).is_err());
    }
}
