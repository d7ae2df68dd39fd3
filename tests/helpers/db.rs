use std::sync::Arc;

use palisade::policy::parse::parse_kdl_document;
use palisade::{compile_policies, store, EngineOpts, Guard, Principal};
use sea_orm::Database;
use serde_json::{json, Map, Value};
use tempfile::NamedTempFile;

/// Test guard over a temporary SQLite database with automatic cleanup.
pub struct TestGuard {
    pub guard: Guard,
    _temp_file: NamedTempFile,
}

/// Compile the given policy document, provision its tables in a fresh
/// SQLite database, and wrap everything in a `Guard`.
pub async fn guard_from_kdl(kdl: &str) -> TestGuard {
    guard_with_opts(kdl, EngineOpts::default()).await
}

pub async fn guard_with_opts(kdl: &str, opts: EngineOpts) -> TestGuard {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let db_path = temp_file.path().to_str().expect("Invalid temp file path");
    let db_url = format!("sqlite://{}?mode=rwc", db_path);

    let connection = Database::connect(&db_url)
        .await
        .expect("Failed to connect to test database");

    let parsed = parse_kdl_document(kdl).expect("Failed to parse test policy");
    let state = Arc::new(compile_policies(vec![parsed]).expect("Failed to compile test policy"));
    store::provision(&connection, &state)
        .await
        .expect("Failed to provision tables");

    TestGuard {
        guard: Guard::new(connection, state, opts),
        _temp_file: temp_file,
    }
}

/// Insert a row directly, bypassing policy. Returns the primary key.
pub async fn seed_row(guard: &Guard, model: &str, data: Value) -> i64 {
    let policy = guard.state().model(model).expect("unknown model in seed");
    let map: Map<String, Value> = data
        .as_object()
        .expect("seed data must be an object")
        .clone();
    store::insert_row(guard.db(), &policy.model, &map)
        .await
        .expect("Failed to seed row")
}

/// Fetch a row directly by primary key, bypassing policy.
pub async fn raw_fetch(guard: &Guard, model: &str, pk: i64) -> Option<Value> {
    let policy = guard.state().model(model).expect("unknown model in fetch");
    store::fetch_one(
        guard.db(),
        &policy.model,
        store::pk_condition(&policy.model, pk),
    )
    .await
    .expect("Failed to fetch row")
}

/// Fetch all rows of a model, bypassing policy.
pub async fn raw_all(guard: &Guard, model: &str) -> Vec<Value> {
    let policy = guard.state().model(model).expect("unknown model in fetch");
    store::fetch_rows(
        guard.db(),
        &policy.model,
        sea_orm::sea_query::Condition::all(),
    )
    .await
    .expect("Failed to fetch rows")
}

/// Count all rows of a model, bypassing policy.
pub async fn raw_count(guard: &Guard, model: &str) -> usize {
    let policy = guard.state().model(model).expect("unknown model in count");
    store::fetch_rows(
        guard.db(),
        &policy.model,
        sea_orm::sea_query::Condition::all(),
    )
    .await
    .expect("Failed to fetch rows")
    .len()
}

/// A signed-in principal with the given id.
pub fn user(id: i64) -> Principal {
    Principal::from_value(json!({ "id": id }))
}
