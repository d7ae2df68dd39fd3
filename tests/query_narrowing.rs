//! Read-path and bulk-path semantics: pushed-down policy filters,
//! scope narrowing, existence hiding, field visibility, and relation
//! quantifiers against live data.

mod helpers;

use helpers::db::{guard_from_kdl, guard_with_opts, raw_fetch, seed_row, user};
use palisade::{store, EngineOpts, PolicyError, Principal};
use serde_json::json;

const BLOG: &str = r#"
model "post" {
    fields {
        id "int" pk=true
        author_id "int" nullable=true
        value "int"
        published "bool"
    }
    rule "positive-readable" {
        operations {
            - "read"
        }
        condition "value > 0"
    }
    rule "positive-updates" {
        operations {
            - "update"
        }
        condition "value > 0"
    }
    rule "positive-deletes" {
        operations {
            - "delete"
        }
        condition "value > 0"
    }
}
"#;

#[tokio::test]
async fn test_find_many_never_materializes_denied_rows() {
    let t = guard_from_kdl(BLOG).await;
    seed_row(&t.guard, "post", json!({ "value": 0, "published": false })).await;
    let visible = seed_row(&t.guard, "post", json!({ "value": 5, "published": false })).await;

    let rows = t
        .guard
        .find_many("post", None, &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], visible);

    // the caller's own filter is conjoined, not replaced
    let rows = t
        .guard
        .find_many("post", Some("value > 10"), &Principal::anonymous())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_bulk_update_narrowed_to_permitted_rows() {
    let t = guard_from_kdl(BLOG).await;
    let a = seed_row(&t.guard, "post", json!({ "value": 0, "published": false })).await;
    let b = seed_row(&t.guard, "post", json!({ "value": 5, "published": false })).await;

    // both rows match the (empty) caller filter; only B passes policy
    let affected = t
        .guard
        .update_many(
            "post",
            None,
            json!({ "published": true }),
            &Principal::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let row_a = raw_fetch(&t.guard, "post", a).await.unwrap();
    let row_b = raw_fetch(&t.guard, "post", b).await.unwrap();
    assert_eq!(row_a["published"], false);
    assert_eq!(row_b["published"], true);
}

#[tokio::test]
async fn test_bulk_update_future_fold() {
    let t = guard_from_kdl(
        r#"
model "post" {
    fields {
        id "int" pk=true
        value "int"
    }
    rule "open-updates" {
        operations {
            - "update"
        }
    }
    rule "no-negative-future" effect="deny" {
        operations {
            - "update"
        }
        condition "future.value < 0"
    }
}
"#,
    )
    .await;
    seed_row(&t.guard, "post", json!({ "value": 5 })).await;

    // the written value folds into the deny rule: nothing is permitted
    let affected = t
        .guard
        .update_many(
            "post",
            None,
            json!({ "value": -5 }),
            &Principal::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(affected, 0);

    let affected = t
        .guard
        .update_many("post", None, json!({ "value": 10 }), &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(affected, 1);
}

#[tokio::test]
async fn test_bulk_delete_narrowed() {
    let t = guard_from_kdl(BLOG).await;
    let a = seed_row(&t.guard, "post", json!({ "value": 0, "published": false })).await;
    seed_row(&t.guard, "post", json!({ "value": 5, "published": false })).await;

    let affected = t
        .guard
        .delete_many("post", None, &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(affected, 1);
    // the denied row is untouched
    assert!(raw_fetch(&t.guard, "post", a).await.is_some());
}

#[tokio::test]
async fn test_existence_hiding_on_single_fetch() {
    let t = guard_from_kdl(BLOG).await;
    let hidden = seed_row(&t.guard, "post", json!({ "value": 0, "published": false })).await;

    // a row that exists but fails read rules...
    let denied = t
        .guard
        .find_unique("post", &format!("id == {hidden}"), &Principal::anonymous())
        .await
        .unwrap();
    // ...and a row that does not exist at all produce the same outcome
    let absent = t
        .guard
        .find_unique("post", "id == 424242", &Principal::anonymous())
        .await
        .unwrap();
    assert!(denied.is_none());
    assert!(absent.is_none());
}

#[tokio::test]
async fn test_model_level_default_deny() {
    let kdl = r#"
model "audit_log" {
    fields {
        id "int" pk=true
        entry "string"
    }
}
"#;
    let t = guard_from_kdl(kdl).await;
    let pk = seed_row(&t.guard, "audit_log", json!({ "entry": "boot" })).await;

    // no rules at all: nothing is readable
    let rows = t
        .guard
        .find_many("audit_log", None, &Principal::anonymous())
        .await
        .unwrap();
    assert!(rows.is_empty());
    let one = t
        .guard
        .find_unique("audit_log", &format!("id == {pk}"), &Principal::anonymous())
        .await
        .unwrap();
    assert!(one.is_none());
}

#[tokio::test]
async fn test_field_visibility_and_default_allow() {
    let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
        author_id "int"
        value "int"
        secret "string" nullable=true
    }
    rule "open-reads" {
        operations {
            - "read"
        }
    }
    field "secret" {
        rule "owner-only" effect="deny" {
            operations {
                - "read"
            }
            condition "auth.id != author_id"
        }
    }
}
"#;
    let t = guard_from_kdl(kdl).await;
    let pk = seed_row(
        &t.guard,
        "post",
        json!({ "author_id": 1, "value": 5, "secret": "s3cr3t" }),
    )
    .await;

    // owner sees the governed field
    let row = t
        .guard
        .find_unique("post", &format!("id == {pk}"), &user(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["secret"], "s3cr3t");

    // everyone else gets the row without it; ungoverned fields stay
    // visible (field-level default is allow)
    let row = t
        .guard
        .find_unique("post", &format!("id == {pk}"), &user(2))
        .await
        .unwrap()
        .unwrap();
    assert!(row.get("secret").is_none());
    assert_eq!(row["value"], 5);
}

#[tokio::test]
async fn test_deny_overrides_allow_at_model_level() {
    let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
        value "int"
    }
    rule "everything-readable" {
        operations {
            - "read"
        }
    }
    rule "hide-large" effect="deny" {
        operations {
            - "read"
        }
        condition "value > 3"
    }
}
"#;
    let t = guard_from_kdl(kdl).await;
    let small = seed_row(&t.guard, "post", json!({ "value": 1 })).await;
    let large = seed_row(&t.guard, "post", json!({ "value": 5 })).await;

    let rows = t
        .guard
        .find_many("post", None, &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], small);

    // the same precedence on the single-fetch path
    let one = t
        .guard
        .find_unique("post", &format!("id == {large}"), &Principal::anonymous())
        .await
        .unwrap();
    assert!(one.is_none());
}

#[tokio::test]
async fn test_relational_quantifier_recomputes() {
    let kdl = r#"
model "user" {
    fields {
        id "int" pk=true
        name "string"
    }
    relations {
        posts to="post" kind="many" fk="author_id"
    }
    rule "visible-when-published" {
        operations {
            - "read"
        }
        condition "some(posts, published == true)"
    }
}

model "post" {
    fields {
        id "int" pk=true
        author_id "int"
        published "bool"
    }
}
"#;
    let t = guard_from_kdl(kdl).await;
    let author = seed_row(&t.guard, "user", json!({ "name": "ada" })).await;

    // no related rows: existential quantifier is false
    let rows = t
        .guard
        .find_many("user", None, &Principal::anonymous())
        .await
        .unwrap();
    assert!(rows.is_empty());

    let post = seed_row(
        &t.guard,
        "post",
        json!({ "author_id": author, "published": true }),
    )
    .await;

    // the bulk path (EXISTS) and the single-fetch path (hydration) agree
    let rows = t
        .guard
        .find_many("user", None, &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let one = t
        .guard
        .find_unique("user", &format!("id == {author}"), &Principal::anonymous())
        .await
        .unwrap();
    assert!(one.is_some());

    // and the decision recomputes when the related set changes
    let policy = t.guard.state().model("post").unwrap();
    store::update_rows(
        t.guard.db(),
        &policy.model,
        store::pk_condition(&policy.model, post),
        json!({ "published": false }).as_object().unwrap(),
    )
    .await
    .unwrap();

    let rows = t
        .guard
        .find_many("user", None, &Principal::anonymous())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_one_relation_traversal() {
    let kdl = r#"
model "user" {
    fields {
        id "int" pk=true
        active "bool"
    }
}

model "post" {
    fields {
        id "int" pk=true
        author_id "int"
    }
    relations {
        author to="user" kind="one" fk="author_id"
    }
    rule "active-authors-only" {
        operations {
            - "read"
        }
        condition "author.active == true"
    }
}
"#;
    let t = guard_from_kdl(kdl).await;
    let alive = seed_row(&t.guard, "user", json!({ "active": true })).await;
    let retired = seed_row(&t.guard, "user", json!({ "active": false })).await;
    let p1 = seed_row(&t.guard, "post", json!({ "author_id": alive })).await;
    let p2 = seed_row(&t.guard, "post", json!({ "author_id": retired })).await;

    let rows = t
        .guard
        .find_many("post", None, &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], p1);

    let one = t
        .guard
        .find_unique("post", &format!("id == {p2}"), &Principal::anonymous())
        .await
        .unwrap();
    assert!(one.is_none());
}

#[tokio::test]
async fn test_relation_depth_limit_is_reported() {
    let kdl = r#"
model "user" {
    fields {
        id "int" pk=true
    }
    relations {
        posts to="post" kind="many" fk="author_id"
    }
    rule "needs-posts" {
        operations {
            - "read"
        }
        condition "some(posts, id > 0)"
    }
}

model "post" {
    fields {
        id "int" pk=true
        author_id "int"
    }
}
"#;
    let t = guard_with_opts(
        kdl,
        EngineOpts {
            max_relation_depth: 0,
        },
    )
    .await;
    let pk = seed_row(&t.guard, "user", json!({})).await;

    // the single-fetch path needs hydration, which the limit forbids:
    // a reported error, not a silent denial
    let err = t
        .guard
        .find_unique("user", &format!("id == {pk}"), &Principal::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, PolicyError::RelationDepthExceeded { .. }));
}

#[tokio::test]
async fn test_decisions_are_idempotent() {
    let t = guard_from_kdl(BLOG).await;
    let pk = seed_row(&t.guard, "post", json!({ "value": 5, "published": false })).await;

    let first = t
        .guard
        .find_unique("post", &format!("id == {pk}"), &Principal::anonymous())
        .await
        .unwrap();
    let second = t
        .guard
        .find_unique("post", &format!("id == {pk}"), &Principal::anonymous())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert!(first.is_some());
}
