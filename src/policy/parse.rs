//! KDL policy-document parsing.
//!
//! A policy document declares entity models (fields, relations), their
//! allow/deny rules, and the designated auth model:
//!
//! ```kdl
//! model "post" {
//!     fields {
//!         id "int" pk=true
//!         title "string" nullable=true
//!         value "int"
//!         author_id "int"
//!     }
//!     relations {
//!         author to="user" kind="one" fk="author_id"
//!         comments to="comment" kind="many" fk="post_id"
//!     }
//!     rule "owner-writes" effect="allow" {
//!         operations {
//!             - "update"
//!             - "delete"
//!         }
//!         condition "auth.id == author_id"
//!     }
//!     field "title" {
//!         rule "drafts-hidden" effect="deny" {
//!             operations {
//!                 - "read"
//!             }
//!             condition "published == false && auth.id != author_id"
//!         }
//!     }
//! }
//!
//! auth-model "user"
//! ```

use kdl::{KdlDocument, KdlNode};

use crate::errors::PolicyError;
use crate::policy::types::{ParsedModel, ParsedPolicy, ParsedRule};
use crate::schema::{FieldDef, FieldType, RelationDef, RelationKind};

/// Parse a KDL document string into typed policy structs.
pub fn parse_kdl_document(source: &str) -> Result<ParsedPolicy, PolicyError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| PolicyError::KdlParse(e.to_string()))?;

    let mut policy = ParsedPolicy::default();

    for node in doc.nodes() {
        match node.name().value() {
            "model" => {
                policy.models.push(parse_model(node)?);
            }
            "auth-model" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    PolicyError::InvalidPolicy(
                        "auth-model node requires a string argument (e.g. auth-model \"user\")"
                            .into(),
                    )
                })?;
                if let Some(prev) = policy.auth_model.replace(name) {
                    return Err(PolicyError::InvalidPolicy(format!(
                        "auth-model declared more than once (was `{prev}`)"
                    )));
                }
            }
            other => {
                // Ignore comments and unknown top-level nodes with a warning
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

fn parse_model(node: &KdlNode) -> Result<ParsedModel, PolicyError> {
    let name = first_string_arg(node).ok_or_else(|| {
        PolicyError::InvalidPolicy(
            "model node requires a string argument (e.g. model \"post\")".into(),
        )
    })?;

    let mut model = ParsedModel {
        name: name.clone(),
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "fields" => {
                    model.fields = parse_fields(child, &name)?;
                }
                "relations" => {
                    model.relations = parse_relations(child, &name)?;
                }
                "rule" => {
                    model.rules.push(parse_rule(child)?);
                }
                "field" => {
                    let field_name = first_string_arg(child).ok_or_else(|| {
                        PolicyError::InvalidPolicy(format!(
                            "field block in model `{name}` requires a string argument (e.g. field \"title\")"
                        ))
                    })?;
                    let Some(grandchildren) = child.children() else {
                        continue;
                    };
                    for rule_node in grandchildren.nodes() {
                        if rule_node.name().value() != "rule" {
                            return Err(PolicyError::InvalidPolicy(format!(
                                "unexpected child `{}` in field `{field_name}` of model `{name}` (expected `rule`)",
                                rule_node.name().value()
                            )));
                        }
                        model
                            .field_rules
                            .push((field_name.clone(), parse_rule(rule_node)?));
                    }
                }
                other => {
                    return Err(PolicyError::InvalidPolicy(format!(
                        "unexpected child `{other}` in model `{name}` (expected `fields`, `relations`, `rule`, or `field`)"
                    )));
                }
            }
        }
    }

    Ok(model)
}

/// Parse a `fields` block: each child node is `name "type" [pk=true] [nullable=true]`.
fn parse_fields(node: &KdlNode, model: &str) -> Result<Vec<FieldDef>, PolicyError> {
    let Some(children) = node.children() else {
        return Ok(Vec::new());
    };

    let mut fields = Vec::new();
    for child in children.nodes() {
        let field_name = child.name().value().to_string();
        let ty_str = first_string_arg(child).ok_or_else(|| {
            PolicyError::InvalidPolicy(format!(
                "field `{field_name}` in model `{model}` requires a type argument (e.g. {field_name} \"int\")"
            ))
        })?;
        let ty = FieldType::parse(&ty_str).ok_or_else(|| {
            PolicyError::InvalidPolicy(format!(
                "field `{field_name}` in model `{model}` has unknown type `{ty_str}` (expected int, float, string, or bool)"
            ))
        })?;
        let primary_key = child
            .get("pk")
            .and_then(|v| v.value().as_bool())
            .unwrap_or(false);
        let nullable = child
            .get("nullable")
            .and_then(|v| v.value().as_bool())
            .unwrap_or(false);

        fields.push(FieldDef {
            name: field_name,
            ty,
            nullable,
            primary_key,
        });
    }
    Ok(fields)
}

/// Parse a `relations` block: each child node is
/// `name to="target" kind="one|many" fk="column"`.
fn parse_relations(node: &KdlNode, model: &str) -> Result<Vec<RelationDef>, PolicyError> {
    let Some(children) = node.children() else {
        return Ok(Vec::new());
    };

    let mut relations = Vec::new();
    for child in children.nodes() {
        let rel_name = child.name().value().to_string();

        let target = child
            .get("to")
            .and_then(|v| v.value().as_string())
            .map(str::to_string)
            .ok_or_else(|| {
                PolicyError::InvalidPolicy(format!(
                    "relation `{rel_name}` in model `{model}` missing `to` property (e.g. to=\"comment\")"
                ))
            })?;

        let kind_str = child
            .get("kind")
            .and_then(|v| v.value().as_string())
            .ok_or_else(|| {
                PolicyError::InvalidPolicy(format!(
                    "relation `{rel_name}` in model `{model}` missing `kind` property (expected kind=\"one\" or kind=\"many\")"
                ))
            })?;
        let kind = match kind_str {
            "one" => RelationKind::One,
            "many" => RelationKind::Many,
            other => {
                return Err(PolicyError::InvalidPolicy(format!(
                    "relation `{rel_name}` in model `{model}` has unknown kind `{other}`"
                )));
            }
        };

        let fk = child
            .get("fk")
            .and_then(|v| v.value().as_string())
            .map(str::to_string)
            .ok_or_else(|| {
                PolicyError::InvalidPolicy(format!(
                    "relation `{rel_name}` in model `{model}` missing `fk` property (e.g. fk=\"post_id\")"
                ))
            })?;

        relations.push(RelationDef {
            name: rel_name,
            target,
            kind,
            fk,
        });
    }
    Ok(relations)
}

fn parse_rule(node: &KdlNode) -> Result<ParsedRule, PolicyError> {
    let name = first_string_arg(node).ok_or_else(|| {
        PolicyError::InvalidPolicy(
            "rule node requires a string argument (e.g. rule \"owner-writes\" effect=\"allow\")"
                .into(),
        )
    })?;

    let effect = node
        .get("effect")
        .and_then(|v| v.value().as_string())
        .unwrap_or("allow")
        .to_string();

    let mut operations = Vec::new();
    let mut condition = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "operations" => {
                    operations = dash_list(child);
                }
                "condition" => {
                    condition = first_string_arg(child);
                }
                other => {
                    return Err(PolicyError::InvalidPolicy(format!(
                        "unexpected child `{other}` in rule `{name}`"
                    )));
                }
            }
        }
    }

    Ok(ParsedRule {
        name,
        effect,
        operations,
        condition,
    })
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
/// Example KDL:
/// ```kdl
/// operations {
///     - "read"
///     - "update"
/// }
/// ```
fn dash_list(node: &KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_fields() {
        let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
        title "string" nullable=true
        value "int"
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        assert_eq!(policy.models.len(), 1);
        let m = &policy.models[0];
        assert_eq!(m.name, "post");
        assert_eq!(m.fields.len(), 3);
        assert!(m.fields[0].primary_key);
        assert_eq!(m.fields[1].ty, FieldType::String);
        assert!(m.fields[1].nullable);
        assert!(!m.fields[2].nullable);
    }

    #[test]
    fn test_parse_relations() {
        let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
        author_id "int"
    }
    relations {
        author to="user" kind="one" fk="author_id"
        comments to="comment" kind="many" fk="post_id"
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        let m = &policy.models[0];
        assert_eq!(m.relations.len(), 2);
        assert_eq!(m.relations[0].kind, RelationKind::One);
        assert_eq!(m.relations[0].fk, "author_id");
        assert_eq!(m.relations[1].kind, RelationKind::Many);
        assert_eq!(m.relations[1].target, "comment");
    }

    #[test]
    fn test_parse_rule_with_condition() {
        let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
        value "int"
    }
    rule "positive-only" effect="deny" {
        operations {
            - "create"
            - "update"
        }
        condition "future.value <= 0"
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        let rule = &policy.models[0].rules[0];
        assert_eq!(rule.name, "positive-only");
        assert_eq!(rule.effect, "deny");
        assert_eq!(rule.operations, vec!["create", "update"]);
        assert_eq!(rule.condition.as_deref(), Some("future.value <= 0"));
    }

    #[test]
    fn test_rule_effect_defaults_to_allow() {
        let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
    }
    rule "open" {
        operations {
            - "read"
        }
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        let rule = &policy.models[0].rules[0];
        assert_eq!(rule.effect, "allow");
        assert!(rule.condition.is_none());
    }

    #[test]
    fn test_parse_field_rules() {
        let kdl = r#"
model "user" {
    fields {
        id "int" pk=true
        email "string"
    }
    field "email" {
        rule "own-email-only" effect="deny" {
            operations {
                - "read"
            }
            condition "auth.id != id"
        }
    }
}
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        let m = &policy.models[0];
        assert_eq!(m.field_rules.len(), 1);
        assert_eq!(m.field_rules[0].0, "email");
        assert_eq!(m.field_rules[0].1.effect, "deny");
    }

    #[test]
    fn test_parse_auth_model() {
        let kdl = r#"
model "user" {
    fields {
        id "int" pk=true
    }
}
auth-model "user"
"#;
        let policy = parse_kdl_document(kdl).unwrap();
        assert_eq!(policy.auth_model.as_deref(), Some("user"));
    }

    #[test]
    fn test_duplicate_auth_model_rejected() {
        let kdl = r#"
auth-model "user"
auth-model "account"
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPolicy(_)));
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        let kdl = r#"
model "post" {
    fields {
        id "uuid" pk=true
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPolicy(_)));
    }

    #[test]
    fn test_relation_missing_fk_rejected() {
        let kdl = r#"
model "post" {
    fields {
        id "int" pk=true
    }
    relations {
        comments to="comment" kind="many"
    }
}
"#;
        let err = parse_kdl_document(kdl).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPolicy(_)));
    }
}
