use miette::Diagnostic;
use thiserror::Error;

use crate::policy::types::Operation;

#[derive(Debug, Error, Diagnostic)]
pub enum PolicyError {
    #[error("Failed to load policy file `{path}`")]
    #[diagnostic(
        code(palisade::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy: {0}")]
    #[diagnostic(
        code(palisade::invalid_policy),
        help("Each policy file must contain valid `model` or `auth-model` KDL nodes")
    )]
    InvalidPolicy(String),

    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(palisade::invalid_condition),
        help("Supported operators: ==, !=, >, <, >=, <=, &&, ||, !, in, some(rel, ..), all(rel, ..). Paths use dot notation; `auth` and `future` are reserved roots")
    )]
    InvalidCondition(String),

    #[error("Unknown model `{0}`")]
    #[diagnostic(
        code(palisade::unknown_model),
        help("Define the model with: model \"<name>\" {{ fields {{ ... }} }}")
    )]
    UnknownModel(String),

    #[error("Unknown field `{field}` on model `{model}`")]
    #[diagnostic(
        code(palisade::unknown_field),
        help("Predicates may only reference fields and relations declared on the model")
    )]
    UnknownField { model: String, field: String },

    #[error("Value for field `{field}` on model `{model}` does not match its declared type")]
    #[diagnostic(
        code(palisade::invalid_value),
        help("Row data must match the field types declared in the model's policy document")
    )]
    InvalidValue { model: String, field: String },

    #[error("Relation traversal exceeded the configured depth limit ({limit}) on model `{model}`")]
    #[diagnostic(
        code(palisade::relation_depth),
        help("Raise `engine.max_relation_depth` or flatten the rule's relation nesting")
    )]
    RelationDepthExceeded { model: String, limit: usize },

    #[error("Operation `{operation}` on model `{model}` rejected by policy")]
    #[diagnostic(code(palisade::policy_violation))]
    PolicyViolation { model: String, operation: Operation },

    #[error("Operation `{operation}` on model `{model}` committed, but the result is not readable under the current principal")]
    #[diagnostic(
        code(palisade::read_back_violation),
        help("The data change is persisted; only the returned row was suppressed by read rules")
    )]
    ReadBackViolation { model: String, operation: Operation },

    #[error("No matching row in `{model}`")]
    #[diagnostic(code(palisade::not_found))]
    NotFound { model: String },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(palisade::kdl_parse),
        help("Check your KDL file syntax — see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error("Config error: {0}")]
    #[diagnostic(code(palisade::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(palisade::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(palisade::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("I/O error: {0}")]
    #[diagnostic(code(palisade::io))]
    Io(#[from] std::io::Error),
}
