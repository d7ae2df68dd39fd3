use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::expr::Expr;
use crate::schema::ModelDef;

/// The four guarded operation kinds. Each is decided independently; no
/// state is shared across operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "read" => Some(Operation::Read),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Effect::Allow),
            "deny" => Some(Effect::Deny),
            _ => None,
        }
    }
}

/// A compiled policy rule. Immutable once loaded; ordering among rules of
/// the same effect is irrelevant, only the effect partition matters.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub effect: Effect,
    pub operations: BTreeSet<Operation>,
    pub predicate: Expr,
    /// Original condition text, kept for diagnostics and logging.
    pub source: String,
}

impl Rule {
    pub fn applies_to(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }
}

/// Compiled policy for one entity type: the model shape, its model-level
/// rules, and per-field rule sets.
#[derive(Debug, Clone)]
pub struct ModelPolicy {
    pub model: ModelDef,
    pub rules: Vec<Rule>,
    pub field_rules: HashMap<String, Vec<Rule>>,
}

impl ModelPolicy {
    /// Model-level rules whose operation set covers `op`.
    pub fn rules_for(&self, op: Operation) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.applies_to(op))
    }

    /// Field-level rules for `field` whose operation set covers `op`.
    pub fn field_rules_for(&self, field: &str, op: Operation) -> Vec<&Rule> {
        self.field_rules
            .get(field)
            .map(|rules| rules.iter().filter(|r| r.applies_to(op)).collect())
            .unwrap_or_default()
    }
}

/// Fully compiled policy state, loaded from KDL policy files.
/// Immutable after construction — configuration changes require a reload.
#[derive(Debug)]
pub struct PolicyState {
    /// model name -> compiled model policy
    pub models: HashMap<String, ModelPolicy>,
    /// The designated "user" entity type principals are instances of.
    pub auth_model: Option<String>,
}

impl PolicyState {
    pub fn model(&self, name: &str) -> Result<&ModelPolicy, crate::errors::PolicyError> {
        self.models
            .get(name)
            .ok_or_else(|| crate::errors::PolicyError::UnknownModel(name.to_string()))
    }
}

/// The authenticated caller's identity data: an instance of the designated
/// auth model, or anonymous. Supplied per-operation; never persisted.
#[derive(Debug, Clone)]
pub struct Principal(Value);

impl Principal {
    pub fn anonymous() -> Self {
        Principal(Value::Null)
    }

    pub fn from_value(value: Value) -> Self {
        Principal(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_null()
    }
}

// ---------- Parser output (pre-compilation) ----------

/// A single rule as parsed from a KDL document, before predicate
/// compilation and reference validation.
#[derive(Debug, Clone)]
pub struct ParsedRule {
    pub name: String,
    pub effect: String,
    pub operations: Vec<String>,
    pub condition: Option<String>,
}

/// A model block as parsed from a KDL document.
#[derive(Debug, Clone, Default)]
pub struct ParsedModel {
    pub name: String,
    pub fields: Vec<crate::schema::FieldDef>,
    pub relations: Vec<crate::schema::RelationDef>,
    pub rules: Vec<ParsedRule>,
    /// (field name, rule) pairs from `field` blocks.
    pub field_rules: Vec<(String, ParsedRule)>,
}

/// Intermediate result from parsing a single KDL file.
#[derive(Debug, Clone, Default)]
pub struct ParsedPolicy {
    pub models: Vec<ParsedModel>,
    pub auth_model: Option<String>,
}
