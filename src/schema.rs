//! Entity type definitions: the record shapes the policy engine guards.
//!
//! A `ModelDef` is declared once in a policy document and is immutable at
//! runtime. Every model has exactly one integer primary key; relations are
//! either `many` (foreign key on the target model pointing back at this
//! model's key) or `one` (foreign key on this model pointing at the target's
//! key).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    String,
    Bool,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(FieldType::Int),
            "float" => Some(FieldType::Float),
            "string" => Some(FieldType::String),
            "bool" => Some(FieldType::Bool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    /// Nullable fields hold the null sentinel when absent.
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    /// One-to-many: `fk` is a column on the target model referencing this
    /// model's primary key.
    Many,
    /// Reference: `fk` is a column on this model referencing the target
    /// model's primary key.
    One,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    pub fk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
}

impl ModelDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// The primary key field. Loader validation guarantees exactly one.
    pub fn primary_key(&self) -> &FieldDef {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .expect("model validated to have a primary key")
    }
}
