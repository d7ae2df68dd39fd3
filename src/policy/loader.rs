use std::collections::HashMap;
use std::path::Path;

use crate::errors::PolicyError;
use crate::policy::expr::{self, BinOp, Expr, AUTH_ROOT, FUTURE_ROOT};
use crate::policy::parse::parse_kdl_document;
use crate::policy::types::{
    Effect, ModelPolicy, Operation, ParsedModel, ParsedPolicy, ParsedRule, PolicyState, Rule,
};
use crate::schema::{FieldType, ModelDef, RelationKind};

/// Load all `.kdl` policy files from the given directory and compile them
/// into a single immutable `PolicyState`.
pub fn load_policies(dir: &Path) -> Result<PolicyState, PolicyError> {
    if !dir.is_dir() {
        return Err(PolicyError::InvalidPolicy(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut all_parsed = Vec::new();
    let mut file_count = 0;

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| PolicyError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        let parsed = parse_kdl_document(&contents)?;
        all_parsed.push(parsed);
        file_count += 1;
    }

    let state = compile_policies(all_parsed)?;

    tracing::info!(
        files = file_count,
        models = state.models.len(),
        rules = state
            .models
            .values()
            .map(|m| m.rules.len() + m.field_rules.values().map(Vec::len).sum::<usize>())
            .sum::<usize>(),
        "Loaded access policies"
    );

    Ok(state)
}

/// Merge and compile all parsed policies into a single `PolicyState`.
///
/// All structural validation happens here, at load time: duplicate models,
/// primary-key shape, relation targets, rule effects and operation sets,
/// and every identifier referenced by a predicate. Evaluation never sees
/// a malformed rule.
pub fn compile_policies(parsed: Vec<ParsedPolicy>) -> Result<PolicyState, PolicyError> {
    let mut parsed_models: Vec<ParsedModel> = Vec::new();
    let mut auth_model: Option<String> = None;

    for p in parsed {
        for model in p.models {
            if parsed_models.iter().any(|m| m.name == model.name) {
                return Err(PolicyError::InvalidPolicy(format!(
                    "model `{}` defined more than once",
                    model.name
                )));
            }
            parsed_models.push(model);
        }
        if let Some(am) = p.auth_model {
            match &auth_model {
                Some(prev) if *prev != am => {
                    return Err(PolicyError::InvalidPolicy(format!(
                        "conflicting auth-model declarations: `{prev}` and `{am}`"
                    )));
                }
                _ => auth_model = Some(am),
            }
        }
    }

    // First pass: bare model shapes, so relation targets and predicate
    // references can be validated against the full set.
    let mut defs: HashMap<String, ModelDef> = HashMap::new();
    for pm in &parsed_models {
        defs.insert(
            pm.name.clone(),
            ModelDef {
                name: pm.name.clone(),
                fields: pm.fields.clone(),
                relations: pm.relations.clone(),
            },
        );
    }

    for def in defs.values() {
        validate_model_shape(def, &defs)?;
    }

    if let Some(am) = &auth_model {
        if !defs.contains_key(am) {
            return Err(PolicyError::UnknownModel(am.clone()));
        }
    }

    // Second pass: compile rules with reference validation.
    let mut models = HashMap::new();
    for pm in parsed_models {
        let def = defs[&pm.name].clone();

        let mut rules = Vec::new();
        for pr in pm.rules {
            rules.push(compile_rule(pr, &def, &defs, None)?);
        }

        let mut field_rules: HashMap<String, Vec<Rule>> = HashMap::new();
        for (field, pr) in pm.field_rules {
            if def.field(&field).is_none() {
                return Err(PolicyError::UnknownField {
                    model: def.name.clone(),
                    field,
                });
            }
            let rule = compile_rule(pr, &def, &defs, Some(&field))?;
            field_rules.entry(field).or_default().push(rule);
        }

        models.insert(
            pm.name.clone(),
            ModelPolicy {
                model: def,
                rules,
                field_rules,
            },
        );
    }

    Ok(PolicyState { models, auth_model })
}

fn validate_model_shape(
    def: &ModelDef,
    defs: &HashMap<String, ModelDef>,
) -> Result<(), PolicyError> {
    // `auth` and `future` are reserved path roots.
    for name in def
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .chain(def.relations.iter().map(|r| r.name.as_str()))
    {
        if name == AUTH_ROOT || name == FUTURE_ROOT {
            return Err(PolicyError::InvalidPolicy(format!(
                "`{name}` is a reserved name and cannot be a field or relation of model `{}`",
                def.name
            )));
        }
    }

    let pks: Vec<_> = def.fields.iter().filter(|f| f.primary_key).collect();
    match pks.as_slice() {
        [pk] => {
            if pk.ty != FieldType::Int || pk.nullable {
                return Err(PolicyError::InvalidPolicy(format!(
                    "primary key `{}` of model `{}` must be a non-nullable int",
                    pk.name, def.name
                )));
            }
        }
        [] => {
            return Err(PolicyError::InvalidPolicy(format!(
                "model `{}` has no primary key (mark one int field with pk=true)",
                def.name
            )));
        }
        _ => {
            return Err(PolicyError::InvalidPolicy(format!(
                "model `{}` has more than one primary key",
                def.name
            )));
        }
    }

    for rel in &def.relations {
        let target = defs
            .get(&rel.target)
            .ok_or_else(|| PolicyError::UnknownModel(rel.target.clone()))?;
        // The foreign key lives on the target for `many`, on this model
        // for `one`; either way it must be a declared int field.
        let (fk_owner, fk_model) = match rel.kind {
            RelationKind::Many => (target, &rel.target),
            RelationKind::One => (def, &def.name),
        };
        match fk_owner.field(&rel.fk) {
            Some(f) if f.ty == FieldType::Int => {}
            Some(_) => {
                return Err(PolicyError::InvalidPolicy(format!(
                    "foreign key `{}` of relation `{}` on model `{}` must be an int field",
                    rel.fk, rel.name, def.name
                )));
            }
            None => {
                return Err(PolicyError::UnknownField {
                    model: fk_model.clone(),
                    field: rel.fk.clone(),
                });
            }
        }
        if def.field(&rel.name).is_some() {
            return Err(PolicyError::InvalidPolicy(format!(
                "relation `{}` on model `{}` shadows a field of the same name",
                rel.name, def.name
            )));
        }
    }

    Ok(())
}

fn compile_rule(
    parsed: ParsedRule,
    model: &ModelDef,
    defs: &HashMap<String, ModelDef>,
    field: Option<&str>,
) -> Result<Rule, PolicyError> {
    let effect = Effect::parse(&parsed.effect).ok_or_else(|| {
        PolicyError::InvalidPolicy(format!(
            "rule `{}` has unknown effect `{}` (expected \"allow\" or \"deny\")",
            parsed.name, parsed.effect
        ))
    })?;

    if parsed.operations.is_empty() {
        return Err(PolicyError::InvalidPolicy(format!(
            "rule `{}` declares no operations",
            parsed.name
        )));
    }
    let mut operations = std::collections::BTreeSet::new();
    for op_str in &parsed.operations {
        let op = Operation::parse(op_str).ok_or_else(|| {
            PolicyError::InvalidPolicy(format!(
                "rule `{}` has unknown operation `{op_str}`",
                parsed.name
            ))
        })?;
        if field.is_some() && !matches!(op, Operation::Read | Operation::Update) {
            return Err(PolicyError::InvalidPolicy(format!(
                "field rule `{}` may only cover read or update, got `{op}`",
                parsed.name
            )));
        }
        operations.insert(op);
    }

    // An absent condition applies unconditionally.
    let source = parsed.condition.unwrap_or_else(|| "true".to_string());
    let predicate = expr::parse_condition(&source)?;

    // The post-state accessor only exists while deciding an update.
    let future_ok = operations.len() == 1 && operations.contains(&Operation::Update);
    if predicate.references_future() && !future_ok {
        return Err(PolicyError::InvalidCondition(format!(
            "rule `{}` references `future` but is not an update-only rule",
            parsed.name
        )));
    }

    validate_expr(&predicate, model, defs, &parsed.name, true)?;

    Ok(Rule {
        name: parsed.name,
        effect,
        operations,
        predicate,
        source,
    })
}

/// Validate every identifier a predicate references against the model
/// graph, the way role cycles and conditions are pre-validated by the
/// loader rather than discovered mid-evaluation.
fn validate_expr(
    expr: &Expr,
    model: &ModelDef,
    defs: &HashMap<String, ModelDef>,
    rule_name: &str,
    future_allowed: bool,
) -> Result<(), PolicyError> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::Path(segments) => {
            match segments.first().map(String::as_str) {
                // The principal's shape is the authentication provider's
                // business; sub-paths are not validated.
                Some(AUTH_ROOT) => Ok(()),
                Some(FUTURE_ROOT) => {
                    if !future_allowed {
                        return Err(PolicyError::InvalidCondition(format!(
                            "rule `{rule_name}` references `future` inside a quantifier"
                        )));
                    }
                    match segments.len() {
                        1 => Ok(()),
                        2 => {
                            if model.field(&segments[1]).is_none() {
                                return Err(PolicyError::UnknownField {
                                    model: model.name.clone(),
                                    field: segments[1].clone(),
                                });
                            }
                            Ok(())
                        }
                        _ => Err(PolicyError::InvalidCondition(format!(
                            "rule `{rule_name}`: `future` paths may only reference a direct field"
                        ))),
                    }
                }
                _ => {
                    let head = &segments[0];
                    if segments.len() == 1 {
                        if model.field(head).is_none() {
                            return Err(PolicyError::UnknownField {
                                model: model.name.clone(),
                                field: head.clone(),
                            });
                        }
                        return Ok(());
                    }
                    // One relation hop: rel.field through a `one` relation.
                    // Deeper chains are expressed with quantifiers.
                    let rel = model.relation(head).ok_or_else(|| PolicyError::UnknownField {
                        model: model.name.clone(),
                        field: head.clone(),
                    })?;
                    if rel.kind != RelationKind::One {
                        return Err(PolicyError::InvalidCondition(format!(
                            "rule `{rule_name}`: relation `{head}` is one-to-many; use some(..) or all(..)"
                        )));
                    }
                    if segments.len() > 2 {
                        return Err(PolicyError::InvalidCondition(format!(
                            "rule `{rule_name}`: path through `{head}` may only reference a direct field; nest quantifiers for deeper traversal"
                        )));
                    }
                    let target = &defs[&rel.target];
                    if target.field(&segments[1]).is_none() {
                        return Err(PolicyError::UnknownField {
                            model: target.name.clone(),
                            field: segments[1].clone(),
                        });
                    }
                    Ok(())
                }
            }
        }
        Expr::UnaryNot(inner) => validate_expr(inner, model, defs, rule_name, future_allowed),
        Expr::BinOp { op, left, right } => {
            if matches!(
                op,
                BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le
            ) {
                validate_comparison_operands(left, right, model, rule_name)?;
            }
            validate_expr(left, model, defs, rule_name, future_allowed)?;
            validate_expr(right, model, defs, rule_name, future_allowed)
        }
        Expr::In {
            element,
            collection,
        } => {
            validate_comparison_operands(element, collection, model, rule_name)?;
            validate_expr(element, model, defs, rule_name, future_allowed)?;
            validate_expr(collection, model, defs, rule_name, future_allowed)
        }
        Expr::Quantifier {
            relation,
            predicate,
            ..
        } => {
            let rel = model
                .relation(relation)
                .ok_or_else(|| PolicyError::UnknownField {
                    model: model.name.clone(),
                    field: relation.clone(),
                })?;
            if rel.kind != RelationKind::Many {
                return Err(PolicyError::InvalidCondition(format!(
                    "rule `{rule_name}`: quantifiers traverse one-to-many relations; `{relation}` is a reference"
                )));
            }
            let target = &defs[&rel.target];
            validate_expr(predicate, target, defs, rule_name, false)
        }
    }
}

/// Comparison operands must be literals or paths (so every predicate the
/// evaluator accepts can also be lowered into SQL), and at most one side
/// may traverse a relation.
fn validate_comparison_operands(
    left: &Expr,
    right: &Expr,
    model: &ModelDef,
    rule_name: &str,
) -> Result<(), PolicyError> {
    let scalar = |e: &Expr| matches!(e, Expr::Literal(_) | Expr::Path(_));
    if !scalar(left) || !scalar(right) {
        return Err(PolicyError::InvalidCondition(format!(
            "rule `{rule_name}`: comparison operands must be fields, paths, or literals"
        )));
    }
    let is_rel_path = |e: &Expr| match e {
        Expr::Path(segments) => {
            segments.len() > 1 && model.relation(segments[0].as_str()).is_some()
        }
        _ => false,
    };
    if is_rel_path(left) && is_rel_path(right) {
        return Err(PolicyError::InvalidCondition(format!(
            "rule `{rule_name}`: at most one side of a comparison may traverse a relation"
        )));
    }
    Ok(())
}
