//! Molecule Instantiation
//!
//! `pour` binds variables into a cooked template and records a persistent
//! molecule; `wisp` does the same for an ephemeral instance. Both create one
//! `pending` step per template step, in template order.
//!
//! Placeholders use the `{{name}}` syntax in step titles and descriptions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::{debug, info};

use super::model::{Molecule, MoleculeStatus, Step, StepStatus, Tier};
use crate::error::{BindingError, Result};
use crate::formula::Protomolecule;
use crate::ledger::LedgerClient;

/// Resolves variable values: template defaults overlaid by `supplied`.
pub fn resolve_vars(
    proto: &Protomolecule,
    supplied: &BTreeMap<String, String>,
) -> std::result::Result<BTreeMap<String, String>, BindingError> {
    let mut resolved: BTreeMap<String, String> = proto
        .vars()
        .iter()
        .filter_map(|(name, def)| def.default.clone().map(|v| (name.clone(), v)))
        .collect();
    resolved.extend(supplied.iter().map(|(k, v)| (k.clone(), v.clone())));

    for (name, def) in proto.vars() {
        if def.required && !resolved.contains_key(name) {
            return Err(BindingError::MissingRequired(name.clone()));
        }
    }
    Ok(resolved)
}

/// Substitutes every `{{name}}` in `text`.
///
/// Fails on the first placeholder that has no value.
pub fn substitute(
    text: &str,
    vars: &BTreeMap<String, String>,
    step_id: &str,
) -> std::result::Result<String, BindingError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };

        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| BindingError::Unbound {
            step: step_id.to_string(),
            placeholder: name.to_string(),
        })?;

        out.push_str(&rest[..start]);
        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Builds an instance from a template without touching the ledger.
pub fn instantiate(
    proto: &Protomolecule,
    supplied: &BTreeMap<String, String>,
    id: impl Into<String>,
    tier: Tier,
    now: DateTime<Utc>,
) -> std::result::Result<Molecule, BindingError> {
    let vars = resolve_vars(proto, supplied)?;

    let steps = proto
        .steps()
        .iter()
        .map(|p| {
            Ok(Step {
                id: p.id.clone(),
                title: substitute(&p.title, &vars, &p.id)?,
                description: substitute(&p.description, &vars, &p.id)?,
                needs: p.needs.clone(),
                status: StepStatus::Pending,
                started_at: None,
                finished_at: None,
            })
        })
        .collect::<std::result::Result<Vec<_>, BindingError>>()?;

    Ok(Molecule {
        id: id.into(),
        formula: proto.key().clone(),
        tier,
        status: MoleculeStatus::Active,
        vars,
        steps,
        exit: proto.exit().to_string(),
        created_at: now,
        archived_at: None,
    })
}

/// Pours a persistent, audited molecule into the ledger.
pub fn pour(
    client: &LedgerClient,
    proto: &Protomolecule,
    vars: &BTreeMap<String, String>,
) -> Result<Molecule> {
    create(client, proto, vars, Tier::Persistent)
}

/// Creates an ephemeral wisp with the same step semantics as a molecule.
pub fn wisp(
    client: &LedgerClient,
    proto: &Protomolecule,
    vars: &BTreeMap<String, String>,
) -> Result<Molecule> {
    create(client, proto, vars, Tier::Ephemeral)
}

fn create(
    client: &LedgerClient,
    proto: &Protomolecule,
    vars: &BTreeMap<String, String>,
    tier: Tier,
) -> Result<Molecule> {
    let now = Utc::now();
    // Bind before touching the ledger so a binding error leaves no trace
    let template = instantiate(proto, vars, String::new(), tier, now)?;
    debug!("Bound {} variables for {}", template.vars.len(), proto.key());

    let prefix = match tier {
        Tier::Persistent => "mol",
        Tier::Ephemeral => "wisp",
    };

    let molecule = client.transact(|state| {
        let mut molecule = template.clone();
        molecule.id = state.next_id(prefix);
        state.molecules.insert(molecule.id.clone(), molecule.clone());
        Ok(molecule)
    })?;

    info!(
        "Poured {} {} from {} ({} steps)",
        if molecule.is_wisp() { "wisp" } else { "molecule" },
        molecule.id,
        proto.key(),
        molecule.steps.len()
    );
    Ok(molecule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{cook, Formula, FormulaLibrary, FormulaStep, VarDef};
    use crate::ledger::MemoryLedger;
    use std::sync::Arc;

    fn proto() -> Protomolecule {
        let formula = Formula::new("work")
            .with_var("issue", VarDef { required: true, ..Default::default() })
            .with_var("branch", VarDef { default: Some("main".into()), ..Default::default() })
            .with_step(FormulaStep::new("load", "Load {{issue}}"))
            .with_step(
                FormulaStep::new("push", "Push {{ branch }}")
                    .needs("load")
                    .with_description("Fixes {{issue}}"),
            );
        cook(&formula, &FormulaLibrary::new()).unwrap()
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_instantiate_binds_placeholders() {
        let mol = instantiate(&proto(), &vars(&[("issue", "gt-123")]), "m", Tier::Persistent, Utc::now())
            .unwrap();

        assert_eq!(mol.steps[0].title, "Load gt-123");
        assert_eq!(mol.steps[1].title, "Push main");
        assert_eq!(mol.steps[1].description, "Fixes gt-123");
        assert!(mol.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(mol.exit, "push");
    }

    #[test]
    fn test_missing_required_var() {
        let err = instantiate(&proto(), &BTreeMap::new(), "m", Tier::Persistent, Utc::now()).unwrap_err();
        assert_eq!(err, BindingError::MissingRequired("issue".into()));
    }

    #[test]
    fn test_undeclared_placeholder_is_unbound() {
        let err = substitute("Ping {{owner}}", &BTreeMap::new(), "s").unwrap_err();
        assert_eq!(
            err,
            BindingError::Unbound { step: "s".into(), placeholder: "owner".into() }
        );
    }

    #[test]
    fn test_substitute_leaves_unterminated_braces() {
        let out = substitute("literal {{ not closed", &BTreeMap::new(), "s").unwrap();
        assert_eq!(out, "literal {{ not closed");
    }

    #[test]
    fn test_pour_and_wisp_allocate_distinct_ids() {
        let ledger = Arc::new(MemoryLedger::new());
        let client = LedgerClient::new(ledger, 4);
        let proto = proto();
        let bound = vars(&[("issue", "gt-1")]);

        let mol = pour(&client, &proto, &bound).unwrap();
        let ephemeral = wisp(&client, &proto, &bound).unwrap();

        assert_eq!(mol.id, "mol-1");
        assert_eq!(mol.tier, Tier::Persistent);
        assert_eq!(ephemeral.id, "wisp-2");
        assert!(ephemeral.is_wisp());
        assert_eq!(mol.steps.len(), ephemeral.steps.len());

        let state = client.read().unwrap();
        assert_eq!(state.molecules.len(), 2);
    }

    #[test]
    fn test_binding_failure_leaves_ledger_untouched() {
        let ledger = Arc::new(MemoryLedger::new());
        let client = LedgerClient::new(ledger.clone(), 4);

        assert!(pour(&client, &proto(), &BTreeMap::new()).is_err());
        assert_eq!(ledger.push_count(), 0);
    }

    #[test]
    fn test_pours_share_no_state() {
        let proto = proto();
        let mut first = instantiate(&proto, &vars(&[("issue", "a")]), "m1", Tier::Persistent, Utc::now()).unwrap();
        let second = instantiate(&proto, &vars(&[("issue", "b")]), "m2", Tier::Persistent, Utc::now()).unwrap();

        first.steps[0].status = StepStatus::InProgress;
        assert_eq!(second.steps[0].status, StepStatus::Pending);
        assert_eq!(proto.steps()[0].title, "Load {{issue}}");
    }
}
